// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! CoAP observe dispatch with confirmable notification delivery.
//!
//! Keeps a registry of remote observers (resource context, subscriber id,
//! address) and delivers notifications to them. Confirmable notifications
//! are retransmitted at a fixed interval until the observer acknowledges
//! them; an observer that stays silent for the whole retry budget is
//! dropped from the registry.
//!
//! # Architecture
//!
//! ```text
//!  Observer (UDP)               Endpoint                     Dispatcher
//!       |                          |                             |
//!       |-- GET Observe:0 -------->|--- register --------------->|-- spawn session
//!       |<- 2.05 Content ----------|                             |
//!       |                          |        notify / broadcast ->|-- session -> attempt
//!       |<- CON notification ------|<------------- transmit -----------------|
//!       |-- ACK ------------------>|--- ack batch -------------->|-- session -> attempt
//! ```
//!
//! # Modules
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`message`] | RFC 7252 message model and codec |
//! | [`transport`] | [`Transmit`] seam and [`UdpTransport`] |
//! | [`observe`] | [`Dispatcher`], sessions, retransmission |
//! | [`endpoint`] | UDP receive loop feeding the dispatcher |
//! | [`client`] | Request/response client |
//! | [`config`] | [`ObserveConfig`] (programmatic or TOML) |

pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod observe;
pub mod transport;

// Re-exports for convenience.
pub use client::Client;
pub use config::{ConfigError, ObserveConfig};
pub use endpoint::{Endpoint, RequestHandler};
pub use error::{CoapError, CoapResult};
pub use message::{CoapOption, Message, MessageType};
pub use observe::{
    AckBatch, Completion, DeliveryOutcome, Dispatcher, DispatcherHandle, DispatcherStats,
    Subscription, Transmission,
};
pub use transport::{Transmit, UdpTransport};
