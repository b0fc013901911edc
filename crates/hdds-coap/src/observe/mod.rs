// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Observe subscriptions and confirmable notification delivery
//!
//! Remote observers register under a resource context and a subscriber id.
//! Notifications are routed to one observer (unicast) or to every observer
//! of a context (broadcast). Confirmable notifications are retransmitted on
//! a fixed interval until the observer acknowledges them; an observer that
//! never answers is dropped.
//!
//! ## Components
//!
//! | Component | Role |
//! |-----------|------|
//! | [`Dispatcher`] | Serialized event loop, sole owner of the registry |
//! | [`DispatcherHandle`] | Cloneable command interface for collaborators |
//! | `ObserverSession` | Per-observer consumer task, owns the transaction counter |
//! | `DeliveryAttempt` | One in-flight confirmable message and its retry timer |
//! | [`AckBatch`] | Acknowledged transaction ids keyed by remote address |
//!
//! ## Flow
//!
//! ```text
//! handler ── send_unicast / send_broadcast ──► Dispatcher ──► session inbound
//!                                                              │
//!                                              spawn attempt ◄─┘
//!                                                   │ transmit, retransmit every T
//! transport ── deliver_ack_batch ──► Dispatcher ──► session acks ──► matching attempt
//!                                       ▲                               │
//!                                       └──── Expire (retries spent) ◄──┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use hdds_coap::message::{code, Message};
//! use hdds_coap::observe::{Dispatcher, Subscription};
//! use hdds_coap::{ObserveConfig, UdpTransport};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = UdpTransport::bind("0.0.0.0:5683".parse()?).await?;
//! let dispatcher = Dispatcher::spawn(ObserveConfig::default(), transport)?;
//!
//! dispatcher
//!     .register(Subscription::new("sensors/temp", "tok-1", "192.0.2.7:5683".parse()?))
//!     .await?;
//!
//! let notification = Message::confirmable(code::CONTENT).with_payload(b"21.5".to_vec());
//! let outcome = dispatcher
//!     .notify("sensors/temp", "tok-1", notification)
//!     .await?;
//! println!("delivery: {:?}", outcome);
//! # Ok(())
//! # }
//! ```

mod dispatcher;
mod registry;
mod session;
mod transmission;

pub use dispatcher::{Dispatcher, DispatcherHandle, DispatcherStats};
pub use transmission::{AckBatch, Completion, DeliveryOutcome, Subscription, Transmission};
