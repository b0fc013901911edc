// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Minimal CoAP client over a connected UDP socket.
//!
//! ```rust,no_run
//! use hdds_coap::message::{code, Message};
//! use hdds_coap::{Client, ObserveConfig};
//!
//! # async fn example() -> hdds_coap::CoapResult<()> {
//! let mut client = Client::dial("127.0.0.1:5683", ObserveConfig::default()).await?;
//! let req = Message::confirmable(code::GET)
//!     .with_message_id(1)
//!     .with_uri_path("sensors/temp");
//! if let Some(resp) = client.send(&req).await? {
//!     println!("{:?}", resp.payload);
//! }
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, trace};

use crate::config::ObserveConfig;
use crate::error::{CoapError, CoapResult};
use crate::message::Message;
use crate::transport::{receive, receive_timeout};

/// Client connection to a single CoAP peer.
pub struct Client {
    socket: UdpSocket,
    peer: SocketAddr,
    response_timeout: Duration,
    buf: Vec<u8>,
}

impl Client {
    /// Resolve `addr` ("host:port") and connect a local UDP socket to it.
    pub async fn dial(addr: &str, config: ObserveConfig) -> CoapResult<Self> {
        config.validate()?;

        let peer = lookup_host(addr)
            .await
            .map_err(|e| CoapError::Resolve(format!("{}: {}", addr, e)))?
            .next()
            .ok_or_else(|| CoapError::Resolve(format!("{}: no address", addr)))?;

        let local: SocketAddr = if peer.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;
        debug!("CoAP client connected to {}", peer);

        Ok(Self {
            socket,
            peer,
            response_timeout: config.response_timeout_duration(),
            buf: vec![0u8; config.max_message_size],
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> CoapResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Send `req`. Confirmable requests wait one response timeout for the
    /// reply; anything else returns `None` right after sending.
    pub async fn send(&mut self, req: &Message) -> CoapResult<Option<Message>> {
        let bytes = req.encode()?;
        self.socket.send(&bytes).await?;
        trace!("sent message {} to {}", req.message_id, self.peer);

        if !req.is_confirmable() {
            return Ok(None);
        }

        let (resp, _) = receive_timeout(&self.socket, self.response_timeout, &mut self.buf).await?;
        Ok(Some(resp))
    }

    /// Wait for the next message from the peer.
    pub async fn receive(&mut self) -> CoapResult<Message> {
        let (msg, _) = receive(&self.socket, &mut self.buf).await?;
        Ok(msg)
    }

    /// Acknowledge a confirmable message received from the peer.
    pub async fn acknowledge(&self, msg: &Message) -> CoapResult<()> {
        let bytes = Message::ack_for(msg).encode()?;
        self.socket.send(&bytes).await?;
        Ok(())
    }
}
