// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP server endpoint.
//!
//! Owns the socket and the observe dispatcher, and drives the receive loop:
//!
//! - ACK datagrams are handed to the dispatcher as one-entry ack batches.
//! - Every request is passed to the [`RequestHandler`]; its reply, or an
//!   empty ACK for confirmable requests, is sent back.
//! - GET requests carrying an Observe option register (0) or deregister (1)
//!   the sender under the request's Uri-Path, keyed by sender address and
//!   token. Registration needs a 2.xx reply from the handler.

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

use crate::config::ObserveConfig;
use crate::error::CoapResult;
use crate::message::{code, Message, MessageType};
use crate::observe::{AckBatch, Dispatcher, DispatcherHandle, Subscription};
use crate::transport::{Transmit, UdpTransport};

/// Observe option value asking to start observing.
const OBSERVE_REGISTER: u32 = 0;
/// Observe option value asking to stop observing.
const OBSERVE_DEREGISTER: u32 = 1;

/// Resource handler invoked for every inbound request.
pub trait RequestHandler: Send + Sync {
    /// Produce the reply to `request`, or `None` to send nothing beyond the
    /// empty ACK a confirmable request requires.
    fn handle(&self, from: SocketAddr, request: &Message) -> Option<Message>;
}

impl<F> RequestHandler for F
where
    F: Fn(SocketAddr, &Message) -> Option<Message> + Send + Sync,
{
    fn handle(&self, from: SocketAddr, request: &Message) -> Option<Message> {
        self(from, request)
    }
}

/// Subscriber id for an observe request: sender address and lowercase-hex
/// token, since tokens are only unique per client.
pub fn subscriber_id(from: SocketAddr, token: &[u8]) -> String {
    token.iter().fold(format!("{}/", from), |mut s, b| {
        let _ = write!(s, "{:02x}", b);
        s
    })
}

/// CoAP server endpoint with observe support.
pub struct Endpoint {
    transport: UdpTransport,
    dispatcher: DispatcherHandle,
    max_message_size: usize,
    shutdown: Arc<Notify>,
}

impl Endpoint {
    /// Bind `addr` and start an observe dispatcher sending through it.
    pub async fn bind(addr: SocketAddr, config: ObserveConfig) -> CoapResult<Self> {
        config.validate()?;

        let transport = UdpTransport::bind(addr).await?;
        let max_message_size = config.max_message_size;
        let dispatcher = Dispatcher::spawn(config, transport.clone())?;

        Ok(Self {
            transport,
            dispatcher,
            max_message_size,
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Dispatcher used for notifications.
    pub fn dispatcher(&self) -> &DispatcherHandle {
        &self.dispatcher
    }

    pub fn local_addr(&self) -> CoapResult<SocketAddr> {
        self.transport.local_addr()
    }

    /// Stop a running (or the next) [`Endpoint::run`].
    pub fn shutdown(&self) {
        // notify_one stores a permit if run() is not waiting yet.
        self.shutdown.notify_one();
    }

    /// Receive loop. Returns after [`Endpoint::shutdown`], once the
    /// dispatcher has closed every observer session.
    pub async fn run<H: RequestHandler>(&self, handler: H) -> CoapResult<()> {
        let mut buf = vec![0u8; self.max_message_size];
        info!("CoAP endpoint listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                result = self.transport.socket().recv_from(&mut buf) => match result {
                    Ok((n, from)) => self.handle_datagram(&buf[..n], from, &handler).await,
                    Err(e) => warn!("Receive error: {}", e),
                },
                _ = self.shutdown.notified() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        if self.dispatcher.shutdown().await.is_err() {
            debug!("Dispatcher already stopped");
        }
        Ok(())
    }

    async fn handle_datagram<H: RequestHandler>(
        &self,
        bytes: &[u8],
        from: SocketAddr,
        handler: &H,
    ) {
        let msg = match Message::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Dropping datagram from {}: {}", from, e);
                return;
            }
        };

        match msg.kind {
            MessageType::Acknowledgement => {
                trace!("ack {} from {}", msg.message_id, from);
                if msg.message_id != 0 {
                    let batch = AckBatch::single(from, msg.message_id);
                    if let Err(e) = self.dispatcher.deliver_ack_batch(batch).await {
                        warn!("Ack from {} dropped: {}", from, e);
                    }
                }
            }
            MessageType::Reset => {
                debug!("reset {} from {}", msg.message_id, from);
            }
            MessageType::Confirmable | MessageType::NonConfirmable => {
                self.handle_request(msg, from, handler).await;
            }
        }
    }

    async fn handle_request<H: RequestHandler>(
        &self,
        req: Message,
        from: SocketAddr,
        handler: &H,
    ) {
        let reply = handler.handle(from, &req);

        // Registered before the reply goes out, so a notification can never
        // overtake it.
        if req.code == code::GET {
            if let Some(observe) = req.observe() {
                let accepted = reply.as_ref().is_some_and(|r| code::is_success(r.code));
                self.update_observation(&req, observe, from, accepted).await;
            }
        }

        let reply = match reply {
            Some(reply) => reply,
            None if req.is_confirmable() => Message::ack_for(&req),
            None => return,
        };

        if let Err(e) = self.transport.transmit(from, &reply) {
            warn!("Reply to {} failed: {}", from, e);
        }
    }

    async fn update_observation(
        &self,
        req: &Message,
        observe: u32,
        from: SocketAddr,
        accepted: bool,
    ) {
        let context = req.uri_path();
        let id = subscriber_id(from, &req.token);

        let result = match observe {
            OBSERVE_REGISTER if !accepted => {
                debug!("[{}] observe request from {} refused by handler", context, from);
                Ok(())
            }
            OBSERVE_REGISTER => {
                debug!("[{}] observe request from {} ({})", context, from, id);
                self.dispatcher
                    .register(Subscription::new(context, id, from))
                    .await
            }
            OBSERVE_DEREGISTER => {
                debug!("[{}] observe cancel from {} ({})", context, from, id);
                self.dispatcher.unregister(context, id).await
            }
            other => {
                debug!("Ignoring observe value {} from {}", other, from);
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!("Observe update from {} failed: {}", from, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscriber_id_scoped_by_address() {
        let a: SocketAddr = "192.0.2.1:5683".parse().unwrap();
        let b: SocketAddr = "192.0.2.2:5683".parse().unwrap();

        assert_eq!(subscriber_id(a, b"tok"), "192.0.2.1:5683/746f6b");
        assert_eq!(subscriber_id(a, &[0x00, 0xff]), "192.0.2.1:5683/00ff");
        assert_eq!(subscriber_id(a, &[]), "192.0.2.1:5683/");
        assert_ne!(subscriber_id(a, &[]), subscriber_id(b, &[]));
    }

    #[tokio::test]
    async fn test_shutdown_before_run() {
        let endpoint = Endpoint::bind("127.0.0.1:0".parse().unwrap(), ObserveConfig::default())
            .await
            .unwrap();

        endpoint.shutdown();
        endpoint
            .run(|_: SocketAddr, _: &Message| -> Option<Message> { None })
            .await
            .unwrap();

        assert!(endpoint.dispatcher().stats().await.is_err());
    }
}
