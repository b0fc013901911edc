// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Observe dispatcher: the single serialized event loop owning the registry.
//!
//! ```text
//! DispatcherHandle ──► Command queue ──► Dispatcher::run()
//!                                          ├─► Register    → spawn session, insert
//!                                          ├─► Unregister  → remove, close queues
//!                                          ├─► Expire      → remove if generation matches
//!                                          ├─► Ack         → fan out by address
//!                                          ├─► Unicast     → one session or NoSubscriber
//!                                          └─► Broadcast   → every session of a context
//! ```
//!
//! ## Rules
//! - The registry is touched only from `run()`; commands are handled one at
//!   a time, so removal and queue closing are atomic to every other command.
//! - A session's queues are closed only by dropping its registry entry.
//! - Ack forwarding waits for room in the session's ack queue (backpressure).

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::registry::Registry;
use super::session::{ObserverSession, ObserverSessionParams, RetransmitPolicy};
use super::transmission::{AckBatch, Completion, DeliveryOutcome, Subscription, Transmission};
use crate::config::ObserveConfig;
use crate::error::{CoapError, CoapResult};
use crate::message::Message;
use crate::transport::Transmit;

/// Ack queue depth: forwarding blocks only while a previous id is still
/// unread.
const ACK_QUEUE_CAPACITY: usize = 1;

/// Commands processed by the dispatcher loop.
#[derive(Debug)]
pub(crate) enum Command {
    Register(Subscription),
    Unregister {
        context: String,
        subscriber_id: String,
    },
    /// Sent by a delivery attempt that ran out of retries.
    Expire {
        context: String,
        subscriber_id: String,
        generation: u64,
    },
    Ack(AckBatch),
    Unicast(Transmission),
    Broadcast {
        context: String,
        message: Message,
    },
    SubscriberCount {
        context: String,
        reply: oneshot::Sender<usize>,
    },
    IsRegistered {
        context: String,
        subscriber_id: String,
        reply: oneshot::Sender<bool>,
    },
    Stats(oneshot::Sender<DispatcherStats>),
    Shutdown(oneshot::Sender<()>),
}

/// Dispatcher counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Sessions created.
    pub registered: u64,
    /// Sessions torn down because the same key registered again.
    pub replaced: u64,
    /// Sessions removed by an explicit unregister.
    pub unregistered: u64,
    /// Sessions removed after exhausting retransmissions.
    pub expired: u64,
    /// Unicasts forwarded to a session.
    pub unicasts: u64,
    /// Unicasts with no matching session.
    pub undeliverable: u64,
    /// Broadcast requests handled (including empty contexts).
    pub broadcasts: u64,
    /// Ack ids forwarded to sessions.
    pub acks_forwarded: u64,
    /// Sessions currently registered.
    pub active_sessions: usize,
}

/// Registry entry: the dispatcher's side of a session.
#[derive(Debug)]
struct ObserverHandle {
    generation: u64,
    address: SocketAddr,
    inbound: mpsc::Sender<Transmission>,
    acks: mpsc::Sender<u16>,
}

/// Observe dispatcher.
///
/// Created with [`Dispatcher::spawn`]; collaborators talk to it through the
/// returned [`DispatcherHandle`].
pub struct Dispatcher {
    registry: Registry<ObserverHandle>,
    commands: mpsc::Receiver<Command>,
    self_tx: mpsc::WeakSender<Command>,
    transport: Arc<dyn Transmit>,
    policy: RetransmitPolicy,
    inbound_capacity: usize,
    next_generation: u64,
    stats: DispatcherStats,
}

impl Dispatcher {
    /// Start the dispatcher loop on the current tokio runtime.
    ///
    /// The loop stops when every handle is dropped or on
    /// [`DispatcherHandle::shutdown`].
    pub fn spawn<T: Transmit>(config: ObserveConfig, transport: T) -> CoapResult<DispatcherHandle> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.command_capacity);
        let dispatcher = Self {
            registry: Registry::new(),
            commands: rx,
            self_tx: tx.downgrade(),
            transport: Arc::new(transport),
            policy: RetransmitPolicy::from(&config),
            inbound_capacity: config.inbound_capacity,
            next_generation: 1,
            stats: DispatcherStats::default(),
        };

        info!(
            "Observe dispatcher started (response timeout {:?}, max retransmit {})",
            dispatcher.policy.response_timeout, dispatcher.policy.max_retransmit
        );
        tokio::spawn(dispatcher.run());

        Ok(DispatcherHandle { tx })
    }

    async fn run(mut self) {
        let mut shutdown_reply = None;

        while let Some(cmd) = self.commands.recv().await {
            match cmd {
                Command::Register(subscription) => self.register(subscription),
                Command::Unregister {
                    context,
                    subscriber_id,
                } => {
                    if self.registry.remove(&context, &subscriber_id).is_some() {
                        self.stats.unregistered += 1;
                        debug!("[{}] observer {} removed", context, subscriber_id);
                    }
                }
                Command::Expire {
                    context,
                    subscriber_id,
                    generation,
                } => {
                    let removed = self.registry.remove_if(&context, &subscriber_id, |h| {
                        h.generation == generation
                    });
                    if let Some(handle) = removed {
                        self.stats.expired += 1;
                        info!(
                            "[{}] observer {} at {} lost: no acknowledgement",
                            context, subscriber_id, handle.address
                        );
                    }
                }
                Command::Ack(batch) => self.forward_acks(batch).await,
                Command::Unicast(transmission) => self.unicast(transmission).await,
                Command::Broadcast { context, message } => {
                    self.broadcast(&context, message).await
                }
                Command::SubscriberCount { context, reply } => {
                    let _ = reply.send(self.registry.subscriber_count(&context));
                }
                Command::IsRegistered {
                    context,
                    subscriber_id,
                    reply,
                } => {
                    let _ = reply.send(self.registry.get(&context, &subscriber_id).is_some());
                }
                Command::Stats(reply) => {
                    let mut stats = self.stats.clone();
                    stats.active_sessions = self.registry.len();
                    let _ = reply.send(stats);
                }
                Command::Shutdown(reply) => {
                    shutdown_reply = Some(reply);
                    break;
                }
            }
        }

        // Refuse further commands, then close every session's queues.
        self.commands.close();
        self.registry.clear();
        info!("Observe dispatcher stopped");

        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    fn register(&mut self, subscription: Subscription) {
        let generation = self.next_generation;
        self.next_generation += 1;

        let (inbound_tx, inbound_rx) = mpsc::channel(self.inbound_capacity);
        let (ack_tx, ack_rx) = mpsc::channel(ACK_QUEUE_CAPACITY);

        let session = ObserverSession::new(ObserverSessionParams {
            context: subscription.context.clone(),
            subscriber_id: subscription.subscriber_id.clone(),
            address: subscription.address,
            generation,
            // Randomized start makes off-path guessing of ids harder.
            initial_transaction_id: fastrand::u16(..),
            inbound: inbound_rx,
            acks: ack_rx,
            transport: Arc::clone(&self.transport),
            dispatcher: self.self_tx.clone(),
            policy: self.policy,
        });
        tokio::spawn(session.run());

        let handle = ObserverHandle {
            generation,
            address: subscription.address,
            inbound: inbound_tx,
            acks: ack_tx,
        };

        let previous = self
            .registry
            .insert(&subscription.context, &subscription.subscriber_id, handle);
        self.stats.registered += 1;

        if let Some(previous) = previous {
            // Dropping the old entry closes its queues.
            self.stats.replaced += 1;
            debug!(
                "[{}] observer {} re-registered, replacing session at {}",
                subscription.context, subscription.subscriber_id, previous.address
            );
        }

        debug!(
            "[{}] observer {} added at {}",
            subscription.context, subscription.subscriber_id, subscription.address
        );
    }

    async fn forward_acks(&mut self, batch: AckBatch) {
        for handle in self.registry.values() {
            let Some(tid) = batch.get(&handle.address) else {
                continue;
            };
            if handle.acks.send(tid).await.is_ok() {
                self.stats.acks_forwarded += 1;
            } else {
                warn!("Ack {} for {} dropped: session queue closed", tid, handle.address);
            }
        }
    }

    async fn unicast(&mut self, transmission: Transmission) {
        let Some(handle) = self
            .registry
            .get(&transmission.context, &transmission.subscriber_id)
        else {
            self.stats.undeliverable += 1;
            debug!(
                "[{}] unicast to unknown observer {}",
                transmission.context, transmission.subscriber_id
            );
            transmission.fail(DeliveryOutcome::NoSubscriber);
            return;
        };

        match handle.inbound.send(transmission).await {
            Ok(()) => self.stats.unicasts += 1,
            Err(mpsc::error::SendError(transmission)) => {
                self.stats.undeliverable += 1;
                warn!(
                    "[{}] observer {} queue closed",
                    transmission.context, transmission.subscriber_id
                );
                transmission.fail(DeliveryOutcome::NoSubscriber);
            }
        }
    }

    async fn broadcast(&mut self, context: &str, message: Message) {
        self.stats.broadcasts += 1;

        let mut delivered = 0usize;
        for (subscriber_id, handle) in self.registry.subscribers(context) {
            let copy = Transmission::new(context, subscriber_id.as_str(), message.clone(), None);
            if handle.inbound.send(copy).await.is_ok() {
                delivered += 1;
            }
        }
        debug!("[{}] broadcast to {} observer(s)", context, delivered);
    }
}

/// Cloneable handle to a running [`Dispatcher`].
#[derive(Clone, Debug)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<Command>,
}

impl DispatcherHandle {
    async fn send(&self, cmd: Command) -> CoapResult<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| CoapError::DispatcherClosed)
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> CoapResult<R> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| CoapError::DispatcherClosed)
    }

    /// Register an observer. Replaces any session under the same key.
    pub async fn register(&self, subscription: Subscription) -> CoapResult<()> {
        self.send(Command::Register(subscription)).await
    }

    /// Remove an observer. Unknown keys are ignored.
    pub async fn unregister(
        &self,
        context: impl Into<String>,
        subscriber_id: impl Into<String>,
    ) -> CoapResult<()> {
        self.send(Command::Unregister {
            context: context.into(),
            subscriber_id: subscriber_id.into(),
        })
        .await
    }

    /// Queue `message` for one observer.
    ///
    /// `completion` receives the outcome; a missing observer reports
    /// [`DeliveryOutcome::NoSubscriber`] immediately.
    pub async fn send_unicast(
        &self,
        context: impl Into<String>,
        subscriber_id: impl Into<String>,
        message: Message,
        completion: Option<Completion>,
    ) -> CoapResult<()> {
        let transmission = Transmission::new(context, subscriber_id, message, completion);
        self.send(Command::Unicast(transmission)).await
    }

    /// Unicast and wait for the delivery outcome.
    pub async fn notify(
        &self,
        context: impl Into<String>,
        subscriber_id: impl Into<String>,
        message: Message,
    ) -> CoapResult<DeliveryOutcome> {
        let (tx, rx) = oneshot::channel();
        self.send_unicast(context, subscriber_id, message, Some(tx))
            .await?;
        rx.await.map_err(|_| CoapError::DispatcherClosed)
    }

    /// Queue a copy of `message` for every observer of `context`.
    pub async fn send_broadcast(
        &self,
        context: impl Into<String>,
        message: Message,
    ) -> CoapResult<()> {
        self.send(Command::Broadcast {
            context: context.into(),
            message,
        })
        .await
    }

    /// Hand acknowledged transaction ids to the sessions they belong to.
    pub async fn deliver_ack_batch(&self, batch: AckBatch) -> CoapResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.send(Command::Ack(batch)).await
    }

    pub async fn subscriber_count(&self, context: impl Into<String>) -> CoapResult<usize> {
        let context = context.into();
        self.request(|reply| Command::SubscriberCount { context, reply })
            .await
    }

    pub async fn is_registered(
        &self,
        context: impl Into<String>,
        subscriber_id: impl Into<String>,
    ) -> CoapResult<bool> {
        let context = context.into();
        let subscriber_id = subscriber_id.into();
        self.request(|reply| Command::IsRegistered {
            context,
            subscriber_id,
            reply,
        })
        .await
    }

    pub async fn stats(&self) -> CoapResult<DispatcherStats> {
        self.request(Command::Stats).await
    }

    /// Stop the loop and close every session. Later calls on any handle
    /// fail with [`CoapError::DispatcherClosed`].
    pub async fn shutdown(&self) -> CoapResult<()> {
        self.request(Command::Shutdown).await
    }
}
