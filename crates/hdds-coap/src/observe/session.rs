// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-subscriber delivery.
//!
//! Each registered observer gets one long-lived consumer task that drains
//! its inbound queue, stamps transaction ids and spawns one delivery attempt
//! per message. Attempts retransmit on a fixed interval until the matching
//! ACK arrives or the retry budget runs out.
//!
//! ```text
//! NEW -> SENT(i=0) -> WAIT_ACK -+-> ACKED
//!                      ^        +-> TIMEOUT, i < max -> RETRANSMIT --+
//!                      |                                             |
//!                      +---------------------------------------------+
//!                               +-> TIMEOUT, i = max -> FAILED (expire session)
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use super::dispatcher::Command;
use super::transmission::{complete, Completion, DeliveryOutcome, Transmission};
use crate::config::ObserveConfig;
use crate::message::Message;
use crate::transport::Transmit;

/// Fixed-interval retransmission parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetransmitPolicy {
    pub response_timeout: Duration,
    pub max_retransmit: u32,
}

impl From<&ObserveConfig> for RetransmitPolicy {
    fn from(config: &ObserveConfig) -> Self {
        Self {
            response_timeout: config.response_timeout_duration(),
            max_retransmit: config.max_retransmit,
        }
    }
}

/// Next transaction id after `current`. Zero is reserved for "no pending
/// ack" in ack batches, so it is skipped on wraparound.
pub(crate) fn next_transaction_id(current: u16) -> u16 {
    match current.wrapping_add(1) {
        0 => 1,
        tid => tid,
    }
}

/// Identity shared by a session and the attempts it spawns.
#[derive(Debug, Clone)]
struct SessionKey {
    context: String,
    subscriber_id: String,
    address: SocketAddr,
    generation: u64,
}

/// State owned by one observer's consumer task.
pub(crate) struct ObserverSession {
    key: SessionKey,
    transaction_id: u16,
    inbound: mpsc::Receiver<Transmission>,
    acks: mpsc::Receiver<u16>,
    transport: Arc<dyn Transmit>,
    dispatcher: mpsc::WeakSender<Command>,
    policy: RetransmitPolicy,
}

/// Constructor arguments for [`ObserverSession`].
pub(crate) struct ObserverSessionParams {
    pub context: String,
    pub subscriber_id: String,
    pub address: SocketAddr,
    pub generation: u64,
    pub initial_transaction_id: u16,
    pub inbound: mpsc::Receiver<Transmission>,
    pub acks: mpsc::Receiver<u16>,
    pub transport: Arc<dyn Transmit>,
    pub dispatcher: mpsc::WeakSender<Command>,
    pub policy: RetransmitPolicy,
}

impl ObserverSession {
    pub fn new(params: ObserverSessionParams) -> Self {
        Self {
            key: SessionKey {
                context: params.context,
                subscriber_id: params.subscriber_id,
                address: params.address,
                generation: params.generation,
            },
            transaction_id: params.initial_transaction_id,
            inbound: params.inbound,
            acks: params.acks,
            transport: params.transport,
            dispatcher: params.dispatcher,
            policy: params.policy,
        }
    }

    /// Consume inbound transmissions until the dispatcher closes the queues.
    pub async fn run(mut self) {
        // Attempts waiting for their ACK, by transaction id.
        let mut waiting: HashMap<u16, oneshot::Sender<()>> = HashMap::new();
        let mut acks_open = true;

        loop {
            tokio::select! {
                biased;

                ack = self.acks.recv(), if acks_open => match ack {
                    Some(tid) => match waiting.remove(&tid) {
                        Some(waiter) => {
                            let _ = waiter.send(());
                        }
                        None => trace!(
                            "[{}] no delivery waiting for ack {} from {}",
                            self.key.context, tid, self.key.address
                        ),
                    },
                    None => acks_open = false,
                },

                record = self.inbound.recv() => match record {
                    Some(transmission) => {
                        waiting.retain(|_, waiter| !waiter.is_closed());
                        self.start_delivery(transmission, &mut waiting);
                    }
                    None => break,
                },
            }
        }

        debug!(
            "[{}] delivery task for {} ({}) stopped",
            self.key.context, self.key.subscriber_id, self.key.address
        );
    }

    fn start_delivery(
        &mut self,
        transmission: Transmission,
        waiting: &mut HashMap<u16, oneshot::Sender<()>>,
    ) {
        self.transaction_id = next_transaction_id(self.transaction_id);
        let tid = self.transaction_id;

        let mut message = transmission.message;
        message.message_id = tid;

        if !message.is_confirmable() {
            trace!(
                "[{}] non-confirmable message {} to {}",
                self.key.context,
                tid,
                self.key.address
            );
            if let Err(e) = self.transport.transmit(self.key.address, &message) {
                warn!("[{}] transmit to {} failed: {}", self.key.context, self.key.address, e);
            }
            complete(transmission.completion, DeliveryOutcome::Sent);
            return;
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        waiting.insert(tid, ack_tx);

        let attempt = DeliveryAttempt {
            key: self.key.clone(),
            message,
            completion: transmission.completion,
            transport: Arc::clone(&self.transport),
            dispatcher: self.dispatcher.clone(),
            policy: self.policy,
        };
        tokio::spawn(attempt.run(ack_rx));
    }
}

/// One confirmable message in flight.
struct DeliveryAttempt {
    key: SessionKey,
    message: Message,
    completion: Option<Completion>,
    transport: Arc<dyn Transmit>,
    dispatcher: mpsc::WeakSender<Command>,
    policy: RetransmitPolicy,
}

impl DeliveryAttempt {
    async fn run(self, mut ack: oneshot::Receiver<()>) {
        let timeout = self.policy.response_timeout;
        let mut ticker = time::interval_at(Instant::now() + timeout, timeout);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // The consumer task drops our sender when the session is torn down;
        // the attempt then runs out its timers without an ack source.
        let mut ack_open = true;

        debug!(
            "[{}] transmission of message {} to {}",
            self.key.context, self.message.message_id, self.key.address
        );
        self.transmit();

        for attempt in 0..=self.policy.max_retransmit {
            loop {
                tokio::select! {
                    res = &mut ack, if ack_open => match res {
                        Ok(()) => {
                            debug!(
                                "[{}] message {} acknowledged by {}",
                                self.key.context, self.message.message_id, self.key.address
                            );
                            complete(
                                self.completion,
                                DeliveryOutcome::Acknowledged { transmissions: attempt + 1 },
                            );
                            return;
                        }
                        Err(_) => ack_open = false,
                    },
                    _ = ticker.tick() => break,
                }
            }

            if attempt == self.policy.max_retransmit {
                break;
            }

            debug!(
                "[{}] retransmission #{} of message {} to {}",
                self.key.context,
                attempt + 1,
                self.message.message_id,
                self.key.address
            );
            self.transmit();
        }

        debug!(
            "[{}] transmission of message {} to {} timed out",
            self.key.context, self.message.message_id, self.key.address
        );
        self.expire_session().await;
        complete(
            self.completion,
            DeliveryOutcome::Exhausted {
                transmissions: self.policy.max_retransmit + 1,
            },
        );
    }

    fn transmit(&self) {
        if let Err(e) = self.transport.transmit(self.key.address, &self.message) {
            warn!(
                "[{}] transmit of message {} to {} failed: {}",
                self.key.context, self.message.message_id, self.key.address, e
            );
        }
    }

    /// Ask the dispatcher to drop this session. A no-op there if the session
    /// was already removed or replaced.
    async fn expire_session(&self) {
        let Some(dispatcher) = self.dispatcher.upgrade() else {
            return;
        };
        let cmd = Command::Expire {
            context: self.key.context.clone(),
            subscriber_id: self.key.subscriber_id.clone(),
            generation: self.key.generation,
        };
        let _ = dispatcher.send(cmd).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_transaction_id() {
        assert_eq!(next_transaction_id(41), 42);
        assert_eq!(next_transaction_id(u16::MAX), 1);
        assert_eq!(next_transaction_id(0), 1);
    }

    #[test]
    fn test_policy_from_config() {
        let config = ObserveConfig::default()
            .response_timeout(Duration::from_millis(10))
            .max_retransmit(4);
        let policy = RetransmitPolicy::from(&config);
        assert_eq!(policy.response_timeout, Duration::from_millis(10));
        assert_eq!(policy.max_retransmit, 4);
    }
}
