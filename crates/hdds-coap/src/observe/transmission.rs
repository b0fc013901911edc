// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Units of work exchanged with the dispatcher.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::oneshot;

use crate::message::Message;

/// A subscriber asking to observe `context`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Resource path or topic the subscriber observes.
    pub context: String,
    /// Identity of the subscriber within the context (usually the token).
    pub subscriber_id: String,
    /// Where notifications are sent.
    pub address: SocketAddr,
}

impl Subscription {
    pub fn new(
        context: impl Into<String>,
        subscriber_id: impl Into<String>,
        address: SocketAddr,
    ) -> Self {
        Self {
            context: context.into(),
            subscriber_id: subscriber_id.into(),
            address,
        }
    }
}

/// Final result of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// A matching ACK arrived after `transmissions` sends.
    Acknowledged { transmissions: u32 },
    /// Non-confirmable message, sent once without waiting.
    Sent,
    /// Retry budget spent without an ACK; the subscriber was removed.
    Exhausted { transmissions: u32 },
    /// No subscriber registered under the requested key.
    NoSubscriber,
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Acknowledged { .. } | Self::Sent)
    }
}

/// Completion signal for callers waiting on a delivery.
pub type Completion = oneshot::Sender<DeliveryOutcome>;

/// Request to deliver `message` to one subscriber.
#[derive(Debug)]
pub struct Transmission {
    pub context: String,
    pub subscriber_id: String,
    pub message: Message,
    pub completion: Option<Completion>,
}

impl Transmission {
    pub fn new(
        context: impl Into<String>,
        subscriber_id: impl Into<String>,
        message: Message,
        completion: Option<Completion>,
    ) -> Self {
        Self {
            context: context.into(),
            subscriber_id: subscriber_id.into(),
            message,
            completion,
        }
    }

    /// Report `outcome` without delivering.
    pub(crate) fn fail(self, outcome: DeliveryOutcome) {
        complete(self.completion, outcome);
    }
}

/// Signal `outcome` if anyone is listening.
pub(crate) fn complete(completion: Option<Completion>, outcome: DeliveryOutcome) {
    if let Some(tx) = completion {
        // Receiver gone means the caller stopped caring.
        let _ = tx.send(outcome);
    }
}

/// Acknowledged transaction ids keyed by the remote address they came from.
///
/// A transaction id of 0 means "nothing pending" and is never dispatched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckBatch {
    acks: HashMap<SocketAddr, u16>,
}

impl AckBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Batch holding a single acknowledgement.
    pub fn single(addr: SocketAddr, transaction_id: u16) -> Self {
        let mut batch = Self::new();
        batch.insert(addr, transaction_id);
        batch
    }

    pub fn insert(&mut self, addr: SocketAddr, transaction_id: u16) {
        self.acks.insert(addr, transaction_id);
    }

    /// Pending transaction id for `addr`; zero entries read as absent.
    pub fn get(&self, addr: &SocketAddr) -> Option<u16> {
        self.acks.get(addr).copied().filter(|tid| *tid != 0)
    }

    pub fn len(&self) -> usize {
        self.acks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acks.is_empty()
    }
}

impl FromIterator<(SocketAddr, u16)> for AckBatch {
    fn from_iter<I: IntoIterator<Item = (SocketAddr, u16)>>(iter: I) -> Self {
        Self {
            acks: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::code;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[test]
    fn test_ack_batch_zero_is_absent() {
        let batch: AckBatch = [(addr(1), 0), (addr(2), 7)].into_iter().collect();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.get(&addr(1)), None);
        assert_eq!(batch.get(&addr(2)), Some(7));
        assert_eq!(batch.get(&addr(3)), None);
    }

    #[test]
    fn test_outcome_success() {
        assert!(DeliveryOutcome::Acknowledged { transmissions: 1 }.is_success());
        assert!(DeliveryOutcome::Sent.is_success());
        assert!(!DeliveryOutcome::Exhausted { transmissions: 1 }.is_success());
        assert!(!DeliveryOutcome::NoSubscriber.is_success());
    }

    #[tokio::test]
    async fn test_fail_signals_completion() {
        let (tx, rx) = oneshot::channel();
        let msg = Message::confirmable(code::CONTENT);
        let t = Transmission::new("sensors/temp", "tok-1", msg, Some(tx));
        t.fail(DeliveryOutcome::NoSubscriber);
        assert_eq!(rx.await.unwrap(), DeliveryOutcome::NoSubscriber);
    }

    #[test]
    fn test_fail_without_completion() {
        let msg = Message::confirmable(code::CONTENT);
        let t = Transmission::new("sensors/temp", "tok-1", msg, None);
        t.fail(DeliveryOutcome::NoSubscriber);
    }
}
