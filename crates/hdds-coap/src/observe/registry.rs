// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Two-level observer registry: context -> subscriber id -> entry.
//!
//! The registry is a plain owned map. Only the dispatcher loop holds it, so
//! it needs no locking; removing an entry drops it, which is how the
//! dispatcher closes a session's queues.

use std::collections::HashMap;

/// Observers indexed by context, then subscriber id.
#[derive(Debug)]
pub(crate) struct Registry<T> {
    contexts: HashMap<String, HashMap<String, T>>,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            contexts: HashMap::new(),
        }
    }

    /// Insert an entry, creating the context bucket if absent.
    ///
    /// Returns the entry it replaced, if any.
    pub fn insert(&mut self, context: &str, subscriber_id: &str, entry: T) -> Option<T> {
        self.contexts
            .entry(context.to_string())
            .or_default()
            .insert(subscriber_id.to_string(), entry)
    }

    /// Remove an entry. Empty context buckets are dropped with it.
    pub fn remove(&mut self, context: &str, subscriber_id: &str) -> Option<T> {
        self.remove_if(context, subscriber_id, |_| true)
    }

    /// Remove an entry only if `predicate` accepts it.
    pub fn remove_if<F>(&mut self, context: &str, subscriber_id: &str, predicate: F) -> Option<T>
    where
        F: FnOnce(&T) -> bool,
    {
        let bucket = self.contexts.get_mut(context)?;
        if !bucket.get(subscriber_id).is_some_and(predicate) {
            return None;
        }
        let removed = bucket.remove(subscriber_id);
        if bucket.is_empty() {
            self.contexts.remove(context);
        }
        removed
    }

    pub fn get(&self, context: &str, subscriber_id: &str) -> Option<&T> {
        self.contexts.get(context)?.get(subscriber_id)
    }

    /// Entries registered under `context`.
    pub fn subscribers(&self, context: &str) -> impl Iterator<Item = (&String, &T)> {
        self.contexts.get(context).into_iter().flatten()
    }

    /// Every entry across all contexts.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.contexts.values().flat_map(|bucket| bucket.values())
    }

    pub fn subscriber_count(&self, context: &str) -> usize {
        self.contexts.get(context).map_or(0, |bucket| bucket.len())
    }

    pub fn len(&self) -> usize {
        self.contexts.values().map(|bucket| bucket.len()).sum()
    }

    #[cfg(test)]
    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn clear(&mut self) {
        self.contexts.clear();
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_registry_new() {
        let reg: Registry<u32> = Registry::new();
        assert_eq!(reg.len(), 0);
        assert_eq!(reg.subscriber_count("sensors/temp"), 0);
    }

    #[test]
    fn test_insert_creates_bucket() {
        let mut reg = Registry::new();
        assert!(reg.insert("sensors/temp", "tok-1", 1).is_none());
        assert!(reg.insert("sensors/temp", "tok-2", 2).is_none());
        assert!(reg.insert("sensors/hum", "tok-1", 3).is_none());

        assert_eq!(reg.len(), 3);
        assert_eq!(reg.context_count(), 2);
        assert_eq!(reg.subscriber_count("sensors/temp"), 2);
        assert_eq!(reg.get("sensors/hum", "tok-1"), Some(&3));
    }

    #[test]
    fn test_insert_replaces() {
        let mut reg = Registry::new();
        reg.insert("sensors/temp", "tok-1", 1);
        assert_eq!(reg.insert("sensors/temp", "tok-1", 2), Some(1));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("sensors/temp", "tok-1"), Some(&2));
    }

    #[test]
    fn test_remove_drops_empty_bucket() {
        let mut reg = Registry::new();
        reg.insert("sensors/temp", "tok-1", 1);

        assert_eq!(reg.remove("sensors/temp", "tok-1"), Some(1));
        assert_eq!(reg.context_count(), 0);

        // Second removal is a no-op.
        assert_eq!(reg.remove("sensors/temp", "tok-1"), None);
        assert_eq!(reg.remove("unknown", "tok-1"), None);
    }

    #[test]
    fn test_remove_if() {
        let mut reg = Registry::new();
        reg.insert("sensors/temp", "tok-1", 7);

        assert_eq!(reg.remove_if("sensors/temp", "tok-1", |v| *v == 6), None);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.remove_if("sensors/temp", "tok-1", |v| *v == 7), Some(7));
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn test_subscribers_of_missing_context() {
        let mut reg = Registry::new();
        reg.insert("sensors/temp", "tok-1", 1);
        assert_eq!(reg.subscribers("sensors/hum").count(), 0);
        assert_eq!(reg.subscribers("sensors/temp").count(), 1);
        assert_eq!(reg.values().count(), 1);
    }

    #[tokio::test]
    async fn test_remove_closes_queue() {
        let mut reg = Registry::new();
        let (tx, mut rx) = mpsc::channel::<u16>(1);
        reg.insert("sensors/temp", "tok-1", tx);

        drop(reg.remove("sensors/temp", "tok-1"));
        assert!(rx.recv().await.is_none());
    }
}
