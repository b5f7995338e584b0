//! Bookkeeping for live `eth_subscribe` streams.
//!
//! The node assigns fresh ids when a subscription is re-created on a new
//! connection, so entries are re-keyed in place and callers keep their
//! receivers across reconnects.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;

/// Id returned by `eth_subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub String);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

struct Entry {
    kind: String,
    params: Vec<Value>,
    sender: mpsc::UnboundedSender<Value>,
}

#[derive(Clone, Default)]
pub struct SubscriptionManager {
    entries: Arc<Mutex<HashMap<SubscriptionId, Entry>>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        id: SubscriptionId,
        kind: String,
        params: Vec<Value>,
    ) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.entries
            .lock()
            .unwrap()
            .insert(id, Entry { kind, params, sender: tx });
        rx
    }

    /// Forward a notification. Entries whose receiver is gone are dropped.
    pub fn dispatch(&self, id: &SubscriptionId, message: Value) {
        let mut entries = self.entries.lock().unwrap();
        let closed = match entries.get(id) {
            Some(entry) => entry.sender.send(message).is_err(),
            None => {
                tracing::trace!(subscription = %id, "notification for unknown subscription");
                false
            }
        };
        if closed {
            entries.remove(id);
        }
    }

    /// Move an entry to the id the node assigned after a resubscribe.
    pub fn rekey(&self, old: &SubscriptionId, new: SubscriptionId) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.remove(old) {
            entries.insert(new, entry);
        }
    }

    pub fn remove(&self, id: &SubscriptionId) {
        self.entries.lock().unwrap().remove(id);
    }

    /// `(id, kind, params)` for every live entry, for resubscribing.
    pub fn active(&self) -> Vec<(SubscriptionId, String, Vec<Value>)> {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, e| !e.sender.is_closed());
        entries
            .iter()
            .map(|(id, e)| (id.clone(), e.kind.clone(), e.params.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(s: &str) -> SubscriptionId {
        SubscriptionId(s.into())
    }

    #[test]
    fn register_and_dispatch() {
        let mgr = SubscriptionManager::new();
        let mut rx = mgr.register(id("0xa"), "newHeads".into(), vec![]);
        mgr.dispatch(&id("0xa"), json!({"number": "0x1"}));
        assert_eq!(rx.try_recv().unwrap()["number"], "0x1");
    }

    #[test]
    fn rekey_keeps_receiver() {
        let mgr = SubscriptionManager::new();
        let mut rx = mgr.register(id("0xold"), "logs".into(), vec![json!({"address": "0x1"})]);
        mgr.rekey(&id("0xold"), id("0xnew"));

        mgr.dispatch(&id("0xold"), json!(1));
        mgr.dispatch(&id("0xnew"), json!(2));
        assert_eq!(rx.try_recv().unwrap(), json!(2));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_receivers_are_pruned() {
        let mgr = SubscriptionManager::new();
        let rx = mgr.register(id("0xa"), "newHeads".into(), vec![]);
        let _keep = mgr.register(id("0xb"), "logs".into(), vec![]);
        drop(rx);

        let active = mgr.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].1, "logs");
    }
}
