//! Registry of admitted clients.
//!
//! Owned exclusively by the Hub task; nothing else touches it, so it needs no
//! locking. Entries are keyed by [`ClientId`] and guarded by the handle's
//! serial: removing requires the exact connection that was admitted.

use std::collections::HashMap;

use bytes::Bytes;

use crate::client::{ClientHandle, ClientId, EnqueueError};

/// Outcome of handing one frame to every registered outbox.
#[derive(Debug, Default)]
pub(crate) struct Fanout {
    /// Clients whose outbox accepted the frame.
    pub(crate) delivered: Vec<ClientId>,
    /// Clients whose outbox was full.
    pub(crate) full: Vec<ClientHandle>,
    /// Clients already retired; their loops will evict them shortly.
    pub(crate) closed: Vec<ClientHandle>,
}

/// All currently registered clients.
pub(crate) struct ClientRegistry {
    clients: HashMap<ClientId, ClientHandle>,
}

impl ClientRegistry {
    /// Create an empty registry.
    pub(crate) fn new() -> Self {
        Self {
            clients: HashMap::new(),
        }
    }

    /// Register a client.
    ///
    /// Returns `false` and leaves the registry untouched if the id is taken.
    pub(crate) fn register(&mut self, client: ClientHandle) -> bool {
        if self.clients.contains_key(client.id()) {
            return false;
        }
        self.clients.insert(client.id().clone(), client);
        true
    }

    /// Unregister `client` if it is the registered connection for its id.
    ///
    /// Returns the removed handle. A stale handle (same id, older serial) or
    /// an unknown id leaves the registry untouched.
    pub(crate) fn unregister(&mut self, client: &ClientHandle) -> Option<ClientHandle> {
        match self.clients.get(client.id()) {
            Some(current) if current.same_connection(client) => self.clients.remove(client.id()),
            _ => None,
        }
    }

    /// Whether `id` is registered.
    #[cfg(test)]
    pub(crate) fn contains(&self, id: &ClientId) -> bool {
        self.clients.contains_key(id)
    }

    /// Snapshot of registered ids, sorted for stable output.
    pub(crate) fn ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.clients.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of registered clients.
    pub(crate) fn len(&self) -> usize {
        self.clients.len()
    }

    /// Remove and return every client.
    pub(crate) fn drain(&mut self) -> Vec<ClientHandle> {
        self.clients.drain().map(|(_, client)| client).collect()
    }

    /// Offer `frame` to every outbox without waiting on any of them.
    pub(crate) fn fanout(&self, frame: &Bytes) -> Fanout {
        let mut outcome = Fanout::default();
        for client in self.clients.values() {
            match client.try_enqueue(frame.clone()) {
                Ok(()) => outcome.delivered.push(client.id().clone()),
                Err(EnqueueError::Full) => outcome.full.push(client.clone()),
                Err(EnqueueError::Closed) => outcome.closed.push(client.clone()),
            }
        }
        outcome
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("client_count", &self.clients.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use tokio_util::sync::CancellationToken;

    fn client(id: &str, capacity: usize) -> (ClientHandle, tokio::sync::mpsc::Receiver<Bytes>) {
        ClientHandle::new(id, capacity, CancellationToken::new())
    }

    #[test]
    fn test_register_and_contains() {
        let mut registry = ClientRegistry::new();
        let (a, _rx) = client("1.1.1.1:1", 4);

        assert!(registry.register(a));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&ClientId::from("1.1.1.1:1")));
        assert!(!registry.contains(&ClientId::from("1.1.1.1:2")));
    }

    #[test]
    fn test_duplicate_register_keeps_first() {
        let mut registry = ClientRegistry::new();
        let (first, _rx1) = client("1.1.1.1:1", 4);
        let (second, _rx2) = client("1.1.1.1:1", 4);

        assert!(registry.register(first.clone()));
        assert!(!registry.register(second.clone()));
        assert_eq!(registry.len(), 1);

        // Only the first connection can remove the entry.
        assert!(registry.unregister(&second).is_none());
        assert!(registry.unregister(&first).is_some());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_unregister_unknown_is_noop() {
        let mut registry = ClientRegistry::new();
        let (a, _rx) = client("1.1.1.1:1", 4);
        assert!(registry.unregister(&a).is_none());

        registry.register(a.clone());
        assert!(registry.unregister(&a).is_some());
        assert!(registry.unregister(&a).is_none());
    }

    #[test]
    fn test_ids_sorted() {
        let mut registry = ClientRegistry::new();
        let (b, _rx_b) = client("b:1", 4);
        let (a, _rx_a) = client("a:1", 4);
        registry.register(b);
        registry.register(a);

        assert_eq!(registry.ids(), vec![ClientId::from("a:1"), ClientId::from("b:1")]);
    }

    #[test]
    fn test_fanout_sorts_outcomes() {
        let mut registry = ClientRegistry::new();
        let (open, mut open_rx) = client("open:1", 4);
        let (full, _full_rx) = client("full:1", 1);
        let (gone, _gone_rx) = client("gone:1", 4);
        full.try_enqueue(Bytes::from_static(b"backlog")).unwrap();
        gone.retire();
        registry.register(open);
        registry.register(full);
        registry.register(gone);

        let outcome = registry.fanout(&Bytes::from_static(b"frame"));

        assert_eq!(outcome.delivered, vec![ClientId::from("open:1")]);
        assert_eq!(outcome.full.len(), 1);
        assert_eq!(outcome.full[0].id().as_str(), "full:1");
        assert_eq!(outcome.closed.len(), 1);
        assert_eq!(outcome.closed[0].id().as_str(), "gone:1");
        assert_eq!(open_rx.try_recv().unwrap(), Bytes::from_static(b"frame"));
    }

    #[test]
    fn test_drain_empties_registry() {
        let mut registry = ClientRegistry::new();
        let (a, _rx_a) = client("a:1", 4);
        let (b, _rx_b) = client("b:1", 4);
        registry.register(a);
        registry.register(b);

        assert_eq!(registry.drain().len(), 2);
        assert_eq!(registry.len(), 0);
    }

    /// One step against the registry. `Unregister` picks any handle ever created,
    /// so stale handles whose id was re-registered get exercised.
    #[derive(Debug, Clone)]
    enum Step {
        Register(u8),
        Unregister(usize),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0u8..4).prop_map(Step::Register),
            any::<usize>().prop_map(Step::Unregister),
        ]
    }

    proptest! {
        #[test]
        fn test_registry_holds_registered_and_not_unregistered(
            steps in prop::collection::vec(step(), 1..64)
        ) {
            let mut registry = ClientRegistry::new();
            let mut model: BTreeMap<ClientId, u64> = BTreeMap::new();
            let mut handles: Vec<ClientHandle> = Vec::new();
            let mut outboxes = Vec::new();

            for step in steps {
                match step {
                    Step::Register(n) => {
                        let (handle, rx) = client(&format!("10.0.0.{n}:1"), 1);
                        outboxes.push(rx);
                        let fresh = !model.contains_key(handle.id());
                        let registered = registry.register(handle.clone());
                        prop_assert_eq!(registered, fresh);
                        if fresh {
                            model.insert(handle.id().clone(), handle.serial());
                        }
                        handles.push(handle);
                    }
                    Step::Unregister(pick) => {
                        if handles.is_empty() {
                            continue;
                        }
                        let handle = &handles[pick % handles.len()];
                        let current = model.get(handle.id()) == Some(&handle.serial());
                        let removed = registry.unregister(handle);
                        prop_assert_eq!(removed.is_some(), current);
                        if current {
                            model.remove(handle.id());
                        }
                    }
                }

                let expected: Vec<ClientId> = model.keys().cloned().collect();
                prop_assert_eq!(registry.ids(), expected);
                prop_assert_eq!(registry.len(), model.len());
            }
        }
    }
}
