//! Peer registry: identity -> connection handle, shared by every task.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::identity::PeerIdentity;

/// Thread-safe map of peer connections.
///
/// Every operation holds the lock only for the map access itself, so it never
/// waits on I/O and cannot deadlock with callers that hold per-connection
/// locks. Entries are compared by pointer in [`remove_if_same`], which lets a
/// stale connection tear itself down without evicting its replacement.
///
/// [`remove_if_same`]: PeerRegistry::remove_if_same
pub struct PeerRegistry<C> {
    entries: Mutex<HashMap<PeerIdentity, Arc<C>>>,
}

impl<C> PeerRegistry<C> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert or replace, returning the previous entry.
    pub async fn put(&self, identity: PeerIdentity, conn: Arc<C>) -> Option<Arc<C>> {
        self.entries.lock().await.insert(identity, conn)
    }

    /// Insert only if no entry exists. Returns the entry that was already there.
    pub async fn insert_if_absent(&self, identity: PeerIdentity, conn: Arc<C>) -> Option<Arc<C>> {
        let mut entries = self.entries.lock().await;
        match entries.get(&identity) {
            Some(existing) => Some(existing.clone()),
            None => {
                entries.insert(identity, conn);
                None
            }
        }
    }

    pub async fn get(&self, identity: &PeerIdentity) -> Option<Arc<C>> {
        self.entries.lock().await.get(identity).cloned()
    }

    pub async fn remove(&self, identity: &PeerIdentity) -> Option<Arc<C>> {
        self.entries.lock().await.remove(identity)
    }

    /// Remove the entry only if it is exactly `conn`.
    pub async fn remove_if_same(&self, identity: &PeerIdentity, conn: &Arc<C>) -> Option<Arc<C>> {
        let mut entries = self.entries.lock().await;
        match entries.get(identity) {
            Some(stored) if Arc::ptr_eq(stored, conn) => entries.remove(identity),
            _ => None,
        }
    }

    /// Snapshot of the current identities.
    pub async fn keys(&self) -> Vec<PeerIdentity> {
        self.entries.lock().await.keys().copied().collect()
    }

    /// Snapshot of the current entries.
    pub async fn snapshot(&self) -> Vec<(PeerIdentity, Arc<C>)> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|(id, conn)| (*id, conn.clone()))
            .collect()
    }

    /// Remove every entry, returning them.
    pub async fn drain(&self) -> Vec<(PeerIdentity, Arc<C>)> {
        self.entries.lock().await.drain().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

impl<C> Default for PeerRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> PeerIdentity {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn put_returns_previous() {
        let registry = PeerRegistry::new();
        let first = Arc::new(1u32);
        let second = Arc::new(2u32);

        assert!(registry.put(id("10.0.0.1"), first.clone()).await.is_none());
        let previous = registry.put(id("10.0.0.1"), second.clone()).await.unwrap();
        assert!(Arc::ptr_eq(&previous, &first));
        assert_eq!(registry.len().await, 1);
        assert!(Arc::ptr_eq(&registry.get(&id("10.0.0.1")).await.unwrap(), &second));
    }

    #[tokio::test]
    async fn remove_if_same_keeps_replacement() {
        let registry = PeerRegistry::new();
        let stale = Arc::new("stale");
        let fresh = Arc::new("fresh");

        registry.put(id("10.0.0.1"), stale.clone()).await;
        registry.put(id("10.0.0.1"), fresh.clone()).await;

        assert!(registry.remove_if_same(&id("10.0.0.1"), &stale).await.is_none());
        assert!(registry.get(&id("10.0.0.1")).await.is_some());

        let removed = registry.remove_if_same(&id("10.0.0.1"), &fresh).await.unwrap();
        assert!(Arc::ptr_eq(&removed, &fresh));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn insert_if_absent_does_not_overwrite() {
        let registry = PeerRegistry::new();
        let first = Arc::new(1u32);

        assert!(registry.insert_if_absent(id("10.0.0.1"), first.clone()).await.is_none());
        let existing = registry
            .insert_if_absent(id("10.0.0.1"), Arc::new(2u32))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&existing, &first));
    }

    #[tokio::test]
    async fn keys_is_a_snapshot() {
        let registry = Arc::new(PeerRegistry::new());
        for i in 1..=4u8 {
            registry
                .put(PeerIdentity::new([10, 0, 0, i].into()), Arc::new(i))
                .await;
        }
        let keys = registry.keys().await;
        // Mutating while iterating the snapshot must neither block nor change it.
        for key in &keys {
            registry.remove(key).await;
        }
        assert_eq!(keys.len(), 4);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn concurrent_mutation() {
        let registry = Arc::new(PeerRegistry::new());
        let mut tasks = Vec::new();
        for i in 0..32u8 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let identity = PeerIdentity::new([10, 0, 0, i % 4].into());
                let conn = Arc::new(i);
                registry.put(identity, conn.clone()).await;
                let _ = registry.keys().await;
                registry.remove_if_same(&identity, &conn).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(registry.len().await <= 4);
    }
}
