//! Concurrency-safe id → session store.
//!
//! Every operation takes the map lock only for the map mutation itself, so
//! nothing here ever waits on environment I/O.

use crate::id::{IdGenerator, SessionId};
use crate::state::{PendingSession, Session};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    ids: Arc<dyn IdGenerator>,
}

impl SessionRegistry {
    pub fn new(ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ids,
        }
    }

    /// Store a session under a freshly reserved id. Never overwrites.
    pub async fn insert(&self, pending: PendingSession) -> SessionId {
        let mut sessions = self.sessions.write().await;
        loop {
            let id = self.ids.generate();
            if let Entry::Vacant(slot) = sessions.entry(id.clone()) {
                slot.insert(Arc::new(Session::new(id.clone(), pending)));
                return id;
            }
            tracing::warn!(session_id = %id, "Generated session id already in use, retrying");
        }
    }

    pub async fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Take the entry out of the map. Only one caller ever gets it back.
    pub async fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(id)
    }

    pub async fn snapshot(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Language;
    use crate::testing::{FakeEnvironment, Probe, SequentialIds};

    fn pending(probe: &Probe) -> PendingSession {
        PendingSession {
            environment: Box::new(FakeEnvironment::new(probe.clone())),
            language: Language::Python,
            keep_template: false,
        }
    }

    #[tokio::test]
    async fn insert_then_get_and_remove() {
        let probe = Probe::default();
        let registry = SessionRegistry::new(Arc::new(SequentialIds::default()));

        let id = registry.insert(pending(&probe)).await;
        assert_eq!(registry.get(&id).await.unwrap().id, id);

        let removed = registry.remove(&id).await.unwrap();
        assert_eq!(removed.id, id);
        assert!(registry.get(&id).await.is_none());
        assert!(registry.remove(&id).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn insert_skips_ids_already_taken() {
        let probe = Probe::default();
        let ids = Arc::new(SequentialIds::scripted(vec!["a", "a", "b"]));
        let registry = SessionRegistry::new(ids);

        let first = registry.insert(pending(&probe)).await;
        let second = registry.insert(pending(&probe)).await;

        assert_eq!(first.as_str(), "a");
        assert_eq!(second.as_str(), "b");
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn snapshot_lists_live_ids() {
        let probe = Probe::default();
        let registry = SessionRegistry::new(Arc::new(SequentialIds::default()));
        let a = registry.insert(pending(&probe)).await;
        let b = registry.insert(pending(&probe)).await;
        registry.remove(&a).await;

        assert_eq!(registry.snapshot().await, vec![b]);
    }
}
