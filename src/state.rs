//! Shared application state and session types.

use crate::environment::{EnvironmentFactory, ExecutionEnvironment, Language};
use crate::ephemeral::EphemeralExecutor;
use crate::id::{IdGenerator, SessionId, UuidGenerator};
use crate::registry::SessionRegistry;
use crate::session::SessionManager;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Terminated,
}

/// The environment together with its lifecycle state, guarded by the
/// session's execution lock.
pub struct EnvironmentSlot {
    pub environment: Box<dyn ExecutionEnvironment>,
    pub state: SessionState,
}

/// An opened environment waiting for an id.
pub struct PendingSession {
    pub environment: Box<dyn ExecutionEnvironment>,
    pub language: Language,
    pub keep_template: bool,
}

/// A persistent sandbox session.
pub struct Session {
    pub id: SessionId,
    pub language: Language,
    pub keep_template: bool,
    pub created_at: Instant,
    executions: AtomicU64,
    slot: Arc<Mutex<EnvironmentSlot>>,
}

impl Session {
    pub(crate) fn new(id: SessionId, pending: PendingSession) -> Self {
        Self {
            id,
            language: pending.language,
            keep_template: pending.keep_template,
            created_at: Instant::now(),
            executions: AtomicU64::new(0),
            slot: Arc::new(Mutex::new(EnvironmentSlot {
                environment: pending.environment,
                state: SessionState::Active,
            })),
        }
    }

    /// Wait for the execution lock. Waiters are served in FIFO order.
    pub async fn lock(&self) -> OwnedMutexGuard<EnvironmentSlot> {
        self.slot.clone().lock_owned().await
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    pub(crate) fn record_execution(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("language", &self.language)
            .field("keep_template", &self.keep_template)
            .field("executions", &self.executions())
            .finish()
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub ephemeral: Arc<EphemeralExecutor>,
}

impl AppState {
    pub fn new(environments: Arc<dyn EnvironmentFactory>) -> Self {
        Self::with_id_generator(environments, Arc::new(UuidGenerator))
    }

    pub fn with_id_generator(
        environments: Arc<dyn EnvironmentFactory>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        let registry = SessionRegistry::new(ids);
        Self {
            sessions: Arc::new(SessionManager::new(registry, environments.clone())),
            ephemeral: Arc::new(EphemeralExecutor::new(environments)),
        }
    }
}
