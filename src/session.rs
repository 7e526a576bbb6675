//! Session lifecycle: create, execute, close, list.
//!
//! Each session owns one environment behind a per-session execution lock.
//! `run` and `close` only ever happen while that lock is held, and the guard
//! travels into the blocking task, so a cancelled caller cannot release the
//! lock while the environment is still busy.

use crate::environment::{EnvironmentFactory, ExecutionOutput, Language};
use crate::error::{ServiceError, ServiceResult};
use crate::id::SessionId;
use crate::registry::SessionRegistry;
use crate::state::{PendingSession, Session, SessionState};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Metadata about a live session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub language: Language,
    pub keep_template: bool,
    pub age_secs: u64,
    pub executions: u64,
}

pub struct SessionManager {
    registry: Arc<SessionRegistry>,
    environments: Arc<dyn EnvironmentFactory>,
}

impl SessionManager {
    pub fn new(registry: SessionRegistry, environments: Arc<dyn EnvironmentFactory>) -> Self {
        Self {
            registry: Arc::new(registry),
            environments,
        }
    }

    /// Open a new environment and register it.
    pub async fn create_session(
        &self,
        language: Language,
        keep_template: bool,
    ) -> ServiceResult<SessionId> {
        let mut environment = self.environments.create(language, keep_template);
        let registry = self.registry.clone();

        // Spawned so that an opened environment is registered even if the
        // caller goes away while `open` is still running.
        let task = tokio::spawn(async move {
            let environment = tokio::task::spawn_blocking(move || {
                environment.open().map(|()| environment)
            })
            .await?
            .map_err(ServiceError::EnvironmentSetup)?;

            let id = registry
                .insert(PendingSession {
                    environment,
                    language,
                    keep_template,
                })
                .await;
            Ok::<_, ServiceError>(id)
        });

        let id = task.await??;
        info!(session_id = %id, %language, keep_template, "Created session");
        Ok(id)
    }

    /// Run code in an existing session, waiting for any run already in progress.
    pub async fn execute_in_session(
        &self,
        id: &SessionId,
        code: String,
        libraries: Vec<String>,
    ) -> ServiceResult<ExecutionOutput> {
        let session = self.lookup(id).await?;
        run_in(session, code, libraries).await
    }

    /// Remove a session and tear its environment down.
    ///
    /// Returns `false` if the id is unknown or already closed. Teardown
    /// failures are logged, never returned.
    pub async fn close_session(&self, id: &SessionId) -> bool {
        let Some(session) = self.registry.remove(id).await else {
            return false;
        };

        let teardown = tokio::spawn(teardown(session));
        if let Err(e) = teardown.await {
            warn!(session_id = %id, error = %e, "Session teardown task failed");
        }
        info!(session_id = %id, "Closed session");
        true
    }

    pub async fn list_sessions(&self) -> Vec<SessionId> {
        self.registry.snapshot().await
    }

    pub async fn describe_session(&self, id: &SessionId) -> ServiceResult<SessionInfo> {
        let session = self.lookup(id).await?;
        Ok(SessionInfo {
            id: session.id.clone(),
            language: session.language,
            keep_template: session.keep_template,
            age_secs: session.created_at.elapsed().as_secs(),
            executions: session.executions(),
        })
    }

    /// Close every registered session. Used on graceful shutdown.
    pub async fn shutdown(&self) {
        let ids = self.registry.snapshot().await;
        if ids.is_empty() {
            return;
        }
        info!(count = ids.len(), "Closing remaining sessions");

        let mut closing = tokio::task::JoinSet::new();
        for id in ids {
            if let Some(session) = self.registry.remove(&id).await {
                closing.spawn(teardown(session));
            }
        }
        while closing.join_next().await.is_some() {}
    }

    async fn lookup(&self, id: &SessionId) -> ServiceResult<Arc<Session>> {
        self.registry
            .get(id)
            .await
            .ok_or_else(|| ServiceError::SessionNotFound(id.clone()))
    }
}

/// Run code under the session's execution lock.
async fn run_in(
    session: Arc<Session>,
    code: String,
    libraries: Vec<String>,
) -> ServiceResult<ExecutionOutput> {
    let id = &session.id;
    let mut slot = session.lock().await;

    // Lost a race with close: the entry was still visible at lookup time.
    if slot.state == SessionState::Terminated {
        return Err(ServiceError::SessionNotFound(id.clone()));
    }

    session.record_execution();
    let output = tokio::task::spawn_blocking(move || {
        let output = slot.environment.run(&code, &libraries);
        drop(slot);
        output
    })
    .await?
    .map_err(ServiceError::Execution)?;

    info!(session_id = %id, exit_code = output.exit_code, "Executed in session");
    Ok(output)
}

/// Wait for any in-flight run, then close the environment.
async fn teardown(session: Arc<Session>) {
    let mut slot = session.lock().await;
    slot.state = SessionState::Terminated;

    let id = session.id.clone();
    let closed = tokio::task::spawn_blocking(move || slot.environment.close()).await;
    match closed {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(session_id = %id, error = %e, "Failed to close environment"),
        Err(e) => warn!(session_id = %id, error = %e, "Environment close task failed"),
    }
}
