//! HTTP server implementation using Axum.

use crate::config::ServerConfig;
use crate::environment::{ExecutionOutput, Language};
use crate::error::{FaultKind, ServiceError, ServiceResult};
use crate::id::SessionId;
use crate::session::SessionInfo;
use crate::state::AppState;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

// Request/Response types
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default, alias = "lang")]
    pub language: Language,
    #[serde(default)]
    pub keep_template: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: SessionId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListSessionsResponse {
    pub session_ids: Vec<SessionId>,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
    #[serde(default)]
    pub libraries: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct EphemeralExecuteRequest {
    pub code: String,
    #[serde(default, alias = "lang")]
    pub language: Language,
    #[serde(default)]
    pub keep_template: bool,
    #[serde(default)]
    pub libraries: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct CloseSessionResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, code) = match self.kind() {
            FaultKind::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            FaultKind::Validation => (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR"),
            FaultKind::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        let message = self.to_string();
        if status.is_server_error() {
            error!(error_code = code, message = %message, "Request failed");
        } else {
            debug!(error_code = code, message = %message, "Client error");
        }
        (status, Json(ErrorResponse { error: message, code })).into_response()
    }
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> ServiceResult<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ServiceError::Validation(rejection.body_text()))
}

/// Library names go straight to the package manager's argv.
fn validate_libraries(libraries: Option<Vec<String>>) -> ServiceResult<Vec<String>> {
    let libraries = libraries.unwrap_or_default();
    for library in &libraries {
        if library.trim().is_empty() {
            return Err(ServiceError::Validation("library name must not be empty".to_string()));
        }
        if library.starts_with('-') {
            return Err(ServiceError::Validation(format!(
                "library name must not start with '-': {}",
                library
            )));
        }
    }
    Ok(libraries)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Session management
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/:id", get(get_session).delete(close_session))
        .route("/sessions/:id/execute", post(execute_in_session))
        // Stateless run
        .route("/execute", post(execute_ephemeral))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves, then close every remaining session.
pub async fn run_server(
    config: &ServerConfig,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = router(state.clone());

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Starting HTTP server on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("HTTP server stopped");
    state.sessions.shutdown().await;
    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

async fn create_session(
    State(state): State<AppState>,
    payload: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> ServiceResult<Json<CreateSessionResponse>> {
    let req = body(payload)?;
    let session_id = state
        .sessions
        .create_session(req.language, req.keep_template)
        .await?;
    Ok(Json(CreateSessionResponse { session_id }))
}

async fn list_sessions(State(state): State<AppState>) -> Json<ListSessionsResponse> {
    Json(ListSessionsResponse {
        session_ids: state.sessions.list_sessions().await,
    })
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> ServiceResult<Json<SessionInfo>> {
    Ok(Json(state.sessions.describe_session(&id).await?))
}

async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> ServiceResult<Json<CloseSessionResponse>> {
    if state.sessions.close_session(&id).await {
        Ok(Json(CloseSessionResponse { status: "closed" }))
    } else {
        Err(ServiceError::SessionNotFound(id))
    }
}

async fn execute_in_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> ServiceResult<Json<ExecutionOutput>> {
    let req = body(payload)?;
    let libraries = validate_libraries(req.libraries)?;
    let output = state
        .sessions
        .execute_in_session(&id, req.code, libraries)
        .await?;
    Ok(Json(output))
}

async fn execute_ephemeral(
    State(state): State<AppState>,
    payload: Result<Json<EphemeralExecuteRequest>, JsonRejection>,
) -> ServiceResult<Json<ExecutionOutput>> {
    let req = body(payload)?;
    let libraries = validate_libraries(req.libraries)?;
    info!(language = %req.language, "POST /execute");
    let output = state
        .ephemeral
        .execute(req.code, req.language, req.keep_template, libraries)
        .await?;
    Ok(Json(output))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn libraries_default_to_empty() {
        assert!(validate_libraries(None).unwrap().is_empty());
        assert_eq!(
            validate_libraries(Some(vec!["numpy".into()])).unwrap(),
            vec!["numpy".to_string()]
        );
    }

    #[test]
    fn option_like_library_names_are_rejected() {
        let err = validate_libraries(Some(vec!["--index-url=http://evil".into()])).unwrap_err();
        assert_eq!(err.kind(), FaultKind::Validation);
        let err = validate_libraries(Some(vec!["  ".into()])).unwrap_err();
        assert_eq!(err.kind(), FaultKind::Validation);
    }

    #[test]
    fn ephemeral_request_defaults() {
        let req: EphemeralExecuteRequest = serde_json::from_str(r#"{"code": "print(1)"}"#).unwrap();
        assert_eq!(req.language, Language::Python);
        assert!(!req.keep_template);
        assert!(req.libraries.is_none());

        let req: EphemeralExecuteRequest =
            serde_json::from_str(r#"{"code": "x", "lang": "ruby", "libraries": null}"#).unwrap();
        assert_eq!(req.language, Language::Ruby);
    }
}
