//! Shared helpers for the API tests.

use axum::{
    body::Body,
    http::{Method, Request, StatusCode, header},
    Router,
};
use isolate_server::http_server::router;
use isolate_server::testing::{FakeEnvironmentFactory, Probe, SequentialIds};
use isolate_server::AppState;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

pub fn test_app(factory: FakeEnvironmentFactory) -> (Router, AppState) {
    let state = AppState::with_id_generator(Arc::new(factory), Arc::new(SequentialIds::default()));
    (router(state.clone()), state)
}

pub fn default_app() -> (Router, Probe) {
    let probe = Probe::default();
    let (app, _) = test_app(FakeEnvironmentFactory::new(probe.clone()));
    (app, probe)
}

pub async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let builder = Request::builder().uri(uri).method(method);
    let request = match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_string(&json).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}
