#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use tokio::sync::Notify;
use tower::ServiceExt;

use tumbler_api::config::ServerConfig;
use tumbler_api::router::build_app_router;
use tumbler_api::state::AppState;
use tumbler_core::definition::{Definition, DefinitionKind};
use tumbler_core::path::JobPath;
use tumbler_pipeline::{JobRunner, PathRegistry, RunContext, RunnerError, Tracker, TrackerConfig};

/// Build a test `ServerConfig` with safe defaults.
///
/// Uses `http://localhost:5173` as CORS origin (matching the dev default)
/// and a 30-second request timeout.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 30,
        stream_keep_alive_secs: 15,
    }
}

// ---------------------------------------------------------------------------
// Runners
// ---------------------------------------------------------------------------

/// Emits one line and succeeds.
pub struct Echo;

#[async_trait]
impl JobRunner for Echo {
    async fn run(
        &self,
        definition: Arc<Definition>,
        ctx: RunContext,
    ) -> Result<serde_json::Value, RunnerError> {
        ctx.emit_output(format!("running {}", definition.path));
        Ok(serde_json::json!("done"))
    }
}

/// Fails without output.
pub struct Failing;

#[async_trait]
impl JobRunner for Failing {
    async fn run(
        &self,
        _definition: Arc<Definition>,
        _ctx: RunContext,
    ) -> Result<serde_json::Value, RunnerError> {
        Err(RunnerError::Other("exit status 2".into()))
    }
}

/// Blocks until released, then succeeds.
pub struct Gated(pub Arc<Notify>);

#[async_trait]
impl JobRunner for Gated {
    async fn run(
        &self,
        _definition: Arc<Definition>,
        _ctx: RunContext,
    ) -> Result<serde_json::Value, RunnerError> {
        self.0.notified().await;
        Ok(serde_json::json!(null))
    }
}

// ---------------------------------------------------------------------------
// App
// ---------------------------------------------------------------------------

fn path(raw: &str) -> JobPath {
    JobPath::parse(raw).unwrap()
}

/// Tracker over a small fixture catalog:
///
/// ```text
/// team/build           job
/// team/deploy          pipeline
/// team/service/*       pipeline (wildcard)
/// team/legacy          job, disabled
/// solo                 job
/// ```
pub fn test_tracker(runner: impl JobRunner) -> Arc<Tracker> {
    let registry = PathRegistry::from_definitions([
        Definition::new(path("team/build"), DefinitionKind::Job, "make")
            .with_description("Build everything"),
        Definition::new(path("team/deploy"), DefinitionKind::Pipeline, "sh 'deploy'"),
        Definition::new(path("team/service/*"), DefinitionKind::Pipeline, "sh 'make'"),
        Definition::new(path("team/legacy"), DefinitionKind::Job, "make").disabled(),
        Definition::new(path("solo"), DefinitionKind::Job, "true"),
    ])
    .unwrap();
    Arc::new(Tracker::with_registry(
        TrackerConfig::default(),
        registry,
        Arc::new(runner),
    ))
}

/// Build the full application router with all middleware layers around
/// `tracker`, exactly as the binary does.
pub fn build_test_app(tracker: Arc<Tracker>) -> Router {
    let config = test_config();
    let state = AppState {
        config: Arc::new(config.clone()),
        tracker,
    };
    build_app_router(state, &config)
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

pub async fn send(app: Router, request: Request<Body>) -> Response<Body> {
    app.oneshot(request).await.unwrap()
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    send(app, request).await
}

pub async fn post(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    send(app, request).await
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    tokio::time::timeout(Duration::from_secs(5), response.into_body().collect())
        .await
        .expect("body should complete")
        .unwrap()
        .to_bytes()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Submit `job` and return its workflow id.
pub async fn submit(app: Router, job: &str) -> String {
    let response = post(app, &format!("/submit/{job}")).await;
    assert_eq!(response.status(), axum::http::StatusCode::ACCEPTED);
    let json = body_json(response).await;
    json["data"]["workflowId"].as_str().unwrap().to_string()
}

// ---------------------------------------------------------------------------
// SSE
// ---------------------------------------------------------------------------

/// One parsed server-sent event.
#[derive(Debug)]
pub struct SseMessage {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: serde_json::Value,
}

/// Parse an SSE body into its messages, skipping comment-only frames.
pub fn parse_sse(body: &str) -> Vec<SseMessage> {
    body.split("\n\n")
        .filter_map(|frame| {
            let mut id = None;
            let mut event = None;
            let mut data = String::new();
            for line in frame.lines() {
                if let Some(v) = line.strip_prefix("id:") {
                    id = Some(v.trim().to_string());
                } else if let Some(v) = line.strip_prefix("event:") {
                    event = Some(v.trim().to_string());
                } else if let Some(v) = line.strip_prefix("data:") {
                    data.push_str(v.trim_start());
                }
            }
            if data.is_empty() {
                return None;
            }
            Some(SseMessage {
                id,
                event,
                data: serde_json::from_str(&data).unwrap(),
            })
        })
        .collect()
}

/// Stream `uri` to completion and parse the messages.
pub async fn stream(app: Router, uri: &str) -> Vec<SseMessage> {
    let response = get(app, uri).await;
    assert_eq!(response.status(), axum::http::StatusCode::OK);
    let body = body_bytes(response).await;
    parse_sse(&String::from_utf8(body).unwrap())
}

/// Wait until the execution reaches a terminal state.
pub async fn wait_terminal(tracker: &Tracker, workflow_id: &str) {
    let id = workflow_id.parse().unwrap();
    let handle = tracker.store().handle(&id).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !handle.is_terminal() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("execution should finish");
}
