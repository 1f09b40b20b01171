//! In-process mock of the file-io backend and a storage file server

#![allow(dead_code)]

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use futures_util::stream;
use renderferry::config::Config;
use renderferry::transfer::digest::digest_bytes;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path as FsPath;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

pub const API_KEY: &str = "test-key";

#[derive(Default)]
pub struct MockState {
    pub queue: Mutex<VecDeque<Value>>,
    pub jobs: Mutex<HashMap<String, Vec<Value>>>,
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    /// Files streamed forever in small, slow pieces
    pub endless: Mutex<HashSet<String>>,
    pub gone: Mutex<HashSet<String>>,
    pub accepted_token: Mutex<Option<String>>,
    /// The next issued token is rejected by every endpoint
    pub poison_next_token: AtomicBool,
    pub token_calls: AtomicU32,
    pub file_requests: AtomicU32,
    pub finished: Mutex<Vec<(String, Value)>>,
    pub failed: Mutex<Vec<(String, Value)>>,
    pub touches: Mutex<Vec<(String, Value)>>,
    pub next_queries: Mutex<Vec<HashMap<String, String>>>,
    pub missing_version_header: AtomicBool,
}

pub struct MockServer {
    pub base_url: String,
    pub state: Arc<MockState>,
}

impl MockServer {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .route("/api/oauth_jwt", get(issue_token))
            .route("/api/v1/fileio/downloader/next", get(next_item))
            .route("/api/v1/fileio/downloader/touch/{id}", put(touch))
            .route("/api/v1/fileio/downloader/finish/{id}", put(finish))
            .route("/api/v1/fileio/downloader/fail/{id}", put(fail))
            .route("/api/v1/fileio/downloader/jobs/{job_id}", get(job_items))
            .route("/files/{name}", get(serve_file))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", address),
            state,
        }
    }

    /// Register a source file and return its item JSON
    pub fn item(&self, id: &str, data: &[u8]) -> Value {
        self.state
            .files
            .lock()
            .unwrap()
            .insert(id.to_string(), data.to_vec());
        json!({
            "id": id,
            "job_id": "00208",
            "task_id": "010",
            "url": format!("{}/files/{}", self.base_url, id),
            "relative_path": format!("cental/{}.exr", id),
            "size": data.len(),
            "md5": digest_bytes(data),
        })
    }

    pub fn enqueue(&self, item: Value) {
        self.state.queue.lock().unwrap().push_back(item);
    }

    pub fn config(&self, output: &FsPath) -> Config {
        let mut config = Config::default();
        config.backend.base_url = self.base_url.clone();
        config.backend.api_key = Some(API_KEY.to_string());
        config.backend.request_timeout_secs = 5;
        config.worker.thread_count = 1;
        config.worker.output_dir = Some(output.to_path_buf());
        config.worker.poll_interval_ms = 20;
        config.worker.max_poll_backoff_ms = 50;
        config.worker.heartbeat_interval_secs = 1;
        config.worker.error_pause_ms = 10;
        config.retry.base_delay_ms = 10;
        config.retry.max_delay_ms = 50;
        config.history.interval_secs = 1;
        config
    }

    pub fn finished_ids(&self) -> Vec<String> {
        ids(&self.state.finished)
    }

    pub fn failed_ids(&self) -> Vec<String> {
        ids(&self.state.failed)
    }
}

fn ids(calls: &Mutex<Vec<(String, Value)>>) -> Vec<String> {
    calls.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
}

/// Poll `condition` every 20ms for up to 10s
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 10s"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn authorized(state: &MockState, headers: &HeaderMap) -> bool {
    if headers.get("accept-version").and_then(|v| v.to_str().ok()) != Some("v1") {
        state.missing_version_header.store(true, Ordering::SeqCst);
    }
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let accepted = state.accepted_token.lock().unwrap();
    presented.is_some() && presented == accepted.as_deref()
}

async fn issue_token(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    let expected = format!("Token {}", API_KEY);
    if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some(expected.as_str()) {
        return StatusCode::FORBIDDEN.into_response();
    }

    let call = state.token_calls.fetch_add(1, Ordering::SeqCst) + 1;
    let token = format!("token-{}", call);
    if !state.poison_next_token.swap(false, Ordering::SeqCst) {
        *state.accepted_token.lock().unwrap() = Some(token.clone());
    }
    Json(json!({ "access_token": token })).into_response()
}

async fn next_item(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    axum::extract::Query(query): axum::extract::Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    state.next_queries.lock().unwrap().push(query);
    match state.queue.lock().unwrap().pop_front() {
        Some(item) => Json(item).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn report(
    state: &MockState,
    headers: &HeaderMap,
    calls: &Mutex<Vec<(String, Value)>>,
    id: String,
    body: Value,
) -> Response {
    if !authorized(state, headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if state.gone.lock().unwrap().contains(&id) {
        return StatusCode::GONE.into_response();
    }
    calls.lock().unwrap().push((id, body));
    Json(json!({})).into_response()
}

async fn touch(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    report(&state, &headers, &state.touches, id, body).await
}

async fn finish(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    report(&state, &headers, &state.finished, id, body).await
}

async fn fail(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    report(&state, &headers, &state.failed, id, body).await
}

async fn job_items(
    State(state): State<Arc<MockState>>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let items = state
        .jobs
        .lock()
        .unwrap()
        .get(&job_id)
        .cloned()
        .unwrap_or_default();
    Json(json!({ "items": items })).into_response()
}

async fn serve_file(State(state): State<Arc<MockState>>, Path(name): Path<String>) -> Response {
    state.file_requests.fetch_add(1, Ordering::SeqCst);

    if state.endless.lock().unwrap().contains(&name) {
        let pieces = stream::unfold((), |()| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Some((Ok::<_, std::io::Error>(vec![0u8; 64 * 1024]), ()))
        });
        return Body::from_stream(pieces).into_response();
    }

    match state.files.lock().unwrap().get(&name) {
        Some(data) => data.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
