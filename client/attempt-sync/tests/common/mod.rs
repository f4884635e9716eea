#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use attempt_sync::config::Config;
use axum::{
    extract::{Path as UrlPath, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use serde_json::Value;

pub const TEST_TOKEN: &str = "test-token";

#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub attempt_id: String,
    pub body: Value,
    pub authorization: Option<String>,
    pub query: HashMap<String, String>,
}

/// In-process stand-in for the attempt API
#[derive(Default)]
pub struct MockState {
    pub answers: Mutex<Vec<ReceivedRequest>>,
    pub audit_batches: Mutex<Vec<ReceivedRequest>>,
    pub failing_questions: Mutex<HashSet<String>>,
    pub answer_delay_ms: AtomicU64,
    pub audit_delay_ms: AtomicU64,
    pub unhealthy: AtomicBool,
}

impl MockState {
    pub fn answers(&self) -> Vec<ReceivedRequest> {
        self.answers.lock().unwrap().clone()
    }

    pub fn audit_batches(&self) -> Vec<ReceivedRequest> {
        self.audit_batches.lock().unwrap().clone()
    }

    pub fn fail_question(&self, question_id: &str) {
        self.failing_questions
            .lock()
            .unwrap()
            .insert(question_id.to_string());
    }

    pub fn heal_question(&self, question_id: &str) {
        self.failing_questions.lock().unwrap().remove(question_id);
    }

    pub fn set_audit_delay(&self, delay: Duration) {
        self.audit_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_answer_delay(&self, delay: Duration) {
        self.answer_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn answered_questions(&self) -> Vec<String> {
        self.answers()
            .into_iter()
            .filter_map(|req| req.body["questionId"].as_str().map(str::to_string))
            .collect()
    }
}

pub struct MockServer {
    pub base_url: String,
    pub state: Arc<MockState>,
}

pub async fn spawn_mock_server() -> MockServer {
    // Initialize tracing for tests
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let state = Arc::new(MockState::default());

    let app = Router::new()
        .route("/health", get(health))
        .route("/attempts/{attempt_id}/answer", put(save_answer))
        .route("/attempts/{attempt_id}/audit-events", post(audit_events))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind mock server");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockServer {
        base_url: format!("http://{}", addr),
        state,
    }
}

async fn health(State(state): State<Arc<MockState>>) -> StatusCode {
    if state.unhealthy.load(Ordering::SeqCst) {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

async fn save_answer(
    State(state): State<Arc<MockState>>,
    UrlPath(attempt_id): UrlPath<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    let delay = state.answer_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    let question_id = body["questionId"].as_str().unwrap_or_default().to_string();
    if state.failing_questions.lock().unwrap().contains(&question_id) {
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    state.answers.lock().unwrap().push(ReceivedRequest {
        attempt_id,
        body,
        authorization: authorization(&headers),
        query,
    });
    StatusCode::OK
}

async fn audit_events(
    State(state): State<Arc<MockState>>,
    UrlPath(attempt_id): UrlPath<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    let delay = state.audit_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    state.audit_batches.lock().unwrap().push(ReceivedRequest {
        attempt_id,
        body,
        authorization: authorization(&headers),
        query,
    });
    StatusCode::ACCEPTED
}

fn authorization(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Config pointed at the mock server with short timeouts
pub fn test_config(base_url: &str, storage_dir: &Path) -> Config {
    let mut config = Config::new(base_url, storage_dir);
    config.auth_token = Some(TEST_TOKEN.to_string());
    config.sync.online_save_timeout_ms = 500;
    config.sync.sync_timeout_ms = 1_000;
    config.telemetry.unload_deadline_ms = 1_000;
    config
}

/// Polls `check` until it holds or `timeout` elapses
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
