//! End-to-end tests for a tutoring session.
//!
//! A mock `generateContent` service runs on a local axum server; the real
//! `HttpTransport`, `CompletionClient` and `Controller` talk to it over HTTP.
//! The execution engine and renderer are in-memory fakes, so Docker is not
//! needed.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tutor_core::controller::{API_CONNECTION_MESSAGE, ERROR_TITLE};
use tutor_core::{
    BackoffScope, CompletionClient, Config, Controller, ExecutionEngine, ExecutionResult,
    HttpTransport, Renderer, Role, Store, DEFAULT_APOLOGY,
};

const LESSON: &str = "# Python Loops\n\nA `for` loop repeats code.\n\n**Exercise:** print 0 to 2.";

// ============================================================================
// Mock completion service
// ============================================================================

#[derive(Clone, Default)]
struct MockService {
    script: Arc<Mutex<VecDeque<(u16, String)>>>,
    received: Arc<Mutex<Vec<Received>>>,
}

#[derive(Debug, Clone)]
struct Received {
    key: Option<String>,
    body: Value,
}

impl MockService {
    fn reply(&self, text: &str) {
        let body = json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": text}]}}]
        });
        self.respond(200, &body.to_string());
    }

    fn respond(&self, status: u16, body: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back((status, body.to_string()));
    }

    fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    /// Texts of the `contents` array of request `index`, oldest first.
    fn turns(&self, index: usize) -> Vec<(String, String)> {
        self.received()[index].body["contents"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| {
                (
                    c["role"].as_str().unwrap().to_string(),
                    c["parts"][0]["text"].as_str().unwrap().to_string(),
                )
            })
            .collect()
    }
}

async fn generate_content(
    State(service): State<MockService>,
    Query(params): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> (StatusCode, String) {
    service.received.lock().unwrap().push(Received {
        key: params.get("key").cloned(),
        body,
    });
    let (status, body) = service
        .script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or((500, r#"{"error": "unscripted request"}"#.to_string()));
    (StatusCode::from_u16(status).unwrap(), body)
}

/// Starts the mock service and returns its `generateContent` URL.
async fn start_mock(service: MockService) -> String {
    let app = Router::new()
        .route("/v1beta/models/test:generateContent", post(generate_content))
        .with_state(service);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/v1beta/models/test:generateContent")
}

// ============================================================================
// Fakes
// ============================================================================

struct FakeEngine {
    ready: AtomicBool,
    result: ExecutionResult,
    executed: Mutex<Vec<String>>,
}

impl FakeEngine {
    fn returning(result: ExecutionResult) -> Arc<Self> {
        Arc::new(Self {
            ready: AtomicBool::new(false),
            result,
            executed: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ExecutionEngine for FakeEngine {
    async fn initialize(&self) -> tutor_core::Result<()> {
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn execute(&self, code: &str) -> tutor_core::Result<ExecutionResult> {
        self.executed.lock().unwrap().push(code.to_string());
        Ok(self.result.clone())
    }

    async fn reset(&self) -> tutor_core::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct MemoryRenderer {
    course: Mutex<String>,
    code: Mutex<String>,
    chat: Mutex<String>,
    entries: Mutex<Vec<(String, String)>>,
    notices: Mutex<Vec<(String, String)>>,
    console: Mutex<Vec<(String, bool)>>,
}

impl MemoryRenderer {
    fn type_chat(&self, text: &str) {
        *self.chat.lock().unwrap() = text.to_string();
    }

    fn notices(&self) -> Vec<(String, String)> {
        self.notices.lock().unwrap().clone()
    }

    fn last_entry(&self) -> Option<(String, String)> {
        self.entries.lock().unwrap().last().cloned()
    }
}

impl Renderer for MemoryRenderer {
    fn render_markup(&self, text: &str) -> String {
        text.to_string()
    }

    fn show_notice(&self, title: &str, message: &str) {
        self.notices
            .lock()
            .unwrap()
            .push((title.to_string(), message.to_string()));
    }

    fn append_conversation_entry(&self, sender: &str, text: &str, _is_user: bool) {
        self.entries
            .lock()
            .unwrap()
            .push((sender.to_string(), text.to_string()));
    }

    fn clear_conversation(&self) {
        self.entries.lock().unwrap().clear();
    }

    fn set_course_content(&self, markdown: &str) {
        *self.course.lock().unwrap() = markdown.to_string();
    }

    fn course_content(&self) -> String {
        self.course.lock().unwrap().clone()
    }

    fn code_input(&self) -> String {
        self.code.lock().unwrap().clone()
    }

    fn set_code_input(&self, code: &str) {
        *self.code.lock().unwrap() = code.to_string();
    }

    fn chat_input(&self) -> String {
        self.chat.lock().unwrap().clone()
    }

    fn clear_chat_input(&self) {
        self.chat.lock().unwrap().clear();
    }

    fn set_console_output(&self, text: &str, is_error: bool) {
        self.console
            .lock()
            .unwrap()
            .push((text.to_string(), is_error));
    }
}

// ============================================================================
// Session harness
// ============================================================================

struct Session {
    service: MockService,
    controller: Controller,
    store: Arc<Store>,
    engine: Arc<FakeEngine>,
    renderer: Arc<MemoryRenderer>,
}

async fn session_with(engine_result: ExecutionResult) -> Session {
    let service = MockService::default();
    let base_url = start_mock(service.clone()).await;

    let mut config = Config::default();
    config.api.base_url = base_url;
    config.api.api_key = Some("test-key".to_string());
    config.api.max_attempts = 3;
    config.api.initial_retry_delay_ms = 10;
    config.validate().unwrap();

    let store = Arc::new(Store::from_config(&config));
    let transport = Arc::new(HttpTransport::new(&config.api).unwrap());
    let client = Arc::new(CompletionClient::from_config(
        transport,
        Arc::clone(&store),
        &config,
    ));
    let engine = FakeEngine::returning(engine_result);
    let renderer = Arc::new(MemoryRenderer::default());

    let controller = Controller::new(
        config,
        Arc::clone(&store),
        client,
        engine.clone(),
        renderer.clone(),
    );

    Session {
        service,
        controller,
        store,
        engine,
        renderer,
    }
}

async fn session() -> Session {
    session_with(ExecutionResult::succeeded("0\n1\n2\n")).await
}

/// Bootstraps the session with [`LESSON`].
async fn bootstrapped() -> Session {
    let s = session().await;
    s.service.reply(LESSON);
    s.controller.initialize().await.unwrap();
    s
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_bootstrap_renders_lesson_and_seeds_history() {
    let s = bootstrapped().await;

    assert_eq!(s.renderer.course_content(), LESSON);
    let history = s.store.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history.turns()[1].text(), LESSON);
    assert!(history.turns().iter().all(|t| t.role() == Role::Responder));

    let received = s.service.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].key.as_deref(), Some("test-key"));

    let turns = s.service.turns(0);
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].0, "user");
    assert!(turns[0].1.contains("variables, data types, and basic operations"));

    let status = s.controller.status();
    assert!(status.initialized);
    assert!(status.engine_ready);
    assert!(!status.loading);
}

#[tokio::test]
async fn test_chat_sends_history_plus_prompt_and_appends_reply() {
    let s = bootstrapped().await;
    s.service.reply("A loop repeats a block of code.");

    s.renderer.type_chat("What is a loop?");
    s.controller.send_chat().await;

    let turns = s.service.turns(1);
    let roles: Vec<&str> = turns.iter().map(|(role, _)| role.as_str()).collect();
    assert_eq!(roles, ["model", "model", "user", "user"]);
    assert_eq!(turns[2].1, "What is a loop?");
    assert_eq!(turns[3].1, "What is a loop?");

    let history = s.store.history();
    assert_eq!(history.len(), 4);
    assert_eq!(
        history.last().map(|t| t.text().to_string()),
        Some("A loop repeats a block of code.".to_string())
    );
    assert!(s.renderer.chat_input().is_empty());
}

#[tokio::test]
async fn test_rate_limit_then_success_resets_delay() {
    let s = bootstrapped().await;
    s.service.respond(429, r#"{"error": {"code": 429}}"#);
    s.service.reply("Loops repeat code.");

    s.renderer.type_chat("Explain loops");
    s.controller.send_chat().await;

    assert_eq!(s.service.received().len(), 3);
    assert_eq!(
        s.renderer.last_entry(),
        Some(("AI Tutor".to_string(), "Loops repeat code.".to_string()))
    );
    assert_eq!(s.store.retry_delay(), Duration::from_millis(10));
    assert!(s.renderer.notices().is_empty());
}

#[tokio::test]
async fn test_persistent_rate_limit_answers_with_apology() {
    let s = bootstrapped().await;
    for _ in 0..3 {
        s.service.respond(429, "{}");
    }

    s.renderer.type_chat("Are you there?");
    s.controller.send_chat().await;

    assert_eq!(s.service.received().len(), 4);
    assert_eq!(
        s.store.history().last().map(|t| t.text().to_string()),
        Some(DEFAULT_APOLOGY.to_string())
    );
    assert!(s.store.retry_delay() > Duration::from_millis(10));
    assert!(!s.store.loading().active);
}

#[tokio::test]
async fn test_server_errors_exhaust_attempts_and_notify() {
    let s = bootstrapped().await;
    // Unscripted requests answer 500.
    s.renderer.type_chat("Hello?");
    s.controller.send_chat().await;

    assert_eq!(s.service.received().len(), 4);
    assert!(s
        .renderer
        .notices()
        .contains(&(ERROR_TITLE.to_string(), API_CONNECTION_MESSAGE.to_string())));
    // Only the user turn was added.
    assert_eq!(s.store.history().len(), 3);
    assert!(!s.store.loading().active);
}

#[tokio::test]
async fn test_malformed_response_is_retried() {
    let s = bootstrapped().await;
    s.service
        .respond(200, r#"{"candidates": [{"finishReason": "SAFETY"}]}"#);
    s.service.reply("Here is a safer answer.");

    s.renderer.type_chat("Tell me about loops");
    s.controller.send_chat().await;

    assert_eq!(s.service.received().len(), 3);
    assert_eq!(
        s.store.history().last().map(|t| t.text().to_string()),
        Some("Here is a safer answer.".to_string())
    );
}

#[tokio::test]
async fn test_run_code_requests_feedback_with_output() {
    let s = bootstrapped().await;
    s.service.reply("Well done, that prints 0 to 2.");

    let code = "for i in range(3):\n    print(i)\n";
    s.renderer.set_code_input(code);
    s.controller.run_code().await;

    assert_eq!(s.engine.executed.lock().unwrap().as_slice(), [code]);
    assert_eq!(
        s.renderer.console.lock().unwrap().last().cloned(),
        Some(("0\n1\n2\n".to_string(), false))
    );

    let turns = s.service.turns(1);
    let prompt = &turns.last().unwrap().1;
    assert!(prompt.contains(code));
    assert!(prompt.contains("The output was: \"0\n1\n2\n\""));

    assert_eq!(
        s.renderer.last_entry(),
        Some((
            "AI Tutor".to_string(),
            "Well done, that prints 0 to 2.".to_string()
        ))
    );
}

#[tokio::test]
async fn test_run_code_forwards_errors_to_feedback() {
    let traceback = "Traceback (most recent call last):\nNameError: name 'x' is not defined";
    let s = session_with(ExecutionResult::failed("", traceback)).await;
    s.service.reply(LESSON);
    s.controller.initialize().await.unwrap();
    s.service.reply("You used x before defining it.");

    s.renderer.set_code_input("print(x)");
    s.controller.run_code().await;

    let turns = s.service.turns(1);
    assert!(turns.last().unwrap().1.contains("It resulted in an error"));
    assert!(turns.last().unwrap().1.contains("NameError"));
    assert_eq!(
        s.renderer.console.lock().unwrap().last().cloned(),
        Some((traceback.to_string(), true))
    );
}

#[tokio::test]
async fn test_new_exercise_restarts_conversation() {
    let s = bootstrapped().await;
    s.service.reply("A first reply.");
    s.renderer.type_chat("First question");
    s.controller.send_chat().await;

    s.service.reply("# Python Loops\n\nPrint the even numbers below 10.");
    s.controller.new_exercise().await;

    let turns = s.service.turns(2);
    assert!(turns.last().unwrap().1.contains("Python Loops"));

    let history = s.store.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history.turns()[0].role(), Role::Responder);
    assert!(s.renderer.course_content().contains("even numbers"));
}

#[tokio::test]
async fn test_reset_clears_history() {
    let s = bootstrapped().await;
    s.controller.reset().await;

    assert!(s.store.history().is_empty());
    assert!(s.renderer.code_input().is_empty());
    assert_eq!(s.service.received().len(), 1);
}

#[test]
fn test_fixture_config_loads() {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures/tutor.json");
    let config = Config::load_from_file(&path).expect("Failed to load config fixture");
    config.validate().expect("Fixture config should be valid");

    assert_eq!(config.api.max_attempts, 3);
    assert_eq!(config.api.initial_retry_delay_ms, 10);
    assert_eq!(config.api.backoff_scope, BackoffScope::PerCall);
    assert_eq!(config.api.resolve_api_key().as_deref(), Some("fixture-key"));
    assert_eq!(config.chat.max_history, 10);
    assert_eq!(config.chat.retain_on_overflow, 4);
    assert_eq!(config.lesson.default_topic, "lists and loops");
    assert_eq!(config.sandbox.run_timeout_secs, 5);
    assert_eq!(config.sandbox.image, "python:3.12-alpine");
}
