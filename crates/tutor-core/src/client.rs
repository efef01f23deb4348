//! Resilient completion client.
//!
//! Sends a prompt with the current conversation as context and retries
//! rate-limited and failed exchanges with exponential backoff. The backoff
//! delay is owned by the [`Store`] and shared by every in-flight call unless
//! [`BackoffScope::PerCall`] is configured.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, instrument, warn};

use crate::config::{ApiConfig, BackoffScope, Config, LoadingMessages};
use crate::conversation::{Role, Turn};
use crate::error::{LlmErrorKind, Result, TutorError};
use crate::store::Store;
use crate::wire::{CompletionReply, CompletionTransport, GenerateRequest};

/// Answer given when the completion service cannot be reached.
pub const DEFAULT_APOLOGY: &str =
    "Sorry, I'm having trouble connecting right now. Please try again later.";

/// Why a completion is requested; selects the loading message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Purpose {
    /// A new lesson.
    Lesson,
    /// A harder exercise.
    Exercise,
    /// A chat reply.
    #[default]
    Chat,
    /// Feedback on a code run.
    Feedback,
}

/// A prompt to complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    /// Prompt text.
    pub prompt: String,
    /// Role the prompt is sent as.
    pub role: Role,
    /// Why the completion is requested.
    pub purpose: Purpose,
}

impl CompletionRequest {
    /// Creates a user-role chat request.
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            role: Role::User,
            purpose: Purpose::default(),
        }
    }

    /// Sets the role the prompt is sent as.
    #[must_use]
    pub const fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Sets the purpose.
    #[must_use]
    pub const fn with_purpose(mut self, purpose: Purpose) -> Self {
        self.purpose = purpose;
        self
    }
}

/// Attempt budget and backoff growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per call, rate-limited ones included.
    pub max_attempts: u32,
    /// Factor applied to the delay after each failed attempt.
    pub multiplier: u32,
    /// Whether the delay is shared between calls.
    pub scope: BackoffScope,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ApiConfig::default())
    }
}

impl From<&ApiConfig> for RetryPolicy {
    fn from(config: &ApiConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            multiplier: config.retry_multiplier,
            scope: config.backoff_scope,
        }
    }
}

enum Attempt {
    Success(String),
    RateLimited,
    Failed(TutorError),
}

/// Current delay for one call, either shared through the store or local.
enum Backoff<'a> {
    Shared(&'a Store),
    PerCall { delay: Duration, initial: Duration },
}

impl<'a> Backoff<'a> {
    fn new(store: &'a Store, scope: BackoffScope) -> Self {
        match scope {
            BackoffScope::Shared => Self::Shared(store),
            BackoffScope::PerCall => {
                let initial = store.initial_retry_delay();
                Self::PerCall {
                    delay: initial,
                    initial,
                }
            }
        }
    }

    fn current(&self) -> Duration {
        match self {
            Self::Shared(store) => store.retry_delay(),
            Self::PerCall { delay, .. } => *delay,
        }
    }

    fn grow(&mut self, multiplier: u32) {
        match self {
            Self::Shared(store) => {
                store.increase_retry_delay(multiplier);
            }
            Self::PerCall { delay, .. } => *delay = delay.saturating_mul(multiplier),
        }
    }

    fn reset(&mut self) {
        match self {
            Self::Shared(store) => store.reset_retry_delay(),
            Self::PerCall { delay, initial } => *delay = *initial,
        }
    }
}

/// Completion client with retry, backoff and response validation.
pub struct CompletionClient {
    transport: Arc<dyn CompletionTransport>,
    store: Arc<Store>,
    policy: RetryPolicy,
    messages: LoadingMessages,
}

impl CompletionClient {
    /// Creates a client.
    #[must_use]
    pub fn new(
        transport: Arc<dyn CompletionTransport>,
        store: Arc<Store>,
        policy: RetryPolicy,
        messages: LoadingMessages,
    ) -> Self {
        Self {
            transport,
            store,
            policy,
            messages,
        }
    }

    /// Creates a client using the session configuration.
    #[must_use]
    pub fn from_config(
        transport: Arc<dyn CompletionTransport>,
        store: Arc<Store>,
        config: &Config,
    ) -> Self {
        Self::new(
            transport,
            store,
            RetryPolicy::from(&config.api),
            config.loading_messages.clone(),
        )
    }

    /// Completes `request`, answering with [`DEFAULT_APOLOGY`] on any failure.
    pub async fn complete(&self, request: CompletionRequest) -> String {
        self.try_complete(request).await.unwrap_or_else(|err| {
            warn!(error = %err, "Completion gave up, answering with apology");
            DEFAULT_APOLOGY.to_string()
        })
    }

    /// Completes `request`.
    ///
    /// The loading indicator is active for the whole call and cleared exactly
    /// once. The history is read, never written.
    ///
    /// # Errors
    ///
    /// Returns `TutorError::RetriesExhausted` when the attempt budget ran out
    /// on rate limits, or `TutorError::ConnectionFailed` when the final
    /// attempt failed for any other reason.
    #[instrument(skip(self, request), fields(purpose = ?request.purpose, role = ?request.role))]
    pub async fn try_complete(&self, request: CompletionRequest) -> Result<String> {
        let history = self.store.history();
        let prompt = Turn::new(request.role, request.prompt);
        let payload = GenerateRequest::from_history(history.turns(), &prompt);

        self.store
            .set_loading(true, self.loading_message(request.purpose));

        let mut backoff = Backoff::new(&self.store, self.policy.scope);
        let max_attempts = self.policy.max_attempts;

        for attempt in 1..=max_attempts {
            match self.attempt(&payload).await {
                Attempt::Success(text) => {
                    self.store.set_loading(false, "");
                    backoff.reset();
                    info!(attempt, chars = text.len(), "Completion received");
                    return Ok(text);
                }
                Attempt::RateLimited => {
                    let delay = backoff.current();
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        "API rate limit exceeded. Retrying..."
                    );
                    tokio::time::sleep(delay).await;
                    backoff.grow(self.policy.multiplier);
                }
                Attempt::Failed(err) => {
                    error!(
                        attempt,
                        transient = err.is_transient(),
                        error = %err,
                        "Error calling completion service"
                    );
                    if attempt == max_attempts {
                        self.store.set_loading(false, "");
                        return Err(TutorError::connection_failed(attempt, err.to_string()));
                    }
                    tokio::time::sleep(backoff.current()).await;
                    backoff.grow(self.policy.multiplier);
                }
            }
        }

        self.store.set_loading(false, "");
        Err(TutorError::RetriesExhausted {
            attempts: max_attempts,
        })
    }

    async fn attempt(&self, payload: &GenerateRequest) -> Attempt {
        let response = match self.transport.send(payload).await {
            Ok(response) => response,
            Err(err) => return Attempt::Failed(err),
        };

        if response.status == 429 {
            return Attempt::RateLimited;
        }

        if !response.is_success() {
            return Attempt::Failed(TutorError::llm_api_error(
                LlmErrorKind::from_status(response.status),
                format!("API returned status code {}", response.status),
            ));
        }

        match CompletionReply::parse(&response.body) {
            CompletionReply::Candidate(text) => Attempt::Success(text),
            CompletionReply::Malformed(reason) => Attempt::Failed(TutorError::llm_api_error(
                LlmErrorKind::MalformedResponse,
                reason,
            )),
        }
    }

    fn loading_message(&self, purpose: Purpose) -> &str {
        match purpose {
            Purpose::Exercise => &self.messages.generating_exercise,
            Purpose::Lesson | Purpose::Chat | Purpose::Feedback => {
                &self.messages.generating_content
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::conversation::Conversation;
    use crate::store::{StateKey, StateValue};
    use crate::wire::TransportResponse;

    /// One scripted exchange.
    #[derive(Debug, Clone)]
    pub enum Step {
        Reply(u16, String),
        Drop,
        /// Answers with the inner step after a delay.
        Delayed(Duration, Box<Step>),
    }

    impl Step {
        pub fn text(text: &str) -> Self {
            let body = serde_json::json!({
                "candidates": [{"content": {"role": "model", "parts": [{"text": text}]}}]
            });
            Self::Reply(200, body.to_string())
        }

        pub fn status(status: u16) -> Self {
            Self::Reply(status, "{}".to_string())
        }

        pub fn after(self, delay: Duration) -> Self {
            Self::Delayed(delay, Box::new(self))
        }
    }

    /// Transport that replays a script and records what it was sent.
    #[derive(Default)]
    pub struct ScriptedTransport {
        steps: Mutex<VecDeque<Step>>,
        pub requests: Mutex<Vec<GenerateRequest>>,
        pub sent_at: Mutex<Vec<Instant>>,
    }

    impl ScriptedTransport {
        pub fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into_iter().collect()),
                ..Default::default()
            })
        }

        pub fn push(&self, step: Step) {
            self.steps.lock().unwrap().push_back(step);
        }

        pub fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        pub fn gaps(&self) -> Vec<Duration> {
            let sent_at = self.sent_at.lock().unwrap();
            sent_at.windows(2).map(|w| w[1] - w[0]).collect()
        }
    }

    #[async_trait]
    impl CompletionTransport for ScriptedTransport {
        async fn send(&self, request: &GenerateRequest) -> Result<TransportResponse> {
            self.requests.lock().unwrap().push(request.clone());
            self.sent_at.lock().unwrap().push(Instant::now());
            let mut step = self
                .steps
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Step::status(500));
            while let Step::Delayed(delay, inner) = step {
                tokio::time::sleep(delay).await;
                step = *inner;
            }
            match step {
                Step::Reply(status, body) => Ok(TransportResponse::new(status, body)),
                Step::Drop => Err(TutorError::llm_api_error(
                    LlmErrorKind::Network,
                    "connection reset",
                )),
                Step::Delayed(..) => unreachable!("delays are unwrapped above"),
            }
        }
    }

    fn client_with(
        transport: &Arc<ScriptedTransport>,
        scope: BackoffScope,
    ) -> (CompletionClient, Arc<Store>) {
        let store = Arc::new(Store::new(
            Conversation::new(50, 25),
            Duration::from_millis(1000),
        ));
        let policy = RetryPolicy {
            max_attempts: 5,
            multiplier: 2,
            scope,
        };
        let transport: Arc<dyn CompletionTransport> = transport.clone();
        let client = CompletionClient::new(
            transport,
            Arc::clone(&store),
            policy,
            LoadingMessages::default(),
        );
        (client, store)
    }

    /// Two clients over separate scripts sharing one store.
    fn shared_pair(
        a: &Arc<ScriptedTransport>,
        b: &Arc<ScriptedTransport>,
    ) -> (CompletionClient, CompletionClient, Arc<Store>) {
        let (first, store) = client_with(a, BackoffScope::Shared);
        let transport: Arc<dyn CompletionTransport> = b.clone();
        let second = CompletionClient::new(
            transport,
            Arc::clone(&store),
            first.policy,
            LoadingMessages::default(),
        );
        (first, second, store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_success_resets_shared_delay() {
        let transport = ScriptedTransport::new([Step::text("Hello")]);
        let (client, store) = client_with(&transport, BackoffScope::Shared);
        store.increase_retry_delay(2);
        store.increase_retry_delay(2);
        assert_eq!(store.retry_delay(), Duration::from_secs(4));

        let text = client.complete(CompletionRequest::new("hi")).await;

        assert_eq!(text, "Hello");
        assert_eq!(store.retry_delay(), Duration::from_secs(1));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limits_back_off_exponentially() {
        let transport = ScriptedTransport::new([
            Step::status(429),
            Step::status(429),
            Step::status(429),
            Step::text("Finally"),
        ]);
        let (client, store) = client_with(&transport, BackoffScope::Shared);

        let text = client.complete(CompletionRequest::new("hi")).await;

        assert_eq!(text, "Finally");
        assert_eq!(
            transport.gaps(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        assert_eq!(store.retry_delay(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_explain_loops_single_backoff() {
        let transport = ScriptedTransport::new([Step::status(429), Step::text("Loops repeat code.")]);
        let (client, store) = client_with(&transport, BackoffScope::Shared);

        let text = client
            .complete(CompletionRequest::new("Explain loops"))
            .await;

        assert_eq!(text, "Loops repeat code.");
        assert_eq!(transport.gaps(), vec![Duration::from_secs(1)]);
        assert_eq!(store.retry_delay(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_exhaust_budget_with_apology() {
        let transport = ScriptedTransport::new(std::iter::repeat(Step::status(500)).take(5));
        let (client, store) = client_with(&transport, BackoffScope::Shared);

        let text = client.complete(CompletionRequest::new("hi")).await;

        assert_eq!(text, DEFAULT_APOLOGY);
        assert_eq!(transport.calls(), 5);
        // No wait after the final attempt
        assert_eq!(transport.gaps().len(), 4);
        assert!(!store.loading().active);
        // Delay only resets on success
        assert_eq!(store.retry_delay(), Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_complete_reports_connection_failure() {
        let transport = ScriptedTransport::new([
            Step::Drop,
            Step::status(503),
            Step::Reply(200, "{}".to_string()),
            Step::status(400),
            Step::Drop,
        ]);
        let (client, _store) = client_with(&transport, BackoffScope::Shared);

        let err = assert_err!(client.try_complete(CompletionRequest::new("hi")).await);

        assert!(matches!(err, TutorError::ConnectionFailed { attempts: 5, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_complete_reports_rate_limit_exhaustion() {
        let transport = ScriptedTransport::new(std::iter::repeat(Step::status(429)).take(5));
        let (client, store) = client_with(&transport, BackoffScope::Shared);

        let err = assert_err!(client.try_complete(CompletionRequest::new("hi")).await);

        assert!(matches!(err, TutorError::RetriesExhausted { attempts: 5 }));
        assert_eq!(transport.gaps().len(), 4);
        assert!(!store.loading().active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_reply_is_retried() {
        let transport = ScriptedTransport::new([
            Step::Reply(200, r#"{"candidates": []}"#.to_string()),
            Step::text("Recovered"),
        ]);
        let (client, _store) = client_with(&transport, BackoffScope::Shared);

        let text = client.complete(CompletionRequest::new("hi")).await;

        assert_eq!(text, "Recovered");
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loading_is_set_then_cleared_once() {
        let transport = ScriptedTransport::new([Step::status(429), Step::text("ok")]);
        let (client, store) = client_with(&transport, BackoffScope::Shared);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = store.subscribe(StateKey::Loading, move |value| {
            if let StateValue::Loading(status) = value {
                sink.lock().unwrap().push(status.clone());
            }
            Ok(())
        });

        client
            .complete(CompletionRequest::new("hi").with_purpose(Purpose::Exercise))
            .await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].active);
        assert_eq!(seen[0].message, "Generating a new exercise...");
        assert!(!seen[1].active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_payload_carries_history_without_mutating_it() {
        let transport = ScriptedTransport::new([Step::text("Sure")]);
        let (client, store) = client_with(&transport, BackoffScope::Shared);
        store.append_turn(Turn::responder("Welcome!"));
        store.append_turn(Turn::user("What is a tuple?"));

        client
            .complete(CompletionRequest::new("What is a tuple?"))
            .await;

        let requests = transport.requests.lock().unwrap();
        let roles: Vec<_> = requests[0].contents.iter().map(|c| c.role.as_str()).collect();
        assert_eq!(roles, ["model", "user", "user"]);
        assert_eq!(store.history().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompt_role_is_sent() {
        let transport = ScriptedTransport::new([Step::text("ok")]);
        let (client, _store) = client_with(&transport, BackoffScope::Shared);

        client
            .complete(CompletionRequest::new("context note").with_role(Role::Responder))
            .await;

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[0].contents.last().unwrap().role, "model");
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_call_scope_leaves_shared_delay_alone() {
        let transport = ScriptedTransport::new([
            Step::status(429),
            Step::status(429),
            Step::text("ok"),
        ]);
        let (client, store) = client_with(&transport, BackoffScope::PerCall);
        store.increase_retry_delay(2);

        let text = client.complete(CompletionRequest::new("hi")).await;

        assert_eq!(text, "ok");
        assert_eq!(
            transport.gaps(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
        assert_eq!(store.retry_delay(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_complete_returns_reply_text() {
        let transport = ScriptedTransport::new([Step::status(503), Step::text("Lists are mutable.")]);
        let (client, _store) = client_with(&transport, BackoffScope::Shared);

        let text = assert_ok!(client.try_complete(CompletionRequest::new("hi")).await);

        assert_eq!(text, "Lists are mutable.");
        assert_eq!(transport.gaps(), vec![Duration::from_secs(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_delay_grows_from_other_calls() {
        // B is rate limited first and its retry is slow to answer, so its
        // growth lands before A reads the delay for A's second wait
        let a = ScriptedTransport::new([Step::status(429), Step::status(429), Step::text("a")]);
        let b = ScriptedTransport::new([
            Step::status(429),
            Step::text("b").after(Duration::from_secs(2)),
        ]);
        let (client_a, client_b, store) = shared_pair(&a, &b);

        let (reply_a, reply_b) = tokio::join!(
            async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                client_a.complete(CompletionRequest::new("one")).await
            },
            client_b.complete(CompletionRequest::new("two")),
        );

        assert_eq!(reply_a, "a");
        assert_eq!(reply_b, "b");
        assert_eq!(b.gaps(), vec![Duration::from_secs(1)]);
        // 1s, then 4s: B's growth to 2s plus A's own growth
        assert_eq!(
            a.gaps(),
            vec![Duration::from_secs(1), Duration::from_secs(4)]
        );
        assert_eq!(store.retry_delay(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_delay_reset_by_other_call_success() {
        // B succeeds at 1s, before A grows the delay at 1.5s
        let a = ScriptedTransport::new([Step::status(429), Step::status(429), Step::text("a")]);
        let b = ScriptedTransport::new([Step::status(429), Step::text("b")]);
        let (client_a, client_b, store) = shared_pair(&a, &b);

        let (reply_a, reply_b) = tokio::join!(
            async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                client_a.complete(CompletionRequest::new("one")).await
            },
            client_b.complete(CompletionRequest::new("two")),
        );

        assert_eq!(reply_a, "a");
        assert_eq!(reply_b, "b");
        // Without B's reset A would have waited 4s the second time
        assert_eq!(
            a.gaps(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
        assert_eq!(store.retry_delay(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempt_logs_transience() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let transport = ScriptedTransport::new([
            Step::status(401),
            Step::status(503),
            Step::text("ok"),
        ]);
        let (client, _store) = client_with(&transport, BackoffScope::Shared);
        client.complete(CompletionRequest::new("hi")).await;

        let output = logs.contents();
        let failures: Vec<&str> = output
            .lines()
            .filter(|line| line.contains("Error calling completion service"))
            .collect();
        assert_eq!(failures.len(), 2);
        assert!(failures[0].contains("transient=false"));
        assert!(failures[1].contains("transient=true"));
    }

    /// Log sink for a `fmt` subscriber.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }
}
