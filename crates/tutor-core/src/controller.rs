//! Workflow orchestration for the tutoring session.
//!
//! The [`Controller`] sequences the user-facing workflows on top of the
//! [`Store`], the [`CompletionClient`], an [`ExecutionEngine`] and a
//! [`Renderer`]:
//!
//! - bootstrap: initialize the engine, then generate the first lesson;
//! - lesson generation and harder-exercise generation, which reset the
//!   conversation;
//! - chat turns;
//! - run code, then ask the tutor for feedback on the result;
//! - reset and status.
//!
//! Every workflow except [`Controller::initialize`] absorbs its failures as a
//! notice plus a log line. Workflows may run concurrently; replies are
//! appended to the history in the order they arrive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::client::{CompletionClient, CompletionRequest, Purpose, DEFAULT_APOLOGY};
use crate::config::Config;
use crate::conversation::Turn;
use crate::engine::ExecutionEngine;
use crate::error::{Result, TutorError};
use crate::lesson::{self, FeedbackRequest};
use crate::render::{Renderer, TUTOR_SENDER, USER_SENDER};
use crate::store::Store;

/// Notice title for bootstrap failures.
pub const INIT_ERROR_TITLE: &str = "Initialization Error";

/// Notice title for absorbed workflow failures.
pub const ERROR_TITLE: &str = "Error";

/// Notice title when code is run before the engine is ready.
pub const ENGINE_NOT_READY_TITLE: &str = "Python environment not ready";

/// Notice shown when code is run before the engine is ready.
pub const ENGINE_NOT_READY_MESSAGE: &str =
    "The Python environment is still loading. Please wait a moment.";

/// Notice shown when the completion service cannot be reached.
pub const API_CONNECTION_MESSAGE: &str = "Could not connect to the AI tutor. Please try again.";

/// Console text for an empty editor.
pub const EMPTY_CODE_MESSAGE: &str = "Please enter some code to run.";

/// Console text for a successful run without output.
pub const NO_OUTPUT_MESSAGE: &str = "Code executed successfully, no output.";

const LESSON_FAILED: &str = "Failed to generate lesson. Please refresh the page.";
const EXERCISE_FAILED: &str = "Failed to generate new exercise. Please try again.";
const CHAT_FAILED: &str = "Failed to send message. Please try again.";
const FEEDBACK_FAILED: &str = "Failed to get tutor feedback. Please try again.";

/// Session status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    /// Bootstrap completed.
    pub initialized: bool,
    /// The execution engine is ready.
    pub engine_ready: bool,
    /// A long operation is in flight.
    pub loading: bool,
    /// Number of turns in the conversation.
    pub history_len: usize,
}

/// Sequences the session workflows.
pub struct Controller {
    config: Config,
    store: Arc<Store>,
    client: Arc<CompletionClient>,
    engine: Arc<dyn ExecutionEngine>,
    renderer: Arc<dyn Renderer>,
    initialized: AtomicBool,
}

impl Controller {
    /// Wires a controller from its collaborators.
    #[must_use]
    pub fn new(
        config: Config,
        store: Arc<Store>,
        client: Arc<CompletionClient>,
        engine: Arc<dyn ExecutionEngine>,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        Self {
            config,
            store,
            client,
            engine,
            renderer,
            initialized: AtomicBool::new(false),
        }
    }

    /// Returns the session store.
    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    // ========================================================================
    // Bootstrap
    // ========================================================================

    /// Initializes the engine, then generates the first lesson.
    ///
    /// # Errors
    ///
    /// Returns the engine's error when it cannot be initialized. The failure
    /// is also shown as a blocking notice; the session is unusable.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<()> {
        info!("Initializing tutor session");
        self.store
            .set_loading(true, &self.config.loading_messages.initializing);

        if let Err(err) = self.engine.initialize().await {
            self.store.set_loading(false, "");
            error!(error = %err, "Failed to initialize session");
            self.renderer.show_notice(INIT_ERROR_TITLE, &err.to_string());
            return Err(err);
        }

        self.store.set_engine_ready(true);
        self.store.set_loading(false, "");

        self.generate_lesson(None).await;

        self.initialized.store(true, Ordering::SeqCst);
        info!("Tutor session initialized");
        Ok(())
    }

    // ========================================================================
    // Lesson and exercise generation
    // ========================================================================

    /// Generates a lesson on `topic` (default topic when `None`) and starts a
    /// fresh conversation seeded with the welcome turn and the lesson.
    #[instrument(skip(self))]
    pub async fn generate_lesson(&self, topic: Option<&str>) {
        let topic = topic
            .map(str::trim)
            .filter(|topic| !topic.is_empty())
            .unwrap_or(self.config.lesson.default_topic.as_str());

        if let Err(err) = self.try_generate_lesson(topic).await {
            error!(error = %err, "Failed to generate lesson");
            self.renderer.show_notice(ERROR_TITLE, LESSON_FAILED);
        }
    }

    async fn try_generate_lesson(&self, topic: &str) -> Result<()> {
        let prompt = lesson::lesson_prompt(&self.config.lesson.prompt_template, topic);
        let lesson = self
            .request(CompletionRequest::new(prompt).with_purpose(Purpose::Lesson))
            .await?;

        let welcome = &self.config.chat.welcome_message;
        self.store.set_current_lesson(lesson.clone());
        self.renderer.set_course_content(&lesson);
        self.renderer.clear_conversation();

        self.store.clear_history();
        self.store.append_turn(Turn::responder(welcome.clone()));
        self.store.append_turn(Turn::responder(lesson));

        self.renderer
            .append_conversation_entry(TUTOR_SENDER, welcome, false);
        info!(topic, "Lesson generated");
        Ok(())
    }

    /// Generates a harder exercise on the current topic and restarts the
    /// conversation with a single "new challenge" turn.
    #[instrument(skip(self))]
    pub async fn new_exercise(&self) {
        if let Err(err) = self.try_new_exercise().await {
            error!(error = %err, "Failed to generate new exercise");
            self.renderer.show_notice(ERROR_TITLE, EXERCISE_FAILED);
        }
    }

    async fn try_new_exercise(&self) -> Result<()> {
        let topic = lesson::extract_topic(&self.renderer.course_content())
            .unwrap_or_else(|| self.config.lesson.default_topic.clone());
        debug!(topic = %topic, "Requesting harder exercise");

        let prompt = lesson::exercise_prompt(&self.config.lesson.exercise_prompt_template, &topic);
        let exercise = self
            .request(CompletionRequest::new(prompt).with_purpose(Purpose::Exercise))
            .await?;

        let message = &self.config.chat.new_exercise_message;
        self.renderer.set_course_content(&exercise);
        self.store.set_current_lesson(exercise);
        self.renderer.clear_conversation();

        self.store.clear_history();
        self.store.append_turn(Turn::responder(message.clone()));

        self.renderer
            .append_conversation_entry(TUTOR_SENDER, message, false);
        Ok(())
    }

    // ========================================================================
    // Chat
    // ========================================================================

    /// Sends the pending chat input and appends the tutor's reply.
    ///
    /// Blank input is ignored.
    #[instrument(skip(self))]
    pub async fn send_chat(&self) {
        let input = self.renderer.chat_input();
        let message = input.trim();
        if message.is_empty() {
            return;
        }

        self.renderer
            .append_conversation_entry(USER_SENDER, message, true);
        self.store.append_turn(Turn::user(message));
        self.renderer.clear_chat_input();
        let sent_version = self.store.history_version();

        match self
            .request(CompletionRequest::new(message).with_purpose(Purpose::Chat))
            .await
        {
            Ok(reply) => {
                let version = self.store.history_version();
                if version != sent_version {
                    debug!(
                        sent_version,
                        version, "Conversation changed while awaiting reply"
                    );
                }
                self.append_tutor_reply(reply);
            }
            Err(err) => {
                error!(error = %err, "Failed to send chat message");
                self.renderer.show_notice(ERROR_TITLE, CHAT_FAILED);
            }
        }
    }

    // ========================================================================
    // Run code
    // ========================================================================

    /// Runs the editor contents and asks the tutor for feedback.
    #[instrument(skip(self))]
    pub async fn run_code(&self) {
        let code = self.renderer.code_input();
        if code.trim().is_empty() {
            self.renderer.set_console_output(EMPTY_CODE_MESSAGE, true);
            return;
        }

        if !self.engine.ready() {
            self.renderer
                .show_notice(ENGINE_NOT_READY_TITLE, ENGINE_NOT_READY_MESSAGE);
            return;
        }

        self.renderer.set_console_output("", false);
        self.store
            .set_loading(true, &self.config.loading_messages.running_code);
        let outcome = self.engine.execute(&code).await;
        self.store.set_loading(false, "");

        let feedback = match outcome {
            Ok(result) if result.success => {
                let shown = if result.stdout.is_empty() {
                    NO_OUTPUT_MESSAGE
                } else {
                    result.stdout.as_str()
                };
                self.renderer.set_console_output(shown, false);
                let stdout = result.stdout.clone();
                self.store.set_execution_output(result);
                FeedbackRequest::Output(stdout)
            }
            Ok(result) => {
                self.renderer.set_console_output(&result.stderr, true);
                self.store.set_execution_error(result.stderr.clone());
                FeedbackRequest::Error(result.stderr)
            }
            Err(err) => {
                let message = err.to_string();
                warn!(error = %message, "Execution engine failed");
                self.renderer
                    .set_console_output(&format!("Error: {message}"), true);
                self.store.set_execution_error(message.clone());
                FeedbackRequest::Error(message)
            }
        };

        self.send_feedback(&code, &feedback).await;
    }

    async fn send_feedback(&self, code: &str, feedback: &FeedbackRequest) {
        let prompt = lesson::feedback_prompt(
            &self.config.tutor.prompt_template,
            code,
            Some(&feedback.describe()),
        );

        match self
            .request(CompletionRequest::new(prompt).with_purpose(Purpose::Feedback))
            .await
        {
            Ok(reply) => self.append_tutor_reply(reply),
            Err(err) => {
                error!(error = %err, "Failed to get tutor feedback");
                self.renderer.show_notice(ERROR_TITLE, FEEDBACK_FAILED);
            }
        }
    }

    // ========================================================================
    // Reset and status
    // ========================================================================

    /// Resets the engine and clears conversation, console and editor.
    #[instrument(skip(self))]
    pub async fn reset(&self) {
        if let Err(err) = self.engine.reset().await {
            error!(error = %err, "Failed to reset execution engine");
        }
        self.store.clear_history();
        self.renderer.clear_conversation();
        self.renderer.set_console_output("", false);
        self.renderer.set_code_input("");
        info!("Session state reset");
    }

    /// Reports the session status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            initialized: self.initialized.load(Ordering::SeqCst),
            engine_ready: self.engine.ready(),
            loading: self.store.loading().active,
            history_len: self.store.history().len(),
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Requests a completion, mapping rate-limit exhaustion to the apology
    /// and a final connection failure to a notice plus the error.
    async fn request(&self, request: CompletionRequest) -> Result<String> {
        match self.client.try_complete(request).await {
            Ok(text) => Ok(text),
            Err(TutorError::RetriesExhausted { attempts }) => {
                warn!(attempts, "Rate limit persisted, answering with apology");
                Ok(DEFAULT_APOLOGY.to_string())
            }
            Err(err) => {
                self.renderer.show_notice(ERROR_TITLE, API_CONNECTION_MESSAGE);
                Err(err)
            }
        }
    }

    fn append_tutor_reply(&self, reply: String) {
        self.renderer
            .append_conversation_entry(TUTOR_SENDER, &reply, false);
        self.store.append_turn(Turn::responder(reply));
    }
}
