//! Configuration types for the Tutor client.
//!
//! This module provides all configuration structures used to control the
//! tutoring session: completion-service access and retry policy, chat
//! history bounds, prompt templates, sandbox settings and user-facing
//! loading messages.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TutorError};

/// The default config file name.
const CONFIG_FILE_NAME: &str = "tutor.json";

/// Environment variables consulted, in order, when no API key is configured.
pub const API_KEY_ENV_VARS: [&str; 2] = ["TUTOR_API_KEY", "GEMINI_API_KEY"];

/// Default completion endpoint.
fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent"
        .to_string()
}

/// Default number of attempts per completion call.
const fn default_max_attempts() -> u32 {
    5
}

/// Default first backoff delay in milliseconds.
const fn default_initial_retry_delay_ms() -> u64 {
    1000
}

/// Default backoff growth factor.
const fn default_retry_multiplier() -> u32 {
    2
}

/// Default HTTP request timeout in seconds.
const fn default_request_timeout_secs() -> u64 {
    120
}

/// Default conversation history cap.
const fn default_max_history() -> usize {
    50
}

/// Default number of turns kept after the cap is exceeded.
const fn default_retain_on_overflow() -> usize {
    25
}

fn default_welcome_message() -> String {
    "Hello! Welcome to your Python course. I'm your AI tutor. Ask me anything!".to_string()
}

fn default_new_exercise_message() -> String {
    "Okay, here's a new challenge for you! Let me know if you need any help.".to_string()
}

fn default_topic() -> String {
    "variables, data types, and basic operations".to_string()
}

fn default_lesson_template() -> String {
    crate::lesson::DEFAULT_LESSON_TEMPLATE.to_string()
}

fn default_exercise_template() -> String {
    crate::lesson::DEFAULT_EXERCISE_TEMPLATE.to_string()
}

fn default_tutor_template() -> String {
    crate::lesson::DEFAULT_TUTOR_TEMPLATE.to_string()
}

/// Default sandbox image.
fn default_sandbox_image() -> String {
    "python:3.12-alpine".to_string()
}

/// Default per-run timeout in seconds.
const fn default_run_timeout_secs() -> u64 {
    10
}

fn default_initializing_message() -> String {
    "Initializing Python environment...".to_string()
}

fn default_generating_content_message() -> String {
    "Generating content...".to_string()
}

fn default_generating_exercise_message() -> String {
    "Generating a new exercise...".to_string()
}

fn default_running_code_message() -> String {
    "Running your code...".to_string()
}

/// Default preferences file path.
fn default_preferences_file() -> String {
    ".tutor/preferences.json".to_string()
}

/// Main configuration for a tutoring session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Completion-service access and retry policy.
    #[serde(default)]
    pub api: ApiConfig,

    /// Conversation history bounds and fixed chat messages.
    #[serde(default)]
    pub chat: ChatConfig,

    /// Lesson and exercise prompt settings.
    #[serde(default)]
    pub lesson: LessonConfig,

    /// Tutor feedback prompt settings.
    #[serde(default)]
    pub tutor: TutorConfig,

    /// Python sandbox settings.
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Messages shown while a long operation is in progress.
    #[serde(default)]
    pub loading_messages: LoadingMessages,

    /// Path to the persisted preferences file.
    #[serde(default = "default_preferences_file")]
    pub preferences_file: String,
}

impl Config {
    /// Loads configuration from the current working directory.
    ///
    /// Looks for `tutor.json` in the current directory. If not found, returns
    /// default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but contains invalid JSON.
    pub fn load() -> Result<Self> {
        let current_dir = std::env::current_dir().map_err(|e| {
            TutorError::config_parse(
                "<current directory>",
                format!("cannot determine current directory: {e}"),
            )
        })?;
        Self::load_from_dir(&current_dir)
    }

    /// Loads configuration from `tutor.json` inside a specific directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but contains invalid JSON.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        Self::load_from_file(&dir.join(CONFIG_FILE_NAME))
    }

    /// Loads configuration from a specific file path.
    ///
    /// If the file does not exist, returns default configuration.
    ///
    /// # Errors
    ///
    /// Returns `TutorError::ConfigParseError` if the file exists but contains
    /// invalid JSON or invalid enum values.
    ///
    /// Returns `TutorError::ConfigValidationError` if the configuration values
    /// are invalid (e.g., zero attempts, retention larger than the cap).
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.validate()?;
                return Ok(config);
            }
            Err(e) => {
                return Err(TutorError::config_parse(
                    path,
                    format!("failed to read file: {e}"),
                ));
            }
        };

        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| TutorError::config_parse(path, e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `TutorError::ConfigValidationError` if any validation check fails.
    pub fn validate(&self) -> Result<()> {
        if self.api.base_url.trim().is_empty() {
            return Err(TutorError::config_validation(
                "api.baseUrl must not be empty",
                "Set api.baseUrl to the completion endpoint in your tutor.json",
            ));
        }

        if self.api.max_attempts == 0 {
            return Err(TutorError::config_validation(
                "api.maxAttempts must be greater than 0",
                "Set api.maxAttempts to at least 1 in your tutor.json",
            ));
        }

        if self.api.initial_retry_delay_ms == 0 {
            return Err(TutorError::config_validation(
                "api.initialRetryDelayMs must be greater than 0",
                "Set api.initialRetryDelayMs to at least 1 in your tutor.json",
            ));
        }

        if self.api.retry_multiplier == 0 {
            return Err(TutorError::config_validation(
                "api.retryMultiplier must be greater than 0",
                "Set api.retryMultiplier to 1 (constant delay) or more in your tutor.json",
            ));
        }

        if self.api.request_timeout_secs == 0 {
            return Err(TutorError::config_validation(
                "api.requestTimeoutSecs must be greater than 0",
                "Set api.requestTimeoutSecs to at least 1 second in your tutor.json",
            ));
        }

        if self.chat.max_history == 0 {
            return Err(TutorError::config_validation(
                "chat.maxHistory must be greater than 0",
                "Set chat.maxHistory to at least 1 in your tutor.json",
            ));
        }

        if self.chat.retain_on_overflow == 0 || self.chat.retain_on_overflow > self.chat.max_history
        {
            return Err(TutorError::config_validation(
                format!(
                    "chat.retainOnOverflow must be between 1 and chat.maxHistory ({})",
                    self.chat.max_history
                ),
                "Lower chat.retainOnOverflow or raise chat.maxHistory in your tutor.json",
            ));
        }

        if !self.lesson.prompt_template.contains("{topic}") {
            return Err(TutorError::config_validation(
                "lesson.promptTemplate must contain the {topic} placeholder",
                "Add {topic} where the lesson topic belongs in lesson.promptTemplate",
            ));
        }

        if !self.lesson.exercise_prompt_template.contains("{topic}") {
            return Err(TutorError::config_validation(
                "lesson.exercisePromptTemplate must contain the {topic} placeholder",
                "Add {topic} where the lesson topic belongs in lesson.exercisePromptTemplate",
            ));
        }

        if !self.tutor.prompt_template.contains("{code}") {
            return Err(TutorError::config_validation(
                "tutor.promptTemplate must contain the {code} placeholder",
                "Add {code} where the student's code belongs in tutor.promptTemplate",
            ));
        }

        if self.sandbox.image.trim().is_empty() {
            return Err(TutorError::config_validation(
                "sandbox.image must not be empty",
                "Provide a Python image such as 'python:3.12-alpine' in your tutor.json",
            ));
        }

        if self.sandbox.run_timeout_secs == 0 {
            return Err(TutorError::config_validation(
                "sandbox.runTimeoutSecs must be greater than 0",
                "Set sandbox.runTimeoutSecs to at least 1 second in your tutor.json",
            ));
        }

        if self.preferences_file.trim().is_empty() {
            return Err(TutorError::config_validation(
                "preferencesFile must not be empty",
                "Provide a valid preferences file path in your tutor.json",
            ));
        }

        Ok(())
    }
}

/// Completion-service access and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    /// Endpoint URL; the API key is appended as the `key` query parameter.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API credential. Falls back to [`API_KEY_ENV_VARS`] when absent.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,

    /// Attempts per completion call, rate-limited attempts included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay in milliseconds.
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,

    /// Factor applied to the delay after every failed attempt.
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: u32,

    /// HTTP request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Whether concurrent calls share one backoff delay.
    #[serde(default)]
    pub backoff_scope: BackoffScope,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            max_attempts: default_max_attempts(),
            initial_retry_delay_ms: default_initial_retry_delay_ms(),
            retry_multiplier: default_retry_multiplier(),
            request_timeout_secs: default_request_timeout_secs(),
            backoff_scope: BackoffScope::default(),
        }
    }
}

impl ApiConfig {
    /// Returns the first backoff delay.
    #[must_use]
    pub const fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }

    /// Returns the HTTP request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Resolves the API key from configuration or the environment.
    ///
    /// Blank values are treated as absent.
    #[must_use]
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| {
                API_KEY_ENV_VARS.iter().find_map(|name| {
                    std::env::var(name)
                        .ok()
                        .filter(|key| !key.trim().is_empty())
                })
            })
    }
}

/// How the retry delay is shared between concurrent completion calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackoffScope {
    /// One delay owned by the store and shared by every call (default).
    #[default]
    Shared,
    /// Each call starts from the initial delay and keeps its own.
    PerCall,
}

impl BackoffScope {
    /// Parses a string into a `BackoffScope`, case-insensitively.
    fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "shared" => Some(Self::Shared),
            "percall" | "per-call" | "per_call" => Some(Self::PerCall),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for BackoffScope {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str_case_insensitive(&s).ok_or_else(|| {
            serde::de::Error::custom(format!(
                "invalid backoff scope '{s}': expected one of 'shared', 'perCall'"
            ))
        })
    }
}

impl Serialize for BackoffScope {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let s = match self {
            Self::Shared => "shared",
            Self::PerCall => "perCall",
        };
        serializer.serialize_str(s)
    }
}

/// Conversation history bounds and fixed chat messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatConfig {
    /// Maximum number of turns kept in the history.
    #[serde(default = "default_max_history")]
    pub max_history: usize,

    /// Turns kept, newest first, once the cap is exceeded.
    #[serde(default = "default_retain_on_overflow")]
    pub retain_on_overflow: usize,

    /// First tutor turn after a lesson is generated.
    #[serde(default = "default_welcome_message")]
    pub welcome_message: String,

    /// Only tutor turn after a new exercise is generated.
    #[serde(default = "default_new_exercise_message")]
    pub new_exercise_message: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
            retain_on_overflow: default_retain_on_overflow(),
            welcome_message: default_welcome_message(),
            new_exercise_message: default_new_exercise_message(),
        }
    }
}

/// Lesson and exercise prompt settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonConfig {
    /// Topic used at bootstrap and when no heading can be found.
    #[serde(default = "default_topic")]
    pub default_topic: String,

    /// Lesson prompt; `{topic}` is substituted.
    #[serde(default = "default_lesson_template")]
    pub prompt_template: String,

    /// Harder-exercise prompt; `{topic}` is substituted.
    #[serde(default = "default_exercise_template")]
    pub exercise_prompt_template: String,
}

impl Default for LessonConfig {
    fn default() -> Self {
        Self {
            default_topic: default_topic(),
            prompt_template: default_lesson_template(),
            exercise_prompt_template: default_exercise_template(),
        }
    }
}

/// Tutor feedback prompt settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TutorConfig {
    /// Feedback prompt; `{code}` and `{feedbackRequest}` are substituted.
    #[serde(default = "default_tutor_template")]
    pub prompt_template: String,
}

impl Default for TutorConfig {
    fn default() -> Self {
        Self {
            prompt_template: default_tutor_template(),
        }
    }
}

/// Python sandbox settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    /// Docker image providing `python3`.
    #[serde(default = "default_sandbox_image")]
    pub image: String,

    /// Upper bound for a single code run in seconds.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,

    /// Keep the container after the session ends (for debugging).
    #[serde(default)]
    pub keep_container: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: default_sandbox_image(),
            run_timeout_secs: default_run_timeout_secs(),
            keep_container: false,
        }
    }
}

impl SandboxConfig {
    /// Returns the per-run timeout.
    #[must_use]
    pub const fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

/// Messages shown while a long operation is in progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadingMessages {
    /// Shown while the execution engine starts.
    #[serde(default = "default_initializing_message")]
    pub initializing: String,

    /// Shown while a lesson, chat reply or feedback is requested.
    #[serde(default = "default_generating_content_message")]
    pub generating_content: String,

    /// Shown while a harder exercise is requested.
    #[serde(default = "default_generating_exercise_message")]
    pub generating_exercise: String,

    /// Shown while student code runs.
    #[serde(default = "default_running_code_message")]
    pub running_code: String,
}

impl Default for LoadingMessages {
    fn default() -> Self {
        Self {
            initializing: default_initializing_message(),
            generating_content: default_generating_content_message(),
            generating_exercise: default_generating_exercise_message(),
            running_code: default_running_code_message(),
        }
    }
}
