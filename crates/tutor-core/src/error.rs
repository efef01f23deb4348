//! Error types for the Tutor client core.
//!
//! This module defines the error hierarchy for configuration loading,
//! completion-service exchanges, execution-engine calls and preference
//! persistence.

use std::path::PathBuf;

/// A specialized `Result` type for Tutor core operations.
pub type Result<T> = std::result::Result<T, TutorError>;

/// Errors that can occur while running a tutoring session.
///
/// Variants are grouped by subsystem and carry an actionable suggestion
/// where the user can do something about the failure.
#[derive(Debug, thiserror::Error)]
pub enum TutorError {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Invalid JSON syntax in the configuration file.
    #[error("Invalid JSON in config file '{path}': {message}\n\nSuggestion: Validate your tutor.json with a JSON linter")]
    ConfigParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Description of the parse error.
        message: String,
    },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}\n\nSuggestion: {suggestion}")]
    ConfigValidationError {
        /// Description of the validation failure.
        message: String,
        /// Actionable suggestion for the user.
        suggestion: String,
    },

    /// No API credential was configured for the completion service.
    #[error("No API key configured for the completion service\n\nSuggestion: Set api.apiKey in tutor.json, pass --api-key, or export TUTOR_API_KEY or GEMINI_API_KEY")]
    MissingApiKey,

    /// The HTTP client for the completion service could not be built.
    #[error("Failed to build HTTP client: {0}")]
    HttpClientBuild(String),

    // ========================================================================
    // Completion Service Errors
    // ========================================================================
    /// A single exchange with the completion service failed.
    #[error("LLM API error ({kind}): {message}\n\nSuggestion: {suggestion}")]
    LlmApiError {
        /// The kind of API error.
        kind: LlmErrorKind,
        /// Detailed error message.
        message: String,
        /// Actionable suggestion for the user.
        suggestion: String,
    },

    /// The final allowed attempt failed with a transport or response error.
    #[error("Could not connect to the AI tutor after {attempts} attempts: {message}\n\nSuggestion: Check your network connection and API key, then try again")]
    ConnectionFailed {
        /// Number of attempts made.
        attempts: u32,
        /// Description of the last failure.
        message: String,
    },

    /// Every allowed attempt was rate limited.
    #[error("Completion service kept rate limiting for all {attempts} attempts\n\nSuggestion: Wait a minute before sending more requests")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
    },

    // ========================================================================
    // Execution Engine Errors
    // ========================================================================
    /// The execution engine has not finished initializing.
    #[error("The Python environment is still loading")]
    EngineNotReady,

    /// The execution engine could not be initialized.
    #[error("Failed to initialize Python environment: {message}\n\nSuggestion: Ensure Docker is installed and the daemon is running (try 'docker info')")]
    EngineInitFailed {
        /// Description of the initialization failure.
        message: String,
    },

    /// The execution engine failed to run the code at all.
    #[error("{message}")]
    ExecutionFailed {
        /// Description of the engine failure.
        message: String,
    },

    // ========================================================================
    // Preference Errors
    // ========================================================================
    /// The preferences file exists but cannot be parsed.
    #[error("Corrupted preferences file '{path}': {message}\n\nSuggestion: Remove the preferences file to restore the default language")]
    PreferencesCorrupted {
        /// Path to the preferences file.
        path: PathBuf,
        /// Description of the corruption.
        message: String,
    },

    /// A locale code was rejected.
    #[error("Invalid locale code '{code}'\n\nSuggestion: Use a language tag such as 'en', 'es' or 'pt-BR'")]
    InvalidLocale {
        /// The rejected code.
        code: String,
    },

    // ========================================================================
    // General I/O Errors
    // ========================================================================
    /// General I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Categories of completion-service errors for structured handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// Authentication failure (invalid API key).
    Authentication,
    /// Rate limit exceeded (HTTP 429).
    RateLimit,
    /// Server error (5xx responses).
    Server,
    /// Network connectivity issues.
    Network,
    /// 2xx response without candidate text.
    MalformedResponse,
    /// Other unclassified errors.
    Other,
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Authentication => write!(f, "authentication"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Server => write!(f, "server"),
            Self::Network => write!(f, "network"),
            Self::MalformedResponse => write!(f, "malformed_response"),
            Self::Other => write!(f, "other"),
        }
    }
}

impl LlmErrorKind {
    /// Classifies a non-success HTTP status code.
    #[must_use]
    pub const fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Authentication,
            429 => Self::RateLimit,
            500..=599 => Self::Server,
            _ => Self::Other,
        }
    }

    /// Returns a suggestion message for this error kind.
    #[must_use]
    pub const fn suggestion(&self) -> &'static str {
        match self {
            Self::Authentication => "Check your API key",
            Self::RateLimit => "Wait and retry, or reduce request frequency",
            Self::Server => "Retry later; the completion service may be experiencing issues",
            Self::Network => "Check your network connection",
            Self::MalformedResponse => {
                "Retry; the completion service returned no usable candidate text"
            }
            Self::Other => "Check the completion service's status page",
        }
    }
}

impl TutorError {
    /// Creates a new `ConfigParseError` with the given path and message.
    #[must_use]
    pub fn config_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ConfigParseError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `ConfigValidationError` with the given message and suggestion.
    #[must_use]
    pub fn config_validation(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConfigValidationError {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Creates a new `LlmApiError` with automatic suggestion based on error kind.
    #[must_use]
    pub fn llm_api_error(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        let suggestion = kind.suggestion().to_string();
        Self::LlmApiError {
            kind,
            message: message.into(),
            suggestion,
        }
    }

    /// Creates a new `ConnectionFailed` error.
    #[must_use]
    pub fn connection_failed(attempts: u32, message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            attempts,
            message: message.into(),
        }
    }

    /// Creates a new `EngineInitFailed` error.
    #[must_use]
    pub fn engine_init(message: impl Into<String>) -> Self {
        Self::EngineInitFailed {
            message: message.into(),
        }
    }

    /// Creates a new `ExecutionFailed` error.
    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            message: message.into(),
        }
    }

    /// Creates a new `PreferencesCorrupted` error.
    #[must_use]
    pub fn preferences_corrupted(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::PreferencesCorrupted {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `InvalidLocale` error.
    #[must_use]
    pub fn invalid_locale(code: impl Into<String>) -> Self {
        Self::InvalidLocale { code: code.into() }
    }

    /// Returns `true` if this error is transient and the exchange may be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LlmApiError {
                kind: LlmErrorKind::RateLimit
                    | LlmErrorKind::Server
                    | LlmErrorKind::Network
                    | LlmErrorKind::MalformedResponse,
                ..
            } | Self::EngineNotReady
        )
    }

    /// Returns `true` if this error is fatal to session startup.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConfigParseError { .. }
                | Self::ConfigValidationError { .. }
                | Self::MissingApiKey
                | Self::HttpClientBuild(_)
                | Self::EngineInitFailed { .. }
        )
    }
}
