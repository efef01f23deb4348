//! Tutor client core
//!
//! Reactive state store, resilient completion client and the workflow
//! controller of the interactive Python tutor.

pub mod client;
pub mod config;
pub mod controller;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod lesson;
pub mod preferences;
pub mod render;
pub mod store;
pub mod wire;

pub use client::{CompletionClient, CompletionRequest, Purpose, RetryPolicy, DEFAULT_APOLOGY};
pub use config::{
    ApiConfig, BackoffScope, ChatConfig, Config, LessonConfig, LoadingMessages, SandboxConfig,
    TutorConfig,
};
pub use controller::{Controller, SessionStatus};
pub use conversation::{Conversation, Role, Turn};
pub use engine::{ExecutionEngine, ExecutionResult};
pub use error::{LlmErrorKind, Result, TutorError};
pub use preferences::Preferences;
pub use render::{Renderer, TUTOR_SENDER, USER_SENDER};
pub use store::{LoadingStatus, StateKey, StateValue, Store, StoreSnapshot, Subscription};
pub use wire::{CompletionReply, CompletionTransport, HttpTransport};
