//! Reactive state store for the tutoring session.
//!
//! The store holds a fixed set of typed values and notifies per-key
//! subscribers whenever one of them changes. It is the single owner of the
//! conversation history and of the shared retry delay.
//!
//! # Dispatch
//!
//! Every mutation queues its notifications while it still holds the state
//! lock, so the queue is in mutation order. Handlers run synchronously after
//! the lock has been released, which lets a handler read or even mutate the
//! store. Only one caller drains the queue at a time: a mutation made from a
//! handler, or from another thread while a drain is running, is delivered by
//! that drain after the current handler returns. Subscribers therefore see
//! changes in the order they were made, and the last value they see for a
//! key is the stored one.
//!
//! A handler that returns an error or panics is logged and the remaining
//! handlers still run. Every notification is also forwarded to a broadcast
//! channel for asynchronous observers.
//!
//! # Example
//!
//! ```
//! use tutor_core::store::{StateKey, StateValue, Store};
//!
//! let store = Store::default();
//! let subscription = store.subscribe(StateKey::EngineReady, |value| {
//!     if let StateValue::EngineReady(ready) = value {
//!         println!("engine ready: {ready}");
//!     }
//!     Ok(())
//! });
//!
//! store.set_engine_ready(true);
//! subscription.unsubscribe();
//! ```

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Serialize, Serializer};
use tokio::sync::broadcast;
use tracing::{debug, error};

use crate::config::Config;
use crate::conversation::{Conversation, Turn};
use crate::engine::ExecutionResult;

/// Buffered events per broadcast receiver.
const EVENT_CAPACITY: usize = 100;

// ============================================================================
// Keys and Values
// ============================================================================

/// Identifies one observable slot of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKey {
    /// Whether a long operation is running, and its message.
    Loading,
    /// The conversation history.
    History,
    /// The shared retry delay.
    RetryDelay,
    /// The markdown of the lesson or exercise on screen.
    CurrentLesson,
    /// Whether the execution engine finished initializing.
    EngineReady,
    /// The last successful run.
    ExecutionOutput,
    /// The last failed run.
    ExecutionError,
}

/// Loading indicator state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadingStatus {
    /// `true` while an operation is in flight.
    pub active: bool,
    /// Message describing the operation; empty when inactive.
    pub message: String,
}

/// A value held by the store, tagged with its key.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "key", content = "value", rename_all = "snake_case")]
pub enum StateValue {
    /// See [`StateKey::Loading`].
    Loading(LoadingStatus),
    /// See [`StateKey::History`].
    History(Conversation),
    /// See [`StateKey::RetryDelay`]. Serialized in milliseconds.
    RetryDelay(#[serde(serialize_with = "serialize_millis")] Duration),
    /// See [`StateKey::CurrentLesson`].
    CurrentLesson(Option<String>),
    /// See [`StateKey::EngineReady`].
    EngineReady(bool),
    /// See [`StateKey::ExecutionOutput`].
    ExecutionOutput(Option<ExecutionResult>),
    /// See [`StateKey::ExecutionError`].
    ExecutionError(Option<String>),
}

impl StateValue {
    /// Returns the key this value belongs to.
    #[must_use]
    pub const fn key(&self) -> StateKey {
        match self {
            Self::Loading(_) => StateKey::Loading,
            Self::History(_) => StateKey::History,
            Self::RetryDelay(_) => StateKey::RetryDelay,
            Self::CurrentLesson(_) => StateKey::CurrentLesson,
            Self::EngineReady(_) => StateKey::EngineReady,
            Self::ExecutionOutput(_) => StateKey::ExecutionOutput,
            Self::ExecutionError(_) => StateKey::ExecutionError,
        }
    }
}

fn millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

fn serialize_millis<S: Serializer>(delay: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(millis(*delay))
}

/// Point-in-time copy of every slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    /// Loading indicator state.
    pub loading: LoadingStatus,
    /// Conversation history.
    pub history: Conversation,
    /// Current shared retry delay in milliseconds.
    pub retry_delay_ms: u64,
    /// Current lesson markdown.
    pub current_lesson: Option<String>,
    /// Engine readiness.
    pub engine_ready: bool,
    /// Last successful run.
    pub execution_output: Option<ExecutionResult>,
    /// Last failed run.
    pub execution_error: Option<String>,
}

#[derive(Debug, Clone)]
struct StoreState {
    loading: LoadingStatus,
    history: Conversation,
    retry_delay: Duration,
    current_lesson: Option<String>,
    engine_ready: bool,
    execution_output: Option<ExecutionResult>,
    execution_error: Option<String>,
}

impl StoreState {
    fn get(&self, key: StateKey) -> StateValue {
        match key {
            StateKey::Loading => StateValue::Loading(self.loading.clone()),
            StateKey::History => StateValue::History(self.history.clone()),
            StateKey::RetryDelay => StateValue::RetryDelay(self.retry_delay),
            StateKey::CurrentLesson => StateValue::CurrentLesson(self.current_lesson.clone()),
            StateKey::EngineReady => StateValue::EngineReady(self.engine_ready),
            StateKey::ExecutionOutput => StateValue::ExecutionOutput(self.execution_output.clone()),
            StateKey::ExecutionError => StateValue::ExecutionError(self.execution_error.clone()),
        }
    }

    fn apply(&mut self, value: StateValue) {
        match value {
            StateValue::Loading(loading) => self.loading = loading,
            StateValue::History(history) => self.history = history,
            StateValue::RetryDelay(delay) => self.retry_delay = delay,
            StateValue::CurrentLesson(lesson) => self.current_lesson = lesson,
            StateValue::EngineReady(ready) => self.engine_ready = ready,
            StateValue::ExecutionOutput(output) => self.execution_output = output,
            StateValue::ExecutionError(err) => self.execution_error = err,
        }
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

/// Error type handlers may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result type returned by subscription handlers.
pub type HandlerResult = std::result::Result<(), HandlerError>;

type Handler = Arc<dyn Fn(&StateValue) -> HandlerResult + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    by_key: HashMap<StateKey, Vec<(u64, Handler)>>,
}

/// Disposer for a registered handler.
///
/// Dropping the subscription unregisters the handler. Use
/// [`detach`](Self::detach) to keep it for the lifetime of the store.
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    listeners: Weak<Mutex<Listeners>>,
    key: StateKey,
    id: u64,
    active: bool,
}

impl Subscription {
    /// Unregisters the handler.
    pub fn unsubscribe(mut self) {
        self.remove();
    }

    /// Keeps the handler registered for as long as the store lives.
    pub fn detach(mut self) {
        self.active = false;
    }

    /// Returns the key this subscription listens to.
    #[must_use]
    pub const fn key(&self) -> StateKey {
        self.key
    }

    fn remove(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(listeners) = self.listeners.upgrade() {
            if let Some(handlers) = lock(&listeners).by_key.get_mut(&self.key) {
                handlers.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

/// Notifications waiting to be delivered.
#[derive(Default)]
struct Pending {
    queue: VecDeque<StateValue>,
    draining: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Store
// ============================================================================

/// Keyed, observable session state.
pub struct Store {
    state: Mutex<StoreState>,
    listeners: Arc<Mutex<Listeners>>,
    pending: Mutex<Pending>,
    events: broadcast::Sender<StateValue>,
    initial_retry_delay: Duration,
}

impl Default for Store {
    fn default() -> Self {
        Self::new(Conversation::default(), Duration::from_millis(1000))
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("state", &*lock(&self.state))
            .field("initial_retry_delay", &self.initial_retry_delay)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Creates a store with an empty, bounded history.
    #[must_use]
    pub fn new(history: Conversation, initial_retry_delay: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(StoreState {
                loading: LoadingStatus::default(),
                history,
                retry_delay: initial_retry_delay,
                current_lesson: None,
                engine_ready: false,
                execution_output: None,
                execution_error: None,
            }),
            listeners: Arc::new(Mutex::new(Listeners::default())),
            pending: Mutex::new(Pending::default()),
            events,
            initial_retry_delay,
        }
    }

    /// Creates a store sized by the session configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Conversation::new(config.chat.max_history, config.chat.retain_on_overflow),
            config.api.initial_retry_delay(),
        )
    }

    /// Returns the current value for `key`.
    #[must_use]
    pub fn get(&self, key: StateKey) -> StateValue {
        lock(&self.state).get(key)
    }

    /// Overwrites a slot and notifies its subscribers.
    pub fn set(&self, value: StateValue) {
        {
            let mut state = lock(&self.state);
            state.apply(value.clone());
            self.enqueue([value]);
        }
        self.drain();
    }

    /// Registers `handler` for changes to `key`.
    pub fn subscribe<F>(&self, key: StateKey, handler: F) -> Subscription
    where
        F: Fn(&StateValue) -> HandlerResult + Send + Sync + 'static,
    {
        let mut listeners = lock(&self.listeners);
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners
            .by_key
            .entry(key)
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            listeners: Arc::downgrade(&self.listeners),
            key,
            id,
            active: true,
        }
    }

    /// Returns a receiver for every notification sent after this call.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<StateValue> {
        self.events.subscribe()
    }

    /// Returns a copy of every slot.
    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        let state = lock(&self.state);
        StoreSnapshot {
            loading: state.loading.clone(),
            history: state.history.clone(),
            retry_delay_ms: millis(state.retry_delay),
            current_lesson: state.current_lesson.clone(),
            engine_ready: state.engine_ready,
            execution_output: state.execution_output.clone(),
            execution_error: state.execution_error.clone(),
        }
    }

    // ------------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------------

    /// Appends a turn, enforcing the history cap.
    pub fn append_turn(&self, turn: Turn) {
        let (retained, version, truncated) = {
            let mut state = lock(&self.state);
            let truncated = state.history.push(turn);
            let history = state.history.clone();
            let summary = (history.len(), history.version(), truncated);
            self.enqueue([StateValue::History(history)]);
            summary
        };
        if truncated {
            debug!(retained, version, "Conversation history truncated");
        }
        self.drain();
    }

    /// Removes every turn from the history.
    pub fn clear_history(&self) {
        {
            let mut state = lock(&self.state);
            state.history.clear();
            self.enqueue([StateValue::History(state.history.clone())]);
        }
        self.drain();
    }

    /// Returns a private copy of the history.
    #[must_use]
    pub fn history(&self) -> Conversation {
        lock(&self.state).history.clone()
    }

    /// Returns the history mutation counter.
    #[must_use]
    pub fn history_version(&self) -> u64 {
        lock(&self.state).history.version()
    }

    // ------------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------------

    /// Sets the loading indicator. The message is dropped when inactive.
    pub fn set_loading(&self, active: bool, message: &str) {
        let message = if active {
            message.to_string()
        } else {
            String::new()
        };
        self.set(StateValue::Loading(LoadingStatus { active, message }));
    }

    /// Returns the loading indicator state.
    #[must_use]
    pub fn loading(&self) -> LoadingStatus {
        lock(&self.state).loading.clone()
    }

    // ------------------------------------------------------------------------
    // Retry delay
    // ------------------------------------------------------------------------

    /// Returns the current shared retry delay.
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        lock(&self.state).retry_delay
    }

    /// Restores the retry delay to its initial value.
    pub fn reset_retry_delay(&self) {
        self.set(StateValue::RetryDelay(self.initial_retry_delay));
    }

    /// Multiplies the retry delay and returns the new value.
    pub fn increase_retry_delay(&self, multiplier: u32) -> Duration {
        let delay = {
            let mut state = lock(&self.state);
            state.retry_delay = state.retry_delay.saturating_mul(multiplier);
            self.enqueue([StateValue::RetryDelay(state.retry_delay)]);
            state.retry_delay
        };
        self.drain();
        delay
    }

    /// Returns the configured initial retry delay.
    #[must_use]
    pub const fn initial_retry_delay(&self) -> Duration {
        self.initial_retry_delay
    }

    // ------------------------------------------------------------------------
    // Lesson, engine, execution
    // ------------------------------------------------------------------------

    /// Records the lesson or exercise on screen.
    pub fn set_current_lesson(&self, markdown: impl Into<String>) {
        self.set(StateValue::CurrentLesson(Some(markdown.into())));
    }

    /// Returns the lesson or exercise on screen.
    #[must_use]
    pub fn current_lesson(&self) -> Option<String> {
        lock(&self.state).current_lesson.clone()
    }

    /// Records engine readiness.
    pub fn set_engine_ready(&self, ready: bool) {
        self.set(StateValue::EngineReady(ready));
    }

    /// Returns engine readiness.
    #[must_use]
    pub fn engine_ready(&self) -> bool {
        lock(&self.state).engine_ready
    }

    /// Records a successful run and clears the error slot.
    ///
    /// Notifies the output slot, then the error slot.
    pub fn set_execution_output(&self, result: ExecutionResult) {
        {
            let mut state = lock(&self.state);
            state.execution_output = Some(result.clone());
            state.execution_error = None;
            self.enqueue([
                StateValue::ExecutionOutput(Some(result)),
                StateValue::ExecutionError(None),
            ]);
        }
        self.drain();
    }

    /// Records a failed run and clears the output slot.
    ///
    /// Notifies the error slot, then the output slot.
    pub fn set_execution_error(&self, message: impl Into<String>) {
        let message = message.into();
        {
            let mut state = lock(&self.state);
            state.execution_error = Some(message.clone());
            state.execution_output = None;
            self.enqueue([
                StateValue::ExecutionError(Some(message)),
                StateValue::ExecutionOutput(None),
            ]);
        }
        self.drain();
    }

    /// Queues notifications. Callers hold the state lock.
    fn enqueue(&self, values: impl IntoIterator<Item = StateValue>) {
        lock(&self.pending).queue.extend(values);
    }

    /// Delivers queued notifications unless another caller already is.
    fn drain(&self) {
        {
            let mut pending = lock(&self.pending);
            if pending.draining {
                return;
            }
            pending.draining = true;
        }
        loop {
            let next = {
                let mut pending = lock(&self.pending);
                let next = pending.queue.pop_front();
                if next.is_none() {
                    pending.draining = false;
                }
                next
            };
            match next {
                Some(value) => self.notify(value),
                None => break,
            }
        }
    }

    fn notify(&self, value: StateValue) {
        let key = value.key();
        let handlers: Vec<Handler> = lock(&self.listeners)
            .by_key
            .get(&key)
            .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&value))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(key = ?key, error = %err, "State subscriber failed"),
                Err(_) => error!(key = ?key, "State subscriber panicked"),
            }
        }

        // No receivers is fine
        let _ = self.events.send(value);
    }
}
