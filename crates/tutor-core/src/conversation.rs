//! Conversation types for the tutoring session.
//!
//! A conversation is the ordered list of turns sent as context with every
//! completion request. It is bounded: once the cap is exceeded, only the
//! most recent turns are kept.

use serde::{Deserialize, Serialize};

// ============================================================================
// Role and Turn
// ============================================================================

/// The author of a conversation turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The student.
    #[default]
    User,
    /// The tutor, i.e. the completion service.
    Responder,
}

impl Role {
    /// Returns the role tag used by the completion service.
    ///
    /// # Examples
    ///
    /// ```
    /// use tutor_core::Role;
    ///
    /// assert_eq!(Role::User.wire_name(), "user");
    /// assert_eq!(Role::Responder.wire_name(), "model");
    /// ```
    #[must_use]
    pub const fn wire_name(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Responder => "model",
        }
    }
}

/// A single message in the conversation. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    role: Role,
    text: String,
}

impl Turn {
    /// Creates a turn with an explicit role.
    #[must_use]
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }

    /// Creates a student turn.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    /// Creates a tutor turn.
    #[must_use]
    pub fn responder(text: impl Into<String>) -> Self {
        Self::new(Role::Responder, text)
    }

    /// Returns the author of the turn.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Returns the turn text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }
}

// ============================================================================
// Conversation
// ============================================================================

/// Bounded, ordered conversation history.
///
/// Invariant: `len() <= max_len()` after every mutation. An append that would
/// exceed the cap keeps only the most recent `retain` turns, the new turn
/// included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    turns: Vec<Turn>,
    max_len: usize,
    retain: usize,
    /// Bumped on every mutation.
    version: u64,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new(50, 25)
    }
}

impl Conversation {
    /// Creates an empty conversation with the given cap and overflow retention.
    ///
    /// `retain` is clamped to `1..=max_len`.
    #[must_use]
    pub fn new(max_len: usize, retain: usize) -> Self {
        let max_len = max_len.max(1);
        Self {
            turns: Vec::new(),
            max_len,
            retain: retain.clamp(1, max_len),
            version: 0,
        }
    }

    /// Appends a turn, truncating to the most recent turns on overflow.
    ///
    /// Returns `true` if older turns were dropped.
    ///
    /// # Examples
    ///
    /// ```
    /// use tutor_core::{Conversation, Turn};
    ///
    /// let mut conversation = Conversation::new(3, 2);
    /// for text in ["a", "b", "c"] {
    ///     conversation.push(Turn::user(text));
    /// }
    /// assert!(conversation.push(Turn::user("d")));
    /// let texts: Vec<_> = conversation.turns().iter().map(Turn::text).collect();
    /// assert_eq!(texts, ["c", "d"]);
    /// ```
    pub fn push(&mut self, turn: Turn) -> bool {
        self.turns.push(turn);
        self.version += 1;
        if self.turns.len() > self.max_len {
            let drop = self.turns.len() - self.retain;
            self.turns.drain(..drop);
            return true;
        }
        false
    }

    /// Removes every turn. Clearing an empty conversation changes nothing.
    pub fn clear(&mut self) {
        if !self.turns.is_empty() {
            self.turns.clear();
            self.version += 1;
        }
    }

    /// Returns the turns in append order.
    #[must_use]
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Returns the most recent turn.
    #[must_use]
    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// Returns the number of turns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Returns `true` if there are no turns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Returns the cap.
    #[must_use]
    pub const fn max_len(&self) -> usize {
        self.max_len
    }

    /// Returns the mutation counter.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }
}
