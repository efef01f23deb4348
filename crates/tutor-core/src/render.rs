//! The presentation seam.
//!
//! The controller reads user input from, and writes results to, a
//! [`Renderer`]. Implementations own the view state (course pane, code
//! editor, chat input, console) and decide how markdown is displayed.

/// Sender label for student entries.
pub const USER_SENDER: &str = "You";

/// Sender label for tutor entries.
pub const TUTOR_SENDER: &str = "AI Tutor";

/// Presentation layer used by the controller.
///
/// Methods take `&self`; implementations use interior mutability so a single
/// renderer can be shared between concurrently running workflows.
pub trait Renderer: Send + Sync {
    /// Converts markdown into display-safe output.
    fn render_markup(&self, text: &str) -> String;

    /// Shows a blocking notice with a title.
    fn show_notice(&self, title: &str, message: &str);

    /// Adds an entry to the visible conversation.
    fn append_conversation_entry(&self, sender: &str, text: &str, is_user: bool);

    /// Empties the visible conversation.
    fn clear_conversation(&self);

    /// Replaces the course pane with new markdown.
    fn set_course_content(&self, markdown: &str);

    /// Returns the markdown currently shown in the course pane.
    fn course_content(&self) -> String;

    /// Returns the code editor contents.
    fn code_input(&self) -> String;

    /// Replaces the code editor contents.
    fn set_code_input(&self, code: &str);

    /// Returns the pending chat input.
    fn chat_input(&self) -> String;

    /// Empties the chat input.
    fn clear_chat_input(&self);

    /// Replaces the console text; `is_error` selects error styling.
    fn set_console_output(&self, text: &str, is_error: bool);
}
