//! Plain-terminal [`Renderer`].
//!
//! Markdown from the completion service is flattened into readable text and
//! scrubbed of control characters before it reaches the terminal, so a reply
//! cannot move the cursor or recolor the screen.

use std::sync::{Mutex, MutexGuard, PoisonError};

use once_cell::sync::Lazy;
use regex::Regex;
use tutor_core::Renderer;

static ANSI_ESCAPE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b[@-_]").ok());
static CONTROL_CHARS: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"[\x00-\x08\x0B\x0C\x0E-\x1F\x7F]").ok());
static HEADING: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^(#{1,6})\s+(.*?)\s*#*\s*$").ok());
static BULLET: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^(\s*)[-*+]\s+(.*)$").ok());
static EMPHASIS: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"\*\*(.+?)\*\*|__(.+?)__|`([^`]+)`").ok());

const CODE_INDENT: &str = "    ";

#[derive(Debug, Default)]
struct View {
    course: String,
    code: String,
    chat: String,
}

/// Renderer writing to stdout.
#[derive(Debug, Default)]
pub struct TerminalRenderer {
    view: Mutex<View>,
}

impl TerminalRenderer {
    /// Creates a renderer with empty view state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the text the next chat request will send.
    pub fn set_chat_input(&self, text: &str) {
        self.view().chat = text.to_string();
    }

    fn view(&self) -> MutexGuard<'_, View> {
        self.view.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Renderer for TerminalRenderer {
    fn render_markup(&self, text: &str) -> String {
        render_markdown(text)
    }

    fn show_notice(&self, title: &str, message: &str) {
        println!();
        println!("[!] {}", sanitize(title));
        println!("    {}", sanitize(message));
        println!();
    }

    fn append_conversation_entry(&self, sender: &str, text: &str, is_user: bool) {
        if is_user {
            // The student just typed it; echoing would duplicate the line.
            return;
        }
        println!();
        println!("{}:", sanitize(sender));
        println!("{}", self.render_markup(text));
    }

    fn clear_conversation(&self) {
        println!();
        println!("{}", "-".repeat(60));
    }

    fn set_course_content(&self, markdown: &str) {
        self.view().course = markdown.to_string();
        println!();
        println!("{}", self.render_markup(markdown));
    }

    fn course_content(&self) -> String {
        self.view().course.clone()
    }

    fn code_input(&self) -> String {
        self.view().code.clone()
    }

    fn set_code_input(&self, code: &str) {
        self.view().code = code.to_string();
    }

    fn chat_input(&self) -> String {
        self.view().chat.clone()
    }

    fn clear_chat_input(&self) {
        self.view().chat.clear();
    }

    fn set_console_output(&self, text: &str, is_error: bool) {
        if text.is_empty() {
            return;
        }
        let label = if is_error { "Error output" } else { "Output" };
        println!();
        println!("--- {label} ---");
        println!("{}", sanitize(text).trim_end());
        println!("---");
    }
}

/// Removes terminal escape sequences and control characters, keeping
/// newlines and tabs.
pub fn sanitize(text: &str) -> String {
    let without_escapes = match ANSI_ESCAPE.as_ref() {
        Some(re) => re.replace_all(text, "").into_owned(),
        None => text.to_string(),
    };
    let normalized = without_escapes.replace("\r\n", "\n").replace('\r', "\n");
    match CONTROL_CHARS.as_ref() {
        Some(re) => re.replace_all(&normalized, "").into_owned(),
        None => normalized,
    }
}

/// Flattens markdown into terminal text.
///
/// Headings are underlined, bullets become `•`, fenced code is indented and
/// left verbatim, and inline emphasis markers are dropped.
pub fn render_markdown(markdown: &str) -> String {
    let clean = sanitize(markdown);
    let mut out: Vec<String> = Vec::new();
    let mut in_fence = false;

    for line in clean.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            out.push(format!("{CODE_INDENT}{line}"));
            continue;
        }

        if let Some(caps) = HEADING.as_ref().and_then(|re| re.captures(line)) {
            let level = caps.get(1).map_or(1, |m| m.as_str().len());
            let title = strip_inline(caps.get(2).map_or("", |m| m.as_str()));
            let underline = match level {
                1 => Some('='),
                2 => Some('-'),
                _ => None,
            };
            let width = title.chars().count();
            out.push(title);
            if let Some(ch) = underline {
                out.push(ch.to_string().repeat(width));
            }
            continue;
        }

        if let Some(caps) = BULLET.as_ref().and_then(|re| re.captures(line)) {
            let indent = caps.get(1).map_or("", |m| m.as_str());
            let item = strip_inline(caps.get(2).map_or("", |m| m.as_str()));
            out.push(format!("{indent}• {item}"));
            continue;
        }

        out.push(strip_inline(line));
    }

    out.join("\n")
}

fn strip_inline(text: &str) -> String {
    match EMPHASIS.as_ref() {
        Some(re) => re
            .replace_all(text, |caps: &regex::Captures<'_>| {
                (1..=3)
                    .find_map(|i| caps.get(i))
                    .map_or_else(String::new, |m| m.as_str().to_string())
            })
            .into_owned(),
        None => text.to_string(),
    }
}
