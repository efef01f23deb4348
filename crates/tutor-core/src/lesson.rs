//! Prompt construction for lessons, exercises and tutor feedback.
//!
//! Templates use `{topic}`, `{code}` and `{feedbackRequest}` placeholders;
//! each placeholder's first occurrence is substituted.

use once_cell::sync::Lazy;
use regex::Regex;

/// Default lesson prompt.
pub const DEFAULT_LESSON_TEMPLATE: &str = "Generate a new lesson for an interactive Python course. \
The topic is {topic}. Include an explanation, a simple code example, and an exercise for the user to complete. \
Structure the response using Markdown. The exercise should have a clear goal and an empty code block for the user to fill in.";

/// Default harder-exercise prompt.
pub const DEFAULT_EXERCISE_TEMPLATE: &str = "Generate a new and more challenging exercise based on the current topic: {topic}. \
The exercise should be self-contained and ready for the student to solve. It should include a clear problem description and an empty code block.";

/// Default tutor feedback prompt.
pub const DEFAULT_TUTOR_TEMPLATE: &str = r#"
You are a supportive Python tutor helping a beginner.

The student will write Python code. Your role is to:
- Encourage the student.
- Provide step-by-step **hints**, not full answers.
- Only give full solutions if the student explicitly says something like "show me the full answer" or "I give up".
- Use a friendly, constructive tone.
- Always explain **why** a suggestion is helpful.
- If there's an error, give a hint about what might be wrong and how to fix it.

Here is the student's code:
```python
{code}
```

{feedbackRequest}
Give your coaching feedback now.
"#;

/// ATX level-one heading: `# Title` with optional closing hashes.
static ATX_H1: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^ {0,3}#[ \t]+(.+?)(?:[ \t]+#+)?[ \t]*$").ok());

/// Setext level-one underline: `===`.
static SETEXT_H1: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^ {0,3}=+[ \t]*$").ok());

/// Inline emphasis and code markers.
static INLINE_MARKERS: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\*\*|__|`|\*").ok());

/// What the tutor is asked to review after a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedbackRequest {
    /// The run succeeded with this stdout.
    Output(String),
    /// The run failed with this error text.
    Error(String),
}

impl FeedbackRequest {
    /// Returns the sentence sent to the tutor.
    ///
    /// # Examples
    ///
    /// ```
    /// use tutor_core::lesson::FeedbackRequest;
    ///
    /// let request = FeedbackRequest::Error("NameError".to_string());
    /// assert_eq!(request.describe(), r#"It resulted in an error: "NameError""#);
    /// ```
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Output(output) => format!(
                "The output was: \"{output}\". Please check if the exercise was completed correctly."
            ),
            Self::Error(error) => format!("It resulted in an error: \"{error}\""),
        }
    }
}

/// Builds a lesson prompt for `topic`.
#[must_use]
pub fn lesson_prompt(template: &str, topic: &str) -> String {
    template.replacen("{topic}", topic, 1)
}

/// Builds a harder-exercise prompt for `topic`.
#[must_use]
pub fn exercise_prompt(template: &str, topic: &str) -> String {
    template.replacen("{topic}", topic, 1)
}

/// Builds a tutor feedback prompt.
///
/// A non-empty `request` is inserted as `The student said: "..."`; otherwise
/// the placeholder is removed.
#[must_use]
pub fn feedback_prompt(template: &str, code: &str, request: Option<&str>) -> String {
    let clause = match request {
        Some(request) if !request.is_empty() => format!("The student said: \"{request}\""),
        _ => String::new(),
    };
    template
        .replacen("{code}", code, 1)
        .replacen("{feedbackRequest}", &clause, 1)
}

/// Returns the text of the first level-one heading in `markdown`.
///
/// Headings inside fenced code blocks are ignored. Inline emphasis and code
/// markers are stripped.
#[must_use]
pub fn extract_topic(markdown: &str) -> Option<String> {
    let (Some(atx), Some(setext)) = (ATX_H1.as_ref(), SETEXT_H1.as_ref()) else {
        return None;
    };

    let lines: Vec<&str> = markdown.lines().collect();
    let mut in_fence = false;
    for (index, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }

        let heading = atx
            .captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
            .or_else(|| {
                let next = lines.get(index + 1)?;
                (!line.trim().is_empty() && setext.is_match(next)).then(|| line.trim())
            });

        if let Some(text) = heading.map(strip_inline_markers) {
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

fn strip_inline_markers(text: &str) -> String {
    INLINE_MARKERS
        .as_ref()
        .map_or_else(|| text.to_string(), |re| re.replace_all(text, "").into_owned())
        .trim()
        .to_string()
}
