//! Parsing of the interactive commands typed at the prompt.

use std::path::PathBuf;

use thiserror::Error;

/// Line that ends the multi-line code editor.
pub const EDITOR_TERMINATOR: &str = ".";

/// Help text printed by `help`.
pub const HELP: &str = "\
Commands:
  lesson [topic]   Start a new lesson (default topic if omitted)
  exercise         Get a harder exercise on the current topic
  code             Type code; finish with a line containing only '.'
  run [file]       Run the code in the editor, or load and run a file
  chat <message>   Ask the tutor a question
  reset            Clear the conversation, editor and console
  status           Show session status
  lang <code>      Change the interface language (e.g. en, es, pt-BR)
  help             Show this help
  quit             Leave the tutor";

/// A parsed prompt command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Blank line.
    Empty,
    /// Open the multi-line editor.
    Code,
    /// Run the editor contents.
    Run,
    /// Load a file into the editor and run it.
    RunFile(PathBuf),
    /// Send a chat message.
    Chat(String),
    /// Ask for a harder exercise.
    Exercise,
    /// Generate a lesson, optionally on a topic.
    Lesson(Option<String>),
    /// Reset the session.
    Reset,
    /// Print session status.
    Status,
    /// Change the locale.
    Lang(String),
    /// Print help.
    Help,
    /// Leave.
    Quit,
}

/// Reasons a line is not a valid command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// The first word is not a known command.
    #[error("unknown command '{0}', type 'help' for a list of commands")]
    Unknown(String),

    /// A required argument is missing.
    #[error("'{command}' needs {what}")]
    MissingArgument {
        /// The command typed.
        command: &'static str,
        /// Description of the missing argument.
        what: &'static str,
    },
}

impl Command {
    /// Parses one prompt line.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] for unknown commands or missing arguments.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Self::Empty);
        }

        let (word, rest) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(word, rest)| (word, rest.trim()));

        match word.to_ascii_lowercase().as_str() {
            "code" | "edit" => Ok(Self::Code),
            "run" if rest.is_empty() => Ok(Self::Run),
            "run" => Ok(Self::RunFile(PathBuf::from(rest))),
            "chat" | "ask" if rest.is_empty() => Err(CommandError::MissingArgument {
                command: "chat",
                what: "a message",
            }),
            "chat" | "ask" => Ok(Self::Chat(rest.to_string())),
            "exercise" | "next" => Ok(Self::Exercise),
            "lesson" => Ok(Self::Lesson((!rest.is_empty()).then(|| rest.to_string()))),
            "reset" => Ok(Self::Reset),
            "status" => Ok(Self::Status),
            "lang" | "language" if rest.is_empty() => Err(CommandError::MissingArgument {
                command: "lang",
                what: "a language code",
            }),
            "lang" | "language" => Ok(Self::Lang(rest.to_string())),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" | "q" => Ok(Self::Quit),
            _ => Err(CommandError::Unknown(word.to_string())),
        }
    }
}

/// Returns `true` for the line that closes the code editor.
pub fn ends_editor(line: &str) -> bool {
    line.trim_end_matches(['\r', '\n']) == EDITOR_TERMINATOR
}
