//! Persisted user preferences.
//!
//! Stored as JSON, e.g. `{"locale": "en"}`. A missing file yields the
//! defaults; the file is only written on an explicit change.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, TutorError};

/// Locale used when none is stored.
pub const DEFAULT_LOCALE: &str = "en";

fn default_locale() -> String {
    DEFAULT_LOCALE.to_string()
}

/// User preferences that survive across sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    /// Interface language code.
    #[serde(default = "default_locale")]
    pub locale: String,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            locale: default_locale(),
        }
    }
}

impl Preferences {
    /// Loads preferences from `path`, falling back to defaults if it is missing.
    ///
    /// # Errors
    ///
    /// Returns `TutorError::PreferencesCorrupted` if the file cannot be parsed,
    /// or `TutorError::Io` if it cannot be read.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No preferences file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        let preferences: Self = serde_json::from_str(&contents)
            .map_err(|e| TutorError::preferences_corrupted(path, e.to_string()))?;
        validate_locale(&preferences.locale)
            .map_err(|_| TutorError::preferences_corrupted(path, "invalid locale code"))?;
        Ok(preferences)
    }

    /// Writes preferences to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Changes the locale and persists the result.
    ///
    /// # Errors
    ///
    /// Returns `TutorError::InvalidLocale` for malformed codes, or an I/O
    /// error if the file cannot be written.
    pub fn set_locale(&mut self, code: &str, path: &Path) -> Result<()> {
        let code = code.trim();
        validate_locale(code)?;
        self.locale = code.to_string();
        self.save(path)?;
        info!(locale = %self.locale, "Language preference saved");
        Ok(())
    }
}

/// Accepts tags like `en`, `es`, `pt-BR`, `zh-Hant`.
fn validate_locale(code: &str) -> Result<()> {
    let valid = !code.is_empty()
        && code.len() <= 16
        && code.split('-').all(|part| {
            !part.is_empty() && part.len() <= 8 && part.chars().all(|c| c.is_ascii_alphanumeric())
        });
    if valid {
        Ok(())
    } else {
        Err(TutorError::invalid_locale(code))
    }
}

/// Resolves the preferences path relative to `base` unless it is absolute.
#[must_use]
pub fn resolve_path(base: &Path, configured: &str) -> PathBuf {
    let path = Path::new(configured);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
