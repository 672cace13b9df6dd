//! Error types shared across the inkwell crates.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Durable key-value store errors
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("failed to read {key} from {}", path.display())]
    #[diagnostic(code(store::read))]
    Read {
        key: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {key} to {}", path.display())]
    #[diagnostic(code(store::write))]
    Write {
        key: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to remove {key} at {}", path.display())]
    #[diagnostic(code(store::remove))]
    Remove {
        key: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stored value for {key} is corrupt: {message}")]
    #[diagnostic(
        code(store::corrupt),
        help("Inspect or delete the stored value for {key}; it no longer parses")
    )]
    Corrupt { key: String, message: String },

    #[error("failed to encode value for {key}: {message}")]
    #[diagnostic(code(store::encode))]
    Encode { key: String, message: String },
}

impl StoreError {
    /// Create a corrupt-value error for a key.
    pub fn corrupt(key: impl Into<String>, message: impl ToString) -> Self {
        StoreError::Corrupt {
            key: key.into(),
            message: message.to_string(),
        }
    }

    /// Create an encode error for a key.
    pub fn encode(key: impl Into<String>, message: impl ToString) -> Self {
        StoreError::Encode {
            key: key.into(),
            message: message.to_string(),
        }
    }
}

/// Configuration errors
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("missing required environment variable: {var}")]
    #[diagnostic(
        code(config::missing_env),
        help("Set the {var} environment variable or add it to your .env file")
    )]
    MissingEnv { var: &'static str },

    #[error("invalid configuration value for {field}: {message}")]
    #[diagnostic(code(config::invalid))]
    Invalid { field: &'static str, message: String },

    #[error("failed to parse URL: {url}")]
    #[diagnostic(code(config::url_parse))]
    UrlParse { url: String, message: String },

    #[error("failed to load configuration from {}: {message}", path.display())]
    #[diagnostic(code(config::load))]
    Load { path: PathBuf, message: String },

    #[error("failed to save configuration to {}: {message}", path.display())]
    #[diagnostic(code(config::save))]
    Save { path: PathBuf, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupt_display() {
        let err = StoreError::corrupt("notes.sync.outbox.v1", "expected array");
        assert_eq!(
            err.to_string(),
            "stored value for notes.sync.outbox.v1 is corrupt: expected array"
        );
    }

    #[test]
    fn test_missing_env_display() {
        let err = ConfigError::MissingEnv {
            var: "INKWELL_ENDPOINT",
        };
        assert!(err.to_string().contains("INKWELL_ENDPOINT"));
    }
}
