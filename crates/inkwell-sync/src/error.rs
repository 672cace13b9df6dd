//! Error types for the sync engine.

use inkwell_common::StoreError;
use miette::Diagnostic;
use thiserror::Error;

/// Errors from the cipher envelope.
#[derive(Error, Debug, Diagnostic, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CipherError {
    /// No master key is loaded.
    #[error("cipher envelope is locked")]
    #[diagnostic(
        code(cipher::locked),
        help("Import the master key material before syncing")
    )]
    Locked,

    /// Key material could not be used.
    #[error("invalid key material: {0}")]
    #[diagnostic(code(cipher::invalid_key))]
    InvalidKey(String),

    /// A packed or structured blob could not be parsed.
    #[error("malformed cipher blob: {0}")]
    #[diagnostic(code(cipher::malformed))]
    Malformed(String),

    /// Blob carries a format tag this build does not understand.
    #[error("unsupported cipher blob version {0}")]
    #[diagnostic(code(cipher::version))]
    UnsupportedVersion(u8),

    /// Authentication failed (wrong key, wrong AAD or tampered ciphertext).
    #[error("decryption failed")]
    #[diagnostic(code(cipher::decrypt))]
    Decrypt,

    /// Encryption failed.
    #[error("encryption failed")]
    #[diagnostic(code(cipher::encrypt))]
    Encrypt,
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum SyncError {
    /// No network path is available.
    #[error("offline")]
    #[diagnostic(code(sync::offline))]
    Offline,

    /// The request never produced a response (connect, timeout, TLS...).
    #[error("request to {endpoint} failed: {message}")]
    #[diagnostic(code(sync::transport))]
    Transport {
        endpoint: &'static str,
        message: String,
    },

    /// The server answered with a non-success status.
    #[error("{endpoint} returned HTTP {status}")]
    #[diagnostic(code(sync::status))]
    Status { endpoint: &'static str, status: u16 },

    /// The server's response did not match the expected shape.
    #[error("unexpected response from {endpoint}: {message}")]
    #[diagnostic(code(sync::response))]
    Response {
        endpoint: &'static str,
        message: String,
    },

    /// No local note with this id.
    #[error("note {id} not found")]
    #[diagnostic(code(sync::not_found))]
    NotFound { id: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    #[diagnostic(code(sync::serialization))]
    Serialization(String),
}

impl SyncError {
    /// Whether this failure should be absorbed by queuing the operation.
    ///
    /// Offline and transport/status failures are transient; everything else
    /// (cipher, store, serialization) is a local fault that retrying won't fix.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Offline
                | SyncError::Transport { .. }
                | SyncError::Status { .. }
                | SyncError::Response { .. }
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::Offline.is_transient());
        assert!(
            SyncError::Status {
                endpoint: "upload",
                status: 503
            }
            .is_transient()
        );
        assert!(!SyncError::Cipher(CipherError::Locked).is_transient());
        assert!(!SyncError::Serialization("x".into()).is_transient());
    }

    #[test]
    fn test_offline_display() {
        assert_eq!(SyncError::Offline.to_string(), "offline");
    }
}
