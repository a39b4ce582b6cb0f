//! Error handling for the backend bootstrap
//!
//! This module provides the error taxonomy shared by credential resolution,
//! client construction and the store handles.

use crate::resolver::CredentialSource;
use std::time::Duration;
use thiserror::Error;

/// Type alias for Results with backend errors
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for credential resolution and backend access
///
/// Every payload is owned and cloneable so that one initialization outcome can
/// be handed to all callers waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A key source parsed as text but had no body after normalization
    #[error("Malformed key: {0}")]
    MalformedKey(String),

    /// Base64 or JSON decoding of a credential source failed
    #[error("Decode failure for {origin}: {message}")]
    DecodeFailure {
        /// The source that could not be decoded
        origin: CredentialSource,
        /// Decoder message
        message: String,
    },

    /// A value required by the selected source is not configured
    #[error("Missing configuration: {0}")]
    MissingConfig(String),

    /// The hosting platform offered no default credentials
    #[error("Ambient credentials unavailable: {0}")]
    AmbientUnavailable(String),

    /// Every credential source was tried and none produced a credential
    #[error(
        "No credential available (attempted: {}){}",
        format_sources(attempted_sources),
        format_last(last_error)
    )]
    NoCredentialAvailable {
        /// Sources in the order they were attempted
        attempted_sources: Vec<CredentialSource>,
        /// The failure of the last source that was actually present
        last_error: Option<Box<Error>>,
    },

    /// The backend refused a syntactically valid credential
    #[error("Backend rejected credential: {0}")]
    BackendRejected(String),

    /// The backend accepted the credential but the storage target is unusable
    #[error("Storage target unavailable: {0}")]
    StorageTargetUnavailable(String),

    /// Terminal initialization failure surfaced by the client manager
    #[error(
        "Credential resolution failed (attempted: {}): {last_error}",
        format_sources(attempted_sources)
    )]
    CredentialResolutionFailed {
        /// Sources in the order they were attempted
        attempted_sources: Vec<CredentialSource>,
        /// The underlying error, preserved verbatim
        last_error: Box<Error>,
    },

    /// Initialization did not complete in time
    #[error("Initialization timed out after {0:?}")]
    Timeout(Duration),

    /// Initialization code panicked; the attempt counts as failed
    #[error("Initialization panicked: {0}")]
    Panicked(String),

    /// Temporary key file could not be written or removed
    #[error("Key file error: {0}")]
    KeyFile(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Document or object missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Document store failure
    #[error("Document store error: {0}")]
    DocumentStore(String),

    /// Object store failure
    #[error("Object store error: {0}")]
    ObjectStore(String),

    /// A shared lock was poisoned by a panicking holder
    #[error("Failed to acquire lock: {0}")]
    LockPoisoned(String),
}

fn format_sources(sources: &[CredentialSource]) -> String {
    if sources.is_empty() {
        return "none".to_string();
    }
    sources
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_last(last: &Option<Box<Error>>) -> String {
    match last {
        Some(err) => format!(": {}", err),
        None => String::new(),
    }
}

impl Error {
    /// Whether this error ends the current `get_client` call.
    ///
    /// Per-source failures (`MalformedKey`, `DecodeFailure`, `MissingConfig`,
    /// `AmbientUnavailable`) only advance the resolver to the next source.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::MalformedKey(_)
                | Error::DecodeFailure { .. }
                | Error::MissingConfig(_)
                | Error::AmbientUnavailable(_)
        )
    }

    /// Sources listed by a terminal resolution error, empty otherwise
    pub fn attempted_sources(&self) -> &[CredentialSource] {
        match self {
            Error::NoCredentialAvailable {
                attempted_sources, ..
            }
            | Error::CredentialResolutionFailed {
                attempted_sources, ..
            } => attempted_sources,
            _ => &[],
        }
    }

    /// The innermost error behind a terminal resolution failure
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::CredentialResolutionFailed { last_error, .. } => last_error.root_cause(),
            Error::NoCredentialAvailable {
                last_error: Some(last),
                ..
            } => last.root_cause(),
            other => other,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(err: base64::DecodeError) -> Self {
        Error::DecodeFailure {
            origin: CredentialSource::Base64Key,
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = Error::MalformedKey("empty body".to_string());
        assert_eq!(error.to_string(), "Malformed key: empty body");

        let error = Error::NoCredentialAvailable {
            attempted_sources: vec![
                CredentialSource::ServiceAccountJson,
                CredentialSource::Base64Key,
            ],
            last_error: None,
        };
        assert_eq!(
            error.to_string(),
            "No credential available (attempted: service-account-json, base64-key)"
        );

        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error = Error::from(io_error);
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_fatality() {
        assert!(!Error::MissingConfig("x".into()).is_fatal());
        assert!(!Error::DecodeFailure {
            origin: CredentialSource::Base64Key,
            message: "bad".into()
        }
        .is_fatal());
        assert!(Error::BackendRejected("revoked".into()).is_fatal());
        assert!(Error::StorageTargetUnavailable("no bucket".into()).is_fatal());
    }

    #[test]
    fn test_root_cause_unwraps_nesting() {
        let inner = Error::BackendRejected("invalid_grant".into());
        let error = Error::CredentialResolutionFailed {
            attempted_sources: vec![CredentialSource::RawKey],
            last_error: Box::new(inner.clone()),
        };
        assert_eq!(error.root_cause(), &inner);
        assert_eq!(error.attempted_sources(), &[CredentialSource::RawKey]);
    }
}
