//! Backend client bootstrap for the billing services
//!
//! This crate resolves service-account credentials from inconsistently
//! formatted deployment configuration, builds the document and object store
//! client exactly once per process, and reports every step as a redacted
//! diagnostic event.

/// Backend store and connector abstractions
pub mod backend;

/// Lazily initialized, shared backend client
pub mod client;

/// Command-line tooling
pub mod cli;

/// Credential inputs and client settings
pub mod config;

/// Structured, redacted diagnostic events
pub mod diagnostics;

/// Error types
pub mod error;

/// PEM key normalization and inspection
pub mod key_format;

/// In-process backend
pub mod memory;

/// Ordered credential resolution
pub mod resolver;

/// Service-account JSON documents
pub mod service_account;

/// Temporary key files
pub mod temp_key;

// Re-export key types for convenience
pub use backend::{BackendConnector, ClientHandle, DocumentStore, KeyDelivery, ObjectStore};
pub use client::{ClientManager, LifecycleState};
pub use config::{ClientConfig, InputSource, RawCredentialInputs};
pub use diagnostics::{DiagnosticEmitter, DiagnosticEvent, DiagnosticListener, Severity};
pub use error::{Error, Result};
pub use key_format::{normalize_key, NormalizedKey};
pub use memory::InMemoryBackend;
pub use resolver::{Credential, CredentialResolver, CredentialSource, ResolvedCredential};

/// Version of the backend bootstrap crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
