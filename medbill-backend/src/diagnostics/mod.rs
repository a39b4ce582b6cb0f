//! Structured diagnostic events
//!
//! Every decision point of credential resolution and client construction
//! emits a [`DiagnosticEvent`]. Events are mirrored into `tracing` and
//! delivered to the listeners registered when the [`DiagnosticEmitter`] was
//! built. Payloads pass through [`redaction::redact`] inside
//! [`DiagnosticEvent::new`], so no code path can hold an unredacted event.
//!
//! ## Usage
//!
//! ```
//! use std::sync::Arc;
//! use medbill_backend::diagnostics::{DiagnosticEmitter, RecentEvents};
//!
//! let recent = Arc::new(RecentEvents::new());
//! let emitter = DiagnosticEmitter::builder()
//!     .with_listener(recent.clone())
//!     .build();
//!
//! emitter.info("startup", "Backend bootstrap starting", None);
//! assert_eq!(recent.len(), 1);
//! ```

pub mod recent;
pub mod redaction;

pub use recent::{EventFilter, RecentEvents};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Skipped steps and other detail
    Debug,
    /// Normal progress
    Info,
    /// Non-fatal failure; resolution continues
    Warn,
    /// Terminal failure
    Error,
}

impl Severity {
    /// Upper-case name used in serialized events
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A timestamped, leveled, sanitized diagnostic record
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DiagnosticEvent {
    timestamp: DateTime<Utc>,
    #[serde(rename = "level")]
    severity: Severity,
    source: String,
    message: String,
    #[serde(rename = "data", skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
}

impl DiagnosticEvent {
    /// Create an event, redacting the payload
    pub fn new(
        severity: Severity,
        source: impl Into<String>,
        message: impl Into<String>,
        payload: Option<Value>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            severity,
            source: source.into(),
            message: message.into(),
            payload: payload.map(redaction::redact),
        }
    }

    /// When the event was created
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Event severity
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Source tag, e.g. `credential-resolver`
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Human-readable message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Sanitized payload
    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    /// Serialize as a single JSON line
    pub fn to_json_line(&self) -> String {
        // Only strings, a timestamp and a JSON value; serialization cannot fail
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"level\":\"{}\",\"source\":{:?},\"message\":{:?}}}",
                self.severity, self.source, self.message
            )
        })
    }
}

/// Receives every event emitted through a [`DiagnosticEmitter`]
pub trait DiagnosticListener: Send + Sync {
    /// Handle one event
    fn on_event(&self, event: &DiagnosticEvent);
}

impl<F> DiagnosticListener for F
where
    F: Fn(&DiagnosticEvent) + Send + Sync,
{
    fn on_event(&self, event: &DiagnosticEvent) {
        self(event)
    }
}

/// Appends each event as one JSON line to a file
pub struct JsonLinesFile {
    file: Mutex<File>,
}

impl JsonLinesFile {
    /// Open (or create) the file in append mode
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl DiagnosticListener for JsonLinesFile {
    fn on_event(&self, event: &DiagnosticEvent) {
        let Ok(mut file) = self.file.lock() else {
            error!("Diagnostic log file lock poisoned");
            return;
        };
        if let Err(err) = writeln!(file, "{}", event.to_json_line()).and_then(|_| file.flush()) {
            error!("Failed to write diagnostic event: {}", err);
        }
    }
}

impl fmt::Debug for JsonLinesFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JsonLinesFile")
    }
}

/// Emits diagnostic events to `tracing` and to registered listeners
///
/// The listener set is fixed at construction. Cloning is cheap and clones
/// share the same listeners. A listener that panics is skipped for that
/// event; the remaining listeners still receive it.
#[derive(Clone, Default)]
pub struct DiagnosticEmitter {
    listeners: Arc<Vec<Arc<dyn DiagnosticListener>>>,
}

/// Builder for [`DiagnosticEmitter`]
#[derive(Default)]
pub struct DiagnosticEmitterBuilder {
    listeners: Vec<Arc<dyn DiagnosticListener>>,
}

impl DiagnosticEmitterBuilder {
    /// Register a listener
    pub fn with_listener(mut self, listener: Arc<dyn DiagnosticListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Register a closure as a listener
    pub fn with_fn<F>(self, listener: F) -> Self
    where
        F: Fn(&DiagnosticEvent) + Send + Sync + 'static,
    {
        self.with_listener(Arc::new(listener))
    }

    /// Finish building
    pub fn build(self) -> DiagnosticEmitter {
        DiagnosticEmitter {
            listeners: Arc::new(self.listeners),
        }
    }
}

impl DiagnosticEmitter {
    /// An emitter with no listeners; events still reach `tracing`
    pub fn new() -> Self {
        Self::default()
    }

    /// Start building an emitter
    pub fn builder() -> DiagnosticEmitterBuilder {
        DiagnosticEmitterBuilder::default()
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Emit a constructed event
    pub fn emit(&self, event: DiagnosticEvent) {
        let payload = event
            .payload()
            .map(|p| p.to_string())
            .unwrap_or_default();
        match event.severity() {
            Severity::Debug => debug!(source = %event.source(), payload = %payload, "{}", event.message()),
            Severity::Info => info!(source = %event.source(), payload = %payload, "{}", event.message()),
            Severity::Warn => warn!(source = %event.source(), payload = %payload, "{}", event.message()),
            Severity::Error => error!(source = %event.source(), payload = %payload, "{}", event.message()),
        }

        for listener in self.listeners.iter() {
            // one faulty listener must not silence the rest or the caller
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(&event)));
            if delivered.is_err() {
                error!(source = %event.source(), "Diagnostic listener panicked");
            }
        }
    }

    /// Emit at DEBUG
    pub fn debug(&self, source: &str, message: impl Into<String>, payload: Option<Value>) {
        self.emit(DiagnosticEvent::new(Severity::Debug, source, message, payload));
    }

    /// Emit at INFO
    pub fn info(&self, source: &str, message: impl Into<String>, payload: Option<Value>) {
        self.emit(DiagnosticEvent::new(Severity::Info, source, message, payload));
    }

    /// Emit at WARN
    pub fn warn(&self, source: &str, message: impl Into<String>, payload: Option<Value>) {
        self.emit(DiagnosticEvent::new(Severity::Warn, source, message, payload));
    }

    /// Emit at ERROR
    pub fn error(&self, source: &str, message: impl Into<String>, payload: Option<Value>) {
        self.emit(DiagnosticEvent::new(Severity::Error, source, message, payload));
    }
}

impl fmt::Debug for DiagnosticEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticEmitter")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
