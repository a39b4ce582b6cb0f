//! Bounded in-memory capture of recent diagnostic events
//!
//! Registered as a listener at emitter construction; an admin or debug
//! surface reads it through [`RecentEvents::query`].

use super::{DiagnosticEvent, DiagnosticListener, Severity};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Default number of retained events
pub const DEFAULT_CAPACITY: usize = 100;
/// Default number of events returned by a query
pub const DEFAULT_QUERY_LIMIT: usize = 50;

/// Ring buffer of the most recent events, newest first
#[derive(Debug)]
pub struct RecentEvents {
    capacity: usize,
    events: Mutex<VecDeque<DiagnosticEvent>>,
}

/// Filter applied by [`RecentEvents::query`]
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only events with this source tag
    pub source: Option<String>,
    /// Only events with this severity
    pub severity: Option<Severity>,
    /// Maximum number of events; [`DEFAULT_QUERY_LIMIT`] when unset
    pub limit: Option<usize>,
}

impl EventFilter {
    /// Restrict to a source tag
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Restrict to a severity
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Cap the number of results
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, event: &DiagnosticEvent) -> bool {
        self.source.as_deref().map_or(true, |s| event.source() == s)
            && self.severity.map_or(true, |s| event.severity() == s)
    }
}

impl RecentEvents {
    /// Create a buffer holding [`DEFAULT_CAPACITY`] events
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a buffer with a specific capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    /// Events matching the filter, newest first
    pub fn query(&self, filter: &EventFilter) -> Vec<DiagnosticEvent> {
        let limit = filter.limit.unwrap_or(DEFAULT_QUERY_LIMIT);
        match self.events.lock() {
            Ok(events) => events
                .iter()
                .filter(|e| filter.matches(e))
                .take(limit)
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Every retained event, newest first
    pub fn all(&self) -> Vec<DiagnosticEvent> {
        self.query(&EventFilter::default().limit(self.capacity))
    }

    /// Number of retained events
    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// True when nothing has been captured
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all retained events
    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl Default for RecentEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticListener for RecentEvents {
    fn on_event(&self, event: &DiagnosticEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push_front(event.clone());
            events.truncate(self.capacity);
        }
    }
}
