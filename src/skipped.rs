//! Skipped events: retrieved from the engine but never delivered
//!
//! The dispatcher never drops an event silently. Anything it cannot route
//! (no handler, unknown subject, undecodable kind) or chooses not to deliver
//! on stop is logged and handed to a `SkippedEventSink`.

use crate::error::{BridgeError, Result};
use crate::types::{now_millis, RawEvent};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Why an event was not delivered
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum SkipReason {
    /// The agent is active but has no handler registered
    NoHandler,
    /// The subject is not an active agent (released, or never known)
    UnknownSubject,
    /// The kind tag is not one the bridge decodes
    UnknownKind { tag: i32 },
    /// An outbound-only kind arrived inbound
    Unsupported { tag: i32 },
    /// Retrieved before a stop and not delivered under `StopPolicy::Skip`
    Cancelled,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NoHandler => f.write_str("no handler registered"),
            SkipReason::UnknownSubject => f.write_str("subject is not an active agent"),
            SkipReason::UnknownKind { tag } => write!(f, "unknown event kind {}", tag),
            SkipReason::Unsupported { tag } => write!(f, "unsupported inbound kind {}", tag),
            SkipReason::Cancelled => f.write_str("dispatch loop stopped"),
        }
    }
}

/// An undelivered event with context
#[derive(Debug, Clone)]
pub struct SkippedEvent {
    /// The event as retrieved from the engine
    pub raw: RawEvent,

    /// Agent name, when the subject could be resolved
    pub agent: Option<String>,

    pub reason: SkipReason,

    /// Unix timestamp in milliseconds
    pub skipped_at: u64,
}

impl SkippedEvent {
    pub fn new(raw: RawEvent, agent: Option<String>, reason: SkipReason) -> Self {
        Self {
            raw,
            agent,
            reason,
            skipped_at: now_millis(),
        }
    }
}

/// Destination for undelivered events
pub trait SkippedEventSink: Send + Sync {
    /// Record an undelivered event
    fn record(&self, event: SkippedEvent) -> Result<()>;

    /// Number of events currently held
    fn count(&self) -> Result<usize>;

    /// Most recent events, newest first
    fn list(&self, limit: usize) -> Result<Vec<SkippedEvent>>;
}

/// Bounded in-memory sink
///
/// Keeps at most `max_events` records (0 = unbounded); oldest are drained
/// first.
pub struct MemorySkippedEvents {
    events: Arc<Mutex<VecDeque<SkippedEvent>>>,
    max_events: usize,
}

impl MemorySkippedEvents {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            max_events,
        }
    }
}

impl Default for MemorySkippedEvents {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl SkippedEventSink for MemorySkippedEvents {
    fn record(&self, event: SkippedEvent) -> Result<()> {
        tracing::warn!(
            agent = ?event.agent,
            subject = %event.raw.subject,
            kind = event.raw.kind,
            reason = %event.reason,
            "Event skipped"
        );

        let mut events = self
            .events
            .lock()
            .map_err(|e| BridgeError::Lock(format!("skipped events: {}", e)))?;
        events.push_back(event);

        if self.max_events > 0 && events.len() > self.max_events {
            let drain_count = events.len() - self.max_events;
            events.drain(..drain_count);
        }

        Ok(())
    }

    fn count(&self) -> Result<usize> {
        let events = self
            .events
            .lock()
            .map_err(|e| BridgeError::Lock(format!("skipped events: {}", e)))?;
        Ok(events.len())
    }

    fn list(&self, limit: usize) -> Result<Vec<SkippedEvent>> {
        let events = self
            .events
            .lock()
            .map_err(|e| BridgeError::Lock(format!("skipped events: {}", e)))?;
        Ok(events.iter().rev().take(limit).cloned().collect())
    }
}
