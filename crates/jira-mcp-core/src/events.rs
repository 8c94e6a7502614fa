//! Core events
//!
//! Security- and lifecycle-relevant happenings are reported as structured
//! [`CoreEvent`] values to an injected [`EventObserver`]. The default
//! [`EventLog`] forwards them to `tracing` and keeps the most recent ones in
//! a ring buffer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::error::ErrorKind;
use crate::ticket_key::TicketKey;

/// Maximum number of events kept by [`EventLog`]
const MAX_EVENTS: usize = 256;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    AttachmentStored {
        key: TicketKey,
        filename: String,
        bytes: u64,
        backend: String,
    },
    AttachmentRejected {
        key: TicketKey,
        filename: String,
        kind: ErrorKind,
        reason: String,
    },
    PathEscape {
        key: Option<TicketKey>,
        path: PathBuf,
    },
    Cleanup {
        key: Option<TicketKey>,
        tickets: usize,
        files: usize,
    },
    ContentTruncated {
        source: String,
        original_chars: usize,
        submitted_chars: usize,
    },
    IndexRebuilt {
        tickets: usize,
        records: usize,
    },
}

/// Receiver of core events
pub trait EventObserver: Send + Sync {
    fn record(&self, event: CoreEvent);
}

/// An event with the time it was recorded
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: CoreEvent,
}

/// Default observer: `tracing` plus a bounded in-memory history
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<VecDeque<EventRecord>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent events, oldest first
    pub fn recent(&self) -> Vec<EventRecord> {
        self.lock().iter().cloned().collect()
    }

    /// Events only, without timestamps
    pub fn events(&self) -> Vec<CoreEvent> {
        self.lock().iter().map(|r| r.event.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<EventRecord>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn trace(event: &CoreEvent) {
        match event {
            CoreEvent::AttachmentStored {
                key,
                filename,
                bytes,
                backend,
            } => info!(key = %key, filename = %filename, bytes, backend = %backend, "Attachment stored"),
            CoreEvent::AttachmentRejected {
                key,
                filename,
                kind,
                reason,
            } => warn!(key = %key, filename = %filename, kind = %kind, reason = %reason, "Attachment rejected"),
            CoreEvent::PathEscape { key, path } => warn!(
                key = ?key.as_ref().map(TicketKey::as_str),
                path = %path.display(),
                security = true,
                "Path escape attempt blocked"
            ),
            CoreEvent::Cleanup {
                key,
                tickets,
                files,
            } => info!(
                key = ?key.as_ref().map(TicketKey::as_str),
                tickets,
                files,
                "Attachments cleaned up"
            ),
            CoreEvent::ContentTruncated {
                source,
                original_chars,
                submitted_chars,
            } => info!(
                source = %source,
                original_chars,
                submitted_chars,
                "Content truncated to fit the context window"
            ),
            CoreEvent::IndexRebuilt { tickets, records } => {
                info!(tickets, records, "Attachment index rebuilt from disk")
            }
        }
    }
}

impl EventObserver for EventLog {
    fn record(&self, event: CoreEvent) {
        Self::trace(&event);
        let mut events = self.lock();
        if events.len() >= MAX_EVENTS {
            events.pop_front();
        }
        events.push_back(EventRecord {
            at: Utc::now(),
            event,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_drops_oldest() {
        let log = EventLog::new();
        for i in 0..(MAX_EVENTS + 10) {
            log.record(CoreEvent::IndexRebuilt {
                tickets: i,
                records: 0,
            });
        }
        assert_eq!(log.len(), MAX_EVENTS);
        match &log.events()[0] {
            CoreEvent::IndexRebuilt { tickets, .. } => assert_eq!(*tickets, 10),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let log = EventLog::new();
        log.record(CoreEvent::Cleanup {
            key: Some(TicketKey::parse("PROJ-1").unwrap()),
            tickets: 1,
            files: 3,
        });
        let json = serde_json::to_value(&log.recent()[0]).unwrap();
        assert_eq!(json["event"], "cleanup");
        assert_eq!(json["key"], "PROJ-1");
        assert_eq!(json["files"], 3);
        assert!(json["at"].is_string());
    }
}
