//! Event types for the VHC job event system
//!
//! Provides the shared `JobEvent` definitions and the `EventBus` the
//! engine emits on. Consumers (UI bridges, audit sinks) subscribe for
//! everything externally observable the engine does.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::ids::{CanonicalId, DisplayId};
use crate::model::{ApprovalStatus, DisplayStatus};

/// VHC job event types
///
/// Events are broadcast via EventBus and can be serialized for push
/// transmission to connected clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JobEvent {
    /// A finding gained a canonical record (matched or created)
    FindingMaterialized {
        display_id: DisplayId,
        canonical_id: CanonicalId,
        /// True when a new record was created, false when content matching
        /// attached an existing one
        created: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A finding's authorization status changed
    FindingStatusChanged {
        canonical_id: CanonicalId,
        old_status: ApprovalStatus,
        new_status: ApprovalStatus,
        display_status: DisplayStatus,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Labour estimate for a finding changed
    LabourChanged {
        canonical_id: CanonicalId,
        labour_hours: Option<f64>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A bulk decision finished (including partial failure)
    BulkDecisionApplied {
        status: ApprovalStatus,
        succeeded: usize,
        failed: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The job-level completion signal flipped
    CompletionChanged {
        complete: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A change from the store's notification feed was merged locally
    RemoteChangeMerged {
        canonical_id: Option<CanonicalId>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// An alias was released because its finding reverted to derived state
    AliasReleased {
        display_id: DisplayId,
        canonical_id: CanonicalId,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

// ========================================
// EventBus Implementation
// ========================================

/// Central event distribution bus for job-scoped engine events
///
/// Uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block the engine)
/// - Multiple concurrent subscribers
/// - Automatic cleanup when subscribers drop
/// - Lagged message detection for slow subscribers
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists,
    /// `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: JobEvent) -> Result<usize, broadcast::error::SendError<JobEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: JobEvent) {
        let _ = self.tx.send(event);
    }

    /// Current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(JobEvent::CompletionChanged {
            complete: true,
            timestamp: chrono::Utc::now(),
        })
        .unwrap();

        match rx.recv().await.unwrap() {
            JobEvent::CompletionChanged { complete, .. } => assert!(complete),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_lossy_without_subscribers() {
        let bus = EventBus::new(4);
        // No subscribers; must not panic or error
        bus.emit_lossy(JobEvent::CompletionChanged {
            complete: false,
            timestamp: chrono::Utc::now(),
        });
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.capacity(), 4);
    }
}
