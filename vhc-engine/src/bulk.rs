//! Bulk Operation Coordinator
//!
//! Applies one decision to a selection of findings. Local state is
//! updated optimistically for the whole selection, then each item makes
//! its own materialize-and-persist round trip. Failures are isolated per
//! item: one bad network call never rolls back its successful siblings,
//! and an all-or-nothing transaction across dozens of independently
//! identified findings was rejected deliberately for that reason.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};

use vhc_common::events::{EventBus, JobEvent};
use vhc_common::ids::DisplayId;
use vhc_common::model::{ApprovalStatus, Severity};
use vhc_common::Error;

use crate::decision::DecisionEngine;
use crate::extractor::Finding;
use crate::state::SharedJobState;

/// Transient per-severity-bucket selection of findings for bulk actions.
#[derive(Debug, Default)]
pub struct DecisionSelection {
    buckets: HashMap<Severity, HashSet<DisplayId>>,
}

impl DecisionSelection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&mut self, bucket: Severity, display_id: DisplayId) {
        self.buckets.entry(bucket).or_default().insert(display_id);
    }

    pub fn deselect(&mut self, bucket: Severity, display_id: &DisplayId) {
        if let Some(set) = self.buckets.get_mut(&bucket) {
            set.remove(display_id);
        }
    }

    pub fn is_selected(&self, bucket: Severity, display_id: &DisplayId) -> bool {
        self.buckets
            .get(&bucket)
            .map(|set| set.contains(display_id))
            .unwrap_or(false)
    }

    pub fn len(&self, bucket: Severity) -> usize {
        self.buckets.get(&bucket).map(HashSet::len).unwrap_or(0)
    }

    pub fn is_empty(&self, bucket: Severity) -> bool {
        self.len(bucket) == 0
    }

    /// Remove and return a bucket's selection. The selection is always
    /// consumed up front so it ends empty whatever the operation does.
    pub fn take(&mut self, bucket: Severity) -> HashSet<DisplayId> {
        self.buckets.remove(&bucket).unwrap_or_default()
    }
}

/// Per-item results of one bulk operation.
///
/// The operation itself completes even with failures in here; callers
/// inspect `failed` explicitly.
#[derive(Debug)]
pub struct BulkOutcome {
    pub succeeded: Vec<DisplayId>,
    pub failed: Vec<(DisplayId, Error)>,
}

/// Bulk decision application for one job
pub struct BulkCoordinator {
    state: SharedJobState,
    decision: Arc<DecisionEngine>,
    events: EventBus,
}

impl BulkCoordinator {
    pub fn new(state: SharedJobState, decision: Arc<DecisionEngine>, events: EventBus) -> Self {
        Self {
            state,
            decision,
            events,
        }
    }

    /// Apply `new_status` to every selected finding.
    ///
    /// `snapshots` supplies the derived finding for each display id so
    /// unmaterialized targets can be promoted on the way through.
    pub async fn apply_bulk_decision(
        &self,
        selection: HashSet<DisplayId>,
        snapshots: &HashMap<DisplayId, Finding>,
        new_status: ApprovalStatus,
    ) -> BulkOutcome {
        debug!(count = selection.len(), status = %new_status, "Applying bulk decision");

        // Snapshot the overlay state, then apply the optimistic change to
        // the whole selection before any network round trip
        let mut prior_overlay = HashMap::new();
        for display_id in &selection {
            prior_overlay.insert(display_id.clone(), self.state.overlay_get(display_id).await);
            self.state
                .overlay_set(display_id.clone(), new_status)
                .await;
        }

        // Per-item round trips, concurrent and unordered across findings
        let results = join_all(selection.iter().map(|display_id| {
            let decision = Arc::clone(&self.decision);
            async move {
                let outcome = decision
                    .set_status(display_id, snapshots.get(display_id), new_status)
                    .await;
                (display_id.clone(), outcome)
            }
        }))
        .await;

        let mut outcome = BulkOutcome {
            succeeded: Vec::new(),
            failed: Vec::new(),
        };
        for (display_id, result) in results {
            match result {
                Ok(_) => {
                    // Cache is authoritative again for this finding
                    self.state.overlay_clear(&display_id).await;
                    outcome.succeeded.push(display_id);
                }
                Err(e) => {
                    // Failed items read as unchanged within the batch;
                    // siblings keep their new state
                    let prior = prior_overlay.get(&display_id).cloned().flatten();
                    self.state.overlay_restore(&display_id, prior).await;
                    warn!(display_id = %display_id, error = %e, "Bulk item failed");
                    outcome.failed.push((display_id, e));
                }
            }
        }

        self.events.emit_lossy(JobEvent::BulkDecisionApplied {
            status: new_status,
            succeeded: outcome.succeeded.len(),
            failed: outcome.failed.len(),
            timestamp: chrono::Utc::now(),
        });
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::Category;
    use crate::identity::AliasStore;
    use crate::materialize::Materializer;
    use crate::store::{FindingStore, MemoryStore};
    use uuid::Uuid;
    use vhc_common::ids;

    fn finding(heading: &str, index: usize) -> Finding {
        Finding {
            display_id: ids::derive_display_id("Brakes & Hubs", heading, index),
            section: "Brakes & Hubs".into(),
            heading: heading.into(),
            detail_text: format!("{} needs attention", heading),
            measurement: String::new(),
            location_tag: "Front".into(),
            raw_severity: Severity::Red,
            category: Category::Brakes,
        }
    }

    struct Rig {
        store: Arc<MemoryStore>,
        state: SharedJobState,
        coordinator: BulkCoordinator,
        job_id: Uuid,
    }

    fn rig() -> Rig {
        let store = Arc::new(MemoryStore::new());
        let job_id = Uuid::new_v4();
        let state = SharedJobState::new();
        let aliases = Arc::new(AliasStore::new(job_id, store.clone() as Arc<dyn FindingStore>));
        let events = EventBus::new(64);
        let materializer = Arc::new(Materializer::new(
            job_id,
            store.clone() as Arc<dyn FindingStore>,
            aliases.clone(),
            state.clone(),
            events.clone(),
        ));
        let decision = Arc::new(DecisionEngine::new(
            state.clone(),
            store.clone() as Arc<dyn FindingStore>,
            aliases,
            materializer,
            events.clone(),
        ));
        let coordinator = BulkCoordinator::new(state.clone(), decision, events);
        Rig {
            store,
            state,
            coordinator,
            job_id,
        }
    }

    #[tokio::test]
    async fn test_partial_failure_isolated_per_item() {
        let r = rig();
        let findings: Vec<Finding> = (0..5)
            .map(|i| finding(&format!("Item {}", i), i))
            .collect();
        // One target fails materialization
        r.store.fail_creates_titled("Item 3");

        let mut selection = DecisionSelection::new();
        let mut snapshots = HashMap::new();
        for f in &findings {
            selection.select(Severity::Red, f.display_id.clone());
            snapshots.insert(f.display_id.clone(), f.clone());
        }

        let taken = selection.take(Severity::Red);
        let outcome = r
            .coordinator
            .apply_bulk_decision(taken, &snapshots, ApprovalStatus::Authorized)
            .await;

        assert_eq!(outcome.succeeded.len(), 4);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, findings[3].display_id);
        assert!(selection.is_empty(Severity::Red));

        // Successful findings persisted with the new status
        let snapshot = r.store.fetch_job_findings(r.job_id).await.unwrap();
        for f in findings.iter().filter(|f| f.heading != "Item 3") {
            let record = snapshot
                .findings
                .iter()
                .find(|p| p.issue_title == f.heading)
                .expect("record exists");
            assert_eq!(record.approval_status, ApprovalStatus::Authorized);
        }

        // The failed finding has no record and reads as unchanged
        assert_eq!(r.store.finding_count(), 4);
        assert_eq!(r.state.overlay_get(&findings[3].display_id).await, None);
    }

    #[tokio::test]
    async fn test_selection_bookkeeping() {
        let mut selection = DecisionSelection::new();
        let a = DisplayId::new("vhc-a");
        let b = DisplayId::new("vhc-b");

        selection.select(Severity::Red, a.clone());
        selection.select(Severity::Red, a.clone());
        selection.select(Severity::Amber, b.clone());
        assert_eq!(selection.len(Severity::Red), 1);
        assert!(selection.is_selected(Severity::Red, &a));
        assert!(!selection.is_selected(Severity::Red, &b));

        selection.deselect(Severity::Red, &a);
        assert!(selection.is_empty(Severity::Red));
        assert_eq!(selection.len(Severity::Amber), 1);

        let taken = selection.take(Severity::Amber);
        assert_eq!(taken.len(), 1);
        assert!(selection.is_empty(Severity::Amber));
    }

    #[tokio::test]
    async fn test_bulk_decline_then_reset() {
        let r = rig();
        let f = finding("Front Pads", 0);
        let mut snapshots = HashMap::new();
        snapshots.insert(f.display_id.clone(), f.clone());
        let selection: HashSet<DisplayId> = [f.display_id.clone()].into_iter().collect();

        let outcome = r
            .coordinator
            .apply_bulk_decision(selection.clone(), &snapshots, ApprovalStatus::Declined)
            .await;
        assert_eq!(outcome.succeeded.len(), 1);

        let outcome = r
            .coordinator
            .apply_bulk_decision(selection, &snapshots, ApprovalStatus::Pending)
            .await;
        assert_eq!(outcome.succeeded.len(), 1);

        let record = r.store.finding(vhc_common::ids::CanonicalId::new(1)).unwrap();
        assert_eq!(record.approval_status, ApprovalStatus::Pending);
    }
}
