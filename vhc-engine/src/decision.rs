//! Decision State Machine
//!
//! Drives each finding through the authorization lifecycle:
//!
//! ```text
//! pending -> authorized | declined
//! authorized -> completed | pending
//! declined -> pending
//! completed -> pending        (rollback)
//! ```
//!
//! No direct pending -> completed or declined -> completed transition
//! exists. Transitions persist the approval status, the display hint, and
//! the current labour snapshot in one atomic update; local state is
//! applied optimistically and reverted if the store rejects the write.

use std::sync::Arc;

use tracing::{debug, warn};

use vhc_common::events::{EventBus, JobEvent};
use vhc_common::ids::{CanonicalId, DisplayId};
use vhc_common::model::{ApprovalStatus, DisplayStatus};
use vhc_common::{Error, Result};

use crate::extractor::Finding;
use crate::identity::AliasStore;
use crate::materialize::Materializer;
use crate::optimistic::commit_or_revert;
use crate::state::{FindingField, SharedJobState};
use crate::store::{FindingStore, StatusPatch};

/// Whether the authorization graph permits `from -> to`.
pub fn is_legal_transition(from: ApprovalStatus, to: ApprovalStatus) -> bool {
    use ApprovalStatus::*;
    matches!(
        (from, to),
        (Pending, Authorized)
            | (Pending, Declined)
            | (Authorized, Completed)
            | (Authorized, Pending)
            | (Declined, Pending)
            | (Completed, Pending)
    )
}

/// Display hint accompanying an approval status.
///
/// Decided findings display their decision; pending findings fall back to
/// the severity colour they were raised with.
pub fn display_hint(status: ApprovalStatus, severity: vhc_common::model::Severity) -> DisplayStatus {
    match status {
        ApprovalStatus::Authorized => DisplayStatus::Authorized,
        ApprovalStatus::Declined => DisplayStatus::Declined,
        ApprovalStatus::Completed => DisplayStatus::Completed,
        ApprovalStatus::Pending => DisplayStatus::from_severity(severity),
    }
}

/// Outcome of a status request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetStatusOutcome {
    /// Transition applied and persisted against this record
    Applied(CanonicalId),
    /// Nothing to do (already in the requested state, or pending with no
    /// persisted record, which is the default un-persisted state)
    NoOp,
}

/// Single-item decision operations for one job
pub struct DecisionEngine {
    state: SharedJobState,
    store: Arc<dyn FindingStore>,
    aliases: Arc<AliasStore>,
    materializer: Arc<Materializer>,
    events: EventBus,
}

impl DecisionEngine {
    pub fn new(
        state: SharedJobState,
        store: Arc<dyn FindingStore>,
        aliases: Arc<AliasStore>,
        materializer: Arc<Materializer>,
        events: EventBus,
    ) -> Self {
        Self {
            state,
            store,
            aliases,
            materializer,
            events,
        }
    }

    /// Request a transition for the finding behind `display_id`.
    ///
    /// `snapshot` is the currently derived finding, used to materialize a
    /// record when the target status requires one and none exists yet.
    pub async fn set_status(
        &self,
        display_id: &DisplayId,
        snapshot: Option<&Finding>,
        new_status: ApprovalStatus,
    ) -> Result<SetStatusOutcome> {
        let canonical = match self.aliases.resolve_canonical(display_id) {
            Some(id) => Some(id),
            None if new_status == ApprovalStatus::Pending => {
                // Pending is the default un-persisted state; nothing to
                // materialize, nothing to write
                return Ok(SetStatusOutcome::NoOp);
            }
            None => match snapshot {
                Some(finding) => self.materializer.get_or_create(finding, true).await?,
                None => None,
            },
        };
        let canonical = canonical.ok_or_else(|| {
            Error::NotFound(format!("no persisted record for finding {}", display_id))
        })?;

        let record = self
            .state
            .finding(canonical)
            .await
            .ok_or_else(|| Error::NotFound(format!("finding {}", canonical)))?;
        let current = record.approval_status;

        if current == new_status {
            return Ok(SetStatusOutcome::NoOp);
        }
        if !is_legal_transition(current, new_status) {
            return Err(Error::InvalidTransition {
                from: current.to_string(),
                to: new_status.to_string(),
            });
        }

        let hint = display_hint(new_status, record.severity);
        let patch = StatusPatch {
            approval_status: Some(new_status),
            display_status: Some(hint),
            // Labour rides along so the store row is coherent after one update
            labour_hours: Some(record.labour_hours),
            ..StatusPatch::default()
        };

        let prior = self
            .state
            .apply_patch(canonical, &patch)
            .await
            .ok_or_else(|| Error::NotFound(format!("finding {}", canonical)))?;
        self.state.mark_dirty(canonical, FindingField::ApprovalStatus).await;
        self.state.mark_dirty(canonical, FindingField::DisplayStatus).await;

        let state = self.state.clone();
        let revert_to = prior.clone();
        let result = commit_or_revert(
            self.store.update_finding_status(canonical, patch.clone()),
            move || async move {
                state.restore(revert_to).await;
                state.clear_dirty(canonical, FindingField::ApprovalStatus).await;
                state.clear_dirty(canonical, FindingField::DisplayStatus).await;
            },
        )
        .await;

        match result {
            Ok(()) => {
                // Commit the written values. Two racing transitions on the
                // same finding are not serialized; whichever response
                // resolves last lands here last and wins.
                self.state.apply_patch(canonical, &patch).await;
                debug!(canonical_id = %canonical, from = %current, to = %new_status, "Decision transition persisted");
                self.events.emit_lossy(JobEvent::FindingStatusChanged {
                    canonical_id: canonical,
                    old_status: current,
                    new_status,
                    display_status: hint,
                    timestamp: chrono::Utc::now(),
                });
                Ok(SetStatusOutcome::Applied(canonical))
            }
            Err(e) => {
                warn!(canonical_id = %canonical, from = %current, to = %new_status, error = %e,
                      "Decision transition failed, local state reverted");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::Category;
    use crate::store::MemoryStore;
    use uuid::Uuid;
    use vhc_common::ids;
    use vhc_common::model::Severity;

    fn pads_finding() -> Finding {
        Finding {
            display_id: ids::derive_display_id("Brakes & Hubs", "Front Pads", 0),
            section: "Brakes & Hubs".into(),
            heading: "Front Pads".into(),
            detail_text: "Worn to 3mm".into(),
            measurement: "3mm".into(),
            location_tag: "Front".into(),
            raw_severity: Severity::Amber,
            category: Category::Brakes,
        }
    }

    struct Rig {
        store: Arc<MemoryStore>,
        state: SharedJobState,
        engine: DecisionEngine,
    }

    fn rig() -> Rig {
        let store = Arc::new(MemoryStore::new());
        let job_id = Uuid::new_v4();
        let state = SharedJobState::new();
        let aliases = Arc::new(AliasStore::new(job_id, store.clone() as Arc<dyn FindingStore>));
        let events = EventBus::new(16);
        let materializer = Arc::new(Materializer::new(
            job_id,
            store.clone() as Arc<dyn FindingStore>,
            aliases.clone(),
            state.clone(),
            events.clone(),
        ));
        let engine = DecisionEngine::new(
            state.clone(),
            store.clone() as Arc<dyn FindingStore>,
            aliases,
            materializer,
            events,
        );
        Rig { store, state, engine }
    }

    #[test]
    fn test_transition_graph() {
        use ApprovalStatus::*;
        let legal = [
            (Pending, Authorized),
            (Pending, Declined),
            (Authorized, Completed),
            (Authorized, Pending),
            (Declined, Pending),
            (Completed, Pending),
        ];
        for (from, to) in legal {
            assert!(is_legal_transition(from, to), "{} -> {} should be legal", from, to);
        }
        let illegal = [
            (Pending, Completed),
            (Declined, Completed),
            (Declined, Authorized),
            (Completed, Authorized),
            (Completed, Declined),
            (Authorized, Declined),
        ];
        for (from, to) in illegal {
            assert!(!is_legal_transition(from, to), "{} -> {} should be illegal", from, to);
        }
    }

    #[tokio::test]
    async fn test_pending_without_record_is_noop() {
        let r = rig();
        let pads = pads_finding();
        let outcome = r
            .engine
            .set_status(&pads.display_id, Some(&pads), ApprovalStatus::Pending)
            .await
            .unwrap();
        assert_eq!(outcome, SetStatusOutcome::NoOp);
        assert_eq!(r.store.finding_count(), 0, "no record materialized");
    }

    #[tokio::test]
    async fn test_decline_materializes_and_persists() {
        let r = rig();
        let pads = pads_finding();
        let outcome = r
            .engine
            .set_status(&pads.display_id, Some(&pads), ApprovalStatus::Declined)
            .await
            .unwrap();

        let SetStatusOutcome::Applied(id) = outcome else {
            panic!("expected Applied");
        };
        let stored = r.store.finding(id).unwrap();
        assert_eq!(stored.approval_status, ApprovalStatus::Declined);
        assert_eq!(stored.display_status, DisplayStatus::Declined);
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected_without_mutation() {
        let r = rig();
        let pads = pads_finding();
        r.engine
            .set_status(&pads.display_id, Some(&pads), ApprovalStatus::Declined)
            .await
            .unwrap();

        let result = r
            .engine
            .set_status(&pads.display_id, Some(&pads), ApprovalStatus::Completed)
            .await;
        assert!(matches!(result, Err(Error::InvalidTransition { .. })));

        // Neither the store nor the cache moved
        let snapshot = r.store.fetch_job_findings(r.store.finding(CanonicalId::new(1)).unwrap().job_id)
            .await
            .unwrap();
        assert_eq!(snapshot.findings[0].approval_status, ApprovalStatus::Declined);
        let cached = r.state.finding(CanonicalId::new(1)).await.unwrap();
        assert_eq!(cached.approval_status, ApprovalStatus::Declined);
    }

    #[tokio::test]
    async fn test_failed_persistence_reverts_local_state() {
        let r = rig();
        let pads = pads_finding();
        // Materialize first so the record exists
        r.engine
            .set_status(&pads.display_id, Some(&pads), ApprovalStatus::Authorized)
            .await
            .unwrap();

        r.store.fail_next_updates(1);
        let result = r
            .engine
            .set_status(&pads.display_id, Some(&pads), ApprovalStatus::Completed)
            .await;
        assert!(result.is_err());

        let cached = r.state.finding(CanonicalId::new(1)).await.unwrap();
        assert_eq!(
            cached.approval_status,
            ApprovalStatus::Authorized,
            "optimistic change reverted"
        );
        let stored = r.store.finding(CanonicalId::new(1)).unwrap();
        assert_eq!(stored.approval_status, ApprovalStatus::Authorized);
    }

    #[tokio::test]
    async fn test_reset_restores_severity_display() {
        let r = rig();
        let pads = pads_finding();
        r.engine
            .set_status(&pads.display_id, Some(&pads), ApprovalStatus::Declined)
            .await
            .unwrap();
        r.engine
            .set_status(&pads.display_id, Some(&pads), ApprovalStatus::Pending)
            .await
            .unwrap();

        let stored = r.store.finding(CanonicalId::new(1)).unwrap();
        assert_eq!(stored.approval_status, ApprovalStatus::Pending);
        assert_eq!(
            stored.display_status,
            DisplayStatus::Amber,
            "display falls back to the original severity, not the old decision"
        );
    }

    #[tokio::test]
    async fn test_same_status_request_is_noop() {
        let r = rig();
        let pads = pads_finding();
        r.engine
            .set_status(&pads.display_id, Some(&pads), ApprovalStatus::Authorized)
            .await
            .unwrap();
        let outcome = r
            .engine
            .set_status(&pads.display_id, Some(&pads), ApprovalStatus::Authorized)
            .await
            .unwrap();
        assert_eq!(outcome, SetStatusOutcome::NoOp);
    }
}
