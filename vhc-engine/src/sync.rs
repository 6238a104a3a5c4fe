//! Sync bridge: merging the store's change feed into local state
//!
//! The store pushes row changes that may arrive duplicated or out of
//! order, possibly while a local write for the same finding is pending.
//! Merge policy is field-level last-write-wins: an incoming field lands
//! unless this session modified that field within the debounce window, in
//! which case the local value is kept. Merge conflicts are not errors and
//! never surface to the user.

use std::time::Duration;

use tracing::{debug, trace};

use vhc_common::ids::CanonicalId;
use vhc_common::model::PersistedFinding;

use crate::identity::AliasStore;
use crate::state::{FindingField, SharedJobState};
use crate::store::StoreChange;

/// What a merge did, for completion recomputation and event emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Whether local state changed at all
    pub changed: bool,
    /// The finding the change was scoped to, if any
    pub canonical_id: Option<CanonicalId>,
}

impl MergeOutcome {
    fn unchanged() -> Self {
        Self {
            changed: false,
            canonical_id: None,
        }
    }
}

/// Merge one feed notification into local state.
pub async fn merge_change(
    state: &SharedJobState,
    aliases: &AliasStore,
    window: Duration,
    change: StoreChange,
) -> MergeOutcome {
    match change {
        StoreChange::FindingUpserted { finding } => merge_finding(state, window, finding).await,
        StoreChange::PartLinesChanged { finding_id, lines } => {
            state.set_part_lines(finding_id, lines).await;
            MergeOutcome {
                changed: true,
                canonical_id: Some(finding_id),
            }
        }
        StoreChange::AliasUpserted {
            display_id,
            canonical_id,
        } => {
            aliases.apply_remote(display_id, canonical_id);
            MergeOutcome {
                changed: true,
                canonical_id: Some(canonical_id),
            }
        }
        StoreChange::AliasRemoved { display_id } => {
            aliases.remove_remote(&display_id);
            MergeOutcome::unchanged()
        }
    }
}

async fn merge_finding(
    state: &SharedJobState,
    window: Duration,
    incoming: PersistedFinding,
) -> MergeOutcome {
    let id = incoming.canonical_id;

    let local = match state.finding(id).await {
        Some(local) => local,
        None => {
            // Unknown record (e.g. created by another session); take it whole
            debug!(canonical_id = %id, "Adopting remote finding");
            state.upsert_finding(incoming).await;
            return MergeOutcome {
                changed: true,
                canonical_id: Some(id),
            };
        }
    };

    // Duplicate or out-of-order notification: nothing newer here
    if incoming.updated_at <= local.updated_at {
        trace!(canonical_id = %id, "Stale or duplicate notification ignored");
        return MergeOutcome::unchanged();
    }

    // Start from the incoming row, then shield fields this session
    // touched within the debounce window
    let mut merged = incoming;
    if state.dirty_within(id, FindingField::ApprovalStatus, window).await {
        merged.approval_status = local.approval_status;
    }
    if state.dirty_within(id, FindingField::DisplayStatus, window).await {
        merged.display_status = local.display_status;
    }
    if state.dirty_within(id, FindingField::LabourHours, window).await {
        merged.labour_hours = local.labour_hours;
    }
    if state.dirty_within(id, FindingField::LabourComplete, window).await {
        merged.labour_complete = local.labour_complete;
    }
    if state.dirty_within(id, FindingField::PartsComplete, window).await {
        merged.parts_complete = local.parts_complete;
    }
    if state.dirty_within(id, FindingField::PartsNotRequired, window).await {
        merged.parts_not_required = local.parts_not_required;
    }
    if state.dirty_within(id, FindingField::TotalOverride, window).await {
        merged.total_override = local.total_override;
    }

    let changed = merged != local;
    if changed {
        debug!(canonical_id = %id, "Merged remote finding change");
        state.upsert_finding(merged).await;
    }
    MergeOutcome {
        changed,
        canonical_id: Some(id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FindingStore, MemoryStore};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::Arc;
    use uuid::Uuid;
    use vhc_common::ids::DisplayId;
    use vhc_common::model::{ApprovalStatus, NewFinding, Severity};

    const WINDOW: Duration = Duration::from_millis(650);

    fn record(id: i64) -> PersistedFinding {
        NewFinding {
            section: "Brakes & Hubs".into(),
            sub_area_key: "front".into(),
            source_key: "front pads".into(),
            line_key: "k".into(),
            issue_title: "Front Pads".into(),
            issue_description: "worn".into(),
            severity: Severity::Amber,
            labour_hours: None,
        }
        .into_persisted(CanonicalId::new(id), Uuid::new_v4(), Utc::now())
    }

    fn harness() -> (SharedJobState, AliasStore) {
        let store = Arc::new(MemoryStore::new());
        let state = SharedJobState::new();
        let aliases = AliasStore::new(Uuid::new_v4(), store as Arc<dyn FindingStore>);
        (state, aliases)
    }

    #[tokio::test]
    async fn test_unknown_record_adopted() {
        let (state, aliases) = harness();
        let outcome = merge_change(
            &state,
            &aliases,
            WINDOW,
            StoreChange::FindingUpserted { finding: record(1) },
        )
        .await;
        assert!(outcome.changed);
        assert!(state.finding(CanonicalId::new(1)).await.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_notification_is_idempotent() {
        let (state, aliases) = harness();
        let finding = record(1);
        state.upsert_finding(finding.clone()).await;

        let outcome = merge_change(
            &state,
            &aliases,
            WINDOW,
            StoreChange::FindingUpserted { finding },
        )
        .await;
        assert!(!outcome.changed);
    }

    #[tokio::test]
    async fn test_out_of_order_older_change_ignored() {
        let (state, aliases) = harness();
        let current = record(1);
        state.upsert_finding(current.clone()).await;

        let mut stale = current.clone();
        stale.approval_status = ApprovalStatus::Declined;
        stale.updated_at = current.updated_at - ChronoDuration::seconds(30);

        let outcome = merge_change(
            &state,
            &aliases,
            WINDOW,
            StoreChange::FindingUpserted { finding: stale },
        )
        .await;
        assert!(!outcome.changed);
        let local = state.finding(CanonicalId::new(1)).await.unwrap();
        assert_eq!(local.approval_status, ApprovalStatus::Pending);
    }

    #[tokio::test]
    async fn test_locally_dirty_field_shielded() {
        let (state, aliases) = harness();
        let current = record(1);
        state.upsert_finding(current.clone()).await;

        // This session just edited labour; remote also changed labour and
        // the description
        state
            .mark_dirty(CanonicalId::new(1), FindingField::LabourHours)
            .await;
        let local_patch = crate::store::StatusPatch {
            labour_hours: Some(Some(2.5)),
            ..Default::default()
        };
        state.apply_patch(CanonicalId::new(1), &local_patch).await;

        let mut incoming = current.clone();
        incoming.labour_hours = Some(9.0);
        incoming.issue_description = "worn, customer notified".into();
        incoming.updated_at = current.updated_at + ChronoDuration::seconds(5);

        let outcome = merge_change(
            &state,
            &aliases,
            WINDOW,
            StoreChange::FindingUpserted { finding: incoming },
        )
        .await;
        assert!(outcome.changed);

        let merged = state.finding(CanonicalId::new(1)).await.unwrap();
        assert_eq!(merged.labour_hours, Some(2.5), "local edit survives");
        assert_eq!(
            merged.issue_description, "worn, customer notified",
            "untouched field takes the remote value"
        );
    }

    #[tokio::test]
    async fn test_stale_dirty_stamp_does_not_shield() {
        let (state, aliases) = harness();
        let current = record(1);
        state.upsert_finding(current.clone()).await;

        // Dirty stamp outside the window: remote wins
        state
            .mark_dirty(CanonicalId::new(1), FindingField::LabourHours)
            .await;
        tokio::time::pause();
        tokio::time::advance(Duration::from_secs(5)).await;

        let mut incoming = current.clone();
        incoming.labour_hours = Some(9.0);
        incoming.updated_at = current.updated_at + ChronoDuration::seconds(5);

        merge_change(
            &state,
            &aliases,
            WINDOW,
            StoreChange::FindingUpserted { finding: incoming },
        )
        .await;
        let merged = state.finding(CanonicalId::new(1)).await.unwrap();
        assert_eq!(merged.labour_hours, Some(9.0));
    }

    #[tokio::test]
    async fn test_part_lines_replaced_and_alias_changes_applied() {
        let (state, aliases) = harness();
        let display = DisplayId::new("vhc-a");

        let outcome = merge_change(
            &state,
            &aliases,
            WINDOW,
            StoreChange::AliasUpserted {
                display_id: display.clone(),
                canonical_id: CanonicalId::new(3),
            },
        )
        .await;
        assert!(outcome.changed);
        assert_eq!(aliases.resolve_canonical(&display), Some(CanonicalId::new(3)));

        merge_change(
            &state,
            &aliases,
            WINDOW,
            StoreChange::AliasRemoved {
                display_id: display.clone(),
            },
        )
        .await;
        assert_eq!(aliases.resolve_canonical(&display), None);
    }
}
