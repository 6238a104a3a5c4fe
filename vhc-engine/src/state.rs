//! Shared job state management
//!
//! Local cache of everything the engine knows about one job: persisted
//! finding records, their part lines, the optimistic display-level status
//! overlay used while operations are in flight, and per-field dirty
//! stamps that protect recent local edits from being clobbered by the
//! store's change feed.
//!
//! Mutated only through interleaved async completions; no engine-owned
//! threads touch it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use vhc_common::ids::{CanonicalId, DisplayId};
use vhc_common::model::{ApprovalStatus, DisplayStatus, JobSnapshot, PartLine, PersistedFinding};

use crate::store::StatusPatch;

/// Locally editable fields of a persisted finding, for dirty tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FindingField {
    ApprovalStatus,
    DisplayStatus,
    LabourHours,
    LabourComplete,
    PartsComplete,
    PartsNotRequired,
    TotalOverride,
}

#[derive(Default)]
struct JobStateInner {
    findings: HashMap<CanonicalId, PersistedFinding>,
    part_lines: HashMap<CanonicalId, Vec<PartLine>>,
    /// Optimistic display-level statuses for in-flight operations
    overlay: HashMap<DisplayId, ApprovalStatus>,
    /// When each editable field was last modified by this session
    dirty: HashMap<(CanonicalId, FindingField), Instant>,
    /// Last computed value of the job completion signal
    completion: Option<bool>,
}

/// Shared job state
#[derive(Clone, Default)]
pub struct SharedJobState {
    inner: Arc<RwLock<JobStateInner>>,
}

impl SharedJobState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace cache contents from a freshly fetched job snapshot.
    pub async fn load_snapshot(&self, snapshot: &JobSnapshot) {
        let mut inner = self.inner.write().await;
        inner.findings = snapshot
            .findings
            .iter()
            .map(|f| (f.canonical_id, f.clone()))
            .collect();
        inner.part_lines.clear();
        for line in &snapshot.part_lines {
            inner
                .part_lines
                .entry(line.finding_id)
                .or_default()
                .push(line.clone());
        }
        inner.overlay.clear();
        inner.dirty.clear();
    }

    pub async fn finding(&self, id: CanonicalId) -> Option<PersistedFinding> {
        self.inner.read().await.findings.get(&id).cloned()
    }

    pub async fn all_findings(&self) -> Vec<PersistedFinding> {
        self.inner.read().await.findings.values().cloned().collect()
    }

    pub async fn upsert_finding(&self, finding: PersistedFinding) {
        self.inner
            .write()
            .await
            .findings
            .insert(finding.canonical_id, finding);
    }

    pub async fn part_lines(&self, id: CanonicalId) -> Vec<PartLine> {
        self.inner
            .read()
            .await
            .part_lines
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn set_part_lines(&self, id: CanonicalId, lines: Vec<PartLine>) {
        self.inner.write().await.part_lines.insert(id, lines);
    }

    /// Snapshot of findings with their part lines, for aggregation.
    pub async fn findings_with_parts(&self) -> Vec<(PersistedFinding, Vec<PartLine>)> {
        let inner = self.inner.read().await;
        inner
            .findings
            .values()
            .map(|f| {
                let parts = inner
                    .part_lines
                    .get(&f.canonical_id)
                    .cloned()
                    .unwrap_or_default();
                (f.clone(), parts)
            })
            .collect()
    }

    /// Apply a patch to the cached record, returning the pre-patch record
    /// for revert. None if the record is unknown.
    pub async fn apply_patch(
        &self,
        id: CanonicalId,
        patch: &StatusPatch,
    ) -> Option<PersistedFinding> {
        let mut inner = self.inner.write().await;
        let finding = inner.findings.get_mut(&id)?;
        let prior = finding.clone();
        patch.apply_to(finding);
        Some(prior)
    }

    /// Restore a previously snapshotted record (revert path).
    pub async fn restore(&self, prior: PersistedFinding) {
        self.inner
            .write()
            .await
            .findings
            .insert(prior.canonical_id, prior);
    }

    // ---- optimistic overlay ----

    pub async fn overlay_set(&self, display_id: DisplayId, status: ApprovalStatus) {
        self.inner.write().await.overlay.insert(display_id, status);
    }

    pub async fn overlay_get(&self, display_id: &DisplayId) -> Option<ApprovalStatus> {
        self.inner.read().await.overlay.get(display_id).copied()
    }

    pub async fn overlay_clear(&self, display_id: &DisplayId) {
        self.inner.write().await.overlay.remove(display_id);
    }

    /// Put the overlay back how it was before an optimistic apply.
    pub async fn overlay_restore(&self, display_id: &DisplayId, prior: Option<ApprovalStatus>) {
        let mut inner = self.inner.write().await;
        match prior {
            Some(status) => inner.overlay.insert(display_id.clone(), status),
            None => inner.overlay.remove(display_id),
        };
    }

    // ---- dirty-field tracking ----

    pub async fn mark_dirty(&self, id: CanonicalId, field: FindingField) {
        self.inner
            .write()
            .await
            .dirty
            .insert((id, field), Instant::now());
    }

    pub async fn clear_dirty(&self, id: CanonicalId, field: FindingField) {
        self.inner.write().await.dirty.remove(&(id, field));
    }

    /// Whether this session modified the field within the given window.
    pub async fn dirty_within(
        &self,
        id: CanonicalId,
        field: FindingField,
        window: Duration,
    ) -> bool {
        self.inner
            .read()
            .await
            .dirty
            .get(&(id, field))
            .map(|stamp| stamp.elapsed() <= window)
            .unwrap_or(false)
    }

    /// Record a newly computed completion value, returning the previous one.
    pub async fn swap_completion(&self, complete: bool) -> Option<bool> {
        let mut inner = self.inner.write().await;
        inner.completion.replace(complete)
    }

    /// Convenience for presentation: the status to show for a finding,
    /// preferring decided display hints over severity colours.
    pub async fn display_status(&self, id: CanonicalId) -> Option<DisplayStatus> {
        self.inner
            .read()
            .await
            .findings
            .get(&id)
            .map(|f| f.display_status)
    }
}
