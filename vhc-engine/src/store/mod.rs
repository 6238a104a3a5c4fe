//! Persistence port for the reconciliation engine
//!
//! The engine never talks to a concrete database directly; everything
//! goes through the `FindingStore` trait. Two implementations ship with
//! the workspace: `SqliteStore` (the reference adapter) and `MemoryStore`
//! (in-memory, with failure and latency injection for tests).
//!
//! Duplicate creation is the caller's responsibility to avoid via content
//! matching; `create_finding` itself is safely retryable.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use uuid::Uuid;

use vhc_common::ids::{CanonicalId, DisplayId};
use vhc_common::model::{
    ApprovalStatus, DisplayStatus, JobSnapshot, NewFinding, PartLine, PersistedFinding,
};
use vhc_common::Result;

/// Field set applied to a persisted finding in one atomic update.
///
/// Outer `None` leaves a field untouched; for the doubly-optional fields
/// the inner `None` clears the stored value.
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    pub approval_status: Option<ApprovalStatus>,
    pub display_status: Option<DisplayStatus>,
    pub labour_hours: Option<Option<f64>>,
    pub labour_complete: Option<bool>,
    pub parts_complete: Option<bool>,
    pub parts_not_required: Option<bool>,
    pub total_override: Option<Option<Decimal>>,
}

impl StatusPatch {
    /// Apply this patch to a record, returning whether anything changed.
    pub fn apply_to(&self, finding: &mut PersistedFinding) -> bool {
        let mut changed = false;
        if let Some(status) = self.approval_status {
            changed |= finding.approval_status != status;
            finding.approval_status = status;
        }
        if let Some(display) = self.display_status {
            changed |= finding.display_status != display;
            finding.display_status = display;
        }
        if let Some(hours) = self.labour_hours {
            changed |= finding.labour_hours != hours;
            finding.labour_hours = hours;
        }
        if let Some(flag) = self.labour_complete {
            changed |= finding.labour_complete != flag;
            finding.labour_complete = flag;
        }
        if let Some(flag) = self.parts_complete {
            changed |= finding.parts_complete != flag;
            finding.parts_complete = flag;
        }
        if let Some(flag) = self.parts_not_required {
            changed |= finding.parts_not_required != flag;
            finding.parts_not_required = flag;
        }
        if let Some(total) = self.total_override {
            changed |= finding.total_override != total;
            finding.total_override = total;
        }
        changed
    }
}

/// Row-change notification pushed on a job's subscription feed.
///
/// Delivery may be duplicated or out of order; consumers merge
/// idempotently keyed on `updated_at`.
#[derive(Debug, Clone)]
pub enum StoreChange {
    /// A finding row was created or updated
    FindingUpserted { finding: PersistedFinding },
    /// The part lines linked to a finding changed (full replacement set)
    PartLinesChanged {
        finding_id: CanonicalId,
        lines: Vec<PartLine>,
    },
    /// An alias pair was written
    AliasUpserted {
        display_id: DisplayId,
        canonical_id: CanonicalId,
    },
    /// An alias pair was removed
    AliasRemoved { display_id: DisplayId },
}

/// Abstract persistence operations the engine consumes.
#[async_trait]
pub trait FindingStore: Send + Sync {
    /// Fetch everything persisted for one job: findings, their part
    /// lines, and alias rows.
    async fn fetch_job_findings(&self, job_id: Uuid) -> Result<JobSnapshot>;

    /// Create a new persisted finding and return its canonical id.
    async fn create_finding(&self, job_id: Uuid, new: NewFinding) -> Result<CanonicalId>;

    /// Apply a status patch to a finding in one atomic update.
    async fn update_finding_status(
        &self,
        canonical_id: CanonicalId,
        patch: StatusPatch,
    ) -> Result<()>;

    /// Persist an alias pair, displacing any conflicting pair.
    async fn upsert_alias(
        &self,
        job_id: Uuid,
        display_id: DisplayId,
        canonical_id: CanonicalId,
    ) -> Result<()>;

    /// Remove an alias pair. When `canonical_id` is given, only a pair
    /// still pointing at that canonical id is removed.
    async fn remove_alias(
        &self,
        job_id: Uuid,
        display_id: DisplayId,
        canonical_id: Option<CanonicalId>,
    ) -> Result<()>;

    /// Subscribe to row-change notifications scoped to one job.
    fn subscribe(&self, job_id: Uuid) -> broadcast::Receiver<StoreChange>;
}
