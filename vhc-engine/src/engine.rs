//! Reconciliation engine facade
//!
//! Owns one job's view of the world: the alias map, the persisted-finding
//! cache, the derived finding list, the bulk selection, and the debounced
//! write timers. The host application re-derives findings through it on
//! every document change and routes every decision, labour, parts and
//! override edit through it.
//!
//! All persistence is asynchronous; nothing here blocks or spawns worker
//! threads. Operations on different findings run concurrently and
//! unordered. Two racing operations on the same finding are not
//! serialized: the later-resolving store response wins.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use vhc_common::config::EngineConfig;
use vhc_common::events::{EventBus, JobEvent};
use vhc_common::ids::{CanonicalId, DisplayId};
use vhc_common::model::{ApprovalStatus, Severity};
use vhc_common::{Error, Result};

use crate::bulk::{BulkCoordinator, BulkOutcome, DecisionSelection};
use crate::costing::{self, Audience, CostBreakdown, JobTotals, LabourRates};
use crate::debounce::DebounceMap;
use crate::decision::{DecisionEngine, SetStatusOutcome};
use crate::extractor::{derive_findings, ChecklistDocument, Finding};
use crate::identity::AliasStore;
use crate::materialize::Materializer;
use crate::optimistic::commit_or_revert;
use crate::state::{FindingField, SharedJobState};
use crate::store::{FindingStore, StatusPatch, StoreChange};
use crate::sync;

/// Finding reconciliation and authorization engine for one job
pub struct ReconciliationEngine {
    job_id: Uuid,
    config: EngineConfig,
    rates: LabourRates,
    store: Arc<dyn FindingStore>,
    state: SharedJobState,
    aliases: Arc<AliasStore>,
    materializer: Arc<Materializer>,
    decision: Arc<DecisionEngine>,
    bulk: BulkCoordinator,
    selection: Mutex<DecisionSelection>,
    debounce: DebounceMap<(CanonicalId, FindingField)>,
    events: EventBus,
    /// Latest derived findings, keyed by display id
    derived: RwLock<HashMap<DisplayId, Finding>>,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl ReconciliationEngine {
    pub fn new(job_id: Uuid, store: Arc<dyn FindingStore>, config: EngineConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        let state = SharedJobState::new();
        let aliases = Arc::new(AliasStore::new(job_id, Arc::clone(&store)));
        let materializer = Arc::new(Materializer::new(
            job_id,
            Arc::clone(&store),
            Arc::clone(&aliases),
            state.clone(),
            events.clone(),
        ));
        let decision = Arc::new(DecisionEngine::new(
            state.clone(),
            Arc::clone(&store),
            Arc::clone(&aliases),
            Arc::clone(&materializer),
            events.clone(),
        ));
        let bulk = BulkCoordinator::new(state.clone(), Arc::clone(&decision), events.clone());
        let debounce = DebounceMap::new(config.debounce_window());

        Self {
            job_id,
            rates: LabourRates::from_config(&config),
            config,
            store,
            state,
            aliases,
            materializer,
            decision,
            bulk,
            selection: Mutex::new(DecisionSelection::new()),
            debounce,
            events,
            derived: RwLock::new(HashMap::new()),
            sync_task: Mutex::new(None),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Fetch the job's persisted findings, part lines and aliases into
    /// the local cache.
    pub async fn load(&self) -> Result<()> {
        let snapshot = self.store.fetch_job_findings(self.job_id).await?;
        info!(
            job_id = %self.job_id,
            findings = snapshot.findings.len(),
            part_lines = snapshot.part_lines.len(),
            aliases = snapshot.aliases.len(),
            "Loaded job snapshot"
        );
        self.aliases.load(&snapshot.aliases);
        self.state.load_snapshot(&snapshot).await;
        self.recompute_completion().await;
        Ok(())
    }

    /// Start merging the store's change feed into local state.
    ///
    /// Runs until `shutdown` or until the store closes the feed.
    pub fn start_sync(self: &Arc<Self>) {
        let mut rx = self.store.subscribe(self.job_id);
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(change) => engine.handle_remote_change(change).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Change feed lagged, notifications dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = self.sync_task.lock().unwrap().replace(handle) {
            previous.abort();
        }
    }

    /// Stop the sync loop and cancel every pending debounced write.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sync_task.lock().unwrap().take() {
            handle.abort();
        }
        self.debounce.cancel_all();
    }

    // ---- document re-derivation ----

    /// Re-derive the finding list from a changed checklist document.
    ///
    /// Safe to call on every edit; identities are stable hashes so
    /// aliases survive unrelated edits.
    pub fn on_document_changed(&self, document: &ChecklistDocument) -> Vec<Finding> {
        let findings = derive_findings(document);
        let mut derived = self.derived.write().unwrap();
        derived.clear();
        for finding in &findings {
            derived.insert(finding.display_id.clone(), finding.clone());
        }
        debug!(count = findings.len(), "Derived findings refreshed");
        findings
    }

    fn snapshot_for(&self, display_id: &DisplayId) -> Option<Finding> {
        self.derived.read().unwrap().get(display_id).cloned()
    }

    // ---- identity and materialization ----

    /// Resolve a display id without I/O.
    pub fn resolve_canonical(&self, display_id: &DisplayId) -> Option<CanonicalId> {
        self.aliases.resolve_canonical(display_id)
    }

    /// Resolve or materialize the record behind a display id.
    pub async fn materialize(
        &self,
        display_id: &DisplayId,
        allow_create: bool,
    ) -> Result<Option<CanonicalId>> {
        if let Some(id) = self.aliases.resolve_canonical(display_id) {
            return Ok(Some(id));
        }
        let snapshot = self
            .snapshot_for(display_id)
            .ok_or_else(|| Error::NotFound(format!("no derived finding {}", display_id)))?;
        self.materializer.get_or_create(&snapshot, allow_create).await
    }

    async fn require_canonical(&self, display_id: &DisplayId) -> Result<CanonicalId> {
        self.materialize(display_id, true)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no persisted record for {}", display_id)))
    }

    // ---- decisions ----

    /// Request an authorization transition for one finding.
    pub async fn set_status(
        &self,
        display_id: &DisplayId,
        new_status: ApprovalStatus,
    ) -> Result<SetStatusOutcome> {
        let snapshot = self.snapshot_for(display_id);
        let outcome = self
            .decision
            .set_status(display_id, snapshot.as_ref(), new_status)
            .await?;

        if let SetStatusOutcome::Applied(canonical) = outcome {
            if new_status == ApprovalStatus::Pending {
                self.maybe_release_alias(display_id, canonical).await;
            }
            self.recompute_completion().await;
        }
        Ok(outcome)
    }

    /// The status a UI should treat a finding as having right now:
    /// in-flight optimistic value, else the cached record, else pending.
    pub async fn effective_status(&self, display_id: &DisplayId) -> ApprovalStatus {
        if let Some(status) = self.state.overlay_get(display_id).await {
            return status;
        }
        if let Some(id) = self.aliases.resolve_canonical(display_id) {
            if let Some(finding) = self.state.finding(id).await {
                return finding.approval_status;
            }
        }
        ApprovalStatus::Pending
    }

    // ---- bulk operations ----

    pub fn select_for_bulk(&self, bucket: Severity, display_id: DisplayId) {
        self.selection.lock().unwrap().select(bucket, display_id);
    }

    pub fn deselect_for_bulk(&self, bucket: Severity, display_id: &DisplayId) {
        self.selection.lock().unwrap().deselect(bucket, display_id);
    }

    pub fn selection_len(&self, bucket: Severity) -> usize {
        self.selection.lock().unwrap().len(bucket)
    }

    /// Apply one decision to a bucket's whole selection. The selection is
    /// consumed whatever the outcome; failures are reported per item.
    pub async fn apply_bulk_decision(
        &self,
        bucket: Severity,
        new_status: ApprovalStatus,
    ) -> BulkOutcome {
        let selection = self.selection.lock().unwrap().take(bucket);
        let snapshots: HashMap<DisplayId, Finding> = {
            let derived = self.derived.read().unwrap();
            selection
                .iter()
                .filter_map(|id| derived.get(id).map(|f| (id.clone(), f.clone())))
                .collect()
        };
        let outcome = self
            .bulk
            .apply_bulk_decision(selection, &snapshots, new_status)
            .await;
        self.recompute_completion().await;
        outcome
    }

    // ---- labour, parts and override edits ----

    /// Record a labour estimate. Persistence is debounced; the store
    /// write reads whatever value is current when the timer fires.
    pub async fn set_labour_hours(
        &self,
        display_id: &DisplayId,
        hours: Option<f64>,
    ) -> Result<CanonicalId> {
        validate_hours(hours)?;
        let canonical = self.require_canonical(display_id).await?;

        let patch = StatusPatch {
            labour_hours: Some(hours),
            ..StatusPatch::default()
        };
        self.state.apply_patch(canonical, &patch).await;
        self.state.mark_dirty(canonical, FindingField::LabourHours).await;
        self.schedule_field_write(canonical, FindingField::LabourHours);

        self.events.emit_lossy(JobEvent::LabourChanged {
            canonical_id: canonical,
            labour_hours: hours,
            timestamp: chrono::Utc::now(),
        });

        if hours.is_none() {
            self.maybe_release_alias(display_id, canonical).await;
        }
        self.recompute_completion().await;
        Ok(canonical)
    }

    /// Record a labour estimate and persist it immediately, bypassing the
    /// debounce (suggestion acceptance). Reverts on store failure.
    pub async fn set_labour_hours_now(
        &self,
        display_id: &DisplayId,
        hours: Option<f64>,
    ) -> Result<CanonicalId> {
        validate_hours(hours)?;
        let canonical = self.require_canonical(display_id).await?;

        let patch = StatusPatch {
            labour_hours: Some(hours),
            ..StatusPatch::default()
        };
        let prior = self
            .state
            .apply_patch(canonical, &patch)
            .await
            .ok_or_else(|| Error::NotFound(format!("finding {}", canonical)))?;
        self.state.mark_dirty(canonical, FindingField::LabourHours).await;

        let state = self.state.clone();
        let revert_to = prior;
        self.debounce
            .flush_now(&(canonical, FindingField::LabourHours), async {
                commit_or_revert(
                    self.store.update_finding_status(canonical, patch),
                    move || async move {
                        state.restore(revert_to).await;
                        state.clear_dirty(canonical, FindingField::LabourHours).await;
                    },
                )
                .await
            })
            .await?;

        self.events.emit_lossy(JobEvent::LabourChanged {
            canonical_id: canonical,
            labour_hours: hours,
            timestamp: chrono::Utc::now(),
        });
        self.recompute_completion().await;
        Ok(canonical)
    }

    /// Toggle the labour-complete flag. Persisted immediately; reverts on
    /// store failure.
    pub async fn set_labour_complete(
        &self,
        display_id: &DisplayId,
        complete: bool,
    ) -> Result<CanonicalId> {
        let canonical = self.require_canonical(display_id).await?;
        let patch = StatusPatch {
            labour_complete: Some(complete),
            ..StatusPatch::default()
        };
        self.apply_and_persist(canonical, patch, FindingField::LabourComplete)
            .await?;
        self.recompute_completion().await;
        Ok(canonical)
    }

    /// Flag a finding as needing no parts. Parts-completion is derived,
    /// so it is refreshed in the same update.
    pub async fn set_parts_not_required(
        &self,
        display_id: &DisplayId,
        flag: bool,
    ) -> Result<CanonicalId> {
        let canonical = self.require_canonical(display_id).await?;
        let parts = self.state.part_lines(canonical).await;
        let parts_complete = !parts.is_empty() || flag;

        let patch = StatusPatch {
            parts_not_required: Some(flag),
            parts_complete: Some(parts_complete),
            ..StatusPatch::default()
        };
        self.state.mark_dirty(canonical, FindingField::PartsNotRequired).await;
        self.apply_and_persist(canonical, patch, FindingField::PartsComplete)
            .await?;

        if !flag {
            self.maybe_release_alias(display_id, canonical).await;
        }
        self.recompute_completion().await;
        Ok(canonical)
    }

    /// Set or clear the manual total override. Zero clears. Persistence
    /// is debounced like other numeric edits.
    pub async fn set_total_override(
        &self,
        display_id: &DisplayId,
        value: Option<Decimal>,
    ) -> Result<CanonicalId> {
        if let Some(v) = value {
            if v < Decimal::ZERO {
                return Err(Error::Validation(format!("total override {} is negative", v)));
            }
        }
        // An empty or zero override means "no override"
        let value = value.filter(|v| *v > Decimal::ZERO);

        let canonical = self.require_canonical(display_id).await?;
        let patch = StatusPatch {
            total_override: Some(value),
            ..StatusPatch::default()
        };
        self.state.apply_patch(canonical, &patch).await;
        self.state.mark_dirty(canonical, FindingField::TotalOverride).await;
        self.schedule_field_write(canonical, FindingField::TotalOverride);

        if value.is_none() {
            self.maybe_release_alias(display_id, canonical).await;
        }
        Ok(canonical)
    }

    // ---- money ----

    /// Cost breakdown for one finding, if it has a persisted record.
    pub async fn costs_for(
        &self,
        display_id: &DisplayId,
        audience: Audience,
    ) -> Option<CostBreakdown> {
        let canonical = self.aliases.resolve_canonical(display_id)?;
        let finding = self.state.finding(canonical).await?;
        let parts = self.state.part_lines(canonical).await;
        Some(costing::finding_costs(&finding, &parts, &self.rates, audience))
    }

    /// Job-level totals by decision bucket and severity bucket.
    pub async fn totals(&self, audience: Audience) -> JobTotals {
        let items = self.state.findings_with_parts().await;
        costing::aggregate(
            items.iter().map(|(f, p)| (f, p.as_slice())),
            &self.rates,
            audience,
        )
    }

    // ---- completion signal ----

    /// Whether every persisted finding has both completion flags set.
    pub async fn checklist_complete(&self) -> bool {
        self.state
            .all_findings()
            .await
            .iter()
            .all(|f| f.parts_complete && f.labour_complete)
    }

    async fn recompute_completion(&self) {
        let complete = self.checklist_complete().await;
        let prior = self.state.swap_completion(complete).await;
        if prior != Some(complete) {
            debug!(complete, "Checklist completion changed");
            self.events.emit_lossy(JobEvent::CompletionChanged {
                complete,
                timestamp: chrono::Utc::now(),
            });
        }
    }

    // ---- change feed ----

    async fn handle_remote_change(&self, change: StoreChange) {
        let outcome = sync::merge_change(
            &self.state,
            &self.aliases,
            self.config.debounce_window(),
            change,
        )
        .await;
        if !outcome.changed {
            return;
        }

        if let Some(canonical) = outcome.canonical_id {
            self.refresh_parts_complete(canonical).await;
            if let Some(display_id) = self.aliases.display_for(canonical) {
                self.maybe_release_alias(&display_id, canonical).await;
            }
        }
        self.recompute_completion().await;
        self.events.emit_lossy(JobEvent::RemoteChangeMerged {
            canonical_id: outcome.canonical_id,
            timestamp: chrono::Utc::now(),
        });
    }

    /// Re-derive the parts-complete flag after a parts or flag change:
    /// complete iff at least one part line is linked or parts are
    /// explicitly not required.
    async fn refresh_parts_complete(&self, canonical: CanonicalId) {
        let Some(record) = self.state.finding(canonical).await else {
            return;
        };
        let parts = self.state.part_lines(canonical).await;
        let derived = !parts.is_empty() || record.parts_not_required;
        if record.parts_complete == derived {
            return;
        }

        let patch = StatusPatch {
            parts_complete: Some(derived),
            ..StatusPatch::default()
        };
        self.state.apply_patch(canonical, &patch).await;
        self.state.mark_dirty(canonical, FindingField::PartsComplete).await;
        self.schedule_field_write(canonical, FindingField::PartsComplete);
    }

    /// Retire the alias once a finding's last linked resource is gone and
    /// it reverts to purely-derived state. The persisted record stays
    /// behind, orphaned.
    async fn maybe_release_alias(&self, display_id: &DisplayId, canonical: CanonicalId) {
        let Some(record) = self.state.finding(canonical).await else {
            return;
        };
        let parts = self.state.part_lines(canonical).await;
        let linked = record.approval_status != ApprovalStatus::Pending
            || record.labour_hours.is_some()
            || record.total_override.is_some()
            || record.parts_not_required
            || !parts.is_empty();
        if linked {
            return;
        }

        if let Some(released) = self.aliases.remove(display_id) {
            info!(display_id = %display_id, canonical_id = %released, "Alias released, record orphaned");
            self.events.emit_lossy(JobEvent::AliasReleased {
                display_id: display_id.clone(),
                canonical_id: released,
                timestamp: chrono::Utc::now(),
            });
        }
    }

    // ---- shared write paths ----

    /// Optimistic apply + immediate persist with revert, for explicit
    /// toggles that should not wait out a debounce window.
    async fn apply_and_persist(
        &self,
        canonical: CanonicalId,
        patch: StatusPatch,
        field: FindingField,
    ) -> Result<()> {
        let prior = self
            .state
            .apply_patch(canonical, &patch)
            .await
            .ok_or_else(|| Error::NotFound(format!("finding {}", canonical)))?;
        self.state.mark_dirty(canonical, field).await;

        let state = self.state.clone();
        commit_or_revert(
            self.store.update_finding_status(canonical, patch),
            move || async move {
                state.restore(prior).await;
                state.clear_dirty(canonical, field).await;
            },
        )
        .await
    }

    /// Schedule a debounced write of one field, reading the current cache
    /// value when the timer fires. Failures log and wait for the next
    /// write or remote merge to reconcile.
    fn schedule_field_write(&self, canonical: CanonicalId, field: FindingField) {
        let state = self.state.clone();
        let store = Arc::clone(&self.store);
        self.debounce.schedule((canonical, field), async move {
            let Some(record) = state.finding(canonical).await else {
                return;
            };
            let patch = match field {
                FindingField::LabourHours => StatusPatch {
                    labour_hours: Some(record.labour_hours),
                    ..StatusPatch::default()
                },
                FindingField::TotalOverride => StatusPatch {
                    total_override: Some(record.total_override),
                    ..StatusPatch::default()
                },
                FindingField::PartsComplete => StatusPatch {
                    parts_complete: Some(record.parts_complete),
                    parts_not_required: Some(record.parts_not_required),
                    ..StatusPatch::default()
                },
                FindingField::LabourComplete => StatusPatch {
                    labour_complete: Some(record.labour_complete),
                    ..StatusPatch::default()
                },
                // Status fields never go through the debounce path
                FindingField::ApprovalStatus
                | FindingField::DisplayStatus
                | FindingField::PartsNotRequired => return,
            };
            if let Err(e) = store.update_finding_status(canonical, patch).await {
                warn!(canonical_id = %canonical, error = %e, "Debounced write failed");
            }
        });
    }
}

impl Drop for ReconciliationEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn validate_hours(hours: Option<f64>) -> Result<()> {
    if let Some(h) = hours {
        if !h.is_finite() || h < 0.0 {
            return Err(Error::Validation(format!("labour hours {} invalid", h)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_hours() {
        assert!(validate_hours(None).is_ok());
        assert!(validate_hours(Some(0.0)).is_ok());
        assert!(validate_hours(Some(1.5)).is_ok());
        assert!(validate_hours(Some(-1.0)).is_err());
        assert!(validate_hours(Some(f64::NAN)).is_err());
        assert!(validate_hours(Some(f64::INFINITY)).is_err());
    }
}
