//! Finding Materializer
//!
//! Promotes an ephemeral finding into a persisted, addressable record the
//! first time it needs one (a decision, a labour value, a cost line).
//! Idempotent get-or-create: the alias fast path costs nothing, content
//! matching attaches to existing records where possible, and creation is
//! the last resort.
//!
//! The content-matching fallback is heuristic text equality on
//! section/title/description with no confidence score; a newly entered
//! finding can attach to a stale record sharing the same title. Known
//! trade-off, preserved from the workflow this engine replaces.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use vhc_common::events::{EventBus, JobEvent};
use vhc_common::ids::{self, CanonicalId};
use vhc_common::model::PersistedFinding;
use vhc_common::Result;

use crate::extractor::Finding;
use crate::identity::AliasStore;
use crate::state::SharedJobState;
use crate::store::FindingStore;

/// Materializer for one job
pub struct Materializer {
    job_id: Uuid,
    store: Arc<dyn FindingStore>,
    aliases: Arc<AliasStore>,
    state: SharedJobState,
    events: EventBus,
}

impl Materializer {
    pub fn new(
        job_id: Uuid,
        store: Arc<dyn FindingStore>,
        aliases: Arc<AliasStore>,
        state: SharedJobState,
        events: EventBus,
    ) -> Self {
        Self {
            job_id,
            store,
            aliases,
            state,
            events,
        }
    }

    /// Resolve the canonical id for a finding, creating a record if
    /// requested and none matches.
    ///
    /// Returns `Ok(None)` when no record matches and creation is not
    /// allowed; callers must not attempt a decision or labour write
    /// without a target. A store failure during creation is an error; no
    /// speculative canonical id is minted locally.
    pub async fn get_or_create(
        &self,
        finding: &Finding,
        allow_create: bool,
    ) -> Result<Option<CanonicalId>> {
        // Fast path: alias already resolves, no I/O
        if let Some(id) = self.aliases.resolve_canonical(&finding.display_id) {
            return Ok(Some(id));
        }

        // Content matching runs against the fetched cache. Records whose
        // canonical id is already aliased to a different display id are
        // off limits; stealing one would break that finding's identity.
        let candidates: Vec<PersistedFinding> = self
            .state
            .all_findings()
            .await
            .into_iter()
            .filter(|c| match self.aliases.display_for(c.canonical_id) {
                None => true,
                Some(display) => display == finding.display_id,
            })
            .collect();

        if let Some(id) = match_existing(finding, &candidates) {
            debug!(display_id = %finding.display_id, canonical_id = %id, "Content match attached existing record");
            self.aliases.upsert(finding.display_id.clone(), id);
            self.events.emit_lossy(JobEvent::FindingMaterialized {
                display_id: finding.display_id.clone(),
                canonical_id: id,
                created: false,
                timestamp: chrono::Utc::now(),
            });
            return Ok(Some(id));
        }

        if !allow_create {
            debug!(display_id = %finding.display_id, "No match and creation not allowed");
            return Ok(None);
        }

        let new = finding.to_new_finding();
        let id = self.store.create_finding(self.job_id, new.clone()).await?;

        let record = new.into_persisted(id, self.job_id, chrono::Utc::now());
        self.state.upsert_finding(record).await;
        self.aliases.upsert(finding.display_id.clone(), id);

        info!(display_id = %finding.display_id, canonical_id = %id, title = %finding.heading, "Materialized new finding");
        self.events.emit_lossy(JobEvent::FindingMaterialized {
            display_id: finding.display_id.clone(),
            canonical_id: id,
            created: true,
            timestamp: chrono::Utc::now(),
        });
        Ok(Some(id))
    }
}

/// Tiered content matching against existing records.
///
/// 1. Exact structural key: (slot code, line key).
/// 2. (normalized section, normalized title) candidates, preferring exact
///    description equality, then the most recently updated.
fn match_existing(finding: &Finding, candidates: &[PersistedFinding]) -> Option<CanonicalId> {
    let slot = finding.slot_code();
    let line = finding.line_key();
    if let Some(hit) = candidates
        .iter()
        .find(|c| c.slot_code() == slot && c.line_key == line)
    {
        return Some(hit.canonical_id);
    }

    let section = ids::normalize(&finding.section);
    let title = ids::normalize(&finding.heading);
    let mut titled: Vec<&PersistedFinding> = candidates
        .iter()
        .filter(|c| ids::normalize(&c.section) == section && ids::normalize(&c.issue_title) == title)
        .collect();
    if titled.is_empty() {
        return None;
    }

    // Prefer specificity: exact description equality wins over the
    // relaxed title match when both produce candidates
    let description = ids::normalize(&finding.detail_text);
    let mut described: Vec<&PersistedFinding> = titled
        .iter()
        .copied()
        .filter(|c| ids::normalize(&c.issue_description) == description)
        .collect();
    described.sort_by_key(|c| c.updated_at);
    if let Some(hit) = described.last() {
        return Some(hit.canonical_id);
    }

    titled.sort_by_key(|c| c.updated_at);
    titled.last().map(|c| c.canonical_id)
}
