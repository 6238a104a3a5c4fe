//! Identity Resolver (Alias Store)
//!
//! Maintains the bidirectional mapping between derived display
//! identifiers and store-assigned canonical identifiers. Resolution is a
//! synchronous in-memory lookup and never performs I/O; persistence of
//! alias rows is fire-and-forget with local-state-first semantics (the
//! local map is the write-through cache).
//!
//! Invariants:
//! - a display id maps to at most one live canonical id
//! - a canonical id has at most one live display id (the reverse map is
//!   derived, not independently stored)

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};
use uuid::Uuid;

use vhc_common::ids::{CanonicalId, DisplayId};
use vhc_common::model::AliasRow;

use crate::store::FindingStore;

#[derive(Default)]
struct AliasMaps {
    forward: HashMap<DisplayId, CanonicalId>,
    reverse: HashMap<CanonicalId, DisplayId>,
}

impl AliasMaps {
    /// Insert a pair, evicting any conflicting pair in either direction.
    fn insert(&mut self, display_id: DisplayId, canonical_id: CanonicalId) {
        if let Some(old_canonical) = self.forward.remove(&display_id) {
            self.reverse.remove(&old_canonical);
        }
        if let Some(old_display) = self.reverse.remove(&canonical_id) {
            self.forward.remove(&old_display);
        }
        self.forward.insert(display_id.clone(), canonical_id);
        self.reverse.insert(canonical_id, display_id);
    }

    fn remove(&mut self, display_id: &DisplayId) -> Option<CanonicalId> {
        let canonical = self.forward.remove(display_id)?;
        self.reverse.remove(&canonical);
        Some(canonical)
    }
}

/// Alias store for one job
pub struct AliasStore {
    job_id: Uuid,
    store: Arc<dyn FindingStore>,
    // Sync lock, never held across an await: resolution must work from
    // non-async code and provably performs no I/O.
    maps: RwLock<AliasMaps>,
}

impl AliasStore {
    pub fn new(job_id: Uuid, store: Arc<dyn FindingStore>) -> Self {
        Self {
            job_id,
            store,
            maps: RwLock::new(AliasMaps::default()),
        }
    }

    /// Seed the local map from fetched alias rows.
    pub fn load(&self, rows: &[AliasRow]) {
        let mut maps = self.maps.write().unwrap();
        for row in rows {
            maps.insert(row.display_id.clone(), row.canonical_id);
        }
        debug!(count = rows.len(), "Alias map loaded");
    }

    /// Resolve a display id to its canonical id. Pure lookup, O(1), no I/O.
    pub fn resolve_canonical(&self, display_id: &DisplayId) -> Option<CanonicalId> {
        self.maps.read().unwrap().forward.get(display_id).copied()
    }

    /// The live display id for a canonical id, if any.
    pub fn display_for(&self, canonical_id: CanonicalId) -> Option<DisplayId> {
        self.maps.read().unwrap().reverse.get(&canonical_id).cloned()
    }

    /// Record a pair locally (synchronous) and persist it fire-and-forget.
    pub fn upsert(&self, display_id: DisplayId, canonical_id: CanonicalId) {
        self.maps
            .write()
            .unwrap()
            .insert(display_id.clone(), canonical_id);

        let store = Arc::clone(&self.store);
        let job_id = self.job_id;
        tokio::spawn(async move {
            if let Err(e) = store.upsert_alias(job_id, display_id.clone(), canonical_id).await {
                // Local map already holds the pair; a reload will re-derive
                // it through content matching.
                warn!(display_id = %display_id, error = %e, "Alias persistence failed");
            }
        });
    }

    /// Drop a pair locally (synchronous) and remove it fire-and-forget.
    /// Returns the canonical id the display id was mapped to.
    pub fn remove(&self, display_id: &DisplayId) -> Option<CanonicalId> {
        let canonical = self.maps.write().unwrap().remove(display_id)?;

        let store = Arc::clone(&self.store);
        let job_id = self.job_id;
        let display_id = display_id.clone();
        tokio::spawn(async move {
            if let Err(e) = store
                .remove_alias(job_id, display_id.clone(), Some(canonical))
                .await
            {
                warn!(display_id = %display_id, error = %e, "Alias removal failed");
            }
        });
        Some(canonical)
    }

    /// Merge a pair from the store's change feed (no persistence echo).
    pub fn apply_remote(&self, display_id: DisplayId, canonical_id: CanonicalId) {
        self.maps.write().unwrap().insert(display_id, canonical_id);
    }

    /// Drop a pair on the store's say-so (no persistence echo).
    pub fn remove_remote(&self, display_id: &DisplayId) {
        self.maps.write().unwrap().remove(display_id);
    }
}
