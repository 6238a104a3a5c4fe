//! In-memory `FindingStore` implementation
//!
//! Reference implementation of the port contract, used throughout the
//! test suites. Supports failure and latency injection so callers can
//! exercise revert paths, partial batch failures, and same-finding races
//! without a network.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use vhc_common::ids::{CanonicalId, DisplayId};
use vhc_common::model::{AliasRow, JobSnapshot, NewFinding, PartLine, PersistedFinding};
use vhc_common::{Error, Result};

use super::{FindingStore, StatusPatch, StoreChange};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

#[derive(Default)]
struct Inner {
    next_id: i64,
    findings: HashMap<CanonicalId, PersistedFinding>,
    part_lines: HashMap<CanonicalId, Vec<PartLine>>,
    aliases: HashMap<(Uuid, DisplayId), CanonicalId>,
}

#[derive(Default)]
struct Injection {
    /// Issue titles whose creation should fail
    fail_create_titles: HashSet<String>,
    /// Number of upcoming status updates to fail
    fail_next_updates: usize,
    /// Per-call latency queue for status updates (front popped first)
    update_delays: VecDeque<Duration>,
}

/// In-memory store with injectable failures and latency.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    injection: Mutex<Injection>,
    channels: Mutex<HashMap<Uuid, broadcast::Sender<StoreChange>>>,
    update_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                ..Inner::default()
            }),
            injection: Mutex::new(Injection::default()),
            channels: Mutex::new(HashMap::new()),
            update_calls: AtomicUsize::new(0),
        }
    }

    /// Number of `update_finding_status` calls the store has seen.
    pub fn update_count(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    // ---- failure / latency injection ----

    /// Make `create_finding` fail for findings with this issue title.
    pub fn fail_creates_titled(&self, issue_title: &str) {
        self.injection
            .lock()
            .unwrap()
            .fail_create_titles
            .insert(issue_title.to_string());
    }

    /// Fail the next `n` calls to `update_finding_status`.
    pub fn fail_next_updates(&self, n: usize) {
        self.injection.lock().unwrap().fail_next_updates = n;
    }

    /// Queue a latency for upcoming `update_finding_status` calls; each
    /// call pops one entry (missing entries mean no delay).
    pub fn delay_update(&self, delay: Duration) {
        self.injection.lock().unwrap().update_delays.push_back(delay);
    }

    // ---- direct accessors for assertions and seeding ----

    pub fn finding(&self, id: CanonicalId) -> Option<PersistedFinding> {
        self.inner.lock().unwrap().findings.get(&id).cloned()
    }

    pub fn finding_count(&self) -> usize {
        self.inner.lock().unwrap().findings.len()
    }

    pub fn alias_for(&self, job_id: Uuid, display_id: &DisplayId) -> Option<CanonicalId> {
        self.inner
            .lock()
            .unwrap()
            .aliases
            .get(&(job_id, display_id.clone()))
            .copied()
    }

    /// Seed a finding row directly (bypasses creation injection).
    pub fn insert_finding(&self, finding: PersistedFinding) -> CanonicalId {
        let id = finding.canonical_id;
        let job_id = finding.job_id;
        {
            let mut inner = self.inner.lock().unwrap();
            inner.next_id = inner.next_id.max(id.value() + 1);
            inner.findings.insert(id, finding.clone());
        }
        self.broadcast(job_id, StoreChange::FindingUpserted { finding });
        id
    }

    /// Replace the part lines linked to a finding, as the external parts
    /// subsystem would, and notify subscribers.
    pub fn set_part_lines(&self, job_id: Uuid, finding_id: CanonicalId, lines: Vec<PartLine>) {
        self.inner
            .lock()
            .unwrap()
            .part_lines
            .insert(finding_id, lines.clone());
        self.broadcast(job_id, StoreChange::PartLinesChanged { finding_id, lines });
    }

    /// Push a raw change onto a job's feed (for merge-policy tests).
    pub fn push_change(&self, job_id: Uuid, change: StoreChange) {
        self.broadcast(job_id, change);
    }

    fn broadcast(&self, job_id: Uuid, change: StoreChange) {
        if let Some(tx) = self.channels.lock().unwrap().get(&job_id) {
            let _ = tx.send(change);
        }
    }

    fn take_update_delay(&self) -> Option<Duration> {
        self.injection.lock().unwrap().update_delays.pop_front()
    }

    fn take_update_failure(&self) -> bool {
        let mut injection = self.injection.lock().unwrap();
        if injection.fail_next_updates > 0 {
            injection.fail_next_updates -= 1;
            true
        } else {
            false
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FindingStore for MemoryStore {
    async fn fetch_job_findings(&self, job_id: Uuid) -> Result<JobSnapshot> {
        let inner = self.inner.lock().unwrap();
        let findings: Vec<_> = inner
            .findings
            .values()
            .filter(|f| f.job_id == job_id)
            .cloned()
            .collect();
        let part_lines: Vec<_> = findings
            .iter()
            .filter_map(|f| inner.part_lines.get(&f.canonical_id))
            .flatten()
            .cloned()
            .collect();
        let aliases: Vec<_> = inner
            .aliases
            .iter()
            .filter(|((job, _), _)| *job == job_id)
            .map(|((_, display_id), canonical_id)| AliasRow {
                display_id: display_id.clone(),
                canonical_id: *canonical_id,
            })
            .collect();
        Ok(JobSnapshot {
            findings,
            part_lines,
            aliases,
        })
    }

    async fn create_finding(&self, job_id: Uuid, new: NewFinding) -> Result<CanonicalId> {
        if self
            .injection
            .lock()
            .unwrap()
            .fail_create_titles
            .contains(&new.issue_title)
        {
            return Err(Error::Persistence(format!(
                "injected create failure for '{}'",
                new.issue_title
            )));
        }

        let finding = {
            let mut inner = self.inner.lock().unwrap();
            let id = CanonicalId::new(inner.next_id);
            inner.next_id += 1;
            let finding = new.into_persisted(id, job_id, chrono::Utc::now());
            inner.findings.insert(id, finding.clone());
            finding
        };
        debug!(canonical_id = %finding.canonical_id, title = %finding.issue_title, "Created finding");
        let id = finding.canonical_id;
        self.broadcast(job_id, StoreChange::FindingUpserted { finding });
        Ok(id)
    }

    async fn update_finding_status(
        &self,
        canonical_id: CanonicalId,
        patch: StatusPatch,
    ) -> Result<()> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.take_update_delay() {
            tokio::time::sleep(delay).await;
        }
        if self.take_update_failure() {
            return Err(Error::Persistence("injected update failure".into()));
        }

        let (job_id, finding) = {
            let mut inner = self.inner.lock().unwrap();
            let finding = inner
                .findings
                .get_mut(&canonical_id)
                .ok_or_else(|| Error::NotFound(format!("finding {}", canonical_id)))?;
            patch.apply_to(finding);
            finding.updated_at = chrono::Utc::now();
            (finding.job_id, finding.clone())
        };
        self.broadcast(job_id, StoreChange::FindingUpserted { finding });
        Ok(())
    }

    async fn upsert_alias(
        &self,
        job_id: Uuid,
        display_id: DisplayId,
        canonical_id: CanonicalId,
    ) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            // One live display id per canonical id
            inner
                .aliases
                .retain(|(job, display), canonical| {
                    !(*job == job_id && *canonical == canonical_id && *display != display_id)
                });
            inner.aliases.insert((job_id, display_id.clone()), canonical_id);
        }
        self.broadcast(
            job_id,
            StoreChange::AliasUpserted {
                display_id,
                canonical_id,
            },
        );
        Ok(())
    }

    async fn remove_alias(
        &self,
        job_id: Uuid,
        display_id: DisplayId,
        canonical_id: Option<CanonicalId>,
    ) -> Result<()> {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let key = (job_id, display_id.clone());
            let matches = match inner.aliases.get(&key) {
                Some(current) => canonical_id.is_none() || canonical_id == Some(*current),
                None => false,
            };
            if matches {
                inner.aliases.remove(&key);
            }
            matches
        };
        if removed {
            self.broadcast(job_id, StoreChange::AliasRemoved { display_id });
        }
        Ok(())
    }

    fn subscribe(&self, job_id: Uuid) -> broadcast::Receiver<StoreChange> {
        self.channels
            .lock()
            .unwrap()
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(CHANGE_CHANNEL_CAPACITY).0)
            .subscribe()
    }
}
