//! SQLite-backed `FindingStore` implementation
//!
//! Reference persistence adapter. Money columns are stored as decimal
//! strings (SQLite has no decimal type); timestamps use the chrono
//! bindings. Schema is created on connect if missing.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use vhc_common::ids::{CanonicalId, DisplayId};
use vhc_common::model::{
    AliasRow, ApprovalStatus, DisplayStatus, JobSnapshot, NewFinding, PartLine, PersistedFinding,
    Severity,
};
use vhc_common::{Error, Result};

use super::{FindingStore, StatusPatch, StoreChange};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// SQLite persistence adapter
pub struct SqliteStore {
    pool: SqlitePool,
    channels: Mutex<HashMap<Uuid, broadcast::Sender<StoreChange>>>,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and initialize tables.
    pub async fn connect(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // SQLite URI with mode=rwc (read, write, create)
        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        debug!("Connecting to database: {}", db_url);

        let pool = SqlitePool::connect(&db_url).await?;
        let store = Self {
            pool,
            channels: Mutex::new(HashMap::new()),
        };
        store.init_tables().await?;
        Ok(store)
    }

    /// Create engine tables if they don't exist.
    async fn init_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS findings (
                canonical_id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                section TEXT NOT NULL,
                sub_area_key TEXT NOT NULL DEFAULT '',
                source_key TEXT NOT NULL DEFAULT '',
                line_key TEXT NOT NULL DEFAULT '',
                issue_title TEXT NOT NULL,
                issue_description TEXT NOT NULL DEFAULT '',
                severity TEXT NOT NULL,
                approval_status TEXT NOT NULL DEFAULT 'pending',
                display_status TEXT NOT NULL,
                labour_hours REAL,
                labour_complete INTEGER NOT NULL DEFAULT 0,
                parts_complete INTEGER NOT NULL DEFAULT 0,
                parts_not_required INTEGER NOT NULL DEFAULT 0,
                total_override TEXT,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_findings_job ON findings(job_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS part_lines (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                finding_id INTEGER NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                quantity TEXT NOT NULL,
                unit_price TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_part_lines_job ON part_lines(job_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS aliases (
                job_id TEXT NOT NULL,
                display_id TEXT NOT NULL,
                canonical_id INTEGER NOT NULL,
                PRIMARY KEY (job_id, display_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        debug!("Database tables initialized (findings, part_lines, aliases)");
        Ok(())
    }

    /// Attach a part line to a finding, as the external parts subsystem
    /// would, and notify subscribers.
    pub async fn add_part_line(
        &self,
        job_id: Uuid,
        finding_id: CanonicalId,
        description: &str,
        quantity: Decimal,
        unit_price: Decimal,
    ) -> Result<PartLine> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO part_lines (job_id, finding_id, description, quantity, unit_price, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job_id.to_string())
        .bind(finding_id.value())
        .bind(description)
        .bind(quantity.to_string())
        .bind(unit_price.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;

        let line = PartLine {
            id: result.last_insert_rowid(),
            finding_id,
            description: description.to_string(),
            quantity,
            unit_price,
            updated_at: now,
        };

        let lines = self.part_lines_for(job_id, finding_id).await?;
        self.broadcast(job_id, StoreChange::PartLinesChanged { finding_id, lines });
        Ok(line)
    }

    async fn part_lines_for(&self, job_id: Uuid, finding_id: CanonicalId) -> Result<Vec<PartLine>> {
        let rows = sqlx::query(
            "SELECT id, finding_id, description, quantity, unit_price, updated_at
             FROM part_lines WHERE job_id = ? AND finding_id = ?",
        )
        .bind(job_id.to_string())
        .bind(finding_id.value())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_part_line).collect()
    }

    fn broadcast(&self, job_id: Uuid, change: StoreChange) {
        if let Some(tx) = self.channels.lock().unwrap().get(&job_id) {
            let _ = tx.send(change);
        }
    }
}

#[async_trait]
impl FindingStore for SqliteStore {
    async fn fetch_job_findings(&self, job_id: Uuid) -> Result<JobSnapshot> {
        let finding_rows = sqlx::query("SELECT * FROM findings WHERE job_id = ?")
            .bind(job_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        let findings = finding_rows
            .iter()
            .map(row_to_finding)
            .collect::<Result<Vec<_>>>()?;

        let part_rows = sqlx::query(
            "SELECT id, finding_id, description, quantity, unit_price, updated_at
             FROM part_lines WHERE job_id = ?",
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        let part_lines = part_rows
            .iter()
            .map(row_to_part_line)
            .collect::<Result<Vec<_>>>()?;

        let alias_rows = sqlx::query("SELECT display_id, canonical_id FROM aliases WHERE job_id = ?")
            .bind(job_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        let aliases = alias_rows
            .iter()
            .map(|row| AliasRow {
                display_id: DisplayId::new(row.get::<String, _>("display_id")),
                canonical_id: CanonicalId::new(row.get::<i64, _>("canonical_id")),
            })
            .collect();

        Ok(JobSnapshot {
            findings,
            part_lines,
            aliases,
        })
    }

    async fn create_finding(&self, job_id: Uuid, new: NewFinding) -> Result<CanonicalId> {
        let now = Utc::now();
        let display_status = DisplayStatus::from_severity(new.severity);
        let result = sqlx::query(
            r#"
            INSERT INTO findings (
                job_id, section, sub_area_key, source_key, line_key,
                issue_title, issue_description, severity,
                approval_status, display_status, labour_hours, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?)
            "#,
        )
        .bind(job_id.to_string())
        .bind(&new.section)
        .bind(&new.sub_area_key)
        .bind(&new.source_key)
        .bind(&new.line_key)
        .bind(&new.issue_title)
        .bind(&new.issue_description)
        .bind(new.severity.to_string())
        .bind(display_status.to_string())
        .bind(new.labour_hours)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let canonical_id = CanonicalId::new(result.last_insert_rowid());
        debug!(canonical_id = %canonical_id, title = %new.issue_title, "Created finding");

        let finding = new.into_persisted(canonical_id, job_id, now);
        self.broadcast(job_id, StoreChange::FindingUpserted { finding });
        Ok(canonical_id)
    }

    async fn update_finding_status(
        &self,
        canonical_id: CanonicalId,
        patch: StatusPatch,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM findings WHERE canonical_id = ?")
            .bind(canonical_id.value())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::NotFound(format!("finding {}", canonical_id)))?;
        let mut finding = row_to_finding(&row)?;

        patch.apply_to(&mut finding);
        finding.updated_at = Utc::now();

        sqlx::query(
            r#"
            UPDATE findings SET
                approval_status = ?, display_status = ?, labour_hours = ?,
                labour_complete = ?, parts_complete = ?, parts_not_required = ?,
                total_override = ?, updated_at = ?
            WHERE canonical_id = ?
            "#,
        )
        .bind(finding.approval_status.to_string())
        .bind(finding.display_status.to_string())
        .bind(finding.labour_hours)
        .bind(finding.labour_complete)
        .bind(finding.parts_complete)
        .bind(finding.parts_not_required)
        .bind(finding.total_override.map(|d| d.to_string()))
        .bind(finding.updated_at)
        .bind(canonical_id.value())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let job_id = finding.job_id;
        self.broadcast(job_id, StoreChange::FindingUpserted { finding });
        Ok(())
    }

    async fn upsert_alias(
        &self,
        job_id: Uuid,
        display_id: DisplayId,
        canonical_id: CanonicalId,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // One live display id per canonical id
        sqlx::query("DELETE FROM aliases WHERE job_id = ? AND canonical_id = ? AND display_id != ?")
            .bind(job_id.to_string())
            .bind(canonical_id.value())
            .bind(display_id.as_str())
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT OR REPLACE INTO aliases (job_id, display_id, canonical_id) VALUES (?, ?, ?)")
            .bind(job_id.to_string())
            .bind(display_id.as_str())
            .bind(canonical_id.value())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

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
        let result = match canonical_id {
            Some(id) => {
                sqlx::query(
                    "DELETE FROM aliases WHERE job_id = ? AND display_id = ? AND canonical_id = ?",
                )
                .bind(job_id.to_string())
                .bind(display_id.as_str())
                .bind(id.value())
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query("DELETE FROM aliases WHERE job_id = ? AND display_id = ?")
                    .bind(job_id.to_string())
                    .bind(display_id.as_str())
                    .execute(&self.pool)
                    .await?
            }
        };

        if result.rows_affected() > 0 {
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

fn row_to_finding(row: &sqlx::sqlite::SqliteRow) -> Result<PersistedFinding> {
    let job_id = Uuid::parse_str(&row.get::<String, _>("job_id"))
        .map_err(|e| Error::Persistence(format!("invalid job id: {}", e)))?;

    let severity_text: String = row.get("severity");
    let severity = Severity::parse(&severity_text);

    let approval_text: String = row.get("approval_status");
    let approval_status = ApprovalStatus::parse(&approval_text)
        .ok_or_else(|| Error::Persistence(format!("invalid approval status '{}'", approval_text)))?;

    let display_text: String = row.get("display_status");
    let display_status = DisplayStatus::parse(&display_text)
        .ok_or_else(|| Error::Persistence(format!("invalid display status '{}'", display_text)))?;

    let total_override = row
        .get::<Option<String>, _>("total_override")
        .map(|s| parse_decimal(&s, "total_override"))
        .transpose()?;

    Ok(PersistedFinding {
        canonical_id: CanonicalId::new(row.get::<i64, _>("canonical_id")),
        job_id,
        section: row.get("section"),
        sub_area_key: row.get("sub_area_key"),
        source_key: row.get("source_key"),
        line_key: row.get("line_key"),
        issue_title: row.get("issue_title"),
        issue_description: row.get("issue_description"),
        severity,
        approval_status,
        display_status,
        labour_hours: row.get("labour_hours"),
        labour_complete: row.get("labour_complete"),
        parts_complete: row.get("parts_complete"),
        parts_not_required: row.get("parts_not_required"),
        total_override,
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
    })
}

fn row_to_part_line(row: &sqlx::sqlite::SqliteRow) -> Result<PartLine> {
    Ok(PartLine {
        id: row.get("id"),
        finding_id: CanonicalId::new(row.get::<i64, _>("finding_id")),
        description: row.get("description"),
        quantity: parse_decimal(&row.get::<String, _>("quantity"), "quantity")?,
        unit_price: parse_decimal(&row.get::<String, _>("unit_price"), "unit_price")?,
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
    })
}

fn parse_decimal(text: &str, column: &str) -> Result<Decimal> {
    text.parse::<Decimal>()
        .map_err(|e| Error::Persistence(format!("invalid {} '{}': {}", column, text, e)))
}
