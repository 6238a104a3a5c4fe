//! Domain model types shared across the VHC workspace

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{self, CanonicalId};

/// Severity colour recorded against an inspected item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Red,
    Amber,
    Green,
    Grey,
    None,
}

impl Severity {
    /// Parse a severity colour from checklist document text.
    ///
    /// Case-insensitive; unknown or empty values map to `None`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "red" | "urgent" => Severity::Red,
            "amber" | "advisory" => Severity::Amber,
            "green" | "ok" | "pass" => Severity::Green,
            "grey" | "gray" | "not-checked" | "unchecked" => Severity::Grey,
            _ => Severity::None,
        }
    }

    /// Ordering weight for escalation (red outranks amber outranks green).
    pub fn rank(self) -> u8 {
        match self {
            Severity::Red => 4,
            Severity::Amber => 3,
            Severity::Green => 2,
            Severity::Grey => 1,
            Severity::None => 0,
        }
    }

    /// The more severe of two colours.
    pub fn max(self, other: Self) -> Self {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }

    /// Whether this colour flags a defect the customer can act on.
    pub fn is_flagged(self) -> bool {
        matches!(self, Severity::Red | Severity::Amber)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Red => write!(f, "red"),
            Severity::Amber => write!(f, "amber"),
            Severity::Green => write!(f, "green"),
            Severity::Grey => write!(f, "grey"),
            Severity::None => write!(f, "none"),
        }
    }
}

/// Authorization lifecycle state of a persisted finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Authorized,
    Declined,
    Completed,
}

impl ApprovalStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "pending" => Some(ApprovalStatus::Pending),
            "authorized" | "authorised" => Some(ApprovalStatus::Authorized),
            "declined" => Some(ApprovalStatus::Declined),
            "completed" => Some(ApprovalStatus::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApprovalStatus::Pending => write!(f, "pending"),
            ApprovalStatus::Authorized => write!(f, "authorized"),
            ApprovalStatus::Declined => write!(f, "declined"),
            ApprovalStatus::Completed => write!(f, "completed"),
        }
    }
}

/// Presentation hint stored alongside the approval status.
///
/// Pending findings display with their severity colour; decided findings
/// display with their decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayStatus {
    Authorized,
    Declined,
    Completed,
    Red,
    Amber,
    Green,
}

impl DisplayStatus {
    /// Severity-derived display status used while a finding is pending.
    ///
    /// Grey and unrated items have no dedicated display slot and fall back
    /// to green.
    pub fn from_severity(severity: Severity) -> Self {
        match severity {
            Severity::Red => DisplayStatus::Red,
            Severity::Amber => DisplayStatus::Amber,
            Severity::Green | Severity::Grey | Severity::None => DisplayStatus::Green,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "authorized" | "authorised" => Some(DisplayStatus::Authorized),
            "declined" => Some(DisplayStatus::Declined),
            "completed" => Some(DisplayStatus::Completed),
            "red" => Some(DisplayStatus::Red),
            "amber" => Some(DisplayStatus::Amber),
            "green" => Some(DisplayStatus::Green),
            _ => None,
        }
    }
}

impl std::fmt::Display for DisplayStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisplayStatus::Authorized => write!(f, "authorized"),
            DisplayStatus::Declined => write!(f, "declined"),
            DisplayStatus::Completed => write!(f, "completed"),
            DisplayStatus::Red => write!(f, "red"),
            DisplayStatus::Amber => write!(f, "amber"),
            DisplayStatus::Green => write!(f, "green"),
        }
    }
}

/// Canonical, addressable record for a materialized finding.
///
/// Created on first materialization, mutated by decision transitions and
/// labour/parts edits, never deleted by the engine. A record whose last
/// linked resource is removed is simply orphaned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedFinding {
    pub canonical_id: CanonicalId,
    pub job_id: Uuid,
    pub section: String,
    /// Normalized location tag (e.g. "front", "nearside rear")
    pub sub_area_key: String,
    /// Normalized item heading the finding was raised from
    pub source_key: String,
    /// Content hash of (detail, measurement) at creation time
    pub line_key: String,
    pub issue_title: String,
    pub issue_description: String,
    pub severity: Severity,
    pub approval_status: ApprovalStatus,
    pub display_status: DisplayStatus,
    /// Estimated labour, hours. None = not yet estimated
    pub labour_hours: Option<f64>,
    pub labour_complete: bool,
    pub parts_complete: bool,
    /// Explicit technician flag that no parts are needed for this repair
    pub parts_not_required: bool,
    /// Manual total override; None = use computed parts + labour
    pub total_override: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
}

impl PersistedFinding {
    /// Structural slot code for exact content matching.
    pub fn slot_code(&self) -> String {
        ids::slot_code(&self.section, &self.sub_area_key, &self.source_key)
    }
}

/// Creation payload for a new persisted finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFinding {
    pub section: String,
    pub sub_area_key: String,
    pub source_key: String,
    pub line_key: String,
    pub issue_title: String,
    pub issue_description: String,
    pub severity: Severity,
    pub labour_hours: Option<f64>,
}

impl NewFinding {
    /// Build the persisted record a store creates from this payload.
    ///
    /// New records always start pending with a severity-derived display
    /// status and no completion flags set.
    pub fn into_persisted(
        self,
        canonical_id: CanonicalId,
        job_id: Uuid,
        created_at: chrono::DateTime<chrono::Utc>,
    ) -> PersistedFinding {
        let display_status = DisplayStatus::from_severity(self.severity);
        PersistedFinding {
            canonical_id,
            job_id,
            section: self.section,
            sub_area_key: self.sub_area_key,
            source_key: self.source_key,
            line_key: self.line_key,
            issue_title: self.issue_title,
            issue_description: self.issue_description,
            severity: self.severity,
            approval_status: ApprovalStatus::Pending,
            display_status,
            labour_hours: self.labour_hours,
            labour_complete: false,
            parts_complete: false,
            parts_not_required: false,
            total_override: None,
            updated_at: created_at,
        }
    }
}

/// Priced part attached to a finding by the parts subsystem.
///
/// The engine only reads `quantity * unit_price`; part lifecycle is owned
/// elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartLine {
    pub id: i64,
    pub finding_id: CanonicalId,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl PartLine {
    pub fn cost(&self) -> Decimal {
        self.quantity * self.unit_price
    }
}

/// Durable display-id to canonical-id pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasRow {
    pub display_id: crate::ids::DisplayId,
    pub canonical_id: CanonicalId,
}

/// Everything the store holds for one job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub findings: Vec<PersistedFinding>,
    pub part_lines: Vec<PartLine>,
    pub aliases: Vec<AliasRow>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_severity_parse() {
        assert_eq!(Severity::parse("RED"), Severity::Red);
        assert_eq!(Severity::parse("amber"), Severity::Amber);
        assert_eq!(Severity::parse(" green "), Severity::Green);
        assert_eq!(Severity::parse("gray"), Severity::Grey);
        assert_eq!(Severity::parse("???"), Severity::None);
        assert_eq!(Severity::parse(""), Severity::None);
    }

    #[test]
    fn test_severity_escalation() {
        assert_eq!(Severity::Amber.max(Severity::Red), Severity::Red);
        assert_eq!(Severity::Red.max(Severity::Green), Severity::Red);
        assert_eq!(Severity::Grey.max(Severity::Grey), Severity::Grey);
    }

    #[test]
    fn test_display_status_from_severity() {
        assert_eq!(DisplayStatus::from_severity(Severity::Red), DisplayStatus::Red);
        assert_eq!(DisplayStatus::from_severity(Severity::Amber), DisplayStatus::Amber);
        assert_eq!(DisplayStatus::from_severity(Severity::Green), DisplayStatus::Green);
        assert_eq!(DisplayStatus::from_severity(Severity::Grey), DisplayStatus::Green);
        assert_eq!(DisplayStatus::from_severity(Severity::None), DisplayStatus::Green);
    }

    #[test]
    fn test_approval_status_round_trip() {
        for status in [
            ApprovalStatus::Pending,
            ApprovalStatus::Authorized,
            ApprovalStatus::Declined,
            ApprovalStatus::Completed,
        ] {
            assert_eq!(ApprovalStatus::parse(&status.to_string()), Some(status));
        }
        assert_eq!(ApprovalStatus::parse("authorised"), Some(ApprovalStatus::Authorized));
        assert_eq!(ApprovalStatus::parse("nope"), None);
    }

    #[test]
    fn test_part_line_cost() {
        let line = PartLine {
            id: 1,
            finding_id: CanonicalId::new(7),
            description: "Front pads".into(),
            quantity: dec("2"),
            unit_price: dec("19.99"),
            updated_at: chrono::Utc::now(),
        };
        assert_eq!(line.cost(), dec("39.98"));
    }
}
