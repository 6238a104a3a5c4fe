//! Cost Aggregator
//!
//! Per-finding parts cost, labour cost, and total (respecting manual
//! overrides), rolled up by decision bucket and severity bucket. The two
//! bucket dimensions are orthogonal: an authorized red item counts toward
//! the authorized total and still displays with red styling.
//!
//! All money is `Decimal`; unpriced parts are a distinct state, not zero.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use vhc_common::config::EngineConfig;
use vhc_common::model::{ApprovalStatus, PartLine, PersistedFinding, Severity};

/// Which labour rate applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Technician,
    Customer,
}

/// Configured hourly labour rates
#[derive(Debug, Clone, PartialEq)]
pub struct LabourRates {
    pub technician: Decimal,
    pub customer: Decimal,
}

impl LabourRates {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            technician: config.labour_rate_technician,
            customer: config.labour_rate_customer,
        }
    }

    pub fn rate(&self, audience: Audience) -> Decimal {
        match audience {
            Audience::Technician => self.technician,
            Audience::Customer => self.customer,
        }
    }
}

/// Parts cost of a finding
///
/// `Unpriced` means nobody has linked parts or flagged them unnecessary
/// yet: "not yet priced", which blocks parts-completion but counts as
/// zero inside a total sum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PartsCost {
    /// Sum of linked part lines
    Priced(Decimal),
    /// Explicitly flagged as needing no parts
    NotRequired,
    /// No linked parts and no flag
    Unpriced,
}

impl PartsCost {
    /// Contribution to a money total.
    pub fn charge(&self) -> Decimal {
        match self {
            PartsCost::Priced(amount) => *amount,
            PartsCost::NotRequired | PartsCost::Unpriced => Decimal::ZERO,
        }
    }

    /// Whether the parts side of this finding is settled.
    pub fn is_resolved(&self) -> bool {
        !matches!(self, PartsCost::Unpriced)
    }
}

/// Parts cost for a finding given its linked part lines.
pub fn parts_cost(finding: &PersistedFinding, parts: &[PartLine]) -> PartsCost {
    if !parts.is_empty() {
        PartsCost::Priced(parts.iter().map(PartLine::cost).sum())
    } else if finding.parts_not_required {
        PartsCost::NotRequired
    } else {
        PartsCost::Unpriced
    }
}

/// Labour cost at the given hourly rate. None when no estimate exists.
pub fn labour_cost(hours: Option<f64>, rate: Decimal) -> Option<Decimal> {
    let hours = hours?;
    let hours = Decimal::from_f64_retain(hours).unwrap_or_default();
    Some((hours * rate).round_dp(2))
}

/// Computed money for one finding
#[derive(Debug, Clone, PartialEq)]
pub struct CostBreakdown {
    pub parts: PartsCost,
    pub labour: Option<Decimal>,
    /// parts + labour, with unpriced parts counted as zero
    pub computed: Decimal,
    /// The figure to show: the override when one is set and positive,
    /// the computed sum otherwise
    pub total: Decimal,
    pub overridden: bool,
}

/// Full cost breakdown for one finding.
pub fn finding_costs(
    finding: &PersistedFinding,
    parts: &[PartLine],
    rates: &LabourRates,
    audience: Audience,
) -> CostBreakdown {
    let parts = parts_cost(finding, parts);
    let labour = labour_cost(finding.labour_hours, rates.rate(audience));
    let computed = parts.charge() + labour.unwrap_or_default();

    // A zero or missing override means "no override"
    let (total, overridden) = match finding.total_override {
        Some(value) if value > Decimal::ZERO => (value, true),
        _ => (computed, false),
    };

    CostBreakdown {
        parts,
        labour,
        computed,
        total,
        overridden,
    }
}

/// Decision bucket a finding aggregates into.
///
/// Completed work was authorized work, so it stays in the authorized
/// bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecisionBucket {
    Pending,
    Authorized,
    Declined,
}

impl DecisionBucket {
    pub fn for_status(status: ApprovalStatus) -> Self {
        match status {
            ApprovalStatus::Pending => DecisionBucket::Pending,
            ApprovalStatus::Authorized | ApprovalStatus::Completed => DecisionBucket::Authorized,
            ApprovalStatus::Declined => DecisionBucket::Declined,
        }
    }
}

/// Job-level money roll-up
///
/// Decision buckets and severity buckets are independent dimensions of
/// the same pass; every costed finding lands in exactly one of each.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobTotals {
    pub pending: Decimal,
    /// Pending split by severity for the red/amber customer views
    pub pending_red: Decimal,
    pub pending_amber: Decimal,
    pub pending_green: Decimal,
    pub authorized: Decimal,
    pub declined: Decimal,
    pub red: Decimal,
    pub amber: Decimal,
    pub green: Decimal,
}

/// Aggregate totals over findings and their part lines.
pub fn aggregate<'a, I>(items: I, rates: &LabourRates, audience: Audience) -> JobTotals
where
    I: IntoIterator<Item = (&'a PersistedFinding, &'a [PartLine])>,
{
    let mut totals = JobTotals::default();

    for (finding, parts) in items {
        let total = finding_costs(finding, parts, rates, audience).total;

        match DecisionBucket::for_status(finding.approval_status) {
            DecisionBucket::Pending => {
                totals.pending += total;
                match finding.severity {
                    Severity::Red => totals.pending_red += total,
                    Severity::Amber => totals.pending_amber += total,
                    _ => totals.pending_green += total,
                }
            }
            DecisionBucket::Authorized => totals.authorized += total,
            DecisionBucket::Declined => totals.declined += total,
        }

        match finding.severity {
            Severity::Red => totals.red += total,
            Severity::Amber => totals.amber += total,
            _ => totals.green += total,
        }
    }

    totals
}
