//! Finding Extractor
//!
//! Turns the raw nested checklist document into a flat list of candidate
//! findings. Pure derivation: invoked on every document change, holds no
//! state, and never persists anything. The resolver and materializer are
//! the only stateful layers downstream.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::trace;

use vhc_common::ids::{self, DisplayId};
use vhc_common::model::{NewFinding, Severity};

/// Raw checklist document as recorded by the technician.
///
/// Shape: sections keyed by name, each holding an ordered item list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChecklistDocument {
    #[serde(default)]
    pub sections: BTreeMap<String, ChecklistSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChecklistSection {
    #[serde(default)]
    pub items: Vec<ChecklistItem>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChecklistItem {
    #[serde(default)]
    pub heading: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub measurement: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub concerns: Vec<Concern>,
}

/// Free-text concern raised against an item, with its own severity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Concern {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub severity: String,
}

/// Repair category derived from section/heading keywords
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Brakes,
    Tyres,
    Suspension,
    Steering,
    Exhaust,
    Electrical,
    Cooling,
    Drivetrain,
    Service,
    Bodywork,
    Other,
}

/// Keyword table for category derivation. First match wins, so more
/// specific terms sit above generic ones.
static CATEGORY_KEYWORDS: Lazy<Vec<(Category, Vec<&'static str>)>> = Lazy::new(|| {
    vec![
        (Category::Brakes, vec!["brake", "pad", "disc", "caliper", "hub"]),
        (Category::Tyres, vec!["tyre", "tire", "wheel", "tread", "alignment"]),
        (Category::Steering, vec!["steering", "track rod", "rack"]),
        (
            Category::Suspension,
            vec!["suspension", "shock", "spring", "strut", "bush", "arm"],
        ),
        (Category::Exhaust, vec!["exhaust", "catalyst", "silencer", "dpf"]),
        (
            Category::Electrical,
            vec!["battery", "bulb", "light", "wiper", "electrical", "horn"],
        ),
        (
            Category::Cooling,
            vec!["coolant", "radiator", "antifreeze", "cooling", "hose"],
        ),
        (
            Category::Drivetrain,
            vec!["clutch", "gearbox", "driveshaft", "cv ", "transmission", "diff"],
        ),
        (
            Category::Service,
            vec!["oil", "filter", "service", "fluid", "plug", "belt"],
        ),
        (
            Category::Bodywork,
            vec!["body", "paint", "glass", "windscreen", "mirror", "panel"],
        ),
    ]
});

/// Derive the repair category for a finding from its section and heading.
pub fn categorize(section: &str, heading: &str) -> Category {
    let haystack = format!("{} {}", ids::normalize(section), ids::normalize(heading));
    for (category, keywords) in CATEGORY_KEYWORDS.iter() {
        if keywords.iter().any(|kw| haystack.contains(kw)) {
            return *category;
        }
    }
    Category::Other
}

/// One flagged or informational item found during inspection.
///
/// Derived, never persisted: re-computed from the document on every
/// change. Addressable only by display id until materialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub display_id: DisplayId,
    pub section: String,
    pub heading: String,
    pub detail_text: String,
    pub measurement: String,
    pub location_tag: String,
    pub raw_severity: Severity,
    pub category: Category,
}

impl Finding {
    /// Content-derived line key for structural matching.
    pub fn line_key(&self) -> String {
        ids::line_key(&self.detail_text, &self.measurement)
    }

    /// Structural slot code for this finding's inspection point.
    pub fn slot_code(&self) -> String {
        ids::slot_code(&self.section, &self.location_tag, &self.heading)
    }

    /// Creation payload used when this finding is first materialized.
    pub fn to_new_finding(&self) -> NewFinding {
        NewFinding {
            section: self.section.clone(),
            sub_area_key: ids::normalize(&self.location_tag),
            source_key: ids::normalize(&self.heading),
            line_key: self.line_key(),
            issue_title: self.heading.clone(),
            issue_description: self.detail_text.clone(),
            severity: self.raw_severity,
            labour_hours: None,
        }
    }
}

/// Derive the flat finding list from a checklist document.
///
/// One finding per item with a non-empty heading. Concern texts fold into
/// the detail text; a concern's severity can escalate the item's colour
/// but never downgrade it. Display ids hash only (section, heading,
/// index), so editing detail text elsewhere never moves an identity.
pub fn derive_findings(document: &ChecklistDocument) -> Vec<Finding> {
    let mut findings = Vec::new();

    for (section_name, section) in &document.sections {
        for (index, item) in section.items.iter().enumerate() {
            if item.heading.trim().is_empty() {
                continue;
            }

            let mut severity = Severity::parse(&item.status);
            let mut detail_parts: Vec<&str> = Vec::new();
            if !item.detail.trim().is_empty() {
                detail_parts.push(item.detail.trim());
            }
            for concern in &item.concerns {
                severity = severity.max(Severity::parse(&concern.severity));
                if !concern.text.trim().is_empty() {
                    detail_parts.push(concern.text.trim());
                }
            }

            let display_id = ids::derive_display_id(section_name, &item.heading, index);
            trace!(display_id = %display_id, section = %section_name, heading = %item.heading, "Derived finding");

            findings.push(Finding {
                display_id,
                section: section_name.clone(),
                heading: item.heading.clone(),
                detail_text: detail_parts.join("; "),
                measurement: item.measurement.trim().to_string(),
                location_tag: item.location.trim().to_string(),
                raw_severity: severity,
                category: categorize(section_name, &item.heading),
            });
        }
    }

    findings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_from_json(json: &str) -> ChecklistDocument {
        serde_json::from_str(json).unwrap()
    }

    fn sample_doc() -> ChecklistDocument {
        doc_from_json(
            r#"{
                "sections": {
                    "Brakes & Hubs": {
                        "items": [
                            {
                                "heading": "Front Pads",
                                "detail": "Worn to 3mm",
                                "measurement": "3mm",
                                "status": "amber",
                                "location": "Front",
                                "concerns": []
                            },
                            {
                                "heading": "Rear Discs",
                                "detail": "Heavy corrosion",
                                "status": "red",
                                "location": "Rear",
                                "concerns": []
                            }
                        ]
                    },
                    "Lighting": {
                        "items": [
                            {
                                "heading": "Number Plate Bulb",
                                "status": "green"
                            }
                        ]
                    }
                }
            }"#,
        )
    }

    #[test]
    fn test_derives_one_finding_per_item() {
        let findings = derive_findings(&sample_doc());
        assert_eq!(findings.len(), 3);

        let pads = findings.iter().find(|f| f.heading == "Front Pads").unwrap();
        assert_eq!(pads.section, "Brakes & Hubs");
        assert_eq!(pads.raw_severity, Severity::Amber);
        assert_eq!(pads.measurement, "3mm");
        assert_eq!(pads.category, Category::Brakes);
    }

    #[test]
    fn test_display_ids_stable_across_unrelated_edits() {
        let before = derive_findings(&sample_doc());

        let mut doc = sample_doc();
        doc.sections.get_mut("Brakes & Hubs").unwrap().items[1].detail =
            "Heavy corrosion, lipped edge".into();
        let after = derive_findings(&doc);

        let id_of = |list: &[Finding], heading: &str| {
            list.iter()
                .find(|f| f.heading == heading)
                .unwrap()
                .display_id
                .clone()
        };
        // Editing one item's detail moves no identities, including its own
        assert_eq!(id_of(&before, "Front Pads"), id_of(&after, "Front Pads"));
        assert_eq!(id_of(&before, "Rear Discs"), id_of(&after, "Rear Discs"));
    }

    #[test]
    fn test_concern_escalates_severity_and_folds_text() {
        let doc = doc_from_json(
            r#"{
                "sections": {
                    "Tyres": {
                        "items": [
                            {
                                "heading": "Nearside Front Tyre",
                                "detail": "Outer edge wear",
                                "status": "amber",
                                "concerns": [
                                    {"text": "Cord visible", "severity": "red"}
                                ]
                            }
                        ]
                    }
                }
            }"#,
        );
        let findings = derive_findings(&doc);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].raw_severity, Severity::Red);
        assert_eq!(findings[0].detail_text, "Outer edge wear; Cord visible");
        assert_eq!(findings[0].category, Category::Tyres);
    }

    #[test]
    fn test_items_without_heading_skipped() {
        let doc = doc_from_json(
            r#"{"sections": {"Misc": {"items": [{"heading": "  ", "status": "red"}]}}}"#,
        );
        assert!(derive_findings(&doc).is_empty());
    }

    #[test]
    fn test_categorize_falls_back_to_other() {
        assert_eq!(categorize("Interior", "Seat Trim"), Category::Other);
        assert_eq!(categorize("Cooling System", "Coolant Level"), Category::Cooling);
        assert_eq!(categorize("Service Items", "Engine Oil"), Category::Service);
    }

    #[test]
    fn test_empty_document() {
        assert!(derive_findings(&ChecklistDocument::default()).is_empty());
    }
}
