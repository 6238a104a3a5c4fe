//! Identifier newtypes and deterministic key derivation
//!
//! Findings have two identity tiers. The *display identifier* is derived
//! from a finding's position in the checklist document and exists before
//! anything is persisted. The *canonical identifier* is assigned by the
//! store when a finding is materialized. The two are distinct newtypes so
//! a derived key can never be handed to an API expecting a persisted key
//! without going through the alias store.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Identifier derived from a finding's position in the checklist document.
///
/// Stable across runs for the same document shape: derivation hashes only
/// the section name, the item heading, and the item's index within its
/// section, so edits elsewhere in the document do not move it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct DisplayId(String);

impl DisplayId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DisplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable identifier assigned by the persistent store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CanonicalId(i64);

impl CanonicalId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for CanonicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Derive the display identifier for an item at `index` within `section`.
pub fn derive_display_id(section: &str, heading: &str, index: usize) -> DisplayId {
    let mut hasher = Sha256::new();
    hasher.update(normalize(section).as_bytes());
    hasher.update([0x1f]);
    hasher.update(normalize(heading).as_bytes());
    hasher.update([0x1f]);
    hasher.update((index as u64).to_le_bytes());
    DisplayId(format!("vhc-{}", hex_prefix(&hasher.finalize(), 16)))
}

/// Structural slot code for a persisted finding.
///
/// Built from the section, the sub-area (location tag) and the source key
/// (normalized heading). Two findings in the same slot describe the same
/// physical inspection point.
pub fn slot_code(section: &str, sub_area_key: &str, source_key: &str) -> String {
    format!(
        "{}/{}/{}",
        normalize(section),
        normalize(sub_area_key),
        normalize(source_key)
    )
}

/// Content-derived line key for exact structural matching.
pub fn line_key(detail: &str, measurement: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(detail).as_bytes());
    hasher.update([0x1f]);
    hasher.update(normalize(measurement).as_bytes());
    hex_prefix(&hasher.finalize(), 16)
}

/// Normalize free text for key derivation and content matching:
/// trimmed, lowercased, inner whitespace runs collapsed to single spaces.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn hex_prefix(digest: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for byte in digest {
        if out.len() >= chars {
            break;
        }
        out.push_str(&format!("{:02x}", byte));
    }
    out.truncate(chars);
    out
}
