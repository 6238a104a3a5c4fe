//! Test helper module for engine integration tests
//!
//! Provides a reusable engine rig over the in-memory store plus a sample
//! checklist document covering the common severity mix.

#![allow(dead_code)]

use std::sync::Arc;
use uuid::Uuid;

use vhc_common::config::EngineConfig;
use vhc_engine::store::{FindingStore, MemoryStore};
use vhc_engine::{ChecklistDocument, Finding, ReconciliationEngine};

/// Engine wired to an in-memory store with failure injection.
pub struct TestEngine {
    pub store: Arc<MemoryStore>,
    pub engine: Arc<ReconciliationEngine>,
    pub job_id: Uuid,
}

pub async fn engine_with_memory_store() -> TestEngine {
    engine_with_config(EngineConfig::default()).await
}

/// Initialize test logging once; RUST_LOG controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn engine_with_config(config: EngineConfig) -> TestEngine {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let job_id = Uuid::new_v4();
    let engine = Arc::new(ReconciliationEngine::new(
        job_id,
        store.clone() as Arc<dyn FindingStore>,
        config,
    ));
    engine.load().await.expect("load empty job");
    TestEngine {
        store,
        engine,
        job_id,
    }
}

/// Checklist with two brake findings (amber, red), one red tyre, and one
/// green informational item.
pub fn sample_document() -> ChecklistDocument {
    serde_json::from_str(
        r#"{
            "sections": {
                "Brakes & Hubs": {
                    "items": [
                        {
                            "heading": "Front Pads",
                            "detail": "Worn to 3mm",
                            "measurement": "3mm",
                            "status": "amber",
                            "location": "Front"
                        },
                        {
                            "heading": "Rear Discs",
                            "detail": "Heavy corrosion, lipped",
                            "status": "red",
                            "location": "Rear"
                        }
                    ]
                },
                "Tyres": {
                    "items": [
                        {
                            "heading": "Nearside Front Tyre",
                            "detail": "Cord visible",
                            "measurement": "1.2mm",
                            "status": "red",
                            "location": "Nearside Front"
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
    .expect("valid sample document")
}

/// Find a derived finding by heading.
pub fn find<'a>(findings: &'a [Finding], heading: &str) -> &'a Finding {
    findings
        .iter()
        .find(|f| f.heading == heading)
        .unwrap_or_else(|| panic!("no finding with heading '{}'", heading))
}
