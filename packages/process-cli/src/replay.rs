//! Fixture loading and the replay loop.
//!
//! A fixture describes the store *after* the events were committed:
//!
//! ```json
//! {
//!   "documents":  [ { "_id": "...", "_class": "...", "space": "...", ... } ],
//!   "removed":    [ snapshots of documents the events removed ],
//!   "subclasses": { "custom:class:Task": "card:class:Card" },
//!   "attributes": [ { "class": "card:class:Card", "key": "owner",
//!                     "attributeType": { "type": "refTo", "of": "contact:class:Person" } } ],
//!   "events":     [ transactions, as the engine emits them ]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use process_engine::core::Class;
use process_engine::store::AttributeType;
use process_engine::{Doc, Engine, MemoryStore, Ref, Tx};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReplayFixture {
    #[serde(default)]
    pub documents: Vec<Doc>,
    #[serde(default)]
    pub removed: Vec<Doc>,
    /// Class to parent class.
    #[serde(default)]
    pub subclasses: BTreeMap<String, String>,
    #[serde(default)]
    pub attributes: Vec<AttributeDecl>,
    pub events: Vec<Tx>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeDecl {
    pub class: Ref<Class>,
    pub key: String,
    pub attribute_type: AttributeType,
}

impl ReplayFixture {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixture {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("Invalid fixture {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Builds the store the events were committed to. Consumes everything
    /// but the events.
    pub fn store(&mut self) -> MemoryStore {
        let mut store = MemoryStore::new();
        for (class, parent) in std::mem::take(&mut self.subclasses) {
            store = store.with_subclass(Ref::new(class), Ref::new(parent));
        }
        for decl in std::mem::take(&mut self.attributes) {
            store = store.with_attribute(decl.class, decl.key, decl.attribute_type);
        }
        let store = store.with_documents(std::mem::take(&mut self.documents));
        for doc in std::mem::take(&mut self.removed) {
            store.record_removed(doc);
        }
        store
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReplayOptions {
    /// Apply what each round produced and feed it back in.
    pub settle: bool,
    pub max_rounds: usize,
}

#[derive(Debug, Serialize)]
pub struct Round {
    pub round: usize,
    pub events: usize,
    pub produced: Vec<Tx>,
}

#[derive(Debug, Serialize)]
pub struct Report {
    pub rounds: Vec<Round>,
    /// Final store contents; only present when settling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documents: Option<Vec<Doc>>,
}

/// Runs `events` through `engine`. Without `settle` this is exactly one
/// [`Engine::process`] call and the store is left untouched.
pub async fn run(engine: &Engine, store: &MemoryStore, events: Vec<Tx>, options: ReplayOptions) -> Result<Report> {
    let mut rounds = Vec::new();
    let mut batch = events;

    for round in 1..=options.max_rounds {
        if batch.is_empty() {
            break;
        }
        let produced = engine.process(&batch).await;
        info!(round, events = batch.len(), produced = produced.len(), "round complete");
        rounds.push(Round {
            round,
            events: batch.len(),
            produced: produced.clone(),
        });

        if !options.settle {
            return Ok(Report {
                rounds,
                documents: None,
            });
        }
        store.clear_removed();
        store.apply_all(&produced);
        batch = produced;
    }

    if !batch.is_empty() {
        bail!("engine did not settle after {} rounds", options.max_rounds);
    }
    Ok(Report {
        rounds,
        documents: options.settle.then(|| store.documents()),
    })
}
