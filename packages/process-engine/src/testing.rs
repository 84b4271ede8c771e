//! Fixtures for driving the engine against an in-memory store.
//!
//! # Feature Flag
//!
//! Only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! process-engine = { path = "../process-engine", features = ["testing"] }
//! ```
//!
//! # Example
//!
//! ```ignore
//! use process_engine::testing::{state, Fixture};
//!
//! let fx = Fixture::new()
//!     .with_card("card-1", json!({ "status": "open" }))
//!     .with_process("proc-1", [
//!         state("s0").action(Step::new(UPDATE_CARD).literal("status", "active")),
//!     ]);
//! let engine = fx.engine();
//!
//! let start = fx.create_execution("exec-1", "proc-1", "card-1");
//! fx.settle(&engine, vec![start]).await;
//!
//! assert_eq!(fx.doc("card-1").unwrap().get("status"), Some(json!("active")));
//! ```
//!
//! The fixture plays the part of the downstream store: every helper that
//! produces a lifecycle transaction applies it first, the way a real store
//! emits events only for committed changes.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::core::{Doc, Space, Tx, TxFactory};
use crate::engine::{Engine, EngineBuilder};
use crate::id::Ref;
use crate::model::{class, Execution, Process, ProcessToDo, State, Step};
use crate::store::{DocumentStore, MemoryStore};

/// Upper bound on feedback rounds in [`Fixture::settle`].
const MAX_ROUNDS: usize = 16;

/// Starts a state definition for [`Fixture::with_process`].
pub fn state(id: &str) -> StateBuilder {
    StateBuilder {
        id: id.to_string(),
        title: id.to_string(),
        actions: Vec::new(),
        end_action: None,
    }
}

#[derive(Debug, Clone)]
pub struct StateBuilder {
    id: String,
    title: String,
    actions: Vec<Step>,
    end_action: Option<Step>,
}

impl StateBuilder {
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn action(mut self, step: Step) -> Self {
        self.actions.push(step);
        self
    }

    pub fn end_action(mut self, step: Step) -> Self {
        self.end_action = Some(step);
        self
    }
}

/// An in-memory world: store, process definitions, cards.
pub struct Fixture {
    store: Arc<MemoryStore>,
    space: Ref<Space>,
    factory: TxFactory,
    seed: u64,
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_store(MemoryStore::new())
    }

    /// Wraps a store that already carries hierarchy or attribute metadata.
    pub fn with_store(store: MemoryStore) -> Self {
        Self {
            store: Arc::new(store),
            space: Ref::from_static("fixture:space:Default"),
            factory: TxFactory::new(Ref::from_static("fixture:account:User")),
            seed: 7,
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn space(&self) -> &Ref<Space> {
        &self.space
    }

    pub fn with_doc(self, doc: Doc) -> Self {
        self.store.insert(doc);
        self
    }

    /// Inserts a card with the given attributes.
    pub fn with_card(self, id: &str, attributes: Value) -> Self {
        let mut doc = Doc::new(Ref::new(id), class::CARD, self.space.clone());
        if let Value::Object(attributes) = attributes {
            doc.attributes = attributes;
        }
        self.with_doc(doc)
    }

    /// Inserts a process and its states, in order.
    pub fn with_process(self, id: &str, states: impl IntoIterator<Item = StateBuilder>) -> Self {
        let process_id: Ref<Process> = Ref::new(id);
        let states: Vec<State> = states
            .into_iter()
            .map(|builder| State {
                id: Ref::new(builder.id),
                class: class::STATE,
                space: self.space.clone(),
                process: process_id.clone(),
                title: builder.title,
                actions: builder.actions,
                end_action: builder.end_action,
            })
            .collect();
        let process = Process {
            id: process_id,
            class: class::PROCESS,
            space: self.space.clone(),
            name: id.to_string(),
            states: states.iter().map(|state| state.id.clone()).collect(),
        };

        self.store.insert(to_doc(&process));
        for state in &states {
            self.store.insert(to_doc(state));
        }
        self
    }

    /// An engine over this fixture's store with a fixed `Random` seed.
    pub fn engine(&self) -> Engine {
        self.engine_with(|builder| builder)
    }

    pub fn engine_with(&self, configure: impl FnOnce(EngineBuilder) -> EngineBuilder) -> Engine {
        let store: Arc<dyn DocumentStore> = self.store.clone();
        let config = crate::config::EngineConfig::default().with_random_seed(self.seed);
        configure(EngineBuilder::new(store).with_config(config)).build()
    }

    // =========================================================================
    // Lifecycle events
    // =========================================================================

    /// Creates an execution and returns the applied create transaction.
    pub fn create_execution(&self, id: &str, process: &str, card: &str) -> Tx {
        let mut attributes = Map::new();
        attributes.insert("process".into(), Value::from(process));
        attributes.insert("card".into(), Value::from(card));
        attributes.insert("currentState".into(), Value::Null);
        attributes.insert("currentToDo".into(), Value::Null);
        attributes.insert("assignee".into(), Value::Null);
        attributes.insert("done".into(), Value::Bool(false));
        attributes.insert("rollback".into(), Value::Object(Map::new()));
        let tx = self.factory.create_doc(
            &class::EXECUTION,
            &self.space,
            attributes,
            &Ref::<Execution>::new(id),
        );
        self.store.apply(&tx);
        tx
    }

    /// Marks a ToDo done and returns the applied update.
    pub fn complete_todo(&self, todo: &Ref<ProcessToDo>) -> Tx {
        let doc = self.require(todo.as_str());
        let mut operations = Map::new();
        operations.insert("doneOn".into(), Value::from(chrono::Utc::now().timestamp_millis()));
        let tx = self.factory.update_doc(&doc.class, &doc.space, &doc.id, operations);
        self.store.apply(&tx);
        tx
    }

    /// Removes any document and returns the applied removal.
    pub fn remove(&self, id: &str) -> Tx {
        let doc = self.require(id);
        let tx = self.factory.remove_doc(&doc.class, &doc.space, &doc.id);
        self.store.apply(&tx);
        tx
    }

    /// Feeds `batch` through the engine, applies what it returns, and keeps
    /// feeding the results back in until nothing more is produced.
    ///
    /// Returns every transaction the engine produced, in order.
    pub async fn settle(&self, engine: &Engine, batch: Vec<Tx>) -> Vec<Tx> {
        let mut produced = Vec::new();
        let mut batch = batch;
        for _ in 0..MAX_ROUNDS {
            if batch.is_empty() {
                return produced;
            }
            let out = engine.process(&batch).await;
            self.store.clear_removed();
            self.store.apply_all(&out);
            produced.extend(out.iter().cloned());
            batch = out;
        }
        panic!("engine did not settle after {MAX_ROUNDS} rounds");
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn doc(&self, id: &str) -> Option<Doc> {
        self.store.get(&Ref::new(id))
    }

    fn require(&self, id: &str) -> Doc {
        self.doc(id)
            .unwrap_or_else(|| panic!("fixture has no document {id}"))
    }

    pub fn execution(&self, id: &str) -> Execution {
        self.require(id)
            .parse()
            .unwrap_or_else(|err| panic!("document {id} is not an execution: {err}"))
    }

    pub fn state(&self, id: &str) -> State {
        self.require(id)
            .parse()
            .unwrap_or_else(|err| panic!("document {id} is not a state: {err}"))
    }

    pub fn process(&self, id: &str) -> Process {
        self.require(id)
            .parse()
            .unwrap_or_else(|err| panic!("document {id} is not a process: {err}"))
    }

    pub fn todo(&self, id: &Ref<ProcessToDo>) -> ProcessToDo {
        self.require(id.as_str())
            .parse()
            .unwrap_or_else(|err| panic!("document {id} is not a todo: {err}"))
    }

    /// The execution's current ToDo, if it has one.
    pub fn current_todo(&self, execution: &str) -> Option<ProcessToDo> {
        let current = self.execution(execution).current_to_do?;
        Some(self.todo(&current))
    }
}

fn to_doc<T: serde::Serialize>(model: &T) -> Doc {
    Doc::from_model(model).unwrap_or_else(|err| panic!("fixture model does not encode: {err}"))
}
