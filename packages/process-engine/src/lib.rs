//! # Process Engine
//!
//! Automates multi-step processes over documents ("cards"). A process is an
//! ordered list of states; each state carries steps to run when an execution
//! enters it. Executions advance as their ToDos are completed and compensate
//! when the things they depend on are removed.
//!
//! ## Core Concepts
//!
//! The engine separates **what happened** from **what to write**:
//! - A [`Tx`] arriving in a batch is a committed fact (a document was
//!   created, updated or removed).
//! - The [`Tx`]s [`Engine::process`] returns are the writes those facts call
//!   for. The engine never applies them itself.
//!
//! ## Architecture
//!
//! ```text
//! Store (applies txes, emits lifecycle txes)
//!     │                              ▲
//!     ▼ Engine::process(batch)       │ Vec<Tx>
//! Dispatcher ── Trigger::classify ───┤
//!     │                              │
//!     ▼ change_state()               │
//! StateTransition ───────────────────┤
//!     │  (per step, in order)        │
//!     ▼                              │
//! ActionExecutor ── ContextResolver  │
//!     │                 │            │
//!     ▼                 ▼            │
//! MethodRegistry   TransformRegistry │
//!     │                              │
//!     └─► ExecuteResult { txes, rollback } ──┘
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Read-only** - the engine queries the store and returns transactions
//! 2. **Ordered** - events run in arrival order, steps in declared order
//! 3. **Contained** - a failing step or event never aborts the batch
//! 4. **Compensable** - each state's rollback is stored on the execution,
//!    last step first, and replayed when the state or its ToDo is removed
//!
//! ## Example
//!
//! ```rust,ignore
//! use process_engine::{EngineBuilder, EngineConfig, MemoryStore};
//!
//! let store = Arc::new(MemoryStore::new());
//! let engine = EngineBuilder::new(store.clone())
//!     .with_config(EngineConfig::from_env()?)
//!     .build();
//!
//! let txes = engine.process(&batch).await;
//! store.apply_all(&txes);
//! ```

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod executor;
pub mod id;
pub mod methods;
pub mod model;
pub mod registry;
pub mod resolver;
pub mod store;
pub mod transforms;
pub mod transition;
pub mod trigger;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use crate::config::EngineConfig;
pub use crate::core::{Doc, Tx, TxFactory, TxKind};
pub use crate::engine::{Engine, EngineBuilder};
pub use crate::error::{ErrorCategory, ProcessError, RegistryError, StoreError};
pub use crate::executor::{ActionContext, ActionExecutor};
pub use crate::id::Ref;
pub use crate::model::{
    ContextRef, ContextSource, Direction, ExecuteResult, Execution, ParamValue, Process, ProcessToDo,
    State, Step,
};
pub use crate::registry::{MethodHandler, MethodRegistry, Transform, TransformRegistry};
pub use crate::resolver::ContextResolver;
pub use crate::store::{DocumentStore, DocumentStoreExt, FindOptions, MemoryStore, Query};
pub use crate::transition::StateTransition;
pub use crate::trigger::{Dispatcher, Trigger};

// Re-export for implementing `MethodHandler` and `DocumentStore`.
pub use async_trait::async_trait;
