//! The engine facade and its builder.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::core::{Tx, TxFactory};
use crate::error::RegistryError;
use crate::executor::ActionExecutor;
use crate::id::Ref;
use crate::model::{Function, Method};
use crate::registry::{MethodHandler, MethodRegistry, Transform, TransformRegistry};
use crate::store::DocumentStore;
use crate::transition::StateTransition;
use crate::trigger::Dispatcher;

/// Computes the transactions a batch of lifecycle events calls for.
///
/// The engine never writes. Hand the returned transactions to the store,
/// then feed the store's resulting lifecycle events back in.
///
/// # Example
///
/// ```rust,ignore
/// let engine = EngineBuilder::new(store.clone())
///     .with_config(EngineConfig::from_env()?)
///     .with_method(ARCHIVE, Archive)
///     .build();
///
/// let txes = engine.process(&batch).await;
/// store.apply_all(&txes);
/// ```
pub struct Engine {
    store: Arc<dyn DocumentStore>,
    methods: MethodRegistry,
    transforms: TransformRegistry,
    factory: TxFactory,
    config: EngineConfig,
}

impl Engine {
    pub fn builder(store: Arc<dyn DocumentStore>) -> EngineBuilder {
        EngineBuilder::new(store)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn methods(&self) -> &MethodRegistry {
        &self.methods
    }

    pub fn transforms(&self) -> &TransformRegistry {
        &self.transforms
    }

    /// Handles `batch` in order and returns the transactions to apply.
    ///
    /// Events are independent: one that fails contributes nothing and the
    /// rest of the batch still runs.
    pub async fn process(&self, batch: &[Tx]) -> Vec<Tx> {
        let dispatcher = self.dispatcher();
        let mut out = Vec::new();
        for tx in batch {
            out.extend(dispatcher.dispatch(tx).await);
        }
        debug!(events = batch.len(), produced = out.len(), "batch processed");
        out
    }

    fn dispatcher(&self) -> Dispatcher<'_> {
        let store = self.store.as_ref();
        let executor = ActionExecutor::new(&self.methods, &self.transforms);
        let transition = StateTransition::new(store, executor, &self.factory, &self.config);
        Dispatcher::new(store, transition, &self.factory)
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("methods", &self.methods)
            .field("transforms", &self.transforms)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Engine`].
///
/// Built-in methods and transforms are registered at [`build`](Self::build)
/// time, underneath anything registered here: `with_*` on a built-in id
/// replaces it, `try_with_*` on a built-in id is an error.
pub struct EngineBuilder {
    store: Arc<dyn DocumentStore>,
    config: EngineConfig,
    methods: MethodRegistry,
    transforms: Vec<(Ref<Function>, Arc<dyn Transform>)>,
}

impl EngineBuilder {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            config: EngineConfig::default(),
            methods: MethodRegistry::with_builtins(),
            transforms: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers a method, replacing any existing one with the same id.
    pub fn with_method(mut self, id: Ref<Method>, method: impl MethodHandler) -> Self {
        self.methods.register(id, method);
        self
    }

    /// Registers a method, failing if the id is taken.
    pub fn try_with_method(mut self, id: Ref<Method>, method: impl MethodHandler) -> Result<Self, RegistryError> {
        self.methods.try_register(id, method)?;
        Ok(self)
    }

    /// Registers a transform, replacing any existing one with the same id.
    pub fn with_transform(mut self, id: Ref<Function>, transform: impl Transform) -> Self {
        self.transforms.retain(|(existing, _)| existing != &id);
        self.transforms.push((id, Arc::new(transform)));
        self
    }

    /// Registers a transform, failing if the id is taken.
    pub fn try_with_transform(self, id: Ref<Function>, transform: impl Transform) -> Result<Self, RegistryError> {
        let taken = crate::transforms::is_builtin(&id) || self.transforms.iter().any(|(existing, _)| existing == &id);
        if taken {
            return Err(RegistryError::AlreadyRegistered {
                kind: "transform",
                id: id.to_string(),
            });
        }
        Ok(self.with_transform(id, transform))
    }

    pub fn build(self) -> Engine {
        // The seed lives in config, so built-ins are created here.
        let mut transforms = TransformRegistry::with_builtins(self.config.random_seed);
        for (id, transform) in self.transforms {
            transforms.register_shared(id, transform);
        }

        info!(
            methods = self.methods.len(),
            transforms = transforms.len(),
            account = %self.config.account,
            seeded = self.config.random_seed.is_some(),
            "process engine built"
        );
        Engine {
            store: self.store,
            methods: self.methods,
            transforms,
            factory: TxFactory::new(self.config.account.clone()),
            config: self.config,
        }
    }
}

impl fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let transforms: Vec<_> = self.transforms.iter().map(|(id, _)| id.as_str()).collect();
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("methods", &self.methods)
            .field("transforms", &transforms)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Class, Doc};
    use crate::error::{ProcessError, StoreError};
    use crate::methods::UPDATE_CARD;
    use crate::model::{class, Execution, ProcessToDo, Step};
    use crate::store::{FindOptions, MemoryStore, Query};
    use crate::testing::{state, Fixture};
    use crate::transforms::UPPER_CASE;
    use serde_json::{json, Value};

    fn builder() -> EngineBuilder {
        EngineBuilder::new(Arc::new(MemoryStore::new()))
    }

    fn identity(value: Value) -> Result<Value, ProcessError> {
        Ok(value)
    }

    #[test]
    fn test_build_registers_builtins() {
        let engine = builder().build();
        assert_eq!(engine.methods().len(), 3);
        assert_eq!(engine.transforms().len(), 6);
    }

    #[test]
    fn test_try_with_transform_rejects_builtin_ids() {
        let err = builder().try_with_transform(UPPER_CASE, identity).unwrap_err();
        assert!(err.to_string().contains("UpperCase"));
    }

    #[test]
    fn test_with_transform_replaces_builtin() {
        let engine = builder().with_transform(UPPER_CASE, identity).build();
        assert_eq!(engine.transforms().len(), 6);
        let upper = engine.transforms().get(&UPPER_CASE).unwrap();
        assert_eq!(upper.apply(Value::from("abc")).unwrap(), Value::from("abc"));
    }

    #[test]
    fn test_try_with_transform_rejects_duplicates() {
        let result = builder()
            .try_with_transform(Ref::new("custom:function:Shout"), identity)
            .and_then(|b| b.try_with_transform(Ref::new("custom:function:Shout"), identity));
        assert!(result.is_err());
    }

    #[test]
    fn test_try_with_method_rejects_builtin_ids() {
        let engine = builder().try_with_method(UPDATE_CARD, crate::methods::UpdateCard);
        assert!(engine.is_err());
    }

    #[test]
    fn test_config_drives_factory_account() {
        let config = EngineConfig {
            account: Ref::new("core:account:Robot"),
            ..EngineConfig::default()
        };
        let engine = builder().with_config(config).build();
        assert_eq!(engine.factory.account().as_str(), "core:account:Robot");
    }

    #[tokio::test]
    async fn test_process_ignores_unrelated_events() {
        let engine = builder().build();
        let factory = TxFactory::new(Ref::new("core:account:System"));
        let tx = factory.remove_doc(&class::CARD, &Ref::new("space"), &Ref::<Doc>::new("card-1"));
        assert!(engine.process(&[tx]).await.is_empty());
    }

    // =========================================================================
    // Batch Containment Tests
    // =========================================================================

    /// Fails every query for one class, delegates the rest.
    struct FailingStore {
        inner: Arc<MemoryStore>,
        failing: Ref<Class>,
    }

    #[async_trait::async_trait]
    impl DocumentStore for FailingStore {
        async fn find_all(
            &self,
            class: &Ref<Class>,
            query: &Query,
            options: &FindOptions,
        ) -> Result<Vec<Doc>, StoreError> {
            if class == &self.failing {
                return Err(StoreError::Backend(anyhow::anyhow!("connection reset")));
            }
            self.inner.find_all(class, query, options).await
        }

        fn removed(&self, id: &Ref<Doc>) -> Option<Doc> {
            self.inner.removed(id)
        }
    }

    fn fixture() -> Fixture {
        Fixture::new()
            .with_card("card-1", json!({ "status": "open" }))
            .with_process(
                "proc-1",
                [state("s0").action(Step::new(UPDATE_CARD).literal("status", "active"))],
            )
    }

    fn entered(produced: &[Tx], execution: &str, state: &str) -> bool {
        produced.iter().any(|tx| {
            tx.object_id.as_str() == execution
                && tx
                    .operations()
                    .and_then(|ops| ops.get("currentState"))
                    .is_some_and(|value| value == &json!(state))
        })
    }

    #[tokio::test]
    async fn test_malformed_event_does_not_stop_batch() {
        let fx = fixture();
        let engine = fx.engine();
        let factory = TxFactory::new(Ref::new("core:account:System"));

        let mut attributes = serde_json::Map::new();
        attributes.insert("card".into(), json!("card-1"));
        let malformed = factory.create_doc(
            &class::EXECUTION,
            fx.space(),
            attributes,
            &Ref::<Execution>::new("exec-bad"),
        );
        let valid = fx.create_execution("exec-1", "proc-1", "card-1");

        let produced = engine.process(&[malformed, valid]).await;

        assert!(entered(&produced, "exec-1", "s0"));
        assert!(produced.iter().all(|tx| tx.object_id.as_str() != "exec-bad"));
    }

    #[tokio::test]
    async fn test_store_failure_does_not_stop_batch() {
        let fx = fixture();
        let store = FailingStore {
            inner: fx.store().clone(),
            failing: class::PROCESS_TODO,
        };
        let engine = EngineBuilder::new(Arc::new(store)).build();
        let factory = TxFactory::new(Ref::new("core:account:System"));

        let mut operations = serde_json::Map::new();
        operations.insert("doneOn".into(), json!(1_700_000_000_000i64));
        let completed = factory.update_doc(
            &class::PROCESS_TODO,
            &Ref::new("time:space:ToDos"),
            &Ref::<ProcessToDo>::new("todo-1"),
            operations,
        );
        let valid = fx.create_execution("exec-1", "proc-1", "card-1");

        let produced = engine.process(&[completed, valid]).await;

        assert!(entered(&produced, "exec-1", "s0"));
        assert_eq!(produced.len(), 3);
    }
}
