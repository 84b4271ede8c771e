//! Runs a single step: look up its method, resolve its params, call it.
//!
//! Every failure is contained here. A step that cannot run is logged with a
//! level chosen by [`ErrorCategory`] and yields `None`; the caller moves on
//! to the next step.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::{error, warn};

use crate::config::EngineConfig;
use crate::core::{Doc, Tx, TxFactory};
use crate::error::{panic_message, ErrorCategory, ProcessError, StoreError};
use crate::id::Ref;
use crate::model::{class, ExecuteResult, Execution, ParamValue, Step};
use crate::registry::{MethodRegistry, TransformRegistry};
use crate::resolver::{ContextResolver, Target};
use crate::store::{DocumentStore, FindOptions, Query};

/// What a method may see while it runs.
///
/// `pending` holds the transactions earlier steps of the same transition
/// produced. They are not applied to the store yet, so reads of the target
/// document go through [`ActionContext::target_document`], which overlays
/// them.
#[derive(Clone, Copy)]
pub struct ActionContext<'a> {
    store: &'a dyn DocumentStore,
    factory: &'a TxFactory,
    config: &'a EngineConfig,
    pending: &'a [Tx],
}

impl<'a> ActionContext<'a> {
    pub fn new(
        store: &'a dyn DocumentStore,
        factory: &'a TxFactory,
        config: &'a EngineConfig,
        pending: &'a [Tx],
    ) -> Self {
        Self {
            store,
            factory,
            config,
            pending,
        }
    }

    pub fn store(&self) -> &'a dyn DocumentStore {
        self.store
    }

    pub fn factory(&self) -> &'a TxFactory {
        self.factory
    }

    pub fn config(&self) -> &'a EngineConfig {
        self.config
    }

    pub fn pending(&self) -> &'a [Tx] {
        self.pending
    }

    /// The target document with pending updates applied.
    pub async fn target_document(&self, card: &Ref<Doc>) -> Result<Option<Doc>, StoreError> {
        let found = self
            .store
            .find_all(&class::CARD, &Query::by_id(card), &FindOptions::one())
            .await?;
        Ok(found.into_iter().next().map(|mut doc| {
            for tx in self.pending {
                doc.apply(tx);
            }
            doc
        }))
    }
}

pub struct ActionExecutor<'a> {
    methods: &'a MethodRegistry,
    transforms: &'a TransformRegistry,
}

impl<'a> ActionExecutor<'a> {
    pub fn new(methods: &'a MethodRegistry, transforms: &'a TransformRegistry) -> Self {
        Self {
            methods,
            transforms,
        }
    }

    /// Runs `step` for `execution`. `None` means the step was skipped; the
    /// reason has been logged.
    pub async fn execute_action(
        &self,
        step: &Step,
        execution: &Execution,
        ctx: &ActionContext<'_>,
    ) -> Option<ExecuteResult> {
        let outcome = AssertUnwindSafe(self.try_execute(step, execution, ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic_info| {
                Err(ProcessError::Panicked {
                    method_id: step.method_id.to_string(),
                    message: panic_message(panic_info.as_ref()),
                })
            });

        match outcome {
            Ok(result) => Some(result),
            Err(err) => {
                let category = err.category();
                match category {
                    ErrorCategory::Configuration | ErrorCategory::Transform => warn!(
                        method = %step.method_id,
                        execution = %execution.id,
                        %category,
                        error = %err,
                        "action skipped"
                    ),
                    _ => error!(
                        method = %step.method_id,
                        execution = %execution.id,
                        %category,
                        error = %err,
                        "action failed"
                    ),
                }
                None
            }
        }
    }

    async fn try_execute(
        &self,
        step: &Step,
        execution: &Execution,
        ctx: &ActionContext<'_>,
    ) -> Result<ExecuteResult, ProcessError> {
        let method = self
            .methods
            .get(&step.method_id)
            .ok_or_else(|| ProcessError::MethodNotRegistered {
                method_id: step.method_id.to_string(),
            })?;

        let needs_target = step
            .params
            .values()
            .any(|param| matches!(param, ParamValue::Context(_)));
        let card = if needs_target {
            ctx.target_document(&execution.card).await?
        } else {
            None
        };

        let target = Target {
            id: &execution.card,
            doc: card.as_ref(),
        };
        let params = ContextResolver::new(ctx.store(), self.transforms)
            .fill_params(&step.params, target)
            .await?;

        method.execute(params, execution, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContextRef, ResolvedParams};
    use crate::registry::MethodHandler;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    const ECHO: Ref<crate::model::Method> = Ref::from_static("test:method:Echo");
    const BOOM: Ref<crate::model::Method> = Ref::from_static("test:method:Boom");

    /// Records the params it was called with.
    #[derive(Clone, Default)]
    struct Echo {
        seen: Arc<Mutex<Vec<ResolvedParams>>>,
    }

    #[async_trait]
    impl MethodHandler for Echo {
        async fn execute(
            &self,
            params: ResolvedParams,
            _execution: &Execution,
            _ctx: &ActionContext<'_>,
        ) -> Result<ExecuteResult, ProcessError> {
            self.seen.lock().unwrap().push(params);
            Ok(ExecuteResult::default())
        }
    }

    struct Boom;

    #[async_trait]
    impl MethodHandler for Boom {
        async fn execute(
            &self,
            _params: ResolvedParams,
            _execution: &Execution,
            _ctx: &ActionContext<'_>,
        ) -> Result<ExecuteResult, ProcessError> {
            panic!("method exploded");
        }
    }

    fn execution() -> Execution {
        Execution {
            id: Ref::new("exec-1"),
            class: class::EXECUTION,
            space: Ref::new("space"),
            process: Ref::new("proc-1"),
            card: Ref::new("card-1"),
            current_state: None,
            current_to_do: None,
            assignee: None,
            done: false,
            rollback: BTreeMap::new(),
        }
    }

    fn store() -> MemoryStore {
        MemoryStore::new().with_documents([Doc::new(Ref::new("card-1"), class::CARD, Ref::new("space"))
            .with("status", "open")])
    }

    // =========================================================================
    // ActionContext
    // =========================================================================

    #[tokio::test]
    async fn test_target_document_overlays_pending_updates() {
        let store = store();
        let factory = TxFactory::new(Ref::new("core:account:System"));
        let config = EngineConfig::default();
        let mut operations = serde_json::Map::new();
        operations.insert("status".into(), json!("done"));
        let pending = vec![factory.update_doc(
            &class::CARD,
            &Ref::new("space"),
            &Ref::<Doc>::new("card-1"),
            operations,
        )];
        let ctx = ActionContext::new(&store, &factory, &config, &pending);

        let card = ctx.target_document(&Ref::new("card-1")).await.unwrap().unwrap();
        assert_eq!(card.get("status"), Some(json!("done")));
        // The store itself is untouched.
        assert_eq!(
            store.get(&Ref::new("card-1")).unwrap().get("status"),
            Some(json!("open"))
        );
    }

    // =========================================================================
    // ActionExecutor
    // =========================================================================

    #[tokio::test]
    async fn test_execute_action_resolves_params() {
        let store = store();
        let factory = TxFactory::new(Ref::new("core:account:System"));
        let config = EngineConfig::default();
        let echo = Echo::default();
        let mut methods = MethodRegistry::new();
        methods.register(ECHO, echo.clone());
        let transforms = TransformRegistry::new();
        let ctx = ActionContext::new(&store, &factory, &config, &[]);

        let step = Step::new(ECHO)
            .literal("fixed", 1)
            .context("status", ContextRef::attribute("status"));
        let result = ActionExecutor::new(&methods, &transforms)
            .execute_action(&step, &execution(), &ctx)
            .await;

        assert!(result.is_some());
        let seen = echo.seen.lock().unwrap();
        assert_eq!(seen[0]["fixed"], json!(1));
        assert_eq!(seen[0]["status"], json!("open"));
    }

    #[tokio::test]
    async fn test_unregistered_method_is_skipped() {
        let store = store();
        let factory = TxFactory::new(Ref::new("core:account:System"));
        let config = EngineConfig::default();
        let methods = MethodRegistry::new();
        let transforms = TransformRegistry::new();
        let ctx = ActionContext::new(&store, &factory, &config, &[]);

        let result = ActionExecutor::new(&methods, &transforms)
            .execute_action(&Step::new(ECHO), &execution(), &ctx)
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_unresolved_param_skips_method() {
        let store = store();
        let factory = TxFactory::new(Ref::new("core:account:System"));
        let config = EngineConfig::default();
        let echo = Echo::default();
        let mut methods = MethodRegistry::new();
        methods.register(ECHO, echo.clone());
        let transforms = TransformRegistry::new();
        let ctx = ActionContext::new(&store, &factory, &config, &[]);

        let step = Step::new(ECHO).context("missing", ContextRef::attribute("nope"));
        let result = ActionExecutor::new(&methods, &transforms)
            .execute_action(&step, &execution(), &ctx)
            .await;

        assert!(result.is_none());
        assert!(echo.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_method_is_contained() {
        let store = store();
        let factory = TxFactory::new(Ref::new("core:account:System"));
        let config = EngineConfig::default();
        let mut methods = MethodRegistry::new();
        methods.register(BOOM, Boom);
        let transforms = TransformRegistry::new();
        let ctx = ActionContext::new(&store, &factory, &config, &[]);

        let result = ActionExecutor::new(&methods, &transforms)
            .execute_action(&Step::new(BOOM), &execution(), &ctx)
            .await;
        assert!(result.is_none());
    }
}
