//! Registries mapping stable identifiers to method and transform
//! implementations.
//!
//! A [`Step`](crate::model::Step) names its method by `Ref<Method>` and a
//! [`ContextRef`](crate::model::ContextRef) names its transforms by
//! `Ref<Function>`. Both are resolved here, against maps built once by the
//! [`EngineBuilder`](crate::engine::EngineBuilder), never per call.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ProcessError, RegistryError};
use crate::executor::ActionContext;
use crate::id::Ref;
use crate::model::{ExecuteResult, Execution, Function, Method, ResolvedParams};

/// An action implementation.
///
/// Methods compute transactions; they never apply them. A method that needs
/// its effects undone when the state is compensated returns them as
/// `rollback`.
///
/// # Example
///
/// ```ignore
/// struct Archive;
///
/// #[async_trait]
/// impl MethodHandler for Archive {
///     async fn execute(
///         &self,
///         _params: ResolvedParams,
///         execution: &Execution,
///         ctx: &ActionContext<'_>,
///     ) -> Result<ExecuteResult, ProcessError> {
///         let card = ctx.target_document(&execution.card).await?
///             .ok_or_else(|| ProcessError::TargetNotFound { card: execution.card.to_string() })?;
///         let tx = ctx.factory().remove_doc(&card.class, &card.space, &card.id);
///         Ok(ExecuteResult::new(vec![tx]))
///     }
/// }
/// ```
#[async_trait]
pub trait MethodHandler: Send + Sync + 'static {
    async fn execute(
        &self,
        params: ResolvedParams,
        execution: &Execution,
        ctx: &ActionContext<'_>,
    ) -> Result<ExecuteResult, ProcessError>;
}

/// A pure value-to-value function applied during parameter resolution.
pub trait Transform: Send + Sync + 'static {
    fn apply(&self, value: Value) -> Result<Value, ProcessError>;
}

impl<F> Transform for F
where
    F: Fn(Value) -> Result<Value, ProcessError> + Send + Sync + 'static,
{
    fn apply(&self, value: Value) -> Result<Value, ProcessError> {
        self(value)
    }
}

// =============================================================================
// Method Registry
// =============================================================================

#[derive(Default, Clone)]
pub struct MethodRegistry {
    methods: HashMap<Ref<Method>, Arc<dyn MethodHandler>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in methods.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::methods::register_builtins(&mut registry);
        registry
    }

    /// Registers a method, replacing any previous one with the same id.
    pub fn register(&mut self, id: Ref<Method>, method: impl MethodHandler) {
        self.methods.insert(id, Arc::new(method));
    }

    /// Registers a method, refusing to replace an existing one.
    pub fn try_register(&mut self, id: Ref<Method>, method: impl MethodHandler) -> Result<(), RegistryError> {
        if self.methods.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered {
                kind: "method",
                id: id.to_string(),
            });
        }
        self.register(id, method);
        Ok(())
    }

    pub fn get(&self, id: &Ref<Method>) -> Option<&dyn MethodHandler> {
        self.methods.get(id).map(Arc::as_ref)
    }

    pub fn contains(&self, id: &Ref<Method>) -> bool {
        self.methods.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.methods.keys().map(Ref::as_str).collect();
        ids.sort_unstable();
        f.debug_struct("MethodRegistry").field("methods", &ids).finish()
    }
}

// =============================================================================
// Transform Registry
// =============================================================================

#[derive(Default, Clone)]
pub struct TransformRegistry {
    transforms: HashMap<Ref<Function>, Arc<dyn Transform>>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in transforms. `seed` makes `Random`
    /// deterministic.
    pub fn with_builtins(seed: Option<u64>) -> Self {
        let mut registry = Self::new();
        crate::transforms::register_builtins(&mut registry, seed);
        registry
    }

    pub fn register(&mut self, id: Ref<Function>, transform: impl Transform) {
        self.register_shared(id, Arc::new(transform));
    }

    pub fn register_shared(&mut self, id: Ref<Function>, transform: Arc<dyn Transform>) {
        self.transforms.insert(id, transform);
    }

    pub fn try_register(&mut self, id: Ref<Function>, transform: impl Transform) -> Result<(), RegistryError> {
        if self.transforms.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered {
                kind: "transform",
                id: id.to_string(),
            });
        }
        self.register(id, transform);
        Ok(())
    }

    pub fn get(&self, id: &Ref<Function>) -> Option<&dyn Transform> {
        self.transforms.get(id).map(Arc::as_ref)
    }

    pub fn contains(&self, id: &Ref<Function>) -> bool {
        self.transforms.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }
}

impl fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.transforms.keys().map(Ref::as_str).collect();
        ids.sort_unstable();
        f.debug_struct("TransformRegistry").field("transforms", &ids).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::methods::{CREATE_TODO, RUN_SUB_PROCESS, UPDATE_CARD};
    use crate::transforms::{TRIM, UPPER_CASE};
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl MethodHandler for Noop {
        async fn execute(
            &self,
            _params: ResolvedParams,
            _execution: &Execution,
            _ctx: &ActionContext<'_>,
        ) -> Result<ExecuteResult, ProcessError> {
            Ok(ExecuteResult::default())
        }
    }

    #[test]
    fn test_builtin_methods_registered() {
        let registry = MethodRegistry::with_builtins();
        assert!(registry.contains(&CREATE_TODO));
        assert!(registry.contains(&UPDATE_CARD));
        assert!(registry.contains(&RUN_SUB_PROCESS));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_try_register_rejects_duplicates() {
        let mut registry = MethodRegistry::with_builtins();
        let err = registry.try_register(UPDATE_CARD, Noop).unwrap_err();
        assert!(err.to_string().contains("already registered"));
        assert!(err.to_string().contains("UpdateCard"));

        registry.try_register(Ref::new("custom:method:Noop"), Noop).unwrap();
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = MethodRegistry::with_builtins();
        registry.register(UPDATE_CARD, Noop);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_closures_are_transforms() {
        let mut registry = TransformRegistry::new();
        registry.register(
            Ref::new("custom:function:Double"),
            |value: Value| -> Result<Value, ProcessError> {
                Ok(json!(value.as_i64().unwrap_or_default() * 2))
            },
        );

        let double = registry.get(&Ref::new("custom:function:Double")).unwrap();
        assert_eq!(double.apply(json!(21)).unwrap(), json!(42));
    }

    #[test]
    fn test_builtin_transforms_registered() {
        let registry = TransformRegistry::with_builtins(Some(7));
        assert!(registry.contains(&UPPER_CASE));
        assert!(registry.contains(&TRIM));
        assert_eq!(registry.len(), 6);
        assert!(format!("{:?}", registry).contains("process:function:Trim"));
    }
}
