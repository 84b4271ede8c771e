//! Resolution of step parameters against the target document graph.
//!
//! Literals pass through. A [`ContextRef`] is resolved in three stages:
//!
//! 1. **Base value** from its [`ContextSource`]: an attribute of the target,
//!    documents linked through an association, or documents referenced by
//!    one of the target's attributes. Collected documents are reduced to one
//!    by `sourceFunction` (or by taking the first) before `key` is read.
//! 2. **Fallback** when the base value is missing. No value and no fallback
//!    is a [`ProcessError::Unresolved`], which aborts the whole action.
//! 3. **Transform chain** (`functions`), applied in order. A failing
//!    transform is skipped and the value it was given is kept.

use std::panic::{catch_unwind, AssertUnwindSafe};

use serde_json::Value;
use tracing::{debug, warn};

use crate::core::{get_object_value, Doc};
use crate::error::{panic_message, ProcessError};
use crate::id::Ref;
use crate::model::{
    class, Association, ContextRef, ContextSource, Direction, Function, MethodParams, ParamValue,
    Relation, ResolvedParams,
};
use crate::registry::TransformRegistry;
use crate::store::{DocumentStore, DocumentStoreExt, FindOptions, Query};

/// The document an execution drives, as resolution sees it.
#[derive(Debug, Clone, Copy)]
pub struct Target<'a> {
    pub id: &'a Ref<Doc>,
    /// `None` when the document could not be found.
    pub doc: Option<&'a Doc>,
}

pub struct ContextResolver<'a> {
    store: &'a dyn DocumentStore,
    transforms: &'a TransformRegistry,
}

impl<'a> ContextResolver<'a> {
    pub fn new(store: &'a dyn DocumentStore, transforms: &'a TransformRegistry) -> Self {
        Self { store, transforms }
    }

    /// Resolves every parameter; the first unresolvable one fails the lot.
    pub async fn fill_params(
        &self,
        params: &MethodParams,
        target: Target<'_>,
    ) -> Result<ResolvedParams, ProcessError> {
        let mut resolved = ResolvedParams::new();
        for (name, value) in params {
            let value = match value {
                ParamValue::Literal(value) => value.clone(),
                ParamValue::Context(context) => self.resolve_param(name, context, target).await?,
            };
            resolved.insert(name.clone(), value);
        }
        Ok(resolved)
    }

    /// Base value, else fallback, then the transform chain.
    pub async fn resolve_param(
        &self,
        name: &str,
        context: &ContextRef,
        target: Target<'_>,
    ) -> Result<Value, ProcessError> {
        let value = match self.resolve(context, target).await? {
            Some(value) => value,
            None => context
                .fallback_value
                .clone()
                .ok_or_else(|| ProcessError::Unresolved {
                    param: name.to_string(),
                    key: context.key.clone(),
                })?,
        };
        Ok(self.apply_functions(value, &context.functions))
    }

    /// The base value of a context reference, without fallback or transforms.
    pub async fn resolve(
        &self,
        context: &ContextRef,
        target: Target<'_>,
    ) -> Result<Option<Value>, ProcessError> {
        match &context.source {
            ContextSource::Attribute => Ok(target.doc.and_then(|doc| doc.get(&context.key))),
            ContextSource::Relation {
                association,
                direction,
                ..
            } => self.relation_value(context, association, *direction, target).await,
            ContextSource::Nested { path } => self.nested_value(context, path, target).await,
        }
    }

    async fn relation_value(
        &self,
        context: &ContextRef,
        association: &Ref<Association>,
        direction: Direction,
        target: Target<'_>,
    ) -> Result<Option<Value>, ProcessError> {
        let association: Option<Association> = self
            .store
            .find_model(&class::ASSOCIATION, &Query::by_id(association))
            .await?;
        let Some(association) = association else {
            debug!(key = %context.key, "association not found");
            return Ok(None);
        };

        // `A`: the target sits on side B and we collect side A, and vice versa.
        let (linked_class, fixed_side) = match direction {
            Direction::A => (&association.class_a, "docB"),
            Direction::B => (&association.class_b, "docA"),
        };
        let query = Query::new()
            .eq("association", association.id.as_str())
            .eq(fixed_side, target.id.as_str());
        let relations: Vec<Relation> = self
            .store
            .find_models(&class::RELATION, &query, &FindOptions::default())
            .await?;
        if relations.is_empty() {
            return Ok(None);
        }

        let ids = relations.iter().map(|relation| match direction {
            Direction::A => relation.doc_a.as_str(),
            Direction::B => relation.doc_b.as_str(),
        });
        let linked = self
            .store
            .find_all(linked_class, &Query::new().is_in("_id", ids), &FindOptions::default())
            .await?;
        self.reduce(context, linked)
    }

    async fn nested_value(
        &self,
        context: &ContextRef,
        path: &str,
        target: Target<'_>,
    ) -> Result<Option<Value>, ProcessError> {
        let Some(doc) = target.doc else {
            return Ok(None);
        };
        let Some(attribute) = self.store.find_attribute(&doc.class, path) else {
            debug!(class = %doc.class, path, "nested attribute is not declared");
            return Ok(None);
        };
        let Some(linked_class) = attribute.target_class() else {
            debug!(class = %doc.class, path, "nested attribute is not a reference");
            return Ok(None);
        };
        let Some(nested) = doc.get(path) else {
            return Ok(None);
        };

        let ids = match nested {
            Value::Array(items) => items,
            single => vec![single],
        };
        let linked = self
            .store
            .find_all(linked_class, &Query::new().is_in("_id", ids), &FindOptions::default())
            .await?;
        self.reduce(context, linked)
    }

    /// Reduces collected documents to one and reads `key` off it.
    fn reduce(&self, context: &ContextRef, docs: Vec<Doc>) -> Result<Option<Value>, ProcessError> {
        let mut values = docs.iter().map(Doc::to_value);
        let picked = match &context.source_function {
            Some(function) => {
                let Some(transform) = self.transforms.get(function) else {
                    warn!(function = %function, "source function not registered");
                    return Ok(None);
                };
                transform.apply(Value::Array(values.collect()))?
            }
            None => match values.next() {
                Some(first) => first,
                None => return Ok(None),
            },
        };
        Ok(get_object_value(&context.key, &picked).cloned())
    }

    /// Runs the transform chain; failures are skipped, not fatal.
    pub fn apply_functions(&self, mut value: Value, functions: &[Ref<Function>]) -> Value {
        for function in functions {
            let Some(transform) = self.transforms.get(function) else {
                warn!(function = %function, "transform not registered, skipping");
                continue;
            };
            let input = value.clone();
            match catch_unwind(AssertUnwindSafe(|| transform.apply(input))) {
                Ok(Ok(next)) => value = next,
                Ok(Err(err)) => {
                    warn!(function = %function, error = %err, "transform failed, keeping previous value");
                }
                Err(panic_info) => {
                    let message = panic_message(panic_info.as_ref());
                    warn!(function = %function, panic = %message, "transform panicked, keeping previous value");
                }
            }
        }
        value
    }
}
