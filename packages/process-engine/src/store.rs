//! The document store collaborator.
//!
//! # Overview
//!
//! The engine consumes storage only through [`DocumentStore`]:
//!
//! 1. **Query.** Fetch documents of a class matching a [`Query`], with
//!    optional sort and limit ([`FindOptions`]).
//! 2. **Removed lookaside.** Return the last snapshot of a document removed
//!    in the batch being processed.
//! 3. **Hierarchy.** Answer "is class X a kind of Y" and "what does
//!    attribute K of class X point at". Defaults cover stores without
//!    a type system.
//!
//! The store is read-only from the engine's point of view. Writes happen
//! downstream, when the caller applies the returned transactions.
//! [`MemoryStore`] is a reference implementation that can also apply them.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{Class, Doc, Tx, TxKind};
use crate::error::StoreError;
use crate::id::Ref;

// =============================================================================
// Query
// =============================================================================

/// A condition on one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(Value),
    In(Vec<Value>),
    /// Field is absent or `null`.
    IsNull,
}

impl Predicate {
    fn matches(&self, value: Option<&Value>) -> bool {
        match self {
            Predicate::Eq(expected) => value == Some(expected),
            Predicate::In(candidates) => value.is_some_and(|v| candidates.contains(v)),
            Predicate::IsNull => value.is_none(),
        }
    }
}

/// A conjunction of field predicates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    fields: BTreeMap<String, Predicate>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shortcut for `Query::new().eq("_id", id)`.
    pub fn by_id<T>(id: &Ref<T>) -> Self {
        Self::new().eq("_id", id.as_str())
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), Predicate::Eq(value.into()));
        self
    }

    pub fn is_in<V: Into<Value>>(
        mut self,
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.fields.insert(field.into(), Predicate::In(values));
        self
    }

    pub fn is_null(mut self, field: impl Into<String>) -> Self {
        self.fields.insert(field.into(), Predicate::IsNull);
        self
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Predicate)> {
        self.fields.iter()
    }

    pub fn matches(&self, doc: &Doc) -> bool {
        self.fields
            .iter()
            .all(|(field, predicate)| predicate.matches(doc.get(field).as_ref()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Option<(String, SortOrder)>,
    pub limit: Option<usize>,
}

impl FindOptions {
    /// At most one result.
    pub fn one() -> Self {
        Self::default().with_limit(1)
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_sort(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort = Some((field.into(), order));
        self
    }
}

/// Declared type of an attribute, as far as reference following needs it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "of", rename_all = "camelCase")]
pub enum AttributeType {
    /// A reference to a document of the given class.
    RefTo(Ref<Class>),
    /// A list of the inner type.
    ArrOf(Box<AttributeType>),
    Other,
}

impl AttributeType {
    /// The class referenced by `RefTo<C>` or `ArrOf<RefTo<C>>`.
    pub fn target_class(&self) -> Option<&Ref<Class>> {
        match self {
            AttributeType::RefTo(class) => Some(class),
            AttributeType::ArrOf(inner) => match inner.as_ref() {
                AttributeType::RefTo(class) => Some(class),
                _ => None,
            },
            AttributeType::Other => None,
        }
    }
}

// =============================================================================
// Document Store
// =============================================================================

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch documents of `class` (or a class derived from it) matching
    /// `query`.
    async fn find_all(
        &self,
        class: &Ref<Class>,
        query: &Query,
        options: &FindOptions,
    ) -> Result<Vec<Doc>, StoreError>;

    /// Last known snapshot of a document removed in the current batch.
    fn removed(&self, id: &Ref<Doc>) -> Option<Doc>;

    fn is_derived(&self, class: &Ref<Class>, base: &Ref<Class>) -> bool {
        class == base
    }

    fn find_attribute(&self, _class: &Ref<Class>, _key: &str) -> Option<AttributeType> {
        None
    }
}

/// Typed reads on top of [`DocumentStore`].
#[async_trait]
pub trait DocumentStoreExt: DocumentStore {
    async fn find_models<T>(
        &self,
        class: &Ref<Class>,
        query: &Query,
        options: &FindOptions,
    ) -> Result<Vec<T>, StoreError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let docs = self.find_all(class, query, options).await?;
        docs.iter().map(decode::<T>).collect()
    }

    async fn find_model<T>(&self, class: &Ref<Class>, query: &Query) -> Result<Option<T>, StoreError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let docs = self.find_all(class, query, &FindOptions::one()).await?;
        docs.first().map(decode::<T>).transpose()
    }
}

impl<S: DocumentStore + ?Sized> DocumentStoreExt for S {}

/// Decodes a document into a model, keeping its identity in the error.
pub fn decode<T: DeserializeOwned>(doc: &Doc) -> Result<T, StoreError> {
    doc.parse().map_err(|source| StoreError::Decode {
        class: doc.class.to_string(),
        id: doc.id.to_string(),
        source,
    })
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// In-memory document store.
///
/// Documents keep insertion order. [`MemoryStore::apply`] plays the role of
/// the downstream store: creates insert, updates merge, removes delete and
/// remember the removed snapshot for the lookaside.
#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<Vec<Doc>>,
    removed: Mutex<HashMap<Ref<Doc>, Doc>>,
    parents: HashMap<Ref<Class>, Ref<Class>>,
    attributes: HashMap<(Ref<Class>, String), AttributeType>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `class` as derived from `parent`.
    pub fn with_subclass(mut self, class: Ref<Class>, parent: Ref<Class>) -> Self {
        self.parents.insert(class, parent);
        self
    }

    /// Declares the type of `class.key`.
    pub fn with_attribute(mut self, class: Ref<Class>, key: impl Into<String>, ty: AttributeType) -> Self {
        self.attributes.insert((class, key.into()), ty);
        self
    }

    pub fn with_documents(self, docs: impl IntoIterator<Item = Doc>) -> Self {
        for doc in docs {
            self.insert(doc);
        }
        self
    }

    /// Inserts or replaces a document.
    pub fn insert(&self, doc: Doc) {
        let mut docs = self.docs.lock().unwrap_or_else(PoisonError::into_inner);
        match docs.iter_mut().find(|it| it.id == doc.id) {
            Some(existing) => *existing = doc,
            None => docs.push(doc),
        }
    }

    pub fn get(&self, id: &Ref<Doc>) -> Option<Doc> {
        let docs = self.docs.lock().unwrap_or_else(PoisonError::into_inner);
        docs.iter().find(|it| &it.id == id).cloned()
    }

    /// Every live document, in insertion order.
    pub fn documents(&self) -> Vec<Doc> {
        self.docs.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.docs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies one transaction the way the downstream store would.
    pub fn apply(&self, tx: &Tx) {
        match &tx.kind {
            TxKind::CreateDoc { .. } => {
                if let Some(doc) = Doc::from_create(tx) {
                    self.insert(doc);
                }
            }
            TxKind::UpdateDoc { .. } => {
                let mut docs = self.docs.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(doc) = docs.iter_mut().find(|it| it.id == tx.object_id) {
                    doc.apply(tx);
                }
            }
            TxKind::RemoveDoc {} => {
                let mut docs = self.docs.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(index) = docs.iter().position(|it| it.id == tx.object_id) {
                    let doc = docs.remove(index);
                    self.record_removed(doc);
                }
            }
        }
    }

    pub fn apply_all<'a>(&self, txes: impl IntoIterator<Item = &'a Tx>) {
        for tx in txes {
            self.apply(tx);
        }
    }

    /// Seeds the removed lookaside with a snapshot taken elsewhere.
    pub fn record_removed(&self, doc: Doc) {
        self.removed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(doc.id.clone(), doc);
    }

    /// Forgets removed snapshots; call between batches.
    pub fn clear_removed(&self) {
        self.removed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find_all(
        &self,
        class: &Ref<Class>,
        query: &Query,
        options: &FindOptions,
    ) -> Result<Vec<Doc>, StoreError> {
        let docs = self.docs.lock().unwrap_or_else(PoisonError::into_inner);
        let mut found: Vec<Doc> = docs
            .iter()
            .filter(|doc| self.is_derived(&doc.class, class) && query.matches(doc))
            .cloned()
            .collect();
        drop(docs);

        if let Some((field, order)) = &options.sort {
            found.sort_by(|a, b| {
                let ordering = compare_values(a.get(field).as_ref(), b.get(field).as_ref());
                match order {
                    SortOrder::Ascending => ordering,
                    SortOrder::Descending => ordering.reverse(),
                }
            });
        }
        if let Some(limit) = options.limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    fn removed(&self, id: &Ref<Doc>) -> Option<Doc> {
        self.removed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn is_derived(&self, class: &Ref<Class>, base: &Ref<Class>) -> bool {
        let mut current = Some(class);
        while let Some(class) = current {
            if class == base {
                return true;
            }
            current = self.parents.get(class);
        }
        false
    }

    fn find_attribute(&self, class: &Ref<Class>, key: &str) -> Option<AttributeType> {
        let mut current = Some(class);
        while let Some(class) = current {
            if let Some(ty) = self.attributes.get(&(class.clone(), key.to_string())) {
                return Some(ty.clone());
            }
            current = self.parents.get(class);
        }
        None
    }
}

/// Orders missing values first, then numbers, then strings; anything else
/// compares equal.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(Value::Number(_)), Some(Value::String(_))) => Ordering::Less,
        (Some(Value::String(_)), Some(Value::Number(_))) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}
