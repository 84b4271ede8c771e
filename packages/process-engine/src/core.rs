//! Documents and transactions: the vocabulary shared with the external store.
//!
//! # Overview
//!
//! The engine never writes to storage. It reads [`Doc`]s and answers with
//! [`Tx`]s:
//! - [`Doc`] = a stored object (`_id`, `_class`, `space` + JSON attributes)
//! - [`Tx`] = a create/update/remove the caller applies atomically
//!
//! [`TxFactory`] constructs transactions; [`Doc::apply`] is the pure
//! "what would this transaction do to that document" function used for
//! in-memory accumulation and by [`MemoryStore`](crate::store::MemoryStore).

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::id::Ref;

/// Marker for class identifiers.
pub struct Class;

/// Marker for space identifiers.
pub struct Space;

/// Marker for account identifiers (transaction authors).
pub struct Account;

/// Milliseconds since the Unix epoch, as stored on documents.
pub type Timestamp = i64;

// =============================================================================
// Document
// =============================================================================

/// A stored object with its identity and free-form attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Doc {
    #[serde(rename = "_id")]
    pub id: Ref<Doc>,
    #[serde(rename = "_class")]
    pub class: Ref<Class>,
    pub space: Ref<Space>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Doc {
    pub fn new(id: Ref<Doc>, class: Ref<Class>, space: Ref<Space>) -> Self {
        Self {
            id,
            class,
            space,
            attributes: Map::new(),
        }
    }

    /// Builder-style attribute setter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Reads a (possibly dotted) key. `_id`, `_class` and `space` are
    /// addressable like any attribute. JSON `null` reads as `None`.
    pub fn get(&self, key: &str) -> Option<Value> {
        match key {
            "_id" => Some(Value::String(self.id.to_string())),
            "_class" => Some(Value::String(self.class.to_string())),
            "space" => Some(Value::String(self.space.to_string())),
            _ => {
                let (head, rest) = match key.split_once('.') {
                    Some((head, rest)) => (head, Some(rest)),
                    None => (key, None),
                };
                let value = self.attributes.get(head)?;
                match rest {
                    Some(rest) => get_object_value(rest, value).cloned(),
                    None if value.is_null() => None,
                    None => Some(value.clone()),
                }
            }
        }
    }

    /// The document as one flat JSON object.
    pub fn to_value(&self) -> Value {
        let mut object = self.attributes.clone();
        object.insert("_id".into(), self.id.clone().into());
        object.insert("_class".into(), self.class.clone().into());
        object.insert("space".into(), self.space.clone().into());
        Value::Object(object)
    }

    /// Decodes the document into one of the typed models.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.to_value())
    }

    /// Encodes a typed model back into a document.
    pub fn from_model<T: Serialize>(model: &T) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::to_value(model)?)
    }

    /// Materializes the document a create transaction describes.
    pub fn from_create(tx: &Tx) -> Option<Self> {
        match &tx.kind {
            TxKind::CreateDoc { attributes } => Some(Self {
                id: tx.object_id.clone(),
                class: tx.object_class.clone(),
                space: tx.object_space.clone(),
                attributes: attributes.clone(),
            }),
            _ => None,
        }
    }

    /// Applies an update transaction addressed to this document.
    ///
    /// Returns `false` (and leaves the document untouched) when the
    /// transaction is not an update of this document.
    pub fn apply(&mut self, tx: &Tx) -> bool {
        if tx.object_id != self.id {
            return false;
        }
        match &tx.kind {
            TxKind::UpdateDoc { operations } => {
                for (key, value) in operations {
                    self.attributes.insert(key.clone(), value.clone());
                }
                true
            }
            _ => false,
        }
    }
}

/// Reads a dotted path (`a.b.c`) out of a JSON value. `null` reads as `None`.
pub fn get_object_value<'a>(key: &str, value: &'a Value) -> Option<&'a Value> {
    let mut current = value;
    for part in key.split('.') {
        current = current.as_object()?.get(part)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

// =============================================================================
// Transactions
// =============================================================================

/// What a transaction does to its object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TxKind {
    CreateDoc { attributes: Map<String, Value> },
    UpdateDoc { operations: Map<String, Value> },
    RemoveDoc {},
}

/// A mutation the caller is expected to apply.
///
/// Transactions are plain data: they serialize with an explicit `kind`
/// discriminant so they can be stored inside an execution's rollback log
/// and replayed later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tx {
    #[serde(rename = "_id")]
    pub id: Ref<Tx>,
    pub modified_by: Ref<Account>,
    pub modified_on: DateTime<Utc>,
    pub object_id: Ref<Doc>,
    pub object_class: Ref<Class>,
    pub object_space: Ref<Space>,
    #[serde(flatten)]
    pub kind: TxKind,
}

impl Tx {
    pub fn is_create(&self) -> bool {
        matches!(self.kind, TxKind::CreateDoc { .. })
    }

    pub fn is_update(&self) -> bool {
        matches!(self.kind, TxKind::UpdateDoc { .. })
    }

    pub fn is_remove(&self) -> bool {
        matches!(self.kind, TxKind::RemoveDoc {})
    }

    /// Update operations, if this is an update.
    pub fn operations(&self) -> Option<&Map<String, Value>> {
        match &self.kind {
            TxKind::UpdateDoc { operations } => Some(operations),
            _ => None,
        }
    }

    /// Create attributes, if this is a create.
    pub fn attributes(&self) -> Option<&Map<String, Value>> {
        match &self.kind {
            TxKind::CreateDoc { attributes } => Some(attributes),
            _ => None,
        }
    }
}

/// Constructs (but never applies) transactions on behalf of one account.
#[derive(Debug, Clone)]
pub struct TxFactory {
    account: Ref<Account>,
}

impl TxFactory {
    pub fn new(account: Ref<Account>) -> Self {
        Self { account }
    }

    pub fn account(&self) -> &Ref<Account> {
        &self.account
    }

    fn tx<T>(&self, class: &Ref<Class>, space: &Ref<Space>, object_id: &Ref<T>, kind: TxKind) -> Tx {
        Tx {
            id: Ref::generate(),
            modified_by: self.account.clone(),
            modified_on: Utc::now(),
            object_id: object_id.cast(),
            object_class: class.clone(),
            object_space: space.clone(),
            kind,
        }
    }

    pub fn create_doc<T>(
        &self,
        class: &Ref<Class>,
        space: &Ref<Space>,
        attributes: Map<String, Value>,
        object_id: &Ref<T>,
    ) -> Tx {
        self.tx(class, space, object_id, TxKind::CreateDoc { attributes })
    }

    pub fn update_doc<T>(
        &self,
        class: &Ref<Class>,
        space: &Ref<Space>,
        object_id: &Ref<T>,
        operations: Map<String, Value>,
    ) -> Tx {
        self.tx(class, space, object_id, TxKind::UpdateDoc { operations })
    }

    pub fn remove_doc<T>(&self, class: &Ref<Class>, space: &Ref<Space>, object_id: &Ref<T>) -> Tx {
        self.tx(class, space, object_id, TxKind::RemoveDoc {})
    }
}
