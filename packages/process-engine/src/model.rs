//! Typed models of the process documents.
//!
//! Every model decodes from a [`Doc`] via [`Doc::parse`]; wire names are
//! camelCase.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::{Class, Doc, Space, Timestamp, Tx};
use crate::id::Ref;

/// Well-known class identifiers.
pub mod class {
    use crate::core::Class;
    use crate::id::Ref;

    pub const PROCESS: Ref<Class> = Ref::from_static("process:class:Process");
    pub const STATE: Ref<Class> = Ref::from_static("process:class:State");
    pub const EXECUTION: Ref<Class> = Ref::from_static("process:class:Execution");
    pub const PROCESS_TODO: Ref<Class> = Ref::from_static("process:class:ProcessToDo");
    pub const CARD: Ref<Class> = Ref::from_static("card:class:Card");
    pub const ASSOCIATION: Ref<Class> = Ref::from_static("core:class:Association");
    pub const RELATION: Ref<Class> = Ref::from_static("core:class:Relation");
}

/// Marker for registered method identifiers.
pub struct Method;

/// Marker for registered transform function identifiers.
pub struct Function;

/// Marker for users a ToDo can be assigned to.
pub struct Person;

// =============================================================================
// Process / State / Step
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    #[serde(rename = "_id")]
    pub id: Ref<Process>,
    #[serde(rename = "_class")]
    pub class: Ref<Class>,
    pub space: Ref<Space>,
    #[serde(default)]
    pub name: String,
    /// Authoritative order of the process's states.
    #[serde(default)]
    pub states: Vec<Ref<State>>,
}

impl Process {
    pub fn position(&self, state: &Ref<State>) -> Option<usize> {
        self.states.iter().position(|it| it == state)
    }

    /// The state following `state`, if any.
    pub fn next_after(&self, state: &Ref<State>) -> Option<&Ref<State>> {
        let index = self.position(state)?;
        self.states.get(index + 1)
    }

    pub fn is_last(&self, state: &Ref<State>) -> bool {
        self.states.last() == Some(state)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    #[serde(rename = "_id")]
    pub id: Ref<State>,
    #[serde(rename = "_class")]
    pub class: Ref<Class>,
    pub space: Ref<Space>,
    pub process: Ref<Process>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub actions: Vec<Step>,
    #[serde(default)]
    pub end_action: Option<Step>,
}

/// One configured invocation of a registered method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub method_id: Ref<Method>,
    #[serde(default)]
    pub params: MethodParams,
}

impl Step {
    pub fn new(method_id: Ref<Method>) -> Self {
        Self {
            method_id,
            params: MethodParams::new(),
        }
    }

    pub fn literal(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), ParamValue::Literal(value.into()));
        self
    }

    pub fn context(mut self, name: impl Into<String>, context: ContextRef) -> Self {
        self.params.insert(name.into(), ParamValue::Context(context));
        self
    }
}

/// Parameter name to literal or context reference.
pub type MethodParams = BTreeMap<String, ParamValue>;

/// Parameters after resolution, as handed to a method.
pub type ResolvedParams = Map<String, Value>;

// =============================================================================
// Parameter values and context references
// =============================================================================

/// A step parameter: either a literal or a lookup into the document graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum ParamValue {
    Literal(Value),
    Context(ContextRef),
}

/// Which side of an association the linked documents sit on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    A,
    B,
}

/// Where a context reference reads its base value from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ContextSource {
    /// A field of the target document itself.
    Attribute,
    /// Documents linked to the target through an association.
    Relation {
        association: Ref<Association>,
        direction: Direction,
    },
    /// Documents referenced by the target's attribute at `path`.
    Nested { path: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextRef {
    pub key: String,
    #[serde(flatten)]
    pub source: ContextSource,
    /// Reduces the collected documents to one (relation/nested only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_function: Option<Ref<Function>>,
    /// Applied in order to the resolved value.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<Ref<Function>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_value: Option<Value>,
}

impl ContextRef {
    pub fn attribute(key: impl Into<String>) -> Self {
        Self::from_source(key, ContextSource::Attribute)
    }

    pub fn relation(key: impl Into<String>, association: Ref<Association>, direction: Direction) -> Self {
        Self::from_source(
            key,
            ContextSource::Relation {
                association,
                direction,
            },
        )
    }

    pub fn nested(key: impl Into<String>, path: impl Into<String>) -> Self {
        Self::from_source(key, ContextSource::Nested { path: path.into() })
    }

    fn from_source(key: impl Into<String>, source: ContextSource) -> Self {
        Self {
            key: key.into(),
            source,
            source_function: None,
            functions: Vec::new(),
            fallback_value: None,
        }
    }

    pub fn with_source_function(mut self, function: Ref<Function>) -> Self {
        self.source_function = Some(function);
        self
    }

    pub fn with_function(mut self, function: Ref<Function>) -> Self {
        self.functions.push(function);
        self
    }

    pub fn with_fallback(mut self, value: impl Into<Value>) -> Self {
        self.fallback_value = Some(value.into());
        self
    }
}

// =============================================================================
// Execution / ProcessToDo
// =============================================================================

/// Compensating transactions recorded per state.
pub type Rollback = BTreeMap<Ref<State>, Vec<Tx>>;

/// A running instance of a process bound to one target document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    #[serde(rename = "_id")]
    pub id: Ref<Execution>,
    #[serde(rename = "_class")]
    pub class: Ref<Class>,
    pub space: Ref<Space>,
    pub process: Ref<Process>,
    pub card: Ref<Doc>,
    #[serde(default)]
    pub current_state: Option<Ref<State>>,
    #[serde(default)]
    pub current_to_do: Option<Ref<ProcessToDo>>,
    #[serde(default)]
    pub assignee: Option<Ref<Person>>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub rollback: Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ToDoPriority {
    #[default]
    NoPriority,
    Urgent,
    High,
    Medium,
    Low,
}

impl From<ToDoPriority> for u8 {
    fn from(priority: ToDoPriority) -> Self {
        match priority {
            ToDoPriority::NoPriority => 0,
            ToDoPriority::Urgent => 1,
            ToDoPriority::High => 2,
            ToDoPriority::Medium => 3,
            ToDoPriority::Low => 4,
        }
    }
}

impl TryFrom<u8> for ToDoPriority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ToDoPriority::NoPriority),
            1 => Ok(ToDoPriority::Urgent),
            2 => Ok(ToDoPriority::High),
            3 => Ok(ToDoPriority::Medium),
            4 => Ok(ToDoPriority::Low),
            other => Err(format!("unknown todo priority {}", other)),
        }
    }
}

/// A task whose completion advances an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessToDo {
    #[serde(rename = "_id")]
    pub id: Ref<ProcessToDo>,
    #[serde(rename = "_class")]
    pub class: Ref<Class>,
    pub space: Ref<Space>,
    pub attached_to: Ref<Doc>,
    pub attached_to_class: Ref<Class>,
    #[serde(default)]
    pub collection: String,
    pub execution: Ref<Execution>,
    pub state: Ref<State>,
    pub user: Ref<Person>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub due_date: Option<Timestamp>,
    #[serde(default)]
    pub priority: ToDoPriority,
    #[serde(default)]
    pub done_on: Option<Timestamp>,
    #[serde(default)]
    pub workslots: u32,
    #[serde(default)]
    pub visibility: String,
    #[serde(default)]
    pub rank: String,
}

// =============================================================================
// Associations
// =============================================================================

/// A typed edge kind between two document classes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Association {
    #[serde(rename = "_id")]
    pub id: Ref<Association>,
    pub class_a: Ref<Class>,
    pub class_b: Ref<Class>,
}

/// One edge of an association.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    #[serde(rename = "_id")]
    pub id: Ref<Relation>,
    pub association: Ref<Association>,
    pub doc_a: Ref<Doc>,
    pub doc_b: Ref<Doc>,
}

/// What a method hands back: forward transactions and, optionally, the
/// transactions that undo them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecuteResult {
    pub txes: Vec<Tx>,
    pub rollback: Option<Vec<Tx>>,
}

impl ExecuteResult {
    pub fn new(txes: Vec<Tx>) -> Self {
        Self { txes, rollback: None }
    }

    pub fn with_rollback(mut self, rollback: Vec<Tx>) -> Self {
        self.rollback = Some(rollback);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_context_ref_wire_format_carries_discriminant() {
        let context = ContextRef::relation("name", Ref::new("assoc-1"), Direction::A)
            .with_function(Ref::new("process:function:UpperCase"))
            .with_fallback("nobody");
        let value = serde_json::to_value(ParamValue::Context(context.clone())).unwrap();

        assert_eq!(value["kind"], json!("context"));
        assert_eq!(value["value"]["type"], json!("relation"));
        assert_eq!(value["value"]["direction"], json!("A"));
        assert_eq!(value["value"]["fallbackValue"], json!("nobody"));
        assert!(value["value"].get("name").is_none());

        let back: ParamValue = serde_json::from_value(value).unwrap();
        assert_eq!(back, ParamValue::Context(context));
    }

    #[test]
    fn test_relation_context_ignores_display_label() {
        let value = json!({
            "kind": "context",
            "value": { "type": "relation", "name": "Reviewers", "key": "email", "association": "assoc-1", "direction": "B" }
        });
        let param: ParamValue = serde_json::from_value(value).unwrap();
        assert_eq!(
            param,
            ParamValue::Context(ContextRef::relation("email", Ref::new("assoc-1"), Direction::B))
        );
    }

    #[test]
    fn test_attribute_context_parses_without_optional_fields() {
        let value = json!({ "kind": "context", "value": { "type": "attribute", "key": "title" } });
        let param: ParamValue = serde_json::from_value(value).unwrap();
        assert_eq!(param, ParamValue::Context(ContextRef::attribute("title")));
    }

    #[test]
    fn test_execution_parses_from_doc_with_defaults() {
        let doc = Doc::new(Ref::new("exec-1"), class::EXECUTION, Ref::new("ws"))
            .with("process", "proc-1")
            .with("card", "card-1")
            .with("currentState", Value::Null);
        let execution: Execution = doc.parse().unwrap();

        assert_eq!(execution.process.as_str(), "proc-1");
        assert!(execution.current_state.is_none());
        assert!(execution.rollback.is_empty());
        assert!(!execution.done);
    }

    #[test]
    fn test_priority_is_numeric_on_the_wire() {
        assert_eq!(serde_json::to_value(ToDoPriority::High).unwrap(), json!(2));
        let parsed: ToDoPriority = serde_json::from_value(json!(0)).unwrap();
        assert_eq!(parsed, ToDoPriority::NoPriority);
        assert!(serde_json::from_value::<ToDoPriority>(json!(9)).is_err());
    }

    #[test]
    fn test_process_ordering_helpers() {
        let process = Process {
            id: Ref::new("p"),
            class: class::PROCESS,
            space: Ref::new("model"),
            name: String::new(),
            states: vec![Ref::new("s0"), Ref::new("s1")],
        };
        assert_eq!(process.next_after(&Ref::new("s0")), Some(&Ref::new("s1")));
        assert_eq!(process.next_after(&Ref::new("s1")), None);
        assert!(process.is_last(&Ref::new("s1")));
        assert_eq!(process.position(&Ref::new("zz")), None);
    }
}
