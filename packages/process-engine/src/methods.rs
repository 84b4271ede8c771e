//! Built-in methods.
//!
//! | Method          | Forward                                   | Rollback                          |
//! |-----------------|-------------------------------------------|-----------------------------------|
//! | `CreateToDo`    | create ToDo, assign it on the execution   | restore assignment, remove ToDo   |
//! | `UpdateCard`    | update fields on the target document      | restore the previous field values |
//! | `RunSubProcess` | start a new execution on the same target  | none                              |

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::core::{Doc, Timestamp};
use crate::error::ProcessError;
use crate::executor::ActionContext;
use crate::id::Ref;
use crate::model::{
    class, ExecuteResult, Execution, Method, Person, Process, ProcessToDo, ResolvedParams, Rollback,
    State, ToDoPriority,
};
use crate::registry::{MethodHandler, MethodRegistry};

pub const CREATE_TODO: Ref<Method> = Ref::from_static("process:method:CreateToDo");
pub const UPDATE_CARD: Ref<Method> = Ref::from_static("process:method:UpdateCard");
pub const RUN_SUB_PROCESS: Ref<Method> = Ref::from_static("process:method:RunSubProcess");

pub(crate) fn register_builtins(registry: &mut MethodRegistry) {
    registry.register(CREATE_TODO, CreateToDo);
    registry.register(UPDATE_CARD, UpdateCard);
    registry.register(RUN_SUB_PROCESS, RunSubProcess);
}

fn parse_params<T: DeserializeOwned>(
    model: &'static str,
    params: ResolvedParams,
) -> Result<T, ProcessError> {
    serde_json::from_value(Value::Object(params))
        .map_err(|source| ProcessError::InvalidDocument { model, source })
}

/// Attributes of a create transaction for `model`, without the identity
/// fields the transaction carries itself.
fn attributes_of<T: serde::Serialize>(
    model_name: &'static str,
    model: &T,
) -> Result<Map<String, Value>, ProcessError> {
    Doc::from_model(model)
        .map(|doc| doc.attributes)
        .map_err(|source| ProcessError::InvalidDocument {
            model: model_name,
            source,
        })
}

fn operations(pairs: impl IntoIterator<Item = (&'static str, Value)>) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

// =============================================================================
// CreateToDo
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateToDoParams {
    user: Option<Ref<Person>>,
    state: Option<Ref<State>>,
    title: Option<String>,
    description: Option<String>,
    due_date: Option<Timestamp>,
    priority: Option<ToDoPriority>,
}

/// Creates a ToDo on the target document and assigns it on the execution.
pub struct CreateToDo;

#[async_trait]
impl MethodHandler for CreateToDo {
    async fn execute(
        &self,
        params: ResolvedParams,
        execution: &Execution,
        ctx: &ActionContext<'_>,
    ) -> Result<ExecuteResult, ProcessError> {
        let params: CreateToDoParams = parse_params("CreateToDo params", params)?;
        let (user, state, title) = match (params.user, params.state, params.title) {
            (Some(user), Some(state), Some(title)) => (user, state, title),
            (user, state, title) => {
                let missing = [("user", user.is_none()), ("state", state.is_none()), ("title", title.is_none())]
                    .into_iter()
                    .filter_map(|(name, absent)| absent.then_some(name))
                    .collect();
                return Err(ProcessError::missing("CreateToDo", missing));
            }
        };

        let factory = ctx.factory();
        let todo_space = &ctx.config().todo_space;
        let todo = ProcessToDo {
            id: Ref::generate(),
            class: class::PROCESS_TODO,
            space: todo_space.clone(),
            attached_to: execution.card.clone(),
            attached_to_class: class::CARD,
            collection: "todos".to_string(),
            execution: execution.id.clone(),
            state,
            user: user.clone(),
            title,
            description: params.description.unwrap_or_default(),
            due_date: params.due_date,
            priority: params.priority.unwrap_or_default(),
            done_on: None,
            workslots: 0,
            visibility: "public".to_string(),
            rank: String::new(),
        };
        debug!(todo = %todo.id, execution = %execution.id, user = %user, "creating todo");

        let create = factory.create_doc(
            &class::PROCESS_TODO,
            todo_space,
            attributes_of("ProcessToDo", &todo)?,
            &todo.id,
        );
        let assign = factory.update_doc(
            &execution.class,
            &execution.space,
            &execution.id,
            operations([
                ("assignee", Value::from(user)),
                ("currentToDo", Value::from(todo.id.clone())),
            ]),
        );

        let restore = factory.update_doc(
            &execution.class,
            &execution.space,
            &execution.id,
            operations([
                ("assignee", execution.assignee.clone().map_or(Value::Null, Value::from)),
                (
                    "currentToDo",
                    execution.current_to_do.clone().map_or(Value::Null, Value::from),
                ),
            ]),
        );
        let remove = factory.remove_doc(&class::PROCESS_TODO, todo_space, &todo.id);

        Ok(ExecuteResult::new(vec![create, assign]).with_rollback(vec![restore, remove]))
    }
}

// =============================================================================
// UpdateCard
// =============================================================================

/// Writes every param as a field of the target document.
pub struct UpdateCard;

#[async_trait]
impl MethodHandler for UpdateCard {
    async fn execute(
        &self,
        params: ResolvedParams,
        execution: &Execution,
        ctx: &ActionContext<'_>,
    ) -> Result<ExecuteResult, ProcessError> {
        if params.is_empty() {
            return Err(ProcessError::missing("UpdateCard", vec!["<any field>"]));
        }
        let target = ctx
            .target_document(&execution.card)
            .await?
            .ok_or_else(|| ProcessError::TargetNotFound {
                card: execution.card.to_string(),
            })?;

        let previous: Map<String, Value> = params
            .keys()
            .map(|key| (key.clone(), target.get(key).unwrap_or(Value::Null)))
            .collect();

        let factory = ctx.factory();
        let update = factory.update_doc(&target.class, &target.space, &target.id, params);
        let restore = factory.update_doc(&target.class, &target.space, &target.id, previous);
        Ok(ExecuteResult::new(vec![update]).with_rollback(vec![restore]))
    }
}

// =============================================================================
// RunSubProcess
// =============================================================================

#[derive(Debug, Deserialize)]
struct RunSubProcessParams {
    #[serde(rename = "_id")]
    process: Option<Ref<Process>>,
}

/// Starts another process on the same target document.
pub struct RunSubProcess;

#[async_trait]
impl MethodHandler for RunSubProcess {
    async fn execute(
        &self,
        params: ResolvedParams,
        execution: &Execution,
        ctx: &ActionContext<'_>,
    ) -> Result<ExecuteResult, ProcessError> {
        let params: RunSubProcessParams = parse_params("RunSubProcess params", params)?;
        let process = params
            .process
            .ok_or_else(|| ProcessError::missing("RunSubProcess", vec!["_id"]))?;

        let space = &ctx.config().execution_space;
        let sub = Execution {
            id: Ref::generate(),
            class: class::EXECUTION,
            space: space.clone(),
            process,
            card: execution.card.clone(),
            current_state: None,
            current_to_do: None,
            assignee: None,
            done: false,
            rollback: Rollback::new(),
        };
        debug!(parent = %execution.id, execution = %sub.id, process = %sub.process, "starting sub-process");

        let create = ctx.factory().create_doc(
            &class::EXECUTION,
            space,
            attributes_of("Execution", &sub)?,
            &sub.id,
        );
        Ok(ExecuteResult::new(vec![create]))
    }
}
