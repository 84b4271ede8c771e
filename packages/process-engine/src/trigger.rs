//! Lifecycle triggers and their handlers.
//!
//! Every incoming transaction is classified into at most one [`Trigger`]
//! before any query runs. Handlers only read the store and return the
//! transactions the caller should apply next.
//!
//! | Trigger                | Source tx                                  | Effect                                  |
//! |------------------------|--------------------------------------------|-----------------------------------------|
//! | `ExecutionCreated`     | create of an Execution                     | enter the process's first state         |
//! | `ProcessToDoCompleted` | update of a ProcessToDo setting `doneOn`   | enter the next state                    |
//! | `StateRemoved`         | remove of a State                          | compact `states`, compensate executions |
//! | `ProcessRemoved`       | remove of a Process                        | cascade removal                         |
//! | `ProcessToDoRemoved`   | remove of a ProcessToDo                    | compensate the ToDo's state             |

use serde_json::{Map, Value};
use tracing::{debug, error, trace};

use crate::core::{Class, Doc, Tx, TxFactory};
use crate::error::ProcessError;
use crate::id::Ref;
use crate::model::{class, Execution, Process, ProcessToDo, State};
use crate::store::{decode, DocumentStore, DocumentStoreExt, FindOptions, Query};
use crate::transition::StateTransition;

#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// The execution as its create transaction describes it.
    ExecutionCreated(Execution),
    ProcessToDoCompleted { todo: Ref<ProcessToDo> },
    StateRemoved { state: Ref<State> },
    ProcessRemoved { process: Ref<Process> },
    ProcessToDoRemoved { todo: Ref<ProcessToDo> },
}

impl Trigger {
    /// Classifies `tx`; `Ok(None)` when no trigger reacts to it.
    pub fn classify(tx: &Tx, store: &dyn DocumentStore) -> Result<Option<Self>, ProcessError> {
        let derives = |base: &Ref<Class>| store.is_derived(&tx.object_class, base);

        let trigger = if tx.is_create() && derives(&class::EXECUTION) {
            let execution = Doc::from_create(tx)
                .map(|doc| doc.parse::<Execution>())
                .transpose()
                .map_err(|source| ProcessError::InvalidDocument {
                    model: "Execution",
                    source,
                })?;
            execution.map(Trigger::ExecutionCreated)
        } else if tx.is_update() && derives(&class::PROCESS_TODO) {
            let closes = tx
                .operations()
                .and_then(|ops| ops.get("doneOn"))
                .is_some_and(|done_on| !done_on.is_null());
            closes.then(|| Trigger::ProcessToDoCompleted {
                todo: tx.object_id.cast(),
            })
        } else if tx.is_remove() && derives(&class::STATE) {
            Some(Trigger::StateRemoved {
                state: tx.object_id.cast(),
            })
        } else if tx.is_remove() && derives(&class::PROCESS) {
            Some(Trigger::ProcessRemoved {
                process: tx.object_id.cast(),
            })
        } else if tx.is_remove() && derives(&class::PROCESS_TODO) {
            Some(Trigger::ProcessToDoRemoved {
                todo: tx.object_id.cast(),
            })
        } else {
            None
        };
        Ok(trigger)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Trigger::ExecutionCreated(_) => "ExecutionCreated",
            Trigger::ProcessToDoCompleted { .. } => "ProcessToDoCompleted",
            Trigger::StateRemoved { .. } => "StateRemoved",
            Trigger::ProcessRemoved { .. } => "ProcessRemoved",
            Trigger::ProcessToDoRemoved { .. } => "ProcessToDoRemoved",
        }
    }
}

/// Routes classified triggers to their handlers.
pub struct Dispatcher<'a> {
    store: &'a dyn DocumentStore,
    transition: StateTransition<'a>,
    factory: &'a TxFactory,
}

impl<'a> Dispatcher<'a> {
    pub fn new(store: &'a dyn DocumentStore, transition: StateTransition<'a>, factory: &'a TxFactory) -> Self {
        Self {
            store,
            transition,
            factory,
        }
    }

    /// Handles one lifecycle transaction. Failures are logged and produce
    /// nothing.
    pub async fn dispatch(&self, tx: &Tx) -> Vec<Tx> {
        let trigger = match Trigger::classify(tx, self.store) {
            Ok(Some(trigger)) => trigger,
            Ok(None) => {
                trace!(tx = %tx.id, class = %tx.object_class, "ignored");
                return Vec::new();
            }
            Err(err) => {
                error!(tx = %tx.id, object = %tx.object_id, error = %err, "failed to classify");
                return Vec::new();
            }
        };
        let name = trigger.name();
        debug!(tx = %tx.id, object = %tx.object_id, trigger = name, "dispatching");

        match self.handle(trigger, tx).await {
            Ok(txes) => txes,
            Err(err) => {
                error!(
                    tx = %tx.id,
                    object = %tx.object_id,
                    trigger = name,
                    category = %err.category(),
                    error = %err,
                    "trigger failed"
                );
                Vec::new()
            }
        }
    }

    pub async fn handle(&self, trigger: Trigger, tx: &Tx) -> Result<Vec<Tx>, ProcessError> {
        match trigger {
            Trigger::ExecutionCreated(execution) => self.on_execution_created(execution).await,
            Trigger::ProcessToDoCompleted { todo } => self.on_todo_completed(&todo).await,
            Trigger::StateRemoved { state } => self.on_state_removed(&state).await,
            Trigger::ProcessRemoved { process } => self.on_process_removed(&process).await,
            Trigger::ProcessToDoRemoved { todo } => self.on_todo_removed(&todo, tx).await,
        }
    }

    async fn on_execution_created(&self, execution: Execution) -> Result<Vec<Tx>, ProcessError> {
        let Some(process) = self.find_process(&execution.process).await? else {
            debug!(execution = %execution.id, process = %execution.process, "process not found");
            return Ok(Vec::new());
        };
        let Some(first) = process.states.first() else {
            debug!(execution = %execution.id, process = %process.id, "process has no states");
            return Ok(Vec::new());
        };
        let Some(state) = self.find_state(first).await? else {
            return Ok(Vec::new());
        };

        let done = process.is_last(&state.id);
        Ok(self.transition.change_state(&execution, &state, done).await)
    }

    async fn on_todo_completed(&self, todo: &Ref<ProcessToDo>) -> Result<Vec<Tx>, ProcessError> {
        let todo: Option<ProcessToDo> = self
            .store
            .find_model(&class::PROCESS_TODO, &Query::by_id(todo))
            .await?;
        let Some(todo) = todo else {
            return Ok(Vec::new());
        };

        let query = Query::by_id(&todo.execution).eq("currentState", todo.state.as_str());
        let execution: Option<Execution> = self.store.find_model(&class::EXECUTION, &query).await?;
        let Some(execution) = execution else {
            debug!(todo = %todo.id, execution = %todo.execution, "execution is not at the todo's state");
            return Ok(Vec::new());
        };
        let Some(process) = self.find_process(&execution.process).await? else {
            return Ok(Vec::new());
        };
        let Some(next) = process.next_after(&todo.state) else {
            debug!(execution = %execution.id, "process finished");
            return Ok(Vec::new());
        };
        let Some(next_state) = self.find_state(next).await? else {
            return Ok(Vec::new());
        };

        let done = process.is_last(&next_state.id);
        Ok(self.transition.change_state(&execution, &next_state, done).await)
    }

    async fn on_state_removed(&self, state: &Ref<State>) -> Result<Vec<Tx>, ProcessError> {
        let Some(snapshot) = self.store.removed(&state.cast()) else {
            debug!(state = %state, "removed state snapshot unavailable");
            return Ok(Vec::new());
        };
        let removed: State = decode(&snapshot)?;
        let Some(process) = self.find_process(&removed.process).await? else {
            return Ok(Vec::new());
        };
        let Some(index) = process.position(&removed.id) else {
            return Ok(Vec::new());
        };

        let was_last = index + 1 == process.states.len();
        let mut states = process.states.clone();
        states.remove(index);

        let mut txes = Vec::new();
        txes.push(self.factory.update_doc(
            &process.class,
            &process.space,
            &process.id,
            fields([("states", states.iter().cloned().map(Value::from).collect())]),
        ));

        // The end action belongs to whichever state is terminal.
        if was_last {
            if let Some(new_last) = states.last() {
                if let Some(last) = self.find_state(new_last).await? {
                    if last.end_action.is_some() {
                        txes.push(self.factory.update_doc(
                            &last.class,
                            &last.space,
                            &last.id,
                            fields([("endAction", Value::Null)]),
                        ));
                    }
                }
            }
        }

        let query = Query::new()
            .eq("currentState", removed.id.as_str())
            .eq("process", removed.process.as_str());
        let executions: Vec<Execution> = self
            .store
            .find_models(&class::EXECUTION, &query, &FindOptions::default())
            .await?;
        for execution in &executions {
            if let Some(rollback) = execution.rollback.get(&removed.id) {
                debug!(execution = %execution.id, state = %removed.id, count = rollback.len(), "compensating");
                txes.extend(rollback.iter().cloned());
            }
        }
        Ok(txes)
    }

    async fn on_process_removed(&self, process: &Ref<Process>) -> Result<Vec<Tx>, ProcessError> {
        let by_process = Query::new().eq("process", process.as_str());
        let states = self
            .store
            .find_all(&class::STATE, &by_process, &FindOptions::default())
            .await?;
        let executions = self
            .store
            .find_all(&class::EXECUTION, &by_process, &FindOptions::default())
            .await?;
        let todos = if executions.is_empty() {
            Vec::new()
        } else {
            let open = Query::new()
                .is_null("doneOn")
                .is_in("execution", executions.iter().map(|it| it.id.as_str()));
            self.store
                .find_all(&class::PROCESS_TODO, &open, &FindOptions::default())
                .await?
        };

        debug!(
            process = %process,
            executions = executions.len(),
            todos = todos.len(),
            states = states.len(),
            "cascading process removal"
        );
        Ok(executions
            .iter()
            .chain(&todos)
            .chain(&states)
            .map(|doc| self.factory.remove_doc(&doc.class, &doc.space, &doc.id))
            .collect())
    }

    async fn on_todo_removed(&self, todo: &Ref<ProcessToDo>, tx: &Tx) -> Result<Vec<Tx>, ProcessError> {
        let Some(snapshot) = self.store.removed(&todo.cast()) else {
            debug!(todo = %todo, "removed todo snapshot unavailable");
            return Ok(Vec::new());
        };
        let removed: ProcessToDo = decode(&snapshot)?;
        // Removing the state already replayed its rollback.
        if self.find_state(&removed.state).await?.is_none() {
            debug!(todo = %removed.id, state = %removed.state, "todo's state is gone, nothing to compensate");
            return Ok(Vec::new());
        }
        let execution: Option<Execution> = self
            .store
            .find_model(&class::EXECUTION, &Query::by_id(&removed.execution))
            .await?;
        let Some(execution) = execution else {
            return Ok(Vec::new());
        };
        if execution.current_state.as_ref() != Some(&removed.state) {
            return Ok(Vec::new());
        }

        let Some(rollback) = execution.rollback.get(&removed.state) else {
            return Ok(Vec::new());
        };
        // The ToDo itself is already gone.
        Ok(rollback
            .iter()
            .filter(|it| !(it.is_remove() && it.object_id == tx.object_id))
            .cloned()
            .collect())
    }

    async fn find_process(&self, id: &Ref<Process>) -> Result<Option<Process>, ProcessError> {
        Ok(self.store.find_model(&class::PROCESS, &Query::by_id(id)).await?)
    }

    async fn find_state(&self, id: &Ref<State>) -> Result<Option<State>, ProcessError> {
        Ok(self.store.find_model(&class::STATE, &Query::by_id(id)).await?)
    }
}

fn fields<const N: usize>(pairs: [(&str, Value); N]) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}
