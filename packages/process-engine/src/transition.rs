use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::config::EngineConfig;
use crate::core::{Doc, Tx, TxFactory};
use crate::executor::{ActionContext, ActionExecutor};
use crate::model::{ExecuteResult, Execution, State, Step};
use crate::store::DocumentStore;

/// Moves an execution into a state by running the state's steps.
pub struct StateTransition<'a> {
    store: &'a dyn DocumentStore,
    executor: ActionExecutor<'a>,
    factory: &'a TxFactory,
    config: &'a EngineConfig,
}

impl<'a> StateTransition<'a> {
    pub fn new(
        store: &'a dyn DocumentStore,
        executor: ActionExecutor<'a>,
        factory: &'a TxFactory,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            store,
            executor,
            factory,
            config,
        }
    }

    /// Runs `state.actions` then `state.end_action`, records their rollback
    /// under `state.id` and points the execution at `state`.
    ///
    /// Steps that fail contribute nothing; the state change is always
    /// emitted.
    pub async fn change_state(&self, execution: &Execution, state: &State, is_done: bool) -> Vec<Tx> {
        let mut txes: Vec<Tx> = Vec::new();
        let mut rollback: Vec<Tx> = Vec::new();
        let mut current = execution.clone();
        let mut applied = 0usize;

        for step in state.actions.iter().chain(state.end_action.as_ref()) {
            let Some(result) = self.run_step(step, &current, &txes).await else {
                continue;
            };
            applied += 1;
            current = fold_into(&current, &result.txes);
            txes.extend(result.txes);
            if let Some(undo) = result.rollback {
                // Later steps are undone first.
                rollback.splice(0..0, undo);
            }
        }

        let rollback_count = rollback.len();
        if !rollback.is_empty() {
            let mut log = current.rollback.clone();
            log.insert(state.id.clone(), rollback);
            match serde_json::to_value(&log) {
                Ok(value) => txes.push(self.update_execution(execution, [("rollback", value)])),
                Err(err) => error!(
                    execution = %execution.id,
                    state = %state.id,
                    error = %err,
                    "failed to encode rollback log"
                ),
            }
        }

        txes.push(self.update_execution(
            execution,
            [
                ("currentState", Value::from(state.id.clone())),
                ("done", Value::Bool(is_done)),
            ],
        ));

        debug!(
            execution = %execution.id,
            state = %state.id,
            steps = state.actions.len() + usize::from(state.end_action.is_some()),
            applied,
            forward = txes.len(),
            rollback = rollback_count,
            done = is_done,
            "state changed"
        );
        txes
    }

    async fn run_step(
        &self,
        step: &Step,
        execution: &Execution,
        pending: &[Tx],
    ) -> Option<ExecuteResult> {
        let ctx = ActionContext::new(self.store, self.factory, self.config, pending);
        self.executor.execute_action(step, execution, &ctx).await
    }

    fn update_execution<const N: usize>(&self, execution: &Execution, fields: [(&str, Value); N]) -> Tx {
        let operations: Map<String, Value> = fields
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect();
        self.factory
            .update_doc(&execution.class, &execution.space, &execution.id, operations)
    }
}

/// The execution as later steps should see it after `txes`.
fn fold_into(execution: &Execution, txes: &[Tx]) -> Execution {
    let id = execution.id.cast::<Doc>();
    if !txes.iter().any(|tx| tx.is_update() && tx.object_id == id) {
        return execution.clone();
    }
    let folded = Doc::from_model(execution).and_then(|mut doc| {
        for tx in txes {
            doc.apply(tx);
        }
        doc.parse::<Execution>()
    });
    match folded {
        Ok(next) => next,
        Err(err) => {
            warn!(execution = %execution.id, error = %err, "step wrote an unreadable execution, ignoring its updates");
            execution.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Ref;
    use crate::methods::{CREATE_TODO, UPDATE_CARD};
    use crate::model::{class, ContextRef, Rollback};
    use crate::error::ProcessError;
    use crate::model::ResolvedParams;
    use crate::registry::{MethodHandler, MethodRegistry, TransformRegistry};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;

    const ARCHIVE_LOG: Ref<crate::model::Method> = Ref::from_static("test:method:ArchiveLog");

    /// Seeds an extra rollback entry on the execution itself.
    struct ArchiveLog;

    #[async_trait]
    impl MethodHandler for ArchiveLog {
        async fn execute(
            &self,
            _params: ResolvedParams,
            execution: &Execution,
            ctx: &ActionContext<'_>,
        ) -> Result<ExecuteResult, ProcessError> {
            let mut log = execution.rollback.clone();
            log.insert(Ref::new("archived"), Vec::new());
            let mut operations = Map::new();
            operations.insert("rollback".into(), serde_json::to_value(&log).unwrap());
            let tx = ctx
                .factory()
                .update_doc(&execution.class, &execution.space, &execution.id, operations);
            Ok(ExecuteResult::new(vec![tx]))
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
            rollback: Rollback::new(),
        }
    }

    fn state(actions: Vec<Step>, end_action: Option<Step>) -> State {
        State {
            id: Ref::new("state-1"),
            class: class::STATE,
            space: Ref::new("space"),
            process: Ref::new("proc-1"),
            title: "Review".into(),
            actions,
            end_action,
        }
    }

    fn store() -> MemoryStore {
        MemoryStore::new().with_documents([Doc::new(Ref::new("card-1"), class::CARD, Ref::new("space"))
            .with("status", "open")
            .with("owner", "u1")])
    }

    async fn change(state: &State, execution: &Execution, is_done: bool) -> Vec<Tx> {
        change_with(MethodRegistry::with_builtins(), state, execution, is_done).await
    }

    async fn change_with(methods: MethodRegistry, state: &State, execution: &Execution, is_done: bool) -> Vec<Tx> {
        let store = store();
        let transforms = TransformRegistry::with_builtins(Some(1));
        let factory = TxFactory::new(Ref::new("core:account:System"));
        let config = EngineConfig::default();
        let transition = StateTransition::new(
            &store,
            ActionExecutor::new(&methods, &transforms),
            &factory,
            &config,
        );
        transition.change_state(execution, state, is_done).await
    }

    fn last_ops(txes: &[Tx]) -> &Map<String, Value> {
        txes.last().and_then(Tx::operations).unwrap()
    }

    // =========================================================================
    // State change
    // =========================================================================

    #[tokio::test]
    async fn test_empty_state_only_moves_execution() {
        let txes = change(&state(vec![], None), &execution(), true).await;

        assert_eq!(txes.len(), 1);
        assert_eq!(last_ops(&txes)["currentState"], json!("state-1"));
        assert_eq!(last_ops(&txes)["done"], json!(true));
    }

    #[tokio::test]
    async fn test_failed_step_does_not_abort_transition() {
        let steps = vec![
            Step::new(Ref::new("custom:method:Missing")),
            Step::new(UPDATE_CARD).literal("status", "active"),
        ];
        let txes = change(&state(steps, None), &execution(), false).await;

        // update card, rollback log, state change
        assert_eq!(txes.len(), 3);
        assert_eq!(txes[0].operations().unwrap()["status"], json!("active"));
        assert_eq!(last_ops(&txes)["done"], json!(false));
    }

    #[tokio::test]
    async fn test_end_action_runs_after_actions() {
        let steps = vec![Step::new(UPDATE_CARD).literal("status", "first")];
        let end = Step::new(UPDATE_CARD).literal("status", "end");
        let txes = change(&state(steps, Some(end)), &execution(), false).await;

        assert_eq!(txes[0].operations().unwrap()["status"], json!("first"));
        assert_eq!(txes[1].operations().unwrap()["status"], json!("end"));
    }

    // =========================================================================
    // Accumulation and rollback
    // =========================================================================

    #[tokio::test]
    async fn test_later_steps_see_earlier_card_updates() {
        let steps = vec![
            Step::new(UPDATE_CARD).literal("status", "active"),
            Step::new(UPDATE_CARD).context("copy", ContextRef::attribute("status")),
        ];
        let txes = change(&state(steps, None), &execution(), false).await;

        assert_eq!(txes[1].operations().unwrap()["copy"], json!("active"));
    }

    #[tokio::test]
    async fn test_rollback_is_stored_last_in_first_out() {
        let steps = vec![
            Step::new(UPDATE_CARD).literal("status", "active"),
            Step::new(UPDATE_CARD).literal("status", "closed"),
        ];
        let txes = change(&state(steps, None), &execution(), false).await;

        let log = &txes[2].operations().unwrap()["rollback"];
        let stored: Vec<Tx> = serde_json::from_value(log["state-1"].clone()).unwrap();
        assert_eq!(stored.len(), 2);
        // Undo "closed" (back to the accumulated "active") before undoing "active".
        assert_eq!(stored[0].operations().unwrap()["status"], json!("active"));
        assert_eq!(stored[1].operations().unwrap()["status"], json!("open"));
    }

    #[tokio::test]
    async fn test_reentering_state_overwrites_its_rollback() {
        let mut execution = execution();
        execution.rollback.insert(Ref::new("state-1"), vec![]);
        execution.rollback.insert(Ref::new("state-0"), vec![]);
        let steps = vec![Step::new(UPDATE_CARD).literal("status", "active")];

        let txes = change(&state(steps, None), &execution, false).await;
        let log: Rollback = serde_json::from_value(txes[1].operations().unwrap()["rollback"].clone()).unwrap();

        assert_eq!(log.len(), 2);
        assert_eq!(log["state-1"].len(), 1);
        assert!(log["state-0"].is_empty());
    }

    #[tokio::test]
    async fn test_later_steps_see_execution_updates() {
        let steps = vec![
            Step::new(CREATE_TODO)
                .literal("user", "u1")
                .literal("state", "state-1")
                .literal("title", "first"),
            Step::new(CREATE_TODO)
                .literal("user", "u2")
                .literal("state", "state-1")
                .literal("title", "second"),
        ];
        let txes = change(&state(steps, None), &execution(), false).await;

        let first_todo = txes[0].object_id.clone();
        let log = &last_ops(&txes[..txes.len() - 1])["rollback"]["state-1"];
        let stored: Vec<Tx> = serde_json::from_value(log.clone()).unwrap();
        // The second ToDo's restore points back at the first one.
        assert_eq!(stored[0].operations().unwrap()["assignee"], json!("u1"));
        assert_eq!(stored[0].operations().unwrap()["currentToDo"], json!(first_todo.as_str()));
        assert_eq!(stored[2].operations().unwrap()["assignee"], Value::Null);
    }

    #[tokio::test]
    async fn test_rollback_log_keeps_entries_written_by_steps() {
        let mut methods = MethodRegistry::with_builtins();
        methods.register(ARCHIVE_LOG, ArchiveLog);
        let steps = vec![
            Step::new(ARCHIVE_LOG),
            Step::new(UPDATE_CARD).literal("status", "active"),
        ];

        let txes = change_with(methods, &state(steps, None), &execution(), false).await;
        let log: Rollback =
            serde_json::from_value(last_ops(&txes[..txes.len() - 1])["rollback"].clone()).unwrap();

        assert_eq!(log.len(), 2);
        assert!(log["archived"].is_empty());
        assert_eq!(log["state-1"].len(), 1);
    }
}
