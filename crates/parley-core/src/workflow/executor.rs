//! The per-turn auto-execution loop.
//!
//! `WorkflowExecutor::auto_execute_steps` drives an execution from a cursor
//! step until the run needs user input, completes, fails, or hits the
//! per-turn step ceiling. It is the only code that mutates a
//! `WorkflowExecution`; the caller persists the record once afterwards.
//!
//! # Loop
//!
//! 1. Stop if the execution is no longer RUNNING.
//! 2. Resolve the cursor; an unknown step ID fails the run.
//! 3. Dispatch the step once and count it.
//! 4. Apply variable updates and collect chat output.
//! 5. Pause on input, fail on action error (per policy), or complete on a
//!    null successor.
//! 6. Otherwise advance the cursor, failing the run after `max_steps`
//!    dispatches in one turn.

use chrono::Utc;
use parley_types::config::ActionFailurePolicy;
use parley_types::workflow::{
    ExecutionStatus, ResumePayload, StepExecutionResult, StepType, WorkflowDefinition,
    WorkflowExecution,
};

use super::error::WorkflowError;
use super::steps::StepExecutor;
use super::variables::apply_variables;

/// What happened during one turn of auto-execution.
#[derive(Debug, Clone)]
pub struct AutoExecution {
    /// The result the turn stopped on (pause, completion, or failure).
    pub result: StepExecutionResult,
    /// Chat-ready text emitted during the turn, in order.
    pub messages: Vec<String>,
    /// IDs of the steps dispatched this turn, in order.
    pub executed_steps: Vec<String>,
}

/// Drives executions through their steps.
#[derive(Debug, Clone, Default)]
pub struct WorkflowExecutor {
    steps: StepExecutor,
    action_failure_policy: ActionFailurePolicy,
}

impl WorkflowExecutor {
    pub fn new(steps: StepExecutor, action_failure_policy: ActionFailurePolicy) -> Self {
        Self {
            steps,
            action_failure_policy,
        }
    }

    pub fn steps(&self) -> &StepExecutor {
        &self.steps
    }

    /// Run steps starting at `start_step_id` until the turn ends.
    ///
    /// `resume` carries the user's reply to the step the run is parked on. It
    /// is consumed the first time that step executes this turn; a cycle that
    /// revisits the step later presents it afresh.
    pub async fn auto_execute_steps(
        &self,
        execution: &mut WorkflowExecution,
        start_step_id: &str,
        definition: &WorkflowDefinition,
        mut resume: Option<ResumePayload>,
        max_steps: u32,
    ) -> AutoExecution {
        let policy = definition
            .settings
            .on_action_error
            .unwrap_or(self.action_failure_policy);
        let max_steps = max_steps.max(1);

        let mut cursor = start_step_id.to_string();
        let mut count: u32 = 0;
        let mut messages = Vec::new();
        let mut executed_steps = Vec::new();
        let mut last: Option<StepExecutionResult> = None;

        let result = loop {
            if !execution.is_running() {
                tracing::info!(
                    execution_id = %execution.id,
                    status = %execution.status,
                    "execution no longer running, stopping"
                );
                break last.take().unwrap_or_else(|| {
                    StepExecutionResult::failure(
                        cursor.clone(),
                        format!("execution is {}", execution.status),
                    )
                });
            }

            let Some(step) = definition.step(&cursor) else {
                let err = WorkflowError::UnknownStep(cursor.clone());
                tracing::error!(execution_id = %execution.id, error = %err, "aborting execution");
                fail(execution, &err.to_string());
                execution.current_step_id = Some(cursor.clone());
                break StepExecutionResult::failure(cursor.clone(), err.to_string());
            };

            let reply = match &resume {
                Some(payload) if payload.step_id == step.id => resume.take().map(|p| p.reply),
                _ => None,
            };

            let result = self
                .steps
                .execute(execution, step, &execution.variables, reply.as_ref())
                .await;

            execution.steps_completed = execution.steps_completed.saturating_add(1);
            if execution.steps_completed == execution.total_steps.saturating_add(1) {
                tracing::warn!(
                    execution_id = %execution.id,
                    steps_completed = execution.steps_completed,
                    total_steps = execution.total_steps,
                    "execution has run more steps than the definition contains"
                );
            }
            executed_steps.push(step.id.clone());

            apply_variables(&mut execution.variables, &result.variable_updates);
            if let Some(text) = result.rendered_text() {
                messages.push(text);
            }

            if result.is_waiting() {
                execution.current_step_id = Some(step.id.clone());
                tracing::debug!(
                    execution_id = %execution.id,
                    step_id = %step.id,
                    "awaiting user input"
                );
                break result;
            }

            if !result.success && step.step_type() == StepType::Action {
                let message = result.error_message.clone().unwrap_or_default();
                match policy {
                    ActionFailurePolicy::FailExecution => {
                        fail(execution, &message);
                        execution.current_step_id = Some(step.id.clone());
                        break result;
                    }
                    ActionFailurePolicy::Continue => {
                        tracing::warn!(
                            execution_id = %execution.id,
                            step_id = %step.id,
                            error = %message,
                            "continuing past failed action"
                        );
                    }
                }
            }

            let next = match (&result.next_step_id, result.workflow_completed) {
                (Some(next), false) => next.clone(),
                _ => {
                    execution.status = ExecutionStatus::Completed;
                    execution.completed_at = Some(Utc::now());
                    execution.current_step_id = None;
                    tracing::info!(
                        execution_id = %execution.id,
                        steps_completed = execution.steps_completed,
                        "execution completed"
                    );
                    break result;
                }
            };

            count += 1;
            if count >= max_steps {
                let err = WorkflowError::LoopSafetyExceeded { max_steps };
                tracing::error!(execution_id = %execution.id, error = %err, "aborting execution");
                fail(execution, &err.to_string());
                execution.current_step_id = Some(next);
                let mut result = result;
                result.success = false;
                result.next_step_id = None;
                result.error_message = Some(err.to_string());
                break result;
            }

            execution.current_step_id = Some(next.clone());
            cursor = next;
            last = Some(result);
        };

        if let Some(payload) = resume {
            tracing::debug!(
                execution_id = %execution.id,
                step_id = %payload.step_id,
                "resume payload was not consumed this turn"
            );
        }
        execution.updated_at = Utc::now();

        AutoExecution {
            result,
            messages,
            executed_steps,
        }
    }
}

fn fail(execution: &mut WorkflowExecution, message: &str) {
    execution.status = ExecutionStatus::Failed;
    execution.error_message = Some(message.to_string());
    execution.completed_at = Some(Utc::now());
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parley_types::workflow::{InputKind, TriggerEvent, Variables};
    use serde_json::{Value, json};
    use uuid::Uuid;

    use super::*;
    use crate::workflow::action::{ActionError, ActionFuture, ActionHandler, ActionRegistry};
    use crate::workflow::definition::parse_workflow_yaml;
    use crate::workflow::variables::VariableResolver;

    struct Counter {
        calls: AtomicUsize,
        fail: bool,
    }

    impl Counter {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ActionHandler for Counter {
        fn execute<'a>(
            &'a self,
            _action_type: &'a str,
            _params: &'a HashMap<String, Value>,
            _variables: &'a Variables,
            _tenant_id: &'a str,
            _execution_id: Uuid,
        ) -> ActionFuture<'a> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if self.fail {
                    return Err(ActionError::Failed("handler exploded".to_string()));
                }
                let mut out = Variables::new();
                out.insert("action_calls".to_string(), json!(n));
                Ok(out)
            })
        }
    }

    fn executor_with(handler: Arc<Counter>, policy: ActionFailurePolicy) -> WorkflowExecutor {
        WorkflowExecutor::new(
            StepExecutor::new(
                VariableResolver::default(),
                ActionRegistry::new().with("record", handler),
            ),
            policy,
        )
    }

    fn start(def: &WorkflowDefinition) -> WorkflowExecution {
        WorkflowExecution::new(
            def,
            &TriggerEvent {
                tenant_id: "acme".to_string(),
                session_id: "s1".to_string(),
                user_identifier: "u1".to_string(),
                variables: Variables::new(),
            },
        )
    }

    fn first(def: &WorkflowDefinition) -> String {
        def.steps[0].id.clone()
    }

    #[tokio::test]
    async fn test_linear_non_interactive_steps_count_once_each() {
        let def = parse_workflow_yaml(
            r#"
name: linear
steps:
  - { id: a, type: MESSAGE, content: "one", next_step: b }
  - { id: b, type: MESSAGE, content: "two", next_step: c }
  - { id: c, type: ACTION, action: record, next_step: d }
  - { id: d, type: MESSAGE, content: "calls={{action_calls}}" }
"#,
        )
        .unwrap();
        let counter = Counter::new(false);
        let executor = executor_with(counter.clone(), ActionFailurePolicy::FailExecution);
        let mut exec = start(&def);

        let turn = executor
            .auto_execute_steps(&mut exec, &first(&def), &def, None, 50)
            .await;

        assert_eq!(exec.steps_completed, 4);
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert!(exec.completed_at.is_some());
        assert!(exec.current_step_id.is_none());
        assert!(turn.result.workflow_completed);
        assert_eq!(turn.messages, vec!["one", "two", "calls=1"]);
        assert_eq!(turn.executed_steps, vec!["a", "b", "c", "d"]);
        assert_eq!(counter.calls(), 1);
    }

    #[tokio::test]
    async fn test_message_does_not_block_auto_advance() {
        let def = parse_workflow_yaml(
            r#"
name: greet
steps:
  - { id: hello, type: MESSAGE, content: "Hello", next_step: ask }
  - { id: ask, type: INPUT, content: "Name?", variable: name }
"#,
        )
        .unwrap();
        let executor = WorkflowExecutor::default();
        let mut exec = start(&def);

        let turn = executor
            .auto_execute_steps(&mut exec, "hello", &def, None, 50)
            .await;

        assert_eq!(turn.result.step_id, "ask");
        assert_eq!(turn.result.input_required, Some(InputKind::Input));
        assert_eq!(turn.messages, vec!["Hello", "Name?"]);
        assert_eq!(exec.status, ExecutionStatus::Running);
        assert_eq!(exec.current_step_id.as_deref(), Some("ask"));
        assert_eq!(exec.steps_completed, 2);
    }

    #[tokio::test]
    async fn test_choice_message_action_across_two_turns() {
        let def = parse_workflow_yaml(
            r#"
name: order
steps:
  - id: pick
    type: CHOICE
    content: "Size?"
    variable: size
    options:
      - { text: Small, value: s }
      - { text: Large, value: l }
    next_step: confirm
  - { id: confirm, type: MESSAGE, content: "You chose {{size}}", next_step: save }
  - { id: save, type: ACTION, action: record }
"#,
        )
        .unwrap();
        let counter = Counter::new(false);
        let executor = executor_with(counter.clone(), ActionFailurePolicy::FailExecution);
        let mut exec = start(&def);

        let turn = executor
            .auto_execute_steps(&mut exec, "pick", &def, None, 50)
            .await;
        assert_eq!(turn.result.input_required, Some(InputKind::Choice));
        assert_eq!(exec.steps_completed, 1);
        assert_eq!(counter.calls(), 0);

        let before = exec.steps_completed;
        let turn = executor
            .auto_execute_steps(
                &mut exec,
                "pick",
                &def,
                Some(ResumePayload::selection("pick", "Large")),
                50,
            )
            .await;

        assert_eq!(exec.steps_completed - before, 3);
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert!(turn.result.input_required.is_none());
        assert_eq!(exec.variables["size"], json!("l"));
        assert_eq!(turn.messages, vec!["You chose l"]);
        assert_eq!(counter.calls(), 1);
    }

    #[tokio::test]
    async fn test_cycle_fails_after_exactly_max_steps() {
        let def = parse_workflow_yaml(
            r#"
name: spin
steps:
  - { id: ping, type: CONDITION, condition: "{{never}}", next_step: pong }
  - { id: pong, type: ACTION, action: record, next_step: ping }
"#,
        )
        .unwrap();
        let executor = executor_with(Counter::new(false), ActionFailurePolicy::FailExecution);
        let mut exec = start(&def);

        let turn = executor
            .auto_execute_steps(&mut exec, "ping", &def, None, 7)
            .await;

        assert_eq!(exec.steps_completed, 7);
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(!turn.result.success);
        let msg = exec.error_message.clone().unwrap();
        assert!(msg.contains("infinite loop"), "got: {msg}");
        assert!(turn.result.error_message.unwrap().contains("infinite loop"));
    }

    #[tokio::test]
    async fn test_condition_branches_by_variable() {
        let def = parse_workflow_yaml(
            r#"
name: branch
steps:
  - { id: check, type: CONDITION, condition: "{{tier}} == 'gold'", true_step: A, false_step: B }
  - { id: A, type: MESSAGE, content: "gold" }
  - { id: B, type: MESSAGE, content: "basic" }
"#,
        )
        .unwrap();
        let executor = WorkflowExecutor::default();

        for (tier, expected) in [(Some("gold"), "A"), (Some("silver"), "B"), (None, "B")] {
            let mut exec = start(&def);
            if let Some(tier) = tier {
                exec.variables.insert("tier".to_string(), json!(tier));
            }
            let turn = executor
                .auto_execute_steps(&mut exec, "check", &def, None, 50)
                .await;
            assert_eq!(turn.executed_steps, vec!["check", expected]);
            assert_eq!(exec.status, ExecutionStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_unknown_step_fails_run() {
        let def = parse_workflow_yaml(
            r#"
name: tiny
steps:
  - { id: only, type: MESSAGE, content: "hi" }
"#,
        )
        .unwrap();
        let executor = WorkflowExecutor::default();
        let mut exec = start(&def);

        let turn = executor
            .auto_execute_steps(&mut exec, "ghost", &def, None, 50)
            .await;
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.steps_completed, 0);
        assert_eq!(exec.error_message.as_deref(), Some("unknown step 'ghost'"));
        assert!(!turn.result.success);
        assert!(turn.result.step_type.is_none());
    }

    #[tokio::test]
    async fn test_action_failure_policies() {
        let yaml = r#"
name: fragile
steps:
  - { id: call, type: ACTION, action: record, next_step: after }
  - { id: after, type: MESSAGE, content: "carried on" }
"#;
        let def = parse_workflow_yaml(yaml).unwrap();

        let executor = executor_with(Counter::new(true), ActionFailurePolicy::FailExecution);
        let mut exec = start(&def);
        let turn = executor
            .auto_execute_steps(&mut exec, "call", &def, None, 50)
            .await;
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(exec.error_message.unwrap().contains("handler exploded"));
        assert_eq!(turn.executed_steps, vec!["call"]);

        let executor = executor_with(Counter::new(true), ActionFailurePolicy::Continue);
        let mut exec = start(&def);
        let turn = executor
            .auto_execute_steps(&mut exec, "call", &def, None, 50)
            .await;
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(turn.messages, vec!["carried on"]);
        assert_eq!(exec.steps_completed, 2);
    }

    #[tokio::test]
    async fn test_definition_setting_overrides_action_policy() {
        let def = parse_workflow_yaml(
            r#"
name: lenient
settings:
  on_action_error: continue
steps:
  - { id: call, type: ACTION, action: record }
"#,
        )
        .unwrap();
        let executor = executor_with(Counter::new(true), ActionFailurePolicy::FailExecution);
        let mut exec = start(&def);
        executor
            .auto_execute_steps(&mut exec, "call", &def, None, 50)
            .await;
        assert_eq!(exec.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_resume_payload_consumed_once_in_cycle() {
        let def = parse_workflow_yaml(
            r#"
name: again
steps:
  - { id: ask, type: INPUT, content: "More?", variable: answer, next_step: check }
  - { id: check, type: CONDITION, condition: "{{answer}} == 'yes'", true_step: ask, false_step: bye }
  - { id: bye, type: MESSAGE, content: "bye" }
"#,
        )
        .unwrap();
        let executor = WorkflowExecutor::default();
        let mut exec = start(&def);

        let turn = executor
            .auto_execute_steps(
                &mut exec,
                "ask",
                &def,
                Some(ResumePayload::text("ask", "yes")),
                50,
            )
            .await;

        assert_eq!(turn.executed_steps, vec!["ask", "check", "ask"]);
        assert_eq!(turn.result.input_required, Some(InputKind::Input));
        assert_eq!(exec.current_step_id.as_deref(), Some("ask"));
        assert_eq!(exec.status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn test_non_running_execution_is_not_advanced() {
        let def = parse_workflow_yaml(
            r#"
name: stopped
steps:
  - { id: a, type: MESSAGE, content: "a" }
"#,
        )
        .unwrap();
        let executor = WorkflowExecutor::default();
        let mut exec = start(&def);
        exec.status = ExecutionStatus::Cancelled;

        let turn = executor
            .auto_execute_steps(&mut exec, "a", &def, None, 50)
            .await;
        assert_eq!(exec.steps_completed, 0);
        assert!(turn.executed_steps.is_empty());
        assert!(!turn.result.success);
        assert_eq!(exec.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_same_inputs_same_sequence() {
        let def = parse_workflow_yaml(
            r#"
name: det
steps:
  - id: pick
    type: CHOICE
    content: "Pick"
    variable: p
    options:
      - { text: X, value: x, next_step: mx }
      - { text: Y, value: y, next_step: my }
  - { id: mx, type: MESSAGE, content: "x", next_step: act }
  - { id: my, type: MESSAGE, content: "y", next_step: act }
  - { id: act, type: ACTION, action: record }
"#,
        )
        .unwrap();

        let mut runs = Vec::new();
        for _ in 0..2 {
            let executor = executor_with(Counter::new(false), ActionFailurePolicy::FailExecution);
            let mut exec = start(&def);
            executor
                .auto_execute_steps(&mut exec, "pick", &def, None, 50)
                .await;
            let turn = executor
                .auto_execute_steps(
                    &mut exec,
                    "pick",
                    &def,
                    Some(ResumePayload::selection("pick", "2")),
                    50,
                )
                .await;
            runs.push((turn.executed_steps, exec.steps_completed));
        }
        assert_eq!(runs[0], runs[1]);
        assert_eq!(runs[0].0, vec!["pick", "my", "act"]);
    }

    struct OverlappingWrites;

    impl ActionHandler for OverlappingWrites {
        fn execute<'a>(
            &'a self,
            _action_type: &'a str,
            _params: &'a HashMap<String, Value>,
            _variables: &'a Variables,
            _tenant_id: &'a str,
            _execution_id: Uuid,
        ) -> ActionFuture<'a> {
            Box::pin(async {
                let mut out = Variables::new();
                out.insert("profile".to_string(), json!({ "tier": "basic" }));
                out.insert("profile.tier".to_string(), json!("gold"));
                Ok(out)
            })
        }
    }

    #[tokio::test]
    async fn test_overlapping_action_writes_route_the_same_every_run() {
        let def = parse_workflow_yaml(
            r#"
name: tiers
steps:
  - { id: act, type: ACTION, action: upgrade, next_step: check }
  - id: check
    type: CONDITION
    condition: "{{profile.tier}} == 'gold'"
    true_step: gold
    false_step: basic
  - { id: gold, type: MESSAGE, content: "gold" }
  - { id: basic, type: MESSAGE, content: "basic" }
"#,
        )
        .unwrap();

        for _ in 0..200 {
            let executor = WorkflowExecutor::new(
                StepExecutor::new(
                    VariableResolver::default(),
                    ActionRegistry::new().with("upgrade", Arc::new(OverlappingWrites)),
                ),
                ActionFailurePolicy::FailExecution,
            );
            let mut exec = start(&def);
            let turn = executor
                .auto_execute_steps(&mut exec, "act", &def, None, 50)
                .await;
            assert_eq!(turn.executed_steps, vec!["act", "check", "gold"]);
            assert_eq!(exec.variables["profile"], json!({ "tier": "gold" }));
        }
    }

    #[tokio::test]
    async fn test_blank_input_reply_continues_past_the_prompt() {
        let def = parse_workflow_yaml(
            r#"
name: blank
steps:
  - { id: ask, type: INPUT, content: "Anything to add?", variable: note, next_step: bye }
  - { id: bye, type: MESSAGE, content: "Thanks" }
"#,
        )
        .unwrap();
        let executor = WorkflowExecutor::default();
        let mut exec = start(&def);
        executor
            .auto_execute_steps(&mut exec, "ask", &def, None, 50)
            .await;

        let turn = executor
            .auto_execute_steps(
                &mut exec,
                "ask",
                &def,
                Some(ResumePayload::text("ask", "   ")),
                50,
            )
            .await;
        assert_eq!(turn.executed_steps, vec!["ask", "bye"]);
        assert!(turn.result.input_required.is_none());
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.variables["note"], json!(""));
    }
}
