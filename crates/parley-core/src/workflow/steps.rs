//! Step executors, one per `StepKind` variant.
//!
//! `StepExecutor::execute` dispatches on the step kind and returns a
//! `StepExecutionResult`. Executors read the execution and its variables but
//! never write them: variable writes travel back in `variable_updates` and
//! the loop applies them.

use std::collections::HashMap;

use parley_types::workflow::{
    ChoiceOption, InputKind, Reply, RenderedOption, StepExecutionResult, StepKind, Variables,
    WorkflowExecution, WorkflowStep,
};
use serde_json::Value;

use super::action::ActionRegistry;
use super::error::WorkflowError;
use super::variables::VariableResolver;

/// Executes individual workflow steps by dispatching to kind-specific handlers.
#[derive(Debug, Clone, Default)]
pub struct StepExecutor {
    resolver: VariableResolver,
    actions: ActionRegistry,
}

impl StepExecutor {
    pub fn new(resolver: VariableResolver, actions: ActionRegistry) -> Self {
        Self { resolver, actions }
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    pub fn resolver(&self) -> &VariableResolver {
        &self.resolver
    }

    /// Execute one step.
    ///
    /// `reply` is the user's answer when this step is the one being resumed;
    /// interactive steps present themselves when it is `None`.
    pub async fn execute(
        &self,
        execution: &WorkflowExecution,
        step: &WorkflowStep,
        variables: &Variables,
        reply: Option<&Reply>,
    ) -> StepExecutionResult {
        tracing::debug!(
            execution_id = %execution.id,
            step_id = %step.id,
            step_type = %step.step_type(),
            resuming = reply.is_some(),
            "executing step"
        );

        match &step.kind {
            StepKind::Message { content, next_step } => {
                self.run_message(step, content, next_step, variables)
            }
            StepKind::Choice {
                content,
                variable,
                options,
                next_step,
            } => self.run_choice(step, content, variable, options, next_step, variables, reply),
            StepKind::Input {
                content,
                variable,
                next_step,
            } => self.run_input(step, content, variable, next_step, variables, reply),
            StepKind::Condition {
                condition,
                true_step,
                false_step,
                next_step,
            } => self.run_condition(step, condition, true_step, false_step, next_step, variables),
            StepKind::Action {
                action,
                params,
                next_step,
            } => {
                self.run_action(execution, step, action, params, next_step, variables)
                    .await
            }
        }
    }

    fn run_message(
        &self,
        step: &WorkflowStep,
        content: &str,
        next_step: &Option<String>,
        variables: &Variables,
    ) -> StepExecutionResult {
        let mut result = StepExecutionResult::advance(step, next_step.clone());
        result.output = Some(self.resolver.resolve_content(content, variables));
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn run_choice(
        &self,
        step: &WorkflowStep,
        content: &str,
        variable: &str,
        options: &[ChoiceOption],
        next_step: &Option<String>,
        variables: &Variables,
        reply: Option<&Reply>,
    ) -> StepExecutionResult {
        let rendered: Vec<RenderedOption> = options
            .iter()
            .enumerate()
            .map(|(i, opt)| RenderedOption {
                index: i + 1,
                text: self.resolver.resolve_content(&opt.text, variables),
                value: opt.value.clone(),
            })
            .collect();

        let present = |error: Option<String>| {
            let prompt = self.resolver.resolve_content(content, variables);
            let mut result = StepExecutionResult::await_input(step, InputKind::Choice, prompt);
            result.options = rendered.clone();
            if let Some(error) = error {
                result.success = false;
                result.error_message = Some(error);
            }
            result
        };

        let Some(reply) = reply else {
            return present(None);
        };

        let Some(index) = match_option(reply.as_str(), &rendered) else {
            tracing::debug!(step_id = %step.id, reply = reply.as_str(), "choice reply matched no option");
            return present(Some(format!("invalid selection: '{}'", reply.as_str().trim())));
        };

        let chosen = &options[index];
        let next = chosen.next_step.clone().or_else(|| next_step.clone());
        let mut result = StepExecutionResult::advance(step, next);
        result
            .variable_updates
            .insert(variable.to_string(), Value::String(chosen.value.clone()));
        result
    }

    fn run_input(
        &self,
        step: &WorkflowStep,
        content: &str,
        variable: &str,
        next_step: &Option<String>,
        variables: &Variables,
        reply: Option<&Reply>,
    ) -> StepExecutionResult {
        let Some(reply) = reply else {
            let prompt = self.resolver.resolve_content(content, variables);
            return StepExecutionResult::await_input(step, InputKind::Input, prompt);
        };

        // A blank reply is still an answer: stored as "" and the run moves on.
        let text = reply.as_str().trim();
        let mut result = StepExecutionResult::advance(step, next_step.clone());
        result
            .variable_updates
            .insert(variable.to_string(), Value::String(text.to_string()));
        result
    }

    fn run_condition(
        &self,
        step: &WorkflowStep,
        condition: &str,
        true_step: &Option<String>,
        false_step: &Option<String>,
        next_step: &Option<String>,
        variables: &Variables,
    ) -> StepExecutionResult {
        let met = self.resolver.evaluate_condition(condition, variables);
        let branch = if met { true_step } else { false_step };
        let next = branch.clone().or_else(|| next_step.clone());
        tracing::debug!(step_id = %step.id, condition, met, next = ?next, "condition evaluated");
        StepExecutionResult::advance(step, next)
    }

    async fn run_action(
        &self,
        execution: &WorkflowExecution,
        step: &WorkflowStep,
        action: &str,
        params: &HashMap<String, Value>,
        next_step: &Option<String>,
        variables: &Variables,
    ) -> StepExecutionResult {
        let resolved: HashMap<String, Value> = params
            .iter()
            .map(|(k, v)| (k.clone(), self.resolver.resolve_value(v, variables)))
            .collect();

        let mut result = StepExecutionResult::advance(step, next_step.clone());
        match self
            .actions
            .execute(
                action,
                &resolved,
                variables,
                &execution.tenant_id,
                execution.id,
            )
            .await
        {
            Ok(updates) => {
                result.variable_updates = updates;
            }
            Err(e) => {
                let err = WorkflowError::ActionExecutionError {
                    action: action.to_string(),
                    message: e.to_string(),
                };
                tracing::warn!(
                    execution_id = %execution.id,
                    step_id = %step.id,
                    error = %err,
                    "action step failed"
                );
                result.success = false;
                result.error_message = Some(err.to_string());
            }
        }
        result
    }
}

/// Match a reply against rendered options: exact value, then case-insensitive
/// text, then 1-based index. Returns the option's position.
fn match_option(reply: &str, options: &[RenderedOption]) -> Option<usize> {
    let reply = reply.trim();
    if reply.is_empty() {
        return None;
    }
    if let Some(i) = options.iter().position(|o| o.value == reply) {
        return Some(i);
    }
    let lowered = reply.to_lowercase();
    if let Some(i) = options
        .iter()
        .position(|o| o.text.trim().to_lowercase() == lowered)
    {
        return Some(i);
    }
    reply
        .parse::<usize>()
        .ok()
        .filter(|n| (1..=options.len()).contains(n))
        .map(|n| n - 1)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
