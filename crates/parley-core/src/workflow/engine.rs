//! Turn driver: loads state, runs one turn through the executor, persists once.
//!
//! `WorkflowEngine` is what the chat layer talks to. A trigger starts a run
//! with `start`; every later inbound message for the session goes through
//! `resume` (or `handle_message`, which finds the session's active run). Each
//! call performs exactly one `save_execution` after the loop finishes, so a
//! crash mid-turn never leaves a half-written record.

use chrono::{Duration, Utc};
use parley_types::config::EngineConfig;
use parley_types::error::RepositoryError;
use parley_types::workflow::{
    ExecutionStatus, InputKind, ResumePayload, StepExecutionResult, StepKind, StepType,
    TriggerEvent, WorkflowDefinition, WorkflowExecution,
};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;

use super::action::ActionRegistry;
use super::definition::{lint_definition, validate_definition};
use super::error::WorkflowError;
use super::executor::{AutoExecution, WorkflowExecutor};
use super::steps::StepExecutor;
use super::variables::{VariableResolver, apply_variable, apply_variables};

const DEFAULT_COMPLETION_MESSAGE: &str = "All done. Thanks!";
const DEFAULT_FAILURE_MESSAGE: &str = "Sorry, something went wrong. Please try again later.";
const DEFAULT_CANCELLED_MESSAGE: &str = "This conversation has been cancelled.";
const DEFAULT_WAITING_MESSAGE: &str = "Please reply to continue.";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors surfaced to callers of the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("workflow not found: {0}")]
    DefinitionNotFound(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("execution {id} is not running (status: {status})")]
    NotRunning { id: Uuid, status: ExecutionStatus },

    #[error("session already has an active execution: {execution_id}")]
    SessionBusy { execution_id: Uuid },

    #[error("execution {0} is running but has no current step")]
    MissingCursor(Uuid),
}

// ---------------------------------------------------------------------------
// TurnOutcome
// ---------------------------------------------------------------------------

/// Everything the chat layer needs after one turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    /// The execution record as persisted at the end of the turn.
    pub execution: WorkflowExecution,
    /// The result the turn stopped on.
    pub result: StepExecutionResult,
    /// Messages and prompts emitted during the turn, in order.
    pub messages: Vec<String>,
    /// Steps dispatched during the turn, in order.
    pub executed_steps: Vec<String>,
    /// Completion, failure, or cancellation notice appended after `messages`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closing_message: Option<String>,
}

impl TurnOutcome {
    fn new(
        execution: WorkflowExecution,
        turn: AutoExecution,
        definition: &WorkflowDefinition,
        resolver: &VariableResolver,
    ) -> Self {
        let settings = &definition.settings;
        let render = |text: &String| resolver.resolve_content(text, &execution.variables);
        let closing_message = match execution.status {
            ExecutionStatus::Completed => settings
                .completion_message
                .as_ref()
                .map(render)
                .or_else(|| {
                    turn.messages
                        .is_empty()
                        .then(|| DEFAULT_COMPLETION_MESSAGE.to_string())
                }),
            ExecutionStatus::Failed => Some(
                settings
                    .failure_message
                    .as_ref()
                    .map(render)
                    .unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string()),
            ),
            ExecutionStatus::Cancelled => turn
                .messages
                .is_empty()
                .then(|| DEFAULT_CANCELLED_MESSAGE.to_string()),
            ExecutionStatus::Running => None,
        };

        Self {
            execution,
            result: turn.result,
            messages: turn.messages,
            executed_steps: turn.executed_steps,
            closing_message,
        }
    }

    /// The text to send back to the user. Never empty.
    pub fn reply_text(&self) -> String {
        let parts: Vec<&str> = self
            .messages
            .iter()
            .map(String::as_str)
            .chain(self.closing_message.as_deref())
            .filter(|s| !s.trim().is_empty())
            .collect();
        if parts.is_empty() {
            DEFAULT_WAITING_MESSAGE.to_string()
        } else {
            parts.join("\n\n")
        }
    }

    /// What kind of reply the run is waiting for, if it is paused.
    pub fn awaiting(&self) -> Option<InputKind> {
        if self.execution.is_running() {
            self.result.input_required
        } else {
            None
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.execution.status
    }
}

/// Warnings for replacing a stored definition in place.
///
/// Running executions keep their cursor and `total_steps` across a
/// replacement; a cursor on a removed step fails the run with an unknown
/// step error on its next turn.
fn replacement_warnings(previous: &WorkflowDefinition, next: &WorkflowDefinition) -> Vec<String> {
    let removed: Vec<&str> = previous
        .steps
        .iter()
        .map(|s| s.id.as_str())
        .filter(|id| next.step(id).is_none())
        .collect();
    if removed.is_empty() {
        return Vec::new();
    }
    vec![format!(
        "replacing '{}' removes steps [{}]; running executions paused on them will fail on their next turn",
        previous.name,
        removed.join(", ")
    )]
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Wires the repository, the executor, and engine configuration together.
///
/// Generic over `R: WorkflowRepository` for storage flexibility.
pub struct WorkflowEngine<R: WorkflowRepository> {
    repo: R,
    executor: WorkflowExecutor,
    resolver: VariableResolver,
    config: EngineConfig,
}

impl<R: WorkflowRepository> WorkflowEngine<R> {
    /// Create an engine over `repo` that dispatches ACTION steps to `actions`.
    pub fn new(repo: R, actions: ActionRegistry, config: EngineConfig) -> Self {
        let resolver = VariableResolver::new(config.unresolved_templates);
        let executor = WorkflowExecutor::new(
            StepExecutor::new(resolver, actions),
            config.action_failure_policy,
        );
        Self {
            repo,
            executor,
            resolver,
            config,
        }
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Validate and store a definition. Returns lint warnings.
    pub async fn register(&self, def: &WorkflowDefinition) -> Result<Vec<String>, EngineError> {
        validate_definition(def)?;

        let mut warnings = lint_definition(def);
        let actions = self.executor.steps().actions();
        for step in &def.steps {
            if let StepKind::Action { action, .. } = &step.kind {
                if !actions.contains(action) {
                    warnings.push(format!(
                        "step '{}' uses action '{}' which is not registered",
                        step.id, action
                    ));
                }
            }
        }
        if let Some(previous) = self.repo.get_definition(&def.id).await? {
            warnings.extend(replacement_warnings(&previous, def));
        }
        for warning in &warnings {
            tracing::warn!(workflow = %def.name, %warning, "workflow lint");
        }

        self.repo.save_definition(def).await?;
        tracing::info!(workflow_id = %def.id, workflow = %def.name, "registered workflow");
        Ok(warnings)
    }

    /// Load a definition by ID.
    pub async fn definition(&self, id: &Uuid) -> Result<WorkflowDefinition, EngineError> {
        self.repo
            .get_definition(id)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(id.to_string()))
    }

    /// Load a definition by UUID or, failing that, by name.
    pub async fn find_definition(&self, id_or_name: &str) -> Result<WorkflowDefinition, EngineError> {
        let found = match Uuid::parse_str(id_or_name) {
            Ok(id) => self.repo.get_definition(&id).await?,
            Err(_) => self.repo.get_definition_by_name(id_or_name).await?,
        };
        found.ok_or_else(|| EngineError::DefinitionNotFound(id_or_name.to_string()))
    }

    // -----------------------------------------------------------------------
    // Turns
    // -----------------------------------------------------------------------

    /// Start a new run of `workflow_id` for the session named by `trigger`.
    ///
    /// Declared variables are initialised to null, then trigger variables are
    /// applied on top. The first turn runs immediately.
    pub async fn start(
        &self,
        workflow_id: &Uuid,
        trigger: TriggerEvent,
    ) -> Result<TurnOutcome, EngineError> {
        let def = self.definition(workflow_id).await?;
        validate_definition(&def)?;

        if let Some(active) = self
            .repo
            .find_active_execution(&trigger.tenant_id, &trigger.session_id)
            .await?
        {
            return Err(EngineError::SessionBusy {
                execution_id: active.id,
            });
        }

        let mut execution = WorkflowExecution::new(&def, &trigger);
        for name in &def.variables {
            apply_variable(&mut execution.variables, name, Value::Null);
        }
        apply_variables(&mut execution.variables, &trigger.variables);
        self.repo.create_execution(&execution).await?;

        tracing::info!(
            execution_id = %execution.id,
            workflow = %def.name,
            tenant_id = %execution.tenant_id,
            session_id = %execution.session_id,
            "starting workflow execution"
        );

        let start = execution
            .current_step_id
            .clone()
            .ok_or(EngineError::MissingCursor(execution.id))?;
        self.run_turn(execution, &def, &start, None).await
    }

    /// Feed the user's reply to a paused run and advance it.
    ///
    /// The reply becomes a selection for a CHOICE cursor and free text for an
    /// INPUT cursor. A non-interactive cursor (left by an interrupted turn)
    /// is simply re-entered and the reply ignored.
    pub async fn resume(
        &self,
        execution_id: &Uuid,
        reply: &str,
    ) -> Result<TurnOutcome, EngineError> {
        let execution = self.get_execution(execution_id).await?;
        if !execution.is_running() {
            return Err(EngineError::NotRunning {
                id: execution.id,
                status: execution.status,
            });
        }
        let def = self.definition(&execution.workflow_id).await?;
        let cursor = execution
            .current_step_id
            .clone()
            .ok_or(EngineError::MissingCursor(execution.id))?;

        let resume = match def.step(&cursor).map(|s| s.step_type()) {
            Some(StepType::Choice) => Some(ResumePayload::selection(&cursor, reply)),
            Some(StepType::Input) => Some(ResumePayload::text(&cursor, reply)),
            _ => {
                tracing::debug!(
                    execution_id = %execution.id,
                    step_id = %cursor,
                    "cursor is not awaiting input, reply ignored"
                );
                None
            }
        };

        tracing::info!(execution_id = %execution.id, step_id = %cursor, "resuming workflow execution");
        self.run_turn(execution, &def, &cursor, resume).await
    }

    /// Route a chat message to the session's active run, if there is one.
    pub async fn handle_message(
        &self,
        tenant_id: &str,
        session_id: &str,
        user_identifier: &str,
        reply: &str,
    ) -> Result<Option<TurnOutcome>, EngineError> {
        let Some(active) = self.active_execution(tenant_id, session_id).await? else {
            return Ok(None);
        };
        if active.user_identifier != user_identifier {
            tracing::debug!(
                execution_id = %active.id,
                started_by = %active.user_identifier,
                replied_by = %user_identifier,
                "reply from a different user in the same session"
            );
        }
        self.resume(&active.id, reply).await.map(Some)
    }

    async fn run_turn(
        &self,
        mut execution: WorkflowExecution,
        def: &WorkflowDefinition,
        start: &str,
        resume: Option<ResumePayload>,
    ) -> Result<TurnOutcome, EngineError> {
        let max_steps = def
            .settings
            .max_steps_per_turn
            .unwrap_or(self.config.max_steps_per_turn)
            .max(1);
        let turn = self
            .executor
            .auto_execute_steps(&mut execution, start, def, resume, max_steps)
            .await;
        self.repo.save_execution(&execution).await?;
        Ok(TurnOutcome::new(execution, turn, def, &self.resolver))
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Mark a RUNNING execution CANCELLED.
    pub async fn cancel(&self, execution_id: &Uuid) -> Result<WorkflowExecution, EngineError> {
        let mut execution = self.get_execution(execution_id).await?;
        if !execution.is_running() {
            return Err(EngineError::NotRunning {
                id: execution.id,
                status: execution.status,
            });
        }
        let now = Utc::now();
        execution.status = ExecutionStatus::Cancelled;
        execution.completed_at = Some(now);
        execution.updated_at = now;
        self.repo.save_execution(&execution).await?;
        tracing::info!(execution_id = %execution.id, "cancelled workflow execution");
        Ok(execution)
    }

    /// Cancel RUNNING executions that have not advanced for `older_than`.
    ///
    /// Returns the IDs of the executions that were cancelled.
    pub async fn abandon_idle(&self, older_than: Duration) -> Result<Vec<Uuid>, EngineError> {
        let cutoff = Utc::now() - older_than;
        let idle = self.repo.list_idle_executions(cutoff).await?;
        let mut abandoned = Vec::with_capacity(idle.len());
        for mut execution in idle {
            let now = Utc::now();
            execution.status = ExecutionStatus::Cancelled;
            execution.error_message = Some("abandoned after inactivity".to_string());
            execution.completed_at = Some(now);
            execution.updated_at = now;
            self.repo.save_execution(&execution).await?;
            abandoned.push(execution.id);
        }
        if !abandoned.is_empty() {
            tracing::info!(count = abandoned.len(), "abandoned idle executions");
        }
        Ok(abandoned)
    }

    pub async fn get_execution(&self, id: &Uuid) -> Result<WorkflowExecution, EngineError> {
        self.repo
            .get_execution(id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(*id))
    }

    pub async fn active_execution(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> Result<Option<WorkflowExecution>, EngineError> {
        Ok(self.repo.find_active_execution(tenant_id, session_id).await?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
