//! Workflow domain types for Parley.
//!
//! Defines the static definition model (`WorkflowDefinition`, `WorkflowStep`,
//! `StepKind`), the durable execution record (`WorkflowExecution`) that is
//! resumed once per user turn, and the per-step result handed back to the
//! chat layer (`StepExecutionResult`).

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::ActionFailurePolicy;

/// Name -> value map carried by an execution across turns.
pub type Variables = HashMap<String, Value>;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A conversational workflow: a directed graph of typed steps.
///
/// Steps are kept in authoring order; the first step is the entry point.
/// Successor references are validated once, before any execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7 assigned when the definition is first loaded.
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Trigger specification. Opaque to the engine; the trigger matcher owns it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<Value>,
    /// Ordered steps with unique IDs.
    pub steps: Vec<WorkflowStep>,
    /// Declared variable names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<String>,
    /// Per-workflow settings.
    #[serde(default)]
    pub settings: WorkflowSettings,
}

impl WorkflowDefinition {
    /// Look up a step by ID.
    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// The entry step (first in authoring order).
    pub fn first_step(&self) -> Option<&WorkflowStep> {
        self.steps.first()
    }

    /// Reference step count recorded on executions as a sanity bound.
    pub fn total_steps(&self) -> u32 {
        u32::try_from(self.steps.len()).unwrap_or(u32::MAX)
    }
}

/// Optional per-workflow overrides and chat-facing messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Sent when a run completes without having emitted any message that turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_message: Option<String>,
    /// Sent when a run fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    /// Overrides `EngineConfig::max_steps_per_turn` for this workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps_per_turn: Option<u32>,
    /// Overrides `EngineConfig::action_failure_policy` for this workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_action_error: Option<ActionFailurePolicy>,
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// A single node of the workflow graph.
///
/// The kind-specific payload is flattened so a step reads naturally in YAML:
/// ```yaml
/// - id: ask-color
///   name: Ask color
///   type: CHOICE
///   content: "Pick a color, {{user.name}}"
///   variable: color
///   options:
///     - { text: Red, value: red, next_step: red-path }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Step ID, unique within a workflow.
    pub id: String,
    /// Human-readable step name.
    #[serde(default)]
    pub name: String,
    /// Kind tag plus kind-specific fields.
    #[serde(flatten)]
    pub kind: StepKind,
}

impl WorkflowStep {
    pub fn step_type(&self) -> StepType {
        self.kind.step_type()
    }
}

/// Kind-specific step payload, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    /// Send a templated message; never waits for the user.
    Message {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_step: Option<String>,
    },
    /// Present options and wait for a selection.
    Choice {
        #[serde(default)]
        content: String,
        variable: String,
        options: Vec<ChoiceOption>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_step: Option<String>,
    },
    /// Prompt for free text and wait for the reply.
    Input {
        #[serde(default)]
        content: String,
        variable: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_step: Option<String>,
    },
    /// Branch on a boolean expression.
    Condition {
        condition: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        true_step: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        false_step: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_step: Option<String>,
    },
    /// Invoke a registered action handler with templated params.
    Action {
        action: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        params: HashMap<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_step: Option<String>,
    },
}

impl StepKind {
    pub fn step_type(&self) -> StepType {
        match self {
            StepKind::Message { .. } => StepType::Message,
            StepKind::Choice { .. } => StepType::Choice,
            StepKind::Input { .. } => StepType::Input,
            StepKind::Condition { .. } => StepType::Condition,
            StepKind::Action { .. } => StepType::Action,
        }
    }

    /// The linear successor shared by every kind.
    pub fn next_step(&self) -> Option<&str> {
        match self {
            StepKind::Message { next_step, .. }
            | StepKind::Choice { next_step, .. }
            | StepKind::Input { next_step, .. }
            | StepKind::Condition { next_step, .. }
            | StepKind::Action { next_step, .. } => next_step.as_deref(),
        }
    }

    /// Every step ID this step can route to, in declaration order.
    pub fn references(&self) -> Vec<&str> {
        let mut refs: Vec<&str> = Vec::new();
        match self {
            StepKind::Choice { options, .. } => {
                refs.extend(options.iter().filter_map(|o| o.next_step.as_deref()));
            }
            StepKind::Condition {
                true_step,
                false_step,
                ..
            } => {
                refs.extend(true_step.as_deref());
                refs.extend(false_step.as_deref());
            }
            _ => {}
        }
        refs.extend(self.next_step());
        refs
    }
}

/// Discriminant of `StepKind`, used in results, logs and persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    Message,
    Choice,
    Input,
    Condition,
    Action,
}

impl StepType {
    /// CHOICE and INPUT may pause the loop awaiting a reply.
    pub fn is_interactive(self) -> bool {
        matches!(self, StepType::Choice | StepType::Input)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepType::Message => "MESSAGE",
            StepType::Choice => "CHOICE",
            StepType::Input => "INPUT",
            StepType::Condition => "CONDITION",
            StepType::Action => "ACTION",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One selectable option of a CHOICE step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChoiceOption {
    /// Display text (templated).
    pub text: String,
    /// Value written into the step's variable when selected.
    pub value: String,
    /// Successor when selected; falls back to the step's `next_step`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,
}

// ---------------------------------------------------------------------------
// Execution record
// ---------------------------------------------------------------------------

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(ExecutionStatus::Running),
            "COMPLETED" => Ok(ExecutionStatus::Completed),
            "FAILED" => Ok(ExecutionStatus::Failed),
            "CANCELLED" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("invalid execution status: '{other}'")),
        }
    }
}

/// Durable state of one run of a definition for one conversation session.
///
/// Mutated only by the workflow executor, once per turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// UUIDv7 execution ID.
    pub id: Uuid,
    /// Definition being executed.
    pub workflow_id: Uuid,
    pub tenant_id: String,
    pub session_id: String,
    pub user_identifier: String,
    pub status: ExecutionStatus,
    /// Incremented exactly once per executed step. Never decremented.
    pub steps_completed: u32,
    /// Step count of the definition when the run started (sanity bound only).
    pub total_steps: u32,
    /// Step the run is parked on (awaiting input) or will start from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    /// Create a fresh RUNNING execution for a trigger event.
    pub fn new(definition: &WorkflowDefinition, trigger: &TriggerEvent) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow_id: definition.id,
            tenant_id: trigger.tenant_id.clone(),
            session_id: trigger.session_id.clone(),
            user_identifier: trigger.user_identifier.clone(),
            status: ExecutionStatus::Running,
            steps_completed: 0,
            total_steps: definition.total_steps(),
            current_step_id: definition.first_step().map(|s| s.id.clone()),
            variables: Variables::new(),
            error_message: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ExecutionStatus::Running
    }
}

/// Inbound event that starts a run, produced by the trigger matcher.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub tenant_id: String,
    pub session_id: String,
    pub user_identifier: String,
    /// Initial variables (e.g. captured from the triggering message).
    #[serde(default)]
    pub variables: Variables,
}

// ---------------------------------------------------------------------------
// Resumption
// ---------------------------------------------------------------------------

/// The user's answer to the interactive step a run is parked on.
///
/// Threaded into the loop for exactly one turn and consumed by the step it
/// names; it never enters the durable variables map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePayload {
    /// ID of the CHOICE/INPUT step being answered.
    pub step_id: String,
    pub reply: Reply,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Reply {
    /// A choice selection (option value, option text, or 1-based index).
    Selection(String),
    /// Free text for an INPUT step.
    Text(String),
}

impl Reply {
    pub fn as_str(&self) -> &str {
        match self {
            Reply::Selection(s) | Reply::Text(s) => s,
        }
    }
}

impl ResumePayload {
    pub fn selection(step_id: impl Into<String>, selection: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            reply: Reply::Selection(selection.into()),
        }
    }

    pub fn text(step_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            reply: Reply::Text(text.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Step results
// ---------------------------------------------------------------------------

/// What kind of reply a paused step is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Choice,
    Input,
}

/// A CHOICE option as rendered for the chat layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedOption {
    /// 1-based position, accepted as a reply.
    pub index: usize,
    pub text: String,
    pub value: String,
}

/// Outcome of executing one step.
///
/// Step executors return this and never touch the execution record; the
/// loop applies `variable_updates` and routes on `next_step_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionResult {
    pub success: bool,
    pub step_id: String,
    /// `None` only when `step_id` could not be resolved in the definition.
    pub step_type: Option<StepType>,
    pub next_step_id: Option<String>,
    pub workflow_completed: bool,
    pub input_required: Option<InputKind>,
    pub error_message: Option<String>,
    /// Rendered message text or prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Rendered options when presenting a CHOICE.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<RenderedOption>,
    /// Variable writes for the loop to apply.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variable_updates: Variables,
}

impl StepExecutionResult {
    /// A successful result routing to `next_step_id` (completing the run when `None`).
    pub fn advance(step: &WorkflowStep, next_step_id: Option<String>) -> Self {
        Self {
            success: true,
            step_id: step.id.clone(),
            step_type: Some(step.step_type()),
            workflow_completed: next_step_id.is_none(),
            next_step_id,
            input_required: None,
            error_message: None,
            output: None,
            options: Vec::new(),
            variable_updates: Variables::new(),
        }
    }

    /// A result that parks the run on `step` until the user replies.
    pub fn await_input(step: &WorkflowStep, kind: InputKind, prompt: String) -> Self {
        Self {
            success: true,
            step_id: step.id.clone(),
            step_type: Some(step.step_type()),
            next_step_id: None,
            workflow_completed: false,
            input_required: Some(kind),
            error_message: None,
            output: Some(prompt),
            options: Vec::new(),
            variable_updates: Variables::new(),
        }
    }

    /// A terminal failure not tied to a resolvable step.
    pub fn failure(step_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            step_id: step_id.into(),
            step_type: None,
            next_step_id: None,
            workflow_completed: false,
            input_required: None,
            error_message: Some(error.into()),
            output: None,
            options: Vec::new(),
            variable_updates: Variables::new(),
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.input_required.is_some()
    }

    /// Chat-ready text: the output followed by numbered options, if any.
    pub fn rendered_text(&self) -> Option<String> {
        let mut text = self.output.clone().unwrap_or_default();
        if let Some(err) = self.error_message.as_deref().filter(|_| self.is_waiting()) {
            text = if text.is_empty() {
                format!("({err})")
            } else {
                format!("({err})\n{text}")
            };
        }
        for opt in &self.options {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&format!("{}. {}", opt.index, opt.text));
        }
        (!text.is_empty()).then_some(text)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
