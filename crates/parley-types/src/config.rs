//! Engine configuration types for Parley.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls the
//! per-turn loop ceiling and the policies the engine applies when an action
//! fails or a template path cannot be resolved.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine.
///
/// Loaded from `~/.parley/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of steps auto-executed within a single turn before the
    /// run is failed as an infinite loop.
    #[serde(default = "default_max_steps_per_turn")]
    pub max_steps_per_turn: u32,

    /// What happens to the whole run when an ACTION handler fails.
    #[serde(default)]
    pub action_failure_policy: ActionFailurePolicy,

    /// How `{{path}}` placeholders that cannot be resolved are rendered.
    #[serde(default)]
    pub unresolved_templates: UnresolvedTemplatePolicy,

    /// Database URL override (defaults to `{data_dir}/parley.db`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
}

fn default_max_steps_per_turn() -> u32 {
    50
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps_per_turn: default_max_steps_per_turn(),
            action_failure_policy: ActionFailurePolicy::default(),
            unresolved_templates: UnresolvedTemplatePolicy::default(),
            database_url: None,
        }
    }
}

impl EngineConfig {
    /// The loop ceiling actually applied. A ceiling of zero would fail every
    /// run before its first step, so it is floored at 1.
    pub fn effective_max_steps(&self) -> u32 {
        self.max_steps_per_turn.max(1)
    }
}

/// Policy applied when an ACTION step's handler fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionFailurePolicy {
    /// The run becomes FAILED with the handler's error message.
    #[default]
    FailExecution,
    /// The step is recorded as failed and the run continues along `next_step`.
    Continue,
}

/// Rendering policy for template placeholders whose path does not resolve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedTemplatePolicy {
    /// Render as the empty string (a diagnostic is logged).
    #[default]
    Empty,
    /// Leave the `{{path}}` placeholder in the output verbatim.
    Keep,
}
