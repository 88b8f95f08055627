//! Workflow error types.

use thiserror::Error;

/// Errors that can occur while loading or running a workflow.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure. Raised before any execution.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// The cursor named a step that does not exist in the definition.
    #[error("unknown step '{0}'")]
    UnknownStep(String),

    /// A condition expression could not be parsed.
    #[error("condition error: {0}")]
    ConditionEvaluationError(String),

    /// An ACTION step's handler failed or was not registered.
    #[error("action '{action}' failed: {message}")]
    ActionExecutionError { action: String, message: String },

    /// The per-turn step ceiling was reached.
    #[error("infinite loop detected: exceeded {max_steps} steps in a single turn")]
    LoopSafetyExceeded { max_steps: u32 },

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_safety_message_mentions_infinite_loop() {
        let err = WorkflowError::LoopSafetyExceeded { max_steps: 5 };
        let msg = err.to_string();
        assert!(msg.contains("infinite loop"), "got: {msg}");
        assert!(msg.contains('5'));
    }

    #[test]
    fn test_unknown_step_message() {
        let err = WorkflowError::UnknownStep("ghost".to_string());
        assert_eq!(err.to_string(), "unknown step 'ghost'");
    }
}
