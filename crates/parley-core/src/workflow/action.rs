//! Action handler boundary and the injected registry ACTION steps call through.
//!
//! Handlers are black boxes: they receive the step's resolved params plus a
//! read-only view of the run's variables and return a map of variable
//! updates. The registry is built by the caller and handed to the engine,
//! so there is no global lookup table.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parley_types::workflow::Variables;
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors an action invocation can produce.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// No handler is registered under this name.
    #[error("unknown action '{0}'")]
    UnknownAction(String),

    /// The handler rejected its params.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// The handler ran and failed.
    #[error("{0}")]
    Failed(String),
}

/// Boxed future returned by [`ActionHandler::execute`].
pub type ActionFuture<'a> = Pin<Box<dyn Future<Output = Result<Variables, ActionError>> + Send + 'a>>;

// ---------------------------------------------------------------------------
// ActionHandler
// ---------------------------------------------------------------------------

/// A named side effect an ACTION step can invoke.
///
/// Object-safe (boxed future) so handlers of different types can share one
/// registry.
pub trait ActionHandler: Send + Sync {
    /// Run the action. The returned map is merged into the run's variables.
    fn execute<'a>(
        &'a self,
        action_type: &'a str,
        params: &'a HashMap<String, Value>,
        variables: &'a Variables,
        tenant_id: &'a str,
        execution_id: Uuid,
    ) -> ActionFuture<'a>;

    /// Whether invoking the action twice has the same effect as once.
    ///
    /// Non-idempotent invocations are logged so a caller that retries a
    /// turn can audit duplicate side effects.
    fn idempotent(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// ActionRegistry
// ---------------------------------------------------------------------------

/// Name -> handler table.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `name`.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        let name = name.into();
        if self.handlers.insert(name.clone(), handler).is_some() {
            tracing::debug!(action = %name, "replaced action handler");
        }
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) -> Self {
        self.register(name, handler);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered action names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Look up and invoke the handler registered for `action`.
    pub async fn execute(
        &self,
        action: &str,
        params: &HashMap<String, Value>,
        variables: &Variables,
        tenant_id: &str,
        execution_id: Uuid,
    ) -> Result<Variables, ActionError> {
        let handler = self
            .handlers
            .get(action)
            .ok_or_else(|| ActionError::UnknownAction(action.to_string()))?;

        if !handler.idempotent() {
            tracing::info!(
                action,
                execution_id = %execution_id,
                tenant_id,
                "invoking non-idempotent action"
            );
        }

        handler
            .execute(action, params, variables, tenant_id, execution_id)
            .await
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo {
        calls: AtomicUsize,
    }

    impl ActionHandler for Echo {
        fn execute<'a>(
            &'a self,
            action_type: &'a str,
            params: &'a HashMap<String, Value>,
            variables: &'a Variables,
            tenant_id: &'a str,
            _execution_id: Uuid,
        ) -> ActionFuture<'a> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let mut out = Variables::new();
                out.insert("action".to_string(), json!(action_type));
                out.insert("tenant".to_string(), json!(tenant_id));
                out.insert("params".to_string(), json!(params));
                out.insert("seen".to_string(), json!(variables.len()));
                Ok(out)
            })
        }
    }

    struct Broken;

    impl ActionHandler for Broken {
        fn execute<'a>(
            &'a self,
            _action_type: &'a str,
            _params: &'a HashMap<String, Value>,
            _variables: &'a Variables,
            _tenant_id: &'a str,
            _execution_id: Uuid,
        ) -> ActionFuture<'a> {
            Box::pin(async { Err(ActionError::Failed("smtp unreachable".to_string())) })
        }

        fn idempotent(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_registry_dispatches_by_name() {
        let echo = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let registry = ActionRegistry::new().with("echo", echo.clone());

        let mut params = HashMap::new();
        params.insert("to".to_string(), json!("ada"));
        let mut variables = Variables::new();
        variables.insert("x".to_string(), json!(1));

        let out = registry
            .execute("echo", &params, &variables, "acme", Uuid::now_v7())
            .await
            .unwrap();
        assert_eq!(out["action"], json!("echo"));
        assert_eq!(out["tenant"], json!("acme"));
        assert_eq!(out["params"], json!({ "to": "ada" }));
        assert_eq!(out["seen"], json!(1));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_action_is_error() {
        let registry = ActionRegistry::new();
        let err = registry
            .execute("nope", &HashMap::new(), &Variables::new(), "t", Uuid::now_v7())
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::UnknownAction(ref n) if n == "nope"));
        assert_eq!(err.to_string(), "unknown action 'nope'");
    }

    #[tokio::test]
    async fn test_handler_failure_propagates() {
        let registry = ActionRegistry::new().with("send", Arc::new(Broken));
        let err = registry
            .execute("send", &HashMap::new(), &Variables::new(), "t", Uuid::now_v7())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "smtp unreachable");
    }

    #[test]
    fn test_names_sorted() {
        let registry = ActionRegistry::new()
            .with("zeta", Arc::new(Broken))
            .with("alpha", Arc::new(Broken));
        assert_eq!(registry.names(), vec!["alpha", "zeta"]);
        assert!(registry.contains("alpha"));
        assert!(!registry.contains("beta"));
    }
}
