//! Built-in action handlers.
//!
//! Two side-effect-free handlers that every deployment gets:
//! - `set_variables`: returns its (already template-resolved) params as
//!   variable updates.
//! - `log`: emits a tracing event carrying the `message` param.
//!
//! Deployments add their own handlers to the registry returned by
//! [`builtin_registry`].

use std::collections::HashMap;
use std::sync::Arc;

use parley_core::workflow::action::{ActionError, ActionFuture, ActionHandler, ActionRegistry};
use parley_types::workflow::Variables;
use serde_json::Value;
use uuid::Uuid;

/// Writes every param into the run's variables.
///
/// Dotted param names (`profile.tier`) are applied as nested writes by the
/// executor.
#[derive(Debug, Default)]
pub struct SetVariablesAction;

impl ActionHandler for SetVariablesAction {
    fn execute<'a>(
        &'a self,
        _action_type: &'a str,
        params: &'a HashMap<String, Value>,
        _variables: &'a Variables,
        _tenant_id: &'a str,
        _execution_id: Uuid,
    ) -> ActionFuture<'a> {
        Box::pin(async move {
            if params.is_empty() {
                return Err(ActionError::InvalidParams(
                    "set_variables needs at least one param".to_string(),
                ));
            }
            Ok(params.clone())
        })
    }
}

/// Emits the `message` param as a tracing event.
///
/// An optional `level` param (`debug`, `info`, `warn`, `error`) picks the
/// event level; defaults to `info`. Produces no variable updates.
#[derive(Debug, Default)]
pub struct LogAction;

impl ActionHandler for LogAction {
    fn execute<'a>(
        &'a self,
        _action_type: &'a str,
        params: &'a HashMap<String, Value>,
        _variables: &'a Variables,
        tenant_id: &'a str,
        execution_id: Uuid,
    ) -> ActionFuture<'a> {
        Box::pin(async move {
            let message = match params.get("message") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => {
                    return Err(ActionError::InvalidParams(
                        "log requires a 'message' param".to_string(),
                    ));
                }
            };

            let level = params
                .get("level")
                .and_then(Value::as_str)
                .unwrap_or("info")
                .to_ascii_lowercase();

            match level.as_str() {
                "debug" => tracing::debug!(execution_id = %execution_id, tenant_id, "{message}"),
                "info" => tracing::info!(execution_id = %execution_id, tenant_id, "{message}"),
                "warn" => tracing::warn!(execution_id = %execution_id, tenant_id, "{message}"),
                "error" => tracing::error!(execution_id = %execution_id, tenant_id, "{message}"),
                other => {
                    return Err(ActionError::InvalidParams(format!(
                        "unknown log level '{other}'"
                    )));
                }
            }

            Ok(Variables::new())
        })
    }
}

/// A registry preloaded with the built-in handlers.
pub fn builtin_registry() -> ActionRegistry {
    ActionRegistry::new()
        .with("set_variables", Arc::new(SetVariablesAction))
        .with("log", Arc::new(LogAction))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_builtin_registry_names() {
        assert_eq!(builtin_registry().names(), vec!["log", "set_variables"]);
    }

    #[tokio::test]
    async fn test_set_variables_returns_params() {
        let registry = builtin_registry();
        let p = params(&[("plan", json!("pro")), ("profile.tier", json!(2))]);
        let out = registry
            .execute("set_variables", &p, &Variables::new(), "acme", Uuid::now_v7())
            .await
            .unwrap();
        assert_eq!(out, p);
    }

    #[tokio::test]
    async fn test_set_variables_rejects_empty_params() {
        let err = builtin_registry()
            .execute(
                "set_variables",
                &HashMap::new(),
                &Variables::new(),
                "acme",
                Uuid::now_v7(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn test_log_requires_message() {
        let registry = builtin_registry();
        let ok = registry
            .execute(
                "log",
                &params(&[("message", json!("hello")), ("level", json!("WARN"))]),
                &Variables::new(),
                "acme",
                Uuid::now_v7(),
            )
            .await
            .unwrap();
        assert!(ok.is_empty());

        let err = registry
            .execute("log", &HashMap::new(), &Variables::new(), "acme", Uuid::now_v7())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("message"));

        let err = registry
            .execute(
                "log",
                &params(&[("message", json!("x")), ("level", json!("loud"))]),
                &Variables::new(),
                "acme",
                Uuid::now_v7(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("loud"));
    }
}
