//! Workflow and execution subcommands.
//!
//! Definitions: validate, register, import, list, delete.
//! Executions: start, reply, message, show, list, cancel, abandon.

use std::path::Path;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;
use uuid::Uuid;

use parley_core::repository::workflow::WorkflowRepository;
use parley_core::workflow::definition::{discover_workflows, lint_definition, load_workflow_file};
use parley_core::workflow::engine::TurnOutcome;
use parley_core::workflow::error::WorkflowError;
use parley_types::workflow::{ExecutionStatus, TriggerEvent, Variables, WorkflowExecution};

use crate::state::AppState;

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

/// Parse a `key=value` pair. The value is taken as JSON when it parses
/// (`42`, `true`, `{"a":1}`), otherwise as a plain string.
pub fn parse_var(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty variable name in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn parse_execution_id(raw: &str) -> Result<Uuid> {
    raw.parse::<Uuid>()
        .with_context(|| format!("'{raw}' is not a valid execution ID"))
}

fn load_file(file: &Path) -> Result<parley_types::workflow::WorkflowDefinition> {
    load_workflow_file(file).map_err(|e| match e {
        WorkflowError::ParseError(msg) => anyhow::anyhow!("Failed to parse workflow: {msg}"),
        WorkflowError::ValidationError(msg) => anyhow::anyhow!("Workflow validation failed: {msg}"),
        WorkflowError::IoError(err) => {
            anyhow::anyhow!("Failed to read {}: {err}", file.display())
        }
        other => anyhow::anyhow!("Failed to load workflow: {other}"),
    })
}

// ---------------------------------------------------------------------------
// Output helpers
// ---------------------------------------------------------------------------

fn status_cell(status: ExecutionStatus) -> Cell {
    let color = match status {
        ExecutionStatus::Running => Color::Yellow,
        ExecutionStatus::Completed => Color::Green,
        ExecutionStatus::Failed => Color::Red,
        ExecutionStatus::Cancelled => Color::DarkGrey,
    };
    Cell::new(status).fg(color)
}

fn styled_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Running => style(status).yellow().to_string(),
        ExecutionStatus::Completed => style(status).green().to_string(),
        ExecutionStatus::Failed => style(status).red().to_string(),
        ExecutionStatus::Cancelled => style(status).dim().to_string(),
    }
}

/// Print a turn's reply text and the resulting execution state.
pub fn print_outcome(outcome: &TurnOutcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }

    println!();
    for line in outcome.reply_text().lines() {
        println!("  {line}");
    }
    println!();
    println!(
        "  {} {}  {}",
        style("execution").dim(),
        outcome.execution.id,
        styled_status(outcome.status())
    );
    if let Some(kind) = outcome.awaiting() {
        println!(
            "  {}",
            style(format!(
                "Waiting for {kind:?} reply: parley reply {} <text>",
                outcome.execution.id
            ))
            .dim()
        );
    }
    println!();
    Ok(())
}

fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        println!("  {} {warning}", style("warning:").yellow().bold());
    }
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// Parse and lint a file without touching the store.
pub fn validate(file: &Path, json: bool) -> Result<()> {
    let def = load_file(file)?;
    let warnings = lint_definition(&def);

    if json {
        let out = serde_json::json!({
            "valid": true,
            "name": def.name,
            "steps": def.steps.len(),
            "warnings": warnings,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} '{}' is valid ({} steps)",
        style("✓").green().bold(),
        style(&def.name).cyan(),
        def.steps.len()
    );
    print_warnings(&warnings);
    println!();
    Ok(())
}

/// Register a file, keeping the stored ID when a workflow of the same name exists.
pub async fn register(state: &AppState, file: &Path, json: bool) -> Result<()> {
    let mut def = load_file(file)?;
    if let Some(existing) = state
        .engine
        .repository()
        .get_definition_by_name(&def.name)
        .await
        .context("Failed to look up existing workflow")?
    {
        def.id = existing.id;
    }

    let warnings = state
        .engine
        .register(&def)
        .await
        .context("Failed to register workflow")?;

    if json {
        let out = serde_json::json!({
            "id": def.id.to_string(),
            "name": def.name,
            "steps": def.steps.len(),
            "warnings": warnings,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} Registered workflow '{}'",
            style("*").green().bold(),
            style(&def.name).cyan()
        );
        println!("  ID: {}", def.id);
        println!("  Steps: {}", def.steps.len());
        print_warnings(&warnings);
        println!();
    }
    Ok(())
}

/// Register every valid workflow file under `dir`.
pub async fn import(state: &AppState, dir: &Path, json: bool) -> Result<()> {
    let found = discover_workflows(dir)
        .with_context(|| format!("Failed to scan {}", dir.display()))?;

    let mut imported = Vec::with_capacity(found.len());
    for (path, mut def) in found {
        if let Some(existing) = state
            .engine
            .repository()
            .get_definition_by_name(&def.name)
            .await?
        {
            def.id = existing.id;
        }
        match state.engine.register(&def).await {
            Ok(warnings) => imported.push((path, def, warnings)),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to import workflow"),
        }
    }

    if json {
        let out: Vec<_> = imported
            .iter()
            .map(|(path, def, warnings)| {
                serde_json::json!({
                    "path": path.display().to_string(),
                    "id": def.id.to_string(),
                    "name": def.name,
                    "warnings": warnings,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    if imported.is_empty() {
        println!("  No workflow files found in {}.", dir.display());
    }
    for (path, def, warnings) in &imported {
        println!(
            "  {} {} {}",
            style("*").green().bold(),
            style(&def.name).cyan(),
            style(path.display()).dim()
        );
        print_warnings(warnings);
    }
    println!();
    Ok(())
}

pub async fn list_workflows(state: &AppState, json: bool) -> Result<()> {
    let defs = state
        .engine
        .repository()
        .list_definitions()
        .await
        .context("Failed to list workflows")?;

    if json {
        let out: Vec<_> = defs
            .iter()
            .map(|d| {
                serde_json::json!({
                    "id": d.id.to_string(),
                    "name": d.name,
                    "description": d.description,
                    "steps": d.steps.len(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if defs.is_empty() {
        println!();
        println!("  No workflows registered.");
        println!(
            "  Register one with: {}",
            style("parley register <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Steps"),
            Cell::new("Description"),
            Cell::new("ID"),
        ]);
    for d in &defs {
        table.add_row(vec![
            Cell::new(&d.name),
            Cell::new(d.steps.len()),
            Cell::new(d.description.as_deref().unwrap_or("")),
            Cell::new(d.id),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

pub async fn delete_workflow(state: &AppState, workflow: &str, json: bool) -> Result<()> {
    let def = state.engine.find_definition(workflow).await?;
    let deleted = state
        .engine
        .repository()
        .delete_definition(&def.id)
        .await
        .context("Failed to delete workflow")?;

    if json {
        let out = serde_json::json!({ "id": def.id.to_string(), "deleted": deleted });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!("  Deleted workflow '{}'.", style(&def.name).cyan());
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

pub async fn start(
    state: &AppState,
    workflow: &str,
    trigger: TriggerEvent,
    json: bool,
) -> Result<()> {
    let def = state.engine.find_definition(workflow).await?;
    let outcome = state
        .engine
        .start(&def.id, trigger)
        .await
        .with_context(|| format!("Failed to start workflow '{}'", def.name))?;
    print_outcome(&outcome, json)
}

/// Build a trigger from CLI arguments.
pub fn trigger_from_args(
    tenant: String,
    session: String,
    user: String,
    vars: Vec<(String, Value)>,
) -> TriggerEvent {
    TriggerEvent {
        tenant_id: tenant,
        session_id: session,
        user_identifier: user,
        variables: vars.into_iter().collect::<Variables>(),
    }
}

pub async fn reply(state: &AppState, execution: &str, text: &str, json: bool) -> Result<()> {
    let id = parse_execution_id(execution)?;
    let outcome = state.engine.resume(&id, text).await?;
    print_outcome(&outcome, json)
}

pub async fn message(
    state: &AppState,
    tenant: &str,
    session: &str,
    user: &str,
    text: &str,
    json: bool,
) -> Result<()> {
    match state.engine.handle_message(tenant, session, user, text).await? {
        Some(outcome) => print_outcome(&outcome, json),
        None => {
            if json {
                println!("null");
            } else {
                println!();
                println!(
                    "  No active workflow in session '{}' (tenant '{}').",
                    style(session).cyan(),
                    tenant
                );
                println!();
            }
            Ok(())
        }
    }
}

pub async fn show(state: &AppState, execution: &str, json: bool) -> Result<()> {
    let id = parse_execution_id(execution)?;
    let exec = state.engine.get_execution(&id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&exec)?);
        return Ok(());
    }

    let workflow_name = state
        .engine
        .definition(&exec.workflow_id)
        .await
        .map(|d| d.name)
        .unwrap_or_else(|_| exec.workflow_id.to_string());

    println!();
    println!("  {} {}", style("Execution").bold(), exec.id);
    println!("  Workflow:     {}", style(workflow_name).cyan());
    println!("  Status:       {}", styled_status(exec.status));
    println!("  Tenant:       {}", exec.tenant_id);
    println!("  Session:      {}", exec.session_id);
    println!("  User:         {}", exec.user_identifier);
    println!(
        "  Progress:     {} steps executed ({} defined)",
        exec.steps_completed, exec.total_steps
    );
    if let Some(step) = &exec.current_step_id {
        println!("  Current step: {step}");
    }
    if let Some(err) = &exec.error_message {
        println!("  Error:        {}", style(err).red());
    }
    println!("  Started:      {}", exec.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  Updated:      {}", exec.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(done) = exec.completed_at {
        println!("  Finished:     {}", done.format("%Y-%m-%d %H:%M:%S UTC"));
    }

    if !exec.variables.is_empty() {
        let mut names: Vec<&String> = exec.variables.keys().collect();
        names.sort();
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![Cell::new("Variable").fg(Color::Cyan), Cell::new("Value")]);
        for name in names {
            let value = match &exec.variables[name] {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            table.add_row(vec![Cell::new(name), Cell::new(value)]);
        }
        println!();
        println!("{table}");
    }
    println!();
    Ok(())
}

pub async fn list_executions(
    state: &AppState,
    tenant: &str,
    session: Option<&str>,
    limit: u32,
    json: bool,
) -> Result<()> {
    let executions = state
        .engine
        .repository()
        .list_executions(tenant, session, limit)
        .await
        .context("Failed to list executions")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&executions)?);
        return Ok(());
    }

    if executions.is_empty() {
        println!();
        println!("  No executions for tenant '{tenant}'.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Execution").fg(Color::Cyan),
            Cell::new("Session"),
            Cell::new("Status"),
            Cell::new("Step"),
            Cell::new("Steps"),
            Cell::new("Updated"),
        ]);
    for e in &executions {
        table.add_row(execution_row(e));
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn execution_row(e: &WorkflowExecution) -> Vec<Cell> {
    vec![
        Cell::new(e.id),
        Cell::new(&e.session_id),
        status_cell(e.status),
        Cell::new(e.current_step_id.as_deref().unwrap_or("-")),
        Cell::new(e.steps_completed),
        Cell::new(e.updated_at.format("%Y-%m-%d %H:%M")),
    ]
}

pub async fn cancel(state: &AppState, execution: &str, json: bool) -> Result<()> {
    let id = parse_execution_id(execution)?;
    let exec = state.engine.cancel(&id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&exec)?);
    } else {
        println!();
        println!(
            "  {} Cancelled execution {}",
            style("*").yellow().bold(),
            exec.id
        );
        println!();
    }
    Ok(())
}

pub async fn abandon(state: &AppState, idle_minutes: i64, json: bool) -> Result<()> {
    if idle_minutes <= 0 {
        bail!("--idle-minutes must be positive");
    }
    let ids = state
        .engine
        .abandon_idle(chrono::Duration::minutes(idle_minutes))
        .await?;

    if json {
        let out: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  Abandoned {} execution(s) idle for more than {idle_minutes} minutes.",
            ids.len()
        );
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_var_plain_string() {
        let (k, v) = parse_var("name=Ada Lovelace").unwrap();
        assert_eq!(k, "name");
        assert_eq!(v, json!("Ada Lovelace"));
    }

    #[test]
    fn parse_var_json_values() {
        assert_eq!(parse_var("n=42").unwrap().1, json!(42));
        assert_eq!(parse_var("ok=true").unwrap().1, json!(true));
        assert_eq!(
            parse_var(r#"user={"tier":"gold"}"#).unwrap().1,
            json!({ "tier": "gold" })
        );
    }

    #[test]
    fn parse_var_keeps_equals_in_value() {
        let (k, v) = parse_var("expr=a=b").unwrap();
        assert_eq!(k, "expr");
        assert_eq!(v, json!("a=b"));
    }

    #[test]
    fn parse_var_rejects_malformed() {
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=x").is_err());
    }

    #[test]
    fn trigger_from_args_collects_vars() {
        let trigger = trigger_from_args(
            "acme".to_string(),
            "s1".to_string(),
            "ada".to_string(),
            vec![("plan".to_string(), json!("pro"))],
        );
        assert_eq!(trigger.tenant_id, "acme");
        assert_eq!(trigger.variables["plan"], json!("pro"));
    }

    #[test]
    fn parse_execution_id_reports_bad_input() {
        let err = parse_execution_id("not-a-uuid").unwrap_err();
        assert!(err.to_string().contains("not-a-uuid"));
    }
}
