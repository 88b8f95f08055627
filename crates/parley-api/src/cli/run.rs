//! `parley run`: play a workflow file as a conversation in the terminal.
//!
//! The run uses a throwaway database, so nothing touches the real store.
//! CHOICE prompts become arrow-key selections and INPUT prompts become text
//! fields. With `--answer`, replies are taken from the list instead, which
//! makes the command usable in scripts.

use std::collections::VecDeque;
use std::path::Path;

use anyhow::{Context, Result};
use console::style;
use dialoguer::{Input, Select};
use serde_json::Value;

use parley_core::workflow::definition::load_workflow_file;
use parley_core::workflow::engine::TurnOutcome;
use parley_types::config::EngineConfig;
use parley_types::workflow::{ExecutionStatus, InputKind, TriggerEvent};

use crate::state::AppState;

/// Where replies come from.
enum ReplySource {
    Interactive,
    Scripted(VecDeque<String>),
}

impl ReplySource {
    fn next_reply(&mut self, outcome: &TurnOutcome) -> Result<Option<String>> {
        match self {
            ReplySource::Scripted(answers) => {
                let answer = answers.pop_front();
                if let Some(a) = &answer {
                    println!("  {} {a}", style(">").cyan().bold());
                }
                Ok(answer)
            }
            ReplySource::Interactive => prompt_reply(outcome).map(Some),
        }
    }
}

pub async fn run_file(
    config: EngineConfig,
    file: &Path,
    answers: Vec<String>,
    vars: Vec<(String, Value)>,
    json: bool,
) -> Result<()> {
    let def = load_workflow_file(file)
        .map_err(|e| anyhow::anyhow!("Failed to load {}: {e}", file.display()))?;

    let scratch = tempfile::tempdir().context("Failed to create scratch directory")?;
    let state = AppState::scratch(scratch.path(), config).await?;
    for warning in state.engine.register(&def).await? {
        if !json {
            println!("  {} {warning}", style("warning:").yellow().bold());
        }
    }

    let trigger = TriggerEvent {
        tenant_id: "local".to_string(),
        session_id: uuid::Uuid::now_v7().to_string(),
        user_identifier: "terminal".to_string(),
        variables: vars.into_iter().collect(),
    };

    let mut source = if answers.is_empty() && !json {
        ReplySource::Interactive
    } else {
        ReplySource::Scripted(answers.into())
    };

    let mut transcript = Vec::new();
    let mut outcome = state.engine.start(&def.id, trigger).await?;
    if !json {
        println!();
        println!("  {} {}", style("▶").green().bold(), style(&def.name).cyan().bold());
    }

    loop {
        if !json {
            render_turn(&outcome);
        }
        let waiting = outcome.awaiting().is_some();
        transcript.push(outcome);
        if !waiting {
            break;
        }

        let current = transcript.last().context("transcript is never empty here")?;
        let Some(reply) = source.next_reply(current)? else {
            if !json {
                println!(
                    "  {}",
                    style("(no more scripted answers; leaving the run paused)").dim()
                );
            }
            break;
        };
        outcome = state.engine.resume(&current.execution.id, &reply).await?;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&transcript)?);
        return Ok(());
    }

    if let Some(last) = transcript.last() {
        let exec = &last.execution;
        let status = match exec.status {
            ExecutionStatus::Completed => style(exec.status).green(),
            ExecutionStatus::Failed => style(exec.status).red(),
            _ => style(exec.status).yellow(),
        };
        println!();
        println!(
            "  {} {}  ({} steps executed)",
            style("■").dim(),
            status,
            exec.steps_completed
        );
        if let Some(err) = &exec.error_message {
            println!("  {}", style(err).red());
        }
        println!();
    }
    Ok(())
}

/// Print everything the turn emitted except a pending prompt, which the
/// reply widget shows instead.
fn render_turn(outcome: &TurnOutcome) {
    let mut messages: Vec<&str> = outcome.messages.iter().map(String::as_str).collect();
    if outcome.awaiting().is_some() {
        messages.pop();
    }
    for message in messages.into_iter().chain(outcome.closing_message.as_deref()) {
        println!();
        for line in message.lines() {
            println!("  {line}");
        }
    }
    if outcome.awaiting().is_some() {
        if let Some(err) = &outcome.result.error_message {
            println!();
            println!("  {}", style(err).red());
        }
    }
}

fn prompt_reply(outcome: &TurnOutcome) -> Result<String> {
    let result = &outcome.result;
    let prompt = result.output.clone().unwrap_or_default();
    println!();

    match result.input_required {
        Some(InputKind::Choice) if !result.options.is_empty() => {
            let items: Vec<&str> = result.options.iter().map(|o| o.text.as_str()).collect();
            let selection = Select::new()
                .with_prompt(prompt)
                .items(&items)
                .default(0)
                .interact()?;
            Ok(result.options[selection].value.clone())
        }
        _ => {
            let text: String = Input::new()
                .with_prompt(prompt)
                .allow_empty(true)
                .interact_text()?;
            Ok(text)
        }
    }
}
