//! CLI command definitions for the `parley` binary.
//!
//! Uses clap derive macros. Commands operate on the workflow store in the
//! data directory, except `validate` and `run`, which work on a file.

pub mod run;
pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Drive conversational workflows from the terminal.
#[derive(Parser)]
#[command(name = "parley", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit structured JSON log lines on stderr.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "PARLEY_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check a workflow file for errors and lint warnings.
    Validate {
        /// Path to the workflow YAML or JSON file.
        file: PathBuf,
    },

    /// Register (create or update) a workflow from a file.
    Register {
        /// Path to the workflow YAML or JSON file.
        file: PathBuf,
    },

    /// Register every workflow file found in a directory.
    Import {
        /// Directory to scan for `.yaml`, `.yml` and `.json` files.
        dir: PathBuf,
    },

    /// List registered workflows.
    #[command(alias = "ls")]
    Workflows,

    /// Remove a registered workflow and its executions.
    #[command(alias = "rm")]
    Delete {
        /// Workflow name or UUID.
        workflow: String,
    },

    /// Start a workflow for a conversation session.
    Start {
        /// Workflow name or UUID.
        workflow: String,

        /// Tenant that owns the conversation.
        #[arg(long, default_value = "default")]
        tenant: String,

        /// Conversation session identifier.
        #[arg(long)]
        session: String,

        /// Identifier of the user who triggered the run.
        #[arg(long, default_value = "cli")]
        user: String,

        /// Initial variable, as `key=value` (value parsed as JSON when valid).
        #[arg(long = "var", value_parser = workflow::parse_var)]
        vars: Vec<(String, serde_json::Value)>,
    },

    /// Send a reply to a paused execution.
    Reply {
        /// Execution UUID.
        execution: String,

        /// The reply text (an option value, text, or number for a choice).
        text: String,
    },

    /// Send a chat message to whatever execution is active in a session.
    Message {
        /// Conversation session identifier.
        session: String,

        /// The message text.
        text: String,

        #[arg(long, default_value = "default")]
        tenant: String,

        #[arg(long, default_value = "cli")]
        user: String,
    },

    /// Show an execution record.
    Show {
        /// Execution UUID.
        execution: String,
    },

    /// List executions for a tenant.
    Executions {
        #[arg(long, default_value = "default")]
        tenant: String,

        /// Restrict to one session.
        #[arg(long)]
        session: Option<String>,

        /// Maximum number of executions to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Cancel a running execution.
    Cancel {
        /// Execution UUID.
        execution: String,
    },

    /// Cancel running executions idle for longer than the given age.
    Abandon {
        /// Idle threshold in minutes.
        #[arg(long, default_value = "1440")]
        idle_minutes: i64,
    },

    /// Run a workflow file as an interactive conversation in the terminal.
    Run {
        /// Path to the workflow YAML or JSON file.
        file: PathBuf,

        /// Scripted reply, consumed in order instead of prompting.
        #[arg(long = "answer")]
        answers: Vec<String>,

        /// Initial variable, as `key=value`.
        #[arg(long = "var", value_parser = workflow::parse_var)]
        vars: Vec<(String, serde_json::Value)>,
    },

    /// Show the effective engine configuration.
    Config,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
