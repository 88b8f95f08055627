//! Parley CLI entry point.
//!
//! Binary name: `parley`
//!
//! Parses CLI arguments, sets up tracing, opens the workflow store, then
//! dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;
use console::style;
use parley_observe::tracing_setup::{LogFormat, TracingOptions, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,parley=debug",
        _ => "trace",
    };
    init_tracing(&TracingOptions {
        default_filter: default_filter.to_string(),
        format: if cli.log_json { LogFormat::Json } else { LogFormat::Pretty },
        enable_otel: cli.otel,
    })
    .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let json = cli.json;

    // Commands that need no store.
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(*shell, &mut cmd, "parley", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { file } => return cli::workflow::validate(file, json),
        _ => {}
    }

    if let Commands::Run { file, answers, vars } = cli.command {
        let data_dir = parley_infra::config::resolve_data_dir();
        let config = parley_infra::config::load_engine_config(&data_dir).await;
        return cli::run::run_file(config, &file, answers, vars, json).await;
    }

    let state = AppState::init().await?;

    match cli.command {
        Commands::Register { file } => cli::workflow::register(&state, &file, json).await?,
        Commands::Import { dir } => cli::workflow::import(&state, &dir, json).await?,
        Commands::Workflows => cli::workflow::list_workflows(&state, json).await?,
        Commands::Delete { workflow } => {
            cli::workflow::delete_workflow(&state, &workflow, json).await?
        }
        Commands::Start {
            workflow,
            tenant,
            session,
            user,
            vars,
        } => {
            let trigger = cli::workflow::trigger_from_args(tenant, session, user, vars);
            cli::workflow::start(&state, &workflow, trigger, json).await?
        }
        Commands::Reply { execution, text } => {
            cli::workflow::reply(&state, &execution, &text, json).await?
        }
        Commands::Message {
            session,
            text,
            tenant,
            user,
        } => cli::workflow::message(&state, &tenant, &session, &user, &text, json).await?,
        Commands::Show { execution } => cli::workflow::show(&state, &execution, json).await?,
        Commands::Executions {
            tenant,
            session,
            limit,
        } => {
            cli::workflow::list_executions(&state, &tenant, session.as_deref(), limit, json)
                .await?
        }
        Commands::Cancel { execution } => cli::workflow::cancel(&state, &execution, json).await?,
        Commands::Abandon { idle_minutes } => {
            cli::workflow::abandon(&state, idle_minutes, json).await?
        }
        Commands::Config => show_config(&state, json)?,
        Commands::Completions { .. } | Commands::Validate { .. } | Commands::Run { .. } => {
            unreachable!("handled above")
        }
    }

    Ok(())
}

fn show_config(state: &AppState, json: bool) -> anyhow::Result<()> {
    let config = state.engine.config();
    if json {
        let out = serde_json::json!({
            "data_dir": state.data_dir.display().to_string(),
            "config": config,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("  {} {}", style("Data directory:").bold(), state.data_dir.display());
    println!("  Max steps per turn:    {}", config.effective_max_steps());
    println!("  Action failure policy: {:?}", config.action_failure_policy);
    println!("  Unresolved templates:  {:?}", config.unresolved_templates);
    if let Some(url) = &config.database_url {
        println!("  Database URL:          {url}");
    }
    println!();
    Ok(())
}
