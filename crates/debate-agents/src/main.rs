use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use debate_agents::config::AppConfig;
use debate_agents::judge::LlmJudge;
use debate_agents::llm::{HttpTransport, RetryingClient};
use debate_agents::lock::InstanceLock;
use debate_agents::runner::{status_line, Runner};
use debate_engine::orchestrator::read_status;
use debate_engine::policy::TacticPolicy;
use debate_engine::{Persona, RoundOrchestrator};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "debate-agents", about = "Self-play debate loop")]
struct Cli {
    /// TOML config file; environment variables still override it.
    #[arg(long, short, env = "DEBATE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding state/, journal/ and logs/.
    #[arg(long)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the debate loop (the default).
    Run {
        /// Stop after this many committed rounds.
        #[arg(long)]
        rounds: Option<u64>,
    },
    /// Show the last status report.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Show the learned tactic preferences.
    Policy,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref(), cli.root)?;

    match cli.command.unwrap_or(Command::Run { rounds: None }) {
        Command::Run { rounds } => run(config, rounds).await,
        Command::Status { json } => show_status(&config, json),
        Command::Policy => show_policy(&config),
    }
}

async fn run(config: AppConfig, rounds: Option<u64>) -> Result<()> {
    let layout = config.layout();
    let _lock = InstanceLock::acquire(layout.lock()).context("Failed to acquire instance lock")?;

    let transport = HttpTransport::new(&config.llm).context("Failed to build model transport")?;
    info!(
        endpoint = transport.endpoint(),
        model = %config.llm.model,
        p1 = config.llm.model_for(Some(Persona::P1)),
        p2 = config.llm.model_for(Some(Persona::P2)),
        root = %config.root.display(),
        "Debate agents starting"
    );
    let client = Arc::new(
        RetryingClient::new(transport, config.llm.clone(), config.retry.clone())
            .with_stats_path(layout.token_stats()),
    );
    let judge = Arc::new(LlmJudge::new(client.clone()).with_enabled(config.judge_enabled));
    let orchestrator = RoundOrchestrator::open(config.engine.clone(), layout, client.clone(), judge)
        .context("Failed to open debate state")?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let summary = Runner::new(orchestrator, config.loop_sleep())
        .with_max_rounds(rounds)
        .with_stats(client)
        .run(cancel)
        .await;
    info!(
        rounds = summary.rounds_committed,
        failures = summary.failed_attempts,
        "Debate agents exiting"
    );
    Ok(())
}

fn show_status(config: &AppConfig, json: bool) -> Result<()> {
    let layout = config.layout();
    let Some(report) = read_status(&layout).context("Failed to read status report")? else {
        println!("No status report at {}", layout.status().display());
        return Ok(());
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", status_line(&report));
    }
    Ok(())
}

fn show_policy(config: &AppConfig) -> Result<()> {
    let layout = config.layout();
    let policy = TacticPolicy::load(
        config.engine.policy.clone(),
        &layout.policy(),
        &layout.policy_metrics(),
    )
    .context("Failed to load tactic policy")?;
    match policy.last_updated_round() {
        Some(round) => println!("Last policy update: round {round}"),
        None => println!("Policy has not been updated yet"),
    }
    for persona in Persona::ALL {
        println!("{}", policy.strategy_summary(persona));
        let focus: Vec<String> = policy
            .state(persona)
            .focus
            .iter()
            .map(|(dim, weight)| format!("{dim}={weight:.2}"))
            .collect();
        println!("  focus: {}", focus.join(" "));
    }
    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_shutdown().await;
        info!("Shutdown signal received");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable; listening for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
