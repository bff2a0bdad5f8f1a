mod command_provider;
mod config;
mod plan;

use agentor_teams::{ProviderRegistry, TaskStatus, TeamOrchestrator, TeamStatus};
use clap::{Parser, Subcommand};
use command_provider::CommandProvider;
use config::CliConfig;
use plan::TeamPlan;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agentor", about = "Agentor — Agent teams orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "agentor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a team plan for unknown keys and circular dependencies
    Validate {
        /// Plan file (TOML)
        plan: PathBuf,
    },
    /// Execute a team plan to completion
    Run {
        /// Plan file (TOML)
        plan: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { plan } => {
            let plan = TeamPlan::load(&plan).await?;
            let report = plan.validate()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_valid() {
                anyhow::bail!("plan has {} circular dependency chain(s)", report.cycles.len());
            }
        }
        Commands::Run { plan } => {
            let config = CliConfig::load(&cli.config).await?;
            let plan = TeamPlan::load(&plan).await?;

            let mut providers = ProviderRegistry::new();
            for provider in &config.providers {
                providers.register(Arc::new(CommandProvider::new(provider.clone())));
            }
            info!(providers = ?providers.names(), "Providers registered");

            let orch = TeamOrchestrator::in_memory(&config.teams, providers);
            let applied = plan.apply(&orch).await?;
            orch.start_team(applied.team_id).await?;
            let summary = orch.drive_team(applied.team_id).await?;

            let tasks = orch.list_tasks(applied.team_id).await?;
            let all_done = tasks.iter().all(|t| t.status == TaskStatus::Completed);
            let team = if all_done {
                orch.complete_team(applied.team_id).await?
            } else {
                orch.get_team(applied.team_id).await?
            };
            let costs = orch.get_cost_analysis(applied.team_id).await?;

            let rows: Vec<serde_json::Value> = tasks
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "key": applied.key_of(t.id),
                        "status": t.status,
                        "provider": t.provider,
                        "model": t.model,
                        "tokens": t.total_tokens(),
                        "cost_usd": t.cost_usd,
                        "result": t.result,
                        "error": t.error,
                    })
                })
                .collect();
            let report = serde_json::json!({
                "team": team.name,
                "status": team.status,
                "summary": summary,
                "tasks": rows,
                "costs": costs,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);

            if team.status != TeamStatus::Completed {
                let unfinished = tasks
                    .iter()
                    .filter(|t| t.status != TaskStatus::Completed)
                    .count();
                anyhow::bail!("{unfinished} task(s) did not complete");
            }
        }
    }

    Ok(())
}
