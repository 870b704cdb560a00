//! KeyRoute CLI
//!
//! Validate routing configurations, replay event scripts against the routing
//! engine, and inspect persisted quota state.

mod script;

use anyhow::Context;
use clap::{Parser, Subcommand};
use keyroute_core::{Clock, ManualClock, QuotaStore, SystemClock};
use keyroute_observability::{LogFormat, init_logging};
use keyroute_routing::{CompiledRoutes, QuotaConfig, QuotaPersistence, RoutingConfig, RoutingEngine};
use keyroute_storage::FileQuotaStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "keyroute")]
#[command(about = "KeyRoute - provider key routing for LLM proxies", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "KEYROUTE_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true, default_value = "false")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a routing configuration and print its tiers
    Check {
        #[arg(long, short)]
        config: PathBuf,
    },
    /// Replay a JSONL event script on a manual clock
    Simulate {
        #[arg(long, short)]
        config: PathBuf,

        #[arg(long, short)]
        script: PathBuf,

        /// Quota state file to restore from and save to
        #[arg(long)]
        state: Option<PathBuf>,

        /// Start time of the manual clock (Unix ms); defaults to now
        #[arg(long)]
        start_ms: Option<i64>,
    },
    /// Print the keys recorded in a quota state file
    Inspect {
        #[arg(long)]
        state: PathBuf,

        /// Evaluate windows at this time (Unix ms); defaults to now
        #[arg(long)]
        at_ms: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    init_logging(&cli.log_level, format)?;

    match cli.command {
        Commands::Check { config } => check(config),
        Commands::Simulate {
            config,
            script,
            state,
            start_ms,
        } => simulate(config, script, state, start_ms).await,
        Commands::Inspect { state, at_ms } => inspect(state, at_ms).await,
    }
}

fn check(path: PathBuf) -> anyhow::Result<()> {
    let config = RoutingConfig::from_path(&path)
        .with_context(|| format!("Invalid configuration {}", path.display()))?;
    let routes = CompiledRoutes::compile(&config)?;

    for name in routes.route_names() {
        println!("{}", name);
        for tier in routes.tiers(name).unwrap_or_default() {
            println!(
                "  rank {:<3} {:<12} {} keys",
                tier.rank,
                tier.mode.as_str(),
                tier.targets.len()
            );
            for key in &tier.targets {
                println!("    {}", key);
            }
        }
    }
    println!("OK: {} keys", routes.keys().len());
    Ok(())
}

async fn simulate(
    config_path: PathBuf,
    script_path: PathBuf,
    state: Option<PathBuf>,
    start_ms: Option<i64>,
) -> anyhow::Result<()> {
    let config = RoutingConfig::from_path(&config_path)
        .with_context(|| format!("Invalid configuration {}", config_path.display()))?;
    let content = std::fs::read_to_string(&script_path)
        .with_context(|| format!("Failed to read script {}", script_path.display()))?;
    let steps = script::parse_script(&content)?;
    tracing::info!(steps = steps.len(), script = %script_path.display(), "Replaying simulation script");

    let clock = Arc::new(ManualClock::new(start_ms.unwrap_or_else(|| SystemClock.now_ms())));
    let engine = Arc::new(RoutingEngine::with_clock(config, clock.clone())?);

    let persistence = match state {
        Some(path) => {
            let persistence = QuotaPersistence::new(
                engine.clone(),
                Arc::new(FileQuotaStore::new(path)),
                Duration::from_secs(60),
            );
            persistence.restore().await?;
            Some(persistence)
        }
        None => None,
    };

    for step in &steps {
        let output = script::run_step(&engine, &clock, step)?;
        println!("{}", serde_json::to_string(&output)?);
    }

    if let Some(persistence) = persistence {
        persistence.flush().await?;
    }
    Ok(())
}

async fn inspect(path: PathBuf, at_ms: Option<i64>) -> anyhow::Result<()> {
    let store = FileQuotaStore::new(&path);
    let Some(snapshot) = store.load().await? else {
        println!("No quota state at {}", path.display());
        return Ok(());
    };

    let now = at_ms.unwrap_or_else(|| SystemClock.now_ms());
    let usage_window_ms = QuotaConfig::default().usage_window_ms();

    println!("version {} updated_at {}", snapshot.version, snapshot.updated_at);
    for (key, entry) in snapshot.entries()? {
        let entry = entry.evaluated(now, usage_window_ms);
        let blocked_until = entry
            .blocked_until_ms(usage_window_ms)
            .map(|until| until.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<40} {:<14} errors={:<3} tier={:<4} until={}",
            key.to_string(),
            entry.reason.as_str(),
            entry.consecutive_error_count,
            entry.priority_tier,
            blocked_until
        );
    }
    for (series, until) in &snapshot.series_cooldowns {
        if *until > now {
            println!("series {:<33} cooling until={}", series, until);
        }
    }
    Ok(())
}
