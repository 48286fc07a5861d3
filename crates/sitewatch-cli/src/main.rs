use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sitewatch_core::Snapshot;
use sitewatch_monitor::{compare, MonitorConfig, MonitorPipeline};
use sitewatch_storage::{PgSnapshotStore, SnapshotStore};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "sitewatch")]
#[command(about = "Site snapshot and change detection")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Capture the given domains now and print what changed.
    Capture {
        #[arg(required = true)]
        domains: Vec<String>,
    },
    /// Rank the latest stored snapshots of the given domains.
    Compare {
        #[arg(required = true)]
        domains: Vec<String>,
    },
    /// One pass over every enabled site in sites.yaml.
    Run,
    /// Run on the configured cron until Ctrl-C.
    Schedule,
    /// Apply the snapshot table migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = MonitorConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Capture { domains } => {
            let pipeline = MonitorPipeline::from_config(config).await?;
            for (domain, result) in pipeline.lifecycle().capture_many(&domains).await {
                match result {
                    Ok(snapshot) => print_capture(&snapshot),
                    Err(err) => eprintln!("{domain}: capture failed: {err:#}"),
                }
            }
        }
        Commands::Compare { domains } => {
            let pipeline = MonitorPipeline::from_config(config).await?;
            let store = pipeline.lifecycle().store();
            let mut latest = Vec::new();
            for domain in &domains {
                match store.get_latest(domain).await? {
                    Some(snapshot) => latest.push(snapshot),
                    None => eprintln!("{domain}: no stored snapshot"),
                }
            }
            let report = compare(&latest);
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("serializing comparison")?
            );
        }
        Commands::Run => {
            let pipeline = MonitorPipeline::from_config(config).await?;
            let summary = pipeline.run_once().await?;
            println!(
                "run complete: run_id={} sites={} captured={} degraded={} changes={} failures={} reports={}",
                summary.run_id,
                summary.enabled_sites,
                summary.captured,
                summary.degraded,
                summary.changes,
                summary.failures.len(),
                summary.reports_dir
            );
        }
        Commands::Schedule => {
            let config = MonitorConfig {
                scheduler_enabled: true,
                ..config
            };
            let cron = config.cron.clone();
            let pipeline = Arc::new(MonitorPipeline::from_config(config).await?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL is not set");
            };
            let store = PgSnapshotStore::connect(url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

fn print_capture(snapshot: &Snapshot) {
    if let Some(error) = &snapshot.fetch_error {
        println!("{}: degraded ({error})", snapshot.domain);
        return;
    }
    match &snapshot.changes_detected {
        None => println!("{}: first observation recorded", snapshot.domain),
        Some(changes) if changes.is_empty() => println!("{}: no changes", snapshot.domain),
        Some(changes) => {
            println!("{}: {} change(s)", snapshot.domain, changes.len());
            for change in changes {
                println!("  [{}] {}", change.impact.as_str(), change.describe());
            }
        }
    }
}
