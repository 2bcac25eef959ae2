use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use yotcrew_core::{Filters, RunSummary};
use yotcrew_scheduler::{
    ScheduleBand, ScheduleConfig, ScheduleStore, SchedulerStatus, ScrapeScheduler,
    MANUAL_HISTORY_KEY,
};
use yotcrew_storage::PgJobStore;
use yotcrew_sync::{SourceStats, SyncConfig, SyncContext};

#[derive(Debug, Parser)]
#[command(name = "yotcrew")]
#[command(about = "YotCrew yacht-crew job ingestion engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape one source now.
    Run {
        source: String,
        #[arg(long)]
        max_pages: Option<u32>,
        /// Repeatable `key=value` filter; keys the source does not declare are ignored.
        #[arg(long = "filter", value_parser = parse_filter)]
        filters: Vec<(String, String)>,
    },
    /// Scrape several sources (all registered sources by default).
    RunAll {
        #[arg(long, value_delimiter = ',')]
        sources: Vec<String>,
        #[arg(long)]
        max_pages: Option<u32>,
    },
    /// Probe every registered source.
    Probe,
    /// Apply database migrations.
    Migrate,
    #[command(subcommand)]
    Schedule(ScheduleCommand),
    /// Run now outside the timetable, recorded under the manual history.
    Trigger { source: Option<String> },
    /// Scheduler state, registered sources and recent runs.
    Status,
}

#[derive(Debug, Subcommand)]
enum ScheduleCommand {
    Show,
    Update {
        band: String,
        #[arg(long, value_delimiter = ',')]
        hours: Vec<u32>,
        #[arg(long, value_delimiter = ',')]
        minutes: Vec<u32>,
    },
    Pause { descriptor: String },
    Resume { descriptor: String },
    /// Delete a descriptor from the persisted timetable.
    Remove { descriptor: String },
    /// Status of one descriptor.
    Job { descriptor: String },
    /// Upcoming fire times across all bands.
    Next {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Arm the timetable and run until interrupted.
    Serve,
}

fn parse_filter(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected key=value, got `{raw}`")),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("rendering output")?
    );
    Ok(())
}

async fn open_scheduler(context: &SyncContext) -> Result<ScrapeScheduler> {
    let config = ScheduleConfig::from_env().context("loading schedule configuration")?;
    ScrapeScheduler::open(
        Arc::new(context.orchestrator.clone()),
        config,
        Some(ScheduleStore::new(context.state_dir())),
    )
    .await
}

#[derive(Debug, Serialize)]
struct StatusReport {
    scheduler: SchedulerStatus,
    sources: SourceStats,
    recent_runs: Vec<RunSummary>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    if matches!(cli.command, Commands::Migrate) {
        let Some(url) = config.database_url.as_deref() else {
            bail!("DATABASE_URL must be set to run migrations");
        };
        let store = PgJobStore::connect(url, 1)
            .await
            .context("connecting to postgres")?;
        store.migrate().await?;
        info!("migrations applied");
        return Ok(());
    }

    let context = SyncContext::from_config(config).await?;
    let max_pages_default = context.config.max_pages;

    match cli.command {
        Commands::Migrate => {}
        Commands::Run {
            source,
            max_pages,
            filters,
        } => {
            let filters: Filters = filters.into_iter().collect();
            let summary = context
                .orchestrator
                .run_source(&source, max_pages.unwrap_or(max_pages_default), &filters)
                .await;
            print_json(&summary)?;
        }
        Commands::RunAll { sources, max_pages } => {
            let sources = if sources.is_empty() {
                context.orchestrator.source_ids()
            } else {
                sources
            };
            let summaries = context
                .orchestrator
                .run_all(&sources, max_pages.unwrap_or(max_pages_default))
                .await;
            print_json(&summaries)?;
        }
        Commands::Probe => {
            print_json(&context.orchestrator.health_check_all().await)?;
        }
        Commands::Schedule(command) => {
            let scheduler = open_scheduler(&context).await?;
            match command {
                ScheduleCommand::Show => {
                    print_json(&scheduler.get_status(Utc::now()).await)?;
                }
                ScheduleCommand::Update {
                    band,
                    hours,
                    minutes,
                } => {
                    let band: ScheduleBand = band.parse()?;
                    let descriptor = match (hours.is_empty(), minutes.is_empty()) {
                        (true, true) => bail!("pass --hours and/or --minutes"),
                        (false, true) => scheduler.update_hours(band, hours).await?,
                        (true, false) => scheduler.update_minutes(band, minutes).await?,
                        (false, false) => scheduler.update_recurrence(band, hours, minutes).await?,
                    };
                    print_json(&descriptor)?;
                }
                ScheduleCommand::Pause { descriptor } => {
                    scheduler.pause(&descriptor).await?;
                    info!(descriptor = %descriptor, "paused");
                }
                ScheduleCommand::Resume { descriptor } => {
                    scheduler.resume(&descriptor).await?;
                    info!(descriptor = %descriptor, "resumed");
                }
                ScheduleCommand::Remove { descriptor } => {
                    print_json(&scheduler.remove_job(&descriptor).await?)?;
                }
                ScheduleCommand::Job { descriptor } => {
                    match scheduler.get_job_status(&descriptor, Utc::now()).await {
                        Some(status) => print_json(&status)?,
                        None => bail!("unknown schedule descriptor `{descriptor}`"),
                    }
                }
                ScheduleCommand::Next { limit } => {
                    print_json(&scheduler.get_next_runs(Utc::now(), limit).await)?;
                }
                ScheduleCommand::Serve => {
                    if !context.config.scheduler_enabled {
                        bail!("scheduler disabled; set YOTCREW_SCHEDULER_ENABLED=true to serve");
                    }
                    scheduler.start().await?;
                    tokio::signal::ctrl_c()
                        .await
                        .context("waiting for ctrl-c")?;
                    info!("shutting down; in-flight pages will finish");
                    context.orchestrator.shutdown_token().cancel();
                    scheduler.stop().await?;
                    scheduler.wait_idle().await;
                }
            }
        }
        Commands::Trigger { source } => {
            let scheduler = open_scheduler(&context).await?;
            let decision = scheduler.trigger_now(source.as_deref()).await;
            info!(?decision, "manual trigger");
            scheduler.wait_idle().await;
            if let Some(history) = scheduler.history(MANUAL_HISTORY_KEY).await {
                print_json(&history.recent)?;
            }
        }
        Commands::Status => {
            let scheduler = open_scheduler(&context).await?;
            let recent_runs = match &context.database {
                Some(pg) => pg.recent_run_summaries(20).await?,
                None => context.summaries.recent(20).await?,
            };
            print_json(&StatusReport {
                scheduler: scheduler.get_status(Utc::now()).await,
                sources: context.orchestrator.source_stats(),
                recent_runs,
            })?;
        }
    }

    Ok(())
}
