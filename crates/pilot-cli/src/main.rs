mod config;
mod demo;
#[cfg(test)]
mod test_util;

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use tokio_util::sync::CancellationToken;

use pilot_core::{Scheduler, TicketId};

use config::{CliOverrides, PilotConfig};

#[derive(Parser)]
#[command(name = "pilot", about = "Issue-ingestion scheduler that drives a coding agent against tracker tickets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a pilot config file (no database required)
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the scheduler against the demo in-memory tracker until Ctrl-C
    Run {
        /// Scheduling mode: parallel or sequential
        #[arg(long)]
        mode: Option<String>,
        /// Maximum concurrently-executing handlers (parallel mode only)
        #[arg(long)]
        max_concurrent: Option<usize>,
        /// Seconds between discovery ticks
        #[arg(long)]
        interval_secs: Option<u64>,
        /// Tracker-side selector label
        #[arg(long)]
        selector: Option<String>,
        /// Number of demo tickets to seed
        #[arg(long, default_value_t = 3)]
        demo_tickets: i64,
        /// Simulated per-ticket handler duration, in milliseconds
        #[arg(long, default_value_t = 500)]
        demo_handler_delay_ms: u64,
    },
    /// Clear a ticket from the processed set, so it is re-offered
    ClearProcessed {
        /// Ticket id (an integer, or a string key like PROJ-42)
        ticket_id: String,
    },
    /// Print how many tickets the persisted processed-store considers resolved
    Status,
    /// Print shell completions for the given shell
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn parse_ticket_id(raw: &str) -> TicketId {
    match raw.parse::<i64>() {
        Ok(n) => TicketId::Int(n),
        Err(_) => TicketId::Str(raw.to_owned()),
    }
}

async fn run_scheduler(args_overrides: CliOverrides, demo_tickets: i64, demo_handler_delay_ms: u64) -> Result<()> {
    let resolved = PilotConfig::resolve(&args_overrides)?;

    let tracker = Arc::new(demo::DemoTracker::seeded(demo_tickets));
    let handler = Arc::new(demo::DemoHandler::new(Duration::from_millis(demo_handler_delay_ms)));

    let store: Option<Arc<dyn pilot_core::ProcessedStore>> = match &resolved.database_url {
        Some(url) => {
            let db_config = pilot_db::DbConfig::new(url.clone());
            pilot_db::pool::ensure_database_exists(&db_config)
                .await
                .context("ensuring pilot database exists")?;
            let pool = pilot_db::pool::create_pool(&db_config).await?;
            pilot_db::pool::run_migrations(&pool, pilot_db::pool::default_migrations_path()).await?;
            Some(Arc::new(pilot_db::PgProcessedStore::new(pool, "demo")))
        }
        None => {
            tracing::info!("no database configured; running with an in-memory processed set only");
            None
        }
    };

    let stale_selector = resolved.scheduler.selector.clone();
    let stale_config = resolved.scheduler.stale_cleanup.clone();
    let scheduler = Arc::new(Scheduler::new(resolved.scheduler, tracker.clone(), handler, store));

    // Graceful shutdown: first Ctrl-C drains in-flight work, second force-exits.
    let cancel = CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));
    let got_first_clone = Arc::clone(&got_first_signal);
    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_clone.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nDraining in-flight tickets (Ctrl+C again to force)...");
            cancel_for_signal.cancel();
        }
    });

    // The stale-label cleaner is a sibling task, not owned by the
    // scheduler itself; it only needs the scheduler's in-flight ticket
    // tracking as its `ActiveExecutions` oracle.
    let stale_task = if stale_config.enabled {
        let active: Arc<dyn pilot_core::ActiveExecutions> = Arc::new(scheduler.active_executions());
        Some(tokio::spawn(pilot_core::stale_cleaner::run(
            tracker,
            stale_selector,
            active,
            stale_config,
            cancel.clone(),
        )))
    } else {
        None
    };

    scheduler.start(cancel).await?;
    if let Some(task) = stale_task {
        match task.await {
            Ok(Err(e)) => tracing::warn!(error = %e, "stale-label cleaner exited with an error"),
            Err(e) => tracing::warn!(error = %e, "stale-label cleaner task panicked"),
            Ok(Ok(())) => {}
        }
    }

    println!(
        "pilot stopped. lifecycle={:?} processed_count={}",
        scheduler.lifecycle_state(),
        scheduler.processed_count()
    );
    Ok(())
}

async fn run_clear_processed(args_overrides: CliOverrides, ticket_id: &str) -> Result<()> {
    let resolved = PilotConfig::resolve(&args_overrides)?;
    let Some(url) = resolved.database_url else {
        anyhow::bail!("clear-processed requires a configured database; set database.url or PILOT_DATABASE_URL");
    };
    let db_config = pilot_db::DbConfig::new(url);
    let pool = pilot_db::pool::create_pool(&db_config).await?;
    let store = pilot_db::PgProcessedStore::new(pool, "demo");
    let id = parse_ticket_id(ticket_id);
    pilot_core::ProcessedStore::unmark(&store, &id).await?;
    println!("cleared ticket {id} from the processed set");
    Ok(())
}

/// There is no resident scheduler process to query between CLI
/// invocations, so `status` reports what the persisted `ProcessedStore`
/// considers resolved rather than a live `Lifecycle` state. Without a
/// configured database this is a no-op: the in-memory `ProcessedSet` a
/// `run` invocation builds dies with that process.
async fn run_status(args_overrides: CliOverrides) -> Result<()> {
    let resolved = PilotConfig::resolve(&args_overrides)?;
    let Some(url) = resolved.database_url else {
        println!("no database configured; processed state is in-memory-only and not queryable between runs");
        return Ok(());
    };
    let db_config = pilot_db::DbConfig::new(url);
    let pool = pilot_db::pool::create_pool(&db_config).await?;
    let store = pilot_db::PgProcessedStore::new(pool, "demo");
    let processed = pilot_core::ProcessedStore::load_all(&store).await?;
    println!("processed_count={} (persisted, namespace=demo)", processed.len());
    Ok(())
}

fn run_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}

fn run_init(force: bool) -> Result<()> {
    let path = config::config_path();
    if path.exists() && !force {
        anyhow::bail!("config file already exists at {}\nUse --force to overwrite.", path.display());
    }
    config::save_config(&config::ConfigFile::default())?;
    println!("Config written to {}", path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => run_init(force)?,
        Commands::Run { mode, max_concurrent, interval_secs, selector, demo_tickets, demo_handler_delay_ms } => {
            let overrides = CliOverrides { mode, max_concurrent, interval_secs, selector, database_url: None };
            run_scheduler(overrides, demo_tickets, demo_handler_delay_ms).await?;
        }
        Commands::ClearProcessed { ticket_id } => {
            run_clear_processed(CliOverrides::default(), &ticket_id).await?;
        }
        Commands::Status => run_status(CliOverrides::default()).await?,
        Commands::Completions { shell } => run_completions(shell),
    }

    Ok(())
}
