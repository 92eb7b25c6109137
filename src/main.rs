use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use voyage_core::config::{AppConfig, StoreBackend};
use voyage_core::context::ExecutionContext;
use voyage_core::traits::ContextStore;
use voyage_core::types::{RunId, RunStatus};

use voyage_agents::{booking_graph, BookingRequest, BookingSummary, SeatRequest};
use voyage_engine::{GraphRunner, MemoryStore, RunLogger, RunReport, SqliteStore};

#[derive(Parser)]
#[command(name = "voyage", version, about = "Graph-based travel booking orchestrator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "voyage.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Book a flight
    Book {
        /// Departure airport (IATA code)
        #[arg(long, default_value = "SFO")]
        origin: String,
        /// Arrival airport (IATA code)
        #[arg(long, default_value = "JFK")]
        destination: String,
        /// Travel date, YYYY-MM-DD
        #[arg(long, default_value = "2024-05-01")]
        date: NaiveDate,
        /// Do not ask for a window seat
        #[arg(long)]
        no_window: bool,
        /// Do not ask for extra legroom
        #[arg(long)]
        no_legroom: bool,
    },
    /// Resume an interrupted run
    Resume {
        /// Run ID
        run_id: String,
    },
    /// Show the state of a run
    Status {
        /// Run ID
        run_id: String,
    },
    /// Cancel a run that has not started yet
    Cancel {
        /// Run ID
        run_id: String,
    },
    /// List stored runs
    Runs,
    /// Print the booking graph as a Mermaid state diagram
    Graph,
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("voyage=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    let graph = Arc::new(booking_graph(&config)?);

    if let Commands::Graph = cli.command {
        print!("{}", graph.to_mermaid());
        return Ok(());
    }
    if let Commands::Config = cli.command {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let store = open_store(&config)?;
    let runner = GraphRunner::new(graph, store.clone()).with_max_steps(config.runner.max_steps);

    match cli.command {
        Commands::Book {
            origin,
            destination,
            date,
            no_window,
            no_legroom,
        } => {
            let request = BookingRequest::new(origin, destination, date).with_seat(SeatRequest {
                window: !no_window,
                extra_legroom: !no_legroom,
            });
            let ctx = runner.start(serde_json::to_value(&request)?).await?;
            println!("Run {} started", ctx.run_id());
            let done = drive(&runner, &config, ctx).await?;
            finish(&done)
        }
        Commands::Resume { run_id } => {
            let ctx = store.load(&RunId::from_str(&run_id)).await?;
            let done = drive(&runner, &config, ctx).await?;
            finish(&done)
        }
        Commands::Status { run_id } => {
            let report = runner.status(&RunId::from_str(&run_id)).await?;
            println!("{}", report);
            Ok(())
        }
        Commands::Cancel { run_id } => {
            let ctx = runner.cancel_pending(&RunId::from_str(&run_id)).await?;
            println!("{}", RunReport::from_context(&ctx));
            Ok(())
        }
        Commands::Runs => {
            let runs = store.list().await?;
            if runs.is_empty() {
                println!("No runs.");
            }
            for ctx in runs {
                println!(
                    "{}  {:<9}  {:<8}  {}",
                    ctx.run_id(),
                    ctx.status(),
                    ctx.current_node(),
                    ctx.updated_at().format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(())
        }
        Commands::Graph | Commands::Config => Ok(()),
    }
}

/// Drive a run to the end, logging it to JSONL when enabled.
/// Ctrl-C cancels at the next step boundary.
async fn drive(
    runner: &GraphRunner,
    config: &AppConfig,
    ctx: ExecutionContext,
) -> anyhow::Result<ExecutionContext> {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        warn!("Cancelling run at the next step boundary...");
        cancel_clone.cancel();
    });

    let log_cancel = CancellationToken::new();
    let log_handle = match config.log {
        Some(ref log) if log.enabled => {
            let logger = RunLogger::new(config.log_dir(), log.level);
            let rx = runner.events().subscribe();
            Some(tokio::spawn(logger.run(
                rx,
                ctx.run_id().clone(),
                log_cancel.clone(),
            )))
        }
        _ => None,
    };

    let result = runner.drive(ctx, &cancel).await;

    if let Some(handle) = log_handle {
        // a run rejected before its first step publishes nothing to wait for
        if result.is_err() {
            log_cancel.cancel();
        }
        if let Ok(Some(path)) = handle.await {
            info!(path = %path.display(), "Run log written");
        }
    }
    Ok(result?)
}

fn finish(ctx: &ExecutionContext) -> anyhow::Result<()> {
    match ctx.status() {
        RunStatus::Completed => {
            match BookingSummary::from_payload(&ctx.payload()) {
                Some(summary) => println!("{}", summary),
                None => println!("{}", RunReport::from_context(ctx)),
            }
            Ok(())
        }
        _ => {
            eprintln!("{}", RunReport::from_context(ctx));
            std::process::exit(1);
        }
    }
}

fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn ContextStore>> {
    let store: Arc<dyn ContextStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Sqlite => Arc::new(SqliteStore::open(&config.store_path())?),
    };
    Ok(store)
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    let home_config = dirs_home().map(|h| h.join(".voyage").join("config.toml"));
    match home_config {
        Some(ref p) if p.exists() => {
            info!(path = %p.display(), "Loading config from home directory");
            Ok(AppConfig::load(p)?)
        }
        _ => Ok(AppConfig::default()),
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
