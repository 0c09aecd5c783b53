use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use civic_common::{Config, Strategy};
use civic_loader::app::{phase_plan, read_file_config};
use civic_loader::{App, DriveOutcome};
use civic_scout::{run_worker, Catalog, ScraperRegistry, WorkerRequest};

#[derive(Parser)]
#[command(name = "civic-loader")]
#[command(about = "Phased loading of Canadian civic data")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a full phased loading session
    Load {
        /// conservative, balanced or aggressive
        #[arg(long, default_value = "balanced")]
        strategy: Strategy,

        /// Allow skip and retry of failed phases
        #[arg(long)]
        manual: bool,
    },

    /// Show the phase plan scaled for a strategy
    Preview {
        /// Phase key; all phases when omitted
        phase: Option<String>,

        #[arg(long, default_value = "balanced")]
        strategy: Strategy,
    },

    /// Run scrapers as their cadence comes due
    Schedule {
        /// Run due scrapers once and exit
        #[arg(long)]
        once: bool,
    },

    /// Run one scraper and print its records as JSON lines (used by the orchestrator)
    Worker {
        #[arg(long)]
        jurisdiction: String,

        #[arg(long)]
        scraper: String,

        #[arg(long, default_value_t = 5_000)]
        max_records: usize,
    },

    /// Mark executions left running by a dead orchestrator as stopped
    Reconcile,

    /// Print recent scraper executions
    Status {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout belongs to command output (and the worker record stream)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("civic=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Load { strategy, manual } => load(config, strategy, manual).await,
        Command::Preview { phase, strategy } => preview(&config, phase.as_deref(), strategy),
        Command::Schedule { once } => schedule(config, once).await,
        Command::Worker {
            jurisdiction,
            scraper,
            max_records,
        } => worker(&config, jurisdiction, scraper, max_records).await,
        Command::Reconcile => {
            let app = App::build(config).await?;
            let stopped = app.reconcile().await?;
            println!("Reconciled {stopped} orphaned executions");
            Ok(())
        }
        Command::Status { limit } => {
            let app = App::build(config).await?;
            for row in app.log.recent(limit).await? {
                println!("{}", serde_json::to_string(&row)?);
            }
            Ok(())
        }
    }
}

async fn load(config: Config, strategy: Strategy, manual: bool) -> Result<()> {
    info!("Civic loader starting...");
    config.log_redacted();

    let app = App::build(config).await?;
    app.reconcile().await?;

    let session_id = app.controller.start(strategy, manual).await?;
    info!(%session_id, %strategy, manual, "Loading session started");

    let controller = app.controller.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling session");
            if let Err(e) = controller.cancel("interrupted").await {
                warn!(error = %e, "Cancel after interrupt failed");
            }
        }
    });

    let reporter = app.reporter.clone();
    let progress = tokio::spawn(async move {
        let mut stream = Box::pin(reporter.stream_status(Duration::from_secs(30)));
        while let Some(snapshot) = stream.next().await {
            info!(
                status = %snapshot.status,
                phase = snapshot.current_phase.as_deref().unwrap_or("-"),
                percent = %format!("{:.1}", snapshot.overall_percentage),
                "{}",
                snapshot.current_operation
            );
        }
    });

    match app.controller.drive().await? {
        DriveOutcome::Completed => info!(%session_id, "All phases complete"),
        DriveOutcome::Cancelled => warn!(%session_id, "Session cancelled"),
        DriveOutcome::Halted { phase } => {
            error!(%session_id, %phase, "Phase failed its success threshold");
            app.controller
                .cancel(&format!("phase {phase} failed"))
                .await?;
        }
    }

    let _ = progress.await;
    println!("{}", app.controller.report().await);
    Ok(())
}

fn preview(config: &Config, phase: Option<&str>, strategy: Strategy) -> Result<()> {
    let plan = phase_plan(&read_file_config(config)?)?;
    let output = match phase {
        Some(key) => serde_json::to_string_pretty(&plan.preview(key, strategy)?)?,
        None => serde_json::to_string_pretty(&plan.preview_all(strategy))?,
    };
    println!("{output}");
    Ok(())
}

async fn schedule(config: Config, once: bool) -> Result<()> {
    info!("Civic scheduler starting...");
    config.log_redacted();

    let app = App::build(config).await?;
    app.reconcile().await?;

    let report = if once {
        app.scheduler.run_due(&app.schedule_options()).await?
    } else {
        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping scheduler");
                on_interrupt.cancel();
            }
        });
        let mut options = app.schedule_options();
        options.cancel = cancel;
        app.scheduler
            .run_forever(app.config.poll_interval, options)
            .await
    };

    println!("{report}");
    Ok(())
}

async fn worker(
    config: &Config,
    jurisdiction_id: String,
    scraper_id: String,
    max_records: usize,
) -> Result<()> {
    let file_config = read_file_config(config)?;
    let registry = ScraperRegistry::builtin().with_file_config(&file_config);
    let request = WorkerRequest {
        jurisdiction_id,
        scraper_id,
        max_records,
    };
    let mut out = std::io::stdout().lock();
    run_worker(&request, &Catalog::builtin(), &registry, config, &mut out).await?;
    Ok(())
}
