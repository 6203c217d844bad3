use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shipmap_core::SyncMode;
use shipmap_storage::{PgRepository, ShipmentRepository};
use shipmap_sync::{build_scheduler, log_last_successful_sync, AppConfig, SyncPipeline, SyncQueue};
use shipmap_web::AppState;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "shipmap")]
#[command(about = "Store shipment map: spreadsheet sync, geocoding and map API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync now (incremental unless --full).
    Sync {
        #[arg(long)]
        full: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Serve the map API.
    Serve,
    /// Run the cron scheduler until ctrl-c.
    Schedule,
    /// Serve the map API and run the scheduler in one process.
    ServeSchedule,
    /// Print recent sync runs.
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("SHIPMAP_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::from_env()?;

    let pool = shipmap_storage::connect(&config.database_url, config.db_max_connections).await?;
    shipmap_storage::migrate(&pool)
        .await
        .context("applying migrations")?;
    let repository: Arc<dyn ShipmentRepository> = Arc::new(PgRepository::new(pool));

    match cli.command.unwrap_or(Commands::Sync { full: false }) {
        Commands::Sync { full } => {
            let mode = if full { SyncMode::Full } else { SyncMode::Incremental };
            let pipeline = SyncPipeline::from_config(&config, repository)?;
            let report = pipeline.run(mode).await?;
            println!("{}", report.summary());
        }
        Commands::Migrate => {
            println!("migrations applied");
        }
        Commands::Serve => {
            let queue = start_queue(&config, &repository)?;
            shipmap_web::serve(web_state(&config, repository, Some(queue))?, config.api_port).await?;
        }
        Commands::Schedule => {
            log_last_successful_sync(repository.as_ref()).await;
            let queue = start_queue(&config, &repository)?;
            let mut sched = build_scheduler(&config, queue).await?;
            sched.start().await.context("starting scheduler")?;
            tokio::signal::ctrl_c().await?;
            info!("stopping scheduler");
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::ServeSchedule => {
            log_last_successful_sync(repository.as_ref()).await;
            let queue = start_queue(&config, &repository)?;
            let mut sched = build_scheduler(&config, queue.clone()).await?;
            sched.start().await.context("starting scheduler")?;
            let state = web_state(&config, repository, Some(queue))?;
            shipmap_web::serve(state, config.api_port).await?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::History { limit } => {
            for run in repository.sync_history(limit).await? {
                println!(
                    "{} {:<11} {:<7} {} -> {} {}",
                    run.id,
                    run.mode.as_str(),
                    run.status.as_str(),
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    run.ended_at
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    run.message
                );
            }
        }
    }

    Ok(())
}

fn start_queue(config: &AppConfig, repository: &Arc<dyn ShipmentRepository>) -> Result<SyncQueue> {
    let pipeline = SyncPipeline::from_config(config, Arc::clone(repository))?;
    let (queue, _worker) = SyncQueue::start(Arc::new(pipeline), SyncQueue::DEFAULT_CAPACITY);
    Ok(queue)
}

fn web_state(
    config: &AppConfig,
    repository: Arc<dyn ShipmentRepository>,
    queue: Option<SyncQueue>,
) -> Result<AppState> {
    let state = AppState::new(repository, config.recent_days)
        .with_cors_origins(config.cors_origins.clone())
        .with_static_dir(config.static_dir.clone());
    Ok(match (config.sync_api_secret()?, queue) {
        (Some(secret), Some(queue)) => state.with_sync_trigger(queue, secret),
        _ => state,
    })
}
