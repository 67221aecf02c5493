use std::sync::Arc;

use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{error, info};

use chainaudit::cache::{TipCache, CHAIN_TIP_TTL};
use chainaudit::config::{self, init_global_config};
use chainaudit::engine::{ChainCheckAllEngine, ChainCheckEngine};
use chainaudit::metrics::register_metrics;
use chainaudit::models::{ChainJob, NewChainJob};
use chainaudit::scheduler::{
    run_check_all_loop, run_clean_all_loop, spawn_block_workers, BlockScheduler,
};
use chainaudit::telemetry::{init_tracing, TelemetryConfig};
use chainaudit::types::{AppState, BlockchainId, ServiceId};
use chainaudit::web::start_web_server;

const BLOCK_QUEUE_CAPACITY: usize = 1024;

#[derive(Parser)]
#[command(name = "chainaudit", about = "Audits block data services against a canonical source")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler, worker pool and dashboard API (the default)
    Serve,
    /// Dispatch one tick for every enabled job, then drain the queue
    CheckAll,
    /// Run one tick for a single job, then drain the queue
    CheckJob { job_id: i64 },
    /// Delete superseded fetch records past the retention horizon
    Clean,
    /// Register a new audit job
    AddJob {
        #[arg(long)]
        name: String,
        #[arg(long)]
        service: ServiceId,
        #[arg(long)]
        blockchain: BlockchainId,
        #[arg(long, default_value_t = 0)]
        start_height: i64,
        #[arg(long, default_value_t = i64::MAX)]
        end_height: i64,
        #[arg(long, default_value_t = 20)]
        inflight_max: i32,
        #[arg(long, default_value_t = 6)]
        finality_depth: i32,
        #[arg(long)]
        disabled: bool,
    },
}

fn check_engine(pool: &PgPool, blocks: BlockScheduler) -> Result<ChainCheckEngine, Box<dyn std::error::Error>> {
    Ok(ChainCheckEngine::new(
        pool.clone(),
        blocks,
        chrono::Duration::from_std(config::check_job_expiry())?,
        chrono::Duration::from_std(config::check_job_retry())?,
    ))
}

fn check_all_engine(pool: &PgPool) -> Result<ChainCheckAllEngine, Box<dyn std::error::Error>> {
    Ok(ChainCheckAllEngine::new(
        pool.clone(),
        chrono::Duration::from_std(config::fetch_retention())?,
    ))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    init_global_config()?;
    init_tracing(TelemetryConfig::default())?;
    register_metrics();

    let pool = PgPoolOptions::new()
        .max_connections(config::db_max_connections())
        .connect(&config::database_url()?)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(pool).await,
        Command::CheckAll => {
            let (blocks, mut rx) = BlockScheduler::new(BLOCK_QUEUE_CAPACITY);
            let engine = check_engine(&pool, blocks)?;
            for job in ChainJob::find_all_active(&pool).await? {
                if let Err(e) = engine.check_chain(job.id).await {
                    error!(job_id = job.id, error = %e, "Chain check failed");
                }
            }
            drain_queue(&engine, &mut rx).await;
            Ok(())
        }
        Command::CheckJob { job_id } => {
            let (blocks, mut rx) = BlockScheduler::new(BLOCK_QUEUE_CAPACITY);
            let engine = check_engine(&pool, blocks)?;
            engine
                .check_chain(job_id)
                .await
                .map_err(|e| -> Box<dyn std::error::Error> { e })?;
            drain_queue(&engine, &mut rx).await;
            Ok(())
        }
        Command::Clean => {
            let deleted = check_all_engine(&pool)?.clean_all_chains().await?;
            info!(deleted, "Retention sweep complete");
            Ok(())
        }
        Command::AddJob {
            name,
            service,
            blockchain,
            start_height,
            end_height,
            inflight_max,
            finality_depth,
            disabled,
        } => {
            let job = ChainJob::create(
                &pool,
                &NewChainJob {
                    name,
                    enabled: !disabled,
                    service_id: service,
                    blockchain_id: blockchain,
                    start_height,
                    end_height,
                    inflight_max,
                    finality_depth,
                },
            )
            .await?;
            info!(job_id = job.id, name = %job.name, "Job created");
            Ok(())
        }
    }
}

/// Run queued block checks inline. Used by the one-shot subcommands,
/// which have no worker pool.
async fn drain_queue(
    engine: &ChainCheckEngine,
    rx: &mut tokio::sync::mpsc::Receiver<chainaudit::scheduler::BlockCheckTask>,
) {
    while let Ok(task) = rx.try_recv() {
        if let Err(e) = engine
            .check_block(
                task.job_id,
                task.block_id,
                task.blockchain_id,
                task.block_height,
                task.service_id,
            )
            .await
        {
            error!(
                job_id = task.job_id,
                height = task.block_height,
                error = %e,
                "Block check failed"
            );
        }
    }
}

async fn serve(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
    let (blocks, rx) = BlockScheduler::new(BLOCK_QUEUE_CAPACITY);
    let engine = Arc::new(check_engine(&pool, blocks)?);
    let all_engine = Arc::new(check_all_engine(&pool)?);

    spawn_block_workers(
        engine.clone(),
        rx,
        config::block_workers(),
        config::check_job_expiry(),
    );

    let state = AppState {
        pool,
        tips: Arc::new(TipCache::new(CHAIN_TIP_TTL)),
    };
    let bind = config::http_bind();
    tokio::spawn(async move {
        if let Err(e) = start_web_server(state, bind).await {
            error!(error = %e, "Web server failed");
        }
    });

    tokio::spawn(run_clean_all_loop(all_engine.clone()));

    info!(
        workers = config::block_workers(),
        tick_secs = config::check_all_expiry().as_secs(),
        "Audit scheduler starting"
    );
    run_check_all_loop(engine, all_engine).await;
    Ok(())
}
