// Task-queue bindings for the audit engines.
//
// Three logical pools: the top-level tick and the per-job ticks run
// under keyed single-flight locks, block checks run on a worker pool
// fed by a bounded channel with no lock at all. Duplicate block-check
// delivery is tolerated by the engine's idempotent write path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::config;
use crate::engine::{ChainCheckAllEngine, ChainCheckEngine};
use crate::metrics::{TICKS_TOTAL, TICK_DURATION};
use crate::models::{ChainBlock, ChainJob};
use crate::types::{AuditError, BlockchainId, ServiceId};

/// Single-flight key for the top-level tick.
pub const CHECK_ALL_TASK: &str = "check_all";

/// One block comparison waiting for a worker.
#[derive(Debug, Clone)]
pub struct BlockCheckTask {
    pub job_id: i64,
    pub block_id: i64,
    pub blockchain_id: BlockchainId,
    pub block_height: i64,
    pub service_id: ServiceId,
    pub enqueued_at: Instant,
}

impl BlockCheckTask {
    pub fn new(job: &ChainJob, block: &ChainBlock) -> Self {
        Self {
            job_id: job.id,
            block_id: block.id,
            blockchain_id: job.blockchain_id,
            block_height: block.block_height,
            service_id: job.service_id,
            enqueued_at: Instant::now(),
        }
    }

    /// Tasks that sat in the queue past the tick expiry are dropped
    /// unexecuted; the expiry pass will reschedule the block.
    pub fn is_expired(&self, expiry: Duration) -> bool {
        self.enqueued_at.elapsed() > expiry
    }
}

/// Sending half of the block-check queue.
#[derive(Clone)]
pub struct BlockScheduler {
    tx: mpsc::Sender<BlockCheckTask>,
}

impl BlockScheduler {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<BlockCheckTask>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn enqueue(&self, task: BlockCheckTask) -> Result<(), AuditError> {
        self.tx
            .send(task)
            .await
            .map_err(|_| AuditError::new("block check queue closed"))
    }
}

/// Keyed single-flight locks with a TTL. A second acquire for a held
/// key is refused until the holder releases it or its TTL runs out;
/// a stale holder's release never evicts its successor.
pub struct SingleFlight {
    held: Arc<Mutex<HashMap<String, (u64, Instant)>>>,
    next_token: AtomicU64,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self {
            held: Arc::new(Mutex::new(HashMap::new())),
            next_token: AtomicU64::new(0),
        }
    }

    pub fn try_acquire(&self, key: &str, ttl: Duration) -> Option<FlightGuard> {
        let mut held = self.held.lock().expect("single-flight table poisoned");
        if let Some((_, acquired_at)) = held.get(key) {
            if acquired_at.elapsed() < ttl {
                return None;
            }
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        held.insert(key.to_string(), (token, Instant::now()));
        Some(FlightGuard {
            key: key.to_string(),
            token,
            held: self.held.clone(),
        })
    }
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FlightGuard {
    key: String,
    token: u64,
    held: Arc<Mutex<HashMap<String, (u64, Instant)>>>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut held = self.held.lock().expect("single-flight table poisoned");
        if held.get(&self.key).map(|(token, _)| *token) == Some(self.token) {
            held.remove(&self.key);
        }
    }
}

static FLIGHTS: Lazy<SingleFlight> = Lazy::new(SingleFlight::new);

/// Dispatch one per-job tick. Dropped silently when a tick for the
/// same job is still running.
pub fn spawn_check_job(engine: Arc<ChainCheckEngine>, job_id: i64) {
    let key = format!("check_job:{}", job_id);
    let ttl = config::check_job_expiry();
    tokio::spawn(async move {
        let Some(_guard) = FLIGHTS.try_acquire(&key, ttl) else {
            debug!(job_id, "Job tick already in flight, dropping");
            return;
        };
        TICKS_TOTAL.with_label_values(&["check_job"]).inc();
        let timer = TICK_DURATION
            .with_label_values(&["check_job"])
            .start_timer();
        if let Err(e) = engine.check_chain(job_id).await {
            error!(job_id, error = %e, "Chain check failed");
        }
        drop(timer);
    });
}

/// Start the block-check worker pool. Workers share the receiving half
/// of the queue and run until it closes.
pub fn spawn_block_workers(
    engine: Arc<ChainCheckEngine>,
    rx: mpsc::Receiver<BlockCheckTask>,
    workers: usize,
    task_expiry: Duration,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    (0..workers)
        .map(|worker| {
            let rx = rx.clone();
            let engine = engine.clone();
            tokio::spawn(async move {
                loop {
                    let task = { rx.lock().await.recv().await };
                    let Some(task) = task else { break };
                    if task.is_expired(task_expiry) {
                        debug!(
                            worker,
                            job_id = task.job_id,
                            height = task.block_height,
                            "Dropping expired block check"
                        );
                        continue;
                    }
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
                            worker,
                            job_id = task.job_id,
                            height = task.block_height,
                            error = %e,
                            "Block check failed"
                        );
                    }
                }
            })
        })
        .collect()
}

/// Top-level timer loop. Each firing dispatches a per-job tick for
/// every enabled job, under its own single-flight lock.
pub async fn run_check_all_loop(engine: Arc<ChainCheckEngine>, all_engine: Arc<ChainCheckAllEngine>) {
    let tick = config::check_all_expiry();
    let mut interval = tokio::time::interval(tick);
    loop {
        interval.tick().await;
        let Some(_guard) = FLIGHTS.try_acquire(CHECK_ALL_TASK, tick) else {
            debug!("Top-level tick already in flight, dropping");
            continue;
        };
        TICKS_TOTAL.with_label_values(&["check_all"]).inc();
        let timer = TICK_DURATION
            .with_label_values(&["check_all"])
            .start_timer();
        match all_engine
            .check_all_chains(|job_id| spawn_check_job(engine.clone(), job_id))
            .await
        {
            Ok(count) => debug!(jobs = count, "Dispatched job ticks"),
            Err(e) => error!(error = %e, "Top-level tick failed"),
        }
        drop(timer);
    }
}

/// Retention sweep timer loop.
pub async fn run_clean_all_loop(all_engine: Arc<ChainCheckAllEngine>) {
    let mut interval = tokio::time::interval(config::clean_all_interval());
    loop {
        interval.tick().await;
        TICKS_TOTAL.with_label_values(&["clean_all"]).inc();
        let timer = TICK_DURATION
            .with_label_values(&["clean_all"])
            .start_timer();
        if let Err(e) = all_engine.clean_all_chains().await {
            error!(error = %e, "Retention sweep failed");
        }
        drop(timer);
    }
}
