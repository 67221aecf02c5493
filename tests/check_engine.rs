// End-to-end tick and worker behavior against a live database, with
// scripted chain sources standing in for the real gateways. Skips
// cleanly when DATABASE_URL is not set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{migrate::Migrator, PgPool};

use chainaudit::chainsource::{register_chainsource, ChainSource};
use chainaudit::engine::{ChainCheckAllEngine, ChainCheckEngine};
use chainaudit::models::{ChainBlock, ChainBlockFetch, ChainJob, NewChainJob};
use chainaudit::queries;
use chainaudit::scheduler::{BlockCheckTask, BlockScheduler};
use chainaudit::types::{AuditError, BlockchainId, Chain, CheckStatus, ServiceId, SourceBlock};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const CHAIN: BlockchainId = BlockchainId::BitcoinMainnet;

/// Chain source whose tip and blocks are set by the test. Unknown
/// heights come back as a 404 with no payload.
struct ScriptedSource {
    tip: AtomicI64,
    blocks: Mutex<HashMap<i64, SourceBlock>>,
}

impl ScriptedSource {
    fn new(tip: i64) -> Arc<Self> {
        Arc::new(Self {
            tip: AtomicI64::new(tip),
            blocks: Mutex::new(HashMap::new()),
        })
    }

    fn set_tip(&self, tip: i64) {
        self.tip.store(tip, Ordering::SeqCst);
    }

    fn set_block(&self, height: i64, block: SourceBlock) {
        self.blocks.lock().unwrap().insert(height, block);
    }
}

#[async_trait]
impl ChainSource for ScriptedSource {
    async fn get_chain(&self) -> Result<Chain, AuditError> {
        Ok(Chain {
            status: 200,
            chain_height: Some(self.tip.load(Ordering::SeqCst)),
        })
    }

    async fn get_block(&self, block_height: i64) -> Result<SourceBlock, AuditError> {
        Ok(self
            .blocks
            .lock()
            .unwrap()
            .get(&block_height)
            .cloned()
            .unwrap_or_else(|| SourceBlock::empty(404)))
    }
}

fn good_block(height: i64, txn_count: i64) -> SourceBlock {
    SourceBlock {
        status: 200,
        hash: Some(format!("hash-{height}")),
        prev_hash: Some(format!("hash-{}", height - 1)),
        height: Some(height),
        txn_count: Some(txn_count),
    }
}

async fn connect() -> Option<PgPool> {
    let url = match std::env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("skipping check_engine: DATABASE_URL not set");
            return None;
        }
    };
    let pool = match PgPool::connect(&url).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("skipping check_engine: failed to connect: {e}");
            return None;
        }
    };
    if let Err(e) = MIGRATOR.run(&pool).await {
        eprintln!("skipping check_engine: migrations failed: {e}");
        return None;
    }
    Some(pool)
}

fn drain(rx: &mut tokio::sync::mpsc::Receiver<BlockCheckTask>) -> Vec<BlockCheckTask> {
    let mut tasks = Vec::new();
    while let Ok(task) = rx.try_recv() {
        tasks.push(task);
    }
    tasks
}

async fn block_at(pool: &PgPool, job_id: i64, height: i64) -> ChainBlock {
    sqlx::query_as::<_, ChainBlock>(
        "SELECT * FROM chainblock WHERE job_id = $1 AND block_height = $2",
    )
    .bind(job_id)
    .bind(height)
    .fetch_one(pool)
    .await
    .expect("block row exists")
}

#[tokio::test]
async fn job_tick_and_block_worker_lifecycle() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let Some(pool) = connect().await else { return Ok(()) };

    let canonical = ScriptedSource::new(205);
    let service = ScriptedSource::new(205);
    register_chainsource(ServiceId::Canonical, CHAIN, canonical.clone());
    register_chainsource(ServiceId::Blockset, CHAIN, service.clone());

    sqlx::query("DELETE FROM chainjob WHERE name LIKE 'check-engine-%'")
        .execute(&pool)
        .await?;
    let job = ChainJob::create(
        &pool,
        &NewChainJob {
            name: "check-engine-lifecycle".to_string(),
            enabled: true,
            service_id: ServiceId::Blockset,
            blockchain_id: CHAIN,
            start_height: 100,
            end_height: 200,
            inflight_max: 4,
            finality_depth: 3,
        },
    )
    .await?;

    let (blocks, mut rx) = BlockScheduler::new(256);
    let engine = ChainCheckEngine::new(
        pool.clone(),
        blocks,
        Duration::minutes(5),
        Duration::hours(12),
    );

    // First tick on an empty table: tip 205 and depth 3 finalize up to
    // 203, clamped to 200; four slots fit the budget.
    engine.check_chain(job.id).await?;
    let tasks = drain(&mut rx);
    assert_eq!(
        tasks.iter().map(|t| t.block_height).collect::<Vec<_>>(),
        vec![100, 101, 102, 103]
    );
    assert_eq!(tasks[0].service_id, ServiceId::Blockset);
    let inflight = queries::count_pending(&pool, job.id, 100, 200).await?;
    assert_eq!(inflight, 4);
    assert!(inflight <= i64::from(job.inflight_max));

    // A second tick while the budget is saturated schedules nothing.
    engine.check_chain(job.id).await?;
    assert!(drain(&mut rx).is_empty());

    // Height 100 agrees on both sides.
    canonical.set_block(100, good_block(100, 5));
    service.set_block(100, good_block(100, 5));
    let b100 = block_at(&pool, job.id, 100).await;
    let status = engine
        .check_block(job.id, b100.id, CHAIN, 100, ServiceId::Blockset)
        .await?;
    assert_eq!(status, CheckStatus::Good);
    let b100 = block_at(&pool, job.id, 100).await;
    assert_eq!(b100.status, CheckStatus::Good);
    assert!(b100.fetch_id.is_some());

    // Running the same check again converges to the same row state and
    // appends a second fetch, with the newest one referenced.
    let status = engine
        .check_block(job.id, b100.id, CHAIN, 100, ServiceId::Blockset)
        .await?;
    assert_eq!(status, CheckStatus::Good);
    let b100_again = block_at(&pool, job.id, 100).await;
    assert_eq!(b100_again.status, CheckStatus::Good);
    let fetch_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM chainblockfetch WHERE block_id = $1",
    )
    .bind(b100.id)
    .fetch_one(&pool)
    .await?;
    assert_eq!(fetch_count, 2);
    let latest: i64 = sqlx::query_scalar(
        "SELECT MAX(id) FROM chainblockfetch WHERE block_id = $1",
    )
    .bind(b100.id)
    .fetch_one(&pool)
    .await?;
    assert_eq!(b100_again.fetch_id, Some(latest));

    // Height 101: the service claims one extra transaction.
    canonical.set_block(101, good_block(101, 10));
    service.set_block(101, good_block(101, 11));
    let b101 = block_at(&pool, job.id, 101).await;
    let status = engine
        .check_block(job.id, b101.id, CHAIN, 101, ServiceId::Blockset)
        .await?;
    assert_eq!(status, CheckStatus::Bad);
    let b101 = block_at(&pool, job.id, 101).await;
    let fetch = ChainBlockFetch::get(&pool, b101.fetch_id.expect("fetch recorded")).await?;
    assert_eq!(fetch.error_message(), "transaction count mismatch (11 vs 10)");

    // Height 102: the canonical gateway is down.
    canonical.set_block(102, SourceBlock::empty(503));
    service.set_block(102, good_block(102, 2));
    let b102 = block_at(&pool, job.id, 102).await;
    let status = engine
        .check_block(job.id, b102.id, CHAIN, 102, ServiceId::Blockset)
        .await?;
    assert_eq!(status, CheckStatus::Fail);
    let b102 = block_at(&pool, job.id, 102).await;
    let fetch = ChainBlockFetch::get(&pool, b102.fetch_id.expect("fetch recorded")).await?;
    assert_eq!(fetch.error_message(), "canonical block retrieval failure (503)");

    // With three slots resolved the next tick refills from the gap.
    engine.check_chain(job.id).await?;
    let tasks = drain(&mut rx);
    assert_eq!(
        tasks.iter().map(|t| t.block_height).collect::<Vec<_>>(),
        vec![104, 105, 106]
    );
    assert_eq!(queries::count_pending(&pool, job.id, 100, 200).await?, 4);

    // Resolve the gap fills and age height 103's schedule past the
    // requeue window; the next tick requeues it ahead of new gaps.
    for height in [104, 105, 106] {
        canonical.set_block(height, good_block(height, 1));
        service.set_block(height, good_block(height, 1));
        let row = block_at(&pool, job.id, height).await;
        engine
            .check_block(job.id, row.id, CHAIN, height, ServiceId::Blockset)
            .await?;
    }
    sqlx::query(
        "UPDATE chainblock SET scheduled = now() - interval '6 minutes' WHERE job_id = $1 AND block_height = 103",
    )
    .bind(job.id)
    .execute(&pool)
    .await?;

    // Budget 3 after the in-flight slot: the expired requeue takes one
    // and the gap pass fills the rest.
    engine.check_chain(job.id).await?;
    let tasks = drain(&mut rx);
    assert_eq!(
        tasks.iter().map(|t| t.block_height).collect::<Vec<_>>(),
        vec![103, 107, 108]
    );
    let b103 = block_at(&pool, job.id, 103).await;
    assert_eq!(b103.status, CheckStatus::Pending);
    assert_eq!(b103.completed, DateTime::<Utc>::UNIX_EPOCH);
    assert_eq!(b103.fetch_id, None);
    assert!(b103.scheduled > Utc::now() - Duration::minutes(1));

    // Shrink the job so no gaps remain, resolve the open slots, and
    // age the two failures: the retry pass picks them up, lowest
    // height first.
    sqlx::query("UPDATE chainjob SET end_height = 108 WHERE id = $1")
        .bind(job.id)
        .execute(&pool)
        .await?;
    for height in [103, 107, 108] {
        canonical.set_block(height, good_block(height, 1));
        service.set_block(height, good_block(height, 1));
        let row = block_at(&pool, job.id, height).await;
        engine
            .check_block(job.id, row.id, CHAIN, height, ServiceId::Blockset)
            .await?;
    }
    sqlx::query(
        "UPDATE chainblock SET completed = now() - interval '13 hours' WHERE job_id = $1 AND block_height IN (101, 102)",
    )
    .bind(job.id)
    .execute(&pool)
    .await?;

    engine.check_chain(job.id).await?;
    let tasks = drain(&mut rx);
    assert_eq!(
        tasks.iter().map(|t| t.block_height).collect::<Vec<_>>(),
        vec![101, 102]
    );
    let b101 = block_at(&pool, job.id, 101).await;
    assert_eq!(b101.status, CheckStatus::Pending);
    assert_eq!(b101.fetch_id, None);

    // A tip below the audit window makes the tick a no-op.
    canonical.set_tip(90);
    engine.check_chain(job.id).await?;
    assert!(drain(&mut rx).is_empty());
    canonical.set_tip(205);

    Ok(())
}

#[tokio::test]
async fn dispatch_and_retention() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let Some(pool) = connect().await else { return Ok(()) };

    sqlx::query("DELETE FROM chainjob WHERE name LIKE 'dispatch-retention-%'")
        .execute(&pool)
        .await?;
    let enabled = ChainJob::create(
        &pool,
        &NewChainJob {
            name: "dispatch-retention-on".to_string(),
            enabled: true,
            service_id: ServiceId::Blockset,
            blockchain_id: BlockchainId::DogecoinMainnet,
            start_height: 0,
            end_height: 10,
            inflight_max: 1,
            finality_depth: 1,
        },
    )
    .await?;
    let disabled = ChainJob::create(
        &pool,
        &NewChainJob {
            name: "dispatch-retention-off".to_string(),
            enabled: false,
            service_id: ServiceId::Blockset,
            blockchain_id: BlockchainId::TezosMainnet,
            start_height: 0,
            end_height: 10,
            inflight_max: 1,
            finality_depth: 1,
        },
    )
    .await?;

    let all_engine = ChainCheckAllEngine::new(pool.clone(), Duration::days(7));

    // Only enabled jobs are dispatched.
    let dispatched = Mutex::new(Vec::new());
    all_engine
        .check_all_chains(|job_id| dispatched.lock().unwrap().push(job_id))
        .await?;
    let dispatched = dispatched.into_inner().unwrap();
    assert!(dispatched.contains(&enabled.id));
    assert!(!dispatched.contains(&disabled.id));

    // Two fetches for one block; the superseded one ages past the
    // horizon and is swept, the referenced one survives.
    let now = Utc::now();
    let rows = ChainBlock::bulk_create(&pool, enabled.id, now, &[5]).await?;
    let old_fetch = ChainBlockFetch::create(
        &pool,
        enabled.id,
        Some(rows[0].id),
        &SourceBlock::empty(200),
        &SourceBlock::empty(200),
    )
    .await?;
    let new_fetch = ChainBlockFetch::create(
        &pool,
        enabled.id,
        Some(rows[0].id),
        &SourceBlock::empty(200),
        &SourceBlock::empty(200),
    )
    .await?;
    ChainBlock::apply_fetch_result(&pool, rows[0].id, CheckStatus::Good, now, new_fetch.id).await?;
    sqlx::query("UPDATE chainblockfetch SET created = now() - interval '8 days' WHERE id = ANY($1)")
        .bind(vec![old_fetch.id, new_fetch.id])
        .execute(&pool)
        .await?;

    all_engine.clean_all_chains().await?;
    assert!(ChainBlockFetch::get(&pool, old_fetch.id).await.is_err());
    assert!(ChainBlockFetch::get(&pool, new_fetch.id).await.is_ok());
    let kept = ChainBlock::get(&pool, rows[0].id).await?;
    assert_eq!(kept.fetch_id, Some(new_fetch.id));

    Ok(())
}
