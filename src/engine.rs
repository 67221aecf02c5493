// Reconciliation engine.
//
// Two tiers of periodic work: the top-level tick enumerates enabled
// jobs and dispatches one per-job tick each; a per-job tick measures
// the in-flight budget and schedules block checks for expired, missing
// and retry-eligible heights; a per-block worker fetches the same
// height from the canonical source and the audited service, compares,
// and records the outcome.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tracing::{debug, info};

use crate::chainsource::get_chainsource;
use crate::metrics::{BLOCKS_SCHEDULED, CHAIN_TIP_HEIGHT, CHECKS_COMPLETED, INFLIGHT_BLOCKS};
use crate::models::{ChainBlock, ChainBlockFetch, ChainJob};
use crate::queries;
use crate::report::report_block_error;
use crate::scheduler::{BlockCheckTask, BlockScheduler};
use crate::types::{is_good_status, AuditError, BlockchainId, CheckStatus, ServiceId, SourceBlock};

/// Highest height eligible for audit: the finality window below the
/// tip is excluded, and the job's configured end bounds everything.
pub fn final_height(end_height: i64, tip_height: i64, finality_depth: i32) -> i64 {
    end_height.min(tip_height - i64::from(finality_depth) + 1)
}

/// Classify one comparison. The canonical side failing means no
/// comparison was possible; any field disagreement between two good
/// responses is a mismatch.
pub fn compare_blocks(canonical: &SourceBlock, service: &SourceBlock) -> CheckStatus {
    if !is_good_status(canonical.status) {
        CheckStatus::Fail
    } else if canonical.status != service.status
        || canonical.hash != service.hash
        || canonical.prev_hash != service.prev_hash
        || canonical.height != service.height
        || canonical.txn_count != service.txn_count
    {
        CheckStatus::Bad
    } else {
        CheckStatus::Good
    }
}

/// Runs per-job ticks and per-block checks.
pub struct ChainCheckEngine {
    pool: PgPool,
    blocks: BlockScheduler,
    requeue_timedelta: Duration,
    retry_timedelta: Duration,
}

impl ChainCheckEngine {
    pub fn new(
        pool: PgPool,
        blocks: BlockScheduler,
        requeue_timedelta: Duration,
        retry_timedelta: Duration,
    ) -> Self {
        Self {
            pool,
            blocks,
            requeue_timedelta,
            retry_timedelta,
        }
    }

    /// One per-job tick. Schedules at most (inflight_max - inflight)
    /// new block checks, expired pending blocks first, then missing
    /// heights, then stale failures.
    pub async fn check_chain(
        &self,
        job_id: i64,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let now = Utc::now();
        let job = ChainJob::get(&self.pool, job_id).await?;

        info!(
            job_id,
            blockchain_id = %job.blockchain_id,
            finality_depth = job.finality_depth,
            start_height = job.start_height,
            end_height = job.end_height,
            inflight_max = job.inflight_max,
            "Running chain check"
        );

        let canonical = get_chainsource(ServiceId::Canonical, job.blockchain_id)?;
        let chain = canonical.get_chain().await?;
        let Some(tip_height) = chain.chain_height else {
            return Err(AuditError::new(format!(
                "canonical chain height unavailable for {} (status {})",
                job.blockchain_id, chain.status
            ))
            .into());
        };
        CHAIN_TIP_HEIGHT
            .with_label_values(&[job.blockchain_id.as_str()])
            .set(tip_height);

        let final_height = final_height(job.end_height, tip_height, job.finality_depth);
        info!(job_id, final_height, blockchain_id = %job.blockchain_id, "Chain state");
        if final_height < job.start_height {
            debug!(job_id, "No audited heights finalized yet");
            return Ok(());
        }

        let inflight = queries::count_pending(&self.pool, job_id, job.start_height, final_height).await?;
        let mut capacity = (i64::from(job.inflight_max) - inflight).max(0);
        INFLIGHT_BLOCKS
            .with_label_values(&[&job_id.to_string()])
            .set(inflight);
        info!(job_id, inflight, capacity, "Inflight budget");
        if capacity == 0 {
            return Ok(());
        }

        // Pending blocks whose worker never reported back.
        let expired = queries::pending_blocks(
            &self.pool,
            job_id,
            job.start_height,
            final_height,
            capacity,
            now - self.requeue_timedelta,
        )
        .await?;
        info!(job_id, requeue_count = expired.len(), "Expired pending blocks");
        self.reschedule_blocks(now, &job, "expiry", &expired).await?;

        capacity = (capacity - expired.len() as i64).max(0);
        if capacity == 0 {
            return Ok(());
        }

        // Heights with no slot at all.
        let missing = queries::gap_heights(
            &self.pool,
            job_id,
            job.start_height,
            final_height,
            capacity as usize,
        )
        .await?;
        info!(job_id, gap_count = missing.len(), "Missing heights");
        self.schedule_blocks(now, &job, "gap", &missing).await?;

        capacity = (capacity - missing.len() as i64).max(0);
        if capacity == 0 {
            return Ok(());
        }

        // Old failures worth another look.
        let unsuccessful = queries::unsuccessful_blocks(
            &self.pool,
            job_id,
            job.start_height,
            final_height,
            capacity,
            now - self.retry_timedelta,
        )
        .await?;
        info!(job_id, retry_count = unsuccessful.len(), "Retry-eligible blocks");
        self.reschedule_blocks(now, &job, "retry", &unsuccessful).await?;

        Ok(())
    }

    /// One per-block check. Fetches both sides concurrently, records an
    /// immutable fetch row, then moves the slot's status and fetch
    /// pointer together. Safe to run more than once for the same slot.
    pub async fn check_block(
        &self,
        job_id: i64,
        block_id: i64,
        blockchain_id: BlockchainId,
        block_height: i64,
        service_id: ServiceId,
    ) -> Result<CheckStatus, Box<dyn std::error::Error + Send + Sync>> {
        let canonical_source = get_chainsource(ServiceId::Canonical, blockchain_id)?;
        let service_source = get_chainsource(service_id, blockchain_id)?;

        let (canonical_block, service_block) = tokio::join!(
            canonical_source.get_block(block_height),
            service_source.get_block(block_height),
        );
        let canonical_block = canonical_block?;
        let service_block = service_block?;

        let status = compare_blocks(&canonical_block, &service_block);
        let completed = Utc::now();

        let fetch = ChainBlockFetch::create(
            &self.pool,
            job_id,
            Some(block_id),
            &canonical_block,
            &service_block,
        )
        .await?;
        ChainBlock::apply_fetch_result(&self.pool, block_id, status, completed, fetch.id).await?;

        CHECKS_COMPLETED.with_label_values(&[status.as_str()]).inc();
        if status != CheckStatus::Good {
            report_block_error(blockchain_id, block_height, service_id, status, &fetch);
        }
        Ok(status)
    }

    async fn schedule_blocks(
        &self,
        now: DateTime<Utc>,
        job: &ChainJob,
        reason: &str,
        heights: &[i64],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if heights.is_empty() {
            return Ok(());
        }
        let blocks = ChainBlock::bulk_create(&self.pool, job.id, now, heights).await?;
        self.enqueue_blocks(job, reason, &blocks).await
    }

    async fn reschedule_blocks(
        &self,
        now: DateTime<Utc>,
        job: &ChainJob,
        reason: &str,
        blocks: &[ChainBlock],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if blocks.is_empty() {
            return Ok(());
        }
        ChainBlock::bulk_reset(&self.pool, now, blocks).await?;
        self.enqueue_blocks(job, reason, blocks).await
    }

    async fn enqueue_blocks(
        &self,
        job: &ChainJob,
        reason: &str,
        blocks: &[ChainBlock],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        for block in blocks {
            info!(
                job_id = job.id,
                blockchain_id = %job.blockchain_id,
                height = block.block_height,
                reason,
                "Queueing block check"
            );
            BLOCKS_SCHEDULED.with_label_values(&[reason]).inc();
            self.blocks.enqueue(BlockCheckTask::new(job, block)).await?;
        }
        Ok(())
    }
}

/// Runs the top-level dispatch and the retention sweep.
pub struct ChainCheckAllEngine {
    pool: PgPool,
    retention_timedelta: Duration,
}

impl ChainCheckAllEngine {
    pub fn new(pool: PgPool, retention_timedelta: Duration) -> Self {
        Self {
            pool,
            retention_timedelta,
        }
    }

    /// Dispatch one per-job tick for every enabled job. Returns how
    /// many were dispatched.
    pub async fn check_all_chains<F: Fn(i64)>(&self, dispatch: F) -> Result<usize, sqlx::Error> {
        let jobs = ChainJob::find_all_active(&self.pool).await?;
        for job in &jobs {
            dispatch(job.id);
        }
        Ok(jobs.len())
    }

    /// Delete superseded fetch records older than the retention
    /// horizon.
    pub async fn clean_all_chains(&self) -> Result<u64, sqlx::Error> {
        let cutoff = Utc::now() - self.retention_timedelta;
        let deleted = ChainBlockFetch::delete_superseded(&self.pool, cutoff).await?;
        info!(deleted, "Swept superseded fetches");
        Ok(deleted)
    }
}
