// Database rows for audit jobs, block slots and fetch records.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

use crate::types::{
    is_good_status, BlockchainId, CheckStatus, ServiceId, SourceBlock, UNKNOWN_HASH,
    UNKNOWN_TXN_COUNT,
};

/// Audit configuration for one (service, blockchain) pair.
#[derive(Debug, Clone, FromRow)]
pub struct ChainJob {
    pub id: i64,
    pub name: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub enabled: bool,
    pub service_id: ServiceId,
    pub blockchain_id: BlockchainId,
    pub start_height: i64,
    pub end_height: i64,
    pub inflight_max: i32,
    pub finality_depth: i32,
}

/// Fields for a job row about to be created.
#[derive(Debug, Clone)]
pub struct NewChainJob {
    pub name: String,
    pub enabled: bool,
    pub service_id: ServiceId,
    pub blockchain_id: BlockchainId,
    pub start_height: i64,
    pub end_height: i64,
    pub inflight_max: i32,
    pub finality_depth: i32,
}

impl ChainJob {
    pub async fn create(pool: &PgPool, new: &NewChainJob) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO chainjob
                (name, enabled, service_id, blockchain_id, start_height, end_height, inflight_max, finality_depth)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(&new.name)
        .bind(new.enabled)
        .bind(new.service_id)
        .bind(new.blockchain_id)
        .bind(new.start_height)
        .bind(new.end_height)
        .bind(new.inflight_max)
        .bind(new.finality_depth)
        .fetch_one(pool)
        .await
    }

    pub async fn get(pool: &PgPool, id: i64) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM chainjob WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await
    }

    /// All jobs eligible for scheduling.
    pub async fn find_all_active(pool: &PgPool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM chainjob WHERE enabled ORDER BY id")
            .fetch_all(pool)
            .await
    }

    /// All jobs, ordered for display grouping.
    pub async fn find_all(pool: &PgPool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM chainjob ORDER BY service_id, blockchain_id")
            .fetch_all(pool)
            .await
    }
}

/// One (job, height) audit slot.
#[derive(Debug, Clone, FromRow)]
pub struct ChainBlock {
    pub id: i64,
    pub job_id: i64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub scheduled: DateTime<Utc>,
    pub block_height: i64,
    pub completed: DateTime<Utc>,
    pub status: CheckStatus,
    pub fetch_id: Option<i64>,
}

impl ChainBlock {
    /// Create pending slots for the given heights in one statement.
    /// Heights that already have a slot are skipped; the created rows
    /// come back in ascending height order.
    pub async fn bulk_create(
        pool: &PgPool,
        job_id: i64,
        now: DateTime<Utc>,
        heights: &[i64],
    ) -> Result<Vec<Self>, sqlx::Error> {
        let mut blocks = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO chainblock (job_id, scheduled, block_height, completed, status)
            SELECT $1, $2, h.height, $3, $4 FROM UNNEST($5::bigint[]) AS h(height)
            ON CONFLICT (job_id, block_height) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(now)
        .bind(DateTime::<Utc>::UNIX_EPOCH)
        .bind(CheckStatus::Pending)
        .bind(heights)
        .fetch_all(pool)
        .await?;
        blocks.sort_by_key(|b| b.block_height);
        Ok(blocks)
    }

    /// Return the given slots to the pending state in one statement.
    /// Status, schedule time, completion time and the fetch pointer
    /// move together.
    pub async fn bulk_reset(
        pool: &PgPool,
        now: DateTime<Utc>,
        blocks: &[Self],
    ) -> Result<(), sqlx::Error> {
        let ids: Vec<i64> = blocks.iter().map(|b| b.id).collect();
        sqlx::query(
            r#"
            UPDATE chainblock
            SET status = $1, scheduled = $2, completed = $3, fetch_id = NULL, updated = now()
            WHERE id = ANY($4)
            "#,
        )
        .bind(CheckStatus::Pending)
        .bind(now)
        .bind(DateTime::<Utc>::UNIX_EPOCH)
        .bind(&ids)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Record the outcome of a fetch on the slot. The status and the
    /// fetch pointer always change together.
    pub async fn apply_fetch_result(
        pool: &PgPool,
        block_id: i64,
        status: CheckStatus,
        completed: DateTime<Utc>,
        fetch_id: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE chainblock
            SET status = $1, completed = $2, fetch_id = $3, updated = now()
            WHERE id = $4
            "#,
        )
        .bind(status)
        .bind(completed)
        .bind(fetch_id)
        .bind(block_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn get(pool: &PgPool, id: i64) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM chainblock WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await
    }

    pub fn status_message(&self) -> &'static str {
        self.status.status_message()
    }
}

fn hash_or_unknown(hash: &Option<String>) -> String {
    hash.clone().unwrap_or_else(|| UNKNOWN_HASH.to_string())
}

fn txn_count_or_unknown(txn_count: Option<i64>) -> i64 {
    txn_count.unwrap_or(UNKNOWN_TXN_COUNT)
}

/// Immutable record of one comparison attempt.
#[derive(Debug, Clone, FromRow)]
pub struct ChainBlockFetch {
    pub id: i64,
    pub job_id: i64,
    pub created: DateTime<Utc>,
    pub block_id: Option<i64>,

    pub canonical_http_status: i32,
    pub canonical_block_hash: String,
    pub canonical_prev_hash: String,
    pub canonical_txn_count: i64,

    pub service_http_status: i32,
    pub service_block_hash: String,
    pub service_prev_hash: String,
    pub service_txn_count: i64,
}

impl ChainBlockFetch {
    pub async fn create(
        pool: &PgPool,
        job_id: i64,
        block_id: Option<i64>,
        canonical: &SourceBlock,
        service: &SourceBlock,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO chainblockfetch
                (job_id, block_id,
                 canonical_http_status, canonical_block_hash, canonical_prev_hash, canonical_txn_count,
                 service_http_status, service_block_hash, service_prev_hash, service_txn_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(block_id)
        .bind(canonical.status)
        .bind(hash_or_unknown(&canonical.hash))
        .bind(hash_or_unknown(&canonical.prev_hash))
        .bind(txn_count_or_unknown(canonical.txn_count))
        .bind(service.status)
        .bind(hash_or_unknown(&service.hash))
        .bind(hash_or_unknown(&service.prev_hash))
        .bind(txn_count_or_unknown(service.txn_count))
        .fetch_one(pool)
        .await
    }

    pub async fn get(pool: &PgPool, id: i64) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM chainblockfetch WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await
    }

    /// Delete fetches no block points at any more, once they are older
    /// than the cutoff.
    pub async fn delete_superseded(
        pool: &PgPool,
        created_before: DateTime<Utc>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM chainblockfetch
            WHERE created <= $1
              AND NOT EXISTS (
                  SELECT 1 FROM chainblock b WHERE b.fetch_id = chainblockfetch.id
              )
            "#,
        )
        .bind(created_before)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Human description of what went wrong with this fetch. Empty for
    /// a clean comparison.
    pub fn error_message(&self) -> String {
        if !is_good_status(self.canonical_http_status) {
            return format!(
                "canonical block retrieval failure ({})",
                self.canonical_http_status
            );
        }
        if !is_good_status(self.service_http_status) {
            return format!(
                "service block retrieval failure ({})",
                self.service_http_status
            );
        }

        let mut reasons = Vec::new();
        if self.canonical_block_hash != self.service_block_hash {
            reasons.push(format!("block hash mismatch ({})", self.service_block_hash));
        }
        if self.canonical_prev_hash != self.service_prev_hash {
            reasons.push(format!(
                "previous hash mismatch ({})",
                self.service_prev_hash
            ));
        }
        if self.canonical_txn_count != self.service_txn_count {
            reasons.push(format!(
                "transaction count mismatch ({} vs {})",
                self.service_txn_count, self.canonical_txn_count
            ));
        }
        reasons.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch_with(canonical: &SourceBlock, service: &SourceBlock) -> ChainBlockFetch {
        ChainBlockFetch {
            id: 1,
            job_id: 1,
            created: Utc::now(),
            block_id: Some(1),
            canonical_http_status: canonical.status,
            canonical_block_hash: hash_or_unknown(&canonical.hash),
            canonical_prev_hash: hash_or_unknown(&canonical.prev_hash),
            canonical_txn_count: txn_count_or_unknown(canonical.txn_count),
            service_http_status: service.status,
            service_block_hash: hash_or_unknown(&service.hash),
            service_prev_hash: hash_or_unknown(&service.prev_hash),
            service_txn_count: txn_count_or_unknown(service.txn_count),
        }
    }

    fn good_block(txn_count: i64) -> SourceBlock {
        SourceBlock {
            status: 200,
            hash: Some("aa".to_string()),
            prev_hash: Some("bb".to_string()),
            height: Some(100),
            txn_count: Some(txn_count),
        }
    }

    #[test]
    fn test_sentinel_substitution() {
        let fetch = fetch_with(&SourceBlock::empty(503), &good_block(3));
        assert_eq!(fetch.canonical_block_hash, UNKNOWN_HASH);
        assert_eq!(fetch.canonical_prev_hash, UNKNOWN_HASH);
        assert_eq!(fetch.canonical_txn_count, UNKNOWN_TXN_COUNT);
        assert_eq!(fetch.service_txn_count, 3);
    }

    #[test]
    fn test_zero_txn_count_is_not_a_sentinel() {
        assert_eq!(txn_count_or_unknown(Some(0)), 0);
        assert_eq!(txn_count_or_unknown(None), UNKNOWN_TXN_COUNT);
    }

    #[test]
    fn test_error_message_canonical_failure() {
        let fetch = fetch_with(&SourceBlock::empty(503), &good_block(3));
        assert_eq!(
            fetch.error_message(),
            "canonical block retrieval failure (503)"
        );
    }

    #[test]
    fn test_error_message_service_failure() {
        let fetch = fetch_with(&good_block(3), &SourceBlock::empty(429));
        assert_eq!(
            fetch.error_message(),
            "service block retrieval failure (429)"
        );
    }

    #[test]
    fn test_error_message_txn_count_mismatch() {
        let fetch = fetch_with(&good_block(10), &good_block(11));
        assert_eq!(fetch.error_message(), "transaction count mismatch (11 vs 10)");
    }

    #[test]
    fn test_error_message_lists_every_mismatch() {
        let canonical = good_block(10);
        let service = SourceBlock {
            status: 200,
            hash: Some("xx".to_string()),
            prev_hash: Some("yy".to_string()),
            height: Some(100),
            txn_count: Some(11),
        };
        let fetch = fetch_with(&canonical, &service);
        assert_eq!(
            fetch.error_message(),
            "block hash mismatch (xx), previous hash mismatch (yy), transaction count mismatch (11 vs 10)"
        );
    }

    #[test]
    fn test_error_message_clean_comparison_is_empty() {
        let fetch = fetch_with(&good_block(5), &good_block(5));
        assert_eq!(fetch.error_message(), "");
    }
}
