// Range analytics over the per-job block table.
//
// Every query is scoped to one job and an inclusive height range, and
// reads a single snapshot. The block table can be sparse; gap and
// island shapes are derived with window functions rather than by
// walking heights one at a time.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::ChainBlock;
use crate::types::CheckStatus;

/// Count of blocks currently pending in the range.
pub async fn count_pending(
    pool: &PgPool,
    job_id: i64,
    start_inclusive: i64,
    end_inclusive: i64,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r#"
        SELECT COUNT(*) FROM chainblock
        WHERE job_id = $1 AND status = $2 AND block_height >= $3 AND block_height <= $4
        "#,
    )
    .bind(job_id)
    .bind(CheckStatus::Pending)
    .bind(start_inclusive)
    .bind(end_inclusive)
    .fetch_one(pool)
    .await
}

pub async fn min_height(
    pool: &PgPool,
    job_id: i64,
    start_inclusive: i64,
    end_inclusive: i64,
) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar::<_, Option<i64>>(
        "SELECT MIN(block_height) FROM chainblock WHERE job_id = $1 AND block_height >= $2 AND block_height <= $3",
    )
    .bind(job_id)
    .bind(start_inclusive)
    .bind(end_inclusive)
    .fetch_one(pool)
    .await
}

pub async fn max_height(
    pool: &PgPool,
    job_id: i64,
    start_inclusive: i64,
    end_inclusive: i64,
) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar::<_, Option<i64>>(
        "SELECT MAX(block_height) FROM chainblock WHERE job_id = $1 AND block_height >= $2 AND block_height <= $3",
    )
    .bind(job_id)
    .bind(start_inclusive)
    .bind(end_inclusive)
    .fetch_one(pool)
    .await
}

/// Inclusive ranges of heights with no block row, in ascending order.
/// An empty table in range yields the whole range as one gap.
pub async fn gaps(
    pool: &PgPool,
    job_id: i64,
    start_inclusive: i64,
    end_inclusive: i64,
) -> Result<Vec<(i64, i64)>, sqlx::Error> {
    let min = min_height(pool, job_id, start_inclusive, end_inclusive).await?;
    let max = max_height(pool, job_id, start_inclusive, end_inclusive).await?;

    let (Some(min), Some(max)) = (min, max) else {
        return Ok(vec![(start_inclusive, end_inclusive)]);
    };

    let mut out = Vec::new();
    if start_inclusive < min {
        out.push((start_inclusive, min - 1));
    }

    // Interior gaps: recorded heights whose successor is not height+1.
    // The last height in range has a NULL lead and drops out.
    let interior: Vec<(i64, i64)> = sqlx::query_as(
        r#"
        SELECT block_height + 1 AS gap_start, next_block_height - 1 AS gap_end
        FROM (
            SELECT block_height,
                   LEAD(block_height) OVER (ORDER BY block_height ASC) AS next_block_height
            FROM chainblock
            WHERE job_id = $1 AND block_height >= $2 AND block_height < $3
        ) nh
        WHERE block_height + 1 <> next_block_height
        ORDER BY gap_start
        "#,
    )
    .bind(job_id)
    .bind(start_inclusive)
    .bind(end_inclusive)
    .fetch_all(pool)
    .await?;
    out.extend(interior);

    if max < end_inclusive {
        out.push((max + 1, end_inclusive));
    }
    Ok(out)
}

/// First `limit` individual heights covered by `gaps`, ascending.
pub async fn gap_heights(
    pool: &PgPool,
    job_id: i64,
    start_inclusive: i64,
    end_inclusive: i64,
    limit: usize,
) -> Result<Vec<i64>, sqlx::Error> {
    let gap_ranges = gaps(pool, job_id, start_inclusive, end_inclusive).await?;
    Ok(flatten_gap_heights(&gap_ranges, limit))
}

/// Expand gap ranges into heights, stopping at the limit so a huge
/// trailing gap never materializes in memory.
pub fn flatten_gap_heights(gap_ranges: &[(i64, i64)], limit: usize) -> Vec<i64> {
    gap_ranges
        .iter()
        .flat_map(|&(gap_start, gap_end)| gap_start..=gap_end)
        .take(limit)
        .collect()
}

/// Maximal contiguous runs of heights sharing a status, restricted to
/// the given statuses, ascending by run start.
pub async fn islands(
    pool: &PgPool,
    job_id: i64,
    start_inclusive: i64,
    end_inclusive: i64,
    statuses: &[CheckStatus],
) -> Result<Vec<(CheckStatus, i64, i64)>, sqlx::Error> {
    let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
    sqlx::query_as(
        r#"
        SELECT status, MIN(block_height) AS island_start, MAX(block_height) AS island_end
        FROM (
            SELECT status, block_height,
                   block_height - ROW_NUMBER() OVER (PARTITION BY status ORDER BY block_height ASC) AS island_seq
            FROM chainblock
            WHERE job_id = $1 AND block_height >= $2 AND block_height <= $3 AND status = ANY($4)
        ) nh
        GROUP BY status, island_seq
        ORDER BY island_start
        "#,
    )
    .bind(job_id)
    .bind(start_inclusive)
    .bind(end_inclusive)
    .bind(&statuses)
    .fetch_all(pool)
    .await
}

/// Per-status counts in fixed-width height buckets. Bucket starts are
/// floored to a multiple of `step`.
pub async fn status_counts_in_ranges(
    pool: &PgPool,
    job_id: i64,
    start_inclusive: i64,
    end_inclusive: i64,
    step: i64,
) -> Result<Vec<(CheckStatus, i64, i64)>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT status, range_start, COUNT(*) AS range_count
        FROM (
            SELECT status, (block_height / $4) * $4 AS range_start
            FROM chainblock
            WHERE job_id = $1 AND block_height >= $2 AND block_height <= $3
        ) ig
        GROUP BY status, range_start
        ORDER BY range_start
        "#,
    )
    .bind(job_id)
    .bind(start_inclusive)
    .bind(end_inclusive)
    .bind(step)
    .fetch_all(pool)
    .await
}

/// Pending blocks scheduled at or before the cutoff, ascending by
/// height, at most `limit`.
pub async fn pending_blocks(
    pool: &PgPool,
    job_id: i64,
    start_inclusive: i64,
    end_inclusive: i64,
    limit: i64,
    scheduled_before: DateTime<Utc>,
) -> Result<Vec<ChainBlock>, sqlx::Error> {
    sqlx::query_as::<_, ChainBlock>(
        r#"
        SELECT * FROM chainblock
        WHERE job_id = $1 AND status = $2
          AND block_height >= $3 AND block_height <= $4
          AND scheduled <= $5
        ORDER BY block_height
        LIMIT $6
        "#,
    )
    .bind(job_id)
    .bind(CheckStatus::Pending)
    .bind(start_inclusive)
    .bind(end_inclusive)
    .bind(scheduled_before)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Bad and failed blocks completed at or before the cutoff, ascending
/// by height, at most `limit`.
pub async fn unsuccessful_blocks(
    pool: &PgPool,
    job_id: i64,
    start_inclusive: i64,
    end_inclusive: i64,
    limit: i64,
    completed_before: DateTime<Utc>,
) -> Result<Vec<ChainBlock>, sqlx::Error> {
    let statuses = vec![
        CheckStatus::Bad.as_str().to_string(),
        CheckStatus::Fail.as_str().to_string(),
    ];
    sqlx::query_as::<_, ChainBlock>(
        r#"
        SELECT * FROM chainblock
        WHERE job_id = $1 AND status = ANY($2)
          AND block_height >= $3 AND block_height <= $4
          AND completed <= $5
        ORDER BY block_height
        LIMIT $6
        "#,
    )
    .bind(job_id)
    .bind(&statuses)
    .bind(start_inclusive)
    .bind(end_inclusive)
    .bind(completed_before)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Cheap test for whether the range has any missing heights.
pub async fn has_gaps(
    pool: &PgPool,
    job_id: i64,
    start_inclusive: i64,
    end_inclusive: i64,
) -> Result<bool, sqlx::Error> {
    let recorded = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM chainblock WHERE job_id = $1 AND block_height >= $2 AND block_height <= $3",
    )
    .bind(job_id)
    .bind(start_inclusive)
    .bind(end_inclusive)
    .fetch_one(pool)
    .await?;
    Ok(recorded < end_inclusive - start_inclusive + 1)
}
