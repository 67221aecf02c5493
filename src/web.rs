// Read-only JSON views over the audit state.
//
// Serves the dashboard's data: the configured jobs grouped by service,
// per-job bad/fail ranges, and a bucketed status matrix over the
// audited height range. Plus health and metrics endpoints.

use axum::{extract::Path, http::StatusCode, routing::get, Extension, Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::engine::final_height;
use crate::metrics::render_metrics;
use crate::models::ChainJob;
use crate::queries;
use crate::types::{AppState, BlockchainId, CheckStatus, ServiceId};

/// Upper bound on matrix buckets returned for one job.
const MATRIX_BUCKETS_MAX: i64 = 500;

#[derive(Serialize)]
pub struct ApiError {
    pub error: String,
}

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError { error: e.to_string() }),
    )
}

fn not_found() -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::NOT_FOUND,
        Json(ApiError { error: "no such job".to_string() }),
    )
}

fn title_case(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Smallest power-of-ten bucket width keeping the bucket count under
/// the limit.
fn compute_bucket_step(span: i64, max_buckets: i64) -> i64 {
    let mut step = 1i64;
    while (span + step - 1) / step > max_buckets {
        step *= 10;
    }
    step
}

/// Split one island into (bucket_start, count) pieces along bucket
/// boundaries.
fn island_bucket_counts(island_start: i64, island_end: i64, step: i64) -> Vec<(i64, i64)> {
    let mut out = Vec::new();
    let mut bucket_start = (island_start / step) * step;
    while bucket_start <= island_end {
        let piece_start = bucket_start.max(island_start);
        let piece_end = (bucket_start + step - 1).min(island_end);
        out.push((bucket_start, piece_end - piece_start + 1));
        bucket_start += step;
    }
    out
}

#[derive(Serialize)]
struct ChainEntry {
    job_id: i64,
    blockchain_id: BlockchainId,
    blockchain_name: String,
    network_name: &'static str,
    testnet: bool,
    enabled: bool,
}

#[derive(Serialize)]
struct ServiceEntry {
    service_id: ServiceId,
    service_name: String,
    chains: Vec<ChainEntry>,
}

#[derive(Serialize)]
struct ChainsResponse {
    services: Vec<ServiceEntry>,
}

/// GET /api/v1/chains
/// Configured jobs grouped by audited service.
async fn chains_v1(
    Extension(state): Extension<AppState>,
) -> Result<Json<ChainsResponse>, (StatusCode, Json<ApiError>)> {
    let jobs = ChainJob::find_all(&state.pool)
        .await
        .map_err(internal_error)?;

    let mut services: Vec<ServiceEntry> = Vec::new();
    for job in jobs {
        let chain = ChainEntry {
            job_id: job.id,
            blockchain_id: job.blockchain_id,
            blockchain_name: title_case(job.blockchain_id.chain_name()),
            network_name: job.blockchain_id.network_name(),
            testnet: job.blockchain_id.is_testnet(),
            enabled: job.enabled,
        };
        match services.last_mut() {
            Some(service) if service.service_id == job.service_id => {
                service.chains.push(chain);
            }
            _ => services.push(ServiceEntry {
                service_id: job.service_id,
                service_name: title_case(job.service_id.as_str()),
                chains: vec![chain],
            }),
        }
    }
    Ok(Json(ChainsResponse { services }))
}

#[derive(Serialize)]
struct RangeEntry {
    blockchain_id: BlockchainId,
    block_start: i64,
    block_end: i64,
}

#[derive(Serialize)]
struct SummaryResponse {
    job_id: i64,
    bad_ranges: Vec<RangeEntry>,
    fail_ranges: Vec<RangeEntry>,
}

/// GET /api/v1/chains/{job_id}/summary
/// Contiguous ranges of mismatching and failed heights.
async fn chain_summary_v1(
    Path(job_id): Path<i64>,
    Extension(state): Extension<AppState>,
) -> Result<Json<SummaryResponse>, (StatusCode, Json<ApiError>)> {
    let job = match ChainJob::get(&state.pool, job_id).await {
        Ok(job) => job,
        Err(sqlx::Error::RowNotFound) => return Err(not_found()),
        Err(e) => return Err(internal_error(e)),
    };

    let to_ranges = |islands: Vec<(CheckStatus, i64, i64)>| {
        islands
            .into_iter()
            .map(|(_, block_start, block_end)| RangeEntry {
                blockchain_id: job.blockchain_id,
                block_start,
                block_end,
            })
            .collect::<Vec<_>>()
    };

    let bad = queries::islands(
        &state.pool,
        job.id,
        job.start_height,
        job.end_height,
        &[CheckStatus::Bad],
    )
    .await
    .map_err(internal_error)?;
    let fail = queries::islands(
        &state.pool,
        job.id,
        job.start_height,
        job.end_height,
        &[CheckStatus::Fail],
    )
    .await
    .map_err(internal_error)?;

    Ok(Json(SummaryResponse {
        job_id: job.id,
        bad_ranges: to_ranges(bad),
        fail_ranges: to_ranges(fail),
    }))
}

#[derive(Serialize, Default)]
struct MatrixBucket {
    start: i64,
    end: i64,
    total: i64,
    pd: i64,
    gd: i64,
    bd: i64,
    fl: i64,
    missing: i64,
}

#[derive(Serialize)]
struct MatrixResponse {
    job_id: i64,
    service_id: ServiceId,
    blockchain_id: BlockchainId,
    start_height: i64,
    final_height: i64,
    step: i64,
    buckets: Vec<MatrixBucket>,
}

/// GET /api/v1/chains/{job_id}/matrix
/// Bucketed status counts over the audited range. The canonical tip
/// comes through the short-TTL cache.
async fn chain_matrix_v1(
    Path(job_id): Path<i64>,
    Extension(state): Extension<AppState>,
) -> Result<Json<MatrixResponse>, (StatusCode, Json<ApiError>)> {
    let job = match ChainJob::get(&state.pool, job_id).await {
        Ok(job) => job,
        Err(sqlx::Error::RowNotFound) => return Err(not_found()),
        Err(e) => return Err(internal_error(e)),
    };

    let tip = state
        .tips
        .chain_height(job.blockchain_id)
        .await
        .map_err(|e| {
            (
                StatusCode::BAD_GATEWAY,
                Json(ApiError { error: e.to_string() }),
            )
        })?;

    let final_height = final_height(job.end_height, tip, job.finality_depth);
    if final_height < job.start_height {
        return Ok(Json(MatrixResponse {
            job_id: job.id,
            service_id: job.service_id,
            blockchain_id: job.blockchain_id,
            start_height: job.start_height,
            final_height,
            step: 1,
            buckets: Vec::new(),
        }));
    }

    let span = final_height - job.start_height + 1;
    let step = compute_bucket_step(span, MATRIX_BUCKETS_MAX);
    let range_start = (job.start_height / step) * step;
    let bucket_count = ((final_height - range_start) / step + 1) as usize;

    let mut buckets: Vec<MatrixBucket> = (0..bucket_count)
        .map(|i| {
            let bucket_start = range_start + (i as i64) * step;
            let start = bucket_start.max(job.start_height);
            let end = (bucket_start + step - 1).min(final_height);
            MatrixBucket {
                start,
                end,
                total: end - start + 1,
                ..Default::default()
            }
        })
        .collect();

    let add = |buckets: &mut Vec<MatrixBucket>, status: CheckStatus, bucket_start: i64, count: i64| {
        let index = ((bucket_start - range_start) / step) as usize;
        if let Some(bucket) = buckets.get_mut(index) {
            match status {
                CheckStatus::Pending => bucket.pd += count,
                CheckStatus::Good => bucket.gd += count,
                CheckStatus::Bad => bucket.bd += count,
                CheckStatus::Fail => bucket.fl += count,
            }
        }
    };

    let sparse = queries::has_gaps(&state.pool, job.id, job.start_height, final_height)
        .await
        .map_err(internal_error)?;
    if sparse {
        // Count every recorded row per bucket; whatever is left over is
        // missing entirely.
        let counts = queries::status_counts_in_ranges(
            &state.pool,
            job.id,
            job.start_height,
            final_height,
            step,
        )
        .await
        .map_err(internal_error)?;
        for (status, bucket_start, count) in counts {
            add(&mut buckets, status, bucket_start, count);
        }
        for bucket in &mut buckets {
            bucket.missing = bucket.total - (bucket.pd + bucket.gd + bucket.bd + bucket.fl);
        }
    } else {
        // Dense range: the non-good islands are enough, good fills the
        // remainder.
        let islands = queries::islands(
            &state.pool,
            job.id,
            job.start_height,
            final_height,
            &[CheckStatus::Pending, CheckStatus::Bad, CheckStatus::Fail],
        )
        .await
        .map_err(internal_error)?;
        for (status, island_start, island_end) in islands {
            for (bucket_start, count) in island_bucket_counts(island_start, island_end, step) {
                add(&mut buckets, status, bucket_start, count);
            }
        }
        for bucket in &mut buckets {
            bucket.gd = bucket.total - (bucket.pd + bucket.bd + bucket.fl);
        }
    }

    Ok(Json(MatrixResponse {
        job_id: job.id,
        service_id: job.service_id,
        blockchain_id: job.blockchain_id,
        start_height: job.start_height,
        final_height,
        step,
        buckets,
    }))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics_handler() -> String {
    render_metrics()
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/v1/chains", get(chains_v1))
        .route("/api/v1/chains/{job_id}/summary", get(chain_summary_v1))
        .route("/api/v1/chains/{job_id}/matrix", get(chain_matrix_v1))
        .layer(cors)
        .layer(Extension(state))
}

pub async fn start_web_server(
    state: AppState,
    bind: String,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(%bind, "Dashboard API listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
