// Error reporting seam.
//
// Every non-good block check emits exactly one structured event
// carrying the identifying tags and both sides of the fetch. An
// external error sink subscribes at the tracing layer.

use tracing::error;

use crate::models::ChainBlockFetch;
use crate::telemetry::truncate_hex;
use crate::types::{BlockchainId, CheckStatus, ServiceId};

pub fn report_block_error(
    blockchain_id: BlockchainId,
    block_height: i64,
    service_id: ServiceId,
    status: CheckStatus,
    fetch: &ChainBlockFetch,
) {
    error!(
        job_id = fetch.job_id,
        block_id = ?fetch.block_id,
        block_outcome = status.as_str(),
        service_id = %service_id,
        blockchain_id = %blockchain_id,
        block_height,
        canonical_http_status = fetch.canonical_http_status,
        canonical_block_hash = %truncate_hex(&fetch.canonical_block_hash, 16),
        canonical_prev_hash = %truncate_hex(&fetch.canonical_prev_hash, 16),
        canonical_txn_count = fetch.canonical_txn_count,
        service_http_status = fetch.service_http_status,
        service_block_hash = %truncate_hex(&fetch.service_block_hash, 16),
        service_prev_hash = %truncate_hex(&fetch.service_prev_hash, 16),
        service_txn_count = fetch.service_txn_count,
        "Block error for {} at {} for {}: {}",
        blockchain_id,
        block_height,
        service_id,
        fetch.error_message()
    );
}
