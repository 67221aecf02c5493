// Chain source adapters.
//
// Unifies two operations (chain tip, block by height) across the
// heterogeneous REST and JSON-RPC backends the auditor compares. Every
// adapter shares the same transport policy: pooled connections, fixed
// timeouts, and a bounded retry loop on transient HTTP statuses. HTTP
// failures are returned as data, never raised; only transport failures
// (connect, timeout) surface as errors after the retries are spent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::Value;

use crate::config;
use crate::metrics::SOURCE_FETCH_FAILURES;
use crate::types::{is_good_status, AuditError, BlockchainId, Chain, ServiceId, SourceBlock};

const RETRY_STATUS_CODES: [i32; 5] = [404, 429, 500, 503, 504];
const RETRY_MAX: u32 = 3;
const RETRY_BACKOFF_FACTOR: f64 = 0.1;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECTION_POOL_SIZE: usize = 20;

/// One backend able to report a chain tip and individual blocks.
#[async_trait]
pub trait ChainSource: Send + Sync {
    async fn get_chain(&self) -> Result<Chain, AuditError>;
    async fn get_block(&self, block_height: i64) -> Result<SourceBlock, AuditError>;
}

fn build_client() -> Result<reqwest::Client, AuditError> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(READ_TIMEOUT)
        .pool_max_idle_per_host(CONNECTION_POOL_SIZE)
        .build()
        .map_err(|e| AuditError::new(format!("failed to build http client: {}", e)))
}

/// Send a request, retrying transient statuses and transport errors
/// with exponential backoff. The final response is always returned as
/// is; a response with a retryable status after the last attempt is
/// still a response, not an error.
async fn send_with_retry<F>(service: &str, build: F) -> Result<reqwest::Response, AuditError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut attempt: u32 = 0;
    loop {
        match build().send().await {
            Ok(resp) => {
                let status = i32::from(resp.status().as_u16());
                if attempt >= RETRY_MAX || !RETRY_STATUS_CODES.contains(&status) {
                    return Ok(resp);
                }
            }
            Err(e) => {
                if attempt >= RETRY_MAX {
                    SOURCE_FETCH_FAILURES.with_label_values(&[service]).inc();
                    return Err(AuditError::new(format!(
                        "{} request failed after {} retries: {}",
                        service, RETRY_MAX, e
                    )));
                }
            }
        }
        attempt += 1;
        tokio::time::sleep(Duration::from_secs_f64(retry_backoff(attempt))).await;
    }
}

/// Backoff before retry N (1-based): 0.1s, 0.2s, 0.4s.
fn retry_backoff(attempt: u32) -> f64 {
    RETRY_BACKOFF_FACTOR * f64::from(1u32 << (attempt - 1))
}

fn parse_hex_quantity(value: &str) -> Option<i64> {
    i64::from_str_radix(value.trim_start_matches("0x"), 16).ok()
}

/// In-house block node gateway. REST, block lookup is a two step
/// height-to-hash walk.
pub struct Canonical {
    base_url: String,
    token: String,
    blockchain_id: BlockchainId,
    client: reqwest::Client,
}

impl Canonical {
    pub fn new(
        base_url: String,
        token: String,
        blockchain_id: BlockchainId,
    ) -> Result<Self, AuditError> {
        Ok(Self {
            base_url,
            token,
            blockchain_id,
            client: build_client()?,
        })
    }
}

fn canonical_block_from(status: i32, body: &Value) -> SourceBlock {
    SourceBlock {
        status,
        hash: body.get("hash").and_then(|v| v.as_str()).map(String::from),
        prev_hash: body
            .get("prevHash")
            .and_then(|v| v.as_str())
            .map(String::from),
        height: body.get("height").and_then(|v| v.as_i64()),
        txn_count: Some(
            body.get("transactions")
                .and_then(|v| v.as_array())
                .map(|txs| txs.len() as i64)
                .unwrap_or(0),
        ),
    }
}

#[async_trait]
impl ChainSource for Canonical {
    async fn get_chain(&self) -> Result<Chain, AuditError> {
        let url = format!("{}/_coinnode/{}/blockchain/", self.base_url, self.blockchain_id);
        let resp = send_with_retry("canonical", || {
            self.client.get(&url).bearer_auth(&self.token)
        })
        .await?;

        let status = i32::from(resp.status().as_u16());
        if !is_good_status(status) {
            return Ok(Chain { status, chain_height: None });
        }

        let body: Value = match resp.json().await {
            Ok(body) => body,
            Err(_) => return Ok(Chain { status, chain_height: None }),
        };
        Ok(Chain {
            status,
            chain_height: body.get("num_consensus_rounds").and_then(|v| v.as_i64()),
        })
    }

    async fn get_block(&self, block_height: i64) -> Result<SourceBlock, AuditError> {
        let url = format!(
            "{}/_coinnode/{}/heights/{}",
            self.base_url, self.blockchain_id, block_height
        );
        let resp = send_with_retry("canonical", || {
            self.client.get(&url).bearer_auth(&self.token)
        })
        .await?;

        let status = i32::from(resp.status().as_u16());
        if !is_good_status(status) {
            return Ok(SourceBlock::empty(status));
        }
        let body: Value = match resp.json().await {
            Ok(body) => body,
            Err(_) => return Ok(SourceBlock::empty(status)),
        };
        let Some(block_hash) = body.get("blockHash").and_then(|v| v.as_str()) else {
            return Ok(SourceBlock::empty(status));
        };

        let url = format!(
            "{}/_coinnode/{}/blocks/{}",
            self.base_url, self.blockchain_id, block_hash
        );
        let resp = send_with_retry("canonical", || {
            self.client
                .get(&url)
                .bearer_auth(&self.token)
                .query(&[("txidsonly", "true")])
        })
        .await?;

        let status = i32::from(resp.status().as_u16());
        if !is_good_status(status) {
            return Ok(SourceBlock::empty(status));
        }
        let body: Value = match resp.json().await {
            Ok(body) => body,
            Err(_) => return Ok(SourceBlock::empty(status)),
        };
        Ok(canonical_block_from(status, &body))
    }
}

/// Blockset block data API. REST with a bearer token.
pub struct Blockset {
    base_url: String,
    token: String,
    blockchain_id: BlockchainId,
    client: reqwest::Client,
}

impl Blockset {
    pub fn new(
        base_url: String,
        token: String,
        blockchain_id: BlockchainId,
    ) -> Result<Self, AuditError> {
        Ok(Self {
            base_url,
            token,
            blockchain_id,
            client: build_client()?,
        })
    }
}

fn blockset_block_from(status: i32, body: &Value) -> SourceBlock {
    SourceBlock {
        status,
        hash: body.get("hash").and_then(|v| v.as_str()).map(String::from),
        prev_hash: body
            .get("prev_hash")
            .and_then(|v| v.as_str())
            .map(String::from),
        height: body.get("height").and_then(|v| v.as_i64()),
        txn_count: Some(
            body.get("transaction_ids")
                .and_then(|v| v.as_array())
                .map(|txs| txs.len() as i64)
                .unwrap_or(0),
        ),
    }
}

#[async_trait]
impl ChainSource for Blockset {
    async fn get_chain(&self) -> Result<Chain, AuditError> {
        let url = format!("{}/blockchain/{}", self.base_url, self.blockchain_id);
        let resp = send_with_retry("blockset", || {
            self.client.get(&url).bearer_auth(&self.token)
        })
        .await?;

        let status = i32::from(resp.status().as_u16());
        if !is_good_status(status) {
            return Ok(Chain { status, chain_height: None });
        }
        let body: Value = match resp.json().await {
            Ok(body) => body,
            Err(_) => return Ok(Chain { status, chain_height: None }),
        };
        Ok(Chain {
            status,
            chain_height: body.get("block_height").and_then(|v| v.as_i64()),
        })
    }

    async fn get_block(&self, block_height: i64) -> Result<SourceBlock, AuditError> {
        let url = format!(
            "{}/blocks/{}:{}",
            self.base_url, self.blockchain_id, block_height
        );
        let resp = send_with_retry("blockset", || {
            self.client
                .get(&url)
                .bearer_auth(&self.token)
                .query(&[("include_tx_reverted", "false"), ("include_tx_rejected", "false")])
        })
        .await?;

        let status = i32::from(resp.status().as_u16());
        if !is_good_status(status) {
            return Ok(SourceBlock::empty(status));
        }
        let body: Value = match resp.json().await {
            Ok(body) => body,
            Err(_) => return Ok(SourceBlock::empty(status)),
        };
        Ok(blockset_block_from(status, &body))
    }
}

/// Infura JSON-RPC gateway for the Ethereum networks.
pub struct Infura {
    base_url: &'static str,
    project_id: String,
    client: reqwest::Client,
}

impl Infura {
    pub fn new(project_id: String, blockchain_id: BlockchainId) -> Result<Self, AuditError> {
        let base_url = match blockchain_id {
            BlockchainId::EthereumMainnet => "https://mainnet.infura.io/v3",
            BlockchainId::EthereumRopsten => "https://ropsten.infura.io/v3",
            other => {
                return Err(AuditError::new(format!(
                    "infura does not serve blockchain_id={}",
                    other
                )))
            }
        };
        Ok(Self {
            base_url,
            project_id,
            client: build_client()?,
        })
    }

    fn rpc_url(&self) -> String {
        format!("{}/{}", self.base_url, self.project_id)
    }
}

fn infura_block_from(status: i32, result: &Value) -> SourceBlock {
    SourceBlock {
        status,
        hash: result.get("hash").and_then(|v| v.as_str()).map(String::from),
        prev_hash: result
            .get("parentHash")
            .and_then(|v| v.as_str())
            .map(String::from),
        height: result
            .get("number")
            .and_then(|v| v.as_str())
            .and_then(parse_hex_quantity),
        txn_count: Some(
            result
                .get("transactions")
                .and_then(|v| v.as_array())
                .map(|txs| txs.len() as i64)
                .unwrap_or(0),
        ),
    }
}

#[async_trait]
impl ChainSource for Infura {
    async fn get_chain(&self) -> Result<Chain, AuditError> {
        let url = self.rpc_url();
        let resp = send_with_retry("infura", || {
            self.client.post(&url).json(&serde_json::json!({
                "jsonrpc": "2.0", "id": 1, "method": "eth_blockNumber", "params": []
            }))
        })
        .await?;

        let status = i32::from(resp.status().as_u16());
        if !is_good_status(status) {
            return Ok(Chain { status, chain_height: None });
        }
        let body: Value = match resp.json().await {
            Ok(body) => body,
            Err(_) => return Ok(Chain { status, chain_height: None }),
        };
        Ok(Chain {
            status,
            chain_height: body
                .get("result")
                .and_then(|v| v.as_str())
                .and_then(parse_hex_quantity),
        })
    }

    async fn get_block(&self, block_height: i64) -> Result<SourceBlock, AuditError> {
        let url = self.rpc_url();
        let height_param = format!("0x{:x}", block_height);
        let resp = send_with_retry("infura", || {
            self.client.post(&url).json(&serde_json::json!({
                "jsonrpc": "2.0", "id": 1,
                "method": "eth_getBlockByNumber",
                "params": [&height_param, false]
            }))
        })
        .await?;

        let status = i32::from(resp.status().as_u16());
        if !is_good_status(status) {
            return Ok(SourceBlock::empty(status));
        }
        let body: Value = match resp.json().await {
            Ok(body) => body,
            Err(_) => return Ok(SourceBlock::empty(status)),
        };
        let Some(result) = body.get("result").filter(|v| v.is_object()) else {
            return Ok(SourceBlock::empty(status));
        };
        Ok(infura_block_from(status, result))
    }
}

type SourceMap = HashMap<(ServiceId, BlockchainId), Arc<dyn ChainSource>>;

static CHAINSOURCES: Lazy<Mutex<SourceMap>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Chains the canonical gateway does not serve are answered by a
/// designated fallback service instead.
fn rewrite_service(service_id: ServiceId, blockchain_id: BlockchainId) -> ServiceId {
    match (service_id, blockchain_id) {
        (ServiceId::Canonical, BlockchainId::EthereumMainnet)
        | (ServiceId::Canonical, BlockchainId::EthereumRopsten) => ServiceId::Infura,
        _ => service_id,
    }
}

fn build_chainsource(
    service_id: ServiceId,
    blockchain_id: BlockchainId,
) -> Result<Arc<dyn ChainSource>, AuditError> {
    let to_audit_error = |e: Box<dyn std::error::Error>| AuditError::new(e.to_string());
    match service_id {
        ServiceId::Canonical => Ok(Arc::new(Canonical::new(
            config::canonical_url().map_err(to_audit_error)?,
            config::canonical_token().map_err(to_audit_error)?,
            blockchain_id,
        )?)),
        ServiceId::Blockset => Ok(Arc::new(Blockset::new(
            config::blockset_url().map_err(to_audit_error)?,
            config::blockset_token().map_err(to_audit_error)?,
            blockchain_id,
        )?)),
        ServiceId::Infura => Ok(Arc::new(Infura::new(
            config::infura_project_id().map_err(to_audit_error)?,
            blockchain_id,
        )?)),
    }
}

/// Process-wide memoized lookup. Adapters are built on first access per
/// (service, blockchain) key and never evicted.
pub fn get_chainsource(
    service_id: ServiceId,
    blockchain_id: BlockchainId,
) -> Result<Arc<dyn ChainSource>, AuditError> {
    let service_id = rewrite_service(service_id, blockchain_id);

    let mut sources = CHAINSOURCES
        .lock()
        .expect("chainsource registry poisoned");
    if let Some(source) = sources.get(&(service_id, blockchain_id)) {
        return Ok(source.clone());
    }
    let source = build_chainsource(service_id, blockchain_id)?;
    sources.insert((service_id, blockchain_id), source.clone());
    Ok(source)
}

/// Pre-seed the registry with a source instance. Later lookups for the
/// key reuse it instead of building a real adapter.
pub fn register_chainsource(
    service_id: ServiceId,
    blockchain_id: BlockchainId,
    source: Arc<dyn ChainSource>,
) {
    let service_id = rewrite_service(service_id, blockchain_id);
    CHAINSOURCES
        .lock()
        .expect("chainsource registry poisoned")
        .insert((service_id, blockchain_id), source);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retry_backoff_doubles() {
        assert_eq!(retry_backoff(1), 0.1);
        assert_eq!(retry_backoff(2), 0.2);
        assert_eq!(retry_backoff(3), 0.4);
    }

    #[test]
    fn test_parse_hex_quantity() {
        assert_eq!(parse_hex_quantity("0x0"), Some(0));
        assert_eq!(parse_hex_quantity("0xcd"), Some(205));
        assert_eq!(parse_hex_quantity("1f"), Some(31));
        assert_eq!(parse_hex_quantity("not-hex"), None);
    }

    #[test]
    fn test_rewrite_for_unserved_canonical_chains() {
        assert_eq!(
            rewrite_service(ServiceId::Canonical, BlockchainId::EthereumMainnet),
            ServiceId::Infura
        );
        assert_eq!(
            rewrite_service(ServiceId::Canonical, BlockchainId::EthereumRopsten),
            ServiceId::Infura
        );
        assert_eq!(
            rewrite_service(ServiceId::Canonical, BlockchainId::BitcoinMainnet),
            ServiceId::Canonical
        );
        assert_eq!(
            rewrite_service(ServiceId::Blockset, BlockchainId::EthereumMainnet),
            ServiceId::Blockset
        );
    }

    #[test]
    fn test_infura_rejects_unserved_chain() {
        let result = Infura::new("project".to_string(), BlockchainId::BitcoinMainnet);
        assert!(result.is_err());
    }

    #[test]
    fn test_infura_block_parsing() {
        let result = json!({
            "hash": "0xaa", "parentHash": "0xbb", "number": "0x64",
            "transactions": ["0x01", "0x02"]
        });
        let block = infura_block_from(200, &result);
        assert_eq!(block.hash.as_deref(), Some("0xaa"));
        assert_eq!(block.prev_hash.as_deref(), Some("0xbb"));
        assert_eq!(block.height, Some(100));
        assert_eq!(block.txn_count, Some(2));
    }

    #[test]
    fn test_infura_block_empty_transaction_list_defaults_to_zero() {
        let result = json!({"hash": "0xaa", "parentHash": "0xbb", "number": "0x64"});
        let block = infura_block_from(200, &result);
        assert_eq!(block.txn_count, Some(0));
    }

    #[test]
    fn test_blockset_block_parsing() {
        let body = json!({
            "hash": "abc", "prev_hash": "def", "height": 42,
            "transaction_ids": ["t1", "t2", "t3"]
        });
        let block = blockset_block_from(200, &body);
        assert_eq!(block.hash.as_deref(), Some("abc"));
        assert_eq!(block.prev_hash.as_deref(), Some("def"));
        assert_eq!(block.height, Some(42));
        assert_eq!(block.txn_count, Some(3));
    }

    #[test]
    fn test_canonical_block_parsing() {
        let body = json!({
            "hash": "abc", "prevHash": "def", "height": 7,
            "transactions": ["t1"]
        });
        let block = canonical_block_from(200, &body);
        assert_eq!(block.hash.as_deref(), Some("abc"));
        assert_eq!(block.prev_hash.as_deref(), Some("def"));
        assert_eq!(block.height, Some(7));
        assert_eq!(block.txn_count, Some(1));
    }

    #[test]
    fn test_registry_memoizes_registered_sources() {
        struct StubSource;

        #[async_trait]
        impl ChainSource for StubSource {
            async fn get_chain(&self) -> Result<Chain, AuditError> {
                Ok(Chain { status: 200, chain_height: Some(1) })
            }
            async fn get_block(&self, _block_height: i64) -> Result<SourceBlock, AuditError> {
                Ok(SourceBlock::empty(200))
            }
        }

        let stub: Arc<dyn ChainSource> = Arc::new(StubSource);
        register_chainsource(ServiceId::Blockset, BlockchainId::TezosMainnet, stub.clone());
        let looked_up = get_chainsource(ServiceId::Blockset, BlockchainId::TezosMainnet).unwrap();
        assert!(Arc::ptr_eq(&stub, &looked_up));
    }
}
