// Core domain types shared across the engine, adapters and views.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::cache::TipCache;

/// Placeholder stored when a source did not supply a hash.
pub const UNKNOWN_HASH: &str = "unknown";

/// Placeholder stored when a source did not supply a transaction count.
/// A real count of zero is stored as zero.
pub const UNKNOWN_TXN_COUNT: i64 = -1;

/// HTTP statuses treated as a successful fetch.
pub fn is_good_status(status: i32) -> bool {
    (200..300).contains(&status)
}

/// Production-ready error type with context
#[derive(Debug, Clone)]
pub struct AuditError {
    pub message: String,
}

impl AuditError {
    /// Create a new error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for AuditError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AuditError {}

/// Data service providers a job can audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
pub enum ServiceId {
    #[sqlx(rename = "canonical")]
    #[serde(rename = "canonical")]
    Canonical,
    #[sqlx(rename = "blockset")]
    #[serde(rename = "blockset")]
    Blockset,
    #[sqlx(rename = "infura")]
    #[serde(rename = "infura")]
    Infura,
}

impl ServiceId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceId::Canonical => "canonical",
            ServiceId::Blockset => "blockset",
            ServiceId::Infura => "infura",
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServiceId {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "canonical" => Ok(ServiceId::Canonical),
            "blockset" => Ok(ServiceId::Blockset),
            "infura" => Ok(ServiceId::Infura),
            other => Err(AuditError::new(format!("unknown service_id={}", other))),
        }
    }
}

/// Chains the auditor knows how to talk about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
pub enum BlockchainId {
    #[sqlx(rename = "bitcoin-mainnet")]
    #[serde(rename = "bitcoin-mainnet")]
    BitcoinMainnet,
    #[sqlx(rename = "bitcoin-testnet")]
    #[serde(rename = "bitcoin-testnet")]
    BitcoinTestnet,
    #[sqlx(rename = "bitcoincash-mainnet")]
    #[serde(rename = "bitcoincash-mainnet")]
    BitcoincashMainnet,
    #[sqlx(rename = "bitcoincash-testnet")]
    #[serde(rename = "bitcoincash-testnet")]
    BitcoincashTestnet,
    #[sqlx(rename = "bitcoinsv-mainnet")]
    #[serde(rename = "bitcoinsv-mainnet")]
    BitcoinsvMainnet,
    #[sqlx(rename = "dogecoin-mainnet")]
    #[serde(rename = "dogecoin-mainnet")]
    DogecoinMainnet,
    #[sqlx(rename = "litecoin-mainnet")]
    #[serde(rename = "litecoin-mainnet")]
    LitecoinMainnet,
    #[sqlx(rename = "hedera-mainnet")]
    #[serde(rename = "hedera-mainnet")]
    HederaMainnet,
    #[sqlx(rename = "ripple-mainnet")]
    #[serde(rename = "ripple-mainnet")]
    RippleMainnet,
    #[sqlx(rename = "tezos-mainnet")]
    #[serde(rename = "tezos-mainnet")]
    TezosMainnet,
    #[sqlx(rename = "ethereum-mainnet")]
    #[serde(rename = "ethereum-mainnet")]
    EthereumMainnet,
    #[sqlx(rename = "ethereum-ropsten")]
    #[serde(rename = "ethereum-ropsten")]
    EthereumRopsten,
}

impl BlockchainId {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockchainId::BitcoinMainnet => "bitcoin-mainnet",
            BlockchainId::BitcoinTestnet => "bitcoin-testnet",
            BlockchainId::BitcoincashMainnet => "bitcoincash-mainnet",
            BlockchainId::BitcoincashTestnet => "bitcoincash-testnet",
            BlockchainId::BitcoinsvMainnet => "bitcoinsv-mainnet",
            BlockchainId::DogecoinMainnet => "dogecoin-mainnet",
            BlockchainId::LitecoinMainnet => "litecoin-mainnet",
            BlockchainId::HederaMainnet => "hedera-mainnet",
            BlockchainId::RippleMainnet => "ripple-mainnet",
            BlockchainId::TezosMainnet => "tezos-mainnet",
            BlockchainId::EthereumMainnet => "ethereum-mainnet",
            BlockchainId::EthereumRopsten => "ethereum-ropsten",
        }
    }

    /// Chain part of the id, e.g. "bitcoin" for "bitcoin-mainnet".
    pub fn chain_name(&self) -> &'static str {
        self.as_str().split('-').next().unwrap_or_default()
    }

    /// Network part of the id, e.g. "mainnet" for "bitcoin-mainnet".
    pub fn network_name(&self) -> &'static str {
        self.as_str().split('-').nth(1).unwrap_or_default()
    }

    pub fn is_testnet(&self) -> bool {
        self.network_name() != "mainnet"
    }
}

impl fmt::Display for BlockchainId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BlockchainId {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bitcoin-mainnet" => Ok(BlockchainId::BitcoinMainnet),
            "bitcoin-testnet" => Ok(BlockchainId::BitcoinTestnet),
            "bitcoincash-mainnet" => Ok(BlockchainId::BitcoincashMainnet),
            "bitcoincash-testnet" => Ok(BlockchainId::BitcoincashTestnet),
            "bitcoinsv-mainnet" => Ok(BlockchainId::BitcoinsvMainnet),
            "dogecoin-mainnet" => Ok(BlockchainId::DogecoinMainnet),
            "litecoin-mainnet" => Ok(BlockchainId::LitecoinMainnet),
            "hedera-mainnet" => Ok(BlockchainId::HederaMainnet),
            "ripple-mainnet" => Ok(BlockchainId::RippleMainnet),
            "tezos-mainnet" => Ok(BlockchainId::TezosMainnet),
            "ethereum-mainnet" => Ok(BlockchainId::EthereumMainnet),
            "ethereum-ropsten" => Ok(BlockchainId::EthereumRopsten),
            other => Err(AuditError::new(format!("unknown blockchain_id={}", other))),
        }
    }
}

/// Outcome of one audit slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
pub enum CheckStatus {
    #[sqlx(rename = "pd")]
    #[serde(rename = "pd")]
    Pending,
    #[sqlx(rename = "gd")]
    #[serde(rename = "gd")]
    Good,
    #[sqlx(rename = "bd")]
    #[serde(rename = "bd")]
    Bad,
    #[sqlx(rename = "fl")]
    #[serde(rename = "fl")]
    Fail,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Pending => "pd",
            CheckStatus::Good => "gd",
            CheckStatus::Bad => "bd",
            CheckStatus::Fail => "fl",
        }
    }

    pub fn status_message(&self) -> &'static str {
        match self {
            CheckStatus::Pending => "Pending",
            CheckStatus::Good => "Success",
            CheckStatus::Bad => "Comparison Failure",
            CheckStatus::Fail => "Internal Failure",
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chain tip as reported by one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    pub status: i32,
    pub chain_height: Option<i64>,
}

/// Block attributes as reported by one source. Payload fields are None
/// whenever the HTTP status was not good or the body did not parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBlock {
    pub status: i32,
    pub hash: Option<String>,
    pub prev_hash: Option<String>,
    pub height: Option<i64>,
    pub txn_count: Option<i64>,
}

impl SourceBlock {
    /// Block with no payload, as produced by a failed fetch.
    pub fn empty(status: i32) -> Self {
        Self {
            status,
            hash: None,
            prev_hash: None,
            height: None,
            txn_count: None,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub tips: Arc<TipCache>,
}
