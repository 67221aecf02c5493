// Chain tip caching.
//
// The dashboard resolves the canonical tip through a short TTL cache
// so page loads do not hammer the gateway. The scheduler never uses
// this; job ticks always fetch the tip fresh.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::Mutex;

use crate::chainsource::get_chainsource;
use crate::types::{AuditError, BlockchainId, ServiceId};

/// TTL for the dashboard's view of a chain tip.
pub const CHAIN_TIP_TTL: Duration = Duration::from_secs(10);

const TIP_CACHE_CAPACITY: usize = 64;

/// Cache entry with TTL
#[derive(Debug, Clone)]
struct CachedEntry<T> {
    value: T,
    expires_at: Instant,
}

impl<T> CachedEntry<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Read-through cache of canonical chain tips, one entry per
/// blockchain.
pub struct TipCache {
    entries: Mutex<LruCache<BlockchainId, CachedEntry<i64>>>,
    ttl: Duration,
}

impl TipCache {
    pub fn new(ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(TIP_CACHE_CAPACITY).expect("cache capacity is nonzero");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Cached canonical tip height, fetching on miss or expiry.
    pub async fn chain_height(
        &self,
        blockchain_id: BlockchainId,
    ) -> Result<i64, Box<dyn std::error::Error + Send + Sync>> {
        {
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.get(&blockchain_id) {
                if !entry.is_expired() {
                    return Ok(entry.value);
                }
            }
        }

        let source = get_chainsource(ServiceId::Canonical, blockchain_id)?;
        let chain = source.get_chain().await?;
        let Some(height) = chain.chain_height else {
            return Err(AuditError::new(format!(
                "canonical chain height unavailable for {} (status {})",
                blockchain_id, chain.status
            ))
            .into());
        };

        self.entries
            .lock()
            .await
            .put(blockchain_id, CachedEntry::new(height, self.ttl));
        Ok(height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chainsource::{register_chainsource, ChainSource};
    use crate::types::{Chain, SourceBlock};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    /// Reports a tip that grows by one on every fetch, so cache hits
    /// are distinguishable from fresh reads.
    struct CountingSource {
        tip: AtomicI64,
    }

    #[async_trait]
    impl ChainSource for CountingSource {
        async fn get_chain(&self) -> Result<Chain, AuditError> {
            let tip = self.tip.fetch_add(1, Ordering::SeqCst);
            Ok(Chain {
                status: 200,
                chain_height: Some(tip),
            })
        }

        async fn get_block(&self, _block_height: i64) -> Result<SourceBlock, AuditError> {
            Ok(SourceBlock::empty(404))
        }
    }

    #[tokio::test]
    async fn test_tip_is_cached_within_ttl() {
        register_chainsource(
            ServiceId::Canonical,
            BlockchainId::HederaMainnet,
            Arc::new(CountingSource { tip: AtomicI64::new(100) }),
        );

        let cache = TipCache::new(Duration::from_secs(60));
        let first = cache.chain_height(BlockchainId::HederaMainnet).await.unwrap();
        let second = cache.chain_height(BlockchainId::HederaMainnet).await.unwrap();
        assert_eq!(first, 100);
        assert_eq!(second, 100);
    }

    #[tokio::test]
    async fn test_expired_tip_is_refetched() {
        register_chainsource(
            ServiceId::Canonical,
            BlockchainId::RippleMainnet,
            Arc::new(CountingSource { tip: AtomicI64::new(200) }),
        );

        let cache = TipCache::new(Duration::ZERO);
        let first = cache.chain_height(BlockchainId::RippleMainnet).await.unwrap();
        let second = cache.chain_height(BlockchainId::RippleMainnet).await.unwrap();
        assert_eq!(first, 200);
        assert_eq!(second, 201);
    }
}
