//! Recency tokens and the registry of tokens handed out in drafts
//!
//! A recency token is a recent blockhash plus the last block height at which
//! a transaction referencing it can still land. The registry remembers every
//! token the drafter used so the ceremony can tell "known expired" apart from
//! "never seen" without an extra round trip.

use dashmap::DashMap;
use solana_sdk::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// How long a handed-out token is remembered (well beyond its on-chain validity)
pub const DEFAULT_RECENCY_TTL: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecencyToken {
    pub blockhash: Hash,
    pub last_valid_block_height: u64,
}

impl RecencyToken {
    pub fn new(blockhash: Hash, last_valid_block_height: u64) -> Self {
        Self {
            blockhash,
            last_valid_block_height,
        }
    }

    /// The network's default/null value, never valid in a transaction
    pub fn is_null(&self) -> bool {
        self.blockhash == Hash::default()
    }

    /// Whether a transaction using this token can no longer land at `block_height`
    pub fn is_expired_at(&self, block_height: u64) -> bool {
        block_height > self.last_valid_block_height
    }
}

/// Process-wide TTL store of recency tokens used in drafts
#[derive(Debug)]
pub struct RecencyRegistry {
    entries: DashMap<Hash, (u64, Instant)>,
    ttl: Duration,
}

impl Default for RecencyRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_RECENCY_TTL)
    }
}

impl RecencyRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn remember(&self, token: &RecencyToken) {
        self.entries
            .insert(token.blockhash, (token.last_valid_block_height, Instant::now()));
        if self.entries.len() > 1024 {
            self.prune();
        }
    }

    /// Last valid block height of a remembered, unexpired entry
    pub fn lookup(&self, blockhash: &Hash) -> Option<RecencyToken> {
        let entry = self.entries.get(blockhash)?;
        let (last_valid_block_height, inserted) = *entry;
        if inserted.elapsed() > self.ttl {
            drop(entry);
            self.entries.remove(blockhash);
            return None;
        }
        Some(RecencyToken::new(*blockhash, last_valid_block_height))
    }

    /// Drop entries older than the TTL
    pub fn prune(&self) {
        let before = self.entries.len();
        self.entries
            .retain(|_, (_, inserted)| inserted.elapsed() <= self.ttl);
        debug!(
            removed = before - self.entries.len(),
            remaining = self.entries.len(),
            "Pruned recency registry"
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_expiry() {
        let token = RecencyToken::new(Hash::new_unique(), 100);
        assert!(!token.is_null());
        assert!(!token.is_expired_at(100));
        assert!(token.is_expired_at(101));
        assert!(RecencyToken::new(Hash::default(), 100).is_null());
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_ttl() {
        let registry = RecencyRegistry::new(Duration::from_secs(10));
        let token = RecencyToken::new(Hash::new_unique(), 42);
        registry.remember(&token);
        assert_eq!(registry.lookup(&token.blockhash), Some(token));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(registry.lookup(&token.blockhash), None);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_keeps_fresh_entries() {
        let registry = RecencyRegistry::new(Duration::from_secs(10));
        let old = RecencyToken::new(Hash::new_unique(), 1);
        registry.remember(&old);
        tokio::time::advance(Duration::from_secs(6)).await;
        let fresh = RecencyToken::new(Hash::new_unique(), 2);
        registry.remember(&fresh);
        tokio::time::advance(Duration::from_secs(6)).await;

        registry.prune();
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(&fresh.blockhash).is_some());
    }
}
