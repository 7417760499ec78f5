//! Address lookup table cache
//!
//! Providers reference lookup tables by address. Resolving a table costs an
//! account fetch, and the same few tables show up in almost every route, so
//! resolved tables are kept for a short TTL and shared across operations.
//! Writers are per key and last-write-wins: a stale entry is still a valid
//! table, it just expires.

use crate::metrics::metrics;
use crate::pipeline::chain::{ChainClient, ChainError};
use crate::pipeline::errors::{ErrorKind, OperationError, Stage};
use crate::pipeline::retry::{retry_with_backoff, RetryConfig, Retryable};
use dashmap::DashMap;
use solana_sdk::{address_lookup_table::AddressLookupTableAccount, pubkey::Pubkey};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default lifetime of a cached table
pub const DEFAULT_LOOKUP_TABLE_TTL: Duration = Duration::from_secs(300);

struct CacheEntry {
    table: AddressLookupTableAccount,
    fetched_at: Instant,
}

/// Process-wide TTL cache of resolved lookup tables
pub struct LookupTableCache {
    entries: DashMap<Pubkey, CacheEntry>,
    ttl: Duration,
}

impl Default for LookupTableCache {
    fn default() -> Self {
        Self::new(DEFAULT_LOOKUP_TABLE_TTL)
    }
}

impl LookupTableCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Cached table, if present and fresh
    pub fn get(&self, key: &Pubkey) -> Option<AddressLookupTableAccount> {
        let entry = self.entries.get(key)?;
        if entry.fetched_at.elapsed() < self.ttl {
            debug!(table = %key, age_ms = entry.fetched_at.elapsed().as_millis() as u64, "Cache hit");
            Some(entry.table.clone())
        } else {
            None
        }
    }

    pub fn insert(&self, table: AddressLookupTableAccount) {
        self.entries.insert(
            table.key,
            CacheEntry {
                table,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Resolve tables in order, fetching misses through the retry primitive
    pub async fn resolve(
        &self,
        chain: &dyn ChainClient,
        keys: &[Pubkey],
        retry: &RetryConfig,
        cancel: &CancellationToken,
    ) -> Result<Vec<AddressLookupTableAccount>, OperationError> {
        let mut tables = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(table) = self.get(key) {
                metrics().lookup_table_cache_hits.inc();
                tables.push(table);
                continue;
            }

            metrics().lookup_table_cache_misses.inc();
            let table = retry_with_backoff("lookup_table", retry, cancel, || chain.lookup_table(key))
                .await
                .map_err(|e| lookup_error(key, e))?;
            debug!(table = %key, addresses = table.addresses.len(), "Resolved lookup table");
            self.insert(table.clone());
            tables.push(table);
        }
        Ok(tables)
    }

    /// Clear expired cache entries
    pub fn prune(&self) {
        self.entries
            .retain(|_, entry| entry.fetched_at.elapsed() < self.ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn lookup_error(key: &Pubkey, err: ChainError) -> OperationError {
    OperationError::new(
        ErrorKind::MalformedInstruction,
        Stage::Compose,
        format!("lookup table {key} could not be resolved"),
    )
    .with_retryable(err.is_transient())
    .with_logs(err.diagnostic())
}
