//! # Cache Invalidation
//!
//! The core never reads a cache. It only tells one which keys went stale.
//!
//! ```text
//! transaction ──► InvalidationBatch.add("unit:A100", "stock:P1", ...)
//!      │
//!   commit
//!      │
//!      ▼
//! batch.flush(invalidator, notify_cache)  ← after commit, failures logged
//! ```
//!
//! Bulk operations pass `notify_cache = false` to skip the flush entirely
//! (the caller rebuilds the cache itself), instead of toggling any shared
//! state.

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

/// Aggregate key for product listings.
pub const PRODUCTS_LIST_KEY: &str = "products:list";

/// Aggregate key for stock summaries.
pub const STOCK_SUMMARY_KEY: &str = "stock:summary";

/// Per-product stock key.
pub fn stock_key(product_id: &str) -> String {
    format!("stock:{}", product_id)
}

pub fn cart_key(cart_id: &str) -> String {
    format!("cart:{}", cart_id)
}

pub fn invoice_key(invoice_id: &str) -> String {
    format!("invoice:{}", invoice_id)
}

#[derive(Debug, Error)]
#[error("cache invalidation failed for '{key}': {reason}")]
pub struct CacheError {
    pub key: String,
    pub reason: String,
}

/// Receiver of invalidation notices.
pub trait CacheInvalidator: Send + Sync + Debug {
    fn invalidate(&self, key: &str) -> Result<(), CacheError>;
}

/// Drops every notice.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInvalidator;

impl CacheInvalidator for NoopInvalidator {
    fn invalidate(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Keeps every key it is told about. Handy for tests and diagnostics.
#[derive(Debug, Default)]
pub struct RecordingInvalidator {
    keys: Mutex<Vec<String>>,
}

impl RecordingInvalidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.keys.lock().map(|k| k.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut keys) = self.keys.lock() {
            keys.clear();
        }
    }
}

impl CacheInvalidator for RecordingInvalidator {
    fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        let mut keys = self.keys.lock().map_err(|_| CacheError {
            key: key.to_string(),
            reason: "recorder poisoned".to_string(),
        })?;
        keys.push(key.to_string());
        Ok(())
    }
}

/// Keys collected during one transaction.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InvalidationBatch {
    keys: BTreeSet<String>,
}

impl InvalidationBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: impl Into<String>) {
        self.keys.insert(key.into());
    }

    pub fn extend<I, S>(&mut self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys.extend(keys.into_iter().map(Into::into));
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Sends every key once. Call only after the transaction committed.
    ///
    /// Returns how many keys were delivered.
    pub fn flush(self, invalidator: &dyn CacheInvalidator, notify: bool) -> usize {
        if !notify {
            debug!(keys = self.keys.len(), "Cache notification suppressed");
            return 0;
        }

        let mut delivered = 0;
        for key in &self.keys {
            match invalidator.invalidate(key) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(key = %key, error = %e, "Cache invalidation failed"),
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Failing;

    impl CacheInvalidator for Failing {
        fn invalidate(&self, key: &str) -> Result<(), CacheError> {
            Err(CacheError {
                key: key.to_string(),
                reason: "down".to_string(),
            })
        }
    }

    #[test]
    fn test_batch_deduplicates() {
        let recorder = RecordingInvalidator::new();
        let mut batch = InvalidationBatch::new();
        batch.add("unit:A100");
        batch.add("unit:A100");
        batch.extend([STOCK_SUMMARY_KEY, PRODUCTS_LIST_KEY]);

        assert_eq!(batch.flush(&recorder, true), 3);
        assert_eq!(recorder.keys().len(), 3);
    }

    #[test]
    fn test_suppressed_flush_sends_nothing() {
        let recorder = RecordingInvalidator::new();
        let mut batch = InvalidationBatch::new();
        batch.add("unit:A100");
        assert_eq!(batch.flush(&recorder, false), 0);
        assert!(recorder.keys().is_empty());
    }

    #[test]
    fn test_failures_are_swallowed() {
        let mut batch = InvalidationBatch::new();
        batch.add("unit:A100");
        assert_eq!(batch.flush(&Failing, true), 0);
    }
}
