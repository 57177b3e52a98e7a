//! Cache-level settings.

use std::time::Duration;

use serde::Deserialize;

use crate::{flush::DEFAULT_BATCH_SIZE, transport::ttl_secs};

/// Settings of a [`TaggedCache`](crate::TaggedCache).
///
/// Every field has a default, so a partial document deserializes:
///
/// ```
/// # #[cfg(feature = "serde_json")] {
/// let config: tagcache::TagCacheConfig =
///     serde_json::from_str(r#"{ "default_ttl_secs": 60 }"#).unwrap();
/// assert_eq!(config.default_ttl(), Some(std::time::Duration::from_secs(60)));
/// assert_eq!(config.flush_batch_size, 1000);
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TagCacheConfig {
    /// TTL applied when a write passes none. `None` (or `0`) stores entries without expiry.
    pub default_ttl_secs: Option<u64>,
    /// `COUNT` hint of keyspace and hash scans.
    pub scan_count: usize,
    /// Keys per delete call of a pattern flush.
    pub flush_batch_size: usize,
}

impl Default for TagCacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: None,
            scan_count: 1000,
            flush_batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl TagCacheConfig {
    /// Set the TTL used when a write does not pass one. Sub-second TTLs round up to one second.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl_secs = Some(ttl_secs(ttl));
        self
    }

    /// Set the scan `COUNT` hint.
    pub fn with_scan_count(mut self, scan_count: usize) -> Self {
        self.scan_count = scan_count;
        self
    }

    /// Set the pattern flush batch size.
    pub fn with_flush_batch_size(mut self, batch_size: usize) -> Self {
        self.flush_batch_size = batch_size;
        self
    }

    /// The default TTL, if any.
    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_secs
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs)
    }

    /// The TTL a write ends up with.
    pub(crate) fn effective_ttl(&self, ttl: Option<Duration>) -> Option<Duration> {
        ttl.or_else(|| self.default_ttl())
    }
}
