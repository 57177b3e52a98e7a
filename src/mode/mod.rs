//! Tag modes decide how tag membership is recorded and what flushing a tag does.
//!
//! - [`AnyMode`]: flushing any one of an entry's tags deletes the entry right away.
//! - [`AllMode`]: entries are stored under a discriminator derived from the current version of
//!   every tag they carry; flushing a tag rotates its version, which abandons those entries.
//!
//! A mode is picked once per [`TaggedCache`](crate::TaggedCache) and never mixed with the other.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Debug,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use redis::aio::ConnectionLike;

pub use all::AllMode;
pub use any::AnyMode;

use crate::{namespace::KeyNamespace, transport::Transport, Result};

pub mod all;
pub mod any;

/// Registry score of entries without expiry (9999-12-31T23:59:59Z).
pub const FOREVER: u64 = 253_402_300_799;

/// Placeholder value of membership hash fields.
pub(crate) const PLACEHOLDER: &str = "1";

/// Page size of `HSCAN` loops over tag entries.
pub(crate) const DEFAULT_SCAN_COUNT: usize = 1000;

/// An invalidation strategy.
///
/// Values reach a mode already encoded; the [`TaggedCache`](crate::TaggedCache) serializes before
/// any network call is made.
#[async_trait]
pub trait TagMode: Debug + Send + Sync {
    /// Key builder of this mode.
    fn namespace(&self) -> KeyNamespace;

    /// Apply the `COUNT` hint of hash scans. Modes that never scan ignore it.
    fn with_scan_count(self, _scan_count: usize) -> Self
    where
        Self: Sized,
    {
        self
    }

    /// Read the raw bytes stored for `key` under `tags`.
    ///
    /// Entries whose tag bookkeeping is inconsistent are reported as missing.
    async fn get<C>(&self, conn: &mut Transport<C>, key: &str, tags: &[&str]) -> Result<Option<Vec<u8>>>
    where
        C: ConnectionLike + Send;

    /// Store `value` for `key` and record its tags.
    async fn put<C>(
        &self,
        conn: &mut Transport<C>,
        key: &str,
        value: &[u8],
        tags: &[&str],
        ttl: Option<Duration>,
    ) -> Result<()>
    where
        C: ConnectionLike + Send;

    /// Store `value` only if `key` holds nothing yet, in one server-side script.
    ///
    /// `value` must be the final bytes, see [`serialize_for_argv`](crate::format::serialize_for_argv).
    async fn add<C>(
        &self,
        conn: &mut Transport<C>,
        key: &str,
        value: &[u8],
        tags: &[&str],
        ttl: Option<Duration>,
    ) -> Result<bool>
    where
        C: ConnectionLike + Send;

    /// Remove `key` and its tag bookkeeping. Returns whether an entry was removed.
    async fn forget<C>(&self, conn: &mut Transport<C>, key: &str, tags: &[&str]) -> Result<bool>
    where
        C: ConnectionLike + Send;

    /// Invalidate everything tagged with any of `tags`.
    ///
    /// Returns the number of entries deleted ([`AnyMode`]) or of tags rotated ([`AllMode`]).
    async fn flush<C>(&self, conn: &mut Transport<C>, tags: &[&str]) -> Result<u64>
    where
        C: ConnectionLike + Send;

    /// Of the existing members in `memberships` (member id to the tags it is recorded under), the
    /// ones no read can reach anymore.
    async fn unreachable<C>(
        &self,
        _conn: &mut Transport<C>,
        _memberships: &BTreeMap<String, BTreeSet<String>>,
    ) -> Result<Vec<String>>
    where
        C: ConnectionLike + Send,
    {
        Ok(Vec::new())
    }
}

/// Tags sorted and without duplicates.
pub(crate) fn unique_tags<'a>(tags: &[&'a str]) -> BTreeSet<&'a str> {
    tags.iter().copied().collect()
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Registry score for an entry written now with the given TTL.
pub(crate) fn registry_score(ttl: Option<Duration>) -> u64 {
    match ttl {
        Some(ttl) => now_secs() + crate::transport::ttl_secs(ttl),
        None => FOREVER,
    }
}

/// TTL argument of the `add` scripts; `0` means no expiry.
pub(crate) fn script_ttl(ttl: Option<Duration>) -> u64 {
    ttl.map_or(0, crate::transport::ttl_secs)
}
