//! Tag-aware cache invalidation on top of the Redis wire protocol.
//!
//! Entries are written with a set of tags, and flushing a tag invalidates every entry carrying it.
//! Two invalidation modes are available, picked once per cache:
//!
//! - [`AnyMode`]: flushing any one tag of an entry deletes the entry immediately.
//! - [`AllMode`]: entries are stored under a discriminator derived from their tags' versions and a
//!   flush rotates the version, so the flush costs the same regardless of how many entries exist.
//!
//! Every operation runs on a [`Transport`], which wraps a connection the caller already holds and
//! applies the configured key prefix the way a prefixing Redis client would.
//!
//! #### Example
//! ```
//! use redis::Client;
//! use tagcache::{AnyMode, CacheValue, TagCacheConfig, TaggedCache, Transport, TransportOptions};
//!
//! #[tokio::main]
//! async fn main() {
//! # if let Ok(server) = std::env::var("REDIS_SERVER") {
//!     let client = Client::open(server).unwrap();
//!     let conn = client.get_multiplexed_async_connection().await.unwrap();
//!     let mut conn = Transport::new(conn, TransportOptions::default().with_prefix("doc:"));
//!     let cache = TaggedCache::new(AnyMode::new(), TagCacheConfig::default());
//!
//!     cache.put(&mut conn, "user:1", "alice", &["users"], None).await.unwrap();
//!     assert_eq!(
//!         cache.get(&mut conn, "user:1", &["users"]).await.unwrap(),
//!         Some(CacheValue::from("alice"))
//!     );
//!     cache.flush_tags(&mut conn, &["users"]).await.unwrap(); // invalidate by tag
//!     assert_eq!(cache.get(&mut conn, "user:1", &["users"]).await.unwrap(), None);
//! # }
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::dbg_macro, clippy::use_debug)]
#![warn(missing_docs, missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    time::Duration,
};

use redis::{aio::ConnectionLike, RedisError};
use tracing::{debug, instrument};

pub use config::TagCacheConfig;
use format::FormatError;
pub use format::CacheValue;
pub use mode::{AllMode, AnyMode, TagMode};
use namespace::KeyNamespace;
pub use postcard;
pub use redis;
pub use serde;
#[cfg(feature = "serde_json")]
pub use serde_json;
use scan::SafeScan;
pub use transport::{Transport, TransportOptions};

pub mod config;
pub mod flush;
pub mod format;
pub mod mode;
pub mod namespace;
pub mod scan;
pub mod transport;

#[cfg(test)]
mod fake;

/// A tagged cache with a fixed invalidation mode.
///
/// The cache holds no connection; every method takes the [`Transport`] to run on.
///
/// #### Example
/// ```
/// # use tagcache::{AllMode, TagCacheConfig, TaggedCache, Transport, TransportOptions};
/// # use std::time::Duration;
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// # if let Ok(server) = std::env::var("REDIS_SERVER") {
/// # let client = redis::Client::open(server)?;
/// # let conn = client.get_multiplexed_async_connection().await?;
/// let mut conn = Transport::new(conn, TransportOptions::default().with_prefix("doc_all:"));
/// let cache = TaggedCache::new(AllMode::new(), TagCacheConfig::default());
///
/// cache.put(&mut conn, "foo", 1, &["a"], None).await?;
/// cache.put(&mut conn, "bar", 2, &["a", "b"], None).await?;
/// cache.put(&mut conn, "baz", 3, &["b"], Some(Duration::from_secs(30))).await?;
/// cache.flush_tags(&mut conn, &["a"]).await?; // rotates "a"
/// assert!(cache.get(&mut conn, "foo", &["a"]).await?.is_none());
/// assert!(cache.get(&mut conn, "bar", &["a", "b"]).await?.is_none());
/// assert_eq!(cache.get(&mut conn, "baz", &["b"]).await?.and_then(|v| v.as_int()), Some(3));
/// # }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TaggedCache<M> {
    mode: M,
    config: TagCacheConfig,
}

/// Outcome of [`TaggedCache::prune`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    /// Tags whose every member had expired.
    pub expired_tags: u64,
    /// Memberships pointing at keys that no longer exist.
    pub stale_members: u64,
    /// Entries no read can reach anymore, deleted together with their memberships.
    pub unreachable_entries: u64,
    /// Tags dropped from the registry because they had no members left.
    pub empty_tags: u64,
}

impl<M> TaggedCache<M>
where
    M: TagMode,
{
    /// Create a new [`TaggedCache`]. The mode takes its scan `COUNT` hint from `config`.
    pub fn new(mode: M, config: TagCacheConfig) -> Self {
        let mode = mode.with_scan_count(config.scan_count);
        Self { mode, config }
    }

    /// The invalidation mode.
    pub fn mode(&self) -> &M {
        &self.mode
    }

    /// The cache settings.
    pub fn config(&self) -> &TagCacheConfig {
        &self.config
    }

    /// Key builder of the active mode.
    pub fn namespace(&self) -> KeyNamespace {
        self.mode.namespace()
    }

    /// Get the entry stored for `key`.
    ///
    /// [`AllMode`] needs the tag set the entry was written with; [`AnyMode`] ignores `tags`.
    pub async fn get<C>(&self, conn: &mut Transport<C>, key: &str, tags: &[&str]) -> Result<Option<CacheValue>>
    where
        C: ConnectionLike + Send,
    {
        let raw = self.mode.get(conn, key, tags).await?;
        let raw = raw.map(|raw| conn.decode_value(raw)).transpose()?;
        Ok(format::unserialize(conn.serializes(), raw)?)
    }

    /// Insert a new or overwrite an existing entry.
    ///
    /// Without a `ttl` the configured default applies. An explicit zero `ttl` removes the entry
    /// instead.
    pub async fn put<C>(
        &self,
        conn: &mut Transport<C>,
        key: &str,
        value: impl Into<CacheValue>,
        tags: &[&str],
        ttl: Option<Duration>,
    ) -> Result<()>
    where
        C: ConnectionLike + Send,
    {
        let bytes = conn.encode_value(&format::serialize(conn.serializes(), value.into())?)?;
        match ttl {
            Some(ttl) if ttl.is_zero() => {
                self.mode.forget(conn, key, tags).await?;
            }
            ttl => {
                let ttl = self.config.effective_ttl(ttl);
                self.mode.put(conn, key, &bytes, tags, ttl).await?;
            }
        }
        Ok(())
    }

    /// Insert an entry only if `key` holds nothing yet. Returns whether it was stored.
    ///
    /// The check and the write (including tag bookkeeping) run as one server-side script.
    pub async fn add<C>(
        &self,
        conn: &mut Transport<C>,
        key: &str,
        value: impl Into<CacheValue>,
        tags: &[&str],
        ttl: Option<Duration>,
    ) -> Result<bool>
    where
        C: ConnectionLike + Send,
    {
        let bytes = format::serialize_for_argv(conn, &value.into())?;
        match ttl {
            Some(ttl) if ttl.is_zero() => Ok(false),
            ttl => {
                let ttl = self.config.effective_ttl(ttl);
                self.mode.add(conn, key, &bytes, tags, ttl).await
            }
        }
    }

    /// Invalidate a single entry. Returns whether it existed.
    pub async fn forget<C>(&self, conn: &mut Transport<C>, key: &str, tags: &[&str]) -> Result<bool>
    where
        C: ConnectionLike + Send,
    {
        self.mode.forget(conn, key, tags).await
    }

    /// Invalidate every entry tagged with any of `tags`.
    ///
    /// Returns the number of entries deleted ([`AnyMode`]) or tags rotated ([`AllMode`]).
    pub async fn flush_tags<C>(&self, conn: &mut Transport<C>, tags: &[&str]) -> Result<u64>
    where
        C: ConnectionLike + Send,
    {
        self.mode.flush(conn, tags).await
    }

    /// Delete every key matching `pattern` (relative to the prefix). Returns the number deleted.
    ///
    /// This bypasses tag bookkeeping; stale memberships left behind are removed by
    /// [`prune`](Self::prune) or treated as misses on read.
    pub async fn flush_pattern<C>(&self, conn: &mut Transport<C>, pattern: &str) -> Result<u64>
    where
        C: ConnectionLike + Send,
    {
        let TagCacheConfig {
            scan_count,
            flush_batch_size,
            ..
        } = self.config;
        Ok(flush::flush_by_pattern(conn, pattern, scan_count, flush_batch_size).await?)
    }

    /// Wrap a future to add a caching layer.
    pub async fn cached<C, F>(
        &self,
        conn: &mut Transport<C>,
        key: &str,
        tags: &[&str],
        ttl: Option<Duration>,
        func: F,
    ) -> Result<CacheValue>
    where
        C: ConnectionLike + Send,
        F: Future<Output = CacheValue>,
    {
        if let Some(value) = self.get(conn, key, tags).await? {
            return Ok(value);
        }
        let value = func.await;
        self.put(conn, key, value.clone(), tags, ttl).await?;
        Ok(value)
    }

    /// Wrap a future to add a caching layer.
    /// Cache [`Result::Ok`] variants only.
    pub async fn cached_result<C, E, F>(
        &self,
        conn: &mut Transport<C>,
        key: &str,
        tags: &[&str],
        ttl: Option<Duration>,
        func: F,
    ) -> Result<Result<CacheValue, E>>
    where
        C: ConnectionLike + Send,
        F: Future<Output = Result<CacheValue, E>>,
    {
        if let Some(value) = self.get(conn, key, tags).await? {
            return Ok(Ok(value));
        }
        let value = match func.await {
            Ok(x) => x,
            Err(err) => return Ok(Err(err)),
        };
        self.put(conn, key, value.clone(), tags, ttl).await?;
        Ok(Ok(value))
    }

    /// Wrap a future to add a caching layer.
    /// Cache [`Option::Some`] variants only.
    pub async fn cached_option<C, F>(
        &self,
        conn: &mut Transport<C>,
        key: &str,
        tags: &[&str],
        ttl: Option<Duration>,
        func: F,
    ) -> Result<Option<CacheValue>>
    where
        C: ConnectionLike + Send,
        F: Future<Output = Option<CacheValue>>,
    {
        self.cached_result(conn, key, tags, ttl, async { func.await.ok_or(()) })
            .await
            .map(Result::ok)
    }

    /// Names of all tags that currently have an entries structure, found by scanning the keyspace.
    pub async fn tag_names<C>(&self, conn: &mut Transport<C>) -> Result<Vec<String>>
    where
        C: ConnectionLike + Send,
    {
        let ns = self.namespace();
        let pattern = ns.scan_pattern(conn.prefix());
        let ids = SafeScan::new(conn, &pattern, self.config.scan_count)
            .collect(conn)
            .await?;
        let mut tags: Vec<String> = ids
            .iter()
            .filter_map(|id| ns.tag_from_entries_id(id))
            .map(str::to_owned)
            .collect();
        tags.sort();
        tags.dedup();
        Ok(tags)
    }

    /// Tags the registry still considers live.
    pub async fn registered_tags<C>(&self, conn: &mut Transport<C>) -> Result<Vec<String>>
    where
        C: ConnectionLike + Send,
    {
        let registry = self.namespace().registry_id();
        let now = mode::now_secs().to_string();
        Ok(conn.zrange_by_score(&registry, &now, "+inf").await?)
    }

    /// Member ids recorded for `tag`. In [`AnyMode`] these are the cache keys themselves.
    pub async fn tag_entries<C>(&self, conn: &mut Transport<C>, tag: &str) -> Result<Vec<String>>
    where
        C: ConnectionLike + Send,
    {
        let id = self.namespace().tag_entries_id(tag);
        let mut members = Vec::new();
        let mut cursor = 0;
        loop {
            let (next, page) = conn.hscan(&id, cursor, self.config.scan_count).await?;
            members.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(members)
    }

    /// Sweep the registry.
    ///
    /// Tags whose registry score lies in the past lose their entries structure and registry slot.
    /// For the remaining tags, memberships of keys that no longer exist are removed. Entries the
    /// mode reports as unreachable (in [`AllMode`], those written before one of their tags was
    /// flushed) are deleted with their memberships. Tags left without members are dropped from the
    /// registry.
    #[instrument(skip(self, conn))]
    pub async fn prune<C>(&self, conn: &mut Transport<C>) -> Result<PruneStats>
    where
        C: ConnectionLike + Send,
    {
        let ns = self.namespace();
        let registry = ns.registry_id();
        let mut stats = PruneStats::default();

        let past = format!("({}", mode::now_secs());
        for tag in conn.zrange_by_score(&registry, "-inf", &past).await? {
            let mut batch = conn.batch();
            batch.atomic();
            batch.del(&[ns.tag_entries_id(&tag)]).ignore();
            batch.zrem(&registry, &tag).ignore();
            conn.exec::<()>(&batch).await?;
            stats.expired_tags += 1;
        }

        let tags = self.registered_tags(conn).await?;
        let mut memberships: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for tag in &tags {
            let entries = ns.tag_entries_id(tag);
            let members = self.tag_entries(conn, tag).await?;
            for chunk in members.chunks(self.config.scan_count.max(1)) {
                let present = conn.exists(chunk).await?;
                let mut batch = conn.batch();
                for (member, present) in chunk.iter().zip(present) {
                    if present {
                        memberships.entry(member.clone()).or_default().insert(tag.clone());
                    } else {
                        batch.hdel(&entries, member).ignore();
                        stats.stale_members += 1;
                    }
                }
                if !batch.is_empty() {
                    conn.exec::<()>(&batch).await?;
                }
            }
        }

        for entry in self.mode.unreachable(conn, &memberships).await? {
            let mut batch = conn.batch();
            batch.atomic();
            batch.del(&[entry.clone()]).ignore();
            for tag in memberships.get(&entry).into_iter().flatten() {
                batch.hdel(&ns.tag_entries_id(tag), &entry).ignore();
            }
            conn.exec::<()>(&batch).await?;
            stats.unreachable_entries += 1;
        }

        for tag in &tags {
            if conn.hlen(&ns.tag_entries_id(tag)).await? == 0 {
                let mut batch = conn.batch();
                batch.zrem(&registry, tag).ignore();
                conn.exec::<()>(&batch).await?;
                stats.empty_tags += 1;
            }
        }

        debug!(
            expired_tags = stats.expired_tags,
            stale_members = stats.stale_members,
            unreachable_entries = stats.unreachable_entries,
            empty_tags = stats.empty_tags,
            "pruned tag registry"
        );
        Ok(stats)
    }
}

#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("redis error: {0}")]
    Redis(#[from] RedisError),
    #[error("format error: {0}")]
    Format(#[from] FormatError),
    #[error("version of tag `{0}` is missing right after it was created")]
    MissingTagVersion(String),
}

/// Result type of cache operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
