//! Eager invalidation: flushing a tag deletes every entry tagged with it.
//!
//! Each entry is stored under its own key. Membership is kept twice: the tag's entries hash lists
//! the keys tagged with it, and the key's reverse index lists its tags. The reverse index is used
//! to drop stale memberships when a key is rewritten with a different tag set.

use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::ConnectionLike, Script};
use tracing::{debug, instrument, warn};

use super::{registry_score, script_ttl, unique_tags, TagMode, DEFAULT_SCAN_COUNT, PLACEHOLDER};
use crate::{namespace::KeyNamespace, transport::Transport, Result};

/// KEYS: entry, reverse index, registry.
/// ARGV: value, ttl (0 = none), registry score, member, tag key head, tag key tail, tags...
const ADD_SCRIPT: &str = r"
local entry = KEYS[1]
local index = KEYS[2]
local registry = KEYS[3]
local ttl = tonumber(ARGV[2])
local score = ARGV[3]
local member = ARGV[4]
local head = ARGV[5]
local tail = ARGV[6]

if redis.call('EXISTS', entry) == 1 then
    return 0
end

if ttl > 0 then
    redis.call('SET', entry, ARGV[1], 'EX', ttl)
else
    redis.call('SET', entry, ARGV[1])
end

local fresh = {}
for i = 7, #ARGV do
    fresh[ARGV[i]] = true
end
for _, tag in ipairs(redis.call('HKEYS', index)) do
    if not fresh[tag] then
        redis.call('HDEL', head .. tag .. tail, member)
    end
end
redis.call('DEL', index)

for i = 7, #ARGV do
    local tag = ARGV[i]
    redis.call('HSET', head .. tag .. tail, member, '1')
    redis.call('HSET', index, tag, '1')
    redis.call('ZADD', registry, 'GT', score, tag)
end
if ttl > 0 and #ARGV >= 7 then
    redis.call('EXPIRE', index, ttl)
end
return 1
";

/// Any flushed tag removes the entry.
#[derive(Debug, Clone, Copy)]
pub struct AnyMode {
    scan_count: usize,
}

impl Default for AnyMode {
    fn default() -> Self {
        Self::new()
    }
}

impl AnyMode {
    /// Create a new [`AnyMode`].
    pub fn new() -> Self {
        Self {
            scan_count: DEFAULT_SCAN_COUNT,
        }
    }

    /// Store `value` (when given) and replace the tag bookkeeping of `key` in one transaction.
    async fn write<C>(
        &self,
        conn: &mut Transport<C>,
        key: &str,
        value: Option<&[u8]>,
        tags: &[&str],
        ttl: Option<Duration>,
    ) -> Result<()>
    where
        C: ConnectionLike + Send,
    {
        let ns = self.namespace();
        let tags = unique_tags(tags);
        let index = ns.reverse_index_id(key);
        let registry = ns.registry_id();
        let score = registry_score(ttl);
        let previous = conn.hkeys(&index).await?;

        let mut batch = conn.batch();
        batch.atomic();
        if let Some(value) = value {
            batch.set(key, value, ttl).ignore();
        }
        for stale in previous.iter().filter(|t| !tags.contains(t.as_str())) {
            batch.hdel(&ns.tag_entries_id(stale), key).ignore();
        }
        batch.del(&[index.clone()]).ignore();
        if !tags.is_empty() {
            batch.hset_fields(&index, tags.iter().copied(), PLACEHOLDER).ignore();
            if let Some(ttl) = ttl {
                batch.expire(&index, ttl).ignore();
            }
            for tag in &tags {
                batch.hset(&ns.tag_entries_id(tag), key, PLACEHOLDER).ignore();
                batch.zadd_gt(&registry, tag, score).ignore();
            }
        }
        conn.exec::<()>(&batch).await?;
        Ok(())
    }

    /// Delete `key`, its reverse index and its membership in `tags` in one transaction.
    async fn discard<C>(&self, conn: &mut Transport<C>, key: &str, tags: &[String]) -> Result<bool>
    where
        C: ConnectionLike + Send,
    {
        let ns = self.namespace();
        let mut batch = conn.batch();
        batch.atomic();
        batch.del(&[key.to_owned()]);
        batch.del(&[ns.reverse_index_id(key)]).ignore();
        for tag in tags {
            batch.hdel(&ns.tag_entries_id(tag), key).ignore();
        }
        let removed: Vec<u64> = conn.exec(&batch).await?;
        Ok(removed.into_iter().sum::<u64>() > 0)
    }

    /// Delete one page of a flushed tag's members together with their other memberships.
    async fn invalidate_members<C>(&self, conn: &mut Transport<C>, tag: &str, members: &[String]) -> Result<u64>
    where
        C: ConnectionLike + Send,
    {
        let ns = self.namespace();
        let indexes: Vec<String> = members.iter().map(|m| ns.reverse_index_id(m)).collect();

        let mut lookup = conn.batch();
        for index in &indexes {
            lookup.hkeys(index);
        }
        let memberships: Vec<Vec<String>> = conn.exec(&lookup).await?;

        let mut batch = conn.batch();
        batch.atomic();
        batch.del(members);
        batch.del(&indexes).ignore();
        for (member, tags) in members.iter().zip(&memberships) {
            for other in tags.iter().filter(|t| t.as_str() != tag) {
                batch.hdel(&ns.tag_entries_id(other), member).ignore();
            }
        }
        let removed: Vec<u64> = conn.exec(&batch).await?;
        Ok(removed.into_iter().sum())
    }
}

#[async_trait]
impl TagMode for AnyMode {
    fn namespace(&self) -> KeyNamespace {
        KeyNamespace::ANY
    }

    /// Page size used when walking a tag's entries during a flush.
    fn with_scan_count(mut self, scan_count: usize) -> Self {
        self.scan_count = scan_count.max(1);
        self
    }

    async fn get<C>(&self, conn: &mut Transport<C>, key: &str, _tags: &[&str]) -> Result<Option<Vec<u8>>>
    where
        C: ConnectionLike + Send,
    {
        let ns = self.namespace();
        let mut batch = conn.batch();
        batch.get(key).hkeys(&ns.reverse_index_id(key));
        let (value, tags): (Option<Vec<u8>>, Vec<String>) = conn.exec(&batch).await?;
        let Some(value) = value else {
            return Ok(None);
        };
        if tags.is_empty() {
            return Ok(Some(value));
        }

        let mut check = conn.batch();
        for tag in &tags {
            check.hexists(&ns.tag_entries_id(tag), key);
        }
        let present: Vec<bool> = conn.exec(&check).await?;
        if present.into_iter().all(|p| p) {
            return Ok(Some(value));
        }

        debug!(key, "discarding entry with dangling tag membership");
        if let Err(err) = self.discard(conn, key, &tags).await {
            warn!(key, error = %err, "failed to discard inconsistent entry");
        }
        Ok(None)
    }

    async fn put<C>(
        &self,
        conn: &mut Transport<C>,
        key: &str,
        value: &[u8],
        tags: &[&str],
        ttl: Option<Duration>,
    ) -> Result<()>
    where
        C: ConnectionLike + Send,
    {
        self.write(conn, key, Some(value), tags, ttl).await
    }

    async fn add<C>(
        &self,
        conn: &mut Transport<C>,
        key: &str,
        value: &[u8],
        tags: &[&str],
        ttl: Option<Duration>,
    ) -> Result<bool>
    where
        C: ConnectionLike + Send,
    {
        if conn.is_cluster() {
            let mut batch = conn.batch();
            batch.set_nx(key, value, ttl);
            let (stored,): (Option<String>,) = conn.exec(&batch).await?;
            if stored.is_none() {
                return Ok(false);
            }
            self.write(conn, key, None, tags, ttl).await?;
            return Ok(true);
        }

        let ns = self.namespace();
        let prefix = conn.prefix().to_owned();
        let (head, tail) = ns.tag_key_parts(&prefix);
        let keys = vec![
            conn.key(key),
            ns.reverse_index_key(&prefix, key),
            ns.registry_key(&prefix),
        ];
        let mut args = vec![
            value.to_vec(),
            script_ttl(ttl).to_string().into_bytes(),
            registry_score(ttl).to_string().into_bytes(),
            key.as_bytes().to_vec(),
            head.into_bytes(),
            tail.as_bytes().to_vec(),
        ];
        args.extend(unique_tags(tags).into_iter().map(|t| t.as_bytes().to_vec()));

        let added: i64 = conn.eval(&Script::new(ADD_SCRIPT), &keys, &args).await?;
        Ok(added == 1)
    }

    async fn forget<C>(&self, conn: &mut Transport<C>, key: &str, _tags: &[&str]) -> Result<bool>
    where
        C: ConnectionLike + Send,
    {
        let tags = conn.hkeys(&self.namespace().reverse_index_id(key)).await?;
        self.discard(conn, key, &tags).await
    }

    #[instrument(skip(self, conn))]
    async fn flush<C>(&self, conn: &mut Transport<C>, tags: &[&str]) -> Result<u64>
    where
        C: ConnectionLike + Send,
    {
        let ns = self.namespace();
        let registry = ns.registry_id();
        let mut deleted = 0;
        for tag in unique_tags(tags) {
            let entries = ns.tag_entries_id(tag);
            let mut flushed = 0;
            let mut cursor = 0;
            loop {
                let (next, members) = conn.hscan(&entries, cursor, self.scan_count).await?;
                if !members.is_empty() {
                    flushed += self.invalidate_members(conn, tag, &members).await?;
                }
                if next == 0 {
                    break;
                }
                cursor = next;
            }

            let mut batch = conn.batch();
            batch.atomic();
            batch.del(&[entries]).ignore();
            batch.zrem(&registry, tag).ignore();
            conn.exec::<()>(&batch).await?;

            debug!(tag, deleted = flushed, "flushed tag");
            deleted += flushed;
        }
        Ok(deleted)
    }
}
