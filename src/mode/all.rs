//! Lazy invalidation: flushing a tag rotates its version.
//!
//! Every tag has a version string. An entry is stored under a discriminator hashed from the
//! versions of all its tags, so a flush only has to rewrite one version per tag. Entries written
//! under the old discriminator are never read again. They disappear through their TTL, or through
//! [`TaggedCache::prune`](crate::TaggedCache::prune), which recomputes the discriminator of every
//! recorded member and deletes the ones that no longer match.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use async_trait::async_trait;
use redis::{aio::ConnectionLike, Script};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{registry_score, script_ttl, unique_tags, TagMode, PLACEHOLDER};
use crate::{
    namespace::KeyNamespace,
    transport::{Batch, Transport},
    Error, Result,
};

/// KEYS: entry, registry.
/// ARGV: value, ttl (0 = none), registry score, member, tag key head, tag key tail, tags...
const ADD_SCRIPT: &str = r"
local entry = KEYS[1]
local registry = KEYS[2]
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

for i = 7, #ARGV do
    local tag = ARGV[i]
    redis.call('HSET', head .. tag .. tail, member, '1')
    redis.call('ZADD', registry, 'GT', score, tag)
end
return 1
";

/// An entry stays reachable until one of its tags is flushed, relative to the tag versions it was
/// written under.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllMode;

impl AllMode {
    /// Create a new [`AllMode`].
    pub fn new() -> Self {
        Self
    }

    /// Discriminator of a tag set from the tags' current versions.
    ///
    /// With `create`, missing versions are initialised; without it, a missing version means no
    /// entry can exist and `None` is returned.
    async fn discriminator<C>(
        &self,
        conn: &mut Transport<C>,
        tags: &BTreeSet<&str>,
        create: bool,
    ) -> Result<Option<String>>
    where
        C: ConnectionLike + Send,
    {
        let ns = self.namespace();
        let ids: Vec<String> = tags.iter().map(|t| ns.tag_version_id(t)).collect();
        let mut versions = conn.mget(&ids).await?;
        if versions.iter().any(Option::is_none) {
            if !create {
                return Ok(None);
            }
            let mut batch = conn.batch();
            for (id, version) in ids.iter().zip(&versions) {
                if version.is_none() {
                    batch.set_nx(id, new_version().as_bytes(), None).ignore();
                }
            }
            conn.exec::<()>(&batch).await?;
            // re-read, a concurrent writer may have won the SET NX
            versions = conn.mget(&ids).await?;
        }

        let versions = versions
            .into_iter()
            .zip(tags)
            .map(|(version, tag)| version.ok_or_else(|| Error::MissingTagVersion((*tag).to_owned())))
            .collect::<Result<Vec<_>>>()?;
        let pairs: Vec<(&str, &str)> = tags.iter().copied().zip(versions.iter().map(String::as_str)).collect();
        Ok(Some(digest(&pairs)))
    }

    /// Queue the membership of `entry` in each of `tags` and their registry slots.
    fn queue_membership(&self, batch: &mut Batch, entry: &str, tags: &BTreeSet<&str>, ttl: Option<Duration>) {
        let ns = self.namespace();
        let registry = ns.registry_id();
        let score = registry_score(ttl);
        for tag in tags {
            batch.hset(&ns.tag_entries_id(tag), entry, PLACEHOLDER).ignore();
            batch.zadd_gt(&registry, tag, score).ignore();
        }
    }

    /// Id of the entry for `key` under the current versions of `tags`.
    async fn entry_id<C>(
        &self,
        conn: &mut Transport<C>,
        key: &str,
        tags: &BTreeSet<&str>,
        create: bool,
    ) -> Result<Option<String>>
    where
        C: ConnectionLike + Send,
    {
        Ok(self
            .discriminator(conn, tags, create)
            .await?
            .map(|d| self.namespace().entry_id(&d, key)))
    }
}

/// SHA-256 over length-prefixed `(tag, version)` pairs, in tag order.
fn digest(pairs: &[(&str, &str)]) -> String {
    let mut hasher = Sha256::new();
    for (tag, version) in pairs {
        hasher.update((tag.len() as u64).to_be_bytes());
        hasher.update(tag.as_bytes());
        hasher.update((version.len() as u64).to_be_bytes());
        hasher.update(version.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn new_version() -> String {
    Uuid::now_v7().simple().to_string()
}

#[async_trait]
impl TagMode for AllMode {
    fn namespace(&self) -> KeyNamespace {
        KeyNamespace::ALL
    }

    async fn get<C>(&self, conn: &mut Transport<C>, key: &str, tags: &[&str]) -> Result<Option<Vec<u8>>>
    where
        C: ConnectionLike + Send,
    {
        match self.entry_id(conn, key, &unique_tags(tags), false).await? {
            Some(entry) => Ok(conn.get(&entry).await?),
            None => Ok(None),
        }
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
        let tags = unique_tags(tags);
        let Some(entry) = self.entry_id(conn, key, &tags, true).await? else {
            return Ok(());
        };
        let mut batch = conn.batch();
        batch.atomic();
        batch.set(&entry, value, ttl).ignore();
        self.queue_membership(&mut batch, &entry, &tags, ttl);
        conn.exec::<()>(&batch).await?;
        Ok(())
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
        let ns = self.namespace();
        let tags = unique_tags(tags);
        let Some(entry) = self.entry_id(conn, key, &tags, true).await? else {
            return Ok(false);
        };
        if conn.is_cluster() {
            let mut batch = conn.batch();
            batch.set_nx(&entry, value, ttl);
            let (stored,): (Option<String>,) = conn.exec(&batch).await?;
            if stored.is_none() {
                return Ok(false);
            }
            let mut batch = conn.batch();
            self.queue_membership(&mut batch, &entry, &tags, ttl);
            if !batch.is_empty() {
                conn.exec::<()>(&batch).await?;
            }
            return Ok(true);
        }

        let prefix = conn.prefix().to_owned();
        let (head, tail) = ns.tag_key_parts(&prefix);
        let keys = vec![conn.key(&entry), ns.registry_key(&prefix)];
        let mut args = vec![
            value.to_vec(),
            script_ttl(ttl).to_string().into_bytes(),
            registry_score(ttl).to_string().into_bytes(),
            entry.into_bytes(),
            head.into_bytes(),
            tail.as_bytes().to_vec(),
        ];
        args.extend(tags.into_iter().map(|t| t.as_bytes().to_vec()));

        let added: i64 = conn.eval(&Script::new(ADD_SCRIPT), &keys, &args).await?;
        Ok(added == 1)
    }

    async fn forget<C>(&self, conn: &mut Transport<C>, key: &str, tags: &[&str]) -> Result<bool>
    where
        C: ConnectionLike + Send,
    {
        let ns = self.namespace();
        let tags = unique_tags(tags);
        let Some(entry) = self.entry_id(conn, key, &tags, false).await? else {
            return Ok(false);
        };
        let mut batch = conn.batch();
        batch.atomic();
        batch.del(&[entry.clone()]);
        for tag in &tags {
            batch.hdel(&ns.tag_entries_id(tag), &entry).ignore();
        }
        let removed: Vec<u64> = conn.exec(&batch).await?;
        Ok(removed.into_iter().sum::<u64>() > 0)
    }

    #[instrument(skip(self, conn))]
    async fn flush<C>(&self, conn: &mut Transport<C>, tags: &[&str]) -> Result<u64>
    where
        C: ConnectionLike + Send,
    {
        let ns = self.namespace();
        let tags = unique_tags(tags);
        if tags.is_empty() {
            return Ok(0);
        }
        let mut batch = conn.batch();
        batch.atomic();
        for tag in &tags {
            batch.set(&ns.tag_version_id(tag), new_version().as_bytes(), None).ignore();
        }
        conn.exec::<()>(&batch).await?;
        debug!(tags = tags.len(), "rotated tag versions");
        Ok(tags.len() as u64)
    }

    /// Entries whose discriminator no longer matches the current versions of the tags they are
    /// recorded under.
    async fn unreachable<C>(
        &self,
        conn: &mut Transport<C>,
        memberships: &BTreeMap<String, BTreeSet<String>>,
    ) -> Result<Vec<String>>
    where
        C: ConnectionLike + Send,
    {
        let ns = self.namespace();
        let tags: BTreeSet<&str> = memberships.values().flatten().map(String::as_str).collect();
        let ids: Vec<String> = tags.iter().map(|t| ns.tag_version_id(t)).collect();
        let versions: BTreeMap<&str, String> = tags
            .iter()
            .copied()
            .zip(conn.mget(&ids).await?)
            .filter_map(|(tag, version)| Some((tag, version?)))
            .collect();

        let mut unreachable = Vec::new();
        for (entry, tags) in memberships {
            let Some(discriminator) = ns.entry_discriminator(entry) else {
                continue;
            };
            let current: Option<Vec<(&str, &str)>> = tags
                .iter()
                .map(|tag| versions.get(tag.as_str()).map(|v| (tag.as_str(), v.as_str())))
                .collect();
            if current.as_deref().map(digest).as_deref() != Some(discriminator) {
                unreachable.push(entry.clone());
            }
        }
        Ok(unreachable)
    }
}
