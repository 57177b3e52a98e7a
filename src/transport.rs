//! The command-execution handle the cache runs its commands through.
//!
//! A [`Transport`] wraps an already connected [`redis::aio::ConnectionLike`] and mirrors the
//! behaviour of a prefixing Redis client:
//!
//! - key arguments of direct commands are prefixed automatically,
//! - `SCAN` patterns are sent verbatim,
//! - `KEYS` and `ARGV` of scripts are sent verbatim.
//!
//! Callers that hand raw key strings to a script or a scan must therefore apply
//! [`Transport::prefix`] themselves.

use std::time::Duration;

use redis::{aio::ConnectionLike, Cmd, FromRedisValue, Pipeline, RedisError, RedisResult, Script, Value};
use serde::Deserialize;
use tracing::debug;

#[cfg(feature = "serde_json")]
use crate::format::JsonFormatter;
use crate::format::{self, CacheValue, FormatError, Formatter, PostcardFormatter, Serialized};

/// Serializer applied by the transport to values of direct commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportSerializer {
    /// [`postcard`] encoding.
    Postcard,
    /// JSON encoding.
    #[cfg(feature = "serde_json")]
    Json,
}

impl TransportSerializer {
    fn encode(self, value: &CacheValue) -> Result<Vec<u8>, FormatError> {
        match self {
            Self::Postcard => PostcardFormatter.serialize(value),
            #[cfg(feature = "serde_json")]
            Self::Json => JsonFormatter.serialize(value),
        }
    }

    fn decode(self, bytes: &[u8]) -> Result<CacheValue, FormatError> {
        match self {
            Self::Postcard => PostcardFormatter.deserialize(bytes),
            #[cfg(feature = "serde_json")]
            Self::Json => JsonFormatter.deserialize(bytes),
        }
    }
}

/// Client-side options of a [`Transport`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    /// Prepended to every key argument of a direct command.
    pub prefix: String,
    /// Encode values of direct commands on the way out (and decode them on the way back).
    pub serializer: Option<TransportSerializer>,
    /// Zlib level applied to every stored value.
    pub compression: Option<u32>,
}

impl TransportOptions {
    /// Set the key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set the transport-side serializer.
    pub fn with_serializer(mut self, serializer: TransportSerializer) -> Self {
        self.serializer = Some(serializer);
        self
    }

    /// Enable zlib compression at the given level.
    pub fn with_compression(mut self, level: u32) -> Self {
        self.compression = Some(level);
        self
    }
}

/// A held connection together with its client-side options.
///
/// For Redis Cluster, `conn` is the cluster-aware connection used for key commands and `masters`
/// holds one direct connection per master node, which keyspace scans visit one by one.
pub struct Transport<C> {
    conn: C,
    masters: Vec<C>,
    options: TransportOptions,
    unlink: bool,
}

impl<C> std::fmt::Debug for Transport<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("options", &self.options)
            .field("masters", &self.masters.len())
            .field("unlink", &self.unlink)
            .finish_non_exhaustive()
    }
}

impl<C> Transport<C> {
    /// Wrap a connection to a single server.
    pub fn new(conn: C, options: TransportOptions) -> Self {
        Self {
            conn,
            masters: Vec::new(),
            options,
            unlink: true,
        }
    }

    /// Wrap a cluster connection and one connection per master node.
    pub fn cluster(conn: C, masters: Vec<C>, options: TransportOptions) -> Self {
        Self {
            conn,
            masters,
            options,
            unlink: true,
        }
    }

    /// The client-side options.
    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// The configured key prefix.
    pub fn prefix(&self) -> &str {
        &self.options.prefix
    }

    /// Whether the transport encodes values of direct commands itself.
    pub fn serializes(&self) -> bool {
        self.options.serializer.is_some()
    }

    /// Whether scans have to visit several master nodes.
    pub fn is_cluster(&self) -> bool {
        !self.masters.is_empty()
    }

    /// Number of nodes a full keyspace scan visits.
    pub fn node_count(&self) -> usize {
        self.masters.len().max(1)
    }

    /// The full key the server sees for a direct command on `id`.
    pub fn key(&self, id: &str) -> String {
        format!("{}{}", self.options.prefix, id)
    }

    /// Turn a serialized value into the bytes sent with a direct command.
    pub fn encode_value(&self, value: &Serialized) -> Result<Vec<u8>, FormatError> {
        let bytes = match (value, self.options.serializer) {
            (Serialized::Value(value), Some(serializer)) => serializer.encode(value)?,
            (Serialized::Value(value), None) => format::encode(value)?,
            (Serialized::Bytes(bytes), _) => bytes.clone(),
        };
        self.compress(bytes)
    }

    /// Turn bytes read with a direct command back into a serialized value.
    pub fn decode_value(&self, raw: Vec<u8>) -> Result<Serialized, FormatError> {
        let raw = match self.options.compression {
            Some(_) => format::decompress(&raw)?,
            None => raw,
        };
        match self.options.serializer {
            Some(serializer) => serializer.decode(&raw).map(Serialized::Value),
            None => Ok(Serialized::Bytes(raw)),
        }
    }

    /// Encode and compress a value the way the transport would, if it has a serializer.
    pub fn pack(&self, value: &CacheValue) -> Option<Result<Vec<u8>, FormatError>> {
        let serializer = self.options.serializer?;
        Some(serializer.encode(value).and_then(|bytes| self.compress(bytes)))
    }

    /// Apply the configured compression, if any.
    pub fn compress(&self, bytes: Vec<u8>) -> Result<Vec<u8>, FormatError> {
        match self.options.compression {
            Some(level) => format::compress(level, &bytes),
            None => Ok(bytes),
        }
    }

    /// Start a batch of direct commands. Keys added to it are prefixed.
    pub fn batch(&self) -> Batch {
        Batch {
            queued: Vec::new(),
            prefix: self.options.prefix.clone(),
            unlink: self.unlink,
            cluster: self.is_cluster(),
            atomic: false,
        }
    }
}

impl<C> Transport<C>
where
    C: ConnectionLike + Send,
{
    /// `GET` a single value.
    pub async fn get(&mut self, id: &str) -> RedisResult<Option<Vec<u8>>> {
        redis::cmd("GET")
            .arg(self.key(id))
            .query_async(&mut self.conn)
            .await
    }

    /// Read several string keys in one round trip.
    pub async fn mget(&mut self, ids: &[String]) -> RedisResult<Vec<Option<String>>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut batch = self.batch();
        for id in ids {
            batch.get(id);
        }
        self.exec(&batch).await
    }

    /// Check which keys exist.
    pub async fn exists(&mut self, ids: &[String]) -> RedisResult<Vec<bool>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut batch = self.batch();
        for id in ids {
            batch.exists(id);
        }
        self.exec(&batch).await
    }

    /// All field names of a hash.
    pub async fn hkeys(&mut self, id: &str) -> RedisResult<Vec<String>> {
        redis::cmd("HKEYS")
            .arg(self.key(id))
            .query_async(&mut self.conn)
            .await
    }

    /// Number of fields in a hash.
    pub async fn hlen(&mut self, id: &str) -> RedisResult<u64> {
        redis::cmd("HLEN")
            .arg(self.key(id))
            .query_async(&mut self.conn)
            .await
    }

    /// One `HSCAN` step, returning the next cursor and the field names of this page.
    pub async fn hscan(&mut self, id: &str, cursor: u64, count: usize) -> RedisResult<(u64, Vec<String>)> {
        let (next, pairs): (u64, Vec<String>) = redis::cmd("HSCAN")
            .arg(self.key(id))
            .arg(cursor)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut self.conn)
            .await?;
        Ok((next, pairs.into_iter().step_by(2).collect()))
    }

    /// Members of a sorted set with a score in `min..=max` (Redis range syntax).
    pub async fn zrange_by_score(&mut self, id: &str, min: &str, max: &str) -> RedisResult<Vec<String>> {
        redis::cmd("ZRANGEBYSCORE")
            .arg(self.key(id))
            .arg(min)
            .arg(max)
            .query_async(&mut self.conn)
            .await
    }

    /// One `SCAN` step on the given node. The pattern is sent as is.
    ///
    /// Returns `None` when the reply is not a `(cursor, keys)` pair.
    pub async fn scan(
        &mut self,
        node: usize,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> RedisResult<Option<(u64, Vec<String>)>> {
        let conn = match self.masters.get_mut(node) {
            Some(master) => master,
            None => &mut self.conn,
        };
        let reply: Value = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(conn)
            .await?;
        Ok(<(u64, Vec<String>)>::from_redis_value(&reply).ok())
    }

    /// Delete keys without blocking the server, falling back to `DEL` where `UNLINK` is unknown.
    ///
    /// Returns the number of keys removed.
    pub async fn unlink(&mut self, ids: &[String]) -> RedisResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        if self.unlink {
            match self.delete_with("UNLINK", ids).await {
                Err(err) if is_unknown_command(&err) => {
                    debug!(error = %err, "server does not know UNLINK, using DEL");
                    self.unlink = false;
                }
                result => return result,
            }
        }
        self.delete_with("DEL", ids).await
    }

    async fn delete_with(&mut self, verb: &str, ids: &[String]) -> RedisResult<u64> {
        if self.is_cluster() {
            // keys of one batch may hash to different slots
            let mut pipe = redis::pipe();
            for id in ids {
                pipe.cmd(verb).arg(self.key(id));
            }
            let counts: Vec<u64> = pipe.query_async(&mut self.conn).await?;
            return Ok(counts.into_iter().sum());
        }
        let keys: Vec<String> = ids.iter().map(|id| self.key(id)).collect();
        redis::cmd(verb).arg(keys).query_async(&mut self.conn).await
    }

    /// Run a batch built with [`Transport::batch`].
    pub async fn exec<T: FromRedisValue>(&mut self, batch: &Batch) -> RedisResult<T> {
        batch.pipeline().query_async(&mut self.conn).await
    }

    /// Run a server-side script. `keys` and `args` are sent verbatim, without prefix or encoding.
    pub async fn eval<T: FromRedisValue>(
        &mut self,
        script: &Script,
        keys: &[String],
        args: &[Vec<u8>],
    ) -> RedisResult<T> {
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg.as_slice());
        }
        invocation.invoke_async(&mut self.conn).await
    }
}

fn is_unknown_command(err: &RedisError) -> bool {
    err.to_string().to_ascii_lowercase().contains("unknown command")
}

/// A pipeline of direct commands whose keys are prefixed like the transport's own.
///
/// On a cluster the batch never runs as a transaction, and deletes are queued one key per
/// command, since the keys of one batch may hash to different slots.
#[derive(Clone)]
pub struct Batch {
    queued: Vec<Queued>,
    prefix: String,
    unlink: bool,
    cluster: bool,
    atomic: bool,
}

#[derive(Clone)]
struct Queued {
    cmds: Vec<Cmd>,
    ignored: bool,
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("prefix", &self.prefix)
            .field("len", &self.queued.len())
            .field("cluster", &self.cluster)
            .finish_non_exhaustive()
    }
}

impl Batch {
    fn key(&self, id: &str) -> String {
        format!("{}{}", self.prefix, id)
    }

    fn push(&mut self, cmds: Vec<Cmd>) -> &mut Self {
        self.queued.push(Queued { cmds, ignored: false });
        self
    }

    fn keyed(&self, name: &str, id: &str) -> Cmd {
        let mut cmd = redis::cmd(name);
        cmd.arg(self.key(id));
        cmd
    }

    /// Number of operations queued.
    pub fn len(&self) -> usize {
        self.queued.len()
    }

    /// Whether nothing has been queued.
    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Run the batch inside `MULTI`/`EXEC`. Ignored on a cluster.
    pub fn atomic(&mut self) -> &mut Self {
        self.atomic = !self.cluster;
        self
    }

    /// Leave the replies of the previous operation out of the result.
    pub fn ignore(&mut self) -> &mut Self {
        if let Some(last) = self.queued.last_mut() {
            last.ignored = true;
        }
        self
    }

    fn pipeline(&self) -> Pipeline {
        let mut pipe = redis::pipe();
        if self.atomic {
            pipe.atomic();
        }
        for queued in &self.queued {
            for cmd in &queued.cmds {
                pipe.add_command(cmd.clone());
                if queued.ignored {
                    pipe.ignore();
                }
            }
        }
        pipe
    }

    /// Queue `GET`.
    pub fn get(&mut self, id: &str) -> &mut Self {
        let cmd = self.keyed("GET", id);
        self.push(vec![cmd])
    }

    /// Queue `EXISTS` for a single key.
    pub fn exists(&mut self, id: &str) -> &mut Self {
        let cmd = self.keyed("EXISTS", id);
        self.push(vec![cmd])
    }

    /// Queue `SET`, with `EX` when a TTL is given. Sub-second TTLs round up to one second.
    pub fn set(&mut self, id: &str, value: &[u8], ttl: Option<Duration>) -> &mut Self {
        let mut cmd = self.keyed("SET", id);
        cmd.arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl_secs(ttl));
        }
        self.push(vec![cmd])
    }

    /// Queue `SET ... NX`, with `EX` when a TTL is given.
    pub fn set_nx(&mut self, id: &str, value: &[u8], ttl: Option<Duration>) -> &mut Self {
        let mut cmd = self.keyed("SET", id);
        cmd.arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl_secs(ttl));
        }
        cmd.arg("NX");
        self.push(vec![cmd])
    }

    /// Queue a delete of the given keys (`UNLINK` unless the server lacks it).
    ///
    /// On a cluster every key gets its own command and its own reply.
    pub fn del(&mut self, ids: &[String]) -> &mut Self {
        let verb = if self.unlink { "UNLINK" } else { "DEL" };
        let cmds = if self.cluster {
            ids.iter().map(|id| self.keyed(verb, id)).collect()
        } else {
            let mut cmd = redis::cmd(verb);
            for id in ids {
                cmd.arg(self.key(id));
            }
            vec![cmd]
        };
        self.push(cmds)
    }

    /// Queue `EXPIRE`.
    pub fn expire(&mut self, id: &str, ttl: Duration) -> &mut Self {
        let mut cmd = self.keyed("EXPIRE", id);
        cmd.arg(ttl_secs(ttl));
        self.push(vec![cmd])
    }

    /// Queue `HKEYS`.
    pub fn hkeys(&mut self, id: &str) -> &mut Self {
        let cmd = self.keyed("HKEYS", id);
        self.push(vec![cmd])
    }

    /// Queue `HEXISTS`.
    pub fn hexists(&mut self, id: &str, field: &str) -> &mut Self {
        let mut cmd = self.keyed("HEXISTS", id);
        cmd.arg(field);
        self.push(vec![cmd])
    }

    /// Queue `HSET` of a single field.
    pub fn hset(&mut self, id: &str, field: &str, value: &str) -> &mut Self {
        let mut cmd = self.keyed("HSET", id);
        cmd.arg(field).arg(value);
        self.push(vec![cmd])
    }

    /// Queue one `HSET` writing `value` to every field in `fields`.
    pub fn hset_fields<'a>(
        &mut self,
        id: &str,
        fields: impl IntoIterator<Item = &'a str>,
        value: &str,
    ) -> &mut Self {
        let mut cmd = self.keyed("HSET", id);
        for field in fields {
            cmd.arg(field).arg(value);
        }
        self.push(vec![cmd])
    }

    /// Queue `HDEL` of a single field.
    pub fn hdel(&mut self, id: &str, field: &str) -> &mut Self {
        let mut cmd = self.keyed("HDEL", id);
        cmd.arg(field);
        self.push(vec![cmd])
    }

    /// Queue `ZADD ... GT`, which only ever raises a member's score.
    pub fn zadd_gt(&mut self, id: &str, member: &str, score: u64) -> &mut Self {
        let mut cmd = self.keyed("ZADD", id);
        cmd.arg("GT").arg(score).arg(member);
        self.push(vec![cmd])
    }

    /// Queue `ZREM`.
    pub fn zrem(&mut self, id: &str, member: &str) -> &mut Self {
        let mut cmd = self.keyed("ZREM", id);
        cmd.arg(member);
        self.push(vec![cmd])
    }
}

pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}
