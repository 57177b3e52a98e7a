//! Prefix-aware, cluster-aware keyspace iteration.

use std::collections::VecDeque;

use redis::{aio::ConnectionLike, RedisResult};
use tracing::debug;

use crate::transport::Transport;

/// A lazy `SCAN` over every key matching a pattern.
///
/// The transport does not prefix scan patterns, so the configured prefix is prepended here
/// (unless the pattern already starts with it), and stripped from every yielded key. Yielded keys
/// can therefore be passed straight back to direct commands.
///
/// On a cluster every master is scanned with its own cursor, one after the other. A node is done
/// once its cursor comes back as `0`. Keys created or deleted while the scan runs may or may not
/// be seen; stable keys are seen once per node that holds them.
///
/// A scan is not resumable: start a new one to iterate again.
///
/// ```no_run
/// # use tagcache::{scan::SafeScan, transport::{Transport, TransportOptions}};
/// # async fn example(conn: redis::aio::MultiplexedConnection) -> redis::RedisResult<()> {
/// let mut conn = Transport::new(conn, TransportOptions::default().with_prefix("app:"));
/// let mut scan = SafeScan::new(&conn, "user:*", 100);
/// while let Some(key) = scan.next_key(&mut conn).await? {
///     println!("{key}"); // "user:1", not "app:user:1"
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SafeScan {
    pattern: String,
    prefix: String,
    count: usize,
    node: usize,
    cursor: u64,
    pending: VecDeque<String>,
}

impl SafeScan {
    /// Prepare a scan for `pattern` with a `COUNT` hint of `count`.
    pub fn new<C>(conn: &Transport<C>, pattern: &str, count: usize) -> Self {
        let prefix = conn.prefix().to_owned();
        let pattern = if prefix.is_empty() || pattern.starts_with(&prefix) {
            pattern.to_owned()
        } else {
            format!("{prefix}{pattern}")
        };
        Self {
            pattern,
            prefix,
            count: count.max(1),
            node: 0,
            cursor: 0,
            pending: VecDeque::new(),
        }
    }

    /// The pattern sent to the server.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Pull the next matching key, without the prefix. `None` once every node is exhausted.
    pub async fn next_key<C>(&mut self, conn: &mut Transport<C>) -> RedisResult<Option<String>>
    where
        C: ConnectionLike + Send,
    {
        loop {
            if let Some(key) = self.pending.pop_front() {
                return Ok(Some(key));
            }
            if self.node >= conn.node_count() {
                return Ok(None);
            }
            match conn.scan(self.node, self.cursor, &self.pattern, self.count).await? {
                Some((cursor, keys)) => {
                    let prefix = &self.prefix;
                    self.pending
                        .extend(keys.into_iter().map(|key| strip_prefix(prefix, key)));
                    if cursor == 0 {
                        self.next_node();
                    } else {
                        self.cursor = cursor;
                    }
                }
                None => {
                    debug!(node = self.node, pattern = %self.pattern, "malformed scan reply, skipping rest of node");
                    self.next_node();
                }
            }
        }
    }

    /// Drain the scan into a vector.
    pub async fn collect<C>(mut self, conn: &mut Transport<C>) -> RedisResult<Vec<String>>
    where
        C: ConnectionLike + Send,
    {
        let mut keys = Vec::new();
        while let Some(key) = self.next_key(conn).await? {
            keys.push(key);
        }
        Ok(keys)
    }

    fn next_node(&mut self) {
        self.node += 1;
        self.cursor = 0;
    }
}

fn strip_prefix(prefix: &str, key: String) -> String {
    match key.strip_prefix(prefix) {
        Some(stripped) if !prefix.is_empty() => stripped.to_owned(),
        _ => key,
    }
}
