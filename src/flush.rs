//! Pattern-based deletion in bounded batches.

use redis::{aio::ConnectionLike, RedisResult};
use tracing::{debug, instrument, warn};

use crate::{scan::SafeScan, transport::Transport};

/// Number of keys deleted per `UNLINK` unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Delete every key matching `pattern`, `batch_size` keys per delete call.
///
/// The pattern is prefixed like a [`SafeScan`] pattern. At most one batch of keys is held in
/// memory, and no delete is ever issued for an empty batch. A batch the server refuses to delete
/// counts as zero; connection failures are returned as errors.
///
/// Returns the number of keys deleted.
#[instrument(skip(conn))]
pub async fn flush_by_pattern<C>(
    conn: &mut Transport<C>,
    pattern: &str,
    scan_count: usize,
    batch_size: usize,
) -> RedisResult<u64>
where
    C: ConnectionLike + Send,
{
    let batch_size = batch_size.max(1);
    let mut scan = SafeScan::new(conn, pattern, scan_count);
    let mut buffer = Vec::with_capacity(batch_size);
    let mut deleted = 0;
    let mut batches = 0;

    while let Some(key) = scan.next_key(conn).await? {
        buffer.push(key);
        if buffer.len() == batch_size {
            deleted += delete_batch(conn, &buffer).await?;
            batches += 1;
            buffer.clear();
        }
    }
    if !buffer.is_empty() {
        deleted += delete_batch(conn, &buffer).await?;
        batches += 1;
    }

    debug!(batches, deleted, "flushed keys by pattern");
    Ok(deleted)
}

async fn delete_batch<C>(conn: &mut Transport<C>, keys: &[String]) -> RedisResult<u64>
where
    C: ConnectionLike + Send,
{
    match conn.unlink(keys).await {
        Ok(deleted) => Ok(deleted),
        Err(err) if err.is_io_error() => Err(err),
        Err(err) => {
            warn!(error = %err, keys = keys.len(), "bulk delete failed");
            Ok(0)
        }
    }
}
