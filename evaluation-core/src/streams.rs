//! Thin wrapper over the Redis streams/consumer-group primitives this
//! pipeline needs. Modeled on `ValkeyConnectionInfo`: a cheaply cloneable
//! handle over `redis::aio::ConnectionManager` that every worker shares.

use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, RedisError, RedisResult};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("redis error: {0}")]
    Redis(#[from] RedisError),
}

/// Cloneable async client over a single Redis deployment. All workers in a
/// process share one `RedisStreams` instance.
#[derive(Clone)]
pub struct RedisStreams {
    manager: ConnectionManager,
}

impl RedisStreams {
    pub async fn connect(url: &str) -> Result<Self, StreamError> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }

    pub async fn connection(&self) -> Result<ConnectionManager, StreamError> {
        Ok(self.manager.clone())
    }

    /// Cursored `SCAN` over `pattern`, page size 100, returning every matching
    /// key. Used by `MatcherWorker`'s discovery loop against
    /// `telemetry:batches:*`.
    pub async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StreamError> {
        let mut conn = self.manager.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }
        Ok(keys)
    }

    /// Idempotent consumer-group creation: `BUSYGROUP` (group already exists)
    /// is treated as success.
    pub async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<(), StreamError> {
        let mut conn = self.manager.clone();
        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(start_id)
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.to_string().contains("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn xreadgroup(
        &self,
        streams: &[&str],
        ids: &[&str],
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: usize,
    ) -> Result<StreamReadReply, StreamError> {
        let mut conn = self.manager.clone();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms);
        let reply: StreamReadReply = conn.xread_options(streams, ids, &opts).await?;
        Ok(reply)
    }

    pub async fn xadd(&self, stream: &str, fields: &[(&str, String)]) -> Result<(), StreamError> {
        let mut conn = self.manager.clone();
        let _id: String = conn.xadd(stream, "*", fields).await?;
        Ok(())
    }

    pub async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<(), StreamError> {
        let mut conn = self.manager.clone();
        let _: i64 = conn.xack(stream, group, &[id]).await?;
        Ok(())
    }
}
