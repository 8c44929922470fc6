// Redis-backed KvBus.
//
// Plain commands go through a shared ConnectionManager, which reconnects on
// its own. Blocking pops and WATCH transactions each take a dedicated
// connection: a parked BRPOP stalls every command multiplexed on the same
// socket, and WATCH state is per-connection.
use crate::{KvBus, KvError, ReapOutcome, Result};
use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::AsyncCommands;
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;

pub struct RedisBus {
    client: redis::Client,
    manager: ConnectionManager,
    // Lazily opened, dropped on error so the next pop reconnects.
    pop_conn: Mutex<Option<MultiplexedConnection>>,
}

impl fmt::Debug for RedisBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBus")
            .field("addr", &self.client.get_connection_info().addr)
            .finish()
    }
}

impl RedisBus {
    /// Connect to a Redis endpoint. Accepts `host:port` or a full URL.
    pub async fn connect(address: &str) -> Result<Self> {
        let url = if address.contains("://") {
            address.to_string()
        } else {
            format!("redis://{address}")
        };
        let client = redis::Client::open(url).map_err(kv_err)?;
        let manager = client.get_connection_manager().await.map_err(kv_err)?;
        Ok(Self {
            client,
            manager,
            pop_conn: Mutex::new(None),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn kv_err(err: redis::RedisError) -> KvError {
    if err.is_timeout() {
        KvError::Timeout(err.to_string())
    } else {
        KvError::Backend(err.to_string())
    }
}

#[async_trait]
impl KvBus for RedisBus {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn();
        let _: () = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(kv_err)?;
        Ok(())
    }

    async fn pop_tail_blocking(
        &self,
        key: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<(String, Bytes)>> {
        let mut guard = self.pop_conn.lock().await;
        let mut conn = match guard.take() {
            Some(conn) => conn,
            None => self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(kv_err)?,
        };
        // BRPOP treats 0 as "block forever".
        let timeout_secs = timeout.map(|timeout| timeout.as_secs_f64()).unwrap_or(0.0);
        let popped: redis::RedisResult<Option<(String, Vec<u8>)>> =
            conn.brpop(key, timeout_secs).await;
        match popped {
            Ok(entry) => {
                *guard = Some(conn);
                Ok(entry.map(|(key, payload)| (key, Bytes::from(payload))))
            }
            // The connection may be parked mid-pop; abandon it.
            Err(err) => Err(kv_err(err)),
        }
    }

    async fn push_head(&self, key: &str, payload: &[u8]) -> Result<i64> {
        let mut conn = self.conn();
        let len: i64 = conn.lpush(key, payload).await.map_err(kv_err)?;
        Ok(len)
    }

    async fn trim_head(&self, key: &str, keep: i64) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.ltrim(key, 0, (keep - 1) as isize).await.map_err(kv_err)?;
        Ok(())
    }

    async fn list_len(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn();
        let len: i64 = conn.llen(key).await.map_err(kv_err)?;
        Ok(len)
    }

    async fn key_exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        let exists: bool = conn.exists(key).await.map_err(kv_err)?;
        Ok(exists)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn();
        let _: bool = conn.expire(key, ttl.as_secs() as i64).await.map_err(kv_err)?;
        Ok(())
    }

    async fn register_member(&self, key: &str, member: &str, score: i64) -> Result<()> {
        let mut conn = self.conn();
        // Returns the count of newly added members; updates report 0.
        let _: i64 = conn.zadd(key, member, score).await.map_err(kv_err)?;
        Ok(())
    }

    async fn members_with_score_at_least(&self, key: &str, min: i64) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let members: Vec<String> = conn
            .zrangebyscore(key, min, "+inf")
            .await
            .map_err(kv_err)?;
        Ok(members)
    }

    async fn sorted_set_len(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn();
        let len: i64 = conn.zcard(key).await.map_err(kv_err)?;
        Ok(len)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let members: Vec<String> = conn.smembers(key).await.map_err(kv_err)?;
        Ok(members)
    }

    async fn replace_set(&self, key: &str, members: &[String]) -> Result<Vec<String>> {
        if members.is_empty() {
            // Zero SADDs means the scratch set never materializes and the
            // rename fails mid-pipeline; reject up front with a stable error.
            return Err(KvError::Backend("cannot replace set with no members".into()));
        }
        let mut conn = self.conn();
        let scratch = format!("{key}_new");
        let mut pipe = redis::pipe();
        pipe.atomic();
        for member in members {
            pipe.sadd(&scratch, member).ignore();
        }
        // Diff against the scratch before the rename lands, so the result
        // is exactly what the swap removed.
        pipe.cmd("SDIFF").arg(key).arg(&scratch);
        pipe.cmd("RENAME").arg(&scratch).arg(key).ignore();
        let (removed,): (Vec<String>,) = pipe.query_async(&mut conn).await.map_err(kv_err)?;
        Ok(removed)
    }

    async fn reap_stale_members(&self, key: &str, cutoff: i64) -> Result<ReapOutcome> {
        // Dedicated connection: WATCH binds to the connection it ran on.
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(kv_err)?;
        let _: () = redis::cmd("WATCH")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(kv_err)?;
        let stale: Vec<String> = conn
            .zrangebyscore(key, "-inf", cutoff)
            .await
            .map_err(kv_err)?;
        if stale.is_empty() {
            let _: () = redis::cmd("UNWATCH")
                .query_async(&mut conn)
                .await
                .map_err(kv_err)?;
            return Ok(ReapOutcome::Empty);
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for member in &stale {
            pipe.zrem(key, member).ignore();
            pipe.del(member).ignore();
        }
        // An aborted EXEC surfaces as nil.
        let exec: Option<()> = pipe.query_async(&mut conn).await.map_err(kv_err)?;
        match exec {
            Some(()) => Ok(ReapOutcome::Reaped(stale.len() as u64)),
            None => Ok(ReapOutcome::Conflict),
        }
    }
}
