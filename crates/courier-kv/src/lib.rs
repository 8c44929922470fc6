// KV-side primitives the routing components are built on.
//
// The trait captures the list / sorted-set / set / TTL / transaction surface
// the broker needs and nothing more, so the production Redis backend and the
// in-memory test backend stay interchangeable.
use async_trait::async_trait;
use bytes::Bytes;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod memory;
pub mod redis_bus;

pub use memory::MemoryBus;
pub use redis_bus::RedisBus;

pub type Result<T> = std::result::Result<T, KvError>;

#[derive(thiserror::Error, Debug)]
pub enum KvError {
    /// The backend did not answer within the client-side network timeout.
    /// Recoverable; receive loops report it and reissue the read.
    #[error("kv timeout: {0}")]
    Timeout(String),
    #[error("kv error: {0}")]
    Backend(String),
}

impl KvError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, KvError::Timeout(_))
    }
}

/// Outcome of one optimistic reclamation pass over a registration set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapOutcome {
    /// No member scored at or below the cutoff.
    Empty,
    /// Members removed, each with its destination list deleted.
    Reaped(u64),
    /// The set changed under the watch; nothing was written.
    Conflict,
}

#[async_trait]
pub trait KvBus: std::fmt::Debug + Send + Sync {
    async fn ping(&self) -> Result<()>;

    /// Tail-pop with an optional block timeout. A `None` timeout blocks
    /// until data arrives; `Ok(None)` means the timeout elapsed empty.
    async fn pop_tail_blocking(
        &self,
        key: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<(String, Bytes)>>;

    /// Head-push, returning the list length after the push.
    async fn push_head(&self, key: &str, payload: &[u8]) -> Result<i64>;

    /// Keep only the newest `keep` entries of a head-pushed list.
    async fn trim_head(&self, key: &str, keep: i64) -> Result<()>;

    async fn list_len(&self, key: &str) -> Result<i64>;

    async fn key_exists(&self, key: &str) -> Result<bool>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Add-or-update one member of a scored registration set.
    async fn register_member(&self, key: &str, member: &str, score: i64) -> Result<()>;

    /// Members whose score is at least `min`, inclusive.
    async fn members_with_score_at_least(&self, key: &str, min: i64) -> Result<Vec<String>>;

    async fn sorted_set_len(&self, key: &str) -> Result<i64>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Atomically replace the set at `key` with `members`, returning the
    /// members present before and absent now. The swap goes through a
    /// scratch set at `key + "_new"` renamed over the live key.
    async fn replace_set(&self, key: &str, members: &[String]) -> Result<Vec<String>>;

    /// Under an optimistic watch on `key`, remove every member scored at or
    /// below `cutoff` and delete the destination list each member names.
    async fn reap_stale_members(&self, key: &str, cutoff: i64) -> Result<ReapOutcome>;
}

/// Current UTC time in unix seconds, the score unit for registrations.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}
