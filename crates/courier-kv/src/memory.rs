// In-process KvBus used by tests and demos. One mutex guards all tables;
// blocking pops park on a Notify that every push wakes.
use crate::{KvBus, KvError, ReapOutcome, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Tables {
    lists: HashMap<String, VecDeque<Bytes>>,
    scored: HashMap<String, HashMap<String, i64>>,
    sets: HashMap<String, HashSet<String>>,
    deadlines: HashMap<String, Instant>,
}

impl Tables {
    // Lazy expiry: a key past its deadline is gone from the reader's view.
    fn purge_expired(&mut self, key: &str) {
        let expired = self
            .deadlines
            .get(key)
            .map(|deadline| Instant::now() >= *deadline)
            .unwrap_or(false);
        if expired {
            self.deadlines.remove(key);
            self.lists.remove(key);
            self.scored.remove(key);
            self.sets.remove(key);
        }
    }
}

/// In-memory bus with the same visible semantics as the Redis backend.
///
/// ```
/// use courier_kv::{KvBus, MemoryBus};
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let bus = MemoryBus::new();
///     bus.push_head("q", b"hello").await.expect("push");
///     let (key, payload) = bus
///         .pop_tail_blocking("q", None)
///         .await
///         .expect("pop")
///         .expect("payload");
///     assert_eq!(key, "q");
///     assert_eq!(payload.as_ref(), b"hello");
/// });
/// ```
#[derive(Debug, Default)]
pub struct MemoryBus {
    tables: Mutex<Tables>,
    wakeup: Notify,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        // Poisoning only happens if a panicking test held the lock; the
        // tables themselves are always in a consistent state.
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_pop_tail(&self, key: &str) -> Option<Bytes> {
        let mut tables = self.lock();
        tables.purge_expired(key);
        let list = tables.lists.get_mut(key)?;
        let payload = list.pop_back();
        if list.is_empty() {
            tables.lists.remove(key);
        }
        payload
    }
}

#[async_trait]
impl KvBus for MemoryBus {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn pop_tail_blocking(
        &self,
        key: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<(String, Bytes)>> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            // Register for wakeups before checking, so a push between the
            // check and the await is not lost.
            let notified = self.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(payload) = self.try_pop_tail(key) {
                return Ok(Some((key.to_string(), payload)));
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    let _ = tokio::time::timeout(deadline - now, notified).await;
                }
                None => notified.await,
            }
        }
    }

    async fn push_head(&self, key: &str, payload: &[u8]) -> Result<i64> {
        let len = {
            let mut tables = self.lock();
            tables.purge_expired(key);
            let list = tables.lists.entry(key.to_string()).or_default();
            list.push_front(Bytes::copy_from_slice(payload));
            list.len() as i64
        };
        self.wakeup.notify_waiters();
        Ok(len)
    }

    async fn trim_head(&self, key: &str, keep: i64) -> Result<()> {
        let mut tables = self.lock();
        tables.purge_expired(key);
        if let Some(list) = tables.lists.get_mut(key) {
            // Entries push onto the head, so dropping the tail keeps the
            // newest `keep`.
            while list.len() as i64 > keep {
                list.pop_back();
            }
        }
        Ok(())
    }

    async fn list_len(&self, key: &str) -> Result<i64> {
        let mut tables = self.lock();
        tables.purge_expired(key);
        Ok(tables.lists.get(key).map(|list| list.len() as i64).unwrap_or(0))
    }

    async fn key_exists(&self, key: &str) -> Result<bool> {
        let mut tables = self.lock();
        tables.purge_expired(key);
        Ok(tables.lists.contains_key(key)
            || tables.scored.contains_key(key)
            || tables.sets.contains_key(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut tables = self.lock();
        tables.deadlines.insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn register_member(&self, key: &str, member: &str, score: i64) -> Result<()> {
        let mut tables = self.lock();
        tables.purge_expired(key);
        tables
            .scored
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn members_with_score_at_least(&self, key: &str, min: i64) -> Result<Vec<String>> {
        let mut tables = self.lock();
        tables.purge_expired(key);
        let mut members: Vec<(i64, String)> = tables
            .scored
            .get(key)
            .map(|scored| {
                scored
                    .iter()
                    .filter(|(_, score)| **score >= min)
                    .map(|(member, score)| (*score, member.clone()))
                    .collect()
            })
            .unwrap_or_default();
        // Score order, then member, matching the backend's range semantics.
        members.sort();
        Ok(members.into_iter().map(|(_, member)| member).collect())
    }

    async fn sorted_set_len(&self, key: &str) -> Result<i64> {
        let mut tables = self.lock();
        tables.purge_expired(key);
        Ok(tables.scored.get(key).map(|scored| scored.len() as i64).unwrap_or(0))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut tables = self.lock();
        tables.purge_expired(key);
        Ok(tables
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn replace_set(&self, key: &str, members: &[String]) -> Result<Vec<String>> {
        if members.is_empty() {
            // The scratch set never materializes, so the rename has nothing
            // to move. Same failure the backend reports.
            return Err(KvError::Backend("cannot replace set with no members".into()));
        }
        let mut tables = self.lock();
        tables.purge_expired(key);
        let incoming: HashSet<String> = members.iter().cloned().collect();
        let removed = tables
            .sets
            .get(key)
            .map(|current| current.difference(&incoming).cloned().collect())
            .unwrap_or_default();
        tables.sets.insert(key.to_string(), incoming);
        Ok(removed)
    }

    async fn reap_stale_members(&self, key: &str, cutoff: i64) -> Result<ReapOutcome> {
        // Everything happens under one lock, so the optimistic transaction
        // can never lose a race here.
        let mut tables = self.lock();
        tables.purge_expired(key);
        let stale: Vec<String> = tables
            .scored
            .get(key)
            .map(|scored| {
                scored
                    .iter()
                    .filter(|(_, score)| **score <= cutoff)
                    .map(|(member, _)| member.clone())
                    .collect()
            })
            .unwrap_or_default();
        if stale.is_empty() {
            return Ok(ReapOutcome::Empty);
        }
        if let Some(scored) = tables.scored.get_mut(key) {
            for member in &stale {
                scored.remove(member);
            }
            if scored.is_empty() {
                tables.scored.remove(key);
            }
        }
        for member in &stale {
            tables.lists.remove(member);
            tables.deadlines.remove(member);
        }
        Ok(ReapOutcome::Reaped(stale.len() as u64))
    }
}
