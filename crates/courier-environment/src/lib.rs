// Per-environment janitor. Owns the authoritative set of proxy names,
// reclaims registrations that stopped heartbeating, and tails the
// environment destination queue for downstream consumers.
use bytes::Bytes;
use courier_kv::{unix_now, KvBus, KvError, ReapOutcome};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    /// Queue of update-environment envelopes for this environment.
    pub env_dest_key: String,
    /// Set of proxy names currently expected to exist.
    pub env_stack_key: String,
    /// Base the per-proxy registration keys derive from.
    pub proxy_base_key: String,
    /// Zero selects the 60s default. Registrations scored older than this
    /// are reclaimed, together with their destination lists.
    pub registration_timeout: Duration,
}

#[derive(Debug, Default)]
pub struct EnvironmentCounters {
    empty_old_proxy_registrations: AtomicU64,
    deleted_proxy_registrations: AtomicU64,
    deleted_proxy_registration_fails: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvironmentCountersSnapshot {
    /// Cleanup passes that found nothing stale under a proxy.
    pub empty_old_proxy_registrations: u64,
    /// Stale registrations removed, destination lists included.
    pub deleted_proxy_registrations: u64,
    /// Reclamations abandoned because the set changed mid-transaction.
    pub deleted_proxy_registration_fails: u64,
}

impl EnvironmentCounters {
    pub fn snapshot(&self) -> EnvironmentCountersSnapshot {
        EnvironmentCountersSnapshot {
            empty_old_proxy_registrations: self.empty_old_proxy_registrations.load(Ordering::Relaxed),
            deleted_proxy_registrations: self.deleted_proxy_registrations.load(Ordering::Relaxed),
            deleted_proxy_registration_fails: self
                .deleted_proxy_registration_fails
                .load(Ordering::Relaxed),
        }
    }
}

/// Janitor handle. Two background tasks run until `shutdown`: the cleanup
/// loop and the destination-queue tail.
pub struct Environment {
    inner: Arc<EnvironmentInner>,
    inbound: mpsc::Receiver<Bytes>,
}

struct EnvironmentInner {
    bus: Arc<dyn KvBus>,
    env_dest_key: String,
    env_stack_key: String,
    proxy_base_key: String,
    registration_timeout: Duration,
    counters: EnvironmentCounters,
    cancel: CancellationToken,
}

impl Environment {
    /// Pings the KV store before anything else; an unreachable store is an
    /// error the caller should treat as fatal.
    pub async fn spawn(bus: Arc<dyn KvBus>, mut config: EnvironmentConfig) -> Result<Self, KvError> {
        if config.registration_timeout.is_zero() {
            config.registration_timeout = DEFAULT_REGISTRATION_TIMEOUT;
        }
        bus.ping().await?;

        let inner = Arc::new(EnvironmentInner {
            bus,
            env_dest_key: config.env_dest_key,
            env_stack_key: config.env_stack_key,
            proxy_base_key: config.proxy_base_key,
            registration_timeout: config.registration_timeout,
            counters: EnvironmentCounters::default(),
            cancel: CancellationToken::new(),
        });

        let (inbound_tx, inbound) = mpsc::channel(1);
        tokio::spawn(Arc::clone(&inner).cleanup_loop());
        tokio::spawn(Arc::clone(&inner).receive_loop(inbound_tx));

        Ok(Self { inner, inbound })
    }

    /// Connect to a Redis endpoint and spawn the janitor on it.
    pub async fn connect(address: &str, config: EnvironmentConfig) -> Result<Self, KvError> {
        let bus = courier_kv::RedisBus::connect(address).await?;
        Self::spawn(Arc::new(bus), config).await
    }

    /// Atomically replace the proxy-name set, returning the names removed.
    /// Registrations under a removed name are left for their scores to age
    /// out; only names still in the set are swept by cleanup.
    pub async fn register_proxy_set(&self, proxy_names: &[String]) -> Result<Vec<String>, KvError> {
        let removed = self
            .inner
            .bus
            .replace_set(&self.inner.env_stack_key, proxy_names)
            .await?;
        if !removed.is_empty() {
            tracing::info!(?removed, "proxy removal detected");
        }
        Ok(removed)
    }

    /// Next envelope from the environment destination queue. Returns `None`
    /// once the receive loop has shut down.
    pub async fn next_message(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    pub fn counters(&self) -> EnvironmentCountersSnapshot {
        self.inner.counters.snapshot()
    }

    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }
}

impl EnvironmentInner {
    async fn cleanup_loop(self: Arc<Self>) {
        // One pass right away so a restart reclaims promptly.
        self.cleanup().await;

        let mut ticker = tokio::time::interval(self.registration_timeout);
        ticker.tick().await; // the first tick completes immediately
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let ok = self.cleanup().await;
                    tracing::debug!(ok, "cleanup pass complete");
                }
            }
        }
        tracing::debug!("cleanup loop stopped");
    }

    async fn cleanup(&self) -> bool {
        let proxies = match self.bus.set_members(&self.env_stack_key).await {
            Ok(proxies) => proxies,
            Err(err) => {
                tracing::warn!(error = %err, key = %self.env_stack_key, "failed to read proxy set");
                return false;
            }
        };

        let cutoff = unix_now() - self.registration_timeout.as_secs() as i64;
        for proxy in proxies {
            let rego_key = courier_keys::proxy_rego_key(&self.proxy_base_key, &proxy);
            match self.bus.reap_stale_members(&rego_key, cutoff).await {
                Ok(ReapOutcome::Empty) => {
                    self.counters
                        .empty_old_proxy_registrations
                        .fetch_add(1, Ordering::Relaxed);
                }
                Ok(ReapOutcome::Reaped(count)) => {
                    self.counters
                        .deleted_proxy_registrations
                        .fetch_add(count, Ordering::Relaxed);
                    metrics::counter!("courier_deleted_proxy_registrations_total").increment(count);
                    tracing::info!(proxy = %proxy, count, "reaped stale registrations");
                }
                Ok(ReapOutcome::Conflict) => {
                    // Raced with a live writer; the next pass retries.
                    self.counters
                        .deleted_proxy_registration_fails
                        .fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("courier_deleted_proxy_registration_fails_total").increment(1);
                }
                Err(err) => {
                    tracing::warn!(error = %err, proxy = %proxy, "reclamation failed");
                }
            }
        }
        true
    }

    async fn receive_loop(self: Arc<Self>, inbound: mpsc::Sender<Bytes>) {
        loop {
            let popped = tokio::select! {
                _ = self.cancel.cancelled() => break,
                popped = self.bus.pop_tail_blocking(&self.env_dest_key, None) => popped,
            };
            let (key, payload) = match popped {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(error = %err, "environment pop failed");
                    continue;
                }
            };
            if key != self.env_dest_key {
                tracing::warn!(%key, "pop returned an unexpected key");
                continue;
            }
            if inbound.send(payload).await.is_err() {
                break;
            }
        }
        tracing::debug!("environment receive loop stopped");
    }
}
