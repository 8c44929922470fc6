// Proxy receive agent. Heartbeats its destination list into the registration
// set so the dispatcher fans out to it, and tails the list for payloads.
use bytes::Bytes;
use courier_kv::{unix_now, KvBus, RedisBus};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod config;
pub use config::{
    ClientEnvConfig, DEFAULT_LIST_KEY_PREFIX, DEFAULT_LIST_KEY_SUFFIX, DEFAULT_POP_TIMEOUT,
    DEFAULT_REGISTRATION_TIMEOUT,
};

/// Called with informational messages about the KV connection, such as
/// client-side read timeouts that were absorbed and retried.
pub type InfoEventCallback = Box<dyn Fn(&str) + Send + Sync + 'static>;

pub struct ClientOptions {
    pub registration_key: String,
    /// Empty selects `"pod-"`.
    pub list_key_prefix: String,
    /// Empty selects `"list"`. Passed through as-is: hashing a raw suffix is
    /// the env entry point's job, not this constructor's.
    pub list_key_suffix: String,
    /// Zero selects the 60s default.
    pub registration_timeout: Duration,
    /// Zero selects the 300s default.
    pub pop_timeout: Duration,
    pub verbose_register: bool,
    pub info_event_callback: Option<InfoEventCallback>,
}

impl ClientOptions {
    pub fn new(registration_key: impl Into<String>) -> Self {
        Self {
            registration_key: registration_key.into(),
            list_key_prefix: String::new(),
            list_key_suffix: String::new(),
            registration_timeout: Duration::ZERO,
            pop_timeout: Duration::ZERO,
            verbose_register: false,
            info_event_callback: None,
        }
    }

    pub fn from_env_config(config: &ClientEnvConfig) -> Self {
        Self {
            registration_key: config.registration_key.clone(),
            list_key_prefix: config.list_key_prefix.clone(),
            list_key_suffix: config.list_key_suffix.clone(),
            registration_timeout: config.registration_timeout,
            pop_timeout: config.pop_timeout,
            verbose_register: config.verbose_register,
            info_event_callback: None,
        }
    }
}

/// Receive agent handle. Two background tasks run until `shutdown`:
/// the heartbeat loop and the destination-list tail.
pub struct Client {
    inner: Arc<ClientInner>,
    inbound: mpsc::Receiver<Bytes>,
}

struct ClientInner {
    bus: Arc<dyn KvBus>,
    registration_key: String,
    list_key: String,
    registration_timeout: Duration,
    pop_timeout: Duration,
    verbose_register: bool,
    info_event_callback: Option<InfoEventCallback>,
    // Unix seconds of the latest successful heartbeat; zero means never.
    last_registration_success: AtomicI64,
    cancel: CancellationToken,
}

impl Client {
    pub fn spawn(bus: Arc<dyn KvBus>, mut options: ClientOptions) -> Self {
        if options.list_key_prefix.is_empty() {
            options.list_key_prefix = DEFAULT_LIST_KEY_PREFIX.to_string();
        }
        if options.list_key_suffix.is_empty() {
            options.list_key_suffix = DEFAULT_LIST_KEY_SUFFIX.to_string();
        }
        if options.registration_timeout.is_zero() {
            options.registration_timeout = DEFAULT_REGISTRATION_TIMEOUT;
        }
        if options.pop_timeout.is_zero() {
            options.pop_timeout = DEFAULT_POP_TIMEOUT;
        }
        let list_key = format!("{}-{}", options.list_key_prefix, options.list_key_suffix);

        let inner = Arc::new(ClientInner {
            bus,
            registration_key: options.registration_key,
            list_key,
            registration_timeout: options.registration_timeout,
            pop_timeout: options.pop_timeout,
            verbose_register: options.verbose_register,
            info_event_callback: options.info_event_callback,
            last_registration_success: AtomicI64::new(0),
            cancel: CancellationToken::new(),
        });

        let (inbound_tx, inbound) = mpsc::channel(1);
        tokio::spawn(Arc::clone(&inner).register_loop());
        tokio::spawn(Arc::clone(&inner).receive_loop(inbound_tx));

        Self { inner, inbound }
    }

    /// Connect to a Redis endpoint and spawn the agent on it.
    pub async fn connect(address: &str, options: ClientOptions) -> courier_kv::Result<Self> {
        let bus = RedisBus::connect(address).await?;
        Ok(Self::spawn(Arc::new(bus), options))
    }

    /// Build a client from the process environment and connect to Redis.
    pub async fn from_env() -> anyhow::Result<Self> {
        let config = ClientEnvConfig::from_env()?;
        let bus = RedisBus::connect(&config.redis_address).await?;
        let options = ClientOptions::from_env_config(&config);
        Ok(Self::spawn(Arc::new(bus), options))
    }

    /// Next payload fanned out to this client's destination list. Returns
    /// `None` once the receive loop has shut down.
    pub async fn next_message(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    /// Destination list key this client tails.
    pub fn list_key(&self) -> &str {
        &self.inner.list_key
    }

    /// Wall-clock time of the latest successful heartbeat.
    pub fn last_registration_success(&self) -> Option<SystemTime> {
        let seconds = self.inner.last_registration_success.load(Ordering::Relaxed);
        if seconds == 0 {
            return None;
        }
        Some(UNIX_EPOCH + Duration::from_secs(seconds as u64))
    }

    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }
}

impl ClientInner {
    async fn register_loop(self: Arc<Self>) {
        // First registration runs before the tick schedule so callers see a
        // success timestamp within one KV round-trip of construction.
        self.register_list_key().await;

        let mut ticker = tokio::time::interval(self.registration_timeout);
        ticker.tick().await; // the first tick completes immediately
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let ok = self.register_list_key().await;
                    if self.verbose_register {
                        tracing::info!(ok, "register call complete");
                    } else {
                        tracing::debug!(ok, "register call complete");
                    }
                }
            }
        }
        tracing::debug!("register loop stopped");
    }

    async fn register_list_key(&self) -> bool {
        let score = unix_now();
        match self
            .bus
            .register_member(&self.registration_key, &self.list_key, score)
            .await
        {
            Ok(()) => {
                self.last_registration_success.store(score, Ordering::Relaxed);
                true
            }
            Err(err) => {
                // Not fatal; the next tick retries.
                tracing::warn!(error = %err, "registration failure");
                false
            }
        }
    }

    async fn receive_loop(self: Arc<Self>, inbound: mpsc::Sender<Bytes>) {
        let mut consecutive_errors: u32 = 0;
        loop {
            let popped = tokio::select! {
                _ = self.cancel.cancelled() => break,
                popped = self.bus.pop_tail_blocking(&self.list_key, Some(self.pop_timeout)) => popped,
            };
            match popped {
                Ok(Some((key, payload))) => {
                    consecutive_errors = 0;
                    if key != self.list_key {
                        tracing::warn!(%key, "pop returned an unexpected key");
                        continue;
                    }
                    if inbound.send(payload).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    // Server-side timeout with no data; reissue the pop.
                    tracing::debug!("blocking pop timed out with no message");
                    consecutive_errors = 0;
                }
                Err(err) if err.is_timeout() => {
                    // The server went quiet mid-read. Recoverable, and it
                    // does not count toward the backoff threshold.
                    let event = format!("client-side timeout from kv store: {err}");
                    tracing::warn!("{event}");
                    if let Some(callback) = &self.info_event_callback {
                        callback(&event);
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "blocking pop failed");
                    consecutive_errors += 1;
                    if consecutive_errors > 3 {
                        // Linear backoff capped at 30s keeps a dead KV from
                        // spinning the loop.
                        let sleep_seconds = u64::from(consecutive_errors.min(30));
                        tracing::warn!(
                            consecutive_errors,
                            sleep_seconds,
                            "sleeping after consecutive kv errors"
                        );
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs(sleep_seconds)) => {}
                        }
                    }
                }
            }
        }
        tracing::debug!("receive loop stopped");
    }
}
