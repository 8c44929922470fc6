// Ingress dispatcher: drains the source queue and routes bus messages to
// per-environment queues or fans them out to registered proxy destination
// lists. Payload bytes are forwarded exactly as they arrived.
use bytes::Bytes;
use courier_kv::{unix_now, KvBus};
use courier_wire::BusMessage;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod counters;
pub use counters::{BrokerCounters, BrokerCountersSnapshot};

pub const DEFAULT_SOURCE_KEY: &str = "queue";
pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(60);

const MAX_PROXY_LIST_LENGTH: i64 = 1000;
const MAX_DEAD_LIST_LENGTH: i64 = 1000;
const ENV_QUEUE_LIMIT: i64 = 10;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub source_key: String,
    /// Registrations older than this are skipped during fan-out. Destination
    /// list TTLs are twice this value.
    pub registration_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            source_key: DEFAULT_SOURCE_KEY.to_string(),
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
        }
    }
}

/// Ingress dispatcher handle.
///
/// ```
/// use courier_broker::{Broker, BrokerConfig};
/// use courier_kv::MemoryBus;
/// use std::sync::Arc;
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let bus = Arc::new(MemoryBus::new());
///     let broker = Broker::spawn(bus, BrokerConfig::default());
///     assert_eq!(broker.source_key(), "queue");
///     broker.shutdown();
/// });
/// ```
pub struct Broker {
    inner: Arc<BrokerInner>,
    updates: mpsc::Receiver<Bytes>,
}

struct BrokerInner {
    bus: Arc<dyn KvBus>,
    source_key: String,
    dead_queue_key: String,
    registration_timeout: Duration,
    counters: BrokerCounters,
    cancel: CancellationToken,
}

impl Broker {
    pub fn spawn(bus: Arc<dyn KvBus>, mut config: BrokerConfig) -> Self {
        if config.source_key.is_empty() {
            config.source_key = DEFAULT_SOURCE_KEY.to_string();
        }
        if config.registration_timeout.is_zero() {
            config.registration_timeout = DEFAULT_REGISTRATION_TIMEOUT;
        }
        let dead_queue_key = format!("{}-dead", config.source_key);
        let inner = Arc::new(BrokerInner {
            bus,
            source_key: config.source_key,
            dead_queue_key,
            registration_timeout: config.registration_timeout,
            counters: BrokerCounters::default(),
            cancel: CancellationToken::new(),
        });
        // Capacity 1 on purpose: a slow update consumer stalls dispatch
        // instead of buffering envelopes.
        let (updates_tx, updates) = mpsc::channel(1);
        tokio::spawn(Arc::clone(&inner).ingress_loop(updates_tx));
        Self { inner, updates }
    }

    /// Connect to a Redis endpoint and spawn the dispatcher on it.
    pub async fn connect(address: &str, config: BrokerConfig) -> courier_kv::Result<Self> {
        let bus = courier_kv::RedisBus::connect(address).await?;
        Ok(Self::spawn(Arc::new(bus), config))
    }

    /// Next envelope routed with `message_type = "updateenvironment"`.
    /// Returns `None` once the dispatcher has shut down.
    pub async fn next_update(&mut self) -> Option<Bytes> {
        self.updates.recv().await
    }

    pub fn counters(&self) -> BrokerCountersSnapshot {
        self.inner.counters.snapshot()
    }

    pub fn source_key(&self) -> &str {
        &self.inner.source_key
    }

    pub fn env_dest_key(&self, environment_id: &str) -> String {
        courier_keys::env_dest_key(environment_id, &self.inner.source_key)
    }

    pub fn env_stack_key(&self, environment_id: &str) -> String {
        courier_keys::env_stack_key(environment_id, &self.inner.source_key)
    }

    pub fn proxy_key_base(&self, environment_id: &str) -> String {
        courier_keys::proxy_key_base(environment_id, &self.inner.source_key)
    }

    /// Stop the ingress loop at its next suspension point and close the
    /// update stream.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }
}

impl BrokerInner {
    async fn ingress_loop(self: Arc<Self>, updates: mpsc::Sender<Bytes>) {
        loop {
            let popped = tokio::select! {
                _ = self.cancel.cancelled() => break,
                popped = self.bus.pop_tail_blocking(&self.source_key, None) => popped,
            };
            let (key, payload) = match popped {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(err) => {
                    // The backend reconnects underneath us; keep pulling.
                    tracing::warn!(error = %err, "ingress pop failed");
                    continue;
                }
            };
            if key != self.source_key {
                tracing::warn!(%key, "pop returned an unexpected key");
                continue;
            }
            self.dispatch(payload, &updates).await;
        }
        tracing::debug!("ingress loop stopped");
    }

    async fn dispatch(&self, payload: Bytes, updates: &mpsc::Sender<Bytes>) {
        let message = match BusMessage::parse(&payload) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(error = %err, "inbound message is not valid json");
                self.counters
                    .inbound_unmarshal_errors
                    .fetch_add(1, Ordering::Relaxed);
                metrics::counter!("courier_inbound_unmarshal_errors_total").increment(1);
                self.push_to_dead(&payload).await;
                return;
            }
        };

        self.counters.inbound.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("courier_inbound_total").increment(1);

        if !message.has_required_fields() {
            tracing::warn!(
                repo_name = %message.repo_name,
                branch_name = %message.branch_name,
                "unsupported repository or branch name"
            );
            self.push_to_dead(&payload).await;
            return;
        }

        match message.message_type.as_str() {
            courier_wire::UPDATE_ENVIRONMENT => {
                self.route_update_environment(&message, payload, updates).await;
            }
            courier_wire::PROXY_MESSAGE => {
                self.route_proxy_message(&message, payload).await;
            }
            other => {
                tracing::warn!(message_type = %other, "unhandled message type");
            }
        }
    }

    async fn route_update_environment(
        &self,
        message: &BusMessage,
        payload: Bytes,
        updates: &mpsc::Sender<Bytes>,
    ) {
        let environment_id = message.environment_id();
        let env_dest_key = courier_keys::env_dest_key(&environment_id, &self.source_key);

        let new_len = match self.bus.push_head(&env_dest_key, &payload).await {
            Ok(len) => len,
            Err(err) => {
                tracing::warn!(error = %err, key = %env_dest_key, "failed to push to environment queue");
                return;
            }
        };
        if new_len > ENV_QUEUE_LIMIT {
            tracing::info!(key = %env_dest_key, "environment queue over limit, trimming");
            if let Err(err) = self.bus.trim_head(&env_dest_key, ENV_QUEUE_LIMIT).await {
                tracing::warn!(error = %err, key = %env_dest_key, "environment queue trim failed");
            }
            self.counters
                .trimmed_update_environment_outbound
                .fetch_add(1, Ordering::Relaxed);
            metrics::counter!("courier_trimmed_update_environment_total").increment(1);
        }

        // Hand the envelope to whoever launches environment provisioners.
        // The send blocks until the consumer takes it, stalling ingress.
        if updates.send(payload).await.is_err() {
            tracing::debug!("update-environment stream closed");
        }
    }

    async fn route_proxy_message(&self, message: &BusMessage, payload: Bytes) {
        let environment_id = message.environment_id();
        let proxy_key_base = courier_keys::proxy_key_base(&environment_id, &self.source_key);
        let proxy_rego_key = courier_keys::proxy_rego_key(&proxy_key_base, &message.proxy_name);

        let min_score = unix_now() - self.registration_timeout.as_secs() as i64;
        let destinations = match self
            .bus
            .members_with_score_at_least(&proxy_rego_key, min_score)
            .await
        {
            Ok(destinations) => destinations,
            Err(err) => {
                tracing::warn!(error = %err, key = %proxy_rego_key, "failed to read registrations");
                return;
            }
        };
        if destinations.is_empty() {
            tracing::warn!(key = %proxy_rego_key, "no live registrations for proxy message");
            self.counters
                .empty_proxy_message_outbound
                .fetch_add(1, Ordering::Relaxed);
            metrics::counter!("courier_empty_proxy_outbound_total").increment(1);
            return;
        }

        let list_key_prefix =
            courier_keys::proxy_list_key_prefix(&proxy_key_base, &message.proxy_name);
        for destination in destinations {
            // A registration outside the derived prefix was written by
            // something other than a well-behaved client. Never publish to it.
            if !destination.starts_with(&list_key_prefix) {
                tracing::warn!(
                    %destination,
                    expected_prefix = %list_key_prefix,
                    registration = %proxy_rego_key,
                    "destination key outside expected prefix"
                );
                continue;
            }
            let new_len = match self.bus.push_head(&destination, &payload).await {
                Ok(len) => len,
                Err(err) => {
                    tracing::warn!(error = %err, %destination, "fan-out push failed");
                    continue;
                }
            };
            if new_len > MAX_PROXY_LIST_LENGTH {
                tracing::info!(%destination, "destination list over limit, trimming");
                if let Err(err) = self.bus.trim_head(&destination, MAX_PROXY_LIST_LENGTH).await {
                    tracing::warn!(error = %err, %destination, "destination list trim failed");
                }
                self.counters
                    .trimmed_proxy_message_outbound
                    .fetch_add(1, Ordering::Relaxed);
                metrics::counter!("courier_trimmed_proxy_outbound_total").increment(1);
            }
            // Refresh alongside every publish so an abandoned list outlives
            // at most two missed heartbeats.
            if let Err(err) = self
                .bus
                .expire(&destination, 2 * self.registration_timeout)
                .await
            {
                tracing::warn!(error = %err, %destination, "destination ttl refresh failed");
            }
        }
    }

    async fn push_to_dead(&self, payload: &[u8]) {
        match self.bus.push_head(&self.dead_queue_key, payload).await {
            Ok(len) if len > MAX_DEAD_LIST_LENGTH => {
                if let Err(err) = self.bus.trim_head(&self.dead_queue_key, MAX_DEAD_LIST_LENGTH).await {
                    tracing::warn!(error = %err, "dead letter trim failed");
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "failed to push to dead letter queue");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_kv::MemoryBus;

    const Q: &str = "testqueue";

    fn proxy_envelope(repo: &str, branch: &str, proxy: &str) -> String {
        format!(
            r#"{{"repo_name":"{repo}","branch_name":"{branch}","message_type":"proxymessage","proxy_name":"{proxy}"}}"#
        )
    }

    fn spawn_broker(bus: &Arc<MemoryBus>) -> Broker {
        Broker::spawn(
            Arc::clone(bus) as Arc<dyn KvBus>,
            BrokerConfig {
                source_key: Q.to_string(),
                registration_timeout: Duration::from_secs(60),
            },
        )
    }

    async fn wait_for<F>(mut condition: F)
    where
        F: FnMut() -> bool,
    {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    async fn wait_for_list_len(bus: &MemoryBus, key: &str, expected: i64) {
        for _ in 0..200 {
            if bus.list_len(key).await.expect("len") == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("list {key} did not reach length {expected} within 2s");
    }

    #[tokio::test]
    async fn update_environment_reaches_queue_and_stream() {
        let bus = Arc::new(MemoryBus::new());
        let mut broker = spawn_broker(&bus);
        let envelope =
            r#"{"repo_name":"env321","branch_name":"Production","message_type":"updateenvironment"}"#;
        bus.push_head(Q, envelope.as_bytes()).await.expect("push");

        let routed = tokio::time::timeout(Duration::from_secs(1), broker.next_update())
            .await
            .expect("update within 1s")
            .expect("stream open");
        assert_eq!(routed.as_ref(), envelope.as_bytes());

        let env_dest_key = broker.env_dest_key("env321/Production");
        assert_eq!(bus.list_len(&env_dest_key).await.expect("len"), 1);
        assert_eq!(broker.counters().inbound, 1);
        broker.shutdown();
    }

    #[tokio::test]
    async fn environment_queue_is_capped() {
        let bus = Arc::new(MemoryBus::new());
        let mut broker = spawn_broker(&bus);
        let envelope =
            r#"{"repo_name":"env321","branch_name":"main","message_type":"updateenvironment"}"#;
        for _ in 0..12 {
            bus.push_head(Q, envelope.as_bytes()).await.expect("push");
        }
        for _ in 0..12 {
            tokio::time::timeout(Duration::from_secs(1), broker.next_update())
                .await
                .expect("update within 1s")
                .expect("stream open");
        }
        let env_dest_key = broker.env_dest_key("env321/main");
        assert_eq!(bus.list_len(&env_dest_key).await.expect("len"), ENV_QUEUE_LIMIT);
        assert!(broker.counters().trimmed_update_environment_outbound >= 1);
        broker.shutdown();
    }

    #[tokio::test]
    async fn invalid_json_is_dead_lettered() {
        let bus = Arc::new(MemoryBus::new());
        let broker = spawn_broker(&bus);
        bus.push_head(Q, b"{not json").await.expect("push");
        wait_for_list_len(&bus, &format!("{Q}-dead"), 1).await;
        let snapshot = broker.counters();
        assert_eq!(snapshot.inbound, 0);
        assert_eq!(snapshot.inbound_unmarshal_errors, 1);
        broker.shutdown();
    }

    #[tokio::test]
    async fn empty_repo_name_is_dead_lettered() {
        let bus = Arc::new(MemoryBus::new());
        let broker = spawn_broker(&bus);
        let envelope = proxy_envelope("", "x", "p");
        bus.push_head(Q, envelope.as_bytes()).await.expect("push");
        wait_for_list_len(&bus, &format!("{Q}-dead"), 1).await;
        let snapshot = broker.counters();
        assert_eq!(snapshot.inbound, 1);
        assert_eq!(snapshot.inbound_unmarshal_errors, 0);
        broker.shutdown();
    }

    #[tokio::test]
    async fn unknown_message_type_is_dropped() {
        let bus = Arc::new(MemoryBus::new());
        let broker = spawn_broker(&bus);
        let envelope =
            r#"{"repo_name":"r","branch_name":"b","message_type":"somethingelse"}"#;
        bus.push_head(Q, envelope.as_bytes()).await.expect("push");
        {
            let broker_counters = || broker.counters().inbound;
            wait_for(move || broker_counters() == 1).await;
        }
        assert_eq!(
            bus.list_len(&format!("{Q}-dead")).await.expect("len"),
            0,
            "unknown types are dropped, not dead-lettered"
        );
        broker.shutdown();
    }

    #[tokio::test]
    async fn proxy_message_with_no_registrations_is_counted() {
        let bus = Arc::new(MemoryBus::new());
        let broker = spawn_broker(&bus);
        let envelope = proxy_envelope("env321", "main", "orphan");
        bus.push_head(Q, envelope.as_bytes()).await.expect("push");
        {
            let empty = || broker.counters().empty_proxy_message_outbound;
            wait_for(move || empty() == 1).await;
        }
        broker.shutdown();
    }

    #[tokio::test]
    async fn proxy_message_skips_foreign_prefix_registrations() {
        let bus = Arc::new(MemoryBus::new());
        let broker = spawn_broker(&bus);
        let proxy_key_base = broker.proxy_key_base("env321/main");
        let rego_key = courier_keys::proxy_rego_key(&proxy_key_base, "web");
        // Registered by hand, outside the derived list prefix.
        bus.register_member(&rego_key, "rogue-list", unix_now())
            .await
            .expect("register");
        let envelope = proxy_envelope("env321", "main", "web");
        bus.push_head(Q, envelope.as_bytes()).await.expect("push");
        {
            let inbound = || broker.counters().inbound;
            wait_for(move || inbound() == 1).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(bus.list_len("rogue-list").await.expect("len"), 0);
        broker.shutdown();
    }

    #[tokio::test]
    async fn fanout_trims_destination_lists_at_cap() {
        let bus = Arc::new(MemoryBus::new());
        let broker = spawn_broker(&bus);
        let proxy_key_base = broker.proxy_key_base("env321/main");
        let rego_key = courier_keys::proxy_rego_key(&proxy_key_base, "web");
        let prefix = courier_keys::proxy_list_key_prefix(&proxy_key_base, "web");
        let destination = format!("{prefix}-full");
        bus.register_member(&rego_key, &destination, unix_now())
            .await
            .expect("register");
        // Pre-load the destination to the cap so one more push overflows.
        for _ in 0..MAX_PROXY_LIST_LENGTH {
            bus.push_head(&destination, b"old").await.expect("push");
        }
        let envelope = proxy_envelope("env321", "main", "web");
        bus.push_head(Q, envelope.as_bytes()).await.expect("push");
        {
            let trimmed = || broker.counters().trimmed_proxy_message_outbound;
            wait_for(move || trimmed() == 1).await;
        }
        assert_eq!(
            bus.list_len(&destination).await.expect("len"),
            MAX_PROXY_LIST_LENGTH
        );
        broker.shutdown();
    }
}
