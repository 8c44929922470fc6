// Dispatch counters, read as a snapshot.
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct BrokerCounters {
    pub(crate) inbound: AtomicU64,
    pub(crate) inbound_unmarshal_errors: AtomicU64,
    pub(crate) trimmed_proxy_message_outbound: AtomicU64,
    pub(crate) trimmed_update_environment_outbound: AtomicU64,
    pub(crate) empty_proxy_message_outbound: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerCountersSnapshot {
    /// Envelopes parsed off the ingress queue.
    pub inbound: u64,
    /// Envelopes dead-lettered because they were not valid JSON.
    pub inbound_unmarshal_errors: u64,
    /// Proxy destination lists trimmed back to their cap.
    pub trimmed_proxy_message_outbound: u64,
    /// Environment queues trimmed back to their cap.
    pub trimmed_update_environment_outbound: u64,
    /// Proxy messages dropped because no live registration existed.
    pub empty_proxy_message_outbound: u64,
}

impl BrokerCounters {
    pub fn snapshot(&self) -> BrokerCountersSnapshot {
        BrokerCountersSnapshot {
            inbound: self.inbound.load(Ordering::Relaxed),
            inbound_unmarshal_errors: self.inbound_unmarshal_errors.load(Ordering::Relaxed),
            trimmed_proxy_message_outbound: self
                .trimmed_proxy_message_outbound
                .load(Ordering::Relaxed),
            trimmed_update_environment_outbound: self
                .trimmed_update_environment_outbound
                .load(Ordering::Relaxed),
            empty_proxy_message_outbound: self.empty_proxy_message_outbound.load(Ordering::Relaxed),
        }
    }
}
