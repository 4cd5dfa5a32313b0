//! Delivery tracking — what the carrier reported back for each port.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortDeliveries {
    /// Accepted by the carrier.
    pub sent: u64,
    /// Confirmed on the handset.
    pub delivered: u64,
    /// Rejected or never acknowledged.
    pub failed: u64,
}

/// Per-port send acknowledgement counters.
#[derive(Clone, Default)]
pub struct DeliveryTracker {
    ports: Arc<DashMap<u16, PortDeliveries>>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, port: u16) {
        self.ports.entry(port).or_default().sent += 1;
    }

    pub fn record_delivered(&self, port: u16) {
        self.ports.entry(port).or_default().delivered += 1;
    }

    pub fn record_failed(&self, port: u16) {
        self.ports.entry(port).or_default().failed += 1;
    }

    pub fn get(&self, port: u16) -> PortDeliveries {
        self.ports.get(&port).map(|d| *d).unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<u16, PortDeliveries> {
        self.ports.iter().map(|e| (*e.key(), *e.value())).collect()
    }
}
