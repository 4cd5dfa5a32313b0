//! Pending-send callbacks.
//!
//! A tracked send is remembered by the blake3 hash of its payload; the
//! first inbound delivery with identical bytes completes it. Entries whose
//! echo never arrives stay until [`PendingSends::forget`] or
//! [`PendingSends::clear`].

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Clone, Default)]
pub struct PendingSends {
    waiting: Arc<DashMap<[u8; 32], oneshot::Sender<()>>>,
}

fn fingerprint(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

impl PendingSends {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves when a delivery carrying exactly `data` is seen. Tracking
    /// the same bytes twice replaces the earlier waiter.
    pub fn track(&self, data: &[u8]) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let key = fingerprint(data);
        if self.waiting.insert(key, tx).is_some() {
            tracing::debug!(fingerprint = %hex::encode(&key[..8]), "replacing pending send");
        }
        rx
    }

    /// Complete the waiter for `data`, if any. Returns whether one matched.
    pub fn complete(&self, data: &[u8]) -> bool {
        match self.waiting.remove(&fingerprint(data)) {
            Some((_, tx)) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    pub fn forget(&self, data: &[u8]) -> bool {
        self.waiting.remove(&fingerprint(data)).is_some()
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    pub fn clear(&self) {
        self.waiting.clear();
    }
}
