//! Capability traits — the seams between the NBSProxy core and its host.
//!
//! The core never talks to the carrier, the package manager or the UI
//! directly. Hosts implement these traits; tests implement them in memory.

use tokio::sync::oneshot;

use crate::wire::Frame;

// ── Transport ─────────────────────────────────────────────────────────────────

/// Asynchronous outcome of one carrier submission.
///
/// Each receiver resolves to `true` on success. A dropped sender means the
/// platform never reported back, which callers treat as failure.
pub struct SendAcks {
    pub sent: oneshot::Receiver<bool>,
    pub delivered: oneshot::Receiver<bool>,
}

/// Transport-side half of [`SendAcks`].
pub struct AckSenders {
    pub sent: oneshot::Sender<bool>,
    pub delivered: oneshot::Sender<bool>,
}

impl SendAcks {
    pub fn channel() -> (AckSenders, SendAcks) {
        let (sent_tx, sent_rx) = oneshot::channel();
        let (delivered_tx, delivered_rx) = oneshot::channel();
        (
            AckSenders {
                sent: sent_tx,
                delivered: delivered_tx,
            },
            SendAcks {
                sent: sent_rx,
                delivered: delivered_rx,
            },
        )
    }
}

/// Unreliable, unordered, at-most-once binary datagram delivery to a phone
/// number and port. Inbound frames are pushed by the host into the relay.
pub trait Transport: Send + Sync {
    fn send_frame(&self, target: &str, port: u16, data: &[u8]) -> Result<SendAcks, TransportError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport rejected submission: {0}")]
    Rejected(String),
    #[error("transport unavailable")]
    Unavailable,
}

// ── Host queries ──────────────────────────────────────────────────────────────

/// Package manager queries.
pub trait InstalledApps: Send + Sync {
    fn is_installed(&self, app_id: &str) -> bool;

    /// When `app_id` was (last) installed, in ms since the epoch.
    fn install_timestamp(&self, app_id: &str) -> Option<u64>;

    /// Human-readable label; `None` once the app is uninstalled.
    fn display_name_for(&self, app_id: &str) -> Option<String>;
}

pub trait Permissions: Send + Sync {
    fn has_permission(&self, name: &str) -> bool;
}

/// Whether the device's radio can carry NBS traffic at all.
pub trait NetworkInfo: Send + Sync {
    fn is_compatible_network(&self) -> bool;
}

// ── UI conditions ─────────────────────────────────────────────────────────────

/// Named conditions the core raises for the user. The host decides how,
/// or whether, to surface each one.
pub trait UiNotifier: Send + Sync {
    fn need_permissions(&self, port: u16);
    fn not_supported_network(&self);
    fn send_failed(&self);
    fn version_mismatch(&self, app_id: &str, is_local_older: bool);
    fn no_registered_recipient(&self, port: u16);
}

// ── App-to-app channels ───────────────────────────────────────────────────────

/// Point-to-point delivery from the proxy to one client app.
pub trait AppChannel: Send + Sync {
    fn deliver(&self, app_id: &str, frame: &Frame) -> Result<(), DeliveryError>;
}

/// Delivery from a client app to the proxy app.
pub trait ProxyChannel: Send + Sync {
    fn send_to_proxy(&self, frame: &Frame) -> Result<(), DeliveryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("no receiver for {0}")]
    NotFound(String),
    #[error("delivery failed: {0}")]
    Failed(String),
}
