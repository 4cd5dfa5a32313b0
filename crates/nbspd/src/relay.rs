//! Message relay — inbound SMS fan-out and proxy-wide announcements.
//!
//! The host feeds every binary SMS into [`Relay::on_frame_received`]. The
//! relay looks the port up in the routing table and forwards the payload
//! to each registered app on its own; one app failing does not stop the
//! others.

use std::sync::Arc;

use bytes::Bytes;
use nbsp_core::capability::{
    AppChannel, InstalledApps, NetworkInfo, Permissions, Transport, UiNotifier,
};
use nbsp_core::config::ProxyConfig;
use nbsp_core::{Command, Frame, ProtocolVersion};
use nbsp_services::{KvStore, PortRegistry, UsageLedger};

use crate::delivery::DeliveryTracker;

/// Last time (ms) the proxy received any SMS.
pub const LAST_RECEIVE_KEY: &str = "Relay:lastReceive";

/// Host capabilities the proxy needs.
pub struct ProxyHost {
    pub transport: Arc<dyn Transport>,
    pub apps: Arc<dyn InstalledApps>,
    pub permissions: Arc<dyn Permissions>,
    pub network: Arc<dyn NetworkInfo>,
    pub notifier: Arc<dyn UiNotifier>,
    pub channel: Arc<dyn AppChannel>,
}

pub(crate) struct RelayInner {
    pub(crate) version: ProtocolVersion,
    pub(crate) config: ProxyConfig,
    pub(crate) store: KvStore,
    pub(crate) registry: PortRegistry,
    pub(crate) ledger: UsageLedger,
    pub(crate) tracker: DeliveryTracker,
    pub(crate) host: ProxyHost,
}

#[derive(Clone)]
pub struct Relay {
    pub(crate) inner: Arc<RelayInner>,
}

impl Relay {
    pub fn new(version: ProtocolVersion, config: ProxyConfig, store: KvStore, host: ProxyHost) -> Self {
        let registry = PortRegistry::new(store.clone(), host.apps.clone());
        let ledger = UsageLedger::new(store.clone(), registry.clone());
        Self {
            inner: Arc::new(RelayInner {
                version,
                config,
                store,
                registry,
                ledger,
                tracker: DeliveryTracker::new(),
                host,
            }),
        }
    }

    pub fn registry(&self) -> &PortRegistry {
        &self.inner.registry
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.inner.ledger
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        &self.inner.tracker
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    /// An SMS arrived from `source` on `port`. Returns how many apps it
    /// was handed to.
    pub async fn on_frame_received(&self, source: &str, port: u16, data: Bytes) -> usize {
        let inner = &self.inner;
        let now = nbsp_core::now_ms();
        if let Err(e) = inner
            .store
            .submit("last-receive", move |table| table.put_json(LAST_RECEIVE_KEY, &now))
        {
            tracing::warn!(error = %e, "failed to record receive time");
        }

        let recipients = inner.registry.lookup(port).await;
        if recipients.is_empty() {
            tracing::info!(port, bytes = data.len(), "no registered recipient, dropping");
            inner.host.notifier.no_registered_recipient(port);
            return 0;
        }

        let frame = Frame::deliver(&inner.version, source, port, &data);
        let mut delivered = 0;
        for app_id in &recipients {
            match inner.host.channel.deliver(app_id, &frame) {
                Ok(()) => {
                    tracing::debug!(port, app_id = %app_id, bytes = data.len(), "delivered");
                    delivered += 1;
                }
                Err(e) => tracing::warn!(port, app_id = %app_id, error = %e, "delivery to app failed"),
            }
        }

        inner.ledger.record(false, port, data.len());
        delivered
    }

    // ── Announcements ─────────────────────────────────────────────────────────

    /// Tell every registered app that the proxy app was opened.
    pub async fn announce_app_launched(&self) -> usize {
        self.announce(Command::AppLaunched).await
    }

    /// Tell every registered app that the send permission was granted.
    pub async fn announce_permissions_granted(&self) -> usize {
        self.announce(Command::PermissionsGranted).await
    }

    async fn announce(&self, command: Command) -> usize {
        let frame = Frame::control(&self.inner.version, command);
        let mut reached = 0;
        for app_id in self.inner.registry.app_ids().await {
            match self.inner.host.channel.deliver(&app_id, &frame) {
                Ok(()) => reached += 1,
                Err(e) => tracing::warn!(app_id = %app_id, ?command, error = %e, "announcement not delivered"),
            }
        }
        tracing::debug!(?command, reached, "announced");
        reached
    }
}
