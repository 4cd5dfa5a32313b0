//! Client side of the proxy protocol.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use nbsp_core::capability::{DeliveryError, InstalledApps, ProxyChannel, UiNotifier};
use nbsp_core::config::ClientConfig;
use nbsp_core::wire::{WireError, MAX_NBS_PAYLOAD};
use nbsp_core::{Command, Frame, ProtocolVersion};
use nbsp_services::KvStore;
use tokio::sync::oneshot;

use crate::handshake::{Handshake, RegisterOutcome, RegistrationState};
use crate::pending::PendingSends;

/// Last time (ms) any frame arrived from the proxy.
pub const LAST_CONTACT_KEY: &str = "Client:lastProxyContact";

/// App-level hooks. All of them run on the thread that delivered the frame.
pub trait ProxyCallbacks: Send + Sync {
    fn on_proxy_app_launched(&self) {}
    fn on_permissions_granted(&self) {}
    fn on_reg_response(&self, outcome: &RegisterOutcome);
    fn on_data_received(&self, port: u16, from_phone: &str, data: &[u8]);
}

/// Host capabilities the client needs.
pub struct ClientHost {
    pub apps: Arc<dyn InstalledApps>,
    pub proxy: Arc<dyn ProxyChannel>,
    pub notifier: Arc<dyn UiNotifier>,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("proxy app {0} is not installed")]
    ProxyNotInstalled(String),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

struct Inner {
    app_id: String,
    proxy_app_id: String,
    version: ProtocolVersion,
    registration_timeout: Duration,
    store: KvStore,
    host: ClientHost,
    callbacks: RwLock<Option<Arc<dyn ProxyCallbacks>>>,
    handshake: Mutex<Handshake>,
    pending: PendingSends,
}

#[derive(Clone)]
pub struct ProxyClient {
    inner: Arc<Inner>,
}

impl ProxyClient {
    pub fn new(
        app_id: &str,
        version: ProtocolVersion,
        config: &ClientConfig,
        store: KvStore,
        host: ClientHost,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                app_id: app_id.to_string(),
                proxy_app_id: config.proxy_app_id.clone(),
                version,
                registration_timeout: config.registration_timeout(),
                store,
                host,
                callbacks: RwLock::new(None),
                handshake: Mutex::new(Handshake::new()),
                pending: PendingSends::new(),
            }),
        }
    }

    pub fn app_id(&self) -> &str {
        &self.inner.app_id
    }

    /// Install the app's callbacks, replacing any previous set.
    pub fn attach(&self, callbacks: Arc<dyn ProxyCallbacks>) {
        *self
            .inner
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callbacks);
    }

    /// Drop the callbacks. Frames arriving afterwards are logged and
    /// discarded.
    pub fn detach(&self) {
        *self
            .inner
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Detach, forget pending sends and abandon any registration wait.
    pub fn shutdown(&self) {
        self.detach();
        self.inner.pending.clear();
        self.handshake().expire();
    }

    pub fn registration_state(&self) -> RegistrationState {
        self.handshake().state()
    }

    fn handshake(&self) -> MutexGuard<'_, Handshake> {
        self.inner
            .handshake
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn callbacks(&self) -> Option<Arc<dyn ProxyCallbacks>> {
        self.inner
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ── Registration ──────────────────────────────────────────────────────────

    /// Whether the proxy app is installed. A registration parked while it
    /// was missing is retried in the background the first time this sees it.
    pub fn is_installed(&self) -> bool {
        if !self.inner.host.apps.is_installed(&self.inner.proxy_app_id) {
            return false;
        }
        let parked = self.handshake().take_parked();
        if let Some(port) = parked {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    tracing::info!(port, "proxy installed, retrying registration");
                    let client = self.clone();
                    handle.spawn(async move {
                        client.register(port).await;
                    });
                }
                Err(_) => {
                    self.handshake().park(port);
                    tracing::warn!(port, "no runtime to retry registration on");
                }
            }
        }
        true
    }

    /// Register this app for `port` with the proxy and wait for the answer.
    /// The outcome is also passed to `on_reg_response`.
    pub async fn register(&self, port: u16) -> RegisterOutcome {
        let Some((session, outcome)) = self.run_registration(port).await else {
            return RegisterOutcome::AlreadyPending;
        };
        if !self.handshake().settle(session, port, outcome) {
            tracing::debug!(port, ?outcome, "superseded by a newer registration");
        }
        match self.callbacks() {
            Some(cb) => cb.on_reg_response(&outcome),
            None => tracing::debug!(port, ?outcome, "registration settled with no callbacks"),
        }
        outcome
    }

    /// Runs one registration session. `None` if another is still waiting.
    async fn run_registration(&self, port: u16) -> Option<(u64, RegisterOutcome)> {
        let inner = &self.inner;
        let request_ms = nbsp_core::now_ms();

        let (session, rx) = {
            let mut hs = self.handshake();
            if hs.is_pending() {
                tracing::warn!(port, "registration already pending, dropping request");
                return None;
            }
            if !inner.host.apps.is_installed(&inner.proxy_app_id) {
                let session = hs.park(port)?;
                tracing::info!(port, proxy = %inner.proxy_app_id, "proxy not installed, registration parked");
                return Some((session, RegisterOutcome::AwaitingInstall));
            }
            hs.begin(port, request_ms)?
        };

        let request = Frame::register(&inner.version, port, &inner.app_id, request_ms);
        if let Err(e) = inner.host.proxy.send_to_proxy(&request) {
            tracing::warn!(port, error = %e, "registration request not delivered");
            self.handshake().expire();
            return Some((session, self.timed_out(port).await));
        }
        tracing::debug!(port, app_id = %inner.app_id, "registration sent");

        Some((session, self.await_response(port, rx).await))
    }

    async fn await_response(&self, port: u16, mut rx: oneshot::Receiver<u64>) -> RegisterOutcome {
        if let Ok(Ok(round_trip_ms)) = tokio::time::timeout(self.inner.registration_timeout, &mut rx).await {
            tracing::info!(port, round_trip_ms, "proxy reached");
            return RegisterOutcome::Reached { round_trip_ms };
        }

        self.handshake().expire();
        // The response may have landed between the timer and the expiry.
        if let Ok(round_trip_ms) = rx.try_recv() {
            tracing::info!(port, round_trip_ms, "proxy reached");
            return RegisterOutcome::Reached { round_trip_ms };
        }
        self.timed_out(port).await
    }

    async fn timed_out(&self, port: u16) -> RegisterOutcome {
        let needs_initial_launch = self.needs_initial_launch().await;
        tracing::info!(port, needs_initial_launch, "registration timed out");
        RegisterOutcome::TimedOut {
            needs_initial_launch,
        }
    }

    /// True when the proxy was installed after it was last heard from, or
    /// it has never been heard from.
    async fn needs_initial_launch(&self) -> bool {
        let installed = self.inner.host.apps.install_timestamp(&self.inner.proxy_app_id);
        let last_contact: Option<u64> = self.inner.store.get_json(LAST_CONTACT_KEY).await;
        match last_contact {
            None => true,
            Some(last) => installed.is_some_and(|at| at > last),
        }
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    /// Ask the proxy to send `data` to `phone` on `port`.
    pub fn send(&self, phone: &str, port: u16, data: &[u8]) -> Result<(), ClientError> {
        let inner = &self.inner;
        if data.len() > MAX_NBS_PAYLOAD {
            return Err(WireError::PayloadTooLarge {
                len: data.len(),
                max: MAX_NBS_PAYLOAD,
            }
            .into());
        }
        if !inner.host.apps.is_installed(&inner.proxy_app_id) {
            return Err(ClientError::ProxyNotInstalled(inner.proxy_app_id.clone()));
        }
        let frame = Frame::send(&inner.version, &inner.app_id, phone, port, data);
        inner.host.proxy.send_to_proxy(&frame)?;
        tracing::debug!(port, bytes = data.len(), "send handed to proxy");
        Ok(())
    }

    /// Like [`send`](Self::send), also returning a receiver that resolves
    /// when identical bytes are next delivered to this app.
    pub fn send_tracked(
        &self,
        phone: &str,
        port: u16,
        data: &[u8],
    ) -> Result<oneshot::Receiver<()>, ClientError> {
        let rx = self.inner.pending.track(data);
        if let Err(e) = self.send(phone, port, data) {
            self.inner.pending.forget(data);
            return Err(e);
        }
        Ok(rx)
    }

    pub fn pending(&self) -> &PendingSends {
        &self.inner.pending
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    /// Entry point for raw frames relayed by the proxy.
    pub fn on_message(&self, bytes: &[u8]) {
        match Frame::decode(bytes) {
            Ok(frame) => self.on_frame(&frame),
            Err(e) => tracing::warn!(error = %e, "dropping malformed frame from proxy"),
        }
    }

    pub fn on_frame(&self, frame: &Frame) {
        let inner = &self.inner;
        let now = nbsp_core::now_ms();
        if let Err(e) = inner.store.submit("last-contact", move |table| {
            table.put_json(LAST_CONTACT_KEY, &now)
        }) {
            tracing::warn!(error = %e, "failed to record proxy contact");
        }

        if frame.is_registration_response() {
            if !self.handshake().respond(frame, now) {
                tracing::debug!(port = frame.port, "ignoring unexpected registration response");
            }
            return;
        }

        let check = frame.version_check(&inner.version);
        if !check.is_compatible() {
            tracing::warn!(
                remote = frame.version.as_deref().unwrap_or("none"),
                local = %inner.version,
                ?check,
                "protocol version mismatch"
            );
            inner.host.notifier.version_mismatch(
                &inner.proxy_app_id,
                check == nbsp_core::VersionCheck::LocalOlder,
            );
            return;
        }

        let Some(callbacks) = self.callbacks() else {
            tracing::debug!(command = ?frame.command, "no callbacks attached, dropping frame");
            return;
        };

        match frame.command {
            Command::AppLaunched => callbacks.on_proxy_app_launched(),
            Command::PermissionsGranted => callbacks.on_permissions_granted(),
            Command::Deliver => match frame.require_data() {
                Ok((phone, port, data)) => {
                    if inner.pending.complete(data) {
                        tracing::debug!(port, "pending send echoed");
                    }
                    tracing::debug!(port, bytes = data.len(), "data delivered");
                    callbacks.on_data_received(port, phone, data);
                }
                Err(e) => tracing::error!(error = %e, "dropping incomplete delivery"),
            },
            Command::Register | Command::Send => {
                tracing::warn!(command = ?frame.command, "unexpected command from proxy");
            }
        }
    }
}
