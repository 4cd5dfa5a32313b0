//! NBSProxy integration test harness.
//!
//! Wires one proxy [`Relay`] and any number of [`ProxyClient`]s together
//! in-process. The carrier, the package manager and the app-to-app
//! channels are fakes; everything between them is the real code.
//!
//!   cargo test --test integration

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};

use nbsp_client::{ClientHost, ProxyCallbacks, ProxyClient, RegisterOutcome};
use nbsp_core::capability::{
    AppChannel, DeliveryError, InstalledApps, NetworkInfo, Permissions, ProxyChannel, SendAcks,
    Transport, TransportError, UiNotifier,
};
use nbsp_core::config::NbspConfig;
use nbsp_core::Frame;
use nbsp_services::KvStore;
use nbspd::{LogNotifier, ProxyHost, Relay};

mod ledger;
mod routing;

pub const PROXY_APP: &str = "org.eehouse.android.nbsp";
pub const PHONE: &str = "+15551234567";

// ── Fakes ─────────────────────────────────────────────────────────────────────

/// Package manager with install times in ms.
#[derive(Default)]
pub struct Packages {
    installed: Mutex<HashMap<String, u64>>,
}

impl Packages {
    pub fn install(&self, app_id: &str, at_ms: u64) {
        self.installed.lock().unwrap().insert(app_id.to_string(), at_ms);
    }

    pub fn uninstall(&self, app_id: &str) {
        self.installed.lock().unwrap().remove(app_id);
    }
}

impl InstalledApps for Packages {
    fn is_installed(&self, app_id: &str) -> bool {
        self.installed.lock().unwrap().contains_key(app_id)
    }
    fn install_timestamp(&self, app_id: &str) -> Option<u64> {
        self.installed.lock().unwrap().get(app_id).copied()
    }
    fn display_name_for(&self, app_id: &str) -> Option<String> {
        self.is_installed(app_id)
            .then(|| app_id.rsplit('.').next().unwrap_or(app_id).to_string())
    }
}

pub struct Granted;

impl Permissions for Granted {
    fn has_permission(&self, _name: &str) -> bool {
        true
    }
}

impl NetworkInfo for Granted {
    fn is_compatible_network(&self) -> bool {
        true
    }
}

/// Accepts everything and acknowledges immediately.
#[derive(Default)]
pub struct Carrier {
    pub outbox: Mutex<Vec<(String, u16, Vec<u8>)>>,
}

impl Transport for Carrier {
    fn send_frame(&self, target: &str, port: u16, data: &[u8]) -> Result<SendAcks, TransportError> {
        self.outbox
            .lock()
            .unwrap()
            .push((target.to_string(), port, data.to_vec()));
        let (senders, acks) = SendAcks::channel();
        let _ = senders.sent.send(true);
        let _ = senders.delivered.send(true);
        Ok(acks)
    }
}

/// Proxy → client delivery, by app id.
#[derive(Default)]
pub struct AppRouter {
    clients: Mutex<HashMap<String, ProxyClient>>,
    broken: Mutex<HashSet<String>>,
}

impl AppRouter {
    pub fn add(&self, client: &ProxyClient) {
        self.clients
            .lock()
            .unwrap()
            .insert(client.app_id().to_string(), client.clone());
    }

    pub fn break_app(&self, app_id: &str) {
        self.broken.lock().unwrap().insert(app_id.to_string());
    }
}

impl AppChannel for AppRouter {
    fn deliver(&self, app_id: &str, frame: &Frame) -> Result<(), DeliveryError> {
        if self.broken.lock().unwrap().contains(app_id) {
            return Err(DeliveryError::Failed(format!("{app_id} crashed")));
        }
        let client = self.clients.lock().unwrap().get(app_id).cloned();
        match client {
            Some(client) => {
                let bytes = frame
                    .encode()
                    .map_err(|e| DeliveryError::Failed(e.to_string()))?;
                client.on_message(&bytes);
                Ok(())
            }
            None => Err(DeliveryError::NotFound(app_id.to_string())),
        }
    }
}

/// Client → proxy delivery. Dropped on the floor while `down`.
pub struct ToRelay {
    relay: Relay,
    down: AtomicBool,
}

impl ProxyChannel for ToRelay {
    fn send_to_proxy(&self, frame: &Frame) -> Result<(), DeliveryError> {
        if self.down.load(Ordering::SeqCst) {
            return Ok(());
        }
        let bytes = frame
            .encode()
            .map_err(|e| DeliveryError::Failed(e.to_string()))?;
        let relay = self.relay.clone();
        tokio::spawn(async move { relay.on_client_message(&bytes).await });
        Ok(())
    }
}

/// Everything a client app saw.
#[derive(Default)]
pub struct Inbox {
    pub outcomes: Mutex<Vec<RegisterOutcome>>,
    pub data: Mutex<Vec<(u16, String, Vec<u8>)>>,
    pub launched: AtomicBool,
    pub granted: AtomicBool,
}

impl ProxyCallbacks for Inbox {
    fn on_proxy_app_launched(&self) {
        self.launched.store(true, Ordering::SeqCst);
    }
    fn on_permissions_granted(&self) {
        self.granted.store(true, Ordering::SeqCst);
    }
    fn on_reg_response(&self, outcome: &RegisterOutcome) {
        self.outcomes.lock().unwrap().push(*outcome);
    }
    fn on_data_received(&self, port: u16, from_phone: &str, data: &[u8]) {
        self.data
            .lock()
            .unwrap()
            .push((port, from_phone.to_string(), data.to_vec()));
    }
}

/// Records what the proxy raised for the user.
#[derive(Default)]
pub struct Raised(Mutex<Vec<String>>);

impl Raised {
    pub fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

impl UiNotifier for Raised {
    fn need_permissions(&self, port: u16) {
        self.0.lock().unwrap().push(format!("need_permissions:{port}"));
    }
    fn not_supported_network(&self) {
        self.0.lock().unwrap().push("not_supported_network".into());
    }
    fn send_failed(&self) {
        self.0.lock().unwrap().push("send_failed".into());
    }
    fn version_mismatch(&self, app_id: &str, is_local_older: bool) {
        self.0
            .lock()
            .unwrap()
            .push(format!("version_mismatch:{app_id}:{is_local_older}"));
    }
    fn no_registered_recipient(&self, port: u16) {
        self.0
            .lock()
            .unwrap()
            .push(format!("no_registered_recipient:{port}"));
    }
}

// ── Device ────────────────────────────────────────────────────────────────────

/// One handset: the proxy app plus the client apps installed next to it.
pub struct Device {
    pub config: NbspConfig,
    pub packages: Arc<Packages>,
    pub carrier: Arc<Carrier>,
    pub router: Arc<AppRouter>,
    pub raised: Arc<Raised>,
    pub relay: Relay,
}

pub struct App {
    pub client: ProxyClient,
    pub inbox: Arc<Inbox>,
    pub link: Arc<ToRelay>,
}

impl Device {
    pub fn new() -> Result<Self> {
        let mut config = NbspConfig::default();
        config.client.registration_timeout_ms = 1_000;

        let packages = Arc::new(Packages::default());
        packages.install(PROXY_APP, 1_000);
        let carrier = Arc::new(Carrier::default());
        let router = Arc::new(AppRouter::default());
        let raised = Arc::new(Raised::default());

        let store = KvStore::in_memory(config.store.idle_timeout())?;
        let relay = Relay::new(
            config.version()?,
            config.proxy.clone(),
            store,
            ProxyHost {
                transport: carrier.clone(),
                apps: packages.clone(),
                permissions: Arc::new(Granted),
                network: Arc::new(Granted),
                notifier: raised.clone(),
                channel: router.clone(),
            },
        );

        Ok(Self {
            config,
            packages,
            carrier,
            router,
            raised,
            relay,
        })
    }

    /// Install a client app with its own private store.
    pub fn install_app(&self, app_id: &str) -> Result<App> {
        self.packages.install(app_id, 2_000);
        let link = Arc::new(ToRelay {
            relay: self.relay.clone(),
            down: AtomicBool::new(false),
        });
        let store = KvStore::in_memory(self.config.store.idle_timeout())?;
        let client = ProxyClient::new(
            app_id,
            self.config.version()?,
            &self.config.client,
            store,
            ClientHost {
                apps: self.packages.clone(),
                proxy: link.clone(),
                notifier: Arc::new(LogNotifier),
            },
        );
        let inbox = Arc::new(Inbox::default());
        client.attach(inbox.clone());
        self.router.add(&client);
        Ok(App {
            client,
            inbox,
            link,
        })
    }
}

impl App {
    /// Stop the proxy from hearing this app, as if it was never launched.
    pub fn cut_link(&self) {
        self.link.down.store(true, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<(u16, String, Vec<u8>)> {
        self.inbox.data.lock().unwrap().clone()
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("timed out waiting for {what}")
}
