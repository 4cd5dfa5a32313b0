//! In-memory host capabilities for the relay's unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nbsp_core::capability::{
    AppChannel, DeliveryError, InstalledApps, NetworkInfo, Permissions, SendAcks, Transport,
    TransportError, UiNotifier,
};
use nbsp_core::config::ProxyConfig;
use nbsp_core::wire::PROTOCOL_VERSION;
use nbsp_core::Frame;
use nbsp_services::KvStore;

use crate::relay::{ProxyHost, Relay};

pub struct Toggle(AtomicBool);

impl Toggle {
    fn on() -> Arc<Self> {
        Arc::new(Self(AtomicBool::new(true)))
    }

    pub fn set(&self, value: bool) {
        self.0.store(value, Ordering::SeqCst);
    }

    fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Permissions for Toggle {
    fn has_permission(&self, _name: &str) -> bool {
        self.get()
    }
}

impl NetworkInfo for Toggle {
    fn is_compatible_network(&self) -> bool {
        self.get()
    }
}

pub struct Apps;

impl InstalledApps for Apps {
    fn is_installed(&self, _app_id: &str) -> bool {
        true
    }
    fn install_timestamp(&self, _app_id: &str) -> Option<u64> {
        Some(0)
    }
    fn display_name_for(&self, app_id: &str) -> Option<String> {
        Some(app_id.rsplit('.').next().unwrap_or(app_id).to_string())
    }
}

#[derive(Default)]
pub struct Channel {
    delivered: Mutex<Vec<(String, Frame)>>,
    failing: Mutex<HashSet<String>>,
}

impl Channel {
    pub fn fail_for(&self, app_id: &str) {
        self.failing.lock().unwrap().insert(app_id.to_string());
    }

    pub fn delivered(&self) -> Vec<(String, Frame)> {
        self.delivered.lock().unwrap().clone()
    }
}

impl AppChannel for Channel {
    fn deliver(&self, app_id: &str, frame: &Frame) -> Result<(), DeliveryError> {
        if self.failing.lock().unwrap().contains(app_id) {
            return Err(DeliveryError::NotFound(app_id.to_string()));
        }
        self.delivered
            .lock()
            .unwrap()
            .push((app_id.to_string(), frame.clone()));
        Ok(())
    }
}

pub struct FakeTransport {
    sent: Mutex<Vec<(String, u16, Vec<u8>)>>,
    reject: AtomicBool,
    ack_sent: AtomicBool,
}

impl FakeTransport {
    pub fn sent(&self) -> Vec<(String, u16, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn reject(&self, value: bool) {
        self.reject.store(value, Ordering::SeqCst);
    }

    pub fn ack_sent(&self, value: bool) {
        self.ack_sent.store(value, Ordering::SeqCst);
    }
}

impl Transport for FakeTransport {
    fn send_frame(&self, target: &str, port: u16, data: &[u8]) -> Result<SendAcks, TransportError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable);
        }
        self.sent
            .lock()
            .unwrap()
            .push((target.to_string(), port, data.to_vec()));
        let (senders, acks) = SendAcks::channel();
        let ok = self.ack_sent.load(Ordering::SeqCst);
        let _ = senders.sent.send(ok);
        let _ = senders.delivered.send(ok);
        Ok(acks)
    }
}

#[derive(Default)]
pub struct Notes(Mutex<Vec<String>>);

impl Notes {
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }

    fn push(&self, note: String) {
        self.0.lock().unwrap().push(note);
    }
}

impl UiNotifier for Notes {
    fn need_permissions(&self, port: u16) {
        self.push(format!("need_permissions:{port}"));
    }
    fn not_supported_network(&self) {
        self.push("not_supported_network".to_string());
    }
    fn send_failed(&self) {
        self.push("send_failed".to_string());
    }
    fn version_mismatch(&self, app_id: &str, is_local_older: bool) {
        self.push(format!("version_mismatch:{app_id}:{is_local_older}"));
    }
    fn no_registered_recipient(&self, port: u16) {
        self.push(format!("no_registered_recipient:{port}"));
    }
}

pub struct Harness {
    pub relay: Relay,
    pub channel: Arc<Channel>,
    pub transport: Arc<FakeTransport>,
    pub permissions: Arc<Toggle>,
    pub network: Arc<Toggle>,
    pub notes: Arc<Notes>,
}

impl Harness {
    pub fn new() -> Self {
        let store = KvStore::in_memory(Duration::from_secs(10)).unwrap();
        let channel = Arc::new(Channel::default());
        let transport = Arc::new(FakeTransport {
            sent: Mutex::new(Vec::new()),
            reject: AtomicBool::new(false),
            ack_sent: AtomicBool::new(true),
        });
        let permissions = Toggle::on();
        let network = Toggle::on();
        let notes = Arc::new(Notes::default());
        let relay = Relay::new(
            PROTOCOL_VERSION,
            ProxyConfig::default(),
            store,
            ProxyHost {
                transport: transport.clone(),
                apps: Arc::new(Apps),
                permissions: permissions.clone(),
                network: network.clone(),
                notifier: notes.clone(),
                channel: channel.clone(),
            },
        );
        Self {
            relay,
            channel,
            transport,
            permissions,
            network,
            notes,
        }
    }
}
