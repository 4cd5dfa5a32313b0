//! Port registry — which apps want traffic for which NBS port.
//!
//! The map is read from the store once, on first use, and every mutation
//! is written straight back as a single JSON snapshot under
//! [`PORT_MAP_KEY`]. Concurrent first callers wait on the one load.

use nbsp_core::capability::InstalledApps;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, OnceCell};

use crate::store::KvStore;

pub const PORT_MAP_KEY: &str = "PortMap:ports";

type PortMap = HashMap<u16, BTreeSet<String>>;

#[derive(Clone)]
pub struct PortRegistry {
    store: KvStore,
    apps: Arc<dyn InstalledApps>,
    map: Arc<OnceCell<Mutex<PortMap>>>,
}

impl PortRegistry {
    pub fn new(store: KvStore, apps: Arc<dyn InstalledApps>) -> Self {
        Self {
            store,
            apps,
            map: Arc::new(OnceCell::new()),
        }
    }

    async fn map(&self) -> MutexGuard<'_, PortMap> {
        self.map
            .get_or_init(|| async {
                let map: PortMap = self.store.get_json(PORT_MAP_KEY).await.unwrap_or_default();
                tracing::debug!(ports = map.len(), "port map loaded");
                Mutex::new(map)
            })
            .await
            .lock()
            .await
    }

    /// Add `app_id` to `port`. Returns `false` (and writes nothing) if it
    /// was already there.
    pub async fn register(&self, port: u16, app_id: &str) -> bool {
        debug_assert!(port != 0, "port 0 is never routable");
        let mut map = self.map().await;
        if !map.entry(port).or_default().insert(app_id.to_string()) {
            return false;
        }
        tracing::info!(port, app_id, "app registered");
        self.persist(&map).await;
        true
    }

    /// Remove `app_id` from `port`; a port left with no apps is dropped.
    pub async fn unregister(&self, port: u16, app_id: &str) -> bool {
        let mut map = self.map().await;
        let Some(apps) = map.get_mut(&port) else {
            return false;
        };
        if !apps.remove(app_id) {
            return false;
        }
        if apps.is_empty() {
            map.remove(&port);
        }
        tracing::info!(port, app_id, "app unregistered");
        self.persist(&map).await;
        true
    }

    /// Apps registered for `port`; empty for unknown ports.
    pub async fn lookup(&self, port: u16) -> Vec<String> {
        self.map()
            .await
            .get(&port)
            .map(|apps| apps.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn lookup_many(&self, ports: &[u16]) -> BTreeMap<u16, Vec<String>> {
        let map = self.map().await;
        ports
            .iter()
            .map(|port| {
                let apps = map
                    .get(port)
                    .map(|apps| apps.iter().cloned().collect())
                    .unwrap_or_default();
                (*port, apps)
            })
            .collect()
    }

    /// The whole routing table, ordered by port.
    pub async fn snapshot(&self) -> BTreeMap<u16, Vec<String>> {
        self.map()
            .await
            .iter()
            .map(|(port, apps)| (*port, apps.iter().cloned().collect()))
            .collect()
    }

    /// Every app registered on any port.
    pub async fn app_ids(&self) -> BTreeSet<String> {
        self.map().await.values().flatten().cloned().collect()
    }

    /// Label for `app_id`, or `None` once it is uninstalled.
    pub fn name_for(&self, app_id: &str) -> Option<String> {
        self.apps.display_name_for(app_id)
    }

    /// Display name of the first app on `port` that still resolves.
    pub async fn name_for_port(&self, port: u16) -> Option<String> {
        self.lookup(port)
            .await
            .iter()
            .find_map(|app_id| self.name_for(app_id))
    }

    async fn persist(&self, map: &PortMap) {
        if let Err(e) = self.store.put_json(PORT_MAP_KEY, map).await {
            tracing::warn!(error = %e, "failed to persist port map");
        }
    }
}
