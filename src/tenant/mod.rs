//! The tenant cluster registry: one entry per registered tenant control
//! plane, each with its own client, reflector stores and lifecycle. Readers
//! go through the cache; writes go straight to the tenant apiserver.

pub mod controller;

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use kube::Client;
use kube::runtime::reflector::{Lookup, Store};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::api::VirtualClusterSpec;
use crate::config::{DEFAULT_OPAQUE_PREFIXES, DEFAULT_TRANSPARENT_PREFIXES};
use crate::errors::{Error, Result};

/// Metadata handling rules for one tenant, caller-supplied prefixes merged
/// with the defaults.
#[derive(Debug, Clone)]
pub struct TenantSpec {
    pub opaque_prefixes: Vec<String>,
    pub transparent_prefixes: Vec<String>,
}

impl TenantSpec {
    pub fn merged(spec: &VirtualClusterSpec) -> Self {
        let mut opaque: Vec<String> = DEFAULT_OPAQUE_PREFIXES
            .iter()
            .map(|s| s.to_string())
            .collect();
        for p in &spec.opaque_meta_prefixes {
            if !opaque.contains(p) {
                opaque.push(p.clone());
            }
        }
        let mut transparent: Vec<String> = DEFAULT_TRANSPARENT_PREFIXES
            .iter()
            .map(|s| s.to_string())
            .collect();
        for p in &spec.transparent_meta_prefixes {
            if !transparent.contains(p) {
                transparent.push(p.clone());
            }
        }
        Self {
            opaque_prefixes: opaque,
            transparent_prefixes: transparent,
        }
    }
}

impl Default for TenantSpec {
    fn default() -> Self {
        Self::merged(&VirtualClusterSpec::default())
    }
}

#[async_trait]
trait AnyStore: Send + Sync {
    async fn ready(&self);
}

struct StoreHandle<K>(Store<K>)
where
    K: Lookup + Clone + Send + Sync + 'static,
    K::DynamicType: std::hash::Hash + Eq + Clone + Send + Sync;

#[async_trait]
impl<K> AnyStore for StoreHandle<K>
where
    K: Lookup + Clone + Send + Sync + 'static,
    K::DynamicType: std::hash::Hash + Eq + Clone + Send + Sync,
{
    async fn ready(&self) {
        let _ = self.0.wait_until_ready().await;
    }
}

/// One registered tenant control plane.
pub struct TenantCluster {
    key: String,
    client: Client,
    spec: TenantSpec,
    synced: AtomicBool,
    stores: std::sync::Mutex<HashMap<&'static str, (Box<dyn Any + Send + Sync>, Arc<dyn AnyStore>)>>,
    /// Store writers parked between watch registration phases.
    writers: std::sync::Mutex<HashMap<&'static str, Box<dyn Any + Send>>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl TenantCluster {
    pub fn new(key: impl Into<String>, client: Client, spec: TenantSpec) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            client,
            spec,
            synced: AtomicBool::new(false),
            stores: std::sync::Mutex::new(HashMap::new()),
            writers: std::sync::Mutex::new(HashMap::new()),
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn spec(&self) -> &TenantSpec {
        &self.spec
    }

    /// Direct client; used for writes, which never go through the cache.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Cache-backed access. Until the caches have synced this returns
    /// [`Error::ClusterNotReady`] and callers are expected to back off.
    pub fn delegating_client(&self) -> Result<Client> {
        if !self.is_synced() {
            return Err(Error::ClusterNotReady(self.key.clone()));
        }
        Ok(self.client.clone())
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub fn insert_store<K>(&self, kind: &'static str, store: Store<K>)
    where
        K: Lookup + Clone + Send + Sync + 'static,
        K::DynamicType: std::hash::Hash + Eq + Clone + Send + Sync,
    {
        if let Ok(mut stores) = self.stores.lock() {
            stores.insert(
                kind,
                (
                    Box::new(store.clone()),
                    Arc::new(StoreHandle(store)) as Arc<dyn AnyStore>,
                ),
            );
        }
    }

    /// The reflector store for a kind, if one was registered.
    pub fn store<K>(&self, kind: &'static str) -> Option<Store<K>>
    where
        K: Lookup + Clone + Send + Sync + 'static,
        K::DynamicType: std::hash::Hash + Eq + Clone + Send + Sync,
    {
        let stores = self.stores.lock().ok()?;
        stores
            .get(kind)
            .and_then(|(any, _)| any.downcast_ref::<Store<K>>())
            .cloned()
    }

    /// Cache-backed read of one object; `None` when the store has no entry.
    pub fn cached<K>(&self, kind: &'static str, namespace: &str, name: &str) -> Result<Option<Arc<K>>>
    where
        K: Lookup<DynamicType = ()> + Clone + Send + Sync + 'static,
    {
        if !self.is_synced() {
            return Err(Error::ClusterNotReady(self.key.clone()));
        }
        let store = match self.store::<K>(kind) {
            Some(s) => s,
            None => return Ok(None),
        };
        let obj_ref = kube::runtime::reflector::ObjectRef::<K>::new(name).within(namespace);
        Ok(store.get(&obj_ref))
    }

    /// Parks a store writer between the register and watch phases.
    pub fn stash_writer<K>(&self, kind: &'static str, writer: kube::runtime::reflector::store::Writer<K>)
    where
        K: Lookup + Clone + Send + 'static,
        K::DynamicType: std::hash::Hash + Eq + Clone + Default + Send,
    {
        if let Ok(mut writers) = self.writers.lock() {
            writers.insert(kind, Box::new(writer));
        }
    }

    pub fn take_writer<K>(&self, kind: &'static str) -> Option<kube::runtime::reflector::store::Writer<K>>
    where
        K: Lookup + Clone + Send + 'static,
        K::DynamicType: std::hash::Hash + Eq + Clone + Default + Send,
    {
        let mut writers = self.writers.lock().ok()?;
        let boxed = writers.remove(kind)?;
        boxed
            .downcast::<kube::runtime::reflector::store::Writer<K>>()
            .ok()
            .map(|w| *w)
    }

    pub fn track_task(&self, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
    }

    /// Blocks until every registered store has completed its initial list,
    /// then marks the cluster synced.
    pub async fn wait_for_cache_sync(&self) {
        let waiters: Vec<Arc<dyn AnyStore>> = match self.stores.lock() {
            Ok(stores) => stores.values().map(|(_, w)| Arc::clone(w)).collect(),
            Err(_) => Vec::new(),
        };
        for w in waiters {
            w.ready().await;
        }
        self.synced.store(true, Ordering::Release);
        info!(cluster = %self.key, "tenant caches synced");
    }

    /// Stops every watch task; the cluster is unusable afterwards.
    pub fn stop(&self) {
        self.synced.store(false, Ordering::Release);
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        debug!(cluster = %self.key, "tenant cluster stopped");
    }
}

/// Registry membership changes, fanned out to every multi-cluster controller.
#[derive(Clone)]
pub enum RegistryEvent {
    Added(Arc<TenantCluster>),
    Removed(String),
}

/// Process-wide set of registered tenants, guarded by its own mutex; the
/// controllers keep their own cluster maps and only react to events.
pub struct ClusterRegistry {
    clusters: std::sync::Mutex<HashMap<String, Arc<TenantCluster>>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl ClusterRegistry {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            clusters: std::sync::Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, key: &str) -> Option<Arc<TenantCluster>> {
        self.clusters.lock().ok()?.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.clusters
            .lock()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn synced_clusters(&self) -> Vec<Arc<TenantCluster>> {
        self.clusters
            .lock()
            .map(|c| c.values().filter(|t| t.is_synced()).cloned().collect())
            .unwrap_or_default()
    }

    /// Registers a tenant. Replacing an existing key stops the old entry
    /// first.
    pub fn add(&self, cluster: Arc<TenantCluster>) {
        let key = cluster.key().to_string();
        let previous = match self.clusters.lock() {
            Ok(mut clusters) => clusters.insert(key.clone(), Arc::clone(&cluster)),
            Err(_) => None,
        };
        if let Some(old) = previous {
            old.stop();
        }
        info!(cluster = %key, "tenant cluster registered");
        let _ = self.events.send(RegistryEvent::Added(cluster));
    }

    pub fn remove(&self, key: &str) {
        let removed = match self.clusters.lock() {
            Ok(mut clusters) => clusters.remove(key),
            Err(_) => None,
        };
        if let Some(cluster) = removed {
            cluster.stop();
            info!(cluster = %key, "tenant cluster removed");
            let _ = self.events.send(RegistryEvent::Removed(key.to_string()));
        }
    }
}
