//! The virtual cluster syncer: downward mirroring of tenant objects into the
//! super cluster, upward status back-population, and the periodic patrol
//! that repairs drift between the two.
//!
//! Kind-specific behavior lives behind [`SyncedResource`]; each kind
//! contributes a small strategy implementation selected at registration.

pub mod dws;
pub mod patrol;
pub mod resources;
pub mod uws;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Config;
use crate::errors::Result;
use crate::api::meta;
use crate::mcc::{MultiClusterController, Options};
use crate::metrics::Metrics;
use crate::tenant::{ClusterRegistry, RegistryEvent, TenantCluster, TenantSpec};

/// Super-side namespace backing `vns` of the given tenant.
pub fn super_namespace(cluster_key: &str, vns: &str) -> String {
    format!("{cluster_key}-{vns}")
}

/// Inverse of [`super_namespace`] for a known cluster key.
pub fn tenant_namespace(cluster_key: &str, super_ns: &str) -> Option<String> {
    super_ns
        .strip_prefix(cluster_key)
        .and_then(|rest| rest.strip_prefix('-'))
        .filter(|rest| !rest.is_empty())
        .map(String::from)
}

/// The cluster key a super object is delegated to, if any.
pub fn delegated_cluster<R: Resource>(obj: &R) -> Option<String> {
    obj.meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(meta::CLUSTER_KEY))
        .cloned()
}

/// The tenant-object UID recorded on a super copy.
pub fn owner_uid<R: Resource>(obj: &R) -> Option<String> {
    obj.meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(meta::OWNER_UID))
        .cloned()
}

fn prefix_matches(key: &str, prefix: &str) -> bool {
    key == prefix || key.starts_with(&format!("{prefix}/"))
}

fn filter_metadata(
    map: std::collections::BTreeMap<String, String>,
    spec: &TenantSpec,
) -> std::collections::BTreeMap<String, String> {
    map.into_iter()
        .filter(|(k, _)| {
            // Transparent prefixes win over opaque ones.
            spec.transparent_prefixes.iter().any(|p| prefix_matches(k, p))
                || !spec.opaque_prefixes.iter().any(|p| prefix_matches(k, p))
        })
        .collect()
}

/// Per-kind strategy: how a resource is translated, mutated, compared and
/// back-populated when it crosses the cluster boundary.
#[async_trait]
pub trait SyncedResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + DeserializeOwned
    + Serialize
    + Debug
    + Send
    + Sync
    + 'static
{
    const KIND: &'static str;

    /// Clears fields that must not cross into the super cluster (cluster
    /// IPs, host mounts, volume bindings).
    fn mutate_for_super(&mut self);

    /// Whether the super object already reflects the tenant-desired state.
    fn desired_equal(desired: &Self, super_obj: &Self) -> bool;

    /// Whether the super object carries state the tenant has not seen yet.
    fn status_differs(tenant: &Self, super_obj: &Self) -> bool;

    /// Folds super-side state back into the tenant object; returns whether
    /// anything changed.
    fn back_populate(tenant: &mut Self, super_obj: &Self) -> bool;

    /// Whether back-population touches more than the status subresource.
    fn back_populates_spec() -> bool {
        false
    }

    /// Gate evaluated on the tenant object before a downward write.
    fn downward_allowed(&self, _super_cluster_id: &str) -> bool {
        true
    }

    /// Kind-specific side effects in the tenant cluster before the status
    /// write-back (e.g. binding a pod to a virtual node).
    async fn upward_effects(
        _cluster: &TenantCluster,
        _super_obj: &Self,
        _tenant_ns: &str,
    ) -> Result<()> {
        Ok(())
    }
}

/// Builds the super-cluster rendition of a tenant object: identity cleared,
/// metadata filtered through the tenant's prefix rules, delegation
/// annotations stamped, kind-specific mutation applied.
pub fn build_super_object<R: SyncedResource>(
    cluster_key: &str,
    spec: &TenantSpec,
    tenant_obj: &R,
) -> R {
    let mut obj = tenant_obj.clone();
    let tenant_uid = tenant_obj.uid().unwrap_or_default();
    let vns = tenant_obj.namespace().unwrap_or_default();

    let metadata = obj.meta_mut();
    metadata.namespace = Some(super_namespace(cluster_key, &vns));
    metadata.uid = None;
    metadata.resource_version = None;
    metadata.owner_references = None;
    metadata.managed_fields = None;
    metadata.creation_timestamp = None;
    metadata.generation = None;
    metadata.finalizers = None;
    metadata.deletion_timestamp = None;
    metadata.deletion_grace_period_seconds = None;

    metadata.labels = metadata
        .labels
        .take()
        .map(|l| filter_metadata(l, spec))
        .filter(|l| !l.is_empty());
    let mut annotations = metadata
        .annotations
        .take()
        .map(|a| filter_metadata(a, spec))
        .unwrap_or_default();
    annotations.insert(meta::CLUSTER_KEY.to_string(), cluster_key.to_string());
    annotations.insert(meta::OWNER_UID.to_string(), tenant_uid);
    metadata.annotations = Some(annotations);

    obj.mutate_for_super();
    obj
}

/// Serialized equality; good enough for spec/status comparison because the
/// openapi types serialize deterministically.
pub(crate) fn json_eq<T: Serialize>(a: &T, b: &T) -> bool {
    serde_json::to_value(a).ok() == serde_json::to_value(b).ok()
}

/// Every desired entry present with the same value; the actual map may carry
/// extra server-side entries without counting as drift.
pub(crate) fn maps_subset(
    desired: &Option<std::collections::BTreeMap<String, String>>,
    actual: &Option<std::collections::BTreeMap<String, String>>,
) -> bool {
    let empty = std::collections::BTreeMap::new();
    let desired = desired.as_ref().unwrap_or(&empty);
    let actual = actual.as_ref().unwrap_or(&empty);
    desired.iter().all(|(k, v)| actual.get(k) == Some(v))
}

/// Whether a super object is the mirror of the given tenant object.
pub fn owner_matches<R: SyncedResource>(super_obj: &R, cluster_key: &str, tenant_uid: &str) -> bool {
    delegated_cluster(super_obj).as_deref() == Some(cluster_key)
        && owner_uid(super_obj).as_deref() == Some(tenant_uid)
}

/// Everything one kind needs to sync in both directions.
#[async_trait]
pub trait KindSyncer: Send + Sync {
    fn kind(&self) -> &'static str;
    fn register_cluster(&self, cluster: &Arc<TenantCluster>) -> Result<()>;
    fn drop_cluster(&self, key: &str);
    async fn start(self: Arc<Self>, stop: watch::Receiver<bool>);
    async fn patrol(&self);
}

pub struct KindRunner<R: SyncedResource> {
    pub super_client: Client,
    pub config: Arc<Config>,
    pub metrics: Metrics,
    pub registry: Arc<ClusterRegistry>,
    pub dws_mcc: Arc<MultiClusterController>,
    pub uws_mcc: Arc<MultiClusterController>,
    pub dws: Arc<dws::DownwardSyncer<R>>,
    pub uws: Arc<uws::UpwardSyncer<R>>,
    pub placement: Option<Arc<dyn crate::mcc::PlacementFilter>>,
}

impl<R: SyncedResource> KindRunner<R> {
    pub fn new(
        super_client: Client,
        config: Arc<Config>,
        metrics: Metrics,
        registry: Arc<ClusterRegistry>,
        placement: Option<Arc<dyn crate::mcc::PlacementFilter>>,
    ) -> Arc<Self> {
        let options = Options {
            workers: config.workers,
            ..Options::default()
        };
        let dws_mcc = MultiClusterController::new(
            format!("dws-{}", R::KIND.to_lowercase()),
            R::KIND,
            metrics.clone(),
            options.clone(),
        );
        let uws_mcc = MultiClusterController::new(
            format!("uws-{}", R::KIND.to_lowercase()),
            R::KIND,
            metrics.clone(),
            options,
        );
        let dws = Arc::new(dws::DownwardSyncer::<R>::new(
            super_client.clone(),
            Arc::clone(&dws_mcc),
            Arc::clone(&config),
        ));
        let uws = Arc::new(uws::UpwardSyncer::<R>::new(
            super_client.clone(),
            Arc::clone(&uws_mcc),
        ));
        Arc::new(Self {
            super_client,
            config,
            metrics,
            registry,
            dws_mcc,
            uws_mcc,
            dws,
            uws,
            placement,
        })
    }
}

#[async_trait]
impl<R: SyncedResource> KindSyncer for KindRunner<R> {
    fn kind(&self) -> &'static str {
        R::KIND
    }

    /// Two-phase registration: the store is created first so the cache
    /// records the resource, then the event handler attaches.
    fn register_cluster(&self, cluster: &Arc<TenantCluster>) -> Result<()> {
        self.dws_mcc.register_cluster_resource::<R>(cluster)?;
        self.dws_mcc.watch_cluster_resource::<R>(cluster)?;
        self.uws_mcc.add_cluster(cluster);
        Ok(())
    }

    fn drop_cluster(&self, key: &str) {
        self.dws_mcc.drop_cluster(key);
        self.uws_mcc.drop_cluster(key);
    }

    async fn start(self: Arc<Self>, stop: watch::Receiver<bool>) {
        let dws_run = Arc::clone(&self.dws_mcc).run(
            self.dws.clone() as Arc<dyn crate::mcc::Reconcile>,
            self.placement.clone(),
            stop.clone(),
        );
        let uws_run = Arc::clone(&self.uws_mcc).run(
            self.uws.clone() as Arc<dyn crate::mcc::Reconcile>,
            None,
            stop.clone(),
        );
        let super_watch = uws::run_super_watch::<R>(
            self.super_client.clone(),
            self.uws_mcc.queue(),
            stop,
        );
        tokio::join!(dws_run, uws_run, super_watch);
    }

    async fn patrol(&self) {
        patrol::patrol_kind::<R>(
            &self.super_client,
            &self.registry,
            &self.dws_mcc,
            &self.uws_mcc,
            &self.metrics,
            &self.config,
        )
        .await;
    }
}

/// The syncer assembly: owns one [`KindRunner`] per mirrored kind, reacts to
/// registry membership changes, and drives the patrol loop.
pub struct Syncer {
    pub registry: Arc<ClusterRegistry>,
    pub kinds: Vec<Arc<dyn KindSyncer>>,
    pub config: Arc<Config>,
    pub metrics: Metrics,
}

impl Syncer {
    pub async fn run(self: Arc<Self>, stop: watch::Receiver<bool>) {
        let mut events = self.registry.subscribe();
        let mut tasks = Vec::new();
        for kind in &self.kinds {
            tasks.push(tokio::spawn(Arc::clone(kind).start(stop.clone())));
        }

        // Clusters registered before this loop subscribed.
        for key in self.registry.keys() {
            if let Some(cluster) = self.registry.get(&key) {
                self.on_cluster_added(cluster);
            }
        }

        let patroller = {
            let this = Arc::clone(&self);
            let stop = stop.clone();
            tokio::spawn(async move { this.patrol_loop(stop).await })
        };

        let mut stop_rx = stop.clone();
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                event = events.recv() => match event {
                    Ok(RegistryEvent::Added(cluster)) => self.on_cluster_added(cluster),
                    Ok(RegistryEvent::Removed(key)) => {
                        for kind in &self.kinds {
                            kind.drop_cluster(&key);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(err) => {
                        warn!(error = %err, "registry event stream lagged");
                    }
                },
            }
        }

        for task in tasks {
            let _ = task.await;
        }
        let _ = patroller.await;
        info!("syncer stopped");
    }

    fn on_cluster_added(&self, cluster: Arc<TenantCluster>) {
        for kind in &self.kinds {
            if let Err(err) = kind.register_cluster(&cluster) {
                warn!(cluster = %cluster.key(), kind = %kind.kind(), error = %err, "cluster registration failed");
            }
        }
        // Mark the cluster synced once every store finished its first list.
        tokio::spawn(async move { cluster.wait_for_cache_sync().await });
    }

    async fn patrol_loop(&self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.resync());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => {}
            }
            let timer = self.metrics.patrol_duration.start_timer();
            for kind in &self.kinds {
                kind.patrol().await;
            }
            timer.observe_duration();
        }
    }
}
