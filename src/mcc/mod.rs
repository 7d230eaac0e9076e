//! The multi-cluster controller: a generic fan-in of tenant-side watch
//! events into one rate-limited fair queue, drained by a pool of workers
//! running a single reconciler. Parameterized per resource kind and per
//! direction (downward or upward).

pub mod queue;

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use kube::runtime::reflector;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::MAX_RECONCILE_RETRIES;
use crate::errors::{Error, Result};
use crate::metrics::Metrics;
use crate::tenant::TenantCluster;

pub use queue::{FairQueue, Request};

/// What a reconciler asks the worker to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Requeue,
    RequeueAfter(std::time::Duration),
}

#[async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile(&self, req: &Request) -> Result<Outcome>;
}

/// Decides whether a request is placed on this super cluster at all; used to
/// gate pod syncing when pool scheduling is enabled.
#[async_trait]
pub trait PlacementFilter: Send + Sync {
    async fn allows(&self, req: &Request) -> bool;
}

#[derive(Debug, Clone)]
pub struct Options {
    pub workers: usize,
    pub max_retries: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: MAX_RECONCILE_RETRIES,
        }
    }
}

struct ClusterEntry {
    cluster: Arc<TenantCluster>,
    registered: bool,
    watching: bool,
}

/// One controller instance per (kind, direction).
pub struct MultiClusterController {
    name: String,
    kind: &'static str,
    clusters: std::sync::Mutex<HashMap<String, ClusterEntry>>,
    queue: Arc<FairQueue>,
    metrics: Metrics,
    options: Options,
}

impl MultiClusterController {
    pub fn new(
        name: impl Into<String>,
        kind: &'static str,
        metrics: Metrics,
        options: Options,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            kind,
            clusters: std::sync::Mutex::new(HashMap::new()),
            queue: FairQueue::new(),
            metrics,
            options,
        })
    }

    pub fn queue(&self) -> Arc<FairQueue> {
        Arc::clone(&self.queue)
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn cluster(&self, key: &str) -> Option<Arc<TenantCluster>> {
        let clusters = self.clusters.lock().ok()?;
        clusters.get(key).map(|e| Arc::clone(&e.cluster))
    }

    /// Phase one of watch registration: the cache records the resource so
    /// the store exists before any sync starts.
    pub fn register_cluster_resource<K>(&self, cluster: &Arc<TenantCluster>) -> Result<()>
    where
        K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
    {
        let mut clusters = self
            .clusters
            .lock()
            .map_err(|_| Error::InvalidConfig("cluster map poisoned".into()))?;
        let entry = clusters
            .entry(cluster.key().to_string())
            .or_insert_with(|| ClusterEntry {
                cluster: Arc::clone(cluster),
                registered: false,
                watching: false,
            });
        if entry.registered {
            return Ok(());
        }
        let (store, writer) = reflector::store::<K>();
        cluster.insert_store(self.kind, store);
        entry.registered = true;
        // The writer is consumed by phase two.
        cluster.stash_writer(self.kind, writer);
        debug!(controller = %self.name, cluster = %cluster.key(), "resource registered");
        Ok(())
    }

    /// Phase two: attach the event handler that feeds the queue. Watching a
    /// cluster that was never registered is an error.
    pub fn watch_cluster_resource<K>(self: &Arc<Self>, cluster: &Arc<TenantCluster>) -> Result<()>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    {
        {
            let mut clusters = self
                .clusters
                .lock()
                .map_err(|_| Error::InvalidConfig("cluster map poisoned".into()))?;
            let entry = clusters.get_mut(cluster.key()).ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "cluster {} was never registered with {}",
                    cluster.key(),
                    self.name
                ))
            })?;
            if !entry.registered {
                return Err(Error::InvalidConfig(format!(
                    "cluster {} was never registered with {}",
                    cluster.key(),
                    self.name
                )));
            }
            if entry.watching {
                return Ok(());
            }
            entry.watching = true;
        }

        let writer = cluster.take_writer::<K>(self.kind).ok_or_else(|| {
            Error::InvalidConfig(format!(
                "no registered store writer for {} on {}",
                self.kind,
                cluster.key()
            ))
        })?;
        let api: Api<K> = Api::all(cluster.client());
        let queue = self.queue();
        let key = cluster.key().to_string();
        let controller = self.name.clone();
        let handle = tokio::spawn(async move {
            let stream = reflector::reflector(writer, watcher(api, watcher::Config::default()));
            let mut stream = std::pin::pin!(stream.touched_objects());
            while let Some(event) = stream.next().await {
                match event {
                    Ok(obj) => {
                        let namespace = obj.namespace().unwrap_or_default();
                        let uid = obj.uid().unwrap_or_default();
                        queue.add(Request::new(key.clone(), namespace, obj.name_any(), uid));
                    }
                    Err(err) => {
                        warn!(controller = %controller, cluster = %key, error = %err, "watch error");
                    }
                }
            }
        });
        cluster.track_task(handle);
        info!(controller = %self.name, cluster = %cluster.key(), "watching cluster resource");
        Ok(())
    }

    /// Registers a cluster without a cache of its own; used by controllers
    /// whose events come from the super side but which still resolve the
    /// tenant for writes.
    pub fn add_cluster(&self, cluster: &Arc<TenantCluster>) {
        if let Ok(mut clusters) = self.clusters.lock() {
            clusters
                .entry(cluster.key().to_string())
                .or_insert_with(|| ClusterEntry {
                    cluster: Arc::clone(cluster),
                    registered: true,
                    watching: false,
                });
        }
    }

    /// Forgets a cluster; its requests are dropped as they surface.
    pub fn drop_cluster(&self, key: &str) {
        if let Ok(mut clusters) = self.clusters.lock() {
            if clusters.remove(key).is_some() {
                info!(controller = %self.name, cluster = %key, "cluster dropped");
            }
        }
    }

    /// Runs the worker pool until shutdown; the queue drains first.
    pub async fn run(
        self: Arc<Self>,
        reconciler: Arc<dyn Reconcile>,
        placement: Option<Arc<dyn PlacementFilter>>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut workers = Vec::with_capacity(self.options.workers);
        for worker in 0..self.options.workers {
            let this = Arc::clone(&self);
            let reconciler = Arc::clone(&reconciler);
            let placement = placement.clone();
            workers.push(tokio::spawn(async move {
                this.worker_loop(worker, reconciler, placement).await;
            }));
        }

        let _ = stop.changed().await;
        self.queue.shut_down();
        for worker in workers {
            let _ = worker.await;
        }
        info!(controller = %self.name, "workers stopped");
    }

    async fn worker_loop(
        &self,
        worker: usize,
        reconciler: Arc<dyn Reconcile>,
        placement: Option<Arc<dyn PlacementFilter>>,
    ) {
        while let Some(req) = self.queue.next().await {
            self.process(&req, &reconciler, placement.as_deref()).await;
            self.queue.done(&req);
        }
        debug!(controller = %self.name, worker, "worker exiting");
    }

    async fn process(
        &self,
        req: &Request,
        reconciler: &Arc<dyn Reconcile>,
        placement: Option<&dyn PlacementFilter>,
    ) {
        if self.cluster(&req.cluster).is_none() {
            warn!(controller = %self.name, cluster = %req.cluster, "request for unknown cluster dropped");
            self.queue.forget(req);
            return;
        }
        if let Some(filter) = placement {
            if !filter.allows(req).await {
                debug!(controller = %self.name, key = %req.key(), "not placed on this cluster");
                self.queue.forget(req);
                return;
            }
        }

        match reconciler.reconcile(req).await {
            Ok(Outcome::Done) => {
                self.queue.forget(req);
            }
            Ok(Outcome::RequeueAfter(delay)) => {
                self.queue.add_after(req.clone(), delay);
            }
            Ok(Outcome::Requeue) => {
                self.metrics
                    .reconcile_retries
                    .with_label_values(&[self.kind])
                    .inc();
                self.queue.add_rate_limited(req.clone());
            }
            Err(err) if err.is_fail_fast() => {
                warn!(controller = %self.name, key = %req.key(), error = %err, "fail-fast, dropping");
                self.metrics
                    .reconcile_dropped
                    .with_label_values(&[self.kind, "fail_fast"])
                    .inc();
                self.queue.forget(req);
            }
            Err(err) => {
                if self.queue.retry_count(req) >= self.options.max_retries {
                    warn!(
                        controller = %self.name,
                        key = %req.key(),
                        error = %err,
                        "retry budget exhausted, dropping"
                    );
                    self.metrics
                        .reconcile_dropped
                        .with_label_values(&[self.kind, "max_retries"])
                        .inc();
                    self.queue.forget(req);
                } else {
                    debug!(controller = %self.name, key = %req.key(), error = %err, "requeue with backoff");
                    self.metrics
                        .reconcile_retries
                        .with_label_values(&[self.kind])
                        .inc();
                    self.queue.add_rate_limited(req.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingReconciler {
        calls: AtomicUsize,
        result: fn() -> Result<Outcome>,
    }

    #[async_trait]
    impl Reconcile for CountingReconciler {
        async fn reconcile(&self, _req: &Request) -> Result<Outcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }
    }

    fn controller() -> Arc<MultiClusterController> {
        MultiClusterController::new("test", "Pod", Metrics::new(), Options::default())
    }

    #[tokio::test]
    async fn unknown_cluster_requests_are_dropped() {
        let mcc = controller();
        let reconciler = Arc::new(CountingReconciler {
            calls: AtomicUsize::new(0),
            result: || Ok(Outcome::Done),
        });
        let req = Request::new("ghost", "ns", "a", "u1");
        mcc.process(&req, &(reconciler.clone() as Arc<dyn Reconcile>), None)
            .await;
        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 0);
    }

    struct DenyAll;

    #[async_trait]
    impl PlacementFilter for DenyAll {
        async fn allows(&self, _req: &Request) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn placement_filter_drops_unplaced_requests() {
        let mcc = controller();
        mcc.clusters.lock().expect("lock").insert(
            "t1".into(),
            ClusterEntry {
                cluster: crate::tenant::TenantCluster::new(
                    "t1",
                    test_client(),
                    crate::tenant::TenantSpec::default(),
                ),
                registered: true,
                watching: false,
            },
        );
        let reconciler = Arc::new(CountingReconciler {
            calls: AtomicUsize::new(0),
            result: || Ok(Outcome::Done),
        });
        let filter: Arc<dyn PlacementFilter> = Arc::new(DenyAll);
        let req = Request::new("t1", "ns", "a", "u1");
        mcc.process(
            &req,
            &(reconciler.clone() as Arc<dyn Reconcile>),
            Some(filter.as_ref()),
        )
        .await;
        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fail_fast_errors_bump_drop_metric() {
        let mcc = controller();
        // No cluster entry: insert one directly so process reaches the reconciler.
        // The reconciler rejects with a fail-fast error.
        let cluster = crate::tenant::TenantCluster::new(
            "t1",
            // A client is required structurally; an unused lazy one is fine
            // for queue-path tests.
            test_client(),
            crate::tenant::TenantSpec::default(),
        );
        mcc.clusters.lock().expect("lock").insert(
            "t1".into(),
            ClusterEntry {
                cluster,
                registered: true,
                watching: false,
            },
        );
        let reconciler: Arc<dyn Reconcile> = Arc::new(CountingReconciler {
            calls: AtomicUsize::new(0),
            result: || {
                Err(Error::classify(kube::Error::Api(
                    kube::core::ErrorResponse {
                        status: "Failure".into(),
                        message: "no".into(),
                        reason: "Forbidden".into(),
                        code: 403,
                    },
                )))
            },
        });
        let req = Request::new("t1", "ns", "a", "u1");
        mcc.process(&req, &reconciler, None).await;
        let rendered = mcc.metrics.render();
        assert!(rendered.contains("fail_fast"));
    }

    fn test_client() -> kube::Client {
        // Points nowhere; queue-path tests never issue a request.
        let config = kube::Config::new("http://127.0.0.1:1".parse().expect("uri"));
        kube::Client::try_from(config).expect("client")
    }
}
