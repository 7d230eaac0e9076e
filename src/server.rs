//! Process assembly: builds the forest, the controllers, the syncer and the
//! scheduler around one super-cluster client, and serves the diagnostic
//! endpoint. Everything is created here and injected; there are no
//! process-wide singletons.

use std::net::SocketAddr;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use kube::Client;
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{info, warn};

use crate::config::Config;
use crate::forest::Forest;
use crate::hierarchy::{self, HierarchyCtx};
use crate::mcc::PlacementFilter;
use crate::metrics::Metrics;
use crate::propagation::apply::{Propagator, run_config_controller};
use crate::router::{self, AppState};
use crate::scheduler::{PoolPlacementFilter, SchedulerEngine, SpreadPolicy, controller as sched};
use crate::sync::{KindRunner, KindSyncer, Syncer};
use crate::tenant::{ClusterRegistry, controller as tenant_controller};

pub struct CanopyServer {
    pub state: AppState,
    pub addr: SocketAddr,
    pub listener: tokio::net::TcpListener,
    pub router: axum::Router,
    pub client: Client,
    pub config: Arc<Config>,
    hierarchy_ctx: Arc<HierarchyCtx>,
    propagator: Arc<Propagator>,
    registry: Arc<ClusterRegistry>,
    engine: Arc<SchedulerEngine>,
    syncer: Arc<Syncer>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl CanopyServer {
    pub async fn new(config: Config) -> Result<Self, Box<dyn std::error::Error>> {
        let client = Client::try_default().await?;
        Self::new_with_client(client, config).await
    }

    pub async fn new_with_client(
        client: Client,
        config: Config,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let config = Arc::new(config);
        let forest = Arc::new(Mutex::new(Forest::new()));
        let (updates, _) = broadcast::channel(32);
        let (stop_tx, stop_rx) = watch::channel(false);
        let metrics = Metrics::new();

        let propagator = Propagator::new(
            client.clone(),
            forest.clone(),
            Arc::clone(&config),
            stop_rx.clone(),
        );
        let hierarchy_ctx = HierarchyCtx::new(
            client.clone(),
            forest.clone(),
            Arc::clone(&config),
            Arc::clone(&propagator),
            updates.clone(),
        );

        let registry = ClusterRegistry::new();
        let engine = SchedulerEngine::new(Box::new(SpreadPolicy));

        let pod_filter: Option<Arc<dyn PlacementFilter>> = if config.enable_pool_scheduling {
            Some(Arc::new(PoolPlacementFilter {
                engine: Arc::clone(&engine),
                super_cluster_id: config.super_cluster_id.clone(),
            }))
        } else {
            None
        };

        let kinds: Vec<Arc<dyn KindSyncer>> = vec![
            KindRunner::<Pod>::new(
                client.clone(),
                Arc::clone(&config),
                metrics.clone(),
                Arc::clone(&registry),
                pod_filter,
            ),
            KindRunner::<Service>::new(
                client.clone(),
                Arc::clone(&config),
                metrics.clone(),
                Arc::clone(&registry),
                None,
            ),
            KindRunner::<ConfigMap>::new(
                client.clone(),
                Arc::clone(&config),
                metrics.clone(),
                Arc::clone(&registry),
                None,
            ),
            KindRunner::<Secret>::new(
                client.clone(),
                Arc::clone(&config),
                metrics.clone(),
                Arc::clone(&registry),
                None,
            ),
            KindRunner::<PersistentVolumeClaim>::new(
                client.clone(),
                Arc::clone(&config),
                metrics.clone(),
                Arc::clone(&registry),
                None,
            ),
        ];
        let syncer = Arc::new(Syncer {
            registry: Arc::clone(&registry),
            kinds,
            config: Arc::clone(&config),
            metrics: metrics.clone(),
        });

        let state = AppState {
            forest,
            updates,
            metrics,
        };
        let router = router::new_router(state.clone()).await;
        let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
        let addr = listener.local_addr()?;

        Ok(CanopyServer {
            state,
            addr,
            listener,
            router,
            client,
            config,
            hierarchy_ctx,
            propagator,
            registry,
            engine,
            syncer,
            stop_tx,
            stop_rx,
        })
    }

    /// Runs the controllers and serves the diagnostic endpoint until ctrl-c.
    pub async fn serve(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let _hierarchy = tokio::spawn(hierarchy::run(self.hierarchy_ctx.clone()));
        let _config_controller = tokio::spawn(run_config_controller(
            self.propagator.clone(),
            self.client.clone(),
        ));
        let _tenants = tokio::spawn(tenant_controller::run(
            self.client.clone(),
            self.registry.clone(),
        ));

        if let Err(err) = sched::register_local_cluster(
            &self.client,
            &self.engine,
            &self.config.super_cluster_id,
        )
        .await
        {
            warn!(error = %err, "could not register local cluster capacity");
        }
        let _scheduler = tokio::spawn(sched::run(self.client.clone(), self.engine.clone()));
        let _syncer = tokio::spawn(self.syncer.clone().run(self.stop_rx.clone()));

        let stop_tx = self.stop_tx.clone();
        info!(addr = %self.addr, "canopy serving");
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                let _ = stop_tx.send(true);
            })
            .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to install ctrl-c handler");
    }
}
