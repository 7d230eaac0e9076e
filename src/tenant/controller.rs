//! The `VirtualCluster` reconciler: turns a tenant's kubeconfig secret into
//! a registered [`TenantCluster`] and tears it down again on delete.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{Event as FinalizerEvent, finalizer};
use kube::runtime::{Controller, watcher};
use kube::{Api, Client, ResourceExt};
use tracing::{error, info, warn};

use crate::api::VirtualCluster;
use crate::config::REQUEST_TIMEOUT;
use crate::errors::Error;

use super::{ClusterRegistry, TenantCluster, TenantSpec};

const VC_FINALIZER: &str = "canopy.dev/virtualcluster";

pub struct TenantCtx {
    pub client: Client,
    pub registry: Arc<ClusterRegistry>,
}

/// Builds a client for the tenant apiserver from the referenced kubeconfig
/// secret.
async fn tenant_client(ctx: &TenantCtx, vc: &VirtualCluster) -> Result<Client, Error> {
    let ns = vc
        .metadata
        .namespace
        .as_deref()
        .ok_or_else(|| Error::InvalidConfig("virtual cluster without a namespace".into()))?;
    let key = vc.cluster_key().unwrap_or_default();

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), ns);
    let secret = secrets
        .get(&vc.spec.kubeconfig_secret)
        .await
        .map_err(Error::classify)?;
    let raw = secret
        .data
        .as_ref()
        .and_then(|d| d.get("kubeconfig"))
        .map(|b| b.0.clone())
        .ok_or_else(|| {
            Error::BadKubeconfig(key.clone(), "secret has no `kubeconfig` key".into())
        })?;

    let kubeconfig: Kubeconfig = serde_yaml::from_slice(&raw)
        .map_err(|e| Error::BadKubeconfig(key.clone(), e.to_string()))?;
    let mut config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::BadKubeconfig(key.clone(), e.to_string()))?;
    config.connect_timeout = Some(Duration::from_secs(5));
    config.read_timeout = Some(REQUEST_TIMEOUT);

    Client::try_from(config).map_err(|e| Error::BadKubeconfig(key, e.to_string()))
}

async fn apply_vc(vc: Arc<VirtualCluster>, ctx: Arc<TenantCtx>) -> Result<Action, Error> {
    let key = match vc.cluster_key() {
        Some(k) => k,
        None => return Ok(Action::await_change()),
    };

    if ctx.registry.get(&key).is_none() {
        let client = tenant_client(&ctx, &vc).await?;
        let spec = TenantSpec::merged(&vc.spec);
        ctx.registry.add(TenantCluster::new(key.clone(), client, spec));
    }

    let ns = vc.metadata.namespace.clone().unwrap_or_default();
    let api: Api<VirtualCluster> = Api::namespaced(ctx.client.clone(), &ns);
    api.patch_status(
        &vc.name_any(),
        &PatchParams::apply("canopy"),
        &Patch::Merge(serde_json::json!({ "status": { "phase": "Running" } })),
    )
    .await
    .map_err(Error::classify)?;

    info!(cluster = %key, "virtual cluster registered");
    Ok(Action::await_change())
}

async fn cleanup_vc(vc: Arc<VirtualCluster>, ctx: Arc<TenantCtx>) -> Result<Action, Error> {
    if let Some(key) = vc.cluster_key() {
        ctx.registry.remove(&key);
    }
    Ok(Action::await_change())
}

async fn reconcile(
    vc: Arc<VirtualCluster>,
    ctx: Arc<TenantCtx>,
) -> Result<Action, kube::runtime::finalizer::Error<Error>> {
    let ns = vc.metadata.namespace.clone().unwrap_or_default();
    let api: Api<VirtualCluster> = Api::namespaced(ctx.client.clone(), &ns);
    finalizer(&api, VC_FINALIZER, vc, |event| {
        let ctx = ctx.clone();
        async move {
            match event {
                FinalizerEvent::Apply(vc) => apply_vc(vc, ctx).await,
                FinalizerEvent::Cleanup(vc) => cleanup_vc(vc, ctx).await,
            }
        }
    })
    .await
}

fn error_policy(
    vc: Arc<VirtualCluster>,
    error: &kube::runtime::finalizer::Error<Error>,
    _ctx: Arc<TenantCtx>,
) -> Action {
    error!(cluster = %vc.name_any(), error = %error, "virtual cluster reconcile failed");
    Action::requeue(Duration::from_secs(30))
}

pub async fn run(client: Client, registry: Arc<ClusterRegistry>) {
    let ctx = Arc::new(TenantCtx {
        client: client.clone(),
        registry,
    });
    Controller::new(
        Api::<VirtualCluster>::all(client),
        watcher::Config::default().any_semantic(),
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(|res| async move {
        if let Err(e) = res {
            warn!("virtual cluster controller error: {:?}", e);
        }
    })
    .await;
}
