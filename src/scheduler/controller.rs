//! Feeds the scheduler engine from the super cluster: delegated namespaces
//! carrying quota annotations are scheduled onto the pool and their
//! placements written back as an annotation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Namespace, Node};
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::{Controller, watcher};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::api::meta;
use crate::errors::Error;
use crate::sync::tenant_namespace;

use super::{ClusterEntry, QuantityPair, Quota, SchedulerEngine, quota};

pub struct SchedulerCtx {
    pub client: Client,
    pub engine: Arc<SchedulerEngine>,
}

/// Registers this super cluster in the engine with the summed allocatable
/// capacity of its nodes.
pub async fn register_local_cluster(
    client: &Client,
    engine: &SchedulerEngine,
    cluster_id: &str,
) -> Result<(), Error> {
    let nodes: Api<Node> = Api::all(client.clone());
    let list = nodes
        .list(&ListParams::default())
        .await
        .map_err(Error::classify)?;
    let mut capacity = Quota::default();
    for node in &list.items {
        let allocatable = node
            .status
            .as_ref()
            .and_then(|s| s.allocatable.as_ref());
        let Some(allocatable) = allocatable else {
            continue;
        };
        let cpu = allocatable
            .get("cpu")
            .map(|q| quota::parse_cpu(&q.0))
            .transpose()?
            .unwrap_or(0);
        let memory = allocatable
            .get("memory")
            .map(|q| quota::parse_memory(&q.0))
            .transpose()?
            .unwrap_or(0);
        capacity = capacity.saturating_add(&Quota::new(cpu, memory));
    }
    info!(cluster = %cluster_id, ?capacity, nodes = list.items.len(), "local cluster registered");
    engine
        .add_cluster(ClusterEntry::new(cluster_id, BTreeMap::new(), capacity))
        .await;
    Ok(())
}

async fn reconcile(ns: Arc<Namespace>, ctx: Arc<SchedulerCtx>) -> Result<Action, Error> {
    let name = match ns.metadata.name.as_deref() {
        Some(n) => n.to_string(),
        None => return Ok(Action::await_change()),
    };
    let annotations = ns.annotations();
    let cluster_key = match annotations.get(meta::CLUSTER_KEY) {
        Some(k) => k.clone(),
        None => return Ok(Action::await_change()),
    };
    let vns = match tenant_namespace(&cluster_key, &name) {
        Some(v) => v,
        None => return Ok(Action::await_change()),
    };
    let key = format!("{cluster_key}/{vns}");

    if ns.metadata.deletion_timestamp.is_some() {
        ctx.engine.deschedule_namespace(&key).await;
        return Ok(Action::await_change());
    }

    let (Some(slice_ann), Some(quota_ann)) = (
        annotations.get(meta::NAMESPACE_SLICE),
        annotations.get(meta::NAMESPACE_QUOTA),
    ) else {
        debug!(namespace = %name, "no quota annotations; not scheduled");
        return Ok(Action::await_change());
    };

    let quota_slice = serde_json::from_str::<QuantityPair>(slice_ann)?.to_quota()?;
    let quota = serde_json::from_str::<QuantityPair>(quota_ann)?.to_quota()?;
    let mandatory: BTreeMap<String, u32> = annotations
        .get(meta::MANDATORY_PLACEMENTS)
        .map(|raw| serde_json::from_str(raw))
        .transpose()?
        .unwrap_or_default();

    let placements = ctx
        .engine
        .schedule_namespace(&key, quota, quota_slice, mandatory)
        .await?;

    let api: Api<Namespace> = Api::all(ctx.client.clone());
    let patch = serde_json::json!({
        "metadata": {
            "annotations": {
                meta::PLACEMENTS: serde_json::to_string(&placements)?,
            }
        }
    });
    api.patch(&name, &PatchParams::apply("canopy"), &Patch::Merge(&patch))
        .await
        .map_err(Error::classify)?;
    Ok(Action::await_change())
}

fn error_policy(ns: Arc<Namespace>, error: &Error, _ctx: Arc<SchedulerCtx>) -> Action {
    if matches!(error, Error::Unschedulable(_, _)) {
        warn!(namespace = %ns.name_any(), error = %error, "placement failed; retrying");
        return Action::requeue(Duration::from_secs(60));
    }
    error!(namespace = %ns.name_any(), error = %error, "scheduler reconcile failed");
    Action::requeue(Duration::from_secs(30))
}

pub async fn run(client: Client, engine: Arc<SchedulerEngine>) {
    let ctx = Arc::new(SchedulerCtx {
        client: client.clone(),
        engine,
    });
    Controller::new(
        Api::<Namespace>::all(client),
        watcher::Config::default().any_semantic(),
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(|res| async move {
        if let Err(e) = res {
            debug!("scheduler controller error: {:?}", e);
        }
    })
    .await;
}
