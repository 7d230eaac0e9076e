//! Subnamespace anchors: an anchor named `X` in namespace `P` declares that
//! a namespace `X` should exist with parent `P`. The anchor reconciler owns
//! the subnamespace lifecycle; deleting the anchor only deletes the
//! namespace when cascading deletion is allowed somewhere up the chain.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{Event as FinalizerEvent, finalizer};
use kube::runtime::{Controller, watcher};
use kube::{Api, ResourceExt};
use tracing::{error, info, warn};

use crate::api::{
    AnchorState, HIERARCHY_SINGLETON, HierarchyConfiguration, HierarchySpec, SubnamespaceAnchor,
    meta,
};
use crate::errors::Error;

use super::HierarchyCtx;

const ANCHOR_FINALIZER: &str = "canopy.dev/anchor";

async fn apply_anchor(
    anchor: Arc<SubnamespaceAnchor>,
    ctx: Arc<HierarchyCtx>,
) -> Result<Action, Error> {
    let parent = match anchor.metadata.namespace.as_deref() {
        Some(ns) => ns.to_string(),
        None => return Ok(Action::await_change()),
    };
    let name = anchor.name_any();

    let state = if name == parent || ctx.config.is_excluded_namespace(&name) {
        warn!(anchor = %name, parent = %parent, "anchor names an unusable namespace");
        AnchorState::Conflict
    } else {
        reconcile_subnamespace(&ctx, &parent, &name).await?
    };

    {
        let mut forest = ctx.forest.lock().await;
        let node = forest.get(&parent);
        if !node.anchors.iter().any(|a| a == &name) {
            node.anchors.push(name.clone());
        }
        if state == AnchorState::Ok {
            forest.get(&name).is_subnamespace = true;
            let needs_edge = forest
                .node(&name)
                .map(|n| n.parent.is_none())
                .unwrap_or(true);
            if needs_edge {
                if let Err(err) = forest.set_parent(&name, Some(&parent)) {
                    warn!(namespace = %name, error = %err, "subnamespace edge rejected");
                }
            }
        }
        ctx.publish_snapshot(forest.snapshot());
    }

    let api: Api<SubnamespaceAnchor> = Api::namespaced(ctx.client.clone(), &parent);
    api.patch_status(
        &name,
        &PatchParams::apply(super::FIELD_MANAGER),
        &Patch::Merge(serde_json::json!({ "status": { "state": state } })),
    )
    .await
    .map_err(Error::classify)?;

    info!(anchor = %name, parent = %parent, ?state, "reconciled anchor");
    Ok(Action::await_change())
}

/// Ensures the subnamespace behind an anchor exists and is ours. A
/// pre-existing namespace without the owner annotation is a conflict, never
/// a takeover.
async fn reconcile_subnamespace(
    ctx: &HierarchyCtx,
    parent: &str,
    name: &str,
) -> Result<AnchorState, Error> {
    let namespaces: Api<Namespace> = Api::all(ctx.client.clone());
    match namespaces.get_opt(name).await.map_err(Error::classify)? {
        Some(existing) => {
            let owned = existing
                .annotations()
                .get(meta::SUBNAMESPACE_OF)
                .map(|p| p == parent)
                .unwrap_or(false);
            if owned {
                ensure_hierarchy_singleton(ctx, parent, name).await?;
                Ok(AnchorState::Ok)
            } else {
                Ok(AnchorState::Conflict)
            }
        }
        None => {
            let namespace = Namespace {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    annotations: Some(
                        [(meta::SUBNAMESPACE_OF.to_string(), parent.to_string())]
                            .into_iter()
                            .collect(),
                    ),
                    ..Default::default()
                },
                ..Default::default()
            };
            match namespaces.create(&PostParams::default(), &namespace).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    // Raced with someone else creating it; re-evaluate next sync.
                    return Ok(AnchorState::Pending);
                }
                Err(err) => return Err(Error::classify(err)),
            }
            ensure_hierarchy_singleton(ctx, parent, name).await?;
            Ok(AnchorState::Ok)
        }
    }
}

/// A fresh subnamespace gets a hierarchy singleton pointing at its parent so
/// the hierarchy reconciler takes over status and labels.
async fn ensure_hierarchy_singleton(
    ctx: &HierarchyCtx,
    parent: &str,
    name: &str,
) -> Result<(), Error> {
    let api: Api<HierarchyConfiguration> = Api::namespaced(ctx.client.clone(), name);
    if api
        .get_opt(HIERARCHY_SINGLETON)
        .await
        .map_err(Error::classify)?
        .is_some()
    {
        return Ok(());
    }
    let mut hc = HierarchyConfiguration::new(
        HIERARCHY_SINGLETON,
        HierarchySpec {
            parent: Some(parent.to_string()),
            allow_cascading_delete: false,
        },
    );
    hc.metadata.namespace = Some(name.to_string());
    match api.create(&PostParams::default(), &hc).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(err) => Err(Error::classify(err)),
    }
}

async fn cleanup_anchor(
    anchor: Arc<SubnamespaceAnchor>,
    ctx: Arc<HierarchyCtx>,
) -> Result<Action, Error> {
    let parent = match anchor.metadata.namespace.as_deref() {
        Some(ns) => ns.to_string(),
        None => return Ok(Action::await_change()),
    };
    let name = anchor.name_any();

    let delete_namespace = {
        let mut forest = ctx.forest.lock().await;
        forest.get(&parent).anchors.retain(|a| a != &name);
        let is_ours = forest
            .node(&name)
            .map(|n| n.is_subnamespace && n.parent.as_deref() == Some(parent.as_str()))
            .unwrap_or(false);
        is_ours && forest.allows_cascading_delete(&name)
    };

    if delete_namespace {
        let namespaces: Api<Namespace> = Api::all(ctx.client.clone());
        match namespaces.delete(&name, &DeleteParams::default()).await {
            Ok(_) => info!(namespace = %name, "cascading-deleted subnamespace"),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(err) => return Err(Error::classify(err)),
        }
    } else {
        info!(anchor = %name, parent = %parent, "anchor removed; namespace retained");
    }
    Ok(Action::await_change())
}

async fn reconcile(
    anchor: Arc<SubnamespaceAnchor>,
    ctx: Arc<HierarchyCtx>,
) -> Result<Action, kube::runtime::finalizer::Error<Error>> {
    let parent = anchor.metadata.namespace.clone().unwrap_or_default();
    let api: Api<SubnamespaceAnchor> = Api::namespaced(ctx.client.clone(), &parent);
    finalizer(&api, ANCHOR_FINALIZER, anchor, |event| {
        let ctx = ctx.clone();
        async move {
            match event {
                FinalizerEvent::Apply(anchor) => apply_anchor(anchor, ctx).await,
                FinalizerEvent::Cleanup(anchor) => cleanup_anchor(anchor, ctx).await,
            }
        }
    })
    .await
}

fn error_policy(
    anchor: Arc<SubnamespaceAnchor>,
    error: &kube::runtime::finalizer::Error<Error>,
    _ctx: Arc<HierarchyCtx>,
) -> Action {
    error!(anchor = %anchor.name_any(), error = %error, "anchor reconcile failed");
    Action::requeue(Duration::from_secs(30))
}

pub async fn run(ctx: Arc<HierarchyCtx>) {
    Controller::new(
        Api::<SubnamespaceAnchor>::all(ctx.client.clone()),
        watcher::Config::default().any_semantic(),
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(|res| async move {
        if let Err(e) = res {
            info!("anchor controller error: {:?}", e);
        }
    })
    .await;
}
