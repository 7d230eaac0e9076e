//! Upward syncer: watches delegated super objects and folds their state back
//! into the owning tenant cluster.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{DeleteParams, PostParams, Preconditions};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, Resource, ResourceExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::errors::{Error, Result};
use crate::mcc::{FairQueue, MultiClusterController, Outcome, Reconcile, Request};

use super::{
    SyncedResource, delegated_cluster, owner_uid, super_namespace, tenant_namespace,
};

pub struct UpwardSyncer<R: SyncedResource> {
    super_client: Client,
    mcc: Arc<MultiClusterController>,
    _kind: PhantomData<fn() -> R>,
}

impl<R: SyncedResource> UpwardSyncer<R> {
    pub fn new(super_client: Client, mcc: Arc<MultiClusterController>) -> Self {
        Self {
            super_client,
            mcc,
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<R: SyncedResource> Reconcile for UpwardSyncer<R> {
    async fn reconcile(&self, req: &Request) -> Result<Outcome> {
        let cluster = match self.mcc.cluster(&req.cluster) {
            Some(c) => c,
            // The owning cluster is gone; nothing to write back into.
            None => return Ok(Outcome::Done),
        };
        let super_ns = super_namespace(&req.cluster, &req.namespace);
        let api: Api<R> = Api::namespaced(self.super_client.clone(), &super_ns);
        let super_obj = match api.get_opt(&req.name).await.map_err(Error::classify)? {
            Some(obj) => obj,
            None => return Ok(Outcome::Done),
        };
        if delegated_cluster(&super_obj).as_deref() != Some(req.cluster.as_str()) {
            return Ok(Outcome::Done);
        }

        let tenant_obj = cluster.cached::<R>(R::KIND, &req.namespace, &req.name)?;
        let tenant_obj = match tenant_obj {
            Some(obj) => obj,
            None => {
                // Tenant side is gone; remove the super copy unless it is
                // already on its way out.
                if super_obj.meta().deletion_timestamp.is_some() {
                    return Ok(Outcome::Done);
                }
                let params = DeleteParams {
                    preconditions: Some(Preconditions {
                        uid: super_obj.meta().uid.clone(),
                        resource_version: None,
                    }),
                    ..Default::default()
                };
                match api.delete(&req.name, &params).await {
                    Ok(_) => info!(key = %req.key(), kind = R::KIND, "orphaned super object deleted"),
                    Err(kube::Error::Api(ae)) if ae.code == 404 || ae.code == 409 => {}
                    Err(err) => return Err(Error::classify(err)),
                }
                return Ok(Outcome::Done);
            }
        };

        if !R::status_differs(&tenant_obj, &super_obj) {
            return Ok(Outcome::Done);
        }

        // Side effects (virtual nodes, bindings) come before the status
        // write so the tenant object never reports state it cannot hold.
        R::upward_effects(&cluster, &super_obj, &req.namespace).await?;

        let mut updated = (*tenant_obj).clone();
        if !R::back_populate(&mut updated, &super_obj) {
            return Ok(Outcome::Done);
        }

        let tenant_api: Api<R> = Api::namespaced(cluster.client(), &req.namespace);
        if R::back_populates_spec() {
            updated = tenant_api
                .replace(&req.name, &PostParams::default(), &updated)
                .await
                .map_err(Error::classify)?;
            // The replace refreshed the resource version; restate the status
            // on the returned object.
            R::back_populate(&mut updated, &super_obj);
        }
        tenant_api
            .replace_status(
                &req.name,
                &PostParams::default(),
                serde_json::to_vec(&updated)?,
            )
            .await
            .map_err(Error::classify)?;
        debug!(key = %req.key(), kind = R::KIND, "tenant object back-populated");
        Ok(Outcome::Done)
    }
}

/// Watches super-side objects of one kind and enqueues the delegated ones,
/// keyed back to their tenant coordinates.
pub async fn run_super_watch<R: SyncedResource>(
    super_client: Client,
    queue: Arc<FairQueue>,
    mut stop: watch::Receiver<bool>,
) {
    let api: Api<R> = Api::all(super_client);
    let mut stream =
        std::pin::pin!(watcher(api, watcher::Config::default()).touched_objects());
    loop {
        let event = tokio::select! {
            _ = stop.changed() => break,
            event = stream.next() => event,
        };
        match event {
            Some(Ok(obj)) => {
                let cluster = match delegated_cluster(&obj) {
                    Some(c) => c,
                    None => continue,
                };
                let super_ns = ResourceExt::namespace(&obj).unwrap_or_default();
                let vns = match tenant_namespace(&cluster, &super_ns) {
                    Some(v) => v,
                    None => continue,
                };
                let uid = owner_uid(&obj).unwrap_or_default();
                queue.add(Request::new(cluster, vns, obj.name_any(), uid));
            }
            Some(Err(err)) => {
                warn!(kind = R::KIND, error = %err, "super-side watch error");
            }
            None => break,
        }
    }
    debug!(kind = R::KIND, "super-side watch stopped");
}
