//! Downward syncer: mirrors tenant objects into the super cluster. One
//! instance per kind, layered on the multi-cluster controller.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, PostParams, Preconditions};
use kube::{Api, Client, Resource};
use tracing::{debug, info, warn};

use crate::api::meta;
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::mcc::{MultiClusterController, Outcome, Reconcile, Request};

use super::{SyncedResource, build_super_object, delegated_cluster, owner_uid, super_namespace};

pub struct DownwardSyncer<R: SyncedResource> {
    super_client: Client,
    mcc: Arc<MultiClusterController>,
    config: Arc<Config>,
    _kind: PhantomData<fn() -> R>,
}

/// Whether the super object may be deleted on behalf of the tenant object
/// with the given UID. A mismatch means the super object was re-created for
/// another tenant object and must be left alone.
pub fn may_delete_super<R: SyncedResource>(
    super_obj: &R,
    cluster_key: &str,
    tenant_uid: &str,
) -> bool {
    if delegated_cluster(super_obj).as_deref() != Some(cluster_key) {
        return false;
    }
    if tenant_uid.is_empty() {
        // Patrol-driven deletes carry no event UID; delegation is enough.
        return true;
    }
    owner_uid(super_obj).as_deref() == Some(tenant_uid)
}

impl<R: SyncedResource> DownwardSyncer<R> {
    pub fn new(super_client: Client, mcc: Arc<MultiClusterController>, config: Arc<Config>) -> Self {
        Self {
            super_client,
            mcc,
            config,
            _kind: PhantomData,
        }
    }

    /// The super namespace is created on first use, stamped with the owning
    /// cluster key.
    async fn ensure_super_namespace(&self, cluster_key: &str, super_ns: &str) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.super_client.clone());
        if namespaces
            .get_opt(super_ns)
            .await
            .map_err(Error::classify)?
            .is_some()
        {
            return Ok(());
        }
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(super_ns.to_string()),
                annotations: Some(
                    [(meta::CLUSTER_KEY.to_string(), cluster_key.to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        };
        match namespaces.create(&PostParams::default(), &ns).await {
            Ok(_) => {
                info!(namespace = %super_ns, cluster = %cluster_key, "super namespace created");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(err) => Err(Error::classify(err)),
        }
    }

    async fn delete_super(&self, api: &Api<R>, req: &Request) -> Result<Outcome> {
        let super_obj = match api.get_opt(&req.name).await.map_err(Error::classify)? {
            Some(obj) => obj,
            None => return Ok(Outcome::Done),
        };
        if super_obj.meta().deletion_timestamp.is_some() {
            return Ok(Outcome::Done);
        }
        if !may_delete_super(&super_obj, &req.cluster, &req.uid) {
            debug!(key = %req.key(), "super object belongs to someone else; leaving it");
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
            Ok(_) => {
                info!(key = %req.key(), kind = R::KIND, "super object deleted");
                Ok(Outcome::Done)
            }
            // Gone already, or re-created under a different uid: handled.
            Err(kube::Error::Api(ae)) if ae.code == 404 || ae.code == 409 => Ok(Outcome::Done),
            Err(err) => Err(Error::classify(err)),
        }
    }

    async fn write_super(&self, api: &Api<R>, req: &Request, desired: R) -> Result<Outcome> {
        let tenant_uid = owner_uid(&desired).unwrap_or_default();
        match api.get_opt(&req.name).await.map_err(Error::classify)? {
            None => match api.create(&PostParams::default(), &desired).await {
                Ok(_) => {
                    debug!(key = %req.key(), kind = R::KIND, "super object created");
                    Ok(Outcome::Done)
                }
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    // Concurrent creation: ours if the owner matches.
                    let existing = api.get_opt(&req.name).await.map_err(Error::classify)?;
                    match existing {
                        Some(obj) if super::owner_matches(&obj, &req.cluster, &tenant_uid) => {
                            Ok(Outcome::Done)
                        }
                        _ => Err(Error::AlreadyExists(req.key())),
                    }
                }
                Err(err) => Err(Error::classify(err)),
            },
            Some(existing) => {
                if !super::owner_matches(&existing, &req.cluster, &tenant_uid) {
                    warn!(key = %req.key(), "super object is owned by a different tenant object");
                    return Err(Error::AlreadyExists(req.key()));
                }
                if R::desired_equal(&desired, &existing) {
                    return Ok(Outcome::Done);
                }
                let mut update = desired;
                update.meta_mut().resource_version = existing.meta().resource_version.clone();
                api.replace(&req.name, &PostParams::default(), &update)
                    .await
                    .map_err(Error::classify)?;
                debug!(key = %req.key(), kind = R::KIND, "super object updated");
                Ok(Outcome::Done)
            }
        }
    }
}

#[async_trait]
impl<R: SyncedResource> Reconcile for DownwardSyncer<R> {
    async fn reconcile(&self, req: &Request) -> Result<Outcome> {
        let cluster = match self.mcc.cluster(&req.cluster) {
            Some(c) => c,
            None => return Ok(Outcome::Done),
        };
        // ClusterNotReady bubbles up and the worker backs off.
        let tenant_obj = cluster.cached::<R>(R::KIND, &req.namespace, &req.name)?;
        let super_ns = super_namespace(&req.cluster, &req.namespace);
        let api: Api<R> = Api::namespaced(self.super_client.clone(), &super_ns);

        match tenant_obj {
            None => self.delete_super(&api, req).await,
            Some(obj) => {
                if !obj.downward_allowed(&self.config.super_cluster_id) {
                    debug!(key = %req.key(), "scheduled to a different super cluster");
                    return Ok(Outcome::Done);
                }
                self.ensure_super_namespace(&req.cluster, &super_ns).await?;
                let desired = build_super_object(&req.cluster, cluster.spec(), obj.as_ref());
                self.write_super(&api, req, desired).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;

    fn super_pod(cluster: &str, uid: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some("web".into());
        pod.metadata.namespace = Some(format!("{cluster}-prod"));
        pod.metadata.uid = Some("super-uid".into());
        pod.metadata.annotations = Some(
            [
                (meta::CLUSTER_KEY.to_string(), cluster.to_string()),
                (meta::OWNER_UID.to_string(), uid.to_string()),
            ]
            .into_iter()
            .collect(),
        );
        pod
    }

    #[test]
    fn delete_requires_matching_delegated_uid() {
        let sup = super_pod("t1", "uid-X");
        assert!(may_delete_super(&sup, "t1", "uid-X"));
        // Re-created for another tenant object: must not be deleted.
        assert!(!may_delete_super(&sup, "t1", "uid-Y"));
        // Different tenant entirely.
        assert!(!may_delete_super(&sup, "t2", "uid-X"));
        // Patrol-driven delete without an event uid.
        assert!(may_delete_super(&sup, "t1", ""));
    }

    #[test]
    fn undelegated_objects_are_never_deleted() {
        let mut sup = super_pod("t1", "uid-X");
        sup.metadata.annotations = None;
        assert!(!may_delete_super(&sup, "t1", "uid-X"));
        assert!(!may_delete_super(&sup, "t1", ""));
    }
}
