//! The patroller: every resync period it lists both sides of every mirrored
//! kind, diffs them, and repairs drift by requeueing into the syncers or
//! deleting orphans. Event loss and missed watches heal here.

use std::collections::{HashMap, HashSet};

use kube::api::{DeleteParams, ListParams, Preconditions};
use kube::{Api, Client, Resource, ResourceExt};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::errors::Error;
use crate::mcc::{MultiClusterController, Request};
use crate::metrics::Metrics;
use crate::tenant::ClusterRegistry;

use super::{
    SyncedResource, build_super_object, delegated_cluster, owner_uid, super_namespace,
    tenant_namespace,
};

/// A delegated object seen on the super side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperEntry {
    pub cluster: String,
    pub vns: String,
    pub name: String,
    pub owner_uid: String,
    pub deleting: bool,
}

/// An object seen in a tenant cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantEntry {
    pub cluster: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl TenantEntry {
    fn key(&self) -> (String, String, String) {
        (
            self.cluster.clone(),
            self.namespace.clone(),
            self.name.clone(),
        )
    }
}

impl SuperEntry {
    fn key(&self) -> (String, String, String) {
        (self.cluster.clone(), self.vns.clone(), self.name.clone())
    }
}

#[derive(Debug, Default)]
pub struct DiffOutcome {
    /// Tenant objects with no super counterpart; requeued downward.
    pub missing: Vec<TenantEntry>,
    /// Super objects whose tenant counterpart is gone; deleted.
    pub orphans: Vec<SuperEntry>,
    /// Present on both sides; drift is decided on the full objects.
    pub paired: Vec<(TenantEntry, SuperEntry)>,
}

/// Computes the three patrol sets. Clusters whose caches have not synced are
/// excluded from orphan detection so a cold cache is not mistaken for mass
/// deletion; unknown clusters are skipped entirely.
pub fn diff(
    tenant: Vec<TenantEntry>,
    super_side: Vec<SuperEntry>,
    synced_clusters: &HashSet<String>,
) -> DiffOutcome {
    let mut outcome = DiffOutcome::default();
    let mut super_by_key: HashMap<(String, String, String), SuperEntry> = super_side
        .into_iter()
        .map(|e| (e.key(), e))
        .collect();

    for t in tenant {
        match super_by_key.remove(&t.key()) {
            Some(s) => outcome.paired.push((t, s)),
            None => outcome.missing.push(t),
        }
    }
    for (_, s) in super_by_key {
        if !synced_clusters.contains(&s.cluster) {
            debug!(cluster = %s.cluster, name = %s.name, "cluster not synced; skipping orphan check");
            continue;
        }
        if !s.deleting {
            outcome.orphans.push(s);
        }
    }
    outcome
}

/// One patrol pass for one kind.
pub async fn patrol_kind<R: SyncedResource>(
    super_client: &Client,
    registry: &ClusterRegistry,
    dws_mcc: &MultiClusterController,
    uws_mcc: &MultiClusterController,
    metrics: &Metrics,
    _config: &Config,
) {
    // Super side: every delegated object of this kind, plus the object
    // itself for the drift comparison.
    let api: Api<R> = Api::all(super_client.clone());
    let listed = match api.list(&ListParams::default()).await {
        Ok(l) => l,
        Err(err) => {
            warn!(kind = R::KIND, error = %err, "patrol list failed");
            return;
        }
    };
    let mut super_entries = Vec::new();
    let mut super_objects: HashMap<(String, String, String), R> = HashMap::new();
    for obj in listed {
        let cluster = match delegated_cluster(&obj) {
            Some(c) => c,
            None => continue,
        };
        let super_ns = ResourceExt::namespace(&obj).unwrap_or_default();
        let vns = match tenant_namespace(&cluster, &super_ns) {
            Some(v) => v,
            None => continue,
        };
        let entry = SuperEntry {
            cluster: cluster.clone(),
            vns,
            name: obj.name_any(),
            owner_uid: owner_uid(&obj).unwrap_or_default(),
            deleting: obj.meta().deletion_timestamp.is_some(),
        };
        super_objects.insert(entry.key(), obj);
        super_entries.push(entry);
    }

    // Tenant side, from the synced caches only.
    let synced = registry.synced_clusters();
    let synced_keys: HashSet<String> = synced.iter().map(|c| c.key().to_string()).collect();
    let mut tenant_entries = Vec::new();
    let mut tenant_objects: HashMap<(String, String, String), std::sync::Arc<R>> = HashMap::new();
    for cluster in &synced {
        let store = match cluster.store::<R>(R::KIND) {
            Some(s) => s,
            None => continue,
        };
        for obj in store.state() {
            let entry = TenantEntry {
                cluster: cluster.key().to_string(),
                namespace: ResourceExt::namespace(obj.as_ref()).unwrap_or_default(),
                name: obj.name_any(),
                uid: ResourceExt::uid(obj.as_ref()).unwrap_or_default(),
            };
            tenant_objects.insert(entry.key(), obj.clone());
            tenant_entries.push(entry);
        }
    }

    let outcome = diff(tenant_entries, super_entries, &synced_keys);

    for t in &outcome.missing {
        metrics
            .patrol_requeued
            .with_label_values(&[R::KIND, &t.cluster])
            .inc();
        dws_mcc
            .queue()
            .add(Request::new(&t.cluster, &t.namespace, &t.name, &t.uid));
    }

    for s in &outcome.orphans {
        let Some(obj) = super_objects.get(&s.key()) else {
            continue;
        };
        let super_ns = super_namespace(&s.cluster, &s.vns);
        let api: Api<R> = Api::namespaced(super_client.clone(), &super_ns);
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                uid: obj.meta().uid.clone(),
                resource_version: None,
            }),
            ..Default::default()
        };
        match api.delete(&s.name, &params).await {
            Ok(_) => {
                info!(kind = R::KIND, cluster = %s.cluster, name = %s.name, "patrol deleted orphan");
                metrics
                    .patrol_orphans_deleted
                    .with_label_values(&[R::KIND, &s.cluster])
                    .inc();
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 || ae.code == 409 => {}
            Err(err) => {
                warn!(kind = R::KIND, name = %s.name, error = %Error::classify(err), "orphan delete failed");
            }
        }
    }

    for (t, s) in &outcome.paired {
        let (Some(tenant_obj), Some(super_obj)) =
            (tenant_objects.get(&t.key()), super_objects.get(&s.key()))
        else {
            continue;
        };
        let Some(cluster) = registry.get(&t.cluster) else {
            continue;
        };
        let desired = build_super_object(&t.cluster, cluster.spec(), tenant_obj.as_ref());
        if !R::desired_equal(&desired, super_obj) {
            metrics
                .patrol_mismatch
                .with_label_values(&[R::KIND, &t.cluster])
                .inc();
            dws_mcc
                .queue()
                .add(Request::new(&t.cluster, &t.namespace, &t.name, &t.uid));
        } else if R::status_differs(tenant_obj, super_obj) {
            metrics
                .patrol_mismatch
                .with_label_values(&[R::KIND, &t.cluster])
                .inc();
            uws_mcc
                .queue()
                .add(Request::new(&t.cluster, &t.namespace, &t.name, &t.uid));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(cluster: &str, ns: &str, name: &str, uid: &str) -> TenantEntry {
        TenantEntry {
            cluster: cluster.into(),
            namespace: ns.into(),
            name: name.into(),
            uid: uid.into(),
        }
    }

    fn super_entry(cluster: &str, vns: &str, name: &str, uid: &str) -> SuperEntry {
        SuperEntry {
            cluster: cluster.into(),
            vns: vns.into(),
            name: name.into(),
            owner_uid: uid.into(),
            deleting: false,
        }
    }

    fn synced(keys: &[&str]) -> HashSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn missing_orphan_and_paired_are_separated() {
        let outcome = diff(
            vec![
                tenant("t1", "prod", "a", "u1"),
                tenant("t1", "prod", "b", "u2"),
            ],
            vec![
                super_entry("t1", "prod", "b", "u2"),
                super_entry("t1", "prod", "c", "u3"),
            ],
            &synced(&["t1"]),
        );
        assert_eq!(outcome.missing.len(), 1);
        assert_eq!(outcome.missing[0].name, "a");
        assert_eq!(outcome.orphans.len(), 1);
        assert_eq!(outcome.orphans[0].name, "c");
        assert_eq!(outcome.paired.len(), 1);
        assert_eq!(outcome.paired[0].0.name, "b");
    }

    #[test]
    fn blocked_clusters_are_excluded_from_orphan_detection() {
        // t2's cache has not synced: its empty tenant view must not turn
        // every super object into an orphan.
        let outcome = diff(
            Vec::new(),
            vec![super_entry("t2", "prod", "x", "u9")],
            &synced(&["t1"]),
        );
        assert!(outcome.orphans.is_empty());
    }

    #[test]
    fn deleting_super_objects_are_not_orphans() {
        let mut entry = super_entry("t1", "prod", "x", "u9");
        entry.deleting = true;
        let outcome = diff(Vec::new(), vec![entry], &synced(&["t1"]));
        assert!(outcome.orphans.is_empty());
    }

    #[test]
    fn drift_repair_converges_in_one_pass() {
        // After one pass the diff of the repaired state is empty: the
        // missing object gains a counterpart, the orphan disappears.
        let tenants = vec![tenant("t1", "prod", "a", "u1")];
        let first = diff(
            tenants.clone(),
            vec![super_entry("t1", "prod", "stale", "u0")],
            &synced(&["t1"]),
        );
        assert_eq!(first.missing.len(), 1);
        assert_eq!(first.orphans.len(), 1);

        // Simulate the repair the patrol issues.
        let repaired_super = vec![super_entry("t1", "prod", "a", "u1")];
        let second = diff(tenants, repaired_super, &synced(&["t1"]));
        assert!(second.missing.is_empty());
        assert!(second.orphans.is_empty());
        assert_eq!(second.paired.len(), 1);
    }
}
