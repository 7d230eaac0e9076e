//! The namespace scheduler: maps tenant namespace quotas onto quota slices
//! and places the slices across the super cluster pool. Prior placements
//! survive rescheduling as hints; admin-pinned mandatory placements are
//! satisfied first.

pub mod cache;
pub mod controller;
pub mod quota;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::errors::{Error, Result};
use crate::mcc::{PlacementFilter, Request};

pub use cache::{ClusterEntry, NamespaceEntry, SchedulerCache, Slice};
pub use quota::{Quota, total_slices};

/// How the slice budget of a namespace splits before placement: mandatory
/// first, then prior placements as hints, the remainder scheduled fresh.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SlicePlan {
    pub mandatory: BTreeMap<String, u32>,
    pub hints: BTreeMap<String, u32>,
    pub regular: u32,
}

impl SlicePlan {
    /// Mandatory and hint slices merged into one placement base.
    pub fn base(&self) -> BTreeMap<String, u32> {
        let mut base = self.mandatory.clone();
        for (cluster, count) in &self.hints {
            *base.entry(cluster.clone()).or_insert(0) += count;
        }
        base
    }
}

/// Splits `total` slices: mandatory placements first (truncated if they
/// exceed the budget), then hints minus whatever mandatory already took in
/// the same cluster, then the unassigned remainder.
pub fn classify_slices(
    total: u32,
    mandatory: &BTreeMap<String, u32>,
    prior: &BTreeMap<String, u32>,
) -> SlicePlan {
    let mut plan = SlicePlan::default();
    let mut remaining = total;

    for (cluster, count) in mandatory {
        let take = (*count).min(remaining);
        if take > 0 {
            plan.mandatory.insert(cluster.clone(), take);
            remaining -= take;
        }
    }
    for (cluster, count) in prior {
        let already = plan.mandatory.get(cluster).copied().unwrap_or(0);
        let take = count.saturating_sub(already).min(remaining);
        if take > 0 {
            plan.hints.insert(cluster.clone(), take);
            remaining -= take;
        }
    }
    plan.regular = remaining;
    plan
}

/// Places the regular (unpinned) slices; the engine owns everything else.
pub trait PlacementPolicy: Send + Sync {
    /// Returns additional per-cluster counts for `regular` slices of the
    /// given size, on top of `base`.
    fn place(
        &self,
        regular: u32,
        base: &BTreeMap<String, u32>,
        clusters: &[ClusterEntry],
        slice: &Quota,
    ) -> Result<BTreeMap<String, u32>>;
}

/// Default policy: each slice goes to the cluster with the most remaining
/// headroom, accounting for slices placed earlier in the same pass.
pub struct SpreadPolicy;

impl PlacementPolicy for SpreadPolicy {
    fn place(
        &self,
        regular: u32,
        base: &BTreeMap<String, u32>,
        clusters: &[ClusterEntry],
        slice: &Quota,
    ) -> Result<BTreeMap<String, u32>> {
        let mut additions: BTreeMap<String, u32> = BTreeMap::new();
        for _ in 0..regular {
            let best = clusters
                .iter()
                .map(|c| {
                    let pending = base.get(&c.id).copied().unwrap_or(0)
                        + additions.get(&c.id).copied().unwrap_or(0);
                    let free = c.available().saturating_sub(&slice.scaled(pending));
                    (c, free)
                })
                .filter(|(_, free)| slice.fits(free))
                .max_by_key(|(c, free)| (free.cpu_millis, free.memory_bytes, std::cmp::Reverse(c.id.clone())));
            match best {
                Some((cluster, _)) => {
                    *additions.entry(cluster.id.clone()).or_insert(0) += 1;
                }
                None => {
                    return Err(Error::Unschedulable(
                        String::new(),
                        "no cluster has room for another slice".into(),
                    ));
                }
            }
        }
        Ok(additions)
    }
}

/// JSON shape of the quota and slice annotations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantityPair {
    pub cpu: String,
    pub memory: String,
}

impl QuantityPair {
    pub fn to_quota(&self) -> Result<Quota> {
        Quota::parse(&self.cpu, &self.memory)
    }
}

/// The scheduler engine: all mutations take the engine-wide write lock,
/// reads the read lock.
pub struct SchedulerEngine {
    cache: RwLock<SchedulerCache>,
    policy: Box<dyn PlacementPolicy>,
}

impl SchedulerEngine {
    pub fn new(policy: Box<dyn PlacementPolicy>) -> Arc<Self> {
        Arc::new(Self {
            cache: RwLock::new(SchedulerCache::default()),
            policy,
        })
    }

    pub async fn add_cluster(&self, cluster: ClusterEntry) {
        self.cache.write().await.add_cluster(cluster);
    }

    pub async fn update_cluster(
        &self,
        id: &str,
        labels: BTreeMap<String, String>,
        capacity: Quota,
    ) {
        self.cache.write().await.update_cluster(id, labels, capacity);
    }

    pub async fn remove_cluster(&self, id: &str) {
        self.cache.write().await.remove_cluster(id);
    }

    pub async fn add_pod(&self, cluster: &str, namespace: &str, name: &str) {
        self.cache.write().await.add_pod(cluster, namespace, name);
    }

    pub async fn remove_pod(&self, cluster: &str, namespace: &str, name: &str) {
        self.cache.write().await.remove_pod(cluster, namespace, name);
    }

    pub async fn placements(&self, key: &str) -> Option<BTreeMap<String, u32>> {
        self.cache
            .read()
            .await
            .namespace(key)
            .map(|ns| ns.placements.clone())
    }

    /// Schedules (or reschedules) a namespace. Prior placements come back as
    /// hints; the cache is updated atomically with the returned placement.
    pub async fn schedule_namespace(
        &self,
        key: &str,
        quota: Quota,
        quota_slice: Quota,
        mandatory: BTreeMap<String, u32>,
    ) -> Result<BTreeMap<String, u32>> {
        let mut cache = self.cache.write().await;

        let hints = match cache.namespace(key) {
            Some(existing) => {
                if existing.quota_slice != quota_slice {
                    return Err(Error::InvalidConfig(format!(
                        "changing the quota slice of {key} is unsupported"
                    )));
                }
                existing.placements.clone()
            }
            None => BTreeMap::new(),
        };

        let total = total_slices(&quota, &quota_slice);
        let plan = classify_slices(total, &mandatory, &hints);
        debug!(
            namespace = %key,
            total,
            mandatory = plan.mandatory.values().sum::<u32>(),
            hinted = plan.hints.values().sum::<u32>(),
            regular = plan.regular,
            "slice classification"
        );

        let base = plan.base();
        let clusters: Vec<ClusterEntry> = cache.clusters().cloned().collect();
        let additions = self
            .policy
            .place(plan.regular, &base, &clusters, &quota_slice)
            .map_err(|e| match e {
                Error::Unschedulable(_, msg) => Error::Unschedulable(key.to_string(), msg),
                other => other,
            })?;

        let mut placements = base;
        for (cluster, count) in additions {
            *placements.entry(cluster).or_insert(0) += count;
        }
        debug_assert_eq!(placements.values().sum::<u32>(), total);

        let entry = NamespaceEntry {
            key: key.to_string(),
            quota,
            quota_slice,
            placements: placements.clone(),
            mandatory,
        };
        cache.update_namespace(entry)?;
        info!(namespace = %key, ?placements, "namespace scheduled");
        Ok(placements)
    }

    /// Drops the namespace and releases its slices back to their clusters.
    pub async fn deschedule_namespace(&self, key: &str) {
        let removed = self.cache.write().await.remove_namespace(key);
        if removed.is_some() {
            info!(namespace = %key, "namespace descheduled");
        }
    }
}

/// Pod gate used by the downward syncer when pool scheduling is on: a pod
/// only syncs to this super cluster if its namespace has a slice here.
pub struct PoolPlacementFilter {
    pub engine: Arc<SchedulerEngine>,
    pub super_cluster_id: String,
}

#[async_trait]
impl PlacementFilter for PoolPlacementFilter {
    async fn allows(&self, req: &Request) -> bool {
        let key = format!("{}/{}", req.cluster, req.namespace);
        match self.engine.placements(&key).await {
            Some(placements) => placements
                .get(&self.super_cluster_id)
                .copied()
                .unwrap_or(0)
                > 0,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, u32)]) -> BTreeMap<String, u32> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn classification_orders_mandatory_hints_regular() {
        // quota 10/10Gi sliced 1/1Gi: 10 slices. Mandatory a:2 b:4,
        // prior c:1 d:3 -> all hinted, nothing left for the policy.
        let plan = classify_slices(10, &map(&[("a", 2), ("b", 4)]), &map(&[("c", 1), ("d", 3)]));
        assert_eq!(plan.mandatory, map(&[("a", 2), ("b", 4)]));
        assert_eq!(plan.hints, map(&[("c", 1), ("d", 3)]));
        assert_eq!(plan.regular, 0);
    }

    #[test]
    fn hints_subtract_mandatory_overlap() {
        let plan = classify_slices(10, &map(&[("a", 3)]), &map(&[("a", 5), ("b", 2)]));
        assert_eq!(plan.mandatory, map(&[("a", 3)]));
        // a already holds 3 mandatory slices; only 2 more are hinted.
        assert_eq!(plan.hints, map(&[("a", 2), ("b", 2)]));
        assert_eq!(plan.regular, 3);
    }

    #[test]
    fn mandatory_is_truncated_at_the_budget() {
        let plan = classify_slices(3, &map(&[("a", 2), ("b", 4)]), &map(&[]));
        assert_eq!(plan.mandatory, map(&[("a", 2), ("b", 1)]));
        assert_eq!(plan.regular, 0);
    }

    async fn engine_with_clusters(caps: &[(&str, i64)]) -> Arc<SchedulerEngine> {
        let engine = SchedulerEngine::new(Box::new(SpreadPolicy));
        for (id, cpu) in caps {
            engine
                .add_cluster(ClusterEntry::new(
                    *id,
                    BTreeMap::new(),
                    Quota::new(*cpu, 1000 << 30),
                ))
                .await;
        }
        engine
    }

    #[tokio::test]
    async fn schedule_conserves_slices() {
        let engine = engine_with_clusters(&[("a", 64_000), ("b", 64_000)]).await;
        let quota = Quota::parse("10", "10Gi").expect("quota");
        let slice = Quota::parse("1", "1Gi").expect("slice");
        let placements = engine
            .schedule_namespace("t1/prod", quota, slice, BTreeMap::new())
            .await
            .expect("scheduled");
        assert_eq!(placements.values().sum::<u32>(), 10);
    }

    #[tokio::test]
    async fn reschedule_uses_prior_placements_as_hints() {
        let engine = engine_with_clusters(&[("a", 64_000), ("b", 64_000)]).await;
        let quota = Quota::parse("4", "4Gi").expect("quota");
        let slice = Quota::parse("1", "1Gi").expect("slice");
        let first = engine
            .schedule_namespace("t1/prod", quota, slice, BTreeMap::new())
            .await
            .expect("scheduled");
        let second = engine
            .schedule_namespace("t1/prod", quota, slice, BTreeMap::new())
            .await
            .expect("rescheduled");
        assert_eq!(first, second, "hints keep a stable placement");
    }

    #[tokio::test]
    async fn mandatory_placements_are_honored() {
        let engine = engine_with_clusters(&[("a", 64_000), ("b", 64_000)]).await;
        let quota = Quota::parse("6", "6Gi").expect("quota");
        let slice = Quota::parse("1", "1Gi").expect("slice");
        let placements = engine
            .schedule_namespace("t1/prod", quota, slice, map(&[("b", 4)]))
            .await
            .expect("scheduled");
        assert!(placements.get("b").copied().unwrap_or(0) >= 4);
        assert_eq!(placements.values().sum::<u32>(), 6);
    }

    #[tokio::test]
    async fn quota_slice_change_is_unsupported() {
        let engine = engine_with_clusters(&[("a", 64_000)]).await;
        let quota = Quota::parse("2", "2Gi").expect("quota");
        engine
            .schedule_namespace("t1/prod", quota, Quota::parse("1", "1Gi").expect("slice"), BTreeMap::new())
            .await
            .expect("scheduled");
        let err = engine
            .schedule_namespace("t1/prod", quota, Quota::parse("2", "2Gi").expect("slice"), BTreeMap::new())
            .await
            .expect_err("slice change");
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn overcommitted_pool_is_unschedulable() {
        let engine = engine_with_clusters(&[("a", 2_000)]).await;
        let quota = Quota::parse("10", "10Gi").expect("quota");
        let slice = Quota::parse("1", "1Gi").expect("slice");
        let err = engine
            .schedule_namespace("t1/prod", quota, slice, BTreeMap::new())
            .await
            .expect_err("no capacity");
        assert!(matches!(err, Error::Unschedulable(_, _)));
    }

    #[tokio::test]
    async fn deschedule_releases_capacity() {
        let engine = engine_with_clusters(&[("a", 10_000)]).await;
        let quota = Quota::parse("10", "10Gi").expect("quota");
        let slice = Quota::parse("1", "1Gi").expect("slice");
        engine
            .schedule_namespace("t1/prod", quota, slice, BTreeMap::new())
            .await
            .expect("scheduled");
        // The pool is full now.
        assert!(
            engine
                .schedule_namespace("t1/other", quota, slice, BTreeMap::new())
                .await
                .is_err()
        );
        engine.deschedule_namespace("t1/prod").await;
        assert!(
            engine
                .schedule_namespace("t1/other", quota, slice, BTreeMap::new())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn placement_filter_gates_on_local_slices() {
        let engine = engine_with_clusters(&[("local", 64_000), ("remote", 64_000)]).await;
        let quota = Quota::parse("2", "2Gi").expect("quota");
        let slice = Quota::parse("1", "1Gi").expect("slice");
        engine
            .schedule_namespace("t1/prod", quota, slice, map(&[("remote", 2)]))
            .await
            .expect("scheduled");

        let filter = PoolPlacementFilter {
            engine: engine.clone(),
            super_cluster_id: "local".into(),
        };
        let req = Request::new("t1", "prod", "web", "u1");
        assert!(!filter.allows(&req).await, "all slices live on remote");
        let unknown = Request::new("t1", "unscheduled", "web", "u1");
        assert!(!filter.allows(&unknown).await);

        let filter = PoolPlacementFilter {
            engine,
            super_cluster_id: "remote".into(),
        };
        assert!(filter.allows(&req).await);
    }
}
