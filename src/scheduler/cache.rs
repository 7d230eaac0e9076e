//! Scheduler cache: the in-memory view of super clusters, scheduled
//! namespaces and their quota slices. Mutated only under the engine's write
//! lock.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::errors::Error;

use super::quota::{Quota, total_slices};

/// One quota slice provisioned on a cluster for a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Slice {
    /// Namespace key `tenant/name` owning this slice.
    pub owner: String,
    pub size: Quota,
    pub cluster: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NamespaceEntry {
    /// `tenant/name`.
    pub key: String,
    pub quota: Quota,
    pub quota_slice: Quota,
    /// Cluster id to slice count; invariant: counts sum to `total_slices`.
    pub placements: BTreeMap<String, u32>,
    /// Admin-pinned placements, satisfied before anything else.
    pub mandatory: BTreeMap<String, u32>,
}

impl NamespaceEntry {
    pub fn total_slices(&self) -> u32 {
        total_slices(&self.quota, &self.quota_slice)
    }

    /// Entries are comparable iff their slice unit is identical; the
    /// engine rejects updates that change it.
    pub fn comparable(&self, other: &NamespaceEntry) -> bool {
        self.quota_slice == other.quota_slice
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterEntry {
    pub id: String,
    pub labels: BTreeMap<String, String>,
    pub capacity: Quota,
    /// Namespace key to the slices it holds here.
    pub provisions: HashMap<String, Vec<Slice>>,
}

impl ClusterEntry {
    pub fn new(id: impl Into<String>, labels: BTreeMap<String, String>, capacity: Quota) -> Self {
        Self {
            id: id.into(),
            labels,
            capacity,
            provisions: HashMap::new(),
        }
    }

    pub fn allocated(&self) -> Quota {
        self.provisions
            .values()
            .flatten()
            .fold(Quota::default(), |acc, s| acc.saturating_add(&s.size))
    }

    pub fn available(&self) -> Quota {
        self.capacity.saturating_sub(&self.allocated())
    }
}

#[derive(Debug, Default)]
pub struct SchedulerCache {
    clusters: HashMap<String, ClusterEntry>,
    namespaces: HashMap<String, NamespaceEntry>,
    /// Pod key `cluster/ns/name` to the cluster running it.
    pods: HashMap<String, String>,
}

impl SchedulerCache {
    pub fn add_cluster(&mut self, cluster: ClusterEntry) {
        self.clusters.insert(cluster.id.clone(), cluster);
    }

    /// Refreshes capacity and labels, keeping existing provisions.
    pub fn update_cluster(&mut self, id: &str, labels: BTreeMap<String, String>, capacity: Quota) {
        match self.clusters.get_mut(id) {
            Some(entry) => {
                entry.labels = labels;
                entry.capacity = capacity;
            }
            None => self.add_cluster(ClusterEntry::new(id, labels, capacity)),
        }
    }

    pub fn remove_cluster(&mut self, id: &str) {
        self.clusters.remove(id);
        // Placements pointing at the removed cluster survive as hints; the
        // next schedule pass relocates them.
    }

    pub fn cluster(&self, id: &str) -> Option<&ClusterEntry> {
        self.clusters.get(id)
    }

    pub fn clusters(&self) -> impl Iterator<Item = &ClusterEntry> {
        self.clusters.values()
    }

    pub fn namespace(&self, key: &str) -> Option<&NamespaceEntry> {
        self.namespaces.get(key)
    }

    /// Inserts a namespace and installs its slices on the owning clusters.
    pub fn add_namespace(&mut self, ns: NamespaceEntry) {
        self.release_slices(&ns.key);
        for (cluster_id, count) in &ns.placements {
            if let Some(cluster) = self.clusters.get_mut(cluster_id) {
                let slices = (0..*count)
                    .map(|_| Slice {
                        owner: ns.key.clone(),
                        size: ns.quota_slice,
                        cluster: cluster_id.clone(),
                    })
                    .collect();
                cluster.provisions.insert(ns.key.clone(), slices);
            }
        }
        self.namespaces.insert(ns.key.clone(), ns);
    }

    /// Replaces an existing entry. Changing the quota slice of a scheduled
    /// namespace is unsupported.
    pub fn update_namespace(&mut self, ns: NamespaceEntry) -> Result<(), Error> {
        if let Some(existing) = self.namespaces.get(&ns.key) {
            if !existing.comparable(&ns) {
                return Err(Error::InvalidConfig(format!(
                    "changing the quota slice of {} is unsupported",
                    ns.key
                )));
            }
        }
        self.add_namespace(ns);
        Ok(())
    }

    /// Removes the namespace and releases its slices back to the clusters.
    pub fn remove_namespace(&mut self, key: &str) -> Option<NamespaceEntry> {
        self.release_slices(key);
        self.namespaces.remove(key)
    }

    fn release_slices(&mut self, key: &str) {
        for cluster in self.clusters.values_mut() {
            cluster.provisions.remove(key);
        }
    }

    pub fn add_pod(&mut self, cluster: &str, namespace: &str, name: &str) {
        self.pods
            .insert(format!("{cluster}/{namespace}/{name}"), cluster.to_string());
    }

    pub fn remove_pod(&mut self, cluster: &str, namespace: &str, name: &str) {
        self.pods.remove(&format!("{cluster}/{namespace}/{name}"));
    }

    pub fn pod_count(&self, cluster: &str) -> usize {
        self.pods.values().filter(|c| c.as_str() == cluster).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(key: &str, placements: &[(&str, u32)]) -> NamespaceEntry {
        NamespaceEntry {
            key: key.into(),
            quota: Quota::new(10_000, 10 << 30),
            quota_slice: Quota::new(1_000, 1 << 30),
            placements: placements
                .iter()
                .map(|(c, n)| (c.to_string(), *n))
                .collect(),
            mandatory: BTreeMap::new(),
        }
    }

    fn cluster(id: &str, cpu: i64) -> ClusterEntry {
        ClusterEntry::new(id, BTreeMap::new(), Quota::new(cpu, 100 << 30))
    }

    #[test]
    fn placements_install_slices_on_clusters() {
        let mut cache = SchedulerCache::default();
        cache.add_cluster(cluster("a", 64_000));
        cache.add_cluster(cluster("b", 64_000));
        cache.add_namespace(ns("t1/prod", &[("a", 4), ("b", 6)]));

        assert_eq!(cache.cluster("a").expect("a").provisions["t1/prod"].len(), 4);
        assert_eq!(cache.cluster("b").expect("b").provisions["t1/prod"].len(), 6);
        assert_eq!(cache.cluster("a").expect("a").allocated().cpu_millis, 4_000);
    }

    #[test]
    fn slice_conservation_holds() {
        let mut cache = SchedulerCache::default();
        cache.add_cluster(cluster("a", 64_000));
        cache.add_cluster(cluster("b", 64_000));
        let entry = ns("t1/prod", &[("a", 4), ("b", 6)]);
        let total = entry.total_slices();
        cache.add_namespace(entry);

        let placed: u32 = cache
            .namespace("t1/prod")
            .expect("entry")
            .placements
            .values()
            .sum();
        assert_eq!(placed, total);
    }

    #[test]
    fn remove_namespace_releases_slices() {
        let mut cache = SchedulerCache::default();
        cache.add_cluster(cluster("a", 64_000));
        cache.add_namespace(ns("t1/prod", &[("a", 10)]));
        assert_eq!(cache.cluster("a").expect("a").available().cpu_millis, 54_000);

        cache.remove_namespace("t1/prod");
        assert!(cache.namespace("t1/prod").is_none());
        assert_eq!(cache.cluster("a").expect("a").available().cpu_millis, 64_000);
    }

    #[test]
    fn quota_slice_change_is_rejected() {
        let mut cache = SchedulerCache::default();
        cache.add_cluster(cluster("a", 64_000));
        cache.add_namespace(ns("t1/prod", &[("a", 10)]));

        let mut changed = ns("t1/prod", &[("a", 10)]);
        changed.quota_slice = Quota::new(2_000, 2 << 30);
        assert!(cache.update_namespace(changed).is_err());

        let same_slice = ns("t1/prod", &[("a", 5)]);
        assert!(cache.update_namespace(same_slice).is_ok());
    }

    #[test]
    fn pods_are_counted_per_cluster() {
        let mut cache = SchedulerCache::default();
        cache.add_pod("a", "ns", "p1");
        cache.add_pod("a", "ns", "p2");
        cache.add_pod("b", "ns", "p1");
        assert_eq!(cache.pod_count("a"), 2);
        cache.remove_pod("a", "ns", "p1");
        assert_eq!(cache.pod_count("a"), 1);
    }
}
