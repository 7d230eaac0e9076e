use std::time::Duration;

use clap::Parser;

/// Reconcile attempts per request before the queue drops it.
pub const MAX_RECONCILE_RETRIES: u32 = 16;

/// Default timeout applied to every apiserver request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Namespaces the hierarchy controller never manages.
pub const EXCLUDED_NAMESPACES: &[&str] = &["kube-system", "kube-public", "kube-node-lease"];

/// Metadata prefixes stripped when objects cross a cluster boundary.
pub const DEFAULT_OPAQUE_PREFIXES: &[&str] = &["canopy.dev", "kubectl.kubernetes.io"];

/// Metadata prefixes always carried across a cluster boundary.
pub const DEFAULT_TRANSPARENT_PREFIXES: &[&str] = &["app.kubernetes.io", "tenancy.canopy.dev"];

#[derive(Debug, Clone, Parser)]
#[command(name = "canopy", about = "Hierarchical namespace and virtual cluster controller")]
pub struct Config {
    /// Address the diagnostic HTTP server binds to.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub bind_addr: String,

    /// Worker tasks per sync controller.
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Seconds between patrol passes.
    #[arg(long, default_value_t = 60)]
    pub resync_period: u64,

    /// Identifier of this super cluster inside the pool.
    #[arg(long, default_value = "super-default")]
    pub super_cluster_id: String,

    /// Gate pod syncing on the owning namespace being placed on this cluster.
    #[arg(long, default_value_t = false)]
    pub enable_pool_scheduling: bool,

    /// Allow propagation to overwrite conflicting user objects when a kind
    /// switches straight from Ignore to Propagate.
    #[arg(long, default_value_t = false)]
    pub force_propagation: bool,

    /// Namespace this controller runs in; excluded from hierarchy management.
    #[arg(long, default_value = "canopy-system")]
    pub controller_namespace: String,
}

impl Config {
    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_period)
    }

    /// Namespaces outside hierarchy management: the static set plus our own.
    pub fn is_excluded_namespace(&self, ns: &str) -> bool {
        ns == self.controller_namespace || EXCLUDED_NAMESPACES.contains(&ns)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::parse_from(["canopy"])
    }
}
