//! API types: the CRDs canopy serves and the annotation vocabulary stamped on
//! mirrored objects.

use std::collections::BTreeMap;
use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Well-known annotation and label keys.
pub mod meta {
    /// Stable identifier of the owning tenant control plane.
    pub const CLUSTER_KEY: &str = "canopy.dev/cluster-key";
    /// UID of the tenant-side object a super object mirrors.
    pub const OWNER_UID: &str = "canopy.dev/owner-uid";
    /// Super cluster a pod was placed on by the namespace scheduler.
    pub const SCHEDULED_CLUSTER: &str = "canopy.dev/scheduled-cluster";
    /// JSON map of cluster id to slice count for a scheduled namespace.
    pub const PLACEMENTS: &str = "canopy.dev/placements";
    /// JSON cpu/memory pair describing a namespace's quota slice.
    pub const NAMESPACE_SLICE: &str = "canopy.dev/namespace-slice";
    /// JSON cpu/memory pair describing a namespace's total quota.
    pub const NAMESPACE_QUOTA: &str = "canopy.dev/namespace-quota";
    /// JSON map of cluster id to slice count pinned by an administrator.
    pub const MANDATORY_PLACEMENTS: &str = "canopy.dev/mandatory-placements";
    /// Back-reference `<namespace>/<name>` stamped on propagated copies.
    pub const INHERITED_FROM: &str = "canopy.dev/inherited-from";
    /// Parent namespace recorded on anchor-created subnamespaces.
    pub const SUBNAMESPACE_OF: &str = "canopy.dev/subnamespace-of";
    /// Manager tag; anything but the default marks the tree as external.
    pub const MANAGED_BY: &str = "canopy.dev/managed-by";
    /// Optional label selector restricting which descendants receive a copy.
    pub const PROPAGATE_SELECT: &str = "canopy.dev/propagate-select";
    /// Opt-out: a source carrying this annotation is never propagated.
    pub const PROPAGATE_NONE: &str = "canopy.dev/propagate-none";
    /// Suffix of the per-ancestor depth labels, `<ancestor>.tree.canopy.dev/depth`.
    pub const TREE_DEPTH_SUFFIX: &str = ".tree.canopy.dev/depth";

    /// Default value of the manager tag for namespaces canopy owns.
    pub const DEFAULT_MANAGER: &str = "canopy";

    pub fn tree_depth_label(ancestor: &str) -> String {
        format!("{ancestor}{TREE_DEPTH_SUFFIX}")
    }
}

/// Identifies a resource kind handled by the propagation engine,
/// `group` empty for the core group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct KindKey {
    pub group: String,
    pub kind: String,
}

impl KindKey {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
        }
    }

    pub fn core(kind: impl Into<String>) -> Self {
        Self::new("", kind)
    }
}

impl fmt::Display for KindKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}/{}", self.group, self.kind)
        }
    }
}

/// How copies of a kind flow through the namespace tree.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema,
)]
pub enum PropagationMode {
    /// Copies flow from ancestors into every descendant.
    Propagate,
    /// Previously propagated copies are deleted; user objects are untouched.
    Remove,
    /// The kind is left alone entirely.
    #[default]
    Ignore,
}

/// Per-namespace hierarchy declaration. A singleton named
/// [`HIERARCHY_SINGLETON`] in each managed namespace.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "tenancy.canopy.dev",
    version = "v1alpha1",
    kind = "HierarchyConfiguration",
    namespaced,
    status = "HierarchyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct HierarchySpec {
    /// Parent namespace; empty means this namespace is a tree root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Whether deleting this namespace may cascade to its subnamespaces.
    #[serde(default)]
    pub allow_cascading_delete: bool,
}

pub const HIERARCHY_SINGLETON: &str = "hierarchy";

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HierarchyStatus {
    /// Direct children, sorted by name.
    #[serde(default)]
    pub children: Vec<String>,
    /// Current problems, sorted by code then message.
    #[serde(default)]
    pub conditions: Vec<ApiCondition>,
    /// `<ancestor>.tree.canopy.dev/depth` for every ancestor, self at 0.
    #[serde(default)]
    pub labels: BTreeMap<String, i64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiCondition {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub message: String,
    /// Object references this condition applies to, `<kind>/<namespace>/<name>`.
    #[serde(default)]
    pub affects: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// Declares a subnamespace: an anchor named `X` in namespace `P` asks for a
/// namespace `X` whose parent is `P`.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "tenancy.canopy.dev",
    version = "v1alpha1",
    kind = "SubnamespaceAnchor",
    namespaced,
    status = "SubnamespaceAnchorStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct SubnamespaceAnchorSpec {}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubnamespaceAnchorStatus {
    #[serde(default)]
    pub state: AnchorState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub enum AnchorState {
    #[default]
    Pending,
    /// The subnamespace exists and is owned by this anchor.
    Ok,
    /// A namespace of that name exists but is not ours; left untouched.
    Conflict,
}

/// Cluster-scoped singleton listing the kinds the propagation engine handles.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "tenancy.canopy.dev",
    version = "v1alpha1",
    kind = "CanopyConfiguration",
    status = "CanopyConfigurationStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct CanopyConfigurationSpec {
    #[serde(default)]
    pub resources: Vec<ResourceSyncMode>,
}

pub const CONFIGURATION_SINGLETON: &str = "config";

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSyncMode {
    #[serde(default)]
    pub group: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub resource: String,
    pub kind: String,
    #[serde(default)]
    pub mode: PropagationMode,
}

fn default_version() -> String {
    "v1".to_string()
}

impl ResourceSyncMode {
    pub fn kind_key(&self) -> KindKey {
        KindKey::new(self.group.clone(), self.kind.clone())
    }

    pub fn api_resource(&self) -> kube::core::ApiResource {
        let api_version = if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        };
        kube::core::ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version,
            kind: self.kind.clone(),
            plural: self.resource.clone(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CanopyConfigurationStatus {
    #[serde(default)]
    pub conditions: Vec<ApiCondition>,
}

/// A tenant control plane registered with the syncer. Its cluster key is
/// derived from the owning namespace and name, see [`VirtualCluster::cluster_key`].
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "tenancy.canopy.dev",
    version = "v1alpha1",
    kind = "VirtualCluster",
    namespaced,
    status = "VirtualClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualClusterSpec {
    /// Secret in the same namespace holding the tenant kubeconfig under the
    /// `kubeconfig` key.
    pub kubeconfig_secret: String,
    /// Metadata prefixes stripped from objects crossing into the super
    /// cluster, merged with the built-in defaults.
    #[serde(default)]
    pub opaque_meta_prefixes: Vec<String>,
    /// Metadata prefixes always carried across, merged with the defaults.
    #[serde(default)]
    pub transparent_meta_prefixes: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualClusterStatus {
    #[serde(default)]
    pub phase: Option<String>,
}

impl VirtualCluster {
    /// Stable key of this tenant: `<namespace>-<name>`.
    pub fn cluster_key(&self) -> Option<String> {
        let ns = self.metadata.namespace.as_deref()?;
        let name = self.metadata.name.as_deref()?;
        Some(format!("{ns}-{name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_key_display() {
        assert_eq!(KindKey::core("ConfigMap").to_string(), "ConfigMap");
        assert_eq!(
            KindKey::new("rbac.authorization.k8s.io", "RoleBinding").to_string(),
            "rbac.authorization.k8s.io/RoleBinding"
        );
    }

    #[test]
    fn tree_depth_label_shape() {
        assert_eq!(
            meta::tree_depth_label("team"),
            "team.tree.canopy.dev/depth"
        );
    }

    #[test]
    fn cluster_key_from_owner() {
        let mut vc = VirtualCluster::new("t1", VirtualClusterSpec::default());
        vc.metadata.namespace = Some("tenants".into());
        assert_eq!(vc.cluster_key().as_deref(), Some("tenants-t1"));
    }

    #[test]
    fn hierarchy_spec_defaults() {
        let spec: HierarchySpec = serde_json::from_str("{}").expect("valid");
        assert!(spec.parent.is_none());
        assert!(!spec.allow_cascading_delete);
    }
}
