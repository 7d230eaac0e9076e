//! Reconcilers enforcing the structural invariants of the namespace forest:
//! the `HierarchyConfiguration` reconciler validates parent edits and writes
//! back computed status, the namespace reconciler tracks which namespaces
//! actually exist, and the anchor reconciler manages subnamespace lifecycles.

pub mod anchor;
pub mod validator;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::{Controller, watcher};
use kube::{Api, Client, ResourceExt};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::api::{
    ApiCondition, HIERARCHY_SINGLETON, HierarchyConfiguration, HierarchySpec, HierarchyStatus,
    meta,
};
use crate::config::Config;
use crate::errors::Error;
use crate::forest::{Affect, Code, Condition, Forest, NamespaceView, SharedForest};
use crate::propagation::apply::Propagator;
use validator::{Violation, validate_parent_change};

const FIELD_MANAGER: &str = "canopy";

/// Context shared by the hierarchy-side controllers.
pub struct HierarchyCtx {
    pub client: Client,
    pub forest: SharedForest,
    pub config: Arc<Config>,
    pub propagator: Arc<Propagator>,
    /// Forest snapshots for the diagnostic SSE stream.
    pub updates: broadcast::Sender<Vec<NamespaceView>>,
    /// Per-namespace failure counts driving exponential requeue delays.
    attempts: std::sync::Mutex<HashMap<String, u32>>,
}

impl HierarchyCtx {
    pub fn new(
        client: Client,
        forest: SharedForest,
        config: Arc<Config>,
        propagator: Arc<Propagator>,
        updates: broadcast::Sender<Vec<NamespaceView>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            forest,
            config,
            propagator,
            updates,
            attempts: std::sync::Mutex::new(HashMap::new()),
        })
    }

    fn forget_attempts(&self, ns: &str) {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.remove(ns);
        }
    }

    fn next_backoff(&self, ns: &str) -> Duration {
        let mut attempts = match self.attempts.lock() {
            Ok(a) => a,
            Err(_) => return Duration::from_secs(30),
        };
        let n = attempts.entry(ns.to_string()).or_insert(0);
        *n = n.saturating_add(1);
        let secs = 1u64.checked_shl(n.saturating_sub(1).min(8)).unwrap_or(256);
        Duration::from_secs(secs.min(300))
    }

    fn publish_snapshot(&self, snapshot: Vec<NamespaceView>) {
        // Nobody listening is fine.
        let _ = self.updates.send(snapshot);
    }
}

/// Applies one `HierarchyConfiguration` spec to the forest: validates the
/// parent edit, refreshes conditions, and returns the namespaces whose
/// propagated objects must be re-derived (the subtree before and after the
/// move).
pub fn apply_hierarchy_spec(forest: &mut Forest, ns: &str, spec: &HierarchySpec) -> Vec<String> {
    {
        let node = forest.get(ns);
        node.exists = true;
        node.allow_cascading_delete = spec.allow_cascading_delete;
        // These are re-derived on every sync; we are their setter.
        node.clear_condition_code(Code::CritCycle);
        node.clear_condition_code(Code::CritParentMissing);
        node.clear_condition_code(Code::InvalidConfig);
        node.clear_condition_code(Code::SubnamespaceAnchorMissing);
    }

    let mut resync: Vec<String> = forest.descendant_names(ns);
    resync.push(ns.to_string());

    let desired = spec.parent.as_deref().filter(|p| !p.is_empty());
    match validate_parent_change(forest, ns, desired) {
        Ok(()) => {
            if let Err(err) = forest.set_parent(ns, desired) {
                forest.get(ns).set_condition(Condition::new(
                    Code::InvalidConfig,
                    Affect::Namespace(ns.to_string()),
                    err.to_string(),
                ));
            }
        }
        Err(v @ Violation::Cycle { .. }) => {
            let parent = desired.unwrap_or_default().to_string();
            forest.get(ns).set_condition(Condition::new(
                Code::CritCycle,
                Affect::Namespace(parent),
                v.to_string(),
            ));
        }
        Err(v) => {
            forest.get(ns).set_condition(Condition::new(
                Code::InvalidConfig,
                Affect::Namespace(ns.to_string()),
                v.to_string(),
            ));
        }
    }

    if let Some(parent) = desired {
        let parent_exists = forest.node(parent).map(|n| n.exists).unwrap_or(false);
        let edge_applied =
            forest.node(ns).and_then(|n| n.parent.as_deref()) == Some(parent);
        if edge_applied && !parent_exists {
            forest.get(ns).set_condition(Condition::new(
                Code::CritParentMissing,
                Affect::Namespace(parent.to_string()),
                format!("parent namespace {parent} does not exist"),
            ));
        }
    }

    let (is_sub, parent) = forest
        .node(ns)
        .map(|n| (n.is_subnamespace, n.parent.clone()))
        .unwrap_or((false, None));
    if is_sub {
        let anchored = parent
            .as_deref()
            .and_then(|p| forest.node(p))
            .map(|p| p.anchors.iter().any(|a| a == ns))
            .unwrap_or(false);
        if !anchored {
            forest.get(ns).set_condition(Condition::new(
                Code::SubnamespaceAnchorMissing,
                Affect::Namespace(parent.unwrap_or_default()),
                format!("no anchor named {ns} exists in the parent namespace"),
            ));
        }
    }

    forest.clear_obsolete_conditions(ns);

    // Descendants report halted activities while this node carries a
    // critical condition, and recover as soon as it clears.
    let crit = forest
        .node(ns)
        .map(|n| n.has_local_crit_condition())
        .unwrap_or(false);
    for descendant in forest.descendant_names(ns) {
        if crit {
            forest.get(&descendant).set_condition(Condition::new(
                Code::AncestorHaltedActivities,
                Affect::Namespace(ns.to_string()),
                format!("ancestor {ns} has a critical condition"),
            ));
        } else {
            forest.get(&descendant).clear_conditions_where(|cond| {
                cond.code == Code::AncestorHaltedActivities
                    && cond.affect.namespace() == ns
            });
        }
    }

    for d in forest.descendant_names(ns) {
        if !resync.contains(&d) {
            resync.push(d);
        }
    }
    resync.sort();
    resync.dedup();
    resync
}

/// Computes the status written back onto the singleton: sorted children,
/// conditions sorted by code then message, and the per-ancestor depth labels
/// (external trees use their recorded labels instead of forest ancestry).
pub fn build_status(forest: &Forest, ns: &str) -> HierarchyStatus {
    let node = match forest.node(ns) {
        Some(n) => n,
        None => return HierarchyStatus::default(),
    };
    let children: Vec<String> = node.children.iter().cloned().collect();

    let mut conditions: Vec<ApiCondition> = node
        .conditions()
        .map(|c| ApiCondition {
            type_: c.code.to_string(),
            reason: None,
            message: c.message.clone(),
            affects: vec![c.affect.to_string()],
            last_transition_time: Some(c.set_at.clone()),
        })
        .collect();
    conditions.sort_by(|a, b| a.type_.cmp(&b.type_).then(a.message.cmp(&b.message)));

    let mut labels = BTreeMap::new();
    if node.is_external() {
        for (anc, depth) in &node.external_tree_labels {
            labels.insert(meta::tree_depth_label(anc), *depth as i64);
        }
    } else {
        let ancestry = forest.ancestry_names(ns);
        let depth_of_self = ancestry.len() - 1;
        for (i, anc) in ancestry.iter().enumerate() {
            labels.insert(meta::tree_depth_label(anc), (depth_of_self - i) as i64);
        }
    }

    HierarchyStatus {
        children,
        conditions,
        labels,
    }
}

async fn reconcile_hierarchy(
    hc: Arc<HierarchyConfiguration>,
    ctx: Arc<HierarchyCtx>,
) -> Result<Action, Error> {
    let ns = match hc.metadata.namespace.as_deref() {
        Some(ns) => ns.to_string(),
        None => return Ok(Action::await_change()),
    };
    if hc.name_any() != HIERARCHY_SINGLETON {
        warn!(namespace = %ns, name = %hc.name_any(), "ignoring non-singleton hierarchy object");
        return Ok(Action::await_change());
    }
    if ctx.config.is_excluded_namespace(&ns) {
        debug!(namespace = %ns, "namespace is excluded from hierarchy management");
        return Ok(Action::await_change());
    }

    let (resync, status, parent, snapshot) = {
        let mut forest = ctx.forest.lock().await;
        let resync = apply_hierarchy_spec(&mut forest, &ns, &hc.spec);
        let parent = forest.node(&ns).and_then(|n| n.parent.clone());
        (resync, build_status(&forest, &ns), parent, forest.snapshot())
    };

    ctx.propagator.resync_subtree(&resync).await;

    let api: Api<HierarchyConfiguration> = Api::namespaced(ctx.client.clone(), &ns);
    api.patch_status(
        HIERARCHY_SINGLETON,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(serde_json::json!({ "status": status })),
    )
    .await
    .map_err(Error::classify)?;

    // The parent's children list changed with this edge; refresh its status
    // as well (it has no event of its own to react to).
    if let Some(parent) = parent {
        if let Err(err) = write_status(&ctx, &parent).await {
            warn!(namespace = %parent, error = %err, "parent status refresh failed");
        }
    }

    ctx.publish_snapshot(snapshot);
    ctx.forget_attempts(&ns);
    info!(namespace = %ns, "reconciled hierarchy");
    Ok(Action::await_change())
}

/// Writes the computed status onto a namespace's singleton, if it has one.
async fn write_status(ctx: &HierarchyCtx, ns: &str) -> Result<(), Error> {
    let status = {
        let forest = ctx.forest.lock().await;
        if !forest.contains(ns) {
            return Ok(());
        }
        build_status(&forest, ns)
    };
    let api: Api<HierarchyConfiguration> = Api::namespaced(ctx.client.clone(), ns);
    match api
        .patch_status(
            HIERARCHY_SINGLETON,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(serde_json::json!({ "status": status })),
        )
        .await
    {
        Ok(_) => Ok(()),
        // The namespace may not have declared a hierarchy yet.
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(err) => Err(Error::classify(err)),
    }
}

fn hierarchy_error_policy(
    hc: Arc<HierarchyConfiguration>,
    error: &Error,
    ctx: Arc<HierarchyCtx>,
) -> Action {
    let ns = hc.metadata.namespace.clone().unwrap_or_default();
    let delay = ctx.next_backoff(&ns);
    error!(namespace = %ns, error = %error, ?delay, "hierarchy reconcile failed");
    Action::requeue(delay)
}

async fn reconcile_namespace(
    namespace: Arc<Namespace>,
    ctx: Arc<HierarchyCtx>,
) -> Result<Action, Error> {
    let name = match namespace.metadata.name.as_deref() {
        Some(n) => n.to_string(),
        None => return Ok(Action::await_change()),
    };
    if ctx.config.is_excluded_namespace(&name) {
        return Ok(Action::await_change());
    }

    let snapshot = {
        let mut forest = ctx.forest.lock().await;
        if namespace.metadata.deletion_timestamp.is_some() {
            forest.unset_exists(&name);
            forest.snapshot()
        } else {
            {
                let node = forest.get(&name);
                node.exists = true;
                node.manager = namespace
                    .annotations()
                    .get(meta::MANAGED_BY)
                    .cloned()
                    .unwrap_or_else(|| meta::DEFAULT_MANAGER.to_string());
            }
            if forest.get(&name).is_external() {
                let labels = external_tree_labels(namespace.labels());
                forest.get(&name).external_tree_labels = labels;
            }
            if let Some(parent) = namespace.annotations().get(meta::SUBNAMESPACE_OF).cloned() {
                let needs_edge = forest
                    .node(&name)
                    .map(|n| n.parent.is_none())
                    .unwrap_or(true);
                if needs_edge {
                    if let Err(err) = forest.set_parent(&name, Some(&parent)) {
                        warn!(namespace = %name, error = %err, "subnamespace edge rejected");
                    }
                }
                forest.get(&name).is_subnamespace = true;
            }
            forest.snapshot()
        }
    };
    ctx.publish_snapshot(snapshot);
    debug!(namespace = %name, "reconciled namespace");
    Ok(Action::await_change())
}

fn external_tree_labels(labels: &BTreeMap<String, String>) -> BTreeMap<String, usize> {
    labels
        .iter()
        .filter_map(|(k, v)| {
            let anc = k.strip_suffix(meta::TREE_DEPTH_SUFFIX)?;
            let depth = v.parse().ok()?;
            Some((anc.to_string(), depth))
        })
        .collect()
}

fn namespace_error_policy(
    namespace: Arc<Namespace>,
    error: &Error,
    _ctx: Arc<HierarchyCtx>,
) -> Action {
    error!(namespace = %namespace.name_any(), error = %error, "namespace reconcile failed");
    Action::requeue(Duration::from_secs(30))
}

/// Runs the hierarchy and namespace controllers until shutdown.
pub async fn run(ctx: Arc<HierarchyCtx>) {
    let hierarchy = Controller::new(
        Api::<HierarchyConfiguration>::all(ctx.client.clone()),
        watcher::Config::default().any_semantic(),
    )
    .shutdown_on_signal()
    .run(reconcile_hierarchy, hierarchy_error_policy, ctx.clone())
    .for_each(|res| async move {
        if let Err(e) = res {
            info!("hierarchy controller error: {:?}", e);
        }
    })
    .boxed();

    let namespaces = Controller::new(
        Api::<Namespace>::all(ctx.client.clone()),
        watcher::Config::default().any_semantic(),
    )
    .shutdown_on_signal()
    .run(reconcile_namespace, namespace_error_policy, ctx.clone())
    .for_each(|res| async move {
        if let Err(e) = res {
            info!("namespace controller error: {:?}", e);
        }
    })
    .boxed();

    let anchors = anchor::run(ctx.clone()).boxed();

    futures::future::join3(hierarchy, namespaces, anchors).await;
}
