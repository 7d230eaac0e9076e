//! The propagation engine. For every managed kind it computes, from a forest
//! snapshot, the create/update/delete operations that bring a namespace in
//! line with its ancestors' source objects. Computation runs under the forest
//! lock and produces plain data; the applier in [`apply`] issues the writes
//! afterwards.

pub mod apply;

use std::collections::{BTreeMap, HashMap};

use kube::core::DynamicObject;
use tracing::debug;

use crate::api::{KindKey, PropagationMode, meta};
use crate::config::DEFAULT_OPAQUE_PREFIXES;
use crate::forest::Forest;

/// One write the applier has to issue. `Conflict` is not a write: it marks a
/// user object in the way of a propagated copy while overwriting is not
/// allowed, and surfaces as a `CannotPropagate` condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Upsert {
        namespace: String,
        name: String,
        object: Box<DynamicObject>,
    },
    Delete {
        namespace: String,
        name: String,
    },
    Conflict {
        namespace: String,
        name: String,
        source: String,
    },
}

/// Tracks per-kind modes along with whether the last transition permits
/// overwriting user objects: only a pass through `Remove` does, unless the
/// operator forces it.
#[derive(Debug, Default)]
pub struct ModeTable {
    modes: HashMap<KindKey, PropagationMode>,
    overwrite_ok: HashMap<KindKey, bool>,
    force: bool,
}

impl ModeTable {
    pub fn new(force: bool) -> Self {
        Self {
            force,
            ..Self::default()
        }
    }

    pub fn mode(&self, kind: &KindKey) -> PropagationMode {
        self.modes.get(kind).copied().unwrap_or_default()
    }

    pub fn overwrite_allowed(&self, kind: &KindKey) -> bool {
        self.force || self.overwrite_ok.get(kind).copied().unwrap_or(false)
    }

    /// Records a mode change. Returns the previous mode.
    pub fn set_mode(&mut self, kind: KindKey, mode: PropagationMode) -> PropagationMode {
        let old = self.mode(&kind);
        if mode == PropagationMode::Propagate {
            // Ignore -> Propagate keeps conflicting user objects safe;
            // Remove -> Propagate means the descendants were wiped first.
            self.overwrite_ok
                .insert(kind.clone(), old == PropagationMode::Remove);
        }
        self.modes.insert(kind, mode);
        old
    }

    pub fn kinds(&self) -> Vec<KindKey> {
        self.modes.keys().cloned().collect()
    }
}

/// Whether an object is a copy we propagated, as opposed to a user source.
pub fn is_propagated_copy(obj: &DynamicObject) -> bool {
    obj.metadata
        .annotations
        .as_ref()
        .map(|a| a.contains_key(meta::INHERITED_FROM))
        .unwrap_or(false)
}

/// Evaluates the optional source selector against the target namespace's
/// tree labels. The selector is a comma-separated `key=value` list; a source
/// without a selector matches everywhere below it.
pub fn selector_matches(source: &DynamicObject, target_labels: &BTreeMap<String, String>) -> bool {
    let annotations = match source.metadata.annotations.as_ref() {
        Some(a) => a,
        None => return true,
    };
    if annotations
        .get(meta::PROPAGATE_NONE)
        .map(|v| v == "true")
        .unwrap_or(false)
    {
        return false;
    }
    let selector = match annotations.get(meta::PROPAGATE_SELECT) {
        Some(s) if !s.trim().is_empty() => s,
        _ => return true,
    };
    selector.split(',').all(|clause| {
        match clause.split_once('=') {
            Some((k, v)) => target_labels.get(k.trim()).map(String::as_str) == Some(v.trim()),
            // A malformed clause never matches; propagating on a selector we
            // cannot parse would be worse than holding the object back.
            None => false,
        }
    })
}

/// The tree labels of a namespace: one depth entry per ancestor, self at 0.
pub fn tree_labels(forest: &Forest, ns: &str) -> BTreeMap<String, String> {
    let ancestry = forest.ancestry_names(ns);
    let depth_of_self = ancestry.len() - 1;
    ancestry
        .into_iter()
        .enumerate()
        .map(|(i, anc)| (meta::tree_depth_label(&anc), (depth_of_self - i).to_string()))
        .collect()
}

/// Builds the copy of `source` destined for `dest_ns`: server-managed fields
/// and status dropped, opaque-prefixed metadata stripped, back-reference
/// stamped.
pub fn build_copy(source_ns: &str, source: &DynamicObject, dest_ns: &str) -> DynamicObject {
    let mut copy = source.clone();
    let name = copy.metadata.name.clone().unwrap_or_default();

    copy.metadata.namespace = Some(dest_ns.to_string());
    copy.metadata.resource_version = None;
    copy.metadata.uid = None;
    copy.metadata.owner_references = None;
    copy.metadata.managed_fields = None;
    copy.metadata.creation_timestamp = None;
    copy.metadata.generation = None;
    copy.metadata.finalizers = None;
    copy.metadata.deletion_timestamp = None;

    copy.metadata.labels = copy
        .metadata
        .labels
        .take()
        .map(strip_opaque)
        .filter(|l| !l.is_empty());
    let mut annotations = copy
        .metadata
        .annotations
        .take()
        .map(strip_opaque)
        .unwrap_or_default();
    annotations.insert(
        meta::INHERITED_FROM.to_string(),
        format!("{source_ns}/{name}"),
    );
    copy.metadata.annotations = Some(annotations);

    if let Some(map) = copy.data.as_object_mut() {
        map.remove("status");
    }
    copy
}

fn strip_opaque(map: BTreeMap<String, String>) -> BTreeMap<String, String> {
    map.into_iter()
        .filter(|(k, _)| {
            !DEFAULT_OPAQUE_PREFIXES
                .iter()
                .any(|p| k == p || k.starts_with(&format!("{p}/")))
        })
        .collect()
}

/// Semantic equality of a desired copy and what is on the server, ignoring
/// everything the server manages.
pub fn copies_equal(desired: &DynamicObject, actual: &DynamicObject) -> bool {
    let desired_data = strip_status(&desired.data);
    let actual_data = strip_status(&actual.data);
    desired_data == actual_data
        && desired.metadata.labels == actual.metadata.labels
        && desired.metadata.annotations == actual.metadata.annotations
}

fn strip_status(data: &serde_json::Value) -> serde_json::Value {
    let mut data = data.clone();
    if let Some(map) = data.as_object_mut() {
        map.remove("status");
    }
    data
}

/// Computes the operations that bring `ns` to its target state for `kind`.
///
/// `existing` is the current content of the namespace for that kind. The
/// result is a pure function of the forest, the mode and `existing`, so
/// re-running it against the produced state yields no further operations.
pub fn compute_namespace_ops(
    forest: &Forest,
    ns: &str,
    kind: &KindKey,
    mode: PropagationMode,
    existing: &[DynamicObject],
    overwrite: bool,
) -> Vec<Op> {
    match mode {
        PropagationMode::Ignore => Vec::new(),
        PropagationMode::Remove => existing
            .iter()
            .filter(|o| is_propagated_copy(o))
            .filter_map(|o| o.metadata.name.clone())
            .map(|name| Op::Delete {
                namespace: ns.to_string(),
                name,
            })
            .collect(),
        PropagationMode::Propagate => {
            if forest.crit_ancestor(ns).is_some() {
                debug!(namespace = %ns, %kind, "propagation paused by critical condition");
                return Vec::new();
            }
            let labels = tree_labels(forest, ns);
            let desired: BTreeMap<String, DynamicObject> = forest
                .ancestor_sources(ns, kind)
                .into_iter()
                .filter(|(_, (_, src))| selector_matches(src, &labels))
                .map(|(name, (src_ns, src))| (name, build_copy(&src_ns, &src, ns)))
                .collect();

            let mut ops = Vec::new();
            for (name, built) in &desired {
                match existing
                    .iter()
                    .find(|o| o.metadata.name.as_deref() == Some(name.as_str()))
                {
                    None => ops.push(Op::Upsert {
                        namespace: ns.to_string(),
                        name: name.clone(),
                        object: Box::new(built.clone()),
                    }),
                    Some(current) if is_propagated_copy(current) => {
                        if !copies_equal(built, current) {
                            ops.push(Op::Upsert {
                                namespace: ns.to_string(),
                                name: name.clone(),
                                object: Box::new(built.clone()),
                            });
                        }
                    }
                    Some(_user_object) if overwrite => ops.push(Op::Upsert {
                        namespace: ns.to_string(),
                        name: name.clone(),
                        object: Box::new(built.clone()),
                    }),
                    Some(_user_object) => {
                        let source = built
                            .metadata
                            .annotations
                            .as_ref()
                            .and_then(|a| a.get(meta::INHERITED_FROM))
                            .cloned()
                            .unwrap_or_default();
                        ops.push(Op::Conflict {
                            namespace: ns.to_string(),
                            name: name.clone(),
                            source,
                        });
                    }
                }
            }
            for obj in existing.iter().filter(|o| is_propagated_copy(o)) {
                if let Some(name) = obj.metadata.name.as_deref() {
                    if !desired.contains_key(name) {
                        ops.push(Op::Delete {
                            namespace: ns.to_string(),
                            name: name.to_string(),
                        });
                    }
                }
            }
            ops
        }
    }
}
