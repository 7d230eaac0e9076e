//! The in-memory namespace forest: every namespace the controller has heard
//! of, its parent/child edges, conditions and source objects. The whole
//! structure lives behind one mutex; callers take the lock, do their walks
//! and release it before touching the apiserver.

pub mod conditions;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use kube::core::DynamicObject;
use serde::Serialize;

use crate::api::{KindKey, meta};
use crate::errors::Error;

pub use conditions::{Affect, ClearCriterion, Code, Condition};

/// The forest is shared process-wide behind a single mutex.
pub type SharedForest = std::sync::Arc<tokio::sync::Mutex<Forest>>;

/// One namespace vertex. Nodes are synthesized for forward references (a
/// child naming a parent we have not observed yet) and garbage-collected by
/// [`Forest::clean`] once nothing points at them.
#[derive(Debug, Clone, Default)]
pub struct Node {
    pub parent: Option<String>,
    pub children: BTreeSet<String>,
    /// Whether the backing namespace has actually been observed.
    pub exists: bool,
    /// Created from an anchor in the parent; may not be reparented.
    pub is_subnamespace: bool,
    pub allow_cascading_delete: bool,
    /// Managing controller tag; anything but the default means external.
    pub manager: String,
    /// Ancestor tag to depth, non-empty iff the tree is external.
    pub external_tree_labels: BTreeMap<String, usize>,
    /// Anchor names declared inside this namespace.
    pub anchors: Vec<String>,
    conditions: BTreeMap<(Code, String), Condition>,
    source_objects: HashMap<KindKey, BTreeMap<String, DynamicObject>>,
}

impl Node {
    pub fn is_external(&self) -> bool {
        !self.manager.is_empty() && self.manager != meta::DEFAULT_MANAGER
    }

    pub fn has_local_crit_condition(&self) -> bool {
        self.conditions.keys().any(|(code, _)| code.is_critical())
    }

    pub fn conditions(&self) -> impl Iterator<Item = &Condition> {
        self.conditions.values()
    }

    pub fn has_condition(&self, code: Code) -> bool {
        self.conditions.keys().any(|(c, _)| *c == code)
    }

    pub fn set_condition(&mut self, mut cond: Condition) {
        let key = (cond.code, cond.affect.to_string());
        // Re-observing the same problem keeps the original timestamp so the
        // status write-back stays a no-op.
        if let Some(existing) = self.conditions.get(&key) {
            if existing.same_as(&cond) {
                cond.set_at = existing.set_at.clone();
            }
        }
        self.conditions.insert(key, cond);
    }

    pub fn clear_condition_code(&mut self, code: Code) {
        self.conditions.retain(|(c, _), _| *c != code);
    }

    pub fn clear_conditions_where(&mut self, pred: impl Fn(&Condition) -> bool) {
        self.conditions.retain(|_, cond| !pred(cond));
    }

    fn is_empty(&self) -> bool {
        !self.exists && self.children.is_empty() && self.conditions.is_empty()
    }
}

/// Serializable snapshot of one node, served on the diagnostic endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct NamespaceView {
    pub name: String,
    pub parent: Option<String>,
    pub children: Vec<String>,
    pub exists: bool,
    pub is_subnamespace: bool,
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Default)]
pub struct Forest {
    nodes: HashMap<String, Node>,
}

impl Forest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the node for `name`, creating a placeholder if absent.
    pub fn get(&mut self, name: &str) -> &mut Node {
        self.nodes.entry(name.to_string()).or_insert_with(|| Node {
            manager: meta::DEFAULT_MANAGER.to_string(),
            ..Node::default()
        })
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.nodes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Root-to-self chain of namespace names.
    pub fn ancestry_names(&self, name: &str) -> Vec<String> {
        let mut chain = vec![name.to_string()];
        let mut seen: HashSet<String> = chain.iter().cloned().collect();
        let mut current = name;
        while let Some(parent) = self.nodes.get(current).and_then(|n| n.parent.as_deref()) {
            if !seen.insert(parent.to_string()) {
                break;
            }
            chain.push(parent.to_string());
            current = parent;
        }
        chain.reverse();
        chain
    }

    /// Pre-order list of all strict descendants, children sorted by name.
    pub fn descendant_names(&self, name: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack: Vec<String> = match self.nodes.get(name) {
            Some(n) => n.children.iter().rev().cloned().collect(),
            None => return out,
        };
        let mut seen = HashSet::new();
        while let Some(next) = stack.pop() {
            if !seen.insert(next.clone()) {
                continue;
            }
            if let Some(n) = self.nodes.get(&next) {
                for child in n.children.iter().rev() {
                    stack.push(child.clone());
                }
            }
            out.push(next);
        }
        out
    }

    /// Whether `ancestor` appears strictly above `name`.
    pub fn is_ancestor(&self, ancestor: &str, name: &str) -> bool {
        if ancestor == name {
            return false;
        }
        self.ancestry_names(name).iter().any(|a| a == ancestor)
    }

    /// Nearest namespace (including `name` itself) with a local critical
    /// condition, walking towards the root.
    pub fn crit_ancestor(&self, name: &str) -> Option<String> {
        self.ancestry_names(name)
            .into_iter()
            .rev()
            .find(|ns| {
                self.nodes
                    .get(ns)
                    .map(|n| n.has_local_crit_condition())
                    .unwrap_or(false)
            })
    }

    /// Re-points `name` at `new_parent`, keeping both children sets in step.
    ///
    /// Rejected when the edge would close a cycle or when `name` is a
    /// subnamespace being moved away from its anchor parent. The forest is
    /// left untouched on rejection.
    pub fn set_parent(&mut self, name: &str, new_parent: Option<&str>) -> Result<(), Error> {
        if new_parent == Some(name) {
            return Err(Error::InvalidConfig(format!(
                "namespace {name} cannot be its own parent"
            )));
        }
        let node = self.get(name);
        let old_parent = node.parent.clone();
        if old_parent.as_deref() == new_parent {
            return Ok(());
        }
        if node.is_subnamespace && old_parent.is_some() {
            return Err(Error::InvalidConfig(format!(
                "subnamespace {name} cannot change its parent"
            )));
        }
        if let Some(p) = new_parent {
            // Walking up from the proposed parent must not reach `name`.
            if p == name || self.is_ancestor(name, p) {
                return Err(Error::InvalidConfig(format!(
                    "setting the parent of {name} to {p} would create a cycle"
                )));
            }
        }

        if let Some(old) = &old_parent {
            if let Some(op) = self.nodes.get_mut(old) {
                op.children.remove(name);
            }
        }
        if let Some(p) = new_parent {
            self.get(p).children.insert(name.to_string());
        }
        self.get(name).parent = new_parent.map(String::from);
        if let Some(old) = old_parent {
            self.clean(&old);
        }
        Ok(())
    }

    /// Marks the backing namespace as gone: the node loses its parent edge
    /// and is garbage-collected once no children or conditions keep it alive.
    pub fn unset_exists(&mut self, name: &str) {
        let old_parent = match self.nodes.get_mut(name) {
            Some(node) => {
                node.exists = false;
                node.is_subnamespace = false;
                node.source_objects.clear();
                node.parent.take()
            }
            None => return,
        };
        if let Some(parent) = &old_parent {
            if let Some(p) = self.nodes.get_mut(parent) {
                p.children.remove(name);
            }
            self.clean(parent);
        }
        self.clean(name);
    }

    /// Removes a placeholder node once nothing references it.
    fn clean(&mut self, name: &str) {
        if let Some(node) = self.nodes.get(name) {
            if node.is_empty() {
                self.nodes.remove(name);
            }
        }
    }

    /// True iff any node in the ancestry (self included) allows cascading
    /// deletion; subnamespaces inherit the setting through the chain.
    pub fn allows_cascading_delete(&self, name: &str) -> bool {
        self.ancestry_names(name).iter().any(|ns| {
            self.nodes
                .get(ns)
                .map(|n| n.allow_cascading_delete)
                .unwrap_or(false)
        })
    }

    /// Drops conditions whose clear criterion no longer holds for `name`:
    /// `Ancestor`-scoped ones once the affected namespace left the ancestry,
    /// `Subtree`-scoped ones once it left the subtree.
    pub fn clear_obsolete_conditions(&mut self, name: &str) {
        let ancestors: HashSet<String> = self.ancestry_names(name).into_iter().collect();
        let subtree: HashSet<String> = self
            .descendant_names(name)
            .into_iter()
            .chain([name.to_string()])
            .collect();
        if let Some(node) = self.nodes.get_mut(name) {
            node.conditions.retain(|(code, _), cond| {
                match code.clear_criterion() {
                    ClearCriterion::Manual => true,
                    ClearCriterion::Ancestor => ancestors.contains(cond.affect.namespace()),
                    ClearCriterion::Subtree => subtree.contains(cond.affect.namespace()),
                }
            });
        }
    }

    pub fn set_source_object(&mut self, ns: &str, kind: &KindKey, name: &str, obj: DynamicObject) {
        self.get(ns)
            .source_objects
            .entry(kind.clone())
            .or_default()
            .insert(name.to_string(), obj);
    }

    pub fn remove_source_object(&mut self, ns: &str, kind: &KindKey, name: &str) {
        if let Some(node) = self.nodes.get_mut(ns) {
            if let Some(by_name) = node.source_objects.get_mut(kind) {
                by_name.remove(name);
                if by_name.is_empty() {
                    node.source_objects.remove(kind);
                }
            }
        }
    }

    pub fn source_objects(&self, ns: &str, kind: &KindKey) -> Vec<&DynamicObject> {
        self.nodes
            .get(ns)
            .and_then(|n| n.source_objects.get(kind))
            .map(|m| m.values().collect())
            .unwrap_or_default()
    }

    /// Source objects visible to `ns` from its strict ancestors, walked
    /// root-down so that on a name clash the nearest ancestor wins.
    pub fn ancestor_sources(&self, ns: &str, kind: &KindKey) -> BTreeMap<String, (String, DynamicObject)> {
        let mut out = BTreeMap::new();
        let ancestry = self.ancestry_names(ns);
        for ancestor in ancestry.iter().filter(|a| a.as_str() != ns) {
            if let Some(node) = self.nodes.get(ancestor) {
                if let Some(objs) = node.source_objects.get(kind) {
                    for (name, obj) in objs {
                        out.insert(name.clone(), (ancestor.clone(), obj.clone()));
                    }
                }
            }
        }
        out
    }

    /// Snapshot of every node for the diagnostic endpoint, sorted by name.
    pub fn snapshot(&self) -> Vec<NamespaceView> {
        let mut views: Vec<NamespaceView> = self
            .nodes
            .iter()
            .map(|(name, node)| NamespaceView {
                name: name.clone(),
                parent: node.parent.clone(),
                children: node.children.iter().cloned().collect(),
                exists: node.exists,
                is_subnamespace: node.is_subnamespace,
                conditions: node.conditions.values().cloned().collect(),
            })
            .collect();
        views.sort_by(|a, b| a.name.cmp(&b.name));
        views
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forest_with_chain(chain: &[&str]) -> Forest {
        let mut f = Forest::new();
        for pair in chain.windows(2) {
            f.get(pair[0]).exists = true;
            f.get(pair[1]).exists = true;
            f.set_parent(pair[1], Some(pair[0])).expect("valid edge");
        }
        f
    }

    /// children[p] contains c iff c.parent == p, over every node.
    fn assert_edges_consistent(f: &Forest) {
        for name in f.names() {
            let node = f.node(&name).expect("listed node exists");
            if let Some(parent) = &node.parent {
                assert!(
                    f.node(parent).expect("parent node").children.contains(&name),
                    "{parent} should list {name} as a child"
                );
            }
            for child in &node.children {
                assert_eq!(
                    f.node(child).expect("child node").parent.as_deref(),
                    Some(name.as_str()),
                    "{child} should point back at {name}"
                );
            }
        }
    }

    #[test]
    fn ancestry_is_root_to_self() {
        let f = forest_with_chain(&["org", "team", "dev"]);
        assert_eq!(f.ancestry_names("dev"), vec!["org", "team", "dev"]);
        assert_eq!(f.ancestry_names("org"), vec!["org"]);
        assert_edges_consistent(&f);
    }

    #[test]
    fn descendants_are_preorder_sorted() {
        let mut f = forest_with_chain(&["org", "team"]);
        f.set_parent("b", Some("team")).expect("edge");
        f.set_parent("a", Some("team")).expect("edge");
        f.set_parent("a1", Some("a")).expect("edge");
        assert_eq!(f.descendant_names("org"), vec!["team", "a", "a1", "b"]);
    }

    #[test]
    fn set_parent_rejects_cycles_and_keeps_state() {
        let mut f = forest_with_chain(&["a", "b", "c"]);
        let before = f.ancestry_names("c");
        let err = f.set_parent("a", Some("c")).expect_err("cycle must fail");
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert_eq!(f.ancestry_names("c"), before);
        assert!(f.node("a").expect("a").parent.is_none());
        assert_edges_consistent(&f);
    }

    #[test]
    fn set_parent_rejects_self() {
        let mut f = Forest::new();
        assert!(f.set_parent("a", Some("a")).is_err());
    }

    #[test]
    fn subnamespace_cannot_be_reparented() {
        let mut f = forest_with_chain(&["team", "dev"]);
        f.get("dev").is_subnamespace = true;
        assert!(f.set_parent("dev", Some("other")).is_err());
        assert_eq!(f.node("dev").expect("dev").parent.as_deref(), Some("team"));
    }

    #[test]
    fn reparent_moves_child_sets() {
        let mut f = forest_with_chain(&["a", "b"]);
        f.get("c").exists = true;
        f.set_parent("b", Some("c")).expect("reparent");
        assert!(!f.node("a").expect("a").children.contains("b"));
        assert!(f.node("c").expect("c").children.contains("b"));
        assert_edges_consistent(&f);
    }

    #[test]
    fn placeholder_nodes_are_garbage_collected() {
        let mut f = Forest::new();
        // "child" references "ghost" before the namespace was seen.
        f.set_parent("child", Some("ghost")).expect("edge");
        assert!(f.contains("ghost"));
        f.unset_exists("child");
        assert!(!f.contains("child"), "child had nothing keeping it alive");
        assert!(!f.contains("ghost"), "ghost lost its last child");
    }

    #[test]
    fn existing_nodes_survive_clean() {
        let mut f = forest_with_chain(&["a", "b"]);
        f.unset_exists("b");
        assert!(f.contains("a"), "a still exists");
        assert!(!f.contains("b"));
    }

    #[test]
    fn node_with_conditions_is_not_collected() {
        let mut f = Forest::new();
        f.get("a").set_condition(Condition::new(
            Code::CritCycle,
            Affect::Namespace("a".into()),
            "cycle",
        ));
        f.unset_exists("a");
        assert!(f.contains("a"));
    }

    #[test]
    fn crit_ancestor_walks_up() {
        let mut f = forest_with_chain(&["org", "team", "dev"]);
        assert_eq!(f.crit_ancestor("dev"), None);
        f.get("team").set_condition(Condition::new(
            Code::CritParentMissing,
            Affect::Namespace("ghost".into()),
            "missing",
        ));
        assert_eq!(f.crit_ancestor("dev").as_deref(), Some("team"));
        assert_eq!(f.crit_ancestor("team").as_deref(), Some("team"));
        assert_eq!(f.crit_ancestor("org"), None);
    }

    #[test]
    fn cascading_delete_inherits_through_chain() {
        let mut f = forest_with_chain(&["org", "team", "dev"]);
        f.get("team").is_subnamespace = true;
        f.get("dev").is_subnamespace = true;
        assert!(!f.allows_cascading_delete("dev"));
        f.get("org").allow_cascading_delete = true;
        assert!(f.allows_cascading_delete("dev"));
    }

    #[test]
    fn obsolete_ancestor_conditions_are_cleared() {
        let mut f = forest_with_chain(&["org", "team", "dev"]);
        f.get("dev").set_condition(Condition::new(
            Code::AncestorHaltedActivities,
            Affect::Namespace("org".into()),
            "halted",
        ));
        f.clear_obsolete_conditions("dev");
        assert!(f.node("dev").expect("dev").has_condition(Code::AncestorHaltedActivities));

        // Detach the subtree; org is no longer an ancestor of dev.
        f.set_parent("team", None).expect("detach");
        f.clear_obsolete_conditions("dev");
        assert!(!f.node("dev").expect("dev").has_condition(Code::AncestorHaltedActivities));
    }

    #[test]
    fn ancestor_sources_prefer_nearest() {
        let mut f = forest_with_chain(&["org", "team", "dev"]);
        let kind = KindKey::core("ConfigMap");
        let far = DynamicObject::new("cm", &kube::core::ApiResource {
            group: "".into(),
            version: "v1".into(),
            api_version: "v1".into(),
            kind: "ConfigMap".into(),
            plural: "configmaps".into(),
        });
        let near = far.clone();
        f.set_source_object("org", &kind, "cm", far);
        f.set_source_object("team", &kind, "cm", near);
        let sources = f.ancestor_sources("dev", &kind);
        assert_eq!(sources.len(), 1);
        assert_eq!(sources.get("cm").expect("cm").0, "team");
        // Objects in dev itself are not their own ancestors.
        assert!(f.ancestor_sources("team", &kind).contains_key("cm"));
        assert_eq!(f.ancestor_sources("org", &kind).len(), 0);
    }
}
