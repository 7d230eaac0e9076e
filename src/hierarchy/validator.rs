//! Admission-time validation of hierarchy edits. Only the decision logic
//! lives here; certificate plumbing for the webhook endpoint is out of scope.

use std::fmt;

use crate::forest::Forest;

/// A structural rule an edit would break.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    SelfParent {
        namespace: String,
    },
    Cycle {
        namespace: String,
        parent: String,
    },
    SubnamespaceReparent {
        namespace: String,
    },
    /// Deleting a namespace that still has subnamespaces without cascading
    /// deletion enabled.
    UndeletableSubtree {
        namespace: String,
        children: Vec<String>,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::SelfParent { namespace } => {
                write!(f, "namespace {namespace} cannot be its own parent")
            }
            Violation::Cycle { namespace, parent } => write!(
                f,
                "making {parent} the parent of {namespace} would create a cycle"
            ),
            Violation::SubnamespaceReparent { namespace } => write!(
                f,
                "{namespace} is a subnamespace; its parent is fixed by its anchor"
            ),
            Violation::UndeletableSubtree {
                namespace,
                children,
            } => write!(
                f,
                "namespace {namespace} still has subnamespaces ({}) and does not allow cascading deletion",
                children.join(", ")
            ),
        }
    }
}

/// Checks a proposed parent change against the current forest. Walking up
/// from the proposed parent must not reach the namespace being edited.
pub fn validate_parent_change(
    forest: &Forest,
    ns: &str,
    new_parent: Option<&str>,
) -> Result<(), Violation> {
    let parent = match new_parent {
        Some(p) if !p.is_empty() => p,
        _ => return Ok(()),
    };
    if parent == ns {
        return Err(Violation::SelfParent {
            namespace: ns.to_string(),
        });
    }
    if let Some(node) = forest.node(ns) {
        if node.is_subnamespace && node.parent.as_deref() != Some(parent) {
            return Err(Violation::SubnamespaceReparent {
                namespace: ns.to_string(),
            });
        }
    }
    if forest.is_ancestor(ns, parent) {
        return Err(Violation::Cycle {
            namespace: ns.to_string(),
            parent: parent.to_string(),
        });
    }
    Ok(())
}

/// Checks whether a namespace may be deleted: subnamespace children pin it
/// unless cascading deletion is allowed somewhere up the chain.
pub fn validate_namespace_delete(forest: &Forest, ns: &str) -> Result<(), Violation> {
    let node = match forest.node(ns) {
        Some(n) => n,
        None => return Ok(()),
    };
    let sub_children: Vec<String> = node
        .children
        .iter()
        .filter(|c| {
            forest
                .node(c)
                .map(|n| n.is_subnamespace)
                .unwrap_or(false)
        })
        .cloned()
        .collect();
    if sub_children.is_empty() || forest.allows_cascading_delete(ns) {
        return Ok(());
    }
    Err(Violation::UndeletableSubtree {
        namespace: ns.to_string(),
        children: sub_children,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forest_chain(chain: &[&str]) -> Forest {
        let mut f = Forest::new();
        for pair in chain.windows(2) {
            f.get(pair[0]).exists = true;
            f.get(pair[1]).exists = true;
            f.set_parent(pair[1], Some(pair[0])).expect("edge");
        }
        f
    }

    #[test]
    fn accepts_valid_edits() {
        let mut f = forest_chain(&["a", "b"]);
        f.get("c").exists = true;
        assert!(validate_parent_change(&f, "c", Some("b")).is_ok());
        assert!(validate_parent_change(&f, "b", None).is_ok());
        assert!(validate_parent_change(&f, "b", Some("")).is_ok());
    }

    #[test]
    fn rejects_self_and_cycles() {
        let f = forest_chain(&["a", "b", "c"]);
        assert_eq!(
            validate_parent_change(&f, "a", Some("a")),
            Err(Violation::SelfParent {
                namespace: "a".into()
            })
        );
        assert_eq!(
            validate_parent_change(&f, "a", Some("c")),
            Err(Violation::Cycle {
                namespace: "a".into(),
                parent: "c".into()
            })
        );
    }

    #[test]
    fn rejects_subnamespace_reparent() {
        let mut f = forest_chain(&["team", "dev"]);
        f.get("dev").is_subnamespace = true;
        assert!(matches!(
            validate_parent_change(&f, "dev", Some("other")),
            Err(Violation::SubnamespaceReparent { .. })
        ));
        // Restating the current parent is fine.
        assert!(validate_parent_change(&f, "dev", Some("team")).is_ok());
    }

    #[test]
    fn delete_blocked_by_subnamespace_children() {
        let mut f = forest_chain(&["team", "dev"]);
        f.get("dev").is_subnamespace = true;
        assert!(matches!(
            validate_namespace_delete(&f, "team"),
            Err(Violation::UndeletableSubtree { .. })
        ));
        f.get("team").allow_cascading_delete = true;
        assert!(validate_namespace_delete(&f, "team").is_ok());
    }
}
