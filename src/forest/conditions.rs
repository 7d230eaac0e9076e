//! Condition vocabulary for namespace nodes. Codes whose name starts with
//! `Crit` block propagation from and through the node that carries them.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Code {
    /// An ancestor carries a critical condition; activities here are halted.
    AncestorHaltedActivities,
    /// A propagated copy could not be written into a descendant.
    CannotPropagate,
    /// The requested parent would create a cycle.
    CritCycle,
    /// The declared parent namespace does not exist.
    CritParentMissing,
    /// A hierarchy edit was structurally invalid (self-parent, subnamespace
    /// reparent).
    InvalidConfig,
    /// The configuration singleton names a mode we do not understand.
    InvalidMode,
    /// A subnamespace whose parent no longer declares a matching anchor.
    SubnamespaceAnchorMissing,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::AncestorHaltedActivities => "AncestorHaltedActivities",
            Code::CannotPropagate => "CannotPropagate",
            Code::CritCycle => "CritCycle",
            Code::CritParentMissing => "CritParentMissing",
            Code::InvalidConfig => "InvalidConfig",
            Code::InvalidMode => "InvalidMode",
            Code::SubnamespaceAnchorMissing => "SubnamespaceAnchorMissing",
        }
    }

    pub fn is_critical(&self) -> bool {
        self.as_str().starts_with("Crit")
    }

    /// When a condition with this code may be dropped again.
    pub fn clear_criterion(&self) -> ClearCriterion {
        match self {
            Code::AncestorHaltedActivities => ClearCriterion::Ancestor,
            Code::CannotPropagate => ClearCriterion::Subtree,
            _ => ClearCriterion::Manual,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Clear-criteria taxonomy: `Manual` conditions are only removed by whoever
/// set them, `Ancestor` ones fall away once the affected namespace is no
/// longer an ancestor, `Subtree` ones once it leaves the subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearCriterion {
    Manual,
    Ancestor,
    Subtree,
}

/// What a condition is about: the namespace itself, another namespace, or a
/// concrete object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Affect {
    Namespace(String),
    Object {
        kind: String,
        namespace: String,
        name: String,
    },
}

impl Affect {
    pub fn object(kind: impl Into<String>, ns: impl Into<String>, name: impl Into<String>) -> Self {
        Affect::Object {
            kind: kind.into(),
            namespace: ns.into(),
            name: name.into(),
        }
    }

    /// The namespace the clear criteria are evaluated against.
    pub fn namespace(&self) -> &str {
        match self {
            Affect::Namespace(ns) => ns,
            Affect::Object { namespace, .. } => namespace,
        }
    }
}

impl fmt::Display for Affect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Affect::Namespace(ns) => write!(f, "{ns}"),
            Affect::Object {
                kind,
                namespace,
                name,
            } => write!(f, "{kind}/{namespace}/{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Condition {
    pub code: Code,
    pub affect: Affect,
    pub message: String,
    /// RFC 3339 timestamp of when the condition was first observed.
    pub set_at: String,
}

impl Condition {
    pub fn new(code: Code, affect: Affect, message: impl Into<String>) -> Self {
        Self {
            code,
            affect,
            message: message.into(),
            set_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Same problem as `other`, ignoring when it was observed.
    pub fn same_as(&self, other: &Condition) -> bool {
        self.code == other.code && self.affect == other.affect && self.message == other.message
    }
}
