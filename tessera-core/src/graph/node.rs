//! Graph Nodes
//!
//! This module defines the node handles, lifecycle states and the contract
//! every node kind implements. The engine only talks to node kinds through
//! [`GraphNode`]; everything else about a node (edges, weight, pending
//! reasons) lives in the engine-side [`NodeEntry`].

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexSet;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use smallvec::SmallVec;

use super::reason::Reason;
use super::scheduler::JobKind;
use crate::ecosystem::timer::{CancelHandle, DeferralSignal};
use crate::ecosystem::Ecosystem;
use crate::error::Result;
use crate::reactive::TemplateId;

/// Type-erased node value.
pub type AnyValue = Arc<dyn Any + Send + Sync>;

/// Handle of a node in the graph.
///
/// Handles are never reused, so a handle to a destroyed node can never
/// alias a newer node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node handle.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw handle value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle plus the node's stable, human readable id.
///
/// Serializes by identity (its id), so node references can be used inside
/// template params without hashing the referenced node's contents.
#[derive(Clone)]
pub struct NodeRef {
    handle: NodeId,
    id: Arc<str>,
}

impl NodeRef {
    pub(crate) fn new(handle: NodeId, id: impl Into<Arc<str>>) -> Self {
        Self {
            handle,
            id: id.into(),
        }
    }

    /// The stable string id (template key plus hashed params).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The engine handle.
    pub fn handle(&self) -> NodeId {
        self.handle
    }
}

impl PartialEq for NodeRef {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl Eq for NodeRef {}

impl Hash for NodeRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.handle.hash(state);
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeRef({} #{})", self.id, self.handle.0)
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl Serialize for NodeRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("@node", &*self.id)?;
        map.end()
    }
}

/// Lifecycle status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Registered, first evaluation not finished yet.
    Initializing,
    /// Evaluated and alive.
    Active,
    /// Unobserved; destruction is pending behind its ttl.
    Stale,
    /// Removed from the graph. Terminal.
    Destroyed,
}

/// How long a node survives once nothing observes it.
#[derive(Clone, Default)]
pub enum Ttl {
    /// Never destroyed by refcount; only by force.
    #[default]
    Forever,
    /// Destroyed by the next flush after its last observer leaves.
    Immediate,
    /// Destroyed once the delay elapses without a new observer.
    After(Duration),
    /// Destroyed once the external signal settles without a new observer.
    Until(Arc<dyn DeferralSignal>),
}

impl fmt::Debug for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forever => f.write_str("Forever"),
            Self::Immediate => f.write_str("Immediate"),
            Self::After(delay) => f.debug_tuple("After").field(delay).finish(),
            Self::Until(_) => f.write_str("Until(..)"),
        }
    }
}

/// Contract every node kind implements.
///
/// `evaluate` runs inside an evaluation context: every tracked read it
/// performs through the ecosystem becomes an edge once it returns `Ok`.
///
/// `value` may be called with the engine lock held and must not call back
/// into the ecosystem. `ttl` and `job_kind` are read once at registration.
/// Every other hook runs with no engine lock held.
pub trait GraphNode: Send + Sync + 'static {
    /// Compute the node's value. Returns whether the value changed according
    /// to the node's own equality policy.
    fn evaluate(&self, ecosystem: &Ecosystem) -> Result<bool>;

    /// Current value, if the node has produced one.
    fn value(&self) -> Option<AnyValue>;

    /// Destruction deferral once unobserved.
    fn ttl(&self) -> Ttl {
        Ttl::Forever
    }

    /// Scheduler class of this node's re-evaluation jobs.
    fn job_kind(&self) -> JobKind {
        JobKind::Evaluate
    }

    /// Accept a direct write. `None` means the kind is not writable with
    /// this value; otherwise returns whether the value changed.
    fn write(&self, _value: AnyValue) -> Option<bool> {
        None
    }

    /// Serializable snapshot of the current value, if the kind persists.
    fn dehydrate(&self) -> Result<Option<serde_json::Value>> {
        Ok(None)
    }

    /// Replace the value from a snapshot. Returns whether the value changed.
    fn hydrate(&self, _value: serde_json::Value) -> Result<bool> {
        Ok(false)
    }

    /// Called once after the node left the graph.
    fn destroy(&self) {}

    /// Downcasting support for kind-specific inspection.
    fn as_any(&self) -> &dyn Any;
}

/// Engine-side record of a node.
pub(crate) struct NodeEntry {
    pub(crate) node: NodeRef,
    pub(crate) template_key: Arc<str>,
    pub(crate) template_id: TemplateId,
    pub(crate) body: Arc<dyn GraphNode>,
    pub(crate) status: NodeStatus,
    pub(crate) ttl: Ttl,
    pub(crate) job_kind: JobKind,
    pub(crate) weight: u32,
    pub(crate) sources: IndexSet<NodeId>,
    pub(crate) observers: IndexSet<NodeId>,
    /// Reasons accumulated since the last evaluation was scheduled.
    pub(crate) reasons: SmallVec<[Reason; 2]>,
    /// Reasons consumed by the most recent evaluation.
    pub(crate) last_reasons: Vec<Reason>,
    /// Changes written directly to this node, waiting to inform observers.
    pub(crate) outbound: Vec<Reason>,
    pub(crate) deferral: Option<CancelHandle>,
}

impl NodeEntry {
    pub(crate) fn new(
        node: NodeRef,
        template_key: impl Into<Arc<str>>,
        template_id: TemplateId,
        body: Arc<dyn GraphNode>,
    ) -> Self {
        let ttl = body.ttl();
        let job_kind = body.job_kind();
        Self {
            node,
            template_key: template_key.into(),
            template_id,
            body,
            status: NodeStatus::Initializing,
            ttl,
            job_kind,
            weight: 1,
            sources: IndexSet::new(),
            observers: IndexSet::new(),
            reasons: SmallVec::new(),
            last_reasons: Vec::new(),
            outbound: Vec::new(),
            deferral: None,
        }
    }

    pub(crate) fn handle(&self) -> NodeId {
        self.node.handle()
    }

    pub(crate) fn id(&self) -> &str {
        self.node.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_are_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();
        assert_ne!(id1, id2);
        assert!(id2.raw() > id1.raw());
    }

    #[test]
    fn node_refs_compare_by_handle() {
        let handle = NodeId::new();
        let a = NodeRef::new(handle, "count");
        let b = NodeRef::new(handle, "count");
        let c = NodeRef::new(NodeId::new(), "count");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn node_refs_serialize_by_identity() {
        let node = NodeRef::new(NodeId::new(), "user-\"ada\"");
        let json = serde_json::to_string(&node).unwrap();
        assert_eq!(json, r#"{"@node":"user-\"ada\""}"#);
    }

    #[test]
    fn ttl_defaults_to_forever() {
        assert!(matches!(Ttl::default(), Ttl::Forever));
        assert_eq!(
            format!("{:?}", Ttl::After(Duration::from_secs(1))),
            "After(1s)"
        );
    }
}
