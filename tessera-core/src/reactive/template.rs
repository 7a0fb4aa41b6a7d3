//! Templates describe how to create nodes.
//!
//! A template has a key and produces one node per distinct params value. The
//! node id is derived from the key and the serialized params, so asking for
//! the same template with equal params returns the same node.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::graph::{GraphNode, NodeRef};

/// Identity of a template instance. Two templates sharing a key but not an
/// identity collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TemplateId(u64);

impl TemplateId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TemplateId {
    fn default() -> Self {
        Self::new()
    }
}

/// A factory of graph nodes.
pub trait Template: Send + Sync + 'static {
    /// Params distinguishing instances. `()` for singletons.
    type Params: Serialize + Clone + Send + Sync + 'static;

    /// Value type read from instances.
    type Output: Clone + Send + Sync + 'static;

    fn key(&self) -> &str;

    fn template_id(&self) -> TemplateId;

    /// Build the node body for one instance.
    fn instantiate(&self, node: &NodeRef, params: Self::Params) -> Arc<dyn GraphNode>;
}

/// Shared value that hashes by identity when used in params.
///
/// Params are hashed structurally through serde. Wrapping a large or
/// non-serializable value in a `Ref` makes it contribute only its identity,
/// so two structurally equal but distinct values produce distinct nodes.
pub struct Ref<T> {
    id: u64,
    value: Arc<T>,
}

impl<T> Ref<T> {
    pub fn new(value: T) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self {
            id: COUNTER.fetch_add(1, Ordering::Relaxed),
            value: Arc::new(value),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            value: Arc::clone(&self.value),
        }
    }
}

impl<T> Deref for Ref<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> PartialEq for Ref<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Ref<T> {}

impl<T> Hash for Ref<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T: fmt::Debug> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ref")
            .field("id", &self.id)
            .field("value", &self.value)
            .finish()
    }
}

impl<T> Serialize for Ref<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("@ref", &self.id)?;
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refs_serialize_by_identity() {
        let a = Ref::new(vec![1, 2, 3]);
        let b = Ref::new(vec![1, 2, 3]);

        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert_ne!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn template_ids_are_unique() {
        assert_ne!(TemplateId::new(), TemplateId::new());
    }
}
