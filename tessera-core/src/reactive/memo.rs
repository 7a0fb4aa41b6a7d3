//! Memo Implementation
//!
//! A Memo is a cached derived value. Its compute function reads other nodes
//! through the ecosystem; every such read becomes an edge, and the memo is
//! re-evaluated whenever one of those sources changes.
//!
//! # Change Detection
//!
//! The new result is compared with the cached one using `PartialEq`. An
//! equal result keeps the cached value and does not schedule any observer,
//! so a change that does not affect the memo's output stops propagating
//! here.
//!
//! # Lifetime
//!
//! Memos are destroyed as soon as their last observer leaves (`Ttl::Immediate`),
//! unless configured otherwise.

use std::any::Any;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use super::template::{Template, TemplateId};
use crate::ecosystem::Ecosystem;
use crate::error::Result;
use crate::graph::{AnyValue, GraphNode, NodeRef, Ttl};

type Compute<T, P> = Arc<dyn Fn(&Ecosystem, &P) -> Result<T> + Send + Sync>;

/// Template of a derived value.
///
/// # Example
///
/// ```rust,ignore
/// let count = Signal::new("count", 2);
/// let doubled = Memo::new("doubled", {
///     let count = count.clone();
///     move |ecosystem| Ok(ecosystem.get(&count)? * 2)
/// });
///
/// assert_eq!(ecosystem.get(&doubled)?, 4);
/// ```
pub struct Memo<T, P = ()> {
    key: Arc<str>,
    id: TemplateId,
    compute: Compute<T, P>,
    ttl: Ttl,
}

impl<T> Memo<T, ()>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new<F>(key: &str, compute: F) -> Self
    where
        F: Fn(&Ecosystem) -> Result<T> + Send + Sync + 'static,
    {
        Self::family(key, move |ecosystem, _: &()| compute(ecosystem))
    }
}

impl<T, P> Memo<T, P>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    P: Serialize + Clone + Send + Sync + 'static,
{
    pub fn family<F>(key: &str, compute: F) -> Self
    where
        F: Fn(&Ecosystem, &P) -> Result<T> + Send + Sync + 'static,
    {
        Self {
            key: key.into(),
            id: TemplateId::new(),
            compute: Arc::new(compute),
            ttl: Ttl::Immediate,
        }
    }

    pub fn with_ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = ttl;
        self
    }
}

impl<T, P> Clone for Memo<T, P> {
    fn clone(&self) -> Self {
        Self {
            key: Arc::clone(&self.key),
            id: self.id,
            compute: Arc::clone(&self.compute),
            ttl: self.ttl.clone(),
        }
    }
}

impl<T, P> Template for Memo<T, P>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    P: Serialize + Clone + Send + Sync + 'static,
{
    type Params = P;
    type Output = T;

    fn key(&self) -> &str {
        &self.key
    }

    fn template_id(&self) -> TemplateId {
        self.id
    }

    fn instantiate(&self, _node: &NodeRef, params: P) -> Arc<dyn GraphNode> {
        Arc::new(MemoNode {
            params,
            compute: Arc::clone(&self.compute),
            ttl: self.ttl.clone(),
            value: RwLock::new(None),
        })
    }
}

struct MemoNode<T, P> {
    params: P,
    compute: Compute<T, P>,
    ttl: Ttl,
    value: RwLock<Option<Arc<T>>>,
}

impl<T, P> GraphNode for MemoNode<T, P>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    P: Send + Sync + 'static,
{
    fn evaluate(&self, ecosystem: &Ecosystem) -> Result<bool> {
        // the lock is not held while computing; compute may read other nodes
        let next = (self.compute)(ecosystem, &self.params)?;
        let mut slot = self.value.write();
        if slot.as_deref() == Some(&next) {
            return Ok(false);
        }
        *slot = Some(Arc::new(next));
        Ok(true)
    }

    fn value(&self) -> Option<AnyValue> {
        self.value.read().clone().map(|value| value as AnyValue)
    }

    fn ttl(&self) -> Ttl {
        self.ttl.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::Error;
    use crate::graph::NodeId;

    #[test]
    fn equal_results_are_not_changes() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let memo = Memo::new("constant", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok("same".to_string())
        });
        let node = memo.instantiate(&NodeRef::new(NodeId::new(), "constant"), ());
        let ecosystem = Ecosystem::new(Default::default());

        assert!(node.evaluate(&ecosystem).unwrap());
        assert!(!node.evaluate(&ecosystem).unwrap());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(matches!(node.ttl(), Ttl::Immediate));
    }

    #[test]
    fn failures_keep_the_previous_value() {
        let fail = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = fail.clone();
        let memo = Memo::new("fallible", move |_| {
            if flag.load(Ordering::SeqCst) {
                Err(Error::msg("boom"))
            } else {
                Ok(1_u32)
            }
        });
        let node = memo.instantiate(&NodeRef::new(NodeId::new(), "fallible"), ());
        let ecosystem = Ecosystem::new(Default::default());

        node.evaluate(&ecosystem).unwrap();
        fail.store(true, Ordering::SeqCst);
        assert!(node.evaluate(&ecosystem).is_err());
        assert_eq!(node.value().unwrap().downcast_ref::<u32>(), Some(&1));
    }
}
