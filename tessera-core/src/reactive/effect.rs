//! Effect Implementation
//!
//! An Effect runs a side-effecting function whenever one of the nodes it read
//! changes. Its re-runs are scheduled in the side-effect job class, so they
//! only start once every pending re-evaluation and external notification of
//! the flush has run and the graph is consistent.
//!
//! The node's value is its run count.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;

use super::template::{Template, TemplateId};
use crate::ecosystem::Ecosystem;
use crate::error::Result;
use crate::graph::{AnyValue, GraphNode, JobKind, NodeRef, Ttl};

type Run<P> = Arc<dyn Fn(&Ecosystem, &P) -> Result<()> + Send + Sync>;

/// Template of a side effect.
pub struct Effect<P = ()> {
    key: Arc<str>,
    id: TemplateId,
    run: Run<P>,
    ttl: Ttl,
}

impl Effect<()> {
    pub fn new<F>(key: &str, run: F) -> Self
    where
        F: Fn(&Ecosystem) -> Result<()> + Send + Sync + 'static,
    {
        Self::family(key, move |ecosystem, _: &()| run(ecosystem))
    }
}

impl<P> Effect<P>
where
    P: Serialize + Clone + Send + Sync + 'static,
{
    pub fn family<F>(key: &str, run: F) -> Self
    where
        F: Fn(&Ecosystem, &P) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            key: key.into(),
            id: TemplateId::new(),
            run: Arc::new(run),
            ttl: Ttl::Forever,
        }
    }

    pub fn with_ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = ttl;
        self
    }
}

impl<P> Clone for Effect<P> {
    fn clone(&self) -> Self {
        Self {
            key: Arc::clone(&self.key),
            id: self.id,
            run: Arc::clone(&self.run),
            ttl: self.ttl.clone(),
        }
    }
}

impl<P> Template for Effect<P>
where
    P: Serialize + Clone + Send + Sync + 'static,
{
    type Params = P;
    type Output = usize;

    fn key(&self) -> &str {
        &self.key
    }

    fn template_id(&self) -> TemplateId {
        self.id
    }

    fn instantiate(&self, _node: &NodeRef, params: P) -> Arc<dyn GraphNode> {
        Arc::new(EffectNode {
            params,
            run: Arc::clone(&self.run),
            ttl: self.ttl.clone(),
            runs: AtomicUsize::new(0),
        })
    }
}

struct EffectNode<P> {
    params: P,
    run: Run<P>,
    ttl: Ttl,
    runs: AtomicUsize,
}

impl<P> GraphNode for EffectNode<P>
where
    P: Send + Sync + 'static,
{
    fn evaluate(&self, ecosystem: &Ecosystem) -> Result<bool> {
        (self.run)(ecosystem, &self.params)?;
        self.runs.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn value(&self) -> Option<AnyValue> {
        Some(Arc::new(self.runs.load(Ordering::Relaxed)) as AnyValue)
    }

    fn ttl(&self) -> Ttl {
        self.ttl.clone()
    }

    fn job_kind(&self) -> JobKind {
        JobKind::Effect
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeId;

    #[test]
    fn effects_count_runs_and_use_the_effect_class() {
        let effect = Effect::new("log", |_| Ok(()));
        let node = effect.instantiate(&NodeRef::new(NodeId::new(), "log"), ());
        let ecosystem = Ecosystem::new(Default::default());

        assert_eq!(node.job_kind(), JobKind::Effect);
        node.evaluate(&ecosystem).unwrap();
        node.evaluate(&ecosystem).unwrap();
        assert_eq!(node.value().unwrap().downcast_ref::<usize>(), Some(&2));
    }
}
