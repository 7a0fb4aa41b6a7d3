//! Dependency Graph
//!
//! This module implements the graph of reactive nodes and the algorithms that
//! keep it consistent: edge creation and removal, weight recalculation,
//! dependent scheduling and the node destruction state machine.
//!
//! # Overview
//!
//! - Nodes live in an arena keyed by [`NodeId`]. Handles are never reused, so
//!   edges reference handles instead of owning their endpoints.
//! - Every edge is stored once in the edge table, keyed by
//!   `(observer, source)`. Both endpoints index that key, which keeps the two
//!   sides of a relationship identical by construction.
//! - External observers (callbacks living outside the graph) are pseudo nodes:
//!   they own an edge and appear in their source's observer set, but have no
//!   node entry of their own.
//!
//! # Design Decisions
//!
//! 1. Weight is a depth lower bound maintained incrementally. Any edge change
//!    re-propagates weight through the affected observers only.
//!
//! 2. Destruction is never recursive. Destroying a node informs its sources
//!    that an observer left; a source whose refcount drops to zero schedules
//!    its own destruction as a job.
//!
//! 3. The graph never calls user code. Anything that must run outside the
//!    engine lock (events, destroy hooks, deferral cancellation) is queued in
//!    the [`Outbox`].

mod edge;
mod node;
mod reason;
mod scheduler;
mod view;

pub use edge::{Edge, EdgeFlags, EdgeKey};
pub use node::{AnyValue, GraphNode, NodeId, NodeRef, NodeStatus, Ttl};
pub use reason::{ObserverSignal, Reason, ReasonKind};
pub use scheduler::{Job, JobKey, JobKind, Scheduler, SchedulerMode, Task};
pub use view::{EdgeView, FlatNode, GraphView, TreeNode, ViewMode};

pub(crate) use node::NodeEntry;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, trace};

use crate::ecosystem::events::{EdgeAction, Event};
use crate::ecosystem::timer::CancelHandle;
use crate::error::{Error, Result};
use crate::reactive::{Notification, Subscriber, SubscriberCallback, TemplateId};

/// Work produced while the engine lock was held, delivered after release.
#[derive(Default)]
pub(crate) struct Outbox {
    /// Whether any event listener is registered. Events are only built when
    /// someone will receive them.
    pub(crate) listening: bool,
    pub(crate) events: Vec<Event>,
    pub(crate) destroyed: Vec<Arc<dyn GraphNode>>,
    pub(crate) cancelled: Vec<CancelHandle>,
}

impl Outbox {
    pub(crate) fn emit(&mut self, event: impl FnOnce() -> Event) {
        if self.listening {
            self.events.push(event());
        }
    }

    pub(crate) fn take(&mut self) -> Outbox {
        let listening = self.listening;
        std::mem::replace(
            self,
            Outbox {
                listening,
                ..Outbox::default()
            },
        )
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.events.is_empty() && self.destroyed.is_empty() && self.cancelled.is_empty()
    }
}

/// The node arena, edge table and scheduler of one ecosystem.
pub(crate) struct Graph {
    nodes: HashMap<NodeId, NodeEntry>,
    externals: HashMap<NodeId, Subscriber>,
    edges: HashMap<EdgeKey, Edge>,
    registry: IndexMap<String, NodeId>,
    pub(crate) scheduler: Scheduler,
    pub(crate) outbox: Outbox,
}

impl Graph {
    pub(crate) fn new(mode: SchedulerMode) -> Self {
        Self {
            nodes: HashMap::new(),
            externals: HashMap::new(),
            edges: HashMap::new(),
            registry: IndexMap::new(),
            scheduler: Scheduler::new(mode),
            outbox: Outbox::default(),
        }
    }

    pub(crate) fn get(&self, handle: NodeId) -> Option<&NodeEntry> {
        self.nodes.get(&handle)
    }

    pub(crate) fn get_mut(&mut self, handle: NodeId) -> Option<&mut NodeEntry> {
        self.nodes.get_mut(&handle)
    }

    pub(crate) fn lookup(&self, id: &str) -> Option<NodeId> {
        self.registry.get(id).copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Live nodes in creation order.
    pub(crate) fn entries(&self) -> impl Iterator<Item = &NodeEntry> {
        self.registry
            .values()
            .filter_map(move |handle| self.nodes.get(handle))
    }

    /// Handles of live nodes in creation order.
    pub(crate) fn handles(&self) -> Vec<NodeId> {
        self.registry.values().copied().collect()
    }

    pub(crate) fn edge(&self, observer: NodeId, source: NodeId) -> Option<&Edge> {
        self.edges.get(&EdgeKey::new(observer, source))
    }

    /// Human readable name of a node or external observer.
    pub(crate) fn label(&self, handle: NodeId) -> String {
        if let Some(entry) = self.nodes.get(&handle) {
            return entry.id().to_owned();
        }
        if let Some(subscriber) = self.externals.get(&handle) {
            return subscriber.label().to_owned();
        }
        format!("#{}", handle.raw())
    }

    /// Find the live node registered under `id`, provided it was created
    /// from the template `template_id`.
    pub(crate) fn reuse(&mut self, id: &str, template_id: TemplateId) -> Result<Option<NodeRef>> {
        let Some(entry) = self.lookup(id).and_then(|handle| self.nodes.get(&handle)) else {
            return Ok(None);
        };
        if entry.template_id != template_id {
            return Err(Error::IdCollision { id: id.to_owned() });
        }
        let node = entry.node.clone();
        self.outbox.emit(|| Event::Reused { node: id.to_owned() });
        Ok(Some(node))
    }

    /// Register a freshly created node. Fails if the id is already taken.
    pub(crate) fn insert(&mut self, entry: NodeEntry) -> Result<()> {
        let id = entry.id().to_owned();
        if self.registry.contains_key(&id) {
            return Err(Error::IdCollision { id });
        }
        let handle = entry.handle();
        debug!(node = %id, "node created");
        self.outbox.emit(|| Event::Cycle {
            node: id.clone(),
            old_status: None,
            new_status: NodeStatus::Initializing,
        });
        self.registry.insert(id, handle);
        self.nodes.insert(handle, entry);
        Ok(())
    }

    /// Move a node to a new status, emitting a lifecycle event.
    pub(crate) fn set_status(&mut self, handle: NodeId, status: NodeStatus) {
        let Some(entry) = self.nodes.get_mut(&handle) else {
            return;
        };
        let old = std::mem::replace(&mut entry.status, status);
        if old == status {
            return;
        }
        let id = entry.id().to_owned();
        debug!(node = %id, from = ?old, to = ?status, "node status changed");
        self.outbox.emit(|| Event::Cycle {
            node: id,
            old_status: Some(old),
            new_status: status,
        });
    }

    /// Number of non-passive observers.
    pub(crate) fn refcount(&self, handle: NodeId) -> usize {
        let Some(entry) = self.nodes.get(&handle) else {
            return 0;
        };
        entry
            .observers
            .iter()
            .filter(|observer| {
                self.edges
                    .get(&EdgeKey::new(**observer, handle))
                    .is_some_and(|edge| !edge.flags.is_passive())
            })
            .count()
    }

    // ---- Edges ----

    /// Add an edge from `observer` to `source`, or update the flags of the
    /// existing one.
    pub(crate) fn add_edge(
        &mut self,
        observer: NodeId,
        source: NodeId,
        flags: EdgeFlags,
        operation: &str,
    ) -> Result<()> {
        if observer == source {
            return Err(Error::Cycle(self.label(source)));
        }
        if !self.nodes.contains_key(&source) {
            return Err(Error::NodeNotFound(self.label(source)));
        }
        let external = self.externals.contains_key(&observer);
        if !external && !self.nodes.contains_key(&observer) {
            return Err(Error::NodeNotFound(self.label(observer)));
        }

        let key = EdgeKey::new(observer, source);
        if self.edges.contains_key(&key) {
            return self.update_edge(key, flags);
        }

        self.edges.insert(key, Edge::new(flags, operation));
        if let Some(entry) = self.nodes.get_mut(&source) {
            entry.observers.insert(observer);
        }
        if let Some(entry) = self.nodes.get_mut(&observer) {
            entry.sources.insert(source);
        }
        trace!(
            observer = %self.label(observer),
            source = %self.label(source),
            ?flags,
            operation,
            "edge added"
        );
        self.emit_edge(key, EdgeAction::Add, flags, operation);

        if !external && !flags.is_static() {
            if let Err(error) = self.recalculate_weight(observer) {
                self.detach_edge(key);
                // removing the edge restores an acyclic graph
                let _ = self.recalculate_weight(observer);
                return Err(error);
            }
        }
        // only a committed edge may cancel a pending destruction
        if !flags.is_passive() {
            self.revive(source);
        }
        Ok(())
    }

    /// Replace the flags of an existing edge.
    pub(crate) fn update_edge(&mut self, key: EdgeKey, flags: EdgeFlags) -> Result<()> {
        let Some(edge) = self.edges.get_mut(&key) else {
            return Ok(());
        };
        if edge.flags == flags {
            return Ok(());
        }
        let old = std::mem::replace(&mut edge.flags, flags);
        let operation = edge.operation.clone();
        trace!(?old, new = ?flags, "edge updated");
        self.emit_edge(key, EdgeAction::Update, flags, &operation);

        if old.is_static() != flags.is_static() && self.nodes.contains_key(&key.observer) {
            if let Err(error) = self.recalculate_weight(key.observer) {
                if let Some(edge) = self.edges.get_mut(&key) {
                    edge.flags = old;
                }
                let _ = self.recalculate_weight(key.observer);
                return Err(error);
            }
        }
        if old.is_passive() && !flags.is_passive() {
            self.revive(key.source);
        } else if !old.is_passive() && flags.is_passive() && self.refcount(key.source) == 0 {
            self.orphaned(key.source);
        }
        Ok(())
    }

    /// Remove the edge from `observer` to `source`. Removing an edge that is
    /// already gone is a no-op.
    pub(crate) fn remove_edge(&mut self, observer: NodeId, source: NodeId) -> bool {
        let Some(edge) = self.detach_edge(EdgeKey::new(observer, source)) else {
            trace!(observer = observer.raw(), source = source.raw(), "edge already removed");
            return false;
        };
        // an external observer has a single edge, so its notification goes with it
        if let Some(job) = edge.scheduled_job.filter(|_| edge.flags.is_external()) {
            self.scheduler.unschedule(&job);
        }
        if !edge.flags.is_static() && self.nodes.contains_key(&observer) {
            let _ = self.recalculate_weight(observer);
        }
        if !edge.flags.is_passive() && self.refcount(source) == 0 {
            self.orphaned(source);
        }
        true
    }

    /// Unlink an edge from the table and both endpoints, nothing more.
    fn detach_edge(&mut self, key: EdgeKey) -> Option<Edge> {
        let edge = self.edges.remove(&key)?;
        self.emit_edge(key, EdgeAction::Remove, edge.flags, &edge.operation);
        if let Some(entry) = self.nodes.get_mut(&key.source) {
            entry.observers.shift_remove(&key.observer);
        }
        if let Some(entry) = self.nodes.get_mut(&key.observer) {
            entry.sources.shift_remove(&key.source);
        }
        Some(edge)
    }

    fn emit_edge(&mut self, key: EdgeKey, action: EdgeAction, flags: EdgeFlags, operation: &str) {
        if !self.outbox.listening {
            return;
        }
        let event = Event::Edge {
            observer: self.label(key.observer),
            source: self.label(key.source),
            action,
            flags,
            operation: operation.to_owned(),
        };
        self.outbox.events.push(event);
    }

    // ---- Weight ----

    fn compute_weight(&self, handle: NodeId) -> u32 {
        let Some(entry) = self.nodes.get(&handle) else {
            return 1;
        };
        let deepest = entry
            .sources
            .iter()
            .filter(|source| {
                self.edges
                    .get(&EdgeKey::new(handle, **source))
                    .is_some_and(|edge| !edge.flags.is_static())
            })
            .filter_map(|source| self.nodes.get(source))
            .map(|source| source.weight)
            .max()
            .unwrap_or(0);
        deepest + 1
    }

    /// Recompute the weight of `start` and of every dynamic observer whose
    /// weight depends on it.
    ///
    /// In an acyclic graph no weight can exceed the node count, so crossing
    /// that bound means a dynamic cycle.
    fn recalculate_weight(&mut self, start: NodeId) -> Result<()> {
        let limit = self.nodes.len() as u32 + 1;
        let mut pending = VecDeque::from([start]);

        while let Some(handle) = pending.pop_front() {
            let weight = self.compute_weight(handle);
            let Some(entry) = self.nodes.get_mut(&handle) else {
                continue;
            };
            if entry.weight == weight {
                continue;
            }
            if weight > limit {
                return Err(Error::Cycle(entry.id().to_owned()));
            }
            entry.weight = weight;
            self.scheduler.reweight(&JobKey::Evaluate(handle), weight);

            let observers: Vec<NodeId> = entry.observers.iter().copied().collect();
            pending.extend(observers.into_iter().filter(|observer| {
                self.nodes.contains_key(observer)
                    && self
                        .edges
                        .get(&EdgeKey::new(*observer, handle))
                        .is_some_and(|edge| !edge.flags.is_static())
            }));
        }
        Ok(())
    }

    // ---- Scheduling ----

    /// Schedule every observer of `source` that cares about `signal`.
    pub(crate) fn schedule_dependents(
        &mut self,
        source: NodeId,
        reasons: &[Reason],
        signal: ObserverSignal,
    ) {
        let Some(entry) = self.nodes.get(&source) else {
            return;
        };
        let weight = entry.weight;
        let observers: Vec<NodeId> = entry.observers.iter().copied().collect();

        for observer in observers {
            let key = EdgeKey::new(observer, source);
            let Some(edge) = self.edges.get_mut(&key) else {
                continue;
            };
            let interested = match &signal {
                ObserverSignal::Updated => !edge.flags.is_static(),
                ObserverSignal::Event(_) => {
                    edge.flags.is_external() && !edge.flags.is_eventless()
                }
                ObserverSignal::Destroyed => true,
            };
            if !interested {
                continue;
            }

            if let Some(subscriber) = self.externals.get_mut(&observer) {
                subscriber.push(signal.clone(), reasons);
                let job = JobKey::Notify(observer);
                self.scheduler
                    .schedule(Job::new(job, JobKind::External, weight + 1));
                edge.scheduled_job = Some(job);
            } else if let Some(entry) = self.nodes.get_mut(&observer) {
                entry.reasons.extend(reasons.iter().cloned());
                let job = JobKey::Evaluate(observer);
                self.scheduler
                    .schedule(Job::new(job, entry.job_kind, entry.weight));
                edge.scheduled_job = Some(job);
            }
        }
    }

    /// Queue a re-evaluation of `handle` for `reason`.
    pub(crate) fn schedule_evaluation(&mut self, handle: NodeId, reason: Reason) -> bool {
        let Some(entry) = self.nodes.get_mut(&handle) else {
            return false;
        };
        entry.reasons.push(reason);
        self.scheduler.schedule(Job::new(
            JobKey::Evaluate(handle),
            entry.job_kind,
            entry.weight,
        ));
        true
    }

    /// Queue a destruction check for `handle` in the side-effect class.
    pub(crate) fn schedule_destruction(&mut self, handle: NodeId) {
        let Some(entry) = self.nodes.get(&handle) else {
            return;
        };
        self.scheduler.schedule(Job::new(
            JobKey::Destroy(handle),
            JobKind::Effect,
            entry.weight,
        ));
    }

    /// Record a direct write to `handle`. Observers are informed by an
    /// immediate job so every write in a batch is seen in write order.
    pub(crate) fn publish(
        &mut self,
        handle: NodeId,
        old_value: Option<AnyValue>,
        new_value: Option<AnyValue>,
    ) {
        let Some(entry) = self.nodes.get_mut(&handle) else {
            return;
        };
        let id = entry.id().to_owned();
        entry
            .outbound
            .push(Reason::changed(&id, old_value.clone(), new_value.clone()));
        let weight = entry.weight;
        self.scheduler
            .schedule(Job::new(JobKey::Inform(handle), JobKind::Inform, weight));
        self.outbox.emit(|| Event::Change {
            node: id,
            old_value,
            new_value,
        });
    }

    /// Run a pending inform job: schedule the observers of `handle` with the
    /// writes accumulated since the last one.
    pub(crate) fn inform(&mut self, handle: NodeId) {
        let Some(entry) = self.nodes.get_mut(&handle) else {
            return;
        };
        let reasons = std::mem::take(&mut entry.outbound);
        if reasons.is_empty() {
            return;
        }
        self.schedule_dependents(handle, &reasons, ObserverSignal::Updated);
    }

    /// An evaluation of `handle` produced a new value.
    pub(crate) fn propagate_change(
        &mut self,
        handle: NodeId,
        old_value: Option<AnyValue>,
        new_value: Option<AnyValue>,
    ) {
        let Some(entry) = self.nodes.get(&handle) else {
            return;
        };
        let id = entry.id().to_owned();
        let reason = Reason::changed(&id, old_value.clone(), new_value.clone());
        self.schedule_dependents(handle, std::slice::from_ref(&reason), ObserverSignal::Updated);
        self.outbox.emit(|| Event::Change {
            node: id,
            old_value,
            new_value,
        });
    }

    // ---- Lifecycle ----

    /// The last counted observer of `handle` left.
    fn orphaned(&mut self, handle: NodeId) {
        let Some(entry) = self.nodes.get(&handle) else {
            return;
        };
        if entry.status != NodeStatus::Active {
            return;
        }
        let job = match entry.ttl {
            Ttl::Forever => return,
            Ttl::Immediate => JobKey::Destroy(handle),
            Ttl::After(_) | Ttl::Until(_) => JobKey::Arm(handle),
        };
        let weight = entry.weight;
        self.set_status(handle, NodeStatus::Stale);
        self.scheduler.schedule(Job::new(job, JobKind::Effect, weight));
    }

    /// A counted observer arrived: cancel any pending destruction.
    fn revive(&mut self, handle: NodeId) {
        self.scheduler.unschedule(&JobKey::Destroy(handle));
        self.scheduler.unschedule(&JobKey::Arm(handle));
        let Some(entry) = self.nodes.get_mut(&handle) else {
            return;
        };
        if let Some(deferral) = entry.deferral.take() {
            self.outbox.cancelled.push(deferral);
        }
        if entry.status == NodeStatus::Stale {
            self.set_status(handle, NodeStatus::Active);
        }
    }

    /// Destroy a node. Without `force`, a node that still has counted
    /// observers is left alone. Returns whether the node was destroyed.
    pub(crate) fn destroy(&mut self, handle: NodeId, force: bool) -> bool {
        let Some(sources) = self
            .nodes
            .get(&handle)
            .map(|entry| entry.sources.iter().copied().collect::<Vec<_>>())
        else {
            return false;
        };
        if !force && self.refcount(handle) > 0 {
            trace!(node = %self.label(handle), "destruction skipped, node is observed");
            return false;
        }

        for job in [
            JobKey::Evaluate(handle),
            JobKey::Inform(handle),
            JobKey::Destroy(handle),
            JobKey::Arm(handle),
        ] {
            self.scheduler.unschedule(&job);
        }

        for source in sources {
            self.remove_edge(handle, source);
        }

        let Some(mut entry) = self.nodes.remove(&handle) else {
            return false;
        };
        if self.registry.get(entry.id()) == Some(&handle) {
            self.registry.shift_remove(entry.id());
        }
        if let Some(deferral) = entry.deferral.take() {
            self.outbox.cancelled.push(deferral);
        }

        let id = entry.id().to_owned();
        let last_value = entry.body.value();
        let reason = Reason::destroyed(&id);
        for observer in std::mem::take(&mut entry.observers) {
            if let Some(edge) = self.edges.remove(&EdgeKey::new(observer, handle)) {
                if self.outbox.listening {
                    let event = Event::Edge {
                        observer: self.label(observer),
                        source: id.clone(),
                        action: EdgeAction::Remove,
                        flags: edge.flags,
                        operation: edge.operation,
                    };
                    self.outbox.events.push(event);
                }
            }

            if let Some(subscriber) = self.externals.get_mut(&observer) {
                subscriber.detach(last_value.clone());
                subscriber.push(ObserverSignal::Destroyed, std::slice::from_ref(&reason));
                self.scheduler.schedule(Job::new(
                    JobKey::Notify(observer),
                    JobKind::External,
                    entry.weight + 1,
                ));
            } else if let Some(observer_entry) = self.nodes.get_mut(&observer) {
                observer_entry.sources.shift_remove(&handle);
                self.schedule_evaluation(observer, reason.clone());
                // losing a source never creates a cycle
                let _ = self.recalculate_weight(observer);
            }
        }

        debug!(node = %id, force, "node destroyed");
        let old = entry.status;
        entry.status = NodeStatus::Destroyed;
        self.outbox.emit(|| Event::Cycle {
            node: id,
            old_status: Some(old),
            new_status: NodeStatus::Destroyed,
        });
        self.outbox.destroyed.push(entry.body);
        true
    }

    // ---- External observers ----

    /// Attach an external observer to its source.
    pub(crate) fn attach_external(
        &mut self,
        subscriber: Subscriber,
        flags: EdgeFlags,
        operation: &str,
    ) -> Result<NodeId> {
        let id = subscriber.id();
        let source = subscriber.source();
        self.externals.insert(id, subscriber);
        let flags = flags | EdgeFlags::EXTERNAL | EdgeFlags::EXPLICIT;
        if let Err(error) = self.add_edge(id, source, flags, operation) {
            self.externals.remove(&id);
            return Err(error);
        }
        Ok(id)
    }

    /// Detach an external observer. Detaching twice is a no-op.
    pub(crate) fn detach_external(&mut self, id: NodeId) -> bool {
        let Some(subscriber) = self.externals.remove(&id) else {
            return false;
        };
        self.remove_edge(id, subscriber.source());
        true
    }

    /// Take the pending notification of an external observer.
    pub(crate) fn take_notification(
        &mut self,
        id: NodeId,
    ) -> Option<(SubscriberCallback, Notification)> {
        let subscriber = self.externals.get_mut(&id)?;
        let source = subscriber.source();
        let value = self.nodes.get(&source).and_then(|entry| entry.body.value());
        let delivery = subscriber.take(value)?;

        if let Some(edge) = self.edges.get_mut(&EdgeKey::new(id, source)) {
            edge.scheduled_job = None;
        }
        if subscriber.is_detached() {
            self.externals.remove(&id);
        }
        Some(delivery)
    }

    // ---- Diagnostics ----

    /// Verify edge symmetry, edge uniqueness, weight ordering and registry
    /// consistency.
    pub(crate) fn check_invariants(&self) -> Result<()> {
        for (key, edge) in &self.edges {
            let source = self
                .nodes
                .get(&key.source)
                .ok_or_else(|| Error::msg(format!("edge to missing source {:?}", key.source)))?;
            if !source.observers.contains(&key.observer) {
                return Err(Error::msg(format!(
                    "`{}` does not list observer `{}`",
                    source.id(),
                    self.label(key.observer)
                )));
            }
            if edge.flags.is_external() {
                if !self.externals.contains_key(&key.observer) {
                    return Err(Error::msg(format!("dangling external edge on `{}`", source.id())));
                }
                continue;
            }
            let observer = self
                .nodes
                .get(&key.observer)
                .ok_or_else(|| Error::msg(format!("edge from missing observer {:?}", key.observer)))?;
            if !observer.sources.contains(&key.source) {
                return Err(Error::msg(format!(
                    "`{}` does not list source `{}`",
                    observer.id(),
                    source.id()
                )));
            }
            if !edge.flags.is_static() && observer.weight < source.weight + 1 {
                return Err(Error::msg(format!(
                    "`{}` (weight {}) is not heavier than its source `{}` (weight {})",
                    observer.id(),
                    observer.weight,
                    source.id(),
                    source.weight
                )));
            }
        }

        for (handle, entry) in &self.nodes {
            for source in &entry.sources {
                if !self.edges.contains_key(&EdgeKey::new(*handle, *source)) {
                    return Err(Error::msg(format!("`{}` lists a source without an edge", entry.id())));
                }
            }
            for observer in &entry.observers {
                if !self.edges.contains_key(&EdgeKey::new(*observer, *handle)) {
                    return Err(Error::msg(format!("`{}` lists an observer without an edge", entry.id())));
                }
            }
            if self.registry.get(entry.id()) != Some(handle) {
                return Err(Error::msg(format!("`{}` is not registered", entry.id())));
            }
        }
        if self.registry.len() != self.nodes.len() {
            return Err(Error::msg("registry and node arena disagree"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;

    use super::*;
    use crate::ecosystem::Ecosystem;

    struct Inert;

    impl GraphNode for Inert {
        fn evaluate(&self, _ecosystem: &Ecosystem) -> Result<bool> {
            Ok(false)
        }

        fn value(&self) -> Option<AnyValue> {
            None
        }

        fn ttl(&self) -> Ttl {
            Ttl::Immediate
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn add_node(graph: &mut Graph, id: &str) -> NodeId {
        let handle = NodeId::new();
        let node = NodeRef::new(handle, id);
        graph
            .insert(NodeEntry::new(node, id, TemplateId::new(), Arc::new(Inert)))
            .unwrap();
        graph.set_status(handle, NodeStatus::Active);
        handle
    }

    fn chain() -> (Graph, NodeId, NodeId, NodeId) {
        let mut graph = Graph::new(SchedulerMode::Sync);
        let a = add_node(&mut graph, "a");
        let b = add_node(&mut graph, "b");
        let c = add_node(&mut graph, "c");
        graph.add_edge(b, a, EdgeFlags::DYNAMIC, "get").unwrap();
        graph.add_edge(c, b, EdgeFlags::DYNAMIC, "get").unwrap();
        (graph, a, b, c)
    }

    fn weight(graph: &Graph, handle: NodeId) -> u32 {
        graph.get(handle).unwrap().weight
    }

    #[test]
    fn weights_follow_dynamic_edges() {
        let (mut graph, a, b, c) = chain();
        assert_eq!((weight(&graph, a), weight(&graph, b), weight(&graph, c)), (1, 2, 3));

        // a static edge does not affect weight
        let d = add_node(&mut graph, "d");
        graph.add_edge(d, c, EdgeFlags::STATIC, "getNode").unwrap();
        assert_eq!(weight(&graph, d), 1);

        // removing the middle edge lowers everything downstream
        graph.remove_edge(b, a);
        assert_eq!((weight(&graph, b), weight(&graph, c)), (1, 2));
        graph.check_invariants().unwrap();
    }

    #[test]
    fn dynamic_cycles_are_rolled_back() {
        let (mut graph, a, _, c) = chain();

        let error = graph.add_edge(a, c, EdgeFlags::DYNAMIC, "get").unwrap_err();
        assert!(matches!(error, Error::Cycle(_)));
        assert!(graph.edge(a, c).is_none());
        assert_eq!(weight(&graph, a), 1);
        graph.check_invariants().unwrap();
    }

    #[test]
    fn rejected_edges_leave_pending_destruction_alone() {
        let (mut graph, a, b, c) = chain();
        graph.remove_edge(c, b);
        assert_eq!(graph.get(b).unwrap().status, NodeStatus::Stale);

        let error = graph.add_edge(a, b, EdgeFlags::DYNAMIC, "get").unwrap_err();
        assert!(matches!(error, Error::Cycle(_)));

        assert_eq!(graph.get(b).unwrap().status, NodeStatus::Stale);
        assert_eq!(graph.refcount(b), 0);
        assert!(graph.scheduler.is_scheduled(&JobKey::Destroy(b)));
        graph.check_invariants().unwrap();
    }

    fn tree_size(tree: &IndexMap<String, TreeNode>) -> usize {
        tree.values().map(|node| 1 + tree_size(&node.children)).sum()
    }

    #[test]
    fn tree_views_expand_shared_nodes_once() {
        let mut graph = Graph::new(SchedulerMode::Sync);
        let mut join = add_node(&mut graph, "source");
        for layer in 0..40 {
            let left = add_node(&mut graph, &format!("left-{layer}"));
            let right = add_node(&mut graph, &format!("right-{layer}"));
            graph.add_edge(left, join, EdgeFlags::DYNAMIC, "get").unwrap();
            graph.add_edge(right, join, EdgeFlags::DYNAMIC, "get").unwrap();
            join = add_node(&mut graph, &format!("join-{layer}"));
            graph.add_edge(join, left, EdgeFlags::DYNAMIC, "get").unwrap();
            graph.add_edge(join, right, EdgeFlags::DYNAMIC, "get").unwrap();
        }

        let top_down = graph.view(ViewMode::TopDown);
        let roots = top_down.as_tree().unwrap();
        assert_eq!(roots.keys().collect::<Vec<_>>(), vec!["source"]);
        // every edge shows up once, plus the root
        assert_eq!(tree_size(roots), 40 * 4 + 1);

        let bottom_up = graph.view(ViewMode::BottomUp);
        let roots = bottom_up.as_tree().unwrap();
        assert_eq!(roots.keys().collect::<Vec<_>>(), vec!["join-39"]);
        assert_eq!(roots["join-39"].weight, 81);
        assert_eq!(tree_size(roots), 40 * 4 + 1);
    }

    #[test]
    fn self_edges_are_cycles() {
        let mut graph = Graph::new(SchedulerMode::Sync);
        let a = add_node(&mut graph, "a");
        assert!(matches!(
            graph.add_edge(a, a, EdgeFlags::DYNAMIC, "get"),
            Err(Error::Cycle(_))
        ));
    }

    #[test]
    fn orphaned_nodes_schedule_their_destruction() {
        let (mut graph, a, b, _) = chain();

        graph.remove_edge(b, a);
        assert_eq!(graph.get(a).unwrap().status, NodeStatus::Stale);
        assert!(graph.scheduler.is_scheduled(&JobKey::Destroy(a)));

        // a new observer revives it
        graph.add_edge(b, a, EdgeFlags::DYNAMIC, "get").unwrap();
        assert_eq!(graph.get(a).unwrap().status, NodeStatus::Active);
        assert!(!graph.scheduler.is_scheduled(&JobKey::Destroy(a)));
    }

    #[test]
    fn passive_edges_do_not_count() {
        let (mut graph, a, b, _) = chain();
        let watcher = add_node(&mut graph, "watcher");
        graph.add_edge(watcher, a, EdgeFlags::PASSIVE, "peek").unwrap();
        assert_eq!(graph.refcount(a), 1);

        graph.remove_edge(b, a);
        assert_eq!(graph.refcount(a), 0);
        assert!(graph.scheduler.is_scheduled(&JobKey::Destroy(a)));
    }

    #[test]
    fn destruction_reschedules_observers() {
        let (mut graph, a, b, _) = chain();

        assert!(!graph.destroy(a, false));
        assert!(graph.destroy(a, true));

        assert!(graph.get(a).is_none());
        assert!(graph.lookup("a").is_none());
        let observer = graph.get(b).unwrap();
        assert!(observer.sources.is_empty());
        assert_eq!(observer.reasons[0].kind, ReasonKind::Destroyed);
        assert!(graph.scheduler.is_scheduled(&JobKey::Evaluate(b)));
        assert_eq!(graph.outbox.destroyed.len(), 1);
        graph.check_invariants().unwrap();
    }

    fn subscribe(graph: &mut Graph, source: NodeId) -> NodeId {
        let callback: SubscriberCallback = Arc::new(|_: &Notification| {});
        let subscriber = Subscriber::new(source, callback);
        graph
            .attach_external(subscriber, EdgeFlags::DYNAMIC, "observe")
            .unwrap()
    }

    #[test]
    fn detaching_an_observer_drops_its_notification() {
        let (mut graph, a, _, _) = chain();
        let kept = subscribe(&mut graph, a);
        let dropped = subscribe(&mut graph, a);

        graph.propagate_change(a, None, Some(Arc::new(2_i32)));
        let edge = graph.edge(dropped, a).unwrap();
        assert_eq!(edge.scheduled_job, Some(JobKey::Notify(dropped)));

        assert!(graph.detach_external(dropped));
        assert!(!graph.scheduler.is_scheduled(&JobKey::Notify(dropped)));
        assert!(graph.scheduler.is_scheduled(&JobKey::Notify(kept)));
        assert!(!graph.detach_external(dropped));

        let (_, notification) = graph.take_notification(kept).unwrap();
        assert_eq!(notification.reasons.len(), 1);
        assert!(graph.edge(kept, a).unwrap().scheduled_job.is_none());
    }

    #[test]
    fn writes_inform_dynamic_observers_only() {
        let (mut graph, a, b, _) = chain();
        let holder = add_node(&mut graph, "holder");
        graph.add_edge(holder, a, EdgeFlags::STATIC, "getNode").unwrap();

        graph.publish(a, None, Some(Arc::new(1_i32)));
        assert_eq!(graph.scheduler.pop().unwrap().key, JobKey::Inform(a));
        graph.inform(a);

        assert!(graph.scheduler.is_scheduled(&JobKey::Evaluate(b)));
        assert!(!graph.scheduler.is_scheduled(&JobKey::Evaluate(holder)));
        let reason = &graph.get(b).unwrap().reasons[0];
        assert_eq!(reason.new_value_as::<i32>(), Some(&1));
    }
}
