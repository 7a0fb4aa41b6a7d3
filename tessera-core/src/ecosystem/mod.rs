//! Ecosystem
//!
//! The ecosystem is the container of one reactive graph. It owns the node
//! registry, the scheduler and the event bus, and exposes every top-level
//! operation: lookup-or-create, reads, writes, observers, introspection and
//! administration.
//!
//! # Overview
//!
//! An `Ecosystem` is a cheap handle (`Arc`) and can be cloned and sent across
//! threads, but the graph is single-writer: mutations are serialized by one
//! lock, and evaluation bodies, observer callbacks, event listeners and
//! deferral drivers always run with that lock released so they can call back
//! into the ecosystem.
//!
//! # Flushing
//!
//! Every mutating operation is bracketed by the scheduler's `pre`/`post`
//! pair. The outermost `post` starts a flush (or, in async mode, spawns one
//! on the current tokio runtime). Errors raised by jobs during that flush are
//! returned from the operation that triggered it.

pub mod config;
pub mod events;
pub mod hydration;
pub(crate) mod key;
pub mod overrides;
pub mod timer;

use std::any::type_name;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, error, trace, warn};

use self::config::EcosystemConfig;
use self::events::{Event, EventBus, EventKind, ListenerId};
use self::hydration::Snapshot;
use self::overrides::Override;
use self::timer::{Callback, Timer, TokioTimer};
use crate::error::{Error, Result};
use crate::graph::{
    AnyValue, Edge, EdgeFlags, Graph, GraphView, Job, JobKey, JobKind, NodeEntry, NodeId,
    NodeRef, NodeStatus, ObserverSignal, Outbox, Reason, SchedulerMode, Ttl, ViewMode,
};
use crate::reactive::{
    EvaluationContext, Notification, ObserverHandle, Subscriber, Template,
};

static ECOSYSTEMS: OnceLock<DashMap<String, WeakEcosystem>> = OnceLock::new();

fn ecosystems() -> &'static DashMap<String, WeakEcosystem> {
    ECOSYSTEMS.get_or_init(DashMap::new)
}

/// State guarded by the engine lock.
pub(crate) struct Core {
    pub(crate) graph: Graph,
    /// Hydration values waiting for their node to be created.
    pub(crate) hydration: IndexMap<String, Value>,
}

struct Inner {
    id: String,
    /// Distinguishes ecosystems in evaluation frames.
    instance: u64,
    config: EcosystemConfig,
    core: Mutex<Core>,
    events: EventBus,
    overrides: RwLock<IndexMap<String, Override>>,
    timer: Arc<dyn Timer>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        ecosystems().remove_if(&self.id, |_, weak| weak.0.strong_count() == 0);
    }
}

/// Options for [`Ecosystem::reset`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ResetOptions {
    /// Forget pending hydration values.
    pub hydration: bool,
    /// Remove every event listener (after `ResetEnd` was delivered).
    pub listeners: bool,
    /// Remove every override.
    pub overrides: bool,
}

/// Handle to a reactive graph.
#[derive(Clone)]
pub struct Ecosystem {
    inner: Arc<Inner>,
}

/// Non-owning handle, used by timers and observer handles.
#[derive(Clone)]
pub struct WeakEcosystem(Weak<Inner>);

impl WeakEcosystem {
    pub fn upgrade(&self) -> Option<Ecosystem> {
        self.0.upgrade().map(|inner| Ecosystem { inner })
    }
}

/// Suppresses flushing until closed. Dropping it without closing releases
/// the suppression without flushing.
pub(crate) struct Batch<'a> {
    ecosystem: &'a Ecosystem,
    open: bool,
}

impl<'a> Batch<'a> {
    pub(crate) fn open(ecosystem: &'a Ecosystem) -> Self {
        ecosystem.mutate(|core| core.graph.scheduler.pre());
        Self {
            ecosystem,
            open: true,
        }
    }

    /// Release the suppression, flushing if this was the outermost batch.
    pub(crate) fn close(mut self) -> Result<()> {
        self.open = false;
        if self.ecosystem.mutate(|core| core.graph.scheduler.post()) {
            self.ecosystem.schedule_flush()
        } else {
            Ok(())
        }
    }
}

impl Drop for Batch<'_> {
    fn drop(&mut self) {
        if self.open {
            self.ecosystem.mutate(|core| core.graph.scheduler.post());
        }
    }
}

/// Ends the flushing state even if a job panics.
struct Flushing<'a>(&'a Ecosystem);

impl Drop for Flushing<'_> {
    fn drop(&mut self) {
        self.0.mutate(|core| core.graph.scheduler.end_flush());
    }
}

impl Ecosystem {
    /// Create an ecosystem whose ttl delays run on tokio.
    pub fn new(config: EcosystemConfig) -> Self {
        Self::with_timer(config, Arc::new(TokioTimer))
    }

    /// Create an ecosystem with an injected timer.
    pub fn with_timer(mut config: EcosystemConfig, timer: Arc<dyn Timer>) -> Self {
        static INSTANCES: AtomicU64 = AtomicU64::new(1);

        let hydration = config
            .hydration
            .take()
            .map(Snapshot::into_inner)
            .unwrap_or_default();
        let inner = Arc::new(Inner {
            id: config.id.clone(),
            instance: INSTANCES.fetch_add(1, Ordering::Relaxed),
            core: Mutex::new(Core {
                graph: Graph::new(config.scheduler),
                hydration,
            }),
            config,
            events: EventBus::default(),
            overrides: RwLock::new(IndexMap::new()),
            timer,
        });
        ecosystems().insert(inner.id.clone(), WeakEcosystem(Arc::downgrade(&inner)));
        debug!(ecosystem = %inner.id, scheduler = ?inner.config.scheduler, "ecosystem created");
        Self { inner }
    }

    /// Find a live ecosystem by id.
    pub fn find(id: &str) -> Option<Self> {
        ecosystems().get(id).and_then(|weak| weak.upgrade())
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &EcosystemConfig {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakEcosystem {
        WeakEcosystem(Arc::downgrade(&self.inner))
    }

    // ---- Engine plumbing ----

    /// Run `f` under the engine lock, then deliver whatever it queued for
    /// after the lock (destroy hooks, cancellations, events).
    pub(crate) fn mutate<R>(&self, f: impl FnOnce(&mut Core) -> R) -> R {
        let (result, outbox) = {
            let mut core = self.inner.core.lock();
            core.graph.outbox.listening = self.inner.events.is_listening();
            let result = f(&mut core);
            (result, core.graph.outbox.take())
        };
        if !outbox.is_empty() {
            self.deliver(outbox);
        }
        result
    }

    fn deliver(&self, outbox: Outbox) {
        for deferral in outbox.cancelled {
            deferral.cancel();
        }
        for body in outbox.destroyed {
            body.destroy();
        }
        for event in &outbox.events {
            self.inner.events.emit(event);
        }
    }

    /// Start a flush now, or on the tokio runtime in async mode.
    fn schedule_flush(&self) -> Result<()> {
        if self.inner.config.scheduler == SchedulerMode::Sync {
            return self.flush();
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(ecosystem = %self.id(), "async scheduler without a tokio runtime, flushing synchronously");
            return self.flush();
        };
        if !self.mutate(|core| core.graph.scheduler.request_deferred_flush()) {
            return Ok(());
        }
        let ecosystem = self.downgrade();
        runtime.spawn(async move {
            tokio::task::yield_now().await;
            let Some(ecosystem) = ecosystem.upgrade() else {
                return;
            };
            ecosystem.mutate(|core| core.graph.scheduler.clear_deferred_flush());
            if let Err(error) = ecosystem.flush() {
                error!(ecosystem = %ecosystem.id(), %error, "deferred flush failed");
            }
        });
        Ok(())
    }

    /// Drain the job queue.
    ///
    /// Does nothing if a flush is already running or flushing is suppressed;
    /// the outermost caller drains the queue. Every job runs even if an
    /// earlier one failed, and the first failure is returned.
    pub fn flush(&self) -> Result<()> {
        if !self.mutate(|core| core.graph.scheduler.begin_flush()) {
            return Ok(());
        }
        let _flushing = Flushing(self);
        let limit = self.inner.config.max_jobs_per_flush;
        let mut ran = 0;
        let mut first_error = None;
        trace!(ecosystem = %self.id(), "flush started");

        loop {
            let next = self.mutate(|core| {
                let scheduler = &mut core.graph.scheduler;
                match limit {
                    Some(limit) if ran >= limit && !scheduler.is_empty() => Err(Error::FlushLimit(ran)),
                    _ => Ok(scheduler.pop()),
                }
            });
            let job = match next {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(error) => {
                    warn!(ecosystem = %self.id(), %error, "flush aborted");
                    first_error.get_or_insert(error);
                    break;
                }
            };
            ran += 1;
            let key = job.key;
            trace!(?key, kind = ?job.kind, weight = job.weight, "running job");
            if let Err(error) = self.run_job(job) {
                warn!(?key, %error, "job failed");
                first_error.get_or_insert(error);
            }
        }

        debug!(ecosystem = %self.id(), jobs = ran, "flush finished");
        first_error.map_or(Ok(()), Err)
    }

    fn run_job(&self, mut job: Job) -> Result<()> {
        if let Some(task) = job.task.take() {
            return task(self);
        }
        match job.key {
            JobKey::Inform(handle) => {
                self.mutate(|core| core.graph.inform(handle));
                Ok(())
            }
            JobKey::Evaluate(handle) => self.evaluate_node(handle).map(drop),
            JobKey::Notify(observer) => {
                if let Some((callback, notification)) =
                    self.mutate(|core| core.graph.take_notification(observer))
                {
                    callback(&notification);
                }
                Ok(())
            }
            JobKey::Destroy(handle) => {
                self.mutate(|core| core.graph.destroy(handle, false));
                Ok(())
            }
            JobKey::Arm(handle) => {
                self.arm_deferral(handle);
                Ok(())
            }
            JobKey::Task(_) => Ok(()),
        }
    }

    /// Evaluate a node inside a fresh evaluation frame and apply the result.
    fn evaluate_node(&self, handle: NodeId) -> Result<bool> {
        let Some((body, node, initializing)) = self.mutate(|core| {
            let entry = core.graph.get_mut(handle)?;
            entry.last_reasons = std::mem::take(&mut entry.reasons).into_vec();
            let node = entry.node.clone();
            let initializing = entry.status == NodeStatus::Initializing;
            let body = Arc::clone(&entry.body);
            let id = node.id().to_owned();
            core.graph.outbox.emit(|| Event::RunStart { node: id });
            Some((body, node, initializing))
        }) else {
            trace!(handle = handle.raw(), "skipping evaluation of a destroyed node");
            return Ok(false);
        };

        let batch = Batch::open(self);
        let old_value = body.value();
        let context = EvaluationContext::enter(self.inner.instance, Some(handle));
        trace!(node = %node, initializing, "evaluating");
        let result = body.evaluate(self);
        let frame = context.finish();

        let outcome = self.mutate(|core| {
            let graph = &mut core.graph;
            let outcome = match result {
                Ok(changed) => frame.apply(graph).map(|()| changed),
                Err(error) => {
                    frame.discard(graph);
                    Err(error)
                }
            };
            match &outcome {
                Ok(changed) => {
                    let status = graph.get(handle).map(|entry| entry.status);
                    if status == Some(NodeStatus::Initializing) {
                        graph.set_status(handle, NodeStatus::Active);
                    } else if *changed && status.is_some() {
                        graph.propagate_change(handle, old_value, body.value());
                    }
                }
                Err(error) => {
                    warn!(node = %node, %error, "evaluation failed");
                    if initializing {
                        graph.destroy(handle, true);
                    }
                    let id = node.id().to_owned();
                    let error = error.clone();
                    graph.outbox.emit(|| Event::Error {
                        node: Some(id),
                        error,
                    });
                }
            }
            let id = node.id().to_owned();
            graph.outbox.emit(|| Event::RunEnd { node: id });
            outcome
        });

        let flushed = batch.close();
        let changed = outcome?;
        flushed?;
        Ok(changed)
    }

    /// Arm the ttl deferral of a stale node.
    fn arm_deferral(&self, handle: NodeId) {
        let ttl = self.mutate(|core| {
            core.graph
                .get(handle)
                .filter(|entry| entry.status == NodeStatus::Stale && entry.deferral.is_none())
                .map(|entry| entry.ttl.clone())
        });
        let ecosystem = self.downgrade();
        let callback: Callback = Box::new(move || {
            if let Some(ecosystem) = ecosystem.upgrade() {
                ecosystem.expire(handle);
            }
        });
        let deferral = match ttl {
            Some(Ttl::After(delay)) => self.inner.timer.schedule(delay, callback),
            Some(Ttl::Until(signal)) => signal.subscribe(callback),
            _ => return,
        };
        trace!(handle = handle.raw(), "deferral armed");
        self.mutate(|core| {
            let stale = core
                .graph
                .get(handle)
                .is_some_and(|entry| entry.status == NodeStatus::Stale);
            match core.graph.get_mut(handle) {
                Some(entry) if stale => entry.deferral = Some(deferral),
                // revived or destroyed while the driver was being armed
                _ => core.graph.outbox.cancelled.push(deferral),
            }
        });
    }

    /// A deferral fired: destroy the node if it is still unobserved.
    fn expire(&self, handle: NodeId) {
        let batch = Batch::open(self);
        self.mutate(|core| {
            let stale = core
                .graph
                .get_mut(handle)
                .filter(|entry| entry.status == NodeStatus::Stale)
                .map(|entry| entry.deferral.take())
                .is_some();
            if stale {
                core.graph.destroy(handle, false);
            }
        });
        if let Err(error) = batch.close() {
            warn!(%error, "flush after ttl expiry failed");
        }
    }

    // ---- Lookup ----

    /// Return the node for `template` and `params`, creating and evaluating
    /// it if needed. The lookup itself is untracked.
    pub fn get_or_create<T: Template>(&self, template: &T, params: T::Params) -> Result<NodeRef> {
        let id = key::node_id(template.key(), &params)?;
        let template_id = template.template_id();

        if let Some(node) = self.mutate(|core| core.graph.reuse(&id, template_id))? {
            return Ok(node);
        }

        let handle = NodeId::new();
        let node = NodeRef::new(handle, id.as_str());
        let body = match self.resolve_override::<T::Params, T::Output>(template.key())? {
            Some(replacement) => replacement.instantiate(&node, params),
            None => template.instantiate(&node, params),
        };

        // another thread may have created the node while this one was instantiating
        let hydration = self.mutate(|core| -> Result<Result<Option<Value>, NodeRef>> {
            if let Some(existing) = core.graph.reuse(&id, template_id)? {
                return Ok(Err(existing));
            }
            core.graph.insert(NodeEntry::new(
                node.clone(),
                template.key(),
                template_id,
                Arc::clone(&body),
            ))?;
            Ok(Ok(core.hydration.shift_remove(&id)))
        })?;
        let hydration = match hydration {
            Ok(hydration) => hydration,
            Err(existing) => {
                trace!(node = %existing, "discarding instance created by a concurrent lookup");
                return Ok(existing);
            }
        };
        if let Some(value) = hydration {
            if let Err(error) = body.hydrate(value) {
                self.mutate(|core| core.graph.destroy(handle, true));
                return Err(error);
            }
        }

        self.evaluate_node(handle)?;
        Ok(node)
    }

    /// Read a singleton template's value, tracking it as a dynamic dependency
    /// of the evaluating node.
    pub fn get<T: Template<Params = ()>>(&self, template: &T) -> Result<T::Output> {
        self.get_with(template, ())
    }

    pub fn get_with<T: Template>(&self, template: &T, params: T::Params) -> Result<T::Output> {
        let node = self.get_or_create(template, params)?;
        self.read_value(&node, Some(EdgeFlags::DYNAMIC), "get")
    }

    /// Look up or create a node, tracking it as a static dependency: the
    /// evaluating node is re-run when it is destroyed, not when it changes.
    pub fn get_node<T: Template>(&self, template: &T, params: T::Params) -> Result<NodeRef> {
        let node = self.get_or_create(template, params)?;
        self.track_existing(&node, EdgeFlags::STATIC, "getNode")?;
        Ok(node)
    }

    /// Read a node's value, tracked dynamically.
    pub fn read<O: Clone + Send + Sync + 'static>(&self, node: &NodeRef) -> Result<O> {
        self.read_value(node, Some(EdgeFlags::DYNAMIC), "get")
    }

    /// Read a node's value without tracking it.
    pub fn peek<O: Clone + Send + Sync + 'static>(&self, node: &NodeRef) -> Result<O> {
        self.read_value(node, None, "peek")
    }

    /// Record a dependency of the evaluating node on `node`.
    ///
    /// Fails with [`Error::NoActiveEvaluation`] outside of an evaluation.
    pub fn track(&self, node: &NodeRef, flags: EdgeFlags, operation: &'static str) -> Result<()> {
        if EvaluationContext::current(self.inner.instance).is_none() {
            return Err(Error::NoActiveEvaluation { operation: "track" });
        }
        self.track_existing(node, flags, operation)
    }

    fn track_existing(&self, node: &NodeRef, flags: EdgeFlags, operation: &'static str) -> Result<()> {
        let instance = self.inner.instance;
        self.mutate(|core| {
            core.graph
                .get(node.handle())
                .ok_or_else(|| Error::NodeNotFound(node.id().to_owned()))?;
            EvaluationContext::record(instance, node.handle(), flags, operation);
            Ok(())
        })
    }

    fn read_value<O: Clone + Send + Sync + 'static>(
        &self,
        node: &NodeRef,
        flags: Option<EdgeFlags>,
        operation: &'static str,
    ) -> Result<O> {
        let instance = self.inner.instance;
        let value = self.mutate(|core| {
            let entry = core
                .graph
                .get(node.handle())
                .ok_or_else(|| Error::NodeNotFound(node.id().to_owned()))?;
            if let Some(flags) = flags {
                EvaluationContext::record(instance, node.handle(), flags, operation);
            }
            match entry.body.value() {
                Some(value) => Ok(value),
                // only reachable by reading a node from its own initial evaluation
                None if entry.status == NodeStatus::Initializing => {
                    Err(Error::Cycle(node.id().to_owned()))
                }
                None => Err(Error::TypeMismatch {
                    id: node.id().to_owned(),
                    expected: type_name::<O>(),
                }),
            }
        })?;
        downcast(node, value)
    }

    // ---- Writes ----

    /// Write a singleton template's value.
    pub fn set<T: Template<Params = ()>>(&self, template: &T, value: T::Output) -> Result<()> {
        self.set_with(template, (), value)
    }

    pub fn set_with<T: Template>(&self, template: &T, params: T::Params, value: T::Output) -> Result<()> {
        let node = self.get_or_create(template, params)?;
        self.write(&node, value)
    }

    /// Replace a singleton template's value with a function of the current one.
    pub fn update<T, F>(&self, template: &T, update: F) -> Result<()>
    where
        T: Template<Params = ()>,
        F: FnOnce(&T::Output) -> T::Output,
    {
        self.update_with(template, (), update)
    }

    pub fn update_with<T, F>(&self, template: &T, params: T::Params, update: F) -> Result<()>
    where
        T: Template,
        F: FnOnce(&T::Output) -> T::Output,
    {
        let node = self.get_or_create(template, params)?;
        let current: T::Output = self.peek(&node)?;
        self.write(&node, update(&current))
    }

    /// Write a value directly into a node. Observers are informed through the
    /// immediate queue before any other pending work runs.
    pub fn write<O: Send + Sync + 'static>(&self, node: &NodeRef, value: O) -> Result<()> {
        let body = self
            .mutate(|core| core.graph.get(node.handle()).map(|entry| Arc::clone(&entry.body)))
            .ok_or_else(|| Error::NodeNotFound(node.id().to_owned()))?;

        let batch = Batch::open(self);
        let old_value = body.value();
        let value: AnyValue = Arc::new(value);
        let changed = body
            .write(value)
            .ok_or_else(|| Error::NotWritable(node.id().to_owned()))?;
        if changed {
            let new_value = body.value();
            self.mutate(|core| core.graph.publish(node.handle(), old_value, new_value));
        }
        batch.close()
    }

    /// Schedule a re-evaluation of `node`.
    pub fn invalidate(&self, node: &NodeRef) -> Result<()> {
        let batch = Batch::open(self);
        self.mutate(|core| {
            if !core.graph.schedule_evaluation(node.handle(), Reason::invalidated()) {
                return Err(Error::NodeNotFound(node.id().to_owned()));
            }
            let id = node.id().to_owned();
            core.graph.outbox.emit(|| Event::Invalidate { node: id });
            Ok(())
        })?;
        batch.close()
    }

    /// Send a custom event through `node` to its event-aware external
    /// observers.
    pub fn send(&self, node: &NodeRef, name: &str) -> Result<()> {
        let batch = Batch::open(self);
        self.mutate(|core| {
            if core.graph.get(node.handle()).is_none() {
                return Err(Error::NodeNotFound(node.id().to_owned()));
            }
            core.graph.schedule_dependents(
                node.handle(),
                &[Reason::event(node.id(), name)],
                ObserverSignal::Event(name.to_owned()),
            );
            Ok(())
        })?;
        batch.close()
    }

    /// Run `f` with flushing suppressed, then flush once.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        let batch = Batch::open(self);
        let result = f();
        batch.close()?;
        Ok(result)
    }

    /// Run `f` without recording any dependency.
    pub fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        let context = EvaluationContext::enter(self.inner.instance, None);
        let result = f();
        context.finish();
        result
    }

    /// Queue arbitrary work in the given job class.
    pub fn schedule<F>(&self, kind: JobKind, task: F) -> Result<()>
    where
        F: FnOnce(&Ecosystem) -> Result<()> + Send + 'static,
    {
        let batch = Batch::open(self);
        self.mutate(|core| core.graph.scheduler.schedule(Job::task(kind, Box::new(task))));
        batch.close()
    }

    // ---- Edges & lifecycle ----

    /// Add an explicit edge. Explicit edges are never removed by
    /// re-evaluation.
    pub fn add_edge(
        &self,
        observer: &NodeRef,
        source: &NodeRef,
        flags: EdgeFlags,
        operation: &str,
    ) -> Result<()> {
        let batch = Batch::open(self);
        self.mutate(|core| {
            let flags = match core.graph.edge(observer.handle(), source.handle()) {
                Some(edge) => (edge.flags & flags) | EdgeFlags::EXPLICIT,
                None => flags | EdgeFlags::EXPLICIT,
            };
            core.graph
                .add_edge(observer.handle(), source.handle(), flags, operation)
        })?;
        batch.close()
    }

    /// Remove an edge. Returns `false` if it did not exist.
    pub fn remove_edge(&self, observer: &NodeRef, source: &NodeRef) -> Result<bool> {
        let batch = Batch::open(self);
        let removed = self.mutate(|core| core.graph.remove_edge(observer.handle(), source.handle()));
        batch.close()?;
        Ok(removed)
    }

    /// Destroy a node. Without `force`, an observed node is left alone.
    /// Observers of a destroyed node are notified and may recreate it.
    pub fn destroy(&self, node: &NodeRef, force: bool) -> Result<bool> {
        let batch = Batch::open(self);
        let destroyed = self.mutate(|core| core.graph.destroy(node.handle(), force));
        batch.close()?;
        Ok(destroyed)
    }

    /// Destroy every node. The ecosystem stays usable.
    pub fn wipe(&self) -> Result<()> {
        let batch = Batch::open(self);
        let count = self.mutate(|core| {
            let handles = core.graph.handles();
            for handle in &handles {
                core.graph.destroy(*handle, true);
            }
            handles.len()
        });
        debug!(ecosystem = %self.id(), nodes = count, "ecosystem wiped");
        batch.close()
    }

    /// Wipe, then optionally forget hydration, listeners and overrides.
    pub fn reset(&self, options: ResetOptions) -> Result<()> {
        self.mutate(|core| core.graph.outbox.emit(|| Event::ResetStart));
        let wiped = self.wipe();
        self.mutate(|core| {
            if options.hydration {
                core.hydration.clear();
            }
            core.graph.outbox.emit(|| Event::ResetEnd);
        });
        if options.overrides {
            self.inner.overrides.write().clear();
        }
        if options.listeners {
            self.inner.events.clear();
        }
        wiped
    }

    // ---- Observers ----

    /// Call `callback` whenever `node` changes or is destroyed. The observer
    /// keeps the node alive until the handle is dropped.
    pub fn observe<F>(&self, node: &NodeRef, callback: F) -> Result<ObserverHandle>
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.observe_with(node, EdgeFlags::DYNAMIC, "observe", callback)
    }

    /// Like [`observe`](Self::observe), without counting toward the node's
    /// refcount.
    pub fn observe_passive<F>(&self, node: &NodeRef, callback: F) -> Result<ObserverHandle>
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.observe_with(node, EdgeFlags::PASSIVE, "observePassive", callback)
    }

    /// Attach an external observer with explicit edge flags.
    pub fn observe_with<F>(
        &self,
        node: &NodeRef,
        flags: EdgeFlags,
        operation: &str,
        callback: F,
    ) -> Result<ObserverHandle>
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let subscriber = Subscriber::new(node.handle(), Arc::new(callback));
        let batch = Batch::open(self);
        let id = self.mutate(|core| core.graph.attach_external(subscriber, flags, operation))?;
        batch.close()?;
        Ok(ObserverHandle::new(self.downgrade(), id, node.clone()))
    }

    pub(crate) fn detach_observer(&self, id: NodeId) {
        let batch = Batch::open(self);
        self.mutate(|core| core.graph.detach_external(id));
        if let Err(error) = batch.close() {
            warn!(%error, "flush after detaching an observer failed");
        }
    }

    // ---- Events ----

    /// Register an event listener. An empty `kinds` slice receives every
    /// event.
    pub fn on<F>(&self, kinds: &[EventKind], listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.events.on(kinds, Arc::new(listener))
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }

    // ---- Introspection ----

    pub fn status(&self, node: &NodeRef) -> NodeStatus {
        self.mutate(|core| {
            core.graph
                .get(node.handle())
                .map_or(NodeStatus::Destroyed, |entry| entry.status)
        })
    }

    /// The live node registered under `id`.
    pub fn node_ref(&self, id: &str) -> Option<NodeRef> {
        self.mutate(|core| {
            let handle = core.graph.lookup(id)?;
            core.graph.get(handle).map(|entry| entry.node.clone())
        })
    }

    pub fn node_count(&self) -> usize {
        self.mutate(|core| core.graph.len())
    }

    /// The node currently evaluating in this ecosystem, if any.
    pub fn current_node(&self) -> Option<NodeRef> {
        let handle = EvaluationContext::current(self.inner.instance)?;
        self.mutate(|core| core.graph.get(handle).map(|entry| entry.node.clone()))
    }

    /// Reasons of the pending re-evaluation, or of the most recent one.
    pub fn why(&self, node: &NodeRef) -> Vec<Reason> {
        self.mutate(|core| {
            let Some(entry) = core.graph.get(node.handle()) else {
                return Vec::new();
            };
            if entry.reasons.is_empty() {
                entry.last_reasons.clone()
            } else {
                entry.reasons.to_vec()
            }
        })
    }

    pub fn weight(&self, node: &NodeRef) -> Option<u32> {
        self.mutate(|core| core.graph.get(node.handle()).map(|entry| entry.weight))
    }

    pub fn sources(&self, node: &NodeRef) -> Vec<NodeRef> {
        self.mutate(|core| {
            let Some(entry) = core.graph.get(node.handle()) else {
                return Vec::new();
            };
            entry
                .sources
                .iter()
                .filter_map(|source| core.graph.get(*source))
                .map(|source| source.node.clone())
                .collect()
        })
    }

    /// Number of observers keeping `node` alive.
    pub fn observer_count(&self, node: &NodeRef) -> usize {
        self.mutate(|core| core.graph.refcount(node.handle()))
    }

    pub fn edge(&self, observer: NodeId, source: NodeId) -> Option<Edge> {
        self.mutate(|core| core.graph.edge(observer, source).cloned())
    }

    pub fn pending_jobs(&self) -> usize {
        self.mutate(|core| core.graph.scheduler.len())
    }

    pub fn view_graph(&self, mode: ViewMode) -> GraphView {
        self.mutate(|core| core.graph.view(mode))
    }

    /// Verify the structural invariants of the graph.
    pub fn check_invariants(&self) -> Result<()> {
        self.mutate(|core| core.graph.check_invariants())
    }
}

impl std::fmt::Debug for Ecosystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ecosystem")
            .field("id", &self.inner.id)
            .field("scheduler", &self.inner.config.scheduler)
            .finish()
    }
}

fn downcast<O: Clone + Send + Sync + 'static>(node: &NodeRef, value: AnyValue) -> Result<O> {
    value
        .downcast::<O>()
        .map(|value| (*value).clone())
        .map_err(|_| Error::TypeMismatch {
            id: node.id().to_owned(),
            expected: type_name::<O>(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphNode;
    use crate::reactive::{Memo, Signal, TemplateId};

    #[test]
    fn ecosystems_register_by_id() {
        let ecosystem = Ecosystem::new(EcosystemConfig::new("registry-test"));
        let found = Ecosystem::find("registry-test").unwrap();
        assert_eq!(found.id(), ecosystem.id());

        drop(found);
        drop(ecosystem);
        assert!(Ecosystem::find("registry-test").is_none());
    }

    #[test]
    fn reads_create_nodes_once() {
        let ecosystem = Ecosystem::new(EcosystemConfig::new("create-once"));
        let count = Signal::new("count", 1);

        assert_eq!(ecosystem.get(&count).unwrap(), 1);
        assert_eq!(ecosystem.get(&count).unwrap(), 1);
        assert_eq!(ecosystem.node_count(), 1);
        let node = ecosystem.node_ref("count").unwrap();
        assert_eq!(ecosystem.status(&node), NodeStatus::Active);
    }

    #[test]
    fn colliding_templates_are_rejected() {
        let ecosystem = Ecosystem::new(EcosystemConfig::new("collision"));
        ecosystem.get(&Signal::new("shared", 1)).unwrap();

        let error = ecosystem.get(&Signal::new("shared", 2)).unwrap_err();
        assert!(matches!(error, Error::IdCollision { .. }));
    }

    #[test]
    fn typed_reads_check_the_value_type() {
        let ecosystem = Ecosystem::new(EcosystemConfig::new("typed-reads"));
        let node = ecosystem.get_or_create(&Signal::new("name", "ada".to_string()), ()).unwrap();

        assert_eq!(ecosystem.peek::<String>(&node).unwrap(), "ada");
        assert!(matches!(
            ecosystem.peek::<u32>(&node),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn track_requires_an_evaluation() {
        let ecosystem = Ecosystem::new(EcosystemConfig::new("track-outside"));
        let node = ecosystem.get_or_create(&Signal::new("n", 0), ()).unwrap();
        let error = ecosystem.track(&node, EdgeFlags::DYNAMIC, "get").unwrap_err();
        assert!(matches!(error, Error::NoActiveEvaluation { .. }));
    }

    #[test]
    fn memos_cannot_write() {
        let ecosystem = Ecosystem::new(EcosystemConfig::new("not-writable"));
        let memo = Memo::new("constant", |_| Ok(1));
        let node = ecosystem.get_or_create(&memo, ()).unwrap();
        assert!(matches!(
            ecosystem.write(&node, 2),
            Err(Error::NotWritable(_))
        ));
    }

    #[test]
    fn self_reads_are_cycles() {
        let ecosystem = Ecosystem::new(EcosystemConfig::new("self-read"));
        let looped: Memo<i32> = Memo::new("looped", |ecosystem| {
            let node = ecosystem.node_ref("looped").ok_or_else(|| Error::msg("missing"))?;
            ecosystem.read::<i32>(&node)
        });

        assert!(matches!(ecosystem.get(&looped), Err(Error::Cycle(_))));
        assert_eq!(ecosystem.node_count(), 0);
    }

    /// Holds every instantiation until both threads are inside one.
    struct Rendezvous {
        inner: Signal<i32>,
        barrier: std::sync::Barrier,
    }

    impl Template for Rendezvous {
        type Params = ();
        type Output = i32;

        fn key(&self) -> &str {
            self.inner.key()
        }

        fn template_id(&self) -> TemplateId {
            self.inner.template_id()
        }

        fn instantiate(&self, node: &NodeRef, params: ()) -> Arc<dyn GraphNode> {
            self.barrier.wait();
            self.inner.instantiate(node, params)
        }
    }

    #[test]
    fn concurrent_lookups_share_one_node() {
        let ecosystem = Ecosystem::new(EcosystemConfig::new("concurrent-create"));
        let template = Arc::new(Rendezvous {
            inner: Signal::new("shared", 1),
            barrier: std::sync::Barrier::new(2),
        });

        let lookups: Vec<_> = (0..2)
            .map(|_| {
                let ecosystem = ecosystem.clone();
                let template = Arc::clone(&template);
                std::thread::spawn(move || ecosystem.get_or_create(template.as_ref(), ()))
            })
            .collect();
        let nodes: Vec<NodeRef> = lookups
            .into_iter()
            .map(|lookup| lookup.join().unwrap().unwrap())
            .collect();

        assert_eq!(nodes[0], nodes[1]);
        assert_eq!(ecosystem.node_count(), 1);
        ecosystem.check_invariants().unwrap();
    }
}
