//! Update Scheduler
//!
//! The scheduler holds pending propagation work and hands it out in an order
//! that never evaluates a node before its changed dependencies settled.
//!
//! # Ordering
//!
//! Jobs live in two queues:
//!
//! 1. The immediate queue holds store-update jobs (informing observers of a
//!    direct write). It is always drained before the main queue.
//! 2. The main queue is ordered by job class, then by node weight, then by
//!    insertion order. Interrupts come first, then node re-evaluations,
//!    external observer notifications, and finally side effects.
//!
//! Weight is a lower bound on a node's depth, so sorting by weight within a
//! class is enough to run upstream nodes before downstream ones without a
//! topological sort on every change.
//!
//! Both queues are ordered maps keyed by a job's slot, and every pending key
//! remembers its slot, so scheduling, cancelling and popping are all
//! logarithmic.
//!
//! # Reentrancy
//!
//! `pre`/`post` maintain a suppression depth. A flush only starts when the
//! depth is zero and no flush is already running; nested callers rely on the
//! outermost flush to drain the queue.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::node::NodeId;
use crate::ecosystem::Ecosystem;
use crate::error::Result;

/// Job class, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Informs observers of a direct write. Runs from the immediate queue.
    Inform,
    /// Runs before every other main-queue job.
    Interrupt,
    /// Re-evaluates a graph node.
    Evaluate,
    /// Notifies an observer living outside the graph.
    External,
    /// Side effects and cleanup (effects, destruction, ttl arming).
    Effect,
}

/// Identity of a pending job, used for coalescing and cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKey {
    Inform(NodeId),
    Evaluate(NodeId),
    Notify(NodeId),
    Destroy(NodeId),
    Arm(NodeId),
    Task(u64),
}

/// Arbitrary work run against the ecosystem.
pub type Task = Box<dyn FnOnce(&Ecosystem) -> Result<()> + Send>;

/// A unit of pending work.
pub struct Job {
    pub key: JobKey,
    pub kind: JobKind,
    pub weight: u32,
    pub(crate) task: Option<Task>,
}

impl Job {
    pub fn new(key: JobKey, kind: JobKind, weight: u32) -> Self {
        Self {
            key,
            kind,
            weight,
            task: None,
        }
    }

    /// A job wrapping a closure. Each task job has its own identity.
    pub fn task(kind: JobKind, task: Task) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self {
            key: JobKey::Task(COUNTER.fetch_add(1, Ordering::Relaxed)),
            kind,
            weight: 0,
            task: Some(task),
        }
    }

    fn slot(&self, seq: u64) -> Slot {
        match self.kind {
            // interrupts stay FIFO regardless of weight
            JobKind::Interrupt => (self.kind, 0, seq),
            _ => (self.kind, self.weight, seq),
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("weight", &self.weight)
            .finish()
    }
}

/// Whether flushes run synchronously or at the next task boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerMode {
    #[default]
    Sync,
    /// Flushes are deferred to a spawned tokio task.
    Async,
}

/// Position of a job in the main queue: class, weight, insertion sequence.
type Slot = (JobKind, u32, u64);

/// Where a pending job lives.
#[derive(Debug, Clone, Copy)]
enum Queued {
    Immediate(u64),
    Main(Slot),
}

/// The job queue.
pub struct Scheduler {
    mode: SchedulerMode,
    immediate: BTreeMap<u64, Job>,
    queue: BTreeMap<Slot, Job>,
    pending: HashMap<JobKey, Queued>,
    seq: u64,
    suppress: usize,
    flushing: bool,
    deferred: bool,
}

impl Scheduler {
    /// Create an empty scheduler.
    pub fn new(mode: SchedulerMode) -> Self {
        Self {
            mode,
            immediate: BTreeMap::new(),
            queue: BTreeMap::new(),
            pending: HashMap::new(),
            seq: 0,
            suppress: 0,
            flushing: false,
            deferred: false,
        }
    }

    pub fn mode(&self) -> SchedulerMode {
        self.mode
    }

    /// Queue a job. Returns `false` when a job with the same key is already
    /// pending, in which case the new job is coalesced into it.
    pub fn schedule(&mut self, job: Job) -> bool {
        if self.pending.contains_key(&job.key) {
            return false;
        }
        let key = job.key;
        self.seq += 1;
        let queued = if job.kind == JobKind::Inform {
            self.immediate.insert(self.seq, job);
            Queued::Immediate(self.seq)
        } else {
            let slot = job.slot(self.seq);
            self.queue.insert(slot, job);
            Queued::Main(slot)
        };
        self.pending.insert(key, queued);
        true
    }

    /// Remove a pending job. Returns whether it was pending.
    pub fn unschedule(&mut self, key: &JobKey) -> bool {
        self.take(key).is_some()
    }

    fn take(&mut self, key: &JobKey) -> Option<Job> {
        match self.pending.remove(key)? {
            Queued::Immediate(seq) => self.immediate.remove(&seq),
            Queued::Main(slot) => self.queue.remove(&slot),
        }
    }

    /// Whether a job with this key is pending.
    pub fn is_scheduled(&self, key: &JobKey) -> bool {
        self.pending.contains_key(key)
    }

    /// Move a pending job to the position matching its new weight.
    pub fn reweight(&mut self, key: &JobKey, weight: u32) {
        match self.pending.get(key) {
            Some(Queued::Main((_, current, _))) if *current != weight => {}
            _ => return,
        }
        if let Some(mut job) = self.take(key) {
            job.weight = weight;
            self.schedule(job);
        }
    }

    /// Take the next job to run.
    pub fn pop(&mut self) -> Option<Job> {
        let job = self
            .immediate
            .pop_first()
            .map(|(_, job)| job)
            .or_else(|| self.queue.pop_first().map(|(_, job)| job))?;
        self.pending.remove(&job.key);
        Some(job)
    }

    /// Suppress flushing until the matching `post`.
    pub fn pre(&mut self) {
        self.suppress += 1;
    }

    /// Release one level of suppression. Returns `true` when the caller
    /// should start a flush.
    pub fn post(&mut self) -> bool {
        debug_assert!(self.suppress > 0, "post() without matching pre()");
        self.suppress = self.suppress.saturating_sub(1);
        self.suppress == 0 && !self.flushing && !self.is_empty()
    }

    /// Enter the flushing state. Returns `false` when a flush is already
    /// running or flushing is suppressed.
    pub fn begin_flush(&mut self) -> bool {
        if self.flushing || self.suppress > 0 {
            return false;
        }
        self.flushing = true;
        true
    }

    pub fn end_flush(&mut self) {
        self.flushing = false;
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing
    }

    /// Mark a deferred flush as requested. Returns `false` if one already is.
    pub(crate) fn request_deferred_flush(&mut self) -> bool {
        !std::mem::replace(&mut self.deferred, true)
    }

    pub(crate) fn clear_deferred_flush(&mut self) {
        self.deferred = false;
    }

    /// Number of pending jobs.
    pub fn len(&self) -> usize {
        self.immediate.len() + self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.immediate.is_empty() && self.queue.is_empty()
    }

    /// Drop every pending job.
    pub fn clear(&mut self) {
        self.immediate.clear();
        self.queue.clear();
        self.pending.clear();
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerMode::Sync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(scheduler: &mut Scheduler) -> Vec<JobKey> {
        std::iter::from_fn(|| scheduler.pop()).map(|job| job.key).collect()
    }

    #[test]
    fn orders_by_class_then_weight() {
        let mut scheduler = Scheduler::default();
        let (a, b, c, d) = (NodeId::new(), NodeId::new(), NodeId::new(), NodeId::new());

        scheduler.schedule(Job::new(JobKey::Destroy(a), JobKind::Effect, 1));
        scheduler.schedule(Job::new(JobKey::Evaluate(b), JobKind::Evaluate, 3));
        scheduler.schedule(Job::new(JobKey::Notify(c), JobKind::External, 1));
        scheduler.schedule(Job::new(JobKey::Evaluate(d), JobKind::Evaluate, 2));

        assert_eq!(
            drain(&mut scheduler),
            vec![
                JobKey::Evaluate(d),
                JobKey::Evaluate(b),
                JobKey::Notify(c),
                JobKey::Destroy(a),
            ]
        );
    }

    #[test]
    fn equal_weights_keep_insertion_order() {
        let mut scheduler = Scheduler::default();
        let ids: Vec<_> = (0..4).map(|_| NodeId::new()).collect();
        for id in &ids {
            scheduler.schedule(Job::new(JobKey::Evaluate(*id), JobKind::Evaluate, 2));
        }
        let expected: Vec<_> = ids.iter().map(|id| JobKey::Evaluate(*id)).collect();
        assert_eq!(drain(&mut scheduler), expected);
    }

    #[test]
    fn interrupts_run_before_queued_work() {
        let mut scheduler = Scheduler::default();
        let node = NodeId::new();
        scheduler.schedule(Job::new(JobKey::Evaluate(node), JobKind::Evaluate, 1));
        let first = Job::task(JobKind::Interrupt, Box::new(|_| Ok(())));
        let second = Job::task(JobKind::Interrupt, Box::new(|_| Ok(())));
        let (first_key, second_key) = (first.key, second.key);
        scheduler.schedule(first);
        scheduler.schedule(second);

        assert_eq!(
            drain(&mut scheduler),
            vec![first_key, second_key, JobKey::Evaluate(node)]
        );
    }

    #[test]
    fn immediate_queue_drains_first() {
        let mut scheduler = Scheduler::default();
        let (a, b) = (NodeId::new(), NodeId::new());
        scheduler.schedule(Job::new(JobKey::Evaluate(a), JobKind::Evaluate, 1));
        scheduler.schedule(Job::new(JobKey::Inform(b), JobKind::Inform, 9));

        assert_eq!(drain(&mut scheduler), vec![JobKey::Inform(b), JobKey::Evaluate(a)]);
    }

    #[test]
    fn duplicate_keys_are_coalesced() {
        let mut scheduler = Scheduler::default();
        let node = NodeId::new();
        assert!(scheduler.schedule(Job::new(JobKey::Evaluate(node), JobKind::Evaluate, 1)));
        assert!(!scheduler.schedule(Job::new(JobKey::Evaluate(node), JobKind::Evaluate, 1)));
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn unschedule_removes_pending_jobs() {
        let mut scheduler = Scheduler::default();
        let node = NodeId::new();
        scheduler.schedule(Job::new(JobKey::Destroy(node), JobKind::Effect, 1));
        assert!(scheduler.is_scheduled(&JobKey::Destroy(node)));

        assert!(scheduler.unschedule(&JobKey::Destroy(node)));
        assert!(!scheduler.unschedule(&JobKey::Destroy(node)));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn reweight_moves_jobs() {
        let mut scheduler = Scheduler::default();
        let (a, b) = (NodeId::new(), NodeId::new());
        scheduler.schedule(Job::new(JobKey::Evaluate(a), JobKind::Evaluate, 1));
        scheduler.schedule(Job::new(JobKey::Evaluate(b), JobKind::Evaluate, 2));

        scheduler.reweight(&JobKey::Evaluate(a), 5);
        assert_eq!(drain(&mut scheduler), vec![JobKey::Evaluate(b), JobKey::Evaluate(a)]);
    }

    #[test]
    fn cancelled_jobs_leave_the_rest_in_order() {
        let mut scheduler = Scheduler::default();
        let ids: Vec<_> = (0..1000).map(|_| NodeId::new()).collect();
        for (weight, id) in ids.iter().enumerate() {
            let weight = 1000 - weight as u32;
            scheduler.schedule(Job::new(JobKey::Evaluate(*id), JobKind::Evaluate, weight));
            scheduler.schedule(Job::new(JobKey::Inform(*id), JobKind::Inform, weight));
        }
        for id in ids.iter().step_by(2) {
            assert!(scheduler.unschedule(&JobKey::Evaluate(*id)));
            assert!(scheduler.unschedule(&JobKey::Inform(*id)));
        }
        assert_eq!(scheduler.len(), 1000);

        let drained = drain(&mut scheduler);
        let informs: Vec<_> = ids.iter().skip(1).step_by(2).map(|id| JobKey::Inform(*id)).collect();
        let evaluations: Vec<_> = ids
            .iter()
            .skip(1)
            .step_by(2)
            .rev()
            .map(|id| JobKey::Evaluate(*id))
            .collect();
        assert_eq!(drained[..500], informs[..]);
        assert_eq!(drained[500..], evaluations[..]);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn suppression_is_reference_counted() {
        let mut scheduler = Scheduler::default();
        scheduler.schedule(Job::new(JobKey::Evaluate(NodeId::new()), JobKind::Evaluate, 1));

        scheduler.pre();
        scheduler.pre();
        assert!(!scheduler.begin_flush());
        assert!(!scheduler.post());
        assert!(scheduler.post());
        assert!(scheduler.begin_flush());
        assert!(!scheduler.begin_flush());
        scheduler.end_flush();
    }

    #[test]
    fn post_does_not_request_a_flush_while_flushing() {
        let mut scheduler = Scheduler::default();
        scheduler.schedule(Job::new(JobKey::Evaluate(NodeId::new()), JobKind::Evaluate, 1));
        assert!(scheduler.begin_flush());
        scheduler.pre();
        assert!(!scheduler.post());
    }
}
