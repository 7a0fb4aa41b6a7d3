//! Evaluation Context
//!
//! The evaluation context tracks which node is currently evaluating and
//! buffers the edges its reads create.
//!
//! # Implementation
//!
//! We use a thread-local stack of frames. Evaluating a node pushes a frame
//! for it; nested evaluations push their own frame on top and pop it when
//! they finish, which restores the outer node as the current one.
//!
//! Reads never touch the live graph directly. They land in the top frame's
//! buffer, and once the evaluation returns the buffer is diffed against the
//! node's existing sources ([`Frame::apply`]) or thrown away if it failed
//! ([`Frame::discard`]).
//!
//! Frames carry the id of the ecosystem that opened them, so reads against a
//! different ecosystem inside an evaluation are never recorded. A frame with
//! no observer suppresses tracking entirely (see `Ecosystem::untracked`).

use std::cell::RefCell;

use indexmap::IndexMap;
use tracing::trace;

use crate::error::Result;
use crate::graph::{EdgeFlags, EdgeKey, Graph, NodeId};

thread_local! {
    static FRAMES: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// An edge recorded during an evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BufferedEdge {
    pub(crate) flags: EdgeFlags,
    pub(crate) operation: &'static str,
}

/// One level of the evaluation stack.
#[derive(Debug)]
pub(crate) struct Frame {
    ecosystem: u64,
    observer: Option<NodeId>,
    buffer: IndexMap<NodeId, BufferedEdge>,
}

/// Guard that pops its frame when dropped.
///
/// This keeps the stack balanced even if an evaluation body panics.
pub(crate) struct EvaluationContext {
    ecosystem: u64,
    observer: Option<NodeId>,
    finished: bool,
}

impl EvaluationContext {
    /// Push a frame. `None` opens an untracked frame.
    pub(crate) fn enter(ecosystem: u64, observer: Option<NodeId>) -> Self {
        FRAMES.with(|frames| {
            frames.borrow_mut().push(Frame {
                ecosystem,
                observer,
                buffer: IndexMap::new(),
            });
        });
        Self {
            ecosystem,
            observer,
            finished: false,
        }
    }

    /// Pop the frame and hand over its buffer.
    pub(crate) fn finish(mut self) -> Frame {
        self.finished = true;
        self.pop().unwrap_or(Frame {
            ecosystem: self.ecosystem,
            observer: self.observer,
            buffer: IndexMap::new(),
        })
    }

    fn pop(&self) -> Option<Frame> {
        let frame = FRAMES.with(|frames| frames.borrow_mut().pop());
        if let Some(frame) = &frame {
            debug_assert!(
                frame.ecosystem == self.ecosystem && frame.observer == self.observer,
                "EvaluationContext mismatch: expected {:?}, got {:?}",
                self.observer,
                frame.observer
            );
        }
        frame
    }

    /// The node evaluating in `ecosystem`, if the innermost frame belongs to it.
    pub(crate) fn current(ecosystem: u64) -> Option<NodeId> {
        FRAMES.with(|frames| {
            frames
                .borrow()
                .last()
                .filter(|frame| frame.ecosystem == ecosystem)
                .and_then(|frame| frame.observer)
        })
    }

    /// Record a read of `source` in the innermost frame. Returns whether the
    /// read was recorded.
    ///
    /// Reading the same source twice keeps the strongest relationship: flags
    /// are intersected, so one dynamic read outweighs any number of static
    /// ones.
    pub(crate) fn record(
        ecosystem: u64,
        source: NodeId,
        flags: EdgeFlags,
        operation: &'static str,
    ) -> bool {
        FRAMES.with(|frames| {
            let mut frames = frames.borrow_mut();
            let Some(frame) = frames.last_mut() else {
                return false;
            };
            if frame.ecosystem != ecosystem || frame.observer.is_none() {
                return false;
            }
            frame
                .buffer
                .entry(source)
                .and_modify(|edge| edge.flags &= flags)
                .or_insert(BufferedEdge { flags, operation });
            true
        })
    }
}

impl Drop for EvaluationContext {
    fn drop(&mut self) {
        if !self.finished {
            self.pop();
        }
    }
}

impl Frame {
    #[cfg(test)]
    pub(crate) fn observer(&self) -> Option<NodeId> {
        self.observer
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Diff the buffer against the observer's live sources.
    ///
    /// Implicit edges that were not read again are removed, new reads become
    /// edges and re-read edges take the flags of this evaluation (explicit
    /// edges stay explicit). Sources destroyed while the evaluation ran are
    /// skipped. Every edge is processed; the first error is returned.
    pub(crate) fn apply(self, graph: &mut Graph) -> Result<()> {
        let Some(observer) = self.observer else {
            return Ok(());
        };
        let Some(entry) = graph.get(observer) else {
            trace!(observer = observer.raw(), "observer destroyed during evaluation");
            return Ok(());
        };

        let stale: Vec<NodeId> = entry
            .sources
            .iter()
            .copied()
            .filter(|source| !self.buffer.contains_key(source))
            .collect();
        for source in stale {
            let explicit = graph
                .edge(observer, source)
                .is_some_and(|edge| edge.flags.is_explicit());
            if !explicit {
                graph.remove_edge(observer, source);
            }
        }

        let mut first_error = None;
        for (source, buffered) in self.buffer {
            if graph.get(source).is_none() {
                trace!(source = source.raw(), "source destroyed during evaluation");
                continue;
            }
            let result = match graph.edge(observer, source) {
                Some(edge) => {
                    let flags = buffered.flags | (edge.flags & EdgeFlags::EXPLICIT);
                    graph.update_edge(EdgeKey::new(observer, source), flags)
                }
                None => graph.add_edge(observer, source, buffered.flags, buffered.operation),
            };
            if let Err(error) = result {
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Drop the buffer of a failed evaluation. Sources that were read for the
    /// first time and have no other observers are scheduled for destruction.
    pub(crate) fn discard(self, graph: &mut Graph) {
        let Some(observer) = self.observer else {
            return;
        };
        for source in self.buffer.into_keys() {
            if graph.edge(observer, source).is_some() {
                continue;
            }
            if graph.get(source).is_some() && graph.refcount(source) == 0 {
                trace!(source = %graph.label(source), "destroying dependency of failed evaluation");
                graph.schedule_destruction(source);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ECOSYSTEM: u64 = u64::MAX;

    #[test]
    fn frames_nest_and_restore() {
        let outer = NodeId::new();
        let inner = NodeId::new();

        let outer_context = EvaluationContext::enter(ECOSYSTEM, Some(outer));
        assert_eq!(EvaluationContext::current(ECOSYSTEM), Some(outer));
        {
            let inner_context = EvaluationContext::enter(ECOSYSTEM, Some(inner));
            assert_eq!(EvaluationContext::current(ECOSYSTEM), Some(inner));
            drop(inner_context);
        }
        assert_eq!(EvaluationContext::current(ECOSYSTEM), Some(outer));
        drop(outer_context);
        assert_eq!(EvaluationContext::current(ECOSYSTEM), None);
    }

    #[test]
    fn reads_are_buffered_with_merged_flags() {
        let observer = NodeId::new();
        let source = NodeId::new();

        let context = EvaluationContext::enter(ECOSYSTEM, Some(observer));
        assert!(EvaluationContext::record(ECOSYSTEM, source, EdgeFlags::STATIC, "getNode"));
        assert!(EvaluationContext::record(ECOSYSTEM, source, EdgeFlags::DYNAMIC, "get"));
        let frame = context.finish();

        assert_eq!(frame.observer(), Some(observer));
        assert_eq!(frame.len(), 1);
        let edge = &frame.buffer[&source];
        assert_eq!(edge.flags, EdgeFlags::DYNAMIC);
        assert_eq!(edge.operation, "getNode");
    }

    #[test]
    fn untracked_frames_record_nothing() {
        let observer = NodeId::new();
        let _outer = EvaluationContext::enter(ECOSYSTEM, Some(observer));
        let untracked = EvaluationContext::enter(ECOSYSTEM, None);

        assert_eq!(EvaluationContext::current(ECOSYSTEM), None);
        assert!(!EvaluationContext::record(ECOSYSTEM, NodeId::new(), EdgeFlags::DYNAMIC, "get"));
        assert_eq!(untracked.finish().len(), 0);
    }

    #[test]
    fn other_ecosystems_are_not_tracked() {
        let _context = EvaluationContext::enter(ECOSYSTEM, Some(NodeId::new()));
        assert_eq!(EvaluationContext::current(ECOSYSTEM - 1), None);
        assert!(!EvaluationContext::record(ECOSYSTEM - 1, NodeId::new(), EdgeFlags::DYNAMIC, "get"));
    }
}
