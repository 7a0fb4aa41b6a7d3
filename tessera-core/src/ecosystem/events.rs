//! Event bus for observability hooks.
//!
//! Events are built only while at least one listener is registered and are
//! dispatched after the engine released its lock, so listeners may call back
//! into the ecosystem.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::graph::{AnyValue, EdgeFlags, NodeStatus};

/// Discriminant of an [`Event`], used to filter listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Change,
    Cycle,
    Edge,
    Error,
    Invalidate,
    RunStart,
    RunEnd,
    ResetStart,
    ResetEnd,
    Reused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeAction {
    Add,
    Update,
    Remove,
}

#[derive(Debug, Clone)]
pub enum Event {
    /// A node's value changed.
    Change {
        node: String,
        old_value: Option<AnyValue>,
        new_value: Option<AnyValue>,
    },
    /// A node moved through its lifecycle. `old_status` is `None` on creation.
    Cycle {
        node: String,
        old_status: Option<NodeStatus>,
        new_status: NodeStatus,
    },
    Edge {
        observer: String,
        source: String,
        action: EdgeAction,
        flags: EdgeFlags,
        operation: String,
    },
    /// An evaluation failed.
    Error { node: Option<String>, error: Error },
    Invalidate { node: String },
    RunStart { node: String },
    RunEnd { node: String },
    ResetStart,
    ResetEnd,
    /// A lookup returned an existing node.
    Reused { node: String },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Change { .. } => EventKind::Change,
            Self::Cycle { .. } => EventKind::Cycle,
            Self::Edge { .. } => EventKind::Edge,
            Self::Error { .. } => EventKind::Error,
            Self::Invalidate { .. } => EventKind::Invalidate,
            Self::RunStart { .. } => EventKind::RunStart,
            Self::RunEnd { .. } => EventKind::RunEnd,
            Self::ResetStart => EventKind::ResetStart,
            Self::ResetEnd => EventKind::ResetEnd,
            Self::Reused { .. } => EventKind::Reused,
        }
    }

    /// Id of the node the event is about, if any.
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::Change { node, .. }
            | Self::Cycle { node, .. }
            | Self::Invalidate { node }
            | Self::RunStart { node }
            | Self::RunEnd { node }
            | Self::Reused { node } => Some(node),
            Self::Edge { source, .. } => Some(source),
            Self::Error { node, .. } => node.as_deref(),
            Self::ResetStart | Self::ResetEnd => None,
        }
    }
}

/// Handle returned by `Ecosystem::on`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

struct Registration {
    id: ListenerId,
    kinds: Vec<EventKind>,
    listener: Listener,
}

#[derive(Default)]
pub(crate) struct EventBus {
    listeners: RwLock<Vec<Registration>>,
    count: AtomicUsize,
}

impl EventBus {
    /// Register a listener. An empty `kinds` slice receives every event.
    pub(crate) fn on(&self, kinds: &[EventKind], listener: Listener) -> ListenerId {
        let id = ListenerId::new();
        let mut listeners = self.listeners.write();
        listeners.push(Registration {
            id,
            kinds: kinds.to_vec(),
            listener,
        });
        self.count.store(listeners.len(), Ordering::Release);
        id
    }

    pub(crate) fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|registration| registration.id != id);
        self.count.store(listeners.len(), Ordering::Release);
        listeners.len() != before
    }

    pub(crate) fn clear(&self) {
        self.listeners.write().clear();
        self.count.store(0, Ordering::Release);
    }

    pub(crate) fn is_listening(&self) -> bool {
        self.count.load(Ordering::Acquire) > 0
    }

    pub(crate) fn emit(&self, event: &Event) {
        let kind = event.kind();
        let targets: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .filter(|registration| registration.kinds.is_empty() || registration.kinds.contains(&kind))
            .map(|registration| Arc::clone(&registration.listener))
            .collect();
        for listener in targets {
            listener(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn listeners_filter_by_kind() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        bus.on(
            &[EventKind::RunStart],
            Arc::new(move |event| sink.lock().unwrap().push(event.kind())),
        );
        assert!(bus.is_listening());

        bus.emit(&Event::RunStart { node: "a".into() });
        bus.emit(&Event::RunEnd { node: "a".into() });
        assert_eq!(*seen.lock().unwrap(), vec![EventKind::RunStart]);
    }

    #[test]
    fn off_removes_listeners() {
        let bus = EventBus::default();
        let id = bus.on(&[], Arc::new(|_| {}));
        assert!(bus.off(id));
        assert!(!bus.off(id));
        assert!(!bus.is_listening());
    }

    #[test]
    fn events_expose_their_node() {
        let event = Event::Reused { node: "user-1".into() };
        assert_eq!(event.node(), Some("user-1"));
        assert_eq!(Event::ResetEnd.node(), None);
    }
}
