//! External observers.
//!
//! A subscriber represents a callback living outside the graph, such as a UI
//! component. It owns one external edge to its source and is notified through
//! jobs in the external-notification class.

use std::fmt;
use std::sync::Arc;

use crate::ecosystem::WeakEcosystem;
use crate::graph::{AnyValue, NodeId, NodeRef, ObserverSignal, Reason};

/// Callback invoked with each notification.
pub type SubscriberCallback = Arc<dyn Fn(&Notification) + Send + Sync>;

/// What an external observer receives.
#[derive(Debug, Clone)]
pub struct Notification {
    pub signal: ObserverSignal,
    /// The source's current value, or its last value if it was destroyed.
    pub value: Option<AnyValue>,
    /// Causes accumulated since the previous notification.
    pub reasons: Vec<Reason>,
}

impl Notification {
    pub fn value_as<T: 'static>(&self) -> Option<&T> {
        self.value.as_deref()?.downcast_ref()
    }

    pub fn is_destroyed(&self) -> bool {
        self.signal == ObserverSignal::Destroyed
    }
}

/// Engine-side record of an external observer.
pub(crate) struct Subscriber {
    id: NodeId,
    label: String,
    source: NodeId,
    callback: SubscriberCallback,
    pending: Option<ObserverSignal>,
    reasons: Vec<Reason>,
    detached: bool,
    last_value: Option<AnyValue>,
}

impl Subscriber {
    pub(crate) fn new(source: NodeId, callback: SubscriberCallback) -> Self {
        let id = NodeId::new();
        Self {
            id,
            label: format!("@observer-{}", id.raw()),
            source,
            callback,
            pending: None,
            reasons: Vec::new(),
            detached: false,
            last_value: None,
        }
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn source(&self) -> NodeId {
        self.source
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached
    }

    /// Merge a signal into the pending notification.
    pub(crate) fn push(&mut self, signal: ObserverSignal, reasons: &[Reason]) {
        self.pending = Some(ObserverSignal::supersede(self.pending.take(), signal));
        self.reasons.extend(reasons.iter().cloned());
    }

    /// The source is gone; remember its final value for the last delivery.
    pub(crate) fn detach(&mut self, last_value: Option<AnyValue>) {
        self.detached = true;
        self.last_value = last_value;
    }

    /// Take the pending notification, if any.
    pub(crate) fn take(
        &mut self,
        current: Option<AnyValue>,
    ) -> Option<(SubscriberCallback, Notification)> {
        let signal = self.pending.take()?;
        let value = if self.detached {
            self.last_value.take()
        } else {
            current
        };
        let notification = Notification {
            signal,
            value,
            reasons: std::mem::take(&mut self.reasons),
        };
        Some((Arc::clone(&self.callback), notification))
    }
}

/// Handle to an external observer. Dropping it detaches the observer.
#[must_use = "dropping an ObserverHandle detaches the observer immediately"]
pub struct ObserverHandle {
    ecosystem: WeakEcosystem,
    id: NodeId,
    source: NodeRef,
}

impl ObserverHandle {
    pub(crate) fn new(ecosystem: WeakEcosystem, id: NodeId, source: NodeRef) -> Self {
        Self {
            ecosystem,
            id,
            source,
        }
    }

    /// Handle of the pseudo node representing this observer.
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn source(&self) -> &NodeRef {
        &self.source
    }

    /// Detach now. Equivalent to dropping the handle.
    pub fn cancel(self) {}
}

impl fmt::Debug for ObserverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverHandle")
            .field("id", &self.id)
            .field("source", &self.source)
            .finish()
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        if let Some(ecosystem) = self.ecosystem.upgrade() {
            ecosystem.detach_observer(self.id);
        }
    }
}
