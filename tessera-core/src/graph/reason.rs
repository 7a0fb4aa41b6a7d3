//! Causal reasons recorded between scheduling and evaluation.

use super::node::AnyValue;

/// What happened upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReasonKind {
    /// The source's value changed.
    Changed,
    /// The source was destroyed.
    Destroyed,
    /// The node was explicitly invalidated.
    Invalidated,
    /// A custom event was sent through the source.
    Event(String),
}

/// One causal reason for a (pending) re-evaluation or notification.
#[derive(Debug, Clone)]
pub struct Reason {
    pub kind: ReasonKind,
    /// Id of the node the reason originated from.
    pub source: Option<String>,
    pub old_value: Option<AnyValue>,
    pub new_value: Option<AnyValue>,
}

impl Reason {
    pub(crate) fn changed(
        source: &str,
        old_value: Option<AnyValue>,
        new_value: Option<AnyValue>,
    ) -> Self {
        Self {
            kind: ReasonKind::Changed,
            source: Some(source.to_owned()),
            old_value,
            new_value,
        }
    }

    pub(crate) fn destroyed(source: &str) -> Self {
        Self {
            kind: ReasonKind::Destroyed,
            source: Some(source.to_owned()),
            old_value: None,
            new_value: None,
        }
    }

    pub(crate) fn invalidated() -> Self {
        Self {
            kind: ReasonKind::Invalidated,
            source: None,
            old_value: None,
            new_value: None,
        }
    }

    pub(crate) fn event(source: &str, name: &str) -> Self {
        Self {
            kind: ReasonKind::Event(name.to_owned()),
            source: Some(source.to_owned()),
            old_value: None,
            new_value: None,
        }
    }

    /// Downcast the new value carried by a `Changed` reason.
    pub fn new_value_as<T: 'static>(&self) -> Option<&T> {
        self.new_value.as_deref()?.downcast_ref()
    }

    /// Downcast the previous value carried by a `Changed` reason.
    pub fn old_value_as<T: 'static>(&self) -> Option<&T> {
        self.old_value.as_deref()?.downcast_ref()
    }
}

/// Signal delivered to external observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverSignal {
    /// The source's value changed.
    Updated,
    /// The source was destroyed; the observer is detached.
    Destroyed,
    /// A custom event was sent through the source.
    Event(String),
}

impl ObserverSignal {
    fn rank(&self) -> u8 {
        match self {
            Self::Event(_) => 0,
            Self::Updated => 1,
            Self::Destroyed => 2,
        }
    }

    /// Merge a newly scheduled signal into a pending one. Destruction
    /// supersedes updates, and updates supersede plain events.
    pub(crate) fn supersede(pending: Option<Self>, next: Self) -> Self {
        match pending {
            Some(current) if current.rank() >= next.rank() => current,
            _ => next,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn destruction_supersedes_updates() {
        let merged = ObserverSignal::supersede(Some(ObserverSignal::Updated), ObserverSignal::Destroyed);
        assert_eq!(merged, ObserverSignal::Destroyed);

        let merged = ObserverSignal::supersede(Some(ObserverSignal::Destroyed), ObserverSignal::Updated);
        assert_eq!(merged, ObserverSignal::Destroyed);

        let merged = ObserverSignal::supersede(None, ObserverSignal::Event("ping".into()));
        assert_eq!(merged, ObserverSignal::Event("ping".into()));
    }

    #[test]
    fn reasons_downcast_values() {
        let reason = Reason::changed("count", Some(Arc::new(1_i32)), Some(Arc::new(2_i32)));
        assert_eq!(reason.old_value_as::<i32>(), Some(&1));
        assert_eq!(reason.new_value_as::<i32>(), Some(&2));
        assert_eq!(reason.new_value_as::<String>(), None);
    }
}
