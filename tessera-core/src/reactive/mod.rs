//! Reactive Primitives
//!
//! This module holds the evaluation context that turns reads into edges, and
//! the node kinds built on the graph engine: signals, memos, effects and
//! external observers.
//!
//! # Concepts
//!
//! ## Templates
//!
//! Nodes are never created directly. A [`Template`] describes a node kind and
//! the ecosystem instantiates it on first use, once per distinct params
//! value.
//!
//! ## Signals
//!
//! A Signal is a container for mutable state. Writes propagate to every node
//! that read it dynamically.
//!
//! ## Memos
//!
//! A Memo is a derived value that caches its result and re-evaluates when one
//! of its sources changes.
//!
//! ## Effects
//!
//! An Effect is a side-effecting computation re-run after the rest of the
//! graph settled.
//!
//! ## Observers
//!
//! External observers are callbacks outside the graph. They keep their
//! source alive until their [`ObserverHandle`] is dropped.
//!
//! # Implementation Notes
//!
//! Dependencies are detected automatically. Reads performed while a node
//! evaluates are recorded in a thread-local evaluation frame and diffed
//! against the node's previous sources once it returns.

mod context;
mod effect;
mod memo;
mod signal;
mod subscriber;
mod template;

pub(crate) use context::EvaluationContext;
pub use effect::Effect;
pub use memo::Memo;
pub use signal::Signal;
pub(crate) use subscriber::Subscriber;
pub use subscriber::{Notification, ObserverHandle, SubscriberCallback};
pub use template::{Ref, Template, TemplateId};
