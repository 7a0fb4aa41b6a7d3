//! Tessera Core
//!
//! This crate provides the reactive dependency graph engine behind an atomic
//! state-management library. It implements:
//!
//! - A graph of nodes and flagged edges with incremental weight tracking
//! - A prioritized, coalescing job scheduler with batching
//! - Automatic dependency tracking through buffered evaluation frames
//! - A node lifecycle with deferred (ttl) destruction
//! - Reference node kinds: signals, memos, effects and external observers
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: node arena, edges, weights, scheduler and the destruction state
//!   machine
//! - `reactive`: the evaluation context and node kinds built on the graph
//! - `ecosystem`: the container exposing every operation, plus events,
//!   overrides, hydration and deferral drivers
//! - `error`: the crate-wide error type
//!
//! # Example
//!
//! ```rust,ignore
//! use tessera_core::{Ecosystem, EcosystemConfig, Memo, Signal};
//!
//! let ecosystem = Ecosystem::new(EcosystemConfig::default());
//! let count = Signal::new("count", 1);
//! let doubled = Memo::new("doubled", {
//!     let count = count.clone();
//!     move |ecosystem| Ok(ecosystem.get(&count)? * 2)
//! });
//!
//! let node = ecosystem.get_or_create(&doubled, ())?;
//! let _handle = ecosystem.observe(&node, |notification| {
//!     println!("doubled: {:?}", notification.value_as::<i32>());
//! })?;
//!
//! ecosystem.set(&count, 5)?;
//! // prints "doubled: Some(10)"
//! ```

pub mod ecosystem;
pub mod error;
pub mod graph;
pub mod reactive;

pub use ecosystem::config::EcosystemConfig;
pub use ecosystem::events::{Event, EventKind, ListenerId};
pub use ecosystem::hydration::{DehydrateFilter, HydrateOptions, Snapshot};
pub use ecosystem::overrides::Override;
pub use ecosystem::timer::{CancelHandle, DeferralSignal, ManualTimer, Timer, TokioTimer, Trigger};
pub use ecosystem::{Ecosystem, ResetOptions, WeakEcosystem};
pub use error::{Error, Result};
pub use graph::{EdgeFlags, JobKind, NodeId, NodeRef, NodeStatus, ObserverSignal, Reason, ReasonKind, SchedulerMode, Ttl, ViewMode};
pub use reactive::{Effect, Memo, Notification, ObserverHandle, Ref, Signal, Template};
