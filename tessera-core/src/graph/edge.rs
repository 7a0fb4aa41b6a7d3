//! Graph Edges
//!
//! An edge points from an observer to the source it depends on. Internal edges
//! are stored once in the graph's edge table, keyed by `(observer, source)`,
//! and both endpoints index that same record. External observers only appear
//! on the source side.

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

use serde::{Deserialize, Serialize};

use super::node::NodeId;
use super::scheduler::JobKey;

/// Bitset describing how an observer relates to a source.
///
/// The empty set is the strongest relationship: a dynamic, implicit,
/// internal, event-aware edge that keeps its source alive.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeFlags(u8);

impl EdgeFlags {
    /// Dynamic, implicit, internal, event-aware.
    pub const DYNAMIC: Self = Self(0);
    /// The observer does not receive custom events sent through this edge.
    pub const EVENTLESS: Self = Self(1);
    /// Created by direct user action; never shed by the evaluation diff.
    pub const EXPLICIT: Self = Self(1 << 1);
    /// The observer lives outside the graph.
    pub const EXTERNAL: Self = Self(1 << 2);
    /// Only destruction reaches the observer; state changes do not.
    pub const STATIC: Self = Self(1 << 3);
    /// The observer does not count toward the source's refcount.
    pub const PASSIVE: Self = Self(1 << 4);

    const NAMES: [(Self, &'static str); 5] = [
        (Self::EVENTLESS, "EVENTLESS"),
        (Self::EXPLICIT, "EXPLICIT"),
        (Self::EXTERNAL, "EXTERNAL"),
        (Self::STATIC, "STATIC"),
        (Self::PASSIVE, "PASSIVE"),
    ];

    /// Raw bits.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Build from raw bits, dropping unknown ones.
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & 0b1_1111)
    }

    /// Whether every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_static(self) -> bool {
        self.contains(Self::STATIC)
    }

    pub fn is_external(self) -> bool {
        self.contains(Self::EXTERNAL)
    }

    pub fn is_explicit(self) -> bool {
        self.contains(Self::EXPLICIT)
    }

    pub fn is_eventless(self) -> bool {
        self.contains(Self::EVENTLESS)
    }

    pub fn is_passive(self) -> bool {
        self.contains(Self::PASSIVE)
    }
}

impl BitOr for EdgeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EdgeFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for EdgeFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl BitAndAssign for EdgeFlags {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl Not for EdgeFlags {
    type Output = Self;

    fn not(self) -> Self {
        Self::from_bits_truncate(!self.0)
    }
}

impl fmt::Debug for EdgeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("DYNAMIC");
        }
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Identifies the edge from `observer` to `source`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeKey {
    pub observer: NodeId,
    pub source: NodeId,
}

impl EdgeKey {
    pub fn new(observer: NodeId, source: NodeId) -> Self {
        Self { observer, source }
    }
}

/// The relationship record shared by both endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    /// How the observer relates to the source.
    pub flags: EdgeFlags,

    /// Human readable label of the operation that created the edge.
    pub operation: String,

    /// Notification job in flight for this edge, if any.
    pub scheduled_job: Option<JobKey>,
}

impl Edge {
    pub fn new(flags: EdgeFlags, operation: impl Into<String>) -> Self {
        Self {
            flags,
            operation: operation.into(),
            scheduled_job: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_is_the_empty_set() {
        assert_eq!(EdgeFlags::DYNAMIC.bits(), 0);
        assert!(!EdgeFlags::DYNAMIC.is_static());
        assert!(!EdgeFlags::DYNAMIC.is_external());
    }

    #[test]
    fn merging_reads_keeps_the_strongest_relationship() {
        let static_read = EdgeFlags::STATIC | EdgeFlags::EVENTLESS;
        let dynamic_read = EdgeFlags::EVENTLESS;

        let merged = static_read & dynamic_read;
        assert!(!merged.is_static());
        assert!(merged.is_eventless());
    }

    #[test]
    fn debug_lists_flag_names() {
        let flags = EdgeFlags::EXPLICIT | EdgeFlags::EXTERNAL;
        assert_eq!(format!("{flags:?}"), "EXPLICIT | EXTERNAL");
        assert_eq!(format!("{:?}", EdgeFlags::DYNAMIC), "DYNAMIC");
    }

    #[test]
    fn not_stays_within_known_bits() {
        let inverted = !EdgeFlags::EXPLICIT;
        assert!(!inverted.is_explicit());
        assert!(inverted.is_static());
        assert_eq!(inverted.bits() & !0b1_1111, 0);
    }
}
