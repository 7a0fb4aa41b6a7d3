//! Bulk state transfer.
//!
//! `dehydrate` collects the serialized values of every node whose kind
//! persists; `hydrate` feeds such a snapshot back, either to nodes created
//! later or (retroactively) to live ones through a normal state update. The
//! format is whatever each node kind's hooks produce.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{Batch, Ecosystem};
use crate::error::{Error, Result};
use crate::graph::{GraphNode, NodeId};

/// Serialized node values keyed by node id, in creation order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(IndexMap<String, Value>);

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(id.into(), value)
    }

    pub fn get(&self, id: &str) -> Option<&Value> {
        self.0.get(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn into_inner(self) -> IndexMap<String, Value> {
        self.0
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|error| Error::serialization("snapshot", error))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|error| Error::serialization("snapshot", error))
    }

    /// Encode as MessagePack.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(self).map_err(|error| Error::serialization("snapshot", error))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|error| Error::serialization("snapshot", error))
    }
}

impl FromIterator<(String, Value)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Selects nodes for dehydration.
///
/// A pattern matches a node when it equals the node's template key or occurs
/// in its id. Nothing included means everything is included; exclusion wins.
#[derive(Debug, Clone, Default)]
pub struct DehydrateFilter {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl DehydrateFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.include.push(pattern.into());
        self
    }

    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude.push(pattern.into());
        self
    }

    fn matches(&self, id: &str, key: &str) -> bool {
        let hit = |pattern: &String| pattern == key || id.contains(pattern.as_str());
        if self.exclude.iter().any(hit) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(hit)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HydrateOptions {
    /// Also update nodes that already exist.
    pub retroactive: bool,
}

impl Ecosystem {
    /// Serialize the value of every matching node that persists.
    pub fn dehydrate(&self, filter: &DehydrateFilter) -> Result<Snapshot> {
        let bodies: Vec<(String, Arc<dyn GraphNode>)> = self.mutate(|core| {
            core.graph
                .entries()
                .filter(|entry| filter.matches(entry.id(), &entry.template_key))
                .map(|entry| (entry.id().to_owned(), Arc::clone(&entry.body)))
                .collect()
        });

        let mut snapshot = Snapshot::new();
        for (id, body) in bodies {
            if let Some(value) = body.dehydrate()? {
                snapshot.insert(id, value);
            }
        }
        Ok(snapshot)
    }

    /// Feed serialized values back.
    ///
    /// Values for nodes that do not exist yet are kept until those nodes are
    /// created. With `retroactive`, live nodes are updated immediately and
    /// their observers are scheduled like after a write.
    pub fn hydrate(&self, snapshot: Snapshot, options: HydrateOptions) -> Result<()> {
        let batch = Batch::open(self);
        let live: Vec<(NodeId, Arc<dyn GraphNode>, Value)> = self.mutate(|core| {
            let mut live = Vec::new();
            for (id, value) in snapshot.into_inner() {
                let existing = core.graph.lookup(&id).and_then(|handle| core.graph.get(handle));
                match existing {
                    Some(entry) if options.retroactive => {
                        live.push((entry.handle(), Arc::clone(&entry.body), value));
                    }
                    _ => {
                        core.hydration.insert(id, value);
                    }
                }
            }
            live
        });
        debug!(retroactive = live.len(), "hydrating");

        let mut first_error = None;
        for (handle, body, value) in live {
            let old_value = body.value();
            match body.hydrate(value) {
                Ok(true) => {
                    let new_value = body.value();
                    self.mutate(|core| core.graph.publish(handle, old_value, new_value));
                }
                Ok(false) => {}
                Err(error) => {
                    first_error.get_or_insert(error);
                }
            }
        }

        let flushed = batch.close();
        match first_error {
            Some(error) => Err(error),
            None => flushed,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample() -> Snapshot {
        [
            ("count".to_string(), json!(3)),
            ("user-\"ada\"".to_string(), json!({"name": "Ada", "tags": [1, 2]})),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn snapshots_encode_to_json_in_order() {
        let json = sample().to_json().unwrap();
        assert!(json.starts_with(r#"{"count":3"#));
        assert_eq!(Snapshot::from_json(&json).unwrap(), sample());
    }

    #[test]
    fn snapshots_encode_to_msgpack() {
        let bytes = sample().to_msgpack().unwrap();
        let decoded = Snapshot::from_msgpack(&bytes).unwrap();
        assert_eq!(decoded.get("count"), Some(&json!(3)));
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn filters_match_keys_and_ids() {
        let filter = DehydrateFilter::all().include("user").exclude("admin");
        assert!(filter.matches("user-1", "user"));
        assert!(!filter.matches("user-admin", "user"));
        assert!(!filter.matches("count", "count"));
        assert!(DehydrateFilter::all().matches("anything", "k"));
    }
}
