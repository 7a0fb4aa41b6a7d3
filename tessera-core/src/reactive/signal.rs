//! Signal Implementation
//!
//! A Signal is writable state. It holds a value, produces it on its first
//! evaluation and accepts direct writes afterwards.
//!
//! # How Signals Work
//!
//! 1. The first read creates the node and evaluates it, which runs the
//!    initializer (or consumes a pending hydration value instead).
//!
//! 2. `Ecosystem::set` writes a new value. If it differs from the current
//!    one, the write is queued as an inform job that schedules every dynamic
//!    observer.
//!
//! 3. Signals live forever by default. `with_ttl` opts into destruction once
//!    unobserved.
//!
//! # Persistence
//!
//! A signal only takes part in dehydration once `persisted()` gave it a serde
//! codec.

use std::any::Any;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::template::{Template, TemplateId};
use crate::ecosystem::Ecosystem;
use crate::error::{Error, Result};
use crate::graph::{AnyValue, GraphNode, NodeRef, Ttl};

type Init<T, P> = Arc<dyn Fn(&P) -> T + Send + Sync>;

struct Codec<T> {
    encode: fn(&T) -> serde_json::Result<serde_json::Value>,
    decode: fn(serde_json::Value) -> serde_json::Result<T>,
}

impl<T> Clone for Codec<T> {
    fn clone(&self) -> Self {
        Self {
            encode: self.encode,
            decode: self.decode,
        }
    }
}

fn encode_json<T: Serialize>(value: &T) -> serde_json::Result<serde_json::Value> {
    serde_json::to_value(value)
}

fn decode_json<T: DeserializeOwned>(value: serde_json::Value) -> serde_json::Result<T> {
    serde_json::from_value(value)
}

/// Template of writable state.
///
/// # Example
///
/// ```rust,ignore
/// let count = Signal::new("count", 0);
/// let ecosystem = Ecosystem::new(EcosystemConfig::default());
///
/// assert_eq!(ecosystem.get(&count)?, 0);
/// ecosystem.set(&count, 5)?;
/// assert_eq!(ecosystem.get(&count)?, 5);
/// ```
pub struct Signal<T, P = ()> {
    key: Arc<str>,
    id: TemplateId,
    init: Init<T, P>,
    ttl: Ttl,
    codec: Option<Codec<T>>,
}

impl<T> Signal<T, ()>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// A singleton signal starting at `initial`.
    pub fn new(key: &str, initial: T) -> Self {
        Self::family(key, move |_: &()| initial.clone())
    }
}

impl<T, P> Signal<T, P>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    P: Serialize + Clone + Send + Sync + 'static,
{
    /// One signal per params value, initialized from the params.
    pub fn family<F>(key: &str, init: F) -> Self
    where
        F: Fn(&P) -> T + Send + Sync + 'static,
    {
        Self {
            key: key.into(),
            id: TemplateId::new(),
            init: Arc::new(init),
            ttl: Ttl::Forever,
            codec: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = ttl;
        self
    }
}

impl<T, P> Signal<T, P>
where
    T: Serialize + DeserializeOwned,
{
    /// Include this signal's instances in dehydration and accept hydration.
    pub fn persisted(mut self) -> Self {
        self.codec = Some(Codec {
            encode: encode_json::<T>,
            decode: decode_json::<T>,
        });
        self
    }
}

impl<T, P> Clone for Signal<T, P> {
    fn clone(&self) -> Self {
        Self {
            key: Arc::clone(&self.key),
            id: self.id,
            init: Arc::clone(&self.init),
            ttl: self.ttl.clone(),
            codec: self.codec.clone(),
        }
    }
}

impl<T, P> Template for Signal<T, P>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    P: Serialize + Clone + Send + Sync + 'static,
{
    type Params = P;
    type Output = T;

    fn key(&self) -> &str {
        &self.key
    }

    fn template_id(&self) -> TemplateId {
        self.id
    }

    fn instantiate(&self, node: &NodeRef, params: P) -> Arc<dyn GraphNode> {
        Arc::new(SignalNode {
            id: node.id().into(),
            params,
            init: Arc::clone(&self.init),
            ttl: self.ttl.clone(),
            codec: self.codec.clone(),
            value: RwLock::new(None),
        })
    }
}

struct SignalNode<T, P> {
    id: Arc<str>,
    params: P,
    init: Init<T, P>,
    ttl: Ttl,
    codec: Option<Codec<T>>,
    value: RwLock<Option<Arc<T>>>,
}

impl<T, P> SignalNode<T, P>
where
    T: PartialEq,
{
    fn replace(&self, next: Arc<T>) -> bool {
        let mut slot = self.value.write();
        if slot.as_deref() == Some(&*next) {
            return false;
        }
        *slot = Some(next);
        true
    }
}

impl<T, P> GraphNode for SignalNode<T, P>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    P: Send + Sync + 'static,
{
    fn evaluate(&self, _ecosystem: &Ecosystem) -> Result<bool> {
        if self.value.read().is_some() {
            return Ok(false);
        }
        let initial = (self.init)(&self.params);
        Ok(self.replace(Arc::new(initial)))
    }

    fn value(&self) -> Option<AnyValue> {
        self.value.read().clone().map(|value| value as AnyValue)
    }

    fn ttl(&self) -> Ttl {
        self.ttl.clone()
    }

    fn write(&self, value: AnyValue) -> Option<bool> {
        let next = value.downcast::<T>().ok()?;
        Some(self.replace(next))
    }

    fn dehydrate(&self) -> Result<Option<serde_json::Value>> {
        let (Some(codec), Some(value)) = (&self.codec, self.value.read().clone()) else {
            return Ok(None);
        };
        (codec.encode)(&value)
            .map(Some)
            .map_err(|error| Error::serialization(&*self.id, error))
    }

    fn hydrate(&self, value: serde_json::Value) -> Result<bool> {
        let Some(codec) = &self.codec else {
            return Ok(false);
        };
        let next = (codec.decode)(value).map_err(|error| Error::serialization(&*self.id, error))?;
        Ok(self.replace(Arc::new(next)))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeId;

    fn instantiate<T, P>(signal: &Signal<T, P>, params: P) -> Arc<dyn GraphNode>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        P: Serialize + Clone + Send + Sync + 'static,
    {
        signal.instantiate(&NodeRef::new(NodeId::new(), signal.key()), params)
    }

    #[test]
    fn writes_report_changes() {
        let node = instantiate(&Signal::new("count", 1), ());
        assert!(node.value().is_none());

        assert_eq!(node.write(Arc::new(2_i32)), Some(true));
        assert_eq!(node.write(Arc::new(2_i32)), Some(false));
        assert_eq!(node.write(Arc::new("two")), None);
    }

    #[test]
    fn families_initialize_from_params() {
        let signal = Signal::family("double", |n: &i32| n * 2);
        let node = instantiate(&signal, 21);
        let value = node.value();
        assert!(value.is_none());

        let ecosystem = Ecosystem::new(Default::default());
        assert!(node.evaluate(&ecosystem).unwrap());
        assert_eq!(node.value().unwrap().downcast_ref::<i32>(), Some(&42));
        assert!(!node.evaluate(&ecosystem).unwrap());
    }

    #[test]
    fn only_persisted_signals_dehydrate() {
        let plain = instantiate(&Signal::new("plain", 1_u8), ());
        plain.write(Arc::new(1_u8));
        assert!(plain.dehydrate().unwrap().is_none());

        let persisted = instantiate(&Signal::new("saved", 1_u8).persisted(), ());
        persisted.write(Arc::new(7_u8));
        assert_eq!(persisted.dehydrate().unwrap(), Some(serde_json::json!(7)));

        assert!(persisted.hydrate(serde_json::json!(9)).unwrap());
        assert!(persisted.hydrate(serde_json::json!("nine")).is_err());
    }
}
