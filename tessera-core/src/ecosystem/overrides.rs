//! Template overrides.
//!
//! An override swaps the implementation behind a template key. Instances of
//! an affected key are force-destroyed when overrides change, so their
//! observers recreate them against the new implementation on next access.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::{Batch, Ecosystem};
use crate::error::{Error, Result};
use crate::reactive::Template;

type Erased<P, O> = Arc<dyn Template<Params = P, Output = O>>;

/// A replacement implementation for one template key.
///
/// The replacement must have the same params and output types as the template
/// it stands in for.
#[derive(Clone)]
pub struct Override {
    key: String,
    template: Arc<dyn Any + Send + Sync>,
}

impl Override {
    pub fn new<T: Template>(template: T) -> Self {
        let key = template.key().to_owned();
        let erased: Erased<T::Params, T::Output> = Arc::new(template);
        Self {
            key,
            template: Arc::new(erased),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn resolve<P: 'static, O: 'static>(&self) -> Result<Erased<P, O>> {
        self.template
            .downcast_ref::<Erased<P, O>>()
            .cloned()
            .ok_or_else(|| Error::OverrideMismatch {
                key: self.key.clone(),
            })
    }
}

impl fmt::Debug for Override {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Override").field("key", &self.key).finish()
    }
}

impl Ecosystem {
    /// Replace every override.
    pub fn set_overrides(&self, overrides: impl IntoIterator<Item = Override>) -> Result<()> {
        let affected = {
            let mut current = self.inner.overrides.write();
            let mut affected: Vec<String> = current.keys().cloned().collect();
            current.clear();
            for replacement in overrides {
                affected.push(replacement.key.clone());
                current.insert(replacement.key.clone(), replacement);
            }
            affected
        };
        self.destroy_instances_of(&affected)
    }

    /// Add or replace overrides, keeping the others.
    pub fn add_overrides(&self, overrides: impl IntoIterator<Item = Override>) -> Result<()> {
        let affected = {
            let mut current = self.inner.overrides.write();
            overrides
                .into_iter()
                .map(|replacement| {
                    let key = replacement.key.clone();
                    current.insert(key.clone(), replacement);
                    key
                })
                .collect::<Vec<_>>()
        };
        self.destroy_instances_of(&affected)
    }

    pub fn remove_overrides<S: AsRef<str>>(&self, keys: &[S]) -> Result<()> {
        let affected = {
            let mut current = self.inner.overrides.write();
            keys.iter()
                .filter_map(|key| current.shift_remove_entry(key.as_ref()).map(|(key, _)| key))
                .collect::<Vec<_>>()
        };
        self.destroy_instances_of(&affected)
    }

    /// Keys currently overridden.
    pub fn overrides(&self) -> Vec<String> {
        self.inner.overrides.read().keys().cloned().collect()
    }

    pub(crate) fn resolve_override<P: 'static, O: 'static>(&self, key: &str) -> Result<Option<Erased<P, O>>> {
        self.inner
            .overrides
            .read()
            .get(key)
            .map(Override::resolve::<P, O>)
            .transpose()
    }

    fn destroy_instances_of(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        debug!(?keys, "overrides changed");
        let batch = Batch::open(self);
        self.mutate(|core| {
            let affected: Vec<_> = core
                .graph
                .entries()
                .filter(|entry| keys.iter().any(|key| **key == *entry.template_key))
                .map(|entry| entry.handle())
                .collect();
            for handle in affected {
                core.graph.destroy(handle, true);
            }
        });
        batch.close()
    }
}
