use std::{fmt, sync::Arc};

use dashmap::{DashMap, mapref::entry::Entry};
use kverify_resources::Snapshot;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Diagnostic, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("registry keys must not be empty")]
    #[diagnostic(code(registry::empty_key))]
    EmptyKey,

    #[error("`{0}` was already published in this session")]
    #[diagnostic(code(registry::duplicate_key))]
    DuplicateKey(RegistryKey),

    #[error("nothing was published under `{0}`")]
    #[diagnostic(code(registry::unpublished))]
    Unpublished(RegistryKey),
}

/// Opaque name a check publishes its snapshot under, e.g.
/// `videos-web-deployment`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RegistryKey(Arc<str>);

impl RegistryKey {
    pub fn new(key: impl AsRef<str>) -> Result<Self, RegistryError> {
        let key = key.as_ref().trim();
        if key.is_empty() {
            return Err(RegistryError::EmptyKey);
        }
        Ok(Self(Arc::from(key)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RegistryKey {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RegistryKey> for String {
    fn from(key: RegistryKey) -> Self {
        key.0.to_string()
    }
}

impl fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session-scoped store of verified snapshots.
///
/// Keys are write-once. Readers get the same `Arc` the writer published, so
/// dependent checks observe exactly the snapshot that was asserted against.
#[derive(Clone, Debug, Default)]
pub struct ResultRegistry {
    inner: Arc<DashMap<RegistryKey, Arc<Snapshot>>>,
}

impl ResultRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, key: RegistryKey, snapshot: Arc<Snapshot>) -> Result<(), RegistryError> {
        match self.inner.entry(key) {
            Entry::Occupied(entry) => Err(RegistryError::DuplicateKey(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(snapshot);
                Ok(())
            }
        }
    }

    pub fn get(&self, key: &RegistryKey) -> Result<Arc<Snapshot>, RegistryError> {
        self.inner
            .get(key)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| RegistryError::Unpublished(key.clone()))
    }

    pub fn contains(&self, key: &RegistryKey) -> bool {
        self.inner.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
