//! Persistence capability consumed by the client core.
//!
//! The core never owns a storage format. It reads and writes small string
//! values (sync tokens, filter ids) through a namespaced [`Store`].

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Nothing stored under the key; callers usually treat this as "unset".
    #[error("value not found")]
    NotFound,
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store backend failure: {0}")]
    Backend(String),
}

/// Namespaced string key/value persistence.
pub trait Store: Send + Sync {
    fn set_value(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError>;

    fn get_value(&self, namespace: &str, key: &str) -> Result<String, StoreError>;

    fn delete_value(&self, namespace: &str, key: &str) -> Result<(), StoreError>;
}

impl<S: Store + ?Sized> Store for Arc<S> {
    fn set_value(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
        (**self).set_value(namespace, key, value)
    }

    fn get_value(&self, namespace: &str, key: &str) -> Result<String, StoreError> {
        (**self).get_value(namespace, key)
    }

    fn delete_value(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        (**self).delete_value(namespace, key)
    }
}

/// Process-local [`Store`]; clones share the same data.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    namespaces: Arc<RwLock<HashMap<String, HashMap<String, String>>>>,
}

impl InMemoryStore {
    /// Number of values held under `namespace`.
    pub fn len(&self, namespace: &str) -> Result<usize, StoreError> {
        let namespaces = self.namespaces.read().map_err(poisoned)?;
        Ok(namespaces.get(namespace).map_or(0, HashMap::len))
    }
}

impl Store for InMemoryStore {
    fn set_value(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.namespaces
            .write()
            .map_err(poisoned)?
            .entry(namespace.to_owned())
            .or_default()
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn get_value(&self, namespace: &str, key: &str) -> Result<String, StoreError> {
        let namespaces = self.namespaces.read().map_err(poisoned)?;
        namespaces
            .get(namespace)
            .and_then(|values| values.get(key))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn delete_value(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        let mut namespaces = self.namespaces.write().map_err(poisoned)?;
        let values = namespaces.get_mut(namespace).ok_or(StoreError::NotFound)?;
        values.remove(key).ok_or(StoreError::NotFound)?;
        if values.is_empty() {
            namespaces.remove(namespace);
        }
        Ok(())
    }
}

fn poisoned<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Backend("in-memory store lock poisoned".to_owned())
}

/// A [`Store`] bound to one namespace.
#[derive(Clone)]
pub struct ScopedStore<S: Store> {
    inner: S,
    namespace: String,
}

impl<S: Store> ScopedStore<S> {
    pub fn new(inner: S, namespace: impl Into<String>) -> Self {
        Self {
            inner,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.set_value(&self.namespace, key, value)
    }

    pub fn get(&self, key: &str) -> Result<String, StoreError> {
        self.inner.get_value(&self.namespace, key)
    }

    /// Like [`ScopedStore::get`], but maps a missing value to `None`.
    pub fn get_optional(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(StoreError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete_value(&self.namespace, key)
    }
}
