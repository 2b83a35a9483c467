//! Multi-executor: a keyed pool sharing one factory shape
//!
//! Each unique (schema-validated) key lazily creates and caches its own main
//! executor. All pooled executors carry the pool's identifying tag, so a
//! whole pool can be released from a scope in one sweep.

use std::marker::PhantomData;
use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use crate::error::{SchemaError, WeftError};
use crate::executor::Executor;
use crate::schema::SchemaRef;
use crate::scope::Scope;
use crate::tag::{Tag, TaggedValue};

type KeyTransform<K> = Arc<dyn Fn(&K) -> String + Send + Sync>;

/// Keyed pool of executors sharing a factory shape
pub struct MultiExecutor<K, T> {
    key_schema: SchemaRef,
    make: Arc<dyn Fn(&K) -> Executor<T> + Send + Sync>,
    transform: Option<KeyTransform<K>>,
    pool: Arc<DashMap<String, Executor<T>>>,
    pool_tag: Tag<String>,
    _marker: PhantomData<fn(K) -> T>,
}

impl<K, T> Clone for MultiExecutor<K, T> {
    fn clone(&self) -> Self {
        Self {
            key_schema: Arc::clone(&self.key_schema),
            make: Arc::clone(&self.make),
            transform: self.transform.clone(),
            pool: Arc::clone(&self.pool),
            pool_tag: self.pool_tag.clone(),
            _marker: PhantomData,
        }
    }
}

/// Create a keyed executor pool; `make` builds the executor for one key
pub fn multi<K, T, F>(key_schema: SchemaRef, make: F) -> MultiExecutor<K, T>
where
    K: Serialize + DeserializeOwned + Send + Sync + 'static,
    T: Send + Sync + 'static,
    F: Fn(&K) -> Executor<T> + Send + Sync + 'static,
{
    MultiExecutor {
        key_schema,
        make: Arc::new(make),
        transform: None,
        pool: Arc::new(DashMap::new()),
        pool_tag: Tag::typed().with_label("multi-pool"),
        _marker: PhantomData,
    }
}

impl<K, T> MultiExecutor<K, T>
where
    K: Serialize + DeserializeOwned + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    /// Override the default canonical-JSON keying
    pub fn with_key_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(&K) -> String + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// The tag every pooled executor carries
    pub fn pool_tag(&self) -> &Tag<String> {
        &self.pool_tag
    }

    fn canonical_key(&self, key: &K) -> Result<String, WeftError> {
        let raw = serde_json::to_value(key)
            .map_err(|e| WeftError::Schema(SchemaError::single("", e.to_string())))?;
        self.key_schema.validate(&raw)?;
        Ok(match &self.transform {
            Some(t) => t(key),
            None => raw.to_string(),
        })
    }

    /// The executor for one key, created and cached on first use
    pub fn get(&self, key: &K) -> Result<Executor<T>, WeftError> {
        use dashmap::mapref::entry::Entry;

        let canonical = self.canonical_key(key)?;
        match self.pool.entry(canonical.clone()) {
            Entry::Occupied(e) => Ok(e.get().clone()),
            Entry::Vacant(e) => {
                trace!(key = %canonical, "creating pooled executor");
                let identity: TaggedValue = self.pool_tag.entry(canonical.clone())?;
                let executor = (self.make)(key).with_tag(identity);
                e.insert(executor.clone());
                Ok(executor)
            }
        }
    }

    /// Every executor the pool has created so far
    pub fn executors(&self) -> Vec<Executor<T>> {
        self.pool.iter().map(|e| e.value().clone()).collect()
    }

    /// Soft-release every pooled executor cached in `scope`
    pub async fn release(&self, scope: &Scope) -> Result<(), WeftError> {
        for executor in self.executors() {
            scope.release(&executor, true).await?;
        }
        Ok(())
    }
}
