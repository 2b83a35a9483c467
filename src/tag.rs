//! Typed, schema-validated tags
//!
//! A `Tag<T>` is a process-unique key addressing values in any source that
//! carries tagged values: scopes, pods, execution contexts, executor
//! metadata, plain stores, or slices. Values travel as `serde_json::Value`,
//! validated by the tag's schema on every write.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{SchemaError, WeftError};
use crate::schema::{typed, SchemaRef};

static NEXT_TAG_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque tag identity, unique per `Tag` construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TagId(u64);

impl TagId {
    fn next() -> Self {
        TagId(NEXT_TAG_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for TagId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tag#{}", self.0)
    }
}

/// A `(key, validated value)` pair as carried by sources
#[derive(Debug, Clone)]
pub struct TaggedValue {
    pub(crate) key: TagId,
    pub(crate) label: Option<Arc<str>>,
    pub(crate) value: Value,
}

impl TaggedValue {
    pub(crate) fn new(key: TagId, label: Option<Arc<str>>, value: Value) -> Self {
        Self { key, label, value }
    }

    pub fn key(&self) -> TagId {
        self.key
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}

/// Anything tag values can be read from
pub trait TagSource {
    /// First value carried under `key`, if any
    fn lookup(&self, key: TagId) -> Option<Value>;

    /// Every value carried under `key`
    fn lookup_all(&self, key: TagId) -> Vec<Value> {
        self.lookup(key).into_iter().collect()
    }
}

/// A source that also accepts writes
pub trait TagStore: TagSource {
    /// Write `value` under `key`, replacing an existing entry for the key
    fn put(&self, entry: TaggedValue);
}

impl TagSource for [TaggedValue] {
    fn lookup(&self, key: TagId) -> Option<Value> {
        self.iter().find(|t| t.key == key).map(|t| t.value.clone())
    }

    fn lookup_all(&self, key: TagId) -> Vec<Value> {
        self.iter()
            .filter(|t| t.key == key)
            .map(|t| t.value.clone())
            .collect()
    }
}

impl TagSource for Vec<TaggedValue> {
    fn lookup(&self, key: TagId) -> Option<Value> {
        self.as_slice().lookup(key)
    }

    fn lookup_all(&self, key: TagId) -> Vec<Value> {
        self.as_slice().lookup_all(key)
    }
}

/// A standalone thread-safe tag store
#[derive(Default)]
pub struct TagMap {
    entries: Mutex<Vec<TaggedValue>>,
}

impl TagMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

impl TagSource for TagMap {
    fn lookup(&self, key: TagId) -> Option<Value> {
        self.entries.lock().unwrap().lookup(key)
    }

    fn lookup_all(&self, key: TagId) -> Vec<Value> {
        self.entries.lock().unwrap().lookup_all(key)
    }
}

impl TagStore for TagMap {
    fn put(&self, entry: TaggedValue) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.iter_mut().find(|t| t.key == entry.key) {
            *existing = entry;
        } else {
            entries.push(entry);
        }
    }
}

struct TagInner {
    id: TagId,
    label: Option<Arc<str>>,
    schema: SchemaRef,
    default: Option<Value>,
}

/// Typed, labeled, schema-validated key
pub struct Tag<T> {
    inner: Arc<TagInner>,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T> Clone for Tag<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Tag<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tag")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .finish()
    }
}

impl<T> Tag<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Create a tag with an explicit schema
    pub fn new(schema: SchemaRef) -> Self {
        Self {
            inner: Arc::new(TagInner {
                id: TagId::next(),
                label: None,
                schema,
                default: None,
            }),
            _marker: PhantomData,
        }
    }

    /// Create a tag validated by a serde round-trip over `T`
    pub fn typed() -> Self
    where
        T: Send + Sync + 'static,
    {
        Self::new(typed::<T>())
    }

    pub fn with_label(self, label: impl Into<Arc<str>>) -> Self {
        let inner = TagInner {
            id: self.inner.id,
            label: Some(label.into()),
            schema: Arc::clone(&self.inner.schema),
            default: self.inner.default.clone(),
        };
        Self {
            inner: Arc::new(inner),
            _marker: PhantomData,
        }
    }

    /// Attach a default, validated immediately
    pub fn with_default(self, value: T) -> Result<Self, WeftError> {
        let validated = self.check(&value)?;
        let inner = TagInner {
            id: self.inner.id,
            label: self.inner.label.clone(),
            schema: Arc::clone(&self.inner.schema),
            default: Some(validated),
        };
        Ok(Self {
            inner: Arc::new(inner),
            _marker: PhantomData,
        })
    }

    pub fn id(&self) -> TagId {
        self.inner.id
    }

    pub fn label(&self) -> Option<&str> {
        self.inner.label.as_deref()
    }

    /// Best-effort display name for diagnostics
    pub fn display_name(&self) -> Arc<str> {
        match &self.inner.label {
            Some(l) => Arc::clone(l),
            None => Arc::from(self.inner.id.to_string()),
        }
    }

    fn check(&self, value: &T) -> Result<Value, WeftError> {
        let raw = serde_json::to_value(value)
            .map_err(|e| WeftError::Schema(SchemaError::single("", e.to_string())))?;
        Ok(self.inner.schema.validate(&raw)?)
    }

    fn decode(&self, value: Value) -> Result<T, WeftError> {
        serde_json::from_value(value)
            .map_err(|e| WeftError::Schema(SchemaError::single("", e.to_string())))
    }

    /// Validate a value and wrap it as a `TaggedValue` for bulk
    /// initialization (scope tags, executor tags, flow tags)
    pub fn entry(&self, value: T) -> Result<TaggedValue, WeftError> {
        let validated = self.check(&value)?;
        Ok(TaggedValue::new(
            self.inner.id,
            self.inner.label.clone(),
            validated,
        ))
    }

    /// Read from a source, failing with `TagMissing` when absent and no
    /// default is configured
    pub fn get<S: TagSource + ?Sized>(&self, source: &S) -> Result<T, WeftError> {
        match self.find_value(source) {
            Some(v) => self.decode(v),
            None => Err(WeftError::TagMissing {
                label: self.display_name(),
            }),
        }
    }

    /// Read from a source, falling back to the default, then `None`
    pub fn find<S: TagSource + ?Sized>(&self, source: &S) -> Option<T> {
        self.find_value(source).and_then(|v| self.decode(v).ok())
    }

    /// Every match in the source (sources may carry the same key repeatedly)
    pub fn some<S: TagSource + ?Sized>(&self, source: &S) -> Vec<T> {
        source
            .lookup_all(self.inner.id)
            .into_iter()
            .filter_map(|v| self.decode(v).ok())
            .collect()
    }

    /// Validate then write into a store
    pub fn set<S: TagStore + ?Sized>(&self, store: &S, value: T) -> Result<(), WeftError> {
        let validated = self.check(&value)?;
        store.put(TaggedValue::new(
            self.inner.id,
            self.inner.label.clone(),
            validated,
        ));
        Ok(())
    }

    fn find_value<S: TagSource + ?Sized>(&self, source: &S) -> Option<Value> {
        source
            .lookup(self.inner.id)
            .or_else(|| self.inner.default.clone())
    }
}

/// Built-in tag carrying an executor's or flow's display name
pub fn name_tag() -> Tag<String> {
    static NAME: Lazy<Tag<String>> = Lazy::new(|| Tag::typed().with_label("name"));
    NAME.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::JsonSchema;
    use serde_json::json;

    #[test]
    fn entry_validates_and_wraps() {
        let port: Tag<u16> = Tag::typed().with_label("port");
        let entry = port.entry(8080).unwrap();
        assert_eq!(entry.key(), port.id());
        assert_eq!(entry.value(), &json!(8080));
    }

    #[test]
    fn get_from_slice() {
        let port: Tag<u16> = Tag::typed();
        let entries = vec![port.entry(443).unwrap()];
        assert_eq!(port.get(&entries).unwrap(), 443);
    }

    #[test]
    fn get_missing_without_default_fails() {
        let port: Tag<u16> = Tag::typed().with_label("port");
        let err = port.get(&Vec::new()).unwrap_err();
        assert!(matches!(err, WeftError::TagMissing { .. }));
        assert!(err.to_string().contains("port"));
    }

    #[test]
    fn find_falls_back_to_default() {
        let port: Tag<u16> = Tag::typed().with_default(9000).unwrap();
        assert_eq!(port.find(&Vec::new()), Some(9000));
    }

    #[test]
    fn some_returns_all_matches() {
        let hosts: Tag<String> = Tag::typed();
        let entries = vec![
            hosts.entry("a".into()).unwrap(),
            hosts.entry("b".into()).unwrap(),
        ];
        assert_eq!(hosts.some(&entries), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn set_replaces_in_store() {
        let port: Tag<u16> = Tag::typed();
        let store = TagMap::new();
        port.set(&store, 80).unwrap();
        port.set(&store, 8080).unwrap();
        assert_eq!(port.get(&store).unwrap(), 8080);
        assert_eq!(port.some(&store).len(), 1);
    }

    #[test]
    fn schema_rejects_invalid_writes() {
        let schema = JsonSchema::shared(json!({"type": "integer", "minimum": 1})).unwrap();
        let count: Tag<i64> = Tag::new(schema);
        let store = TagMap::new();
        assert!(count.set(&store, 0).is_err());
        assert!(count.set(&store, 3).is_ok());
    }

    #[test]
    fn tags_have_distinct_identity() {
        let a: Tag<u16> = Tag::typed();
        let b: Tag<u16> = Tag::typed();
        assert_ne!(a.id(), b.id());

        let store = TagMap::new();
        a.set(&store, 1).unwrap();
        assert_eq!(b.find(&store), None);
    }

    #[test]
    fn name_tag_is_stable() {
        assert_eq!(name_tag().id(), name_tag().id());
    }

    #[test]
    fn round_trip_after_normalization() {
        let port: Tag<u16> = Tag::typed();
        let store = TagMap::new();
        port.set(&store, 443).unwrap();
        assert_eq!(port.find(&store), Some(443));
    }
}
