//! Cache Store boundary and an in-memory implementation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::protocol::ResourceKey;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: Value,
    pub retrieved_at: Instant,
}

impl CacheEntry {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            retrieved_at: Instant::now(),
        }
    }

    pub fn is_fresh(&self, max_age: Duration) -> bool {
        self.retrieved_at.elapsed() <= max_age
    }
}

/// Key to entity store shared by the pull (fetch) and push paths.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &ResourceKey) -> Option<CacheEntry>;

    /// Shallow overwrite of the given top-level fields. Fields not named are
    /// left untouched.
    fn merge(&self, key: &ResourceKey, fields: Map<String, Value>);

    fn replace(&self, key: &ResourceKey, entity: Value);

    /// Drops the entry so the next read goes back to the source.
    fn invalidate(&self, key: &ResourceKey);
}

/// What happened to a cache entry; published after the write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheChange {
    pub key: ResourceKey,
    pub kind: CacheChangeKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheChangeKind {
    /// A push overwrote these fields.
    Patched { fields: Vec<String> },
    /// A push replaced the whole entity.
    Replaced,
    /// The entry was dropped; consumers must refetch.
    Invalidated,
    /// A pull completed and was written.
    Fetched,
}

impl CacheChange {
    pub fn new(key: ResourceKey, kind: CacheChangeKind) -> Self {
        Self { key, kind }
    }

    pub fn needs_refetch(&self) -> bool {
        self.kind == CacheChangeKind::Invalidated
    }
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<ResourceKey, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Present and younger than `max_age`.
    pub fn is_fresh(&self, key: &ResourceKey, max_age: Duration) -> bool {
        self.entries
            .read()
            .get(key)
            .is_some_and(|entry| entry.is_fresh(max_age))
    }

    pub fn value(&self, key: &ResourceKey) -> Option<Value> {
        self.entries.read().get(key).map(|entry| entry.value.clone())
    }
}

impl CacheStore for MemoryCache {
    fn get(&self, key: &ResourceKey) -> Option<CacheEntry> {
        self.entries.read().get(key).cloned()
    }

    fn merge(&self, key: &ResourceKey, fields: Map<String, Value>) {
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(entry) => {
                match &mut entry.value {
                    Value::Object(existing) => existing.extend(fields),
                    other => *other = Value::Object(fields),
                }
                entry.retrieved_at = Instant::now();
            }
            None => {
                entries.insert(key.clone(), CacheEntry::new(Value::Object(fields)));
            }
        }
    }

    fn replace(&self, key: &ResourceKey, entity: Value) {
        self.entries.write().insert(key.clone(), CacheEntry::new(entity));
    }

    fn invalidate(&self, key: &ResourceKey) {
        self.entries.write().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn merge_overwrites_only_named_fields() {
        let cache = MemoryCache::new();
        let key = ResourceKey::new("ticket", "X-1");
        cache.replace(&key, json!({"id": "X-1", "status": "open", "title": "T"}));

        cache.merge(&key, fields(json!({"status": "closed"})));
        assert_eq!(
            cache.value(&key),
            Some(json!({"id": "X-1", "status": "closed", "title": "T"}))
        );
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = MemoryCache::new();
        let key = ResourceKey::new("ticket", "1");
        cache.replace(&key, json!({"id": "1"}));
        assert!(cache.is_fresh(&key, Duration::from_secs(60)));

        cache.invalidate(&key);
        assert!(cache.get(&key).is_none());
        assert!(!cache.is_fresh(&key, Duration::from_secs(60)));
        assert!(cache.is_empty());
    }
}
