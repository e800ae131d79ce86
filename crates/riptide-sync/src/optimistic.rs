//! Optimistic writes with rollback.

use std::future::Future;

use serde_json::{Map, Value};
use tracing::debug;

use crate::cache::CacheStore;
use crate::protocol::ResourceKey;

/// Guard for one optimistic write. Resolve it with [`Optimistic::commit`] or
/// [`Optimistic::rollback`]; dropping it keeps the optimistic value.
#[derive(Debug)]
#[must_use = "an optimistic write must be committed or rolled back"]
pub struct Optimistic {
    key: ResourceKey,
    snapshot: Option<Value>,
}

impl Optimistic {
    /// Snapshots the entry for `key`, then merges `partial` into it.
    pub fn apply(cache: &dyn CacheStore, key: &ResourceKey, partial: Map<String, Value>) -> Self {
        let snapshot = cache.get(key).map(|entry| entry.value);
        cache.merge(key, partial);
        Self {
            key: key.clone(),
            snapshot,
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Replaces the optimistic value with what the server returned.
    pub fn commit(self, cache: &dyn CacheStore, server_truth: Value) {
        cache.replace(&self.key, server_truth);
    }

    /// Restores the snapshot, or drops the entry if there was none.
    pub fn rollback(self, cache: &dyn CacheStore) {
        debug!(target = "riptide.cache", key = %self.key, "rolling back optimistic write");
        match self.snapshot {
            Some(previous) => cache.replace(&self.key, previous),
            None => cache.invalidate(&self.key),
        }
    }
}

/// Applies `partial` optimistically, then settles it with the result of `mutation`.
pub async fn mutate_with_rollback<F, E>(
    cache: &dyn CacheStore,
    key: &ResourceKey,
    partial: Map<String, Value>,
    mutation: F,
) -> Result<Value, E>
where
    F: Future<Output = Result<Value, E>>,
{
    let guard = Optimistic::apply(cache, key, partial);
    match mutation.await {
        Ok(server_truth) => {
            guard.commit(cache, server_truth.clone());
            Ok(server_truth)
        }
        Err(err) => {
            guard.rollback(cache);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use serde_json::json;

    fn partial(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[tokio::test]
    async fn failed_mutation_restores_snapshot() {
        let cache = MemoryCache::new();
        let key = ResourceKey::new("ticket", "1");
        cache.replace(&key, json!({"id": "1", "status": "open"}));

        let result: Result<Value, &str> = mutate_with_rollback(
            &cache,
            &key,
            partial(json!({"status": "closed"})),
            async { Err("conflict") },
        )
        .await;

        assert_eq!(result, Err("conflict"));
        assert_eq!(cache.value(&key), Some(json!({"id": "1", "status": "open"})));
    }

    #[tokio::test]
    async fn successful_mutation_takes_server_truth() {
        let cache = MemoryCache::new();
        let key = ResourceKey::new("ticket", "1");
        cache.replace(&key, json!({"id": "1", "status": "open"}));

        let truth = json!({"id": "1", "status": "closed", "closedBy": "ann"});
        let result: Result<Value, &str> = mutate_with_rollback(
            &cache,
            &key,
            partial(json!({"status": "closed"})),
            async { Ok(truth.clone()) },
        )
        .await;

        assert_eq!(result, Ok(truth.clone()));
        assert_eq!(cache.value(&key), Some(truth));
    }

    #[test]
    fn rollback_without_snapshot_invalidates() {
        let cache = MemoryCache::new();
        let key = ResourceKey::new("ticket", "new");

        let guard = Optimistic::apply(&cache, &key, partial(json!({"title": "draft"})));
        assert_eq!(cache.value(&key), Some(json!({"title": "draft"})));
        guard.rollback(&cache);
        assert!(cache.get(&key).is_none());
    }
}
