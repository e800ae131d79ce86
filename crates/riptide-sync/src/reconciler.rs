//! Applies push updates to the cache.
//!
//! Every update passes the ledger first: a repeated `(resource, field, id)` is
//! dropped before anything is written. Updates for entities that are not
//! cached are never merged; the entry is invalidated instead so the next read
//! fetches the full entity. Malformed payloads degrade the same way.
//!
//! Pulls that race with pushes go through [`UpdateReconciler::begin_fetch`] and
//! [`UpdateReconciler::complete_fetch`]: fields a push wrote after the fetch
//! started survive the fetched entity being written.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::cache::{CacheChange, CacheChangeKind, CacheStore};
use crate::error::{MergeError, RealtimeResult};
use crate::ledger::UpdateLedger;
use crate::protocol::{PushUpdate, ResourceKey, UpdateId};

/// Maps a wire field onto additional local field names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldAliases {
    by_field: HashMap<String, Vec<FieldAlias>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldAlias {
    resource_type: Option<String>,
    local: String,
}

impl FieldAliases {
    pub fn new() -> Self {
        Self::default()
    }

    /// `wire_field` is also written to `local` for every resource type.
    pub fn alias(mut self, wire_field: &str, local: &str) -> Self {
        self.push(None, wire_field, local);
        self
    }

    /// Like [`FieldAliases::alias`], restricted to one resource type.
    pub fn alias_for(mut self, resource_type: &str, wire_field: &str, local: &str) -> Self {
        self.push(Some(resource_type.to_string()), wire_field, local);
        self
    }

    fn push(&mut self, resource_type: Option<String>, wire_field: &str, local: &str) {
        self.by_field
            .entry(wire_field.to_string())
            .or_default()
            .push(FieldAlias {
                resource_type,
                local: local.to_string(),
            });
    }

    /// Local names that receive `wire_field` for `key`, the wire name first.
    pub fn local_names(&self, key: &ResourceKey, wire_field: &str) -> Vec<String> {
        let mut names = vec![wire_field.to_string()];
        for alias in self.by_field.get(wire_field).into_iter().flatten() {
            let applies = alias
                .resource_type
                .as_deref()
                .map_or(true, |kind| kind == key.resource_type());
            if applies && !names.contains(&alias.local) {
                names.push(alias.local.clone());
            }
        }
        names
    }

    pub fn is_empty(&self) -> bool {
        self.by_field.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Same id as the last applied update for this field; nothing changed.
    Duplicate,
    /// Not cached; the entry was invalidated and must be fetched in full.
    Refetch,
    Patched { fields: Vec<String> },
    Replaced,
    /// The payload could not be merged; the entry was invalidated.
    Invalidated(MergeError),
}

/// Issued when a pull starts. Hand it back with the fetched entity.
#[derive(Debug)]
#[must_use = "a fetch ticket must be completed or its marks are kept"]
pub struct FetchTicket {
    key: ResourceKey,
    seq: u64,
}

impl FetchTicket {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }
}

#[derive(Default)]
struct ReconcilerState {
    ledger: UpdateLedger,
    clock: u64,
    // Field name -> sequence of the push that last wrote it, only kept while a fetch is outstanding.
    marks: HashMap<ResourceKey, HashMap<String, u64>>,
    fetches: HashMap<ResourceKey, Vec<u64>>,
}

impl ReconcilerState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn mark<'a>(&mut self, key: &ResourceKey, fields: impl IntoIterator<Item = &'a String>) {
        if self.fetches.get(key).map_or(true, Vec::is_empty) {
            return;
        }
        let seq = self.tick();
        let marks = self.marks.entry(key.clone()).or_default();
        for field in fields {
            marks.insert(field.clone(), seq);
        }
    }

    fn prune(&mut self, key: &ResourceKey) {
        let oldest = self
            .fetches
            .get(key)
            .and_then(|pending| pending.iter().min().copied());
        match oldest {
            Some(oldest) => {
                if let Some(marks) = self.marks.get_mut(key) {
                    marks.retain(|_, seq| *seq > oldest);
                }
            }
            None => {
                self.fetches.remove(key);
                self.marks.remove(key);
            }
        }
    }
}

pub struct UpdateReconciler {
    cache: Arc<dyn CacheStore>,
    aliases: FieldAliases,
    state: Mutex<ReconcilerState>,
    changes: broadcast::Sender<CacheChange>,
}

impl UpdateReconciler {
    pub fn new(cache: Arc<dyn CacheStore>, aliases: FieldAliases, capacity: usize) -> Self {
        Self {
            cache,
            aliases,
            state: Mutex::new(ReconcilerState::default()),
            changes: broadcast::channel(capacity.max(1)).0,
        }
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    /// Cache changes, each published after its write.
    pub fn changes(&self) -> broadcast::Receiver<CacheChange> {
        self.changes.subscribe()
    }

    /// Decodes a pushed event body and applies it.
    ///
    /// Fails only when the body is unreadable and names no resource; when the
    /// resource is known the entry is invalidated instead.
    pub fn apply_event(&self, payload: &Value) -> RealtimeResult<ApplyOutcome> {
        match PushUpdate::from_wire(payload) {
            Ok(update) => Ok(self.apply_update(&update)),
            Err((Some(key), err)) => {
                warn!(
                    target = "riptide.reconciler",
                    key = %key,
                    error = %err,
                    "undecodable push; invalidating"
                );
                self.invalidate(&key);
                Ok(ApplyOutcome::Invalidated(err))
            }
            Err((None, err)) => Err(err.into()),
        }
    }

    pub fn apply_update(&self, update: &PushUpdate) -> ApplyOutcome {
        let key = &update.resource_key;
        let field = update.field_key.as_str();

        let (outcome, change) = {
            let mut state = self.state.lock();
            if state.ledger.is_duplicate(key, field, &update.update_id) {
                trace!(
                    target = "riptide.reconciler",
                    key = %key,
                    field,
                    update_id = %update.update_id,
                    "duplicate delivery dropped"
                );
                return ApplyOutcome::Duplicate;
            }
            state.ledger.record(key, field, update.update_id.clone());

            if self.cache.get(key).is_none() {
                debug!(target = "riptide.reconciler", key = %key, "not cached; refetch required");
                self.cache.invalidate(key);
                (ApplyOutcome::Refetch, CacheChangeKind::Invalidated)
            } else {
                match self.write(&mut state, update) {
                    Ok(ApplyOutcome::Replaced) => (ApplyOutcome::Replaced, CacheChangeKind::Replaced),
                    Ok(ApplyOutcome::Patched { fields }) => (
                        ApplyOutcome::Patched {
                            fields: fields.clone(),
                        },
                        CacheChangeKind::Patched { fields },
                    ),
                    Ok(other) => return other,
                    Err(err) => {
                        warn!(
                            target = "riptide.reconciler",
                            key = %key,
                            field,
                            error = %err,
                            "push could not be merged; invalidating"
                        );
                        self.cache.invalidate(key);
                        (ApplyOutcome::Invalidated(err), CacheChangeKind::Invalidated)
                    }
                }
            }
        };

        self.notify(key, change);
        outcome
    }

    fn write(
        &self,
        state: &mut ReconcilerState,
        update: &PushUpdate,
    ) -> Result<ApplyOutcome, MergeError> {
        let key = &update.resource_key;

        if update.is_whole_entity() {
            let Value::Object(entity) = &update.payload else {
                return Err(MergeError::NotAnObject { what: "payload" });
            };
            let fields: Vec<String> = entity.keys().cloned().collect();
            self.cache.replace(key, update.payload.clone());
            state.mark(key, &fields);
            trace!(target = "riptide.reconciler", key = %key, "entity replaced");
            return Ok(ApplyOutcome::Replaced);
        }

        let cached_is_object = self
            .cache
            .get(key)
            .is_some_and(|entry| entry.value.is_object());
        if !cached_is_object {
            return Err(MergeError::NotAnObject {
                what: "cached entity",
            });
        }

        let value = match &update.payload {
            Value::Object(map) => map
                .get(&update.field_key)
                .cloned()
                .ok_or_else(|| MergeError::MissingField {
                    field: update.field_key.clone(),
                })?,
            bare => bare.clone(),
        };

        let names = self.aliases.local_names(key, &update.field_key);
        let patch: Map<String, Value> = names
            .iter()
            .map(|name| (name.clone(), value.clone()))
            .collect();
        self.cache.merge(key, patch);
        state.mark(key, &names);
        trace!(target = "riptide.reconciler", key = %key, fields = ?names, "fields patched");
        Ok(ApplyOutcome::Patched { fields: names })
    }

    /// Starts a pull for `key`. Pushes applied until the ticket is completed
    /// are remembered field by field.
    pub fn begin_fetch(&self, key: &ResourceKey) -> FetchTicket {
        let mut state = self.state.lock();
        let seq = state.tick();
        state.fetches.entry(key.clone()).or_default().push(seq);
        FetchTicket {
            key: key.clone(),
            seq,
        }
    }

    /// Writes a fetched entity, keeping fields pushed since `ticket` was issued.
    pub fn complete_fetch(&self, ticket: FetchTicket, entity: Value) {
        let FetchTicket { key, seq } = ticket;
        let mut entity = entity;
        {
            let mut state = self.state.lock();
            if let Some(pending) = state.fetches.get_mut(&key) {
                pending.retain(|issued| *issued != seq);
            }

            let newer: Vec<String> = state
                .marks
                .get(&key)
                .map(|marks| {
                    marks
                        .iter()
                        .filter(|(_, pushed)| **pushed > seq)
                        .map(|(field, _)| field.clone())
                        .collect()
                })
                .unwrap_or_default();

            if !newer.is_empty() {
                let current = self.cache.get(&key).map(|entry| entry.value);
                if let (Some(Value::Object(current)), Value::Object(target)) =
                    (current, &mut entity)
                {
                    for field in &newer {
                        if let Some(value) = current.get(field) {
                            target.insert(field.clone(), value.clone());
                        }
                    }
                    debug!(
                        target = "riptide.reconciler",
                        key = %key,
                        kept = ?newer,
                        "fetch kept newer pushed fields"
                    );
                }
            }

            self.cache.replace(&key, entity);
            state.prune(&key);
        }
        self.notify(&key, CacheChangeKind::Fetched);
    }

    /// Drops the cached entry and tells consumers to refetch.
    pub fn invalidate(&self, key: &ResourceKey) {
        {
            let _state = self.state.lock();
            self.cache.invalidate(key);
        }
        self.notify(key, CacheChangeKind::Invalidated);
    }

    /// Forgets every ledger entry and fetch mark for `key`.
    pub fn forget(&self, key: &ResourceKey) -> usize {
        let mut state = self.state.lock();
        state.marks.remove(key);
        state.fetches.remove(key);
        state.ledger.forget(key)
    }

    pub fn last_seen(&self, key: &ResourceKey, field: &str) -> Option<UpdateId> {
        self.state.lock().ledger.last_seen(key, field).cloned()
    }

    fn notify(&self, key: &ResourceKey, kind: CacheChangeKind) {
        // Nobody listening is fine.
        let _ = self.changes.send(CacheChange::new(key.clone(), kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::error::RealtimeError;
    use serde_json::json;

    fn setup(aliases: FieldAliases) -> (Arc<MemoryCache>, UpdateReconciler) {
        let cache = Arc::new(MemoryCache::new());
        let reconciler = UpdateReconciler::new(cache.clone(), aliases, 16);
        (cache, reconciler)
    }

    fn x1() -> ResourceKey {
        ResourceKey::new("ticket", "X-1")
    }

    #[test]
    fn field_update_merges_without_touching_other_fields() {
        let (cache, reconciler) = setup(FieldAliases::new());
        cache.replace(&x1(), json!({"id": "X-1", "status": "open", "title": "T"}));

        let outcome = reconciler.apply_update(&PushUpdate::new(
            x1(),
            "status",
            "u1",
            json!({"status": "closed"}),
        ));
        assert_eq!(
            outcome,
            ApplyOutcome::Patched {
                fields: vec!["status".into()]
            }
        );
        assert_eq!(
            cache.value(&x1()),
            Some(json!({"id": "X-1", "status": "closed", "title": "T"}))
        );
    }

    #[test]
    fn redelivery_is_a_no_op() {
        let (cache, reconciler) = setup(FieldAliases::new());
        cache.replace(&x1(), json!({"id": "X-1", "status": "open"}));
        let update = PushUpdate::new(x1(), "status", "u1", json!("closed"));

        reconciler.apply_update(&update);
        cache.merge(&x1(), Map::from_iter([("status".to_string(), json!("reopened"))]));
        assert_eq!(reconciler.apply_update(&update), ApplyOutcome::Duplicate);
        assert_eq!(cache.value(&x1()), Some(json!({"id": "X-1", "status": "reopened"})));
    }

    #[test]
    fn whole_entity_replaces_and_aliases_are_written() {
        let aliases = FieldAliases::new()
            .alias("status", "state")
            .alias_for("invoice", "status", "invoiceState");
        let (cache, reconciler) = setup(aliases);
        cache.replace(&x1(), json!({"id": "X-1", "legacy": true}));

        reconciler.apply_update(&PushUpdate::new(x1(), "all", "u1", json!({"id": "X-1"})));
        assert_eq!(cache.value(&x1()), Some(json!({"id": "X-1"})));

        reconciler.apply_update(&PushUpdate::new(x1(), "status", "u2", json!("done")));
        assert_eq!(
            cache.value(&x1()),
            Some(json!({"id": "X-1", "status": "done", "state": "done"}))
        );
    }

    #[test]
    fn cache_miss_requests_refetch() {
        let (cache, reconciler) = setup(FieldAliases::new());
        let mut changes = reconciler.changes();

        let outcome = reconciler.apply_update(&PushUpdate::new(x1(), "status", "u1", json!("x")));
        assert_eq!(outcome, ApplyOutcome::Refetch);
        assert!(cache.get(&x1()).is_none());
        assert_eq!(
            changes.try_recv().expect("change"),
            CacheChange::new(x1(), CacheChangeKind::Invalidated)
        );
    }

    #[test]
    fn malformed_payload_invalidates_instead_of_failing() {
        let (cache, reconciler) = setup(FieldAliases::new());
        cache.replace(&x1(), json!({"id": "X-1"}));

        let outcome =
            reconciler.apply_update(&PushUpdate::new(x1(), "status", "u1", json!({"other": 1})));
        assert_eq!(
            outcome,
            ApplyOutcome::Invalidated(MergeError::MissingField {
                field: "status".into()
            })
        );
        assert!(cache.get(&x1()).is_none());

        let outcome = reconciler
            .apply_event(&json!({"resourceKey": "ticket:X-1", "fieldKey": "status"}))
            .expect("key known");
        assert!(matches!(outcome, ApplyOutcome::Invalidated(_)));
        assert!(matches!(
            reconciler.apply_event(&json!([1, 2])),
            Err(RealtimeError::Merge(MergeError::MalformedUpdate(_)))
        ));
    }

    #[test]
    fn slow_fetch_keeps_fields_pushed_after_it_started() {
        let (cache, reconciler) = setup(FieldAliases::new());
        cache.replace(&x1(), json!({"id": "X-1", "status": "open", "title": "T"}));

        let ticket = reconciler.begin_fetch(&x1());
        reconciler.apply_update(&PushUpdate::new(x1(), "status", "u9", json!("closed")));
        reconciler.complete_fetch(ticket, json!({"id": "X-1", "status": "open", "title": "T2"}));

        assert_eq!(
            cache.value(&x1()),
            Some(json!({"id": "X-1", "status": "closed", "title": "T2"}))
        );

        // Marks are gone once no fetch is outstanding.
        let ticket = reconciler.begin_fetch(&x1());
        reconciler.complete_fetch(ticket, json!({"id": "X-1", "status": "open", "title": "T3"}));
        assert_eq!(
            cache.value(&x1()),
            Some(json!({"id": "X-1", "status": "open", "title": "T3"}))
        );
    }

    #[test]
    fn forget_allows_reapplying_an_id() {
        let (cache, reconciler) = setup(FieldAliases::new());
        cache.replace(&x1(), json!({"id": "X-1"}));
        let update = PushUpdate::new(x1(), "status", "u1", json!("a"));

        reconciler.apply_update(&update);
        assert_eq!(reconciler.last_seen(&x1(), "status"), Some(UpdateId::new("u1")));
        assert_eq!(reconciler.forget(&x1()), 1);
        assert_ne!(reconciler.apply_update(&update), ApplyOutcome::Duplicate);
    }
}
