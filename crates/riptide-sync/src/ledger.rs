use std::collections::HashMap;

use crate::protocol::{ResourceKey, UpdateId};

/// Last applied update id per `resource:field`.
///
/// Only equality is checked: ids are unique per delivery but carry no order.
#[derive(Debug, Default)]
pub struct UpdateLedger {
    seen: HashMap<ResourceKey, HashMap<String, UpdateId>>,
}

impl UpdateLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_duplicate(&self, key: &ResourceKey, field: &str, id: &UpdateId) -> bool {
        self.seen
            .get(key)
            .and_then(|fields| fields.get(field))
            .is_some_and(|last| last == id)
    }

    /// Stores `id` as the latest for `key`/`field`, returning the previous one.
    pub fn record(&mut self, key: &ResourceKey, field: &str, id: UpdateId) -> Option<UpdateId> {
        self.seen
            .entry(key.clone())
            .or_default()
            .insert(field.to_string(), id)
    }

    pub fn last_seen(&self, key: &ResourceKey, field: &str) -> Option<&UpdateId> {
        self.seen.get(key).and_then(|fields| fields.get(field))
    }

    /// Drops every entry for `key`. Returns how many were removed.
    pub fn forget(&mut self, key: &ResourceKey) -> usize {
        self.seen.remove(key).map_or(0, |fields| fields.len())
    }

    pub fn len(&self) -> usize {
        self.seen.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
