//! Identity Map pattern: one live instance per (entity, primary key).
//!
//! Keys are bucketed by entity and by `hash(pk)`; each bucket keeps the
//! full key values so hash collisions are confirmed by value comparison.
//! `Int` and `BigInt` keys of equal magnitude are the same identity.

use crate::instance::InstanceId;
use sqlunit_core::{
    Error, IdentityConflictError, Result, Value, format_key, hash_values, keys_equal,
};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Entry {
    pk: Vec<Value>,
    id: InstanceId,
}

/// Session-scoped map from `(entity, pk)` to the live instance.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entities: HashMap<&'static str, HashMap<u64, Vec<Entry>>>,
    len: usize,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the instance registered for a key.
    pub fn get(&self, entity: &str, pk: &[Value]) -> Option<InstanceId> {
        self.entities
            .get(entity)?
            .get(&hash_values(pk))?
            .iter()
            .find(|e| keys_equal(&e.pk, pk))
            .map(|e| e.id)
    }

    pub fn contains(&self, entity: &str, pk: &[Value]) -> bool {
        self.get(entity, pk).is_some()
    }

    /// Register `id` under `(entity, pk)`.
    ///
    /// Re-registering the same instance is a no-op. A different instance
    /// under the same key fails with `IdentityConflict`.
    #[allow(clippy::result_large_err)]
    pub fn register(&mut self, entity: &'static str, pk: Vec<Value>, id: InstanceId) -> Result<()> {
        let bucket = self
            .entities
            .entry(entity)
            .or_default()
            .entry(hash_values(&pk))
            .or_default();
        if let Some(existing) = bucket.iter().find(|e| keys_equal(&e.pk, &pk)) {
            if existing.id == id {
                return Ok(());
            }
            tracing::warn!(
                entity = entity,
                key = %format_key(&pk),
                existing = %existing.id,
                incoming = %id,
                "Identity conflict"
            );
            return Err(Error::IdentityConflict(IdentityConflictError {
                entity: entity.to_string(),
                key: format_key(&pk),
            }));
        }
        tracing::trace!(entity = entity, key = %format_key(&pk), id = %id, "Identity registered");
        bucket.push(Entry { pk, id });
        self.len += 1;
        Ok(())
    }

    /// Remove whatever instance is registered for the key.
    pub fn remove(&mut self, entity: &str, pk: &[Value]) -> Option<InstanceId> {
        let by_hash = self.entities.get_mut(entity)?;
        let hash = hash_values(pk);
        let bucket = by_hash.get_mut(&hash)?;
        let pos = bucket.iter().position(|e| keys_equal(&e.pk, pk))?;
        let entry = bucket.swap_remove(pos);
        if bucket.is_empty() {
            by_hash.remove(&hash);
        }
        self.len -= 1;
        Some(entry.id)
    }

    /// Remove the key only if it is held by `id`.
    pub fn remove_instance(&mut self, entity: &str, pk: &[Value], id: InstanceId) -> bool {
        if self.get(entity, pk) == Some(id) {
            self.remove(entity, pk);
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        self.entities.clear();
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Registered instance ids, in no particular order.
    pub fn ids(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.entities
            .values()
            .flat_map(|by_hash| by_hash.values())
            .flatten()
            .map(|e| e.id)
    }
}
