//! Entity instances and their lifecycle state machine.
//!
//! Instances live in the session's arena and are addressed by a copyable
//! [`InstanceId`]. Relationship slots hold ids, never references, so cyclic
//! object graphs need no shared ownership.

use serde::Serialize;
use sqlunit_core::{Error, Mapper, Result, Value};
use std::fmt;

/// Handle to an instance owned by one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InstanceId(pub(crate) usize);

impl InstanceId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of an instance relative to its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum InstanceState {
    /// Created but never added to the session.
    Transient,
    /// Added; will be inserted on the next flush.
    Pending,
    /// Backed by a row and present in the identity map.
    Persistent,
    /// Marked for deletion; will be deleted on the next flush.
    Deleted,
    /// No longer associated with the session.
    Detached,
}

impl InstanceState {
    /// State after `add`.
    ///
    /// Detached instances are reattached as persistent. Attached states are
    /// unchanged.
    pub fn on_add(self) -> Self {
        match self {
            InstanceState::Transient => InstanceState::Pending,
            InstanceState::Detached => InstanceState::Persistent,
            other => other,
        }
    }

    /// State after `delete`.
    #[allow(clippy::result_large_err)]
    pub fn on_delete(self) -> Result<Self> {
        match self {
            InstanceState::Persistent | InstanceState::Deleted => Ok(InstanceState::Deleted),
            other => Err(Error::invalid_request(format!(
                "cannot delete an instance that is {}",
                other.as_str()
            ))),
        }
    }

    /// State after the instance's row operation was flushed.
    pub fn on_flushed(self) -> Self {
        match self {
            InstanceState::Pending => InstanceState::Persistent,
            InstanceState::Deleted => InstanceState::Detached,
            other => other,
        }
    }

    /// State after `expunge`.
    pub fn on_expunge(self) -> Self {
        match self {
            InstanceState::Pending => InstanceState::Transient,
            InstanceState::Persistent | InstanceState::Deleted => InstanceState::Detached,
            other => other,
        }
    }

    /// Whether the session tracks the instance.
    pub const fn is_attached(self) -> bool {
        matches!(
            self,
            InstanceState::Pending | InstanceState::Persistent | InstanceState::Deleted
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            InstanceState::Transient => "transient",
            InstanceState::Pending => "pending",
            InstanceState::Persistent => "persistent",
            InstanceState::Deleted => "deleted",
            InstanceState::Detached => "detached",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Membership of one relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationSlot {
    Scalar(Option<InstanceId>),
    Collection(Vec<InstanceId>),
}

impl RelationSlot {
    pub fn empty(collection: bool) -> Self {
        if collection {
            RelationSlot::Collection(Vec::new())
        } else {
            RelationSlot::Scalar(None)
        }
    }

    pub fn members(&self) -> Vec<InstanceId> {
        match self {
            RelationSlot::Scalar(member) => member.iter().copied().collect(),
            RelationSlot::Collection(members) => members.clone(),
        }
    }

    pub fn contains(&self, id: InstanceId) -> bool {
        match self {
            RelationSlot::Scalar(member) => *member == Some(id),
            RelationSlot::Collection(members) => members.contains(&id),
        }
    }

    /// Add `id`. A scalar slot is overwritten; its previous member is returned.
    pub(crate) fn insert(&mut self, id: InstanceId) -> Option<InstanceId> {
        match self {
            RelationSlot::Scalar(member) => member.replace(id).filter(|prev| *prev != id),
            RelationSlot::Collection(members) => {
                if !members.contains(&id) {
                    members.push(id);
                }
                None
            }
        }
    }

    pub(crate) fn remove(&mut self, id: InstanceId) -> bool {
        match self {
            RelationSlot::Scalar(member) if *member == Some(id) => {
                *member = None;
                true
            }
            RelationSlot::Scalar(_) => false,
            RelationSlot::Collection(members) => {
                let before = members.len();
                members.retain(|m| *m != id);
                members.len() != before
            }
        }
    }
}

/// One entity instance: column values, relationship slots and lifecycle data.
#[derive(Debug, Clone)]
pub struct Instance {
    pub(crate) entity: &'static str,
    pub(crate) values: Vec<Value>,
    pub(crate) relations: Vec<RelationSlot>,
    pub(crate) state: InstanceState,
    /// Registration order, assigned when the instance becomes pending or is loaded.
    pub(crate) seq: u64,
    /// Per-column expiry flags.
    pub(crate) expired: Vec<bool>,
}

impl Instance {
    /// A transient instance with every column NULL and empty relationships.
    pub fn new(mapper: &Mapper) -> Self {
        Self {
            entity: mapper.entity(),
            values: vec![Value::Null; mapper.field_count()],
            relations: mapper
                .relations()
                .iter()
                .map(|r| RelationSlot::empty(r.is_collection()))
                .collect(),
            state: InstanceState::Transient,
            seq: 0,
            expired: vec![false; mapper.field_count()],
        }
    }

    pub fn entity(&self) -> &'static str {
        self.entity
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn relation(&self, index: usize) -> &RelationSlot {
        &self.relations[index]
    }

    pub fn is_expired(&self) -> bool {
        self.expired.iter().any(|e| *e)
    }

    /// Current primary key values.
    pub fn primary_key(&self, mapper: &Mapper) -> Vec<Value> {
        project(&self.values, mapper.primary_key_indices())
    }

    /// Whether every primary key column holds a value.
    pub fn has_identity(&self, mapper: &Mapper) -> bool {
        mapper
            .primary_key_indices()
            .iter()
            .all(|&i| !self.values[i].is_null())
    }
}

/// Pick the values at `indices`.
pub(crate) fn project(values: &[Value], indices: &[usize]) -> Vec<Value> {
    indices.iter().map(|&i| values[i].clone()).collect()
}
