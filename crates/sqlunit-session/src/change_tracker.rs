//! Change tracking and dirty detection.
//!
//! The tracker keeps the committed baseline of every persistent instance:
//! its column values and relationship membership as last loaded or flushed.
//! Diffs compare the live instance against that baseline attribute by
//! attribute and never mutate either side.

use crate::instance::{Instance, InstanceId, RelationSlot};
use serde::Serialize;
use sqlunit_core::Value;
use std::collections::HashMap;

/// Committed state of one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Baseline {
    pub values: Vec<Value>,
    pub relations: Vec<RelationSlot>,
    /// Columns whose committed value was actually seen. Expired columns
    /// hold a placeholder.
    pub known: Vec<bool>,
}

impl Baseline {
    pub fn of(instance: &Instance) -> Self {
        Self {
            values: instance.values.clone(),
            relations: instance.relations.clone(),
            known: instance.expired.iter().map(|e| !e).collect(),
        }
    }

    /// Committed value of column `index`, unless it was never seen.
    pub fn known_value(&self, index: usize) -> Option<&Value> {
        self.known[index].then(|| &self.values[index])
    }
}

/// Differences between an instance and its baseline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    /// Field indices whose value differs.
    pub changed_columns: Vec<usize>,
    /// `(relation index, member)` pairs present now but not in the baseline.
    pub added_relations: Vec<(usize, InstanceId)>,
    /// `(relation index, member)` pairs present in the baseline but not now.
    pub removed_relations: Vec<(usize, InstanceId)>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changed_columns.is_empty()
            && self.added_relations.is_empty()
            && self.removed_relations.is_empty()
    }

    pub fn column_changed(&self, index: usize) -> bool {
        self.changed_columns.contains(&index)
    }

    /// Whether membership of relation `index` changed.
    pub fn relation_changed(&self, index: usize) -> bool {
        self.added_relations
            .iter()
            .chain(&self.removed_relations)
            .any(|(r, _)| *r == index)
    }

    pub fn removed_from(&self, index: usize) -> impl Iterator<Item = InstanceId> + '_ {
        self.removed_relations
            .iter()
            .filter(move |(r, _)| *r == index)
            .map(|(_, id)| *id)
    }
}

/// Baselines of tracked instances.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    baselines: HashMap<InstanceId, Baseline>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the instance's current state as its committed baseline.
    #[tracing::instrument(level = "trace", skip(self, instance))]
    pub fn snapshot(&mut self, id: InstanceId, instance: &Instance) {
        tracing::trace!(
            entity = instance.entity,
            columns = instance.values.len(),
            "Taking instance snapshot"
        );
        self.baselines.insert(id, Baseline::of(instance));
    }

    /// Same as [`snapshot`](Self::snapshot); called after a successful flush.
    pub fn reset_baseline(&mut self, id: InstanceId, instance: &Instance) {
        self.snapshot(id, instance);
    }

    pub fn baseline(&self, id: InstanceId) -> Option<&Baseline> {
        self.baselines.get(&id)
    }

    pub(crate) fn baseline_mut(&mut self, id: InstanceId) -> Option<&mut Baseline> {
        self.baselines.get_mut(&id)
    }

    /// Replace (or drop) the baseline wholesale.
    pub(crate) fn restore(&mut self, id: InstanceId, baseline: Option<Baseline>) {
        match baseline {
            Some(b) => {
                self.baselines.insert(id, b);
            }
            None => {
                self.baselines.remove(&id);
            }
        }
    }

    /// Baseline value of one column, if a baseline exists.
    pub fn original_value(&self, id: InstanceId, index: usize) -> Option<&Value> {
        self.baselines.get(&id).map(|b| &b.values[index])
    }

    pub fn forget(&mut self, id: InstanceId) {
        self.baselines.remove(&id);
    }

    pub fn has_baseline(&self, id: InstanceId) -> bool {
        self.baselines.contains_key(&id)
    }

    /// Compare an instance with its baseline.
    ///
    /// Without a baseline every non-null column is reported as changed and
    /// every relationship member as added.
    pub fn diff(&self, id: InstanceId, instance: &Instance) -> ChangeSet {
        let mut changes = ChangeSet::default();
        let Some(base) = self.baselines.get(&id) else {
            changes.changed_columns = instance
                .values
                .iter()
                .enumerate()
                .filter(|(_, v)| !v.is_null())
                .map(|(i, _)| i)
                .collect();
            for (r, slot) in instance.relations.iter().enumerate() {
                changes
                    .added_relations
                    .extend(slot.members().into_iter().map(|m| (r, m)));
            }
            return changes;
        };

        changes.changed_columns = instance
            .values
            .iter()
            .zip(&base.values)
            .enumerate()
            .filter(|(_, (now, then))| now != then)
            .map(|(i, _)| i)
            .collect();

        for (r, (now, then)) in instance.relations.iter().zip(&base.relations).enumerate() {
            if now == then {
                continue;
            }
            let (now, then) = (now.members(), then.members());
            changes.added_relations.extend(
                now.iter()
                    .filter(|m| !then.contains(m))
                    .map(|m| (r, *m)),
            );
            changes.removed_relations.extend(
                then.iter()
                    .filter(|m| !now.contains(m))
                    .map(|m| (r, *m)),
            );
        }
        changes
    }

    /// Whether the instance differs from its baseline.
    pub fn is_dirty(&self, id: InstanceId, instance: &Instance) -> bool {
        !self.diff(id, instance).is_empty()
    }

    pub fn len(&self) -> usize {
        self.baselines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.baselines.is_empty()
    }

    pub fn clear(&mut self) {
        self.baselines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceState;

    fn instance(values: Vec<Value>, relations: Vec<RelationSlot>) -> Instance {
        Instance {
            entity: "Thing",
            expired: vec![false; values.len()],
            values,
            relations,
            state: InstanceState::Persistent,
            seq: 1,
        }
    }

    #[test]
    fn test_no_baseline_reports_non_null_columns() {
        let tracker = ChangeTracker::new();
        let inst = instance(
            vec![Value::Null, Value::Text("a".into()), Value::BigInt(3)],
            vec![RelationSlot::Collection(vec![InstanceId(4)])],
        );
        let diff = tracker.diff(InstanceId(0), &inst);
        assert_eq!(diff.changed_columns, vec![1, 2]);
        assert_eq!(diff.added_relations, vec![(0, InstanceId(4))]);
        assert!(diff.removed_relations.is_empty());
    }

    #[test]
    fn test_snapshot_then_diff_is_empty() {
        let mut tracker = ChangeTracker::new();
        let inst = instance(
            vec![Value::BigInt(1), Value::Text("a".into())],
            vec![RelationSlot::Scalar(Some(InstanceId(2)))],
        );
        tracker.snapshot(InstanceId(0), &inst);
        assert!(!tracker.is_dirty(InstanceId(0), &inst));
    }

    #[test]
    fn test_column_and_relation_changes() {
        let mut tracker = ChangeTracker::new();
        let mut inst = instance(
            vec![Value::BigInt(1), Value::Text("a".into())],
            vec![RelationSlot::Collection(vec![InstanceId(2), InstanceId(3)])],
        );
        tracker.snapshot(InstanceId(0), &inst);

        inst.values[1] = Value::Text("b".into());
        inst.relations[0] = RelationSlot::Collection(vec![InstanceId(3), InstanceId(5)]);
        let diff = tracker.diff(InstanceId(0), &inst);
        assert_eq!(diff.changed_columns, vec![1]);
        assert_eq!(diff.added_relations, vec![(0, InstanceId(5))]);
        assert_eq!(diff.removed_relations, vec![(0, InstanceId(2))]);
        assert!(diff.relation_changed(0));
        assert_eq!(diff.removed_from(0).collect::<Vec<_>>(), vec![InstanceId(2)]);
        assert_eq!(tracker.original_value(InstanceId(0), 1), Some(&Value::Text("a".into())));
    }

    #[test]
    fn test_expired_columns_have_no_known_value() {
        let mut tracker = ChangeTracker::new();
        let mut inst = instance(vec![Value::BigInt(1), Value::Null], vec![]);
        inst.expired[1] = true;
        tracker.snapshot(InstanceId(0), &inst);

        let base = tracker.baseline(InstanceId(0)).unwrap();
        assert_eq!(base.known_value(0), Some(&Value::BigInt(1)));
        assert_eq!(base.known_value(1), None);
    }

    #[test]
    fn test_diff_does_not_mutate() {
        let mut tracker = ChangeTracker::new();
        let mut inst = instance(vec![Value::BigInt(1)], vec![]);
        tracker.snapshot(InstanceId(0), &inst);
        inst.values[0] = Value::BigInt(2);
        let _ = tracker.diff(InstanceId(0), &inst);
        assert_eq!(
            tracker.baseline(InstanceId(0)).unwrap().values,
            vec![Value::BigInt(1)]
        );
    }

    #[test]
    fn test_forget_and_restore() {
        let mut tracker = ChangeTracker::new();
        let inst = instance(vec![Value::BigInt(1)], vec![]);
        tracker.snapshot(InstanceId(0), &inst);
        let saved = tracker.baseline(InstanceId(0)).cloned();
        tracker.forget(InstanceId(0));
        assert!(!tracker.has_baseline(InstanceId(0)));
        tracker.restore(InstanceId(0), saved);
        assert_eq!(tracker.len(), 1);
    }
}
