//! Transaction frames.
//!
//! A frame is opened when the session's logical transaction begins and one
//! more for every savepoint. The first time an instance is touched inside a
//! frame its state and baseline are saved; rolling the frame back restores
//! exactly those saves. Releasing a savepoint hands its saves to the parent
//! frame unless the parent already holds an older copy.

use crate::change_tracker::Baseline;
use crate::instance::{Instance, InstanceId};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub(crate) struct Saved {
    pub(crate) instance: Instance,
    pub(crate) baseline: Option<Baseline>,
}

#[derive(Debug, Default)]
pub(crate) struct TransactionFrame {
    /// Savepoint name; `None` for the outermost frame.
    pub(crate) savepoint: Option<String>,
    pub(crate) saved: HashMap<InstanceId, Saved>,
}

impl TransactionFrame {
    pub(crate) fn root() -> Self {
        Self::default()
    }

    pub(crate) fn nested(name: String) -> Self {
        Self {
            savepoint: Some(name),
            saved: HashMap::new(),
        }
    }

    pub(crate) fn is_saved(&self, id: InstanceId) -> bool {
        self.saved.contains_key(&id)
    }

    pub(crate) fn save(&mut self, id: InstanceId, instance: &Instance, baseline: Option<&Baseline>) {
        self.saved.entry(id).or_insert_with(|| Saved {
            instance: instance.clone(),
            baseline: baseline.cloned(),
        });
    }

    /// Fold a released child frame into this one.
    pub(crate) fn absorb(&mut self, child: TransactionFrame) {
        for (id, saved) in child.saved {
            self.saved.entry(id).or_insert(saved);
        }
    }

    pub(crate) fn touched(&self) -> usize {
        self.saved.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{InstanceState, RelationSlot};
    use sqlunit_core::Value;

    fn inst(v: i64) -> Instance {
        Instance {
            entity: "T",
            values: vec![Value::BigInt(v)],
            relations: vec![RelationSlot::Scalar(None)],
            state: InstanceState::Persistent,
            seq: 1,
            expired: vec![false],
        }
    }

    #[test]
    fn test_first_touch_wins() {
        let mut frame = TransactionFrame::root();
        frame.save(InstanceId(0), &inst(1), None);
        frame.save(InstanceId(0), &inst(2), None);
        assert_eq!(frame.saved[&InstanceId(0)].instance.values, vec![Value::BigInt(1)]);
        assert!(frame.is_saved(InstanceId(0)));
        assert_eq!(frame.touched(), 1);
    }

    #[test]
    fn test_absorb_keeps_parent_copy() {
        let mut parent = TransactionFrame::root();
        parent.save(InstanceId(0), &inst(1), None);
        let mut child = TransactionFrame::nested("sp_1".into());
        child.save(InstanceId(0), &inst(5), None);
        child.save(InstanceId(1), &inst(7), None);
        parent.absorb(child);
        assert_eq!(parent.saved[&InstanceId(0)].instance.values, vec![Value::BigInt(1)]);
        assert_eq!(parent.saved[&InstanceId(1)].instance.values, vec![Value::BigInt(7)]);
    }
}
