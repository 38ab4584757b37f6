//! The session's instance arena.
//!
//! `Store` owns every instance together with the identity map, the change
//! tracker and the transaction frames. Mutable access through
//! [`Store::get_mut`] saves the instance into the innermost open frame on
//! first touch, which is what makes rollback exact.

use crate::change_tracker::{Baseline, ChangeTracker};
use crate::identity_map::IdentityMap;
use crate::instance::{Instance, InstanceId, InstanceState};
use crate::transaction::TransactionFrame;
use sqlunit_core::{Error, MapperRegistry, Result, format_key};

#[derive(Debug, Default)]
pub(crate) struct Store {
    instances: Vec<Instance>,
    pub(crate) identity: IdentityMap,
    pub(crate) tracker: ChangeTracker,
    frames: Vec<TransactionFrame>,
    next_seq: u64,
    /// Instances below this index were released by `close` and are only
    /// scanned again once reattached.
    scan_from: usize,
    revived: Vec<InstanceId>,
}

impl Store {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::result_large_err)]
    pub(crate) fn check(&self, id: InstanceId) -> Result<()> {
        if id.0 < self.instances.len() {
            Ok(())
        } else {
            Err(Error::invalid_request(format!(
                "instance {} does not belong to this session",
                id
            )))
        }
    }

    pub(crate) fn push(&mut self, instance: Instance) -> InstanceId {
        self.instances.push(instance);
        InstanceId(self.instances.len() - 1)
    }

    pub(crate) fn get(&self, id: InstanceId) -> &Instance {
        &self.instances[id.0]
    }

    /// Mutable access, saving the instance into the innermost frame first.
    pub(crate) fn get_mut(&mut self, id: InstanceId) -> &mut Instance {
        self.record(id);
        &mut self.instances[id.0]
    }

    /// Mutable access that is not undone by rollback.
    pub(crate) fn get_mut_untracked(&mut self, id: InstanceId) -> &mut Instance {
        &mut self.instances[id.0]
    }

    fn record(&mut self, id: InstanceId) {
        if let Some(frame) = self.frames.last_mut() {
            if !frame.is_saved(id) {
                frame.save(id, &self.instances[id.0], self.tracker.baseline(id));
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.instances.len()
    }

    fn live(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.revived
            .iter()
            .copied()
            .chain((self.scan_from..self.instances.len()).map(InstanceId))
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = InstanceId> + use<> {
        self.live().collect::<Vec<_>>().into_iter()
    }

    pub(crate) fn instances(&self) -> impl Iterator<Item = (InstanceId, &Instance)> {
        self.live().map(move |id| (id, &self.instances[id.0]))
    }

    /// Stop scanning every instance that exists now. Handles stay valid.
    pub(crate) fn release_all(&mut self) {
        tracing::debug!(
            released = self.instances.len() - self.scan_from + self.revived.len(),
            "Instances released from session scans"
        );
        self.scan_from = self.instances.len();
        self.revived.clear();
    }

    /// Bring a released instance back into scans.
    pub(crate) fn revive(&mut self, id: InstanceId) {
        if id.0 < self.scan_from && !self.revived.contains(&id) {
            self.revived.push(id);
        }
    }

    /// Number of instances that scans still visit.
    pub(crate) fn scanned(&self) -> usize {
        self.instances.len() - self.scan_from + self.revived.len()
    }

    /// Attached instances ordered by registration sequence.
    pub(crate) fn attached_in_order(&self) -> Vec<InstanceId> {
        let mut ids: Vec<InstanceId> = self
            .instances()
            .filter(|(_, inst)| inst.state.is_attached())
            .map(|(id, _)| id)
            .collect();
        ids.sort_by_key(|id| (self.instances[id.0].seq, id.0));
        ids
    }

    pub(crate) fn count_in(&self, state: InstanceState) -> usize {
        self.instances().filter(|(_, i)| i.state == state).count()
    }

    /// Give the instance a registration sequence number if it has none.
    pub(crate) fn assign_seq(&mut self, id: InstanceId) {
        if self.instances[id.0].seq == 0 {
            self.next_seq += 1;
            let seq = self.next_seq;
            self.get_mut(id).seq = seq;
        }
    }

    pub(crate) fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub(crate) fn snapshot(&mut self, id: InstanceId) {
        self.record(id);
        self.tracker.snapshot(id, &self.instances[id.0]);
    }

    /// Baseline for an instance that no open frame should restore.
    pub(crate) fn snapshot_untracked(&mut self, id: InstanceId) {
        self.tracker.snapshot(id, &self.instances[id.0]);
    }

    pub(crate) fn forget_baseline(&mut self, id: InstanceId) {
        self.record(id);
        self.tracker.forget(id);
    }

    pub(crate) fn baseline_mut(&mut self, id: InstanceId) -> Option<&mut Baseline> {
        self.record(id);
        self.tracker.baseline_mut(id)
    }

    // --- transaction frames ---

    pub(crate) fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Open the outermost frame if none is open.
    pub(crate) fn ensure_frame(&mut self) {
        if self.frames.is_empty() {
            tracing::debug!("Logical transaction started");
            self.frames.push(TransactionFrame::root());
        }
    }

    pub(crate) fn push_savepoint(&mut self, name: String) {
        self.ensure_frame();
        self.frames.push(TransactionFrame::nested(name));
    }

    pub(crate) fn innermost_savepoint(&self) -> Option<&str> {
        self.frames.last().and_then(|f| f.savepoint.as_deref())
    }

    /// Keep the innermost savepoint's changes as part of its parent.
    pub(crate) fn release_frame(&mut self) {
        if self.frames.len() < 2 {
            return;
        }
        if let Some(child) = self.frames.pop() {
            if let Some(parent) = self.frames.last_mut() {
                parent.absorb(child);
            }
        }
    }

    /// Undo the innermost frame.
    pub(crate) fn rollback_frame(&mut self, registry: &MapperRegistry) {
        if let Some(frame) = self.frames.pop() {
            self.restore(frame);
            self.rebuild_identity(registry);
        }
    }

    /// Undo every frame, innermost first.
    pub(crate) fn rollback_all(&mut self, registry: &MapperRegistry) {
        let restored: usize = self.frames.iter().map(TransactionFrame::touched).sum();
        while let Some(frame) = self.frames.pop() {
            self.restore(frame);
        }
        self.rebuild_identity(registry);
        tracing::debug!(restored, "In-memory state rolled back");
    }

    /// Forget all frames after a successful commit.
    pub(crate) fn commit_all(&mut self) {
        self.frames.clear();
    }

    fn restore(&mut self, frame: TransactionFrame) {
        for (id, saved) in frame.saved {
            self.instances[id.0] = saved.instance;
            self.tracker.restore(id, saved.baseline);
        }
    }

    /// Re-derive the identity map from persistent and deleted instances.
    pub(crate) fn rebuild_identity(&mut self, registry: &MapperRegistry) {
        self.identity.clear();
        for id in self.live().collect::<Vec<_>>() {
            let inst = &self.instances[id.0];
            if !matches!(
                inst.state,
                InstanceState::Persistent | InstanceState::Deleted
            ) {
                continue;
            }
            let Some(mapper) = registry.mapper(inst.entity) else {
                continue;
            };
            let pk = inst.primary_key(mapper);
            if let Err(e) = self.identity.register(inst.entity, pk.clone(), id) {
                tracing::warn!(
                    entity = inst.entity,
                    key = %format_key(&pk),
                    error = %e,
                    "Identity map rebuild skipped an instance"
                );
            }
        }
    }
}
