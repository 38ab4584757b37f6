//! Cascade propagation.
//!
//! Each resolved relation carries a [`Cascade`](sqlunit_core::Cascade)
//! table. The walkers below follow it with an explicit worklist in
//! registration order, so traversal depth never grows the call stack and
//! the visiting order is deterministic.

use crate::instance::{InstanceId, InstanceState};
use crate::store::Store;
use sqlunit_core::{Cascade, Error, MapperRegistry, Result};
use std::collections::{HashSet, VecDeque};

/// Move one instance into the session.
///
/// Transient instances become pending. Detached instances are reattached
/// as persistent and re-registered in the identity map.
#[allow(clippy::result_large_err)]
pub(crate) fn attach(registry: &MapperRegistry, store: &mut Store, id: InstanceId) -> Result<()> {
    let state = store.get(id).state;
    if !state.is_attached() {
        store.revive(id);
    }
    match state {
        InstanceState::Transient => {
            store.get_mut(id).state = InstanceState::Pending;
            store.assign_seq(id);
            tracing::trace!(id = %id, entity = store.get(id).entity, "Instance pending");
        }
        InstanceState::Detached => {
            let entity = store.get(id).entity;
            let mapper = registry.get(entity)?;
            let pk = store.get(id).primary_key(mapper);
            store.identity.register(entity, pk, id)?;
            store.get_mut(id).state = InstanceState::Persistent;
            store.assign_seq(id);
            tracing::trace!(id = %id, entity = entity, "Instance reattached");
        }
        _ => {}
    }
    Ok(())
}

fn follow(
    registry: &MapperRegistry,
    store: &Store,
    id: InstanceId,
    pick: impl Fn(&Cascade) -> bool,
) -> Result<Vec<InstanceId>> {
    let inst = store.get(id);
    let mapper = registry.get(inst.entity)?;
    let mut out = Vec::new();
    for rel in mapper.relations() {
        if pick(&rel.cascade) {
            out.extend(inst.relations[rel.index].members());
        }
    }
    Ok(out)
}

/// Attach every instance reachable from `roots` through save-update cascades.
#[allow(clippy::result_large_err)]
pub(crate) fn cascade_save(
    registry: &MapperRegistry,
    store: &mut Store,
    roots: &[InstanceId],
) -> Result<usize> {
    let mut visited: HashSet<InstanceId> = roots.iter().copied().collect();
    let mut queue: VecDeque<InstanceId> = roots.iter().copied().collect();
    let mut attached = 0;

    while let Some(id) = queue.pop_front() {
        if store.get(id).state == InstanceState::Deleted {
            continue;
        }
        for member in follow(registry, store, id, |c| c.save_update)? {
            if !visited.insert(member) {
                continue;
            }
            let state = store.get(member).state;
            if matches!(state, InstanceState::Transient | InstanceState::Detached) {
                attach(registry, store, member)?;
                attached += 1;
            }
            queue.push_back(member);
        }
    }
    if attached > 0 {
        tracing::debug!(attached, "Save-update cascade attached instances");
    }
    Ok(attached)
}

/// Mark `root` deleted and cascade through delete relations.
///
/// Cascaded persistent instances become deleted; cascaded pending ones are
/// expunged since they have no row.
#[allow(clippy::result_large_err)]
pub(crate) fn cascade_delete(
    registry: &MapperRegistry,
    store: &mut Store,
    root: InstanceId,
) -> Result<()> {
    let next = store.get(root).state.on_delete()?;
    store.get_mut(root).state = next;

    let mut visited = HashSet::from([root]);
    let mut queue = VecDeque::from([root]);
    while let Some(id) = queue.pop_front() {
        for member in follow(registry, store, id, |c| c.delete)? {
            if !visited.insert(member) {
                continue;
            }
            match store.get(member).state {
                InstanceState::Persistent => {
                    store.get_mut(member).state = InstanceState::Deleted;
                    tracing::trace!(id = %member, "Delete cascaded");
                    queue.push_back(member);
                }
                InstanceState::Pending => {
                    expunge_one(registry, store, member)?;
                    queue.push_back(member);
                }
                InstanceState::Deleted => queue.push_back(member),
                InstanceState::Transient | InstanceState::Detached => {}
            }
        }
    }
    Ok(())
}

fn expunge_one(registry: &MapperRegistry, store: &mut Store, id: InstanceId) -> Result<()> {
    let inst = store.get(id);
    let entity = inst.entity;
    if matches!(inst.state, InstanceState::Persistent | InstanceState::Deleted) {
        let pk = inst.primary_key(registry.get(entity)?);
        store.identity.remove_instance(entity, &pk, id);
    }
    let next = store.get(id).state.on_expunge();
    store.get_mut(id).state = next;
    tracing::trace!(id = %id, entity = entity, state = %next, "Instance expunged");
    Ok(())
}

/// Expunge `root` and cascade through expunge relations.
#[allow(clippy::result_large_err)]
pub(crate) fn cascade_expunge(
    registry: &MapperRegistry,
    store: &mut Store,
    root: InstanceId,
) -> Result<()> {
    if !store.get(root).state.is_attached() {
        return Err(Error::invalid_request(format!(
            "instance {} is not present in this session",
            root
        )));
    }
    let mut visited = HashSet::from([root]);
    let mut queue = VecDeque::from([root]);
    while let Some(id) = queue.pop_front() {
        let members = follow(registry, store, id, |c| c.expunge)?;
        expunge_one(registry, store, id)?;
        for member in members {
            if store.get(member).state.is_attached() && visited.insert(member) {
                queue.push_back(member);
            }
        }
    }
    Ok(())
}

/// Flush-time cascade pass.
///
/// Re-runs the save-update cascade from every live instance, re-applies
/// delete cascades to relations populated after `delete`, deletes orphans
/// and finally refuses relationships that point outside the session.
#[tracing::instrument(level = "debug", skip(registry, store))]
#[allow(clippy::result_large_err)]
pub(crate) fn prepare(registry: &MapperRegistry, store: &mut Store) -> Result<()> {
    let live: Vec<InstanceId> = store
        .attached_in_order()
        .into_iter()
        .filter(|id| store.get(*id).state != InstanceState::Deleted)
        .collect();
    cascade_save(registry, store, &live)?;

    let deleted: Vec<InstanceId> = store
        .attached_in_order()
        .into_iter()
        .filter(|id| store.get(*id).state == InstanceState::Deleted)
        .collect();
    for id in deleted {
        cascade_delete(registry, store, id)?;
    }

    delete_orphans(registry, store)?;
    check_reachable(registry, store)
}

fn delete_orphans(registry: &MapperRegistry, store: &mut Store) -> Result<()> {
    let mut orphans = Vec::new();
    for id in store.attached_in_order() {
        let inst = store.get(id);
        if inst.state == InstanceState::Deleted {
            continue;
        }
        let mapper = registry.get(inst.entity)?;
        let changes = store.tracker.diff(id, inst);
        for rel in mapper.relations() {
            if !rel.cascade.delete_orphan {
                continue;
            }
            for child in changes.removed_from(rel.index) {
                let child_state = store.get(child).state;
                if !matches!(child_state, InstanceState::Persistent | InstanceState::Pending) {
                    continue;
                }
                if has_live_parent(store, mapper.entity(), rel.index, child) {
                    continue;
                }
                orphans.push(child);
            }
        }
    }

    for orphan in orphans {
        match store.get(orphan).state {
            InstanceState::Persistent => {
                tracing::debug!(id = %orphan, entity = store.get(orphan).entity, "Deleting orphan");
                cascade_delete(registry, store, orphan)?;
            }
            InstanceState::Pending => {
                tracing::debug!(id = %orphan, "Expunging pending orphan");
                expunge_one(registry, store, orphan)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn has_live_parent(store: &Store, entity: &str, rel_index: usize, child: InstanceId) -> bool {
    store.instances().any(|(_, parent)| {
        parent.entity == entity
            && matches!(
                parent.state,
                InstanceState::Pending | InstanceState::Persistent
            )
            && parent.relations[rel_index].contains(child)
    })
}

fn check_reachable(registry: &MapperRegistry, store: &Store) -> Result<()> {
    for id in store.attached_in_order() {
        let inst = store.get(id);
        if inst.state == InstanceState::Deleted {
            continue;
        }
        let mapper = registry.get(inst.entity)?;
        for rel in mapper.relations() {
            for member in inst.relations[rel.index].members() {
                let state = store.get(member).state;
                if !state.is_attached() {
                    return Err(Error::invalid_request(format!(
                        "'{}' instance {} is {} but is referenced by relationship '{}' of '{}' {}, \
                         which does not cascade save-update",
                        rel.target(),
                        member,
                        state,
                        rel.name(),
                        inst.entity,
                        id
                    )));
                }
            }
        }
    }
    Ok(())
}
