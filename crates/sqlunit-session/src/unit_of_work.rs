//! Dependency graph construction for one flush.
//!
//! Every pending, dirty or deleted instance becomes a [`RowOp`] node;
//! many-to-many membership changes become link nodes. Foreign keys between
//! rows become edges:
//!
//! - a new parent's INSERT precedes the child's INSERT or UPDATE;
//! - a deleted child's DELETE (or the UPDATE that detaches it) precedes the
//!   parent's DELETE;
//! - link rows are inserted after both endpoints and deleted before them.
//!
//! Cycles are broken by postponing an edge whose relationship is marked
//! `post_update` or whose foreign key is nullable. A postponed save edge
//! writes NULL first and fixes the column with a post-update; a postponed
//! delete edge nulls the column before the referenced row goes.

use crate::instance::{InstanceId, InstanceState, RelationSlot, project};
use crate::store::Store;
use serde::Serialize;
use sqlunit_core::{
    CycleMember, DependencyCycleError, Error, IdentityConflictError, Join, Mapper, MapperRegistry,
    Relation, Result, Value, format_key, hash_values, keys_equal,
};
use std::collections::{HashMap, HashSet};

/// Kind of a row operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
    /// Follow-up UPDATE of foreign key columns deferred to break a cycle.
    PostUpdate,
    LinkInsert,
    LinkDelete,
}

impl OpKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            OpKind::Insert => "INSERT",
            OpKind::Update => "UPDATE",
            OpKind::Delete => "DELETE",
            OpKind::PostUpdate => "POST-UPDATE",
            OpKind::LinkInsert => "LINK INSERT",
            OpKind::LinkDelete => "LINK DELETE",
        }
    }
}

/// Foreign key columns filled from a parent's primary key at execution time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FkSlot {
    /// Field indices on the dependent instance, in the parent's key order.
    pub columns: Vec<usize>,
    pub parent: InstanceId,
}

/// One association row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct LinkRow {
    pub table: &'static str,
    pub left_cols: Vec<&'static str>,
    pub left: InstanceId,
    pub right_cols: Vec<&'static str>,
    pub right: InstanceId,
}

impl LinkRow {
    /// Orient the row by column names so both sides of a bidirectional
    /// relationship produce the same value.
    fn normalized(
        table: &'static str,
        a_cols: &[&'static str],
        a: InstanceId,
        b_cols: &[&'static str],
        b: InstanceId,
    ) -> Self {
        if a_cols <= b_cols {
            Self {
                table,
                left_cols: a_cols.to_vec(),
                left: a,
                right_cols: b_cols.to_vec(),
                right: b,
            }
        } else {
            Self {
                table,
                left_cols: b_cols.to_vec(),
                left: b,
                right_cols: a_cols.to_vec(),
                right: a,
            }
        }
    }

    pub fn columns(&self) -> Vec<&'static str> {
        self.left_cols
            .iter()
            .chain(&self.right_cols)
            .copied()
            .collect()
    }
}

/// A node of the flush graph.
#[derive(Debug, Clone, Serialize)]
pub struct RowOp {
    pub kind: OpKind,
    pub instance: Option<InstanceId>,
    pub entity: &'static str,
    pub table: &'static str,
    /// Registration sequence used to break ordering ties.
    pub seq: u64,
    /// Field indices written by an INSERT or UPDATE.
    pub columns: Vec<usize>,
    /// Field indices written as NULL regardless of the instance value.
    pub nulls: Vec<usize>,
    pub slots: Vec<FkSlot>,
    pub link: Option<LinkRow>,
    /// Match the row by primary key only and leave the version column alone.
    pub key_only: bool,
    /// Nothing left to write after postponement.
    pub skipped: bool,
}

impl RowOp {
    pub(crate) fn for_instance(kind: OpKind, id: InstanceId, mapper: &Mapper, seq: u64) -> Self {
        Self {
            kind,
            instance: Some(id),
            entity: mapper.entity(),
            table: mapper.table(),
            seq,
            columns: Vec::new(),
            nulls: Vec::new(),
            slots: Vec::new(),
            link: None,
            key_only: false,
            skipped: false,
        }
    }

    fn for_link(kind: OpKind, entity: &'static str, link: LinkRow, seq: u64) -> Self {
        Self {
            kind,
            instance: None,
            entity,
            table: link.table,
            seq,
            columns: Vec::new(),
            nulls: Vec::new(),
            slots: Vec::new(),
            link: Some(link),
            key_only: true,
            skipped: false,
        }
    }

    /// Whether this op writes any of `columns`.
    fn writes_any(&self, columns: &[usize]) -> bool {
        match self.kind {
            OpKind::Insert => true,
            _ => columns.iter().any(|c| self.columns.contains(c)),
        }
    }
}

/// A foreign key dependency between two instances.
#[derive(Debug, Clone)]
pub(crate) struct Dependency {
    pub(crate) child: InstanceId,
    pub(crate) parent: InstanceId,
    /// Field indices on the child.
    pub(crate) fk: Vec<usize>,
    pub(crate) relation: &'static str,
    pub(crate) postponable: bool,
    pub(crate) post_update: bool,
    pub(crate) passive: bool,
    /// Whether the relationship membership changed since the baseline.
    pub(crate) changed: bool,
    pub(crate) fk_in_pk: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Edge {
    from: usize,
    to: usize,
    dep: Option<usize>,
    active: bool,
}

/// Row operations plus their ordering constraints.
#[derive(Debug, Default)]
pub struct FlushGraph {
    pub(crate) ops: Vec<RowOp>,
    edges: Vec<Edge>,
    deps: Vec<Dependency>,
}

impl FlushGraph {
    pub fn ops(&self) -> &[RowOp] {
        &self.ops
    }

    /// Number of ops that will execute.
    pub fn len(&self) -> usize {
        self.ops.iter().filter(|o| !o.skipped).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Active `(from, to)` edges.
    pub(crate) fn edges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.edges
            .iter()
            .filter(|e| e.active)
            .map(|e| (e.from, e.to))
    }

    pub(crate) fn push_op(&mut self, op: RowOp) -> usize {
        self.ops.push(op);
        self.ops.len() - 1
    }

    pub(crate) fn add_edge(&mut self, from: usize, to: usize, dep: Option<usize>) {
        let exists = self
            .edges
            .iter()
            .any(|e| e.active && e.from == from && e.to == to && e.dep == dep);
        if !exists {
            self.edges.push(Edge {
                from,
                to,
                dep,
                active: true,
            });
        }
    }

    fn add_dependency(&mut self, dep: Dependency) {
        if let Some(existing) = self
            .deps
            .iter_mut()
            .find(|d| d.child == dep.child && d.parent == dep.parent && d.fk == dep.fk)
        {
            existing.changed |= dep.changed;
            existing.post_update |= dep.post_update;
            existing.postponable |= dep.postponable;
            existing.passive |= dep.passive;
            return;
        }
        self.deps.push(dep);
    }
}

struct Removal {
    child: InstanceId,
    parent: InstanceId,
    fk: Vec<usize>,
    passive: bool,
    fk_in_pk: bool,
}

#[derive(Default)]
struct LinkChanges {
    inserts: Vec<(LinkRow, &'static str, u64)>,
    deletes: Vec<(LinkRow, &'static str, u64)>,
    seen: HashSet<(bool, LinkRow)>,
}

impl LinkChanges {
    fn push(&mut self, insert: bool, row: LinkRow, entity: &'static str, seq: u64) {
        if self.seen.insert((insert, row.clone())) {
            if insert {
                self.inserts.push((row, entity, seq));
            } else {
                self.deletes.push((row, entity, seq));
            }
        }
    }
}

fn dependency(
    child: InstanceId,
    parent: InstanceId,
    fk: &[usize],
    child_mapper: &Mapper,
    rel: &Relation,
    changed: bool,
) -> Dependency {
    Dependency {
        child,
        parent,
        fk: fk.to_vec(),
        relation: rel.name(),
        postponable: rel.is_postponable(),
        post_update: rel.info.post_update,
        passive: rel.is_passive_delete(),
        changed,
        fk_in_pk: fk.iter().any(|c| child_mapper.is_primary_key(*c)),
    }
}

fn set_null(store: &mut Store, id: InstanceId, columns: &[usize]) {
    if columns.iter().any(|&c| !store.get(id).values[c].is_null()) {
        let inst = store.get_mut(id);
        for &c in columns {
            inst.values[c] = Value::Null;
        }
    }
}

fn blank_pk_error(mapper: &Mapper, id: InstanceId, relation: &str) -> Error {
    Error::invalid_request(format!(
        "relationship '{}' would blank out primary key column(s) of '{}' {}",
        relation,
        mapper.entity(),
        id
    ))
}

/// Build the flush graph for every attached instance.
///
/// Foreign key columns are synchronised from relationships first, so the
/// UPDATE nodes reflect the relationship state.
#[tracing::instrument(level = "debug", skip(registry, store))]
#[allow(clippy::result_large_err)]
pub(crate) fn build(registry: &MapperRegistry, store: &mut Store) -> Result<FlushGraph> {
    let order = store.attached_in_order();
    let mut graph = FlushGraph::default();
    let mut links = LinkChanges::default();
    let mut removals = Vec::new();

    // 1. Dependencies from current and removed relationship members.
    for &id in &order {
        let inst = store.get(id);
        let mapper = registry.get(inst.entity)?;
        let changes = store.tracker.diff(id, inst);
        let deleted = inst.state == InstanceState::Deleted;

        for rel in mapper.relations() {
            let slot = &inst.relations[rel.index];
            match &rel.join {
                Join::Local { fk } => {
                    if let RelationSlot::Scalar(Some(parent)) = slot {
                        graph.add_dependency(dependency(
                            id,
                            *parent,
                            fk,
                            mapper,
                            rel,
                            changes.relation_changed(rel.index),
                        ));
                    }
                    for old in changes.removed_from(rel.index) {
                        removals.push(Removal {
                            child: id,
                            parent: old,
                            fk: fk.clone(),
                            passive: rel.is_passive_delete(),
                            fk_in_pk: fk.iter().any(|c| mapper.is_primary_key(*c)),
                        });
                    }
                }
                Join::Remote { fk } => {
                    let target = registry.get(rel.target())?;
                    for child in slot.members() {
                        let added = changes.added_relations.contains(&(rel.index, child));
                        graph.add_dependency(dependency(child, id, fk, target, rel, added));
                    }
                    for child in changes.removed_from(rel.index) {
                        removals.push(Removal {
                            child,
                            parent: id,
                            fk: fk.clone(),
                            passive: rel.is_passive_delete(),
                            fk_in_pk: fk.iter().any(|c| target.is_primary_key(*c)),
                        });
                    }
                }
                Join::Link {
                    table,
                    local,
                    remote,
                } => {
                    if deleted {
                        let members = store
                            .tracker
                            .baseline(id)
                            .map(|b| b.relations[rel.index].members())
                            .unwrap_or_default();
                        for m in members {
                            let row = LinkRow::normalized(table, local, id, remote, m);
                            links.push(false, row, mapper.entity(), inst.seq);
                        }
                        continue;
                    }
                    for &(r, m) in &changes.added_relations {
                        if r == rel.index && store.get(m).state != InstanceState::Deleted {
                            let row = LinkRow::normalized(table, local, id, remote, m);
                            links.push(true, row, mapper.entity(), inst.seq);
                        }
                    }
                    for m in changes.removed_from(rel.index) {
                        let row = LinkRow::normalized(table, local, id, remote, m);
                        links.push(false, row, mapper.entity(), inst.seq);
                    }
                }
            }
        }
    }

    // 2. Foreign key synchronisation.
    let mut slots: HashMap<InstanceId, Vec<FkSlot>> = HashMap::new();
    let mut detach_edges: Vec<(InstanceId, InstanceId)> = Vec::new();
    for dep in &graph.deps {
        let child_state = store.get(dep.child).state;
        let parent_state = store.get(dep.parent).state;
        if !child_state.is_attached()
            || !parent_state.is_attached()
            || child_state == InstanceState::Deleted
        {
            continue;
        }
        if parent_state == InstanceState::Deleted {
            if dep.passive {
                tracing::debug!(
                    child = %dep.child,
                    parent = %dep.parent,
                    relation = dep.relation,
                    "Passive delete leaves foreign key to the database"
                );
                continue;
            }
            let child_mapper = registry.get(store.get(dep.child).entity)?;
            if dep.fk_in_pk {
                return Err(blank_pk_error(child_mapper, dep.child, dep.relation));
            }
            set_null(store, dep.child, &dep.fk);
            detach_edges.push((dep.child, dep.parent));
            continue;
        }
        if child_state != InstanceState::Pending && !dep.changed {
            continue;
        }
        let parent = store.get(dep.parent);
        let parent_mapper = registry.get(parent.entity)?;
        if parent.has_identity(parent_mapper) {
            let pk = parent.primary_key(parent_mapper);
            let stale = dep
                .fk
                .iter()
                .zip(&pk)
                .any(|(&c, v)| store.get(dep.child).values[c] != *v);
            if stale {
                let child = store.get_mut(dep.child);
                for (&c, v) in dep.fk.iter().zip(pk) {
                    child.values[c] = v;
                }
            }
        } else {
            slots.entry(dep.child).or_default().push(FkSlot {
                columns: dep.fk.clone(),
                parent: dep.parent,
            });
        }
    }
    for removal in &removals {
        let child_state = store.get(removal.child).state;
        if !matches!(
            child_state,
            InstanceState::Pending | InstanceState::Persistent
        ) {
            continue;
        }
        let reparented = graph.deps.iter().any(|d| {
            d.child == removal.child
                && d.fk == removal.fk
                && store.get(d.parent).state != InstanceState::Deleted
        });
        if reparented {
            continue;
        }
        if store.get(removal.parent).state == InstanceState::Deleted {
            if removal.passive {
                continue;
            }
            detach_edges.push((removal.child, removal.parent));
        }
        if removal.fk_in_pk {
            let mapper = registry.get(store.get(removal.child).entity)?;
            return Err(blank_pk_error(mapper, removal.child, "(removed)"));
        }
        set_null(store, removal.child, &removal.fk);
    }

    // 3. Instance nodes.
    let mut node_of: HashMap<InstanceId, usize> = HashMap::new();
    for &id in &order {
        let state = store.get(id).state;
        let mapper = registry.get(store.get(id).entity)?;
        let seq = store.get(id).seq;
        match state {
            InstanceState::Pending => {
                if let Some(v) = mapper.version_column() {
                    if store.get(id).values[v].is_null() {
                        store.get_mut(id).values[v] = Value::BigInt(1);
                    }
                }
                let inst_slots = slots.remove(&id).unwrap_or_default();
                let inst = store.get(id);
                for &pk in mapper.primary_key_indices() {
                    let filled = inst_slots.iter().any(|s| s.columns.contains(&pk));
                    if inst.values[pk].is_null() && mapper.generated_key() != Some(pk) && !filled {
                        return Err(Error::invalid_request(format!(
                            "pending '{}' instance {} has no value for primary key column '{}'",
                            mapper.entity(),
                            id,
                            mapper.column_name(pk)
                        )));
                    }
                }
                let mut op = RowOp::for_instance(OpKind::Insert, id, mapper, seq);
                op.columns = (0..mapper.field_count())
                    .filter(|&i| {
                        let v = &inst.values[i];
                        !matches!(v, Value::Default)
                            && !(mapper.generated_key() == Some(i) && v.is_null())
                    })
                    .collect();
                op.slots = inst_slots;
                node_of.insert(id, graph.push_op(op));
            }
            InstanceState::Deleted => {
                let op = RowOp::for_instance(OpKind::Delete, id, mapper, seq);
                node_of.insert(id, graph.push_op(op));
            }
            InstanceState::Persistent => {
                let inst = store.get(id);
                let changes = store.tracker.diff(id, inst);
                if let Some(&pk) = changes
                    .changed_columns
                    .iter()
                    .find(|&&c| mapper.is_primary_key(c))
                {
                    return Err(Error::invalid_request(format!(
                        "primary key column '{}' of persistent '{}' instance {} cannot change",
                        mapper.column_name(pk),
                        mapper.entity(),
                        id
                    )));
                }
                let inst_slots = slots.remove(&id).unwrap_or_default();
                let mut columns: Vec<usize> = changes
                    .changed_columns
                    .iter()
                    .copied()
                    .filter(|&c| mapper.version_column() != Some(c))
                    .collect();
                for slot in &inst_slots {
                    columns.extend(slot.columns.iter().filter(|c| !changes.column_changed(**c)));
                }
                columns.sort_unstable();
                columns.dedup();
                if columns.is_empty() {
                    continue;
                }
                let mut op = RowOp::for_instance(OpKind::Update, id, mapper, seq);
                op.columns = columns;
                op.slots = inst_slots;
                node_of.insert(id, graph.push_op(op));
            }
            InstanceState::Transient | InstanceState::Detached => {}
        }
    }

    // 4. Foreign key edges.
    for d in 0..graph.deps.len() {
        let dep = graph.deps[d].clone();
        let (Some(&child), Some(&parent)) = (node_of.get(&dep.child), node_of.get(&dep.parent))
        else {
            continue;
        };
        match (graph.ops[parent].kind, graph.ops[child].kind) {
            (OpKind::Insert, OpKind::Insert | OpKind::Update) => {
                if graph.ops[child].writes_any(&dep.fk) {
                    graph.add_edge(parent, child, Some(d));
                }
            }
            (OpKind::Delete, OpKind::Delete) if child != parent => {
                graph.add_edge(child, parent, Some(d));
            }
            _ => {}
        }
    }
    for (child, parent) in detach_edges {
        if let (Some(&c), Some(&p)) = (node_of.get(&child), node_of.get(&parent)) {
            graph.add_edge(c, p, None);
        }
    }

    // 5. New rows reusing the key of a row deleted in the same flush.
    let mut new_keys: HashMap<(&'static str, u64), Vec<(Vec<Value>, InstanceId)>> = HashMap::new();
    for &id in &order {
        let Some(&node) = node_of.get(&id) else {
            continue;
        };
        if graph.ops[node].kind != OpKind::Insert {
            continue;
        }
        let inst = store.get(id);
        let mapper = registry.get(inst.entity)?;
        if !inst.has_identity(mapper) {
            continue;
        }
        let pk = inst.primary_key(mapper);
        let bucket = new_keys.entry((inst.entity, hash_values(&pk))).or_default();
        if bucket.iter().any(|(k, _)| keys_equal(k, &pk)) {
            return Err(identity_conflict(inst.entity, &pk));
        }
        bucket.push((pk.clone(), id));

        match store.identity.get(inst.entity, &pk) {
            Some(existing) if existing != id => {
                let deleted_node = node_of
                    .get(&existing)
                    .filter(|&&n| graph.ops[n].kind == OpKind::Delete);
                match deleted_node {
                    Some(&del) => {
                        tracing::debug!(
                            entity = inst.entity,
                            key = %format_key(&pk),
                            "Row switch: delete precedes insert of the same key"
                        );
                        graph.add_edge(del, node, None);
                    }
                    None => return Err(identity_conflict(inst.entity, &pk)),
                }
            }
            _ => {}
        }
    }

    // 6. Association rows.
    for (row, entity, seq) in links.inserts {
        let endpoints = [row.left, row.right];
        let node = graph.push_op(RowOp::for_link(OpKind::LinkInsert, entity, row, seq));
        for end in endpoints {
            if let Some(&n) = node_of.get(&end) {
                if graph.ops[n].kind == OpKind::Insert {
                    graph.add_edge(n, node, None);
                }
            }
        }
    }
    for (row, entity, seq) in links.deletes {
        let endpoints = [row.left, row.right];
        let node = graph.push_op(RowOp::for_link(OpKind::LinkDelete, entity, row, seq));
        for end in endpoints {
            if let Some(&n) = node_of.get(&end) {
                if graph.ops[n].kind == OpKind::Delete {
                    graph.add_edge(node, n, None);
                }
            }
        }
    }

    // 7. Relationships that always defer their foreign key.
    let always: Vec<usize> = graph
        .edges
        .iter()
        .enumerate()
        .filter(|(_, e)| e.active && e.dep.is_some_and(|d| graph.deps[d].post_update))
        .map(|(i, _)| i)
        .collect();
    for e in always {
        graph.postpone(e);
    }

    graph.break_cycles(registry, store)?;

    tracing::debug!(
        ops = graph.ops.len(),
        edges = graph.edges().count(),
        dependencies = graph.deps.len(),
        "Flush graph built"
    );
    Ok(graph)
}

fn identity_conflict(entity: &str, pk: &[Value]) -> Error {
    Error::IdentityConflict(IdentityConflictError {
        entity: entity.to_string(),
        key: format_key(pk),
    })
}

impl FlushGraph {
    /// Replace edge `e` with a deferred column write.
    fn postpone(&mut self, e: usize) {
        let edge = self.edges[e];
        self.edges[e].active = false;
        let Some(d) = edge.dep else {
            return;
        };
        let dep = self.deps[d].clone();
        tracing::debug!(
            relation = dep.relation,
            child = %dep.child,
            parent = %dep.parent,
            "Postponing foreign key dependency"
        );

        if self.ops[edge.from].kind == OpKind::Delete {
            let child_delete = edge.from;
            let parent_delete = edge.to;
            let source = &self.ops[child_delete];
            let nulling = RowOp {
                kind: OpKind::Update,
                instance: Some(dep.child),
                entity: source.entity,
                table: source.table,
                seq: source.seq,
                columns: Vec::new(),
                nulls: dep.fk.clone(),
                slots: Vec::new(),
                link: None,
                key_only: true,
                skipped: false,
            };
            let n = self.push_op(nulling);
            self.add_edge(n, parent_delete, None);
            self.add_edge(n, child_delete, None);
            return;
        }

        let child = edge.to;
        let op = &mut self.ops[child];
        op.slots
            .retain(|s| !(s.parent == dep.parent && s.columns == dep.fk));
        match op.kind {
            OpKind::Insert => {
                for c in &dep.fk {
                    if !op.nulls.contains(c) {
                        op.nulls.push(*c);
                    }
                }
            }
            OpKind::Update => {
                op.columns.retain(|c| !dep.fk.contains(c));
                if op.columns.is_empty() && op.nulls.is_empty() {
                    op.skipped = true;
                }
            }
            _ => {}
        }
        let (entity, table, seq) = (op.entity, op.table, op.seq);

        let exists = self.ops.iter().any(|o| {
            o.kind == OpKind::PostUpdate && o.instance == Some(dep.child) && o.columns == dep.fk
        });
        if !exists {
            self.push_op(RowOp {
                kind: OpKind::PostUpdate,
                instance: Some(dep.child),
                entity,
                table,
                seq,
                columns: dep.fk.clone(),
                nulls: Vec::new(),
                slots: vec![FkSlot {
                    columns: dep.fk.clone(),
                    parent: dep.parent,
                }],
                link: None,
                key_only: true,
                skipped: false,
            });
        }
    }

    /// Postpone edges until the graph is acyclic.
    fn break_cycles(&mut self, registry: &MapperRegistry, store: &Store) -> Result<()> {
        loop {
            let cycles = self.cycles();
            if cycles.is_empty() {
                return Ok(());
            }
            for component in cycles {
                let members: HashSet<usize> = component.iter().copied().collect();
                let candidate = self.edges.iter().position(|e| {
                    e.active
                        && members.contains(&e.from)
                        && members.contains(&e.to)
                        && e.dep.is_some_and(|d| self.deps[d].postponable)
                });
                if let Some(e) = candidate {
                    self.postpone(e);
                    continue;
                }

                if let [node] = component.as_slice() {
                    if self.drop_self_reference(*node, registry, store) {
                        continue;
                    }
                }
                return Err(self.cycle_error(&component, registry, store));
            }
        }
    }

    /// A row referencing itself with an already known key needs no ordering.
    fn drop_self_reference(&mut self, node: usize, registry: &MapperRegistry, store: &Store) -> bool {
        let Some(id) = self.ops[node].instance else {
            return false;
        };
        let inst = store.get(id);
        let Some(mapper) = registry.mapper(inst.entity) else {
            return false;
        };
        if !inst.has_identity(mapper) {
            return false;
        }
        let mut dropped = false;
        for edge in &mut self.edges {
            if edge.active && edge.from == node && edge.to == node {
                edge.active = false;
                dropped = true;
            }
        }
        dropped
    }

    fn cycle_error(&self, component: &[usize], registry: &MapperRegistry, store: &Store) -> Error {
        let members: Vec<CycleMember> = component
            .iter()
            .map(|&n| {
                let op = &self.ops[n];
                let key = op
                    .instance
                    .and_then(|id| {
                        let inst = store.get(id);
                        let mapper = registry.mapper(inst.entity)?;
                        inst.has_identity(mapper)
                            .then(|| format_key(&inst.primary_key(mapper)))
                    })
                    .unwrap_or_else(|| "<pending>".to_string());
                CycleMember {
                    entity: op.entity.to_string(),
                    operation: op.kind.as_str(),
                    key,
                }
            })
            .collect();
        tracing::warn!(members = members.len(), "Unresolvable dependency cycle");
        Error::DependencyCycle(DependencyCycleError { members })
    }

    /// Strongly connected components that contain a cycle, members sorted.
    pub(crate) fn cycles(&self) -> Vec<Vec<usize>> {
        let n = self.ops.len();
        let mut adj = vec![Vec::new(); n];
        let mut self_loop = vec![false; n];
        for (from, to) in self.edges() {
            adj[from].push(to);
            if from == to {
                self_loop[from] = true;
            }
        }
        strongly_connected(&adj)
            .into_iter()
            .filter(|c| c.len() > 1 || self_loop[c[0]])
            .map(|mut c| {
                c.sort_unstable();
                c
            })
            .collect()
    }
}

/// Tarjan's algorithm with an explicit call stack.
fn strongly_connected(adj: &[Vec<usize>]) -> Vec<Vec<usize>> {
    const UNVISITED: usize = usize::MAX;
    let n = adj.len();
    let mut index = vec![UNVISITED; n];
    let mut low = vec![0; n];
    let mut on_stack = vec![false; n];
    let mut stack = Vec::new();
    let mut calls: Vec<(usize, usize)> = Vec::new();
    let mut next = 0;
    let mut out = Vec::new();

    for root in 0..n {
        if index[root] != UNVISITED {
            continue;
        }
        index[root] = next;
        low[root] = next;
        next += 1;
        stack.push(root);
        on_stack[root] = true;
        calls.push((root, 0));

        while let Some(&(v, pos)) = calls.last() {
            if pos < adj[v].len() {
                if let Some(top) = calls.last_mut() {
                    top.1 += 1;
                }
                let w = adj[v][pos];
                if index[w] == UNVISITED {
                    index[w] = next;
                    low[w] = next;
                    next += 1;
                    stack.push(w);
                    on_stack[w] = true;
                    calls.push((w, 0));
                } else if on_stack[w] {
                    low[v] = low[v].min(index[w]);
                }
                continue;
            }

            calls.pop();
            if let Some(&(u, _)) = calls.last() {
                low[u] = low[u].min(low[v]);
            }
            if low[v] == index[v] {
                let mut component = Vec::new();
                while let Some(w) = stack.pop() {
                    on_stack[w] = false;
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                out.push(component);
            }
        }
    }
    out
}

/// Primary key as it was last loaded or flushed.
pub(crate) fn original_key(store: &Store, mapper: &Mapper, id: InstanceId) -> Vec<Value> {
    match store.tracker.baseline(id) {
        Some(base) => project(&base.values, mapper.primary_key_indices()),
        None => store.get(id).primary_key(mapper),
    }
}
