//! Flush planning and execution.
//!
//! The planner linearizes the flush graph with Kahn's algorithm. Ready ops
//! are taken in registration order, so the same session state always
//! produces the same statement sequence. Association rows wait until no
//! instance row is ready, which keeps them together for batching. Consecutive ops on one table with
//! the same kind and no edge between them share a [`FlushStep`]; deferred
//! post-updates run as a final pass.
//!
//! The executor compiles each step through the [`StatementCompiler`] and
//! runs it on the session's transaction:
//! - INSERTs capture generated keys and register the new identity at once,
//!   so later steps can resolve their foreign key slots;
//! - UPDATEs match the original primary key plus the version column or the
//!   loaded values, and fail with `StaleData` when no row matched;
//! - DELETEs are batched and fail with `StaleData` when fewer rows than
//!   requested were removed.

use crate::instance::{InstanceId, InstanceState};
use crate::store::Store;
use crate::unit_of_work::{FkSlot, FlushGraph, LinkRow, OpKind, RowOp, original_key};
use asupersync::{Cx, Outcome};
use serde::Serialize;
use sqlunit_core::{
    ConcurrencyCheck, Connection, CycleMember, DependencyCycleError, Error, ExecuteResult, Mapper,
    MapperRegistry, Result, StaleDataError, Statement, StatementCompiler, TransactionId, Value,
    WriteOp,
};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// A batch of ops on one table with the same kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlushStep {
    pub kind: OpKind,
    pub table: &'static str,
    /// Indices into the graph's ops.
    pub ops: Vec<usize>,
}

/// An ordered flush.
#[derive(Debug)]
pub struct FlushPlan {
    graph: FlushGraph,
    steps: Vec<FlushStep>,
}

impl FlushPlan {
    pub fn steps(&self) -> &[FlushStep] {
        &self.steps
    }

    pub fn op(&self, index: usize) -> &RowOp {
        &self.graph.ops[index]
    }

    pub fn graph(&self) -> &FlushGraph {
        &self.graph
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Number of ops across all steps.
    pub fn len(&self) -> usize {
        self.steps.iter().map(|s| s.ops.len()).sum()
    }
}

/// Order the graph into steps.
#[tracing::instrument(level = "debug", skip(graph))]
#[allow(clippy::result_large_err)]
pub(crate) fn plan(graph: FlushGraph) -> Result<FlushPlan> {
    let n = graph.ops.len();
    let mut succs = vec![Vec::new(); n];
    let mut preds = vec![Vec::new(); n];
    let mut indegree = vec![0usize; n];
    for (from, to) in graph.edges() {
        succs[from].push(to);
        preds[to].push(from);
        indegree[to] += 1;
    }

    let main: Vec<usize> = (0..n)
        .filter(|&i| graph.ops[i].kind != OpKind::PostUpdate)
        .collect();
    let priority = |i: usize| {
        let op = &graph.ops[i];
        Reverse((op.link.is_some(), op.seq, i))
    };
    let mut ready: BinaryHeap<Reverse<(bool, u64, usize)>> = main
        .iter()
        .filter(|&&i| indegree[i] == 0)
        .map(|&i| priority(i))
        .collect();

    let mut order = Vec::with_capacity(main.len());
    while let Some(Reverse((_, _, i))) = ready.pop() {
        order.push(i);
        for &s in &succs[i] {
            indegree[s] -= 1;
            if indegree[s] == 0 {
                ready.push(priority(s));
            }
        }
    }

    if order.len() != main.len() {
        let members = main
            .iter()
            .filter(|&&i| indegree[i] > 0)
            .map(|&i| CycleMember {
                entity: graph.ops[i].entity.to_string(),
                operation: graph.ops[i].kind.as_str(),
                key: graph.ops[i]
                    .instance
                    .map_or_else(|| "<link>".to_string(), |id| id.to_string()),
            })
            .collect();
        return Err(Error::DependencyCycle(DependencyCycleError { members }));
    }

    let mut steps = group(&graph, &order, &preds);

    let mut post: Vec<usize> = (0..n)
        .filter(|&i| graph.ops[i].kind == OpKind::PostUpdate)
        .collect();
    post.sort_by_key(|&i| (graph.ops[i].seq, i));
    steps.extend(group(&graph, &post, &preds));

    tracing::debug!(
        ops = order.len() + post.len(),
        steps = steps.len(),
        "Flush plan ordered"
    );
    Ok(FlushPlan { graph, steps })
}

fn group(graph: &FlushGraph, order: &[usize], preds: &[Vec<usize>]) -> Vec<FlushStep> {
    let mut steps: Vec<FlushStep> = Vec::new();
    for &i in order {
        let op = &graph.ops[i];
        if op.skipped {
            continue;
        }
        if let Some(step) = steps.last_mut() {
            let joins = step.kind == op.kind
                && step.table == op.table
                && !preds[i].iter().any(|p| step.ops.contains(p));
            if joins {
                step.ops.push(i);
                continue;
            }
        }
        steps.push(FlushStep {
            kind: op.kind,
            table: op.table,
            ops: vec![i],
        });
    }
    steps
}

/// Result of a flush operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlushResult {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of rows updated, including foreign keys nulled before a delete.
    pub updated: usize,
    /// Number of rows deleted.
    pub deleted: usize,
    /// Number of deferred foreign key updates.
    pub post_updated: usize,
    /// Number of association rows inserted.
    pub linked: usize,
    /// Number of association rows deleted.
    pub unlinked: usize,
}

impl FlushResult {
    /// Create a new empty result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of operations performed.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted + self.post_updated + self.linked + self.unlinked
    }

    fn record(&mut self, kind: OpKind, count: usize) {
        match kind {
            OpKind::Insert => self.inserted += count,
            OpKind::Update => self.updated += count,
            OpKind::Delete => self.deleted += count,
            OpKind::PostUpdate => self.post_updated += count,
            OpKind::LinkInsert => self.linked += count,
            OpKind::LinkDelete => self.unlinked += count,
        }
    }
}

struct InsertRow {
    id: InstanceId,
    columns: Vec<&'static str>,
    values: Vec<Value>,
    /// Generated key column still to be assigned by the store.
    generated: Option<usize>,
    returning: Option<&'static str>,
}

struct PreparedUpdate {
    id: InstanceId,
    write: WriteOp,
    new_version: Option<(usize, Value)>,
}

fn stale(table: &str, operation: &'static str, expected: u64, actual: u64, stmt: &Statement) -> Error {
    tracing::warn!(
        table = table,
        operation = operation,
        expected = expected,
        actual = actual,
        "Stale data detected"
    );
    Error::StaleData(StaleDataError {
        table: table.to_string(),
        operation,
        expected,
        actual,
        sql: Some(stmt.sql.clone()),
    })
}

fn missing_instance(op: &RowOp) -> Error {
    Error::invalid_request(format!(
        "{} on '{}' has no instance",
        op.kind.as_str(),
        op.table
    ))
}

/// Runs a plan on one transaction.
pub(crate) struct FlushExecutor<'a, C: Connection> {
    pub(crate) cx: &'a Cx,
    pub(crate) conn: &'a C,
    pub(crate) tx: TransactionId,
    pub(crate) registry: &'a MapperRegistry,
    pub(crate) compiler: &'a dyn StatementCompiler,
    pub(crate) store: &'a mut Store,
    pub(crate) batch_inserts: bool,
}

impl<C: Connection> FlushExecutor<'_, C> {
    /// Execute the flush plan against the database.
    #[tracing::instrument(level = "info", skip(self, plan), fields(steps = plan.steps.len()))]
    pub(crate) async fn run(&mut self, plan: &FlushPlan) -> Outcome<FlushResult, Error> {
        tracing::info!(ops = plan.len(), tx = %self.tx, "Executing flush plan");

        let start = std::time::Instant::now();
        let mut result = FlushResult::new();

        for step in &plan.steps {
            tracing::debug!(
                kind = step.kind.as_str(),
                table = step.table,
                ops = step.ops.len(),
                "Executing flush step"
            );
            let outcome = match step.kind {
                OpKind::Insert => self.execute_inserts(plan, step).await,
                OpKind::Update | OpKind::PostUpdate => self.execute_updates(plan, step).await,
                OpKind::Delete => self.execute_deletes(plan, step).await,
                OpKind::LinkInsert => self.execute_link_inserts(plan, step).await,
                OpKind::LinkDelete => self.execute_link_deletes(plan, step).await,
            };
            match outcome {
                Outcome::Ok(count) => result.record(step.kind, count),
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            post_updated = result.post_updated,
            linked = result.linked,
            unlinked = result.unlinked,
            "Flush complete"
        );
        Outcome::Ok(result)
    }

    async fn execute(&self, op: &WriteOp) -> Outcome<(Statement, ExecuteResult), Error> {
        let stmt = match self.compiler.compile(op) {
            Ok(stmt) => stmt,
            Err(e) => return Outcome::Err(e),
        };
        tracing::trace!(sql = %stmt.sql, params = stmt.params.len(), "Executing statement");
        match self.conn.execute(self.cx, self.tx, &stmt).await {
            Outcome::Ok(res) => Outcome::Ok((stmt, res)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Copy parent keys into the dependent instance.
    fn resolve_slots(&mut self, id: InstanceId, slots: &[FkSlot]) -> Result<()> {
        for slot in slots {
            let parent = self.store.get(slot.parent);
            let mapper = self.registry.get(parent.entity)?;
            if !parent.has_identity(mapper) {
                return Err(Error::invalid_request(format!(
                    "primary key of '{}' {} was not assigned before its dependent row {}",
                    parent.entity, slot.parent, id
                )));
            }
            let pk = parent.primary_key(mapper);
            let child = self.store.get_mut(id);
            for (&c, v) in slot.columns.iter().zip(pk) {
                child.values[c] = v;
            }
        }
        Ok(())
    }

    fn register(&mut self, id: InstanceId) -> Result<()> {
        let inst = self.store.get(id);
        let mapper = self.registry.get(inst.entity)?;
        if !inst.has_identity(mapper) {
            return Err(Error::invalid_request(format!(
                "inserted '{}' instance {} has no primary key",
                inst.entity, id
            )));
        }
        let (entity, pk) = (inst.entity, inst.primary_key(mapper));
        self.store.identity.register(entity, pk, id)
    }

    /// Match conditions: the original key, plus the concurrency columns when `check`.
    fn row_conditions(&self, mapper: &Mapper, id: InstanceId, check: bool) -> Vec<(&'static str, Value)> {
        let mut conditions: Vec<(&'static str, Value)> = mapper
            .primary_key_indices()
            .iter()
            .map(|&i| mapper.column_name(i))
            .zip(original_key(&*self.store, mapper, id))
            .collect();
        if !check {
            return conditions;
        }
        match mapper.concurrency() {
            ConcurrencyCheck::Version => {
                if let Some(vc) = mapper.version_column() {
                    conditions.push((mapper.column_name(vc), self.original(id, vc)));
                }
            }
            ConcurrencyCheck::OriginalValues => {
                let inst = self.store.get(id);
                let base = self.store.tracker.baseline(id);
                for i in 0..mapper.field_count() {
                    if mapper.is_primary_key(i) || inst.expired[i] {
                        continue;
                    }
                    let value = match base {
                        Some(b) => match b.known_value(i) {
                            Some(v) => v.clone(),
                            None => continue,
                        },
                        None => inst.values[i].clone(),
                    };
                    conditions.push((mapper.column_name(i), value));
                }
            }
            ConcurrencyCheck::None => {}
        }
        conditions
    }

    /// The row now holds the assigned values; later statements in this flush
    /// match against them.
    fn record_written(&mut self, id: InstanceId, write: &WriteOp) {
        let WriteOp::Update { assignments, .. } = write else {
            return;
        };
        let Ok(mapper) = self.registry.get(self.store.get(id).entity) else {
            return;
        };
        if let Some(base) = self.store.baseline_mut(id) {
            for (column, value) in assignments {
                if let Some(i) = mapper.field_index(column) {
                    base.values[i] = value.clone();
                    base.known[i] = true;
                }
            }
        }
    }

        fn original(&self, id: InstanceId, column: usize) -> Value {
        self.store
            .tracker
            .original_value(id, column)
            .cloned()
            .unwrap_or_else(|| self.store.get(id).values[column].clone())
    }

    fn insert_row(&mut self, op: &RowOp) -> Result<InsertRow> {
        let id = op.instance.ok_or_else(|| missing_instance(op))?;
        self.resolve_slots(id, &op.slots)?;
        let inst = self.store.get(id);
        let mapper = self.registry.get(inst.entity)?;
        let columns = op.columns.iter().map(|&c| mapper.column_name(c)).collect();
        let values = op
            .columns
            .iter()
            .map(|c| {
                if op.nulls.contains(c) {
                    Value::Null
                } else {
                    inst.values[*c].clone()
                }
            })
            .collect();
        let generated = mapper
            .generated_key()
            .filter(|&g| inst.values[g].is_null());
        Ok(InsertRow {
            id,
            columns,
            values,
            generated,
            returning: generated.map(|g| mapper.column_name(g)),
        })
    }

    #[tracing::instrument(level = "debug", skip(self, plan, step), fields(table = step.table))]
    async fn execute_inserts(&mut self, plan: &FlushPlan, step: &FlushStep) -> Outcome<usize, Error> {
        let mut rows = Vec::with_capacity(step.ops.len());
        for &i in &step.ops {
            match self.insert_row(plan.op(i)) {
                Ok(row) => rows.push(row),
                Err(e) => return Outcome::Err(e),
            }
        }
        let count = rows.len();

        let batch = self.batch_inserts
            && count > 1
            && rows
                .iter()
                .all(|r| r.generated.is_none() && r.columns == rows[0].columns);
        if batch {
            let ids: Vec<InstanceId> = rows.iter().map(|r| r.id).collect();
            let write = WriteOp::Insert {
                table: step.table,
                columns: rows[0].columns.clone(),
                rows: rows.into_iter().map(|r| r.values).collect(),
                returning: None,
            };
            match self.execute(&write).await {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            for id in ids {
                if let Err(e) = self.register(id) {
                    return Outcome::Err(e);
                }
            }
            return Outcome::Ok(count);
        }

        for row in rows {
            let write = WriteOp::Insert {
                table: step.table,
                columns: row.columns,
                rows: vec![row.values],
                returning: row.returning,
            };
            let (stmt, res) = match self.execute(&write).await {
                Outcome::Ok(done) => done,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            if let Some(g) = row.generated {
                let Some(key) = res.generated_key else {
                    return Outcome::Err(Error::invalid_request(format!(
                        "no generated key was returned for `{}`",
                        stmt.sql
                    )));
                };
                tracing::debug!(id = %row.id, table = step.table, key = ?key, "Generated key assigned");
                self.store.get_mut(row.id).values[g] = key;
            }
            if let Err(e) = self.register(row.id) {
                return Outcome::Err(e);
            }
        }
        Outcome::Ok(count)
    }

    fn prepare_update(&mut self, op: &RowOp) -> Result<Option<PreparedUpdate>> {
        let id = op.instance.ok_or_else(|| missing_instance(op))?;
        self.resolve_slots(id, &op.slots)?;
        let inst = self.store.get(id);
        let mapper = self.registry.get(inst.entity)?;

        let mut assignments: Vec<(&'static str, Value)> = op
            .columns
            .iter()
            .map(|&c| {
                let value = if op.nulls.contains(&c) {
                    Value::Null
                } else {
                    inst.values[c].clone()
                };
                (mapper.column_name(c), value)
            })
            .collect();
        for &c in &op.nulls {
            if !op.columns.contains(&c) {
                assignments.push((mapper.column_name(c), Value::Null));
            }
        }
        if assignments.is_empty() {
            return Ok(None);
        }

        let conditions = self.row_conditions(mapper, id, !op.key_only);
        let mut new_version = None;
        if !op.key_only && mapper.concurrency() == ConcurrencyCheck::Version {
            if let Some(vc) = mapper.version_column() {
                let current = self.original(id, vc);
                let next = current.as_i64().map(|v| v + 1).ok_or_else(|| {
                    Error::invalid_request(format!(
                        "version column '{}' of '{}' {} does not hold an integer",
                        mapper.column_name(vc),
                        mapper.entity(),
                        id
                    ))
                })?;
                assignments.push((mapper.column_name(vc), Value::BigInt(next)));
                new_version = Some((vc, Value::BigInt(next)));
            }
        }

        Ok(Some(PreparedUpdate {
            id,
            write: WriteOp::Update {
                table: mapper.table(),
                assignments,
                conditions,
            },
            new_version,
        }))
    }

    #[tracing::instrument(level = "debug", skip(self, plan, step), fields(table = step.table))]
    async fn execute_updates(&mut self, plan: &FlushPlan, step: &FlushStep) -> Outcome<usize, Error> {
        let mut count = 0;
        for &i in &step.ops {
            let prepared = match self.prepare_update(plan.op(i)) {
                Ok(Some(prepared)) => prepared,
                Ok(None) => continue,
                Err(e) => return Outcome::Err(e),
            };
            let (stmt, res) = match self.execute(&prepared.write).await {
                Outcome::Ok(done) => done,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            if res.rows_affected == 0 {
                return Outcome::Err(stale(step.table, "UPDATE", 1, 0, &stmt));
            }
            if let Some((vc, version)) = prepared.new_version {
                self.store.get_mut(prepared.id).values[vc] = version;
            }
            self.record_written(prepared.id, &prepared.write);
            count += 1;
        }
        Outcome::Ok(count)
    }

    #[tracing::instrument(level = "debug", skip(self, plan, step), fields(table = step.table))]
    async fn execute_deletes(&mut self, plan: &FlushPlan, step: &FlushStep) -> Outcome<usize, Error> {
        let mut rows = Vec::with_capacity(step.ops.len());
        let mut targets = Vec::with_capacity(step.ops.len());
        for &i in &step.ops {
            let op = plan.op(i);
            let Some(id) = op.instance else {
                return Outcome::Err(missing_instance(op));
            };
            let mapper = match self.registry.get(op.entity) {
                Ok(m) => m,
                Err(e) => return Outcome::Err(e),
            };
            rows.push(self.row_conditions(mapper, id, true));
            targets.push((id, original_key(&*self.store, mapper, id)));
        }

        let expected = rows.len() as u64;
        let write = WriteOp::Delete {
            table: step.table,
            rows,
        };
        let (stmt, res) = match self.execute(&write).await {
            Outcome::Ok(done) => done,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        if res.rows_affected < expected {
            return Outcome::Err(stale(step.table, "DELETE", expected, res.rows_affected, &stmt));
        }

        // The key may be reused by an insert later in this flush.
        let entity = plan.op(step.ops[0]).entity;
        for (id, pk) in targets {
            self.store.identity.remove_instance(entity, &pk, id);
        }
        Outcome::Ok(expected as usize)
    }

    fn link_values(&self, link: &LinkRow, original: bool) -> Result<Vec<Value>> {
        let mut values = Vec::with_capacity(link.left_cols.len() + link.right_cols.len());
        for id in [link.left, link.right] {
            let inst = self.store.get(id);
            let mapper = self.registry.get(inst.entity)?;
            if original {
                values.extend(original_key(&*self.store, mapper, id));
            } else if inst.has_identity(mapper) {
                values.extend(inst.primary_key(mapper));
            } else {
                return Err(Error::invalid_request(format!(
                    "'{}' {} has no primary key for association table '{}'",
                    inst.entity, id, link.table
                )));
            }
        }
        Ok(values)
    }

    #[tracing::instrument(level = "debug", skip(self, plan, step), fields(table = step.table))]
    async fn execute_link_inserts(&mut self, plan: &FlushPlan, step: &FlushStep) -> Outcome<usize, Error> {
        let mut rows: Vec<(Vec<&'static str>, Vec<Value>)> = Vec::with_capacity(step.ops.len());
        for &i in &step.ops {
            let op = plan.op(i);
            let Some(link) = op.link.as_ref() else {
                return Outcome::Err(missing_instance(op));
            };
            match self.link_values(link, false) {
                Ok(values) => rows.push((link.columns(), values)),
                Err(e) => return Outcome::Err(e),
            }
        }
        let count = rows.len();

        let mut batches: Vec<(Vec<&'static str>, Vec<Vec<Value>>)> = Vec::new();
        for (columns, values) in rows {
            match batches.last_mut() {
                Some((cols, batch)) if self.batch_inserts && *cols == columns => batch.push(values),
                _ => batches.push((columns, vec![values])),
            }
        }
        for (columns, values) in batches {
            let write = WriteOp::Insert {
                table: step.table,
                columns,
                rows: values,
                returning: None,
            };
            match self.execute(&write).await {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(count)
    }

    #[tracing::instrument(level = "debug", skip(self, plan, step), fields(table = step.table))]
    async fn execute_link_deletes(&mut self, plan: &FlushPlan, step: &FlushStep) -> Outcome<usize, Error> {
        let mut rows = Vec::with_capacity(step.ops.len());
        for &i in &step.ops {
            let op = plan.op(i);
            let Some(link) = op.link.as_ref() else {
                return Outcome::Err(missing_instance(op));
            };
            match self.link_values(link, true) {
                Ok(values) => rows.push(link.columns().into_iter().zip(values).collect()),
                Err(e) => return Outcome::Err(e),
            }
        }

        let expected = rows.len() as u64;
        let write = WriteOp::Delete {
            table: step.table,
            rows,
        };
        let (stmt, res) = match self.execute(&write).await {
            Outcome::Ok(done) => done,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        if res.rows_affected < expected {
            return Outcome::Err(stale(step.table, "DELETE", expected, res.rows_affected, &stmt));
        }
        Outcome::Ok(expected as usize)
    }
}

/// Apply post-flush truth to the session.
///
/// Inserted instances become persistent, deleted ones detached and dropped
/// from every relationship that still refers to them; every remaining
/// persistent instance gets a fresh baseline.
pub(crate) fn finalize(store: &mut Store, plan: &FlushPlan) {
    let mut gone = Vec::new();
    for op in plan.graph.ops() {
        let Some(id) = op.instance else {
            continue;
        };
        if op.skipped {
            continue;
        }
        match op.kind {
            OpKind::Insert => {
                let next = store.get(id).state.on_flushed();
                store.get_mut(id).state = next;
            }
            OpKind::Delete => {
                let next = store.get(id).state.on_flushed();
                store.get_mut(id).state = next;
                store.forget_baseline(id);
                gone.push(id);
            }
            _ => {}
        }
    }

    if !gone.is_empty() {
        scrub(store, &gone);
    }

    let mut reset = 0;
    for id in store.ids() {
        let inst = store.get(id);
        if inst.state != InstanceState::Persistent {
            continue;
        }
        if !store.tracker.has_baseline(id) || store.tracker.is_dirty(id, inst) {
            store.snapshot(id);
            reset += 1;
        }
    }
    tracing::debug!(detached = gone.len(), baselines = reset, "Flush finalized");
}

fn scrub(store: &mut Store, gone: &[InstanceId]) {
    let refers = |slots: &[crate::instance::RelationSlot]| {
        slots
            .iter()
            .any(|s| gone.iter().any(|g| s.contains(*g)))
    };
    for id in store.ids() {
        if refers(&store.get(id).relations) {
            let inst = store.get_mut(id);
            for slot in &mut inst.relations {
                for g in gone {
                    slot.remove(*g);
                }
            }
        }
        let in_baseline = store
            .tracker
            .baseline(id)
            .is_some_and(|b| refers(&b.relations));
        if in_baseline {
            if let Some(base) = store.baseline_mut(id) {
                for slot in &mut base.relations {
                    for g in gone {
                        slot.remove(*g);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(kind: OpKind, table: &'static str, seq: u64) -> RowOp {
        RowOp {
            kind,
            instance: Some(InstanceId(seq as usize)),
            entity: table,
            table,
            seq,
            columns: Vec::new(),
            nulls: Vec::new(),
            slots: Vec::new(),
            link: None,
            key_only: false,
            skipped: false,
        }
    }

    fn kinds(plan: &FlushPlan) -> Vec<(OpKind, &'static str, usize)> {
        plan.steps()
            .iter()
            .map(|s| (s.kind, s.table, s.ops.len()))
            .collect()
    }

    #[test]
    fn test_ties_follow_registration_order() {
        let mut graph = FlushGraph::default();
        graph.push_op(op(OpKind::Insert, "b", 3));
        graph.push_op(op(OpKind::Insert, "a", 1));
        graph.push_op(op(OpKind::Insert, "c", 2));
        let plan = plan(graph).unwrap();
        let tables: Vec<_> = plan.steps().iter().map(|s| s.table).collect();
        assert_eq!(tables, vec!["a", "c", "b"]);
    }

    #[test]
    fn test_edges_override_registration_order() {
        let mut graph = FlushGraph::default();
        let child = graph.push_op(op(OpKind::Insert, "child", 1));
        let parent = graph.push_op(op(OpKind::Insert, "parent", 2));
        graph.add_edge(parent, child, None);
        let plan = plan(graph).unwrap();
        assert_eq!(plan.steps()[0].table, "parent");
        assert_eq!(plan.steps()[1].table, "child");
    }

    #[test]
    fn test_consecutive_same_table_ops_share_a_step() {
        let mut graph = FlushGraph::default();
        graph.push_op(op(OpKind::Insert, "t", 1));
        graph.push_op(op(OpKind::Insert, "t", 2));
        graph.push_op(op(OpKind::Delete, "t", 3));
        let plan = plan(graph).unwrap();
        assert_eq!(
            kinds(&plan),
            vec![(OpKind::Insert, "t", 2), (OpKind::Delete, "t", 1)]
        );
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn test_dependent_ops_split_steps() {
        let mut graph = FlushGraph::default();
        let a = graph.push_op(op(OpKind::Insert, "node", 1));
        let b = graph.push_op(op(OpKind::Insert, "node", 2));
        graph.add_edge(a, b, None);
        let plan = plan(graph).unwrap();
        assert_eq!(
            kinds(&plan),
            vec![(OpKind::Insert, "node", 1), (OpKind::Insert, "node", 1)]
        );
    }

    #[test]
    fn test_link_rows_wait_for_ready_instance_rows() {
        let mut graph = FlushGraph::default();
        let post = graph.push_op(op(OpKind::Insert, "posts", 1));
        let first = graph.push_op(op(OpKind::Insert, "tags", 2));
        let second = graph.push_op(op(OpKind::Insert, "tags", 3));
        for (tag, seq) in [(first, 2), (second, 3)] {
            let mut link = op(OpKind::LinkInsert, "post_tags", 1);
            link.instance = None;
            link.link = Some(LinkRow {
                table: "post_tags",
                left_cols: vec!["post_id"],
                left: InstanceId(1),
                right_cols: vec!["tag_id"],
                right: InstanceId(seq),
            });
            let l = graph.push_op(link);
            graph.add_edge(post, l, None);
            graph.add_edge(tag, l, None);
        }
        let plan = plan(graph).unwrap();
        assert_eq!(
            kinds(&plan),
            vec![
                (OpKind::Insert, "posts", 1),
                (OpKind::Insert, "tags", 2),
                (OpKind::LinkInsert, "post_tags", 2)
            ]
        );
    }

    #[test]
    fn test_post_updates_run_last() {
        let mut graph = FlushGraph::default();
        graph.push_op(op(OpKind::PostUpdate, "node", 1));
        graph.push_op(op(OpKind::Insert, "node", 1));
        graph.push_op(op(OpKind::Insert, "other", 5));
        let plan = plan(graph).unwrap();
        assert_eq!(plan.steps().last().unwrap().kind, OpKind::PostUpdate);
    }

    #[test]
    fn test_skipped_ops_are_not_planned() {
        let mut graph = FlushGraph::default();
        let mut skipped = op(OpKind::Update, "t", 1);
        skipped.skipped = true;
        graph.push_op(skipped);
        let plan = plan(graph).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_leftover_cycle_is_reported() {
        let mut graph = FlushGraph::default();
        let a = graph.push_op(op(OpKind::Insert, "a", 1));
        let b = graph.push_op(op(OpKind::Insert, "b", 2));
        graph.add_edge(a, b, None);
        graph.add_edge(b, a, None);
        match plan(graph) {
            Err(Error::DependencyCycle(e)) => assert_eq!(e.members.len(), 2),
            other => panic!("expected a cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_flush_result_total() {
        let mut r = FlushResult::new();
        r.record(OpKind::Insert, 2);
        r.record(OpKind::PostUpdate, 1);
        r.record(OpKind::LinkDelete, 3);
        assert_eq!(r.total(), 6);
        assert_eq!(r.post_updated, 1);
    }
}
