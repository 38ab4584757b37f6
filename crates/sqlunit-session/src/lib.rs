//! Session and unit of work for sqlunit.
//!
//! `sqlunit-session` is the **unit-of-work layer**. A [`Session`] owns every
//! entity instance it tracks, keeps one canonical instance per primary key,
//! records what changed since the last load or flush and writes those
//! changes back through a [`Connection`] in a foreign-key-respecting order.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one in-memory instance per `(entity, primary key)`.
//! - **Change tracking**: committed baselines diffed against current state.
//! - **Flush engine**: dependency graph, topological plan and executor.
//! - **Transactional safety**: flush/commit/rollback plus savepoints, with
//!   in-memory state restored exactly on rollback.
//!
//! # Design Philosophy
//!
//! - **Handles, not references**: instances live in an arena and are
//!   addressed by copyable [`InstanceId`]s, so object graphs with cycles
//!   need no shared ownership.
//! - **Explicit over implicit**: no autoflush; nothing reaches the store
//!   before `flush()` or `commit()`.
//! - **Cancel-correct**: all async operations use `Cx` + `Outcome`; a
//!   cancelled flush rolls back like a failed one.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(conn, registry);
//!
//! let team = session.create_with("Team", &[("name", "Avengers".into())])?;
//! let hero = session.create_with("Hero", &[("name", "Thor".into())])?;
//! session.set_related(hero, "team", Some(team))?;
//! session.add(hero)?; // cascades to `team`
//!
//! session.commit(&cx).await?; // INSERT team, then INSERT hero with team_id
//! ```

mod cascade;
pub mod change_tracker;
pub mod flush;
pub mod identity_map;
pub mod instance;
mod store;
mod transaction;
pub mod unit_of_work;

pub use change_tracker::{Baseline, ChangeSet, ChangeTracker};
pub use flush::{FlushPlan, FlushResult, FlushStep};
pub use identity_map::IdentityMap;
pub use instance::{Instance, InstanceId, InstanceState, RelationSlot};
pub use unit_of_work::{FkSlot, FlushGraph, LinkRow, OpKind, RowOp};

use asupersync::{Cx, Outcome};
use flush::FlushExecutor;
use instance::project;
use serde::Serialize;
use sqlunit_core::{
    Connection, Dialect, DialectCompiler, Error, ExpiredError, Join, MapperRegistry, Model,
    Relation, Result, Row, StatementCompiler, TransactionErrorKind, TransactionId, Value,
    keys_equal,
};
use std::sync::Arc;
use store::Store;

// ============================================================================
// Session Events
// ============================================================================

/// Type alias for session event callbacks.
///
/// Callbacks receive no arguments and return `Result<(), Error>`.
/// Returning `Err` aborts the operation (e.g., prevents the commit).
type SessionEventFn = Box<dyn FnMut() -> Result<()> + Send>;

/// Holds registered session-level event callbacks.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_flush: Vec<SessionEventFn>,
    after_flush: Vec<SessionEventFn>,
    before_commit: Vec<SessionEventFn>,
    after_commit: Vec<SessionEventFn>,
    after_rollback: Vec<SessionEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("before_commit", &self.before_commit.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    #[allow(clippy::result_large_err)]
    fn fire(&mut self, event: SessionEvent) -> Result<()> {
        let callbacks = match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterFlush => &mut self.after_flush,
            SessionEvent::BeforeCommit => &mut self.before_commit,
            SessionEvent::AfterCommit => &mut self.after_commit,
            SessionEvent::AfterRollback => &mut self.after_rollback,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before flush builds its plan.
    BeforeFlush,
    /// Fired after flush completes successfully.
    AfterFlush,
    /// Fired before commit (after flush).
    BeforeCommit,
    /// Fired after the outermost transaction commits.
    AfterCommit,
    /// Fired after a rollback, explicit or caused by a failed flush.
    AfterRollback,
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Whether to expire persistent instances after the outermost commit.
    pub expire_on_commit: bool,
    /// Whether compatible INSERTs of one step share a multi-row statement.
    pub batch_inserts: bool,
    /// Dialect for the default compiler; `None` asks the connection.
    pub dialect: Option<Dialect>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expire_on_commit: false,
            batch_inserts: true,
            dialect: None,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn expire_on_commit(mut self, value: bool) -> Self {
        self.expire_on_commit = value;
        self
    }

    #[must_use]
    pub fn batch_inserts(mut self, value: bool) -> Self {
        self.batch_inserts = value;
        self
    }

    #[must_use]
    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = Some(dialect);
        self
    }
}

// ============================================================================
// Session
// ============================================================================

/// The Session is the central unit-of-work manager.
///
/// It owns every instance it tracks and coordinates flushing their changes
/// back to the database.
pub struct Session<C: Connection> {
    /// The database connection.
    connection: C,
    /// Frozen mapper metadata shared between sessions.
    registry: Arc<MapperRegistry>,
    /// Turns write descriptions into SQL.
    compiler: Arc<dyn StatementCompiler>,
    /// Configuration.
    config: SessionConfig,
    /// Instance arena, identity map, baselines and transaction frames.
    store: Store,
    /// Open database transaction.
    tx: Option<TransactionId>,
    savepoint_counter: u64,
    /// Session-level event callbacks.
    events: SessionEventCallbacks,
}

impl<C: Connection> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("instances", &self.store.len())
            .field("tx", &self.tx)
            .field("depth", &self.store.depth())
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl<C: Connection> Session<C> {
    /// Create a new session over `connection`.
    pub fn new(connection: C, registry: Arc<MapperRegistry>) -> Self {
        Self::with_config(connection, registry, SessionConfig::default())
    }

    /// Create a new session with custom configuration.
    pub fn with_config(connection: C, registry: Arc<MapperRegistry>, config: SessionConfig) -> Self {
        let dialect = config.dialect.unwrap_or_else(|| connection.dialect());
        Self {
            connection,
            registry,
            compiler: Arc::new(DialectCompiler::new(dialect)),
            config,
            store: Store::new(),
            tx: None,
            savepoint_counter: 0,
            events: SessionEventCallbacks::default(),
        }
    }

    /// Replace the statement compiler.
    #[must_use]
    pub fn with_compiler(mut self, compiler: Arc<dyn StatementCompiler>) -> Self {
        self.compiler = compiler;
        self
    }

    /// Get a reference to the underlying connection.
    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// Get the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<MapperRegistry> {
        &self.registry
    }

    // ========================================================================
    // Session Events
    // ========================================================================

    /// Register a callback to run before flush.
    ///
    /// The callback can abort the flush by returning `Err`.
    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.before_flush.push(Box::new(f));
    }

    /// Register a callback to run after a successful flush.
    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.after_flush.push(Box::new(f));
    }

    /// Register a callback to run before commit (after flush).
    ///
    /// The callback can abort the commit by returning `Err`.
    pub fn on_before_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.before_commit.push(Box::new(f));
    }

    /// Register a callback to run after a successful commit.
    pub fn on_after_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.after_commit.push(Box::new(f));
    }

    /// Register a callback to run after rollback.
    pub fn on_after_rollback(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.after_rollback.push(Box::new(f));
    }

    // ========================================================================
    // Object Tracking
    // ========================================================================

    /// Create a transient instance of `entity` with every column NULL.
    #[allow(clippy::result_large_err)]
    pub fn create(&mut self, entity: &str) -> Result<InstanceId> {
        let mapper = self.registry.get(entity)?;
        Ok(self.store.push(Instance::new(mapper)))
    }

    /// Create a transient instance and set the given attributes.
    #[allow(clippy::result_large_err)]
    pub fn create_with(&mut self, entity: &str, attrs: &[(&str, Value)]) -> Result<InstanceId> {
        let id = self.create(entity)?;
        for (name, value) in attrs {
            self.set(id, name, value.clone())?;
        }
        Ok(id)
    }

    /// Add an instance to the session.
    ///
    /// Transient instances become pending and are INSERTed on the next
    /// flush; detached instances are reattached. Save-update cascades are
    /// followed from the instance.
    #[allow(clippy::result_large_err)]
    pub fn add(&mut self, id: InstanceId) -> Result<()> {
        self.store.check(id)?;
        if self.store.get(id).state == InstanceState::Deleted {
            return Err(Error::invalid_request(format!(
                "instance {} is marked for deletion",
                id
            )));
        }
        self.store.ensure_frame();
        cascade::attach(&self.registry, &mut self.store, id)?;
        cascade::cascade_save(&self.registry, &mut self.store, &[id])?;
        tracing::debug!(id = %id, state = %self.store.get(id).state, "Instance added");
        Ok(())
    }

    /// Add several instances in order.
    #[allow(clippy::result_large_err)]
    pub fn add_all(&mut self, ids: impl IntoIterator<Item = InstanceId>) -> Result<()> {
        for id in ids {
            self.add(id)?;
        }
        Ok(())
    }

    /// Mark a persistent instance for deletion, following delete cascades.
    #[allow(clippy::result_large_err)]
    pub fn delete(&mut self, id: InstanceId) -> Result<()> {
        self.store.check(id)?;
        self.store.ensure_frame();
        cascade::cascade_delete(&self.registry, &mut self.store, id)?;
        tracing::debug!(id = %id, entity = self.store.get(id).entity, "Instance marked deleted");
        Ok(())
    }

    /// Remove an instance from the session without touching the database.
    #[allow(clippy::result_large_err)]
    pub fn expunge(&mut self, id: InstanceId) -> Result<()> {
        self.store.check(id)?;
        self.store.ensure_frame();
        cascade::cascade_expunge(&self.registry, &mut self.store, id)
    }

    /// Roll back any open transaction and detach every instance.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn close(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let rolled_back = if self.tx.is_some() || self.store.depth() > 0 {
            self.rollback_all(cx).await
        } else {
            Outcome::Ok(())
        };

        for id in self.store.ids() {
            let next = self.store.get(id).state.on_expunge();
            self.store.get_mut_untracked(id).state = next;
        }
        self.store.identity.clear();
        self.store.commit_all();
        self.store.release_all();
        tracing::debug!(instances = self.store.len(), "Session closed");
        rolled_back
    }

    // ========================================================================
    // Attributes and Relationships
    // ========================================================================

    /// Set a column attribute.
    ///
    /// Primary key columns of persistent instances cannot be changed.
    #[allow(clippy::result_large_err)]
    pub fn set(&mut self, id: InstanceId, attr: &str, value: impl Into<Value>) -> Result<()> {
        self.store.check(id)?;
        let value = value.into();
        let inst = self.store.get(id);
        let mapper = self.registry.get(inst.entity)?;
        let index = mapper.field_index(attr).ok_or_else(|| {
            Error::invalid_request(format!("'{}' has no attribute '{}'", inst.entity, attr))
        })?;
        let keyed = matches!(
            inst.state,
            InstanceState::Persistent | InstanceState::Deleted
        );
        if keyed && mapper.is_primary_key(index) {
            if inst.values[index].key_eq(&value) {
                return Ok(());
            }
            return Err(Error::invalid_request(format!(
                "primary key '{}' of persistent '{}' {} cannot be changed",
                attr, inst.entity, id
            )));
        }
        if inst.state.is_attached() {
            self.store.ensure_frame();
        }
        let inst = self.store.get_mut(id);
        inst.values[index] = value;
        inst.expired[index] = false;
        Ok(())
    }

    /// Read a column attribute.
    #[allow(clippy::result_large_err)]
    pub fn value(&self, id: InstanceId, attr: &str) -> Result<&Value> {
        self.store.check(id)?;
        let inst = self.store.get(id);
        let mapper = self.registry.get(inst.entity)?;
        let index = mapper.field_index(attr).ok_or_else(|| {
            Error::invalid_request(format!("'{}' has no attribute '{}'", inst.entity, attr))
        })?;
        if inst.expired[index] {
            return Err(Error::Expired(ExpiredError {
                entity: inst.entity.to_string(),
                attribute: attr.to_string(),
            }));
        }
        Ok(&inst.values[index])
    }

    /// Point a scalar relationship at `target`, or clear it with `None`.
    #[allow(clippy::result_large_err)]
    pub fn set_related(
        &mut self,
        id: InstanceId,
        name: &str,
        target: Option<InstanceId>,
    ) -> Result<()> {
        let registry = Arc::clone(&self.registry);
        let rel = self.lookup_relation(&registry, id, name)?;
        if rel.is_collection() {
            return Err(Error::invalid_request(format!(
                "relationship '{}' is a collection; use append_related",
                name
            )));
        }
        if let Some(t) = target {
            self.check_target(rel, t)?;
        }
        self.touch(id);

        let previous = match target {
            Some(t) => self.store.get_mut(id).relations[rel.index].insert(t),
            None => {
                let slot = &mut self.store.get_mut(id).relations[rel.index];
                let previous = slot.members().first().copied();
                *slot = RelationSlot::Scalar(None);
                previous
            }
        };
        if let Some(back) = rel.back {
            if let Some(p) = previous {
                self.store.get_mut(p).relations[back].remove(id);
            }
            if let Some(t) = target {
                self.link_back(t, back, id, rel.index);
            }
        }
        Ok(())
    }

    /// Add `member` to a collection relationship.
    #[allow(clippy::result_large_err)]
    pub fn append_related(&mut self, id: InstanceId, name: &str, member: InstanceId) -> Result<()> {
        let registry = Arc::clone(&self.registry);
        let rel = self.lookup_relation(&registry, id, name)?;
        if !rel.is_collection() {
            return Err(Error::invalid_request(format!(
                "relationship '{}' is scalar; use set_related",
                name
            )));
        }
        self.check_target(rel, member)?;
        self.touch(id);
        self.store.get_mut(id).relations[rel.index].insert(member);
        if let Some(back) = rel.back {
            self.link_back(member, back, id, rel.index);
        }
        Ok(())
    }

    /// Remove `member` from a relationship. Returns whether it was present.
    #[allow(clippy::result_large_err)]
    pub fn remove_related(&mut self, id: InstanceId, name: &str, member: InstanceId) -> Result<bool> {
        let registry = Arc::clone(&self.registry);
        let rel = self.lookup_relation(&registry, id, name)?;
        self.store.check(member)?;
        if !self.store.get(id).relations[rel.index].contains(member) {
            return Ok(false);
        }
        self.touch(id);
        self.store.get_mut(id).relations[rel.index].remove(member);
        if let Some(back) = rel.back {
            if self.store.get(member).relations[back].contains(id) {
                self.store.get_mut(member).relations[back].remove(id);
            }
        }
        Ok(true)
    }

    /// Members of a relationship in insertion order.
    #[allow(clippy::result_large_err)]
    pub fn related(&self, id: InstanceId, name: &str) -> Result<Vec<InstanceId>> {
        let rel = self.lookup_relation(&self.registry, id, name)?;
        Ok(self.store.get(id).relations[rel.index].members())
    }

    #[allow(clippy::result_large_err)]
    fn lookup_relation<'r>(
        &self,
        registry: &'r MapperRegistry,
        id: InstanceId,
        name: &str,
    ) -> Result<&'r Relation> {
        self.store.check(id)?;
        let entity = self.store.get(id).entity;
        let mapper = registry.get(entity)?;
        mapper
            .relation_index(name)
            .map(|i| mapper.relation(i))
            .ok_or_else(|| {
                Error::invalid_request(format!("'{}' has no relationship '{}'", entity, name))
            })
    }

    #[allow(clippy::result_large_err)]
    fn check_target(&self, rel: &Relation, member: InstanceId) -> Result<()> {
        self.store.check(member)?;
        let entity = self.store.get(member).entity;
        if entity != rel.target() {
            return Err(Error::invalid_request(format!(
                "relationship '{}' holds '{}' instances, not '{}'",
                rel.name(),
                rel.target(),
                entity
            )));
        }
        Ok(())
    }

    /// Open the logical transaction before an attached instance changes.
    fn touch(&mut self, id: InstanceId) {
        if self.store.get(id).state.is_attached() {
            self.store.ensure_frame();
        }
    }

    /// Add `member` to `owner`'s inverse slot. A scalar inverse that held
    /// another instance is taken over, so that instance loses `owner` from
    /// its `forward` relationship.
    fn link_back(&mut self, owner: InstanceId, back: usize, member: InstanceId, forward: usize) {
        if let Some(stolen) = self.store.get_mut(owner).relations[back].insert(member) {
            if self.store.get(stolen).relations[forward].contains(owner) {
                self.store.get_mut(stolen).relations[forward].remove(owner);
            }
        }
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Register a row read from the database.
    ///
    /// If the key is already mapped the existing instance is returned and
    /// only its expired attributes are refreshed from `row`. Otherwise a
    /// persistent instance is created and linked to related instances
    /// already present in the session. Columns absent from `row` are
    /// loaded as expired.
    #[tracing::instrument(level = "trace", skip(self, row))]
    #[allow(clippy::result_large_err)]
    pub fn load(&mut self, entity: &str, row: &Row) -> Result<InstanceId> {
        let registry = Arc::clone(&self.registry);
        let mapper = registry.get(entity)?;

        let mut values = Vec::with_capacity(mapper.field_count());
        let mut missing = vec![false; mapper.field_count()];
        for (i, absent) in missing.iter_mut().enumerate() {
            match row.get_by_name(mapper.column_name(i)) {
                Some(v) => values.push(v.clone()),
                None => {
                    values.push(Value::Null);
                    *absent = true;
                }
            }
        }

        let pk = project(&values, mapper.primary_key_indices());
        if pk.iter().any(Value::is_null) {
            return Err(Error::invalid_request(format!(
                "row for '{}' has no primary key",
                mapper.entity()
            )));
        }

        if let Some(id) = self.store.identity.get(mapper.entity(), &pk) {
            self.refresh_expired(id, &values, &missing);
            return Ok(id);
        }

        let mut inst = Instance::new(mapper);
        inst.values = values;
        inst.expired = missing;
        inst.state = InstanceState::Persistent;
        inst.seq = self.store.next_seq();
        let id = self.store.push(inst);
        self.store.snapshot_untracked(id);
        self.store.identity.register(mapper.entity(), pk, id)?;
        self.link_loaded(&registry, id)?;
        tracing::trace!(id = %id, entity = mapper.entity(), "Instance loaded");
        Ok(id)
    }

    /// Look up the instance mapped to `pk` without touching the database.
    pub fn get_if_present(&self, entity: &str, pk: &[Value]) -> Option<InstanceId> {
        self.store.identity.get(entity, pk)
    }

    fn refresh_expired(&mut self, id: InstanceId, values: &[Value], missing: &[bool]) {
        let inst = self.store.get(id);
        let columns: Vec<usize> = (0..values.len())
            .filter(|&i| inst.expired[i] && !missing[i])
            .collect();
        if columns.is_empty() {
            return;
        }
        for &i in &columns {
            let inst = self.store.get_mut_untracked(id);
            inst.values[i] = values[i].clone();
            inst.expired[i] = false;
            if let Some(base) = self.store.tracker.baseline_mut(id) {
                base.values[i] = values[i].clone();
                base.known[i] = true;
            }
        }
        tracing::debug!(id = %id, columns = columns.len(), "Expired attributes refreshed");
    }

    /// Wire a freshly loaded instance to related persistent instances.
    #[allow(clippy::result_large_err)]
    fn link_loaded(&mut self, registry: &MapperRegistry, id: InstanceId) -> Result<()> {
        let entity = self.store.get(id).entity;
        let mapper = registry.get(entity)?;
        let pk = self.store.get(id).primary_key(mapper);

        for rel in mapper.relations() {
            match &rel.join {
                Join::Local { fk } => {
                    if let Some(parent) = self.parent_by_fk(rel.target(), id, fk) {
                        self.link_untracked(id, rel.index, parent);
                        if let Some(back) = rel.back {
                            self.link_untracked(parent, back, id);
                        }
                    }
                }
                Join::Remote { fk } => {
                    for child in self.children_by_fk(rel.target(), fk, &pk) {
                        self.link_untracked(id, rel.index, child);
                        if let Some(back) = rel.back {
                            self.link_untracked(child, back, id);
                        }
                    }
                }
                Join::Link { .. } => {}
            }
        }

        for other in registry.mappers() {
            for rel in other.relations().iter().filter(|r| r.target() == entity) {
                match &rel.join {
                    Join::Local { fk } => {
                        for child in self.children_by_fk(other.entity(), fk, &pk) {
                            self.link_untracked(child, rel.index, id);
                        }
                    }
                    Join::Remote { fk } => {
                        if let Some(parent) = self.parent_by_fk(other.entity(), id, fk) {
                            self.link_untracked(parent, rel.index, id);
                        }
                    }
                    Join::Link { .. } => {}
                }
            }
        }
        Ok(())
    }

    fn parent_by_fk(&self, parent_entity: &str, child: InstanceId, fk: &[usize]) -> Option<InstanceId> {
        let key = project(&self.store.get(child).values, fk);
        if key.iter().any(Value::is_null) {
            return None;
        }
        self.store.identity.get(parent_entity, &key)
    }

    fn children_by_fk(&self, child_entity: &str, fk: &[usize], pk: &[Value]) -> Vec<InstanceId> {
        self.store
            .instances()
            .filter(|(_, inst)| {
                inst.entity == child_entity
                    && inst.state == InstanceState::Persistent
                    && keys_equal(&project(&inst.values, fk), pk)
            })
            .map(|(id, _)| id)
            .collect()
    }

    /// Link into both the current slot and the baseline, leaving occupied
    /// scalar slots alone.
    fn link_untracked(&mut self, owner: InstanceId, index: usize, member: InstanceId) {
        let slot = &mut self.store.get_mut_untracked(owner).relations[index];
        if matches!(slot, RelationSlot::Scalar(Some(m)) if *m != member) {
            return;
        }
        slot.insert(member);
        if let Some(base) = self.store.tracker.baseline_mut(owner) {
            base.relations[index].insert(member);
        }
    }

    // ========================================================================
    // Transaction Management
    // ========================================================================

    /// Begin a transaction.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.tx.is_some() {
            return Outcome::Err(Error::transaction(
                TransactionErrorKind::AlreadyActive,
                "a transaction is already in progress",
            ));
        }
        match self.connection.begin(cx).await {
            Outcome::Ok(tx) => {
                self.tx = Some(tx);
                self.store.ensure_frame();
                tracing::debug!(tx = %tx, "Transaction started");
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Open a savepoint.
    ///
    /// Pending changes are flushed first. `commit()` and `rollback()` then
    /// act on this savepoint until it is closed.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn begin_nested(&mut self, cx: &Cx) -> Outcome<(), Error> {
        match self.flush(cx).await {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        if self.tx.is_none() {
            match self.begin(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        let Some(tx) = self.tx else {
            return Outcome::Err(Error::transaction(
                TransactionErrorKind::NotActive,
                "no transaction to open a savepoint in",
            ));
        };

        self.savepoint_counter += 1;
        let name = format!("sp_{}", self.savepoint_counter);
        match self.connection.savepoint(cx, tx, &name).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        tracing::debug!(savepoint = %name, depth = self.store.depth() + 1, "Savepoint opened");
        self.store.push_savepoint(name);
        Outcome::Ok(())
    }

    /// Flush pending changes to the database.
    ///
    /// Runs the cascade pass, builds and orders the dependency graph and
    /// executes it inside the session's transaction, beginning one when
    /// needed. Does NOT commit. Any failure rolls the whole transaction
    /// back and restores in-memory state to where it was at `begin`,
    /// except an identity conflict found while planning, which leaves the
    /// session untouched.
    #[tracing::instrument(level = "info", skip(self, cx))]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        if let Err(e) = self.events.fire(SessionEvent::BeforeFlush) {
            return Outcome::Err(e);
        }
        self.store.ensure_frame();

        let registry = Arc::clone(&self.registry);
        let planned = cascade::prepare(&registry, &mut self.store)
            .and_then(|()| unit_of_work::build(&registry, &mut self.store))
            .and_then(flush::plan);
        let plan = match planned {
            Ok(plan) => plan,
            Err(e @ Error::IdentityConflict(_)) => {
                // Nothing was written; the clash belongs to the caller.
                tracing::warn!(error = %e, "Flush rejected before execution");
                return Outcome::Err(e);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Flush could not be planned");
                self.rollback_after_failure(cx).await;
                return Outcome::Err(e);
            }
        };

        let mut result = FlushResult::new();
        if !plan.is_empty() {
            let tx = match self.tx {
                Some(tx) => tx,
                None => match self.connection.begin(cx).await {
                    Outcome::Ok(tx) => {
                        tracing::debug!(tx = %tx, "Transaction started for flush");
                        self.tx = Some(tx);
                        tx
                    }
                    Outcome::Err(e) => {
                        self.rollback_after_failure(cx).await;
                        return Outcome::Err(e);
                    }
                    Outcome::Cancelled(r) => {
                        self.rollback_after_failure(cx).await;
                        return Outcome::Cancelled(r);
                    }
                    Outcome::Panicked(p) => {
                        self.rollback_after_failure(cx).await;
                        return Outcome::Panicked(p);
                    }
                },
            };

            let outcome = {
                let mut executor = FlushExecutor {
                    cx,
                    conn: &self.connection,
                    tx,
                    registry: &registry,
                    compiler: self.compiler.as_ref(),
                    store: &mut self.store,
                    batch_inserts: self.config.batch_inserts,
                };
                executor.run(&plan).await
            };
            result = match outcome {
                Outcome::Ok(result) => result,
                Outcome::Err(e) => {
                    tracing::warn!(error = %e, "Flush failed; rolling back");
                    self.rollback_after_failure(cx).await;
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    tracing::warn!("Flush cancelled; rolling back");
                    self.rollback_after_failure(cx).await;
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    self.rollback_after_failure(cx).await;
                    return Outcome::Panicked(p);
                }
            };
        }

        flush::finalize(&mut self.store, &plan);

        if let Err(e) = self.events.fire(SessionEvent::AfterFlush) {
            return Outcome::Err(e);
        }
        Outcome::Ok(result)
    }

    /// Build the plan the next flush would execute, without executing it.
    ///
    /// Cascades and foreign key synchronisation are applied to the
    /// in-memory instances exactly as `flush` would.
    #[allow(clippy::result_large_err)]
    pub fn plan_flush(&mut self) -> Result<FlushPlan> {
        self.store.ensure_frame();
        let registry = Arc::clone(&self.registry);
        cascade::prepare(&registry, &mut self.store)?;
        flush::plan(unit_of_work::build(&registry, &mut self.store)?)
    }

    async fn rollback_after_failure(&mut self, cx: &Cx) {
        if let Some(tx) = self.tx.take() {
            match self.connection.rollback(cx, tx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => {
                    tracing::warn!(tx = %tx, error = %e, "Rollback after failed flush did not complete");
                }
                Outcome::Cancelled(_) | Outcome::Panicked(_) => {
                    tracing::warn!(tx = %tx, "Rollback after failed flush was interrupted");
                }
            }
        }
        self.store.rollback_all(&self.registry);
        if let Err(e) = self.events.fire(SessionEvent::AfterRollback) {
            tracing::warn!(error = %e, "after_rollback callback failed");
        }
    }

    /// Commit the innermost transaction level.
    ///
    /// Flushes first. Inside a savepoint this releases the savepoint;
    /// otherwise the database transaction is committed and every frame
    /// forgotten.
    #[tracing::instrument(level = "info", skip(self, cx))]
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        match self.flush(cx).await {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        if let Err(e) = self.events.fire(SessionEvent::BeforeCommit) {
            return Outcome::Err(e);
        }

        if let Some(name) = self.store.innermost_savepoint().map(str::to_string) {
            let Some(tx) = self.tx else {
                return Outcome::Err(Error::transaction(
                    TransactionErrorKind::NotActive,
                    "savepoint without a transaction",
                ));
            };
            match self.connection.release(cx, tx, &name).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            self.store.release_frame();
            tracing::debug!(savepoint = %name, "Savepoint released");
            return Outcome::Ok(());
        }

        if let Some(tx) = self.tx {
            match self.connection.commit(cx, tx).await {
                Outcome::Ok(()) => {
                    self.tx = None;
                }
                Outcome::Err(e) => {
                    self.rollback_after_failure(cx).await;
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    self.rollback_after_failure(cx).await;
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    self.rollback_after_failure(cx).await;
                    return Outcome::Panicked(p);
                }
            }
            tracing::info!(tx = %tx, "Transaction committed");
        }
        self.store.commit_all();

        if self.config.expire_on_commit {
            self.expire_persistent_untracked();
        }

        if let Err(e) = self.events.fire(SessionEvent::AfterCommit) {
            return Outcome::Err(e);
        }
        Outcome::Ok(())
    }

    /// Roll back the innermost transaction level.
    ///
    /// Inside a savepoint only the changes made since the savepoint are
    /// undone. Otherwise the database transaction is rolled back and every
    /// instance returns to its state at `begin`: instances added since are
    /// transient again, deleted ones are persistent again.
    #[tracing::instrument(level = "info", skip(self, cx))]
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if let Some(name) = self.store.innermost_savepoint().map(str::to_string) {
            if let Some(tx) = self.tx {
                match self.connection.rollback_to(cx, tx, &name).await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
            self.store.rollback_frame(&self.registry);
            tracing::debug!(savepoint = %name, "Rolled back to savepoint");
            if let Err(e) = self.events.fire(SessionEvent::AfterRollback) {
                return Outcome::Err(e);
            }
            return Outcome::Ok(());
        }
        self.rollback_all(cx).await
    }

    async fn rollback_all(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let mut outcome = Outcome::Ok(());
        if let Some(tx) = self.tx.take() {
            outcome = self.connection.rollback(cx, tx).await;
            tracing::info!(tx = %tx, "Transaction rolled back");
        }
        self.store.rollback_all(&self.registry);

        match outcome {
            Outcome::Ok(()) => {}
            other => return other,
        }
        if let Err(e) = self.events.fire(SessionEvent::AfterRollback) {
            return Outcome::Err(e);
        }
        Outcome::Ok(())
    }

    // ========================================================================
    // Expiry and Inspection
    // ========================================================================

    /// Expire every non-key attribute of a persistent instance.
    ///
    /// Unflushed changes are discarded; reading an expired attribute fails
    /// until a `load` of the same row refreshes it.
    #[allow(clippy::result_large_err)]
    pub fn expire(&mut self, id: InstanceId) -> Result<()> {
        self.expire_columns(id, None)
    }

    /// Expire the named attributes of a persistent instance.
    #[allow(clippy::result_large_err)]
    pub fn expire_attributes(&mut self, id: InstanceId, attrs: &[&str]) -> Result<()> {
        self.expire_columns(id, Some(attrs))
    }

    /// Expire every persistent instance.
    pub fn expire_all(&mut self) {
        let ids: Vec<InstanceId> = self
            .store
            .instances()
            .filter(|(_, inst)| inst.state == InstanceState::Persistent)
            .map(|(id, _)| id)
            .collect();
        for id in ids {
            if let Err(e) = self.expire_columns(id, None) {
                tracing::warn!(id = %id, error = %e, "Instance could not be expired");
            }
        }
    }

    #[allow(clippy::result_large_err)]
    fn expire_columns(&mut self, id: InstanceId, attrs: Option<&[&str]>) -> Result<()> {
        self.store.check(id)?;
        let inst = self.store.get(id);
        if inst.state != InstanceState::Persistent {
            return Err(Error::invalid_request(format!(
                "instance {} is {}; only persistent instances can be expired",
                id, inst.state
            )));
        }
        let mapper = self.registry.get(inst.entity)?;
        let columns: Vec<usize> = match attrs {
            None => (0..mapper.field_count())
                .filter(|&i| !mapper.is_primary_key(i))
                .collect(),
            Some(attrs) => {
                let mut columns = Vec::with_capacity(attrs.len());
                for attr in attrs {
                    let index = mapper.field_index(attr).ok_or_else(|| {
                        Error::invalid_request(format!(
                            "'{}' has no attribute '{}'",
                            mapper.entity(),
                            attr
                        ))
                    })?;
                    if mapper.is_primary_key(index) {
                        return Err(Error::invalid_request(format!(
                            "primary key '{}' cannot be expired",
                            attr
                        )));
                    }
                    columns.push(index);
                }
                columns
            }
        };

        let originals: Vec<Option<Value>> = columns
            .iter()
            .map(|&i| self.store.tracker.original_value(id, i).cloned())
            .collect();
        self.store.ensure_frame();
        let inst = self.store.get_mut(id);
        for (&i, original) in columns.iter().zip(originals) {
            if let Some(v) = original {
                inst.values[i] = v;
            }
            inst.expired[i] = true;
        }
        // Expired values no longer identify the row.
        if let Some(base) = self.store.baseline_mut(id) {
            for &i in &columns {
                base.known[i] = false;
            }
        }
        tracing::trace!(id = %id, columns = columns.len(), "Instance expired");
        Ok(())
    }

    /// Expire after the outermost commit; there is no frame left to undo it.
    fn expire_persistent_untracked(&mut self) {
        let mut expired = 0;
        for id in self.store.ids() {
            let inst = self.store.get(id);
            if inst.state != InstanceState::Persistent {
                continue;
            }
            let Some(mapper) = self.registry.mapper(inst.entity) else {
                continue;
            };
            let inst = self.store.get_mut_untracked(id);
            for (i, flag) in inst.expired.iter_mut().enumerate() {
                if !mapper.is_primary_key(i) {
                    *flag = true;
                }
            }
            expired += 1;
        }
        tracing::debug!(expired, "Expired instances on commit");
    }

    /// Whether the instance differs from its baseline.
    #[allow(clippy::result_large_err)]
    pub fn is_modified(&self, id: InstanceId) -> Result<bool> {
        self.store.check(id)?;
        Ok(self.store.tracker.is_dirty(id, self.store.get(id)))
    }

    /// Pending column and relationship changes of an instance.
    #[allow(clippy::result_large_err)]
    pub fn changes(&self, id: InstanceId) -> Result<ChangeSet> {
        self.store.check(id)?;
        Ok(self.store.tracker.diff(id, self.store.get(id)))
    }

    #[allow(clippy::result_large_err)]
    pub fn state_of(&self, id: InstanceId) -> Result<InstanceState> {
        self.store.check(id)?;
        Ok(self.store.get(id).state)
    }

    #[allow(clippy::result_large_err)]
    pub fn instance(&self, id: InstanceId) -> Result<&Instance> {
        self.store.check(id)?;
        Ok(self.store.get(id))
    }

    /// Whether the instance is attached to this session.
    pub fn contains(&self, id: InstanceId) -> bool {
        self.store.check(id).is_ok() && self.store.get(id).state.is_attached()
    }

    // ========================================================================
    // Typed Models
    // ========================================================================

    /// Create an instance from a typed model and add it.
    #[allow(clippy::result_large_err)]
    pub fn add_model<M: Model>(&mut self, model: &M) -> Result<InstanceId> {
        let id = self.create(M::ENTITY_NAME)?;
        for (attr, value) in model.to_row() {
            self.set(id, attr, value)?;
        }
        self.add(id)?;
        Ok(id)
    }

    /// Build a typed model from an instance's current attributes.
    #[allow(clippy::result_large_err)]
    pub fn materialize<M: Model>(&self, id: InstanceId) -> Result<M> {
        self.store.check(id)?;
        let inst = self.store.get(id);
        if inst.entity != M::ENTITY_NAME {
            return Err(Error::invalid_request(format!(
                "instance {} is a '{}', not a '{}'",
                id,
                inst.entity,
                M::ENTITY_NAME
            )));
        }
        let mapper = self.registry.get(inst.entity)?;
        if let Some(i) = inst.expired.iter().position(|e| *e) {
            return Err(Error::Expired(ExpiredError {
                entity: inst.entity.to_string(),
                attribute: mapper.field_infos()[i].name.to_string(),
            }));
        }
        let row = Row::from_pairs(
            mapper
                .field_infos()
                .iter()
                .zip(&inst.values)
                .map(|(f, v)| (f.name, v.clone())),
        );
        M::from_row(&row)
    }

    // ========================================================================
    // Debug Diagnostics
    // ========================================================================

    /// Get count of instances pending INSERT.
    pub fn pending_new_count(&self) -> usize {
        self.store.count_in(InstanceState::Pending)
    }

    /// Get count of instances pending DELETE.
    pub fn pending_delete_count(&self) -> usize {
        self.store.count_in(InstanceState::Deleted)
    }

    /// Get count of attached instances.
    pub fn tracked_count(&self) -> usize {
        self.store
            .instances()
            .filter(|(_, inst)| inst.state.is_attached())
            .count()
    }

    /// Whether a database transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// Open transaction levels: 0 outside a transaction, 1 for the
    /// outermost, plus one per savepoint.
    pub fn transaction_depth(&self) -> usize {
        self.store.depth()
    }

    /// Dump session state for debugging.
    pub fn debug_state(&self) -> SessionDebugInfo {
        SessionDebugInfo {
            instances: self.store.len(),
            pending: self.pending_new_count(),
            persistent: self.store.count_in(InstanceState::Persistent),
            deleted: self.pending_delete_count(),
            identity_map: self.store.identity.len(),
            in_transaction: self.in_transaction(),
            transaction_depth: self.transaction_depth(),
        }
    }

    /// [`debug_state`](Self::debug_state) rendered as JSON.
    #[allow(clippy::result_large_err)]
    pub fn debug_json(&self) -> Result<String> {
        serde_json::to_string(&self.debug_state()).map_err(|e| Error::Custom(e.to_string()))
    }
}

/// Debug information about session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionDebugInfo {
    /// Instances ever created in or loaded into the session.
    pub instances: usize,
    /// Instances pending INSERT.
    pub pending: usize,
    pub persistent: usize,
    /// Instances pending DELETE.
    pub deleted: usize,
    /// Entries in the identity map.
    pub identity_map: usize,
    /// Whether in a transaction.
    pub in_transaction: bool,
    pub transaction_depth: usize,
}

// ============================================================================
// Unit Tests
// ============================================================================
