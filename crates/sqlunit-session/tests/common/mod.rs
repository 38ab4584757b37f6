//! Shared fixtures for the session integration tests.
//!
//! `MockConnection` records every statement and transaction command it
//! receives and reports row counts the way a real driver would, so tests
//! can assert on the exact SQL a flush produced.

#![allow(dead_code)]
#![allow(clippy::manual_async_fn)] // Mock trait impls must match trait signatures

use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};
use sqlunit_core::{
    Connection, Error, ExecuteResult, FieldInfo, LinkTableInfo, Mapper, MapperRegistry,
    QueryError, QueryErrorKind, RegistryBuilder, RelationshipInfo, RelationshipKind, Row,
    Statement, TransactionId, Value,
};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct MockState {
    next_key: i64,
    next_tx: u64,
    executed: Vec<Statement>,
    log: Vec<String>,
    /// Statements containing this text report zero affected rows.
    stale_on: Option<String>,
    /// Statements containing this text fail with a constraint error.
    fail_on: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                next_key: 100,
                ..MockState::default()
            })),
        }
    }

    pub fn stale_on(&self, fragment: &str) {
        self.state.lock().expect("lock poisoned").stale_on = Some(fragment.to_string());
    }

    pub fn fail_on(&self, fragment: &str) {
        self.state.lock().expect("lock poisoned").fail_on = Some(fragment.to_string());
    }

    /// Executed statements, oldest first.
    pub fn statements(&self) -> Vec<Statement> {
        self.state.lock().expect("lock poisoned").executed.clone()
    }

    pub fn sql(&self) -> Vec<String> {
        self.statements().into_iter().map(|s| s.sql).collect()
    }

    /// `"VERB table"` for every executed statement, e.g. `"INSERT heroes"`.
    pub fn shape(&self) -> Vec<String> {
        self.sql().iter().map(|sql| shape_of(sql)).collect()
    }

    /// Statements and transaction commands interleaved in issue order.
    pub fn log(&self) -> Vec<String> {
        self.state.lock().expect("lock poisoned").log.clone()
    }

    pub fn clear(&self) {
        let mut guard = self.state.lock().expect("lock poisoned");
        guard.executed.clear();
        guard.log.clear();
    }

    fn push_log(&self, entry: String) {
        self.state.lock().expect("lock poisoned").log.push(entry);
    }
}

fn shape_of(sql: &str) -> String {
    let words: Vec<&str> = sql.split_whitespace().collect();
    let table = match words.first().copied() {
        Some("UPDATE") => words.get(1),
        _ => words.get(2),
    };
    format!(
        "{} {}",
        words.first().copied().unwrap_or_default(),
        table.copied().unwrap_or_default().trim_matches('"')
    )
}

fn rows_matched(statement: &Statement) -> u64 {
    let sql = &statement.sql;
    if sql.starts_with("INSERT") {
        sql.matches("), (").count() as u64 + 1
    } else if sql.starts_with("DELETE") && sql.contains(" IN (") {
        statement.params.len() as u64
    } else {
        sql.matches(") OR (").count() as u64 + 1
    }
}

impl Connection for MockConnection {
    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<TransactionId, Error>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            let mut guard = state.lock().expect("lock poisoned");
            guard.next_tx += 1;
            guard.log.push("BEGIN".into());
            Outcome::Ok(TransactionId(guard.next_tx))
        }
    }

    fn commit(&self, _cx: &Cx, _tx: TransactionId) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.push_log("COMMIT".into());
        async { Outcome::Ok(()) }
    }

    fn rollback(
        &self,
        _cx: &Cx,
        _tx: TransactionId,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.push_log("ROLLBACK".into());
        async { Outcome::Ok(()) }
    }

    fn savepoint(
        &self,
        _cx: &Cx,
        _tx: TransactionId,
        name: &str,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.push_log(format!("SAVEPOINT {name}"));
        async { Outcome::Ok(()) }
    }

    fn rollback_to(
        &self,
        _cx: &Cx,
        _tx: TransactionId,
        name: &str,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.push_log(format!("ROLLBACK TO {name}"));
        async { Outcome::Ok(()) }
    }

    fn release(
        &self,
        _cx: &Cx,
        _tx: TransactionId,
        name: &str,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.push_log(format!("RELEASE {name}"));
        async { Outcome::Ok(()) }
    }

    fn execute(
        &self,
        _cx: &Cx,
        _tx: TransactionId,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<ExecuteResult, Error>> + Send {
        let state = Arc::clone(&self.state);
        let statement = statement.clone();
        async move {
            let mut guard = state.lock().expect("lock poisoned");
            guard.log.push(statement.sql.clone());
            guard.executed.push(statement.clone());

            if guard
                .fail_on
                .as_deref()
                .is_some_and(|f| statement.sql.contains(f))
            {
                return Outcome::Err(Error::Query(QueryError {
                    kind: QueryErrorKind::Constraint,
                    sql: Some(statement.sql.clone()),
                    sqlstate: Some("23505".into()),
                    message: "duplicate key value violates unique constraint".into(),
                    source: None,
                }));
            }
            if guard
                .stale_on
                .as_deref()
                .is_some_and(|f| statement.sql.contains(f))
            {
                return Outcome::Ok(ExecuteResult::affected(0));
            }

            let rows = rows_matched(&statement);
            if statement.returning.is_some() {
                guard.next_key += 1;
                Outcome::Ok(ExecuteResult::with_key(rows, Value::BigInt(guard.next_key)))
            } else {
                Outcome::Ok(ExecuteResult::affected(rows))
            }
        }
    }
}

pub fn run<F: Future>(f: F) -> F::Output {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(f)
}

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        Outcome::Ok(_) => panic!("expected an error, flush succeeded"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn row(pairs: &[(&str, Value)]) -> Row {
    Row::from_pairs(pairs.iter().map(|(k, v)| (k.to_string(), v.clone())))
}

/// `Team` one-to-many `Hero`, with the collection's cascade configurable.
pub fn teams(cascade: &'static str) -> Arc<MapperRegistry> {
    let mut b = RegistryBuilder::new();
    b.register(
        Mapper::new("Team", "teams")
            .field(FieldInfo::new("id").primary_key(true).auto_increment(true))
            .field(FieldInfo::new("name"))
            .relationship(
                RelationshipInfo::new("heroes", "Hero", RelationshipKind::OneToMany)
                    .remote_key("team_id")
                    .back_populates("team")
                    .cascade(cascade),
            ),
    )
    .expect("register Team");
    b.register(
        Mapper::new("Hero", "heroes")
            .field(FieldInfo::new("id").primary_key(true).auto_increment(true))
            .field(FieldInfo::new("name"))
            .field(FieldInfo::new("team_id").nullable(true))
            .relationship(
                RelationshipInfo::new("team", "Team", RelationshipKind::ManyToOne)
                    .local_key("team_id")
                    .back_populates("heroes"),
            ),
    )
    .expect("register Hero");
    b.build().expect("build registry")
}

/// Self-referential tree with a nullable `parent_id`.
pub fn nodes() -> Arc<MapperRegistry> {
    node_registry(false)
}

/// `nodes()` with every non-key column matched on UPDATE and DELETE.
pub fn checked_nodes() -> Arc<MapperRegistry> {
    node_registry(true)
}

fn node_registry(check_original_values: bool) -> Arc<MapperRegistry> {
    let mut b = RegistryBuilder::new();
    b.register(
        Mapper::new("Node", "nodes")
            .check_original_values(check_original_values)
            .field(FieldInfo::new("id").primary_key(true).auto_increment(true))
            .field(FieldInfo::new("name"))
            .field(FieldInfo::new("parent_id").nullable(true))
            .relationship(
                RelationshipInfo::new("parent", "Node", RelationshipKind::ManyToOne)
                    .local_key("parent_id")
                    .back_populates("children"),
            )
            .relationship(
                RelationshipInfo::new("children", "Node", RelationshipKind::OneToMany)
                    .remote_key("parent_id")
                    .back_populates("parent"),
            ),
    )
    .expect("register Node");
    b.build().expect("build registry")
}

/// `Post` many-to-many `Tag` through `post_tags`.
pub fn posts() -> Arc<MapperRegistry> {
    let mut b = RegistryBuilder::new();
    b.register(
        Mapper::new("Post", "posts")
            .field(FieldInfo::new("id").primary_key(true).auto_increment(true))
            .field(FieldInfo::new("title"))
            .relationship(
                RelationshipInfo::new("tags", "Tag", RelationshipKind::ManyToMany)
                    .link_table(LinkTableInfo::new("post_tags", "post_id", "tag_id"))
                    .back_populates("posts"),
            ),
    )
    .expect("register Post");
    b.register(
        Mapper::new("Tag", "tags")
            .field(FieldInfo::new("id").primary_key(true).auto_increment(true))
            .field(FieldInfo::new("label"))
            .relationship(
                RelationshipInfo::new("posts", "Post", RelationshipKind::ManyToMany)
                    .link_table(LinkTableInfo::new("post_tags", "tag_id", "post_id"))
                    .back_populates("tags"),
            ),
    )
    .expect("register Tag");
    b.build().expect("build registry")
}

/// Application-assigned keys with a version counter.
pub fn documents() -> Arc<MapperRegistry> {
    let mut b = RegistryBuilder::new();
    b.register(
        Mapper::new("Document", "documents")
            .field(FieldInfo::new("id").primary_key(true))
            .field(FieldInfo::new("title"))
            .field(FieldInfo::new("version").version(true)),
    )
    .expect("register Document");
    b.build().expect("build registry")
}

/// Two tables whose non-nullable foreign keys point at each other.
pub fn mutual(post_update: bool) -> Arc<MapperRegistry> {
    let mut b = RegistryBuilder::new();
    b.register(
        Mapper::new("Account", "accounts")
            .field(FieldInfo::new("id").primary_key(true).auto_increment(true))
            .field(FieldInfo::new("primary_user_id").nullable(post_update))
            .relationship(
                RelationshipInfo::new("primary_user", "User", RelationshipKind::ManyToOne)
                    .local_key("primary_user_id")
                    .post_update(post_update),
            ),
    )
    .expect("register Account");
    b.register(
        Mapper::new("User", "users")
            .field(FieldInfo::new("id").primary_key(true).auto_increment(true))
            .field(FieldInfo::new("account_id"))
            .relationship(
                RelationshipInfo::new("account", "Account", RelationshipKind::ManyToOne)
                    .local_key("account_id"),
            ),
    )
    .expect("register User");
    b.build().expect("build registry")
}
