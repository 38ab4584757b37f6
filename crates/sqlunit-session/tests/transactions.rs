//! Transactions, savepoints and rollback of in-memory state.

mod common;

use asupersync::Cx;
use common::{
    MockConnection, checked_nodes, documents, expect_err, row, run, teams, unwrap_outcome,
};
use sqlunit_core::{Error, MapperRegistry, Value};
use sqlunit_session::{InstanceId, InstanceState, Session, SessionConfig};
use std::sync::{Arc, Mutex};

fn load_team_with_hero(session: &mut Session<MockConnection>) -> (InstanceId, InstanceId) {
    let team = session
        .load("Team", &row(&[("id", Value::BigInt(1)), ("name", "Avengers".into())]))
        .unwrap();
    let hero = session
        .load(
            "Hero",
            &row(&[
                ("id", Value::BigInt(7)),
                ("name", "Thor".into()),
                ("team_id", Value::BigInt(1)),
            ]),
        )
        .unwrap();
    (team, hero)
}

fn load_document(session: &mut Session<MockConnection>) -> InstanceId {
    session
        .load(
            "Document",
            &row(&[
                ("id", Value::BigInt(1)),
                ("title", "Draft".into()),
                ("version", Value::BigInt(3)),
            ]),
        )
        .unwrap()
}

fn registry_with_heroes() -> Arc<MapperRegistry> {
    teams("save-update, merge")
}

#[test]
fn rollback_restores_every_instance() {
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let mut session = Session::new(conn.clone(), registry_with_heroes());

    run(async {
        let (team, hero) = load_team_with_hero(&mut session);
        unwrap_outcome(session.begin(&cx).await);

        session.set(team, "name", "Renamed").unwrap();
        session.delete(hero).unwrap();
        let extra = session.create_with("Team", &[("name", "New".into())]).unwrap();
        session.add(extra).unwrap();
        unwrap_outcome(session.flush(&cx).await);
        assert_eq!(session.state_of(hero).unwrap(), InstanceState::Detached);
        assert_eq!(session.state_of(extra).unwrap(), InstanceState::Persistent);

        unwrap_outcome(session.rollback(&cx).await);
        assert_eq!(conn.log().last().map(String::as_str), Some("ROLLBACK"));

        assert_eq!(session.value(team, "name").unwrap(), &Value::from("Avengers"));
        assert!(!session.is_modified(team).unwrap());
        assert_eq!(session.state_of(hero).unwrap(), InstanceState::Persistent);
        assert_eq!(session.related(team, "heroes").unwrap(), vec![hero]);
        assert_eq!(session.related(hero, "team").unwrap(), vec![team]);
        assert_eq!(session.value(hero, "team_id").unwrap(), &Value::BigInt(1));

        assert_eq!(session.state_of(extra).unwrap(), InstanceState::Transient);
        assert!(session.value(extra, "id").unwrap().is_null());

        assert_eq!(session.get_if_present("Team", &[Value::BigInt(1)]), Some(team));
        assert_eq!(session.get_if_present("Hero", &[Value::BigInt(7)]), Some(hero));
        assert_eq!(session.get_if_present("Team", &[Value::BigInt(101)]), None);
        assert!(!session.in_transaction());
        assert_eq!(session.transaction_depth(), 0);
    });
}

#[test]
fn stale_update_rolls_back_the_transaction() {
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let mut session = Session::new(conn.clone(), documents());

    run(async {
        let doc = load_document(&mut session);
        session.set(doc, "title", "Final").unwrap();
        conn.stale_on("UPDATE \"documents\"");

        let err = expect_err(session.flush(&cx).await);
        let Error::StaleData(stale) = err else {
            panic!("expected stale data, got {err}");
        };
        assert_eq!(stale.operation, "UPDATE");
        assert_eq!(stale.table, "documents");
        assert_eq!((stale.expected, stale.actual), (1, 0));

        let log = conn.log();
        assert_eq!(log.first().map(String::as_str), Some("BEGIN"));
        assert_eq!(log.last().map(String::as_str), Some("ROLLBACK"));
        assert!(!session.in_transaction());

        assert_eq!(session.value(doc, "title").unwrap(), &Value::from("Draft"));
        assert_eq!(session.value(doc, "version").unwrap(), &Value::BigInt(3));
        assert_eq!(session.state_of(doc).unwrap(), InstanceState::Persistent);
    });
}

#[test]
fn stale_delete_keeps_instance_persistent() {
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let mut session = Session::new(conn.clone(), documents());

    run(async {
        let doc = load_document(&mut session);
        session.delete(doc).unwrap();
        conn.stale_on("DELETE");

        let err = expect_err(session.flush(&cx).await);
        assert!(matches!(&err, Error::StaleData(s) if s.operation == "DELETE"), "got {err}");
        assert_eq!(
            conn.sql(),
            vec!["DELETE FROM \"documents\" WHERE \"id\" = $1 AND \"version\" = $2"]
        );
        assert_eq!(session.state_of(doc).unwrap(), InstanceState::Persistent);
        assert_eq!(session.get_if_present("Document", &[Value::BigInt(1)]), Some(doc));
    });
}

#[test]
fn database_error_rolls_back_and_fires_after_rollback() {
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let mut session = Session::new(conn.clone(), registry_with_heroes());
    let rollbacks = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&rollbacks);
    session.on_after_rollback(move || {
        *counter.lock().expect("lock poisoned") += 1;
        Ok(())
    });

    run(async {
        let team = session.create_with("Team", &[("name", "Dup".into())]).unwrap();
        session.add(team).unwrap();
        conn.fail_on("INSERT INTO \"teams\"");

        let err = expect_err(session.flush(&cx).await);
        assert!(matches!(err, Error::Query(_)), "got {err}");
        assert_eq!(conn.log().last().map(String::as_str), Some("ROLLBACK"));
        assert_eq!(*rollbacks.lock().expect("lock poisoned"), 1);
        assert_eq!(session.state_of(team).unwrap(), InstanceState::Transient);
        assert_eq!(session.pending_new_count(), 0);
    });
}

#[test]
fn savepoint_rollback_keeps_outer_work() {
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let mut session = Session::new(conn.clone(), registry_with_heroes());

    run(async {
        unwrap_outcome(session.begin(&cx).await);
        let kept = session.create_with("Team", &[("name", "A".into())]).unwrap();
        session.add(kept).unwrap();

        unwrap_outcome(session.begin_nested(&cx).await);
        assert_eq!(session.state_of(kept).unwrap(), InstanceState::Persistent);
        assert_eq!(session.transaction_depth(), 2);

        session.set(kept, "name", "A2").unwrap();
        let dropped = session.create_with("Team", &[("name", "B".into())]).unwrap();
        session.add(dropped).unwrap();

        unwrap_outcome(session.rollback(&cx).await);
        assert_eq!(session.transaction_depth(), 1);
        assert!(session.in_transaction());
        assert_eq!(session.value(kept, "name").unwrap(), &Value::from("A"));
        assert_eq!(session.state_of(kept).unwrap(), InstanceState::Persistent);
        assert_eq!(session.state_of(dropped).unwrap(), InstanceState::Transient);

        unwrap_outcome(session.commit(&cx).await);
        let log = conn.log();
        assert_eq!(log.len(), 5);
        assert_eq!(log[0], "BEGIN");
        assert!(log[1].starts_with("INSERT INTO \"teams\""));
        assert_eq!(&log[2..], ["SAVEPOINT sp_1", "ROLLBACK TO sp_1", "COMMIT"]);
        assert_eq!(session.transaction_depth(), 0);
    });
}

#[test]
fn released_savepoint_is_undone_by_outer_rollback() {
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let mut session = Session::new(conn.clone(), registry_with_heroes());

    run(async {
        unwrap_outcome(session.begin(&cx).await);
        unwrap_outcome(session.begin_nested(&cx).await);
        let team = session.create_with("Team", &[("name", "Inner".into())]).unwrap();
        session.add(team).unwrap();

        unwrap_outcome(session.commit(&cx).await);
        assert_eq!(session.transaction_depth(), 1);
        assert_eq!(session.state_of(team).unwrap(), InstanceState::Persistent);

        unwrap_outcome(session.rollback(&cx).await);
        assert_eq!(session.state_of(team).unwrap(), InstanceState::Transient);

        let log = conn.log();
        assert_eq!(log[..2], ["BEGIN", "SAVEPOINT sp_1"]);
        assert!(log[2].starts_with("INSERT INTO \"teams\""));
        assert_eq!(log[3..], ["RELEASE sp_1", "ROLLBACK"]);
    });
}

#[test]
fn begin_twice_is_rejected() {
    let cx = Cx::for_testing();
    let mut session = Session::new(MockConnection::new(), registry_with_heroes());

    run(async {
        unwrap_outcome(session.begin(&cx).await);
        let err = expect_err(session.begin(&cx).await);
        assert!(matches!(err, Error::Transaction(_)), "got {err}");
    });
}

#[test]
fn version_counter_guards_updates() {
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let mut session = Session::new(conn.clone(), documents());

    run(async {
        let doc = load_document(&mut session);
        session.set(doc, "title", "Final").unwrap();
        unwrap_outcome(session.flush(&cx).await);

        let statements = conn.statements();
        assert_eq!(
            statements[0].sql,
            "UPDATE \"documents\" SET \"title\" = $1, \"version\" = $2 \
             WHERE \"id\" = $3 AND \"version\" = $4"
        );
        assert_eq!(
            statements[0].params,
            vec![
                Value::from("Final"),
                Value::BigInt(4),
                Value::BigInt(1),
                Value::BigInt(3)
            ]
        );
        assert_eq!(session.value(doc, "version").unwrap(), &Value::BigInt(4));
        assert!(!session.is_modified(doc).unwrap());
    });
}

#[test]
fn new_versioned_rows_start_at_one_and_batch() {
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let mut session = Session::new(conn.clone(), documents());

    run(async {
        let docs: Vec<InstanceId> = (1..=3)
            .map(|i| {
                session
                    .create_with("Document", &[("id", Value::BigInt(i)), ("title", "t".into())])
                    .unwrap()
            })
            .collect();
        session.add_all(docs.clone()).unwrap();

        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.inserted, 3);
        let sql = conn.sql();
        assert_eq!(sql.len(), 1);
        assert_eq!(sql[0].matches("), (").count(), 2);
        for doc in docs {
            assert_eq!(session.value(doc, "version").unwrap(), &Value::BigInt(1));
        }
    });
}

#[test]
fn unbatched_inserts_issue_one_statement_per_row() {
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let config = SessionConfig::new().batch_inserts(false);
    let mut session = Session::with_config(conn.clone(), documents(), config);

    run(async {
        for i in 1..=3 {
            let doc = session
                .create_with("Document", &[("id", Value::BigInt(i)), ("title", "t".into())])
                .unwrap();
            session.add(doc).unwrap();
        }
        unwrap_outcome(session.flush(&cx).await);
        assert_eq!(conn.sql().len(), 3);
    });
}

#[test]
fn expire_on_commit_requires_reload() {
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let config = SessionConfig::new().expire_on_commit(true);
    let mut session = Session::with_config(conn.clone(), documents(), config);

    run(async {
        let doc = load_document(&mut session);
        session.set(doc, "title", "Final").unwrap();
        unwrap_outcome(session.commit(&cx).await);
        assert_eq!(conn.log(), vec![
            "BEGIN".to_string(),
            conn.sql()[0].clone(),
            "COMMIT".to_string(),
        ]);

        assert!(matches!(session.value(doc, "title"), Err(Error::Expired(_))));
        assert_eq!(session.value(doc, "id").unwrap(), &Value::BigInt(1));

        session
            .load(
                "Document",
                &row(&[
                    ("id", Value::BigInt(1)),
                    ("title", "Final".into()),
                    ("version", Value::BigInt(4)),
                ]),
            )
            .unwrap();
        assert_eq!(session.value(doc, "title").unwrap(), &Value::from("Final"));
    });
}

#[test]
fn attributes_stay_readable_after_commit_by_default() {
    let cx = Cx::for_testing();
    let mut session = Session::new(MockConnection::new(), documents());

    run(async {
        let doc = load_document(&mut session);
        session.set(doc, "title", "Final").unwrap();
        unwrap_outcome(session.commit(&cx).await);
        assert_eq!(session.value(doc, "title").unwrap(), &Value::from("Final"));
    });
}

#[test]
fn commit_events_fire_around_commit() {
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let mut session = Session::new(conn.clone(), registry_with_heroes());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let s = Arc::clone(&seen);
    let c = conn.clone();
    session.on_before_commit(move || {
        let committed = c.log().iter().any(|l| l == "COMMIT");
        s.lock().expect("lock poisoned").push(("before_commit", committed));
        Ok(())
    });
    let s = Arc::clone(&seen);
    let c = conn.clone();
    session.on_after_commit(move || {
        let committed = c.log().iter().any(|l| l == "COMMIT");
        s.lock().expect("lock poisoned").push(("after_commit", committed));
        Ok(())
    });

    run(async {
        let team = session.create_with("Team", &[("name", "A".into())]).unwrap();
        session.add(team).unwrap();
        unwrap_outcome(session.commit(&cx).await);
    });

    assert_eq!(
        *seen.lock().expect("lock poisoned"),
        vec![("before_commit", false), ("after_commit", true)]
    );
}

#[test]
fn close_rolls_back_open_transaction() {
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let mut session = Session::new(conn.clone(), registry_with_heroes());

    run(async {
        let (team, _) = load_team_with_hero(&mut session);
        unwrap_outcome(session.begin(&cx).await);
        session.set(team, "name", "Unsaved").unwrap();
        unwrap_outcome(session.flush(&cx).await);

        unwrap_outcome(session.close(&cx).await);
        assert_eq!(conn.log().last().map(String::as_str), Some("ROLLBACK"));
        assert_eq!(session.state_of(team).unwrap(), InstanceState::Detached);
        assert_eq!(session.tracked_count(), 0);
        assert!(!session.in_transaction());
    });
}

fn load_node(session: &mut Session<MockConnection>, id: i64, name: &str, parent: Value) -> InstanceId {
    session
        .load(
            "Node",
            &row(&[
                ("id", Value::BigInt(id)),
                ("name", name.into()),
                ("parent_id", parent),
            ]),
        )
        .unwrap()
}

#[test]
fn original_values_guard_updates() {
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let mut session = Session::new(conn.clone(), checked_nodes());

    run(async {
        let node = load_node(&mut session, 1, "a", Value::Null);
        session.set(node, "name", "b").unwrap();
        unwrap_outcome(session.flush(&cx).await);

        let stmt = &conn.statements()[0];
        assert_eq!(
            stmt.sql,
            "UPDATE \"nodes\" SET \"name\" = $1 WHERE \"id\" = $2 AND \"name\" = $3 AND \"parent_id\" IS NULL"
        );
        assert_eq!(
            stmt.params,
            vec![Value::from("b"), Value::BigInt(1), Value::from("a")]
        );
    });
}

#[test]
fn original_values_skip_columns_never_loaded() {
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let mut session = Session::new(conn.clone(), checked_nodes());

    run(async {
        let node = session
            .load(
                "Node",
                &row(&[("id", Value::BigInt(1)), ("parent_id", Value::Null)]),
            )
            .unwrap();
        assert!(matches!(session.value(node, "name"), Err(Error::Expired(_))));

        session.set(node, "parent_id", Value::BigInt(5)).unwrap();
        unwrap_outcome(session.flush(&cx).await);
        assert_eq!(
            conn.sql(),
            vec!["UPDATE \"nodes\" SET \"parent_id\" = $1 WHERE \"id\" = $2 AND \"parent_id\" IS NULL"]
        );
        conn.clear();

        // An expired column no longer identifies the row either.
        session.expire_attributes(node, &["parent_id"]).unwrap();
        session.set(node, "parent_id", Value::BigInt(6)).unwrap();
        unwrap_outcome(session.flush(&cx).await);
        assert_eq!(
            conn.sql(),
            vec!["UPDATE \"nodes\" SET \"parent_id\" = $1 WHERE \"id\" = $2"]
        );
    });
}

#[test]
fn original_values_stale_update_rolls_back() {
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let mut session = Session::new(conn.clone(), checked_nodes());

    run(async {
        let node = load_node(&mut session, 1, "a", Value::Null);
        session.set(node, "name", "b").unwrap();
        conn.stale_on("UPDATE \"nodes\"");

        let err = expect_err(session.flush(&cx).await);
        assert!(matches!(&err, Error::StaleData(s) if s.operation == "UPDATE"), "got {err}");
        assert_eq!(conn.log().last().map(String::as_str), Some("ROLLBACK"));
        assert_eq!(session.value(node, "name").unwrap(), &Value::from("a"));
        assert_eq!(session.state_of(node).unwrap(), InstanceState::Persistent);
    });
}

#[test]
fn original_values_stale_delete_keeps_instance() {
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let mut session = Session::new(conn.clone(), checked_nodes());

    run(async {
        let node = load_node(&mut session, 1, "a", Value::Null);
        session.delete(node).unwrap();
        conn.stale_on("DELETE");

        let err = expect_err(session.flush(&cx).await);
        assert!(matches!(&err, Error::StaleData(s) if s.operation == "DELETE"), "got {err}");
        assert_eq!(
            conn.sql(),
            vec!["DELETE FROM \"nodes\" WHERE \"id\" = $1 AND \"name\" = $2 AND \"parent_id\" IS NULL"]
        );
        assert_eq!(session.state_of(node).unwrap(), InstanceState::Persistent);
    });
}

#[test]
fn nulled_foreign_key_is_not_matched_on_delete() {
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let mut session = Session::new(conn.clone(), checked_nodes());

    run(async {
        let a = load_node(&mut session, 1, "a", Value::BigInt(2));
        let b = load_node(&mut session, 2, "b", Value::BigInt(1));
        session.delete(a).unwrap();
        session.delete(b).unwrap();

        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.deleted, 2);

        let statements = conn.statements();
        assert_eq!(
            statements[0].sql,
            "UPDATE \"nodes\" SET \"parent_id\" = $1 WHERE \"id\" = $2"
        );
        assert_eq!(statements[0].params[0], Value::Null);

        // The nulled row is matched on NULL, the other on its loaded parent.
        let deletes: Vec<&str> = statements[1..].iter().map(|s| s.sql.as_str()).collect();
        assert!(deletes.iter().all(|sql| sql.starts_with("DELETE FROM \"nodes\"")));
        let joined = deletes.join(" ");
        assert_eq!(joined.matches("\"parent_id\" IS NULL").count(), 1);
        assert_eq!(joined.matches("\"parent_id\" = $").count(), 1);

        assert_eq!(session.state_of(a).unwrap(), InstanceState::Detached);
        assert_eq!(session.state_of(b).unwrap(), InstanceState::Detached);
    });
}
