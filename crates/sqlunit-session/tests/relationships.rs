//! Association rows, cascades and orphan handling.

mod common;

use asupersync::Cx;
use common::{MockConnection, expect_err, posts, row, run, teams, unwrap_outcome};
use sqlunit_core::{
    Error, FieldInfo, Mapper, MapperRegistry, PassiveDeletes, RegistryBuilder, RelationshipInfo,
    RelationshipKind, Value,
};
use sqlunit_session::{InstanceState, Session};
use std::sync::Arc;

fn passive_teams() -> Arc<MapperRegistry> {
    let mut b = RegistryBuilder::new();
    b.register(
        Mapper::new("Team", "teams")
            .field(FieldInfo::new("id").primary_key(true).auto_increment(true))
            .field(FieldInfo::new("name"))
            .relationship(
                RelationshipInfo::new("heroes", "Hero", RelationshipKind::OneToMany)
                    .remote_key("team_id")
                    .back_populates("team")
                    .passive_deletes(PassiveDeletes::Passive),
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

#[test]
fn association_rows_follow_both_inserts() {
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let mut session = Session::new(conn.clone(), posts());

    run(async {
        let post = session.create_with("Post", &[("title", "Hello".into())]).unwrap();
        let rust = session.create_with("Tag", &[("label", "rust".into())]).unwrap();
        let orm = session.create_with("Tag", &[("label", "orm".into())]).unwrap();
        session.append_related(post, "tags", rust).unwrap();
        session.append_related(post, "tags", orm).unwrap();
        assert_eq!(session.related(rust, "posts").unwrap(), vec![post]);
        session.add(post).unwrap();

        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.inserted, 3);
        assert_eq!(result.linked, 2);

        assert_eq!(
            conn.shape(),
            vec!["INSERT posts", "INSERT tags", "INSERT tags", "INSERT post_tags"]
        );
        let link = &conn.statements()[3];
        assert_eq!(
            link.sql,
            "INSERT INTO \"post_tags\" (\"post_id\", \"tag_id\") VALUES ($1, $2), ($3, $4)"
        );
        assert_eq!(
            link.params,
            vec![
                Value::BigInt(101),
                Value::BigInt(102),
                Value::BigInt(101),
                Value::BigInt(103)
            ]
        );
    });
}

#[test]
fn removing_association_deletes_one_link_row() {
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let mut session = Session::new(conn.clone(), posts());

    run(async {
        let post = session.create_with("Post", &[("title", "Hello".into())]).unwrap();
        let rust = session.create_with("Tag", &[("label", "rust".into())]).unwrap();
        let orm = session.create_with("Tag", &[("label", "orm".into())]).unwrap();
        session.append_related(post, "tags", rust).unwrap();
        session.append_related(post, "tags", orm).unwrap();
        session.add(post).unwrap();
        unwrap_outcome(session.flush(&cx).await);
        conn.clear();

        assert!(session.remove_related(post, "tags", rust).unwrap());
        assert!(session.related(rust, "posts").unwrap().is_empty());

        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.unlinked, 1);
        assert_eq!(
            conn.sql(),
            vec!["DELETE FROM \"post_tags\" WHERE \"post_id\" = $1 AND \"tag_id\" = $2"]
        );
        assert_eq!(
            conn.statements()[0].params,
            vec![Value::BigInt(101), Value::BigInt(102)]
        );
        assert_eq!(session.state_of(rust).unwrap(), InstanceState::Persistent);
    });
}

#[test]
fn deleting_linked_row_removes_its_links_first() {
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let mut session = Session::new(conn.clone(), posts());

    run(async {
        let post = session
            .load("Post", &row(&[("id", Value::BigInt(1)), ("title", "Hello".into())]))
            .unwrap();
        let tag = session
            .load("Tag", &row(&[("id", Value::BigInt(9)), ("label", "rust".into())]))
            .unwrap();
        // Association rows are not loaded with either row; link them as the
        // database already has them.
        session.append_related(post, "tags", tag).unwrap();
        unwrap_outcome(session.flush(&cx).await);
        conn.clear();

        session.delete(post).unwrap();
        unwrap_outcome(session.flush(&cx).await);
        assert_eq!(conn.shape(), vec!["DELETE post_tags", "DELETE posts"]);
        assert!(session.related(tag, "posts").unwrap().is_empty());
        assert!(!session.is_modified(tag).unwrap());
    });
}

#[test]
fn delete_cascades_to_children() {
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let mut session = Session::new(conn.clone(), teams("all, delete-orphan"));

    run(async {
        let team = session
            .load("Team", &row(&[("id", Value::BigInt(1)), ("name", "Avengers".into())]))
            .unwrap();
        let mut heroes = Vec::new();
        for (id, name) in [(7, "Thor"), (8, "Loki")] {
            heroes.push(
                session
                    .load(
                        "Hero",
                        &row(&[
                            ("id", Value::BigInt(id)),
                            ("name", name.into()),
                            ("team_id", Value::BigInt(1)),
                        ]),
                    )
                    .unwrap(),
            );
        }

        session.delete(team).unwrap();
        for &hero in &heroes {
            assert_eq!(session.state_of(hero).unwrap(), InstanceState::Deleted);
        }

        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.deleted, 3);
        assert_eq!(
            conn.sql(),
            vec![
                "DELETE FROM \"heroes\" WHERE \"id\" IN ($1, $2)",
                "DELETE FROM \"teams\" WHERE \"id\" = $1",
            ]
        );
        assert_eq!(
            conn.statements()[0].params,
            vec![Value::BigInt(7), Value::BigInt(8)]
        );
        assert_eq!(session.pending_delete_count(), 0);
        assert_eq!(session.tracked_count(), 0);
    });
}

#[test]
fn removed_child_is_deleted_as_orphan() {
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let mut session = Session::new(conn.clone(), teams("all, delete-orphan"));

    run(async {
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

        session.remove_related(team, "heroes", hero).unwrap();
        unwrap_outcome(session.flush(&cx).await);

        assert_eq!(conn.sql(), vec!["DELETE FROM \"heroes\" WHERE \"id\" = $1"]);
        assert_eq!(session.state_of(hero).unwrap(), InstanceState::Detached);
        assert_eq!(session.state_of(team).unwrap(), InstanceState::Persistent);
    });
}

#[test]
fn reparented_child_is_not_an_orphan() {
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let mut session = Session::new(conn.clone(), teams("all, delete-orphan"));

    run(async {
        let first = session
            .load("Team", &row(&[("id", Value::BigInt(1)), ("name", "A".into())]))
            .unwrap();
        let second = session
            .load("Team", &row(&[("id", Value::BigInt(2)), ("name", "B".into())]))
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

        session.append_related(second, "heroes", hero).unwrap();
        assert!(session.related(first, "heroes").unwrap().is_empty());

        unwrap_outcome(session.flush(&cx).await);
        assert_eq!(conn.shape(), vec!["UPDATE heroes"]);
        assert_eq!(session.state_of(hero).unwrap(), InstanceState::Persistent);
        assert_eq!(session.value(hero, "team_id").unwrap(), &Value::BigInt(2));
    });
}

#[test]
fn unreachable_related_instance_fails_flush() {
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let mut session = Session::new(conn.clone(), teams("merge"));

    run(async {
        let team = session.create_with("Team", &[("name", "Avengers".into())]).unwrap();
        let hero = session.create_with("Hero", &[("name", "Thor".into())]).unwrap();
        session.append_related(team, "heroes", hero).unwrap();
        session.add(team).unwrap();
        assert_eq!(session.state_of(hero).unwrap(), InstanceState::Transient);

        let err = expect_err(session.flush(&cx).await);
        assert!(matches!(err, Error::InvalidRequest(_)), "got {err}");
        assert!(err.to_string().contains("does not cascade save-update"));
        assert!(conn.log().is_empty());
    });
}

#[test]
fn passive_delete_leaves_children_to_the_database() {
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let mut session = Session::new(conn.clone(), passive_teams());

    run(async {
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

        session.delete(team).unwrap();
        unwrap_outcome(session.flush(&cx).await);

        assert_eq!(conn.sql(), vec!["DELETE FROM \"teams\" WHERE \"id\" = $1"]);
        assert_eq!(session.state_of(hero).unwrap(), InstanceState::Persistent);
        assert!(session.related(hero, "team").unwrap().is_empty());
    });
}
