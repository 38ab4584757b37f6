//! sqlunit - unit-of-work persistence for Rust.
//!
//! sqlunit tracks entity instances in a [`Session`] and writes their
//! changes back in one ordered flush:
//!
//! - An identity map keeps exactly one instance per primary key
//! - Change tracking diffs every instance against its last-flushed baseline
//! - The flush engine builds a dependency graph from relationship metadata,
//!   orders it topologically and batches same-table statements
//! - Failed flushes and rollbacks restore in-memory state exactly
//!
//! # Quick Start
//!
//! ```ignore
//! use sqlunit::prelude::*;
//!
//! let mut registry = RegistryBuilder::new();
//! registry.register(
//!     Mapper::new("Team", "teams")
//!         .field(FieldInfo::new("id").primary_key(true).auto_increment(true))
//!         .field(FieldInfo::new("name"))
//!         .relationship(
//!             RelationshipInfo::new("heroes", "Hero", RelationshipKind::OneToMany)
//!                 .remote_key("team_id")
//!                 .back_populates("team")
//!                 .cascade("all, delete-orphan"),
//!         ),
//! )?;
//! registry.register(
//!     Mapper::new("Hero", "heroes")
//!         .field(FieldInfo::new("id").primary_key(true).auto_increment(true))
//!         .field(FieldInfo::new("name"))
//!         .field(FieldInfo::new("team_id").nullable(true))
//!         .relationship(
//!             RelationshipInfo::new("team", "Team", RelationshipKind::ManyToOne)
//!                 .local_key("team_id")
//!                 .back_populates("heroes"),
//!         ),
//! )?;
//!
//! let mut session = Session::new(conn, registry.build()?);
//! let team = session.create_with("Team", &[("name", "Avengers".into())])?;
//! let hero = session.create_with("Hero", &[("name", "Thor".into())])?;
//! session.append_related(team, "heroes", hero)?;
//! session.add(team)?;
//!
//! // INSERT INTO "teams" ... RETURNING "id"
//! // INSERT INTO "heroes" ("name", "team_id") ...
//! session.commit(&cx).await;
//! ```

pub use sqlunit_core::{
    Cascade, ConcurrencyCheck, Connection, Cx, Dialect, DialectCompiler, Error, ExecuteResult,
    FieldInfo, LinkTableInfo, Mapper, MapperRegistry, Model, Outcome, PassiveDeletes,
    RegistryBuilder, RelationshipInfo, RelationshipKind, Result, Row, Statement,
    StatementCompiler, TransactionId, Value, WriteOp,
};
pub use sqlunit_core::{
    CycleMember, DependencyCycleError, IdentityConflictError, StaleDataError,
    TransactionErrorKind,
};

pub use sqlunit_session::{
    ChangeSet, FlushPlan, FlushResult, FlushStep, InstanceId, InstanceState, OpKind, Session,
    SessionConfig, SessionDebugInfo, SessionEvent,
};

/// Crates re-exported for direct access to everything they define.
pub use sqlunit_core as core;
pub use sqlunit_session as session;

/// Everything needed to declare mappings and run a session.
pub mod prelude {
    pub use crate::{
        Connection, Cx, Error, FieldInfo, FlushResult, InstanceId, InstanceState, LinkTableInfo,
        Mapper, Model, Outcome, RegistryBuilder, RelationshipInfo, RelationshipKind, Result, Row,
        Session, SessionConfig, Value,
    };
}
