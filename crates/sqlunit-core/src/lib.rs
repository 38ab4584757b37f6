//! Core types and traits for sqlunit.
//!
//! This crate provides the foundations the unit-of-work engine is built on:
//!
//! - `Value` and `Row` for dynamic column data
//! - `Error` and the `Result` alias
//! - `FieldInfo`, `RelationshipInfo` and the `MapperRegistry` for static metadata
//! - `Connection` and `StatementCompiler`, the two external collaborators
//! - `Model` for typed structs
//! - `Outcome` and `Cx` re-exported from asupersync for cancel-correct operations

pub use asupersync::{Cx, Outcome};

pub mod compile;
pub mod connection;
pub mod error;
pub mod field;
pub mod identifiers;
pub mod mapper;
pub mod model;
pub mod relationship;
pub mod row;
pub mod value;

pub use compile::{DialectCompiler, StatementCompiler, WriteOp};
pub use connection::{Connection, Dialect, ExecuteResult, Statement, TransactionId};
pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, CycleMember, DependencyCycleError, Error,
    ExpiredError, IdentityConflictError, InvalidRequestError, QueryError, QueryErrorKind, Result,
    StaleDataError, TransactionError, TransactionErrorKind, TypeError,
};
pub use field::FieldInfo;
pub use identifiers::is_valid_identifier;
pub use mapper::{ConcurrencyCheck, Join, Mapper, MapperRegistry, RegistryBuilder, Relation};
pub use model::Model;
pub use relationship::{Cascade, LinkTableInfo, PassiveDeletes, RelationshipInfo, RelationshipKind};
pub use row::{ColumnInfo, Row};
pub use value::{Value, format_key, hash_values, keys_equal};
