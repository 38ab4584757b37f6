//! Error types for sqlunit operations.

use std::fmt;

/// The primary error type for all sqlunit operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, disconnect, lost transaction)
    Connection(ConnectionError),
    /// Statement execution errors reported by the backing store
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction protocol errors (no active transaction, bad savepoint)
    Transaction(TransactionError),
    /// Invalid mapper or relationship metadata
    Config(ConfigError),
    /// Two distinct instances claim the same identity
    IdentityConflict(IdentityConflictError),
    /// The flush graph contains a cycle no postponable edge can break
    DependencyCycle(DependencyCycleError),
    /// An UPDATE or DELETE matched fewer rows than expected
    StaleData(StaleDataError),
    /// The caller asked for an operation the instance's state does not allow
    InvalidRequest(InvalidRequestError),
    /// An expired attribute was read before being refreshed
    Expired(ExpiredError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// Connection is closed
    Closed,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// No transaction is active
    NotActive,
    /// A transaction is already open on the session
    AlreadyActive,
    /// Savepoint not found
    SavepointNotFound,
    /// The transaction was rolled back by an earlier failure
    Inactive,
}

#[derive(Debug)]
pub struct ConfigError {
    /// Entity whose mapper failed validation, when known
    pub entity: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone)]
pub struct IdentityConflictError {
    pub entity: String,
    /// Rendered primary key, e.g. `(1, 'a')`
    pub key: String,
}

/// One participant in an unresolvable cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleMember {
    pub entity: String,
    pub operation: &'static str,
    /// Rendered identity, `<pending>` for rows without a key yet
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct DependencyCycleError {
    pub members: Vec<CycleMember>,
}

#[derive(Debug, Clone)]
pub struct StaleDataError {
    pub table: String,
    pub operation: &'static str,
    pub expected: u64,
    pub actual: u64,
    pub sql: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InvalidRequestError {
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ExpiredError {
    pub entity: String,
    pub attribute: String,
}

impl Error {
    /// Is this a retryable error (deadlock, serialization, stale data)?
    ///
    /// A stale-data failure can succeed after the caller re-reads fresh state.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization
            ),
            Error::StaleData(_) => true,
            _ => false,
        }
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            Error::StaleData(s) => s.sql.as_deref(),
            _ => None,
        }
    }

    /// Shorthand for [`Error::InvalidRequest`].
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Error::InvalidRequest(InvalidRequestError {
            message: message.into(),
        })
    }

    /// Shorthand for [`Error::Config`] naming the offending entity.
    pub fn config(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            entity: Some(entity.into()),
            message: message.into(),
            source: None,
        })
    }

    /// Shorthand for [`Error::Transaction`].
    pub fn transaction(kind: TransactionErrorKind, message: impl Into<String>) -> Self {
        Error::Transaction(TransactionError {
            kind,
            message: message.into(),
        })
    }
}

impl QueryError {
    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23503")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e),
            Error::IdentityConflict(e) => write!(f, "Identity conflict: {}", e),
            Error::DependencyCycle(e) => write!(f, "Unresolvable dependency cycle: {}", e),
            Error::StaleData(e) => write!(f, "Stale data: {}", e),
            Error::InvalidRequest(e) => write!(f, "Invalid request: {}", e.message),
            Error::Expired(e) => write!(f, "Expired: {}", e),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity {
            Some(entity) => write!(f, "{}: {}", entity, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for IdentityConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "another instance with key {} is already present for '{}'",
            self.key, self.entity
        )
    }
}

impl fmt::Display for CycleMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}{}", self.operation, self.entity, self.key)
    }
}

impl fmt::Display for DependencyCycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, member) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, " -> ")?;
            }
            write!(f, "{}", member)?;
        }
        Ok(())
    }
}

impl fmt::Display for StaleDataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on table '{}' expected to match {} row(s); {} matched",
            self.operation, self.table, self.expected, self.actual
        )
    }
}

impl fmt::Display for ExpiredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attribute '{}' of '{}' is expired and must be reloaded",
            self.attribute, self.entity
        )
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<StaleDataError> for Error {
    fn from(err: StaleDataError) -> Self {
        Error::StaleData(err)
    }
}

/// Result type alias for sqlunit operations.
pub type Result<T> = std::result::Result<T, Error>;
