//! Column definitions.

/// Metadata about a mapped column.
///
/// Built with `const fn` setters so mappers can be declared as statics:
///
/// ```
/// use sqlunit_core::FieldInfo;
///
/// const ID: FieldInfo = FieldInfo::new("id").primary_key(true).auto_increment(true);
/// const PARENT: FieldInfo = FieldInfo::new("parent_id").nullable(true);
/// assert!(ID.primary_key && PARENT.nullable);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    /// Attribute name used by the session API
    pub name: &'static str,
    /// Database column name (may differ from the attribute name)
    pub column_name: &'static str,
    /// Whether this column accepts NULL
    pub nullable: bool,
    /// Whether this column is part of the primary key
    pub primary_key: bool,
    /// Whether the database generates this column's value on insert
    pub auto_increment: bool,
    /// Whether this column is the optimistic-concurrency version counter
    pub version: bool,
}

impl FieldInfo {
    /// Create a new non-nullable column whose column name equals `name`.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            column_name: name,
            nullable: false,
            primary_key: false,
            auto_increment: false,
            version: false,
        }
    }

    /// Set the database column name.
    pub const fn column(mut self, name: &'static str) -> Self {
        self.column_name = name;
        self
    }

    /// Set nullable flag.
    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Set primary key flag.
    pub const fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        self
    }

    /// Set auto-increment flag.
    pub const fn auto_increment(mut self, value: bool) -> Self {
        self.auto_increment = value;
        self
    }

    /// Mark this column as the version counter.
    ///
    /// Updates and deletes include the loaded version in their WHERE clause
    /// and updates write `version + 1`.
    pub const fn version(mut self, value: bool) -> Self {
        self.version = value;
        self
    }
}
