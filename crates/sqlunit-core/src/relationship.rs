//! Relationship metadata.
//!
//! Relationships are declared as static metadata next to the columns of a
//! mapper. The registry resolves them into column indices at build time;
//! the session reads them to maintain both sides of a link, walk cascades,
//! and derive foreign-key dependencies for the flush graph.

use std::fmt;

/// The type of relationship between two entities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RelationshipKind {
    /// One-to-one: `User` has one `Profile`.
    OneToOne,
    /// Many-to-one: many `Order`s belong to one `Customer`.
    #[default]
    ManyToOne,
    /// One-to-many: one `Customer` has many `Order`s.
    OneToMany,
    /// Many-to-many: `Post`s have many `Tag`s via a link table.
    ManyToMany,
}

impl RelationshipKind {
    /// Whether the relationship holds a collection rather than one reference.
    pub const fn is_collection(self) -> bool {
        matches!(self, RelationshipKind::OneToMany | RelationshipKind::ManyToMany)
    }
}

/// Passive delete behavior for relationships.
///
/// Controls whether deleting a parent makes the session null out or delete
/// the children it knows about, or leaves that to `ON DELETE` in the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PassiveDeletes {
    /// The session nulls or deletes related rows itself (default).
    #[default]
    Active,
    /// The store's `ON DELETE` rule handles children; no statement is emitted
    /// for children that are not themselves marked deleted.
    Passive,
}

/// Information about a link/join table for many-to-many relationships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTableInfo {
    /// The link table name (e.g., `"post_tags"`).
    pub table_name: &'static str,

    /// Column in link table pointing to the local entity (e.g., `"post_id"`).
    pub local_column: &'static str,

    /// Column in link table pointing to the remote entity (e.g., `"tag_id"`).
    pub remote_column: &'static str,

    /// Composite local key columns (for composite PK parents).
    ///
    /// If set, this takes precedence over `local_column`.
    pub local_columns: Option<&'static [&'static str]>,

    /// Composite remote key columns (for composite PK targets).
    ///
    /// If set, this takes precedence over `remote_column`.
    pub remote_columns: Option<&'static [&'static str]>,
}

impl LinkTableInfo {
    /// Create a new link-table definition.
    #[must_use]
    pub const fn new(
        table_name: &'static str,
        local_column: &'static str,
        remote_column: &'static str,
    ) -> Self {
        Self {
            table_name,
            local_column,
            remote_column,
            local_columns: None,
            remote_columns: None,
        }
    }

    /// Create a new composite link-table definition.
    ///
    /// Column order must match the primary key ordering of each side.
    #[must_use]
    pub const fn composite(
        table_name: &'static str,
        local_columns: &'static [&'static str],
        remote_columns: &'static [&'static str],
    ) -> Self {
        Self {
            table_name,
            local_column: "",
            remote_column: "",
            local_columns: Some(local_columns),
            remote_columns: Some(remote_columns),
        }
    }

    /// Return the local key columns (single or composite).
    #[must_use]
    pub fn local_cols(&self) -> &[&'static str] {
        if let Some(cols) = self.local_columns {
            return cols;
        }
        if self.local_column.is_empty() {
            return &[];
        }
        std::slice::from_ref(&self.local_column)
    }

    /// Return the remote key columns (single or composite).
    #[must_use]
    pub fn remote_cols(&self) -> &[&'static str] {
        if let Some(cols) = self.remote_columns {
            return cols;
        }
        if self.remote_column.is_empty() {
            return &[];
        }
        std::slice::from_ref(&self.remote_column)
    }
}

/// Metadata about a relationship between entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationshipInfo {
    /// Name of the relationship attribute.
    pub name: &'static str,

    /// Entity name of the related mapper.
    pub target: &'static str,

    /// Kind of relationship.
    pub kind: RelationshipKind,

    /// Local foreign key column (ManyToOne / OneToOne owning side).
    /// e.g., `"customer_id"` on `Order`.
    pub local_key: Option<&'static str>,

    /// Composite local foreign key columns.
    ///
    /// If set, this takes precedence over `local_key`.
    pub local_keys: Option<&'static [&'static str]>,

    /// Remote foreign key column (OneToMany / OneToOne inverse side).
    /// e.g., `"customer_id"` on `Order` when accessed from `Customer`.
    pub remote_key: Option<&'static str>,

    /// Composite remote foreign key columns.
    ///
    /// If set, this takes precedence over `remote_key`.
    pub remote_keys: Option<&'static [&'static str]>,

    /// Link table for ManyToMany relationships.
    pub link_table: Option<LinkTableInfo>,

    /// The relationship on the target entity that points back.
    pub back_populates: Option<&'static str>,

    /// Cascade options string (e.g., `"all, delete-orphan"`).
    ///
    /// `None` means the default `"save-update, merge"`.
    pub cascade: Option<&'static str>,

    /// Write the foreign key with a separate UPDATE after both rows exist.
    pub post_update: bool,

    /// Passive delete behavior.
    pub passive_deletes: PassiveDeletes,
}

impl RelationshipInfo {
    /// Create a new relationship with required fields.
    #[must_use]
    pub const fn new(name: &'static str, target: &'static str, kind: RelationshipKind) -> Self {
        Self {
            name,
            target,
            kind,
            local_key: None,
            local_keys: None,
            remote_key: None,
            remote_keys: None,
            link_table: None,
            back_populates: None,
            cascade: None,
            post_update: false,
            passive_deletes: PassiveDeletes::Active,
        }
    }

    /// Return the local key columns for this relationship (empty slice if unset).
    #[must_use]
    pub fn local_key_cols(&self) -> &[&'static str] {
        if let Some(keys) = self.local_keys {
            return keys;
        }
        match &self.local_key {
            Some(key) => std::slice::from_ref(key),
            None => &[],
        }
    }

    /// Return the remote key columns for this relationship (empty slice if unset).
    #[must_use]
    pub fn remote_key_cols(&self) -> &[&'static str] {
        if let Some(keys) = self.remote_keys {
            return keys;
        }
        match &self.remote_key {
            Some(key) => std::slice::from_ref(key),
            None => &[],
        }
    }

    /// Set the local foreign key column.
    #[must_use]
    pub const fn local_key(mut self, key: &'static str) -> Self {
        self.local_key = Some(key);
        self.local_keys = None;
        self
    }

    /// Set composite local foreign key columns.
    ///
    /// The column order must match the target primary key ordering.
    #[must_use]
    pub const fn local_keys(mut self, keys: &'static [&'static str]) -> Self {
        self.local_keys = Some(keys);
        self.local_key = None;
        self
    }

    /// Set the remote foreign key column.
    #[must_use]
    pub const fn remote_key(mut self, key: &'static str) -> Self {
        self.remote_key = Some(key);
        self.remote_keys = None;
        self
    }

    /// Set composite remote foreign key columns.
    ///
    /// The column order must match the source primary key ordering.
    #[must_use]
    pub const fn remote_keys(mut self, keys: &'static [&'static str]) -> Self {
        self.remote_keys = Some(keys);
        self.remote_key = None;
        self
    }

    /// Set the link table metadata (ManyToMany).
    #[must_use]
    pub const fn link_table(mut self, info: LinkTableInfo) -> Self {
        self.link_table = Some(info);
        self
    }

    /// Set the back-populates relationship name.
    #[must_use]
    pub const fn back_populates(mut self, name: &'static str) -> Self {
        self.back_populates = Some(name);
        self
    }

    /// Set cascade options string.
    #[must_use]
    pub const fn cascade(mut self, opts: &'static str) -> Self {
        self.cascade = Some(opts);
        self
    }

    /// Enable/disable post-update for the foreign key of this relationship.
    #[must_use]
    pub const fn post_update(mut self, value: bool) -> Self {
        self.post_update = value;
        self
    }

    /// Set passive delete behavior.
    #[must_use]
    pub const fn passive_deletes(mut self, value: PassiveDeletes) -> Self {
        self.passive_deletes = value;
        self
    }
}

/// Parsed cascade options for one relationship.
///
/// Parsed from the comma separated option string: `save-update`, `merge`,
/// `delete`, `delete-orphan`, `expunge`, `refresh-expire`, `all` and `none`.
/// `all` expands to every option except `delete-orphan`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Cascade {
    pub save_update: bool,
    pub merge: bool,
    pub delete: bool,
    pub delete_orphan: bool,
    pub expunge: bool,
    pub refresh_expire: bool,
}

impl Cascade {
    pub const NONE: Cascade = Cascade {
        save_update: false,
        merge: false,
        delete: false,
        delete_orphan: false,
        expunge: false,
        refresh_expire: false,
    };

    pub const ALL: Cascade = Cascade {
        save_update: true,
        merge: true,
        delete: true,
        delete_orphan: false,
        expunge: true,
        refresh_expire: true,
    };

    /// Parse an options string. `None` yields the default `save-update, merge`.
    pub fn parse(opts: Option<&str>) -> Result<Cascade, String> {
        let Some(opts) = opts else {
            return Ok(Cascade::default());
        };

        let mut cascade = Cascade::NONE;
        for token in opts.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token {
                "all" => {
                    let orphan = cascade.delete_orphan;
                    cascade = Cascade::ALL;
                    cascade.delete_orphan = orphan;
                }
                "none" => {}
                "save-update" => cascade.save_update = true,
                "merge" => cascade.merge = true,
                "delete" => cascade.delete = true,
                "delete-orphan" => cascade.delete_orphan = true,
                "expunge" => cascade.expunge = true,
                "refresh-expire" => cascade.refresh_expire = true,
                other => return Err(format!("invalid cascade option '{}'", other)),
            }
        }

        if cascade.delete_orphan && !cascade.delete {
            return Err("the 'delete-orphan' cascade option requires 'delete'".to_string());
        }
        Ok(cascade)
    }
}

impl Default for Cascade {
    fn default() -> Self {
        Cascade {
            save_update: true,
            merge: true,
            ..Cascade::NONE
        }
    }
}

impl fmt::Display for Cascade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (self.save_update, "save-update"),
            (self.merge, "merge"),
            (self.delete, "delete"),
            (self.delete_orphan, "delete-orphan"),
            (self.expunge, "expunge"),
            (self.refresh_expire, "refresh-expire"),
        ];
        let enabled: Vec<&str> = names.iter().filter(|(on, _)| *on).map(|(_, n)| *n).collect();
        if enabled.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", enabled.join(", "))
        }
    }
}
