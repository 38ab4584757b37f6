//! Model trait for typed struct mapping.
//!
//! The session works on dynamic instances, one `Value` per mapped column.
//! A `Model` describes a Rust struct with the same metadata so it can be
//! registered, added to a session and materialized back from instance state.

use crate::Result;
use crate::field::FieldInfo;
use crate::relationship::RelationshipInfo;
use crate::row::Row;
use crate::value::Value;

/// Trait for types that can be mapped to database tables.
///
/// # Example
///
/// ```
/// use sqlunit_core::{FieldInfo, Model, Result, Row, Value};
///
/// struct Tag {
///     id: Option<i64>,
///     label: String,
/// }
///
/// impl Model for Tag {
///     const TABLE_NAME: &'static str = "tags";
///     const PRIMARY_KEY: &'static [&'static str] = &["id"];
///
///     fn fields() -> &'static [FieldInfo] {
///         static FIELDS: [FieldInfo; 2] = [
///             FieldInfo::new("id").primary_key(true).auto_increment(true),
///             FieldInfo::new("label"),
///         ];
///         &FIELDS
///     }
///
///     fn to_row(&self) -> Vec<(&'static str, Value)> {
///         vec![("id", self.id.into()), ("label", self.label.clone().into())]
///     }
///
///     fn from_row(row: &Row) -> Result<Self> {
///         Ok(Tag {
///             id: row.get_named("id")?,
///             label: row.get_named("label")?,
///         })
///     }
/// }
///
/// assert_eq!(Tag::ENTITY_NAME, "tags");
/// ```
pub trait Model: Sized + Send + Sync {
    /// The name of the database table.
    const TABLE_NAME: &'static str;

    /// Entity name used by the mapper registry.
    const ENTITY_NAME: &'static str = Self::TABLE_NAME;

    /// The primary key attribute name(s).
    const PRIMARY_KEY: &'static [&'static str];

    /// Get field metadata for all columns.
    fn fields() -> &'static [FieldInfo];

    /// Relationship metadata for this model.
    fn relationships() -> &'static [RelationshipInfo] {
        &[]
    }

    /// Convert this model instance to `(attribute, value)` pairs.
    fn to_row(&self) -> Vec<(&'static str, Value)>;

    /// Construct a model instance from a row keyed by attribute name.
    #[allow(clippy::result_large_err)]
    fn from_row(row: &Row) -> Result<Self>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::Mapper;

    struct Note {
        id: Option<i64>,
        body: String,
    }

    impl Model for Note {
        const TABLE_NAME: &'static str = "notes";
        const ENTITY_NAME: &'static str = "Note";
        const PRIMARY_KEY: &'static [&'static str] = &["id"];

        fn fields() -> &'static [FieldInfo] {
            static FIELDS: [FieldInfo; 2] = [
                FieldInfo::new("id").primary_key(true).auto_increment(true),
                FieldInfo::new("body"),
            ];
            &FIELDS
        }

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            vec![("id", self.id.into()), ("body", self.body.clone().into())]
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Note {
                id: row.get_named("id")?,
                body: row.get_named("body")?,
            })
        }
    }

    #[test]
    fn test_mapper_from_model() {
        let mapper = Mapper::for_model::<Note>();
        assert_eq!(mapper.entity(), "Note");
        assert_eq!(mapper.table(), "notes");
        assert_eq!(mapper.field_count(), 2);
    }

    #[test]
    fn test_row_round_trip_through_model() {
        let note = Note {
            id: None,
            body: "hi".into(),
        };
        let row = Row::from_pairs(note.to_row());
        let back = Note::from_row(&row).unwrap();
        assert_eq!(back.id, None);
        assert_eq!(back.body, "hi");
    }
}
