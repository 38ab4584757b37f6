//! Mapper metadata and the frozen mapper registry.
//!
//! A [`Mapper`] binds an entity name to its table, columns, primary key and
//! relationships. Mappers are collected in a [`RegistryBuilder`], which
//! validates each one locally on `register` and cross-checks relationships
//! on `build`. The resulting [`MapperRegistry`] is immutable and shared
//! behind an `Arc` by every session.

use crate::error::{Error, Result};
use crate::field::FieldInfo;
use crate::identifiers::is_valid_identifier;
use crate::model::Model;
use crate::relationship::{Cascade, PassiveDeletes, RelationshipInfo, RelationshipKind};
use std::collections::HashMap;
use std::sync::Arc;

/// Optimistic concurrency policy for UPDATE and DELETE statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyCheck {
    /// Only the primary key is matched.
    #[default]
    None,
    /// The version column is matched and incremented on update.
    Version,
    /// The loaded values of every non-key column are matched.
    OriginalValues,
}

/// How the two sides of a relationship are joined, resolved to column indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Join {
    /// `source.fields[fk[i]]` references `target.primary_key[i]`.
    Local { fk: Vec<usize> },
    /// `target.fields[fk[i]]` references `source.primary_key[i]`.
    Remote { fk: Vec<usize> },
    /// Rows in an association table reference both primary keys.
    Link {
        table: &'static str,
        local: Vec<&'static str>,
        remote: Vec<&'static str>,
    },
}

/// A relationship after registry resolution.
#[derive(Debug, Clone)]
pub struct Relation {
    pub info: RelationshipInfo,
    /// Position in the owning mapper's relationship list.
    pub index: usize,
    pub join: Join,
    pub cascade: Cascade,
    /// Index of the `back_populates` relation on the target mapper.
    pub back: Option<usize>,
    /// Whether every foreign key column of the join accepts NULL.
    pub fk_nullable: bool,
}

impl Relation {
    pub fn name(&self) -> &'static str {
        self.info.name
    }

    pub fn target(&self) -> &'static str {
        self.info.target
    }

    pub fn is_collection(&self) -> bool {
        self.info.kind.is_collection()
    }

    /// Whether a dependency through this relation may be deferred to a
    /// follow-up UPDATE to break a cycle.
    pub fn is_postponable(&self) -> bool {
        self.info.post_update || self.fk_nullable
    }

    pub fn is_passive_delete(&self) -> bool {
        self.info.passive_deletes == PassiveDeletes::Passive
    }
}

/// Static description of one mapped entity.
#[derive(Debug, Clone)]
pub struct Mapper {
    entity: &'static str,
    table: &'static str,
    fields: Vec<FieldInfo>,
    relationships: Vec<RelationshipInfo>,
    explicit_pk: Option<&'static [&'static str]>,
    check_original_values: bool,
    primary_key: Vec<usize>,
    generated_key: Option<usize>,
    version_column: Option<usize>,
    relations: Vec<Relation>,
}

impl Mapper {
    pub fn new(entity: &'static str, table: &'static str) -> Self {
        Self {
            entity,
            table,
            fields: Vec::new(),
            relationships: Vec::new(),
            explicit_pk: None,
            check_original_values: false,
            primary_key: Vec::new(),
            generated_key: None,
            version_column: None,
            relations: Vec::new(),
        }
    }

    /// Build a mapper from a typed model's metadata.
    pub fn for_model<M: Model>() -> Self {
        Self::new(M::ENTITY_NAME, M::TABLE_NAME)
            .fields(M::fields())
            .relationships(M::relationships())
            .primary_key(M::PRIMARY_KEY)
    }

    #[must_use]
    pub fn field(mut self, field: FieldInfo) -> Self {
        self.fields.push(field);
        self
    }

    #[must_use]
    pub fn fields(mut self, fields: &[FieldInfo]) -> Self {
        self.fields.extend_from_slice(fields);
        self
    }

    #[must_use]
    pub fn relationship(mut self, rel: RelationshipInfo) -> Self {
        self.relationships.push(rel);
        self
    }

    #[must_use]
    pub fn relationships(mut self, rels: &[RelationshipInfo]) -> Self {
        self.relationships.extend_from_slice(rels);
        self
    }

    /// Declare the primary key by attribute name, overriding field flags.
    #[must_use]
    pub fn primary_key(mut self, names: &'static [&'static str]) -> Self {
        self.explicit_pk = if names.is_empty() { None } else { Some(names) };
        self
    }

    /// Match the loaded values of all non-key columns on UPDATE and DELETE.
    #[must_use]
    pub fn check_original_values(mut self, value: bool) -> Self {
        self.check_original_values = value;
        self
    }

    pub fn entity(&self) -> &'static str {
        self.entity
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn field_infos(&self) -> &[FieldInfo] {
        &self.fields
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn column_name(&self, index: usize) -> &'static str {
        self.fields[index].column_name
    }

    /// Index of a field by attribute name.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Index of a field by column name.
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.column_name == column)
    }

    /// Primary key field indices, in key order.
    pub fn primary_key_indices(&self) -> &[usize] {
        &self.primary_key
    }

    pub fn is_primary_key(&self, index: usize) -> bool {
        self.primary_key.contains(&index)
    }

    /// Field index of the store-generated key column, if any.
    pub fn generated_key(&self) -> Option<usize> {
        self.generated_key
    }

    pub fn version_column(&self) -> Option<usize> {
        self.version_column
    }

    pub fn concurrency(&self) -> ConcurrencyCheck {
        if self.version_column.is_some() {
            ConcurrencyCheck::Version
        } else if self.check_original_values {
            ConcurrencyCheck::OriginalValues
        } else {
            ConcurrencyCheck::None
        }
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    pub fn relation(&self, index: usize) -> &Relation {
        &self.relations[index]
    }

    pub fn relation_index(&self, name: &str) -> Option<usize> {
        self.relations.iter().position(|r| r.info.name == name)
    }

    fn validate_local(&mut self) -> Result<()> {
        let entity = self.entity;
        if !is_valid_identifier(entity) {
            return Err(Error::config(entity, "entity name is not a valid identifier"));
        }
        if !is_valid_identifier(self.table) {
            return Err(Error::config(
                entity,
                format!("table name '{}' is not a valid identifier", self.table),
            ));
        }
        if self.fields.is_empty() {
            return Err(Error::config(entity, "mapper has no columns"));
        }

        for (i, f) in self.fields.iter().enumerate() {
            if !is_valid_identifier(f.name) || !is_valid_identifier(f.column_name) {
                return Err(Error::config(
                    entity,
                    format!("column '{}' is not a valid identifier", f.column_name),
                ));
            }
            let dup = self.fields[..i]
                .iter()
                .any(|o| o.name == f.name || o.column_name == f.column_name);
            if dup {
                return Err(Error::config(
                    entity,
                    format!("column '{}' is mapped twice", f.name),
                ));
            }
        }

        self.primary_key = match self.explicit_pk {
            Some(names) => {
                let mut pk = Vec::with_capacity(names.len());
                for name in names {
                    let idx = self
                        .field_index(name)
                        .or_else(|| self.column_index(name))
                        .ok_or_else(|| {
                            Error::config(entity, format!("primary key column '{}' is not mapped", name))
                        })?;
                    pk.push(idx);
                }
                pk
            }
            None => self
                .fields
                .iter()
                .enumerate()
                .filter(|(_, f)| f.primary_key)
                .map(|(i, _)| i)
                .collect(),
        };
        if self.primary_key.is_empty() {
            return Err(Error::config(entity, "mapper has no primary key"));
        }

        let generated: Vec<usize> = self
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.auto_increment)
            .map(|(i, _)| i)
            .collect();
        self.generated_key = match generated.as_slice() {
            [] => None,
            [idx] if self.primary_key.contains(idx) => Some(*idx),
            [idx] => {
                return Err(Error::config(
                    entity,
                    format!(
                        "auto-increment column '{}' is not part of the primary key",
                        self.fields[*idx].name
                    ),
                ));
            }
            _ => {
                return Err(Error::config(entity, "more than one auto-increment column"));
            }
        };

        let versions: Vec<usize> = self
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.version)
            .map(|(i, _)| i)
            .collect();
        self.version_column = match versions.as_slice() {
            [] => None,
            [idx] if !self.primary_key.contains(idx) => Some(*idx),
            [_] => return Err(Error::config(entity, "version column cannot be a primary key")),
            _ => return Err(Error::config(entity, "more than one version column")),
        };

        for (i, rel) in self.relationships.iter().enumerate() {
            if !is_valid_identifier(rel.name) {
                return Err(Error::config(
                    entity,
                    format!("relationship name '{}' is not a valid identifier", rel.name),
                ));
            }
            if self.relationships[..i].iter().any(|o| o.name == rel.name) {
                return Err(Error::config(
                    entity,
                    format!("relationship '{}' is declared twice", rel.name),
                ));
            }
            if self.field_index(rel.name).is_some() {
                return Err(Error::config(
                    entity,
                    format!("relationship '{}' shadows a column", rel.name),
                ));
            }
        }
        Ok(())
    }
}

/// Collects and validates mappers before freezing them into a registry.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    mappers: Vec<Mapper>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a mapper on its own and add it to the builder.
    pub fn register(&mut self, mut mapper: Mapper) -> Result<&mut Self> {
        mapper.validate_local()?;
        if self.mappers.iter().any(|m| m.entity == mapper.entity) {
            return Err(Error::config(mapper.entity, "entity is already registered"));
        }
        tracing::debug!(
            entity = mapper.entity,
            table = mapper.table,
            columns = mapper.fields.len(),
            relationships = mapper.relationships.len(),
            "Registered mapper"
        );
        self.mappers.push(mapper);
        Ok(self)
    }

    /// Register the mapper of a typed model.
    pub fn register_model<M: Model>(&mut self) -> Result<&mut Self> {
        self.register(Mapper::for_model::<M>())
    }

    /// Resolve every relationship and freeze the registry.
    pub fn build(self) -> Result<Arc<MapperRegistry>> {
        let by_entity: HashMap<&'static str, usize> = self
            .mappers
            .iter()
            .enumerate()
            .map(|(i, m)| (m.entity, i))
            .collect();

        let mut resolved = Vec::with_capacity(self.mappers.len());
        for mapper in &self.mappers {
            let mut relations = Vec::with_capacity(mapper.relationships.len());
            for (index, info) in mapper.relationships.iter().enumerate() {
                let target_idx = by_entity.get(info.target).copied().ok_or_else(|| {
                    Error::config(
                        mapper.entity,
                        format!(
                            "relationship '{}' targets unregistered entity '{}'",
                            info.name, info.target
                        ),
                    )
                })?;
                let target = &self.mappers[target_idx];
                relations.push(resolve_relation(mapper, target, *info, index)?);
            }
            resolved.push(relations);
        }

        let mut mappers = self.mappers;
        for (mapper, relations) in mappers.iter_mut().zip(resolved) {
            mapper.relations = relations;
        }

        for i in 0..mappers.len() {
            for r in 0..mappers[i].relations.len() {
                let back = link_back_populates(&mappers, &by_entity, &mappers[i], r)?;
                mappers[i].relations[r].back = back;
            }
        }

        tracing::info!(mappers = mappers.len(), "Mapper registry built");
        Ok(Arc::new(MapperRegistry { mappers, by_entity }))
    }
}

fn resolve_relation(
    source: &Mapper,
    target: &Mapper,
    info: RelationshipInfo,
    index: usize,
) -> Result<Relation> {
    let entity = source.entity;
    let local = info.local_key_cols();
    let remote = info.remote_key_cols();
    let err = |msg: String| Error::config(entity, format!("relationship '{}': {}", info.name, msg));

    if info.link_table.is_some() && info.kind != RelationshipKind::ManyToMany {
        return Err(err("only many-to-many relationships use a link table".into()));
    }

    let join = match info.kind {
        RelationshipKind::ManyToMany => {
            let Some(link) = info.link_table else {
                return Err(err("many-to-many requires a link table".into()));
            };
            if !local.is_empty() || !remote.is_empty() {
                return Err(err("many-to-many joins through the link table only".into()));
            }
            if !is_valid_identifier(link.table_name) {
                return Err(err(format!(
                    "link table '{}' is not a valid identifier",
                    link.table_name
                )));
            }
            let (lc, rc) = (link.local_cols(), link.remote_cols());
            if lc.len() != source.primary_key.len() || rc.len() != target.primary_key.len() {
                return Err(err(
                    "link table columns do not match the primary key arity".into(),
                ));
            }
            if let Some(bad) = lc.iter().chain(rc).find(|c| !is_valid_identifier(c)) {
                return Err(err(format!("link column '{}' is not a valid identifier", bad)));
            }
            Join::Link {
                table: link.table_name,
                local: lc.to_vec(),
                remote: rc.to_vec(),
            }
        }
        RelationshipKind::ManyToOne | RelationshipKind::OneToOne
            if !local.is_empty() && remote.is_empty() =>
        {
            Join::Local {
                fk: resolve_fk(source, local, target.primary_key.len()).map_err(err)?,
            }
        }
        RelationshipKind::OneToMany | RelationshipKind::OneToOne
            if local.is_empty() && !remote.is_empty() =>
        {
            Join::Remote {
                fk: resolve_fk(target, remote, source.primary_key.len()).map_err(err)?,
            }
        }
        RelationshipKind::ManyToOne => {
            return Err(err("many-to-one requires local key columns only".into()));
        }
        RelationshipKind::OneToMany => {
            return Err(err("one-to-many requires remote key columns only".into()));
        }
        RelationshipKind::OneToOne => {
            return Err(err(
                "one-to-one requires exactly one of local or remote key columns".into(),
            ));
        }
    };

    let cascade = Cascade::parse(info.cascade).map_err(err)?;
    if cascade.delete_orphan
        && matches!(
            info.kind,
            RelationshipKind::ManyToMany | RelationshipKind::ManyToOne
        )
    {
        return Err(err(
            "delete-orphan is only supported on one-to-many and one-to-one".into(),
        ));
    }

    let fk_nullable = match &join {
        Join::Local { fk } => fk.iter().all(|&i| source.fields[i].nullable),
        Join::Remote { fk } => fk.iter().all(|&i| target.fields[i].nullable),
        Join::Link { .. } => false,
    };

    Ok(Relation {
        info,
        index,
        join,
        cascade,
        back: None,
        fk_nullable,
    })
}

fn resolve_fk(
    owner: &Mapper,
    columns: &[&'static str],
    referenced_arity: usize,
) -> std::result::Result<Vec<usize>, String> {
    if columns.len() != referenced_arity {
        return Err(format!(
            "{} key column(s) cannot reference a {}-column primary key",
            columns.len(),
            referenced_arity
        ));
    }
    columns
        .iter()
        .map(|c| {
            owner
                .column_index(c)
                .ok_or_else(|| format!("column '{}' is not mapped on '{}'", c, owner.entity))
        })
        .collect()
}

fn link_back_populates(
    mappers: &[Mapper],
    by_entity: &HashMap<&'static str, usize>,
    source: &Mapper,
    rel_index: usize,
) -> Result<Option<usize>> {
    let rel = &source.relations[rel_index];
    let Some(back_name) = rel.info.back_populates else {
        return Ok(None);
    };
    let err = |msg: String| {
        Error::config(
            source.entity,
            format!("relationship '{}': {}", rel.info.name, msg),
        )
    };

    let target = by_entity
        .get(rel.info.target)
        .map(|&i| &mappers[i])
        .ok_or_else(|| err("target is not registered".into()))?;
    let back_idx = target
        .relation_index(back_name)
        .ok_or_else(|| err(format!("back_populates '{}' not found on '{}'", back_name, target.entity)))?;
    let back = &target.relations[back_idx];

    if back.info.target != source.entity {
        return Err(err(format!(
            "back_populates '{}' points to '{}', not '{}'",
            back_name, back.info.target, source.entity
        )));
    }
    if let Some(name) = back.info.back_populates {
        if name != rel.info.name {
            return Err(err(format!(
                "back_populates '{}' names '{}' as its inverse",
                back_name, name
            )));
        }
    }

    let kinds_match = matches!(
        (rel.info.kind, back.info.kind),
        (RelationshipKind::ManyToOne, RelationshipKind::OneToMany)
            | (RelationshipKind::OneToMany, RelationshipKind::ManyToOne)
            | (RelationshipKind::OneToOne, RelationshipKind::OneToOne)
            | (RelationshipKind::ManyToMany, RelationshipKind::ManyToMany)
    );
    if !kinds_match {
        return Err(err(format!(
            "cardinality {:?} cannot be the inverse of {:?}",
            rel.info.kind, back.info.kind
        )));
    }

    let joins_match = match (&rel.join, &back.join) {
        (Join::Local { fk: a }, Join::Remote { fk: b })
        | (Join::Remote { fk: a }, Join::Local { fk: b }) => a == b,
        (
            Join::Link {
                table: t1,
                local: l1,
                remote: r1,
            },
            Join::Link {
                table: t2,
                local: l2,
                remote: r2,
            },
        ) => t1 == t2 && l1 == r2 && r1 == l2,
        _ => false,
    };
    if !joins_match {
        return Err(err(format!(
            "join columns disagree with back_populates '{}'",
            back_name
        )));
    }

    Ok(Some(back_idx))
}

/// Immutable registry of resolved mappers.
#[derive(Debug)]
pub struct MapperRegistry {
    mappers: Vec<Mapper>,
    by_entity: HashMap<&'static str, usize>,
}

impl MapperRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn mapper(&self, entity: &str) -> Option<&Mapper> {
        self.by_entity.get(entity).map(|&i| &self.mappers[i])
    }

    /// Look up a mapper, failing with `InvalidRequest` for unknown entities.
    pub fn get(&self, entity: &str) -> Result<&Mapper> {
        self.mapper(entity)
            .ok_or_else(|| Error::invalid_request(format!("entity '{}' is not mapped", entity)))
    }

    pub fn mappers(&self) -> impl Iterator<Item = &Mapper> {
        self.mappers.iter()
    }

    pub fn len(&self) -> usize {
        self.mappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappers.is_empty()
    }
}
