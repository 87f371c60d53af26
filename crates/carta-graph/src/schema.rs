//! Entity schema registry.
//!
//! Each entity type is described by a closed schema: plain (synced) fields
//! with declared kinds, typed edges, cached/derived fields, and the index
//! definitions published for that type. The registry is validated once at
//! construction; shape checks are not repeated per access.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::GraphError;
use crate::fields::CachedFieldSpec;
use crate::index::IndexDefinition;

/// Declared kind of a plain field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    Int,
    Timestamp,
    Str,
    Id,
}

impl FieldKind {
    pub fn name(self) -> &'static str {
        match self {
            FieldKind::Bool => "bool",
            FieldKind::Int => "int",
            FieldKind::Timestamp => "timestamp",
            FieldKind::Str => "str",
            FieldKind::Id => "id",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub nullable: bool,
}

/// A typed, directional edge declared on the source entity type. The edge is
/// denormalized onto the destination node's inputs under the same name so
/// reverse traversal never scans.
#[derive(Debug, Clone)]
pub struct EdgeSpec {
    pub name: String,
    pub dst_types: Vec<String>,
}

#[derive(Debug)]
pub struct EntitySchema {
    pub name: String,
    pub fields: Vec<FieldSpec>,
    pub edges: Vec<EdgeSpec>,
    pub cached_fields: Vec<CachedFieldSpec>,
    pub indexes: Vec<IndexDefinition>,
}

impl EntitySchema {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: Vec::new(),
            edges: Vec::new(),
            cached_fields: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn field(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            kind,
            nullable: false,
        });
        self
    }

    pub fn nullable_field(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            kind,
            nullable: true,
        });
        self
    }

    pub fn edge(mut self, name: &str, dst_types: &[&str]) -> Self {
        self.edges.push(EdgeSpec {
            name: name.to_string(),
            dst_types: dst_types.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    pub fn cached(mut self, spec: CachedFieldSpec) -> Self {
        self.cached_fields.push(spec);
        self
    }

    pub fn index(mut self, def: IndexDefinition) -> Self {
        self.indexes.push(def);
        self
    }

    pub fn field_spec(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn edge_spec(&self, name: &str) -> Option<&EdgeSpec> {
        self.edges.iter().find(|e| e.name == name)
    }

    pub fn cached_field(&self, name: &str) -> Option<&CachedFieldSpec> {
        self.cached_fields.iter().find(|c| c.name == name)
    }

    /// True when `name` is resolvable on this type, either as a stored field
    /// or as a declared cached/derived field.
    pub fn has_field(&self, name: &str) -> bool {
        self.field_spec(name).is_some() || self.cached_field(name).is_some()
    }
}

#[derive(Debug)]
pub struct SchemaRegistry {
    types: BTreeMap<String, EntitySchema>,
}

impl SchemaRegistry {
    /// Build and validate the registry. Validation happens exactly once;
    /// malformed declarations are configuration errors, never runtime retry
    /// conditions.
    pub fn new(types: Vec<EntitySchema>) -> Result<Self, GraphError> {
        let mut map = BTreeMap::new();
        for schema in types {
            if map.contains_key(&schema.name) {
                return Err(GraphError::Configuration(format!(
                    "duplicate entity type `{}`",
                    schema.name
                )));
            }
            map.insert(schema.name.clone(), schema);
        }
        let registry = Self { types: map };
        registry.validate()?;
        Ok(registry)
    }

    pub fn entity(&self, node_type: &str) -> Option<&EntitySchema> {
        self.types.get(node_type)
    }

    pub fn all_types(&self) -> impl Iterator<Item = &EntitySchema> {
        self.types.values()
    }

    pub fn indexes(&self, node_type: &str) -> &[IndexDefinition] {
        self.types
            .get(node_type)
            .map(|s| s.indexes.as_slice())
            .unwrap_or(&[])
    }

    pub fn index(&self, node_type: &str, index_name: &str) -> Option<&IndexDefinition> {
        self.indexes(node_type).iter().find(|d| d.name == index_name)
    }

    pub fn cached_field(&self, node_type: &str, field: &str) -> Option<&CachedFieldSpec> {
        self.types.get(node_type).and_then(|s| s.cached_field(field))
    }

    fn validate(&self) -> Result<(), GraphError> {
        for schema in self.types.values() {
            let mut names: BTreeSet<&str> = BTreeSet::new();
            for f in &schema.fields {
                if !names.insert(&f.name) {
                    return Err(GraphError::Configuration(format!(
                        "duplicate field `{}` on `{}`",
                        f.name, schema.name
                    )));
                }
            }
            for c in &schema.cached_fields {
                if !names.insert(&c.name) {
                    return Err(GraphError::Configuration(format!(
                        "cached field `{}` shadows a declaration on `{}`",
                        c.name, schema.name
                    )));
                }
            }

            for e in &schema.edges {
                for dst in &e.dst_types {
                    if !self.types.contains_key(dst) {
                        return Err(GraphError::Configuration(format!(
                            "edge `{}` on `{}` targets undeclared type `{}`",
                            e.name, schema.name, dst
                        )));
                    }
                }
            }

            for c in &schema.cached_fields {
                for dep in &c.dependent_fields {
                    if !schema.has_field(dep) && schema.edge_spec(dep).is_none() {
                        return Err(GraphError::Configuration(format!(
                            "cached field `{}` on `{}` depends on undeclared `{}`",
                            c.name, schema.name, dep
                        )));
                    }
                }
                if let Some(p) = &c.propagated_from {
                    let src = self.types.get(&p.src_type).ok_or_else(|| {
                        GraphError::Configuration(format!(
                            "cached field `{}` propagates from undeclared type `{}`",
                            c.name, p.src_type
                        ))
                    })?;
                    if !src.has_field(&p.src_field) && src.edge_spec(&p.src_field).is_none() {
                        return Err(GraphError::Configuration(format!(
                            "cached field `{}` propagates from undeclared field `{}.{}`",
                            c.name, p.src_type, p.src_field
                        )));
                    }
                    for step in &p.traversal_to_dst {
                        if !self.types.contains_key(&step.dst_type) {
                            return Err(GraphError::Configuration(format!(
                                "propagation traversal for `{}` visits undeclared type `{}`",
                                c.name, step.dst_type
                            )));
                        }
                    }
                }
            }

            let mut index_names: BTreeSet<&str> = BTreeSet::new();
            for def in &schema.indexes {
                if !index_names.insert(&def.name) {
                    return Err(GraphError::Configuration(format!(
                        "duplicate index `{}` on `{}`",
                        def.name, schema.name
                    )));
                }
                def.validate(&schema.name)?;
                for comp in &def.components {
                    if !schema.has_field(&comp.field) {
                        return Err(GraphError::Configuration(format!(
                            "index `{}` on `{}` references undeclared field `{}`",
                            def.name, schema.name, comp.field
                        )));
                    }
                }
                for cond in &def.conditions {
                    if !schema.has_field(&cond.field) {
                        return Err(GraphError::Configuration(format!(
                            "index `{}` on `{}` filters on undeclared field `{}`",
                            def.name, schema.name, cond.field
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
