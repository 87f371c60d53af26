//! carta-graph: embedded entity graph with composite ordered indexes.
//!
//! The store keeps a per-account graph of typed nodes and directional edges
//! and serves sorted queries against declared composite indexes:
//!
//! 1. **GraphStore**: owns nodes and typed edges; all mutation goes through
//!    transactions, and callers only ever receive immutable snapshots.
//! 2. **IndexEngine** (`index`): per (entity type, index definition) ordered
//!    key sequences with prefix lookup and insertion-position search.
//! 3. **FieldResolver** (`fields`): derived fields computed by resolver
//!    functions, cached per node with dependency-driven invalidation and
//!    lookaside storage for oversized values.
//!
//! Index repositioning, field-cache invalidation, and sync-state writes all
//! commit atomically with the node mutation that triggered them.

pub mod container_list;
pub mod error;
pub mod fields;
pub mod index;
pub mod schema;
pub mod store;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use container_list::{merge_container_list, ListEntry};
pub use error::GraphError;
pub use fields::{
    CachedFieldInfo, CachedFieldSpec, EdgeDirection, NodeFieldLookup, Propagation, ResolverFn,
    TraversalStep,
};
pub use index::{
    binary_search, compare_with_sort, indexed_values_from_key_factory, resolve_unindexed_paths,
    CompareOptions, IndexComponent, IndexCondition, IndexDefinition, IndexIterator, IndexKey,
    SearchResult, SortOrder, SortSpec,
};
pub use schema::{EdgeSpec, EntitySchema, FieldKind, FieldSpec, SchemaRegistry};
pub use store::{EdgeRef, GraphStore, GraphTransaction, Node, NodeRef, ProgressBucket};

// ============================================================================
// Field Values
// ============================================================================

/// A single field value. The set of variants is closed; entity schemas
/// declare which variant each field carries and the store validates writes
/// against that declaration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
    Str(String),
    /// Reference to another entity by id.
    Id(String),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) | FieldValue::Id(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(n) | FieldValue::Timestamp(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Bool(_) => "bool",
            FieldValue::Int(_) => "int",
            FieldValue::Timestamp(_) => "timestamp",
            FieldValue::Str(_) => "str",
            FieldValue::Id(_) => "id",
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

// ============================================================================
// Context
// ============================================================================

/// Wall-clock source. Injected so cache timeouts and sync timestamps are
/// testable without sleeping.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Explicitly constructed context handed to every component; there is no
/// process-wide mutable configuration.
#[derive(Clone)]
pub struct GraphContext {
    pub schema: Arc<SchemaRegistry>,
    pub clock: Arc<dyn Clock>,
}

impl GraphContext {
    pub fn new(schema: Arc<SchemaRegistry>) -> Self {
        Self {
            schema,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(schema: Arc<SchemaRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self { schema, clock }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_basic_operations() {
        let schema = SchemaRegistry::new(vec![EntitySchema::new("Note")
            .field("label", FieldKind::Str)
            .nullable_field("deleted", FieldKind::Timestamp)])
        .unwrap();
        let store = GraphStore::new(GraphContext::new(Arc::new(schema)));

        store
            .transact("createNote", |tx| {
                let mut fields = BTreeMap::new();
                fields.insert("label".to_string(), FieldValue::from("First"));
                fields.insert("deleted".to_string(), FieldValue::Null);
                tx.create_node("Note", "n1", fields)?;
                Ok(())
            })
            .unwrap();

        let node = store.get_node(&NodeRef::new("Note", "n1")).unwrap();
        assert_eq!(node.field("label"), Some(&FieldValue::from("First")));
        assert_eq!(store.node_count("Note"), 1);
    }
}
