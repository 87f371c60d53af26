//! GraphStore: transactional owner of nodes, edges, and raw persisted state.
//!
//! All mutation flows through [`GraphStore::transact`]. A transaction stages
//! copies of the nodes it touches; nothing is visible to readers until the
//! closure returns `Ok`, at which point staged writes, index repositioning,
//! and field-cache invalidation are applied under one write lock. An error
//! from the closure leaves the store untouched.
//!
//! Besides nodes, the store owns two kinds of raw state:
//! - versioned sync state keyed by hierarchical path (persisted),
//! - ephemeral progress tables keyed by table name + bucket key (in-memory).

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::RwLock;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GraphError;
use crate::fields::{self, CachedEntry};
use crate::index::{self, IndexId, IndexKey, IndexState};
use crate::schema::{EntitySchema, FieldKind};
use crate::{FieldValue, GraphContext};

// ============================================================================
// Node types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeRef {
    pub node_type: String,
    pub id: String,
}

impl NodeRef {
    pub fn new(node_type: &str, id: &str) -> Self {
        Self {
            node_type: node_type.to_string(),
            id: id.to_string(),
        }
    }
}

impl std::fmt::Display for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.node_type, self.id)
    }
}

/// A directional edge. The same ref is stored on the source node's outputs
/// and denormalized onto the destination node's inputs; the two sides are
/// kept consistent atomically within one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeRef {
    pub src_type: String,
    pub src_id: String,
    pub dst_type: String,
    pub dst_id: String,
}

impl EdgeRef {
    pub fn src(&self) -> NodeRef {
        NodeRef::new(&self.src_type, &self.src_id)
    }

    pub fn dst(&self) -> NodeRef {
        NodeRef::new(&self.dst_type, &self.dst_id)
    }
}

/// One entity instance. Owned exclusively by the store; callers receive
/// clones, never aliases into store memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_type: String,
    pub id: String,
    pub fields: BTreeMap<String, FieldValue>,
    pub outputs: BTreeMap<String, BTreeSet<EdgeRef>>,
    pub inputs: BTreeMap<String, BTreeSet<EdgeRef>>,
    #[serde(default)]
    pub(crate) cache: BTreeMap<String, CachedEntry>,
}

impl Node {
    pub fn node_ref(&self) -> NodeRef {
        NodeRef::new(&self.node_type, &self.id)
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn first_output(&self, edge: &str) -> Option<NodeRef> {
        self.outputs.get(edge).and_then(|s| s.iter().next()).map(EdgeRef::dst)
    }

    pub fn first_input(&self, edge: &str) -> Option<NodeRef> {
        self.inputs.get(edge).and_then(|s| s.iter().next()).map(EdgeRef::src)
    }
}

/// One ephemeral progress bucket. `total_size` is optional; buckets that
/// cannot report a size are excluded from progress aggregation instead of
/// failing it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressBucket {
    pub total_size: Option<f64>,
    pub percent_complete: f64,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

#[derive(Debug, Clone)]
pub(crate) struct VersionedState {
    pub value: Value,
    pub version: u64,
}

// ============================================================================
// State
// ============================================================================

pub(crate) struct GraphState {
    pub nodes: HashMap<NodeRef, Node>,
    pub ordinals: HashMap<NodeRef, u32>,
    pub by_ordinal: HashMap<u32, NodeRef>,
    pub next_ordinal: u32,
    /// Per-type membership bitmaps over node ordinals.
    pub type_index: HashMap<String, RoaringBitmap>,
    pub indexes: HashMap<IndexId, IndexState>,
    pub sync_state: BTreeMap<Vec<String>, VersionedState>,
    pub ephemeral: HashMap<String, BTreeMap<String, ProgressBucket>>,
    pub lookaside: HashMap<u64, Vec<u8>>,
    pub next_lookaside: u64,
    pub version: u64,
}

impl GraphState {
    fn empty() -> Self {
        Self {
            nodes: HashMap::new(),
            ordinals: HashMap::new(),
            by_ordinal: HashMap::new(),
            next_ordinal: 0,
            type_index: HashMap::new(),
            indexes: HashMap::new(),
            sync_state: BTreeMap::new(),
            ephemeral: HashMap::new(),
            lookaside: HashMap::new(),
            next_lookaside: 0,
            version: 0,
        }
    }

    fn ensure_ordinal(&mut self, nref: &NodeRef) -> u32 {
        if let Some(ord) = self.ordinals.get(nref) {
            return *ord;
        }
        let ord = self.next_ordinal;
        self.next_ordinal += 1;
        self.ordinals.insert(nref.clone(), ord);
        self.by_ordinal.insert(ord, nref.clone());
        ord
    }
}

// ============================================================================
// Snapshot encoding
// ============================================================================

/// Persistable portion of the store. Sync-state values are carried as JSON
/// text because the binary codec is not self-describing.
#[derive(Serialize, Deserialize)]
struct GraphSnapshot {
    nodes: Vec<Node>,
    sync_state: Vec<(Vec<String>, u64, String)>,
    lookaside: Vec<(u64, Vec<u8>)>,
    next_lookaside: u64,
}

const SNAPSHOT_MAGIC: &[u8; 4] = b"CRTG";
const SNAPSHOT_VERSION: u32 = 1;

// ============================================================================
// Store
// ============================================================================

pub struct GraphStore {
    pub(crate) ctx: GraphContext,
    pub(crate) state: RwLock<GraphState>,
}

impl GraphStore {
    pub fn new(ctx: GraphContext) -> Self {
        let mut state = GraphState::empty();
        for schema in ctx.schema.all_types() {
            for def in &schema.indexes {
                state
                    .indexes
                    .insert((schema.name.clone(), def.name.clone()), IndexState::default());
            }
        }
        Self {
            ctx,
            state: RwLock::new(state),
        }
    }

    pub fn context(&self) -> &GraphContext {
        &self.ctx
    }

    /// Run `f` against a transaction and commit its staged writes. Index
    /// repositioning, cache invalidation, and sync-state versioning happen
    /// as part of the same commit, under the same lock.
    pub fn transact<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut GraphTransaction) -> Result<T, GraphError>,
    ) -> Result<T, GraphError> {
        let mut guard = self.state.write();
        let (out, staged) = {
            let mut tx = GraphTransaction {
                ctx: &self.ctx,
                base: &guard,
                staged: Staged::default(),
            };
            let out = f(&mut tx)?;
            (out, tx.staged)
        };
        apply_staged(&mut guard, &self.ctx, staged);
        tracing::trace!(transaction = name, version = guard.version, "committed");
        Ok(out)
    }

    /// Immutable snapshot of a node.
    pub fn get_node(&self, nref: &NodeRef) -> Option<Node> {
        self.state.read().nodes.get(nref).cloned()
    }

    pub fn node_count(&self, node_type: &str) -> u64 {
        self.state
            .read()
            .type_index
            .get(node_type)
            .map(|bm| bm.len())
            .unwrap_or(0)
    }

    pub fn nodes_of_type(&self, node_type: &str) -> Vec<NodeRef> {
        let state = self.state.read();
        let Some(bm) = state.type_index.get(node_type) else {
            return Vec::new();
        };
        bm.iter()
            .filter_map(|ord| state.by_ordinal.get(&ord).cloned())
            .collect()
    }

    pub fn get_sync_state(&self, path: &[&str]) -> Option<Value> {
        let key: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        self.state.read().sync_state.get(&key).map(|v| v.value.clone())
    }

    pub fn sync_state_version(&self, path: &[&str]) -> Option<u64> {
        let key: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        self.state.read().sync_state.get(&key).map(|v| v.version)
    }

    pub fn get_progress(&self, table: &str, key: &str) -> Option<ProgressBucket> {
        self.state
            .read()
            .ephemeral
            .get(table)
            .and_then(|t| t.get(key))
            .cloned()
    }

    pub fn progress_keys(&self, table: &str) -> Vec<String> {
        self.state
            .read()
            .ephemeral
            .get(table)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Rebuild every index from the current node set. Used after loading a
    /// snapshot; index state itself is not persisted.
    pub fn build_indexes(&self) {
        let mut state = self.state.write();
        rebuild_indexes(&mut state, &self.ctx);
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, GraphError> {
        let state = self.state.read();
        let mut sync_state = Vec::with_capacity(state.sync_state.len());
        for (path, vs) in &state.sync_state {
            let text = serde_json::to_string(&vs.value)?;
            sync_state.push((path.clone(), vs.version, text));
        }
        let snapshot = GraphSnapshot {
            nodes: state.nodes.values().cloned().collect(),
            sync_state,
            lookaside: state.lookaside.iter().map(|(k, v)| (*k, v.clone())).collect(),
            next_lookaside: state.next_lookaside,
        };
        let body = bincode::serialize(&snapshot)
            .map_err(|e| GraphError::Serialization(e.to_string()))?;

        let mut out = Vec::with_capacity(body.len() + 8);
        out.extend_from_slice(SNAPSHOT_MAGIC);
        out.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn from_bytes(ctx: GraphContext, bytes: &[u8]) -> Result<Self, GraphError> {
        if bytes.len() < 8 || &bytes[0..4] != SNAPSHOT_MAGIC {
            return Err(GraphError::Serialization("invalid graph snapshot".into()));
        }
        let version = u32::from_le_bytes(
            bytes[4..8]
                .try_into()
                .map_err(|_| GraphError::Serialization("truncated snapshot header".into()))?,
        );
        if version != SNAPSHOT_VERSION {
            return Err(GraphError::Serialization(format!(
                "unsupported snapshot version {version}"
            )));
        }
        let snapshot: GraphSnapshot = bincode::deserialize(&bytes[8..])
            .map_err(|e| GraphError::Serialization(e.to_string()))?;

        let store = GraphStore::new(ctx);
        {
            let mut state = store.state.write();
            for node in snapshot.nodes {
                let nref = node.node_ref();
                let ord = state.ensure_ordinal(&nref);
                state
                    .type_index
                    .entry(nref.node_type.clone())
                    .or_default()
                    .insert(ord);
                state.nodes.insert(nref, node);
            }
            for (path, version, text) in snapshot.sync_state {
                let value: Value = serde_json::from_str(&text)?;
                state.sync_state.insert(path, VersionedState { value, version });
            }
            state.lookaside = snapshot.lookaside.into_iter().collect();
            state.next_lookaside = snapshot.next_lookaside;
            rebuild_indexes(&mut state, &store.ctx);
        }
        Ok(store)
    }
}

// ============================================================================
// Transactions
// ============================================================================

pub(crate) enum SyncOp {
    Replace(Value),
    Update(Value),
}

pub(crate) enum EphemeralOp {
    Put(String, String, ProgressBucket),
    ClearTable(String),
}

#[derive(Default)]
pub(crate) struct Staged {
    /// Staged node writes; `None` marks deletion.
    pub nodes: BTreeMap<NodeRef, Option<Node>>,
    /// Changed field and edge names per node, for invalidation and reindex.
    pub dirty: BTreeMap<NodeRef, BTreeSet<String>>,
    pub sync: Vec<(Vec<String>, SyncOp)>,
    pub ephemeral: Vec<EphemeralOp>,
}

pub struct GraphTransaction<'a> {
    ctx: &'a GraphContext,
    base: &'a GraphState,
    pub(crate) staged: Staged,
}

impl GraphTransaction<'_> {
    fn schema(&self, node_type: &str) -> Result<&EntitySchema, GraphError> {
        self.ctx
            .schema
            .entity(node_type)
            .ok_or_else(|| GraphError::UnknownType(node_type.to_string()))
    }

    fn node_snapshot(&self, nref: &NodeRef) -> Option<Node> {
        match self.staged.nodes.get(nref) {
            Some(Some(node)) => Some(node.clone()),
            Some(None) => None,
            None => self.base.nodes.get(nref).cloned(),
        }
    }

    fn mark_dirty(&mut self, nref: &NodeRef, name: &str) {
        self.staged
            .dirty
            .entry(nref.clone())
            .or_default()
            .insert(name.to_string());
    }

    pub fn get_node(&self, nref: &NodeRef) -> Option<Node> {
        self.node_snapshot(nref)
    }

    pub fn create_node(
        &mut self,
        node_type: &str,
        id: &str,
        fields: BTreeMap<String, FieldValue>,
    ) -> Result<NodeRef, GraphError> {
        let nref = NodeRef::new(node_type, id);
        {
            let schema = self.schema(node_type)?;
            for (name, value) in &fields {
                validate_field(schema, name, value)?;
            }
        }
        if self.node_snapshot(&nref).is_some() {
            return Err(GraphError::NodeExists {
                node_type: node_type.to_string(),
                id: id.to_string(),
            });
        }
        let dirty: Vec<String> = fields.keys().cloned().collect();
        let node = Node {
            node_type: node_type.to_string(),
            id: id.to_string(),
            fields,
            outputs: BTreeMap::new(),
            inputs: BTreeMap::new(),
            cache: BTreeMap::new(),
        };
        self.staged.nodes.insert(nref.clone(), Some(node));
        for name in dirty {
            self.mark_dirty(&nref, &name);
        }
        Ok(nref)
    }

    pub fn update_fields(
        &mut self,
        nref: &NodeRef,
        updates: BTreeMap<String, FieldValue>,
    ) -> Result<(), GraphError> {
        let mut node = self.node_snapshot(nref).ok_or_else(|| GraphError::NodeNotFound {
            node_type: nref.node_type.clone(),
            id: nref.id.clone(),
        })?;
        let mut changed = Vec::new();
        {
            let schema = self.schema(&nref.node_type)?;
            for (name, value) in updates {
                validate_field(schema, &name, &value)?;
                if node.fields.get(&name) == Some(&value) {
                    continue;
                }
                node.fields.insert(name.clone(), value);
                changed.push(name);
            }
        }
        if changed.is_empty() {
            return Ok(());
        }
        self.staged.nodes.insert(nref.clone(), Some(node));
        for name in changed {
            self.mark_dirty(nref, &name);
        }
        Ok(())
    }

    pub fn set_field(
        &mut self,
        nref: &NodeRef,
        name: &str,
        value: FieldValue,
    ) -> Result<(), GraphError> {
        let mut updates = BTreeMap::new();
        updates.insert(name.to_string(), value);
        self.update_fields(nref, updates)
    }

    pub fn delete_node(&mut self, nref: &NodeRef) -> Result<(), GraphError> {
        let node = self.node_snapshot(nref).ok_or_else(|| GraphError::NodeNotFound {
            node_type: nref.node_type.clone(),
            id: nref.id.clone(),
        })?;
        // Detach both edge directions so the bidirectional invariant holds
        // after the delete commits.
        for (edge_name, edges) in &node.outputs {
            for edge in edges {
                self.detach_peer(&edge.dst(), edge_name, edge, false)?;
            }
        }
        for (edge_name, edges) in &node.inputs {
            for edge in edges {
                self.detach_peer(&edge.src(), edge_name, edge, true)?;
            }
        }
        self.staged.nodes.insert(nref.clone(), None);
        self.staged.dirty.remove(nref);
        Ok(())
    }

    fn detach_peer(
        &mut self,
        peer: &NodeRef,
        edge_name: &str,
        edge: &EdgeRef,
        from_outputs: bool,
    ) -> Result<(), GraphError> {
        let Some(mut peer_node) = self.node_snapshot(peer) else {
            return Ok(());
        };
        let side = if from_outputs {
            &mut peer_node.outputs
        } else {
            &mut peer_node.inputs
        };
        if let Some(set) = side.get_mut(edge_name) {
            set.remove(edge);
            if set.is_empty() {
                side.remove(edge_name);
            }
        }
        self.staged.nodes.insert(peer.clone(), Some(peer_node));
        self.mark_dirty(peer, edge_name);
        Ok(())
    }

    pub fn add_edge(
        &mut self,
        edge_name: &str,
        src: &NodeRef,
        dst: &NodeRef,
    ) -> Result<(), GraphError> {
        {
            let schema = self.schema(&src.node_type)?;
            let spec = schema.edge_spec(edge_name).ok_or_else(|| {
                GraphError::Configuration(format!(
                    "edge `{edge_name}` is not declared on `{}`",
                    src.node_type
                ))
            })?;
            if !spec.dst_types.iter().any(|t| t == &dst.node_type) {
                return Err(GraphError::Configuration(format!(
                    "edge `{edge_name}` on `{}` does not allow destination `{}`",
                    src.node_type, dst.node_type
                )));
            }
        }
        let mut src_node = self.node_snapshot(src).ok_or_else(|| GraphError::NodeNotFound {
            node_type: src.node_type.clone(),
            id: src.id.clone(),
        })?;
        let mut dst_node = self.node_snapshot(dst).ok_or_else(|| GraphError::NodeNotFound {
            node_type: dst.node_type.clone(),
            id: dst.id.clone(),
        })?;

        let edge = EdgeRef {
            src_type: src.node_type.clone(),
            src_id: src.id.clone(),
            dst_type: dst.node_type.clone(),
            dst_id: dst.id.clone(),
        };
        src_node
            .outputs
            .entry(edge_name.to_string())
            .or_default()
            .insert(edge.clone());
        dst_node
            .inputs
            .entry(edge_name.to_string())
            .or_default()
            .insert(edge);

        self.staged.nodes.insert(src.clone(), Some(src_node));
        self.staged.nodes.insert(dst.clone(), Some(dst_node));
        self.mark_dirty(src, edge_name);
        self.mark_dirty(dst, edge_name);
        Ok(())
    }

    /// Remove an edge from both sides. Removing a non-existent edge is a
    /// no-op.
    pub fn remove_edge(
        &mut self,
        edge_name: &str,
        src: &NodeRef,
        dst: &NodeRef,
    ) -> Result<(), GraphError> {
        let edge = EdgeRef {
            src_type: src.node_type.clone(),
            src_id: src.id.clone(),
            dst_type: dst.node_type.clone(),
            dst_id: dst.id.clone(),
        };
        self.detach_peer(src, edge_name, &edge, true)?;
        self.detach_peer(dst, edge_name, &edge, false)?;
        Ok(())
    }

    pub fn get_sync_state(&self, path: &[&str]) -> Option<Value> {
        let key: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        let mut value = self.base.sync_state.get(&key).map(|v| v.value.clone());
        for (p, op) in &self.staged.sync {
            if p != &key {
                continue;
            }
            match op {
                SyncOp::Replace(v) => value = Some(v.clone()),
                SyncOp::Update(v) => {
                    value = Some(merge_shallow(value.take(), v.clone()));
                }
            }
        }
        value
    }

    pub fn replace_sync_state(&mut self, path: &[&str], value: Value) {
        let key: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        self.staged.sync.push((key, SyncOp::Replace(value)));
    }

    /// Shallow-merge `value` into the existing object at `path` (non-object
    /// targets are replaced).
    pub fn update_sync_state(&mut self, path: &[&str], value: Value) {
        let key: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        self.staged.sync.push((key, SyncOp::Update(value)));
    }

    pub fn get_progress(&self, table: &str, key: &str) -> Option<ProgressBucket> {
        let mut value = self
            .base
            .ephemeral
            .get(table)
            .and_then(|t| t.get(key))
            .cloned();
        for op in &self.staged.ephemeral {
            match op {
                EphemeralOp::Put(t, k, bucket) if t == table && k == key => {
                    value = Some(bucket.clone());
                }
                EphemeralOp::ClearTable(t) if t == table => value = None,
                _ => {}
            }
        }
        value
    }

    pub fn put_progress(&mut self, table: &str, key: &str, bucket: ProgressBucket) {
        self.staged.ephemeral.push(EphemeralOp::Put(
            table.to_string(),
            key.to_string(),
            bucket,
        ));
    }

    pub fn clear_progress_table(&mut self, table: &str) {
        self.staged
            .ephemeral
            .push(EphemeralOp::ClearTable(table.to_string()));
    }
}

fn validate_field(
    schema: &EntitySchema,
    name: &str,
    value: &FieldValue,
) -> Result<(), GraphError> {
    let spec = schema.field_spec(name).ok_or_else(|| GraphError::UnknownField {
        node_type: schema.name.clone(),
        field: name.to_string(),
    })?;
    if value.is_null() {
        if spec.nullable {
            return Ok(());
        }
        return Err(GraphError::TypeMismatch {
            field: name.to_string(),
            expected: spec.kind.name().to_string(),
        });
    }
    let ok = matches!(
        (spec.kind, value),
        (FieldKind::Bool, FieldValue::Bool(_))
            | (FieldKind::Int, FieldValue::Int(_))
            | (FieldKind::Timestamp, FieldValue::Timestamp(_))
            | (FieldKind::Str, FieldValue::Str(_))
            | (FieldKind::Id, FieldValue::Id(_))
    );
    if ok {
        Ok(())
    } else {
        Err(GraphError::TypeMismatch {
            field: name.to_string(),
            expected: spec.kind.name().to_string(),
        })
    }
}

fn merge_shallow(base: Option<Value>, patch: Value) -> Value {
    match (base, patch) {
        (Some(Value::Object(mut obj)), Value::Object(patch)) => {
            for (k, v) in patch {
                obj.insert(k, v);
            }
            Value::Object(obj)
        }
        (_, patch) => patch,
    }
}

// ============================================================================
// Commit
// ============================================================================

fn apply_staged(state: &mut GraphState, ctx: &GraphContext, staged: Staged) {
    for (path, op) in staged.sync {
        let next_version = state.sync_state.get(&path).map(|v| v.version + 1).unwrap_or(1);
        let value = match op {
            SyncOp::Replace(v) => v,
            SyncOp::Update(v) => {
                merge_shallow(state.sync_state.get(&path).map(|s| s.value.clone()), v)
            }
        };
        state.sync_state.insert(
            path,
            VersionedState {
                value,
                version: next_version,
            },
        );
    }

    for op in staged.ephemeral {
        match op {
            EphemeralOp::Put(table, key, bucket) => {
                state.ephemeral.entry(table).or_default().insert(key, bucket);
            }
            EphemeralOp::ClearTable(table) => {
                state.ephemeral.remove(&table);
            }
        }
    }

    let mut touched: BTreeSet<NodeRef> = BTreeSet::new();
    for (nref, maybe_node) in staged.nodes {
        match maybe_node {
            Some(node) => {
                let ord = state.ensure_ordinal(&nref);
                state
                    .type_index
                    .entry(nref.node_type.clone())
                    .or_default()
                    .insert(ord);
                state.nodes.insert(nref.clone(), node);
                touched.insert(nref);
            }
            None => {
                if let Some(ord) = state.ordinals.remove(&nref) {
                    state.by_ordinal.remove(&ord);
                    if let Some(bm) = state.type_index.get_mut(&nref.node_type) {
                        bm.remove(ord);
                    }
                    for def in ctx.schema.indexes(&nref.node_type) {
                        if let Some(ix) = state
                            .indexes
                            .get_mut(&(nref.node_type.clone(), def.name.clone()))
                        {
                            if let Some(old) = ix.by_ordinal.remove(&ord) {
                                index::remove_key(ix, def, &old);
                            }
                        }
                    }
                    state.nodes.remove(&nref);
                }
            }
        }
    }

    // Dependency-driven invalidation: a changed field marks stale every
    // cached field that depends on it, locally and across declared
    // propagation traversals. Propagation targets are repositioned in their
    // indexes as well, since derived index fields may read through edges.
    let mut stale_marks: Vec<(NodeRef, String)> = Vec::new();
    let mut reindex: BTreeSet<NodeRef> = touched.clone();
    for (nref, changed) in &staged.dirty {
        if !state.nodes.contains_key(nref) {
            continue;
        }
        if let Some(schema) = ctx.schema.entity(&nref.node_type) {
            for cf in &schema.cached_fields {
                if cf.dependent_fields.iter().any(|d| changed.contains(d)) {
                    stale_marks.push((nref.clone(), cf.name.clone()));
                }
            }
        }
        for (dst, field) in fields::propagation_targets(state, ctx, nref, changed) {
            reindex.insert(dst.clone());
            stale_marks.push((dst, field));
        }
    }
    for (nref, field) in stale_marks {
        if let Some(node) = state.nodes.get_mut(&nref) {
            if let Some(entry) = node.cache.get_mut(&field) {
                entry.stale = true;
            }
        }
    }

    // Recompute index keys for every touched node and reposition entries
    // whose encoded key changed.
    let mut planned: Vec<(NodeRef, String, Option<IndexKey>)> = Vec::new();
    for nref in &reindex {
        let Some(node) = state.nodes.get(nref) else {
            continue;
        };
        for def in ctx.schema.indexes(&nref.node_type) {
            let new_key = index::compute_index_key(state, ctx, node, def);
            planned.push((nref.clone(), def.name.clone(), new_key));
        }
    }
    for (nref, index_name, new_key) in planned {
        let Some(&ord) = state.ordinals.get(&nref) else {
            continue;
        };
        let Some(def) = ctx.schema.index(&nref.node_type, &index_name) else {
            continue;
        };
        let Some(ix) = state
            .indexes
            .get_mut(&(nref.node_type.clone(), index_name))
        else {
            continue;
        };
        let old = ix.by_ordinal.get(&ord).cloned();
        if old == new_key {
            continue;
        }
        if let Some(old) = old {
            index::remove_key(ix, def, &old);
            ix.by_ordinal.remove(&ord);
        }
        if let Some(key) = new_key {
            index::insert_key(ix, def, key.clone());
            ix.by_ordinal.insert(ord, key);
        }
    }

    state.version += 1;
}

pub(crate) fn rebuild_indexes(state: &mut GraphState, ctx: &GraphContext) {
    state.indexes.clear();
    for schema in ctx.schema.all_types() {
        for def in &schema.indexes {
            state
                .indexes
                .insert((schema.name.clone(), def.name.clone()), IndexState::default());
        }
    }
    let mut planned: Vec<(String, String, u32, IndexKey)> = Vec::new();
    for (nref, node) in &state.nodes {
        let Some(&ord) = state.ordinals.get(nref) else {
            continue;
        };
        for def in ctx.schema.indexes(&nref.node_type) {
            if let Some(key) = index::compute_index_key(state, ctx, node, def) {
                planned.push((nref.node_type.clone(), def.name.clone(), ord, key));
            }
        }
    }
    for (node_type, index_name, ord, key) in planned {
        let Some(def) = ctx.schema.index(&node_type, &index_name) else {
            continue;
        };
        if let Some(ix) = state.indexes.get_mut(&(node_type.clone(), index_name)) {
            index::insert_key(ix, def, key.clone());
            ix.by_ordinal.insert(ord, key);
        }
    }
}
