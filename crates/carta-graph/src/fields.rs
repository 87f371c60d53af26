//! FieldResolver: derived fields with cached values.
//!
//! Cached fields are computed by resolver functions that may read other
//! nodes (including across edges) through a lookup handle. Values are cached
//! per node and invalidated when a dependent field changes, when a declared
//! propagation source changes on a related node, or when the cache timeout
//! elapses. Values whose serialized form exceeds the configured threshold
//! are stored out-of-line (lookaside) transparently to readers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::store::{GraphState, GraphStore, Node, NodeRef};
use crate::{FieldValue, GraphContext};

const MAX_RESOLVE_DEPTH: usize = 16;

// ============================================================================
// Specs
// ============================================================================

/// Read access handed to resolver functions. Reads go through the store's
/// committed state; a missing peer resolves to `Null`, which covers the
/// window where a node exists before its edges do (optimistic creation).
pub trait NodeFieldLookup {
    fn field(&self, nref: &NodeRef, field: &str) -> Result<FieldValue, GraphError>;
}

pub type ResolverFn =
    Arc<dyn Fn(&Node, &dyn NodeFieldLookup) -> Result<FieldValue, GraphError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeDirection {
    Outputs,
    Inputs,
}

#[derive(Debug, Clone)]
pub struct TraversalStep {
    pub direction: EdgeDirection,
    pub edge: String,
    pub dst_type: String,
}

/// Declares that a field physically stored on this entity goes stale when
/// `src_field` changes on a related entity of `src_type`, reachable via the
/// traversal. Propagated staleness is treated identically to a local
/// dependent-field change.
#[derive(Debug, Clone)]
pub struct Propagation {
    pub src_type: String,
    pub src_field: String,
    pub traversal_to_dst: Vec<TraversalStep>,
}

pub struct CachedFieldSpec {
    pub name: String,
    /// When true, a reader may be served the previous cached value if
    /// recomputation fails; when false the failure propagates.
    pub allow_stale: bool,
    pub dependent_fields: Vec<String>,
    pub cache_timeout_ms: Option<i64>,
    /// Serialized values larger than this many bytes are stored out-of-line.
    pub lookaside_threshold: Option<usize>,
    pub propagated_from: Option<Propagation>,
    pub resolver: ResolverFn,
}

impl CachedFieldSpec {
    pub fn new(name: &str, resolver: ResolverFn) -> Self {
        Self {
            name: name.to_string(),
            allow_stale: true,
            dependent_fields: Vec::new(),
            cache_timeout_ms: None,
            lookaside_threshold: None,
            propagated_from: None,
            resolver,
        }
    }

    pub fn allow_stale(mut self, allow: bool) -> Self {
        self.allow_stale = allow;
        self
    }

    pub fn dependent_on(mut self, fields: &[&str]) -> Self {
        self.dependent_fields = fields.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn cache_timeout_ms(mut self, timeout: i64) -> Self {
        self.cache_timeout_ms = Some(timeout);
        self
    }

    pub fn lookaside_threshold(mut self, bytes: usize) -> Self {
        self.lookaside_threshold = Some(bytes);
        self
    }

    pub fn propagated_from(mut self, propagation: Propagation) -> Self {
        self.propagated_from = Some(propagation);
        self
    }
}

impl std::fmt::Debug for CachedFieldSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedFieldSpec")
            .field("name", &self.name)
            .field("allow_stale", &self.allow_stale)
            .field("dependent_fields", &self.dependent_fields)
            .field("cache_timeout_ms", &self.cache_timeout_ms)
            .field("lookaside_threshold", &self.lookaside_threshold)
            .finish()
    }
}

// ============================================================================
// Cache entries
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum CachedSlot {
    Inline(FieldValue),
    Lookaside(u64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct CachedEntry {
    pub slot: CachedSlot,
    pub computed_at: i64,
    pub stale: bool,
}

/// Debug view of one cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFieldInfo {
    pub out_of_line: bool,
    pub computed_at: i64,
    pub stale: bool,
}

fn timed_out(spec: &CachedFieldSpec, entry: &CachedEntry, now: i64) -> bool {
    spec.cache_timeout_ms
        .map(|t| now - entry.computed_at >= t)
        .unwrap_or(false)
}

fn decode_slot(state: &GraphState, slot: &CachedSlot) -> Result<FieldValue, GraphError> {
    match slot {
        CachedSlot::Inline(v) => Ok(v.clone()),
        CachedSlot::Lookaside(key) => {
            let bytes = state.lookaside.get(key).ok_or_else(|| {
                GraphError::Serialization(format!("missing lookaside entry {key}"))
            })?;
            Ok(serde_json::from_slice(bytes)?)
        }
    }
}

fn store_cached(
    state: &mut GraphState,
    nref: &NodeRef,
    spec: &CachedFieldSpec,
    value: &FieldValue,
    now: i64,
) -> Result<(), GraphError> {
    let bytes = serde_json::to_vec(value)?;
    let out_of_line = spec
        .lookaside_threshold
        .map(|t| bytes.len() > t)
        .unwrap_or(false);

    // A rewrite always releases the previous out-of-line slot; a value that
    // shrank below the threshold migrates back inline and vice versa.
    let old_slot = state
        .nodes
        .get(nref)
        .and_then(|n| n.cache.get(&spec.name))
        .map(|e| e.slot.clone());
    if let Some(CachedSlot::Lookaside(key)) = old_slot {
        state.lookaside.remove(&key);
    }

    let slot = if out_of_line {
        let key = state.next_lookaside;
        state.next_lookaside += 1;
        state.lookaside.insert(key, bytes);
        CachedSlot::Lookaside(key)
    } else {
        CachedSlot::Inline(value.clone())
    };

    if let Some(node) = state.nodes.get_mut(nref) {
        node.cache.insert(
            spec.name.clone(),
            CachedEntry {
                slot,
                computed_at: now,
                stale: false,
            },
        );
    }
    Ok(())
}

// ============================================================================
// Resolution
// ============================================================================

struct StateLookup<'a> {
    state: &'a GraphState,
    ctx: &'a GraphContext,
    depth: usize,
}

impl NodeFieldLookup for StateLookup<'_> {
    fn field(&self, nref: &NodeRef, field: &str) -> Result<FieldValue, GraphError> {
        let Some(node) = self.state.nodes.get(nref) else {
            return Ok(FieldValue::Null);
        };
        computed_value(self.state, self.ctx, node, field, self.depth + 1)
    }
}

/// Read-through value of `field` on `node`: a stored field, a fresh cache
/// entry, or a recomputation on the fly. This path never writes the cache;
/// the persisting variant lives on [`GraphStore::resolve_field`].
pub(crate) fn computed_value(
    state: &GraphState,
    ctx: &GraphContext,
    node: &Node,
    field: &str,
    depth: usize,
) -> Result<FieldValue, GraphError> {
    if depth > MAX_RESOLVE_DEPTH {
        return Err(GraphError::ResolutionCycle(field.to_string()));
    }
    if let Some(v) = node.fields.get(field) {
        return Ok(v.clone());
    }
    let spec = ctx
        .schema
        .cached_field(&node.node_type, field)
        .ok_or_else(|| GraphError::UnknownField {
            node_type: node.node_type.clone(),
            field: field.to_string(),
        })?;
    if let Some(entry) = node.cache.get(field) {
        if !entry.stale && !timed_out(spec, entry, ctx.clock.now_ms()) {
            return decode_slot(state, &entry.slot);
        }
    }
    let lookup = StateLookup { state, ctx, depth };
    (spec.resolver)(node, &lookup)
}

/// Nodes whose cached fields go stale because `changed` fields on `src`
/// changed, per declared propagation traversals.
pub(crate) fn propagation_targets(
    state: &GraphState,
    ctx: &GraphContext,
    src: &NodeRef,
    changed: &std::collections::BTreeSet<String>,
) -> Vec<(NodeRef, String)> {
    let mut out = Vec::new();
    for schema in ctx.schema.all_types() {
        for cf in &schema.cached_fields {
            let Some(p) = &cf.propagated_from else {
                continue;
            };
            if p.src_type != src.node_type || !changed.contains(&p.src_field) {
                continue;
            }
            let mut frontier = vec![src.clone()];
            for step in &p.traversal_to_dst {
                let mut next = Vec::new();
                for cur in &frontier {
                    let Some(node) = state.nodes.get(cur) else {
                        continue;
                    };
                    let side = match step.direction {
                        EdgeDirection::Outputs => node.outputs.get(&step.edge),
                        EdgeDirection::Inputs => node.inputs.get(&step.edge),
                    };
                    let Some(edges) = side else {
                        continue;
                    };
                    for edge in edges {
                        let peer = match step.direction {
                            EdgeDirection::Outputs => edge.dst(),
                            EdgeDirection::Inputs => edge.src(),
                        };
                        if peer.node_type == step.dst_type {
                            next.push(peer);
                        }
                    }
                }
                frontier = next;
            }
            for dst in frontier {
                if dst.node_type == schema.name {
                    out.push((dst, cf.name.clone()));
                }
            }
        }
    }
    out
}

// ============================================================================
// Store-level API
// ============================================================================

impl GraphStore {
    /// Resolve `field` on the referenced node. Stored fields return
    /// directly; cached fields are served from cache while fresh and
    /// recomputed (and persisted, applying the lookaside policy) otherwise.
    pub fn resolve_field(&self, nref: &NodeRef, field: &str) -> Result<FieldValue, GraphError> {
        let mut state = self.state.write();
        let now = self.ctx.clock.now_ms();

        let value = {
            let node = state.nodes.get(nref).ok_or_else(|| GraphError::NodeNotFound {
                node_type: nref.node_type.clone(),
                id: nref.id.clone(),
            })?;
            if let Some(v) = node.fields.get(field) {
                return Ok(v.clone());
            }
            let spec = self
                .ctx
                .schema
                .cached_field(&nref.node_type, field)
                .ok_or_else(|| GraphError::UnknownField {
                    node_type: nref.node_type.clone(),
                    field: field.to_string(),
                })?;

            let entry = node.cache.get(field);
            if let Some(e) = entry {
                if !e.stale && !timed_out(spec, e, now) {
                    return decode_slot(&state, &e.slot);
                }
            }

            let lookup = StateLookup {
                state: &state,
                ctx: &self.ctx,
                depth: 0,
            };
            match (spec.resolver)(node, &lookup) {
                Ok(v) => v,
                Err(err) => {
                    if spec.allow_stale {
                        if let Some(e) = entry {
                            tracing::warn!(
                                node = %nref,
                                field,
                                error = %err,
                                "resolver failed, serving previous cached value"
                            );
                            return decode_slot(&state, &e.slot);
                        }
                    }
                    return Err(err);
                }
            }
        };

        let spec = self
            .ctx
            .schema
            .cached_field(&nref.node_type, field)
            .expect("spec existence checked above");
        store_cached(&mut state, nref, spec, &value, now)?;
        Ok(value)
    }

    /// Debug/test view of a cache entry's storage placement and staleness.
    pub fn cached_field_info(&self, nref: &NodeRef, field: &str) -> Option<CachedFieldInfo> {
        let state = self.state.read();
        let entry = state.nodes.get(nref)?.cache.get(field)?;
        Some(CachedFieldInfo {
            out_of_line: matches!(entry.slot, CachedSlot::Lookaside(_)),
            computed_at: entry.computed_at,
            stale: entry.stale,
        })
    }
}
