//! IndexEngine: composite ordered indexes over entity fields.
//!
//! Each published index is logically a sorted sequence of encoded keys, one
//! per eligible node. On every committed node mutation the key is recomputed
//! for each applicable definition; when it changed, the old entry is removed
//! and the new one re-inserted at the position reported by [`binary_search`].
//!
//! Prefix queries locate the first key matching the equality prefix and then
//! iterate forward while the prefix still matches. Eligibility conditions
//! declared on the definition (e.g. "not deleted") are baked into key
//! computation, so ineligible nodes simply have no entry.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::fields;
use crate::store::{GraphState, GraphStore, Node};
use crate::{FieldValue, GraphContext};

// ============================================================================
// Definitions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// One requested ordering component, as supplied by a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub field: String,
    pub order: SortOrder,
}

impl SortSpec {
    pub fn new(field: &str, order: SortOrder) -> Self {
        Self {
            field: field.to_string(),
            order,
        }
    }
}

/// One component of a published index. Match fields form the required
/// equality prefix; the remaining components form the sort suffix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexComponent {
    pub field: String,
    pub order: SortOrder,
    pub is_match_field: bool,
}

/// Fixed eligibility filter baked into an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexCondition {
    pub field: String,
    pub value: FieldValue,
}

/// A published index over one entity type. Immutable once registered;
/// changing the field list requires publishing a new definition name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub components: Vec<IndexComponent>,
    pub conditions: Vec<IndexCondition>,
}

impl IndexDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            components: Vec::new(),
            conditions: Vec::new(),
        }
    }

    pub fn match_field(mut self, field: &str, order: SortOrder) -> Self {
        self.components.push(IndexComponent {
            field: field.to_string(),
            order,
            is_match_field: true,
        });
        self
    }

    pub fn sort_field(mut self, field: &str, order: SortOrder) -> Self {
        self.components.push(IndexComponent {
            field: field.to_string(),
            order,
            is_match_field: false,
        });
        self
    }

    pub fn condition(mut self, field: &str, value: FieldValue) -> Self {
        self.conditions.push(IndexCondition {
            field: field.to_string(),
            value,
        });
        self
    }

    pub fn match_len(&self) -> usize {
        self.components.iter().filter(|c| c.is_match_field).count()
    }

    pub fn sort_components(&self) -> impl Iterator<Item = &IndexComponent> {
        self.components.iter().filter(|c| !c.is_match_field)
    }

    pub(crate) fn validate(&self, node_type: &str) -> Result<(), GraphError> {
        if self.components.is_empty() {
            return Err(GraphError::Configuration(format!(
                "index `{}` on `{}` has no components",
                self.name, node_type
            )));
        }
        let mut seen_sort = false;
        for comp in &self.components {
            if comp.is_match_field && seen_sort {
                return Err(GraphError::Configuration(format!(
                    "index `{}` on `{}`: match field `{}` follows a sort field",
                    self.name, node_type, comp.field
                )));
            }
            seen_sort = seen_sort || !comp.is_match_field;
        }
        Ok(())
    }
}

/// Encoded composite key: field values in definition order, terminated by the
/// node id for uniqueness.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexKey {
    pub values: Vec<FieldValue>,
    pub id: String,
}

// ============================================================================
// Comparator
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompareOptions {
    pub use_locale_compare: bool,
}

impl CompareOptions {
    pub fn locale() -> Self {
        Self {
            use_locale_compare: true,
        }
    }

    pub fn ordinal() -> Self {
        Self {
            use_locale_compare: false,
        }
    }
}

fn type_rank(v: &FieldValue) -> u8 {
    match v {
        FieldValue::Null => 0,
        FieldValue::Bool(_) => 1,
        FieldValue::Int(_) | FieldValue::Timestamp(_) => 2,
        FieldValue::Str(_) | FieldValue::Id(_) => 3,
    }
}

/// Collation used for `use_locale_compare`: case-insensitive primary weight
/// with an ordinal tie-break, so the ordering stays total and deterministic.
fn locale_cmp(a: &str, b: &str) -> Ordering {
    let folded = a
        .chars()
        .flat_map(|c| c.to_lowercase())
        .cmp(b.chars().flat_map(|c| c.to_lowercase()));
    if folded != Ordering::Equal {
        return folded;
    }
    a.cmp(b)
}

fn compare_values(opts: CompareOptions, a: &FieldValue, b: &FieldValue) -> Ordering {
    use FieldValue::*;
    match (a, b) {
        (Null, Null) => Ordering::Equal,
        (Bool(x), Bool(y)) => x.cmp(y),
        (Int(x) | Timestamp(x), Int(y) | Timestamp(y)) => x.cmp(y),
        (Str(x) | Id(x), Str(y) | Id(y)) => {
            if opts.use_locale_compare {
                locale_cmp(x, y)
            } else {
                x.cmp(y)
            }
        }
        // Mixed kinds order by a fixed rank so the comparator is total.
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Compare two values under a sort order. `Desc` is the exact negation of
/// `Asc`; the result is a total order, never "incomparable".
pub fn compare_with_sort(
    order: SortOrder,
    opts: CompareOptions,
    a: &FieldValue,
    b: &FieldValue,
) -> Ordering {
    let asc = compare_values(opts, a, b);
    match order {
        SortOrder::Asc => asc,
        SortOrder::Desc => asc.reverse(),
    }
}

// ============================================================================
// Binary search
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchResult {
    pub index: usize,
    pub found: bool,
}

/// Insertion-position search over a sorted sequence.
///
/// When multiple elements compare equal to `item`, the reported position is
/// the rightmost among them (stable append). Ties discovered concurrently
/// therefore keep their original sequence order, which downstream list
/// merging relies on; treat any change to this tie-break as a compatibility
/// break.
pub fn binary_search<T, F>(comparator: F, seq: &[T], item: &T) -> SearchResult
where
    F: Fn(&T, &T) -> Ordering,
{
    let mut lo = 0usize;
    let mut hi = seq.len();
    while lo < hi {
        let mid = (lo + hi) / 2;
        if comparator(&seq[mid], item) == Ordering::Greater {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    let found = lo > 0 && comparator(&seq[lo - 1], item) == Ordering::Equal;
    SearchResult { index: lo, found }
}

// ============================================================================
// Key sequences
// ============================================================================

pub(crate) type IndexId = (String, String);

#[derive(Debug, Default, Clone)]
pub(crate) struct IndexState {
    /// Sorted key sequence.
    pub keys: Vec<IndexKey>,
    /// Current key per node ordinal, for O(log n) repositioning.
    pub by_ordinal: HashMap<u32, IndexKey>,
}

pub(crate) fn compare_keys(
    def: &IndexDefinition,
    opts: CompareOptions,
    a: &IndexKey,
    b: &IndexKey,
) -> Ordering {
    for (i, comp) in def.components.iter().enumerate() {
        let av = a.values.get(i).unwrap_or(&FieldValue::Null);
        let bv = b.values.get(i).unwrap_or(&FieldValue::Null);
        let c = compare_with_sort(comp.order, opts, av, bv);
        if c != Ordering::Equal {
            return c;
        }
    }
    a.id.cmp(&b.id)
}

pub(crate) fn insert_key(ix: &mut IndexState, def: &IndexDefinition, key: IndexKey) {
    let opts = CompareOptions::locale();
    let res = binary_search(|a, b| compare_keys(def, opts, a, b), &ix.keys, &key);
    ix.keys.insert(res.index, key);
}

pub(crate) fn remove_key(ix: &mut IndexState, def: &IndexDefinition, key: &IndexKey) {
    let opts = CompareOptions::locale();
    let res = binary_search(|a, b| compare_keys(def, opts, a, b), &ix.keys, key);
    if res.found {
        // Keys are unique (the id is part of the comparator chain), so the
        // single equal element sits immediately left of the insertion point.
        ix.keys.remove(res.index - 1);
    }
}

/// Compute the key for `node` under `def`, or `None` when the node fails the
/// definition's eligibility conditions. Resolver failures during key
/// computation degrade to `Null` components rather than failing the commit.
pub(crate) fn compute_index_key(
    state: &GraphState,
    ctx: &GraphContext,
    node: &Node,
    def: &IndexDefinition,
) -> Option<IndexKey> {
    for cond in &def.conditions {
        match fields::computed_value(state, ctx, node, &cond.field, 0) {
            Ok(v) => {
                if v != cond.value {
                    return None;
                }
            }
            Err(err) => {
                tracing::warn!(
                    index = %def.name,
                    node = %node.id,
                    field = %cond.field,
                    error = %err,
                    "index condition failed to resolve, treating node as ineligible"
                );
                return None;
            }
        }
    }

    let mut values = Vec::with_capacity(def.components.len());
    for comp in &def.components {
        let v = match fields::computed_value(state, ctx, node, &comp.field, 0) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(
                    index = %def.name,
                    node = %node.id,
                    field = %comp.field,
                    error = %err,
                    "index component failed to resolve, indexing as null"
                );
                FieldValue::Null
            }
        };
        values.push(v);
    }
    Some(IndexKey {
        values,
        id: node.id.clone(),
    })
}

// ============================================================================
// Key decoding
// ============================================================================

/// Inverse of key encoding: produce a function that decodes a composite key
/// back into named field values (plus `id`). With `strip_only`, the constant
/// match-field prefix is omitted and only sort fields are returned.
pub fn indexed_values_from_key_factory(
    def: &IndexDefinition,
    strip_only: bool,
) -> impl Fn(&IndexKey) -> BTreeMap<String, FieldValue> {
    let def = def.clone();
    move |key: &IndexKey| {
        let mut out = BTreeMap::new();
        for (i, comp) in def.components.iter().enumerate() {
            if strip_only && comp.is_match_field {
                continue;
            }
            out.insert(
                comp.field.clone(),
                key.values.get(i).cloned().unwrap_or(FieldValue::Null),
            );
        }
        out.insert("id".to_string(), FieldValue::Id(key.id.clone()));
        out
    }
}

// ============================================================================
// Iteration
// ============================================================================

/// Forward-only lazy sequence of index keys. Every `get_iterator` call
/// yields a fresh sequence; it never resumes a prior one. The sequence is a
/// snapshot taken at creation time (see DESIGN.md on iterator isolation).
pub struct IndexIterator {
    inner: std::vec::IntoIter<IndexKey>,
}

impl IndexIterator {
    pub(crate) fn new(keys: Vec<IndexKey>) -> Self {
        Self {
            inner: keys.into_iter(),
        }
    }
}

impl Iterator for IndexIterator {
    type Item = IndexKey;

    fn next(&mut self) -> Option<IndexKey> {
        self.inner.next()
    }
}

/// Requested fields not covered by the chosen index. Purely a performance
/// signal for the query layer; it never affects correctness.
pub fn resolve_unindexed_paths(def: &IndexDefinition, requested: &[&str]) -> Vec<String> {
    let covered: BTreeSet<&str> = def
        .components
        .iter()
        .map(|c| c.field.as_str())
        .chain(std::iter::once("id"))
        .collect();
    let unindexed: Vec<String> = requested
        .iter()
        .filter(|f| !covered.contains(**f))
        .map(|f| f.to_string())
        .collect();
    if !unindexed.is_empty() {
        tracing::warn!(index = %def.name, unindexed = ?unindexed, "query touches un-indexed fields");
    }
    unindexed
}

// ============================================================================
// Store-level queries
// ============================================================================

impl GraphStore {
    /// Resolve the best published index whose match-field prefix and sort
    /// suffix satisfy the request. There is no implicit index creation at
    /// query time; an uncovered request is a configuration error.
    pub fn index_for_query(
        &self,
        node_type: &str,
        match_fields: &[&str],
        sort_fields: &[SortSpec],
        extra_fields: &[&str],
    ) -> Result<IndexDefinition, GraphError> {
        let schema = self
            .context()
            .schema
            .entity(node_type)
            .ok_or_else(|| GraphError::UnknownType(node_type.to_string()))?;

        let want_match: BTreeSet<&str> = match_fields.iter().copied().collect();
        let mut best: Option<(&IndexDefinition, usize)> = None;

        for def in &schema.indexes {
            let def_match: BTreeSet<&str> = def
                .components
                .iter()
                .filter(|c| c.is_match_field)
                .map(|c| c.field.as_str())
                .collect();
            if def_match != want_match {
                continue;
            }
            let sorts: Vec<&IndexComponent> = def.sort_components().collect();
            if sort_fields.len() > sorts.len() {
                continue;
            }
            let sorts_match = sort_fields
                .iter()
                .zip(&sorts)
                .all(|(want, have)| want.field == have.field && want.order == have.order);
            if !sorts_match {
                continue;
            }
            let covered = extra_fields
                .iter()
                .filter(|f| def.components.iter().any(|c| c.field == **f))
                .count();
            let better = match best {
                None => true,
                Some((prev, prev_covered)) => {
                    covered > prev_covered
                        || (covered == prev_covered
                            && def.components.len() < prev.components.len())
                }
            };
            if better {
                best = Some((def, covered));
            }
        }

        best.map(|(def, _)| def.clone()).ok_or_else(|| {
            GraphError::Configuration(format!(
                "no declared index on `{node_type}` covers match {match_fields:?} sort {:?}",
                sort_fields.iter().map(|s| &s.field).collect::<Vec<_>>()
            ))
        })
    }

    /// Produce a fresh iterator over the key sequence of `def`, restricted to
    /// the equality prefix given by `filter_values`. With `match_only`, the
    /// sequence ends when the prefix stops matching; otherwise it runs to the
    /// end of the index.
    pub fn get_iterator(
        &self,
        node_type: &str,
        def: &IndexDefinition,
        filter_values: &[FieldValue],
        direction: SortOrder,
        match_only: bool,
    ) -> Result<IndexIterator, GraphError> {
        if filter_values.len() > def.match_len() {
            return Err(GraphError::Configuration(format!(
                "index `{}` accepts at most {} filter values, got {}",
                def.name,
                def.match_len(),
                filter_values.len()
            )));
        }

        let state = self.state.read();
        let ix = state
            .indexes
            .get(&(node_type.to_string(), def.name.clone()))
            .ok_or_else(|| {
                GraphError::Configuration(format!(
                    "index `{}` is not registered for `{node_type}`",
                    def.name
                ))
            })?;

        let opts = CompareOptions::locale();
        let prefix_cmp = |key: &IndexKey| -> Ordering {
            for (i, fv) in filter_values.iter().enumerate() {
                let comp = &def.components[i];
                let kv = key.values.get(i).unwrap_or(&FieldValue::Null);
                let c = compare_with_sort(comp.order, opts, kv, fv);
                if c != Ordering::Equal {
                    return c;
                }
            }
            Ordering::Equal
        };

        let lower = ix.keys.partition_point(|k| prefix_cmp(k) == Ordering::Less);
        let upper = if match_only {
            ix.keys
                .partition_point(|k| prefix_cmp(k) != Ordering::Greater)
        } else {
            ix.keys.len()
        };
        let mut keys: Vec<IndexKey> = ix.keys[lower..upper.max(lower)].to_vec();
        if direction == SortOrder::Desc {
            keys.reverse();
        }
        Ok(IndexIterator::new(keys))
    }

    /// All keys currently held by an index, in order. Intended for tests and
    /// debugging.
    pub fn index_keys(&self, node_type: &str, index_name: &str) -> Vec<IndexKey> {
        let state = self.state.read();
        state
            .indexes
            .get(&(node_type.to_string(), index_name.to_string()))
            .map(|ix| ix.keys.clone())
            .unwrap_or_default()
    }
}
