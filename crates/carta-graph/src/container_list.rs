//! Merged container lists.
//!
//! Builds the flattened "containers with their members expanded" view used
//! by notebook/stack style listings: members without a container stay where
//! the index put them, each container is positioned among them by its own
//! sort value, and its members immediately follow it in the output.
//!
//! Containers are inserted with [`binary_search`], so a container whose sort
//! value ties with an uncontained member lands after it (stable append).

use std::collections::{BTreeMap, BTreeSet};

use crate::index::{binary_search, compare_with_sort, CompareOptions, SortSpec};
use crate::store::NodeRef;
use crate::FieldValue;

/// One listing row, decoded from an index key.
#[derive(Debug, Clone, PartialEq)]
pub struct ListEntry {
    pub node: NodeRef,
    pub fields: BTreeMap<String, FieldValue>,
    /// Id of the containing entity, when any.
    pub container: Option<String>,
}

impl ListEntry {
    pub fn new(node: NodeRef, fields: BTreeMap<String, FieldValue>) -> Self {
        Self {
            node,
            fields,
            container: None,
        }
    }

    pub fn in_container(mut self, container_id: &str) -> Self {
        self.container = Some(container_id.to_string());
        self
    }

    fn sort_value<'a>(&'a self, field: &str) -> &'a FieldValue {
        self.fields.get(field).unwrap_or(&FieldValue::Null)
    }
}

/// Merge `containers` and `members` (both already in index order for `sort`)
/// into a single flattened listing.
pub fn merge_container_list(
    containers: Vec<ListEntry>,
    members: Vec<ListEntry>,
    sort: &SortSpec,
) -> Vec<ListEntry> {
    let opts = CompareOptions::locale();
    let comparator = |a: &ListEntry, b: &ListEntry| {
        let mut cmp = compare_with_sort(
            sort.order,
            opts,
            a.sort_value(&sort.field),
            b.sort_value(&sort.field),
        );
        if sort.field != "label" && cmp == std::cmp::Ordering::Equal {
            cmp = compare_with_sort(sort.order, opts, a.sort_value("label"), b.sort_value("label"));
        }
        cmp
    };

    let container_types: BTreeSet<String> =
        containers.iter().map(|c| c.node.node_type.clone()).collect();

    let mut by_container: BTreeMap<String, Vec<ListEntry>> = BTreeMap::new();
    let mut list: Vec<ListEntry> = Vec::new();
    for member in members {
        match member.container.clone() {
            Some(id) => by_container.entry(id).or_default().push(member),
            None => list.push(member),
        }
    }

    for mut container in containers {
        // A container without its own sort value takes it from its first
        // member, so e.g. "sort by updated" positions a stack at its most
        // recently updated notebook.
        if container.sort_value(&sort.field).is_null() {
            let inherited = by_container
                .get(&container.node.id)
                .and_then(|m| m.first())
                .map(|m| m.sort_value(&sort.field).clone());
            if let Some(v) = inherited {
                if !v.is_null() {
                    container.fields.insert(sort.field.clone(), v);
                }
            }
        }
        let at = binary_search(&comparator, &list, &container).index;
        list.insert(at, container);
    }

    let mut out = Vec::with_capacity(list.len());
    for entry in list {
        let is_container = container_types.contains(&entry.node.node_type);
        let id = entry.node.id.clone();
        out.push(entry);
        if is_container {
            if let Some(members) = by_container.remove(&id) {
                out.extend(members);
            }
        }
    }
    out
}
