use std::collections::BTreeMap;

use carta_graph::{
    merge_container_list, FieldValue, ListEntry, NodeRef, SortOrder, SortSpec,
};

fn entry(node_type: &str, id: &str, label: &str) -> ListEntry {
    let mut fields = BTreeMap::new();
    fields.insert("label".to_string(), FieldValue::from(label));
    ListEntry::new(NodeRef::new(node_type, id), fields)
}

fn labels(list: &[ListEntry]) -> Vec<&str> {
    list.iter()
        .map(|e| e.fields.get("label").and_then(|v| v.as_str()).unwrap_or(""))
        .collect()
}

#[test]
fn stack_is_positioned_by_its_own_label_with_members_following() {
    let stacks = vec![entry("Stack", "s1", "Mango")];
    let notebooks = vec![
        entry("Notebook", "nb-alpha", "Alpha").in_container("s1"),
        entry("Notebook", "nb-zeta", "Zeta"),
    ];

    let merged = merge_container_list(
        stacks,
        notebooks,
        &SortSpec::new("label", SortOrder::Asc),
    );

    // The stack sorts by its own label among unstacked notebooks, and its
    // member notebooks immediately follow it.
    assert_eq!(labels(&merged), vec!["Mango", "Alpha", "Zeta"]);
    assert_eq!(merged[0].node, NodeRef::new("Stack", "s1"));
}

#[test]
fn tied_labels_keep_original_sequence_order() {
    let stacks = vec![entry("Stack", "s1", "Same")];
    let notebooks = vec![entry("Notebook", "nb1", "Same")];

    let merged = merge_container_list(
        stacks,
        notebooks,
        &SortSpec::new("label", SortOrder::Asc),
    );

    // Rightmost insertion among equals: the notebook that was already in
    // the sequence stays first, the stack appends after it.
    assert_eq!(merged[0].node, NodeRef::new("Notebook", "nb1"));
    assert_eq!(merged[1].node, NodeRef::new("Stack", "s1"));
}

#[test]
fn container_without_sort_value_inherits_it_from_its_first_member() {
    let stack = entry("Stack", "s1", "Stacked");

    let mut nb_old = entry("Notebook", "nb-old", "Old").in_container("s1");
    nb_old
        .fields
        .insert("updated".to_string(), FieldValue::Timestamp(100));
    let mut nb_new = entry("Notebook", "nb-new", "New");
    nb_new
        .fields
        .insert("updated".to_string(), FieldValue::Timestamp(200));

    let merged = merge_container_list(
        vec![stack],
        vec![nb_new, nb_old],
        &SortSpec::new("updated", SortOrder::Desc),
    );

    // The stack has no `updated` of its own; it inherits 100 from its first
    // member and therefore lands after the fresher unstacked notebook.
    assert_eq!(
        merged.iter().map(|e| e.node.id.as_str()).collect::<Vec<_>>(),
        vec!["nb-new", "s1", "nb-old"]
    );
}

#[test]
fn empty_inputs_produce_an_empty_list() {
    let merged = merge_container_list(vec![], vec![], &SortSpec::new("label", SortOrder::Asc));
    assert!(merged.is_empty());
}
