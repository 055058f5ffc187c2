//! Orders items so that nothing is written to a store before the items it depends on.
use std::collections::HashMap;

use itertools::Itertools;

use crate::item::{DataKind, ItemDescriptor};

/// Items of one kind with their keys, in write order.
pub type KeyedItems = Vec<(String, ItemDescriptor)>;

/// Item collections by kind, in write order.
pub type Collections = Vec<(DataKind, KeyedItems)>;

/// Sorts collections for writing.
///
/// Kinds come out in [DataKind] order, segments before features, with collections of the same kind
/// merged. Within a kind every item follows the items of that kind it references: a flag follows
/// its prerequisites, a segment follows the segments its rules mention. References to keys that are
/// not present are ignored, and cycles are broken at the point where they are found. All entries
/// for a key are emitted together, in their original relative order.
pub fn sort_collections(
    collections: impl IntoIterator<Item = (DataKind, KeyedItems)>,
) -> Collections {
    collections
        .into_iter()
        .into_group_map()
        .into_iter()
        .sorted_by_key(|(kind, _)| *kind)
        .map(|(kind, groups)| (kind, sort_items(groups.into_iter().flatten().collect())))
        .collect()
}

/// Orders the items of a single kind, preserving encounter order among independent items.
pub fn sort_items(items: KeyedItems) -> KeyedItems {
    let mut order = Vec::new();
    let mut pending: HashMap<String, Vec<ItemDescriptor>> = HashMap::new();
    let total = items.len();
    for (key, descriptor) in items {
        pending
            .entry(key)
            .or_insert_with_key(|key| {
                order.push(key.clone());
                Vec::new()
            })
            .push(descriptor);
    }

    let mut sorted = Vec::with_capacity(total);
    for key in &order {
        visit(key, &mut pending, &mut sorted);
    }
    sorted
}

fn visit(key: &str, pending: &mut HashMap<String, Vec<ItemDescriptor>>, sorted: &mut KeyedItems) {
    // Removing the entry marks it visited, which also stops cycles.
    let descriptors = match pending.remove(key) {
        Some(descriptors) => descriptors,
        None => return,
    };

    let dependencies: Vec<String> = descriptors
        .iter()
        .filter_map(|descriptor| descriptor.item.as_deref())
        .flat_map(|item| item.same_kind_dependencies())
        .unique()
        .map(str::to_string)
        .collect();
    for dependency in dependencies {
        visit(&dependency, pending, sorted);
    }

    sorted.extend(
        descriptors
            .into_iter()
            .map(|descriptor| (key.to_string(), descriptor)),
    );
}
