use super::SchedulerState;
use super::TxnItem;
use crate::utils::topological_order;
use crate::Dependency;
use crate::Registry;

/// Orders transaction items for execution.
///
/// Deletes go first, dependents before their dependencies. Puts follow,
/// dependencies before dependents. Derived values of the puts take part in
/// the ordering (a put may depend on a value derived by another put) but are
/// not returned: they are applied right after their base.
/// Ties and cycles fall back to submission order.
pub(crate) fn order_items(
    registry: &Registry,
    state: &SchedulerState,
    items: Vec<TxnItem>,
) -> Vec<TxnItem> {
    let (deletes, puts): (Vec<TxnItem>, Vec<TxnItem>) = items.into_iter().partition(|i| !i.is_put());

    let mut ordered = order_deletes(state, deletes);
    ordered.extend(order_puts(registry, puts));
    ordered
}

fn order_deletes(
    state: &SchedulerState,
    deletes: Vec<TxnItem>,
) -> Vec<TxnItem> {
    let mut edges = Vec::new();
    for (i, item) in deletes.iter().enumerate() {
        let Some(node) = state.nodes.get(&item.key) else {
            continue;
        };
        for (j, other) in deletes.iter().enumerate() {
            if i != j && node.depends_on(&other.key) {
                // The dependent goes first.
                edges.push((i, j));
            }
        }
    }
    reorder(deletes, &edges)
}

/// Entry of the put-ordering graph.
struct PutEntry {
    key: String,
    dependencies: Vec<Dependency>,
    /// Index of the base entry for derived placeholders
    base: Option<usize>,
}

fn order_puts(
    registry: &Registry,
    puts: Vec<TxnItem>,
) -> Vec<TxnItem> {
    let mut entries: Vec<PutEntry> = Vec::with_capacity(puts.len());
    for item in &puts {
        let dependencies = match (registry.get_descriptor_for_key(&item.key), &item.value) {
            (Some(d), Some(value)) => d.handler.dependencies(&item.key, value),
            _ => Vec::new(),
        };
        entries.push(PutEntry {
            key: item.key.clone(),
            dependencies,
            base: None,
        });
    }

    // Derived placeholders are appended after the submitted items.
    for (base, item) in puts.iter().enumerate() {
        let (Some(d), Some(value)) = (registry.get_descriptor_for_key(&item.key), &item.value) else {
            continue;
        };
        for derived in d.handler.derived_values(&item.key, value) {
            let dependencies = registry
                .get_descriptor_for_key(&derived.key)
                .map(|dd| dd.handler.dependencies(&derived.key, &derived.value))
                .unwrap_or_default();
            entries.push(PutEntry {
                key: derived.key,
                dependencies,
                base: Some(base),
            });
        }
    }

    let mut edges = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        if let Some(base) = entry.base {
            edges.push((base, i));
        }
        for (j, other) in entries.iter().enumerate() {
            if i != j && entry.dependencies.iter().any(|d| d.matches(&other.key)) {
                // The dependency goes first.
                edges.push((j, i));
            }
        }
    }

    let order = topological_order(entries.len(), &edges);
    let submitted = puts.len();
    let mut slots: Vec<Option<TxnItem>> = puts.into_iter().map(Some).collect();
    order
        .ordered
        .into_iter()
        .chain(order.cyclic)
        .filter(|&i| i < submitted)
        .filter_map(|i| slots[i].take())
        .collect()
}

fn reorder(
    items: Vec<TxnItem>,
    edges: &[(usize, usize)],
) -> Vec<TxnItem> {
    let order = topological_order(items.len(), edges);
    let mut slots: Vec<Option<TxnItem>> = items.into_iter().map(Some).collect();
    order
        .ordered
        .into_iter()
        .chain(order.cyclic)
        .filter_map(|i| slots[i].take())
        .collect()
}
