use std::collections::BTreeSet;
use std::collections::HashSet;

use tracing::debug;
use tracing::error;
use tracing::trace;
use tracing::warn;

use super::Applied;
use super::DumpError;
use super::Node;
use super::SchedulerState;
use super::TxnItem;
use super::ValueState;
use crate::DescriptorError;
use crate::KvWithMetadata;
use crate::Registry;
use crate::Result;
use crate::ValueOrigin;

/// Result of refreshing the SB view.
#[derive(Debug, Default)]
pub(crate) struct Refresh {
    pub(crate) dump_errors: Vec<DumpError>,
    /// Descriptors whose keys stay out of this reconciliation pass
    pub(crate) excluded: HashSet<String>,
}

/// Re-reads the SB state of every dumpable descriptor, in dump order, into
/// the applied view of the scheduler state.
///
/// `desired` is used as correlation on the first resync; afterwards the
/// applied view is. Dumped values not claimed by the SB are treated as NB
/// values: if NB no longer wants them, they get deleted.
pub(crate) async fn refresh(
    registry: &Registry,
    state: &mut SchedulerState,
    desired: &[TxnItem],
) -> Result<Refresh> {
    let descriptors = registry.get_all_descriptors()?;
    let first_resync = state.resync_count <= 1;
    let mut outcome = Refresh::default();
    let mut dumped_descriptors: HashSet<String> = HashSet::new();
    let mut refreshed: BTreeSet<String> = BTreeSet::new();

    for descriptor in descriptors {
        let correlate: Vec<KvWithMetadata> = if first_resync {
            desired
                .iter()
                .filter(|item| descriptor.selects(&item.key))
                .filter_map(|item| {
                    item.value
                        .clone()
                        .map(|v| KvWithMetadata::new(item.key.clone(), v).with_origin(ValueOrigin::FromNb))
                })
                .collect()
        } else {
            let mut correlate: Vec<KvWithMetadata> = state
                .nodes
                .values()
                .filter(|n| n.descriptor_name() == Some(descriptor.name.as_str()))
                .filter_map(|n| {
                    n.applied.as_ref().map(|a| KvWithMetadata {
                        key: n.key.clone(),
                        value: a.value.clone(),
                        metadata: a.metadata.clone(),
                        origin: n.origin,
                    })
                })
                .collect();
            correlate.sort_by(|a, b| a.key.cmp(&b.key));
            correlate
        };

        let dumped = match descriptor.handler.dump(&correlate).await {
            Ok(dumped) => dumped,
            Err(DescriptorError::Unimplemented(_)) => {
                trace!("Descriptor {} does not support dump", descriptor.name);
                continue;
            }
            Err(e) => {
                error!("Failed to dump descriptor {}: {}", descriptor.name, e);
                outcome.excluded.insert(descriptor.name.clone());
                outcome.dump_errors.push(DumpError {
                    descriptor: descriptor.name.clone(),
                    error: e,
                });
                continue;
            }
        };
        debug!("Descriptor {} dumped {} values", descriptor.name, dumped.len());
        dumped_descriptors.insert(descriptor.name.clone());

        let mut seen: HashSet<String> = HashSet::new();
        for kv in dumped {
            if !descriptor.selects(&kv.key) {
                warn!("Descriptor {} dumped key {} it does not select", descriptor.name, kv.key);
                continue;
            }
            let nb_managed = state
                .nodes
                .get(&kv.key)
                .is_some_and(|n| n.origin == ValueOrigin::FromNb && (n.value.is_some() || n.is_derived()));
            let correlated = correlate.iter().find(|c| c.key == kv.key).map(|c| c.origin);
            let origin = match (kv.origin, correlated) {
                _ if nb_managed => ValueOrigin::FromNb,
                (ValueOrigin::FromSb, _) => ValueOrigin::FromSb,
                (_, Some(ValueOrigin::FromSb)) => ValueOrigin::FromSb,
                _ => ValueOrigin::FromNb,
            };

            let node = state.nodes.entry(kv.key.clone()).or_insert_with(|| Node::new(&kv.key));
            node.descriptor = Some(descriptor.clone());
            node.applied = Some(Applied {
                value: kv.value.clone(),
                metadata: if descriptor.with_metadata { kv.metadata } else { None },
            });
            node.origin = origin;
            match origin {
                ValueOrigin::FromSb => {
                    node.value = Some(kv.value);
                    node.state = ValueState::Obtained;
                }
                _ => {
                    if node.state != ValueState::Failed {
                        node.state = ValueState::Configured;
                    }
                }
            }
            seen.insert(kv.key.clone());
            refreshed.insert(kv.key);
        }

        // Values the engine believed applied but the SB no longer has.
        let vanished = state.sorted_keys(|n| {
            n.is_applied() && n.descriptor_name() == Some(descriptor.name.as_str()) && !seen.contains(&n.key)
        });
        for key in vanished {
            let Some(node) = state.nodes.get_mut(&key) else {
                continue;
            };
            if node.origin == ValueOrigin::FromSb {
                state.nodes.remove(&key);
                continue;
            }
            debug!("Value {} is missing southbound", key);
            node.applied = None;
            node.state = ValueState::NonExistent;
        }
    }

    link_derived_values(registry, state, &refreshed, &dumped_descriptors, &outcome.excluded);
    Ok(outcome)
}

/// Re-attaches derived values to refreshed bases. Derived values without a
/// dumpable descriptor cannot be observed and are assumed to exist with
/// their base.
fn link_derived_values(
    registry: &Registry,
    state: &mut SchedulerState,
    refreshed: &BTreeSet<String>,
    dumped_descriptors: &HashSet<String>,
    excluded: &HashSet<String>,
) {
    for base in refreshed {
        let Some(node) = state.nodes.get(base) else {
            continue;
        };
        if node.is_derived() || node.origin == ValueOrigin::FromSb {
            continue;
        }
        let (Some(descriptor), Some(applied)) = (node.descriptor.clone(), node.applied.clone()) else {
            continue;
        };

        let derived = descriptor.handler.derived_values(base, &applied.value);
        if let Some(node) = state.nodes.get_mut(base) {
            node.derived = derived.iter().map(|kv| kv.key.clone()).collect();
        }

        for kv in derived {
            let derived_descriptor = registry.get_descriptor_for_key(&kv.key);
            let observed = derived_descriptor
                .as_ref()
                .is_some_and(|d| dumped_descriptors.contains(&d.name) || excluded.contains(&d.name));
            let node = state.nodes.entry(kv.key.clone()).or_insert_with(|| Node::new(&kv.key));
            node.derived_from = Some(base.clone());
            node.origin = ValueOrigin::FromNb;
            if observed {
                continue;
            }
            let metadata = node.applied.take().and_then(|a| a.metadata);
            node.descriptor = derived_descriptor;
            node.value = Some(kv.value.clone());
            node.applied = Some(Applied {
                value: kv.value,
                metadata,
            });
            node.state = ValueState::Configured;
        }
    }
}

/// Builds the item list of a resync: the desired values plus deletes of NB
/// values that are no longer desired. Keys of excluded descriptors are left
/// out entirely.
pub(crate) fn resync_items(
    registry: &Registry,
    state: &SchedulerState,
    desired: Vec<TxnItem>,
    excluded: &HashSet<String>,
) -> Vec<TxnItem> {
    let is_excluded = |key: &str| {
        registry
            .get_descriptor_for_key(key)
            .is_some_and(|d| excluded.contains(&d.name))
    };

    let desired_keys: HashSet<String> = desired.iter().map(|i| i.key.clone()).collect();
    let mut items: Vec<TxnItem> = desired.into_iter().filter(|i| !is_excluded(&i.key)).collect();

    let obsolete = state.sorted_keys(|n| {
        !n.is_derived()
            && n.origin == ValueOrigin::FromNb
            && !desired_keys.contains(&n.key)
            && (n.value.is_some() || n.is_applied())
    });
    items.extend(
        obsolete
            .into_iter()
            .filter(|k| !is_excluded(k))
            .map(|k| TxnItem::new(k, None)),
    );
    items
}
