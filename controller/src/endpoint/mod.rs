//! Component E — Endpoint Tree Builder (spec §4.E).
//!
//! Turns a flat list of attribute reports into a rooted, acyclic endpoint
//! tree using the Descriptor cluster's `partsList`/`serverList`/`clientList`.
//! Implemented as an arena (spec §9 Design Note: "re-architect as an arena —
//! vector indexed by endpoint number — where children are stored as a
//! vector of indices") rather than the hash-map-with-parent-pointers shape
//! of the original design.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::collab::AttributeReport;
use crate::error::{ControllerError, Result};

pub const DESCRIPTOR_CLUSTER: u32 = 0x001D;
pub(crate) const ATTR_DEVICE_TYPE_LIST: u32 = 0;
pub(crate) const ATTR_SERVER_LIST: u32 = 1;
pub(crate) const ATTR_CLIENT_LIST: u32 = 2;
pub(crate) const ATTR_PARTS_LIST: u32 = 3;

const AGGREGATOR_DEVICE_TYPE: u32 = 0x000E;
const ROOT_ENDPOINT: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    Root,
    Aggregator,
    ComposedDevice,
    LeafDevice,
}

/// One node in the endpoint arena (spec §3 "Endpoint").
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub number: u16,
    pub role: EndpointRole,
    pub device_types: Vec<u32>,
    pub cluster_clients: Vec<u32>,
    pub cluster_servers: Vec<u32>,
    pub children: Vec<u16>,
    pub parent: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Descriptor {
    device_types: HashSet<u32>,
    server_list: HashSet<u32>,
    client_list: HashSet<u32>,
    parts_list: Vec<u16>,
}

/// Per-endpoint tree-diff outcome (spec §4.E step 5, Property P4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    Added(u16),
    Removed(u16),
    Changed(u16),
}

/// An arena-indexed endpoint tree, rooted at endpoint 0.
#[derive(Debug, Clone, Default)]
pub struct EndpointTree {
    nodes: HashMap<u16, Endpoint>,
}

impl EndpointTree {
    pub fn get(&self, number: u16) -> Option<&Endpoint> {
        self.nodes.get(&number)
    }

    pub fn endpoint_numbers(&self) -> Vec<u16> {
        let mut v: Vec<u16> = self.nodes.keys().copied().collect();
        v.sort_unstable();
        v
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn collect_descriptors(reports: &[AttributeReport]) -> HashMap<u16, Descriptor> {
    let mut descriptors: HashMap<u16, Descriptor> = HashMap::new();
    for report in reports {
        if report.cluster_id != DESCRIPTOR_CLUSTER {
            continue;
        }
        let entry = descriptors.entry(report.endpoint).or_insert_with(|| Descriptor {
            device_types: HashSet::new(),
            server_list: HashSet::new(),
            client_list: HashSet::new(),
            parts_list: Vec::new(),
        });
        match report.attribute_id {
            ATTR_DEVICE_TYPE_LIST => {
                entry.device_types = json_u32_set(&report.value);
            }
            ATTR_SERVER_LIST => {
                entry.server_list = json_u32_set(&report.value);
            }
            ATTR_CLIENT_LIST => {
                entry.client_list = json_u32_set(&report.value);
            }
            ATTR_PARTS_LIST => {
                entry.parts_list = json_u32_array(&report.value)
                    .into_iter()
                    .map(|v| v as u16)
                    .collect();
            }
            _ => {}
        }
    }
    descriptors
}

fn json_u32_array(value: &serde_json::Value) -> Vec<u32> {
    value
        .as_array()
        .map(|arr| arr.iter().filter_map(|v| v.as_u64()).map(|v| v as u32).collect())
        .unwrap_or_default()
}

fn json_u32_set(value: &serde_json::Value) -> HashSet<u32> {
    json_u32_array(value).into_iter().collect()
}

/// Follow `partsList` from endpoint 0 to find every reachable endpoint
/// (spec §4.E step 1). Endpoints without Descriptor data are dropped with a
/// warning.
fn reachable_endpoints(descriptors: &HashMap<u16, Descriptor>) -> Vec<u16> {
    let mut seen = HashSet::new();
    let mut stack = vec![ROOT_ENDPOINT];
    let mut order = Vec::new();
    while let Some(num) = stack.pop() {
        if !seen.insert(num) {
            continue;
        }
        match descriptors.get(&num) {
            Some(desc) => {
                order.push(num);
                for &child in &desc.parts_list {
                    if child != num && !seen.contains(&child) {
                        stack.push(child);
                    }
                }
            }
            None => {
                if num != ROOT_ENDPOINT {
                    warn!(endpoint = num, "endpoint referenced by partsList has no Descriptor data; dropping");
                }
            }
        }
    }
    order
}

fn role_for(number: u16, desc: &Descriptor) -> EndpointRole {
    if number == ROOT_ENDPOINT {
        EndpointRole::Root
    } else if desc.device_types.contains(&AGGREGATOR_DEVICE_TYPE) {
        EndpointRole::Aggregator
    } else if !desc.parts_list.is_empty() {
        EndpointRole::ComposedDevice
    } else {
        EndpointRole::LeafDevice
    }
}

fn same_shape(existing: &Endpoint, desc: &Descriptor) -> bool {
    let existing_types: HashSet<u32> = existing.device_types.iter().copied().collect();
    let existing_servers: HashSet<u32> = existing.cluster_servers.iter().copied().collect();
    let existing_clients: HashSet<u32> = existing.cluster_clients.iter().copied().collect();
    existing_types == desc.device_types
        && existing_servers == desc.server_list
        && existing_clients == desc.client_list
}

/// Assign parent links via the worklist algorithm from spec §4.E step 4:
/// repeatedly promote endpoints with exactly one remaining candidate
/// parent; a nonempty residue after the fixpoint is an unresolvable cycle.
fn assign_parents(
    endpoints: &[u16],
    descriptors: &HashMap<u16, Descriptor>,
) -> Result<HashMap<u16, Option<u16>>> {
    let mut endpoint_usages: HashMap<u16, Vec<u16>> = HashMap::new();
    for &num in endpoints {
        endpoint_usages.entry(num).or_default();
    }
    for &num in endpoints {
        if let Some(desc) = descriptors.get(&num) {
            for &child in &desc.parts_list {
                if child == num {
                    warn!(endpoint = num, "self-referencing partsList entry dropped");
                    continue;
                }
                if endpoint_usages.contains_key(&child) {
                    endpoint_usages.entry(child).or_default().push(num);
                }
            }
        }
    }

    let mut parents: HashMap<u16, Option<u16>> = HashMap::new();
    parents.insert(ROOT_ENDPOINT, None);
    endpoint_usages.remove(&ROOT_ENDPOINT);

    // Repeatedly promote any endpoint left with exactly one candidate
    // parent. An endpoint claimed by more than one parent stays deferred
    // until the ambiguity resolves down to one (spec §3 invariant); a
    // residue that never reaches length 1 is an unresolvable cycle.
    loop {
        let next = endpoint_usages
            .iter()
            .find(|(_, parents_list)| parents_list.len() == 1)
            .map(|(&child, parents_list)| (child, parents_list[0]));
        let Some((child, parent)) = next else {
            break;
        };
        endpoint_usages.remove(&child);
        parents.insert(child, Some(parent));
    }

    if !endpoint_usages.is_empty() {
        return Err(ControllerError::Internal(format!(
            "unresolvable endpoint parent cycle among {:?}",
            endpoint_usages.keys().collect::<Vec<_>>()
        )));
    }

    Ok(parents)
}

/// Build (or incrementally update) the endpoint tree (spec §4.E).
///
/// `previous` is `None` on first construction; passing the prior tree on an
/// incremental update enables the retain/recreate diff (step 2) and the
/// idempotence guarantee of Property P4 — an unchanged input produces the
/// same tree with no events.
pub fn build_tree(
    reports: &[AttributeReport],
    previous: Option<&EndpointTree>,
) -> Result<(EndpointTree, Vec<EndpointEvent>)> {
    let descriptors = collect_descriptors(reports);
    let reachable = reachable_endpoints(&descriptors);
    let parents = assign_parents(&reachable, &descriptors)?;

    let mut nodes: HashMap<u16, Endpoint> = HashMap::new();
    let mut events = Vec::new();

    for &num in &reachable {
        let desc = match descriptors.get(&num) {
            Some(d) => d,
            None => continue,
        };
        let role = role_for(num, desc);
        let existing = previous.and_then(|t| t.get(num));

        let retained = existing.map(|e| same_shape(e, desc)).unwrap_or(false);
        if retained {
            let mut carried = existing.unwrap().clone();
            carried.parent = parents.get(&num).copied().flatten();
            nodes.insert(num, carried);
        } else {
            nodes.insert(
                num,
                Endpoint {
                    number: num,
                    role,
                    device_types: desc.device_types.iter().copied().collect(),
                    cluster_servers: desc.server_list.iter().copied().collect(),
                    cluster_clients: desc.client_list.iter().copied().collect(),
                    children: Vec::new(),
                    parent: parents.get(&num).copied().flatten(),
                },
            );
            if existing.is_some() {
                events.push(EndpointEvent::Changed(num));
            } else if previous.is_some() {
                events.push(EndpointEvent::Added(num));
            }
        }
    }

    if let Some(prev_tree) = previous {
        for prev_num in prev_tree.endpoint_numbers() {
            if !nodes.contains_key(&prev_num) {
                events.push(EndpointEvent::Removed(prev_num));
            }
        }
    }

    let reachable_set: HashSet<u16> = reachable.iter().copied().collect();
    for &num in &reachable {
        if let Some(desc) = descriptors.get(&num) {
            let children: Vec<u16> = desc
                .parts_list
                .iter()
                .copied()
                .filter(|c| *c != num && reachable_set.contains(c) && parents.get(c).copied().flatten() == Some(num))
                .collect();
            if let Some(node) = nodes.get_mut(&num) {
                node.children = children;
            }
        }
    }

    events.sort_by_key(|e| match e {
        EndpointEvent::Added(n) | EndpointEvent::Removed(n) | EndpointEvent::Changed(n) => *n,
    });

    Ok((EndpointTree { nodes }, events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor_reports(endpoint: u16, device_types: &[u32], servers: &[u32], clients: &[u32], parts: &[u16]) -> Vec<AttributeReport> {
        vec![
            AttributeReport {
                endpoint,
                cluster_id: DESCRIPTOR_CLUSTER,
                attribute_id: ATTR_DEVICE_TYPE_LIST,
                value: json!(device_types),
                data_version: 1,
            },
            AttributeReport {
                endpoint,
                cluster_id: DESCRIPTOR_CLUSTER,
                attribute_id: ATTR_SERVER_LIST,
                value: json!(servers),
                data_version: 1,
            },
            AttributeReport {
                endpoint,
                cluster_id: DESCRIPTOR_CLUSTER,
                attribute_id: ATTR_CLIENT_LIST,
                value: json!(clients),
                data_version: 1,
            },
            AttributeReport {
                endpoint,
                cluster_id: DESCRIPTOR_CLUSTER,
                attribute_id: ATTR_PARTS_LIST,
                value: json!(parts),
                data_version: 1,
            },
        ]
    }

    fn scenario_3_initial() -> Vec<AttributeReport> {
        let mut reports = descriptor_reports(0, &[], &[DESCRIPTOR_CLUSTER], &[], &[1, 2]);
        reports.extend(descriptor_reports(1, &[0x0100], &[DESCRIPTOR_CLUSTER], &[], &[]));
        reports.extend(descriptor_reports(2, &[0x0103], &[DESCRIPTOR_CLUSTER], &[], &[]));
        reports
    }

    #[test]
    fn builds_root_with_two_leaf_children() {
        let (tree, events) = build_tree(&scenario_3_initial(), None).unwrap();
        assert_eq!(tree.endpoint_numbers(), vec![0, 1, 2]);
        assert_eq!(tree.get(0).unwrap().role, EndpointRole::Root);
        assert_eq!(tree.get(1).unwrap().role, EndpointRole::LeafDevice);
        assert_eq!(tree.get(0).unwrap().children, vec![1, 2]);
        assert!(events.is_empty(), "first construction (previous=None) emits no diff events");
    }

    #[test]
    fn idempotent_rebuild_emits_no_events_property_p4() {
        let (tree1, _) = build_tree(&scenario_3_initial(), None).unwrap();
        let (tree2, events) = build_tree(&scenario_3_initial(), Some(&tree1)).unwrap();
        assert!(events.is_empty());
        assert_eq!(tree1.endpoint_numbers(), tree2.endpoint_numbers());
    }

    #[test]
    fn structure_change_removes_and_adds_endpoints() {
        // Scenario 3: partsList changes from [1,2] to [1,3].
        let (tree1, _) = build_tree(&scenario_3_initial(), None).unwrap();

        let mut reports = descriptor_reports(0, &[], &[DESCRIPTOR_CLUSTER], &[], &[1, 3]);
        reports.extend(descriptor_reports(1, &[0x0100], &[DESCRIPTOR_CLUSTER], &[], &[]));
        reports.extend(descriptor_reports(3, &[0x0103], &[DESCRIPTOR_CLUSTER], &[], &[]));

        let (tree2, events) = build_tree(&reports, Some(&tree1)).unwrap();
        assert_eq!(tree2.endpoint_numbers(), vec![0, 1, 3]);
        assert!(events.contains(&EndpointEvent::Removed(2)));
        assert!(events.contains(&EndpointEvent::Added(3)));
    }

    #[test]
    fn self_referencing_parts_list_is_dropped_not_fatal() {
        // Scenario 5: endpoint 1 lists itself and 2 in partsList.
        let mut reports = descriptor_reports(0, &[], &[], &[], &[1]);
        reports.extend(descriptor_reports(1, &[0x0100], &[], &[], &[1, 2]));
        reports.extend(descriptor_reports(2, &[0x0103], &[], &[], &[]));

        let (tree, _) = build_tree(&reports, None).unwrap();
        assert_eq!(tree.endpoint_numbers(), vec![0, 1, 2]);
        assert_eq!(tree.get(1).unwrap().children, vec![2]);
        assert_eq!(tree.get(2).unwrap().parent, Some(1));
    }

    #[test]
    fn aggregator_device_type_assigns_aggregator_role() {
        let mut reports = descriptor_reports(0, &[], &[], &[], &[1]);
        reports.extend(descriptor_reports(1, &[AGGREGATOR_DEVICE_TYPE], &[], &[], &[2]));
        reports.extend(descriptor_reports(2, &[0x0100], &[], &[], &[]));

        let (tree, _) = build_tree(&reports, None).unwrap();
        assert_eq!(tree.get(1).unwrap().role, EndpointRole::Aggregator);
    }

    #[test]
    fn chained_parentage_resolves_without_cycle_error() {
        let mut reports = descriptor_reports(0, &[], &[], &[], &[1]);
        reports.extend(descriptor_reports(1, &[0x0100], &[], &[], &[2]));
        reports.extend(descriptor_reports(2, &[0x0100], &[], &[], &[]));

        let result = build_tree(&reports, None);
        assert!(result.is_ok());
    }

    #[test]
    fn unresolvable_cycle_raises_internal_error() {
        // 1 and 2 are both claimed by 0 and by 3, and 3 is claimed only by
        // 1 and 2 — no endpoint ever reduces to a single candidate parent.
        let mut reports = descriptor_reports(0, &[], &[], &[], &[1, 2]);
        reports.extend(descriptor_reports(1, &[0x0100], &[], &[], &[3]));
        reports.extend(descriptor_reports(2, &[0x0100], &[], &[], &[3]));
        reports.extend(descriptor_reports(3, &[0x0100], &[], &[], &[1, 2]));

        let result = build_tree(&reports, None);
        assert!(matches!(result, Err(ControllerError::Internal(_))));
    }

    #[test]
    fn retained_endpoint_keeps_identity_across_rebuild() {
        let (tree1, _) = build_tree(&scenario_3_initial(), None).unwrap();
        let (tree2, events) = build_tree(&scenario_3_initial(), Some(&tree1)).unwrap();
        assert_eq!(tree2.get(1).unwrap().device_types, tree1.get(1).unwrap().device_types);
        assert!(events.is_empty());
    }
}
