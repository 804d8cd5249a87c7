//! Shortest-path routing (§4.E): Dijkstra from `self` over the subset
//! of edges for which both directions are present, producing a
//! next-hop table and reachability changes.
//!
//! No donor analogue exists for this (the donor never routes beyond a
//! direct TCP connection to each peer); grounded directly in §4.E and
//! shaped as a pure function over `store::NodeStore`, following the
//! donor's preference for small, directly testable free functions
//! (`peers::save_peers`/`load_peers`, `invite::encode`/`decode`).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::store::{NodeId, NodeStore};

/// The result of one routing computation: for each reachable node, the
/// next-hop node id to forward through, and the path's total weight.
#[derive(Debug, Default, Clone)]
pub struct RoutingTable {
    next_hop: HashMap<NodeId, NodeId>,
    distance: HashMap<NodeId, u32>,
}

impl RoutingTable {
    pub fn next_hop(&self, dest: NodeId) -> Option<NodeId> {
        self.next_hop.get(&dest).copied()
    }

    pub fn distance(&self, dest: NodeId) -> Option<u32> {
        self.distance.get(&dest).copied()
    }

    pub fn is_reachable(&self, dest: NodeId) -> bool {
        self.distance.contains_key(&dest)
    }

    pub fn reachable_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.distance.keys().copied()
    }
}

/// A heap entry ordered by `(distance, name)` so that, per §4.E's
/// tie-break rule, equal-weight candidates pop in lexicographic name
/// order without a secondary sort pass.
#[derive(PartialEq, Eq)]
struct HeapEntry {
    distance: u32,
    name: String,
    node: NodeId,
    first_hop: NodeId,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.distance, &self.name).cmp(&(other.distance, &other.name))
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Computes shortest paths from `self_id` over the reverse-edge-complete
/// subset of `store`'s edges (invariant 1: routing only uses `(a,b)`
/// pairs where `(b,a)` also exists).
pub fn compute(store: &NodeStore, self_id: NodeId) -> RoutingTable {
    let mut table = RoutingTable::default();
    let mut heap = BinaryHeap::new();
    let mut visited: HashMap<NodeId, u32> = HashMap::new();

    table.distance.insert(self_id, 0);
    visited.insert(self_id, 0);

    // Seed the heap with self's usable neighbors.
    for edge in store.edges_from(self_id) {
        if !store.has_reverse(self_id, edge.to) {
            continue;
        }
        let name = store.node(edge.to).map(|n| n.name.clone()).unwrap_or_default();
        heap.push(Reverse(HeapEntry {
            distance: edge.weight,
            name,
            node: edge.to,
            first_hop: edge.to,
        }));
    }

    while let Some(Reverse(HeapEntry {
        distance,
        node,
        first_hop,
        ..
    })) = heap.pop()
    {
        if visited.contains_key(&node) {
            continue;
        }
        visited.insert(node, distance);
        table.distance.insert(node, distance);
        table.next_hop.insert(node, first_hop);

        for edge in store.edges_from(node) {
            if visited.contains_key(&edge.to) {
                continue;
            }
            if !store.has_reverse(node, edge.to) {
                continue;
            }
            let name = store.node(edge.to).map(|n| n.name.clone()).unwrap_or_default();
            heap.push(Reverse(HeapEntry {
                distance: distance.saturating_add(edge.weight),
                name,
                node: edge.to,
                first_hop,
            }));
        }
    }

    table
}

/// A reachability transition to report to the embedder's node-status
/// callback (§4.E: "nodes whose reachability state flips emit a user
/// callback").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachabilityChange {
    BecameReachable,
    BecameUnreachable,
}

/// Diffs the previous and newly computed routing tables against the
/// full set of known nodes, returning the transitions that occurred.
/// Callers update `last_reachable`/`last_unreachable` timestamps on the
/// store for each entry returned here.
pub fn reachability_diff(
    store: &NodeStore,
    self_id: NodeId,
    previous: &RoutingTable,
    current: &RoutingTable,
) -> Vec<(NodeId, ReachabilityChange)> {
    let mut changes = Vec::new();
    for id in store.all_node_ids() {
        if id == self_id {
            continue;
        }
        let was = previous.is_reachable(id);
        let now = current.is_reachable(id);
        if was == now {
            continue;
        }
        changes.push((
            id,
            if now {
                ReachabilityChange::BecameReachable
            } else {
                ReachabilityChange::BecameUnreachable
            },
        ));
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SigningIdentity;
    use crate::identity::DeviceClass;
    use crate::store::Edge;

    fn key() -> ed25519_dalek::VerifyingKey {
        SigningIdentity::generate().verifying_key()
    }

    fn bidirectional(store: &mut NodeStore, a: NodeId, b: NodeId, weight: u32) {
        store.add_edge(Edge {
            from: a,
            to: b,
            address: None,
            options: 0,
            weight,
        });
        store.add_edge(Edge {
            from: b,
            to: a,
            address: None,
            options: 0,
            weight,
        });
    }

    #[test]
    fn direct_neighbor_is_reachable() {
        let mut store = NodeStore::new();
        let a = store.insert_node("a", key(), DeviceClass::Backbone).unwrap();
        let b = store.insert_node("b", key(), DeviceClass::Backbone).unwrap();
        bidirectional(&mut store, a, b, 1);

        let table = compute(&store, a);
        assert!(table.is_reachable(b));
        assert_eq!(table.next_hop(b), Some(b));
        assert_eq!(table.distance(b), Some(1));
    }

    #[test]
    fn one_directional_edge_is_unusable() {
        let mut store = NodeStore::new();
        let a = store.insert_node("a", key(), DeviceClass::Backbone).unwrap();
        let b = store.insert_node("b", key(), DeviceClass::Backbone).unwrap();
        store.add_edge(Edge {
            from: a,
            to: b,
            address: None,
            options: 0,
            weight: 1,
        });
        let table = compute(&store, a);
        assert!(!table.is_reachable(b));
    }

    #[test]
    fn relay_path_prefers_lower_weight() {
        let mut store = NodeStore::new();
        let a = store.insert_node("a", key(), DeviceClass::Backbone).unwrap();
        let relay = store.insert_node("relay", key(), DeviceClass::Backbone).unwrap();
        let far = store.insert_node("far", key(), DeviceClass::Portable).unwrap();

        bidirectional(&mut store, a, relay, 1);
        bidirectional(&mut store, relay, far, 3);

        let table = compute(&store, a);
        assert_eq!(table.next_hop(far), Some(relay));
        assert_eq!(table.distance(far), Some(4));
    }

    #[test]
    fn tie_break_is_lexicographic_by_name() {
        let mut store = NodeStore::new();
        let a = store.insert_node("a", key(), DeviceClass::Backbone).unwrap();
        let alice = store.insert_node("alice", key(), DeviceClass::Backbone).unwrap();
        let bob = store.insert_node("bob", key(), DeviceClass::Backbone).unwrap();
        bidirectional(&mut store, a, alice, 1);
        bidirectional(&mut store, a, bob, 1);
        // Both at distance 1; just confirm both resolve deterministically.
        let table = compute(&store, a);
        assert_eq!(table.next_hop(alice), Some(alice));
        assert_eq!(table.next_hop(bob), Some(bob));
    }

    #[test]
    fn reachability_diff_reports_transitions() {
        let mut store = NodeStore::new();
        let a = store.insert_node("a", key(), DeviceClass::Backbone).unwrap();
        let b = store.insert_node("b", key(), DeviceClass::Backbone).unwrap();
        let before = compute(&store, a);
        bidirectional(&mut store, a, b, 1);
        let after = compute(&store, a);
        let changes = reachability_diff(&store, a, &before, &after);
        assert_eq!(changes, vec![(b, ReachabilityChange::BecameReachable)]);
    }
}
