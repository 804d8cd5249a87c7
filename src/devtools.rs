//! Introspection helpers (§4.K: `devtool_*`).
//!
//! Per REDESIGN FLAGS, the donor's SIGALRM-driven periodic status dump
//! is replaced with plain on-demand accessors over `store::NodeStore`
//! and `routing::RoutingTable` — callable at any time rather than tied
//! to a signal handler, matching this crate's callback-driven design
//! (§4.K) instead of the donor's `main.rs` timer loop.

use serde::Serialize;

use crate::routing::RoutingTable;
use crate::store::{NodeId, NodeStore};
use crate::udp::{PathState, PmtuProbe};

/// Snapshot of one node's routing/reachability status (§4.K:
/// `devtool_get_node_status`). The `mtu`/`minmtu`/`maxmtu`/`udp_status`
/// fields surface the live PMTU probe state from `MeshState.pmtu` so that
/// spec.md §8 scenario 3 ("devtool_get_node_status(nut, peer).mtu settles
/// into [700, 800]") can be observed through this one accessor rather than
/// the separate `get_pmtu` call.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub name: String,
    pub reachable: bool,
    pub distance: Option<u32>,
    pub next_hop: Option<String>,
    pub blacklisted: bool,
    pub device_class: crate::identity::DeviceClass,
    pub udp_status: Option<PathState>,
    pub minmtu: Option<u16>,
    pub maxmtu: Option<u16>,
    pub mtu: Option<u16>,
}

pub fn get_node_status(
    store: &NodeStore,
    table: &RoutingTable,
    id: NodeId,
    pmtu: &std::collections::HashMap<String, PmtuProbe>,
) -> Option<NodeStatus> {
    let node = store.node(id)?;
    let probe = pmtu.get(&node.name);
    Some(NodeStatus {
        name: node.name.clone(),
        reachable: table.is_reachable(id),
        distance: table.distance(id),
        next_hop: table
            .next_hop(id)
            .and_then(|hop| store.node(hop))
            .map(|n| n.name.clone()),
        blacklisted: node.blacklisted,
        device_class: node.device_class,
        udp_status: probe.map(|p| p.state),
        minmtu: probe.map(|p| p.minmtu),
        maxmtu: probe.map(|p| p.maxmtu),
        mtu: probe.and_then(|p| p.mtu),
    })
}

/// One edge as exported for debugging/visualization (§4.K:
/// `devtool_get_all_edges`, `devtool_export_json_edges`).
#[derive(Debug, Clone, Serialize)]
pub struct EdgeView {
    pub from: String,
    pub to: String,
    pub weight: u32,
    pub options: u32,
}

pub fn get_all_edges(store: &NodeStore) -> Vec<EdgeView> {
    store
        .all_edges()
        .filter_map(|edge| {
            let from = store.node(edge.from)?.name.clone();
            let to = store.node(edge.to)?.name.clone();
            Some(EdgeView {
                from,
                to,
                weight: edge.weight,
                options: edge.options,
            })
        })
        .collect()
}

/// Renders the current edge set as a JSON array (§4.K:
/// `devtool_export_json_edges`), for external visualization tooling.
pub fn export_json_edges(store: &NodeStore) -> crate::error::Result<String> {
    Ok(serde_json::to_string_pretty(&get_all_edges(store))?)
}

/// Zeroes per-connection diagnostic counters (§4.K:
/// `devtool_reset_node_counters`).
pub fn reset_node_counters(conn: &crate::meta::MetaConnection) {
    conn.reset_edges_advertised();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SigningIdentity;
    use crate::identity::DeviceClass;
    use crate::routing;
    use crate::store::Edge;

    fn key() -> ed25519_dalek::VerifyingKey {
        SigningIdentity::generate().verifying_key()
    }

    #[test]
    fn node_status_reports_reachability_and_next_hop() {
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
        store.add_edge(Edge {
            from: b,
            to: a,
            address: None,
            options: 0,
            weight: 1,
        });
        let table = routing::compute(&store, a);
        let pmtu = std::collections::HashMap::new();
        let status = get_node_status(&store, &table, b, &pmtu).unwrap();
        assert!(status.reachable);
        assert_eq!(status.next_hop.as_deref(), Some("b"));
        assert_eq!(status.mtu, None);
    }

    #[test]
    fn node_status_surfaces_live_pmtu_probe() {
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
        store.add_edge(Edge {
            from: b,
            to: a,
            address: None,
            options: 0,
            weight: 1,
        });
        let table = routing::compute(&store, a);
        let mut pmtu = std::collections::HashMap::new();
        let mut probe = PmtuProbe::new(Some("127.0.0.1:9".parse().unwrap()));
        probe.mtu = Some(777);
        probe.state = PathState::Working;
        pmtu.insert("b".to_string(), probe);
        let status = get_node_status(&store, &table, b, &pmtu).unwrap();
        assert_eq!(status.mtu, Some(777));
        assert_eq!(status.udp_status, Some(PathState::Working));
    }

    #[test]
    fn unknown_node_status_is_none() {
        let store = NodeStore::new();
        let table = RoutingTable::default();
        let pmtu = std::collections::HashMap::new();
        assert!(get_node_status(&store, &table, NodeId(0), &pmtu).is_none());
    }

    #[test]
    fn reset_node_counters_zeroes_edge_count() {
        let conn = crate::meta::MetaConnection::new("local", "peer");
        conn.record_edge_advertised();
        conn.record_edge_advertised();
        assert_eq!(conn.edges_advertised_count(), 2);
        reset_node_counters(&conn);
        assert_eq!(conn.edges_advertised_count(), 0);
    }

    #[test]
    fn json_export_round_trips_through_serde() {
        let mut store = NodeStore::new();
        let a = store.insert_node("a", key(), DeviceClass::Backbone).unwrap();
        let b = store.insert_node("b", key(), DeviceClass::Backbone).unwrap();
        store.add_edge(Edge {
            from: a,
            to: b,
            address: None,
            options: 0,
            weight: 2,
        });
        let json = export_json_edges(&store).unwrap();
        let parsed: Vec<EdgeView> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].from, "a");
        assert_eq!(parsed[0].to, "b");
    }
}
