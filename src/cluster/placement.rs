//! Rendezvous (HRW) hashing for replica placement
//!
//! Every node is scored against the key; the highest `r` scores win. The
//! function is pure: for an unchanged node set, the same key always maps
//! to the same ordered replica list, on every node and across restarts.

use crate::common::placement_score;

/// Ordered replica list for `key`: the `min(r, nodes.len())` highest-scored
/// nodes, ties broken by node identifier.
pub fn replicas(key: &[u8], nodes: &[String], r: usize) -> Vec<String> {
    let mut scored: Vec<(u32, &String)> = nodes
        .iter()
        .map(|node| (placement_score(key, node), node))
        .collect();

    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));

    scored
        .into_iter()
        .take(r)
        .map(|(_, node)| node.clone())
        .collect()
}
