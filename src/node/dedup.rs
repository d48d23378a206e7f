//! Duplicate node removal

use crate::node::models::Node;
use std::collections::HashSet;

/// Remove duplicate nodes, keeping the first occurrence of each identity.
///
/// Nodes without a host are dropped since they cannot be dialed. The input
/// vector is consumed so its storage is freed as soon as filtering is done.
pub fn deduplicate(nodes: Vec<Node>) -> Vec<Node> {
    let mut seen = HashSet::with_capacity(nodes.len());
    let mut result: Vec<Node> = nodes
        .into_iter()
        .filter(|node| node.has_host() && seen.insert(node.identity_key()))
        .collect();
    result.shrink_to_fit();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::models::Protocol;

    fn sample() -> Vec<Node> {
        vec![
            Node::new("a", Protocol::Trojan, "1.1.1.1", 443).with_password("x"),
            Node::new("a-dup", Protocol::Trojan, "1.1.1.1", 443).with_password("x"),
            Node::new("b", Protocol::Trojan, "1.1.1.1", 443).with_password("y"),
            Node::new("c", Protocol::Vmess, "1.1.1.1", 443).with_uuid("u"),
            Node::new("no-host", Protocol::Vmess, "", 443),
            Node::new("d", Protocol::Trojan, "1.1.1.1", 443)
                .with_password("x")
                .with_servername("sni.example"),
            Node::new("c-dup", Protocol::from("VMESS"), "1.1.1.1", 443).with_uuid("u"),
        ]
    }

    #[test]
    fn test_deduplicate_keeps_first_seen_order() {
        let names: Vec<_> = deduplicate(sample()).into_iter().map(|n| n.name).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_deduplicate_drops_nodes_without_host() {
        let nodes = vec![
            Node::new("blank", Protocol::Trojan, "   ", 443),
            Node::new("empty", Protocol::Trojan, "", 443),
        ];
        assert!(deduplicate(nodes).is_empty());
    }

    #[test]
    fn test_deduplicate_is_idempotent() {
        let once = deduplicate(sample());
        let twice = deduplicate(once.clone());
        assert_eq!(once, twice);
        assert!(once.len() <= sample().len());
    }
}
