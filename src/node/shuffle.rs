//! Anti-correlation ordering of nodes
//!
//! Nodes living in the same network block tend to fail (or succeed) together.
//! Probing them back-to-back lets one bad subnet swamp a whole batch of
//! workers, so the dispatch order is randomised and then locally repaired so
//! that similar hosts are spread apart.
//!
//! The repair is a heuristic local search. Spacing is best-effort: when the
//! forward scan window runs out (typically near the end of the sequence) some
//! violations can remain.

use crate::node::dedup::deduplicate;
use crate::node::models::Node;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::net::IpAddr;

/// Default similarity threshold, two IPv4 hosts in the same /24
pub const DEFAULT_THRESHOLD: f64 = 0.75;

/// Tuning knobs for [`smart_shuffle`]
#[derive(Debug, Clone)]
pub struct ShuffleConfig {
    /// Adjacent pairs scoring at or above this are considered correlated
    pub threshold: f64,
    /// Maximum refinement passes
    pub passes: usize,
    /// Minimum distance between two hosts of the same IPv4 /24, 0 disables
    pub min_spacing: usize,
    /// How far ahead to look for a swap partner
    pub scan_limit: usize,
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            passes: 2,
            min_spacing: 0,
            scan_limit: 64,
        }
    }
}

impl ShuffleConfig {
    /// Spacing derived from the run size: assume about 15 hosts per block
    pub fn for_run(node_count: usize, concurrency: usize, threshold: f64) -> Self {
        Self {
            threshold,
            passes: 3,
            min_spacing: (concurrency * 5).max(node_count / 15),
            scan_limit: (concurrency * 2).max(1),
        }
    }

    fn normalized(&self) -> Self {
        Self {
            threshold: if self.threshold > 0.0 {
                self.threshold
            } else {
                DEFAULT_THRESHOLD
            },
            passes: if self.passes > 0 { self.passes } else { 2 },
            min_spacing: self.min_spacing,
            scan_limit: if self.scan_limit > 0 { self.scan_limit } else { 64 },
        }
    }
}

#[derive(Debug, Clone)]
struct HostMeta {
    raw: String,
    octets: Option<[u8; 4]>,
}

impl HostMeta {
    fn parse(host: &str) -> Self {
        let octets = match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => Some(v4.octets()),
            Ok(IpAddr::V6(v6)) => v6.to_ipv4_mapped().map(|v4| v4.octets()),
            Err(_) => None,
        };
        Self {
            raw: host.to_string(),
            octets,
        }
    }

    fn prefix24(&self) -> Option<u32> {
        self.octets
            .map(|o| u32::from(o[0]) << 24 | u32::from(o[1]) << 16 | u32::from(o[2]) << 8)
    }
}

fn same24(a: &HostMeta, b: &HostMeta) -> bool {
    matches!((a.prefix24(), b.prefix24()), (Some(x), Some(y)) if x == y)
}

/// Similarity of two hosts in `[0, 1]`
///
/// IPv4 hosts score the fraction of leading octets they share. Anything else
/// scores the common string prefix relative to the longer host.
fn similarity(a: &HostMeta, b: &HostMeta) -> f64 {
    if let (Some(x), Some(y)) = (a.octets, b.octets) {
        let eq = x.iter().zip(y.iter()).take_while(|(p, q)| p == q).count();
        return eq as f64 / 4.0;
    }
    let common = a
        .raw
        .bytes()
        .zip(b.raw.bytes())
        .take_while(|(p, q)| p == q)
        .count();
    let longest = a.raw.len().max(b.raw.len());
    if longest == 0 {
        0.0
    } else {
        common as f64 / longest as f64
    }
}

/// Similarity score between two host strings
pub fn host_similarity(a: &str, b: &str) -> f64 {
    similarity(&HostMeta::parse(a), &HostMeta::parse(b))
}

/// Shuffle nodes in place so correlated hosts are spread apart
pub fn smart_shuffle<R: Rng + ?Sized>(nodes: &mut [Node], cfg: &ShuffleConfig, rng: &mut R) {
    smart_shuffle_by(nodes, |n| n.server.as_str(), cfg, rng);
}

/// Shuffle any items in place using `host` to derive their address
pub fn smart_shuffle_by<T, F, R>(items: &mut [T], host: F, cfg: &ShuffleConfig, rng: &mut R)
where
    F: Fn(&T) -> &str,
    R: Rng + ?Sized,
{
    if items.len() < 2 {
        return;
    }
    items.shuffle(rng);
    spread_by(items, host, cfg);
}

/// Run the refinement passes on the current order without randomising first
pub fn spread_by<T, F>(items: &mut [T], host: F, cfg: &ShuffleConfig)
where
    F: Fn(&T) -> &str,
{
    let n = items.len();
    if n < 2 {
        return;
    }
    let cfg = cfg.normalized();
    let mut metas: Vec<HostMeta> = items.iter().map(|item| HostMeta::parse(host(item))).collect();

    let spacing_ok = |last_pos: &HashMap<u32, usize>, idx: usize, m: &HostMeta| -> bool {
        if cfg.min_spacing == 0 {
            return true;
        }
        match m.prefix24().and_then(|p| last_pos.get(&p)) {
            Some(&last) => idx - last > cfg.min_spacing,
            None => true,
        }
    };

    for _ in 0..cfg.passes {
        let mut changed = false;
        let mut last_pos: HashMap<u32, usize> = HashMap::with_capacity(64);
        if let Some(p) = metas[0].prefix24() {
            last_pos.insert(p, 0);
        }

        for i in 0..n - 1 {
            let current = similarity(&metas[i], &metas[i + 1]);
            let correlated = current >= cfg.threshold
                || (cfg.min_spacing > 0
                    && (same24(&metas[i], &metas[i + 1])
                        || !spacing_ok(&last_pos, i + 1, &metas[i + 1])));

            if correlated {
                let mut best: Option<(usize, f64)> = None;
                let mut swapped = false;
                let end = n.min(i + 2 + cfg.scan_limit);
                for j in i + 2..end {
                    if !spacing_ok(&last_pos, i + 1, &metas[j]) {
                        continue;
                    }
                    let score = similarity(&metas[i], &metas[j]);
                    if score < cfg.threshold {
                        items.swap(i + 1, j);
                        metas.swap(i + 1, j);
                        swapped = true;
                        break;
                    }
                    if best.map_or(true, |(_, s)| score < s) {
                        best = Some((j, score));
                    }
                }
                if !swapped {
                    if let Some((j, score)) = best {
                        if score < current {
                            items.swap(i + 1, j);
                            metas.swap(i + 1, j);
                            swapped = true;
                        }
                    }
                }
                changed |= swapped;
            }

            if let Some(p) = metas[i + 1].prefix24() {
                last_pos.insert(p, i + 1);
            }
        }

        if !changed {
            break;
        }
    }
}

/// Human readable CIDR for a similarity threshold
pub fn threshold_to_cidr(threshold: f64) -> String {
    const EPS: f64 = 1e-9;
    for (th, cidr) in [(1.0, "/32"), (0.75, "/24"), (0.5, "/16"), (0.25, "/8")] {
        if (threshold - th).abs() < EPS {
            return cidr.to_string();
        }
    }
    let prefix = (threshold * 4.0) as i64 * 8;
    let prefix = if prefix <= 0 { 24 } else { prefix.min(32) };
    format!("/{}", prefix)
}

/// Deduplicate and order a run's nodes
///
/// `previous` holds nodes that passed on an earlier run. They are kept at the
/// head in their given order; only the remaining nodes are shuffled. Returns
/// the ordered nodes and the size of the head.
pub fn prepare_nodes<R: Rng + ?Sized>(
    previous: Vec<Node>,
    fresh: Vec<Node>,
    cfg: &ShuffleConfig,
    rng: &mut R,
) -> (Vec<Node>, usize) {
    let mut nodes = deduplicate(previous);
    let head = nodes.len();
    nodes.extend(fresh);
    let mut nodes = deduplicate(nodes);
    if nodes.len() > head {
        smart_shuffle(&mut nodes[head..], cfg, rng);
    }
    (nodes, head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::models::Protocol;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn same_block_violations(hosts: &[&str], spacing: usize) -> usize {
        let metas: Vec<_> = hosts.iter().map(|h| HostMeta::parse(h)).collect();
        let mut violations = 0;
        for i in 0..metas.len() {
            for j in i + 1..metas.len().min(i + spacing + 1) {
                if same24(&metas[i], &metas[j]) {
                    violations += 1;
                }
            }
        }
        violations
    }

    #[test]
    fn test_similarity_ipv4() {
        assert_eq!(host_similarity("10.0.0.1", "10.0.0.2"), 0.75);
        assert_eq!(host_similarity("10.0.1.1", "10.0.2.1"), 0.5);
        assert_eq!(host_similarity("10.0.0.1", "11.0.0.1"), 0.0);
        assert_eq!(host_similarity("10.0.0.1", "10.0.0.1"), 1.0);
    }

    #[test]
    fn test_similarity_hostnames() {
        assert_eq!(host_similarity("abcd", "abxy"), 0.5);
        assert_eq!(host_similarity("hk1.example.com", "jp1.example.com"), 0.0);
        assert_eq!(host_similarity("", ""), 0.0);
        // mixed IPv4 and hostname falls back to string prefix
        assert!(host_similarity("1.1.1.1", "1.1.1.1.example") > 0.0);
    }

    #[test]
    fn test_spread_breaks_adjacent_blocks() {
        let mut hosts = vec![
            "10.0.0.1", "10.0.0.2", "10.0.0.3", "8.8.8.8", "9.9.9.9", "7.7.7.7", "6.6.6.6",
        ];
        spread_by(&mut hosts, |h| h, &ShuffleConfig::default());

        for pair in hosts.windows(2) {
            assert!(host_similarity(pair[0], pair[1]) < DEFAULT_THRESHOLD, "{:?}", pair);
        }
    }

    #[test]
    fn test_spread_honours_min_spacing() {
        let mut hosts = vec![
            "10.0.0.1", "10.0.0.2", "1.1.1.1", "2.2.2.2", "10.0.0.3", "3.3.3.3", "4.4.4.4",
            "5.5.5.5",
        ];
        let cfg = ShuffleConfig {
            min_spacing: 2,
            ..ShuffleConfig::default()
        };
        assert!(same_block_violations(&hosts, 2) > 0);
        spread_by(&mut hosts, |h| h, &cfg);
        assert_eq!(same_block_violations(&hosts, 2), 0, "{:?}", hosts);
    }

    #[test]
    fn test_smart_shuffle_is_a_permutation() {
        let mut rng = StdRng::seed_from_u64(7);
        let original: Vec<String> = (0..300)
            .map(|i| format!("{}.{}.{}.{}", 10 + i % 3, i % 5, i % 7, i))
            .collect();
        let mut shuffled = original.clone();
        let cfg = ShuffleConfig {
            min_spacing: 4,
            passes: 3,
            ..ShuffleConfig::default()
        };
        smart_shuffle_by(&mut shuffled, |h| h.as_str(), &cfg, &mut rng);

        let mut a = original.clone();
        let mut b = shuffled.clone();
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }

    #[test]
    fn test_smart_shuffle_small_inputs() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut empty: Vec<&str> = vec![];
        smart_shuffle_by(&mut empty, |h| h, &ShuffleConfig::default(), &mut rng);
        let mut one = vec!["1.1.1.1"];
        smart_shuffle_by(&mut one, |h| h, &ShuffleConfig::default(), &mut rng);
        assert_eq!(one, vec!["1.1.1.1"]);
    }

    #[test]
    fn test_threshold_to_cidr() {
        assert_eq!(threshold_to_cidr(1.0), "/32");
        assert_eq!(threshold_to_cidr(0.75), "/24");
        assert_eq!(threshold_to_cidr(0.5), "/16");
        assert_eq!(threshold_to_cidr(0.25), "/8");
        assert_eq!(threshold_to_cidr(0.6), "/16");
        assert_eq!(threshold_to_cidr(0.1), "/24");
        assert_eq!(threshold_to_cidr(3.0), "/32");
    }

    #[test]
    fn test_prepare_nodes_keeps_previous_at_head() {
        let previous = vec![
            Node::new("p1", Protocol::Trojan, "5.5.5.5", 443),
            Node::new("p2", Protocol::Trojan, "6.6.6.6", 443),
        ];
        let fresh: Vec<Node> = (0..20)
            .map(|i| Node::new(&format!("f{}", i), Protocol::Trojan, &format!("10.0.{}.1", i), 443))
            .chain(std::iter::once(Node::new("p1-again", Protocol::Trojan, "5.5.5.5", 443)))
            .collect();
        let mut rng = StdRng::seed_from_u64(42);

        let (nodes, head) = prepare_nodes(previous, fresh, &ShuffleConfig::default(), &mut rng);
        assert_eq!(head, 2);
        assert_eq!(nodes.len(), 22);
        assert_eq!(nodes[0].name, "p1");
        assert_eq!(nodes[1].name, "p2");
        assert!(nodes.iter().all(|n| n.name != "p1-again"));
    }
}
