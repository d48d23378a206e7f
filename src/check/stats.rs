//! Per-subscription success statistics

use crate::check::job::CheckResult;
use crate::node::Node;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

/// How many nodes of one subscription were tested and how many passed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionStat {
    pub url: String,
    pub total: usize,
    pub success: usize,
}

impl SubscriptionStat {
    pub fn rate(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            self.success as f32 / self.total as f32
        }
    }
}

/// Count nodes and successes per subscription, best ratio first
pub fn subscription_stats(nodes: &[Node], results: &[CheckResult]) -> Vec<SubscriptionStat> {
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for url in nodes.iter().filter_map(|n| n.sub_url.as_deref()) {
        counts.entry(url).or_default().0 += 1;
    }
    for url in results.iter().filter_map(|r| r.node.sub_url.as_deref()) {
        counts.entry(url).or_default().1 += 1;
    }

    let mut stats: Vec<SubscriptionStat> = counts
        .into_iter()
        .filter(|(_, (total, _))| *total > 0)
        .map(|(url, (total, success))| SubscriptionStat {
            url: url.to_string(),
            total,
            success,
        })
        .collect();
    stats.sort_by(|a, b| {
        b.rate()
            .partial_cmp(&a.rate())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.url.cmp(&b.url))
    });
    stats
}

/// Log every subscription, warning about those below `min_rate`
pub fn report_subscriptions(stats: &[SubscriptionStat], min_rate: f32) {
    for stat in stats {
        let percent = format!("{:.2}%", stat.rate() * 100.0);
        if stat.rate() < min_rate {
            warn!(
                url = %stat.url,
                total = stat.total,
                success = stat.success,
                rate = %percent,
                "Low subscription success rate"
            );
        } else {
            debug!(
                url = %stat.url,
                total = stat.total,
                success = stat.success,
                rate = %percent,
                "Subscription stats"
            );
        }
    }
}

/// Drop the bookkeeping attributes before results leave the checker
pub fn strip_subscription_fields(results: &mut [CheckResult]) {
    for result in results {
        result.node.sub_url = None;
        result.node.sub_tag = None;
    }
}
