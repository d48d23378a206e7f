//! Per-stage worker and queue sizing

use crate::check::config::CheckerConfig;
use crate::check::decay::{round_half_up, DecayFn};

/// Connectivity stage curve: wide, but stops growing past a few hundred
const ALIVE_CURVE: DecayFn = DecayFn {
    amplitude: 1000.0,
    rate: 0.002,
    floor: 400.0,
    shape: crate::check::decay::DecayShape::Logarithmic,
};

/// Throughput stage curve: narrow, shrinks as overall concurrency grows
const SPEED_CURVE: DecayFn = DecayFn {
    amplitude: 32.0,
    rate: 1.1,
    floor: 4.0,
    shape: crate::check::decay::DecayShape::Power { saturation: 32.0 },
};

/// Capability stage curve
const MEDIA_CURVE: DecayFn = DecayFn {
    amplitude: 400.0,
    rate: 0.001,
    floor: 100.0,
    shape: crate::check::decay::DecayShape::Exponential,
};

/// Throughput queue curve, evaluated at the connectivity width
const SPEED_QUEUE_CURVE: DecayFn = DecayFn {
    amplitude: 100.0,
    rate: 0.004,
    floor: 1.0,
    shape: crate::check::decay::DecayShape::Tanh,
};

/// Worker counts and queue capacities for one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyPlan {
    pub alive_workers: usize,
    pub speed_workers: usize,
    pub media_workers: usize,
    pub alive_queue: usize,
    pub speed_queue: usize,
    pub media_queue: usize,
    /// Whether the worker counts came from the decay curves
    pub auto: bool,
}

/// Size a stage from a curve: never more than requested or than there are nodes
pub fn size_stage(curve: &DecayFn, requested: usize, node_count: usize) -> usize {
    let cap = requested.min(node_count);
    if cap == 0 {
        return 0;
    }
    let lo = (curve.floor.ceil() as usize).clamp(1, cap);
    let hi = (curve.amplitude.floor() as usize).clamp(lo, cap);
    round_half_up(curve.eval(requested as f64)).clamp(lo, hi)
}

/// Throughput width derived from an aggregate bandwidth ceiling
///
/// `total_mbps` MB/s shared by workers that each need at least
/// `min_speed_kbps` KB/s.
pub fn bandwidth_workers(total_mbps: u32, min_speed_kbps: u32, max_concurrency: usize) -> usize {
    let per_worker_mbps = f64::from(min_speed_kbps.max(1)) / 1024.0;
    let workers = (f64::from(total_mbps) / per_worker_mbps) as usize;
    workers.max(1).min(max_concurrency.max(1))
}

impl ConcurrencyPlan {
    /// Compute the plan for `node_count` nodes
    pub fn compute(node_count: usize, config: &CheckerConfig) -> Self {
        let n = node_count.max(1);
        let requested = config.concurrency.max(1).min(n);

        let (alive, speed, media, auto) = if config.manual_concurrency() {
            (
                config.alive_concurrency.min(n),
                config.speed_concurrency.min(n),
                config.media_concurrency.min(n),
                false,
            )
        } else {
            let speed = if config.total_speed_limit_mbps > 0 {
                bandwidth_workers(
                    config.total_speed_limit_mbps,
                    config.min_speed_kbps,
                    config.concurrency,
                )
                .min(n)
            } else {
                size_stage(&SPEED_CURVE, requested, n)
            };
            (
                size_stage(&ALIVE_CURVE, requested, n),
                speed,
                size_stage(&MEDIA_CURVE, requested, n),
                true,
            )
        };

        let alive = alive.max(1);
        let speed = speed.max(1);
        let media = media.max(1);

        // kept small so a busy throughput stage blocks connectivity workers
        let speed_queue = if config.speed_enabled() {
            let lo = speed.min(alive).max(1);
            round_half_up(SPEED_QUEUE_CURVE.eval(alive as f64)).clamp(lo, alive.max(lo))
        } else {
            1
        };

        Self {
            alive_workers: alive,
            speed_workers: speed,
            media_workers: media,
            alive_queue: round_half_up(alive as f64 * 1.1).max(1),
            speed_queue,
            media_queue: media * 2,
            auto,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::decay::DecayFn;

    #[test]
    fn test_size_stage_bounds_for_all_families() {
        let curves = [
            DecayFn::exponential(400.0, 0.001, 100.0),
            DecayFn::logarithmic(400.0, 0.005, 100.0),
            DecayFn::power(32.0, 1.1, 32.0, 4.0),
            DecayFn::inverse(200.0, 0.01, 20.0),
            DecayFn::tanh(100.0, 0.0004, 10.0),
        ];
        let counts = [1usize, 2, 7, 50, 399, 1000, 5000, 20_000, 100_000];
        for curve in &curves {
            for &nodes in &counts {
                for &requested in &[1usize, 10, 100, 1000, 100_000] {
                    let out = size_stage(curve, requested, nodes);
                    let cap = requested.min(nodes);
                    let hi = (curve.amplitude as usize).min(cap);
                    let lo = (curve.floor as usize).min(cap);
                    assert!(
                        out >= lo && out <= hi,
                        "{:?} nodes={} requested={} out={}",
                        curve.shape,
                        nodes,
                        requested,
                        out
                    );
                }
            }
        }
    }

    #[test]
    fn test_auto_plan_prefers_early_stages() {
        let config = CheckerConfig::new()
            .with_concurrency(1000)
            .with_speed_test("https://speed.example".to_string(), 512);
        let plan = ConcurrencyPlan::compute(50_000, &config);

        assert!(plan.auto);
        assert!(plan.alive_workers <= 1000);
        assert!(plan.alive_workers >= 400);
        assert!(plan.speed_workers < plan.media_workers);
        assert!(plan.media_workers < plan.alive_workers);
        assert!(plan.speed_queue < plan.alive_queue);
        assert!(plan.speed_queue >= plan.speed_workers);
    }

    #[test]
    fn test_plan_never_exceeds_node_count() {
        let config = CheckerConfig::new()
            .with_concurrency(500)
            .with_speed_test("https://speed.example".to_string(), 512);
        let plan = ConcurrencyPlan::compute(3, &config);
        assert!(plan.alive_workers <= 3);
        assert!(plan.speed_workers <= 3);
        assert!(plan.media_workers <= 3);
        assert!(plan.alive_workers >= 1);
    }

    #[test]
    fn test_manual_plan_uses_overrides() {
        let config = CheckerConfig::new().with_stage_concurrency(64, 8, 16);
        let plan = ConcurrencyPlan::compute(10_000, &config);
        assert!(!plan.auto);
        assert_eq!(plan.alive_workers, 64);
        assert_eq!(plan.speed_workers, 8);
        assert_eq!(plan.media_workers, 16);
        assert_eq!(plan.speed_queue, 1);
        assert_eq!(plan.alive_queue, 70);
        assert_eq!(plan.media_queue, 32);
    }

    #[test]
    fn test_bandwidth_aware_speed_workers() {
        // 10 MB/s shared by workers that need 512 KB/s each
        assert_eq!(bandwidth_workers(10, 512, 100), 20);
        assert_eq!(bandwidth_workers(10, 512, 8), 8);
        assert_eq!(bandwidth_workers(1, 4096, 8), 1);

        let config = CheckerConfig::new()
            .with_concurrency(100)
            .with_speed_test("https://speed.example".to_string(), 512)
            .with_total_speed_limit(10);
        let plan = ConcurrencyPlan::compute(1000, &config);
        assert_eq!(plan.speed_workers, 20);
    }
}
