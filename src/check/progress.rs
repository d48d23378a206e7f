//! Progress estimation across pipeline stages

use crate::check::state::{RunState, Stage};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// How the published percentage is computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressMode {
    /// One weighted percentage over every enabled stage
    #[default]
    Dynamic,
    /// Raw completion of the active stage only
    Stage,
}

impl FromStr for ProgressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dynamic" => Ok(ProgressMode::Dynamic),
            "stage" => Ok(ProgressMode::Stage),
            other => Err(format!("Unknown progress mode: {}", other)),
        }
    }
}

impl fmt::Display for ProgressMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressMode::Dynamic => write!(f, "dynamic"),
            ProgressMode::Stage => write!(f, "stage"),
        }
    }
}

/// Share of the bar given to each stage, depending on which ones run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageWeights {
    pub alive: f64,
    pub speed: f64,
    pub media: f64,
}

impl StageWeights {
    pub fn for_stages(speed: bool, media: bool) -> Self {
        let (alive, speed, media) = match (speed, media) {
            (false, false) => (100.0, 0.0, 0.0),
            (false, true) => (80.0, 0.0, 20.0),
            (true, false) => (70.0, 30.0, 0.0),
            (true, true) => (85.0, 10.0, 5.0),
        };
        Self {
            alive,
            speed,
            media,
        }
    }
}

fn ratio(done: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (done as f64 / total as f64).min(1.0)
    }
}

/// Per-stage counters feeding the published percentage
///
/// Every counter only grows. A job is counted at most once per stage, which
/// the pipeline guarantees through the job's stage markers.
#[derive(Debug)]
pub struct ProgressTracker {
    mode: ProgressMode,
    total: u64,
    speed_enabled: bool,
    media_enabled: bool,
    weights: StageWeights,
    alive_done: AtomicU64,
    alive_success: AtomicU64,
    speed_done: AtomicU64,
    speed_success: AtomicU64,
    media_done: AtomicU64,
    finalized: AtomicBool,
    state: Arc<RunState>,
}

impl ProgressTracker {
    pub fn new(
        mode: ProgressMode,
        total: u64,
        speed_enabled: bool,
        media_enabled: bool,
        state: Arc<RunState>,
    ) -> Self {
        Self {
            mode,
            total,
            speed_enabled,
            media_enabled,
            weights: StageWeights::for_stages(speed_enabled, media_enabled),
            alive_done: AtomicU64::new(0),
            alive_success: AtomicU64::new(0),
            speed_done: AtomicU64::new(0),
            speed_success: AtomicU64::new(0),
            media_done: AtomicU64::new(0),
            finalized: AtomicBool::new(false),
            state,
        }
    }

    pub fn count_alive(&self, success: bool) {
        let done = self.alive_done.fetch_add(1, Ordering::SeqCst) + 1;
        if success {
            self.alive_success.fetch_add(1, Ordering::SeqCst);
        }
        self.state.set_checked(done);
        self.refresh();
    }

    pub fn count_speed(&self, success: bool) {
        self.speed_done.fetch_add(1, Ordering::SeqCst);
        if success {
            self.speed_success.fetch_add(1, Ordering::SeqCst);
        }
        self.refresh();
    }

    pub fn count_media(&self) {
        self.media_done.fetch_add(1, Ordering::SeqCst);
        self.refresh();
    }

    /// Called once every connectivity worker has finished
    ///
    /// With nothing alive there is no work left for later stages, so the bar
    /// jumps to 100.
    pub fn finish_alive_stage(&self) {
        if self.alive_success() == 0 && (self.speed_enabled || self.media_enabled) {
            self.finalize();
            return;
        }
        if self.mode == ProgressMode::Stage {
            let next = if self.speed_enabled {
                Stage::Speed
            } else if self.media_enabled {
                Stage::Media
            } else {
                Stage::Alive
            };
            if next != Stage::Alive {
                self.state.set_stage(next);
                self.state.set_percent(0.0);
            }
        } else if self.speed_enabled {
            self.state.set_stage(Stage::Speed);
        } else if self.media_enabled {
            self.state.set_stage(Stage::Media);
        }
        self.refresh();
    }

    /// Called once every throughput worker has finished
    pub fn finish_speed_stage(&self) {
        if !self.speed_enabled {
            return;
        }
        if self.speed_success() == 0 && self.media_enabled {
            self.finalize();
            return;
        }
        if self.media_enabled {
            self.state.set_stage(Stage::Media);
            if self.mode == ProgressMode::Stage {
                self.state.set_percent(0.0);
            }
        }
        self.refresh();
    }

    /// Pin progress to 100
    pub fn finalize(&self) {
        self.finalized.store(true, Ordering::SeqCst);
        self.state.set_percent(100.0);
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    /// Recompute and publish the percentage
    pub fn refresh(&self) {
        if self.is_finalized() {
            return;
        }
        let percent = match self.mode {
            ProgressMode::Dynamic => self.dynamic_percent(),
            ProgressMode::Stage => self.stage_percent(),
        };
        self.state.raise_percent(percent);
    }

    /// Nodes the connectivity stage is expected to see
    ///
    /// After a stop only the nodes that were actually tested count.
    fn alive_denominator(&self) -> u64 {
        if self.state.stop_requested() || self.state.success_limited() {
            self.alive_done().max(1)
        } else {
            self.total
        }
    }

    fn dynamic_percent(&self) -> f64 {
        let w = self.weights;
        let alive_ratio = ratio(self.alive_done(), self.alive_denominator());
        let mut percent = alive_ratio * w.alive;

        let mut upstream = alive_ratio;
        let mut upstream_success = self.alive_success();
        if self.speed_enabled {
            let speed_ratio = ratio(self.speed_done(), upstream_success);
            percent += speed_ratio * w.speed * upstream;
            upstream *= speed_ratio;
            upstream_success = self.speed_success();
        }
        if self.media_enabled {
            let media_ratio = ratio(self.media_done(), upstream_success);
            percent += media_ratio * w.media * upstream;
        }
        percent
    }

    fn stage_percent(&self) -> f64 {
        let (done, total) = match self.state.stage() {
            Stage::Speed => (self.speed_done(), self.alive_success()),
            Stage::Media => {
                let input = if self.speed_enabled {
                    self.speed_success()
                } else {
                    self.alive_success()
                };
                (self.media_done(), input)
            }
            _ => (self.alive_done(), self.alive_denominator()),
        };
        ratio(done, total) * 100.0
    }

    pub fn alive_done(&self) -> u64 {
        self.alive_done.load(Ordering::SeqCst)
    }

    pub fn alive_success(&self) -> u64 {
        self.alive_success.load(Ordering::SeqCst)
    }

    pub fn speed_done(&self) -> u64 {
        self.speed_done.load(Ordering::SeqCst)
    }

    pub fn speed_success(&self) -> u64 {
        self.speed_success.load(Ordering::SeqCst)
    }

    pub fn media_done(&self) -> u64 {
        self.media_done.load(Ordering::SeqCst)
    }
}
