//! Live state of a checking run, shared with observers

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

/// Stage currently reported by the progress tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Alive,
    Speed,
    Media,
    Done,
}

impl Stage {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Stage::Alive,
            2 => Stage::Speed,
            3 => Stage::Media,
            4 => Stage::Done,
            _ => Stage::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Stage::Idle => 0,
            Stage::Alive => 1,
            Stage::Speed => 2,
            Stage::Media => 3,
            Stage::Done => 4,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Alive => "alive",
            Stage::Speed => "speed",
            Stage::Media => "media",
            Stage::Done => "done",
        }
    }
}

/// Counters and flags of the current run
///
/// A single instance is created by the caller and handed to the checker, so
/// progress renderers and stop handlers never need process globals.
#[derive(Debug, Default)]
pub struct RunState {
    total: AtomicU64,
    checked: AtomicU64,
    available: AtomicU64,
    /// Percent in hundredths
    percent: AtomicU64,
    total_bytes: AtomicU64,
    stage: AtomicU8,
    checking: AtomicBool,
    force_close: AtomicBool,
    success_limited: AtomicBool,
}

/// Point-in-time copy of [`RunState`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSnapshot {
    pub total: u64,
    pub checked: u64,
    pub available: u64,
    pub percent: f64,
    pub total_bytes: u64,
    pub stage: Stage,
    pub checking: bool,
    pub stopping: bool,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset all counters for a run over `total` nodes
    pub fn begin_run(&self, total: u64) {
        self.total.store(total, Ordering::SeqCst);
        self.checked.store(0, Ordering::SeqCst);
        self.available.store(0, Ordering::SeqCst);
        self.percent.store(0, Ordering::SeqCst);
        self.total_bytes.store(0, Ordering::SeqCst);
        self.stage.store(Stage::Alive.as_u8(), Ordering::SeqCst);
        self.force_close.store(false, Ordering::SeqCst);
        self.success_limited.store(false, Ordering::SeqCst);
        self.checking.store(true, Ordering::SeqCst);
    }

    pub fn end_run(&self) {
        self.stage.store(Stage::Done.as_u8(), Ordering::SeqCst);
        self.checking.store(false, Ordering::SeqCst);
    }

    /// Ask the running pipeline to stop dispatching and drain
    pub fn request_stop(&self) {
        self.force_close.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.force_close.load(Ordering::SeqCst)
    }

    pub fn mark_success_limited(&self) -> bool {
        !self.success_limited.swap(true, Ordering::SeqCst)
    }

    pub fn success_limited(&self) -> bool {
        self.success_limited.load(Ordering::SeqCst)
    }

    pub fn is_checking(&self) -> bool {
        self.checking.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    /// Publish the checked count; never moves backwards within a run
    pub fn set_checked(&self, checked: u64) {
        self.checked.fetch_max(checked, Ordering::SeqCst);
    }

    pub fn checked(&self) -> u64 {
        self.checked.load(Ordering::SeqCst)
    }

    /// Count one more available node, returning the new count
    pub fn add_available(&self) -> u64 {
        self.available.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn available(&self) -> u64 {
        self.available.load(Ordering::SeqCst)
    }

    pub fn add_bytes(&self, n: u64) {
        self.total_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Publish a percentage, never moving backwards
    pub fn raise_percent(&self, percent: f64) {
        let hundredths = (percent.clamp(0.0, 100.0) * 100.0).round() as u64;
        self.percent.fetch_max(hundredths, Ordering::SeqCst);
    }

    /// Publish a percentage as is; used when a stage resets its denominator
    pub fn set_percent(&self, percent: f64) {
        let hundredths = (percent.clamp(0.0, 100.0) * 100.0).round() as u64;
        self.percent.store(hundredths, Ordering::SeqCst);
    }

    pub fn percent(&self) -> f64 {
        self.percent.load(Ordering::SeqCst) as f64 / 100.0
    }

    pub fn set_stage(&self, stage: Stage) {
        self.stage.store(stage.as_u8(), Ordering::SeqCst);
    }

    pub fn stage(&self) -> Stage {
        Stage::from_u8(self.stage.load(Ordering::SeqCst))
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            total: self.total(),
            checked: self.checked(),
            available: self.available(),
            percent: self.percent(),
            total_bytes: self.total_bytes(),
            stage: self.stage(),
            checking: self.is_checking(),
            stopping: self.stop_requested(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_run_resets_counters() {
        let state = RunState::new();
        state.add_available();
        state.add_bytes(42);
        state.request_stop();
        state.raise_percent(50.0);

        state.begin_run(10);
        let snap = state.snapshot();
        assert_eq!(snap.total, 10);
        assert_eq!(snap.available, 0);
        assert_eq!(snap.total_bytes, 0);
        assert_eq!(snap.percent, 0.0);
        assert_eq!(snap.stage, Stage::Alive);
        assert!(snap.checking);
        assert!(!snap.stopping);
    }

    #[test]
    fn test_raise_percent_is_monotone() {
        let state = RunState::new();
        state.raise_percent(40.0);
        state.raise_percent(30.0);
        assert_eq!(state.percent(), 40.0);
        state.raise_percent(120.0);
        assert_eq!(state.percent(), 100.0);
        state.set_percent(5.0);
        assert_eq!(state.percent(), 5.0);
    }

    #[test]
    fn test_stale_checked_count_ignored() {
        let state = RunState::new();
        state.begin_run(20);
        state.set_checked(10);
        state.set_checked(9);
        assert_eq!(state.checked(), 10);
        state.begin_run(20);
        assert_eq!(state.checked(), 0);
    }

    #[test]
    fn test_success_limit_marked_once() {
        let state = RunState::new();
        assert!(state.mark_success_limited());
        assert!(!state.mark_success_limited());
        assert!(state.success_limited());
    }
}
