//! Single-line progress output for non-interactive runs

use crate::check::state::{RunSnapshot, RunState};
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const BAR_WIDTH: usize = 40;

/// Refresh interval of the progress line
pub const REFRESH_INTERVAL: Duration = Duration::from_millis(100);

/// Render `stage: [=====>    ] 42.0% (n/m) available: k`
pub fn render_progress_line(snapshot: &RunSnapshot) -> String {
    let percent = snapshot.percent.clamp(0.0, 100.0);
    let filled = ((percent / 100.0) * BAR_WIDTH as f64) as usize;
    let bar = if filled >= BAR_WIDTH {
        "=".repeat(BAR_WIDTH)
    } else {
        format!("{}>{}", "=".repeat(filled), " ".repeat(BAR_WIDTH - filled - 1))
    };
    format!(
        "{}: [{}] {:.1}% ({}/{}) available: {}",
        snapshot.stage.label(),
        bar,
        percent,
        snapshot.checked,
        snapshot.total,
        snapshot.available
    )
}

/// Redraw the progress line on stderr until `done` is cancelled
pub async fn run_progress_line(state: Arc<RunState>, done: CancellationToken) {
    let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            _ = ticker.tick() => {
                if state.is_checking() {
                    let mut stderr = io::stderr().lock();
                    let _ = write!(stderr, "\r{}", render_progress_line(&state.snapshot()));
                    let _ = stderr.flush();
                }
            }
        }
    }
    let mut stderr = io::stderr().lock();
    let _ = writeln!(stderr, "\r{}", render_progress_line(&state.snapshot()));
}
