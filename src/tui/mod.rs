//! TUI module for terminal progress display

mod line;
mod progress_app;

pub use line::{render_progress_line, run_progress_line};
pub use progress_app::ProgressApp;
