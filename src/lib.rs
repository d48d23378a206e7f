//! Node Sieve - Staged Proxy Node Checker
//!
//! Runs proxy nodes through connectivity, throughput and platform capability
//! stages with adaptive concurrency, cancellation and progress reporting.

pub mod check;
pub mod node;
pub mod tui;

pub use check::{CheckResult, CheckerConfig, ProxyChecker, RunState};
pub use node::{Node, Protocol};

/// Application result type
pub type Result<T> = anyhow::Result<T>;
