//! Check module for running nodes through the checking pipeline
//!
//! This module provides functionality for:
//! - Sizing stage worker pools from decay curves
//! - Connectivity, throughput and platform capability probes
//! - The staged pipeline with cancellation and progress reporting
//! - Exit IP geolocation using MMDB databases

pub mod client;
pub mod concurrency;
pub mod config;
pub mod decay;
pub mod geo;
pub mod http_client;
pub mod job;
pub mod pipeline;
pub mod platform;
pub mod progress;
pub mod rate_limit;
pub mod state;
pub mod stats;

pub use client::{ClientError, ClientFactory, ClientHandle, NodeClient, ProbeError, ProbeRequest, ProbeResponse};
pub use concurrency::ConcurrencyPlan;
pub use config::CheckerConfig;
pub use decay::DecayFn;
pub use geo::{GeoLocation, GeoLocator};
pub use http_client::ReqwestClientFactory;
pub use job::CheckResult;
pub use pipeline::{CheckError, ProxyChecker};
pub use platform::{CapabilityProber, HttpCapabilityProber, Platform};
pub use progress::{ProgressMode, ProgressTracker};
pub use rate_limit::TokenBucket;
pub use state::{RunSnapshot, RunState, Stage};
