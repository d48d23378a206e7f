//! Node module for the pre-flight side of a run
//!
//! This module provides functionality for:
//! - The typed node model built from generic attribute bags
//! - Removing duplicate node definitions
//! - Ordering nodes so hosts from the same network block are spread apart
//! - Rewriting display names once a node has been checked

pub mod dedup;
pub mod models;
pub mod rename;
pub mod shuffle;

pub use dedup::deduplicate;
pub use models::{Node, NodeError, Protocol};
pub use rename::{compose_name, country_flag, speed_tag, strip_tags, Renamer};
pub use shuffle::{prepare_nodes, smart_shuffle, threshold_to_cidr, ShuffleConfig};
