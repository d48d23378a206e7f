//! Probes run through a node's client
//!
//! - `alive`: reachability of the configured probe URLs
//! - `cloudflare`: CDN relay trace used for relay gating and country tags
//! - `speed`: bounded download measuring throughput
//! - `media`: per-platform capability checks

pub mod alive;
pub mod cloudflare;
pub mod media;
pub mod speed;

use std::fmt;
use std::str::FromStr;

pub use alive::check_alive;
pub use cloudflare::{check_cloudflare, parse_trace, CfTrace};
pub use media::{
    country_code_tag, CapabilityProber, ExitLocation, HttpCapabilityProber, MediaReport,
    ProbeContext, Unlock,
};
pub use speed::{measure_speed, SpeedTest};

/// A platform whose availability through a node is checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    OpenAi,
    X,
    YouTube,
    Netflix,
    Disney,
    Gemini,
    TikTok,
    IpRisk,
}

impl Platform {
    /// Platforms checked when none are configured
    pub fn defaults() -> Vec<Platform> {
        vec![
            Platform::OpenAi,
            Platform::YouTube,
            Platform::Netflix,
            Platform::Disney,
        ]
    }

    /// Whether the probe for this platform relies on the CDN relay trace
    pub fn needs_cloudflare(&self) -> bool {
        matches!(self, Platform::OpenAi | Platform::X)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::OpenAi => "openai",
            Platform::X => "x",
            Platform::YouTube => "youtube",
            Platform::Netflix => "netflix",
            Platform::Disney => "disney",
            Platform::Gemini => "gemini",
            Platform::TikTok => "tiktok",
            Platform::IpRisk => "iprisk",
        }
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" | "gpt" | "chatgpt" => Ok(Platform::OpenAi),
            "x" | "twitter" => Ok(Platform::X),
            "youtube" | "yt" => Ok(Platform::YouTube),
            "netflix" | "nf" => Ok(Platform::Netflix),
            "disney" | "disney+" => Ok(Platform::Disney),
            "gemini" => Ok(Platform::Gemini),
            "tiktok" => Ok(Platform::TikTok),
            "iprisk" => Ok(Platform::IpRisk),
            other => Err(format!("Unknown platform: {}", other)),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
