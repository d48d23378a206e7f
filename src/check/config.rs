//! Checker configuration

use crate::check::platform::Platform;
use crate::check::progress::ProgressMode;
use crate::node::shuffle::DEFAULT_THRESHOLD;
use std::path::PathBuf;
use std::time::Duration;

/// Default overall concurrency
pub const DEFAULT_CONCURRENCY: usize = 20;

/// Default timeout for connectivity probes in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Default connectivity probe URL
const DEFAULT_ALIVE_URL: &str = "https://www.gstatic.com/generate_204";

/// Default download timeout for the throughput test in seconds
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 10;

/// Default cap on bytes downloaded per throughput test
pub const DEFAULT_DOWNLOAD_MB: u64 = 20;

/// Default minimum acceptable throughput in KB/s
pub const DEFAULT_MIN_SPEED_KBPS: u32 = 512;

/// Default subscription success ratio below which a warning is logged
pub const DEFAULT_SUCCESS_RATE: f32 = 0.0;

/// Configuration for a checking run
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Overall requested concurrency
    pub concurrency: usize,
    /// Connectivity workers, 0 for automatic sizing
    pub alive_concurrency: usize,
    /// Throughput workers, 0 for automatic sizing
    pub speed_concurrency: usize,
    /// Capability workers, 0 for automatic sizing
    pub media_concurrency: usize,
    /// Timeout for each connectivity probe
    pub timeout: Duration,
    /// Connectivity probe URLs, every one of them must answer 2xx
    pub alive_urls: Vec<String>,
    /// Download URL for the throughput test, `None` disables the stage
    pub speed_test_url: Option<String>,
    /// Upper bound on a single throughput test
    pub download_timeout: Duration,
    /// Network bytes ceiling for a single throughput test in MiB, 0 for none
    pub download_mb: u64,
    /// Minimum throughput in KB/s for a node to be kept
    pub min_speed_kbps: u32,
    /// Aggregate throughput ceiling across all workers in MB/s, 0 for none
    pub total_speed_limit_mbps: u32,
    /// Run platform capability checks
    pub media_check: bool,
    /// Platforms to check, in tag order
    pub platforms: Vec<Platform>,
    /// Drop nodes that cannot reach the CDN relay
    pub drop_bad_cf_nodes: bool,
    /// Stop dispatching once this many nodes are available, 0 for no limit
    pub success_limit: u32,
    /// Similarity threshold for dispatch ordering
    pub threshold: f64,
    /// Progress algorithm
    pub progress_mode: ProgressMode,
    /// Rename nodes after their exit country
    pub rename_node: bool,
    /// Prefix for renamed nodes
    pub node_prefix: String,
    /// Use country-code tags as rename labels
    pub enhanced_tag: bool,
    /// Path to MMDB file for geolocation (optional)
    pub mmdb_path: Option<PathBuf>,
    /// Warn about subscriptions whose success ratio is below this
    pub success_rate: f32,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            alive_concurrency: 0,
            speed_concurrency: 0,
            media_concurrency: 0,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            alive_urls: vec![DEFAULT_ALIVE_URL.to_string()],
            speed_test_url: None,
            download_timeout: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
            download_mb: DEFAULT_DOWNLOAD_MB,
            min_speed_kbps: DEFAULT_MIN_SPEED_KBPS,
            total_speed_limit_mbps: 0,
            media_check: false,
            platforms: Platform::defaults(),
            drop_bad_cf_nodes: false,
            success_limit: 0,
            threshold: DEFAULT_THRESHOLD,
            progress_mode: ProgressMode::Dynamic,
            rename_node: false,
            node_prefix: String::new(),
            enhanced_tag: false,
            mmdb_path: None,
            success_rate: DEFAULT_SUCCESS_RATE,
        }
    }
}

impl CheckerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_stage_concurrency(mut self, alive: usize, speed: usize, media: usize) -> Self {
        self.alive_concurrency = alive;
        self.speed_concurrency = speed;
        self.media_concurrency = media;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_alive_urls(mut self, urls: Vec<String>) -> Self {
        self.alive_urls = urls;
        self
    }

    pub fn with_speed_test(mut self, url: String, min_speed_kbps: u32) -> Self {
        self.speed_test_url = Some(url);
        self.min_speed_kbps = min_speed_kbps;
        self
    }

    pub fn with_download_limits(mut self, timeout: Duration, download_mb: u64) -> Self {
        self.download_timeout = timeout;
        self.download_mb = download_mb;
        self
    }

    pub fn with_total_speed_limit(mut self, mbps: u32) -> Self {
        self.total_speed_limit_mbps = mbps;
        self
    }

    pub fn with_media_check(mut self, platforms: Vec<Platform>) -> Self {
        self.media_check = true;
        self.platforms = platforms;
        self
    }

    pub fn with_drop_bad_cf_nodes(mut self, drop: bool) -> Self {
        self.drop_bad_cf_nodes = drop;
        self
    }

    pub fn with_success_limit(mut self, limit: u32) -> Self {
        self.success_limit = limit;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_progress_mode(mut self, mode: ProgressMode) -> Self {
        self.progress_mode = mode;
        self
    }

    pub fn with_rename(mut self, prefix: String, enhanced_tag: bool) -> Self {
        self.rename_node = true;
        self.node_prefix = prefix;
        self.enhanced_tag = enhanced_tag;
        self
    }

    pub fn with_mmdb_path(mut self, path: PathBuf) -> Self {
        self.mmdb_path = Some(path);
        self
    }

    pub fn with_success_rate(mut self, rate: f32) -> Self {
        self.success_rate = rate;
        self
    }

    /// Whether the throughput stage runs
    pub fn speed_enabled(&self) -> bool {
        self.speed_test_url.as_deref().map_or(false, |u| !u.is_empty())
    }

    /// Whether the capability probes run
    pub fn media_enabled(&self) -> bool {
        self.media_check && !self.platforms.is_empty()
    }

    /// Whether all three stage overrides are set
    pub fn manual_concurrency(&self) -> bool {
        self.alive_concurrency > 0 && self.speed_concurrency > 0 && self.media_concurrency > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checker_config_default() {
        let config = CheckerConfig::default();
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.timeout, Duration::from_millis(DEFAULT_TIMEOUT_MS));
        assert_eq!(config.alive_urls, vec![DEFAULT_ALIVE_URL.to_string()]);
        assert!(!config.speed_enabled());
        assert!(!config.media_enabled());
        assert!(!config.manual_concurrency());
    }

    #[test]
    fn test_checker_config_builder() {
        let config = CheckerConfig::new()
            .with_concurrency(200)
            .with_timeout(Duration::from_secs(3))
            .with_speed_test("https://speed.example/10mb".to_string(), 1024)
            .with_media_check(vec![Platform::Netflix])
            .with_success_limit(50);

        assert_eq!(config.concurrency, 200);
        assert_eq!(config.timeout, Duration::from_secs(3));
        assert!(config.speed_enabled());
        assert_eq!(config.min_speed_kbps, 1024);
        assert!(config.media_enabled());
        assert_eq!(config.success_limit, 50);
    }

    #[test]
    fn test_empty_speed_url_disables_stage() {
        let config = CheckerConfig::new().with_speed_test(String::new(), 100);
        assert!(!config.speed_enabled());
        let config = CheckerConfig::new().with_media_check(vec![]);
        assert!(!config.media_enabled());
    }

    #[test]
    fn test_manual_concurrency_requires_all_stages() {
        assert!(!CheckerConfig::new().with_stage_concurrency(10, 0, 5).manual_concurrency());
        assert!(CheckerConfig::new().with_stage_concurrency(10, 2, 5).manual_concurrency());
    }
}
