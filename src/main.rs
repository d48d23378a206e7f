use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use node_sieve::{
    check::{
        config::{
            DEFAULT_CONCURRENCY, DEFAULT_DOWNLOAD_MB, DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            DEFAULT_MIN_SPEED_KBPS, DEFAULT_SUCCESS_RATE, DEFAULT_TIMEOUT_MS,
        },
        CheckerConfig, GeoLocator, HttpCapabilityProber, Platform, ProgressMode, ProxyChecker,
        ReqwestClientFactory, RunState,
    },
    node::{prepare_nodes, shuffle::DEFAULT_THRESHOLD, Node, ShuffleConfig},
    tui::{run_progress_line, ProgressApp},
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// A staged proxy node checker with adaptive concurrency
#[derive(Parser)]
#[command(name = "node-sieve")]
#[command(about = "A staged proxy node checker with adaptive concurrency")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check nodes and print the ones that pass as JSON
    Check(CheckArgs),
    /// Deduplicate and order nodes without checking them
    Prepare {
        /// JSON file with the nodes to order
        input: PathBuf,
        /// JSON file with nodes that passed an earlier run
        #[arg(long)]
        previous: Option<PathBuf>,
        /// Similarity threshold for spreading nearby hosts
        #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
        threshold: f64,
        /// Dispatch concurrency used to size the spacing
        #[arg(short = 'n', long, default_value_t = DEFAULT_CONCURRENCY, value_parser = parse_concurrency)]
        concurrency: usize,
    },
}

#[derive(Args)]
struct CheckArgs {
    /// JSON file with the nodes to check
    input: PathBuf,
    /// JSON file with nodes that passed an earlier run
    #[arg(long)]
    previous: Option<PathBuf>,
    /// Output file for the results (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Global concurrency the stage pools are sized from
    #[arg(short = 'n', long, default_value_t = DEFAULT_CONCURRENCY, value_parser = parse_concurrency)]
    concurrency: usize,
    /// Connectivity stage workers, used when all three stage flags are set
    #[arg(long, default_value = "0")]
    alive_concurrency: usize,
    /// Throughput stage workers
    #[arg(long, default_value = "0")]
    speed_concurrency: usize,
    /// Capability stage workers
    #[arg(long, default_value = "0")]
    media_concurrency: usize,
    /// Per-probe timeout in milliseconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS)]
    timeout: u64,
    /// Connectivity test URLs (can specify multiple)
    #[arg(long = "alive-url")]
    alive_urls: Vec<String>,
    /// Download URL for the throughput stage
    #[arg(long)]
    speed_url: Option<String>,
    /// Minimum throughput in KB/s
    #[arg(long, default_value_t = DEFAULT_MIN_SPEED_KBPS)]
    min_speed: u32,
    /// Download timeout in seconds
    #[arg(long, default_value_t = DEFAULT_DOWNLOAD_TIMEOUT_SECS)]
    download_timeout: u64,
    /// Download size cap in MB
    #[arg(long, default_value_t = DEFAULT_DOWNLOAD_MB)]
    download_mb: u64,
    /// Aggregate download limit in MB/s, 0 is unlimited
    #[arg(long, default_value = "0")]
    total_speed_limit: u32,
    /// Run platform capability probes
    #[arg(long)]
    media: bool,
    /// Platforms to probe (can specify multiple)
    #[arg(long = "platform")]
    platforms: Vec<Platform>,
    /// Drop nodes whose Cloudflare relay is unreachable
    #[arg(long)]
    drop_bad_cf: bool,
    /// Stop once this many nodes pass, 0 is unlimited
    #[arg(long, default_value = "0")]
    success_limit: u32,
    /// Similarity threshold for spreading nearby hosts
    #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
    threshold: f64,
    /// Progress mode (dynamic, stage)
    #[arg(long, default_value = "dynamic")]
    progress: ProgressMode,
    /// Rename passing nodes by exit country
    #[arg(long)]
    rename: bool,
    /// Prefix for renamed nodes
    #[arg(long, default_value = "")]
    prefix: String,
    /// Append the exit country code tag to renamed nodes
    #[arg(long)]
    enhanced_tag: bool,
    /// MaxMind country database for exit IP lookups
    #[arg(long)]
    mmdb: Option<PathBuf>,
    /// Warn about subscriptions below this success rate
    #[arg(long, default_value_t = DEFAULT_SUCCESS_RATE)]
    success_rate: f32,
    /// Show the interactive progress dashboard
    #[arg(long)]
    tui: bool,
}

impl CheckArgs {
    fn to_config(&self) -> CheckerConfig {
        let mut config = CheckerConfig::new()
            .with_concurrency(self.concurrency)
            .with_stage_concurrency(
                self.alive_concurrency,
                self.speed_concurrency,
                self.media_concurrency,
            )
            .with_timeout(Duration::from_millis(self.timeout))
            .with_download_limits(Duration::from_secs(self.download_timeout), self.download_mb)
            .with_total_speed_limit(self.total_speed_limit)
            .with_drop_bad_cf_nodes(self.drop_bad_cf)
            .with_success_limit(self.success_limit)
            .with_threshold(self.threshold)
            .with_progress_mode(self.progress)
            .with_success_rate(self.success_rate);

        if !self.alive_urls.is_empty() {
            config = config.with_alive_urls(self.alive_urls.clone());
        }
        if let Some(url) = &self.speed_url {
            config = config.with_speed_test(url.clone(), self.min_speed);
        }
        if self.media {
            let platforms = if self.platforms.is_empty() {
                Platform::defaults()
            } else {
                self.platforms.clone()
            };
            config = config.with_media_check(platforms);
        }
        if self.rename {
            config = config.with_rename(self.prefix.clone(), self.enhanced_tag);
        }
        if let Some(path) = &self.mmdb {
            config = config.with_mmdb_path(path.clone());
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let quiet = matches!(&cli.command, Commands::Check(args) if args.tui);
    init_tracing(quiet);

    match cli.command {
        Commands::Check(args) => run_check(args).await?,
        Commands::Prepare {
            input,
            previous,
            threshold,
            concurrency,
        } => {
            let fresh = read_nodes(&input)?;
            let previous = match previous {
                Some(path) => read_nodes(&path)?,
                None => Vec::new(),
            };
            let cfg = ShuffleConfig::for_run(previous.len() + fresh.len(), concurrency, threshold);
            let (nodes, head) = prepare_nodes(previous, fresh, &cfg, &mut rand::thread_rng());
            info!(nodes = nodes.len(), priority = head, "Prepared nodes");
            println!("{}", serde_json::to_string_pretty(&nodes)?);
        }
    }

    Ok(())
}

async fn run_check(args: CheckArgs) -> Result<()> {
    let config = args.to_config();
    let fresh = read_nodes(&args.input)?;
    let previous = match &args.previous {
        Some(path) => read_nodes(path)?,
        None => Vec::new(),
    };
    info!(
        fresh = fresh.len(),
        previous = previous.len(),
        "Loaded nodes from {:?}",
        args.input
    );

    let geo = match &config.mmdb_path {
        Some(path) => match GeoLocator::from_path(path) {
            Ok(locator) => Some(locator),
            Err(e) => {
                warn!("Failed to open MMDB {:?}: {}", path, e);
                None
            }
        },
        None => None,
    };
    let factory = Arc::new(ReqwestClientFactory::new().with_timeout(config.timeout));
    let prober = Arc::new(HttpCapabilityProber::new(geo).with_timeout(config.timeout));
    let state = Arc::new(RunState::new());
    let checker = ProxyChecker::new(config, factory, prober, Arc::clone(&state));

    let handle = tokio::spawn(async move { checker.check(previous, fresh).await });

    let results = if args.tui {
        let mut app = ProgressApp::new(Arc::clone(&state));
        app.run().await?;
        // leaving the dashboard early still waits for queued checks
        state.request_stop();
        handle.await??
    } else {
        spawn_interrupt_handler(Arc::clone(&state));
        let done = CancellationToken::new();
        let line = tokio::spawn(run_progress_line(Arc::clone(&state), done.clone()));
        let results = handle.await;
        done.cancel();
        let _ = line.await;
        results??
    };

    let json = serde_json::to_string_pretty(&results)?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("writing {:?}", path))?;
            info!("Saved {} results to {:?}", results.len(), path);
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn parse_concurrency(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("concurrency must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

fn init_tracing(quiet: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if quiet {
        builder.with_writer(std::io::sink).init();
    } else {
        builder.with_writer(std::io::stderr).init();
    }
}

/// First Ctrl-C stops the run gracefully, the second one exits
fn spawn_interrupt_handler(state: Arc<RunState>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupted, finishing queued checks. Press Ctrl-C again to exit.");
        state.request_stop();
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
}

/// Read nodes from a JSON array or an object with a `proxies` array
fn read_nodes(path: &Path) -> Result<Vec<Node>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    let document: Value = serde_json::from_str(&content)?;
    let entries = match document {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("proxies") {
            Some(Value::Array(items)) => items,
            _ => return Err(anyhow!("{:?} has no proxies array", path)),
        },
        _ => return Err(anyhow!("{:?} is not a node list", path)),
    };

    let mut nodes = Vec::with_capacity(entries.len());
    for (i, entry) in entries.into_iter().enumerate() {
        match Node::from_value(entry) {
            Ok(node) => nodes.push(node),
            Err(e) => warn!("Skipping node {} in {:?}: {}", i, path, e),
        }
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_args(extra: &[&str]) -> std::result::Result<CheckArgs, clap::Error> {
        let mut argv = vec!["node-sieve", "check", "nodes.json"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv)?.command {
            Commands::Check(args) => Ok(args),
            Commands::Prepare { .. } => unreachable!(),
        }
    }

    #[test]
    fn test_cli_defaults_match_config() {
        let config = check_args(&["--speed-url", "https://speed.example/file"])
            .unwrap()
            .to_config();
        let defaults = CheckerConfig::new();
        assert_eq!(config.concurrency, defaults.concurrency);
        assert_eq!(config.timeout, defaults.timeout);
        assert_eq!(config.download_mb, defaults.download_mb);
        assert_eq!(config.download_timeout, defaults.download_timeout);
        assert_eq!(config.min_speed_kbps, defaults.min_speed_kbps);
        assert_eq!(config.success_rate, defaults.success_rate);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        assert!(check_args(&["-n", "0"]).is_err());
        assert_eq!(check_args(&["-n", "4"]).unwrap().concurrency, 4);
    }
}
