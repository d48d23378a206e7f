//! The checking pipeline
//!
//! Nodes flow through bounded queues:
//! dispatch → connectivity → throughput (optional) → capability → collector.
//! Each stage runs a fixed pool of workers sharing one receiver; a stage's
//! output closes only after all of its workers are done, so shutdown always
//! drains from the front of the pipeline to the back.

use crate::check::client::ClientFactory;
use crate::check::concurrency::ConcurrencyPlan;
use crate::check::config::CheckerConfig;
use crate::check::job::{CheckResult, ClientLease, Job};
use crate::check::platform::{
    check_alive, check_cloudflare, country_code_tag, measure_speed, CapabilityProber, Platform,
    ProbeContext, SpeedTest,
};
use crate::check::progress::ProgressTracker;
use crate::check::rate_limit::TokenBucket;
use crate::check::state::{RunState, Stage};
use crate::check::stats::{report_subscriptions, strip_subscription_fields, subscription_stats};
use crate::node::{compose_name, prepare_nodes, speed_tag, threshold_to_cidr, Node, Renamer, ShuffleConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// How often the stop flag is polled
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors that fail a whole run
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("no nodes to check")]
    NoNodes,
}

type SharedReceiver<T> = Arc<Mutex<mpsc::Receiver<T>>>;

async fn next_item<T>(rx: &SharedReceiver<T>) -> Option<T> {
    rx.lock().await.recv().await
}

async fn join_workers(workers: &mut JoinSet<()>, stage: &str) {
    while let Some(res) = workers.join_next().await {
        if let Err(e) = res {
            warn!(stage, error = %e, "Worker ended abnormally");
        }
    }
}

/// Everything the stage workers of one run share
struct Shared {
    config: CheckerConfig,
    plan: ConcurrencyPlan,
    factory: Arc<dyn ClientFactory>,
    prober: Arc<dyn CapabilityProber>,
    state: Arc<RunState>,
    tracker: ProgressTracker,
    token: CancellationToken,
    bucket: TokenBucket,
    speed_test: Option<SpeedTest>,
    renamer: Renamer,
    need_cf: bool,
}

impl Shared {
    /// Count an available node and stop dispatching once the limit is hit
    fn note_available(&self) {
        let available = self.state.add_available();
        let limit = u64::from(self.config.success_limit);
        if limit > 0 && available >= limit && self.state.mark_success_limited() {
            warn!(limit, "Success limit reached, waiting for queued checks to finish");
            self.token.cancel();
        }
    }

    fn build_job(&self, index: usize, node: &Node) -> Option<Job> {
        match self.factory.build(node) {
            Ok(handle) => {
                let lease = ClientLease::new(handle, Arc::clone(&self.state));
                Some(Job::new(index, node.clone(), lease, self.need_cf))
            }
            Err(e) => {
                debug!(node = %node, error = %e, "Client build failed");
                self.tracker.count_alive(false);
                None
            }
        }
    }

    /// Run capability probes, rename and tag the node
    async fn finish_job(&self, mut job: Job) -> CheckResult {
        let config = &self.config;
        if let Some(client) = job.client() {
            let client = client.as_ref();
            let wants_location = config.rename_node
                || (config.media_enabled() && config.platforms.contains(&Platform::IpRisk));
            if wants_location {
                if let Some(location) = self.prober.locate(client, job.cf.as_ref()).await {
                    let tag = country_code_tag(&location.country, &location.ip, job.cf.as_ref());
                    job.result.ip = Some(location.ip);
                    job.result.country = Some(location.country).filter(|c| !c.is_empty());
                    job.result.country_code_tag = Some(tag).filter(|t| !t.is_empty());
                }
            }

            if config.media_enabled() {
                let ctx = ProbeContext {
                    cf: job.cf.clone(),
                    need_cf: job.need_cf,
                    exit_ip: job.result.ip.clone(),
                };
                for platform in &config.platforms {
                    let unlock = self.prober.probe(*platform, client, &ctx).await;
                    job.result.media.record(*platform, unlock);
                }
            }
        }

        let country = job.result.country.clone().unwrap_or_default();
        let mut name = job.result.node.name.clone();
        if config.rename_node {
            let code_tag = job.result.country_code_tag.as_deref().unwrap_or("");
            let renamed = self.renamer.rename(&country, code_tag);
            name = if country.is_empty() {
                format!("{}{}{}", config.node_prefix, renamed, name)
            } else {
                format!("{}{}", config.node_prefix, renamed)
            };
        }

        let mut tags = Vec::new();
        if let Some(kbps) = job.result.speed_kbps.filter(|k| *k > 0) {
            tags.push(speed_tag(kbps));
        }
        if config.media_enabled() {
            tags.extend(job.result.media.tags(&config.platforms, &country));
        }
        if let Some(sub_tag) = job.result.node.sub_tag.as_deref().filter(|t| !t.is_empty()) {
            tags.push(sub_tag.to_string());
        }
        job.result.node.name = compose_name(&name, &tags);

        job.into_result()
    }
}

/// Multi-stage node checker
pub struct ProxyChecker {
    config: CheckerConfig,
    factory: Arc<dyn ClientFactory>,
    prober: Arc<dyn CapabilityProber>,
    state: Arc<RunState>,
}

impl ProxyChecker {
    pub fn new(
        config: CheckerConfig,
        factory: Arc<dyn ClientFactory>,
        prober: Arc<dyn CapabilityProber>,
        state: Arc<RunState>,
    ) -> Self {
        Self {
            config,
            factory,
            prober,
            state,
        }
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<RunState> {
        &self.state
    }

    /// Deduplicate, order and check nodes
    ///
    /// Nodes in `previous` passed an earlier run and are checked first, in
    /// their given order; `fresh` nodes are shuffled behind them.
    pub async fn check(
        &self,
        previous: Vec<Node>,
        fresh: Vec<Node>,
    ) -> crate::Result<Vec<CheckResult>> {
        let cfg = ShuffleConfig::for_run(
            previous.len() + fresh.len(),
            self.config.concurrency,
            self.config.threshold,
        );
        let (nodes, head) = {
            let mut rng = rand::thread_rng();
            prepare_nodes(previous, fresh, &cfg, &mut rng)
        };
        info!(
            nodes = nodes.len(),
            priority = head,
            min_spacing = cfg.min_spacing,
            cidr = %threshold_to_cidr(cfg.threshold),
            "Prepared dispatch order"
        );
        self.run(nodes).await
    }

    /// Check nodes in the given order
    pub async fn run(&self, nodes: Vec<Node>) -> crate::Result<Vec<CheckResult>> {
        if nodes.is_empty() {
            return Err(CheckError::NoNodes.into());
        }
        let span = info_span!("check", run_id = %Uuid::new_v4());
        self.run_pipeline(nodes).instrument(span).await
    }

    async fn run_pipeline(&self, nodes: Vec<Node>) -> crate::Result<Vec<CheckResult>> {
        let config = &self.config;
        let total = nodes.len();
        let plan = ConcurrencyPlan::compute(total, config);
        let speed_on = config.speed_enabled();
        let media_on = config.media_enabled();

        self.state.begin_run(total as u64);
        let shared = Arc::new(Shared {
            config: config.clone(),
            plan,
            factory: Arc::clone(&self.factory),
            prober: Arc::clone(&self.prober),
            state: Arc::clone(&self.state),
            tracker: ProgressTracker::new(
                config.progress_mode,
                total as u64,
                speed_on,
                media_on,
                Arc::clone(&self.state),
            ),
            token: CancellationToken::new(),
            bucket: if speed_on {
                TokenBucket::from_mbps(config.total_speed_limit_mbps)
            } else {
                TokenBucket::unlimited()
            },
            speed_test: config.speed_test_url.clone().filter(|_| speed_on).map(|url| SpeedTest {
                url,
                timeout: config.download_timeout,
                max_mb: config.download_mb,
            }),
            renamer: Renamer::new(config.enhanced_tag),
            need_cf: config.drop_bad_cf_nodes
                || (media_on && config.platforms.iter().any(Platform::needs_cloudflare)),
        });

        info!(
            total,
            auto = plan.auto,
            concurrency = config.concurrency,
            alive_workers = plan.alive_workers,
            speed_workers = if speed_on { plan.speed_workers } else { 0 },
            media_workers = plan.media_workers,
            speed_test = speed_on,
            media_check = media_on,
            drop_bad_cf_nodes = config.drop_bad_cf_nodes,
            success_limit = config.success_limit,
            total_speed_limit = config.total_speed_limit_mbps,
            timeout_ms = config.timeout.as_millis() as u64,
            "Starting node check"
        );

        let watcher = tokio::spawn(watch_stop(Arc::clone(&shared)));

        let (alive_tx, alive_rx) = mpsc::channel(plan.alive_queue.max(1));
        let (speed_tx, speed_rx) = mpsc::channel(plan.speed_queue.max(1));
        let (media_tx, media_rx) = mpsc::channel(plan.media_queue.max(1));

        let nodes = Arc::new(nodes);
        let dispatch = tokio::spawn(dispatch_stage(Arc::clone(&shared), Arc::clone(&nodes), alive_tx));
        let (alive, speed) = if speed_on {
            let alive = tokio::spawn(alive_stage(Arc::clone(&shared), alive_rx, speed_tx));
            let speed = tokio::spawn(speed_stage(Arc::clone(&shared), speed_rx, media_tx));
            (alive, Some(speed))
        } else {
            drop((speed_tx, speed_rx));
            let alive = tokio::spawn(alive_stage(Arc::clone(&shared), alive_rx, media_tx));
            (alive, None)
        };

        let mut results = media_stage(Arc::clone(&shared), media_rx).await;

        for (stage, handle) in [("dispatch", Some(dispatch)), ("alive", Some(alive)), ("speed", speed)] {
            if let Some(handle) = handle {
                if let Err(e) = handle.await {
                    warn!(stage, error = %e, "Stage supervisor ended abnormally");
                }
            }
        }
        watcher.abort();

        shared.tracker.finalize();
        self.state.end_run();

        results.sort_by_key(|r| r.index);
        if self.state.success_limited() {
            info!(limit = config.success_limit, "Success limit reached, results collected");
        }
        info!(
            available = results.len(),
            traffic_gb = %format!("{:.3}", self.state.total_bytes() as f64 / 1024.0 / 1024.0 / 1024.0),
            "Node check finished"
        );
        summarize_subscriptions(&nodes, &mut results, config.success_rate);

        Ok(results)
    }
}

/// Turn an external stop request into cancellation
async fn watch_stop(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(STOP_POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = shared.token.cancelled() => return,
            _ = ticker.tick() => {
                if shared.state.stop_requested() {
                    warn!("Stop requested, collecting finished results");
                    shared.token.cancel();
                    return;
                }
            }
        }
    }
}

async fn dispatch_stage(shared: Arc<Shared>, nodes: Arc<Vec<Node>>, out: mpsc::Sender<Job>) {
    let next = Arc::new(AtomicUsize::new(0));
    let mut workers = JoinSet::new();
    for _ in 0..shared.plan.alive_workers.min(nodes.len()) {
        let shared = Arc::clone(&shared);
        let nodes = Arc::clone(&nodes);
        let next = Arc::clone(&next);
        let out = out.clone();
        workers.spawn(async move {
            loop {
                let index = next.fetch_add(1, Ordering::SeqCst);
                if index >= nodes.len() || shared.token.is_cancelled() {
                    return;
                }
                let Some(job) = shared.build_job(index, &nodes[index]) else {
                    continue;
                };
                tokio::select! {
                    biased;
                    _ = shared.token.cancelled() => return,
                    res = out.send(job) => {
                        if res.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }
    drop(out);
    join_workers(&mut workers, "dispatch").await;
}

async fn alive_stage(shared: Arc<Shared>, rx: mpsc::Receiver<Job>, out: mpsc::Sender<Job>) {
    let rx = Arc::new(Mutex::new(rx));
    let mut workers = JoinSet::new();
    for _ in 0..shared.plan.alive_workers {
        workers.spawn(alive_worker(Arc::clone(&shared), Arc::clone(&rx), out.clone()));
    }
    join_workers(&mut workers, "alive").await;

    let tracker = &shared.tracker;
    info!(
        tested = tracker.alive_done(),
        alive = tracker.alive_success(),
        "Connectivity stage closed"
    );
    if tracker.alive_success() == 0 {
        warn!("No node survived connectivity");
    }
    tracker.finish_alive_stage();
    // downstream sees the end of input only after the tracker moved on
    drop(out);
}

async fn alive_worker(shared: Arc<Shared>, rx: SharedReceiver<Job>, out: mpsc::Sender<Job>) {
    let config = &shared.config;
    let speed_on = shared.speed_test.is_some();
    while let Some(mut job) = next_item(&rx).await {
        // after a stop, queued jobs are released without being tested
        if shared.token.is_cancelled() {
            job.close();
            continue;
        }
        let Some(client) = job.client() else {
            continue;
        };

        if let Err(e) = check_alive(client.as_ref(), &config.alive_urls, config.timeout).await {
            debug!(node = %job.node(), error = %e, "Connectivity failed");
            if job.mark(Stage::Alive) {
                shared.tracker.count_alive(false);
            }
            job.close();
            continue;
        }

        if job.need_cf {
            let cf = check_cloudflare(client.as_ref()).await;
            if config.drop_bad_cf_nodes && !cf.accessible {
                debug!(node = %job.node(), "Relay unreachable, dropped");
                if job.mark(Stage::Alive) {
                    shared.tracker.count_alive(false);
                }
                job.close();
                continue;
            }
            job.cf = Some(cf);
        }
        drop(client);

        if job.mark(Stage::Alive) {
            shared.tracker.count_alive(true);
        }

        if speed_on {
            tokio::select! {
                biased;
                _ = shared.token.cancelled() => {}
                res = out.send(job) => {
                    if res.is_err() {
                        return;
                    }
                }
            }
        } else {
            if job.mark(Stage::Speed) {
                shared.note_available();
            }
            if out.send(job).await.is_err() {
                return;
            }
        }
    }
}

async fn speed_stage(shared: Arc<Shared>, rx: mpsc::Receiver<Job>, out: mpsc::Sender<Job>) {
    let rx = Arc::new(Mutex::new(rx));
    let mut workers = JoinSet::new();
    for _ in 0..shared.plan.speed_workers {
        workers.spawn(speed_worker(Arc::clone(&shared), Arc::clone(&rx), out.clone()));
    }
    join_workers(&mut workers, "speed").await;

    let tracker = &shared.tracker;
    info!(
        tested = tracker.speed_done(),
        passed = tracker.speed_success(),
        "Throughput stage closed"
    );
    tracker.finish_speed_stage();
    drop(out);
}

async fn speed_worker(shared: Arc<Shared>, rx: SharedReceiver<Job>, out: mpsc::Sender<Job>) {
    let Some(test) = shared.speed_test.as_ref() else {
        return;
    };
    let min_speed = shared.config.min_speed_kbps;
    // jobs already queued here are still measured after a stop
    while let Some(mut job) = next_item(&rx).await {
        let Some(client) = job.client() else {
            continue;
        };
        let speed = match measure_speed(client.as_ref(), test, &shared.bucket).await {
            Ok(kbps) if kbps >= min_speed => Some(kbps),
            Ok(kbps) => {
                debug!(node = %job.node(), kbps, "Too slow");
                None
            }
            Err(e) => {
                debug!(node = %job.node(), error = %e, "Throughput test failed");
                None
            }
        };
        drop(client);

        if job.mark(Stage::Speed) {
            shared.tracker.count_speed(speed.is_some());
            if speed.is_some() {
                shared.note_available();
            }
        }
        let Some(kbps) = speed else {
            job.close();
            continue;
        };
        job.result.speed_kbps = Some(kbps);

        if out.send(job).await.is_err() {
            return;
        }
    }
}

/// Capability workers plus the single collector; returns the collected results
async fn media_stage(shared: Arc<Shared>, rx: mpsc::Receiver<Job>) -> Vec<CheckResult> {
    let capacity = shared
        .plan
        .media_queue
        .max(shared.config.success_limit as usize)
        .max(1);
    let (result_tx, mut result_rx) = mpsc::channel::<CheckResult>(capacity);
    let collector = tokio::spawn(async move {
        let mut results = Vec::new();
        while let Some(result) = result_rx.recv().await {
            results.push(result);
        }
        results
    });

    let rx = Arc::new(Mutex::new(rx));
    let mut workers = JoinSet::new();
    for _ in 0..shared.plan.media_workers {
        let shared = Arc::clone(&shared);
        let rx = Arc::clone(&rx);
        let result_tx = result_tx.clone();
        workers.spawn(async move {
            while let Some(mut job) = next_item(&rx).await {
                let counted = job.mark(Stage::Media);
                let result = shared.finish_job(job).await;
                if result_tx.send(result).await.is_err() {
                    return;
                }
                if counted {
                    shared.tracker.count_media();
                }
            }
        });
    }
    drop(result_tx);
    join_workers(&mut workers, "media").await;

    match collector.await {
        Ok(results) => results,
        Err(e) => {
            warn!(error = %e, "Collector ended abnormally");
            Vec::new()
        }
    }
}

/// Per-subscription statistics, then strip the bookkeeping fields
pub fn summarize_subscriptions(nodes: &[Node], results: &mut [CheckResult], min_rate: f32) {
    let stats = subscription_stats(nodes, results);
    report_subscriptions(&stats, min_rate);
    strip_subscription_fields(results);
}
