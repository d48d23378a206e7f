//! CDN relay reachability through the Cloudflare trace endpoint

use crate::check::client::{NodeClient, ProbeError, ProbeRequest};
use futures::future::{select_ok, FutureExt};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Sites fronted by Cloudflare that expose `/cdn-cgi/trace`
const TRACE_SITES: &[&str] = &[
    "https://4.ipw.cn",
    "https://www.cloudflare.com",
    "https://api.ipify.org",
    "https://iplark.com",
    "https://ifconfig.co",
    "https://api.ip.sb",
    "https://realip.cc",
    "https://ipapi.co",
    "https://api.myip.com",
    "https://api.ipquery.io",
];

/// Sites raced per node
const TRACE_FANOUT: usize = 3;

/// Upper bound for the whole trace race
const TRACE_TIMEOUT: Duration = Duration::from_secs(10);

const FALLBACK_URL: &str = "https://cloudflare.com";

const BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

/// Outcome of the relay check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CfTrace {
    pub accessible: bool,
    /// Relay location as reported by the trace
    pub loc: String,
    /// Client IP as seen by the relay
    pub ip: String,
}

impl CfTrace {
    pub fn unreachable() -> Self {
        Self::default()
    }

    pub fn has_location(&self) -> bool {
        !self.loc.is_empty() && !self.ip.is_empty()
    }
}

/// Pull `loc=` and `ip=` out of a trace body
pub fn parse_trace(body: &str) -> (Option<String>, Option<String>) {
    let mut loc = None;
    let mut ip = None;
    for line in body.lines() {
        let line = line.trim();
        if let Some(v) = line.strip_prefix("loc=") {
            loc = Some(v.to_string());
        } else if let Some(v) = line.strip_prefix("ip=") {
            ip = Some(v.to_string());
        }
    }
    (loc, ip)
}

async fn fetch_trace(client: &dyn NodeClient, site: &str) -> Result<(String, String), ProbeError> {
    let request = ProbeRequest::get(&format!("{}/cdn-cgi/trace", site))
        .with_timeout(TRACE_TIMEOUT)
        .with_header("User-Agent", BROWSER_UA)
        .with_header("Accept-Language", "en-US,en;q=0.5");
    let response = client.get(request).await?;
    if response.status != 200 {
        return Err(ProbeError::Status(response.status));
    }
    match parse_trace(&response.text().await?) {
        (Some(loc), Some(ip)) if !loc.is_empty() && !ip.is_empty() => Ok((loc, ip)),
        _ => Err(ProbeError::NoBytes),
    }
}

/// Whether the relay can be reached through the client
///
/// A few trace sites are raced and the first complete answer wins. When none
/// answers, a `HEAD` to the main site decides reachability: 200 and 403 both
/// mean the relay answered.
pub async fn check_cloudflare(client: &dyn NodeClient) -> CfTrace {
    let sites: Vec<&str> = {
        let mut rng = rand::thread_rng();
        TRACE_SITES
            .choose_multiple(&mut rng, TRACE_FANOUT)
            .copied()
            .collect()
    };

    let race = select_ok(sites.into_iter().map(|site| fetch_trace(client, site).boxed()));
    if let Ok(Ok(((loc, ip), _))) = tokio::time::timeout(TRACE_TIMEOUT, race).await {
        debug!(loc = %loc, ip = %ip, "Relay trace succeeded");
        return CfTrace {
            accessible: true,
            loc,
            ip,
        };
    }

    let request = ProbeRequest::head(FALLBACK_URL)
        .with_timeout(TRACE_TIMEOUT)
        .with_header("User-Agent", BROWSER_UA);
    match client.get(request).await {
        Ok(response) if response.status == 200 || response.status == 403 => {
            debug!(status = response.status, "Relay reachable without trace");
            CfTrace {
                accessible: true,
                ..CfTrace::default()
            }
        }
        _ => CfTrace::unreachable(),
    }
}
