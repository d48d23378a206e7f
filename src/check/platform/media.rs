//! Platform capability probes and exit location

use crate::check::client::{NodeClient, ProbeError, ProbeRequest};
use crate::check::geo::GeoLocator;
use crate::check::platform::cloudflare::CfTrace;
use crate::check::platform::Platform;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

/// Default timeout for a single capability request
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;

static YOUTUBE_REGION_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""(?:INNERTUBE_CONTEXT_GL|countryCode)"\s*:\s*"([A-Z]{2})""#)
        .expect("Invalid YouTube region regex")
});

static TIKTOK_REGION_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""region"\s*:\s*"([A-Z]{2})""#).expect("Invalid TikTok region regex")
});

static FRAUD_SCORE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Fraud Score:\s*(\d{1,3})").expect("Invalid fraud score regex")
});

/// What a probe found out about one platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unlock {
    Blocked,
    /// Reachable with partial access
    Partial,
    Available,
    /// Available, reported for the given region (empty if unknown)
    Region(String),
    /// Risk score label of the exit IP
    Risk(String),
}

/// Capability outcomes collected for one node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaReport {
    pub openai: bool,
    pub openai_web: bool,
    pub x: bool,
    pub netflix: bool,
    pub disney: bool,
    pub gemini: bool,
    pub youtube: Option<String>,
    pub tiktok: Option<String>,
    pub ip_risk: Option<String>,
}

impl MediaReport {
    pub fn record(&mut self, platform: Platform, unlock: Unlock) {
        match (platform, unlock) {
            (_, Unlock::Blocked) => {}
            (Platform::OpenAi, Unlock::Available) => self.openai = true,
            (Platform::OpenAi, Unlock::Partial) => self.openai_web = true,
            (Platform::X, _) => self.x = true,
            (Platform::Netflix, _) => self.netflix = true,
            (Platform::Disney, _) => self.disney = true,
            (Platform::Gemini, _) => self.gemini = true,
            (Platform::YouTube, Unlock::Region(r)) => self.youtube = Some(r),
            (Platform::YouTube, _) => self.youtube = Some(String::new()),
            (Platform::TikTok, Unlock::Region(r)) => self.tiktok = Some(r),
            (Platform::TikTok, _) => self.tiktok = Some(String::new()),
            (Platform::IpRisk, Unlock::Risk(score)) => self.ip_risk = Some(score),
            _ => {}
        }
    }

    /// Display-name tags in the order of `platforms`
    ///
    /// Region tags only carry the region when it differs from the exit
    /// country.
    pub fn tags(&self, platforms: &[Platform], country: &str) -> Vec<String> {
        let region_tag = |prefix: &str, region: &str| {
            if region.is_empty() || region == country {
                prefix.to_string()
            } else {
                format!("{}-{}", prefix, region)
            }
        };

        let mut tags = Vec::new();
        for platform in platforms {
            match platform {
                Platform::OpenAi if self.openai => tags.push("GPT⁺".to_string()),
                Platform::OpenAi if self.openai_web => tags.push("GPT".to_string()),
                Platform::X if self.x => tags.push("X".to_string()),
                Platform::Netflix if self.netflix => tags.push("NF".to_string()),
                Platform::Disney if self.disney => tags.push("D+".to_string()),
                Platform::Gemini if self.gemini => tags.push("GM".to_string()),
                Platform::IpRisk => {
                    if let Some(risk) = self.ip_risk.as_deref().filter(|r| !r.is_empty()) {
                        tags.push(risk.to_string());
                    }
                }
                Platform::YouTube => {
                    if let Some(region) = &self.youtube {
                        tags.push(region_tag("YT", region));
                    }
                }
                Platform::TikTok => {
                    if let Some(region) = &self.tiktok {
                        tags.push(region_tag("TK", region));
                    }
                }
                _ => {}
            }
        }
        tags
    }
}

/// Exit IP and its country
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitLocation {
    pub ip: String,
    pub country: String,
}

/// Tag describing how the exit country relates to the relay
///
/// - `XX²`: relay not traced, or the relay sees the exit IP itself
/// - `XX¹⁺`: relayed, relay in the same country
/// - `XX¹-YY⁰`: relayed through country `YY`
/// - `XX⁻¹`: relay traced but unreachable
pub fn country_code_tag(country: &str, exit_ip: &str, cf: Option<&CfTrace>) -> String {
    if country.is_empty() {
        return String::new();
    }
    match cf {
        None => format!("{}²", country),
        Some(cf) if !cf.accessible => format!("{}⁻¹", country),
        Some(cf) => {
            if !cf.has_location() || cf.ip == exit_ip {
                format!("{}²", country)
            } else if cf.loc.eq_ignore_ascii_case(country) {
                format!("{}¹⁺", country)
            } else {
                format!("{}¹-{}⁰", country, cf.loc.to_ascii_uppercase())
            }
        }
    }
}

/// Per-node information available to probes
#[derive(Debug, Clone, Default)]
pub struct ProbeContext {
    pub cf: Option<CfTrace>,
    /// Relay-dependent platforms are skipped when the relay is unreachable
    pub need_cf: bool,
    pub exit_ip: Option<String>,
}

impl ProbeContext {
    fn relay_blocked(&self) -> bool {
        self.need_cf && !self.cf.as_ref().map_or(false, |cf| cf.accessible)
    }
}

/// Capability checks run by the last pipeline stage
#[async_trait]
pub trait CapabilityProber: Send + Sync {
    async fn probe(&self, platform: Platform, client: &dyn NodeClient, ctx: &ProbeContext) -> Unlock;

    async fn locate(&self, client: &dyn NodeClient, cf: Option<&CfTrace>) -> Option<ExitLocation>;
}

/// Probes real platform endpoints through the node
#[derive(Debug, Clone)]
pub struct HttpCapabilityProber {
    geo: Option<GeoLocator>,
    timeout: Duration,
}

impl Default for HttpCapabilityProber {
    fn default() -> Self {
        Self {
            geo: None,
            timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
        }
    }
}

impl HttpCapabilityProber {
    pub fn new(geo: Option<GeoLocator>) -> Self {
        Self {
            geo,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn fetch(&self, client: &dyn NodeClient, url: &str) -> Result<(u16, String), ProbeError> {
        let request = ProbeRequest::get(url)
            .with_timeout(self.timeout)
            .with_header("User-Agent", BROWSER_UA)
            .with_header("Accept-Language", "en-US,en;q=0.9");
        let response = tokio::time::timeout(self.timeout, client.get(request))
            .await
            .map_err(|_| ProbeError::Timeout)??;
        let status = response.status;
        let body = tokio::time::timeout(self.timeout, response.text())
            .await
            .map_err(|_| ProbeError::Timeout)??;
        Ok((status, body))
    }

    async fn openai(&self, client: &dyn NodeClient) -> Unlock {
        let cookies = matches!(
            self.fetch(client, "https://api.openai.com/compliance/cookie_requirements").await,
            Ok((_, body)) if !body.contains("unsupported_country")
        );
        let app = matches!(
            self.fetch(client, "https://ios.chat.openai.com/").await,
            Ok((_, body)) if !body.contains("unsupported_country") && !body.contains("VPN")
        );
        match (cookies, app) {
            (true, true) => Unlock::Available,
            (true, false) | (false, true) => Unlock::Partial,
            _ => Unlock::Blocked,
        }
    }

    async fn region(&self, client: &dyn NodeClient, url: &str, re: &Regex) -> Unlock {
        match self.fetch(client, url).await {
            Ok((200, body)) => {
                if body.contains("not available in your country") {
                    return Unlock::Blocked;
                }
                let region = re
                    .captures(&body)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string());
                match region {
                    Some(r) => Unlock::Region(r),
                    None => Unlock::Blocked,
                }
            }
            _ => Unlock::Blocked,
        }
    }

    async fn ip_risk(&self, client: &dyn NodeClient, ip: &str) -> Unlock {
        let url = format!("https://scamalytics.com/ip/{}", ip);
        match self.fetch(client, &url).await {
            Ok((200, body)) => FRAUD_SCORE_REGEX
                .captures(&body)
                .and_then(|c| c.get(1))
                .map_or(Unlock::Blocked, |m| Unlock::Risk(format!("{}%", m.as_str()))),
            _ => Unlock::Blocked,
        }
    }

    fn lookup_country(&self, ip: &str) -> Option<String> {
        let geo = self.geo.as_ref()?;
        match geo.lookup(ip) {
            Ok(location) => location.country_code,
            Err(e) => {
                debug!(ip = %ip, error = %e, "Geo lookup failed");
                None
            }
        }
    }
}

#[async_trait]
impl CapabilityProber for HttpCapabilityProber {
    async fn probe(&self, platform: Platform, client: &dyn NodeClient, ctx: &ProbeContext) -> Unlock {
        if platform.needs_cloudflare() && ctx.relay_blocked() {
            return Unlock::Blocked;
        }
        match platform {
            // reachable relay is all X needs
            Platform::X => Unlock::Available,
            Platform::OpenAi => self.openai(client).await,
            Platform::Netflix => match self.fetch(client, "https://www.netflix.com/title/81280792").await {
                Ok((200, _)) => Unlock::Available,
                _ => Unlock::Blocked,
            },
            Platform::Disney => match self.fetch(client, "https://www.disneyplus.com/").await {
                Ok((200, body)) if !body.contains("unavailable") => Unlock::Available,
                _ => Unlock::Blocked,
            },
            Platform::Gemini => match self.fetch(client, "https://gemini.google.com/").await {
                Ok((200, body)) if body.contains("45631641,null,true") => Unlock::Available,
                _ => Unlock::Blocked,
            },
            Platform::YouTube => {
                self.region(client, "https://www.youtube.com/premium", &YOUTUBE_REGION_REGEX)
                    .await
            }
            Platform::TikTok => {
                self.region(client, "https://www.tiktok.com/explore", &TIKTOK_REGION_REGEX)
                    .await
            }
            Platform::IpRisk => match ctx.exit_ip.as_deref() {
                Some(ip) if !ip.is_empty() => self.ip_risk(client, ip).await,
                _ => Unlock::Blocked,
            },
        }
    }

    async fn locate(&self, client: &dyn NodeClient, cf: Option<&CfTrace>) -> Option<ExitLocation> {
        let mut ip = String::new();
        let mut country = String::new();

        if let Ok((200, body)) = self.fetch(client, "https://ipinfo.io/json").await {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&body) {
                ip = value["ip"].as_str().unwrap_or_default().to_string();
                country = value["country"].as_str().unwrap_or_default().to_string();
            }
        }
        if ip.is_empty() {
            if let Some(cf) = cf.filter(|cf| !cf.ip.is_empty()) {
                ip = cf.ip.clone();
            }
        }
        if ip.is_empty() {
            return None;
        }
        if let Some(code) = self.lookup_country(&ip) {
            country = code;
        }
        if country.is_empty() {
            // the relay saw the exit IP directly, so its location is the exit's
            if let Some(cf) = cf.filter(|cf| cf.ip == ip) {
                country = cf.loc.clone();
            }
        }
        Some(ExitLocation {
            ip,
            country: country.to_ascii_uppercase(),
        })
    }
}
