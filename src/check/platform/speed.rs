use crate::check::client::{NodeClient, ProbeError, ProbeRequest};
use crate::check::rate_limit::TokenBucket;
use futures::StreamExt;
use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Shortest duration a measurement is divided by
const MIN_ELAPSED: Duration = Duration::from_millis(100);

/// Large download files picked from when the configured URL contains `random`
pub const RANDOM_SPEED_URLS: &[&str] = &[
    "https://download.thinkbroadband.com/512MB.zip",
    "http://speedtest.tele2.net/1GB.zip",
    "https://cachefly.cachefly.net/300mb.test",
    "http://hkg.download.datapacket.com/1000mb.bin",
    "http://sgp.download.datapacket.com/1000mb.bin",
    "http://tyo.download.datapacket.com/1000mb.bin",
    "https://sgp.proof.ovh.net/files/1Gb.dat",
    "https://sgp-ping.vultr.com/vultr.com.1000MB.bin",
    "https://hnd-jp-ping.vultr.com/vultr.com.1000MB.bin",
    "http://speedtest-sgp1.digitalocean.com/1000mb.test",
    "http://proof.ovh.net/files/1Gb.dat",
    "https://nbg1-speed.hetzner.com/1GB.bin",
    "https://fra-de-ping.vultr.com/vultr.com.1000MB.bin",
    "http://par.download.datapacket.com/1000mb.bin",
    "https://ash-speed.hetzner.com/1GB.bin",
    "http://speedtest.fremont.linode.com/1000MB-fremont.bin",
    "http://speedtest-nyc1.digitalocean.com/1000mb.test",
    "http://lax.download.datapacket.com/1000mb.bin",
];

/// Limits applied to one throughput measurement
#[derive(Debug, Clone)]
pub struct SpeedTest {
    pub url: String,
    pub timeout: Duration,
    /// Network bytes ceiling in MiB, 0 for none
    pub max_mb: u64,
}

impl SpeedTest {
    /// The URL to download, drawn from [`RANDOM_SPEED_URLS`] for `random` URLs
    pub fn resolve_url<R: Rng + ?Sized>(&self, rng: &mut R) -> &str {
        if self.url.contains("random") {
            if let Some(url) = RANDOM_SPEED_URLS.choose(rng) {
                return url;
            }
        }
        &self.url
    }

    fn max_bytes(&self) -> u64 {
        if self.max_mb == 0 {
            u64::MAX
        } else {
            self.max_mb.saturating_mul(1024 * 1024)
        }
    }
}

/// Download through the client and return the rate in KB/s
///
/// The clock starts at the first body chunk. Hitting the timeout or the byte
/// ceiling ends the measurement normally; only a download that yields no
/// bytes at all is an error. Bytes are taken from the client's network
/// counter when it has one, otherwise from what was read here.
pub async fn measure_speed(
    client: &dyn NodeClient,
    test: &SpeedTest,
    bucket: &TokenBucket,
) -> Result<u32, ProbeError> {
    let deadline = Instant::now() + test.timeout;
    let max_bytes = test.max_bytes();

    let url = test.resolve_url(&mut rand::thread_rng()).to_string();
    let request = ProbeRequest::get(&url).with_timeout(test.timeout);
    let response = tokio::time::timeout_at(deadline, client.get(request))
        .await
        .map_err(|_| ProbeError::Timeout)??;
    // handshake and header bytes are not part of the measurement
    let net_start = client.bytes_read();
    if !response.is_success() {
        return Err(ProbeError::Status(response.status));
    }

    let mut body = response.body;
    let mut copied = 0u64;
    let mut first_byte: Option<Instant> = None;
    loop {
        match tokio::time::timeout_at(deadline, body.next()).await {
            Err(_) | Ok(None) => break,
            Ok(Some(Err(e))) => {
                if copied == 0 {
                    return Err(e);
                }
                break;
            }
            Ok(Some(Ok(chunk))) => {
                if first_byte.is_none() {
                    first_byte = Some(Instant::now());
                }
                copied += chunk.len() as u64;
                bucket.take(chunk.len()).await;
                let network = client.bytes_read().saturating_sub(net_start);
                if network.max(copied) >= max_bytes {
                    break;
                }
            }
        }
    }
    drop(body);

    let network = client.bytes_read().saturating_sub(net_start);
    let bytes = if network > 0 { network } else { copied };
    let Some(first_byte) = first_byte.filter(|_| bytes > 0) else {
        return Err(ProbeError::NoBytes);
    };
    let secs = first_byte.elapsed().max(MIN_ELAPSED).as_secs_f64();
    Ok((bytes as f64 / 1024.0 / secs).round() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::client::ProbeResponse;
    use async_trait::async_trait;
    use bytes::Bytes;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// Streams `chunks` chunks of `chunk_size` bytes, `gap` apart
    struct StreamClient {
        chunks: usize,
        chunk_size: usize,
        gap: Duration,
        status: u16,
        network: Option<Arc<AtomicU64>>,
        /// Bytes the transport reads before the body starts
        header_bytes: u64,
    }

    impl StreamClient {
        fn new(chunks: usize, chunk_size: usize, gap: Duration) -> Self {
            Self {
                chunks,
                chunk_size,
                gap,
                status: 200,
                network: None,
                header_bytes: 0,
            }
        }
    }

    #[async_trait]
    impl NodeClient for StreamClient {
        async fn get(&self, _request: ProbeRequest) -> Result<ProbeResponse, ProbeError> {
            if let Some(network) = &self.network {
                network.fetch_add(self.header_bytes, Ordering::SeqCst);
            }
            let (size, gap) = (self.chunk_size, self.gap);
            let network = self.network.clone();
            let body = futures::stream::iter(0..self.chunks)
                .then(move |_| {
                    let network = network.clone();
                    async move {
                        if !gap.is_zero() {
                            tokio::time::sleep(gap).await;
                        }
                        if let Some(network) = network {
                            // pretend the transport reads twice what the body carries
                            network.fetch_add((size * 2) as u64, Ordering::SeqCst);
                        }
                        Ok(Bytes::from(vec![0u8; size]))
                    }
                })
                .boxed();
            Ok(ProbeResponse::new(self.status, body))
        }

        fn bytes_read(&self) -> u64 {
            self.network
                .as_ref()
                .map_or(0, |n| n.load(Ordering::SeqCst))
        }
    }

    fn test_params(timeout_secs: u64, max_mb: u64) -> SpeedTest {
        SpeedTest {
            url: "https://speed.example/100mb".to_string(),
            timeout: Duration::from_secs(timeout_secs),
            max_mb,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_instant_download_uses_min_elapsed() {
        let client = StreamClient::new(16, 64 * 1024, Duration::ZERO);
        let kbps = measure_speed(&client, &test_params(10, 0), &TokenBucket::unlimited())
            .await
            .unwrap();
        // 1 MiB over the 100ms floor
        assert_eq!(kbps, 10240);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_end_measures_from_first_byte() {
        let client = StreamClient::new(10, 10 * 1024, Duration::from_secs(1));
        let kbps = measure_speed(&client, &test_params(30, 0), &TokenBucket::unlimited())
            .await
            .unwrap();
        // 100 KiB between t=1s and t=10s
        assert_eq!(kbps, 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_normal_end() {
        let client = StreamClient::new(1000, 10 * 1024, Duration::from_secs(1));
        let test = SpeedTest {
            timeout: Duration::from_millis(5500),
            ..test_params(0, 0)
        };
        let kbps = measure_speed(&client, &test, &TokenBucket::unlimited())
            .await
            .unwrap();
        // 50 KiB between t=1s and t=5.5s
        assert_eq!(kbps, 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_byte_ceiling_stops_download() {
        let client = StreamClient::new(64, 64 * 1024, Duration::ZERO);
        let kbps = measure_speed(&client, &test_params(10, 1), &TokenBucket::unlimited())
            .await
            .unwrap();
        assert_eq!(kbps, 10240);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_counter_preferred() {
        let mut client = StreamClient::new(16, 64 * 1024, Duration::ZERO);
        client.network = Some(Arc::new(AtomicU64::new(0)));
        let kbps = measure_speed(&client, &test_params(10, 0), &TokenBucket::unlimited())
            .await
            .unwrap();
        assert_eq!(kbps, 20480);
    }

    #[tokio::test(start_paused = true)]
    async fn test_header_bytes_not_counted() {
        let mut client = StreamClient::new(16, 64 * 1024, Duration::ZERO);
        client.network = Some(Arc::new(AtomicU64::new(0)));
        client.header_bytes = 512 * 1024;
        let kbps = measure_speed(&client, &test_params(10, 0), &TokenBucket::unlimited())
            .await
            .unwrap();
        assert_eq!(kbps, 20480);
    }

    #[test]
    fn test_resolve_url() {
        let mut rng = StdRng::seed_from_u64(7);
        let fixed = test_params(10, 0);
        assert_eq!(fixed.resolve_url(&mut rng), "https://speed.example/100mb");

        let random = SpeedTest {
            url: "random".to_string(),
            ..test_params(10, 0)
        };
        for _ in 0..20 {
            assert!(RANDOM_SPEED_URLS.contains(&random.resolve_url(&mut rng)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_body_and_bad_status_fail() {
        let client = StreamClient::new(0, 1024, Duration::ZERO);
        assert!(matches!(
            measure_speed(&client, &test_params(10, 0), &TokenBucket::unlimited()).await,
            Err(ProbeError::NoBytes)
        ));

        let mut client = StreamClient::new(4, 1024, Duration::ZERO);
        client.status = 404;
        assert!(matches!(
            measure_speed(&client, &test_params(10, 0), &TokenBucket::unlimited()).await,
            Err(ProbeError::Status(404))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_slows_measurement() {
        let client = StreamClient::new(16, 64 * 1024, Duration::ZERO);
        // 512 KB/s ceiling
        let bucket = TokenBucket::new(512.0 * 1024.0, 64.0 * 1024.0);
        let kbps = measure_speed(&client, &test_params(30, 0), &bucket)
            .await
            .unwrap();
        assert!(kbps <= 560, "{}", kbps);
        assert!(kbps >= 400, "{}", kbps);
    }
}
