use crate::check::client::{NodeClient, ProbeError, ProbeRequest};
use futures::future::try_join_all;
use std::time::Duration;

async fn probe(client: &dyn NodeClient, url: &str, timeout: Duration) -> Result<(), ProbeError> {
    let request = ProbeRequest::get(url).with_timeout(timeout);
    let response = tokio::time::timeout(timeout, client.get(request))
        .await
        .map_err(|_| ProbeError::Timeout)??;
    if !response.is_success() {
        return Err(ProbeError::Status(response.status));
    }
    response.drain().await;
    Ok(())
}

/// Every probe URL must answer 2xx through the client
///
/// The URLs are probed concurrently; the first failure ends the check.
pub async fn check_alive(
    client: &dyn NodeClient,
    urls: &[String],
    timeout: Duration,
) -> Result<(), ProbeError> {
    if urls.is_empty() {
        return Err(ProbeError::Transport("no probe urls".to_string()));
    }
    try_join_all(urls.iter().map(|url| probe(client, url, timeout))).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::client::ProbeResponse;
    use async_trait::async_trait;

    struct StatusClient;

    #[async_trait]
    impl NodeClient for StatusClient {
        async fn get(&self, request: ProbeRequest) -> Result<ProbeResponse, ProbeError> {
            if request.url.contains("slow") {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            let status = if request.url.contains("fail") { 503 } else { 204 };
            Ok(ProbeResponse::from_bytes(status, ""))
        }

        fn bytes_read(&self) -> u64 {
            0
        }
    }

    #[tokio::test]
    async fn test_all_urls_must_pass() {
        let urls = vec!["https://a/ok".to_string(), "https://b/ok".to_string()];
        assert!(check_alive(&StatusClient, &urls, Duration::from_secs(1)).await.is_ok());

        let urls = vec!["https://a/ok".to_string(), "https://b/fail".to_string()];
        assert!(matches!(
            check_alive(&StatusClient, &urls, Duration::from_secs(1)).await,
            Err(ProbeError::Status(503))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails() {
        let urls = vec!["https://a/slow".to_string()];
        assert!(matches!(
            check_alive(&StatusClient, &urls, Duration::from_secs(2)).await,
            Err(ProbeError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_no_urls_fails() {
        assert!(check_alive(&StatusClient, &[], Duration::from_secs(1)).await.is_err());
    }
}
