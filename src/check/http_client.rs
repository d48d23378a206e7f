//! Client factory for nodes that reqwest can dial on its own
//!
//! Plain HTTP and SOCKS5 nodes are handled here. Every other protocol needs an
//! external dialer and is reported as unsupported.

use crate::check::client::{
    ClientError, ClientFactory, ClientHandle, Method, NodeClient, ProbeError, ProbeRequest,
    ProbeResponse,
};
use crate::node::{Node, Protocol};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Proxy as ReqwestProxy, Url};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default timeout applied when a request sets none
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Builds reqwest clients routed through HTTP or SOCKS5 nodes
#[derive(Debug, Clone)]
pub struct ReqwestClientFactory {
    timeout: Duration,
}

impl Default for ReqwestClientFactory {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl ReqwestClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Proxy URL for a node, credentials included
    pub fn proxy_url(node: &Node) -> Result<Url, ClientError> {
        let scheme = match node.protocol {
            Protocol::Http => "http",
            // resolve names on the proxy side
            Protocol::Socks5 => "socks5h",
            ref other => return Err(ClientError::Unsupported(other.clone())),
        };
        if !node.has_host() || node.port == 0 {
            return Err(ClientError::Invalid(format!("missing address for {}", node)));
        }
        let mut url = Url::parse(&format!("{}://{}", scheme, node.address()))
            .map_err(|e| ClientError::Invalid(e.to_string()))?;
        if let Some(user) = node.username.as_deref().filter(|u| !u.is_empty()) {
            url.set_username(user)
                .map_err(|_| ClientError::Invalid("bad username".to_string()))?;
            url.set_password(node.password.as_deref())
                .map_err(|_| ClientError::Invalid("bad password".to_string()))?;
        }
        Ok(url)
    }

    fn create_client(&self, node: &Node) -> Result<Client, ClientError> {
        let url = Self::proxy_url(node)?;
        let proxy = ReqwestProxy::all(url.as_str())?;
        let client = Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .build()?;
        Ok(client)
    }
}

impl ClientFactory for ReqwestClientFactory {
    fn build(&self, node: &Node) -> Result<ClientHandle, ClientError> {
        let client = ReqwestNodeClient {
            client: self.create_client(node)?,
            bytes_read: Arc::new(AtomicU64::new(0)),
        };
        // the connection pool is freed with the client
        Ok(ClientHandle::unmanaged(Arc::new(client)))
    }
}

/// reqwest client bound to one node
///
/// Counts body bytes as they are read, which is the closest this layer gets
/// to network-level accounting.
#[derive(Debug)]
pub struct ReqwestNodeClient {
    client: Client,
    bytes_read: Arc<AtomicU64>,
}

fn map_err(e: reqwest::Error) -> ProbeError {
    if e.is_timeout() {
        ProbeError::Timeout
    } else {
        ProbeError::Transport(e.to_string())
    }
}

#[async_trait]
impl NodeClient for ReqwestNodeClient {
    async fn get(&self, request: ProbeRequest) -> Result<ProbeResponse, ProbeError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Head => self.client.head(&request.url),
        };
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(map_err)?;
        let status = response.status().as_u16();
        let counter = Arc::clone(&self.bytes_read);
        let body = response
            .bytes_stream()
            .map(move |chunk| {
                let chunk = chunk.map_err(map_err)?;
                counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                Ok(chunk)
            })
            .boxed();
        Ok(ProbeResponse::new(status, body))
    }

    fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_url_for_supported_protocols() {
        let node = Node::new("a", Protocol::Http, "1.2.3.4", 8080);
        assert_eq!(
            ReqwestClientFactory::proxy_url(&node).unwrap().as_str(),
            "http://1.2.3.4:8080/"
        );

        let mut node = Node::new("b", Protocol::Socks5, "proxy.example", 1080).with_password("p@ss");
        node.username = Some("user".to_string());
        let url = ReqwestClientFactory::proxy_url(&node).unwrap();
        assert_eq!(url.scheme(), "socks5h");
        assert_eq!(url.username(), "user");
        assert_eq!(url.password(), Some("p%40ss"));
    }

    #[test]
    fn test_unsupported_protocol() {
        let node = Node::new("c", Protocol::Vmess, "1.2.3.4", 443);
        assert!(matches!(
            ReqwestClientFactory::proxy_url(&node),
            Err(ClientError::Unsupported(Protocol::Vmess))
        ));
        assert!(ReqwestClientFactory::new().build(&node).is_err());
    }

    #[test]
    fn test_missing_address_is_invalid() {
        let node = Node::new("d", Protocol::Http, "", 8080);
        assert!(matches!(
            ReqwestClientFactory::proxy_url(&node),
            Err(ClientError::Invalid(_))
        ));
    }

    #[test]
    fn test_build_http_client() {
        let node = Node::new("e", Protocol::Http, "127.0.0.1", 3128);
        let handle = ReqwestClientFactory::new()
            .with_timeout(Duration::from_secs(1))
            .build(&node)
            .unwrap();
        assert_eq!(handle.bytes_read(), 0);
    }
}
