//! Seam between the checker and whatever can dial a node
//!
//! Speaking the actual proxy protocols lives outside this crate. The checker
//! only needs "an HTTP-capable client tunnelling through node N" plus a way to
//! release it, which is what [`ClientFactory`] and [`NodeClient`] describe.

use crate::node::{Node, Protocol};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while building a client for a node
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("unsupported protocol: {0}")]
    Unsupported(Protocol),
    #[error("invalid node: {0}")]
    Invalid(String),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors raised by a single probe request
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("request timed out")]
    Timeout,
    #[error("unexpected status: {0}")]
    Status(u16),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("no bytes received")]
    NoBytes,
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
}

/// A request sent through a node
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub method: Method,
    pub url: String,
    pub timeout: Option<Duration>,
    pub headers: Vec<(String, String)>,
}

impl ProbeRequest {
    pub fn get(url: &str) -> Self {
        Self {
            method: Method::Get,
            url: url.to_string(),
            timeout: None,
            headers: Vec::new(),
        }
    }

    pub fn head(url: &str) -> Self {
        Self {
            method: Method::Head,
            ..Self::get(url)
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// Response whose body is read lazily
pub struct ProbeResponse {
    pub status: u16,
    pub body: BoxStream<'static, Result<Bytes, ProbeError>>,
}

impl ProbeResponse {
    pub fn new(status: u16, body: BoxStream<'static, Result<Bytes, ProbeError>>) -> Self {
        Self { status, body }
    }

    /// Response with an in-memory body
    pub fn from_bytes(status: u16, body: impl Into<Bytes>) -> Self {
        let chunk: Bytes = body.into();
        Self::new(status, futures::stream::once(async move { Ok(chunk) }).boxed())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Read the whole body as lossy UTF-8
    pub async fn text(mut self) -> Result<String, ProbeError> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Discard the body, returning how many bytes were read
    pub async fn drain(mut self) -> u64 {
        let mut n = 0u64;
        while let Some(Ok(chunk)) = self.body.next().await {
            n += chunk.len() as u64;
        }
        n
    }
}

impl fmt::Debug for ProbeResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// HTTP-capable client routed through one node
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn get(&self, request: ProbeRequest) -> Result<ProbeResponse, ProbeError>;

    /// Bytes read from the network so far, 0 if the dialer does not track it
    fn bytes_read(&self) -> u64;
}

/// Builds clients for nodes
pub trait ClientFactory: Send + Sync {
    fn build(&self, node: &Node) -> Result<ClientHandle, ClientError>;
}

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// A client plus the callback that frees its resources
///
/// The release callback runs at most once, either through
/// [`ClientHandle::release`] or when the handle is dropped.
pub struct ClientHandle {
    client: Arc<dyn NodeClient>,
    release: Mutex<Option<ReleaseFn>>,
}

impl ClientHandle {
    pub fn new(client: Arc<dyn NodeClient>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            client,
            release: Mutex::new(Some(Box::new(release))),
        }
    }

    /// Handle with nothing to free
    pub fn unmanaged(client: Arc<dyn NodeClient>) -> Self {
        Self {
            client,
            release: Mutex::new(None),
        }
    }

    pub fn client(&self) -> &Arc<dyn NodeClient> {
        &self.client
    }

    pub fn bytes_read(&self) -> u64 {
        self.client.bytes_read()
    }

    pub fn release(&self) {
        let release = self.release.lock().take();
        if let Some(release) = release {
            release();
        }
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("bytes_read", &self.client.bytes_read())
            .finish_non_exhaustive()
    }
}
