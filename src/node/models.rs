//! Node data models

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Errors raised while turning a raw attribute bag into a [`Node`]
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node attributes are not an object")]
    NotAnObject,
    #[error("invalid node attributes: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// Proxy protocol family of a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Protocol {
    Shadowsocks,
    ShadowsocksR,
    Vmess,
    Vless,
    Trojan,
    Hysteria,
    Hysteria2,
    Tuic,
    WireGuard,
    Http,
    Socks5,
    /// Anything the dialer layer may know about but this crate does not
    Other(String),
}

impl Protocol {
    pub fn as_str(&self) -> &str {
        match self {
            Protocol::Shadowsocks => "ss",
            Protocol::ShadowsocksR => "ssr",
            Protocol::Vmess => "vmess",
            Protocol::Vless => "vless",
            Protocol::Trojan => "trojan",
            Protocol::Hysteria => "hysteria",
            Protocol::Hysteria2 => "hysteria2",
            Protocol::Tuic => "tuic",
            Protocol::WireGuard => "wireguard",
            Protocol::Http => "http",
            Protocol::Socks5 => "socks5",
            Protocol::Other(s) => s,
        }
    }
}

impl From<&str> for Protocol {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "ss" | "shadowsocks" => Protocol::Shadowsocks,
            "ssr" | "shadowsocksr" => Protocol::ShadowsocksR,
            "vmess" => Protocol::Vmess,
            "vless" => Protocol::Vless,
            "trojan" => Protocol::Trojan,
            "hysteria" => Protocol::Hysteria,
            "hysteria2" | "hy2" => Protocol::Hysteria2,
            "tuic" => Protocol::Tuic,
            "wireguard" | "wg" => Protocol::WireGuard,
            "http" | "https" => Protocol::Http,
            "socks5" | "socks" => Protocol::Socks5,
            other => Protocol::Other(other.to_string()),
        }
    }
}

impl From<String> for Protocol {
    fn from(s: String) -> Self {
        Protocol::from(s.as_str())
    }
}

impl From<Protocol> for String {
    fn from(p: Protocol) -> Self {
        p.as_str().to_string()
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single candidate proxy definition
///
/// The well-known attributes are typed; transport options that only the
/// dialer cares about stay in `extra` and are passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub protocol: Protocol,
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default, alias = "sni", skip_serializing_if = "Option::is_none")]
    pub servername: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// Subscription this node was fetched from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_url: Option<String>,
    /// Tag appended to the display name of this subscription's nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_tag: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Node {
    /// Create a node with only the addressing attributes set
    pub fn new(name: &str, protocol: Protocol, server: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            protocol,
            server: server.to_string(),
            port,
            servername: None,
            username: None,
            password: None,
            uuid: None,
            sub_url: None,
            sub_tag: None,
            extra: Map::new(),
        }
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    pub fn with_uuid(mut self, uuid: &str) -> Self {
        self.uuid = Some(uuid.to_string());
        self
    }

    pub fn with_servername(mut self, servername: &str) -> Self {
        self.servername = Some(servername.to_string());
        self
    }

    pub fn with_subscription(mut self, url: &str) -> Self {
        self.sub_url = Some(url.to_string());
        self
    }

    /// Build a node from a generic attribute bag
    pub fn from_value(value: Value) -> Result<Self, NodeError> {
        if !value.is_object() {
            return Err(NodeError::NotAnObject);
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Password if present, otherwise the uuid credential
    pub fn credential(&self) -> &str {
        match self.password.as_deref() {
            Some(p) if !p.is_empty() => p,
            _ => self.uuid.as_deref().unwrap_or(""),
        }
    }

    /// Whether the node can be dialed at all
    pub fn has_host(&self) -> bool {
        !self.server.trim().is_empty()
    }

    /// Identity used for deduplication
    ///
    /// Protocol, host and servername compare case-insensitively; the
    /// credential is kept verbatim.
    pub fn identity_key(&self) -> String {
        format!(
            "[{}]{}:{}:{}:{}",
            self.protocol.as_str().to_ascii_lowercase(),
            self.server.trim().to_ascii_lowercase(),
            self.port,
            self.servername.as_deref().unwrap_or("").to_ascii_lowercase(),
            self.credential()
        )
    }

    /// Get the node address in HOST:PORT format
    pub fn address(&self) -> String {
        if self.server.contains(':') {
            format!("[{}]:{}", self.server, self.port)
        } else {
            format!("{}:{}", self.server, self.port)
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_protocol_aliases() {
        assert_eq!(Protocol::from("SS"), Protocol::Shadowsocks);
        assert_eq!(Protocol::from("hy2"), Protocol::Hysteria2);
        assert_eq!(Protocol::from("vless"), Protocol::Vless);
        assert_eq!(
            Protocol::from("mieru"),
            Protocol::Other("mieru".to_string())
        );
        assert_eq!(Protocol::Trojan.to_string(), "trojan");
    }

    #[test]
    fn test_node_from_value() {
        let node = Node::from_value(json!({
            "name": "HK 01",
            "type": "trojan",
            "server": "hk.example.com",
            "port": 443,
            "sni": "cdn.example.com",
            "password": "secret",
            "network": "ws",
            "ws-opts": { "path": "/ray" }
        }))
        .unwrap();

        assert_eq!(node.protocol, Protocol::Trojan);
        assert_eq!(node.servername.as_deref(), Some("cdn.example.com"));
        assert_eq!(node.credential(), "secret");
        assert_eq!(node.extra.get("network"), Some(&json!("ws")));
        assert!(node.extra.contains_key("ws-opts"));
    }

    #[test]
    fn test_node_from_value_rejects_non_object() {
        assert!(matches!(
            Node::from_value(json!(["not", "a", "node"])),
            Err(NodeError::NotAnObject)
        ));
        assert!(Node::from_value(json!({ "server": "1.1.1.1" })).is_err());
    }

    #[test]
    fn test_credential_falls_back_to_uuid() {
        let node = Node::new("a", Protocol::Vmess, "1.2.3.4", 443)
            .with_uuid("b831381d-6324-4d53-ad4f-8cda48b30811");
        assert_eq!(node.credential(), "b831381d-6324-4d53-ad4f-8cda48b30811");

        let node = node.with_password("");
        assert_eq!(node.credential(), "b831381d-6324-4d53-ad4f-8cda48b30811");
    }

    #[test]
    fn test_identity_key_ignores_case_of_host() {
        let a = Node::new("a", Protocol::Trojan, "Example.COM", 443).with_password("pw");
        let b = Node::new("b", Protocol::from("TROJAN"), "example.com", 443).with_password("pw");
        assert_eq!(a.identity_key(), b.identity_key());

        let c = Node::new("c", Protocol::Trojan, "example.com", 443).with_password("PW");
        assert_ne!(a.identity_key(), c.identity_key());
    }

    #[test]
    fn test_node_display() {
        let node = Node::new("a", Protocol::Shadowsocks, "1.2.3.4", 8388);
        assert_eq!(node.to_string(), "ss://1.2.3.4:8388");
        let node = Node::new("b", Protocol::Socks5, "::1", 1080);
        assert_eq!(node.address(), "[::1]:1080");
    }
}
