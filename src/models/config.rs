//! Proxy configuration and server mode.

use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 9000;
pub const DEFAULT_TARGET_URL: &str = "http://localhost:8080";
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

/// Proxy listener configuration.
///
/// The listening protocol is not configured directly: it mirrors the scheme
/// of `target_url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Port to listen on
    pub port: u16,
    /// Absolute http(s) URL every request is forwarded to
    pub target_url: String,
    /// Whether the system/env proxy is used when no proxy rule decides otherwise
    #[serde(default = "default_true")]
    pub system_proxy_enabled: bool,
    /// Bind address for the listener
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    DEFAULT_BIND_ADDRESS.to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            target_url: DEFAULT_TARGET_URL.to_string(),
            system_proxy_enabled: true,
            bind_address: default_bind_address(),
        }
    }
}

impl ProxyConfig {
    /// Parse a config from its JSON representation.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Whether the target (and therefore the listener) speaks HTTPS.
    pub fn is_https_target(&self) -> bool {
        self.target_url.trim().to_ascii_lowercase().starts_with("https")
    }

    pub fn expected_protocol(&self) -> ListenerProtocol {
        if self.is_https_target() {
            ListenerProtocol::Https
        } else {
            ListenerProtocol::Http
        }
    }

    /// Merge a partial update into this config.
    pub fn apply(&mut self, update: ProxyConfigUpdate) {
        if let Some(port) = update.port {
            self.port = port;
        }
        if let Some(target_url) = update.target_url {
            self.target_url = target_url;
        }
        if let Some(enabled) = update.system_proxy_enabled {
            self.system_proxy_enabled = enabled;
        }
        if let Some(bind_address) = update.bind_address {
            self.bind_address = bind_address;
        }
    }
}

/// Partial config used by `update_config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfigUpdate {
    pub port: Option<u16>,
    pub target_url: Option<String>,
    pub system_proxy_enabled: Option<bool>,
    pub bind_address: Option<String>,
}

impl ProxyConfigUpdate {
    pub fn port(port: u16) -> Self {
        Self {
            port: Some(port),
            ..Self::default()
        }
    }

    pub fn target_url(url: impl Into<String>) -> Self {
        Self {
            target_url: Some(url.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ListenerProtocol {
    Http,
    Https,
}

/// Outcome of listener startup.
///
/// `HttpFallback` is the degraded state entered when an HTTPS target was
/// requested but no certificate could be loaded: the listener speaks plain
/// HTTP and TLS clients will fail against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ListenerState {
    Stopped,
    Http,
    Https,
    HttpFallback,
}

impl ListenerState {
    pub fn protocol(&self) -> Option<ListenerProtocol> {
        match self {
            ListenerState::Stopped => None,
            ListenerState::Http | ListenerState::HttpFallback => Some(ListenerProtocol::Http),
            ListenerState::Https => Some(ListenerProtocol::Https),
        }
    }
}

/// Config as reported by `get_config`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    #[serde(flatten)]
    pub config: ProxyConfig,
    /// Protocol the listener actually speaks, `None` while stopped
    pub actual_protocol: Option<ListenerProtocol>,
    /// Protocol implied by the target URL
    pub expected_protocol: ListenerProtocol,
}

/// Server behaviour per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    Off,
    Mock,
    #[default]
    Proxy,
    Both,
}

impl ServerMode {
    /// Mock rules are consulted in `mock` and `both` modes.
    pub fn mocks_enabled(self) -> bool {
        matches!(self, ServerMode::Mock | ServerMode::Both)
    }

    /// Breakpoints only fire in `proxy` and `both` modes.
    pub fn breakpoints_enabled(self) -> bool {
        matches!(self, ServerMode::Proxy | ServerMode::Both)
    }
}

impl std::str::FromStr for ServerMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(ServerMode::Off),
            "mock" => Ok(ServerMode::Mock),
            "proxy" => Ok(ServerMode::Proxy),
            "both" => Ok(ServerMode::Both),
            other => Err(anyhow::anyhow!("unknown server mode '{}'", other)),
        }
    }
}
