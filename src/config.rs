use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::proxy::{ProxyCredentials, ProxyEndpoint, DEFAULT_PROXY_PORT};

/// Negotiator configuration. Every field has a default, so a partial
/// document deserializes.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiatorConfig {
    /// Hex-encoded pinned server chain. Any mismatch against it is fatal.
    pub server_cert: Option<String>,
    /// Hex `key,cert(s)` for client authentication, or `PROMPT`.
    pub client_key: Option<String>,
    /// Skip every trust check and the consent step.
    pub trust_all: bool,
    /// Accept a peer matching the browser-trusted chain without asking.
    pub trust_url_cert: bool,
    /// Ask before accepting a peer that platform anchors already verified.
    pub confirm_auto_trust: bool,
    pub ignore_proxy: bool,
    pub force_proxy: bool,
    /// Port for the HTTPS discovery probe only.
    pub https_port: Option<u16>,
    pub url_prefix: String,
    /// `host:port` for a second CONNECT issued on the established stream.
    pub relay_target: Option<String>,
    pub proxy: Option<ProxyOverride>,
    /// Force the alternate-path request after the handshake.
    pub alternate_get: bool,
    pub debug_certs: bool,
    pub connect_timeout_secs: u64,
    pub probe_timeout_secs: u64,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            server_cert: None,
            client_key: None,
            trust_all: false,
            trust_url_cert: false,
            confirm_auto_trust: false,
            ignore_proxy: false,
            force_proxy: false,
            https_port: None,
            url_prefix: String::new(),
            relay_target: None,
            proxy: None,
            alternate_get: false,
            debug_certs: false,
            connect_timeout_secs: 6,
            probe_timeout_secs: 10,
        }
    }
}

impl NegotiatorConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// URL prefix without a trailing slash, so paths can be appended.
    pub fn path_prefix(&self) -> &str {
        self.url_prefix.trim_end_matches('/')
    }
}

const REDACTED: &str = "<redacted>";

fn redacted(secret: &Option<String>) -> Option<&'static str> {
    secret.as_ref().map(|_| REDACTED)
}

impl fmt::Debug for NegotiatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiatorConfig")
            .field("server_cert", &self.server_cert)
            .field("client_key", &redacted(&self.client_key))
            .field("trust_all", &self.trust_all)
            .field("trust_url_cert", &self.trust_url_cert)
            .field("confirm_auto_trust", &self.confirm_auto_trust)
            .field("ignore_proxy", &self.ignore_proxy)
            .field("force_proxy", &self.force_proxy)
            .field("https_port", &self.https_port)
            .field("url_prefix", &self.url_prefix)
            .field("relay_target", &self.relay_target)
            .field("proxy", &self.proxy)
            .field("alternate_get", &self.alternate_get)
            .field("debug_certs", &self.debug_certs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("probe_timeout_secs", &self.probe_timeout_secs)
            .finish()
    }
}

/// Explicitly configured proxy, taking precedence over platform settings.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ProxyOverride {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for ProxyOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyOverride")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &redacted(&self.password))
            .finish()
    }
}

impl ProxyOverride {
    pub fn endpoint(&self) -> ProxyEndpoint {
        let credentials = match (&self.username, &self.password) {
            (Some(username), password) => Some(ProxyCredentials::new(
                username.clone(),
                password.clone().unwrap_or_default(),
            )),
            (None, _) => None,
        };
        ProxyEndpoint {
            host: self.host.clone(),
            port: self.port.unwrap_or(DEFAULT_PROXY_PORT),
            credentials,
        }
    }
}
