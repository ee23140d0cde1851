//! Proxy endpoints and the platform's proxy settings.
//!
//! Platform settings come from the usual environment variables and are
//! parsed best-effort: a scheme, userinfo and trailing path are tolerated,
//! as are `http=host:port;https=host:port` style lists.

use std::env;
use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::debug;

use crate::transport::authority;

pub const DEFAULT_PROXY_PORT: u16 = 8080;

#[derive(Clone, PartialEq, Eq)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

impl ProxyCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// `base64(user:pass)` for a `Proxy-Authorization: Basic` header.
    pub fn basic_token(&self) -> String {
        STANDARD.encode(format!("{}:{}", self.username, self.password))
    }
}

impl fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    pub credentials: Option<ProxyCredentials>,
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
        }
    }

    /// Best-effort parse of a proxy setting into an endpoint.
    pub fn parse(setting: &str) -> Option<Self> {
        let mut value = setting.trim();
        if value.is_empty() {
            return None;
        }

        // "http=a:1;https=b:2" lists: prefer the https entry.
        if value.contains('=') {
            let entries: Vec<(&str, &str)> = value
                .split(';')
                .filter_map(|entry| entry.split_once('='))
                .collect();
            value = entries
                .iter()
                .find(|(scheme, _)| scheme.trim().eq_ignore_ascii_case("https"))
                .or_else(|| entries.first())
                .map(|(_, addr)| addr.trim())?;
        }

        if let Some((_, rest)) = value.split_once("://") {
            value = rest;
        }
        let value = value.split('/').next().unwrap_or_default();

        let (userinfo, hostport) = match value.rsplit_once('@') {
            Some((userinfo, hostport)) => (Some(userinfo), hostport),
            None => (None, value),
        };

        let (host, port) = split_host_port(hostport)?;
        let credentials = userinfo.map(|info| match info.split_once(':') {
            Some((user, pass)) => ProxyCredentials::new(user, pass),
            None => ProxyCredentials::new(info, ""),
        });

        Some(Self {
            host,
            port,
            credentials,
        })
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&authority(&self.host, self.port))
    }
}

fn split_host_port(hostport: &str) -> Option<(String, u16)> {
    let hostport = hostport.trim();
    if hostport.is_empty() {
        return None;
    }

    // [v6]:port
    if let Some(rest) = hostport.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None => DEFAULT_PROXY_PORT,
        };
        return Some((host.to_string(), port));
    }

    match hostport.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Some((host.to_string(), port.parse().ok()?)),
        Some(_) => None,
        None => Some((hostport.to_string(), DEFAULT_PROXY_PORT)),
    }
}

/// Proxy settings the platform reports for HTTPS and HTTP traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformProxySettings {
    pub https: Option<ProxyEndpoint>,
    pub http: Option<ProxyEndpoint>,
}

impl PlatformProxySettings {
    pub fn from_env() -> Self {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_vars<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |names: &[&str]| {
            names
                .iter()
                .filter_map(|name| lookup(*name))
                .find_map(|value| ProxyEndpoint::parse(&value))
        };

        let all = first(&["ALL_PROXY", "all_proxy"]);
        let settings = Self {
            https: first(&["HTTPS_PROXY", "https_proxy"]).or_else(|| all.clone()),
            http: first(&["HTTP_PROXY", "http_proxy"]).or(all),
        };
        debug!(https = ?settings.https.as_ref().map(|p| p.to_string()),
               http = ?settings.http.as_ref().map(|p| p.to_string()),
               "platform proxy settings");
        settings
    }

    pub fn is_empty(&self) -> bool {
        self.https.is_none() && self.http.is_none()
    }

    /// HTTPS setting first, then HTTP.
    pub fn preferred(&self) -> Option<&ProxyEndpoint> {
        self.https.as_ref().or(self.http.as_ref())
    }
}
