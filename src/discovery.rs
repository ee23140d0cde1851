//! Advisory proxy detection.
//!
//! Discovery opens an HTTPS connection the way the platform would and keeps
//! the chain the platform accepted, then falls back to a plain HTTP request
//! to spot an interposed proxy. Nothing here can fail a negotiation.

use std::io::{self, BufRead, BufReader, Write};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::cert::CertificateChain;
use crate::config::NegotiatorConfig;
use crate::consent::UserConsentGateway;
use crate::proxy::{PlatformProxySettings, ProxyEndpoint};
use crate::transport::{authority, Handshaker, Route, Target};
use crate::trust::TrustPolicy;

/// `VNC-Server` header prefix that enables the alternate-path request.
pub const SERVICE_SIGNATURE: &str = "x11vnc";

const HTTPS_PROBE_PATH: &str = "/check.https.proxy.connection";
const HTTP_PROBE_PATH: &str = "/index.vnc";
const MAX_HEADER_LINES: usize = 100;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("http probe failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub proxy_detected: bool,
    /// Chain the platform's own trust evaluation accepted.
    pub browser_chain: Option<CertificateChain>,
    /// The server identified itself by [`SERVICE_SIGNATURE`].
    pub alternate_path: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlainResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl PlainResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Plain HTTP GET used by the fallback probe.
pub trait PlainHttpProbe {
    /// GET `url`, through `proxy` when given and with no proxy otherwise.
    fn get(&self, url: &str, proxy: Option<&ProxyEndpoint>) -> Result<PlainResponse, ProbeError>;
}

pub struct ReqwestProbe {
    timeout: Duration,
}

impl ReqwestProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl PlainHttpProbe for ReqwestProbe {
    fn get(&self, url: &str, proxy: Option<&ProxyEndpoint>) -> Result<PlainResponse, ProbeError> {
        let builder = reqwest::blocking::Client::builder().timeout(self.timeout);
        let builder = match proxy {
            Some(endpoint) => {
                let mut proxy = reqwest::Proxy::http(format!("http://{}", authority(&endpoint.host, endpoint.port)))?;
                if let Some(credentials) = &endpoint.credentials {
                    proxy = proxy.basic_auth(&credentials.username, &credentials.password);
                }
                builder.proxy(proxy)
            }
            None => builder.no_proxy(),
        };

        let response = builder
            .build()?
            .get(url)
            .header("Pragma", "No-Cache")
            .header("Proxy-Connection", "Keep-Alive")
            .send()?;

        Ok(PlainResponse {
            status: response.status().as_u16(),
            headers: response
                .headers()
                .iter()
                .map(|(name, value)| (name.as_str().to_string(), value.to_str().unwrap_or_default().to_string()))
                .collect(),
        })
    }
}

pub struct ProxyDiscovery<'a> {
    config: &'a NegotiatorConfig,
    platform: &'a PlatformProxySettings,
}

impl<'a> ProxyDiscovery<'a> {
    pub fn new(config: &'a NegotiatorConfig, platform: &'a PlatformProxySettings) -> Self {
        Self { config, platform }
    }

    /// Run both probes against `target`. `policy` is the policy the HTTPS
    /// probe runs under (platform anchors, or the server pin when a client
    /// key must be presented).
    pub fn probe<H: Handshaker>(
        &self,
        target: &Target,
        policy: &TrustPolicy,
        handshaker: &mut H,
        plain: &dyn PlainHttpProbe,
        gateway: &mut dyn UserConsentGateway,
    ) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        if self.config.ignore_proxy {
            debug!("proxy discovery disabled");
            return report;
        }

        let prefix = self.config.path_prefix();
        let https_target = Target::new(target.host.clone(), self.config.https_port.unwrap_or(target.port));
        let route = match &self.platform.https {
            Some(proxy) => Route::via(proxy.clone()),
            None => Route::direct(),
        };

        debug!(peer = %https_target, via = ?route.proxy.as_ref().map(|p| p.to_string()), "https probe");
        match handshaker.handshake(&https_target, &route, policy, gateway) {
            Ok(mut established) => {
                if !established.peer_chain.is_empty() {
                    report.browser_chain = Some(established.peer_chain.clone());
                }
                if route.proxy.is_some() {
                    info!("an HTTPS proxy is in use");
                    report.proxy_detected = true;
                }
                match check_request(&mut established.stream, prefix) {
                    Ok(headers) => report.alternate_path |= has_signature(&headers),
                    Err(e) => debug!(error = %e, "https probe request failed"),
                }
            }
            Err(e) => debug!(error = %e, "https probe failed"),
        }

        if report.proxy_detected {
            return report;
        }
        if report.browser_chain.is_some() && !self.config.force_proxy {
            debug!("skipping http proxy check: platform accepted the peer");
            return report;
        }

        let url = format!("http://{}{}{}", authority(&target.host, target.port), prefix, HTTP_PROBE_PATH);
        let proxy = self.platform.http.as_ref();
        debug!(url = %url, via = ?proxy.map(|p| p.to_string()), "http probe");
        match plain.get(&url, proxy) {
            Ok(response) => {
                if proxy.is_some() {
                    info!("an HTTP proxy is in use");
                    report.proxy_detected = true;
                }
                if response
                    .header("VNC-Server")
                    .map_or(false, |value| value.starts_with(SERVICE_SIGNATURE))
                {
                    report.alternate_path = true;
                }
            }
            Err(e) => debug!(error = %e, "http probe failed"),
        }

        report
    }
}

/// Send the HTTPS probe request and return the response header lines.
fn check_request<S: io::Read + Write>(stream: &mut S, prefix: &str) -> io::Result<Vec<String>> {
    let request = format!(
        "GET {}{} HTTP/1.0\r\nPragma: No-Cache\r\nProxy-Connection: Keep-Alive\r\n\r\n",
        prefix, HTTPS_PROBE_PATH
    );
    stream.write_all(request.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut headers = Vec::new();
    for _ in 0..MAX_HEADER_LINES {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        headers.push(line.to_string());
    }
    Ok(headers)
}

fn has_signature(headers: &[String]) -> bool {
    headers.iter().any(|line| {
        line.split_once(':').map_or(false, |(name, value)| {
            name.trim().eq_ignore_ascii_case("VNC-Server") && value.trim().starts_with(SERVICE_SIGNATURE)
        })
    })
}
