//! HTTP `CONNECT` tunneling through a proxy.
//!
//! The response is read one byte at a time so nothing past the header
//! block is consumed before TLS takes over the socket.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::consent::UserConsentGateway;
use crate::error::TransportError;
use crate::proxy::{ProxyCredentials, ProxyEndpoint};
use crate::transport::{authority, dial};

/// CONNECT attempts per tunnel: the first plus one retry.
const CONNECT_ATTEMPTS: usize = 2;
const MAX_LINE_BYTES: usize = 8192;
const MAX_HEADER_LINES: usize = 100;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("proxy closed the connection before answering")]
    UnexpectedEof,
    #[error("malformed proxy status line: {0:?}")]
    MalformedStatus(String),
    #[error("proxy requires authentication")]
    AuthenticationRequired { realm: Option<String> },
    #[error("proxy refused CONNECT: {line}")]
    Refused { status: u16, line: String },
    #[error("proxy response line longer than {0} bytes")]
    LineTooLong(usize),
    #[error("proxy response has more than {0} header lines")]
    TooManyHeaders(usize),
}

/// Parsed response to one `CONNECT`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ConnectResponse {
    status: u16,
    status_line: String,
    realm: Option<String>,
}

impl ConnectResponse {
    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Opens `CONNECT` tunnels and remembers credentials that worked.
#[derive(Debug)]
pub struct ProxyTunnel {
    timeout: Duration,
    cached: Option<ProxyCredentials>,
}

impl ProxyTunnel {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cached: None,
        }
    }

    pub fn cached_credentials(&self) -> Option<&ProxyCredentials> {
        self.cached.as_ref()
    }

    /// Tunnel to `target_host:target_port` through `proxy`.
    ///
    /// A `407` prompts for credentials and retries once on a fresh
    /// connection; any other non-2xx status is retried once as is.
    pub fn open(
        &mut self,
        proxy: &ProxyEndpoint,
        target_host: &str,
        target_port: u16,
        gateway: &mut dyn UserConsentGateway,
    ) -> Result<TcpStream, TransportError> {
        let target = authority(target_host, target_port);
        let wrap = |source: TunnelError| TransportError::Tunnel {
            target: target.clone(),
            source,
        };

        let mut credentials = proxy.credentials.clone().or_else(|| self.cached.clone());
        let mut prompted = false;
        let mut last_error = TunnelError::UnexpectedEof;

        for attempt in 0..CONNECT_ATTEMPTS {
            let mut stream = dial(&proxy.host, proxy.port, self.timeout)?;
            debug!(proxy = %proxy, peer = %target, attempt, auth = credentials.is_some(), "sending CONNECT");

            let response = request_connect(&mut stream, &target, credentials.as_ref()).map_err(&wrap)?;
            if response.is_success() {
                info!(proxy = %proxy, peer = %target, "proxy tunnel established");
                if prompted {
                    self.cached = credentials;
                }
                return Ok(stream);
            }

            warn!(proxy = %proxy, status = response.status, line = %response.status_line, "CONNECT refused");
            if response.status == 407 {
                last_error = TunnelError::AuthenticationRequired {
                    realm: response.realm.clone(),
                };
                if attempt + 1 < CONNECT_ATTEMPTS {
                    credentials = gateway.proxy_credentials(proxy, response.realm.as_deref());
                    if credentials.is_none() {
                        return Err(wrap(last_error));
                    }
                    prompted = true;
                }
            } else {
                last_error = TunnelError::Refused {
                    status: response.status,
                    line: response.status_line,
                };
            }
        }

        Err(wrap(last_error))
    }
}

/// Issue one `CONNECT target` on an already established stream.
pub fn relay_connect<S: Read + Write>(stream: &mut S, target: &str) -> Result<(), TunnelError> {
    debug!(relay = %target, "sending relay CONNECT");
    let response = request_connect(stream, target, None)?;
    if response.is_success() {
        Ok(())
    } else {
        Err(TunnelError::Refused {
            status: response.status,
            line: response.status_line,
        })
    }
}

fn request_connect<S: Read + Write>(
    stream: &mut S,
    target: &str,
    credentials: Option<&ProxyCredentials>,
) -> Result<ConnectResponse, TunnelError> {
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(credentials) = credentials {
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", credentials.basic_token()));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes())?;
    stream.flush()?;

    let status_line = read_line(stream)?;
    let status = parse_status(&status_line)?;

    let mut realm = None;
    let mut header_lines = 0;
    loop {
        let line = match read_line(stream) {
            Ok(line) => line,
            // Error responses may close right after the status line.
            Err(TunnelError::UnexpectedEof) if !(200..300).contains(&status) => break,
            Err(e) => return Err(e),
        };
        if line.is_empty() {
            break;
        }
        header_lines += 1;
        if header_lines > MAX_HEADER_LINES {
            return Err(TunnelError::TooManyHeaders(MAX_HEADER_LINES));
        }
        if realm.is_none() {
            realm = scrape_realm(&line);
        }
    }

    Ok(ConnectResponse {
        status,
        status_line,
        realm,
    })
}

/// Read one CRLF- or LF-terminated line without its terminator.
fn read_line<R: Read>(reader: &mut R) -> Result<String, TunnelError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if reader.read(&mut byte)? == 0 {
            return Err(TunnelError::UnexpectedEof);
        }
        match byte[0] {
            b'\n' => break,
            b'\r' => {}
            b => line.push(b),
        }
        if line.len() > MAX_LINE_BYTES {
            return Err(TunnelError::LineTooLong(MAX_LINE_BYTES));
        }
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

/// `HTTP/1.x <code> ...` to `<code>`.
fn parse_status(line: &str) -> Result<u16, TunnelError> {
    let mut parts = line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(TunnelError::MalformedStatus(line.to_string()));
    }
    parts
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| TunnelError::MalformedStatus(line.to_string()))
}

fn scrape_realm(header: &str) -> Option<String> {
    let (name, value) = header.split_once(':')?;
    if !name.trim().eq_ignore_ascii_case("proxy-authenticate") {
        return None;
    }
    let lower = value.to_ascii_lowercase();
    let start = lower.find("realm=")? + "realm=".len();
    let realm = value[start..]
        .trim_start_matches('"')
        .split(|c: char| c == '"' || c == ',')
        .next()?
        .trim();
    (!realm.is_empty()).then(|| realm.to_string())
}
