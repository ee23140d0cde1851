//! Byte-stream establishment and the handshake seam.
//!
//! The negotiator only ever talks to a [`Handshaker`]; the rustls-backed
//! implementation lives in `tls_wrapper`.

use std::fmt;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::cert::CertificateChain;
use crate::consent::UserConsentGateway;
use crate::error::{AttemptError, TransportError};
use crate::proxy::ProxyEndpoint;
use crate::trust::TrustPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&authority(&self.host, self.port))
    }
}

/// `host:port`, bracketing IPv6 literals.
pub fn authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// How one attempt reaches its target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Route {
    /// Tunnel through this proxy with `CONNECT`.
    pub proxy: Option<ProxyEndpoint>,
    /// Second `CONNECT host:port` issued on the established stream.
    pub relay_target: Option<String>,
}

impl Route {
    pub fn direct() -> Self {
        Self::default()
    }

    pub fn via(proxy: ProxyEndpoint) -> Self {
        Self {
            proxy: Some(proxy),
            relay_target: None,
        }
    }

    pub fn with_relay(mut self, relay_target: Option<String>) -> Self {
        self.relay_target = relay_target;
        self
    }

    pub fn is_tunneled(&self) -> bool {
        self.proxy.is_some() || self.relay_target.is_some()
    }
}

/// A completed TLS handshake and the chain the peer presented.
pub struct Established<S> {
    pub stream: S,
    pub peer_chain: CertificateChain,
}

/// One TLS connection attempt under one trust policy.
///
/// `gateway` is available for proxy address and credential prompts while
/// the route is being opened.
pub trait Handshaker {
    type Stream: Read + Write;

    fn handshake(
        &mut self,
        target: &Target,
        route: &Route,
        policy: &TrustPolicy,
        gateway: &mut dyn UserConsentGateway,
    ) -> Result<Established<Self::Stream>, AttemptError>;

    /// Best-effort cleanup on a stream that is about to be dropped.
    fn discard(&mut self, stream: Self::Stream) {
        drop(stream);
    }
}

/// Open a TCP connection to `host:port`, trying each resolved address with
/// `timeout` applied to establishment only.
pub fn dial(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, TransportError> {
    let target = format!("{}:{}", host, port);
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| TransportError::Resolve {
            target: target.clone(),
            source,
        })?
        .collect();

    let mut last_error = None;
    for addr in &addrs {
        match connect_addr(addr, timeout) {
            Ok(stream) => {
                debug!(peer = %target, addr = %addr, "tcp connected");
                return Ok(stream);
            }
            Err(e) => {
                debug!(peer = %target, addr = %addr, error = %e, "tcp connect failed");
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(source) => Err(TransportError::Connect { target, source }),
        None => Err(TransportError::NoAddress { target }),
    }
}

fn connect_addr(addr: &SocketAddr, timeout: Duration) -> std::io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.connect_timeout(&(*addr).into(), timeout)?;
    socket.set_nodelay(true)?;
    Ok(TcpStream::from(socket))
}
