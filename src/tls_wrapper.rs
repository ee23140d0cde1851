use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use lazy_static::lazy_static;
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{
    Certificate, CertificateError, ClientConfig, ClientConnection, RootCertStore, ServerName, StreamOwned,
};
use tracing::{debug, trace, warn};

use crate::cert::CertificateChain;
use crate::compare;
use crate::consent::UserConsentGateway;
use crate::error::{AttemptError, TransportError};
use crate::transport::{dial, Established, Handshaker, Route, Target};
use crate::trust::{self, ClientAuth, Rejection, TrustPolicy};
use crate::tunnel::{relay_connect, ProxyTunnel};

/// Written before a probe connection is dropped so the server side sees a
/// well-formed request instead of a bare close.
const CLEANUP_REQUEST: &[u8] = b"GET /index.vnc HTTP/1.0\r\nConnection: close\r\n\r\n";

lazy_static! {
    static ref NATIVE_ROOTS: RootCertStore = load_native_roots();
}

fn load_native_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            let ders: Vec<Vec<u8>> = certs.into_iter().map(|c| c.0).collect();
            let (added, ignored) = roots.add_parsable_certificates(&ders);
            debug!(added, ignored, "loaded platform trust anchors");
        }
        Err(e) => warn!(error = %e, "platform trust anchors unavailable"),
    }
    roots
}

/// Evaluates a pinned or trust-all policy inside the rustls handshake and
/// records why it refused, so the caller sees a [`Rejection`] rather than
/// a generic TLS alert.
struct PolicyVerifier {
    policy: TrustPolicy,
    rejection: Arc<Mutex<Option<Rejection>>>,
    debug_certs: bool,
}

impl ServerCertVerifier for PolicyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let mut presented = Vec::with_capacity(intermediates.len() + 1);
        presented.push(end_entity.clone());
        presented.extend_from_slice(intermediates);
        let chain = CertificateChain::from_rustls(&presented);

        if self.debug_certs {
            if let Some(pin) = self.policy.pin() {
                trace!(policy = self.policy.kind().label(), "pinned:\n{}", compare::describe_chain(pin));
            }
            trace!(policy = self.policy.kind().label(), "presented:\n{}", compare::describe_chain(&chain));
        }

        match trust::verify(&self.policy, &chain) {
            Ok(()) => Ok(ServerCertVerified::assertion()),
            Err(rejection) => {
                debug!(policy = self.policy.kind().label(), %rejection, "peer chain rejected");
                if let Ok(mut slot) = self.rejection.lock() {
                    *slot = Some(rejection);
                }
                Err(rustls::Error::InvalidCertificate(
                    CertificateError::ApplicationVerificationFailure,
                ))
            }
        }
    }
}

/// Client-side TLS configured for a single trust policy.
pub struct TlsWrapper {
    config: Arc<ClientConfig>,
    rejection: Arc<Mutex<Option<Rejection>>>,
}

impl TlsWrapper {
    pub fn new(policy: &TrustPolicy, client_auth: Option<&ClientAuth>, debug_certs: bool) -> Result<Self, AttemptError> {
        let rejection = Arc::new(Mutex::new(None));
        let setup = |e: rustls::Error| AttemptError::handshake(format!("client certificate rejected: {}", e));

        let config = match policy {
            TrustPolicy::Local => {
                let builder = ClientConfig::builder()
                    .with_safe_defaults()
                    .with_root_certificates(NATIVE_ROOTS.clone());
                match client_auth {
                    Some(auth) => builder
                        .with_client_auth_cert(auth.chain.to_rustls(), auth.key.clone())
                        .map_err(setup)?,
                    None => builder.with_no_client_auth(),
                }
            }
            _ => {
                let verifier = PolicyVerifier {
                    policy: policy.clone(),
                    rejection: rejection.clone(),
                    debug_certs,
                };
                let builder = ClientConfig::builder()
                    .with_safe_defaults()
                    .with_custom_certificate_verifier(Arc::new(verifier));
                match client_auth {
                    Some(auth) => builder
                        .with_client_auth_cert(auth.chain.to_rustls(), auth.key.clone())
                        .map_err(setup)?,
                    None => builder.with_no_client_auth(),
                }
            }
        };

        Ok(Self {
            config: Arc::new(config),
            rejection,
        })
    }

    /// Layer TLS over `sock` and drive the handshake to completion.
    pub fn wrap_stream(&self, mut sock: TcpStream, server_name: &str) -> Result<TlsStream, AttemptError> {
        let name = ServerName::try_from(server_name)
            .map_err(|_| AttemptError::handshake(format!("invalid server name {:?}", server_name)))?;
        let mut conn = ClientConnection::new(self.config.clone(), name)
            .map_err(|e| AttemptError::handshake(e.to_string()))?;

        while conn.is_handshaking() {
            if let Err(e) = conn.complete_io(&mut sock) {
                return Err(self.classify(e));
            }
        }
        if conn.wants_write() {
            conn.complete_io(&mut sock).map_err(|e| self.classify(e))?;
        }

        Ok(TlsStream {
            inner: StreamOwned::new(conn, sock),
        })
    }

    fn classify(&self, error: io::Error) -> AttemptError {
        let recorded = self.rejection.lock().ok().and_then(|mut slot| slot.take());
        match recorded {
            Some(rejection) => AttemptError::rejected(rejection),
            None => AttemptError::handshake(error.to_string()),
        }
    }
}

/// TLS-wrapped stream for secure communication
pub struct TlsStream {
    inner: StreamOwned<ClientConnection, TcpStream>,
}

impl TlsStream {
    pub fn peer_chain(&self) -> CertificateChain {
        self.inner
            .conn
            .peer_certificates()
            .map(CertificateChain::from_rustls)
            .unwrap_or_default()
    }

    /// Send close_notify and flush it.
    pub fn shutdown(&mut self) -> io::Result<()> {
        self.inner.conn.send_close_notify();
        self.inner.flush()
    }
}

impl Read for TlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for TlsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// [`Handshaker`] over real sockets and rustls.
pub struct NativeHandshaker {
    tunnel: ProxyTunnel,
    client_auth: Option<ClientAuth>,
    timeout: Duration,
    debug_certs: bool,
}

impl NativeHandshaker {
    pub fn new(client_auth: Option<ClientAuth>, timeout: Duration, debug_certs: bool) -> Self {
        Self {
            tunnel: ProxyTunnel::new(timeout),
            client_auth,
            timeout,
            debug_certs,
        }
    }

    fn open_route(
        &mut self,
        target: &Target,
        route: &Route,
        gateway: &mut dyn UserConsentGateway,
    ) -> Result<TcpStream, TransportError> {
        let mut sock = match &route.proxy {
            Some(proxy) => self.tunnel.open(proxy, &target.host, target.port, gateway)?,
            None => dial(&target.host, target.port, self.timeout)?,
        };
        if let Some(relay) = &route.relay_target {
            relay_connect(&mut sock, relay).map_err(|source| TransportError::Tunnel {
                target: relay.clone(),
                source,
            })?;
        }
        Ok(sock)
    }
}

impl Handshaker for NativeHandshaker {
    type Stream = TlsStream;

    fn handshake(
        &mut self,
        target: &Target,
        route: &Route,
        policy: &TrustPolicy,
        gateway: &mut dyn UserConsentGateway,
    ) -> Result<Established<TlsStream>, AttemptError> {
        let wrapper = TlsWrapper::new(policy, self.client_auth.as_ref(), self.debug_certs)?;
        let sock = self.open_route(target, route, gateway)?;
        let stream = wrapper.wrap_stream(sock, &target.host)?;
        let peer_chain = stream.peer_chain();
        debug!(peer = %target, policy = policy.kind().label(), certs = peer_chain.len(), "TLS established");
        Ok(Established { stream, peer_chain })
    }

    fn discard(&mut self, mut stream: TlsStream) {
        let _ = stream.write_all(CLEANUP_REQUEST);
        let _ = stream.flush();
        let _ = stream.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consent::testing::ScriptedGateway;
    use crate::proxy::{ProxyCredentials, ProxyEndpoint};
    use rustls::server::AllowAnyAuthenticatedClient;
    use rustls::{PrivateKey, ServerConfig, ServerConnection};
    use std::net::{Shutdown, TcpListener};
    use std::thread;

    /// Self-signed TLS server on loopback serving `connections` clients,
    /// each greeted with `hello`. The handle yields the client chain seen on
    /// each connection.
    fn tls_server(connections: usize) -> (u16, CertificateChain, thread::JoinHandle<Vec<CertificateChain>>) {
        serve_tls(connections, None)
    }

    fn serve_tls(
        connections: usize,
        client_roots: Option<RootCertStore>,
    ) -> (u16, CertificateChain, thread::JoinHandle<Vec<CertificateChain>>) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let der = cert.serialize_der().unwrap();
        let key = PrivateKey(cert.serialize_private_key_der());
        let builder = ServerConfig::builder().with_safe_defaults();
        let builder = match client_roots {
            Some(roots) => builder.with_client_cert_verifier(Arc::new(AllowAnyAuthenticatedClient::new(roots))),
            None => builder.with_no_client_auth(),
        };
        let config = Arc::new(builder.with_single_cert(vec![Certificate(der.clone())], key).unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            for _ in 0..connections {
                let (sock, _) = listener.accept().unwrap();
                let conn = ServerConnection::new(config.clone()).unwrap();
                let mut tls = StreamOwned::new(conn, sock);
                if tls.write_all(b"hello").and_then(|_| tls.flush()).is_ok() {
                    let mut buf = [0u8; 64];
                    let _ = tls.read(&mut buf);
                }
                seen.push(
                    tls.conn
                        .peer_certificates()
                        .map(CertificateChain::from_rustls)
                        .unwrap_or_default(),
                );
            }
            seen
        });
        (port, CertificateChain::new(vec![der]), handle)
    }

    /// Fake proxy answering each accepted connection with the next response.
    /// On a `200` it splices the connection to the loopback server on
    /// `upstream_port` and stops accepting. The handle yields every request.
    fn splicing_proxy(upstream_port: u16, responses: Vec<&'static str>) -> (u16, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let mut requests = Vec::new();
            for response in responses {
                let (mut client, _) = listener.accept().unwrap();
                let mut request = Vec::new();
                let mut byte = [0u8; 1];
                while !request.ends_with(b"\r\n\r\n") {
                    if client.read(&mut byte).unwrap() == 0 {
                        break;
                    }
                    request.push(byte[0]);
                }
                requests.push(String::from_utf8(request).unwrap());
                client.write_all(response.as_bytes()).unwrap();
                if response.starts_with("HTTP/1.1 200") {
                    splice(client, upstream_port);
                    break;
                }
            }
            requests
        });
        (port, handle)
    }

    fn splice(client: TcpStream, upstream_port: u16) {
        let upstream = TcpStream::connect(("127.0.0.1", upstream_port)).unwrap();
        let mut client_in = client.try_clone().unwrap();
        let mut upstream_out = upstream.try_clone().unwrap();
        let forward = thread::spawn(move || {
            let _ = io::copy(&mut client_in, &mut upstream_out);
            let _ = upstream_out.shutdown(Shutdown::Write);
        });
        let (mut upstream_in, mut client_out) = (upstream, client);
        let _ = io::copy(&mut upstream_in, &mut client_out);
        let _ = client_out.shutdown(Shutdown::Write);
        forward.join().unwrap();
    }

    fn attempt(port: u16, policy: TrustPolicy) -> Result<Established<TlsStream>, AttemptError> {
        let mut handshaker = NativeHandshaker::new(None, Duration::from_secs(6), true);
        let mut gateway = ScriptedGateway::default();
        handshaker.handshake(&Target::new("127.0.0.1", port), &Route::direct(), &policy, &mut gateway)
    }

    #[test]
    fn pinned_chain_connects_and_carries_data() {
        let (port, chain, server) = tls_server(1);
        let mut established = attempt(port, TrustPolicy::TrustOne(Some(chain.clone()))).unwrap();
        assert_eq!(established.peer_chain, chain);

        let mut greeting = [0u8; 5];
        established.stream.read_exact(&mut greeting).unwrap();
        assert_eq!(&greeting, b"hello");
        established.stream.shutdown().unwrap();
        drop(established);
        server.join().unwrap();
    }

    #[test]
    fn pinned_mismatch_reports_rejection() {
        let (port, _, server) = tls_server(1);
        let other = rcgen::generate_simple_self_signed(vec!["other".to_string()])
            .unwrap()
            .serialize_der()
            .unwrap();
        let err = attempt(port, TrustPolicy::TrustServer(Some(CertificateChain::new(vec![other])))).err().unwrap();
        assert_eq!(err.rejection(), Some(&Rejection::ElementMismatch { index: 0 }));
        server.join().unwrap();
    }

    #[test]
    fn trust_all_fetches_the_chain() {
        let (port, chain, server) = tls_server(1);
        let established = attempt(port, TrustPolicy::TrustAll).unwrap();
        assert_eq!(established.peer_chain, chain);
        drop(established);
        server.join().unwrap();
    }

    #[test]
    fn local_anchors_refuse_self_signed_peer() {
        let (port, _, server) = tls_server(1);
        let err = attempt(port, TrustPolicy::Local).err().unwrap();
        assert!(matches!(err, AttemptError::Handshake { rejection: None, .. }));
        server.join().unwrap();
    }

    #[test]
    fn unreachable_peer_is_a_transport_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = attempt(port, TrustPolicy::TrustAll).err().unwrap();
        assert!(err.is_transport());
    }

    #[test]
    fn handshake_runs_through_authenticated_proxy_tunnel() {
        let (server_port, chain, server) = tls_server(1);
        let (proxy_port, proxy) = splicing_proxy(
            server_port,
            vec![
                "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"corp\"\r\n\r\n",
                "HTTP/1.1 200 Connection established\r\n\r\n",
            ],
        );
        let mut handshaker = NativeHandshaker::new(None, Duration::from_secs(6), false);
        let mut gateway = ScriptedGateway {
            credentials: Some(ProxyCredentials::new("alice", "secret")),
            ..ScriptedGateway::default()
        };
        let route = Route::via(ProxyEndpoint::new("127.0.0.1", proxy_port));

        let mut established = handshaker
            .handshake(
                &Target::new("127.0.0.1", server_port),
                &route,
                &TrustPolicy::TrustOne(Some(chain.clone())),
                &mut gateway,
            )
            .unwrap();
        assert_eq!(established.peer_chain, chain);
        let mut greeting = [0u8; 5];
        established.stream.read_exact(&mut greeting).unwrap();
        assert_eq!(&greeting, b"hello");
        established.stream.shutdown().unwrap();
        drop(established);

        let requests = proxy.join().unwrap();
        server.join().unwrap();
        assert_eq!(gateway.credential_prompts, 1);
        assert_eq!(requests.len(), 2);
        assert!(!requests[0].contains("Proxy-Authorization"));
        assert!(requests[1].starts_with(&format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n", server_port)));
        assert!(requests[1].contains("Proxy-Authorization: Basic YWxpY2U6c2VjcmV0\r\n"));
    }

    #[test]
    fn relay_connect_precedes_the_handshake() {
        let (server_port, chain, server) = tls_server(1);
        let (relay_port, relay) = splicing_proxy(server_port, vec!["HTTP/1.1 200 OK\r\n\r\n"]);
        let mut handshaker = NativeHandshaker::new(None, Duration::from_secs(6), false);
        let mut gateway = ScriptedGateway::default();
        let route = Route::direct().with_relay(Some("inner.local:5900".to_string()));

        let established = handshaker
            .handshake(&Target::new("127.0.0.1", relay_port), &route, &TrustPolicy::TrustAll, &mut gateway)
            .unwrap();
        assert_eq!(established.peer_chain, chain);
        drop(established);

        let requests = relay.join().unwrap();
        server.join().unwrap();
        assert_eq!(
            requests,
            vec!["CONNECT inner.local:5900 HTTP/1.1\r\nHost: inner.local:5900\r\n\r\n".to_string()]
        );
    }

    #[test]
    fn client_certificate_is_presented_when_requested() {
        let mut ca_params = rcgen::CertificateParams::new(Vec::new());
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        ca_params.distinguished_name = rcgen::DistinguishedName::new();
        ca_params.distinguished_name.push(rcgen::DnType::CommonName, "Viewer CA");
        let ca = rcgen::Certificate::from_params(ca_params).unwrap();
        let ca_der = ca.serialize_der().unwrap();
        let client = rcgen::Certificate::from_params(rcgen::CertificateParams::new(vec!["viewer".to_string()])).unwrap();
        let client_der = client.serialize_der_with_signer(&ca).unwrap();

        let mut roots = RootCertStore::empty();
        roots.add(&Certificate(ca_der)).unwrap();
        let (port, chain, server) = serve_tls(1, Some(roots));

        let auth = ClientAuth {
            key: PrivateKey(client.serialize_private_key_der()),
            chain: CertificateChain::new(vec![client_der.clone()]),
        };
        let mut handshaker = NativeHandshaker::new(Some(auth), Duration::from_secs(6), false);
        let mut gateway = ScriptedGateway::default();
        let mut established = handshaker
            .handshake(
                &Target::new("127.0.0.1", port),
                &Route::direct(),
                &TrustPolicy::TrustOne(Some(chain.clone())),
                &mut gateway,
            )
            .unwrap();

        let mut greeting = [0u8; 5];
        established.stream.read_exact(&mut greeting).unwrap();
        assert_eq!(&greeting, b"hello");
        established.stream.shutdown().unwrap();
        drop(established);

        let seen = server.join().unwrap();
        assert_eq!(seen, vec![CertificateChain::new(vec![client_der])]);
    }
}
