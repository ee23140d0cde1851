//! The connection state machine.
//!
//! `connect()` walks Discover, AttemptPrimary, AttemptProbe, UserDecision
//! and AttemptFinal. Every step passes its findings forward in a
//! [`NegotiationContext`]; nothing from one call leaks into the next except
//! proxy credentials cached by the tunnel.

use std::io::Write;

use tracing::{debug, info, warn};

use crate::cert::CertificateChain;
use crate::compare;
use crate::config::NegotiatorConfig;
use crate::consent::{AutoTrustDecision, CertificateReview, UserConsentGateway};
use crate::discovery::{DiscoveryReport, PlainHttpProbe, ProxyDiscovery, ReqwestProbe};
use crate::error::{AttemptError, NegotiationError, TransportError};
use crate::proxy::{PlatformProxySettings, ProxyEndpoint};
use crate::tls_wrapper::NativeHandshaker;
use crate::transport::{Established, Handshaker, Route, Target};
use crate::trust::{MismatchReason, PolicyKind, TrustPolicy, TrustPolicyStore};

const ALTERNATE_PATH: &str = "/request.https.vnc.connection";

/// An established, trusted TLS connection.
pub struct SecureConnection<S> {
    pub stream: S,
    pub peer_chain: CertificateChain,
    /// Policy the final handshake ran under.
    pub policy: PolicyKind,
    pub via_proxy: bool,
}

pub type ConnectionOutcome<S> = Result<SecureConnection<S>, NegotiationError>;

/// Per-call state threaded between the steps of one `connect()`.
#[derive(Debug)]
struct NegotiationContext {
    target: Target,
    report: DiscoveryReport,
    reason: Option<MismatchReason>,
    use_tunnel: bool,
    proxy: Option<ProxyEndpoint>,
    user_wants_to_see_cert: bool,
    tunneled: bool,
}

impl NegotiationContext {
    /// First reason wins.
    fn record(&mut self, reason: MismatchReason) {
        if self.reason.is_none() {
            debug!(reason = %reason, "recorded mismatch reason");
            self.reason = Some(reason);
        }
    }

    fn peer(&self) -> String {
        self.target.to_string()
    }
}

/// Outcome of the primary attempt when it did not produce a connection.
enum PrimaryFailure {
    Fatal(NegotiationError),
    FallBack,
}

pub struct Negotiator<H, G> {
    config: NegotiatorConfig,
    store: TrustPolicyStore,
    platform: PlatformProxySettings,
    handshaker: H,
    gateway: G,
    plain_probe: Box<dyn PlainHttpProbe + Send>,
    /// Last proxy address the user typed in; offered as the default next time.
    remembered_proxy: Option<ProxyEndpoint>,
}

impl<G: UserConsentGateway> Negotiator<NativeHandshaker, G> {
    /// Negotiator over real sockets, reading platform proxy settings from
    /// the environment.
    pub fn native(config: NegotiatorConfig, mut gateway: G) -> Self {
        let store = TrustPolicyStore::from_config(&config, &mut gateway);
        let handshaker = NativeHandshaker::new(
            store.client_auth().cloned(),
            config.connect_timeout(),
            config.debug_certs,
        );
        let mut negotiator = Self::with_store(config, store, handshaker, gateway);
        negotiator.platform = PlatformProxySettings::from_env();
        negotiator
    }
}

impl<H: Handshaker, G: UserConsentGateway> Negotiator<H, G> {
    /// Negotiator over any handshaker. No platform proxy settings are
    /// assumed; see [`Negotiator::with_platform_proxy`].
    pub fn new(config: NegotiatorConfig, handshaker: H, mut gateway: G) -> Self {
        let store = TrustPolicyStore::from_config(&config, &mut gateway);
        Self::with_store(config, store, handshaker, gateway)
    }

    fn with_store(config: NegotiatorConfig, store: TrustPolicyStore, handshaker: H, gateway: G) -> Self {
        let plain_probe = Box::new(ReqwestProbe::new(config.probe_timeout()));
        Self {
            config,
            store,
            platform: PlatformProxySettings::default(),
            handshaker,
            gateway,
            plain_probe,
            remembered_proxy: None,
        }
    }

    pub fn with_platform_proxy(mut self, platform: PlatformProxySettings) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_plain_probe(mut self, probe: Box<dyn PlainHttpProbe + Send>) -> Self {
        self.plain_probe = probe;
        self
    }

    pub fn config(&self) -> &NegotiatorConfig {
        &self.config
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn handshaker(&self) -> &H {
        &self.handshaker
    }

    /// Negotiate a trusted TLS connection to `host:port`.
    pub fn connect(&mut self, host: &str, port: u16) -> ConnectionOutcome<H::Stream> {
        let target = Target::new(host, port);
        if host.trim().is_empty() {
            return Err(NegotiationError::Setup {
                target: target.to_string(),
                message: "empty host name".to_string(),
            });
        }
        info!(peer = %target, "negotiating TLS connection");

        let report = self.discover(&target);
        let use_tunnel = self.config.relay_target.is_some()
            || self.config.proxy.is_some()
            || self.config.force_proxy;
        let mut ctx = NegotiationContext {
            target,
            report,
            reason: None,
            use_tunnel,
            proxy: None,
            user_wants_to_see_cert: false,
            tunneled: false,
        };

        let primary = self
            .store
            .initial_policy(self.config.trust_all, ctx.report.browser_chain.as_ref());
        match self.attempt_primary(&mut ctx, &primary) {
            Ok(established) => return self.finish(&ctx, established, primary.kind()),
            Err(PrimaryFailure::Fatal(e)) => return Err(e),
            Err(PrimaryFailure::FallBack) => {}
        }

        let probe_chain = self.attempt_probe(&mut ctx)?;
        self.user_decision(&mut ctx, &probe_chain)?;
        self.attempt_final(&mut ctx, &probe_chain)
    }

    fn discover(&mut self, target: &Target) -> DiscoveryReport {
        let policy = self.store.probe_policy();
        let report = ProxyDiscovery::new(&self.config, &self.platform).probe(
            target,
            &policy,
            &mut self.handshaker,
            self.plain_probe.as_ref(),
            &mut self.gateway,
        );
        if let Some(chain) = &report.browser_chain {
            self.store.trace_chain("browser-trusted chain", chain);
        }
        debug!(
            proxy = report.proxy_detected,
            browser_chain = report.browser_chain.is_some(),
            alternate_path = report.alternate_path,
            "discovery finished"
        );
        report
    }

    fn attempt_primary(
        &mut self,
        ctx: &mut NegotiationContext,
        policy: &TrustPolicy,
    ) -> Result<Established<H::Stream>, PrimaryFailure> {
        let hard = self.store.has_server_pin();
        debug!(policy = policy.kind().label(), hard, "primary attempt");

        match self.attempt(ctx, policy) {
            Ok(established) => {
                if policy.kind() != PolicyKind::TrustAll && established.peer_chain.is_empty() {
                    warn!(peer = %ctx.target, "peer presented no certificates");
                    self.handshaker.discard(established.stream);
                    ctx.record(MismatchReason::MissingCerts);
                } else if self.wants_confirmation(policy) {
                    let subject = established
                        .peer_chain
                        .leaf()
                        .and_then(|leaf| compare::extract_field(leaf, "CN"));
                    let decision =
                        self.gateway
                            .confirm_verified_peer(&ctx.target.host, ctx.target.port, subject.as_deref());
                    match decision {
                        AutoTrustDecision::Connect => return Ok(established),
                        AutoTrustDecision::ShowCertificate => {
                            debug!("user wants to see the certificate");
                            ctx.user_wants_to_see_cert = true;
                            ctx.record(MismatchReason::UserView);
                            self.handshaker.discard(established.stream);
                        }
                    }
                } else {
                    info!(peer = %ctx.target, policy = policy.kind().label(), "server verified on first try");
                    return Ok(established);
                }
            }
            Err(e) if e.is_transport() => {
                return Err(PrimaryFailure::Fatal(NegotiationError::from_attempt(&ctx.peer(), e)));
            }
            Err(e) => {
                debug!(error = %e, "could not automatically verify server");
                if let Some(reason) = e.rejection().and_then(|r| policy.mismatch_reason(r)) {
                    ctx.record(reason);
                }
            }
        }

        if hard {
            let reason = ctx.reason.unwrap_or(MismatchReason::ServerCertMismatch);
            warn!(peer = %ctx.target, reason = %reason, "pinned server certificate mismatch");
            return Err(PrimaryFailure::Fatal(NegotiationError::FatalPinMismatch {
                target: ctx.peer(),
                reason,
            }));
        }
        Err(PrimaryFailure::FallBack)
    }

    /// Ask before trusting a peer the platform verified on its own.
    fn wants_confirmation(&self, policy: &TrustPolicy) -> bool {
        self.config.confirm_auto_trust
            && !self.config.trust_all
            && !self.config.trust_url_cert
            && !self.store.has_server_pin()
            && matches!(policy.kind(), PolicyKind::Local | PolicyKind::TrustUrl)
    }

    /// Reconnect trusting anything, only to learn the peer's chain.
    fn attempt_probe(&mut self, ctx: &mut NegotiationContext) -> Result<CertificateChain, NegotiationError> {
        if ctx.report.browser_chain.is_none() {
            ctx.record(MismatchReason::MissingCerts);
        }

        let policy = self.store.trust_all();
        let established = self
            .attempt(ctx, &policy)
            .map_err(|e| NegotiationError::from_attempt(&ctx.peer(), e))?;
        let chain = established.peer_chain.clone();
        self.handshaker.discard(established.stream);
        self.store.trace_chain("trust-all probe chain", &chain);

        if chain.is_empty() {
            return Err(NegotiationError::TrustRejected {
                target: ctx.peer(),
                reason: MismatchReason::MissingCerts,
                message: "peer presented no certificates".to_string(),
            });
        }
        Ok(chain)
    }

    fn user_decision(&mut self, ctx: &mut NegotiationContext, probe_chain: &CertificateChain) -> Result<(), NegotiationError> {
        if self.config.trust_all {
            debug!("trust-all override: skipping user decision");
            return Ok(());
        }
        if self.browser_chain_matches(ctx, probe_chain) {
            info!(peer = %ctx.target, "peer matches previously accepted certificate");
            return Ok(());
        }

        let review = CertificateReview {
            host: ctx.target.host.clone(),
            port: ctx.target.port,
            chain: probe_chain.clone(),
            reason: ctx.reason,
        };
        if self.gateway.review_certificate(&review) {
            info!(peer = %ctx.target, "user accepted certificate");
            Ok(())
        } else {
            info!(peer = %ctx.target, "user decided against it");
            Err(NegotiationError::UserRejected { target: ctx.peer() })
        }
    }

    fn browser_chain_matches(&self, ctx: &mut NegotiationContext, probe_chain: &CertificateChain) -> bool {
        if ctx.user_wants_to_see_cert {
            return false;
        }
        match &ctx.report.browser_chain {
            Some(browser) if compare::chains_equal(browser, probe_chain) => {
                ctx.record(MismatchReason::DidNotFail);
                true
            }
            Some(browser) => {
                debug!(index = ?compare::first_difference(browser, probe_chain), "browser chain differs from peer");
                ctx.record(MismatchReason::CertMismatch);
                false
            }
            None => {
                ctx.record(MismatchReason::MissingCerts);
                false
            }
        }
    }

    /// Connect a third time, accepting only the chain seen by the probe.
    fn attempt_final(&mut self, ctx: &mut NegotiationContext, probe_chain: &CertificateChain) -> ConnectionOutcome<H::Stream> {
        let policy = self.store.trust_one(probe_chain);
        match self.attempt(ctx, &policy) {
            Ok(established) => {
                info!(peer = %ctx.target, "server verified against the accepted certificate");
                self.finish(ctx, established, PolicyKind::TrustOne)
            }
            Err(e) => {
                warn!(peer = %ctx.target, error = %e, "could not verify server on final attempt");
                match e {
                    AttemptError::Handshake {
                        message,
                        rejection: Some(_),
                    } => Err(NegotiationError::TrustRejected {
                        target: ctx.peer(),
                        reason: MismatchReason::CertMismatch,
                        message,
                    }),
                    other => Err(NegotiationError::from_attempt(&ctx.peer(), other)),
                }
            }
        }
    }

    /// One handshake under `policy`. A transport failure on the direct path
    /// switches this and every later attempt to the proxy tunnel when a
    /// proxy was detected.
    fn attempt(&mut self, ctx: &mut NegotiationContext, policy: &TrustPolicy) -> Result<Established<H::Stream>, AttemptError> {
        let route = self.route(ctx)?;
        ctx.tunneled = route.is_tunneled();
        match self.handshaker.handshake(&ctx.target, &route, policy, &mut self.gateway) {
            Err(e) if e.is_transport() && !ctx.use_tunnel && ctx.report.proxy_detected => {
                info!(peer = %ctx.target, error = %e, "direct connection failed, trying the proxy");
                ctx.use_tunnel = true;
                let route = self.route(ctx)?;
                ctx.tunneled = route.is_tunneled();
                self.handshaker.handshake(&ctx.target, &route, policy, &mut self.gateway)
            }
            other => other,
        }
    }

    fn route(&mut self, ctx: &mut NegotiationContext) -> Result<Route, TransportError> {
        if !ctx.use_tunnel {
            return Ok(Route::direct());
        }
        let proxy = if ctx.report.proxy_detected || self.config.proxy.is_some() || self.config.force_proxy {
            Some(self.resolve_proxy(ctx)?)
        } else {
            None
        };
        let route = match proxy {
            Some(proxy) => Route::via(proxy),
            None => Route::direct(),
        };
        Ok(route.with_relay(self.config.relay_target.clone()))
    }

    /// Explicit configuration, then platform HTTPS and HTTP settings, then
    /// the user, pre-filled with what they answered last time. Cached for
    /// the rest of the call.
    fn resolve_proxy(&mut self, ctx: &mut NegotiationContext) -> Result<ProxyEndpoint, TransportError> {
        if let Some(proxy) = &ctx.proxy {
            return Ok(proxy.clone());
        }

        let configured = self
            .config
            .proxy
            .as_ref()
            .map(|proxy| proxy.endpoint())
            .or_else(|| self.platform.preferred().cloned());
        let proxy = match configured {
            Some(proxy) => proxy,
            None => {
                let answer = self
                    .gateway
                    .proxy_address(self.remembered_proxy.as_ref())
                    .ok_or_else(|| TransportError::NoProxy { target: ctx.peer() })?;
                self.remembered_proxy = Some(answer.clone());
                answer
            }
        };

        debug!(proxy = %proxy, "using proxy");
        ctx.proxy = Some(proxy.clone());
        Ok(proxy)
    }

    fn finish(
        &mut self,
        ctx: &NegotiationContext,
        mut established: Established<H::Stream>,
        policy: PolicyKind,
    ) -> ConnectionOutcome<H::Stream> {
        if self.config.alternate_get || ctx.report.alternate_path {
            let request = format!(
                "GET {}{} HTTP/1.0\r\nPragma: No-Cache\r\n\r\n",
                self.config.path_prefix(),
                ALTERNATE_PATH
            );
            debug!(request = %request.trim_end(), "sending alternate-path request");
            established
                .stream
                .write_all(request.as_bytes())
                .and_then(|_| established.stream.flush())
                .map_err(|e| NegotiationError::Transport {
                    target: ctx.peer(),
                    source: TransportError::Io(e),
                })?;
        }

        Ok(SecureConnection {
            stream: established.stream,
            peer_chain: established.peer_chain,
            policy,
            via_proxy: ctx.tunneled,
        })
    }
}
