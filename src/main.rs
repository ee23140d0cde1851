use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use vnc_tls_negotiator::compare;
use vnc_tls_negotiator::logging::{self, LogLevel};
use vnc_tls_negotiator::{
    AutoTrustDecision, CertificateReview, Negotiator, NegotiatorConfig, ProxyCredentials, ProxyEndpoint,
    ProxyOverride, UserConsentGateway,
};

#[derive(Parser)]
#[command(
    name = "vnc-tls-connect",
    version,
    about = "Negotiate a trusted TLS connection to a VNC server"
)]
struct Cli {
    /// VNC server host
    host: String,
    /// VNC server port
    port: u16,
    /// Hex-encoded server certificate chain to pin
    #[arg(long)]
    server_cert: Option<String>,
    /// Hex `key,cert(s)` for client authentication, or PROMPT
    #[arg(long)]
    client_key: Option<String>,
    /// Accept any server certificate without asking
    #[arg(long)]
    trust_all: bool,
    /// Accept certificates the platform already trusts without asking
    #[arg(long)]
    trust_url_cert: bool,
    /// Ask before accepting a platform-verified server
    #[arg(long)]
    confirm_auto_trust: bool,
    /// Skip proxy discovery
    #[arg(long)]
    ignore_proxy: bool,
    /// Always tunnel through a proxy
    #[arg(long)]
    force_proxy: bool,
    /// Port for the HTTPS discovery probe
    #[arg(long)]
    https_port: Option<u16>,
    /// Path prefix for probe and alternate-path requests
    #[arg(long, default_value = "")]
    url_prefix: String,
    /// host:port to CONNECT to after reaching the server
    #[arg(long)]
    relay: Option<String>,
    /// Proxy as [user[:pass]@]host[:port]
    #[arg(long)]
    proxy: Option<String>,
    /// Send the alternate-path request after the handshake
    #[arg(long)]
    alternate_get: bool,
    /// Dump certificates at trace level
    #[arg(long)]
    debug_certs: bool,
    /// TCP connect timeout in seconds
    #[arg(long, default_value_t = 6)]
    connect_timeout: u64,
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn config(&self) -> NegotiatorConfig {
        let proxy = self.proxy.as_deref().and_then(ProxyEndpoint::parse).map(|endpoint| {
            let (username, password) = match endpoint.credentials {
                Some(creds) => (Some(creds.username), Some(creds.password)),
                None => (None, None),
            };
            ProxyOverride {
                host: endpoint.host,
                port: Some(endpoint.port),
                username,
                password,
            }
        });

        NegotiatorConfig {
            server_cert: self.server_cert.clone(),
            client_key: self.client_key.clone(),
            trust_all: self.trust_all,
            trust_url_cert: self.trust_url_cert,
            confirm_auto_trust: self.confirm_auto_trust,
            ignore_proxy: self.ignore_proxy,
            force_proxy: self.force_proxy,
            https_port: self.https_port,
            url_prefix: self.url_prefix.clone(),
            relay_target: self.relay.clone(),
            proxy,
            alternate_get: self.alternate_get,
            debug_certs: self.debug_certs,
            connect_timeout_secs: self.connect_timeout,
            ..NegotiatorConfig::default()
        }
    }
}

/// Consent prompts on stderr, answers from stdin.
struct TerminalGateway;

impl TerminalGateway {
    fn ask(&self, question: &str) -> Option<String> {
        eprint!("{}", question);
        io::stderr().flush().ok()?;
        let mut line = String::new();
        let read = io::stdin().lock().read_line(&mut line).ok()?;
        if read == 0 {
            return None;
        }
        let answer = line.trim().to_string();
        (!answer.is_empty()).then_some(answer)
    }
}

impl UserConsentGateway for TerminalGateway {
    fn review_certificate(&mut self, review: &CertificateReview) -> bool {
        eprintln!("\n{}\n{}", review.title(), review.render());
        loop {
            match self.ask("Accept this certificate for this session? [y/N/v=view] ").as_deref() {
                Some("y") | Some("Y") | Some("yes") => return true,
                Some("v") | Some("V") => eprintln!("\n{}", review.details()),
                _ => return false,
            }
        }
    }

    fn confirm_verified_peer(&mut self, host: &str, port: u16, subject: Option<&str>) -> AutoTrustDecision {
        eprintln!(
            "\nThe platform trust store verified {}:{} ({}).",
            host,
            port,
            subject.unwrap_or("unknown subject")
        );
        match self.ask("Connect? [Y/v=view certificate first] ").as_deref() {
            Some("v") | Some("V") => AutoTrustDecision::ShowCertificate,
            _ => AutoTrustDecision::Connect,
        }
    }

    fn proxy_address(&mut self, guess: Option<&ProxyEndpoint>) -> Option<ProxyEndpoint> {
        let prompt = match guess {
            Some(guess) => format!("Proxy host:port [{}]: ", guess),
            None => "Proxy host:port: ".to_string(),
        };
        match self.ask(&prompt) {
            Some(answer) => ProxyEndpoint::parse(&answer),
            None => guess.cloned(),
        }
    }

    fn proxy_credentials(&mut self, proxy: &ProxyEndpoint, realm: Option<&str>) -> Option<ProxyCredentials> {
        eprintln!(
            "\nProxy {} requires authentication{}.",
            proxy,
            realm.map(|r| format!(" (realm {})", r)).unwrap_or_default()
        );
        let username = self.ask("Username: ")?;
        let password = self.ask("Password: ").unwrap_or_default();
        Some(ProxyCredentials::new(username, password))
    }

    fn client_key_material(&mut self) -> Option<String> {
        self.ask("Client key and certificate (hex `key,cert`): ")
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(LogLevel::from_verbosity(cli.verbose));

    let mut negotiator = Negotiator::native(cli.config(), TerminalGateway);
    match negotiator.connect(&cli.host, cli.port) {
        Ok(mut conn) => {
            println!("Connected to {}:{}", cli.host, cli.port);
            println!("Policy: {}", conn.policy.label());
            println!("Via proxy: {}", conn.via_proxy);
            println!("Peer certificate:");
            print!("{}", compare::subject_summary(&conn.peer_chain));
            let _ = conn.stream.shutdown();
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "negotiation failed");
            eprintln!("vnc-tls-connect: {}", e);
            ExitCode::FAILURE
        }
    }
}
