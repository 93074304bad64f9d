//! remex CLI client — entry point.
//!
//! ```text
//! remex-client <host>                Connect with defaults
//! remex-client <host> -p 3390       Custom port
//! remex-client --config <path>      Load a custom config TOML
//! remex-client --gen-config         Write default config to stdout
//! remex-client <host> --insecure    Skip certificate verification
//! ```
//!
//! Establishes the TLS leg of a connection, resolving server trust
//! through the known-hosts store with an interactive prompt, and prints
//! the negotiated identity and channel-binding token.

mod config;

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use remex_core::crypto::{
    CertDecision, CertificateHandler, CertificateIdentity, TrustPolicy, VERIFY_FLAG_CHANGED,
};
use remex_core::tls::{AnchorDirVerifier, TlsSession};
use remex_core::TransportKind;

use config::ClientConfig;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "remex-client", about = "remex remote desktop client (TLS leg)")]
struct Cli {
    /// Server hostname.
    host: Option<String>,

    /// Server port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "remex-client.toml")]
    config: PathBuf,

    /// Skip certificate verification (dangerous).
    #[arg(long)]
    insecure: bool,

    /// Accept unknown certificates without prompting.
    #[arg(long)]
    accept: bool,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Certificate prompt ───────────────────────────────────────────

/// Interactive stdin/stderr certificate prompt.
struct StdioCertHandler;

impl StdioCertHandler {
    fn ask(&self, question: &str) -> CertDecision {
        eprint!("{question} [y/N/t(emporary)] ");
        let _ = std::io::stderr().flush();

        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            return CertDecision::Reject;
        }
        match line.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => CertDecision::AcceptPermanent,
            "t" | "temp" | "temporary" => CertDecision::AcceptTemporary,
            _ => CertDecision::Reject,
        }
    }
}

impl CertificateHandler for StdioCertHandler {
    fn verify_new(&self, identity: &CertificateIdentity, _flags: u32) -> CertDecision {
        eprintln!("certificate for {}:{}", identity.hostname, identity.port);
        eprintln!("  subject:     {}", identity.subject);
        eprintln!("  issuer:      {}", identity.issuer);
        eprintln!("  fingerprint: {}", identity.fingerprint);
        self.ask("trust this certificate?")
    }

    fn verify_changed(
        &self,
        identity: &CertificateIdentity,
        previous: Option<&CertificateIdentity>,
        _flags: u32,
    ) -> CertDecision {
        eprintln!(
            "WARNING: the certificate for {}:{} has CHANGED",
            identity.hostname, identity.port
        );
        eprintln!("  new fingerprint: {}", identity.fingerprint);
        if let Some(old) = previous {
            eprintln!("  old fingerprint: {}", old.fingerprint);
            eprintln!("  old subject:     {}", old.subject);
        }
        self.ask("accept the changed certificate?")
    }

    fn verify_external(
        &self,
        _pem: &str,
        hostname: &str,
        port: u16,
        flags: u32,
    ) -> CertDecision {
        let changed = if flags & VERIFY_FLAG_CHANGED != 0 {
            " (changed)"
        } else {
            ""
        };
        self.ask(&format!("trust the certificate for {hostname}:{port}{changed}?"))
    }
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&ClientConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // Load config, apply CLI overrides.
    let mut config = ClientConfig::load(&cli.config);
    if let Some(host) = &cli.host {
        config.connection.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.connection.port = port;
    }
    if cli.insecure {
        config.security.ignore_certificate = true;
    }
    if cli.accept {
        config.security.auto_accept = true;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = config.to_session_settings();
    settings.validate()?;

    info!("remex-client v{}", env!("CARGO_PKG_VERSION"));
    info!("target: {}:{}", settings.hostname, settings.port);
    info!("trust dir: {}", settings.trust.trust_dir.display());

    // Trust machinery: anchors from <trust_dir>/anchors, interactive prompt.
    let anchors = AnchorDirVerifier::from_dir(&settings.trust.trust_dir.join("anchors"));
    let policy = Arc::new(TrustPolicy::new(
        settings.trust.clone(),
        TransportKind::Direct,
        Arc::new(StdioCertHandler),
        Arc::new(anchors),
    ));

    // Ctrl-C cancels the session.
    let abort = CancellationToken::new();
    let ctrl_c_abort = abort.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        warn!("Ctrl-C received, aborting session");
        ctrl_c_abort.cancel();
    });

    // TCP, then TLS.
    let address = format!("{}:{}", settings.hostname, settings.port);
    let stream = TcpStream::connect(&address).await?;
    stream.set_nodelay(true).ok();
    info!("TCP connected to {address}");

    let (session, _) = TlsSession::connect(stream, &settings, policy, abort).await?;
    session.poll_and_handshake().await?;

    let identity = session
        .peer_identity()
        .expect("established session has an identity");
    info!("TLS established with {}:{}", identity.hostname, identity.port);
    info!("  subject:     {}", identity.subject);
    info!("  fingerprint: {}", identity.fingerprint);

    let token = session
        .channel_binding_token()
        .expect("established session has a binding token");
    info!("  channel binding: {}", format_binding(&token));

    session.shutdown().await?;
    info!("session closed");
    Ok(())
}

/// Render the binding token as its ASCII prefix plus a hex digest.
fn format_binding(token: &[u8]) -> String {
    let prefix_len = remex_core::crypto::TLS_SERVER_END_POINT.len();
    let prefix = String::from_utf8_lossy(&token[..prefix_len]);
    let digest: String = token[prefix_len..]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();
    format!("{prefix}{digest}")
}
