//! The TLS session state machine.
//!
//! A session wraps an async byte transport and a TLS engine. Incoming
//! transport bytes are staged in a [`RingBuffer`] and fed to the engine;
//! outgoing records are staged in a second ring and flushed under the
//! transport lock so concurrent writers cannot interleave records.
//!
//! ```text
//! Prepared ── connect/accept ──► Handshaking ── success ──► Established
//!                                    │                          │
//!                                    │ Continue (wait for I/O)  │
//!                                    │ fatal ──► Destroyed      ▼
//!                                    └───────────────────► ShuttingDown ──► Destroyed
//! ```
//!
//! Handshake progress and teardown are single-caller; `write_all` and
//! `read` may be called from independent tasks and serialize internally.

use std::io::Write as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::crypto::{CertificateIdentity, TrustPolicy};
use crate::error::RemexError;
use crate::ringbuf::RingBuffer;
use crate::settings::{SessionSettings, TlsVersion};
use crate::tls::keylog::KeyLogToFile;
use crate::tls::verifier::DeferredVerifier;

/// Bounded wait between transport write retries when back-pressured.
const WRITE_RETRY_WAIT: Duration = Duration::from_millis(100);

/// Initial size of the record staging rings.
const STAGING_CAPACITY: usize = 16 * 1024;

// ── Alerts ───────────────────────────────────────────────────────

/// TLS alert levels and descriptions the session queues.
pub mod alert {
    pub const LEVEL_WARNING: u8 = 1;
    pub const LEVEL_FATAL: u8 = 2;

    pub const CLOSE_NOTIFY: u8 = 0;
    pub const HANDSHAKE_FAILURE: u8 = 40;
    pub const BAD_CERTIFICATE: u8 = 42;
    pub const ACCESS_DENIED: u8 = 49;
    pub const INTERNAL_ERROR: u8 = 80;
}

/// An alert queued for transmission at shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsAlert {
    pub level: u8,
    pub description: u8,
}

impl Default for TlsAlert {
    fn default() -> Self {
        Self {
            level: alert::LEVEL_WARNING,
            description: alert::CLOSE_NOTIFY,
        }
    }
}

// ── SessionState ─────────────────────────────────────────────────

/// Lifecycle phase of a TLS session, with validated transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Engine configured, no handshake traffic yet.
    #[default]
    Prepared,
    /// Handshake flights in progress.
    Handshaking,
    /// Application data may flow.
    Established,
    /// Close in progress; reads may still drain.
    ShuttingDown,
    /// Terminal. No further operations succeed.
    Destroyed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Prepared => "Prepared",
            Self::Handshaking => "Handshaking",
            Self::Established => "Established",
            Self::ShuttingDown => "ShuttingDown",
            Self::Destroyed => "Destroyed",
        };
        write!(f, "{name}")
    }
}

impl SessionState {
    /// Transition to `Handshaking`. Valid from `Prepared` and
    /// `Handshaking` (re-entry while polling).
    fn begin_handshake(&mut self) -> Result<(), RemexError> {
        match self {
            Self::Prepared | Self::Handshaking => {
                *self = Self::Handshaking;
                Ok(())
            }
            _ => Err(RemexError::SessionState("handshake after establishment")),
        }
    }

    /// Transition to `Established`. Valid from `Handshaking`.
    fn establish(&mut self) -> Result<(), RemexError> {
        match self {
            Self::Handshaking => {
                *self = Self::Established;
                Ok(())
            }
            _ => Err(RemexError::SessionState("establish outside handshake")),
        }
    }

    /// Transition to `ShuttingDown`. Valid from `Handshaking` and
    /// `Established`.
    fn begin_shutdown(&mut self) -> Result<(), RemexError> {
        match self {
            Self::Handshaking | Self::Established => {
                *self = Self::ShuttingDown;
                Ok(())
            }
            Self::ShuttingDown => Ok(()),
            _ => Err(RemexError::SessionState("shutdown from idle state")),
        }
    }

    /// Force the terminal state. Valid from anywhere.
    fn destroy(&mut self) {
        *self = Self::Destroyed;
    }
}

// ── Handshake / write outcomes ───────────────────────────────────

/// Result of one handshake step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeProgress {
    /// Handshake complete; the peer identity has been verified.
    Success,
    /// The engine needs more transport input; wait for readiness and
    /// re-invoke.
    Continue,
}

/// Result of a `write_all` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// All bytes were submitted to the engine and flushed.
    Written(usize),
    /// The engine must consume input before it can produce more output
    /// (mid-stream rehandshake). Drain reads, then retry.
    MustReadFirst,
}

// ── TlsSession ───────────────────────────────────────────────────

/// TLS over an async byte transport.
///
/// The transport is split into read and write halves so a blocked
/// reader never starves a concurrent writer.
pub struct TlsSession<T> {
    state: Mutex<SessionState>,
    engine: Mutex<rustls::Connection>,
    read_half: tokio::sync::Mutex<tokio::io::ReadHalf<T>>,
    write_half: tokio::sync::Mutex<tokio::io::WriteHalf<T>>,
    /// Raw transport bytes not yet consumed by the engine.
    incoming: Mutex<RingBuffer>,
    /// Encrypted records not yet flushed to the transport.
    outgoing: Mutex<RingBuffer>,
    abort: CancellationToken,
    hostname: String,
    port: u16,
    is_client: bool,
    policy: Option<Arc<TrustPolicy>>,
    /// Server mode only: our own certificate, for key/binding extraction.
    own_cert: Option<Vec<u8>>,
    peer_identity: Mutex<Option<CertificateIdentity>>,
    public_key: Mutex<Option<Vec<u8>>>,
    bindings: Mutex<Option<Vec<u8>>>,
    queued_alert: Mutex<TlsAlert>,
}

impl<T> TlsSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Create a client session and run the first handshake step.
    ///
    /// SNI is set to the configured hostname; protocol bounds, cipher
    /// filtering, and key logging come from `settings.tls`.
    pub async fn connect(
        transport: T,
        settings: &SessionSettings,
        policy: Arc<TrustPolicy>,
        abort: CancellationToken,
    ) -> Result<(Self, HandshakeProgress), RemexError> {
        settings.validate()?;
        let config = client_config(settings)?;
        let server_name = ServerName::try_from(settings.hostname.clone())
            .map_err(|_| RemexError::BadConfiguration("hostname is not a valid SNI name".into()))?;
        let conn = rustls::ClientConnection::new(Arc::new(config), server_name)?;

        let session = Self::build(
            transport,
            rustls::Connection::Client(conn),
            settings,
            Some(policy),
            None,
            abort,
        );
        let progress = session.handshake().await?;
        Ok((session, progress))
    }

    /// Create a server session with our key and certificate chain, and
    /// run the first handshake step. The client-side trust policy does
    /// not apply here.
    pub async fn accept(
        transport: T,
        settings: &SessionSettings,
        key_der: Vec<u8>,
        cert_chain_der: Vec<Vec<u8>>,
        abort: CancellationToken,
    ) -> Result<(Self, HandshakeProgress), RemexError> {
        let own_cert = cert_chain_der
            .first()
            .cloned()
            .ok_or(RemexError::CertificateMalformed("empty server chain"))?;
        let config = server_config(settings, key_der, cert_chain_der)?;
        let conn = rustls::ServerConnection::new(Arc::new(config))?;

        let session = Self::build(
            transport,
            rustls::Connection::Server(conn),
            settings,
            None,
            Some(own_cert),
            abort,
        );
        let progress = session.handshake().await?;
        Ok((session, progress))
    }

    fn build(
        transport: T,
        engine: rustls::Connection,
        settings: &SessionSettings,
        policy: Option<Arc<TrustPolicy>>,
        own_cert: Option<Vec<u8>>,
        abort: CancellationToken,
    ) -> Self {
        let is_client = policy.is_some();
        let (read_half, write_half) = tokio::io::split(transport);
        Self {
            state: Mutex::new(SessionState::Prepared),
            engine: Mutex::new(engine),
            read_half: tokio::sync::Mutex::new(read_half),
            write_half: tokio::sync::Mutex::new(write_half),
            incoming: Mutex::new(RingBuffer::new(STAGING_CAPACITY)),
            outgoing: Mutex::new(RingBuffer::new(STAGING_CAPACITY)),
            abort,
            hostname: settings.hostname.clone(),
            port: settings.port,
            is_client,
            policy,
            own_cert,
            peer_identity: Mutex::new(None),
            public_key: Mutex::new(None),
            bindings: Mutex::new(None),
            queued_alert: Mutex::new(TlsAlert::default()),
        }
    }

    // ── Handshake ────────────────────────────────────────────────

    /// Run the handshake as far as the staged input allows.
    ///
    /// Consumes bytes already staged from the transport and flushes the
    /// engine's responses. Returns [`HandshakeProgress::Continue`] when
    /// the engine is starved for input. Must not run concurrently with
    /// `write_all` on the same session.
    pub async fn handshake(&self) -> Result<HandshakeProgress, RemexError> {
        self.state.lock().expect("state lock").begin_handshake()?;

        loop {
            self.stage_engine_output()?;
            self.flush_outgoing().await?;

            let handshaking = self.engine.lock().expect("engine lock").is_handshaking();
            if !handshaking {
                break;
            }

            let fed: Result<bool, rustls::Error> = {
                let mut engine = self.engine.lock().expect("engine lock");
                let mut incoming = self.incoming.lock().expect("incoming lock");
                if incoming.is_empty() {
                    Ok(false)
                } else {
                    engine
                        .read_tls(&mut *incoming)
                        .map_err(|e| self.fatal(RemexError::Transport(e)))?;
                    engine.process_new_packets().map(|_| true)
                }
            };

            match fed {
                Ok(true) => {}
                Ok(false) => return Ok(HandshakeProgress::Continue),
                Err(e) => {
                    // Best effort: let the engine's own alert out before
                    // tearing down.
                    self.stage_engine_output().ok();
                    let _ = self.flush_outgoing().await;
                    return Err(self.fatal(RemexError::TlsHandshake(e)));
                }
            }
        }

        // Final flight (e.g. the client Finished) may still be pending.
        self.stage_engine_output()?;
        self.flush_outgoing().await?;

        self.complete_handshake()?;
        self.state.lock().expect("state lock").establish()?;
        Ok(HandshakeProgress::Success)
    }

    /// Drive the handshake to completion, waiting on the abort token and
    /// transport readiness between steps.
    pub async fn poll_and_handshake(&self) -> Result<(), RemexError> {
        loop {
            match self.handshake().await? {
                HandshakeProgress::Success => return Ok(()),
                HandshakeProgress::Continue => self.wait_and_stage_input().await?,
            }
        }
    }

    /// Extract the peer certificate, public key, and channel binding;
    /// run the trust policy on the client side.
    fn complete_handshake(&self) -> Result<(), RemexError> {
        let chain: Vec<Vec<u8>> = {
            let engine = self.engine.lock().expect("engine lock");
            engine
                .peer_certificates()
                .map(|certs| certs.iter().map(|c| c.as_ref().to_vec()).collect())
                .unwrap_or_default()
        };

        let cert_der = if self.is_client {
            chain.first().cloned().ok_or_else(|| {
                self.fatal(RemexError::CertificateMalformed("peer sent no certificate"))
            })?
        } else {
            self.own_cert
                .clone()
                .ok_or(RemexError::CertificateMalformed("no server certificate"))?
        };

        let identity = CertificateIdentity::from_der(&self.hostname, self.port, &cert_der)
            .map_err(|e| self.fatal(e))?;

        *self.public_key.lock().expect("public key lock") =
            Some(identity.public_key().map_err(|e| self.fatal(e))?);
        *self.bindings.lock().expect("bindings lock") = Some(identity.channel_binding_token());

        if let Some(policy) = &self.policy {
            if let Err(e) = policy.verify(&identity, &chain) {
                error!("certificate not trusted, aborting");
                self.send_alert(alert::LEVEL_FATAL, alert::ACCESS_DENIED);
                return Err(self.fatal(e));
            }
        }

        *self.peer_identity.lock().expect("peer identity lock") = Some(identity);
        Ok(())
    }

    /// Wait for transport input (or abort) and stage whatever arrives.
    async fn wait_and_stage_input(&self) -> Result<(), RemexError> {
        let mut buf = [0u8; 4096];
        let n = tokio::select! {
            biased;
            _ = self.abort.cancelled() => {
                debug!("abort event set, cancelling session");
                self.state.lock().expect("state lock").destroy();
                return Err(RemexError::Aborted);
            }
            read = async {
                let mut transport = self.read_half.lock().await;
                transport.read(&mut buf).await
            } => read.map_err(|e| self.fatal(RemexError::Transport(e)))?,
        };

        if n == 0 {
            return Err(self.fatal(RemexError::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "transport closed during TLS exchange",
            ))));
        }
        self.incoming.lock().expect("incoming lock").write(&buf[..n]);
        Ok(())
    }

    // ── Application data ─────────────────────────────────────────

    /// Write with back-pressure. Bytes from a single caller appear on
    /// the wire in submission order; concurrent callers serialize on the
    /// engine lock with unspecified relative order.
    pub async fn write_all(&self, data: &[u8]) -> Result<WriteOutcome, RemexError> {
        if *self.state.lock().expect("state lock") != SessionState::Established {
            return Err(RemexError::SessionState("write before establishment"));
        }

        let mut offset = 0;
        while offset < data.len() {
            if self.abort.is_cancelled() {
                return Err(RemexError::Aborted);
            }

            let submitted = {
                let mut engine = self.engine.lock().expect("engine lock");
                let n = engine
                    .writer()
                    .write(&data[offset..])
                    .map_err(RemexError::Transport)?;
                if n == 0 && engine.wants_read() {
                    // Renegotiation: input must be drained before the
                    // engine accepts more plaintext.
                    return Ok(WriteOutcome::MustReadFirst);
                }
                let mut outgoing = self.outgoing.lock().expect("outgoing lock");
                while engine.wants_write() {
                    engine
                        .write_tls(&mut *outgoing)
                        .map_err(RemexError::Transport)?;
                }
                n
            };
            offset += submitted;

            self.flush_outgoing().await?;
        }

        Ok(WriteOutcome::Written(data.len()))
    }

    /// Read decrypted bytes. Returns `Ok(0)` on a clean close.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, RemexError> {
        {
            let state = *self.state.lock().expect("state lock");
            if !matches!(
                state,
                SessionState::Established | SessionState::ShuttingDown
            ) {
                return Err(RemexError::SessionState("read before establishment"));
            }
        }

        loop {
            if self.abort.is_cancelled() {
                return Err(RemexError::Aborted);
            }

            // Drain plaintext or staged records first.
            let need_transport = {
                let mut engine = self.engine.lock().expect("engine lock");
                match std::io::Read::read(&mut engine.reader(), buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(self.fatal(RemexError::Transport(e))),
                }

                let mut incoming = self.incoming.lock().expect("incoming lock");
                if incoming.is_empty() {
                    true
                } else {
                    engine
                        .read_tls(&mut *incoming)
                        .map_err(|e| self.fatal(RemexError::Transport(e)))?;
                    engine
                        .process_new_packets()
                        .map_err(|e| self.fatal(RemexError::TlsHandshake(e)))?;
                    false
                }
            };

            if need_transport {
                self.wait_and_stage_input().await?;
            }
        }
    }

    // ── Shutdown & alerts ────────────────────────────────────────

    /// Queue an alert for transmission at shutdown.
    pub fn send_alert(&self, level: u8, description: u8) {
        *self.queued_alert.lock().expect("alert lock") = TlsAlert { level, description };
    }

    /// The currently queued alert.
    pub fn queued_alert(&self) -> TlsAlert {
        *self.queued_alert.lock().expect("alert lock")
    }

    /// Close the session. Emits close_notify unless a non-default alert
    /// was queued; the engine cannot transmit arbitrary alerts, so a
    /// queued fatal alert suppresses close_notify and is logged instead.
    pub async fn shutdown(&self) -> Result<(), RemexError> {
        self.state.lock().expect("state lock").begin_shutdown()?;

        let queued = self.queued_alert();
        if queued.description == alert::CLOSE_NOTIFY {
            let mut engine = self.engine.lock().expect("engine lock");
            engine.send_close_notify();
            let mut outgoing = self.outgoing.lock().expect("outgoing lock");
            while engine.wants_write() {
                engine
                    .write_tls(&mut *outgoing)
                    .map_err(RemexError::Transport)?;
            }
        } else {
            warn!(
                "suppressing close_notify for queued alert level {} description {}",
                queued.level, queued.description
            );
        }

        self.flush_outgoing().await?;
        {
            let mut transport = self.write_half.lock().await;
            transport.shutdown().await.ok();
        }
        self.state.lock().expect("state lock").destroy();
        Ok(())
    }

    // ── Accessors ────────────────────────────────────────────────

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("state lock")
    }

    /// The verified peer identity (own identity in server mode).
    pub fn peer_identity(&self) -> Option<CertificateIdentity> {
        self.peer_identity.lock().expect("peer identity lock").clone()
    }

    /// DER SubjectPublicKeyInfo captured at handshake success.
    pub fn public_key(&self) -> Option<Vec<u8>> {
        self.public_key.lock().expect("public key lock").clone()
    }

    /// `"tls-server-end-point:" || hash(cert)`, for upstream binding.
    pub fn channel_binding_token(&self) -> Option<Vec<u8>> {
        self.bindings.lock().expect("bindings lock").clone()
    }

    /// The session abort token; cancelling it unblocks suspended calls.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    // ── Internal ─────────────────────────────────────────────────

    /// Move pending engine records into the outgoing ring. Cheap when
    /// the engine has nothing to say.
    fn stage_engine_output(&self) -> Result<(), RemexError> {
        let mut engine = self.engine.lock().expect("engine lock");
        let mut outgoing = self.outgoing.lock().expect("outgoing lock");
        while engine.wants_write() {
            engine
                .write_tls(&mut *outgoing)
                .map_err(RemexError::Transport)?;
        }
        Ok(())
    }

    /// Drain the outgoing ring into the transport. Holding the write
    /// half across the whole drain keeps records in order even with
    /// concurrent writers. Bounded waits between retries keep progress
    /// non-spinning under back-pressure.
    async fn flush_outgoing(&self) -> Result<(), RemexError> {
        let mut transport = self.write_half.lock().await;

        loop {
            let chunk: Vec<u8> = {
                let outgoing = self.outgoing.lock().expect("outgoing lock");
                if outgoing.is_empty() {
                    break;
                }
                let (a, b) = outgoing.peek(usize::MAX);
                let mut v = a.to_vec();
                v.extend_from_slice(b);
                v
            };

            let mut offset = 0;
            while offset < chunk.len() {
                if self.abort.is_cancelled() {
                    return Err(RemexError::Aborted);
                }
                match tokio::time::timeout(WRITE_RETRY_WAIT, transport.write(&chunk[offset..]))
                    .await
                {
                    Ok(Ok(0)) => {
                        return Err(self.fatal(RemexError::Transport(std::io::Error::new(
                            std::io::ErrorKind::WriteZero,
                            "transport refused bytes",
                        ))))
                    }
                    Ok(Ok(n)) => offset += n,
                    Ok(Err(e)) => return Err(self.fatal(RemexError::Transport(e))),
                    // Write-blocked: bounded wait elapsed, re-check abort
                    // and retry.
                    Err(_) => continue,
                }
            }

            self.outgoing
                .lock()
                .expect("outgoing lock")
                .commit_read(chunk.len());
        }

        transport
            .flush()
            .await
            .map_err(|e| self.fatal(RemexError::Transport(e)))?;
        Ok(())
    }

    /// Mark the session dead and pass the error through. Handshake and
    /// engine failures are fatal; the session cannot be retried.
    fn fatal(&self, err: RemexError) -> RemexError {
        self.state.lock().expect("state lock").destroy();
        err
    }
}

// ── Engine configuration ─────────────────────────────────────────

fn protocol_versions(
    settings: &SessionSettings,
) -> Result<Vec<&'static rustls::SupportedProtocolVersion>, RemexError> {
    match (settings.tls.min_version, settings.tls.max_version) {
        (TlsVersion::Tls12, TlsVersion::Tls13) => {
            Ok(vec![&rustls::version::TLS13, &rustls::version::TLS12])
        }
        (TlsVersion::Tls12, TlsVersion::Tls12) => Ok(vec![&rustls::version::TLS12]),
        (TlsVersion::Tls13, TlsVersion::Tls13) => Ok(vec![&rustls::version::TLS13]),
        (TlsVersion::Tls13, TlsVersion::Tls12) => Err(RemexError::BadConfiguration(
            "tls min_version exceeds max_version".into(),
        )),
    }
}

/// Build the engine provider, applying the configured cipher allow list.
fn filtered_provider(settings: &SessionSettings) -> Result<Arc<CryptoProvider>, RemexError> {
    let mut provider = rustls::crypto::ring::default_provider();
    if !settings.tls.cipher_suites.is_empty() {
        provider.cipher_suites.retain(|suite| {
            let name = format!("{:?}", suite.suite());
            settings
                .tls
                .cipher_suites
                .iter()
                .any(|want| want.eq_ignore_ascii_case(&name))
        });
        if provider.cipher_suites.is_empty() {
            return Err(RemexError::BadConfiguration(
                "cipher list matches no supported suite".into(),
            ));
        }
    }
    Ok(Arc::new(provider))
}

fn client_config(settings: &SessionSettings) -> Result<rustls::ClientConfig, RemexError> {
    let provider = filtered_provider(settings)?;
    let verifier = Arc::new(DeferredVerifier::new(&provider));

    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&protocol_versions(settings)?)?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();

    if let Some(path) = &settings.tls.secrets_file {
        config.key_log = Arc::new(KeyLogToFile::new(path.clone()));
    }
    Ok(config)
}

fn server_config(
    settings: &SessionSettings,
    key_der: Vec<u8>,
    cert_chain_der: Vec<Vec<u8>>,
) -> Result<rustls::ServerConfig, RemexError> {
    let provider = filtered_provider(settings)?;
    let chain: Vec<CertificateDer<'static>> = cert_chain_der
        .into_iter()
        .map(CertificateDer::from)
        .collect();
    let key = PrivateKeyDer::try_from(key_der)
        .map_err(|_| RemexError::CertificateMalformed("unusable private key"))?;

    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&protocol_versions(settings)?)?
        .with_no_client_auth()
        .with_single_cert(chain, key)?;

    if let Some(path) = &settings.tls.secrets_file {
        config.key_log = Arc::new(KeyLogToFile::new(path.clone()));
    }
    Ok(config)
}

// ── Tests ────────────────────────────────────────────────────────
