//! End-to-end TLS session tests over an in-memory transport.
//!
//! A client and a server session handshake across `tokio::io::duplex`,
//! exercising the staging rings, the trust policy, channel bindings, and
//! application data flow exactly as a TCP connection would.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::DuplexStream;
use tokio_util::sync::CancellationToken;

use remex_core::crypto::{CertDecision, CertificateHandler, CertificateIdentity, TrustPolicy};
use remex_core::tls::{alert, HandshakeProgress, SessionState, TlsSession, WriteOutcome};
use remex_core::{RemexError, SessionSettings, TransportKind};

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

// ── Helpers ──────────────────────────────────────────────────────

struct ServerMaterial {
    key_der: Vec<u8>,
    cert_der: Vec<u8>,
}

fn server_material(name: &str) -> ServerMaterial {
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec![name.to_string()])
        .unwrap()
        .self_signed(&key)
        .unwrap();
    ServerMaterial {
        key_der: key.serialize_der(),
        cert_der: cert.der().to_vec(),
    }
}

fn client_settings(trust_dir: &std::path::Path) -> SessionSettings {
    let mut settings = SessionSettings {
        hostname: "localhost".into(),
        port: 3389,
        ..Default::default()
    };
    settings.trust.trust_dir = trust_dir.to_path_buf();
    settings
}

/// Handler answering with a fixed decision.
struct Decide(CertDecision);

impl CertificateHandler for Decide {
    fn verify_new(&self, _: &CertificateIdentity, _: u32) -> CertDecision {
        self.0
    }
    fn verify_changed(
        &self,
        _: &CertificateIdentity,
        _: Option<&CertificateIdentity>,
        _: u32,
    ) -> CertDecision {
        self.0
    }
    fn verify_external(&self, _: &str, _: &str, _: u16, _: u32) -> CertDecision {
        self.0
    }
}

/// Handler that fails the test if consulted.
struct PanicHandler;

impl CertificateHandler for PanicHandler {
    fn verify_new(&self, _: &CertificateIdentity, _: u32) -> CertDecision {
        panic!("handler must not be consulted");
    }
    fn verify_changed(
        &self,
        _: &CertificateIdentity,
        _: Option<&CertificateIdentity>,
        _: u32,
    ) -> CertDecision {
        panic!("handler must not be consulted");
    }
    fn verify_external(&self, _: &str, _: &str, _: u16, _: u32) -> CertDecision {
        panic!("handler must not be consulted");
    }
}

fn policy_for(
    settings: &SessionSettings,
    handler: Arc<dyn CertificateHandler>,
) -> Arc<TrustPolicy> {
    Arc::new(TrustPolicy::new(
        settings.trust.clone(),
        TransportKind::Direct,
        handler,
        Arc::new(remex_core::crypto::NoAnchors),
    ))
}

/// Spawn a server session that handshakes and then runs `body`.
fn spawn_server<F, Fut>(
    transport: DuplexStream,
    material: &ServerMaterial,
    body: F,
) -> tokio::task::JoinHandle<Result<TlsSession<DuplexStream>, RemexError>>
where
    F: FnOnce(Arc<TlsSession<DuplexStream>>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<(), RemexError>> + Send + 'static,
{
    let settings = SessionSettings {
        hostname: "localhost".into(),
        ..Default::default()
    };
    let key_der = material.key_der.clone();
    let cert_der = material.cert_der.clone();

    tokio::spawn(async move {
        let (session, _) = TlsSession::accept(
            transport,
            &settings,
            key_der,
            vec![cert_der],
            CancellationToken::new(),
        )
        .await?;
        session.poll_and_handshake().await?;
        let session = Arc::new(session);
        body(session.clone()).await?;
        Arc::into_inner(session).ok_or(RemexError::SessionState("session still shared"))
    })
}

// ── Tests ────────────────────────────────────────────────────────

#[tokio::test]
async fn handshake_bindings_and_echo() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let material = server_material("localhost");
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);

        let server = spawn_server(server_io, &material, |session| async move {
            let mut buf = vec![0u8; 4];
            let mut got = 0;
            while got < 4 {
                let n = session.read(&mut buf[got..]).await?;
                assert_ne!(n, 0, "peer closed early");
                got += n;
            }
            assert_eq!(&buf, b"ping");
            session.write_all(b"pong").await?;
            Ok(())
        });

        let trust_dir = tempfile::tempdir().unwrap();
        let mut settings = client_settings(trust_dir.path());
        settings.trust.auto_accept = true;
        let policy = policy_for(&settings, Arc::new(PanicHandler));

        let (client, progress) = TlsSession::connect(
            client_io,
            &settings,
            policy.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(progress, HandshakeProgress::Continue);
        client.poll_and_handshake().await.unwrap();
        assert_eq!(client.state(), SessionState::Established);

        // Application data both ways.
        let outcome = client.write_all(b"ping").await.unwrap();
        assert_eq!(outcome, WriteOutcome::Written(4));
        let mut buf = vec![0u8; 4];
        let mut got = 0;
        while got < 4 {
            got += client.read(&mut buf[got..]).await.unwrap();
        }
        assert_eq!(&buf, b"pong");

        let server_session = server.await.unwrap().unwrap();

        // Channel bindings derive from the same certificate on both ends.
        let client_token = client.channel_binding_token().unwrap();
        let server_token = server_session.channel_binding_token().unwrap();
        assert_eq!(client_token, server_token);
        assert!(client_token.starts_with(b"tls-server-end-point:"));

        // Public key captured, identity verified and persisted (auto-accept).
        assert!(client.public_key().is_some());
        let identity = client.peer_identity().unwrap();
        assert_eq!(identity.hostname, "localhost");
        assert!(policy.store().load("localhost", 3389).is_some());

        client.shutdown().await.unwrap();
        assert_eq!(client.state(), SessionState::Destroyed);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn second_connection_trusts_store_without_prompt() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let material = server_material("localhost");
        let trust_dir = tempfile::tempdir().unwrap();

        // First connection: user accepts permanently.
        {
            let (client_io, server_io) = tokio::io::duplex(16 * 1024);
            let server = spawn_server(server_io, &material, |_| async { Ok(()) });

            let settings = client_settings(trust_dir.path());
            let policy = policy_for(&settings, Arc::new(Decide(CertDecision::AcceptPermanent)));
            let (client, _) =
                TlsSession::connect(client_io, &settings, policy, CancellationToken::new())
                    .await
                    .unwrap();
            client.poll_and_handshake().await.unwrap();
            client.shutdown().await.unwrap();
            server.await.unwrap().unwrap();
        }

        // Second connection: the stored identity matches; a handler that
        // panics on contact proves nobody is prompted.
        {
            let (client_io, server_io) = tokio::io::duplex(16 * 1024);
            let server = spawn_server(server_io, &material, |_| async { Ok(()) });

            let settings = client_settings(trust_dir.path());
            let policy = policy_for(&settings, Arc::new(PanicHandler));
            let (client, _) =
                TlsSession::connect(client_io, &settings, policy, CancellationToken::new())
                    .await
                    .unwrap();
            client.poll_and_handshake().await.unwrap();
            assert_eq!(client.state(), SessionState::Established);
            client.shutdown().await.unwrap();
            server.await.unwrap().unwrap();
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn rejected_certificate_fails_handshake_and_queues_alert() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let material = server_material("localhost");
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);

        // Server result is irrelevant; the client aborts on it.
        let _server = spawn_server(server_io, &material, |_| async { Ok(()) });

        let trust_dir = tempfile::tempdir().unwrap();
        let mut settings = client_settings(trust_dir.path());
        settings.trust.auto_deny = true;
        let policy = policy_for(&settings, Arc::new(PanicHandler));

        let (client, _) =
            TlsSession::connect(client_io, &settings, policy.clone(), CancellationToken::new())
                .await
                .unwrap();
        let err = client.poll_and_handshake().await.unwrap_err();
        assert!(matches!(err, RemexError::CertificateRejected { .. }));
        assert_eq!(client.state(), SessionState::Destroyed);

        let queued = client.queued_alert();
        assert_eq!(queued.level, alert::LEVEL_FATAL);
        assert_eq!(queued.description, alert::ACCESS_DENIED);

        // Nothing was recorded in the store.
        assert!(policy.store().load("localhost", 3389).is_none());
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn abort_event_cancels_pending_handshake() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        // Nobody answers on the far side; the handshake stays pending.
        let (client_io, _held_open) = tokio::io::duplex(16 * 1024);

        let trust_dir = tempfile::tempdir().unwrap();
        let settings = client_settings(trust_dir.path());
        let policy = policy_for(&settings, Arc::new(PanicHandler));
        let abort = CancellationToken::new();

        let (client, progress) =
            TlsSession::connect(client_io, &settings, policy, abort.clone())
                .await
                .unwrap();
        assert_eq!(progress, HandshakeProgress::Continue);

        let canceller = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = client.poll_and_handshake().await.unwrap_err();
        assert!(matches!(err, RemexError::Aborted));
        assert_eq!(client.state(), SessionState::Destroyed);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn bulk_transfer_through_small_transport_buffers() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let material = server_material("localhost");
        // Small duplex buffers force wraps and back-pressure in the
        // staging rings.
        let (client_io, server_io) = tokio::io::duplex(4 * 1024);

        const PAYLOAD: usize = 256 * 1024;

        let server = spawn_server(server_io, &material, |session| async move {
            let mut received = vec![0u8; PAYLOAD];
            let mut got = 0;
            while got < PAYLOAD {
                let n = session.read(&mut received[got..]).await?;
                assert_ne!(n, 0, "peer closed early");
                got += n;
            }
            session.write_all(&received).await?;
            Ok(())
        });

        let trust_dir = tempfile::tempdir().unwrap();
        let mut settings = client_settings(trust_dir.path());
        settings.trust.auto_accept = true;
        let policy = policy_for(&settings, Arc::new(PanicHandler));

        let (client, _) =
            TlsSession::connect(client_io, &settings, policy, CancellationToken::new())
                .await
                .unwrap();
        client.poll_and_handshake().await.unwrap();

        let payload: Vec<u8> = (0..PAYLOAD).map(|i| (i * 7 + i / 251) as u8).collect();
        client.write_all(&payload).await.unwrap();

        let mut echoed = vec![0u8; PAYLOAD];
        let mut got = 0;
        while got < PAYLOAD {
            let n = client.read(&mut echoed[got..]).await.unwrap();
            assert_ne!(n, 0, "server closed early");
            got += n;
        }
        assert_eq!(echoed, payload);

        client.shutdown().await.unwrap();
        server.await.unwrap().unwrap();
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn key_log_file_receives_lines() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let material = server_material("localhost");
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let server = spawn_server(server_io, &material, |_| async { Ok(()) });

        let trust_dir = tempfile::tempdir().unwrap();
        let keylog_path = trust_dir.path().join("session.keys");
        let mut settings = client_settings(trust_dir.path());
        settings.trust.auto_accept = true;
        settings.tls.secrets_file = Some(keylog_path.clone());
        let policy = policy_for(&settings, Arc::new(PanicHandler));

        let (client, _) =
            TlsSession::connect(client_io, &settings, policy, CancellationToken::new())
                .await
                .unwrap();
        client.poll_and_handshake().await.unwrap();

        let text = std::fs::read_to_string(&keylog_path).unwrap();
        assert!(!text.is_empty());
        // NSS format: every line is `LABEL <hex> <hex>`.
        for line in text.lines() {
            assert_eq!(line.split(' ').count(), 3, "bad key-log line: {line}");
        }

        client.shutdown().await.unwrap();
        server.await.unwrap().unwrap();
    })
    .await
    .unwrap();
}
