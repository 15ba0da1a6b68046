//! Encrypted transports over loopback.
//!
//! Certificates are minted per test with rcgen; the self-signed server
//! certificate doubles as the client's trust root.

use std::fs;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use corelib::network::{Transport, TransportOptions};
use corelib::topology::{TlsOptions, TlsPair};
use corelib::TransportError;
use streaming::{QuicTransport, TcpTransport};
use tempfile::TempDir;

struct Certs {
    _dir: TempDir,
    client: TlsOptions,
    server: TlsOptions,
}

fn mint_certs() -> Certs {
    let dir = tempfile::tempdir().unwrap();
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    fs::write(&cert_path, cert.serialize_pem().unwrap()).unwrap();
    fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();

    Certs {
        client: TlsOptions {
            ca_path: Some(cert_path.clone()),
            server_name: Some("localhost".into()),
            ..Default::default()
        },
        server: TlsOptions {
            cert_path: Some(cert_path),
            key_path: Some(key_path),
            ..Default::default()
        },
        _dir: dir,
    }
}

fn options(tls: &TlsOptions) -> TransportOptions {
    TransportOptions {
        tls: Some(tls.clone()),
        stream_window: Some(65536),
        ..Default::default()
    }
}

async fn round_trip(transport: &dyn Transport, certs: &Certs) {
    let mut listener = transport
        .listen("127.0.0.1:0", &options(&certs.server))
        .await
        .unwrap();
    let addr = listener.local_addr();

    let payloads: Vec<Bytes> = (0..5u8).map(|i| Bytes::from(vec![i; 10])).collect();

    // The handshake needs both sides driven at once.
    let server = async {
        let mut inbound = listener.accept().await.unwrap();
        let mut received = Vec::new();
        for _ in 0..payloads.len() {
            received.push(inbound.recv().await.unwrap().unwrap());
        }
        received
    };
    let client = async {
        let conn = transport
            .connect(&addr, &options(&certs.client))
            .await
            .unwrap();
        for payload in &payloads {
            conn.send(payload.clone()).await.unwrap();
        }
        conn
    };
    let (mut received, conn) = tokio::join!(server, client);

    // QUIC may hand frames over in any order; compare as sets.
    received.sort();
    assert_eq!(received, payloads);

    conn.close().await;
}

#[tokio::test]
async fn test_tcp_with_tls_round_trip() {
    let certs = mint_certs();
    round_trip(&TcpTransport::new(), &certs).await;
}

#[tokio::test]
async fn test_quic_round_trip() {
    let certs = mint_certs();
    round_trip(&QuicTransport::new(), &certs).await;
}

#[tokio::test]
async fn test_quic_without_tls_is_rejected() {
    let err = QuicTransport::new()
        .listen("127.0.0.1:0", &TransportOptions::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, TransportError::Tls(_)));
}

#[tokio::test]
async fn test_missing_key_file_fails_listen() {
    let certs = mint_certs();
    let mut server = certs.server.clone();
    server.key_path = Some(Path::new("/nonexistent/key.pem").to_path_buf());

    let err = TcpTransport::new()
        .listen("127.0.0.1:0", &options(&server))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, TransportError::Tls(_)));
}

#[test]
fn test_material_is_checked_up_front() {
    let certs = mint_certs();
    let pair = TlsPair {
        client: certs.client.clone(),
        server: certs.server.clone(),
    };
    streaming::tls::check_material(&pair).unwrap();

    let mut broken = pair.clone();
    broken.client.ca_path = Some(Path::new("/nonexistent/ca.pem").to_path_buf());
    assert!(matches!(
        streaming::tls::check_material(&broken),
        Err(TransportError::Tls(_))
    ));
}

#[tokio::test]
async fn test_stalled_tls_handshake_times_out() {
    let certs = mint_certs();
    let opts = TransportOptions {
        connect_timeout: Duration::from_millis(100),
        ..options(&certs.server)
    };
    let mut listener = TcpTransport::new()
        .listen("127.0.0.1:0", &opts)
        .await
        .unwrap();

    // Connects but never starts the handshake.
    let _silent = tokio::net::TcpStream::connect(listener.local_addr())
        .await
        .unwrap();
    let mut inbound = listener.accept().await.unwrap();
    let err = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, TransportError::Timeout));
}
