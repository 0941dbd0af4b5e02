//! Message-transport tests against a loopback QUIC echo server.
//!
//! The message variant carries no length prefix; each unidirectional
//! stream is exactly one frame, and the server echoes frames back the
//! same way.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use cm_protocol::transport::{self, tls::ALPN_CM, Endpoint};

fn server_endpoint() -> (quinn::Endpoint, SocketAddr) {
    let cert = rcgen::generate_simple_self_signed(vec!["cm-frontend".to_string()]).unwrap();
    let cert_der = cert.cert.der().clone();
    let key_der = rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    let mut server_crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der.into())
        .unwrap();
    server_crypto.alpn_protocols = vec![ALPN_CM.to_vec()];

    let server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto).unwrap(),
    ));

    let endpoint =
        quinn::Endpoint::server(server_config, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = endpoint.local_addr().unwrap();
    (endpoint, addr)
}

/// Echo every unidirectional stream back as a new one, then close.
async fn run_echo_server(endpoint: quinn::Endpoint, frames_before_close: usize) {
    let incoming = endpoint.accept().await.unwrap();
    let connection = incoming.await.unwrap();

    for _ in 0..frames_before_close {
        let mut recv = connection.accept_uni().await.unwrap();
        let payload = recv.read_to_end(1024 * 1024).await.unwrap();

        let mut send = connection.open_uni().await.unwrap();
        send.write_all(&payload).await.unwrap();
        send.finish().unwrap();
    }

    // Linger so the final echoes flush before the close frame
    tokio::time::sleep(Duration::from_millis(100)).await;
    connection.close(0u32.into(), b"done");
    endpoint.wait_idle().await;
}

#[tokio::test]
async fn frames_roundtrip_with_boundaries_preserved() {
    let (server, addr) = server_endpoint();
    let server_task = tokio::spawn(run_echo_server(server, 2));

    let mut client = transport::connect(&Endpoint::message(addr), Duration::from_secs(5))
        .await
        .unwrap();

    client
        .send_frame(Bytes::from_static(b"first frame"))
        .await
        .unwrap();
    client
        .send_frame(Bytes::from_static(b"second, longer frame payload"))
        .await
        .unwrap();

    // Two distinct frames come back; the transport never merges them
    let mut received = vec![
        client.recv_frame().await.unwrap().unwrap(),
        client.recv_frame().await.unwrap().unwrap(),
    ];
    received.sort_by_key(|f| f.len());

    assert_eq!(received[0], b"first frame");
    assert_eq!(received[1], b"second, longer frame payload");

    // Server close is reported as a clean disconnect
    assert!(client.recv_frame().await.unwrap().is_none());
    server_task.await.unwrap();
}

#[tokio::test]
async fn connect_times_out_against_silent_port() {
    // A UDP port with no QUIC listener behind it
    let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = silent.local_addr().unwrap();

    let result = transport::connect(&Endpoint::message(addr), Duration::from_millis(300)).await;
    assert!(result.is_err());
}
