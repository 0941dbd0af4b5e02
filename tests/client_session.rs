//! End-to-end client scenarios against a simulated CM front-end.
//!
//! The simulated server drives the real wire format: it sends the
//! encryption request, unwraps the client's session key with the
//! universe secret, verifies the nonce MAC, and then echoes
//! job-correlated traffic over the sealed channel.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use x25519_dalek::{PublicKey, StaticSecret};

use cm_protocol::config::ClientConfig;
use cm_protocol::core::codec::FrameCodec;
use cm_protocol::core::envelope::{MessageEnvelope, MsgKind, ResultCode, Universe};
use cm_protocol::core::frame::Frame;
use cm_protocol::directory::ServerDirectory;
use cm_protocol::protocol::handshake::{
    new_encrypt_request, unwrap_session_key, verify_key_mac, EncryptResponse, EncryptResult,
    KeyStore,
};
use cm_protocol::service::callbacks::{CmEvent, CmEventKind};
use cm_protocol::service::client::{CmClient, ConnectionState};
use cm_protocol::transport::Endpoint;
use cm_protocol::utils::crypto::CryptoChannel;

#[derive(Clone, Copy, PartialEq)]
enum SimMode {
    Echo,
    RejectHandshake,
    DropAfterHandshake,
    /// Completes the handshake, then never sends another byte
    Mute,
}

async fn spawn_sim_cm(mode: SimMode) -> (Endpoint, KeyStore) {
    let secret = StaticSecret::random_from_rng(rand_core::OsRng);
    let public = *PublicKey::from(&secret).as_bytes();
    let keys = KeyStore::empty().with_key(Universe::Public, public);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let secret = secret.clone();
            tokio::spawn(async move {
                let _ = serve_connection(stream, secret, mode).await;
            });
        }
    });

    (Endpoint::stream(addr), keys)
}

async fn serve_connection(stream: TcpStream, secret: StaticSecret, mode: SimMode) -> Option<()> {
    let mut framed = Framed::new(stream, FrameCodec);

    // Server speaks first: the unsolicited encryption request
    let request = new_encrypt_request(1, Universe::Public);
    let envelope = MessageEnvelope::new(MsgKind::ChannelEncryptRequest, request.encode());
    framed.send(Frame::new(envelope.encode())).await.ok()?;

    let frame = framed.next().await?.ok()?;
    let envelope = MessageEnvelope::decode(&frame.payload).ok()?;
    assert_eq!(envelope.kind(), MsgKind::ChannelEncryptResponse);
    let response = EncryptResponse::parse(&envelope.body).ok()?;

    let key = unwrap_session_key(&secret, &request.nonce, &response.wrapped_key).ok()?;
    assert!(verify_key_mac(&key, &request.nonce, &response.key_mac));

    let verdict = if mode == SimMode::RejectHandshake {
        ResultCode::FAIL
    } else {
        ResultCode::OK
    };
    let envelope = MessageEnvelope::new(
        MsgKind::ChannelEncryptResult,
        EncryptResult { result: verdict }.encode(),
    );
    framed.send(Frame::new(envelope.encode())).await.ok()?;

    match mode {
        SimMode::RejectHandshake => return Some(()),
        SimMode::DropAfterHandshake => {
            // Give the client a moment to observe the connected event,
            // then vanish without a close frame
            tokio::time::sleep(Duration::from_millis(50)).await;
            return Some(());
        }
        SimMode::Mute => {
            // Swallow everything; the client's idle guard must fire
            while let Some(Ok(_)) = framed.next().await {}
            return Some(());
        }
        SimMode::Echo => {}
    }

    let channel = key.open_channel();
    while let Some(Ok(frame)) = framed.next().await {
        let payload = channel.open(&frame.payload).unwrap();
        let envelope = MessageEnvelope::decode(&payload).unwrap();

        if envelope.kind() == MsgKind::Heartbeat {
            // Keepalives are acknowledged in kind
            send_sealed(
                &mut framed,
                &channel,
                MessageEnvelope::new(MsgKind::Heartbeat, Vec::new()),
            )
            .await?;
            continue;
        }

        if envelope.body == b"multi" {
            for i in 0..2u8 {
                send_sealed(&mut framed, &channel, reply_to(&envelope, vec![i])).await?;
            }
            let mut done = MessageEnvelope::new(MsgKind::JobComplete, Vec::new());
            done.header.target_job = envelope.header.source_job;
            send_sealed(&mut framed, &channel, done).await?;
        } else {
            send_sealed(&mut framed, &channel, reply_to(&envelope, envelope.body.clone())).await?;
        }
    }
    Some(())
}

fn reply_to(request: &MessageEnvelope, body: Vec<u8>) -> MessageEnvelope {
    let mut reply = MessageEnvelope::new(MsgKind::Unknown(600), body);
    reply.header.target_job = request.header.source_job;
    reply
}

async fn send_sealed(
    framed: &mut Framed<TcpStream, FrameCodec>,
    channel: &CryptoChannel,
    envelope: MessageEnvelope,
) -> Option<()> {
    let sealed = channel.seal(&envelope.encode()).unwrap();
    framed.send(Frame::new(sealed)).await.ok()
}

fn test_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.connect_timeout = Duration::from_secs(2);
    config.handshake_timeout = Duration::from_secs(2);
    config.heartbeat_interval = Duration::from_millis(200);
    config.job_timeout = Duration::from_secs(2);
    config.auto_reconnect = false;
    config.max_reconnect_attempts = 1;
    config.reconnect_delay = Duration::from_millis(50);
    config
}

fn client_for(endpoint: Endpoint, keys: KeyStore) -> CmClient {
    CmClient::new(
        test_config(),
        ServerDirectory::from_static(vec![endpoint]),
        keys,
    )
}

fn collect_events(client: &CmClient) -> Arc<Mutex<Vec<CmEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    for kind in [
        CmEventKind::Connected,
        CmEventKind::Disconnected,
        CmEventKind::Message,
    ] {
        let sink = events.clone();
        client.dispatcher().subscribe(kind, move |event| {
            sink.lock().unwrap().push(event.clone());
        });
    }
    events
}

async fn drain_until<F>(client: &CmClient, events: &Arc<Mutex<Vec<CmEvent>>>, pred: F) -> bool
where
    F: Fn(&[CmEvent]) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let _ = client
            .dispatcher()
            .run_once(Duration::from_millis(50))
            .await;
        if pred(&events.lock().unwrap()) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
    }
}

fn connected_ok(events: &[CmEvent]) -> bool {
    events
        .iter()
        .any(|e| matches!(e, CmEvent::Connected(c) if c.result.is_ok()))
}

#[tokio::test]
async fn connects_exchanges_jobs_and_disconnects_cleanly() {
    let (endpoint, keys) = spawn_sim_cm(SimMode::Echo).await;
    let client = client_for(endpoint, keys);
    let events = collect_events(&client);

    client.connect();
    assert!(drain_until(&client, &events, connected_ok).await);
    assert_eq!(client.state(), ConnectionState::Encrypted);

    // Round-trip a correlated request
    let request = MessageEnvelope::new(MsgKind::Unknown(599), b"ping".to_vec());
    let reply = client.request(request).await.unwrap();
    assert_eq!(reply.kind(), MsgKind::Unknown(600));
    assert_eq!(reply.body, b"ping");

    // Caller-initiated disconnect is distinguishable
    client.disconnect().await;
    let saw_user_disconnect = drain_until(&client, &events, |events| {
        events
            .iter()
            .any(|e| matches!(e, CmEvent::Disconnected(d) if d.user_initiated))
    })
    .await;
    assert!(saw_user_disconnect);
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let snapshot = client.metrics();
    assert_eq!(snapshot.connections_total, 1);
    assert!(snapshot.messages_sent >= 1);
}

#[tokio::test]
async fn handshake_rejection_surfaces_failure_code() {
    let (endpoint, keys) = spawn_sim_cm(SimMode::RejectHandshake).await;
    let client = client_for(endpoint, keys);
    let events = collect_events(&client);

    client.connect();
    let saw_failure = drain_until(&client, &events, |events| {
        events
            .iter()
            .any(|e| matches!(e, CmEvent::Connected(c) if c.result == ResultCode::FAIL))
    })
    .await;
    assert!(saw_failure);

    // Never encrypted, never reported connected-ok
    assert!(!connected_ok(&events.lock().unwrap()));
    assert_ne!(client.state(), ConnectionState::Encrypted);
}

#[tokio::test]
async fn abrupt_server_drop_reports_network_disconnect() {
    let (endpoint, keys) = spawn_sim_cm(SimMode::DropAfterHandshake).await;
    let client = client_for(endpoint, keys);
    let events = collect_events(&client);

    client.connect();
    assert!(drain_until(&client, &events, connected_ok).await);

    let saw_network_disconnect = drain_until(&client, &events, |events| {
        events
            .iter()
            .any(|e| matches!(e, CmEvent::Disconnected(d) if !d.user_initiated))
    })
    .await;
    assert!(saw_network_disconnect);
}

#[tokio::test]
async fn fails_over_to_next_candidate() {
    // A dead endpoint followed by a live one: the client marks the dead
    // server bad and connects to the survivor
    let dead = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        Endpoint::stream(addr)
    };
    let (live, keys) = spawn_sim_cm(SimMode::Echo).await;

    let directory = ServerDirectory::from_static(vec![dead.clone(), live.clone()]);
    let client = CmClient::new(test_config(), directory, keys);
    let events = collect_events(&client);

    client.connect();
    assert!(drain_until(&client, &events, connected_ok).await);

    // Health ordering now prefers the live server
    let servers = client.directory().get_servers(None);
    assert_eq!(servers[0].endpoint, live);
    assert!(servers[0].last_bad.is_none());
    assert!(servers[1].last_bad.is_some());
}

#[tokio::test]
async fn multi_reply_job_streams_until_complete_marker() {
    let (endpoint, keys) = spawn_sim_cm(SimMode::Echo).await;
    let client = client_for(endpoint, keys);
    let events = collect_events(&client);

    client.connect();
    assert!(drain_until(&client, &events, connected_ok).await);

    let request = MessageEnvelope::new(MsgKind::Unknown(599), b"multi".to_vec());
    let mut stream = client.send_job_multi(request).await.unwrap();

    let first = stream.next_reply(Duration::from_secs(2)).await.unwrap();
    let second = stream.next_reply(Duration::from_secs(2)).await.unwrap();
    let end = stream.next_reply(Duration::from_secs(2)).await.unwrap();

    assert_eq!(first.unwrap().body, vec![0]);
    assert_eq!(second.unwrap().body, vec![1]);
    assert!(end.is_none());
}

#[tokio::test]
async fn prolonged_server_silence_counts_as_abrupt_disconnect() {
    let (endpoint, keys) = spawn_sim_cm(SimMode::Mute).await;
    let client = client_for(endpoint, keys);
    let events = collect_events(&client);

    client.connect();
    assert!(drain_until(&client, &events, connected_ok).await);

    // Idle limit is heartbeat_interval * 3 = 600ms in the test config
    let saw_idle_disconnect = drain_until(&client, &events, |events| {
        events
            .iter()
            .any(|e| matches!(e, CmEvent::Disconnected(d) if !d.user_initiated))
    })
    .await;
    assert!(saw_idle_disconnect);
}

#[tokio::test]
async fn send_requires_encrypted_session() {
    let (endpoint, keys) = spawn_sim_cm(SimMode::Echo).await;
    let client = client_for(endpoint, keys);

    let envelope = MessageEnvelope::new(MsgKind::Unknown(599), Vec::new());
    let result = client.send(envelope).await;
    assert!(matches!(result, Err(cm_protocol::CmError::NotConnected)));
}

#[tokio::test]
async fn every_inbound_message_reaches_passive_observers() {
    // A job reply fulfils the waiter and still arrives as a Message event
    let (endpoint, keys) = spawn_sim_cm(SimMode::Echo).await;
    let client = client_for(endpoint, keys);
    let events = collect_events(&client);

    client.connect();
    assert!(drain_until(&client, &events, connected_ok).await);

    let request = MessageEnvelope::new(MsgKind::Unknown(599), b"observed".to_vec());
    let reply = client.request(request).await.unwrap();
    assert_eq!(reply.body, b"observed");

    let saw_message_event = drain_until(&client, &events, |events| {
        events
            .iter()
            .any(|e| matches!(e, CmEvent::Message(m) if m.body == b"observed"))
    })
    .await;
    assert!(saw_message_event);
}
