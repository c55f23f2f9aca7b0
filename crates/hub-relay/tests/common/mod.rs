#![allow(dead_code)]

use ed25519_dalek::SigningKey;
use futures_util::{SinkExt, StreamExt};
use hub_common::crypto::{public_key_base64, sign_nonce};
use hub_common::envelope::{self, Envelope, EnvelopeHeader};
use hub_common::messages::{
    ChallengePayload, ClientHelloPayload, EmptyPayload, HostRegisterPayload,
    PairingApprovePayload, PairingCreatePayload, PairingCreatedPayload,
    PairingPendingApprovalPayload, PairingRequestPayload, PairingSuccessPayload,
    SignedChallengePayload,
};
use hub_common::path::socket_url;
use hub_common::types::message_type;
use hub_common::PeerId;
use hub_relay::config::ServerConfig;
use hub_relay::server::ServerState;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_config(listen: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen,
        public_url: format!("ws://{listen}"),
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        challenge_ttl: 60,
        max_pairing_ttl: 600,
        ping_interval: 30,
        idle_timeout: 120,
        max_message_size: 1_048_576,
        sweep_interval: 60,
    }
}

type Ws = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

pub struct TestPeer {
    pub ws_tx: futures_util::stream::SplitSink<Ws, Message>,
    pub ws_rx: futures_util::stream::SplitStream<Ws>,
    pub id: PeerId,
}

impl TestPeer {
    pub async fn connect(addr: &SocketAddr, id: PeerId) -> Self {
        let url = socket_url(&format!("ws://{addr}"), &id);
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let (ws_tx, ws_rx) = ws.split();
        Self { ws_tx, ws_rx, id }
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws_tx
            .send(Message::Text(text.to_string()))
            .await
            .unwrap();
    }

    /// Send an envelope from this peer and return the exact text sent.
    pub async fn send<P: Serialize>(&mut self, kind: &str, target: PeerId, payload: P) -> String {
        let text = envelope::encode(kind, self.id.clone(), target, payload).unwrap();
        self.send_raw(&text).await;
        text
    }

    pub async fn send_to_relay<P: Serialize>(&mut self, kind: &str, payload: P) -> String {
        self.send(kind, PeerId::relay(), payload).await
    }

    /// Next text frame, or `None` if the socket closed.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            let msg = tokio::time::timeout(RECV_TIMEOUT, self.ws_rx.next())
                .await
                .expect("timeout waiting for message");
            match msg {
                Some(Ok(Message::Text(text))) => return Some(text),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
                Some(Ok(other)) => panic!("unexpected frame {other:?}"),
            }
        }
    }

    pub async fn recv_text_timeout(&mut self, timeout: Duration) -> Option<String> {
        tokio::time::timeout(timeout, self.recv_text()).await.ok().flatten()
    }

    pub async fn recv<P: DeserializeOwned>(&mut self, expected_type: &str) -> Envelope<P> {
        let text = self.recv_text().await.expect("socket closed");
        let header: EnvelopeHeader = envelope::decode_header(&text).unwrap();
        assert_eq!(header.message_type, expected_type, "unexpected message {text}");
        envelope::decode(&text).unwrap()
    }

    /// Assert the relay closes this socket.
    pub async fn expect_closed(&mut self) {
        assert_eq!(self.recv_text().await, None, "expected socket to close");
    }
}

pub async fn start_server() -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(ServerState::new(test_config(addr)));

    let state_clone = state.clone();
    tokio::spawn(async move {
        if let Err(e) = hub_relay::run(listener, state_clone).await {
            eprintln!("server error in test: {e}");
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr, state)
}

pub fn register_payload(key: &SigningKey, name: &str) -> HostRegisterPayload {
    HostRegisterPayload {
        display_name: name.to_string(),
        public_key: public_key_base64(key),
        app_version: "1.4.0".to_string(),
        platform: "macOS".to_string(),
    }
}

/// Connect a host and complete register, hello and auth.
pub async fn authenticated_host(addr: &SocketAddr, host_id: &str, key: &SigningKey) -> TestPeer {
    let mut host = TestPeer::connect(addr, PeerId::host(host_id)).await;
    host.send_to_relay(message_type::HOST_REGISTER, register_payload(key, "Mac-Mini"))
        .await;
    host.send_to_relay(message_type::HOST_HELLO, EmptyPayload::default())
        .await;
    let challenge: Envelope<ChallengePayload> = host.recv(message_type::CHALLENGE).await;
    let nonce = challenge.payload.nonce;
    host.send_to_relay(
        message_type::HOST_AUTH,
        SignedChallengePayload {
            signature: sign_nonce(key, &nonce),
            nonce,
        },
    )
    .await;
    let _: Envelope<serde_json::Value> = host.recv(message_type::HOST_AUTHENTICATED).await;
    host
}

/// Run the pairing flow end to end and return the client socket.
pub async fn pair_client(
    addr: &SocketAddr,
    host: &mut TestPeer,
    host_key: &SigningKey,
    client_id: &str,
    client_key: &SigningKey,
) -> TestPeer {
    host.send_to_relay(message_type::PAIRING_CREATE, PairingCreatePayload { ttl_seconds: 120 })
        .await;
    let created: Envelope<PairingCreatedPayload> = host.recv(message_type::PAIRING_CREATED).await;

    let mut client = TestPeer::connect(addr, PeerId::client(client_id)).await;
    client
        .send_to_relay(
            message_type::PAIRING_REQUEST,
            PairingRequestPayload {
                host_id: host.id.id.clone(),
                challenge_id: created.payload.challenge_id.clone(),
                nonce: created.payload.nonce.clone(),
                device_name: "iPhone".to_string(),
                public_key: public_key_base64(client_key),
            },
        )
        .await;

    let pending: Envelope<PairingPendingApprovalPayload> =
        host.recv(message_type::PAIRING_PENDING_APPROVAL).await;
    host.send_to_relay(
        message_type::PAIRING_APPROVE,
        PairingApprovePayload {
            client_id: pending.payload.client_id.clone(),
            challenge_id: pending.payload.challenge_id.clone(),
            signature: sign_nonce(host_key, &pending.payload.challenge_id),
        },
    )
    .await;
    let _: Envelope<PairingSuccessPayload> = client.recv(message_type::PAIRING_SUCCESS).await;
    client
}

/// Complete client-hello and client-auth on an open client socket.
pub async fn authenticate_client(client: &mut TestPeer, host_id: &str, key: &SigningKey) {
    client
        .send_to_relay(
            message_type::CLIENT_HELLO,
            ClientHelloPayload {
                host_id: host_id.to_string(),
            },
        )
        .await;
    let challenge: Envelope<ChallengePayload> = client.recv(message_type::CHALLENGE).await;
    let nonce = challenge.payload.nonce;
    client
        .send_to_relay(
            message_type::CLIENT_AUTH,
            SignedChallengePayload {
                signature: sign_nonce(key, &nonce),
                nonce,
            },
        )
        .await;
    let _: Envelope<serde_json::Value> = client.recv(message_type::CLIENT_AUTHENTICATED).await;
}
