//! Client role: greeting → registration → establishment → hole-punch →
//! messaging. Driven both by inbound envelopes (via
//! [`Handler::handle`]) and by the outer layer's `set_other_peer` /
//! `send_message` / `stop` calls on [`Client`].

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{EndpointConfig, HolePunchConfig};
use crate::crypto::{self, KeyPair};
use crate::endpoint::{Endpoint, Handler};
use crate::error::EndpointError;
use crate::message::{Envelope, MessageType, PeerRecord, RegisterRequest};

/// Observer contract the outer layer implements to learn about a
/// [`Client`]'s state transitions.
///
/// All methods default to a no-op so a caller interested in only one
/// transition doesn't have to stub the rest.
pub trait ClientObserver: Send + Sync {
    /// The client has completed registration with the rendezvous server.
    fn on_registered(&self) {}
    /// An `establish` reply resolved the other peer's endpoint and the
    /// hole-punch procedure is starting.
    fn on_connecting(&self) {}
    /// The first inbound `connect` datagram arrived from the other peer
    /// (fires exactly once — callback-ordering note, corrected).
    fn on_connected(&self) {}
    /// An application message arrived from the other peer.
    fn on_message(&self, text: &str) {
        let _ = text;
    }
}

#[derive(Default)]
struct ClientState {
    registered: bool,
    other_peer: Option<PeerRecord>,
    /// The address the client currently expects `connect`/`message`
    /// traffic from the other peer to arrive on. Tracked separately from
    /// the endpoint's connection registry so it can be repaired if a
    /// symmetric NAT presents a different external port than the one the
    /// rendezvous server observed.
    other_peer_addr: Option<SocketAddr>,
    connected: bool,
}

/// The client-facing handle: owns the endpoint and the protocol state
/// machine, and implements the outer-layer contract
/// (`SetOtherPeer`, `SendMessage`, `Start`/`Stop`).
pub struct Client {
    endpoint: Arc<Endpoint>,
    handler: Arc<ClientHandler>,
}

impl Client {
    /// Binds a client endpoint on a random port on `local_ip` and sends the
    /// initial `greeting` to `server_addr`.
    pub async fn connect(
        local_ip: IpAddr,
        server_addr: SocketAddr,
        username: impl Into<String>,
        observer: Arc<dyn ClientObserver>,
    ) -> Result<Self, EndpointError> {
        Self::connect_with_hole_punch(
            local_ip,
            server_addr,
            username,
            observer,
            HolePunchConfig::default(),
        )
        .await
    }

    /// As [`Client::connect`], but with an explicit hole-punch attempt
    /// count/interval — used by tests to avoid waiting out the real 15s
    /// convergence window.
    pub async fn connect_with_hole_punch(
        local_ip: IpAddr,
        server_addr: SocketAddr,
        username: impl Into<String>,
        observer: Arc<dyn ClientObserver>,
        hole_punch: HolePunchConfig,
    ) -> Result<Self, EndpointError> {
        let keys = KeyPair::generate().map_err(|_| EndpointError::NoFreePort)?;
        let own_id = crypto::peer_id(&keys.public_key());
        let own_public_b64 = crypto::encode_public_key(&keys.public_key());

        let handler = Arc::new(ClientHandler {
            keys,
            own_id: own_id.clone(),
            username: username.into(),
            server_addr,
            hole_punch,
            state: Mutex::new(ClientState::default()),
            observer,
        });

        let endpoint =
            Endpoint::bind_client(local_ip, handler.clone(), EndpointConfig::default()).await?;

        let greeting = Envelope::new(MessageType::Greeting).with_data(json!(own_public_b64));
        endpoint.send_envelope(server_addr, &greeting).await?;

        info!(id = %own_id, local = %endpoint.local_addr(), "client started");
        Ok(Client { endpoint, handler })
    }

    pub fn id(&self) -> &str {
        &self.handler.own_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub async fn is_registered(&self) -> bool {
        self.handler.state.lock().await.registered
    }

    pub async fn other_peer(&self) -> Option<PeerRecord> {
        self.handler.state.lock().await.other_peer.clone()
    }

    /// Supplies the other peer's id after registration;
    /// sends `establish` to the rendezvous server.
    pub async fn set_other_peer(&self, other_id: impl Into<String>) -> Result<(), EndpointError> {
        let envelope = Envelope::new(MessageType::Establish)
            .with_peer_id(self.handler.own_id.clone())
            .with_data(json!(other_id.into()));
        self.endpoint
            .send_envelope(self.handler.server_addr, &envelope)
            .await
    }

    /// Sends an application message to the connected peer. No-op (with a
    /// warning) if no peer connection exists yet.
    pub async fn send_message(&self, text: impl Into<String>) {
        let addr = self.handler.state.lock().await.other_peer_addr;
        let Some(addr) = addr else {
            warn!("send_message called with no established peer connection");
            return;
        };
        let envelope = Envelope::new(MessageType::Message)
            .with_peer_id(self.handler.own_id.clone())
            .with_data(json!(text.into()));
        if let Err(e) = self.endpoint.send_envelope(addr, &envelope).await {
            warn!(error = %e, "failed to send message");
        }
    }

    pub async fn stop(&self) {
        self.endpoint.stop().await;
    }
}

struct ClientHandler {
    keys: KeyPair,
    own_id: String,
    username: String,
    server_addr: SocketAddr,
    hole_punch: HolePunchConfig,
    state: Mutex<ClientState>,
    observer: Arc<dyn ClientObserver>,
}

#[async_trait]
impl Handler for ClientHandler {
    async fn handle(&self, endpoint: &Arc<Endpoint>, remote: SocketAddr, envelope: Envelope) {
        if envelope.is_error() {
            warn!(kind = ?envelope.kind, error = ?envelope.error, %remote, "peer returned an error");
            return;
        }
        match envelope.kind {
            MessageType::Greeting => self.on_greeting(endpoint, remote, &envelope).await,
            MessageType::Register => self.on_register_ack().await,
            MessageType::Establish => self.on_establish(endpoint, &envelope).await,
            MessageType::Connect => self.on_connect(endpoint, remote).await,
            MessageType::Key => self.on_key(&envelope).await,
            MessageType::Message => self.on_message(&envelope),
        }
    }
}

impl ClientHandler {
    /// The server's reply to our `greeting`: derive the shared secret and
    /// send `register`.
    async fn on_greeting(&self, endpoint: &Arc<Endpoint>, remote: SocketAddr, envelope: &Envelope) {
        let Some(b64) = envelope.data.as_ref().and_then(|v| v.as_str()) else {
            warn!("greeting reply missing public key");
            return;
        };
        let Some(server_public) = crypto::decode_public_key(b64) else {
            warn!("greeting reply public key was malformed");
            return;
        };

        let conn = endpoint.create_connection(remote).await;
        conn.set_secret(self.keys.shared_secret(&server_public));

        let register = Envelope::new(MessageType::Register)
            .with_peer_id(self.own_id.clone())
            .with_data(
                serde_json::to_value(RegisterRequest {
                    username: self.username.clone(),
                    public_key: crypto::encode_public_key(&self.keys.public_key()),
                })
                .expect("RegisterRequest always serializes"),
            );
        if let Err(e) = endpoint.send_envelope(remote, &register).await {
            warn!(error = %e, "failed to send register");
        }
    }

    /// The server's (error-free) ack to our `register`.
    async fn on_register_ack(&self) {
        {
            let mut state = self.state.lock().await;
            state.registered = true;
        }
        self.observer.on_registered();
    }

    /// The server's reply carrying the other peer's record. If a virtual connection to that exact address already
    /// exists, this is a no-op; otherwise it creates the connection and
    /// starts the hole-punch procedure.
    async fn on_establish(&self, endpoint: &Arc<Endpoint>, envelope: &Envelope) {
        let Some(data) = envelope.data.clone() else {
            warn!("establish reply missing peer record");
            return;
        };
        let record: PeerRecord = match serde_json::from_value(data) {
            Ok(r) => r,
            Err(_) => {
                warn!("establish reply peer record was malformed");
                return;
            }
        };
        let Some(addr) = record.endpoint.to_socket_addr() else {
            warn!(endpoint = %record.endpoint, "establish reply peer endpoint was invalid");
            return;
        };

        let already_exists = endpoint.connection(addr).await.is_some();
        {
            let mut state = self.state.lock().await;
            state.other_peer = Some(record);
            if !already_exists {
                state.other_peer_addr = Some(addr);
                state.connected = false;
            }
        }
        if already_exists {
            return;
        }

        endpoint.create_connection(addr).await;
        self.observer.on_connecting();

        let endpoint = endpoint.clone();
        let own_id = self.own_id.clone();
        let hole_punch = self.hole_punch;
        tokio::spawn(async move {
            run_hole_punch(endpoint, own_id, addr, hole_punch).await;
        });
    }

    /// Inbound `connect` from the peer. Fires `on_connected` exactly once,
    /// on the first such datagram rather than once per outbound hole-punch
    /// attempt, and always replies with `key`, repairing the remembered
    /// peer address silently rather than rejecting.
    async fn on_connect(&self, endpoint: &Arc<Endpoint>, remote: SocketAddr) {
        let newly_connected = {
            let mut state = self.state.lock().await;
            if state.other_peer_addr != Some(remote) {
                debug!(old = ?state.other_peer_addr, new = %remote, "repairing peer connection pointer");
                state.other_peer_addr = Some(remote);
            }
            let was_connected = state.connected;
            state.connected = true;
            !was_connected
        };

        if newly_connected {
            self.observer.on_connected();
        }

        let reply = Envelope::new(MessageType::Key)
            .with_peer_id(self.own_id.clone())
            .with_data(json!(crypto::encode_public_key(&self.keys.public_key())));
        if let Err(e) = endpoint.send_envelope(remote, &reply).await {
            warn!(error = %e, "failed to reply to connect");
        }
    }

    /// Inbound `key` from the peer — confirms identity against the peer id
    /// learned from `establish`.
    async fn on_key(&self, envelope: &Envelope) {
        let Some(b64) = envelope.data.as_ref().and_then(|v| v.as_str()) else {
            return;
        };
        let Some(public_key) = crypto::decode_public_key(b64) else {
            return;
        };
        let observed_id = crypto::peer_id(&public_key);

        let state = self.state.lock().await;
        if let Some(expected) = state.other_peer.as_ref() {
            if expected.id != observed_id {
                warn!(expected = %expected.id, observed = %observed_id, "peer key does not match expected id");
            }
        }
    }

    /// Inbound `message` from the peer.
    fn on_message(&self, envelope: &Envelope) {
        let Some(text) = envelope.data.as_ref().and_then(|v| v.as_str()) else {
            warn!("message envelope data was not a string");
            return;
        };
        self.observer.on_message(text);
    }
}

/// Five attempts at the configured interval apart, each sending an
/// unencrypted `connect` toward the peer's endpoint. No
/// acknowledgment is required before the loop completes — the peer's own
/// datagrams, once its NAT mapping opens, are the de-facto liveness test.
async fn run_hole_punch(
    endpoint: Arc<Endpoint>,
    own_id: String,
    target: SocketAddr,
    config: HolePunchConfig,
) {
    for attempt in 1..=config.attempts {
        let envelope = Envelope::new(MessageType::Connect).with_peer_id(own_id.clone());
        if let Err(e) = endpoint.send_envelope(target, &envelope).await {
            warn!(attempt, %target, error = %e, "hole-punch send failed");
        }
        tokio::time::sleep(config.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingObserver {
        registered: AtomicBool,
        connecting: AtomicBool,
        connected: AtomicUsize,
        messages: StdMutex<Vec<String>>,
    }

    impl ClientObserver for RecordingObserver {
        fn on_registered(&self) {
            self.registered.store(true, Ordering::SeqCst);
        }
        fn on_connecting(&self) {
            self.connecting.store(true, Ordering::SeqCst);
        }
        fn on_connected(&self) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }
        fn on_message(&self, text: &str) {
            self.messages.lock().unwrap().push(text.to_string());
        }
    }

    #[tokio::test]
    async fn greeting_then_register_reaches_registered_state() {
        let server = crate::peer::server::RendezvousServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let observer = Arc::new(RecordingObserver::default());
        let client = Client::connect(
            "127.0.0.1".parse().unwrap(),
            server.local_addr(),
            "alice",
            observer.clone(),
        )
        .await
        .unwrap();

        let mut waited = 0;
        while !client.is_registered().await && waited < 50 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            waited += 1;
        }

        assert!(client.is_registered().await);
        assert!(observer.registered.load(Ordering::SeqCst));
        let record = server.peer(client.id()).await.unwrap();
        assert_eq!(record.username, "alice");
        assert_eq!(record.endpoint.to_socket_addr(), Some(client.local_addr()));

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn send_message_without_peer_connection_is_a_silent_no_op() {
        let server = crate::peer::server::RendezvousServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let observer = Arc::new(RecordingObserver::default());
        let client = Client::connect(
            "127.0.0.1".parse().unwrap(),
            server.local_addr(),
            "bob",
            observer,
        )
        .await
        .unwrap();

        // No peer has been established yet — this must not panic or block.
        client.send_message("hello").await;

        client.stop().await;
        server.stop().await;
    }
}
