//! Server role: maintains the peer directory and brokers `establish`
//! introductions. States per peer: `unknown → greeted → registered →
//! (optionally brokered)`, driven entirely by inbound envelope types.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::EndpointConfig;
use crate::crypto::{self, KeyPair};
use crate::endpoint::{Endpoint, Handler};
use crate::error::{EndpointError, ProtocolError};
use crate::message::{Envelope, MessageType, PeerRecord, RegisterRequest, WireEndpoint};

/// The rendezvous server's peer directory and brokering logic, plus the
/// [`Endpoint`] it's bound to.
pub struct RendezvousServer {
    endpoint: Arc<Endpoint>,
    handler: Arc<ServerHandler>,
}

impl RendezvousServer {
    /// Binds the server at a fixed, well-known address.
    pub async fn bind(addr: SocketAddr) -> Result<Self, EndpointError> {
        let keys = KeyPair::generate().map_err(|_| EndpointError::NoFreePort)?;
        let handler = Arc::new(ServerHandler {
            keys,
            directory: Mutex::new(HashMap::new()),
        });
        let endpoint = Endpoint::bind(addr, handler.clone(), EndpointConfig::default()).await?;
        info!(%addr, "rendezvous server listening");
        Ok(RendezvousServer { endpoint, handler })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    /// Looks up a registered peer by id — used by tests and external
    /// introspection.
    pub async fn peer(&self, id: &str) -> Option<PeerRecord> {
        self.handler.directory.lock().await.get(id).cloned()
    }

    pub async fn stop(&self) {
        self.endpoint.stop().await;
    }
}

struct ServerHandler {
    keys: KeyPair,
    directory: Mutex<HashMap<String, PeerRecord>>,
}

#[async_trait]
impl Handler for ServerHandler {
    async fn handle(&self, endpoint: &Arc<Endpoint>, remote: SocketAddr, envelope: Envelope) {
        let kind = envelope.kind;
        let result = match kind {
            MessageType::Greeting => self.on_greeting(endpoint, remote, &envelope).await,
            MessageType::Register => self.on_register(endpoint, remote, &envelope).await,
            MessageType::Establish => self.on_establish(endpoint, remote, &envelope).await,
            other => Err(ProtocolError::new(format!("request type {other:?} undefined"))),
        };

        if let Err(e) = result {
            let reply = Envelope::error_reply(kind, e.0);
            let _ = endpoint.send_envelope(remote, &reply).await;
        }
    }
}

impl ServerHandler {
    /// `greeting`: derive the shared secret for this virtual connection and
    /// reply with the server's own public key, unencrypted. The reply is
    /// sent here (not by the generic `handle` wrapper) because a
    /// successful greeting and a successful register both need their own
    /// distinct reply shape.
    async fn on_greeting(
        &self,
        endpoint: &Arc<Endpoint>,
        remote: SocketAddr,
        envelope: &Envelope,
    ) -> Result<(), ProtocolError> {
        let b64 = envelope
            .data
            .as_ref()
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProtocolError::new("greeting data must be a base64 public key"))?;
        let their_public = crypto::decode_public_key(b64)
            .ok_or_else(|| ProtocolError::new("greeting data is not a valid public key"))?;

        let conn = endpoint.create_connection(remote).await;
        let secret = self.keys.shared_secret(&their_public);
        conn.set_secret(secret);

        let reply = Envelope::new(MessageType::Greeting)
            .with_data(json!(crypto::encode_public_key(&self.keys.public_key())));
        endpoint
            .send_envelope(remote, &reply)
            .await
            .map_err(|e| ProtocolError::new(e.to_string()))
    }

    /// `register`: requires a prior `greeting`.
    /// Inserts or overwrites the directory entry keyed by peer id, with
    /// the endpoint set to the observed source address.
    async fn on_register(
        &self,
        endpoint: &Arc<Endpoint>,
        remote: SocketAddr,
        envelope: &Envelope,
    ) -> Result<(), ProtocolError> {
        let conn = endpoint
            .connection(remote)
            .await
            .ok_or_else(|| ProtocolError::new("register attempted before a greeting"))?;
        if conn.secret().is_none() {
            return Err(ProtocolError::new("register attempted before a greeting"));
        }

        let peer_id = envelope
            .peer_id
            .clone()
            .ok_or_else(|| ProtocolError::new("register requires a peerID"))?;
        let request: RegisterRequest = envelope
            .data
            .clone()
            .and_then(|v| serde_json::from_value(v).ok())
            .ok_or_else(|| ProtocolError::new("register data must be {username, publicKey}"))?;
        if request.username.len() > 32 {
            return Err(ProtocolError::new("username must be at most 32 characters"));
        }

        let record = PeerRecord {
            id: peer_id,
            username: request.username,
            endpoint: WireEndpoint::from_socket_addr(remote),
            public_key: request.public_key,
        };
        self.directory
            .lock()
            .await
            .insert(record.id.clone(), record);

        let reply = Envelope::new(MessageType::Register).encrypted();
        endpoint
            .send_envelope(remote, &reply)
            .await
            .map_err(|e| ProtocolError::new(e.to_string()))
    }

    /// `establish`: source must be registered; the target id named in
    /// `data` must also be registered and have an active virtual
    /// connection in the registry. On success, sends the source's record
    /// to the target and the target's record back to the source, both
    /// encrypted on their respective connections.
    async fn on_establish(
        &self,
        endpoint: &Arc<Endpoint>,
        remote: SocketAddr,
        envelope: &Envelope,
    ) -> Result<(), ProtocolError> {
        let source_id = envelope
            .peer_id
            .clone()
            .ok_or_else(|| ProtocolError::new("establish requires a peerID"))?;
        let target_id = envelope
            .data
            .as_ref()
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProtocolError::new("establish data must be the target peer id"))?
            .to_string();

        let directory = self.directory.lock().await;
        let source_record = directory
            .get(&source_id)
            .ok_or_else(|| ProtocolError::new("source peer is not registered"))?;
        if source_record.endpoint.to_socket_addr() != Some(remote) {
            return Err(ProtocolError::new("source peer endpoint does not match"));
        }
        let target_record = directory
            .get(&target_id)
            .ok_or_else(|| ProtocolError::new("target peer is not registered"))?
            .clone();
        let source_record = source_record.clone();
        drop(directory);

        let target_addr = target_record
            .endpoint
            .to_socket_addr()
            .ok_or_else(|| ProtocolError::new("target peer endpoint is invalid"))?;
        if endpoint.connection(target_addr).await.is_none() {
            return Err(ProtocolError::new("target peer has no active connection"));
        }

        let to_target = Envelope::new(MessageType::Establish)
            .with_data(serde_json::to_value(&source_record).expect("PeerRecord always serializes"))
            .encrypted();
        endpoint
            .send_envelope(target_addr, &to_target)
            .await
            .map_err(|e| ProtocolError::new(e.to_string()))?;

        let to_source = Envelope::new(MessageType::Establish)
            .with_data(serde_json::to_value(&target_record).expect("PeerRecord always serializes"))
            .encrypted();
        endpoint
            .send_envelope(remote, &to_source)
            .await
            .map_err(|e| ProtocolError::new(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::endpoint::{Endpoint, Handler};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    /// A minimal client stand-in that captures the last inbound envelope,
    /// used to drive the server's handler from a real loopback socket
    /// without depending on the full `Client` state machine under test.
    struct CaptureHandler {
        last: StdMutex<Option<Envelope>>,
        notify: Notify,
    }

    #[async_trait]
    impl Handler for CaptureHandler {
        async fn handle(&self, _endpoint: &Arc<Endpoint>, _remote: SocketAddr, envelope: Envelope) {
            *self.last.lock().unwrap() = Some(envelope);
            self.notify.notify_waiters();
        }
    }

    async fn wait_for_reply(capture: &Arc<CaptureHandler>) -> Envelope {
        loop {
            if let Some(env) = capture.last.lock().unwrap().take() {
                return env;
            }
            let notified = capture.notify.notified();
            if let Some(env) = capture.last.lock().unwrap().take() {
                return env;
            }
            tokio::time::timeout(std::time::Duration::from_secs(2), notified)
                .await
                .expect("timed out waiting for reply");
        }
    }

    #[tokio::test]
    async fn greeting_establishes_matching_shared_secrets_on_both_sides() {
        let server = RendezvousServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let capture = Arc::new(CaptureHandler {
            last: StdMutex::new(None),
            notify: Notify::new(),
        });
        let client_endpoint = Endpoint::bind(
            "127.0.0.1:0".parse().unwrap(),
            capture.clone(),
            EndpointConfig::default(),
        )
        .await
        .unwrap();

        let client_keys = KeyPair::generate().unwrap();
        let greeting = Envelope::new(MessageType::Greeting)
            .with_data(json!(crypto::encode_public_key(&client_keys.public_key())));
        client_endpoint
            .send_envelope(server.local_addr(), &greeting)
            .await
            .unwrap();

        let reply = wait_for_reply(&capture).await;
        assert_eq!(reply.kind, MessageType::Greeting);
        let server_pub_b64 = reply.data.unwrap();
        let server_pub = crypto::decode_public_key(server_pub_b64.as_str().unwrap()).unwrap();
        let client_secret = client_keys.shared_secret(&server_pub);

        let server_conn = server
            .endpoint
            .connection(client_endpoint.local_addr())
            .await
            .unwrap();
        assert_eq!(server_conn.secret(), Some(&client_secret));

        server.stop().await;
        client_endpoint.stop().await;
    }

    #[tokio::test]
    async fn register_without_greeting_is_refused() {
        let server = RendezvousServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let capture = Arc::new(CaptureHandler {
            last: StdMutex::new(None),
            notify: Notify::new(),
        });
        let client_endpoint = Endpoint::bind(
            "127.0.0.1:0".parse().unwrap(),
            capture.clone(),
            EndpointConfig::default(),
        )
        .await
        .unwrap();

        let register = Envelope::new(MessageType::Register)
            .with_peer_id("deadbeef")
            .with_data(json!({"username": "alice", "publicKey": "AA=="}));
        client_endpoint
            .send_envelope(server.local_addr(), &register)
            .await
            .unwrap();

        let reply = wait_for_reply(&capture).await;
        assert!(reply.is_error());
        assert!(server.peer("deadbeef").await.is_none());

        server.stop().await;
        client_endpoint.stop().await;
    }
}
