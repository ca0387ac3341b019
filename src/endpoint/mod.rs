//! The UDP endpoint: a single socket serving arbitrary remotes, fanning
//! inbound datagrams out to per-remote virtual connections and a shared
//! handler, and funneling all outbound datagrams through one send queue.
//!
//! Concurrency model: one receiver task, one sender task,
//! a freshly spawned "serve" task per inbound datagram (decode), and a
//! further spawned task per decoded envelope (handler dispatch) so the
//! receiver is never blocked by application logic. Shutdown is cooperative:
//! `stop` broadcasts on a shutdown channel and waits for every spawned task
//! to join via [`tasks::TaskTracker`].

mod connection;
mod tasks;

pub use connection::VirtualConnection;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use crate::config::EndpointConfig;
use crate::crypto;
use crate::error::EndpointError;
use crate::message::{self, Envelope, MessageType};

use connection::ConnectionRegistry;
use tasks::TaskTracker;

/// Dispatched once per decoded inbound envelope.
///
/// Receives `endpoint` as a parameter (rather than storing it) so the
/// handler and the endpoint never own each other — breaking the ownership
/// cycle a naive "endpoint owns handler, handler owns endpoint" design
/// would create. A handler that needs to act outside of a `handle` call
/// (e.g. the client's hole-punch loop, or an outer `SendMessage`) is given
/// its own clone of the `Arc<Endpoint>` at construction time by its owning
/// facade (`Client`/`RendezvousServer`), not by the trait.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, endpoint: &Arc<Endpoint>, remote: SocketAddr, envelope: Envelope);
}

pub struct Endpoint {
    local_addr: SocketAddr,
    socket: Arc<UdpSocket>,
    connections: Arc<ConnectionRegistry>,
    send_tx: mpsc::Sender<(SocketAddr, Vec<u8>)>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Arc<TaskTracker>,
    handler: Arc<dyn Handler>,
    config: EndpointConfig,
}

impl Endpoint {
    /// Binds a socket at a fixed address (the rendezvous server's role).
    pub async fn bind(
        addr: SocketAddr,
        handler: Arc<dyn Handler>,
        config: EndpointConfig,
    ) -> Result<Arc<Self>, EndpointError> {
        let socket = UdpSocket::bind(addr).await.map_err(EndpointError::Bind)?;
        let local_addr = socket.local_addr().map_err(EndpointError::Bind)?;
        let socket = Arc::new(socket);
        let (send_tx, send_rx) = mpsc::channel(config.send_queue_capacity);
        let (shutdown_tx, _) = broadcast::channel(1);
        let tasks = TaskTracker::new();
        let connections = Arc::new(ConnectionRegistry::new());

        let endpoint = Arc::new(Endpoint {
            local_addr,
            socket: socket.clone(),
            connections,
            send_tx,
            shutdown_tx: shutdown_tx.clone(),
            tasks: tasks.clone(),
            handler,
            config: config.clone(),
        });

        spawn_sender(socket.clone(), send_rx, shutdown_tx.subscribe(), tasks.clone());
        spawn_receiver(endpoint.clone(), shutdown_tx.subscribe());

        debug!(%local_addr, "endpoint bound");
        Ok(endpoint)
    }

    /// Binds a socket on a random port in `[10000, 65535)` on `local_ip`
    /// (the client's role).
    pub async fn bind_client(
        local_ip: IpAddr,
        handler: Arc<dyn Handler>,
        config: EndpointConfig,
    ) -> Result<Arc<Self>, EndpointError> {
        const ATTEMPTS: usize = 20;
        for _ in 0..ATTEMPTS {
            let port = crypto::random_client_port();
            let addr = SocketAddr::new(local_ip, port);
            match Self::bind(addr, handler.clone(), config.clone()).await {
                Ok(endpoint) => return Ok(endpoint),
                Err(EndpointError::Bind(e)) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(EndpointError::NoFreePort)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the existing virtual connection for `remote`, if any.
    pub async fn connection(&self, remote: SocketAddr) -> Option<Arc<VirtualConnection>> {
        self.connections.get(remote).await
    }

    /// Creates (or returns the existing) virtual connection for `remote`.
    pub async fn create_connection(&self, remote: SocketAddr) -> Arc<VirtualConnection> {
        self.connections.get_or_create(remote).await
    }

    /// Enqueues a raw payload for `remote`; delivered in enqueue order by
    /// the single sender task.
    pub async fn enqueue(&self, remote: SocketAddr, bytes: Vec<u8>) -> Result<(), EndpointError> {
        self.send_tx
            .send((remote, bytes))
            .await
            .map_err(|_| EndpointError::QueueClosed)
    }

    /// Encodes `envelope` against `remote`'s virtual connection's secret
    /// (creating the connection if it doesn't exist yet) and enqueues it.
    pub async fn send_envelope(
        &self,
        remote: SocketAddr,
        envelope: &Envelope,
    ) -> Result<(), EndpointError> {
        let conn = self.connections.get_or_create(remote).await;
        let secret = conn.secret().copied();
        let bytes = message::encode(envelope, secret.as_ref())?;
        self.enqueue(remote, bytes).await
    }

    /// Broadcasts shutdown and blocks until the receiver, sender, and every
    /// in-flight serve/callback task have joined.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        self.tasks.join_all().await;
        debug!(local_addr = %self.local_addr, "endpoint stopped");
    }
}

fn spawn_sender(
    socket: Arc<UdpSocket>,
    mut rx: mpsc::Receiver<(SocketAddr, Vec<u8>)>,
    mut shutdown_rx: broadcast::Receiver<()>,
    tasks: Arc<TaskTracker>,
) {
    let guard = tasks.spawn_guard();
    tokio::spawn(async move {
        let _guard = guard;
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                item = rx.recv() => {
                    match item {
                        Some((remote, bytes)) => {
                            if let Err(e) = socket.send_to(&bytes, remote).await {
                                warn!(%remote, error = %e, "udp send failed");
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });
}

fn spawn_receiver(endpoint: Arc<Endpoint>, mut shutdown_rx: broadcast::Receiver<()>) {
    let guard = endpoint.tasks.spawn_guard();
    tokio::spawn(async move {
        let _guard = guard;
        let mut buf = vec![0u8; endpoint.config.recv_buffer_size];
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                result = tokio::time::timeout(endpoint.config.read_timeout, endpoint.socket.recv_from(&mut buf)) => {
                    match result {
                        Err(_elapsed) => continue,
                        Ok(Err(e)) => {
                            warn!(error = %e, "udp receive failed — terminating receiver");
                            break;
                        }
                        Ok(Ok((n, remote))) => {
                            let data = buf[..n].to_vec();
                            spawn_serve(endpoint.clone(), remote, data);
                        }
                    }
                }
            }
        }
    });
}

fn spawn_serve(endpoint: Arc<Endpoint>, remote: SocketAddr, data: Vec<u8>) {
    let guard = endpoint.tasks.spawn_guard();
    tokio::spawn(async move {
        let _guard = guard;
        let conn = endpoint.connections.get_or_create(remote).await;
        let secret = conn.secret().copied();
        match message::decode(&data, secret.as_ref()) {
            Ok(envelope) => {
                trace!(%remote, kind = ?envelope.kind, "decoded inbound envelope");
                spawn_callback(endpoint, remote, envelope);
            }
            Err(_) => {
                let reply = Envelope::error_reply(MessageType::Message, "Malformed payload was sent");
                let _ = endpoint.send_envelope(remote, &reply).await;
            }
        }
    });
}

fn spawn_callback(endpoint: Arc<Endpoint>, remote: SocketAddr, envelope: Envelope) {
    let guard = endpoint.tasks.spawn_guard();
    tokio::spawn(async move {
        let _guard = guard;
        let handler = endpoint.handler.clone();
        handler.handle(&endpoint, remote, envelope).await;
    });
}
