//! Per-remote virtual connection state and the registry that owns it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use tokio::sync::Mutex;

/// Per-remote bookkeeping over the connectionless UDP socket.
///
/// The shared secret is written at most once per connection's lifetime —
/// modeled with a [`OnceLock`] rather than a `Mutex<Option<_>>` so "never
/// overwritten" is an API-level guarantee rather than a convention callers
/// must honor.
pub struct VirtualConnection {
    pub remote: SocketAddr,
    secret: OnceLock<[u8; 32]>,
}

impl VirtualConnection {
    fn new(remote: SocketAddr) -> Self {
        VirtualConnection {
            remote,
            secret: OnceLock::new(),
        }
    }

    pub fn secret(&self) -> Option<&[u8; 32]> {
        self.secret.get()
    }

    /// Sets the shared secret if it hasn't been set yet. Returns `false`
    /// (and leaves the existing secret untouched) if one was already set —
    /// callers that don't care (e.g. a duplicate `greeting`) should ignore
    /// the return value.
    pub fn set_secret(&self, secret: [u8; 32]) -> bool {
        self.secret.set(secret).is_ok()
    }
}

/// The endpoint's map from remote address to virtual connection.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<SocketAddr, Arc<VirtualConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing connection for `remote`, or creates and
    /// registers a fresh one with no shared secret.
    pub async fn get_or_create(&self, remote: SocketAddr) -> Arc<VirtualConnection> {
        let mut guard = self.connections.lock().await;
        guard
            .entry(remote)
            .or_insert_with(|| Arc::new(VirtualConnection::new(remote)))
            .clone()
    }

    pub async fn get(&self, remote: SocketAddr) -> Option<Arc<VirtualConnection>> {
        self.connections.lock().await.get(&remote).cloned()
    }

    pub async fn remove(&self, remote: SocketAddr) {
        self.connections.lock().await.remove(&remote);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_returns_same_connection_for_same_address() {
        let registry = ConnectionRegistry::new();
        let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let a = registry.get_or_create(addr).await;
        let b = registry.get_or_create(addr).await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn secret_cannot_be_overwritten() {
        let conn = VirtualConnection::new("127.0.0.1:9001".parse().unwrap());
        assert!(conn.set_secret([1u8; 32]));
        assert!(!conn.set_secret([2u8; 32]));
        assert_eq!(conn.secret(), Some(&[1u8; 32]));
    }

    #[tokio::test]
    async fn remove_drops_the_connection() {
        let registry = ConnectionRegistry::new();
        let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let first = registry.get_or_create(addr).await;
        registry.remove(addr).await;
        let second = registry.get_or_create(addr).await;
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
