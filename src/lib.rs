//! A NAT rendezvous and UDP hole-punching library: Curve25519-keyed peers
//! register with a directory server, get introduced to each other through
//! it, punch through their respective NATs, and exchange AES-256-GCM
//! encrypted messages directly, peer to peer.
//!
//! The three layers, bottom to top:
//! - [`crypto`]/[`message`]: key pairs, the keyed peer-id hash, AEAD, and the
//!   wire envelope codec.
//! - [`endpoint`]: a single UDP socket shared by every virtual connection to
//!   a remote, with cooperative shutdown.
//! - [`peer`]: the [`peer::RendezvousServer`] and [`peer::Client`] facades
//!   built on top of an [`endpoint::Endpoint`] and a role-specific
//!   [`endpoint::Handler`].

pub mod config;
pub mod crypto;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod peer;

pub use config::{EndpointConfig, HolePunchConfig};
pub use error::{CodecError, CryptoError, EndpointError, ProtocolError};
pub use peer::{Client, ClientObserver, RendezvousServer};
