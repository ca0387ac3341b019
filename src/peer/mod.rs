//! The peer state machine: a server role (rendezvous directory + broker)
//! and a client role (greeting → registration → establishment →
//! hole-punch → messaging), both implemented as [`crate::endpoint::Handler`]s
//! over the same [`crate::endpoint::Endpoint`].

pub mod client;
pub mod server;

pub use client::{Client, ClientObserver};
pub use server::RendezvousServer;
