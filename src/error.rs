//! Error taxonomy for the rendezvous core.
//!
//! Mirrors a layered split: I/O errors are fatal only at bind time,
//! decode errors and protocol errors become reply envelopes rather than
//! propagating across the [`crate::endpoint::Handler`] boundary, and
//! cryptographic errors surface through [`CodecError`].

use thiserror::Error;

/// Failures from the cryptographic primitives (key generation, AEAD).
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("insufficient entropy to generate key pair")]
    KeyGeneration,
    #[error("malformed ciphertext")]
    MalformedCiphertext,
    #[error("aead encryption failed")]
    EncryptionFailed,
}

/// Failures decoding or encoding a wire [`crate::message::Envelope`].
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("cannot encrypt with an empty secret")]
    NoSecret,
    #[error("Malformed payload was sent")]
    Malformed,
}

impl From<CryptoError> for CodecError {
    fn from(_: CryptoError) -> Self {
        CodecError::Malformed
    }
}

/// Failures owning or operating the UDP endpoint.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("failed to bind udp socket: {0}")]
    Bind(#[source] std::io::Error),
    #[error("no free port found in the client range")]
    NoFreePort,
    #[error("send queue is closed")]
    QueueClosed,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A protocol-level rejection (the handler's reply carries `error` set).
///
/// These never propagate out of [`crate::endpoint::Handler::handle`] — a
/// handler that hits one of these converts it into an error envelope and
/// enqueues that instead of a success reply.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ProtocolError(pub String);

impl ProtocolError {
    pub fn new(reason: impl Into<String>) -> Self {
        ProtocolError(reason.into())
    }
}
