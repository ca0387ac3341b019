//! The wire envelope: a JSON object, optionally wrapped in AES-256-GCM
//! ciphertext, framing every datagram the rendezvous server or a peer
//! endpoint sends or receives.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto;
use crate::error::CodecError;

/// The `type` discriminator on every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Greeting,
    Register,
    Establish,
    Connect,
    Key,
    Message,
}

/// A peer's address on the wire, as carried in an `establish` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEndpoint {
    pub ip: String,
    pub port: u16,
}

impl WireEndpoint {
    pub fn from_socket_addr(addr: std::net::SocketAddr) -> Self {
        WireEndpoint {
            ip: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    pub fn to_socket_addr(&self) -> Option<std::net::SocketAddr> {
        format!("{}:{}", self.ip, self.port).parse().ok()
    }
}

impl std::fmt::Display for WireEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// A registered peer, as stored in the server directory and carried in an
/// `establish` reply's `data` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: String,
    pub username: String,
    pub endpoint: WireEndpoint,
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

/// The request payload of a `register` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

/// The JSON (or AEAD-wrapped JSON) object framing every datagram.
///
/// `encrypt` is an implementation-private flag: it is never serialized, and
/// marks an outbound envelope as requiring AEAD wrapping before it is put
/// on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(rename = "peerID", default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip, default)]
    pub encrypt: bool,
}

impl Envelope {
    pub fn new(kind: MessageType) -> Self {
        Envelope {
            kind,
            peer_id: None,
            error: None,
            data: None,
            encrypt: false,
        }
    }

    pub fn with_peer_id(mut self, id: impl Into<String>) -> Self {
        self.peer_id = Some(id.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn encrypted(mut self) -> Self {
        self.encrypt = true;
        self
    }

    /// Builds an error reply of the given type — used whenever a handler
    /// rejects a request instead of producing a normal reply.
    pub fn error_reply(kind: MessageType, reason: impl Into<String>) -> Self {
        Envelope {
            kind,
            peer_id: None,
            error: Some(reason.into()),
            data: None,
            encrypt: false,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.is_empty())
    }
}

/// Serializes `envelope`, AEAD-wrapping it under `secret` when
/// `envelope.encrypt` is set.
pub fn encode(envelope: &Envelope, secret: Option<&[u8; 32]>) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(envelope).map_err(|_| CodecError::Malformed)?;
    if envelope.encrypt {
        let key = secret.ok_or(CodecError::NoSecret)?;
        Ok(crypto::encrypt(key, &json)?)
    } else {
        Ok(json)
    }
}

/// Tries to parse `bytes` as a plaintext envelope first; if that fails and a
/// `secret` is available, tries AEAD-decrypting then parsing. Implements the
/// "try-plain-then-try-encrypted" policy so an unencrypted greeting can
/// precede secret establishment while later traffic can opaquely be
/// encrypted without a flag on the wire.
pub fn decode(bytes: &[u8], secret: Option<&[u8; 32]>) -> Result<Envelope, CodecError> {
    if let Ok(envelope) = serde_json::from_slice::<Envelope>(bytes) {
        return Ok(envelope);
    }
    if let Some(key) = secret {
        if let Ok(plain) = crypto::decrypt(key, bytes) {
            if let Ok(envelope) = serde_json::from_slice::<Envelope>(&plain) {
                return Ok(envelope);
            }
        }
    }
    Err(CodecError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_round_trip_ignores_encrypt_flag() {
        let envelope = Envelope::new(MessageType::Greeting)
            .with_peer_id("abc")
            .with_data(json!("cGxhY2Vob2xkZXI="));
        let bytes = serde_json::to_vec(&envelope).unwrap();
        let back: Envelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.kind, envelope.kind);
        assert_eq!(back.peer_id, envelope.peer_id);
        assert_eq!(back.data, envelope.data);
        assert!(!back.encrypt);
    }

    #[test]
    fn encode_without_secret_requires_no_encrypt_flag() {
        let envelope = Envelope::new(MessageType::Connect).with_peer_id("abc");
        let bytes = encode(&envelope, None).unwrap();
        let decoded = decode(&bytes, None).unwrap();
        assert_eq!(decoded.kind, MessageType::Connect);
    }

    #[test]
    fn encrypt_without_secret_is_an_error() {
        let envelope = Envelope::new(MessageType::Register).encrypted();
        assert!(matches!(encode(&envelope, None), Err(CodecError::NoSecret)));
    }

    #[test]
    fn encrypted_envelope_round_trips_through_codec() {
        let secret = [3u8; 32];
        let envelope = Envelope::new(MessageType::Register).encrypted();
        let bytes = encode(&envelope, Some(&secret)).unwrap();
        // Plaintext JSON parse must fail — it really is ciphertext on the wire.
        assert!(serde_json::from_slice::<Envelope>(&bytes).is_err());
        let decoded = decode(&bytes, Some(&secret)).unwrap();
        assert_eq!(decoded.kind, MessageType::Register);
    }

    #[test]
    fn decode_falls_back_from_plaintext_attempt_to_decrypt() {
        let secret = [9u8; 32];
        let envelope = Envelope::new(MessageType::Establish)
            .with_data(json!("deadbeef"))
            .encrypted();
        let bytes = encode(&envelope, Some(&secret)).unwrap();
        let decoded = decode(&bytes, Some(&secret)).unwrap();
        assert_eq!(decoded.data, Some(json!("deadbeef")));
    }

    #[test]
    fn decode_with_no_secret_and_bad_json_is_malformed() {
        assert!(matches!(decode(b"not json", None), Err(CodecError::Malformed)));
    }

    #[test]
    fn peer_record_serializes_with_wire_field_names() {
        let record = PeerRecord {
            id: "abc".into(),
            username: "alice".into(),
            endpoint: WireEndpoint { ip: "127.0.0.1".into(), port: 10001 },
            public_key: "cGs=".into(),
        };
        let v = serde_json::to_value(&record).unwrap();
        assert_eq!(v["publicKey"], json!("cGs="));
        assert_eq!(v["endpoint"]["ip"], json!("127.0.0.1"));
    }
}
