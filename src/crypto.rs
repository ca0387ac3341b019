//! Cryptographic primitives: Curve25519 key pairs, ECDH, the keyed peer-id
//! hash, and AES-256-GCM encrypt/decrypt.
//!
//! The ECDH output is used directly as the AES-256 key with no KDF applied
//! — a deliberate simplification inherited from the source design, not a
//! hardening gap to fix here. A production-hardened variant would run the
//! shared secret through HKDF-SHA256 with a domain label first.

use aes_gcm::aead::{Aead, KeyInit, OsRng as AeadOsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::Sha512_256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::CryptoError;

/// Domain tag used as the HMAC key when deriving a peer id from a public key.
const PEER_ID_TAG: &[u8] = b"Hashing client public key for client id";

const NONCE_LEN: usize = 12;

/// A long-lived Curve25519 key pair, held for the process lifetime.
///
/// No forward secrecy is provided: the private key is generated once at
/// startup and reused for every ECDH the process performs.
pub struct KeyPair {
    private: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generates a fresh key pair from the OS CSPRNG.
    ///
    /// Fails only if the system RNG cannot supply entropy.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|_| CryptoError::KeyGeneration)?;
        // `StaticSecret::from` clamps the scalar (clears bit 0..2 and 255,
        // sets bit 254) the same way manual byte manipulation would.
        let private = StaticSecret::from(bytes);
        let public = PublicKey::from(&private);
        Ok(Self { private, public })
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Derives the shared secret with `their_public`, used directly as the
    /// AES-256 key for this pair of endpoints.
    pub fn shared_secret(&self, their_public: &PublicKey) -> [u8; 32] {
        self.private.diffie_hellman(their_public).to_bytes()
    }
}

/// Decodes a standard-base64 32-byte Curve25519 public key.
pub fn decode_public_key(b64: &str) -> Option<PublicKey> {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    let raw = STANDARD.decode(b64).ok()?;
    let bytes: [u8; 32] = raw.try_into().ok()?;
    Some(PublicKey::from(bytes))
}

/// Encodes a public key as standard base64, as carried in `greeting`/`key`
/// envelope payloads.
pub fn encode_public_key(key: &PublicKey) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    STANDARD.encode(key.as_bytes())
}

/// Derives the 64-hex-character peer id: HMAC-SHA-512/256 over the public
/// key bytes, keyed by [`PEER_ID_TAG`].
pub fn peer_id(public: &PublicKey) -> String {
    type HmacSha512_256 = Hmac<Sha512_256>;
    let mut mac = <HmacSha512_256 as Mac>::new_from_slice(PEER_ID_TAG)
        .expect("HMAC accepts a key of any length");
    mac.update(public.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Encrypts `plaintext` under `key`, producing `nonce(12) || ciphertext || tag(16)`.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Aes256Gcm::generate_nonce(&mut AeadOsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts a `nonce(12) || ciphertext || tag(16)` payload under `key`.
pub fn decrypt(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_LEN {
        return Err(CryptoError::MalformedCiphertext);
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::MalformedCiphertext)
}

/// Picks a port uniformly at random in `[10000, 65535)` using the OS CSPRNG
/// — the client socket binding range.
pub fn random_client_port() -> u16 {
    const LOW: u32 = 10_000;
    const HIGH: u32 = 65_535;
    10_000 + (OsRng.next_u32() % (HIGH - LOW)) as u16
}
