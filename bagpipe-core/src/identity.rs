//! Control-session identity and crypto: keypairs, key files, session keys, frame encryption.

use chacha20poly1305::aead::{Aead, KeyInit};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Length of the type tag in front of the key in `client` / `server.pub` files.
pub const KEY_FILE_PREFIX_LEN: usize = 4;
const KEY_FILE_TAG: [u8; KEY_FILE_PREFIX_LEN] = *b"x255";

/// Direction labels mixed into session key derivation.
pub const CLIENT_TO_DAEMON: &[u8] = b"client->daemon";
pub const DAEMON_TO_CLIENT: &[u8] = b"daemon->client";

/// X25519 public key. Serialized as hex.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "hex_32")] [u8; 32]);

mod hex_32 {
    use serde::{Deserialize, Deserializer, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(v))
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s: String = Deserialize::deserialize(d)?;
        let buf = hex::decode(s).map_err(serde::de::Error::custom)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }

    /// Parse `server.pub`: 4-byte type tag followed by the 32-byte key.
    pub fn from_key_file(data: &[u8]) -> Result<Self, KeyFileError> {
        key_file_body(data).map(PublicKey)
    }

    pub fn to_key_file(&self) -> Vec<u8> {
        key_file(&self.0)
    }
}

/// X25519 keypair. The secret never leaves this type except through `to_key_file`.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    /// Parse the `client` key file: 4-byte type tag followed by the 32-byte secret.
    pub fn from_key_file(data: &[u8]) -> Result<Self, KeyFileError> {
        key_file_body(data).map(Self::from_secret_bytes)
    }

    pub fn to_key_file(&self) -> Vec<u8> {
        key_file(&self.secret.to_bytes())
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

fn key_file(key: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(KEY_FILE_PREFIX_LEN + 32);
    out.extend_from_slice(&KEY_FILE_TAG);
    out.extend_from_slice(key);
    out
}

fn key_file_body(data: &[u8]) -> Result<[u8; 32], KeyFileError> {
    if data.len() != KEY_FILE_PREFIX_LEN + 32 {
        return Err(KeyFileError::Length(data.len()));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&data[KEY_FILE_PREFIX_LEN..]);
    Ok(key)
}

#[derive(Debug, thiserror::Error)]
pub enum KeyFileError {
    #[error("key file must be 36 bytes, got {0}")]
    Length(usize),
}

/// Derive a 32-byte ChaCha20-Poly1305 key for one direction of a session.
pub fn derive_session_key(shared_secret: &[u8; 32], direction: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"bagpipe-session-v1");
    hasher.update(direction);
    hasher.update(shared_secret);
    hasher.finalize().into()
}

/// Frame encryption: ChaCha20-Poly1305. Nonce: 96-bit counter per direction; never reuse.
pub fn encrypt_wire(
    key: &[u8; 32],
    nonce: u64,
    plaintext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| WireCryptoError::Key)?;
    cipher
        .encrypt(&nonce_from_counter(nonce), plaintext)
        .map_err(|_| WireCryptoError::Encrypt)
}

pub fn decrypt_wire(
    key: &[u8; 32],
    nonce: u64,
    ciphertext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| WireCryptoError::Key)?;
    cipher
        .decrypt(&nonce_from_counter(nonce), ciphertext)
        .map_err(|_| WireCryptoError::Decrypt)
}

fn nonce_from_counter(counter: u64) -> chacha20poly1305::Nonce {
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[4..12].copy_from_slice(&counter.to_le_bytes());
    chacha20poly1305::Nonce::from(nonce_bytes)
}

#[derive(Debug, thiserror::Error)]
pub enum WireCryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_exchange_symmetric() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert_eq!(a.shared_secret(b.public_key()), b.shared_secret(a.public_key()));
    }

    #[test]
    fn key_files_roundtrip() {
        let kp = Keypair::generate();
        let restored = Keypair::from_key_file(&kp.to_key_file()).unwrap();
        assert_eq!(restored.public_key(), kp.public_key());

        let public = PublicKey::from_key_file(&kp.public_key().to_key_file()).unwrap();
        assert_eq!(&public, kp.public_key());

        assert!(matches!(
            PublicKey::from_key_file(&[0u8; 20]),
            Err(KeyFileError::Length(20))
        ));
    }

    #[test]
    fn directions_get_distinct_keys() {
        let secret = [7u8; 32];
        assert_ne!(
            derive_session_key(&secret, CLIENT_TO_DAEMON),
            derive_session_key(&secret, DAEMON_TO_CLIENT)
        );
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        use rand::RngCore;
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        let cipher = encrypt_wire(&key, 3, b"getTorrents").unwrap();
        assert_eq!(decrypt_wire(&key, 3, &cipher).unwrap(), b"getTorrents");
        assert!(decrypt_wire(&key, 4, &cipher).is_err());
    }

    #[test]
    fn public_key_serializes_as_hex() {
        let key = PublicKey::from_bytes([0xab; 32]);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));
        assert_eq!(serde_json::from_str::<PublicKey>(&json).unwrap(), key);
    }
}
