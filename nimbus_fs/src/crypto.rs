//! Cryptographic primitives used by the key vault and chunk storage.
//!
//! Symmetric material is XChaCha20-Poly1305 with a random 24 byte nonce
//! prefixed to the ciphertext. Asymmetric wrapping is a sealed box: an
//! ephemeral X25519 agreement whose shared secret is run through BLAKE3 to
//! derive a one-off XChaCha20-Poly1305 key.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroize;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

const PRINCIPAL_CONTEXT: &str = "nimbus/principal/x25519";
const SEAL_CONTEXT: &str = "nimbus/seal/xchacha20";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("data too short: expected at least {0} bytes")]
    DataTooShort(usize),
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,
}

/// A 32 byte XChaCha20-Poly1305 key. Wiped on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    pub fn generate() -> Self {
        Self(XChaCha20Poly1305::generate_key(&mut OsRng).into())
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(&self.0.into())
    }
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Encrypts `plaintext`, returning `nonce || ciphertext`.
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = key
        .cipher()
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Reverses [`encrypt`]. Any tampering with nonce, ciphertext or `aad`
/// fails authentication.
pub fn decrypt(key: &SymmetricKey, data: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::DataTooShort(NONCE_LEN + TAG_LEN));
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    key.cipher()
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// An X25519 key pair. The secret half zeroizes itself on drop.
#[derive(Clone)]
pub struct KeyPair {
    pub secret: StaticSecret,
    pub public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let mut arr: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))?;
        let pair = Self::from_secret(StaticSecret::from(arr));
        arr.zeroize();
        Ok(pair)
    }

    /// Derives a principal's unlock pair from its secret (raw key or passphrase).
    pub fn derive_principal(secret: &[u8]) -> Self {
        let mut bytes = blake3::derive_key(PRINCIPAL_CONTEXT, secret);
        let pair = Self::from_secret(StaticSecret::from(bytes));
        bytes.zeroize();
        pair
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public.as_bytes())
            .finish_non_exhaustive()
    }
}

fn seal_key(shared: &[u8; 32], ephemeral: &PublicKey, recipient: &PublicKey) -> SymmetricKey {
    let mut material = [0u8; 96];
    material[..32].copy_from_slice(shared);
    material[32..64].copy_from_slice(ephemeral.as_bytes());
    material[64..].copy_from_slice(recipient.as_bytes());
    let key = SymmetricKey(blake3::derive_key(SEAL_CONTEXT, &material));
    material.zeroize();
    key
}

/// Seals `plaintext` to `recipient`: `ephemeral_public || nonce || ciphertext`.
pub fn seal(recipient: &PublicKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);
    let key = seal_key(shared.as_bytes(), &ephemeral_public, recipient);

    let body = encrypt(&key, plaintext, aad)?;
    let mut out = Vec::with_capacity(KEY_LEN + body.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Opens a box produced by [`seal`] with the recipient's pair.
pub fn open_sealed(recipient: &KeyPair, data: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < KEY_LEN + NONCE_LEN + TAG_LEN {
        return Err(CryptoError::DataTooShort(KEY_LEN + NONCE_LEN + TAG_LEN));
    }
    let (ephemeral, body) = data.split_at(KEY_LEN);
    let ephemeral: [u8; KEY_LEN] = ephemeral
        .try_into()
        .map_err(|_| CryptoError::DataTooShort(KEY_LEN))?;
    let ephemeral = PublicKey::from(ephemeral);
    let shared = recipient.secret.diffie_hellman(&ephemeral);
    let key = seal_key(shared.as_bytes(), &ephemeral, &recipient.public);
    decrypt(&key, body, aad)
}
