//! The key-management collaborator (K).
//!
//! Its internals are explicitly out of scope for the storage engine: the
//! engine only ever talks to it through the [`KeyManager`] trait, so a real
//! device binds a hardware-backed implementation without touching anything
//! downstream. [`AeadKeyManager`] is the default, software-only
//! implementation used when no such hardware collaborator is available.

use aead::Payload;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use thiserror::Error;
use tracing::{instrument, trace, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
pub const FEK_SIZE: usize = 32;

#[derive(Error, Debug)]
pub enum KeyManagerError {
    #[error("authentication tag mismatch")]
    MacInvalid,
    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("key derivation failed")]
    KeyDerivation,
}

/// Per-object File Encryption Key.
///
/// Debug redacts the key material, matching the convention used for other
/// key-bearing structs in this crate: accidental `{:?}` logging of a header
/// or key must never leak key bytes.
pub struct FileEncryptionKey(Zeroizing<[u8; FEK_SIZE]>);

impl FileEncryptionKey {
    #[must_use]
    pub fn from_bytes(bytes: [u8; FEK_SIZE]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; FEK_SIZE] {
        &self.0
    }
}

impl fmt::Debug for FileEncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FileEncryptionKey").field(&"[REDACTED]").finish()
    }
}

/// Required operations of the key-manager collaborator, fixed to the
/// concrete object-safe shape used by this engine.
pub trait KeyManager: Send + Sync {
    /// Authenticated-encryption header size for meta records, in bytes.
    fn meta_header_size(&self) -> usize;
    /// Authenticated-encryption header size for blocks, in bytes.
    fn block_header_size(&self) -> usize;

    fn generate_fek(&self) -> Result<FileEncryptionKey, KeyManagerError>;

    /// Produces a self-describing authenticated ciphertext of
    /// `meta_header_size() + plaintext.len()` bytes, wrapped under `identity`.
    fn encrypt_meta(&self, plaintext: &[u8], identity: Uuid) -> Result<Vec<u8>, KeyManagerError>;

    /// Inverse of [`KeyManager::encrypt_meta`]. Fails with
    /// [`KeyManagerError::MacInvalid`] on authentication failure.
    fn decrypt_meta(&self, ciphertext: &[u8], identity: Uuid) -> Result<Vec<u8>, KeyManagerError>;

    fn encrypt_block(
        &self,
        plaintext: &[u8],
        fek: &FileEncryptionKey,
        block_index: u64,
    ) -> Result<Vec<u8>, KeyManagerError>;

    fn decrypt_block(
        &self,
        ciphertext: &[u8],
        fek: &FileEncryptionKey,
        block_index: u64,
    ) -> Result<Vec<u8>, KeyManagerError>;
}

/// Default software key manager: AES-256-GCM for both meta and block
/// payloads, with the block index folded into the AEAD associated data so
/// ciphertext from one logical block can never be replayed into another
/// block's slot.
///
/// Meta records are wrapped under a key derived from the caller's session
/// identity via HKDF-SHA256, standing in for the real wrap-under-identity
/// primitive a hardware key manager would provide.
pub struct AeadKeyManager {
    device_secret: Zeroizing<[u8; 32]>,
}

impl AeadKeyManager {
    #[must_use]
    pub fn new(device_secret: [u8; 32]) -> Self {
        Self {
            device_secret: Zeroizing::new(device_secret),
        }
    }

    #[must_use]
    pub fn random() -> Self {
        let mut secret = [0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        Self::new(secret)
    }

    fn identity_key(&self, identity: Uuid) -> Result<Zeroizing<[u8; 32]>, KeyManagerError> {
        let hk = Hkdf::<Sha256>::new(Some(identity.as_bytes()), &self.device_secret[..]);
        let mut okm = Zeroizing::new([0u8; 32]);
        hk.expand(b"secure-object-store/meta-wrap/v1", &mut okm[..])
            .map_err(|_| KeyManagerError::KeyDerivation)?;
        Ok(okm)
    }
}

fn aead_encrypt(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, KeyManagerError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| KeyManagerError::KeyDerivation)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn aead_decrypt(key: &[u8; 32], wire: &[u8], aad: &[u8]) -> Result<Vec<u8>, KeyManagerError> {
    if wire.len() < NONCE_SIZE + TAG_SIZE {
        return Err(KeyManagerError::TooShort {
            expected: NONCE_SIZE + TAG_SIZE,
            actual: wire.len(),
        });
    }
    let nonce = Nonce::from_slice(&wire[..NONCE_SIZE]);
    let ciphertext = &wire[NONCE_SIZE..];
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad })
        .map_err(|_| {
            warn!("AEAD authentication failed");
            KeyManagerError::MacInvalid
        })
}

impl KeyManager for AeadKeyManager {
    fn meta_header_size(&self) -> usize {
        NONCE_SIZE + TAG_SIZE
    }

    fn block_header_size(&self) -> usize {
        NONCE_SIZE + TAG_SIZE
    }

    fn generate_fek(&self) -> Result<FileEncryptionKey, KeyManagerError> {
        let mut bytes = [0u8; FEK_SIZE];
        rand::rng().fill_bytes(&mut bytes);
        Ok(FileEncryptionKey::from_bytes(bytes))
    }

    #[instrument(level = "debug", skip(self, plaintext), fields(len = plaintext.len()))]
    fn encrypt_meta(&self, plaintext: &[u8], identity: Uuid) -> Result<Vec<u8>, KeyManagerError> {
        let key = self.identity_key(identity)?;
        trace!("encrypting meta record");
        aead_encrypt(&key, plaintext, identity.as_bytes())
    }

    #[instrument(level = "debug", skip(self, ciphertext), fields(len = ciphertext.len()))]
    fn decrypt_meta(&self, ciphertext: &[u8], identity: Uuid) -> Result<Vec<u8>, KeyManagerError> {
        let key = self.identity_key(identity)?;
        aead_decrypt(&key, ciphertext, identity.as_bytes())
    }

    #[instrument(level = "debug", skip(self, plaintext, fek), fields(block_index))]
    fn encrypt_block(
        &self,
        plaintext: &[u8],
        fek: &FileEncryptionKey,
        block_index: u64,
    ) -> Result<Vec<u8>, KeyManagerError> {
        aead_encrypt(fek.as_bytes(), plaintext, &block_index.to_le_bytes())
    }

    #[instrument(level = "debug", skip(self, ciphertext, fek), fields(block_index))]
    fn decrypt_block(
        &self,
        ciphertext: &[u8],
        fek: &FileEncryptionKey,
        block_index: u64,
    ) -> Result<Vec<u8>, KeyManagerError> {
        aead_decrypt(fek.as_bytes(), ciphertext, &block_index.to_le_bytes())
    }
}
