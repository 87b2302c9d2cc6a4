//! Encrypted block I/O (C2): the only place plaintext crosses into or out
//! of an authenticated-encryption call. Meta records and data blocks share
//! these two operations; they differ only in which [`CryptoContext`] they
//! pass the key manager.

use thiserror::Error;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::crypto::{FileEncryptionKey, KeyManager, KeyManagerError};
use crate::transport::{RpcFd, RpcTransport, TransportError};

#[derive(Error, Debug)]
pub enum BlockIoError {
    #[error(transparent)]
    Key(#[from] KeyManagerError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("short write: wrote {actual} of {expected} bytes")]
    ShortWrite { expected: usize, actual: usize },
}

/// Selects which collaborator call `encrypt_and_write`/`read_and_decrypt`
/// make. For `Meta`, the FEK is an output the key manager extracts from
/// the header; for `Block`, the FEK is an input used as associated key
/// material authenticating the block.
pub enum CryptoContext<'a> {
    Meta { identity: Uuid },
    Block { fek: &'a FileEncryptionKey, index: u64 },
}

/// Encrypts `plaintext` and writes the resulting authenticated ciphertext
/// to `offset`.
pub fn encrypt_and_write(
    transport: &dyn RpcTransport,
    key_manager: &dyn KeyManager,
    fd: RpcFd,
    offset: u64,
    plaintext: &[u8],
    ctx: &CryptoContext<'_>,
) -> Result<(), BlockIoError> {
    let ciphertext = match ctx {
        CryptoContext::Meta { identity } => key_manager.encrypt_meta(plaintext, *identity)?,
        CryptoContext::Block { fek, index } => key_manager.encrypt_block(plaintext, fek, *index)?,
    };
    let n = transport.write_at(fd, &ciphertext, offset)?;
    if n != ciphertext.len() {
        return Err(BlockIoError::ShortWrite {
            expected: ciphertext.len(),
            actual: n,
        });
    }
    trace!(offset, len = ciphertext.len(), "encrypted payload written");
    Ok(())
}

/// Reads `header_len + payload_len` bytes at `offset` and decrypts them.
///
/// A zero-byte read is reported as `Ok(None)` — "slot empty" — per the
/// transport contract: a short read at offset 0 of a slot is not an error.
/// Any other short read is treated as corruption by the caller.
pub fn read_and_decrypt(
    transport: &dyn RpcTransport,
    key_manager: &dyn KeyManager,
    fd: RpcFd,
    offset: u64,
    header_len: usize,
    payload_len: usize,
    ctx: &CryptoContext<'_>,
) -> Result<Option<(Vec<u8>, usize)>, BlockIoError> {
    let total = header_len + payload_len;
    let mut buf = vec![0u8; total];
    let n = transport.read_at(fd, &mut buf, offset)?;
    if n == 0 {
        trace!(offset, "slot empty");
        return Ok(None);
    }
    if n != total {
        warn!(offset, n, total, "short read on encrypted slot");
        return Ok(Some((Vec::new(), n)));
    }
    let plaintext = match ctx {
        CryptoContext::Meta { identity } => key_manager.decrypt_meta(&buf, *identity)?,
        CryptoContext::Block { fek, index } => key_manager.decrypt_block(&buf, fek, *index)?,
    };
    Ok(Some((plaintext, n)))
}
