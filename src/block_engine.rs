//! Block engine (C4): read a logical block; out-of-place write of a
//! logical block with backup-bit toggle.

use thiserror::Error;
use tracing::instrument;

use crate::block_io::{BlockIoError, CryptoContext, encrypt_and_write, read_and_decrypt};
use crate::config::BLOCK_SIZE;
use crate::crypto::{FileEncryptionKey, KeyManager};
use crate::layout::Layout;
use crate::meta::MetaInfo;
use crate::transport::{RpcFd, RpcTransport};

#[derive(Error, Debug)]
pub enum BlockEngineError {
    #[error(transparent)]
    BlockIo(#[from] BlockIoError),
    #[error("decrypted block has {actual} bytes, expected {BLOCK_SIZE}")]
    WrongSize { actual: usize },
}

pub struct BlockEngine<'a> {
    key_manager: &'a dyn KeyManager,
    transport: &'a dyn RpcTransport,
    layout: &'a Layout,
}

impl<'a> BlockEngine<'a> {
    #[must_use]
    pub fn new(key_manager: &'a dyn KeyManager, transport: &'a dyn RpcTransport, layout: &'a Layout) -> Self {
        Self {
            key_manager,
            transport,
            layout,
        }
    }

    /// Reads logical block `n` of the active meta. A never-written slot
    /// (zero-byte read) yields an all-zero block, not an error.
    #[instrument(level = "trace", skip(self, fd, meta, fek))]
    pub fn read_block(&self, fd: RpcFd, meta: &MetaInfo, n: u64, fek: &FileEncryptionKey) -> Result<[u8; BLOCK_SIZE], BlockEngineError> {
        let offset = self.layout.block_offset(meta, n, true);
        let result = read_and_decrypt(
            self.transport,
            self.key_manager,
            fd,
            offset,
            self.layout.block_header_size(),
            BLOCK_SIZE,
            &CryptoContext::Block { fek, index: n },
        )?;
        match result {
            None => Ok([0u8; BLOCK_SIZE]),
            Some((_, read_len)) if read_len != self.layout.s_block() => {
                Err(BlockEngineError::WrongSize { actual: read_len })
            }
            Some((plaintext, _)) if plaintext.len() != BLOCK_SIZE => {
                Err(BlockEngineError::WrongSize { actual: plaintext.len() })
            }
            Some((plaintext, _)) => {
                let mut block = [0u8; BLOCK_SIZE];
                block.copy_from_slice(&plaintext);
                Ok(block)
            }
        }
    }

    /// Out-of-place write of logical block `n` into `new_meta`'s shadow
    /// slot. On success toggles `new_meta`'s bit for block `n` so the
    /// slot just written becomes active once `new_meta` is committed. On
    /// failure `new_meta` is left untouched.
    #[instrument(level = "trace", skip(self, fd, new_meta, data, fek))]
    pub fn write_block(
        &self,
        fd: RpcFd,
        new_meta: &mut MetaInfo,
        n: u64,
        data: &[u8; BLOCK_SIZE],
        fek: &FileEncryptionKey,
    ) -> Result<(), BlockEngineError> {
        let offset = self.layout.block_offset(new_meta, n, false);
        encrypt_and_write(
            self.transport,
            self.key_manager,
            fd,
            offset,
            data,
            &CryptoContext::Block { fek, index: n },
        )?;
        new_meta.toggle_bit_n(n);
        Ok(())
    }
}
