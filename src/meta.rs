//! Meta manager (C3): create/read/write meta records, counter
//! read/write, and the two-phase commit that is this engine's
//! linearization point.

use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::block_io::{BlockIoError, CryptoContext, encrypt_and_write, read_and_decrypt};
use crate::config::EngineConfig;
use crate::crypto::{FileEncryptionKey, KeyManager, KeyManagerError};
use crate::layout::{COUNTER_OFFSET, COUNTER_SIZE, Layout};
use crate::transport::{RpcFd, RpcTransport, TransportError};

#[derive(Error, Debug)]
pub enum MetaError {
    #[error("counter read returned {actual} bytes, expected {COUNTER_SIZE}")]
    TruncatedCounter { actual: usize },
    #[error("corrupt meta record: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Key(#[from] KeyManagerError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    BlockIo(#[from] BlockIoError),
}

/// Plaintext semantics of a meta record. Always handled by value: a
/// candidate is built from a clone of the committed meta, mutated, and
/// either committed (replacing the handle's copy) or discarded.
#[derive(Debug)]
pub struct MetaInfo {
    pub length: u64,
    pub counter: u32,
    pub fek: FileEncryptionKey,
    /// One bit per logical block; bit *n* selects which of the two
    /// physical slots for block *n* currently holds the active version.
    pub backup_version_table: Vec<u8>,
}

impl Clone for MetaInfo {
    fn clone(&self) -> Self {
        Self {
            length: self.length,
            counter: self.counter,
            fek: FileEncryptionKey::from_bytes(*self.fek.as_bytes()),
            backup_version_table: self.backup_version_table.clone(),
        }
    }
}

impl MetaInfo {
    #[must_use]
    pub fn bit_n(&self, n: u64) -> bool {
        let byte = self.backup_version_table[(n / 8) as usize];
        (byte >> (n % 8)) & 1 == 1
    }

    pub fn toggle_bit_n(&mut self, n: u64) {
        self.backup_version_table[(n / 8) as usize] ^= 1 << (n % 8);
    }

    fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 4 + 32 + 8 + self.backup_version_table.len());
        out.extend_from_slice(&self.length.to_le_bytes());
        out.extend_from_slice(&self.counter.to_le_bytes());
        out.extend_from_slice(self.fek.as_bytes());
        out.extend_from_slice(&[0u8; 8]); // reserved, opaque to this engine
        out.extend_from_slice(&self.backup_version_table);
        out
    }

    fn deserialize(bytes: &[u8], expected_bitmap_len: usize) -> Result<Self, MetaError> {
        let expected = 8 + 4 + 32 + 8 + expected_bitmap_len;
        if bytes.len() != expected {
            return Err(MetaError::Corrupt(format!(
                "meta record has {} bytes, expected {expected}",
                bytes.len()
            )));
        }
        let length = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let counter = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let fek_bytes: [u8; 32] = bytes[12..44].try_into().unwrap();
        let backup_version_table = bytes[52..].to_vec();
        Ok(Self {
            length,
            counter,
            fek: FileEncryptionKey::from_bytes(fek_bytes),
            backup_version_table,
        })
    }
}

/// In-memory state an open handle owns: the committed meta snapshot and
/// the on-disk counter it was read under.
#[derive(Debug)]
pub struct CommittedMeta {
    pub meta: MetaInfo,
    pub meta_counter: u32,
}

pub struct MetaManager<'a> {
    key_manager: &'a dyn KeyManager,
    transport: &'a dyn RpcTransport,
    config: &'a EngineConfig,
    layout: Layout,
}

impl<'a> MetaManager<'a> {
    #[must_use]
    pub fn new(key_manager: &'a dyn KeyManager, transport: &'a dyn RpcTransport, config: &'a EngineConfig) -> Self {
        let layout = Layout::new(config, key_manager.meta_header_size(), key_manager.block_header_size());
        Self {
            key_manager,
            transport,
            config,
            layout,
        }
    }

    #[must_use]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Creates a brand new meta record: all blocks unwritten
    /// (`backup_version_table` all-ones), `length == 0`, a freshly
    /// generated FEK wrapped under `identity`. Writes it to slot 0 and
    /// commits counter 0.
    #[instrument(level = "debug", skip(self, fd))]
    pub fn create(&self, fd: RpcFd, identity: Uuid) -> Result<CommittedMeta, MetaError> {
        let fek = self.key_manager.generate_fek()?;
        let meta = MetaInfo {
            length: 0,
            counter: 0,
            fek,
            backup_version_table: vec![0xFFu8; self.config.bitmap_len_bytes()],
        };

        let plaintext = meta.serialize();
        // shadow of an initial counter of 0 is slot 0
        let offset = self.layout.meta_offset(0, false);
        encrypt_and_write(
            self.transport,
            self.key_manager,
            fd,
            offset,
            &plaintext,
            &CryptoContext::Meta { identity },
        )?;
        self.write_counter(fd, 0)?;

        debug!("created new object meta");
        Ok(CommittedMeta { meta, meta_counter: 0 })
    }

    /// Opens an existing object: reads the counter, then the active meta
    /// slot it selects.
    #[instrument(level = "debug", skip(self, fd))]
    pub fn open(&self, fd: RpcFd, identity: Uuid) -> Result<CommittedMeta, MetaError> {
        let meta_counter = self.read_counter(fd)?;
        let offset = self.layout.meta_offset(meta_counter, true);
        let result = read_and_decrypt(
            self.transport,
            self.key_manager,
            fd,
            offset,
            self.layout.meta_header_size(),
            self.layout.meta_info_size(),
            &CryptoContext::Meta { identity },
        )?;
        let (plaintext, _) = match result {
            None => return Err(MetaError::Corrupt("active meta slot is empty".into())),
            Some((_, n)) if n != self.layout.s_meta() => {
                warn!(n, expected = self.layout.s_meta(), "short read on active meta slot");
                return Err(MetaError::Corrupt("active meta slot is short".into()));
            }
            Some(pair) => pair,
        };
        let meta = MetaInfo::deserialize(&plaintext, self.config.bitmap_len_bytes())?;
        if meta.counter != meta_counter {
            return Err(MetaError::Corrupt(format!(
                "meta record counter {} does not match on-disk counter {meta_counter}",
                meta.counter
            )));
        }
        Ok(CommittedMeta { meta, meta_counter })
    }

    /// Two-phase commit of `new_meta`:
    /// 1. stamp `new_meta.counter = current_counter + 1`,
    /// 2. write it to the shadow meta slot,
    /// 3. write the 4-byte counter — the linearization point.
    ///
    /// If step 2 fails the on-disk counter is untouched and the caller's
    /// prior committed state remains authoritative.
    #[instrument(level = "debug", skip(self, fd, new_meta))]
    pub fn commit(&self, fd: RpcFd, current_counter: u32, mut new_meta: MetaInfo, identity: Uuid) -> Result<CommittedMeta, MetaError> {
        let new_counter = current_counter.wrapping_add(1);
        new_meta.counter = new_counter;

        let plaintext = new_meta.serialize();
        let shadow_offset = self.layout.meta_offset(current_counter, false);
        encrypt_and_write(
            self.transport,
            self.key_manager,
            fd,
            shadow_offset,
            &plaintext,
            &CryptoContext::Meta { identity },
        )?;

        self.write_counter(fd, new_counter)?;
        debug!(new_counter, "committed meta");
        Ok(CommittedMeta {
            meta: new_meta,
            meta_counter: new_counter,
        })
    }

    fn read_counter(&self, fd: RpcFd) -> Result<u32, MetaError> {
        let mut buf = [0u8; COUNTER_SIZE as usize];
        let n = self.transport.read_at(fd, &mut buf, COUNTER_OFFSET)?;
        if n != buf.len() {
            return Err(MetaError::TruncatedCounter { actual: n });
        }
        Ok(u32::from_le_bytes(buf))
    }

    fn write_counter(&self, fd: RpcFd, counter: u32) -> Result<(), MetaError> {
        let bytes = counter.to_le_bytes();
        let n = self.transport.write_at(fd, &bytes, COUNTER_OFFSET)?;
        if n != bytes.len() {
            return Err(MetaError::Corrupt("short write on counter".into()));
        }
        Ok(())
    }
}
