//! File façade (C6): handle lifecycle, seek semantics, truncate, rename/
//! remove/fsync passthroughs, and the operation table itself.

use tracing::{debug, instrument};
use uuid::Uuid;

use crate::block_engine::BlockEngine;
use crate::block_io::BlockIoError;
use crate::config::EngineConfig;
use crate::crypto::{KeyManager, KeyManagerError};
use crate::error::{FsError, FsResult};
use crate::layout::Layout;
use crate::meta::{MetaError, MetaInfo, MetaManager};
use crate::range_io::{RangeError, read_range, write_range};
use crate::session::SessionAccessor;
use crate::transport::{RpcFd, RpcTransport};

impl From<MetaError> for FsError {
    fn from(err: MetaError) -> Self {
        match err {
            MetaError::Key(KeyManagerError::MacInvalid)
            | MetaError::BlockIo(BlockIoError::Key(KeyManagerError::MacInvalid)) => {
                FsError::CorruptObject("authentication tag mismatch".into())
            }
            MetaError::TruncatedCounter { .. } => {
                FsError::CorruptObject("meta counter has the wrong size".into())
            }
            MetaError::Corrupt(reason) => FsError::CorruptObject(reason),
            MetaError::Key(other) => FsError::CorruptObject(other.to_string()),
            MetaError::Transport(t) => FsError::from(t),
            MetaError::BlockIo(BlockIoError::Transport(t)) => FsError::from(t),
            MetaError::BlockIo(other) => FsError::CorruptObject(other.to_string()),
        }
    }
}

impl From<RangeError> for FsError {
    fn from(err: RangeError) -> Self {
        match err {
            RangeError::Block(block_err) => FsError::from_key_manager_or_transport(block_err),
        }
    }
}

impl FsError {
    fn from_key_manager_or_transport(err: crate::block_engine::BlockEngineError) -> Self {
        use crate::block_engine::BlockEngineError;
        match err {
            BlockEngineError::BlockIo(BlockIoError::Key(KeyManagerError::MacInvalid)) => {
                FsError::CorruptObject("authentication tag mismatch on block".into())
            }
            BlockEngineError::BlockIo(BlockIoError::Transport(t)) => FsError::from(t),
            BlockEngineError::BlockIo(other) => FsError::CorruptObject(other.to_string()),
            BlockEngineError::WrongSize { actual } => {
                FsError::CorruptObject(format!("block slot has wrong size: {actual}"))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// An open handle: the caller-owned state described by the data model —
/// a meta snapshot, a cursor, and the RPC descriptor. Not `Sync`; callers
/// serialize operations against a given handle themselves.
#[derive(Debug)]
pub struct SecureFile {
    fd: RpcFd,
    path: String,
    meta: MetaInfo,
    meta_counter: u32,
    cursor: u64,
}

impl SecureFile {
    #[must_use]
    pub fn position(&self) -> u64 {
        self.cursor
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.meta.length
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.meta.length == 0
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// The abstract capability this engine implements: a record of
/// {open, create, close, read, write, seek, truncate, rename, remove,
/// fsync}. Directory operations are deliberately absent rather than
/// represented as a "not supported" null entry.
pub trait StorageBackend {
    fn create(&self, path: &str) -> FsResult<SecureFile>;
    fn open(&self, path: &str) -> FsResult<SecureFile>;
    fn close(&self, handle: SecureFile) -> FsResult<()>;
    fn read(&self, handle: &mut SecureFile, buf: &mut [u8]) -> FsResult<usize>;
    fn write(&self, handle: &mut SecureFile, buf: &[u8]) -> FsResult<()>;
    fn seek(&self, handle: &mut SecureFile, offset: i64, whence: Whence) -> FsResult<u64>;
    fn truncate(&self, handle: &mut SecureFile, new_len: u64) -> FsResult<()>;
    fn rename(&self, old: &str, new: &str, overwrite: bool) -> FsResult<()>;
    fn remove(&self, path: &str) -> FsResult<()>;
    fn fsync(&self, handle: &SecureFile) -> FsResult<()>;
}

/// Storage-type identifier published to higher layers. The RPMB-backed
/// variant shifts the high byte by one, purely as a namespace flag.
pub const STORAGE_TYPE_ID: u32 = 0x5345_0001; // "SE" + class 1 (REE filesystem)
pub const STORAGE_TYPE_ID_RPMB: u32 = STORAGE_TYPE_ID | (1 << 24);

/// Concrete engine wiring the three external collaborators (K, R, S) to
/// the container protocol. One instance serves every object path under
/// its transport; handles returned by `open`/`create` are independent of
/// each other as long as they name different backing files.
pub struct SecureStorageEngine {
    key_manager: Box<dyn KeyManager>,
    transport: Box<dyn RpcTransport>,
    session: Box<dyn SessionAccessor>,
    config: EngineConfig,
}

impl SecureStorageEngine {
    #[must_use]
    pub fn new(
        key_manager: Box<dyn KeyManager>,
        transport: Box<dyn RpcTransport>,
        session: Box<dyn SessionAccessor>,
        config: EngineConfig,
    ) -> Self {
        Self {
            key_manager,
            transport,
            session,
            config,
        }
    }

    fn layout(&self) -> Layout {
        Layout::new(&self.config, self.key_manager.meta_header_size(), self.key_manager.block_header_size())
    }

    fn meta_manager(&self) -> MetaManager<'_> {
        MetaManager::new(self.key_manager.as_ref(), self.transport.as_ref(), &self.config)
    }

    fn identity(&self) -> Uuid {
        self.session.current_session()
    }

    fn validate_path(&self, path: &str) -> FsResult<()> {
        if path.is_empty() {
            return Err(FsError::BadParameters("empty path".into()));
        }
        if path.len() + 1 > self.config.name_max {
            return Err(FsError::BadParameters(format!(
                "path length {} exceeds name_max {}",
                path.len(),
                self.config.name_max
            )));
        }
        Ok(())
    }

    /// Internal truncate-extend used by `write` when the cursor sits past
    /// the current length: zero-fills `[length, new_len)` and commits its
    /// own meta, independently of the caller's pending data write.
    fn extend_to(&self, fd: RpcFd, handle: &mut SecureFile, new_len: u64) -> FsResult<()> {
        let layout = self.layout();
        let engine = BlockEngine::new(self.key_manager.as_ref(), self.transport.as_ref(), &layout);
        let mut candidate = handle.meta.clone();
        let old_len = candidate.length;
        write_range(&engine, fd, &mut candidate, old_len, None, (new_len - old_len) as usize, &handle.meta.fek)?;
        candidate.length = new_len;
        let committed = self.meta_manager().commit(fd, handle.meta_counter, candidate, self.identity())?;
        handle.meta = committed.meta;
        handle.meta_counter = committed.meta_counter;
        Ok(())
    }
}

impl StorageBackend for SecureStorageEngine {
    #[instrument(level = "debug", skip(self))]
    fn create(&self, path: &str) -> FsResult<SecureFile> {
        self.validate_path(path)?;
        let fd = self.transport.open(path, true)?;
        match self.meta_manager().create(fd, self.identity()) {
            Ok(committed) => {
                debug!(path, "created secure object");
                Ok(SecureFile {
                    fd,
                    path: path.to_string(),
                    meta: committed.meta,
                    meta_counter: committed.meta_counter,
                    cursor: 0,
                })
            }
            Err(e) => {
                let _ = self.transport.close(fd);
                let _ = self.transport.remove(path);
                Err(FsError::from(e))
            }
        }
    }

    #[instrument(level = "debug", skip(self))]
    fn open(&self, path: &str) -> FsResult<SecureFile> {
        self.validate_path(path)?;
        let fd = self.transport.open(path, false)?;
        match self.meta_manager().open(fd, self.identity()) {
            Ok(committed) => Ok(SecureFile {
                fd,
                path: path.to_string(),
                meta: committed.meta,
                meta_counter: committed.meta_counter,
                cursor: 0,
            }),
            Err(e) => {
                let _ = self.transport.close(fd);
                Err(FsError::from(e))
            }
        }
    }

    fn close(&self, handle: SecureFile) -> FsResult<()> {
        self.transport.close(handle.fd)?;
        Ok(())
    }

    #[instrument(level = "trace", skip(self, handle, buf))]
    fn read(&self, handle: &mut SecureFile, buf: &mut [u8]) -> FsResult<usize> {
        let pos = handle.cursor;
        let length = handle.meta.length;
        let effective = if pos > length || pos.checked_add(buf.len() as u64).is_none() {
            0
        } else {
            (length - pos).min(buf.len() as u64) as usize
        };

        if effective > 0 {
            let layout = self.layout();
            let engine = BlockEngine::new(self.key_manager.as_ref(), self.transport.as_ref(), &layout);
            read_range(&engine, handle.fd, &handle.meta, pos, &mut buf[..effective], &handle.meta.fek)?;
        }
        handle.cursor += effective as u64;
        Ok(effective)
    }

    #[instrument(level = "trace", skip(self, handle, buf), fields(len = buf.len()))]
    fn write(&self, handle: &mut SecureFile, buf: &[u8]) -> FsResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let pos = handle.cursor;
        let end = pos.checked_add(buf.len() as u64).ok_or_else(|| FsError::BadParameters("write range overflows".into()))?;
        if end > self.config.max_file_size() {
            return Err(FsError::BadParameters(format!(
                "write end {end} exceeds max file size {}",
                self.config.max_file_size()
            )));
        }

        if handle.meta.length < pos {
            self.extend_to(handle.fd, handle, pos)?;
        }

        let layout = self.layout();
        let engine = BlockEngine::new(self.key_manager.as_ref(), self.transport.as_ref(), &layout);
        let mut candidate = handle.meta.clone();
        let write_result = write_range(&engine, handle.fd, &mut candidate, pos, Some(buf), buf.len(), &handle.meta.fek);

        match write_result {
            Ok(()) => {
                let committed = self.meta_manager().commit(handle.fd, handle.meta_counter, candidate, self.identity())?;
                handle.meta = committed.meta;
                handle.meta_counter = committed.meta_counter;
                handle.cursor = end;
                Ok(())
            }
            Err(e) => {
                // candidate is discarded; on-disk state still reflects
                // handle.meta, so the cursor is restored to its entry value.
                handle.cursor = pos;
                Err(FsError::from(e))
            }
        }
    }

    #[instrument(level = "trace", skip(self, handle))]
    fn seek(&self, handle: &mut SecureFile, offset: i64, whence: Whence) -> FsResult<u64> {
        let base: i64 = match whence {
            Whence::Set => 0,
            Whence::Cur => i64::try_from(handle.cursor).map_err(|_| FsError::BadParameters("cursor exceeds i64 range".into()))?,
            Whence::End => i64::try_from(handle.meta.length).map_err(|_| FsError::BadParameters("length exceeds i64 range".into()))?,
        };

        let target = base.checked_add(offset).ok_or_else(|| FsError::BadParameters("seek overflow".into()))?;
        let clamped = target.max(0) as u64;

        if clamped > self.config.max_file_size() {
            return Err(FsError::BadParameters(format!(
                "seek target {clamped} exceeds max file size {}",
                self.config.max_file_size()
            )));
        }

        handle.cursor = clamped;
        Ok(clamped)
    }

    #[instrument(level = "debug", skip(self, handle))]
    fn truncate(&self, handle: &mut SecureFile, new_len: u64) -> FsResult<()> {
        if new_len > self.config.max_file_size() {
            return Err(FsError::BadParameters(format!(
                "truncate target {new_len} exceeds max file size {}",
                self.config.max_file_size()
            )));
        }

        let old_len = handle.meta.length;
        let layout = self.layout();
        let engine = BlockEngine::new(self.key_manager.as_ref(), self.transport.as_ref(), &layout);
        let mut candidate = handle.meta.clone();

        if new_len > old_len {
            write_range(&engine, handle.fd, &mut candidate, old_len, None, (new_len - old_len) as usize, &handle.meta.fek)?;
        }
        // shrinking touches no block storage: stale blocks beyond new_len
        // simply stop being referenced by length.
        candidate.length = new_len;

        let committed = self.meta_manager().commit(handle.fd, handle.meta_counter, candidate, self.identity())?;
        handle.meta = committed.meta;
        handle.meta_counter = committed.meta_counter;
        Ok(())
    }

    fn rename(&self, old: &str, new: &str, overwrite: bool) -> FsResult<()> {
        self.validate_path(old)?;
        self.validate_path(new)?;
        self.transport.rename(old, new, overwrite)?;
        Ok(())
    }

    fn remove(&self, path: &str) -> FsResult<()> {
        self.validate_path(path)?;
        self.transport.remove(path)?;
        Ok(())
    }

    fn fsync(&self, handle: &SecureFile) -> FsResult<()> {
        self.transport.fsync(handle.fd)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AeadKeyManager;
    use crate::session::StaticSessionAccessor;
    use crate::transport::LocalRpcTransport;

    fn engine(dir: &std::path::Path) -> SecureStorageEngine {
        SecureStorageEngine::new(
            Box::new(AeadKeyManager::random()),
            Box::new(LocalRpcTransport::new(dir)),
            Box::new(StaticSessionAccessor::random()),
            EngineConfig {
                num_blocks_per_file: 16,
                name_max: 256,
            },
        )
    }

    // S1: create, write 3 bytes at pos 0, close, reopen, read back.
    #[test]
    fn scenario_create_write_close_reopen_read() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        let mut handle = engine.create("/obj/a").unwrap();
        engine.write(&mut handle, &[0x01, 0x02, 0x03]).unwrap();
        engine.close(handle).unwrap();

        let mut handle = engine.open("/obj/a").unwrap();
        let mut buf = [0u8; 3];
        let n = engine.read(&mut handle, &mut buf).unwrap();
        assert_eq!(n, 3);
        assert_eq!(buf, [0x01, 0x02, 0x03]);
        assert_eq!(handle.len(), 3);
    }

    // S2: seek past end then write creates a zero-filled hole.
    #[test]
    fn scenario_seek_past_end_then_write_zero_fills_hole() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        let mut handle = engine.create("/obj/b").unwrap();
        engine.seek(&mut handle, 300, Whence::Set).unwrap();
        engine.write(&mut handle, &[0xAA]).unwrap();

        engine.seek(&mut handle, 0, Whence::Set).unwrap();
        let mut buf = [0u8; 301];
        let n = engine.read(&mut handle, &mut buf).unwrap();
        assert_eq!(n, 301);
        assert!(buf[..300].iter().all(|&b| b == 0));
        assert_eq!(buf[300], 0xAA);
        assert_eq!(handle.len(), 301);
    }

    // S3: overwrite a sub-range of an already-written block.
    #[test]
    fn scenario_overwrite_subrange_of_existing_block() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        let mut handle = engine.create("/obj/c").unwrap();
        engine.write(&mut handle, &[0x55u8; 256]).unwrap();
        engine.seek(&mut handle, 100, Whence::Set).unwrap();
        engine.write(&mut handle, &[0xFFu8; 10]).unwrap();

        engine.seek(&mut handle, 0, Whence::Set).unwrap();
        let mut buf = [0u8; 256];
        engine.read(&mut handle, &mut buf).unwrap();
        assert!(buf[..100].iter().all(|&b| b == 0x55));
        assert!(buf[100..110].iter().all(|&b| b == 0xFF));
        assert!(buf[110..].iter().all(|&b| b == 0x55));
    }

    // S4: truncate shrink then extend again leaves a zero-filled tail.
    #[test]
    fn scenario_truncate_shrink_then_extend() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        let mut handle = engine.create("/obj/d").unwrap();
        engine.write(&mut handle, &[0x11u8; 512]).unwrap();
        engine.truncate(&mut handle, 100).unwrap();
        assert_eq!(handle.len(), 100);

        engine.seek(&mut handle, 0, Whence::Set).unwrap();
        let mut buf = [0u8; 1000];
        let n = engine.read(&mut handle, &mut buf).unwrap();
        assert_eq!(n, 100);
        assert!(buf[..100].iter().all(|&b| b == 0x11));

        engine.truncate(&mut handle, 200).unwrap();
        engine.seek(&mut handle, 100, Whence::Set).unwrap();
        let mut tail = [0u8; 100];
        engine.read(&mut handle, &mut tail).unwrap();
        assert!(tail.iter().all(|&b| b == 0));
    }

    // S6: a flipped byte in the active meta slot fails open with CorruptObject.
    #[test]
    fn scenario_tampered_meta_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let handle = engine.create("/obj/f").unwrap();
        engine.close(handle).unwrap();

        let transport = LocalRpcTransport::new(dir.path());
        let fd = transport.open("/obj/f", false).unwrap();
        let mut byte = [0u8; 1];
        transport.read_at(fd, &mut byte, 10).unwrap();
        byte[0] ^= 0xFF;
        transport.write_at(fd, &byte, 10).unwrap();
        transport.close(fd).unwrap();

        let err = engine.open("/obj/f").unwrap_err();
        assert!(matches!(err, FsError::CorruptObject(_)));
    }

    #[test]
    fn read_past_length_clamps_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let mut handle = engine.create("/obj/e").unwrap();
        engine.write(&mut handle, &[1, 2, 3]).unwrap();
        engine.seek(&mut handle, 10, Whence::Set).unwrap();
        let mut buf = [0u8; 5];
        let n = engine.read(&mut handle, &mut buf).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn write_past_max_file_size_is_bad_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let mut handle = engine.create("/obj/g").unwrap();
        engine.seek(&mut handle, (16 * 256) as i64 - 1, Whence::Set).unwrap();
        let err = engine.write(&mut handle, &[0u8; 2]).unwrap_err();
        assert!(matches!(err, FsError::BadParameters(_)));
    }

    #[test]
    fn rename_and_remove_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let handle = engine.create("/obj/h").unwrap();
        engine.close(handle).unwrap();
        engine.rename("/obj/h", "/obj/i", false).unwrap();
        assert!(engine.open("/obj/h").is_err());
        let handle = engine.open("/obj/i").unwrap();
        engine.close(handle).unwrap();
        engine.remove("/obj/i").unwrap();
        assert!(engine.open("/obj/i").is_err());
    }
}
