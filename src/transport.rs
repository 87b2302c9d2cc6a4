use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(unix)]
use std::os::unix::fs::FileExt;

use dashmap::DashMap;
use thiserror::Error;
use tracing::{instrument, trace, warn};

/// Opaque descriptor handed back by [`RpcTransport::open`].
///
/// `0` is never issued; it is reserved so callers can use it as a null
/// sentinel, matching the convention used for in-memory handle tables
/// elsewhere in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RpcFd(u64);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("backing object not found")]
    NotFound,
    #[error("backing object already exists")]
    AlreadyExists,
    #[error("unknown file descriptor")]
    BadDescriptor,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Positional I/O contract the engine requires of its REE-side transport.
///
/// Every method here may block the calling context indefinitely on the
/// untrusted host; none of them retry internally. All are positional
/// (offset-taking); a read or write returning fewer bytes than requested is
/// not an error by itself — callers decide what a short read means (the
/// engine treats a zero-byte read at the start of a slot as "slot empty").
pub trait RpcTransport: Send + Sync {
    fn open(&self, path: &str, create: bool) -> Result<RpcFd, TransportError>;
    fn close(&self, fd: RpcFd) -> Result<(), TransportError>;
    fn read_at(&self, fd: RpcFd, buf: &mut [u8], offset: u64) -> Result<usize, TransportError>;
    fn write_at(&self, fd: RpcFd, buf: &[u8], offset: u64) -> Result<usize, TransportError>;
    fn rename(&self, old: &str, new: &str, overwrite: bool) -> Result<(), TransportError>;
    fn remove(&self, path: &str) -> Result<(), TransportError>;
    fn fsync(&self, fd: RpcFd) -> Result<(), TransportError>;
}

/// Default REE-side transport: each container is a single opaque file
/// under `root`, addressed by the path the engine passes in.
///
/// Open descriptors are kept in a `DashMap` keyed by a monotonically
/// issued `RpcFd`, the same shape the rest of this crate uses for its
/// open-handle tables, so concurrent handles on independent backing files
/// never contend on a shared lock.
pub struct LocalRpcTransport {
    root: PathBuf,
    open_files: DashMap<RpcFd, File>,
    next_fd: AtomicU64,
}

impl LocalRpcTransport {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            open_files: DashMap::new(),
            next_fd: AtomicU64::new(1),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn allocate_fd(&self) -> RpcFd {
        RpcFd(self.next_fd.fetch_add(1, Ordering::Relaxed))
    }

    fn with_file<R>(&self, fd: RpcFd, f: impl FnOnce(&File) -> R) -> Result<R, TransportError> {
        self.open_files
            .get(&fd)
            .map(|entry| f(&entry))
            .ok_or(TransportError::BadDescriptor)
    }
}

impl RpcTransport for LocalRpcTransport {
    #[instrument(level = "debug", skip(self), fields(path))]
    fn open(&self, path: &str, create: bool) -> Result<RpcFd, TransportError> {
        let full = self.resolve(path);
        if create {
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .create_new(false)
            .truncate(false)
            .open(&full)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    TransportError::NotFound
                } else {
                    TransportError::Io(e)
                }
            })?;
        let fd = self.allocate_fd();
        self.open_files.insert(fd, file);
        trace!(?fd, "opened backing object");
        Ok(fd)
    }

    fn close(&self, fd: RpcFd) -> Result<(), TransportError> {
        self.open_files
            .remove(&fd)
            .map(|_| ())
            .ok_or(TransportError::BadDescriptor)
    }

    fn read_at(&self, fd: RpcFd, buf: &mut [u8], offset: u64) -> Result<usize, TransportError> {
        self.with_file(fd, |file| read_at_platform(file, buf, offset))?
            .map_err(TransportError::Io)
    }

    fn write_at(&self, fd: RpcFd, buf: &[u8], offset: u64) -> Result<usize, TransportError> {
        self.with_file(fd, |file| write_at_platform(file, buf, offset))?
            .map_err(TransportError::Io)
    }

    fn rename(&self, old: &str, new: &str, overwrite: bool) -> Result<(), TransportError> {
        let old_path = self.resolve(old);
        let new_path = self.resolve(new);
        if !overwrite && new_path.exists() {
            return Err(TransportError::AlreadyExists);
        }
        std::fs::rename(&old_path, &new_path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                TransportError::NotFound
            } else {
                TransportError::Io(e)
            }
        })
    }

    fn remove(&self, path: &str) -> Result<(), TransportError> {
        std::fs::remove_file(self.resolve(path)).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                TransportError::NotFound
            } else {
                TransportError::Io(e)
            }
        })
    }

    fn fsync(&self, fd: RpcFd) -> Result<(), TransportError> {
        self.with_file(fd, File::sync_all)?.map_err(TransportError::Io)
    }
}

#[cfg(unix)]
fn read_at_platform(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    file.read_at(buf, offset)
}

#[cfg(unix)]
fn write_at_platform(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    file.write_at(buf, offset)
}

#[cfg(not(unix))]
fn read_at_platform(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = file.try_clone()?;
    file.seek(SeekFrom::Start(offset))?;
    file.read(buf)
}

#[cfg(not(unix))]
fn write_at_platform(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::io::{Seek, SeekFrom, Write};
    let mut file = file.try_clone()?;
    file.seek(SeekFrom::Start(offset))?;
    file.write(buf)
}

/// Fault-injecting transport used by crash-atomicity tests: drops every
/// write issued after the configured byte budget, simulating a power loss
/// partway through a commit.
#[cfg(any(test, feature = "debug-tools"))]
pub struct FaultInjectingTransport {
    inner: LocalRpcTransport,
    writes_issued: AtomicU64,
    drop_after: u64,
}

#[cfg(any(test, feature = "debug-tools"))]
impl FaultInjectingTransport {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, drop_after: u64) -> Self {
        Self {
            inner: LocalRpcTransport::new(root),
            writes_issued: AtomicU64::new(0),
            drop_after,
        }
    }
}

#[cfg(any(test, feature = "debug-tools"))]
impl RpcTransport for FaultInjectingTransport {
    fn open(&self, path: &str, create: bool) -> Result<RpcFd, TransportError> {
        self.inner.open(path, create)
    }

    fn close(&self, fd: RpcFd) -> Result<(), TransportError> {
        self.inner.close(fd)
    }

    fn read_at(&self, fd: RpcFd, buf: &mut [u8], offset: u64) -> Result<usize, TransportError> {
        self.inner.read_at(fd, buf, offset)
    }

    fn write_at(&self, fd: RpcFd, buf: &[u8], offset: u64) -> Result<usize, TransportError> {
        let issued = self.writes_issued.fetch_add(1, Ordering::SeqCst);
        if issued >= self.drop_after {
            warn!(issued, "dropping write to simulate power loss");
            return Ok(0);
        }
        self.inner.write_at(fd, buf, offset)
    }

    fn rename(&self, old: &str, new: &str, overwrite: bool) -> Result<(), TransportError> {
        self.inner.rename(old, new, overwrite)
    }

    fn remove(&self, path: &str) -> Result<(), TransportError> {
        self.inner.remove(path)
    }

    fn fsync(&self, fd: RpcFd) -> Result<(), TransportError> {
        self.inner.fsync(fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_missing_without_create_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LocalRpcTransport::new(dir.path());
        let err = transport.open("missing", false).unwrap_err();
        assert!(matches!(err, TransportError::NotFound));
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LocalRpcTransport::new(dir.path());
        let fd = transport.open("obj", true).unwrap();
        transport.write_at(fd, b"hello", 10).unwrap();
        let mut buf = [0u8; 5];
        let n = transport.read_at(fd, &mut buf, 10).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn read_past_eof_is_short() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LocalRpcTransport::new(dir.path());
        let fd = transport.open("obj", true).unwrap();
        let mut buf = [0u8; 16];
        let n = transport.read_at(fd, &mut buf, 0).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn unknown_fd_is_bad_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LocalRpcTransport::new(dir.path());
        let err = transport.read_at(RpcFd(999), &mut [0u8; 1], 0).unwrap_err();
        assert!(matches!(err, TransportError::BadDescriptor));
    }
}
