//! Confidentiality, integrity, and crash-atomicity for per-object secure
//! storage backed by an untrusted filesystem.
//!
//! Each secure object lives as a single opaque container file in the
//! untrusted host's filesystem. This crate implements the container
//! format and its atomic-update protocol — double-buffered meta/data
//! blocks, counter-gated commit, encrypted block I/O — on top of three
//! injected collaborators: a [`crypto::KeyManager`], an
//! [`transport::RpcTransport`], and a [`session::SessionAccessor`].
//!
//! ```no_run
//! use secure_object_store::config::EngineConfig;
//! use secure_object_store::crypto::AeadKeyManager;
//! use secure_object_store::file::{StorageBackend, SecureStorageEngine, Whence};
//! use secure_object_store::session::StaticSessionAccessor;
//! use secure_object_store::transport::LocalRpcTransport;
//!
//! let engine = SecureStorageEngine::new(
//!     Box::new(AeadKeyManager::random()),
//!     Box::new(LocalRpcTransport::new("/var/lib/secure-objects")),
//!     Box::new(StaticSessionAccessor::random()),
//!     EngineConfig::default(),
//! );
//!
//! let mut handle = engine.create("/obj/example").unwrap();
//! engine.write(&mut handle, b"hello").unwrap();
//! engine.seek(&mut handle, 0, Whence::Set).unwrap();
//! let mut buf = [0u8; 5];
//! engine.read(&mut handle, &mut buf).unwrap();
//! engine.close(handle).unwrap();
//! ```

pub mod block_engine;
pub mod block_io;
pub mod config;
pub mod crypto;
pub mod error;
pub mod file;
pub mod layout;
pub mod meta;
pub mod range_io;
pub mod session;
pub mod transport;

pub use config::EngineConfig;
pub use error::{FsError, FsResult};
pub use file::{SecureFile, SecureStorageEngine, StorageBackend, Whence};
