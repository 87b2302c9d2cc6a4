use thiserror::Error;

use crate::transport::TransportError;

/// Top-level error surfaced across the storage engine's public boundary.
///
/// Mirrors the fixed error-code space a TEE storage driver exposes to its
/// callers: callers switch on the variant, not on an open-ended source
/// chain. `MAC_INVALID` never appears here; `From<MetaError>`/
/// `FsError::from_key_manager_or_transport` in `file.rs` upgrade it to
/// `CorruptObject` at every propagation path.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("bad parameters: {0}")]
    BadParameters(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("object not found")]
    ItemNotFound,

    #[error("corrupt object: {0}")]
    CorruptObject(String),

    #[error("host I/O failure: {0}")]
    Generic(#[source] TransportError),
}

impl From<TransportError> for FsError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotFound => FsError::ItemNotFound,
            other => FsError::Generic(other),
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;
