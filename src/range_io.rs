//! Range writer / reader (C5): gather-scatter across block boundaries for
//! arbitrary byte ranges, with zero-fill on holes.

use thiserror::Error;
use tracing::instrument;

use crate::block_engine::{BlockEngine, BlockEngineError};
use crate::config::BLOCK_SIZE;
use crate::crypto::FileEncryptionKey;
use crate::layout::Layout;
use crate::meta::MetaInfo;
use crate::transport::RpcFd;

#[derive(Error, Debug)]
pub enum RangeError {
    #[error(transparent)]
    Block(#[from] BlockEngineError),
}

/// Reads `buf.len()` bytes starting at `pos` from the blocks the active
/// meta selects. Callers are responsible for clamping `buf.len()` to the
/// object's logical length before calling this.
#[instrument(level = "trace", skip(engine, meta, buf, fek))]
pub fn read_range(
    engine: &BlockEngine<'_>,
    fd: RpcFd,
    meta: &MetaInfo,
    pos: u64,
    buf: &mut [u8],
    fek: &FileEncryptionKey,
) -> Result<(), RangeError> {
    if buf.is_empty() {
        return Ok(());
    }
    let mut cursor = pos;
    let mut written = 0usize;
    let remaining_total = buf.len();

    while written < remaining_total {
        let block_index = Layout::block_of(cursor);
        let off = (cursor % BLOCK_SIZE as u64) as usize;
        let chunk = (remaining_total - written).min(BLOCK_SIZE - off);

        let block = engine.read_block(fd, meta, block_index, fek)?;
        buf[written..written + chunk].copy_from_slice(&block[off..off + chunk]);

        cursor += chunk as u64;
        written += chunk;
    }
    Ok(())
}

/// Writes `data` (or, if `None`, zero-fills `len` bytes — used by
/// truncate-extend) starting at `pos` into `new_meta`'s shadow blocks.
///
/// Partial blocks are read-modify-write: the existing block (an unwritten
/// slot reads as all-zero) is read, the range is patched in, and the
/// result is written to the shadow slot. After the loop, if the write
/// advanced past `new_meta.length`, `new_meta.length` is extended to the
/// new end position. On any per-block failure the candidate meta reflects
/// only the blocks successfully written so far; the caller discards it.
#[instrument(level = "trace", skip(engine, new_meta, data, fek))]
pub fn write_range(
    engine: &BlockEngine<'_>,
    fd: RpcFd,
    new_meta: &mut MetaInfo,
    pos: u64,
    data: Option<&[u8]>,
    len: usize,
    fek: &FileEncryptionKey,
) -> Result<(), RangeError> {
    if len == 0 {
        return Ok(());
    }
    let mut cursor = pos;
    let mut consumed = 0usize;

    while consumed < len {
        let block_index = Layout::block_of(cursor);
        let off = (cursor % BLOCK_SIZE as u64) as usize;
        let chunk = (len - consumed).min(BLOCK_SIZE - off);

        let mut block = if off == 0 && chunk == BLOCK_SIZE {
            [0u8; BLOCK_SIZE]
        } else {
            engine.read_block(fd, new_meta, block_index, fek)?
        };

        match data {
            Some(src) => block[off..off + chunk].copy_from_slice(&src[consumed..consumed + chunk]),
            None => block[off..off + chunk].fill(0),
        }

        engine.write_block(fd, new_meta, block_index, &block, fek)?;

        cursor += chunk as u64;
        consumed += chunk;
    }

    if cursor > new_meta.length {
        new_meta.length = cursor;
    }
    Ok(())
}
