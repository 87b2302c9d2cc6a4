//! Pure offset math (C1): no I/O, no allocation beyond what the caller
//! already owns. Every other component routes its addressing through this
//! module so the container's physical shape lives in exactly one place.

use crate::config::{BLOCK_SHIFT, BLOCK_SIZE, EngineConfig};
use crate::meta::MetaInfo;

/// Byte offset of the 4-byte meta counter. Fixed by the wire format.
pub const COUNTER_OFFSET: u64 = 0;
pub const COUNTER_SIZE: u64 = 4;

#[derive(Debug, Clone, Copy)]
pub struct Layout {
    h_meta: usize,
    h_block: usize,
    meta_info_size: usize,
}

impl Layout {
    #[must_use]
    pub fn new(config: &EngineConfig, h_meta: usize, h_block: usize) -> Self {
        // length(8) + counter(4) + fek(32) + reserved(8) + bitmap
        let meta_info_size = 8 + 4 + 32 + 8 + config.bitmap_len_bytes();
        Self {
            h_meta,
            h_block,
            meta_info_size,
        }
    }

    #[must_use]
    pub fn s_meta(&self) -> usize {
        self.h_meta + self.meta_info_size
    }

    #[must_use]
    pub fn s_block(&self) -> usize {
        self.h_block + BLOCK_SIZE
    }

    #[must_use]
    pub fn meta_info_size(&self) -> usize {
        self.meta_info_size
    }

    #[must_use]
    pub fn meta_header_size(&self) -> usize {
        self.h_meta
    }

    #[must_use]
    pub fn block_header_size(&self) -> usize {
        self.h_block
    }

    #[must_use]
    pub fn blocks_base_offset(&self) -> u64 {
        COUNTER_OFFSET + COUNTER_SIZE + 2 * self.s_meta() as u64
    }

    /// `block_of(pos) = pos >> 8`.
    #[must_use]
    pub fn block_of(pos: u64) -> u64 {
        pos >> BLOCK_SHIFT
    }

    /// `4` if the counter's parity already matches `want_active`, else the
    /// offset of the other meta slot.
    #[must_use]
    pub fn meta_offset(&self, counter: u32, want_active: bool) -> u64 {
        let parity = (counter & 1) == 1;
        if parity == want_active {
            COUNTER_OFFSET + COUNTER_SIZE
        } else {
            COUNTER_OFFSET + COUNTER_SIZE + self.s_meta() as u64
        }
    }

    /// Physical offset of logical block `n`'s active or shadow slot, given
    /// the meta whose `backup_version_table` selects the active slots.
    #[must_use]
    pub fn block_offset(&self, meta: &MetaInfo, n: u64, want_active: bool) -> u64 {
        let bit = meta.bit_n(n);
        let delta: u64 = u64::from(want_active != bit);
        self.blocks_base_offset() + (2 * n + delta) * self.s_block() as u64
    }
}
