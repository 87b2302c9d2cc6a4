use serde::{Deserialize, Serialize};

/// Block size in bytes. Fixed by the wire format; changing it breaks
/// every container already written to disk.
pub const BLOCK_SIZE: usize = 256;
pub const BLOCK_SHIFT: u32 = 8;

fn default_num_blocks_per_file() -> usize {
    1024
}

fn default_name_max() -> usize {
    256
}

/// Configuration supplied by the key-manager collaborator at engine
/// construction time.
///
/// `num_blocks_per_file` and the derived sizes are ABI-visible: they are
/// baked into the on-disk layout of every container created under this
/// configuration, so changing them after objects exist on disk corrupts
/// those objects. This is loaded once at startup, not per-object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default = "default_num_blocks_per_file")]
    pub num_blocks_per_file: usize,
    #[serde(default = "default_name_max")]
    pub name_max: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_blocks_per_file: default_num_blocks_per_file(),
            name_max: default_name_max(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }

    #[must_use]
    pub fn max_file_size(&self) -> u64 {
        (self.num_blocks_per_file as u64) * (BLOCK_SIZE as u64)
    }

    /// Number of bytes needed to hold one bit per block.
    #[must_use]
    pub fn bitmap_len_bytes(&self) -> usize {
        self.num_blocks_per_file.div_ceil(8)
    }
}
