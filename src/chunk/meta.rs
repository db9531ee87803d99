//! The immutable, structured chunk meta blob.
//!
//! Modeled as a Rust struct rather than a tagged-tree/length-prefixed wire
//! blob — [`crate::transcoder`] is the seam that would (de)serialize this
//! to that wire format; this type is the decoded, in-memory shape every
//! other component works with.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkType {
    Table,
    Journal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkFormat {
    SchemalessHorizontal = 1,
    UnversionedColumnar = 2,
    VersionedSimple = 3,
    VersionedColumnar = 4,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundaryKeys {
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
}

/// The `misc` extension: everything that gets frozen once a chunk is
/// confirmed/sealed. Invariant: sealed implies this is fully populated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MiscExt {
    pub row_count: u64,
    pub data_weight: u64,
    pub uncompressed_data_size: u64,
    pub compressed_data_size: u64,
    pub max_block_size: u32,
    pub codec_id: u32,
    pub striped_erasure: bool,
    pub sorted: bool,
    pub unique_keys: bool,
    pub min_timestamp: Option<u64>,
    pub max_timestamp: Option<u64>,
    pub first_overlayed_row_index: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub chunk_type: Option<ChunkType>,
    pub format: Option<ChunkFormat>,
    pub misc: Option<MiscExt>,
    pub boundary_keys: Option<BoundaryKeys>,
    pub block_count: u32,
    pub system_block_count: u32,
}

impl ChunkMeta {
    pub fn empty() -> Self {
        ChunkMeta::default()
    }

    /// Requires `misc` present; confirming a chunk with no misc is an error.
    pub fn require_misc(&self) -> anyhow::Result<&MiscExt> {
        self.misc
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("confirm: chunk meta is missing the misc extension"))
    }
}
