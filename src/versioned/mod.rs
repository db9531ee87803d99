//! Versioned chunk writer and overlapping range merger. See `row.rs` for the
//! shared row/value shape, `block_codec.rs` for the block encode/decode seam,
//! `writer.rs` for the two physical layouts, `reader.rs` for the
//! range/columnar/lookup readers, and `merger.rs` for the multi-source merge.

pub mod block_codec;
pub mod merger;
pub mod reader;
pub mod row;
pub mod writer;

pub use block_codec::{BlockCodec, JsonBlockCodec};
pub use merger::{MergeSource, OverlappingRangeMerger, UnreadDataDescriptor};
pub use reader::{ColumnarRangeReader, LookupReader, RangeReader};
pub use row::{compare_keys, ColumnId, Timestamp, Value, VersionedRow, VersionedValue};
pub use writer::{BlockMetaEntry, ColumnGroup, ColumnarWriter, RowLayoutWriter, WriterConfig};
