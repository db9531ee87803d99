//! Range reader, columnar range reader, and lookup reader. Each can be built
//! either directly from an in-memory row list, or from the
//! [`BlockMetaEntry`] list a writer produced, via `from_blocks`, which
//! decodes every block through a [`BlockCodec`] and concatenates the result.
//! The block store and replica RPC fabric that would fetch those blocks'
//! bytes off disk are an out-of-scope collaborator; callers hand the bytes
//! in directly.
//!
//! Ordering guarantee honored here: within one reader, emitted rows are
//! monotonically non-decreasing in key.

use anyhow::Result;

use super::block_codec::BlockCodec;
use super::row::{compare_keys, Value, VersionedRow};
use super::writer::BlockMetaEntry;

/// Decodes each block's bytes through `codec` and concatenates the results
/// in block-index order, matching the row order the writer flushed them in.
fn decode_blocks(blocks: &[BlockMetaEntry], codec: &dyn BlockCodec) -> Result<Vec<VersionedRow>> {
    let mut rows = Vec::new();
    for block in blocks {
        rows.extend(codec.decode(&block.data)?);
    }
    Ok(rows)
}

/// Shared contract: rows are pre-sorted by key (the writer enforces this),
/// and a reader exposes them through an inclusive/exclusive `[lower, upper)`
/// key-range window plus an internal cursor.
pub struct RangeReader {
    rows: Vec<VersionedRow>,
    lower: Option<Vec<Value>>,
    upper: Option<Vec<Value>>,
    cursor: usize,
}

impl RangeReader {
    pub fn new(rows: Vec<VersionedRow>, lower: Option<Vec<Value>>, upper: Option<Vec<Value>>) -> Self {
        RangeReader { rows, lower, upper, cursor: 0 }
    }

    /// Decodes the given blocks through `codec` and wraps the result in a
    /// range-bounded reader. `blocks` is expected to come from one writer's
    /// output (e.g. [`crate::versioned::writer::RowLayoutWriter::close`]).
    pub fn from_blocks(
        blocks: &[BlockMetaEntry],
        codec: &dyn BlockCodec,
        lower: Option<Vec<Value>>,
        upper: Option<Vec<Value>>,
    ) -> Result<Self> {
        Ok(RangeReader::new(decode_blocks(blocks, codec)?, lower, upper))
    }

    fn in_range(&self, row: &VersionedRow) -> bool {
        if let Some(lower) = &self.lower {
            if compare_keys(&row.key, lower) == std::cmp::Ordering::Less {
                return false;
            }
        }
        if let Some(upper) = &self.upper {
            if compare_keys(&row.key, upper) != std::cmp::Ordering::Less {
                return false;
            }
        }
        true
    }

    /// Reads up to `max_rows`, honoring the range window. Returns an empty
    /// vec exactly when exhausted ("empty batch means end of stream",
    /// distinct from "would block").
    pub fn read(&mut self, max_rows: usize) -> Vec<VersionedRow> {
        let mut out = Vec::new();
        while self.cursor < self.rows.len() && out.len() < max_rows {
            let row = &self.rows[self.cursor];
            self.cursor += 1;
            if self.in_range(row) {
                out.push(row.clone());
            }
        }
        out
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.rows.len()
    }
}

/// Columnar variant: same cursor/range contract, but callers may additionally
/// restrict which column ids are materialized per row (the rest of each
/// row's values are dropped before being returned), matching the columnar
/// writer's per-group physical layout.
pub struct ColumnarRangeReader {
    inner: RangeReader,
    column_filter: Option<Vec<super::row::ColumnId>>,
}

impl ColumnarRangeReader {
    pub fn new(
        rows: Vec<VersionedRow>,
        lower: Option<Vec<Value>>,
        upper: Option<Vec<Value>>,
        column_filter: Option<Vec<super::row::ColumnId>>,
    ) -> Self {
        ColumnarRangeReader { inner: RangeReader::new(rows, lower, upper), column_filter }
    }

    /// Decodes the given blocks (typically one [`ColumnGroup`](super::writer::ColumnGroup)'s
    /// worth, pre-filtered by `group_name`) through `codec` and wraps the
    /// result in a column-filtered, range-bounded reader.
    pub fn from_blocks(
        blocks: &[BlockMetaEntry],
        codec: &dyn BlockCodec,
        lower: Option<Vec<Value>>,
        upper: Option<Vec<Value>>,
        column_filter: Option<Vec<super::row::ColumnId>>,
    ) -> Result<Self> {
        let rows = decode_blocks(blocks, codec)?;
        Ok(ColumnarRangeReader { inner: RangeReader::new(rows, lower, upper), column_filter })
    }

    pub fn read(&mut self, max_rows: usize) -> Vec<VersionedRow> {
        let mut rows = self.inner.read(max_rows);
        if let Some(filter) = &self.column_filter {
            for row in &mut rows {
                row.values.retain(|v| filter.contains(&v.column_id));
            }
        }
        rows
    }

    pub fn is_exhausted(&self) -> bool {
        self.inner.is_exhausted()
    }
}

/// Point lookups by exact key, via binary search over the pre-sorted rows.
pub struct LookupReader {
    rows: Vec<VersionedRow>,
}

impl LookupReader {
    pub fn new(rows: Vec<VersionedRow>) -> Self {
        LookupReader { rows }
    }

    /// Decodes the given blocks through `codec` and wraps the result for
    /// point lookups.
    pub fn from_blocks(blocks: &[BlockMetaEntry], codec: &dyn BlockCodec) -> Result<Self> {
        Ok(LookupReader::new(decode_blocks(blocks, codec)?))
    }

    pub fn lookup(&self, key: &[Value]) -> Option<&VersionedRow> {
        self.rows
            .binary_search_by(|row| compare_keys(&row.key, key))
            .ok()
            .map(|idx| &self.rows[idx])
    }

    pub fn lookup_many(&self, keys: &[Vec<Value>]) -> Vec<Option<&VersionedRow>> {
        keys.iter().map(|k| self.lookup(k)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::row::VersionedValue;
    use super::*;

    fn row(key: i64) -> VersionedRow {
        let mut r = VersionedRow::new(vec![Value::Int64(key)]);
        r.values.push(VersionedValue { column_id: 0, timestamp: 1, value: Value::Int64(key * 10) });
        r
    }

    #[test]
    fn range_reader_respects_lower_and_upper_bounds() {
        let rows = vec![row(1), row(2), row(3), row(4), row(5)];
        let mut reader = RangeReader::new(rows, Some(vec![Value::Int64(2)]), Some(vec![Value::Int64(4)]));
        let out = reader.read(100);
        let keys: Vec<i64> = out.iter().map(|r| match r.key[0] {
            Value::Int64(k) => k,
            _ => panic!(),
        }).collect();
        assert_eq!(keys, vec![2, 3]);
        assert!(reader.is_exhausted());
    }

    #[test]
    fn range_reader_paginates_across_multiple_read_calls() {
        let rows = vec![row(1), row(2), row(3)];
        let mut reader = RangeReader::new(rows, None, None);
        assert_eq!(reader.read(2).len(), 2);
        assert_eq!(reader.read(2).len(), 1);
        assert_eq!(reader.read(2).len(), 0);
    }

    #[test]
    fn columnar_reader_applies_column_filter() {
        let rows = vec![row(1)];
        let mut reader = ColumnarRangeReader::new(rows, None, None, Some(vec![99]));
        let out = reader.read(10);
        assert!(out[0].values.is_empty());
    }

    #[test]
    fn lookup_reader_finds_exact_key() {
        let rows = vec![row(1), row(2), row(3)];
        let reader = LookupReader::new(rows);
        assert!(reader.lookup(&[Value::Int64(2)]).is_some());
        assert!(reader.lookup(&[Value::Int64(99)]).is_none());
    }

    #[test]
    fn range_reader_decodes_blocks_written_by_row_layout_writer() {
        use super::super::block_codec::JsonBlockCodec;
        use super::super::writer::{RowLayoutWriter, WriterConfig};

        let mut writer = RowLayoutWriter::new(WriterConfig::default(), 1);
        writer.write(&[row(1), row(2), row(3)]).unwrap();
        let (_, blocks) = writer.close().unwrap();

        let codec = JsonBlockCodec;
        let mut reader = RangeReader::from_blocks(&blocks, &codec, None, None).unwrap();
        let out = reader.read(100);
        let keys: Vec<i64> = out
            .iter()
            .map(|r| match r.key[0] {
                Value::Int64(k) => k,
                _ => panic!(),
            })
            .collect();
        assert_eq!(keys, vec![1, 2, 3]);
    }

    #[test]
    fn lookup_reader_decodes_blocks_written_by_row_layout_writer() {
        use super::super::block_codec::JsonBlockCodec;
        use super::super::writer::{RowLayoutWriter, WriterConfig};

        let mut writer = RowLayoutWriter::new(WriterConfig::default(), 1);
        writer.write(&[row(1), row(2), row(3)]).unwrap();
        let (_, blocks) = writer.close().unwrap();

        let codec = JsonBlockCodec;
        let reader = LookupReader::from_blocks(&blocks, &codec).unwrap();
        assert!(reader.lookup(&[Value::Int64(2)]).is_some());
        assert!(reader.lookup(&[Value::Int64(99)]).is_none());
    }
}
