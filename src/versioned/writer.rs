//! Versioned chunk writer: a shared key-order/sampling/timestamp-count
//! contract plus two physical layouts — row and columnar, the latter with a
//! sub-range flush loop. Each flushed block is handed to a [`BlockCodec`]
//! before it's stored; the physical block store and RPC upload path behind
//! that codec are an out-of-scope byte-addressable object store
//! collaborator, so both writers here produce an in-memory block list
//! (encoded bytes plus a [`ChunkMeta`]) instead of calling out to it.

use std::sync::Arc;

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::chunk::meta::{BoundaryKeys, ChunkMeta, ChunkType, MiscExt};

use super::block_codec::{BlockCodec, JsonBlockCodec};
use super::row::{compare_keys, ColumnId, Timestamp, Value, VersionedRow};

pub const MAX_TIMESTAMP_COUNT: usize = (1 << 16) - 1;
pub const MIN_ROW_RANGE_DATA_WEIGHT: u64 = 64 * 1024;

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub block_size: u64,
    pub sample_rate: f64,
    pub max_buffer_size: u64,
    pub data_to_block_flush: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig { block_size: 16 * 1024 * 1024, sample_rate: 0.0, max_buffer_size: 64 * 1024 * 1024, data_to_block_flush: 1024 * 1024 }
    }
}

fn row_data_weight(row: &VersionedRow) -> u64 {
    fn value_weight(v: &Value) -> u64 {
        match v {
            Value::Null => 1,
            Value::Int64(_) | Value::Uint64(_) | Value::Double(_) => 8,
            Value::Boolean(_) => 1,
            Value::String(s) => s.len() as u64,
        }
    }
    let key_weight: u64 = row.key.iter().map(value_weight).sum();
    let value_weight_total: u64 = row.values.iter().map(|v| value_weight(&v.value) + 10).sum();
    key_weight + value_weight_total + row.delete_timestamps.len() as u64 * 8
}

/// State shared by both physical layouts: strict key ordering, seeded
/// sampling, and timestamp-count limits.
pub struct SharedWriterState {
    last_key: Option<Vec<Value>>,
    row_count: u64,
    min_timestamp: Option<Timestamp>,
    max_timestamp: Option<Timestamp>,
    rng: StdRng,
    sampling_threshold: u64,
    pub samples: Vec<Vec<Value>>,
    pub data_weight: u64,
}

impl SharedWriterState {
    pub fn new(config: &WriterConfig, seed: u64) -> Self {
        SharedWriterState {
            last_key: None,
            row_count: 0,
            min_timestamp: None,
            max_timestamp: None,
            rng: StdRng::seed_from_u64(seed),
            sampling_threshold: (u64::MAX as f64 * config.sample_rate) as u64,
            samples: Vec::new(),
            data_weight: 0,
        }
    }

    /// Shared write contract: validates strict-increasing keys across and
    /// within `write` batches, and per-row timestamp-count caps.
    fn validate_and_track(&mut self, rows: &[VersionedRow]) -> Result<()> {
        if rows.is_empty() {
            bail!("write: rows must be non-empty");
        }
        if let Some(prev) = &self.last_key {
            if compare_keys(prev, &rows[0].key) != std::cmp::Ordering::Less {
                bail!("write: keys must strictly increase across write calls");
            }
        }
        for pair in rows.windows(2) {
            if compare_keys(&pair[0].key, &pair[1].key) != std::cmp::Ordering::Less {
                bail!("write: keys must strictly increase within one write call");
            }
        }
        for row in rows {
            if row.write_timestamp_count() > MAX_TIMESTAMP_COUNT {
                bail!("write: writeTimestampCount exceeds 2^16-1");
            }
            if row.delete_timestamp_count() > MAX_TIMESTAMP_COUNT {
                bail!("write: deleteTimestampCount exceeds 2^16-1");
            }
            if let Some(ts) = row.min_timestamp() {
                self.min_timestamp = Some(self.min_timestamp.map_or(ts, |m| m.min(ts)));
            }
            if let Some(ts) = row.max_timestamp() {
                self.max_timestamp = Some(self.max_timestamp.map_or(ts, |m| m.max(ts)));
            }
            self.data_weight += row_data_weight(row);
        }
        self.last_key = Some(rows.last().unwrap().key.clone());
        self.row_count += rows.len() as u64;
        Ok(())
    }

    fn maybe_sample(&mut self, row: &VersionedRow, force_first: bool) {
        if force_first || self.rng.gen::<u64>() < self.sampling_threshold {
            self.samples.push(row.key.clone());
        }
    }
}

/// One physical block's metadata, plus the bytes a [`BlockCodec`] produced
/// for it. `group_name` is empty for the row layout; the columnar layout
/// fills it in with the owning column group's name.
#[derive(Debug, Clone, Default)]
pub struct BlockMetaEntry {
    pub last_key: Vec<Value>,
    pub chunk_row_count: u64,
    pub block_index: u32,
    pub data: Vec<u8>,
    pub group_name: String,
}

/// Row ("simple") physical layout.
pub struct RowLayoutWriter {
    config: WriterConfig,
    state: SharedWriterState,
    codec: Arc<dyn BlockCodec>,
    current_block: Vec<VersionedRow>,
    current_block_weight: u64,
    blocks: Vec<BlockMetaEntry>,
}

impl RowLayoutWriter {
    pub fn new(config: WriterConfig, seed: u64) -> Self {
        Self::with_codec(config, seed, Arc::new(JsonBlockCodec))
    }

    pub fn with_codec(config: WriterConfig, seed: u64, codec: Arc<dyn BlockCodec>) -> Self {
        let state = SharedWriterState::new(&config, seed);
        RowLayoutWriter { config, state, codec, current_block: Vec::new(), current_block_weight: 0, blocks: Vec::new() }
    }

    pub fn write(&mut self, rows: &[VersionedRow]) -> Result<()> {
        let is_first_write = self.state.row_count == 0;
        self.state.validate_and_track(rows)?;

        for (i, row) in rows.iter().enumerate() {
            self.state.maybe_sample(row, is_first_write && i == 0);
            self.current_block_weight += row_data_weight(row);
            self.current_block.push(row.clone());
            if self.current_block_weight >= self.config.block_size {
                self.flush_block()?;
            }
        }
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.current_block.is_empty() {
            return Ok(());
        }
        let last_key = self.current_block.last().unwrap().key.clone();
        let data = self.codec.encode(&self.current_block)?;
        self.blocks.push(BlockMetaEntry {
            last_key,
            chunk_row_count: self.state.row_count,
            block_index: self.blocks.len() as u32,
            data,
            group_name: String::new(),
        });
        self.current_block.clear();
        self.current_block_weight = 0;
        Ok(())
    }

    pub fn get_data_size(&self) -> u64 {
        self.state.data_weight
    }

    pub fn get_meta_size(&self) -> u64 {
        (self.blocks.len() * 64 + self.state.samples.len() * 16) as u64
    }

    pub fn row_count(&self) -> u64 {
        self.state.row_count
    }

    /// Flush the final partial block, freeze boundary keys, assemble the
    /// terminal chunk meta.
    pub fn close(mut self) -> Result<(ChunkMeta, Vec<BlockMetaEntry>)> {
        if self.state.row_count == 0 {
            bail!("close: empty chunks are not permitted");
        }
        self.flush_block()?;

        let boundary_keys = BoundaryKeys {
            min_key: encode_key(&self.blocks_min_key()),
            max_key: encode_key(&self.state.last_key.clone().unwrap_or_default()),
        };

        let misc = MiscExt {
            row_count: self.state.row_count,
            data_weight: self.state.data_weight,
            uncompressed_data_size: self.state.data_weight,
            compressed_data_size: self.state.data_weight,
            sorted: true,
            unique_keys: true,
            min_timestamp: self.state.min_timestamp,
            max_timestamp: self.state.max_timestamp,
            ..Default::default()
        };

        let meta = ChunkMeta {
            chunk_type: Some(ChunkType::Table),
            format: Some(crate::chunk::meta::ChunkFormat::VersionedSimple),
            misc: Some(misc),
            boundary_keys: Some(boundary_keys),
            block_count: self.blocks.len() as u32,
            system_block_count: 0,
        };

        Ok((meta, self.blocks))
    }

    fn blocks_min_key(&self) -> Vec<Value> {
        self.state.samples.first().cloned().unwrap_or_default()
    }
}

fn encode_key(key: &[Value]) -> Vec<u8> {
    serde_json::to_vec(key).unwrap_or_default()
}

/// A named group of columns sharing one physical block writer: columns
/// sharing an explicit group name share a data-block writer.
#[derive(Debug, Clone)]
pub struct ColumnGroup {
    pub name: String,
    pub column_ids: Vec<ColumnId>,
}

struct GroupState {
    group: ColumnGroup,
    accumulated_bytes: u64,
    pending_rows: Vec<VersionedRow>,
    blocks: Vec<BlockMetaEntry>,
}

impl GroupState {
    /// Encodes and stores whatever this group has pending as one block.
    /// No-op if nothing has accumulated since the last flush.
    fn flush(&mut self, codec: &dyn BlockCodec, chunk_row_count: u64) -> Result<()> {
        if self.pending_rows.is_empty() {
            self.accumulated_bytes = 0;
            return Ok(());
        }
        let last_key = self.pending_rows.last().unwrap().key.clone();
        let data = codec.encode(&self.pending_rows)?;
        self.blocks.push(BlockMetaEntry {
            last_key,
            chunk_row_count,
            block_index: self.blocks.len() as u32,
            data,
            group_name: self.group.name.clone(),
        });
        self.pending_rows.clear();
        self.accumulated_bytes = 0;
        Ok(())
    }
}

/// Columnar physical layout. Each [`ColumnGroup`] buffers the rows whose
/// columns it owns (key plus only that group's values) and flushes them
/// through the shared [`BlockCodec`] independently of the other groups.
pub struct ColumnarWriter {
    config: WriterConfig,
    state: SharedWriterState,
    codec: Arc<dyn BlockCodec>,
    groups: Vec<GroupState>,
    min_row_range_data_weight: u64,
    chunk_row_count: u64,
}

impl ColumnarWriter {
    pub fn new(config: WriterConfig, groups: Vec<ColumnGroup>, seed: u64) -> Self {
        Self::with_codec(config, groups, seed, Arc::new(JsonBlockCodec))
    }

    pub fn with_codec(config: WriterConfig, groups: Vec<ColumnGroup>, seed: u64, codec: Arc<dyn BlockCodec>) -> Self {
        let state = SharedWriterState::new(&config, seed);
        let groups = groups
            .into_iter()
            .map(|group| GroupState { group, accumulated_bytes: 0, pending_rows: Vec::new(), blocks: Vec::new() })
            .collect();
        ColumnarWriter { config, state, codec, groups, min_row_range_data_weight: MIN_ROW_RANGE_DATA_WEIGHT, chunk_row_count: 0 }
    }

    pub fn write(&mut self, rows: &[VersionedRow]) -> Result<()> {
        let is_first_write = self.state.row_count == 0;
        self.state.validate_and_track(rows)?;

        let mut target = self.config.data_to_block_flush;
        let mut start = 0usize;
        while start < rows.len() {
            let mut weight = 0u64;
            let mut end = start;
            while end < rows.len() && weight < target {
                self.state.maybe_sample(&rows[end], is_first_write && start == 0 && end == start);
                weight += row_data_weight(&rows[end]);
                end += 1;
            }

            self.chunk_row_count += (end - start) as u64;
            for group_state in &mut self.groups {
                let mut group_weight = 0u64;
                for r in &rows[start..end] {
                    let filtered_values: Vec<_> = r
                        .values
                        .iter()
                        .filter(|v| group_state.group.column_ids.contains(&v.column_id))
                        .cloned()
                        .collect();
                    if filtered_values.is_empty() {
                        continue;
                    }
                    group_weight += filtered_values.len() as u64 * 8;
                    group_state.pending_rows.push(VersionedRow {
                        key: r.key.clone(),
                        values: filtered_values,
                        delete_timestamps: r.delete_timestamps.clone(),
                    });
                }
                group_state.accumulated_bytes += group_weight;
            }

            let total: u64 = self.groups.iter().map(|g| g.accumulated_bytes).sum();
            if let Some((idx, max_bytes)) = self
                .groups
                .iter()
                .enumerate()
                .max_by_key(|(_, g)| g.accumulated_bytes)
                .map(|(i, g)| (i, g.accumulated_bytes))
            {
                if max_bytes > self.config.block_size || total > self.config.max_buffer_size {
                    self.groups[idx].flush(self.codec.as_ref(), self.chunk_row_count)?;
                }
                let total_after: u64 = self.groups.iter().map(|g| g.accumulated_bytes).sum();
                let max_after = self.groups.iter().map(|g| g.accumulated_bytes).max().unwrap_or(0);
                target = self
                    .config
                    .max_buffer_size
                    .saturating_sub(total_after)
                    .min(self.config.block_size.saturating_sub(max_after))
                    .max(self.min_row_range_data_weight);
            }

            start = end;
        }
        Ok(())
    }

    pub fn close(mut self) -> Result<(ChunkMeta, Vec<BlockMetaEntry>)> {
        if self.state.row_count == 0 {
            bail!("close: empty chunks are not permitted");
        }
        for group_state in &mut self.groups {
            group_state.flush(self.codec.as_ref(), self.chunk_row_count)?;
        }

        let block_count: u32 = self.groups.iter().map(|g| g.blocks.len() as u32).sum();
        let boundary_keys = BoundaryKeys {
            min_key: encode_key(self.state.samples.first().map(|s| s.as_slice()).unwrap_or(&[])),
            max_key: encode_key(&self.state.last_key.clone().unwrap_or_default()),
        };
        let misc = MiscExt {
            row_count: self.state.row_count,
            data_weight: self.state.data_weight,
            uncompressed_data_size: self.state.data_weight,
            compressed_data_size: self.state.data_weight,
            sorted: true,
            unique_keys: true,
            min_timestamp: self.state.min_timestamp,
            max_timestamp: self.state.max_timestamp,
            ..Default::default()
        };
        let meta = ChunkMeta {
            chunk_type: Some(ChunkType::Table),
            format: Some(crate::chunk::meta::ChunkFormat::VersionedColumnar),
            misc: Some(misc),
            boundary_keys: Some(boundary_keys),
            block_count,
            system_block_count: 0,
        };
        let blocks: Vec<BlockMetaEntry> = self.groups.into_iter().flat_map(|g| g.blocks).collect();
        Ok((meta, blocks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(key: i64, ts: u64, value: i64) -> VersionedRow {
        let mut r = VersionedRow::new(vec![Value::Int64(key)]);
        r.values.push(super::super::row::VersionedValue { column_id: 0, timestamp: ts, value: Value::Int64(value) });
        r
    }

    #[test]
    fn rejects_non_increasing_keys_within_a_batch() {
        let mut writer = RowLayoutWriter::new(WriterConfig::default(), 1);
        let rows = vec![row(2, 1, 1), row(1, 1, 2)];
        assert!(writer.write(&rows).is_err());
    }

    #[test]
    fn rejects_non_increasing_keys_across_batches() {
        let mut writer = RowLayoutWriter::new(WriterConfig::default(), 1);
        writer.write(&[row(5, 1, 1)]).unwrap();
        assert!(writer.write(&[row(4, 1, 1)]).is_err());
    }

    #[test]
    fn first_row_is_always_sampled() {
        let mut config = WriterConfig::default();
        config.sample_rate = 0.0;
        let mut writer = RowLayoutWriter::new(config, 42);
        writer.write(&[row(1, 1, 1), row(2, 1, 2)]).unwrap();
        assert_eq!(writer.state.samples.len(), 1);
        assert_eq!(writer.state.samples[0], vec![Value::Int64(1)]);
    }

    #[test]
    fn close_produces_sorted_unique_keys_misc() {
        let mut writer = RowLayoutWriter::new(WriterConfig::default(), 7);
        writer.write(&[row(1, 10, 1), row(2, 20, 2), row(3, 30, 3)]).unwrap();
        let (meta, blocks) = writer.close().unwrap();
        let misc = meta.misc.unwrap();
        assert_eq!(misc.row_count, 3);
        assert!(misc.sorted);
        assert_eq!(misc.min_timestamp, Some(10));
        assert_eq!(misc.max_timestamp, Some(30));
        assert_eq!(blocks.len(), 1);
    }

    #[test]
    fn small_block_size_splits_rows_into_multiple_blocks() {
        let mut config = WriterConfig::default();
        config.block_size = 1;
        let mut writer = RowLayoutWriter::new(config, 3);
        writer.write(&[row(1, 1, 1), row(2, 1, 2), row(3, 1, 3)]).unwrap();
        let (_, blocks) = writer.close().unwrap();
        assert_eq!(blocks.len(), 3);
    }

    #[test]
    fn columnar_writer_flushes_largest_group_first() {
        let config = WriterConfig { block_size: 16, max_buffer_size: 1024, data_to_block_flush: 8, ..WriterConfig::default() };
        let groups = vec![
            ColumnGroup { name: "a".into(), column_ids: vec![0] },
            ColumnGroup { name: "b".into(), column_ids: vec![1] },
        ];
        let mut writer = ColumnarWriter::new(config, groups, 9);
        let mut rows = Vec::new();
        for i in 0..20 {
            let mut r = VersionedRow::new(vec![Value::Int64(i)]);
            r.values.push(super::super::row::VersionedValue { column_id: 0, timestamp: 1, value: Value::Int64(i) });
            rows.push(r);
        }
        writer.write(&rows).unwrap();
        let (meta, blocks) = writer.close().unwrap();
        assert_eq!(meta.misc.unwrap().row_count, 20);
        assert!(meta.block_count >= 1);
        assert_eq!(blocks.len() as u32, meta.block_count);
        assert!(blocks.iter().all(|b| !b.data.is_empty()));
    }
}
