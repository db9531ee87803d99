//! Overlapping range merger. Heap-merges several key-sorted row streams
//! (one per chunk/reader) and resolves per-column values by latest write
//! timestamp, dropping anything dominated by a later delete timestamp. Uses
//! the same multi-source merge idiom the range reader borrows its cursor
//! contract from.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::row::{ColumnId, Timestamp, Value, VersionedRow, VersionedValue};

/// Emitted instead of a row batch when a source reader runs dry mid-merge,
/// so a caller can resume the merge once more data is available from that
/// source, rather than treating end-of-stream as final.
#[derive(Debug, Clone, PartialEq)]
pub struct UnreadDataDescriptor {
    pub source_index: usize,
    pub resume_from_key: Vec<Value>,
}

struct HeapEntry {
    key: Vec<Value>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the smallest key pops first.
        compare_super_keys(&other.key, &self.key)
    }
}

fn compare_super_keys(a: &[Value], b: &[Value]) -> Ordering {
    super::row::compare_keys(a, b)
}

/// A merge source: a key-sorted, already-fetched row list plus a cursor,
/// exactly what a real C2 reader would hand the merger after a `Read()`.
pub struct MergeSource {
    rows: Vec<VersionedRow>,
    cursor: usize,
}

impl MergeSource {
    pub fn new(rows: Vec<VersionedRow>) -> Self {
        MergeSource { rows, cursor: 0 }
    }

    fn peek(&self) -> Option<&VersionedRow> {
        self.rows.get(self.cursor)
    }

    fn advance(&mut self) -> Option<VersionedRow> {
        let row = self.rows.get(self.cursor).cloned();
        if row.is_some() {
            self.cursor += 1;
        }
        row
    }

    fn is_exhausted(&self) -> bool {
        self.cursor >= self.rows.len()
    }
}

/// Resolves every versioned value sharing one key across overlapping sources
/// into a single output row: per column, keep the value at the maximum
/// timestamp that is not dominated by a later (or equal) delete timestamp.
pub fn resolve(key: Vec<Value>, rows: Vec<VersionedRow>) -> Option<VersionedRow> {
    let max_delete_timestamp: Option<Timestamp> = rows.iter().flat_map(|r| r.delete_timestamps.iter().copied()).max();

    let mut by_column: std::collections::BTreeMap<ColumnId, VersionedValue> = std::collections::BTreeMap::new();
    for row in &rows {
        for value in &row.values {
            let entry = by_column.entry(value.column_id).or_insert_with(|| value.clone());
            if value.timestamp > entry.timestamp {
                *entry = value.clone();
            }
        }
    }

    by_column.retain(|_, v| max_delete_timestamp.map_or(true, |del| v.timestamp > del));

    if by_column.is_empty() && max_delete_timestamp.is_none() {
        return None;
    }
    if by_column.is_empty() {
        // Every write was deleted; still surface the row with no live
        // values so a caller can distinguish "never existed" from "deleted".
        return Some(VersionedRow { key, values: Vec::new(), delete_timestamps: vec![max_delete_timestamp.unwrap()] });
    }

    Some(VersionedRow {
        key,
        values: by_column.into_values().collect(),
        delete_timestamps: max_delete_timestamp.into_iter().collect(),
    })
}

/// Drives a heap-of-sources merge, resolving rows with equal keys across
/// sources as they're popped. Returns resolved rows up to `max_rows`, plus
/// any interruption descriptors for sources that went dry mid-merge.
pub struct OverlappingRangeMerger {
    sources: Vec<MergeSource>,
}

impl OverlappingRangeMerger {
    pub fn new(sources: Vec<MergeSource>) -> Self {
        OverlappingRangeMerger { sources }
    }

    pub fn merge(&mut self, max_rows: usize) -> (Vec<VersionedRow>, Vec<UnreadDataDescriptor>) {
        let mut output = Vec::new();
        let mut descriptors = Vec::new();

        loop {
            if output.len() >= max_rows {
                break;
            }
            let mut heap = BinaryHeap::new();
            for source in self.sources.iter() {
                if let Some(row) = source.peek() {
                    heap.push(HeapEntry { key: row.key.clone() });
                }
            }
            if heap.is_empty() {
                break;
            }

            let min_key = heap.peek().unwrap().key.clone();
            let mut matching_rows = Vec::new();
            for source in &mut self.sources {
                while let Some(row) = source.peek() {
                    if row.key == min_key {
                        matching_rows.push(source.advance().unwrap());
                    } else {
                        break;
                    }
                }
            }

            if let Some(resolved) = resolve(min_key, matching_rows) {
                output.push(resolved);
            }
        }

        for (idx, source) in self.sources.iter().enumerate() {
            if !source.is_exhausted() {
                descriptors.push(UnreadDataDescriptor {
                    source_index: idx,
                    resume_from_key: source.peek().unwrap().key.clone(),
                });
            }
        }

        (output, descriptors)
    }
}
