//! Append-only file changelog with a durable sparse index: exact header
//! signatures, a valid-index-prefix scan on open, and a "truncate to last
//! valid record, don't fail" recovery policy. Byte layout is hand-rolled
//! (`to_le_bytes`/`from_le_bytes`) rather than routed through a
//! serialization crate, since the on-disk header is a small fixed, versioned
//! binary format this module owns outright.

use std::convert::TryInto;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use thiserror::Error;

use crate::tools::{atomic_create, crc32, padded_len};

pub const DATA_SIGNATURE: u64 = 0x3330_3030_4443_5459; // "YTCD0003"
pub const INDEX_SIGNATURE: u64 = 0x3330_3030_4943_5459; // "YTCI0003"
const UNSEALED_SENTINEL: i64 = -1;
const DATA_HEADER_LEN: usize = 8 + 4 + 8; // signature, meta_size, sealed_record_count
const INDEX_HEADER_LEN: usize = 8 + 8; // signature, index_record_count
const INDEX_ENTRY_LEN: usize = 8 + 8; // record_id, file_position
const RECORD_HEADER_LEN: usize = 8 + 4 + 4; // record_id, data_size, checksum

#[derive(Debug, Error)]
pub enum ChangelogError {
    #[error("changelog is already open")]
    AlreadyOpen,
    #[error("data file signature mismatch: expected {expected:#x}, got {got:#x}")]
    SignatureMismatch { expected: u64, got: u64 },
    #[error("sealed record count {header} in header exceeds parsed record count {parsed}")]
    SealedCountMismatch { header: u64, parsed: u64 },
    #[error("changelog is not open")]
    NotOpen,
    #[error("changelog is already sealed")]
    AlreadySealed,
    #[error("changelog is not sealed")]
    NotSealed,
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    record_id: u64,
    file_position: u64,
}

struct Inner {
    data_file: File,
    index_file: File,
    meta: Vec<u8>,
    header_size: u64,
    index_header_offset: u64,
    sealed_record_count: Option<u64>,
    current_record_count: u64,
    current_file_position: u64,
    current_block_size: u64,
    index: Vec<IndexEntry>,
    index_block_size: u64,
    last_flushed: Option<SystemTime>,
}

/// Durable append-only record log. All operations serialise on one mutex:
/// thread-safe by a single lock, no async suspension mid-operation.
pub struct FileChangelog {
    data_path: PathBuf,
    index_path: PathBuf,
    inner: Mutex<Inner>,
}

fn encode_data_header(meta_size: u32, sealed_record_count: i64) -> [u8; DATA_HEADER_LEN] {
    let mut buf = [0u8; DATA_HEADER_LEN];
    buf[0..8].copy_from_slice(&DATA_SIGNATURE.to_le_bytes());
    buf[8..12].copy_from_slice(&meta_size.to_le_bytes());
    buf[12..20].copy_from_slice(&sealed_record_count.to_le_bytes());
    buf
}

fn decode_data_header(buf: &[u8]) -> Result<(u64, u32, i64)> {
    let signature = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let meta_size = u32::from_le_bytes(buf[8..12].try_into().unwrap());
    let sealed_record_count = i64::from_le_bytes(buf[12..20].try_into().unwrap());
    Ok((signature, meta_size, sealed_record_count))
}

fn encode_index_header(count: u64) -> [u8; INDEX_HEADER_LEN] {
    let mut buf = [0u8; INDEX_HEADER_LEN];
    buf[0..8].copy_from_slice(&INDEX_SIGNATURE.to_le_bytes());
    buf[8..16].copy_from_slice(&count.to_le_bytes());
    buf
}

fn encode_index_entry(entry: IndexEntry) -> [u8; INDEX_ENTRY_LEN] {
    let mut buf = [0u8; INDEX_ENTRY_LEN];
    buf[0..8].copy_from_slice(&entry.record_id.to_le_bytes());
    buf[8..16].copy_from_slice(&entry.file_position.to_le_bytes());
    buf
}

fn decode_index_entry(buf: &[u8]) -> IndexEntry {
    IndexEntry {
        record_id: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
        file_position: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
    }
}

struct ParsedRecord {
    record_id: u64,
    payload: Vec<u8>,
    total_len: u64,
}

/// Parses one `{header, padded payload}` record starting at `buf[pos..]`.
/// Returns `None` (not an error) if the bytes don't form a complete, valid
/// record — the caller decides whether that is a crash-recovery truncation
/// point or a fatal corruption.
fn try_parse_record(buf: &[u8], pos: usize) -> Option<(ParsedRecord, bool)> {
    if pos + RECORD_HEADER_LEN > buf.len() {
        return None;
    }
    let record_id = u64::from_le_bytes(buf[pos..pos + 8].try_into().ok()?);
    let data_size = u32::from_le_bytes(buf[pos + 8..pos + 12].try_into().ok()?) as usize;
    let checksum = u32::from_le_bytes(buf[pos + 12..pos + 16].try_into().ok()?);

    let payload_start = pos + RECORD_HEADER_LEN;
    if payload_start + data_size > buf.len() {
        return None;
    }
    let payload = buf[payload_start..payload_start + data_size].to_vec();
    let padded_payload = padded_len(data_size);
    if payload_start + padded_payload > buf.len() {
        return None;
    }

    let checksum_ok = crc32(&payload) == checksum;
    let total_len = (RECORD_HEADER_LEN + padded_payload) as u64;
    Some((ParsedRecord { record_id, payload, total_len }, checksum_ok))
}

impl FileChangelog {
    fn paths(path_prefix: impl AsRef<Path>) -> (PathBuf, PathBuf) {
        let prefix = path_prefix.as_ref();
        let data = prefix.with_extension("log");
        let index = prefix.with_extension("index");
        (data, index)
    }

    pub fn create(path_prefix: impl AsRef<Path>, meta: &[u8], index_block_size: u64) -> Result<Self> {
        let (data_path, index_path) = Self::paths(&path_prefix);
        if data_path.exists() || index_path.exists() {
            bail!(ChangelogError::AlreadyOpen);
        }

        let meta_padded_len = padded_len(meta.len());
        let header_size = (DATA_HEADER_LEN + meta_padded_len) as u64;

        let mut data_bytes = Vec::with_capacity(header_size as usize);
        data_bytes.extend_from_slice(&encode_data_header(meta.len() as u32, UNSEALED_SENTINEL));
        data_bytes.extend_from_slice(meta);
        data_bytes.resize(header_size as usize, 0);

        let data_file = atomic_create(&data_path, &data_bytes)?;
        let index_file = atomic_create(&index_path, &encode_index_header(0))?;

        Ok(FileChangelog {
            data_path,
            index_path,
            inner: Mutex::new(Inner {
                data_file,
                index_file,
                meta: meta.to_vec(),
                header_size,
                index_header_offset: INDEX_HEADER_LEN as u64,
                sealed_record_count: None,
                current_record_count: 0,
                current_file_position: header_size,
                current_block_size: 0,
                index: Vec::new(),
                index_block_size,
                last_flushed: None,
            }),
        })
    }

    pub fn open(path_prefix: impl AsRef<Path>, index_block_size: u64) -> Result<Self> {
        let (data_path, index_path) = Self::paths(&path_prefix);

        let mut data_file = OpenOptions::new().read(true).write(true).open(&data_path)?;
        let mut index_file = OpenOptions::new().read(true).write(true).open(&index_path)?;

        let mut data_header_buf = [0u8; DATA_HEADER_LEN];
        data_file.read_exact(&mut data_header_buf)?;
        let (signature, meta_size, sealed_record_count_raw) = decode_data_header(&data_header_buf)?;
        if signature != DATA_SIGNATURE {
            bail!(ChangelogError::SignatureMismatch { expected: DATA_SIGNATURE, got: signature });
        }

        let meta_padded_len = padded_len(meta_size as usize);
        let mut meta = vec![0u8; meta_padded_len];
        data_file.read_exact(&mut meta)?;
        meta.truncate(meta_size as usize);
        let header_size = (DATA_HEADER_LEN + meta_padded_len) as u64;

        let mut index_header_buf = [0u8; INDEX_HEADER_LEN];
        index_file.read_exact(&mut index_header_buf)?;
        let index_signature = u64::from_le_bytes(index_header_buf[0..8].try_into().unwrap());
        let index_record_count = u64::from_le_bytes(index_header_buf[8..16].try_into().unwrap());
        if index_signature != INDEX_SIGNATURE {
            bail!(ChangelogError::SignatureMismatch { expected: INDEX_SIGNATURE, got: index_signature });
        }

        let data_len = data_file.metadata()?.len();

        let mut raw_index = Vec::with_capacity(index_record_count as usize);
        for i in 0..index_record_count {
            let mut buf = [0u8; INDEX_ENTRY_LEN];
            let offset = INDEX_HEADER_LEN as u64 + i * INDEX_ENTRY_LEN as u64;
            if index_file.read_exact_at(&mut buf, offset).is_err() {
                break;
            }
            raw_index.push(decode_index_entry(&buf));
        }

        // Validate the index prefix: entry 0 must point at header_size /
        // record 0; later entries strictly increase in both dimensions;
        // entries pointing past the data file are discarded too.
        let mut index = Vec::with_capacity(raw_index.len());
        for (i, entry) in raw_index.iter().enumerate() {
            let valid = if i == 0 {
                entry.record_id == 0 && entry.file_position == header_size
            } else {
                let prev = raw_index[i - 1];
                entry.record_id > prev.record_id && entry.file_position > prev.file_position
            };
            if !valid || entry.file_position > data_len {
                break;
            }
            index.push(*entry);
        }
        if index.len() < raw_index.len() {
            log::warn!(
                "changelog {:?}: discarded {} trailing invalid index entries",
                data_path,
                raw_index.len() - index.len()
            );
        }

        // Forward scan from the last valid indexed offset, truncating at
        // the first corrupt or mismatched-id record (not fatal).
        let (scan_start_offset, mut expected_record_id) = match index.last() {
            Some(entry) => (entry.file_position, entry.record_id),
            None => (header_size, 0),
        };

        let mut tail = vec![0u8; (data_len - scan_start_offset) as usize];
        data_file.read_exact_at(&mut tail, scan_start_offset)?;

        let mut pos = 0usize;
        let mut current_file_position = scan_start_offset;
        let mut current_record_count = expected_record_id;
        let mut current_block_size = 0u64;
        let mut truncated = false;

        loop {
            match try_parse_record(&tail, pos) {
                Some((record, checksum_ok)) if checksum_ok && record.record_id == expected_record_id => {
                    pos += record.total_len as usize;
                    current_file_position += record.total_len;
                    current_block_size += record.total_len;
                    current_record_count += 1;
                    expected_record_id += 1;
                }
                _ => {
                    if pos < tail.len() {
                        truncated = true;
                    }
                    break;
                }
            }
        }

        if truncated {
            log::warn!(
                "changelog {:?}: truncated to last valid record {} on open",
                data_path,
                current_record_count
            );
            data_file.set_len(current_file_position)?;
        }

        let sealed_record_count = if sealed_record_count_raw == UNSEALED_SENTINEL {
            None
        } else {
            let header_count = sealed_record_count_raw as u64;
            if header_count > current_record_count {
                bail!(ChangelogError::SealedCountMismatch {
                    header: header_count,
                    parsed: current_record_count,
                });
            }
            Some(header_count)
        };

        // If sealed, excess records beyond sealedRecordCount are truncated.
        let mut final_record_count = current_record_count;
        let mut final_file_position = current_file_position;
        if let Some(sealed) = sealed_record_count {
            if sealed < current_record_count {
                log::warn!(
                    "changelog {:?}: sealed at {} records, truncating {} excess",
                    data_path,
                    sealed,
                    current_record_count - sealed
                );
                while index.last().map_or(false, |e| e.record_id >= sealed) {
                    index.pop();
                }
                let rescan_start = index.last().map(|e| e.file_position).unwrap_or(header_size);
                let rescan_start_id = index.last().map(|e| e.record_id).unwrap_or(0);
                let mut tail2 = vec![0u8; (current_file_position - rescan_start) as usize];
                data_file.read_exact_at(&mut tail2, rescan_start)?;
                let mut p = 0usize;
                let mut pos_acc = rescan_start;
                let mut id_acc = rescan_start_id;
                while id_acc < sealed {
                    let (record, ok) = try_parse_record(&tail2, p).expect("previously validated record");
                    assert!(ok, "checksum mismatch for sealed record during open");
                    p += record.total_len as usize;
                    pos_acc += record.total_len;
                    id_acc += 1;
                }
                final_record_count = sealed;
                final_file_position = pos_acc;
                data_file.set_len(final_file_position)?;
                index_file.set_len(INDEX_HEADER_LEN as u64 + index.len() as u64 * INDEX_ENTRY_LEN as u64)?;
                index_file.write_all_at(&encode_index_header(index.len() as u64), 0)?;
            }
        }

        Ok(FileChangelog {
            data_path,
            index_path,
            inner: Mutex::new(Inner {
                data_file,
                index_file,
                meta,
                header_size,
                index_header_offset: INDEX_HEADER_LEN as u64,
                sealed_record_count,
                current_record_count: final_record_count,
                current_file_position: final_file_position,
                current_block_size,
                index,
                index_block_size,
                last_flushed: None,
            }),
        })
    }

    pub fn record_count(&self) -> u64 {
        self.inner.lock().current_record_count
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.lock().sealed_record_count.is_some()
    }

    pub fn meta(&self) -> Vec<u8> {
        self.inner.lock().meta.clone()
    }

    /// Appends a record, returning its assigned index.
    pub fn append(&self, first_record_id: u64, records: &[Vec<u8>]) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.sealed_record_count.is_some() {
            bail!(ChangelogError::AlreadySealed);
        }
        if first_record_id != inner.current_record_count {
            bail!(
                "append: expected firstRecordId {} but got {}",
                inner.current_record_count,
                first_record_id
            );
        }

        let mut buf = Vec::new();
        let mut new_index_entries = Vec::new();
        let mut file_position = inner.current_file_position;
        let mut block_size = inner.current_block_size;
        let mut record_id = first_record_id;
        let first_append_ever = inner.index.is_empty();

        for (i, payload) in records.iter().enumerate() {
            let checksum = crc32(payload);
            let mut header = [0u8; RECORD_HEADER_LEN];
            header[0..8].copy_from_slice(&record_id.to_le_bytes());
            header[8..12].copy_from_slice(&(payload.len() as u32).to_le_bytes());
            header[12..16].copy_from_slice(&checksum.to_le_bytes());
            buf.extend_from_slice(&header);
            buf.extend_from_slice(payload);
            let pad = padded_len(payload.len()) - payload.len();
            buf.resize(buf.len() + pad, 0);

            let total_len = (RECORD_HEADER_LEN + padded_len(payload.len())) as u64;

            if (first_append_ever && i == 0) || block_size >= inner.index_block_size {
                new_index_entries.push(IndexEntry { record_id, file_position });
                block_size = 0;
            }
            block_size += total_len;
            file_position += total_len;
            record_id += 1;
        }

        inner.data_file.write_all_at(&buf, inner.current_file_position)?;

        for entry in &new_index_entries {
            let offset = inner.header_size_index_offset();
            inner.index_file.write_all_at(&encode_index_entry(*entry), offset)?;
            inner.index.push(*entry);
        }
        let count = inner.index.len() as u64;
        inner.index_file.write_all_at(&encode_index_header(count), 0)?;

        inner.current_file_position = file_position;
        inner.current_block_size = block_size;
        inner.current_record_count = record_id;

        Ok(())
    }

    /// Reads records starting at `from_index`, up to `max_records`.
    pub fn read(&self, first_record_id: u64, max_records: u64, max_bytes: u64) -> Result<Vec<Vec<u8>>> {
        let inner = self.inner.lock();
        if first_record_id >= inner.current_record_count || max_records == 0 {
            return Ok(Vec::new());
        }

        let lower_pos = inner
            .index
            .partition_point(|e| e.record_id <= first_record_id)
            - 1;
        let lower = inner.index[lower_pos];

        let target_exclusive_id = first_record_id + max_records;
        let byte_cap = lower.file_position.saturating_add(max_bytes);

        let mut upper_offset = inner.current_file_position;
        for entry in &inner.index[lower_pos + 1..] {
            if entry.record_id >= target_exclusive_id || entry.file_position > byte_cap {
                upper_offset = entry.file_position;
                break;
            }
        }
        upper_offset = upper_offset.min(byte_cap).min(inner.current_file_position);
        upper_offset = upper_offset.max(lower.file_position);

        let len = (upper_offset - lower.file_position) as usize;
        let mut envelope = vec![0u8; len];
        inner.data_file.read_exact_at(&mut envelope, lower.file_position)?;

        let mut out = Vec::new();
        let mut pos = 0usize;
        let mut record_id = lower.record_id;
        while pos < envelope.len() && record_id < first_record_id + max_records && record_id < inner.current_record_count {
            let (record, checksum_ok) = try_parse_record(&envelope, pos)
                .expect("envelope must contain only fully-written, already-validated records");
            if !checksum_ok {
                panic!("changelog checksum mismatch reading record {}", record.record_id);
            }
            if record.record_id >= first_record_id {
                out.push(record.payload.clone());
            }
            pos += record.total_len as usize;
            record_id += 1;
        }

        Ok(out)
    }

    /// Marks the changelog read-only; further appends are rejected.
    pub fn seal(&self, n: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.sealed_record_count.is_some() {
            bail!(ChangelogError::AlreadySealed);
        }
        if n > inner.current_record_count {
            bail!("seal: n={} exceeds current record count {}", n, inner.current_record_count);
        }

        if n < inner.current_record_count {
            let keep_pos = inner.index.partition_point(|e| e.record_id <= n);
            let base = if keep_pos == 0 { None } else { Some(inner.index[keep_pos - 1]) };
            let (start_pos, start_id) = base
                .map(|e| (e.file_position, e.record_id))
                .unwrap_or((inner.header_size, 0));

            let read_len = (inner.current_file_position - start_pos) as usize;
            let mut tail = vec![0u8; read_len];
            inner.data_file.read_exact_at(&mut tail, start_pos)?;

            let mut pos = 0usize;
            let mut file_pos = start_pos;
            let mut id = start_id;
            while id < n {
                let (record, ok) = try_parse_record(&tail, pos).expect("record within current_record_count must parse");
                assert!(ok, "checksum mismatch sealing record {}", record.record_id);
                pos += record.total_len as usize;
                file_pos += record.total_len;
                id += 1;
            }

            inner.index.retain(|e| e.record_id < n);
            let count = inner.index.len() as u64;
            inner.index_file.write_all_at(&encode_index_header(count), 0)?;
            inner.index_file.set_len(INDEX_HEADER_LEN as u64 + count * INDEX_ENTRY_LEN as u64)?;

            inner.data_file.set_len(file_pos)?;
            inner.current_file_position = file_pos;
            inner.current_record_count = n;
        }

        inner.sealed_record_count = Some(n);
        let header = encode_data_header(inner.meta.len() as u32, n as i64);
        inner.data_file.write_all_at(&header, 0)?;

        Ok(())
    }

    /// Clears the seal, allowing appends again.
    pub fn unseal(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.sealed_record_count.is_none() {
            bail!(ChangelogError::NotSealed);
        }
        inner.sealed_record_count = None;
        let header = encode_data_header(inner.meta.len() as u32, UNSEALED_SENTINEL);
        inner.data_file.write_all_at(&header, 0)?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.data_file.sync_all()?;
        inner.index_file.sync_all()?;
        inner.last_flushed = Some(SystemTime::now());
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        Ok(())
    }
}

impl Inner {
    fn header_size_index_offset(&self) -> u64 {
        self.index_header_offset + self.index.len() as u64 * INDEX_ENTRY_LEN as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn rec(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    #[test]
    fn s1_basic_roundtrip() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("000000001");
        let log = FileChangelog::create(&prefix, b"A", 64 * 1024).unwrap();
        log.append(0, &[rec("hello"), rec("world")]).unwrap();
        log.flush().unwrap();
        log.close().unwrap();

        let log = FileChangelog::open(&prefix, 64 * 1024).unwrap();
        let records = log.read(0, 2, u64::MAX).unwrap();
        assert_eq!(records, vec![rec("hello"), rec("world")]);
        assert_eq!(log.record_count(), 2);
    }

    #[test]
    fn s2_seal_truncates_and_persists() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("000000001");
        let log = FileChangelog::create(&prefix, b"A", 64 * 1024).unwrap();
        log.append(0, &[rec("hello"), rec("world")]).unwrap();
        log.append(2, &[rec("foo"), rec("bar"), rec("baz")]).unwrap();
        log.seal(3).unwrap();
        log.flush().unwrap();
        log.close().unwrap();

        let log = FileChangelog::open(&prefix, 64 * 1024).unwrap();
        assert_eq!(log.record_count(), 3);
        assert!(log.is_sealed());
        let records = log.read(0, 5, u64::MAX).unwrap();
        assert_eq!(records, vec![rec("hello"), rec("world"), rec("foo")]);
    }

    #[test]
    fn append_rejects_non_contiguous_record_id() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("log");
        let log = FileChangelog::create(&prefix, b"", 64 * 1024).unwrap();
        assert!(log.append(1, &[rec("x")]).is_err());
    }

    #[test]
    fn append_rejects_after_seal() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("log");
        let log = FileChangelog::create(&prefix, b"", 64 * 1024).unwrap();
        log.append(0, &[rec("x")]).unwrap();
        log.seal(1).unwrap();
        assert!(log.append(1, &[rec("y")]).is_err());
    }

    #[test]
    fn crash_recovery_truncates_torn_tail_write() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("log");
        {
            let log = FileChangelog::create(&prefix, b"", 64 * 1024).unwrap();
            log.append(0, &[rec("hello"), rec("world"), rec("durable")]).unwrap();
            log.flush().unwrap();
        }

        let (data_path, _index_path) = FileChangelog::paths(&prefix);
        let len = std::fs::metadata(&data_path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&data_path).unwrap();
        file.set_len(len - 3).unwrap();

        let log = FileChangelog::open(&prefix, 64 * 1024).unwrap();
        assert_eq!(log.record_count(), 2);
        let records = log.read(0, 10, u64::MAX).unwrap();
        assert_eq!(records, vec![rec("hello"), rec("world")]);
    }

    #[test]
    fn read_window_respects_max_records_and_offset() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("log");
        let log = FileChangelog::create(&prefix, b"", 64 * 1024).unwrap();
        let recs: Vec<Vec<u8>> = (0..10).map(|i| format!("rec-{}", i).into_bytes()).collect();
        log.append(0, &recs).unwrap();

        let out = log.read(3, 4, u64::MAX).unwrap();
        assert_eq!(out, recs[3..7].to_vec());
    }
}
