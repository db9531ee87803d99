//! Small filesystem and checksum helpers shared by the durable on-disk
//! formats (changelog, chunk store).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{bail, Error};

/// Write `data` to `path` via a temp file in the same directory followed by
/// an atomic rename, so a crash never leaves a torn file behind.
pub fn atomic_write<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<(), Error> {
    let path = path.as_ref();

    let mut tmp_path = path.to_owned();
    let mut ext = tmp_path
        .extension()
        .map(|e| e.to_os_string())
        .unwrap_or_default();
    ext.push(".tmp");
    tmp_path.set_extension(ext);

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|err| anyhow::anyhow!("create temp file {:?} failed: {}", tmp_path, err))?;

    if let Err(err) = file.write_all(data) {
        let _ = std::fs::remove_file(&tmp_path);
        bail!("write to {:?} failed: {}", tmp_path, err);
    }

    if let Err(err) = file.sync_all() {
        let _ = std::fs::remove_file(&tmp_path);
        bail!("fsync {:?} failed: {}", tmp_path, err);
    }

    if let Err(err) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        bail!("atomic rename {:?} -> {:?} failed: {}", tmp_path, path, err);
    }

    Ok(())
}

/// Like [`atomic_write`], but returns the freshly created `File` handle
/// (reopened read-write) instead of closing it, for callers that keep the
/// file open for subsequent appends (the changelog data/index files).
pub fn atomic_create<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<File, Error> {
    atomic_write(&path, data)?;
    let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
    Ok(file)
}

pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Pad `len` up to the next multiple of 8, for changelog/chunk on-disk
/// record padding (`pad(header) ∥ pad(payload)`).
pub fn padded_len(len: usize) -> usize {
    (len + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_len_rounds_up_to_8() {
        assert_eq!(padded_len(0), 0);
        assert_eq!(padded_len(1), 8);
        assert_eq!(padded_len(8), 8);
        assert_eq!(padded_len(9), 16);
    }

    #[test]
    fn atomic_write_survives_preexisting_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        atomic_write(&path, b"hello").unwrap();
        atomic_write(&path, b"world!!").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"world!!");
    }
}
