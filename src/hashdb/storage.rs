//! CDDB on-disk format
//!
//! Layout: 4-byte magic "CDDB", u32 LE version, u64 LE count, then
//! `count` u64 LE hashes. The count in the header is authoritative:
//! bytes past `16 + 8 * count` are the remnant of an interrupted append
//! and are ignored on read, truncated on the next write-open.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::{HashDb, DB_VERSION};
use crate::error::{CorediffError, Result};

const DB_MAGIC: &[u8; 4] = b"CDDB";
const HEADER_SIZE: u64 = 16;

/// Validate the magic and version, returning the declared hash count.
fn read_header(path: &Path, f: &mut impl Read) -> Result<u64> {
    let mut hdr = [0u8; HEADER_SIZE as usize];
    f.read_exact(&mut hdr)
        .map_err(|_| CorediffError::ShortDbFile {
            path: path.display().to_string(),
        })?;
    if &hdr[0..4] != DB_MAGIC {
        return Err(CorediffError::BadMagic {
            path: path.display().to_string(),
        });
    }
    let version = u32::from_le_bytes(hdr[4..8].try_into().unwrap());
    if version < DB_VERSION {
        return Err(CorediffError::StaleDbVersion { found: version });
    }
    if version > DB_VERSION {
        return Err(CorediffError::FutureDbVersion {
            found: version,
            supported: DB_VERSION,
        });
    }
    Ok(u64::from_le_bytes(hdr[8..16].try_into().unwrap()))
}

fn header_bytes(count: u64) -> [u8; HEADER_SIZE as usize] {
    let mut hdr = [0u8; HEADER_SIZE as usize];
    hdr[0..4].copy_from_slice(DB_MAGIC);
    hdr[4..8].copy_from_slice(&DB_VERSION.to_le_bytes());
    hdr[8..16].copy_from_slice(&count.to_le_bytes());
    hdr
}

fn read_hashes(path: &Path, f: File) -> Result<HashDb> {
    let size = f.metadata()?.len();
    let mut reader = BufReader::new(f);
    let count = read_header(path, &mut reader)?;

    let capacity = (size.saturating_sub(HEADER_SIZE)) / 8;
    if count > capacity {
        return Err(CorediffError::TruncatedDb { count, capacity });
    }

    let mut db = HashDb::with_capacity(count as usize);
    let mut buf = [0u8; 8];
    for _ in 0..count {
        reader.read_exact(&mut buf)?;
        db.add(u64::from_le_bytes(buf));
    }
    Ok(db)
}

/// Open a database read-only. A missing or zero-length file yields an
/// empty database.
pub fn load(path: &Path) -> Result<HashDb> {
    let f = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashDb::new()),
        Err(e) => return Err(e.into()),
    };
    if f.metadata()?.len() == 0 {
        return Ok(HashDb::new());
    }
    read_hashes(path, f)
}

/// Write `db` to `path` atomically: serialize next to the target, fsync,
/// rename over it.
pub fn save(path: &Path, db: &HashDb) -> Result<()> {
    let tmp = sibling_tmp(path);
    {
        let file = File::create(&tmp)?;
        let mut w = BufWriter::new(file);
        w.write_all(&header_bytes(db.len() as u64))?;
        for h in db.iter() {
            w.write_all(&h.to_le_bytes())?;
        }
        w.flush()?;
        w.get_ref().sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn sibling_tmp(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// A database opened for incremental writing.
///
/// All mutation happens under the internal mutex. Individual appends land
/// in the file immediately but stay invisible to readers until the header
/// count is flushed; [`merge`](WriteDb::merge) flushes after every batch
/// (data first, then the count), which is what makes an interrupted run
/// keep all previously merged packages.
pub struct WriteDb {
    path: PathBuf,
    state: Mutex<WriteState>,
}

struct WriteState {
    db: HashDb,
    file: File,
}

impl WriteDb {
    /// Open `path` for appending, creating it when absent. An existing
    /// file is validated, loaded, and truncated to the extent its header
    /// declares, dropping any interrupted-append remnant.
    pub fn open(path: &Path) -> Result<WriteDb> {
        let exists = path.exists() && std::fs::metadata(path)?.len() > 0;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let db = if exists {
            let db = read_hashes(path, file.try_clone()?)?;
            let valid_len = HEADER_SIZE + 8 * db.len() as u64;
            file.set_len(valid_len)?;
            file.seek(SeekFrom::End(0))?;
            db
        } else {
            file.write_all(&header_bytes(0))?;
            file.sync_all()?;
            HashDb::new()
        };

        Ok(WriteDb {
            path: path.to_path_buf(),
            state: Mutex::new(WriteState { db, file }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, h: u64) -> bool {
        self.state.lock().db.contains(h)
    }

    /// Insert `h` and append it to the file. Returns true when the hash
    /// was new. The header count is not updated here; call
    /// [`flush`](WriteDb::flush) or let a merge do it.
    pub fn add(&self, h: u64) -> Result<bool> {
        let mut st = self.state.lock();
        if !st.db.add(h) {
            return Ok(false);
        }
        st.file.write_all(&h.to_le_bytes())?;
        Ok(true)
    }

    /// Merge every hash from `other`, appending the previously-absent
    /// ones as a single batch. Data is fsynced before the header count is
    /// rewritten, so a crash in between leaves the old count pointing at
    /// fully-written data. Returns the number of new hashes.
    pub fn merge(&self, other: &HashDb) -> Result<usize> {
        let mut st = self.state.lock();

        let new: Vec<u64> = other.iter().filter(|h| !st.db.contains(*h)).collect();
        if new.is_empty() {
            return Ok(0);
        }

        let mut buf = Vec::with_capacity(new.len() * 8);
        for &h in &new {
            st.db.add(h);
            buf.extend_from_slice(&h.to_le_bytes());
        }
        st.file.write_all(&buf)?;
        st.file.sync_data()?;

        let count = st.db.len() as u64;
        st.file.seek(SeekFrom::Start(8))?;
        st.file.write_all(&count.to_le_bytes())?;
        st.file.sync_data()?;
        st.file.seek(SeekFrom::End(0))?;

        Ok(new.len())
    }

    pub fn len(&self) -> usize {
        self.state.lock().db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite the header count and fsync. Idempotent; called on close
    /// and from the signal handler.
    pub fn flush(&self) -> Result<()> {
        let mut st = self.state.lock();
        let count = st.db.len() as u64;
        st.file.seek(SeekFrom::Start(8))?;
        st.file.write_all(&count.to_le_bytes())?;
        st.file.sync_all()?;
        st.file.seek(SeekFrom::End(0))?;
        Ok(())
    }
}

impl Drop for WriteDb {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_db_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    #[test]
    fn test_fresh_db_file_size() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = tmp_db_path(&dir, "fresh.db");
        {
            let db = WriteDb::open(&path).unwrap();
            for h in [1u64, 2, 3] {
                db.add(h).unwrap();
            }
            db.flush().unwrap();
        }
        let size = std::fs::metadata(&path).unwrap().len();
        assert_eq!(size, 16 + 3 * 8);
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = tmp_db_path(&dir, "rt.db");

        let mut db = HashDb::new();
        for h in [0u64, 1, u64::MAX, 0xdeadbeef] {
            db.add(h);
        }
        save(&path, &db).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.len(), db.len());
        for h in db.iter() {
            assert!(loaded.contains(h));
        }
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = load(&tmp_db_path(&dir, "absent.db")).unwrap();
        assert!(db.is_empty());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = tmp_db_path(&dir, "bad.db");
        std::fs::write(&path, b"NOPE\x02\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00").unwrap();
        let err = load(&path).unwrap_err();
        assert!(matches!(err, CorediffError::BadMagic { .. }), "{err}");
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let dir = tempfile::TempDir::new().unwrap();

        let old = tmp_db_path(&dir, "old.db");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"CDDB");
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        std::fs::write(&old, &bytes).unwrap();
        assert!(matches!(
            load(&old).unwrap_err(),
            CorediffError::StaleDbVersion { found: 1 }
        ));

        let new = tmp_db_path(&dir, "new.db");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"CDDB");
        bytes.extend_from_slice(&9u32.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        std::fs::write(&new, &bytes).unwrap();
        assert!(matches!(
            load(&new).unwrap_err(),
            CorediffError::FutureDbVersion { found: 9, .. }
        ));
    }

    #[test]
    fn test_overlong_count_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = tmp_db_path(&dir, "long.db");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"CDDB");
        bytes.extend_from_slice(&DB_VERSION.to_le_bytes());
        bytes.extend_from_slice(&100u64.to_le_bytes());
        bytes.extend_from_slice(&42u64.to_le_bytes()); // only one hash present
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            load(&path).unwrap_err(),
            CorediffError::TruncatedDb { count: 100, capacity: 1 }
        ));
    }

    #[test]
    fn test_crash_remnant_ignored_and_truncated() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = tmp_db_path(&dir, "crash.db");

        // Committed state: 2 hashes with a flushed header.
        {
            let db = WriteDb::open(&path).unwrap();
            db.add(10).unwrap();
            db.add(20).unwrap();
            db.flush().unwrap();
        }

        // Simulate a crash mid-append: 10 hashes written past the end,
        // header count never updated.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            for h in 100u64..110 {
                f.write_all(&h.to_le_bytes()).unwrap();
            }
            f.sync_all().unwrap();
        }
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 16 + 12 * 8);

        // Read-only open: header count is authoritative.
        let db = load(&path).unwrap();
        assert_eq!(db.len(), 2);
        assert!(db.contains(10));
        assert!(!db.contains(100));

        // Write-open truncates the remnant.
        {
            let db = WriteDb::open(&path).unwrap();
            assert_eq!(db.len(), 2);
        }
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 16 + 2 * 8);
    }

    #[test]
    fn test_merge_persists_and_dedupes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = tmp_db_path(&dir, "merge.db");

        let db = WriteDb::open(&path).unwrap();
        db.add(1).unwrap();

        let mut batch = HashDb::new();
        batch.add(1);
        batch.add(2);
        batch.add(3);
        assert_eq!(db.merge(&batch).unwrap(), 2);
        assert_eq!(db.merge(&batch).unwrap(), 0);
        drop(db);

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.len(), 3);
        for h in [1, 2, 3] {
            assert!(loaded.contains(h));
        }
    }

    #[test]
    fn test_merge_survives_without_close() {
        // A merge alone must be durable: the header is flushed as part of
        // the two-phase write, no separate close required.
        let dir = tempfile::TempDir::new().unwrap();
        let path = tmp_db_path(&dir, "durable.db");

        let db = WriteDb::open(&path).unwrap();
        let mut batch = HashDb::new();
        batch.add(7);
        batch.add(8);
        db.merge(&batch).unwrap();
        std::mem::forget(db); // skip Drop's flush on purpose

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn test_reopen_appends_after_existing() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = tmp_db_path(&dir, "reopen.db");

        {
            let db = WriteDb::open(&path).unwrap();
            db.add(1).unwrap();
            db.flush().unwrap();
        }
        {
            let db = WriteDb::open(&path).unwrap();
            assert!(db.contains(1));
            db.add(2).unwrap();
            db.flush().unwrap();
        }

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.contains(1) && loaded.contains(2));
    }
}
