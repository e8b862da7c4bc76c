//! Append-only journal of indexing progress
//!
//! Tracks which `package@version` pairs have been indexed, which packages
//! are shadowed by a monorepo (`replace:`), and which identifiers are
//! re-checked on update runs (`track:`). Records are appended, never
//! rewritten. The file is flock'd for the lifetime of the handle so two
//! corediff processes cannot interleave writes; within one process an
//! internal mutex serializes mutation.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use parking_lot::Mutex;

use crate::error::{CorediffError, Result};

pub struct Manifest {
    state: Mutex<State>,
}

struct State {
    indexed: HashSet<String>,  // "package@version"
    replaced: HashSet<String>, // package name, no version
    tracked: HashSet<String>,  // bare package name or git URL
    file: File,
}

/// Derive the manifest path from a database path: replace a `.db` suffix
/// with `.manifest`, or append `.manifest`.
pub fn path_from_db(db_path: &Path) -> PathBuf {
    let s = db_path.to_string_lossy();
    match s.strip_suffix(".db") {
        Some(base) => PathBuf::from(format!("{base}.manifest")),
        None => PathBuf::from(format!("{s}.manifest")),
    }
}

impl Manifest {
    /// Open or create the manifest at `path`, taking an exclusive
    /// advisory lock held until the handle is dropped.
    pub fn load(path: &Path) -> Result<Manifest> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| CorediffError::Manifest {
                message: format!("opening {}: {e}", path.display()),
            })?;

        file.lock_exclusive().map_err(|e| CorediffError::Manifest {
            message: format!("locking {}: {e}", path.display()),
        })?;

        let mut indexed = HashSet::new();
        let mut replaced = HashSet::new();
        let mut tracked = HashSet::new();

        let reader = BufReader::new(file.try_clone()?);
        for line in reader.lines() {
            let line = line.map_err(|e| CorediffError::Manifest {
                message: format!("reading {}: {e}", path.display()),
            })?;
            if line.is_empty() {
                continue;
            }
            if let Some(pkg) = line.strip_prefix("replace:") {
                replaced.insert(pkg.to_string());
            } else if let Some(pkg) = line.strip_prefix("track:") {
                tracked.insert(pkg.to_string());
            } else if line.contains('@') {
                indexed.insert(line);
            }
            // Anything else is a malformed line; ignored on read.
        }

        let mut file = file;
        file.seek(SeekFrom::End(0))?;

        Ok(Manifest {
            state: Mutex::new(State {
                indexed,
                replaced,
                tracked,
                file,
            }),
        })
    }

    /// Whether `pkg@version` has been indexed.
    pub fn is_indexed(&self, pkg: &str, version: &str) -> bool {
        self.state.lock().indexed.contains(&format!("{pkg}@{version}"))
    }

    /// Record that `pkg@version` has been indexed. Idempotent; the first
    /// occurrence is appended to the file immediately.
    pub fn mark_indexed(&self, pkg: &str, version: &str) -> Result<()> {
        let key = format!("{pkg}@{version}");
        let mut st = self.state.lock();
        if st.indexed.contains(&key) {
            return Ok(());
        }
        writeln!(st.file, "{key}").map_err(write_err)?;
        st.indexed.insert(key);
        Ok(())
    }

    /// Whether `pkg` is shadowed by a monorepo.
    pub fn is_replaced(&self, pkg: &str) -> bool {
        self.state.lock().replaced.contains(pkg)
    }

    /// Record that `pkg` is shadowed by a monorepo. Idempotent.
    pub fn mark_replaced(&self, pkg: &str) -> Result<()> {
        let mut st = self.state.lock();
        if st.replaced.contains(pkg) {
            return Ok(());
        }
        writeln!(st.file, "replace:{pkg}").map_err(write_err)?;
        st.replaced.insert(pkg.to_string());
        Ok(())
    }

    /// Record that `identifier` (package name or git URL) should be
    /// re-checked by update runs. Idempotent.
    pub fn mark_tracked(&self, identifier: &str) -> Result<()> {
        let mut st = self.state.lock();
        if st.tracked.contains(identifier) {
            return Ok(());
        }
        writeln!(st.file, "track:{identifier}").map_err(write_err)?;
        st.tracked.insert(identifier.to_string());
        Ok(())
    }

    /// All identifiers marked for tracking.
    pub fn tracked_packages(&self) -> Vec<String> {
        self.state.lock().tracked.iter().cloned().collect()
    }

    /// Unique `vendor/name` package names among the indexed records.
    pub fn packages(&self) -> Vec<String> {
        let st = self.state.lock();
        let mut pkgs: HashSet<&str> = HashSet::new();
        for key in &st.indexed {
            if let Some(idx) = key.rfind('@') {
                if idx > 0 {
                    pkgs.insert(&key[..idx]);
                }
            }
        }
        pkgs.into_iter().map(str::to_string).collect()
    }
}

fn write_err(e: std::io::Error) -> CorediffError {
    CorediffError::Manifest {
        message: format!("writing to manifest: {e}"),
    }
}

impl Drop for Manifest {
    fn drop(&mut self) {
        let st = self.state.lock();
        let _ = st.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_from_db() {
        assert_eq!(
            path_from_db(Path::new("/tmp/corediff.db")),
            PathBuf::from("/tmp/corediff.manifest")
        );
        assert_eq!(
            path_from_db(Path::new("/tmp/hashes.bin")),
            PathBuf::from("/tmp/hashes.bin.manifest")
        );
    }

    #[test]
    fn test_mark_indexed_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("m.manifest");
        {
            let m = Manifest::load(&path).unwrap();
            m.mark_indexed("psr/log", "1.1.4").unwrap();
            m.mark_indexed("psr/log", "1.1.4").unwrap();
            assert!(m.is_indexed("psr/log", "1.1.4"));
            assert!(!m.is_indexed("psr/log", "2.0.0"));
        }
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "psr/log@1.1.4\n");
    }

    #[test]
    fn test_record_classification_on_reload() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("m.manifest");
        {
            let m = Manifest::load(&path).unwrap();
            m.mark_indexed("magento/magento2ce", "2.4.7").unwrap();
            m.mark_replaced("magento/module-catalog").unwrap();
            m.mark_tracked("psr/log").unwrap();
            m.mark_tracked("https://github.com/foo/bar.git").unwrap();
        }

        let m = Manifest::load(&path).unwrap();
        assert!(m.is_indexed("magento/magento2ce", "2.4.7"));
        assert!(m.is_replaced("magento/module-catalog"));
        let mut tracked = m.tracked_packages();
        tracked.sort();
        assert_eq!(tracked, vec!["https://github.com/foo/bar.git", "psr/log"]);
        assert_eq!(m.packages(), vec!["magento/magento2ce"]);
    }

    #[test]
    fn test_malformed_lines_ignored() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("m.manifest");
        std::fs::write(&path, "garbage line\n\npsr/log@1.1.4\nreplace:a/b\n").unwrap();

        let m = Manifest::load(&path).unwrap();
        assert!(m.is_indexed("psr/log", "1.1.4"));
        assert!(m.is_replaced("a/b"));
        assert!(m.tracked_packages().is_empty());
    }

    #[test]
    fn test_appends_preserve_existing_records() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("m.manifest");
        {
            let m = Manifest::load(&path).unwrap();
            m.mark_indexed("a/b", "1.0.0").unwrap();
        }
        {
            let m = Manifest::load(&path).unwrap();
            m.mark_indexed("c/d", "2.0.0").unwrap();
        }
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "a/b@1.0.0\nc/d@2.0.0\n");
    }
}
