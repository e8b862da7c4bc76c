//! Zip dist ingestion
//!
//! Downloads a release zipball (capped at 100 MiB), optionally caches it
//! under the cache dir keyed by the URL's digest, strips the GitHub-style
//! single-directory root prefix, and pushes every entry through the same
//! normalization + UTF-8 + hash pipeline as git trees.

use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use zip::ZipArchive;

use crate::error::{CorediffError, Result};
use crate::hashdb::HashDb;
use crate::normalize;

use super::IndexOptions;

const MAX_ZIP_SIZE: u64 = 100 * 1024 * 1024;

/// Download (or read from cache) the zip at `zip_url` and index its
/// contents into `db`.
pub fn index_zip(zip_url: &str, db: &mut HashDb, opts: &IndexOptions) -> Result<()> {
    let data = fetch_zip(zip_url, opts)?;
    index_zip_bytes(&data, db, opts)
}

/// Index zip bytes already in memory. Split out so tests can exercise the
/// pipeline without a network.
pub fn index_zip_bytes(data: &[u8], db: &mut HashDb, opts: &IndexOptions) -> Result<()> {
    let mut archive = ZipArchive::new(Cursor::new(data))?;

    let prefix = common_root_prefix(&archive);

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        if file.is_dir() {
            continue;
        }
        let raw_name = file.name().to_string();
        let name = raw_name.strip_prefix(&prefix).unwrap_or(&raw_name);
        if name.is_empty() {
            continue;
        }

        if !opts.all_valid_text && !normalize::has_valid_ext(name) {
            opts.log(3, format_args!("skip {name} (no valid ext)"));
            continue;
        }

        let mut content = Vec::with_capacity(file.size() as usize);
        if file.read_to_end(&mut content).is_err() {
            continue;
        }

        if !normalize::is_valid_utf8_prefix(&content[..content.len().min(8 * 1024)]) {
            opts.log(3, format_args!("skip {name} (invalid utf8)"));
            continue;
        }

        if !opts.no_platform {
            let stored_path = format!("{}{name}", opts.path_prefix);
            db.add(normalize::path_hash(&stored_path));
            opts.log(3, format_args!("hash {stored_path}"));
        } else {
            opts.log(3, format_args!("hash {name}"));
        }

        let verbose_hashes = opts.verbose >= 4;
        normalize::hash_reader(&content[..], |h, raw| {
            db.add(h);
            if verbose_hashes {
                eprintln!("      {h:016x} {}", String::from_utf8_lossy(raw));
            }
        })?;
    }

    Ok(())
}

/// The zip bytes for `zip_url`, preferring the cache when configured.
fn fetch_zip(zip_url: &str, opts: &IndexOptions) -> Result<Vec<u8>> {
    let Some(cache_dir) = &opts.cache_dir else {
        return download_zip(zip_url, opts);
    };

    let cache_path = zip_cache_path(cache_dir, zip_url);
    if let Ok(data) = std::fs::read(&cache_path) {
        opts.log(3, format_args!("cache hit {zip_url}"));
        return Ok(data);
    }

    let data = download_zip(zip_url, opts)?;
    if let Some(parent) = cache_path.parent() {
        if std::fs::create_dir_all(parent).is_ok() {
            if let Err(e) = std::fs::write(&cache_path, &data) {
                opts.log(1, format_args!("warning: caching zip: {e}"));
            }
        }
    }
    Ok(data)
}

fn download_zip(zip_url: &str, opts: &IndexOptions) -> Result<Vec<u8>> {
    let transport = opts.transport.as_ref().ok_or_else(|| CorediffError::Http {
        url: zip_url.to_string(),
        message: "no HTTP transport configured".to_string(),
    })?;

    let resp = transport.get(zip_url, &[])?;
    if !resp.is_success() {
        return Err(CorediffError::HttpStatus {
            status: resp.status,
            url: zip_url.to_string(),
        });
    }
    if resp.body.len() as u64 > MAX_ZIP_SIZE {
        return Err(CorediffError::Http {
            url: zip_url.to_string(),
            message: format!("zip exceeds {MAX_ZIP_SIZE} byte cap"),
        });
    }
    Ok(resp.body)
}

/// Deterministic cache file path for a zip URL.
pub fn zip_cache_path(cache_dir: &Path, zip_url: &str) -> PathBuf {
    let digest = Sha256::digest(zip_url.as_bytes());
    let key: String = digest[..12].iter().map(|b| format!("{b:02x}")).collect();
    cache_dir.join("zip").join(format!("{key}.zip"))
}

/// The shared top-level directory prefix across all entries, if any.
/// GitHub zipballs wrap everything in a single "repo-<sha>/" directory.
fn common_root_prefix<R: Read + std::io::Seek>(archive: &ZipArchive<R>) -> String {
    let mut prefix: Option<String> = None;
    for name in archive.file_names() {
        let Some(idx) = name.find('/') else {
            return String::new(); // top-level file, no common prefix
        };
        let candidate = &name[..=idx];
        match &prefix {
            None => prefix = Some(candidate.to_string()),
            Some(p) if p != candidate => return String::new(),
            Some(_) => {}
        }
    }
    prefix.unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gitindex::NullObserver;
    use std::io::Write;
    use zip::write::FileOptions;

    fn build_zip(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut w = zip::ZipWriter::new(&mut buf);
            for (name, content) in entries {
                w.start_file(*name, FileOptions::default()).unwrap();
                w.write_all(content.as_bytes()).unwrap();
            }
            w.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn test_zip_cache_path_is_stable() {
        let a = zip_cache_path(Path::new("/cache"), "https://example.com/a.zip");
        let b = zip_cache_path(Path::new("/cache"), "https://example.com/a.zip");
        let c = zip_cache_path(Path::new("/cache"), "https://example.com/b.zip");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("/cache/zip"));
        assert_eq!(a.extension().unwrap(), "zip");
        // 12 digest bytes as hex + ".zip"
        assert_eq!(a.file_name().unwrap().to_str().unwrap().len(), 24 + 4);
    }

    #[test]
    fn test_index_zip_strips_common_root() {
        let data = build_zip(&[
            ("log-abc123/src/Logger.php", "<?php\n$logger = new Logger($channel);\n"),
            ("log-abc123/README.md", "docs are not code\n"),
        ]);

        let obs = NullObserver;
        let mut opts = IndexOptions::new(&obs);
        opts.path_prefix = "vendor/psr/log/".to_string();

        let mut db = HashDb::new();
        index_zip_bytes(&data, &mut db, &opts).unwrap();

        assert!(db.contains(normalize::path_hash("vendor/psr/log/src/Logger.php")));
        assert!(!db.contains(normalize::path_hash("vendor/psr/log/README.md")));
        let mut line_hashes = Vec::new();
        normalize::hash_line(b"$logger = new Logger($channel);", |h| {
            line_hashes.push(h);
            true
        });
        assert!(db.contains(line_hashes[0]));
    }

    #[test]
    fn test_index_zip_no_common_root() {
        let data = build_zip(&[
            ("index.php", "<?php\necho render_page($request);\n"),
            ("lib/util.php", "<?php\nfunction util_helper($x) { return $x; }\n"),
        ]);

        let obs = NullObserver;
        let mut opts = IndexOptions::new(&obs);
        opts.path_prefix = "vendor/acme/site/".to_string();

        let mut db = HashDb::new();
        index_zip_bytes(&data, &mut db, &opts).unwrap();
        assert!(db.contains(normalize::path_hash("vendor/acme/site/index.php")));
        assert!(db.contains(normalize::path_hash("vendor/acme/site/lib/util.php")));
    }

    #[test]
    fn test_index_zip_skips_binary() {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut w = zip::ZipWriter::new(&mut buf);
            w.start_file("blob.php", FileOptions::default()).unwrap();
            w.write_all(&[0xff, 0xfe, 0x00, 0x01]).unwrap();
            w.finish().unwrap();
        }
        let data = buf.into_inner();

        let obs = NullObserver;
        let mut opts = IndexOptions::new(&obs);
        opts.path_prefix = "vendor/a/b/".to_string();

        let mut db = HashDb::new();
        index_zip_bytes(&data, &mut db, &opts).unwrap();
        assert_eq!(db.len(), 0);
    }

    #[test]
    fn test_all_valid_text_ingests_other_extensions() {
        let data = build_zip(&[("notes.txt", "a plain text line long enough to hash\n")]);

        let obs = NullObserver;
        let mut opts = IndexOptions::new(&obs);
        opts.all_valid_text = true;
        opts.no_platform = true;

        let mut db = HashDb::new();
        index_zip_bytes(&data, &mut db, &opts).unwrap();
        assert_eq!(db.len(), 1);
    }
}
