//! Git source driver and ref indexer
//!
//! Talks to git via subprocess calls for maximum compatibility: bare
//! clones (reused across runs when a cache dir is configured), tag
//! listing with annotated tags peeled to commits, and a long-lived
//! `cat-file --batch` child for blob reads.
//!
//! The ref indexer walks each version's tree newest-first and skips any
//! blob already hashed by a newer version. The blob id is git's content
//! address, so an identical id guarantees identical bytes and the skip
//! is exact.

mod zip;

pub use self::zip::{index_zip, index_zip_bytes, zip_cache_path};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::Instant;

use crate::composer::{self, LockPackage};
use crate::error::{CorediffError, Result};
use crate::hashdb::HashDb;
use crate::normalize;
use crate::transport::Transport;
use crate::version;

/// Observer for indexing progress. Callbacks fire on the worker thread;
/// `on_version_done` fires strictly after every hash for that version is
/// in the worker's private database, so a manifest record written from it
/// never points at missing hashes.
pub trait IndexObserver: Sync {
    fn on_version_done(&self, _version: &str) {}
    fn on_sub_package(&self, _name: &str, _version: &str) {}
}

/// A no-op observer for callers that do not record progress.
pub struct NullObserver;
impl IndexObserver for NullObserver {}

/// Configuration bundle passed through the indexing pipeline.
pub struct IndexOptions<'a> {
    /// Skip recording path hashes (content hashes only).
    pub no_platform: bool,
    /// Ingest any UTF-8 text file, not just recognized code extensions.
    pub all_valid_text: bool,
    /// Prepended to each file's stored path (e.g. "vendor/psr/log/").
    pub path_prefix: String,
    /// Display label for log lines when `path_prefix` is empty.
    pub repo_name: String,
    /// Directory for persistent git clones and zip downloads; None = temp.
    pub cache_dir: Option<PathBuf>,
    /// 1 = versions, 2 = HTTP, 3 = per-file, 4 = per-hash.
    pub verbose: u8,
    /// Collect composer.lock entries as extra ingest targets.
    pub collect_lock_deps: bool,
    /// Progress observer; use [`NullObserver`] when not recording.
    pub observer: &'a dyn IndexObserver,
    /// Transport for zip downloads.
    pub transport: Option<Transport>,
}

impl<'a> IndexOptions<'a> {
    pub fn new(observer: &'a dyn IndexObserver) -> Self {
        Self {
            no_platform: false,
            all_valid_text: false,
            path_prefix: String::new(),
            repo_name: String::new(),
            cache_dir: None,
            verbose: 0,
            collect_lock_deps: false,
            observer,
            transport: None,
        }
    }

    pub(crate) fn log(&self, level: u8, args: fmt::Arguments) {
        if self.verbose >= level {
            let indent = "  ".repeat(level as usize);
            eprintln!("{indent}{args}");
        }
    }

    /// Display label for a package: the path prefix without the vendor/
    /// wrapping, or the repo name.
    fn display_name(&self) -> String {
        let pkg = self
            .path_prefix
            .strip_prefix("vendor/")
            .unwrap_or(&self.path_prefix)
            .trim_end_matches('/');
        if pkg.is_empty() {
            self.repo_name.clone()
        } else {
            pkg.to_string()
        }
    }
}

/// Results from indexing a set of refs.
#[derive(Debug, Default)]
pub struct IndexResult {
    /// Package names from composer.json `replace` sections.
    pub replaces: Vec<String>,
    /// Unique deps from composer.lock across versions, minus replaced.
    pub lock_deps: Vec<LockPackage>,
}

/// A composer sub-package found inside a monorepo tree.
#[derive(Debug, Clone, PartialEq)]
pub struct SubPackage {
    pub name: String,    // e.g. "magento/module-catalog"
    pub version: String, // e.g. "104.0.7"
    pub dir: String,     // directory within repo, e.g. "app/code/Magento/Catalog/"
}

/// The canonical stored path for a file: files under a sub-package map to
/// `vendor/<sub-package-name>/...`, everything else gets the default
/// prefix. This makes a module indexed standalone and as part of a
/// monorepo produce identical path hashes.
pub fn resolve_stored_path(file_path: &str, sub_pkgs: &[SubPackage], default_prefix: &str) -> String {
    for sp in sub_pkgs {
        if let Some(rest) = file_path.strip_prefix(sp.dir.as_str()) {
            return format!("vendor/{}/{rest}", sp.name);
        }
    }
    format!("{default_prefix}{file_path}")
}

// ---------------------------------------------------------------------
// Git plumbing
// ---------------------------------------------------------------------

/// One file entry of a git tree: repo-relative path plus blob id.
#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub path: String,
    pub blob: String,
}

/// A bare git repository on disk, driven via subprocess.
pub struct GitRepo {
    dir: PathBuf,
}

impl GitRepo {
    /// Open an existing repository at `dir` without network access.
    pub fn open(dir: &Path) -> GitRepo {
        GitRepo {
            dir: dir.to_path_buf(),
        }
    }

    /// Open an existing clone at `dir` and fetch, or bare-clone `url`
    /// into it.
    pub fn open_or_clone(url: &str, dir: &Path, opts: &IndexOptions) -> Result<GitRepo> {
        if dir.join("HEAD").exists() {
            let repo = GitRepo { dir: dir.to_path_buf() };
            opts.log(1, format_args!("fetching {url}"));
            repo.git(&["fetch", "origin", "--tags", "--force", "--prune"])?;
            Ok(repo)
        } else {
            opts.log(1, format_args!("cloning {url}"));
            let dir_str = dir.to_string_lossy();
            run_git(None, &["clone", "--bare", url, dir_str.as_ref()])?;
            Ok(GitRepo { dir: dir.to_path_buf() })
        }
    }

    fn git(&self, args: &[&str]) -> Result<Vec<u8>> {
        run_git(Some(&self.dir), args)
    }

    /// Version tags mapped to their commit hashes. Annotated tags are
    /// peeled to the underlying commit; non-version tags are dropped.
    pub fn version_refs(&self) -> Result<HashMap<String, String>> {
        let out = self.git(&[
            "for-each-ref",
            "refs/tags",
            "--format=%(refname:short)%00%(objectname)%00%(*objectname)",
        ])?;

        let mut refs = HashMap::new();
        for line in out.split(|&b| b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&[u8]> = line.split(|&b| b == 0).collect();
            if fields.len() < 2 {
                continue;
            }
            let name = String::from_utf8_lossy(fields[0]).into_owned();
            if !version::is_version_tag(&name) {
                continue;
            }
            let object = String::from_utf8_lossy(fields[1]).into_owned();
            let peeled = fields
                .get(2)
                .map(|f| String::from_utf8_lossy(f).into_owned())
                .unwrap_or_default();
            refs.insert(name, if peeled.is_empty() { object } else { peeled });
        }
        Ok(refs)
    }

    /// HEAD's commit hash, if the repository has one.
    pub fn head(&self) -> Option<String> {
        self.git(&["rev-parse", "HEAD"])
            .ok()
            .map(|out| String::from_utf8_lossy(&out).trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// All file entries of the tree at `commit`.
    pub fn ls_tree(&self, commit: &str) -> Result<Vec<TreeEntry>> {
        let out = self.git(&["ls-tree", "-r", "-z", commit])?;
        let mut entries = Vec::new();
        for record in out.split(|&b| b == 0) {
            if record.is_empty() {
                continue;
            }
            // "<mode> <type> <object>\t<path>"
            let record = String::from_utf8_lossy(record);
            let Some((meta, path)) = record.split_once('\t') else {
                continue;
            };
            let mut fields = meta.split_whitespace();
            let _mode = fields.next();
            let kind = fields.next().unwrap_or("");
            let object = fields.next().unwrap_or("");
            if kind != "blob" || object.is_empty() {
                continue;
            }
            entries.push(TreeEntry {
                path: path.to_string(),
                blob: object.to_string(),
            });
        }
        Ok(entries)
    }

    /// Spawn a `cat-file --batch` child for repeated blob reads.
    pub fn blob_reader(&self) -> Result<BlobReader> {
        BlobReader::spawn(&self.dir)
    }
}

fn run_git(dir: Option<&Path>, args: &[&str]) -> Result<Vec<u8>> {
    let mut cmd = Command::new("git");
    if let Some(dir) = dir {
        cmd.arg("-C").arg(dir);
    }
    let output = cmd.args(args).output().map_err(|e| CorediffError::Git {
        command: args.join(" "),
        message: format!("failed to execute git: {e}"),
    })?;
    if !output.status.success() {
        return Err(CorediffError::Git {
            command: args.join(" "),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

/// Long-lived `git cat-file --batch` child. One round-trip per blob,
/// no per-file process spawn.
pub struct BlobReader {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl BlobReader {
    fn spawn(dir: &Path) -> Result<BlobReader> {
        let mut child = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(["cat-file", "--batch"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CorediffError::Git {
                command: "cat-file --batch".to_string(),
                message: e.to_string(),
            })?;
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = BufReader::new(child.stdout.take().expect("piped stdout"));
        Ok(BlobReader { child, stdin, stdout })
    }

    /// Read one blob's bytes. Returns None for missing objects.
    pub fn read(&mut self, object: &str) -> Result<Option<Vec<u8>>> {
        writeln!(self.stdin, "{object}")?;
        self.stdin.flush()?;

        let mut header = String::new();
        self.stdout.read_line(&mut header)?;
        let header = header.trim_end();
        if header.is_empty() || header.ends_with("missing") {
            return Ok(None);
        }

        // "<object> <type> <size>"
        let size: usize = header
            .rsplit(' ')
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| CorediffError::Git {
                command: "cat-file --batch".to_string(),
                message: format!("unexpected batch header {header:?}"),
            })?;

        let mut buf = vec![0u8; size];
        self.stdout.read_exact(&mut buf)?;
        let mut lf = [0u8; 1];
        self.stdout.read_exact(&mut lf)?;
        Ok(Some(buf))
    }
}

impl Drop for BlobReader {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

// ---------------------------------------------------------------------
// High-level entry points
// ---------------------------------------------------------------------

/// Replace slashes so a package name or URL is safe as a directory name.
pub fn sanitize_path(s: &str) -> String {
    s.replace('/', "-")
}

/// The clone directory for `key` (package name or URL): a stable subdir
/// of the cache when configured, otherwise a fresh temp dir whose guard
/// is returned to keep it alive.
pub fn clone_dir_for(key: &str, opts: &IndexOptions) -> Result<(PathBuf, Option<tempfile::TempDir>)> {
    match &opts.cache_dir {
        Some(cache) => {
            let dir = cache.join("git").join(sanitize_path(key));
            if let Some(parent) = dir.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Ok((dir, None))
        }
        None => {
            let tmp = tempfile::Builder::new().prefix("corediff-git-").tempdir()?;
            let dir = tmp.path().join("repo");
            Ok((dir, Some(tmp)))
        }
    }
}

/// Clone (or reuse) `url` and index the given version→ref map into `db`.
/// `cache_key` names the clone's cache subdirectory (usually the package
/// name, so one clone serves every version of a package).
pub fn clone_and_index(
    url: &str,
    cache_key: &str,
    refs: &HashMap<String, String>,
    db: &mut HashDb,
    opts: &IndexOptions,
) -> Result<IndexResult> {
    let (dir, _tmp) = clone_dir_for(cache_key, opts)?;
    let repo = GitRepo::open_or_clone(url, &dir, opts)?;
    Ok(index_refs(&repo, refs, db, opts))
}

/// Clone (or open and fetch) `url` and return the repo together with its
/// version tags, for callers that filter versions before indexing.
pub fn refs_from_tags(
    url: &str,
    clone_dir: &Path,
    opts: &IndexOptions,
) -> Result<(GitRepo, HashMap<String, String>)> {
    let repo = GitRepo::open_or_clone(url, clone_dir, opts)?;
    let refs = repo.version_refs()?;
    Ok((repo, refs))
}

/// The composer package path prefix for a repo, read from HEAD's
/// composer.json `name`. Empty when undeterminable.
pub fn composer_path_prefix(repo: &GitRepo) -> String {
    let Some(head) = repo.head() else {
        return String::new();
    };
    let Ok(entries) = repo.ls_tree(&head) else {
        return String::new();
    };
    let Some(entry) = entries.iter().find(|e| e.path == "composer.json") else {
        return String::new();
    };
    let Ok(mut blobs) = repo.blob_reader() else {
        return String::new();
    };
    match blobs.read(&entry.blob) {
        Ok(Some(content)) => {
            let name = composer::parse_name(&content);
            if name.is_empty() {
                String::new()
            } else {
                format!("vendor/{name}/")
            }
        }
        _ => String::new(),
    }
}

// ---------------------------------------------------------------------
// The ref indexer
// ---------------------------------------------------------------------

/// Index every version in `refs` into `db`, newest first. Failed refs
/// are logged and skipped; the remaining versions still index.
pub fn index_refs(
    repo: &GitRepo,
    refs: &HashMap<String, String>,
    db: &mut HashDb,
    opts: &IndexOptions,
) -> IndexResult {
    let mut versions: Vec<&String> = refs.keys().collect();
    versions.sort_by(|a, b| version::compare_desc(a, b));

    // Blob ids hashed so far, shared across versions. Newest-first order
    // means any blob an older release left untouched is skipped here.
    let mut seen_blobs: HashSet<String> = HashSet::new();

    let mut replace_set: HashSet<String> = HashSet::new();
    let mut lock_dep_set: HashMap<String, LockPackage> = HashMap::new();

    for version in versions {
        let commit = &refs[version];
        let entries = match index_ref(repo, version, commit, db, opts, &mut seen_blobs) {
            Ok(entries) => entries,
            Err(e) => {
                let short = &commit[..commit.len().min(12)];
                tracing::warn!("skipping {version} ({short}): {e}");
                continue;
            }
        };

        // Root composer.json: collect replace entries across versions.
        if let Some(content) = read_tree_file(repo, &entries, "composer.json") {
            if let Ok(pkgs) = composer::parse_replace(&content) {
                replace_set.extend(pkgs);
            }
        }

        // composer.lock: collect dependency pins across versions.
        if opts.collect_lock_deps {
            if let Some(content) = read_tree_file(repo, &entries, "composer.lock") {
                if let Ok(pkgs) = composer::parse_lock_packages(&content) {
                    for pkg in pkgs {
                        let key = format!("{}@{}", pkg.name, pkg.version);
                        lock_dep_set.entry(key).or_insert(pkg);
                    }
                }
            }
        }
    }

    // Replaced packages are supplied by this monorepo; indexing them
    // again from the registry would be redundant.
    let lock_deps = lock_dep_set
        .into_values()
        .filter(|dep| !replace_set.contains(&dep.name))
        .collect();

    IndexResult {
        replaces: replace_set.into_iter().collect(),
        lock_deps,
    }
}

fn read_tree_file(repo: &GitRepo, entries: &[TreeEntry], path: &str) -> Option<Vec<u8>> {
    let entry = entries.iter().find(|e| e.path == path)?;
    repo.blob_reader().ok()?.read(&entry.blob).ok()?
}

/// Index one version's tree. Returns the tree entries so the caller can
/// read root metadata files without a second ls-tree.
fn index_ref(
    repo: &GitRepo,
    version: &str,
    commit: &str,
    db: &mut HashDb,
    opts: &IndexOptions,
    seen_blobs: &mut HashSet<String>,
) -> Result<Vec<TreeEntry>> {
    let entries = repo.ls_tree(commit)?;

    // Pre-scan for embedded composer.json files so stored paths can be
    // rewritten to their canonical vendor form.
    let sub_pkgs = if !opts.no_platform && !opts.path_prefix.is_empty() {
        find_sub_packages(repo, &entries)
    } else {
        Vec::new()
    };

    let mut blobs = repo.blob_reader()?;
    let mut new_hashes = 0usize;
    let mut total_hashes = 0usize;
    let mut skipped_files = 0usize;
    let start = Instant::now();

    for entry in &entries {
        let stored_path = resolve_stored_path(&entry.path, &sub_pkgs, &opts.path_prefix);
        let (n, t) = index_file(&mut blobs, entry, &stored_path, db, opts, seen_blobs);
        if n == 0 && t == 0 {
            skipped_files += 1;
        }
        new_hashes += n;
        total_hashes += t;
    }

    let rate = total_hashes as f64 / start.elapsed().as_secs_f64().max(0.001);
    let pkg = opts.display_name();
    if skipped_files > 0 {
        opts.log(
            1,
            format_args!(
                "indexed {pkg}@{version} ({new_hashes} new, {total_hashes} total, {skipped_files} files skipped, {rate:.0} hash/sec)"
            ),
        );
    } else {
        opts.log(
            1,
            format_args!(
                "indexed {pkg}@{version} ({new_hashes} new, {total_hashes} total, {rate:.0} hash/sec)"
            ),
        );
    }

    opts.observer.on_version_done(version);
    for sp in &sub_pkgs {
        opts.observer.on_sub_package(&sp.name, &sp.version);
    }

    Ok(entries)
}

/// Scan tree entries for composer.json files below the root.
fn find_sub_packages(repo: &GitRepo, entries: &[TreeEntry]) -> Vec<SubPackage> {
    let mut blobs = match repo.blob_reader() {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!("scanning sub-packages: {e}");
            return Vec::new();
        }
    };

    let mut pkgs = Vec::new();
    for entry in entries {
        let Some(dir) = entry.path.strip_suffix("composer.json") else {
            continue;
        };
        if dir.is_empty() || !dir.ends_with('/') {
            continue; // root composer.json, or a file like "xcomposer.json"
        }
        let Ok(Some(content)) = blobs.read(&entry.blob) else {
            continue;
        };
        let name = composer::parse_name(&content);
        if name.is_empty() {
            continue;
        }
        pkgs.push(SubPackage {
            name,
            version: composer::parse_version(&content),
            dir: dir.to_string(),
        });
    }
    pkgs
}

/// Index a single file. Returns (new hashes, total hashes); (0, 0) means
/// the file was skipped.
fn index_file(
    blobs: &mut BlobReader,
    entry: &TreeEntry,
    stored_path: &str,
    db: &mut HashDb,
    opts: &IndexOptions,
    seen_blobs: &mut HashSet<String>,
) -> (usize, usize) {
    if !opts.all_valid_text && !normalize::has_valid_ext(&entry.path) {
        opts.log(3, format_args!("skip {} (no valid ext)", entry.path));
        return (0, 0);
    }

    // This exact content was hashed by a newer version already.
    if seen_blobs.contains(&entry.blob) {
        return (0, 0);
    }

    let content = match blobs.read(&entry.blob) {
        Ok(Some(c)) => c,
        _ => return (0, 0),
    };

    if !normalize::is_valid_utf8_prefix(&content[..content.len().min(8 * 1024)]) {
        opts.log(3, format_args!("skip {} (invalid utf8)", entry.path));
        // Don't re-read this blob in older versions either.
        seen_blobs.insert(entry.blob.clone());
        return (0, 0);
    }

    if !opts.no_platform {
        db.add(normalize::path_hash(stored_path));
        opts.log(3, format_args!("hash {stored_path}"));
    } else {
        opts.log(3, format_args!("hash {}", entry.path));
    }

    let mut added = 0usize;
    let mut total = 0usize;
    let verbose_hashes = opts.verbose >= 4;
    normalize::hash_reader(&content[..], |h, raw| {
        total += 1;
        if db.add(h) {
            added += 1;
        }
        if verbose_hashes {
            eprintln!("      {h:016x} {}", String::from_utf8_lossy(raw));
        }
    })
    .ok();

    seen_blobs.insert(entry.blob.clone());
    (added, total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_stored_path_monorepo() {
        let subs = vec![SubPackage {
            name: "magento/module-catalog".to_string(),
            version: "104.0.7".to_string(),
            dir: "app/code/Magento/Catalog/".to_string(),
        }];
        assert_eq!(
            resolve_stored_path("app/code/Magento/Catalog/Block/Product.php", &subs, "vendor/magento/magento2ce/"),
            "vendor/magento/module-catalog/Block/Product.php"
        );
        assert_eq!(
            resolve_stored_path("lib/internal/Magento/Framework/App.php", &subs, "vendor/magento/magento2ce/"),
            "vendor/magento/magento2ce/lib/internal/Magento/Framework/App.php"
        );
    }

    #[test]
    fn test_sanitize_path() {
        assert_eq!(sanitize_path("psr/log"), "psr-log");
        assert_eq!(
            sanitize_path("https://github.com/foo/bar.git"),
            "https:--github.com-foo-bar.git"
        );
    }

    #[test]
    fn test_display_name() {
        let obs = NullObserver;
        let mut opts = IndexOptions::new(&obs);
        opts.path_prefix = "vendor/psr/log/".to_string();
        assert_eq!(opts.display_name(), "psr/log");

        opts.path_prefix = String::new();
        opts.repo_name = "https://github.com/foo/bar.git".to_string();
        assert_eq!(opts.display_name(), "https://github.com/foo/bar.git");
    }
}
