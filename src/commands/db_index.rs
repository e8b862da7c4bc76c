//! The `db index` command
//!
//! One invocation runs exactly one mode: Packagist packages, a composer
//! project, an update pass over tracked packages, a single git URL, or
//! local directory trees. The network modes fan packages out over the
//! worker pool; each package indexes into a private set and merges into
//! the shared database, so an interrupted run keeps everything merged so
//! far.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use walkdir::WalkDir;

use crate::cli::IndexArgs;
use crate::composer::{self, LockPackage, Repository};
use crate::error::{CorediffError, Result};
use crate::gitindex::{self, IndexObserver, IndexOptions};
use crate::hashdb::{HashDb, WriteDb};
use crate::manifest::{self, Manifest};
use crate::merger::MergePool;
use crate::normalize;
use crate::packagist::{Client, Version};
use crate::platform::{self, Platform};
use crate::transport::{self, Transport};

const MAX_DOWNLOAD: u64 = 100 * 1024 * 1024;

pub fn run(
    verbose: u8,
    parallel: usize,
    database: Option<&Path>,
    cache_dir: Option<&Path>,
    args: &IndexArgs,
) -> Result<()> {
    validate_modes(args)?;

    let db_path = database
        .map(Path::to_path_buf)
        .ok_or_else(|| CorediffError::usage("--database is required for db index"))?;

    let db = Arc::new(WriteDb::open(&db_path)?);

    // Flush progress on Ctrl-C so hashes computed so far are not lost.
    {
        let db = db.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            eprintln!("\nInterrupted, flushing progress...");
            let _ = db.flush();
            std::process::exit(2);
        }) {
            tracing::warn!("installing signal handler: {e}");
        }
    }

    let single_git_url =
        !args.packagist && args.paths.len() == 1 && is_git_url(&args.paths[0]);
    let network_mode =
        args.packagist || args.composer.is_some() || args.update || single_git_url;

    let transport = if network_mode {
        let auth = composer::find_auth_config()?;
        match &auth {
            Some(ac) if !ac.is_empty() => {
                println!("Loaded composer auth for: {}", ac.hosts().join(", "));
            }
            _ => println!("No composer auth.json found"),
        }
        Some(transport::build_chain(auth, verbose, MAX_DOWNLOAD)?)
    } else {
        None
    };

    let ctx = IndexContext {
        db: &db,
        db_path,
        cache_dir: cache_dir.map(Path::to_path_buf),
        verbose,
        parallel,
        transport,
        no_platform: args.no_platform,
        all_valid_text: args.all_valid_text,
        ignore_paths: args.ignore_paths,
    };

    if network_mode {
        let mf = Manifest::load(&manifest::path_from_db(&ctx.db_path))?;
        if single_git_url {
            ctx.execute_git_url(&args.paths[0], &mf)?;
        } else if args.update {
            ctx.execute_update(&mf)?;
        } else if args.packagist {
            ctx.execute_packagist(&args.paths, &mf)?;
        } else {
            ctx.execute_composer(args.composer.as_ref().unwrap(), &mf)?;
        }
    } else {
        ctx.execute_local_paths(&args.paths)?;
    }

    db.flush()?;
    Ok(())
}

fn validate_modes(args: &IndexArgs) -> Result<()> {
    if args.packagist && args.composer.is_some() {
        return Err(CorediffError::usage(
            "cannot combine --packagist and --composer; use only one",
        ));
    }
    if args.packagist && args.update {
        return Err(CorediffError::usage(
            "cannot combine --packagist and --update; use only one",
        ));
    }
    if args.packagist && args.paths.is_empty() {
        return Err(CorediffError::usage(
            "--packagist requires at least one package name",
        ));
    }

    let modes = [
        args.packagist,
        args.composer.is_some(),
        args.update,
        !args.packagist && !args.paths.is_empty(),
    ]
    .iter()
    .filter(|m| **m)
    .count();
    if modes > 1 {
        return Err(CorediffError::usage(
            "cannot combine --packagist, --composer, --update, and <path>; use only one",
        ));
    }
    if modes == 0 {
        return Err(CorediffError::usage(
            "please provide --packagist, --composer, --update, or at least one <path>",
        ));
    }
    Ok(())
}

/// Whether `s` looks like a git URL.
pub fn is_git_url(s: &str) -> bool {
    s.contains("://") || s.starts_with("git@")
}

/// Optional version pin: "vendor/pkg:1.2.3" or "vendor/pkg@1.2.3", last
/// separator wins.
fn split_pin(raw: &str) -> (&str, Option<&str>) {
    match raw.rfind([':', '@']) {
        Some(i) if i > 0 => (&raw[..i], Some(&raw[i + 1..])),
        _ => (raw, None),
    }
}

struct IndexContext<'d> {
    db: &'d WriteDb,
    db_path: PathBuf,
    cache_dir: Option<PathBuf>,
    verbose: u8,
    parallel: usize,
    transport: Option<Transport>,
    no_platform: bool,
    all_valid_text: bool,
    ignore_paths: bool,
}

/// Observer that records each finished version in the manifest under a
/// fixed key (package name or git URL).
struct MarkIndexed<'a> {
    mf: &'a Manifest,
    key: String,
}

impl IndexObserver for MarkIndexed<'_> {
    fn on_version_done(&self, version: &str) {
        if let Err(e) = self.mf.mark_indexed(&self.key, version) {
            tracing::warn!("manifest write: {e}");
        }
    }
}

/// Observer for git URL indexing: manifest records plus a tally of
/// discovered embedded packages.
struct GitUrlObserver<'a> {
    mf: &'a Manifest,
    url: String,
    sub_pkgs: Mutex<HashSet<String>>,
}

impl IndexObserver for GitUrlObserver<'_> {
    fn on_version_done(&self, version: &str) {
        if let Err(e) = self.mf.mark_indexed(&self.url, version) {
            tracing::warn!("manifest write: {e}");
        }
    }

    fn on_sub_package(&self, name: &str, version: &str) {
        if !version.is_empty() {
            self.sub_pkgs.lock().insert(format!("{name}@{version}"));
        }
    }
}

impl IndexContext<'_> {
    fn base_opts<'a>(&self, observer: &'a dyn IndexObserver) -> IndexOptions<'a> {
        let mut opts = IndexOptions::new(observer);
        opts.no_platform = self.no_platform;
        opts.all_valid_text = self.all_valid_text;
        opts.cache_dir = self.cache_dir.clone();
        opts.verbose = self.verbose;
        opts.transport = self.transport.clone();
        opts
    }

    fn report_new_hashes(&self, old_size: usize) {
        let new = self.db.len() - old_size;
        if new > 0 {
            println!(
                "Computed {new} new hashes (saved incrementally to {})",
                self.db_path.display()
            );
        } else {
            println!("Found no new code hashes...");
        }
    }

    // -----------------------------------------------------------------
    // Packagist mode
    // -----------------------------------------------------------------

    fn execute_packagist(&self, pkgs: &[String], mf: &Manifest) -> Result<()> {
        let old_size = self.db.len();

        let pool = MergePool::new(self.parallel)?;
        pool.index_all(self.db, pkgs.to_vec(), |raw, private| {
            self.index_packagist_package(&raw, mf, private);
        });

        self.report_new_hashes(old_size);
        Ok(())
    }

    fn index_packagist_package(&self, raw: &str, mf: &Manifest, private: &mut HashDb) {
        let (pkg, pin) = split_pin(raw);

        // Bare (unpinned) packages are re-checked by later update runs.
        if pin.is_none() {
            if let Err(e) = mf.mark_tracked(pkg) {
                tracing::warn!("marking tracked {pkg}: {e}");
                return;
            }
        }

        let client = Client::new(self.transport());
        let mut versions = match client.versions(pkg) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("fetching versions for {pkg}: {e}");
                return;
            }
        };

        if let Some(pin) = pin {
            versions.retain(|v| v.version == pin);
            if versions.is_empty() {
                tracing::warn!("version {pin:?} not found for {pkg}");
                return;
            }
        }

        let total = versions.len();
        versions.retain(|v| !mf.is_indexed(pkg, &v.version));
        let skipped = total - versions.len();
        if skipped > 0 {
            println!("Skipping {skipped} already-indexed versions for {pkg}");
        }
        if versions.is_empty() {
            println!("All {total} versions of {pkg} already indexed");
            return;
        }

        let observer = MarkIndexed {
            mf,
            key: pkg.to_string(),
        };
        let mut opts = self.base_opts(&observer);
        opts.path_prefix = format!("vendor/{pkg}/");
        opts.log(1, format_args!("indexing {} new versions for {pkg}", versions.len()));

        let replaces = self.index_versions(pkg, &versions, private, &opts);
        for r in &replaces {
            if let Err(e) = mf.mark_replaced(r) {
                tracing::warn!("manifest write: {e}");
            }
        }
        if !replaces.is_empty() {
            println!(
                "Recorded {} replaced packages for {pkg} in manifest",
                replaces.len()
            );
        }
    }

    /// Index a package's versions: a single clone when the registry
    /// advertises a git source, per-version dist zips otherwise (or when
    /// the clone fails). Returns the replace declarations found.
    fn index_versions(
        &self,
        pkg: &str,
        versions: &[Version],
        db: &mut HashDb,
        opts: &IndexOptions,
    ) -> Vec<String> {
        if versions.is_empty() {
            return Vec::new();
        }

        if versions[0].source.kind == "git" && !versions[0].source.url.is_empty() {
            let repo_url = &versions[0].source.url;
            let refs: HashMap<String, String> = versions
                .iter()
                .filter(|v| !v.source.reference.is_empty())
                .map(|v| (v.version.clone(), v.source.reference.clone()))
                .collect();

            match gitindex::clone_and_index(repo_url, pkg, &refs, db, opts) {
                Ok(result) => return result.replaces,
                Err(e) => {
                    tracing::warn!("git clone failed for {pkg}: {e}, falling back to zip");
                }
            }
        }

        for v in versions {
            if v.dist.url.is_empty() {
                continue;
            }
            opts.log(1, format_args!("downloading {} ({})", v.version, v.dist.url));
            match gitindex::index_zip(&v.dist.url, db, opts) {
                Ok(()) => opts.observer.on_version_done(&v.version),
                Err(e) => tracing::warn!("skipping {pkg} {}: {e}", v.version),
            }
        }
        Vec::new()
    }

    // -----------------------------------------------------------------
    // Composer project mode
    // -----------------------------------------------------------------

    fn execute_composer(&self, composer_json: &Path, mf: &Manifest) -> Result<()> {
        let mut proj = composer::parse_project(composer_json)?;

        let config_repos = composer::find_config_repos()?;
        if !config_repos.is_empty() {
            let urls: Vec<&str> = config_repos.iter().map(|r| r.url.as_str()).collect();
            println!("Loaded composer config repos: {}", urls.join(", "));
            proj.repos.extend(config_repos);
        }

        let mut new_pkgs = Vec::new();
        let mut skipped = 0usize;
        let mut replaced = 0usize;
        for pkg in proj.packages {
            if mf.is_indexed(&pkg.name, &pkg.version) {
                skipped += 1;
            } else if mf.is_replaced(&pkg.name) {
                replaced += 1;
            } else {
                new_pkgs.push(pkg);
            }
        }

        let total = new_pkgs.len() + skipped + replaced;
        print!("Found {total} packages across {} repositories", proj.repos.len());
        if skipped > 0 || replaced > 0 {
            let mut parts = Vec::new();
            if skipped > 0 {
                parts.push(format!("{skipped} already indexed"));
            }
            if replaced > 0 {
                parts.push(format!("{replaced} replaced by monorepo"));
            }
            print!(" ({})", parts.join(", "));
        }
        println!();

        if new_pkgs.is_empty() {
            println!("All packages already indexed");
            return Ok(());
        }

        let old_size = self.db.len();
        let repos = proj.repos;

        let pool = MergePool::new(self.parallel)?;
        pool.index_all(self.db, new_pkgs, |pkg, private| {
            self.index_composer_package(&pkg, &repos, private);
            if let Err(e) = mf.mark_indexed(&pkg.name, &pkg.version) {
                tracing::warn!("manifest write: {e}");
            }
        });

        self.report_new_hashes(old_size);
        Ok(())
    }

    /// Index one lock-file package: prefer its pinned source/dist, fall
    /// back to looking the package up in each configured repository.
    fn index_composer_package(
        &self,
        pkg: &LockPackage,
        repos: &[Repository],
        private: &mut HashDb,
    ) {
        println!("Indexing {} ({})", pkg.name, pkg.version);

        let observer = gitindex::NullObserver;
        let mut opts = self.base_opts(&observer);
        opts.path_prefix = format!("vendor/{}/", pkg.name);

        if !pkg.source.url.is_empty() || !pkg.dist.url.is_empty() {
            let v = Version::from_lock(pkg);
            self.index_versions(&pkg.name, &[v], private, &opts);
            return;
        }

        for repo in repos {
            if self
                .index_from_repo(&pkg.name, &repo.url, private, &opts)
                .is_ok()
            {
                return;
            }
        }
        tracing::warn!("package {} not found in any repository", pkg.name);
    }

    fn index_from_repo(
        &self,
        pkg: &str,
        repo_url: &str,
        private: &mut HashDb,
        opts: &IndexOptions,
    ) -> Result<()> {
        let client = Client::with_base_url(repo_url, self.transport());
        let versions = client.versions(pkg)?;
        opts.log(1, format_args!("found {} versions for {pkg}", versions.len()));
        self.index_versions(pkg, &versions, private, opts);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Update mode
    // -----------------------------------------------------------------

    fn execute_update(&self, mf: &Manifest) -> Result<()> {
        let tracked = mf.tracked_packages();
        if tracked.is_empty() {
            return Err(CorediffError::usage(
                "no tracked packages, nothing to update; add packages with --packagist or a git URL first",
            ));
        }

        // Replaced packages are provided by a monorepo and skipped.
        let mut git_urls = Vec::new();
        let mut packagist_pkgs = Vec::new();
        let mut replaced = 0usize;
        for pkg in tracked {
            if is_git_url(&pkg) {
                git_urls.push(pkg);
            } else if mf.is_replaced(&pkg) {
                replaced += 1;
            } else {
                packagist_pkgs.push(pkg);
            }
        }

        print!(
            "Checking {} packages for new versions",
            packagist_pkgs.len() + git_urls.len()
        );
        if !git_urls.is_empty() || replaced > 0 {
            let mut parts = Vec::new();
            if !packagist_pkgs.is_empty() {
                parts.push(format!("{} packagist", packagist_pkgs.len()));
            }
            if !git_urls.is_empty() {
                parts.push(format!("{} git", git_urls.len()));
            }
            if replaced > 0 {
                parts.push(format!("{replaced} replaced, skipped"));
            }
            print!(" ({})", parts.join(", "));
        }
        println!("...");

        enum Target {
            Packagist(String),
            Git(String),
        }
        let targets: Vec<Target> = packagist_pkgs
            .into_iter()
            .map(Target::Packagist)
            .chain(git_urls.into_iter().map(Target::Git))
            .collect();

        let old_size = self.db.len();
        let pool = MergePool::new(self.parallel)?;
        pool.index_all(self.db, targets, |target, private| match target {
            Target::Packagist(pkg) => self.update_packagist_entry(&pkg, mf, private),
            Target::Git(url) => self.update_git_url_entry(&url, mf, private),
        });

        let new = self.db.len() - old_size;
        if new > 0 {
            println!(
                "Computed {new} new hashes (saved incrementally to {})",
                self.db_path.display()
            );
        } else {
            println!("All packages up to date, no new hashes");
        }
        Ok(())
    }

    fn update_packagist_entry(&self, pkg: &str, mf: &Manifest, private: &mut HashDb) {
        let client = Client::new(self.transport());
        let mut versions = match client.versions(pkg) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("fetching versions for {pkg}: {e}");
                return;
            }
        };

        versions.retain(|v| !mf.is_indexed(pkg, &v.version));
        if versions.is_empty() {
            if self.verbose >= 1 {
                eprintln!("  {pkg}: up to date");
            }
            return;
        }
        println!("  {pkg}: {} new versions", versions.len());

        let observer = MarkIndexed {
            mf,
            key: pkg.to_string(),
        };
        let mut opts = self.base_opts(&observer);
        opts.path_prefix = format!("vendor/{pkg}/");

        let replaces = self.index_versions(pkg, &versions, private, &opts);
        for r in &replaces {
            if let Err(e) = mf.mark_replaced(r) {
                tracing::warn!("manifest write: {e}");
            }
        }
    }

    /// Fetch new tags from a git URL and index versions the manifest has
    /// not seen. Dependencies pinned by the repo's composer.lock files
    /// are indexed afterwards, one clone per dependency package.
    fn update_git_url_entry(&self, url: &str, mf: &Manifest, private: &mut HashDb) {
        let probe_observer = gitindex::NullObserver;
        let base = self.base_opts(&probe_observer);

        let (clone_dir, _tmp) = match gitindex::clone_dir_for(url, &base) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("creating clone dir for {url}: {e}");
                return;
            }
        };

        let (repo, mut refs) = match gitindex::refs_from_tags(url, &clone_dir, &base) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("fetching tags for {url}: {e}");
                return;
            }
        };

        let total = refs.len();
        refs.retain(|version, _| !mf.is_indexed(url, version));
        if refs.is_empty() {
            if self.verbose >= 1 {
                eprintln!("  {url}: up to date ({total} versions)");
            }
            return;
        }
        println!("  {url}: {} new versions", refs.len());

        let observer = GitUrlObserver {
            mf,
            url: url.to_string(),
            sub_pkgs: Mutex::new(HashSet::new()),
        };
        let mut opts = self.base_opts(&observer);
        opts.repo_name = url.to_string();
        opts.collect_lock_deps = true;
        if !opts.no_platform && opts.path_prefix.is_empty() {
            opts.path_prefix = gitindex::composer_path_prefix(&repo);
        }

        let result = gitindex::index_refs(&repo, &refs, private, &opts);

        let sub_count = observer.sub_pkgs.lock().len();
        if sub_count > 0 {
            println!("Indexed {sub_count} embedded packages");
        }

        for r in &result.replaces {
            if let Err(e) = mf.mark_replaced(r) {
                tracing::warn!("manifest write: {e}");
            }
        }

        if result.lock_deps.is_empty() {
            return;
        }

        // Group lock deps by package so each dependency clones once.
        let mut deps_by_pkg: HashMap<String, Vec<LockPackage>> = HashMap::new();
        for dep in result.lock_deps {
            if !mf.is_indexed(&dep.name, &dep.version) && !mf.is_replaced(&dep.name) {
                deps_by_pkg.entry(dep.name.clone()).or_default().push(dep);
            }
        }
        if deps_by_pkg.is_empty() {
            return;
        }

        let total_versions: usize = deps_by_pkg.values().map(Vec::len).sum();
        println!(
            "Found {} dependency packages ({total_versions} versions) from composer.lock files",
            deps_by_pkg.len()
        );

        for (pkg_name, deps) in deps_by_pkg {
            let versions: Vec<Version> = deps.iter().map(Version::from_lock).collect();

            let dep_observer = MarkIndexed {
                mf,
                key: pkg_name.clone(),
            };
            let mut dep_opts = self.base_opts(&dep_observer);
            dep_opts.path_prefix = format!("vendor/{pkg_name}/");
            // No recursion: a dependency's own lock file is not followed.
            dep_opts.collect_lock_deps = false;

            self.index_versions(&pkg_name, &versions, private, &dep_opts);
        }
    }

    // -----------------------------------------------------------------
    // Single git URL mode
    // -----------------------------------------------------------------

    fn execute_git_url(&self, url: &str, mf: &Manifest) -> Result<()> {
        mf.mark_tracked(url)?;

        let old_size = self.db.len();
        let mut private = HashDb::new();
        self.update_git_url_entry(url, mf, &mut private);
        self.db.merge(&private)?;

        self.report_new_hashes(old_size);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Local tree mode
    // -----------------------------------------------------------------

    fn execute_local_paths(&self, paths: &[String]) -> Result<()> {
        let mut plat: Option<Platform> = None;
        for p in paths {
            let meta = std::fs::metadata(p)
                .map_err(|e| CorediffError::usage(format!("cannot stat {p:?}: {e}")))?;
            if meta.is_dir() && !self.no_platform && !self.ignore_paths {
                plat = platform::detect(Path::new(p));
                if plat.is_none() {
                    return Err(CorediffError::usage(format!(
                        "path {p:?} does not seem to be an application root path; \
                         try again with a proper root path, or use --no-platform"
                    )));
                }
            }
        }

        let old_size = self.db.len();
        for p in paths {
            println!("Calculating checksums for {p}");
            self.add_path(Path::new(p), plat)?;
            println!();
        }

        self.report_new_hashes(old_size);
        Ok(())
    }

    fn add_path(&self, root: &Path, plat: Option<Platform>) -> Result<()> {
        let excludes = plat.map(|p| p.exclude_set());

        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("walking {}: {e}", root.display());
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let rel = path
                .strip_prefix(root)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");

            if !self.all_valid_text && !normalize::has_valid_ext(&rel) {
                self.log_file(3, &format!("skip {rel} (no code)"));
                continue;
            }
            if !normalize::is_valid_utf8_file(path) {
                self.log_file(3, &format!("skip {rel} (invalid utf8)"));
                continue;
            }

            let excluded = excludes.as_ref().is_some_and(|g| g.is_match(&rel));
            if !self.ignore_paths && !self.no_platform && path != root && !excluded {
                self.db.add(normalize::path_hash(&rel))?;
            }

            let file = std::fs::File::open(path)?;
            let mut added = 0usize;
            normalize::hash_reader(file, |h, _raw| {
                match self.db.add(h) {
                    Ok(true) => added += 1,
                    Ok(false) => {}
                    Err(e) => tracing::warn!("appending hash: {e}"),
                }
            })?;

            if added > 0 {
                self.log_file(1, &format!(" U {rel}"));
            } else {
                self.log_file(3, &format!(" - {rel}"));
            }
        }
        Ok(())
    }

    fn log_file(&self, level: u8, msg: &str) {
        if self.verbose >= level {
            eprintln!("{msg}");
        }
    }

    fn transport(&self) -> Transport {
        self.transport
            .clone()
            .expect("transport is configured for network modes")
    }
}
