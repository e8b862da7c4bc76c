//! The `scan` command
//!
//! Opens the database read-only, walks the target paths, and reports
//! lines whose hashes are unknown. Files whose path hash is absent are
//! classified as custom code and skipped: their content was never part
//! of an upstream release, so line-level comparison is meaningless.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use console::style;

use crate::cli::ScanArgs;
use crate::error::{CorediffError, Result};
use crate::hashdb::{self, HashDb};
use crate::highlight;
use crate::normalize;
use crate::platform::{self, Platform};

#[derive(Default)]
struct WalkStats {
    total_files: usize,
    files_with_suspect_lines: usize,
    files_with_changes: usize,
    files_without_changes: usize,
    files_no_code: usize,
    files_custom_code: usize,
    undetected_paths: Vec<String>,
}

impl WalkStats {
    fn percentage(&self, of: usize) -> f64 {
        if self.total_files == 0 {
            return 0.0;
        }
        of as f64 / self.total_files as f64 * 100.0
    }
}

pub fn run(verbose: u8, args: &ScanArgs) -> Result<()> {
    if !args.database.exists() {
        return Err(CorediffError::usage(format!(
            "database {} does not exist",
            args.database.display()
        )));
    }
    let db = hashdb::load(&args.database)?;

    println!(
        "{}",
        style(format!(
            "Corediff {} loaded {} precomputed hashes.",
            env!("CARGO_PKG_VERSION"),
            db.len()
        ))
        .white()
        .bright()
        .bold()
    );
    println!("Using database: {}", args.database.display());

    let without = if args.all_valid_text { "text" } else { "code" };

    for path in &args.paths {
        let path = validate_path(path)?;
        let plat = platform_for(&path, args)?;
        let stats = walk_path(&path, &db, args, plat, verbose);

        println!("\n===============================================================================");
        println!(
            " Corediff completed scanning {} files in {}",
            stats.total_files,
            path.display()
        );
        print_stat(
            "Files with unrecognized lines      ",
            stats.files_with_changes,
            &stats,
            |s| style(s).red().bright().bold().to_string(),
        );
        print_stat(
            "Files with suspect lines           ",
            stats.files_with_suspect_lines,
            &stats,
            |s| style(s).yellow().bold().to_string(),
        );
        print_stat(
            "Files with only recognized lines   ",
            stats.files_without_changes,
            &stats,
            |s| style(s).green().to_string(),
        );
        print_stat(
            "Files with custom code             ",
            stats.files_custom_code,
            &stats,
            |s| s,
        );
        print_stat(
            &format!("Files without {without}                "),
            stats.files_no_code,
            &stats,
            |s| s,
        );

        if verbose >= 1 && !stats.undetected_paths.is_empty() {
            eprintln!("Fully recognized paths:");
            for p in &stats.undetected_paths {
                eprintln!("  {p}");
            }
        }
    }

    Ok(())
}

fn print_stat(label: &str, count: usize, stats: &WalkStats, paint: impl Fn(String) -> String) {
    println!(
        " - {label}: {} {}",
        paint(format!("{count:7}")),
        style(format!("{:8.2}%", stats.percentage(count))).black().bright()
    );
}

fn validate_path(path: &Path) -> Result<PathBuf> {
    if !path.exists() {
        return Err(CorediffError::usage(format!(
            "path {} does not exist",
            path.display()
        )));
    }
    Ok(path.canonicalize()?)
}

fn platform_for(path: &Path, args: &ScanArgs) -> Result<Option<Platform>> {
    if !path.is_dir() || args.ignore_paths || args.no_platform {
        return Ok(None);
    }
    match platform::detect(path) {
        Some(p) => Ok(Some(p)),
        None => Err(CorediffError::usage(format!(
            "path {} does not seem to be an application root path, so official paths \
             cannot be checked; try again with a proper root path, or do a full scan \
             with --ignore-paths",
            path.display()
        ))),
    }
}

fn walk_path(
    root: &Path,
    db: &HashDb,
    args: &ScanArgs,
    plat: Option<Platform>,
    verbose: u8,
) -> WalkStats {
    let mut stats = WalkStats::default();
    let excludes = plat.map(|p| p.exclude_set());
    let grey = |s: String| style(s).black().bright();

    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                eprintln!("failure accessing a path: {e}");
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

        if let Some(filter) = &args.path_filter {
            if !rel.starts_with(filter.as_str()) {
                continue;
            }
        }

        stats.total_files += 1;

        let eligible = if args.all_valid_text {
            normalize::is_valid_utf8_file(path)
        } else {
            normalize::has_valid_ext(&rel)
        };
        if !eligible {
            stats.files_no_code += 1;
            continue;
        }

        // Path gate: a file at an unknown location is custom code, and
        // platform-excluded paths (caches, generated autoloaders) are
        // treated the same way.
        if path != root && !args.ignore_paths {
            let known_path = db.contains(normalize::path_hash(&rel));
            let excluded = excludes.as_ref().is_some_and(|g| g.is_match(&rel));
            if !known_path || excluded {
                stats.files_custom_code += 1;
                if verbose >= 1 {
                    eprintln!("{}", grey(format!(" ? {rel}")));
                }
                continue;
            }
        }

        let unknown = match scan_file(path, db) {
            Ok(u) => u,
            Err(e) => {
                eprintln!("error scanning {rel}: {e}");
                continue;
            }
        };

        let unknown: Vec<(usize, Vec<u8>, bool)> = unknown
            .into_iter()
            .map(|(no, line)| {
                let suspect = highlight::should_highlight(&line);
                (no, line, suspect)
            })
            .filter(|(_, _, suspect)| !args.suspect || *suspect)
            .collect();

        if unknown.is_empty() {
            stats.files_without_changes += 1;
            if verbose >= 1 {
                stats.undetected_paths.push(rel.clone());
                eprintln!("{}", style(format!(" V {rel}")).green());
            }
            continue;
        }

        stats.files_with_changes += 1;
        println!("{}", style(format!("\n X {rel}")).red().bright().bold());
        let mut has_suspect = false;
        for (no, line, suspect) in &unknown {
            let text = String::from_utf8_lossy(line);
            if *suspect {
                has_suspect = true;
                println!(
                    "   {} {}",
                    grey(format!("{no:<5}")),
                    style(text.into_owned()).white().bright().on_red().bold()
                );
            } else {
                println!("   {} {text}", grey(format!("{no:<5}")));
            }
        }
        if has_suspect {
            stats.files_with_suspect_lines += 1;
        }
        println!();
    }

    stats
}

/// Line numbers and content of lines whose hashes are not all in `db`.
/// A line counts as unknown at the first missing hash; remaining chunks
/// of that line are not checked.
fn scan_file(path: &Path, db: &HashDb) -> Result<Vec<(usize, Vec<u8>)>> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut unknown = Vec::new();
    let mut buf: Vec<u8> = Vec::new();
    let mut line_no = 0usize;

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        line_no += 1;
        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }

        let mut missing = false;
        normalize::hash_line(&buf, |h| {
            if db.contains(h) {
                true
            } else {
                missing = true;
                false
            }
        });
        if missing {
            unknown.push((line_no, buf.clone()));
        }
    }
    Ok(unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_lines(lines: &[&str]) -> HashDb {
        let mut db = HashDb::new();
        for l in lines {
            normalize::hash_line(l.as_bytes(), |h| {
                db.add(h);
                true
            });
        }
        db
    }

    #[test]
    fn test_scan_file_flags_unknown_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("f.php");
        std::fs::write(
            &path,
            "$known_line = strlen($input);\n$injected = eval($_POST['c']);\n// comment only\n",
        )
        .unwrap();

        let db = db_with_lines(&["$known_line = strlen($input);"]);
        let unknown = scan_file(&path, &db).unwrap();
        assert_eq!(unknown.len(), 1);
        assert_eq!(unknown[0].0, 2);
        assert_eq!(unknown[0].1, b"$injected = eval($_POST['c']);".to_vec());
    }

    #[test]
    fn test_scan_file_short_and_comment_lines_never_flag() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("f.php");
        std::fs::write(&path, "<?php\n// a long enough comment line\nshort\n").unwrap();

        let db = HashDb::new();
        let unknown = scan_file(&path, &db).unwrap();
        assert!(unknown.is_empty());
    }

    #[test]
    fn test_scan_file_all_known_is_clean() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("f.php");
        let content = "$a = compute_totals($cart);\n$b = render_widget($a);\n";
        std::fs::write(&path, content).unwrap();

        let db = db_with_lines(&["$a = compute_totals($cart);", "$b = render_widget($a);"]);
        assert!(scan_file(&path, &db).unwrap().is_empty());
    }
}
