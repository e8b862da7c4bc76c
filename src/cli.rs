//! CLI argument definitions using clap with subcommand architecture

use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

/// Find unauthorized modifications in Magento and WordPress code bases
#[derive(Parser, Debug)]
#[command(name = "corediff")]
#[command(about = "Compare installed code against a database of known-good line hashes")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output (-v versions, -vv HTTP, -vvv files, -vvvv hashes)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Parallel workers (0 = number of CPUs)
    #[arg(short, long, default_value_t = 0, global = true)]
    pub parallel: usize,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scan a file or directory for unknown code lines
    Scan(ScanArgs),

    /// Build and manage hash databases
    Db(DbArgs),
}

#[derive(Args, Debug)]
pub struct ScanArgs {
    /// Hash database path
    #[arg(short, long)]
    pub database: PathBuf,

    /// Scan everything, not just paths known to the database
    #[arg(short, long)]
    pub ignore_paths: bool,

    /// Show suspect code lines only
    #[arg(short, long)]
    pub suspect: bool,

    /// Scan all valid UTF-8 text files instead of just code files
    #[arg(short = 't', long = "text")]
    pub all_valid_text: bool,

    /// Don't require an application root
    #[arg(long)]
    pub no_platform: bool,

    /// Only scan paths under this prefix (e.g. vendor/magento)
    #[arg(short = 'f', long)]
    pub path_filter: Option<String>,

    /// Files or directories to scan
    #[arg(value_name = "path", required = true)]
    pub paths: Vec<PathBuf>,
}

#[derive(Args, Debug)]
pub struct DbArgs {
    /// Hash database path
    #[arg(short, long, global = true)]
    pub database: Option<PathBuf>,

    /// Directory for persistent git clones and zip downloads
    #[arg(short, long, global = true)]
    pub cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: DbCommands,
}

#[derive(Subcommand, Debug)]
pub enum DbCommands {
    /// Index upstream releases into the database
    Index(IndexArgs),

    /// Merge databases into the configured database
    Merge(MergeArgs),

    /// Show database information
    Info(InfoArgs),
}

#[derive(Args, Debug)]
pub struct IndexArgs {
    /// Treat positional args as Packagist packages
    #[arg(long)]
    pub packagist: bool,

    /// Index all packages from a composer.json + composer.lock
    #[arg(long, value_name = "composer.json")]
    pub composer: Option<PathBuf>,

    /// Re-check all tracked packages for new versions
    #[arg(short, long)]
    pub update: bool,

    /// Don't store file paths in the database
    #[arg(short, long)]
    pub ignore_paths: bool,

    /// Index all valid UTF-8 text files
    #[arg(short = 't', long = "text")]
    pub all_valid_text: bool,

    /// Don't check for an application root
    #[arg(long)]
    pub no_platform: bool,

    /// Paths, package names, or a git URL
    #[arg(value_name = "path")]
    pub paths: Vec<String>,
}

#[derive(Args, Debug)]
pub struct MergeArgs {
    /// Databases to merge into the configured database
    #[arg(value_name = "db-file", required = true)]
    pub files: Vec<PathBuf>,
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    /// Database file to inspect
    #[arg(value_name = "db-file")]
    pub file: PathBuf,
}
