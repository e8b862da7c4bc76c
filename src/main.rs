//! Corediff CLI entry point

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use corediff::cli::{Cli, Commands, DbCommands};
use corediff::commands;
use corediff::error::CorediffError;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            e.exit_code()
        }
    }
}

fn run(cli: &Cli) -> corediff::Result<()> {
    match &cli.command {
        Commands::Scan(args) => commands::scan::run(cli.verbose, args),
        Commands::Db(db) => match &db.command {
            DbCommands::Index(args) => commands::db_index::run(
                cli.verbose,
                cli.parallel,
                db.database.as_deref(),
                db.cache_dir.as_deref(),
                args,
            ),
            DbCommands::Merge(args) => {
                let database = db.database.as_deref().ok_or_else(|| {
                    CorediffError::usage("--database is required for db merge")
                })?;
                commands::db_merge::run(database, args)
            }
            DbCommands::Info(args) => commands::db_info::run(args),
        },
    }
}

fn init_tracing(verbose: u8) {
    let default = if verbose >= 2 { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
