//! The `db info` command

use crate::cli::InfoArgs;
use crate::error::Result;
use crate::hashdb::{self, DB_VERSION};

pub fn run(args: &InfoArgs) -> Result<()> {
    let size = std::fs::metadata(&args.file)?.len();
    let db = hashdb::load(&args.file)?;

    println!("Database:  {}", args.file.display());
    println!("Format:    CDDB v{DB_VERSION}");
    println!("File size: {size} bytes");
    println!("Hashes:    {}", db.len());
    Ok(())
}
