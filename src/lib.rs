//! Corediff: find unauthorized modifications in PHP web applications
//!
//! Corediff compares every source line of an installed application
//! against a database of hashes harvested from upstream releases. Lines
//! whose normalized hash is unknown are flagged; heuristic patterns
//! highlight the suspicious ones.
//!
//! The interesting machinery is on the indexing side: stable line
//! normalization, content-defined chunking for minified files, a
//! crash-safe append-only database format (CDDB), blob-level dedup
//! across release versions, and a worker pool that indexes packages in
//! parallel into private sets before merging them durably.

pub mod chunker;
pub mod cli;
pub mod commands;
pub mod composer;
pub mod error;
pub mod gitindex;
pub mod hashdb;
pub mod highlight;
pub mod manifest;
pub mod merger;
pub mod normalize;
pub mod packagist;
pub mod platform;
pub mod transport;
pub mod version;

// Re-export commonly used types
pub use cli::{Cli, Commands};
pub use error::{CorediffError, Result};
pub use hashdb::{HashDb, WriteDb, DB_VERSION};
pub use manifest::Manifest;
