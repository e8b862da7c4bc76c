//! The `db merge` command: offline union of CDDB files

use std::path::Path;

use crate::cli::MergeArgs;
use crate::error::Result;
use crate::hashdb;

pub fn run(database: &Path, args: &MergeArgs) -> Result<()> {
    // A missing output database starts empty; an invalid one is an error.
    let mut out = hashdb::load(database)?;

    for path in &args.files {
        let db = hashdb::load(path)?;
        println!("Merging {} with {} entries ..", path.display(), db.len());
        out.merge(&db);
    }

    println!(
        "Saving {} with a total of {} entries.",
        database.display(),
        out.len()
    );
    hashdb::save(database, &out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashdb::HashDb;

    #[test]
    fn test_merge_unions_inputs() {
        let dir = tempfile::TempDir::new().unwrap();
        let a_path = dir.path().join("a.db");
        let b_path = dir.path().join("b.db");
        let out_path = dir.path().join("out.db");

        let mut a = HashDb::new();
        a.add(1);
        a.add(2);
        hashdb::save(&a_path, &a).unwrap();

        let mut b = HashDb::new();
        b.add(2);
        b.add(3);
        hashdb::save(&b_path, &b).unwrap();

        let args = MergeArgs {
            files: vec![a_path, b_path],
        };
        run(&out_path, &args).unwrap();

        let merged = hashdb::load(&out_path).unwrap();
        assert_eq!(merged.len(), 3);
        for h in [1, 2, 3] {
            assert!(merged.contains(h));
        }
    }

    #[test]
    fn test_merge_into_existing() {
        let dir = tempfile::TempDir::new().unwrap();
        let in_path = dir.path().join("in.db");
        let out_path = dir.path().join("out.db");

        let mut existing = HashDb::new();
        existing.add(10);
        hashdb::save(&out_path, &existing).unwrap();

        let mut incoming = HashDb::new();
        incoming.add(20);
        hashdb::save(&in_path, &incoming).unwrap();

        let args = MergeArgs {
            files: vec![in_path],
        };
        run(&out_path, &args).unwrap();

        let merged = hashdb::load(&out_path).unwrap();
        assert_eq!(merged.len(), 2);
        assert!(merged.contains(10) && merged.contains(20));
    }

    #[test]
    fn test_merge_rejects_invalid_input() {
        let dir = tempfile::TempDir::new().unwrap();
        let bad = dir.path().join("bad.db");
        std::fs::write(&bad, b"not a database at all").unwrap();

        let args = MergeArgs {
            files: vec![bad],
        };
        assert!(run(&dir.path().join("out.db"), &args).is_err());
    }
}
