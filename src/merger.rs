//! Worker-pool fan-out with crash-safe fan-in
//!
//! Each submitted task indexes into its own private [`HashDb`], so the
//! hot loop takes no locks. When a task finishes, its private set is
//! merged into the shared write-open database under that database's
//! mutex, which appends and flushes in one batch (see
//! [`WriteDb::merge`]). A panicking task is isolated: its partial hashes
//! still merge (they are valid hashes; only the manifest record is
//! skipped) and sibling workers keep running.

use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::error::{CorediffError, Result};
use crate::hashdb::{HashDb, WriteDb};

pub struct MergePool {
    pool: rayon::ThreadPool,
}

impl MergePool {
    /// A pool of `parallel` workers; 0 means the number of logical CPUs.
    pub fn new(parallel: usize) -> Result<MergePool> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(parallel)
            .thread_name(|i| format!("corediff-index-{i}"))
            .build()
            .map_err(|e| CorediffError::Usage {
                message: format!("building worker pool: {e}"),
            })?;
        Ok(MergePool { pool })
    }

    /// Run `task` once per item, each with a private database, merging
    /// every result into `db`. Drains all workers before returning.
    pub fn index_all<T, F>(&self, db: &WriteDb, items: Vec<T>, task: F)
    where
        T: Send,
        F: Fn(T, &mut HashDb) + Sync,
    {
        use rayon::prelude::*;

        self.pool.install(|| {
            items.into_par_iter().for_each(|item| {
                let mut private = HashDb::new();
                if catch_unwind(AssertUnwindSafe(|| task(item, &mut private))).is_err() {
                    tracing::warn!("indexing worker panicked; partial results kept");
                }
                if let Err(e) = db.merge(&private) {
                    tracing::warn!("merging worker results: {e}");
                }
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_dbs_merge_into_shared() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("pool.db");
        let db = WriteDb::open(&path).unwrap();

        let pool = MergePool::new(4).unwrap();
        let items: Vec<u64> = (0..100).collect();
        pool.index_all(&db, items, |i, private| {
            // Overlapping ranges: dedup happens at merge time.
            for h in i..i + 10 {
                private.add(h);
            }
        });

        assert_eq!(db.len(), 109); // 0..=108
        drop(db);

        let loaded = crate::hashdb::load(&path).unwrap();
        assert_eq!(loaded.len(), 109);
    }

    #[test]
    fn test_panicking_task_does_not_stop_siblings() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("panic.db");
        let db = WriteDb::open(&path).unwrap();

        let pool = MergePool::new(2).unwrap();
        pool.index_all(&db, vec![1u64, 2, 3, 4], |i, private| {
            private.add(i);
            if i == 2 {
                panic!("boom");
            }
        });

        // All four items contribute; the panicking one had already added
        // its hash before failing.
        assert_eq!(db.len(), 4);
    }

    #[test]
    fn test_joint_equals_separate_indexing() {
        // Merging per-worker private sets must equal indexing the same
        // inputs sequentially into one set.
        let dir = tempfile::TempDir::new().unwrap();

        let joint_path = dir.path().join("joint.db");
        let joint = WriteDb::open(&joint_path).unwrap();
        let pool = MergePool::new(3).unwrap();
        pool.index_all(&joint, vec![0u64, 1, 2], |i, private| {
            for h in (i * 50)..(i * 50 + 75) {
                private.add(h);
            }
        });

        let mut separate = HashDb::new();
        for i in 0u64..3 {
            for h in (i * 50)..(i * 50 + 75) {
                separate.add(h);
            }
        }

        assert_eq!(joint.len(), separate.len());
        for h in separate.iter() {
            assert!(joint.contains(h));
        }
    }
}
