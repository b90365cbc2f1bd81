//! On-disk engine backed by a fjall keyspace.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use tracing::debug;

use crate::engine::{BatchOp, Engine, RawVisitor, Reader};

/// Partition holding every MVCC entry of the store.
pub const DATA_PARTITION: &str = "mvcc";

/// File fjall writes at the root of every keyspace it creates.
const KEYSPACE_MARKER: &str = "version";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenOptions {
    /// Reject every write through this handle.
    pub read_only: bool,
    /// Fail instead of creating a fresh store.
    pub must_exist: bool,
}

impl OpenOptions {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            must_exist: true,
        }
    }

    pub fn read_write() -> Self {
        Self {
            read_only: false,
            must_exist: true,
        }
    }
}

pub struct FjallEngine {
    keyspace: Keyspace,
    data: PartitionHandle,
    read_only: bool,
    dir: PathBuf,
}

impl FjallEngine {
    pub fn open(dir: impl AsRef<Path>, opts: OpenOptions) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        if opts.must_exist && !dir.is_dir() {
            bail!("store directory {} does not exist", dir.display());
        }
        if opts.must_exist && !dir.join(KEYSPACE_MARKER).is_file() {
            bail!("{} does not contain a store", dir.display());
        }
        let keyspace = fjall::Config::new(dir)
            .open()
            .with_context(|| format!("open fjall keyspace at {}", dir.display()))?;
        if opts.must_exist && !keyspace.partition_exists(DATA_PARTITION) {
            bail!("{} does not contain a store", dir.display());
        }
        let data = keyspace
            .open_partition(DATA_PARTITION, PartitionCreateOptions::default())
            .context("open data partition")?;
        debug!(dir = %dir.display(), read_only = opts.read_only, "opened store");
        Ok(Self {
            keyspace,
            data,
            read_only: opts.read_only,
            dir: dir.to_path_buf(),
        })
    }
}

impl Reader for FjallEngine {
    fn scan_raw(&self, start: &[u8], end: &[u8], visit: &mut RawVisitor<'_>) -> anyhow::Result<()> {
        if start >= end {
            return Ok(());
        }
        for item in self.data.range(start..end) {
            let (key, value) = item.context("fjall range read failed")?;
            if !visit(&*key, &*value)? {
                break;
            }
        }
        Ok(())
    }

    fn get_raw(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let value = self.data.get(key).context("fjall read failed")?;
        Ok(value.map(|v| v.to_vec()))
    }
}

impl Engine for FjallEngine {
    fn apply_batch(&self, ops: Vec<BatchOp>) -> anyhow::Result<()> {
        if self.read_only {
            bail!("store {} is opened read-only", self.dir.display());
        }
        let count = ops.len();
        let mut batch = self.keyspace.batch();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => batch.insert(&self.data, key, value),
                BatchOp::Delete { key } => batch.remove(&self.data, key),
            }
        }
        batch.commit().context("fjall batch commit failed")?;
        self.keyspace
            .persist(PersistMode::SyncAll)
            .context("persist keyspace after batch")?;
        debug!(ops = count, "committed batch");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{snapshot, Batch, MvccKey, Writer};

    #[test]
    fn missing_store_fails_fast() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope");
        let err = FjallEngine::open(&missing, OpenOptions::read_only())
            .err()
            .expect("missing dir must fail");
        assert!(err.to_string().contains("does not exist"), "unexpected: {err}");

        let err = FjallEngine::open(dir.path(), OpenOptions::read_only())
            .err()
            .expect("empty dir must fail");
        assert!(err.to_string().contains("does not contain a store"), "unexpected: {err}");
    }

    #[test]
    fn read_only_open_leaves_foreign_directory_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("notes.txt"), b"not a store").expect("write");

        for opts in [OpenOptions::read_only(), OpenOptions::read_write()] {
            let err = FjallEngine::open(dir.path(), opts)
                .err()
                .expect("foreign dir must fail");
            assert!(err.to_string().contains("does not contain a store"), "unexpected: {err}");
        }
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .map(|e| e.expect("entry").file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("notes.txt")]);
    }

    #[test]
    fn writes_survive_reopen_and_read_only_rejects_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let engine = FjallEngine::open(
                dir.path(),
                OpenOptions {
                    read_only: false,
                    must_exist: false,
                },
            )
            .expect("create");
            let mut batch = Batch::new(&engine);
            batch.put(&MvccKey::meta("a"), b"1".to_vec()).expect("put");
            batch.commit().expect("commit");
        }

        let engine = FjallEngine::open(dir.path(), OpenOptions::read_only()).expect("reopen");
        assert_eq!(snapshot(&engine).expect("snapshot").len(), 1);
        let mut batch = Batch::new(&engine);
        batch.clear(&MvccKey::meta("a")).expect("stage");
        let err = batch.commit().expect_err("read-only");
        assert!(err.to_string().contains("read-only"), "unexpected: {err}");
    }
}
