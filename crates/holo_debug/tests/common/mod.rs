#![allow(dead_code)]

use std::path::Path;

use holo_store::fixture::{bootstrap_store, RangeBuilder};
use holo_store::{FjallEngine, OpenOptions};
use tempfile::TempDir;

/// Wall time used by recovery clocks in tests, after every fixture write.
pub const RECOVERY_WALL_NANOS: u64 = 1_800_000_000_000_000_000;

pub fn create_store() -> (TempDir, FjallEngine) {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = FjallEngine::open(
        dir.path(),
        OpenOptions {
            read_only: false,
            must_exist: false,
        },
    )
    .expect("create store");
    (dir, engine)
}

pub fn open_read_write(dir: &Path) -> FjallEngine {
    FjallEngine::open(dir, OpenOptions::read_write()).expect("open store")
}

/// Store on node 1 / store 1 holding `ranges`.
pub fn store_with(ranges: Vec<RangeBuilder>) -> (TempDir, FjallEngine) {
    let (dir, engine) = create_store();
    bootstrap_store(&engine, 1, 1).expect("store ident");
    for range in ranges {
        range.write(&engine).expect("write range");
    }
    (dir, engine)
}

/// Range replicated on stores 1, 2 and 3.
pub fn three_way(range_id: u64, start: &[u8], end: &[u8]) -> RangeBuilder {
    RangeBuilder::new(range_id, start, end)
        .replica(1, 1)
        .replica(2, 2)
        .replica(3, 3)
        .raft_log(1, 5)
}

pub fn text(out: Vec<u8>) -> String {
    String::from_utf8(out).expect("utf8 output")
}
