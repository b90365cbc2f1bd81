//! `check-store`: read-only consistency checks over a whole store.

use std::io::Write;
use std::path::PathBuf;

use anyhow::bail;
use holo_store::{FjallEngine, OpenOptions, Reader};
use tracing::{info, warn};

use crate::raft_check::run_raft_check;
use crate::stats_check::run_stats_check;

#[derive(Debug, Clone)]
pub struct CheckStoreConfig {
    pub dir: PathBuf,
}

/// Run the Raft and MVCC stats passes. Both passes always run; the result
/// fails if either did.
pub fn check_store<R: Reader + ?Sized>(reader: &R, out: &mut dyn Write) -> anyhow::Result<()> {
    let mut failed = false;
    if let Err(err) = run_raft_check(reader, out) {
        warn!(error = ?err, "raft state check failed");
        failed = true;
    }
    if let Err(err) = run_stats_check(reader, out) {
        warn!(error = ?err, "mvcc stats check failed");
        failed = true;
    }
    if failed {
        bail!("errors detected");
    }
    info!("store is consistent");
    Ok(())
}

pub fn run(cfg: &CheckStoreConfig, out: &mut dyn Write) -> anyhow::Result<()> {
    let engine = FjallEngine::open(&cfg.dir, OpenOptions::read_only())?;
    info!(dir = %cfg.dir.display(), "checking store");
    check_store(&engine, out)
}
