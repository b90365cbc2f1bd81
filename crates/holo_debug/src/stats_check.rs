//! Validation of persisted MVCC stats against a recomputation.

use std::fmt;
use std::io::Write;

use anyhow::{bail, Context};
use holo_store::mvcc::iterate_range_descriptors;
use holo_store::records::RangeDescriptor;
use holo_store::state::StateLoader;
use holo_store::stats::{compute_stats_for_range, FieldDiff, MvccStats};
use holo_store::Reader;
use tracing::{debug, info};

use crate::report::Findings;

/// A range whose recomputed stats disagree with the persisted ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsMismatch {
    pub desc: RangeDescriptor,
    /// Persisted stats were flagged as estimates; the mismatch is not fatal.
    pub ignored: bool,
    pub actual: MvccStats,
    pub claimed: MvccStats,
    pub diff: Vec<FieldDiff>,
}

impl fmt::Display for StatsMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ignored {
            f.write_str("(ignored) ")?;
        }
        write!(f, "{}: diff(actual, claimed): ", self.desc)?;
        for (i, field) in self.diff.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{field}")?;
        }
        Ok(())
    }
}

/// Compare the persisted stats of one range with a recomputation taken at
/// the persisted update time.
pub fn check_range_stats<R: Reader + ?Sized>(
    reader: &R,
    desc: &RangeDescriptor,
) -> anyhow::Result<Option<StatsMismatch>> {
    let claimed = StateLoader::new(desc.range_id)
        .load_mvcc_stats(reader)
        .with_context(|| format!("load stats of r{}", desc.range_id))?;
    let mut actual = compute_stats_for_range(reader, desc, claimed.last_update_nanos)
        .with_context(|| format!("recompute stats of r{}", desc.range_id))?;
    let diff = actual.diff(&claimed);
    if diff.is_empty() {
        return Ok(None);
    }
    let ignored = claimed.contains_estimates;
    if ignored {
        actual.contains_estimates = true;
    }
    Ok(Some(StatsMismatch {
        desc: desc.clone(),
        ignored,
        actual,
        claimed,
        diff,
    }))
}

pub fn check_mvcc_stats<R: Reader + ?Sized>(reader: &R) -> anyhow::Result<Findings<StatsMismatch>> {
    let mut findings = Findings::new();
    let mut ranges = 0usize;
    iterate_range_descriptors(reader, &mut |desc| {
        ranges += 1;
        if let Some(mismatch) = check_range_stats(reader, &desc)? {
            debug!(range_id = desc.range_id, ignored = mismatch.ignored, "stats mismatch");
            findings.push(mismatch);
        }
        Ok(true)
    })?;
    debug!(ranges, mismatches = findings.len(), "checked mvcc stats");
    Ok(findings)
}

/// Print every mismatch; only mismatches of exact stats fail the pass.
pub fn run_stats_check<R: Reader + ?Sized>(reader: &R, out: &mut dyn Write) -> anyhow::Result<()> {
    info!("checking mvcc stats");
    writeln!(out, "checking MVCC stats")?;
    let findings = check_mvcc_stats(reader)?;
    findings.write_to(out)?;
    if findings.iter().any(|m| !m.ignored) {
        bail!("check failed");
    }
    Ok(())
}
