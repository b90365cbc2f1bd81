//! Raft log and applied-state continuity checks.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;

use anyhow::{bail, Context};
use holo_store::keys::{classify, local_range_id_end, KeyKind, RangeIdSuffix, LOCAL_RANGE_ID_PREFIX};
use holo_store::records::RangeId;
use holo_store::Reader;
use tracing::{debug, info};

use crate::decode::{Interpreter, Outcome, RangeIdValue, Record};
use crate::report::Findings;

/// Index bookkeeping for one range, gathered during a single pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaCheckInfo {
    pub truncated_index: u64,
    pub applied_index: u64,
    pub committed_index: u64,
    pub first_index: u64,
    pub last_index: u64,
    /// At least one log entry was observed.
    pub has_log: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftAnomaly {
    LogIndexGap {
        range_id: RangeId,
        last: u64,
        index: u64,
    },
    TruncatedIndexMismatch {
        range_id: RangeId,
        truncated: u64,
        first: u64,
    },
    InvertedLogSpan {
        range_id: RangeId,
        first: u64,
        last: u64,
    },
    AppliedIndexOutOfBounds {
        range_id: RangeId,
        applied: u64,
        first: u64,
        last: u64,
    },
    CommittedTrailsApplied {
        range_id: RangeId,
        committed: u64,
        applied: u64,
    },
    CommittedAheadOfLast {
        range_id: RangeId,
        committed: u64,
        last: u64,
    },
}

impl RaftAnomaly {
    pub fn range_id(&self) -> RangeId {
        match *self {
            RaftAnomaly::LogIndexGap { range_id, .. }
            | RaftAnomaly::TruncatedIndexMismatch { range_id, .. }
            | RaftAnomaly::InvertedLogSpan { range_id, .. }
            | RaftAnomaly::AppliedIndexOutOfBounds { range_id, .. }
            | RaftAnomaly::CommittedTrailsApplied { range_id, .. }
            | RaftAnomaly::CommittedAheadOfLast { range_id, .. } => range_id,
        }
    }
}

impl fmt::Display for RaftAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "range {}: ", self.range_id())?;
        match *self {
            RaftAnomaly::LogIndexGap { last, index, .. } => {
                write!(f, "log index anomaly: {last} followed by {index}")
            }
            RaftAnomaly::TruncatedIndexMismatch {
                truncated, first, ..
            } => write!(f, "truncated index {truncated} should equal first index {first} - 1"),
            RaftAnomaly::InvertedLogSpan { first, last, .. } => {
                write!(f, "[first index, last index] is [{first}, {last}]")
            }
            RaftAnomaly::AppliedIndexOutOfBounds {
                applied,
                first,
                last,
                ..
            } => write!(
                f,
                "applied index {applied} should be between first index {first} and last index {last}"
            ),
            RaftAnomaly::CommittedTrailsApplied {
                committed, applied, ..
            } => write!(f, "committed index {committed} must not trail applied index {applied}"),
            RaftAnomaly::CommittedAheadOfLast { committed, last, .. } => {
                write!(f, "committed index {committed} ahead of last index {last}")
            }
        }
    }
}

/// Streaming accumulator fed with the range-id entries of a store in key
/// order.
#[derive(Debug, Default)]
pub struct RaftStateCheck {
    infos: BTreeMap<RangeId, ReplicaCheckInfo>,
    findings: Findings<RaftAnomaly>,
}

impl RaftStateCheck {
    pub fn new() -> Self {
        Self::default()
    }

    fn info(&mut self, range_id: RangeId) -> &mut ReplicaCheckInfo {
        self.infos.entry(range_id).or_default()
    }

    pub fn observe_hard_state(&mut self, range_id: RangeId, commit: u64) {
        self.info(range_id).committed_index = commit;
    }

    pub fn observe_truncated_state(&mut self, range_id: RangeId, index: u64) {
        self.info(range_id).truncated_index = index;
    }

    pub fn observe_applied_index(&mut self, range_id: RangeId, index: u64) {
        self.info(range_id).applied_index = index;
    }

    /// Record a log entry; a non-consecutive index is reported once and the
    /// scan continues from it.
    pub fn observe_log_index(&mut self, range_id: RangeId, index: u64) {
        let info = self.info(range_id);
        if !info.has_log {
            info.has_log = true;
            info.first_index = index;
            info.last_index = index;
            return;
        }
        let last = info.last_index;
        info.last_index = index;
        if last.checked_add(1) != Some(index) {
            self.findings.push(RaftAnomaly::LogIndexGap {
                range_id,
                last,
                index,
            });
        }
    }

    pub fn infos(&self) -> &BTreeMap<RangeId, ReplicaCheckInfo> {
        &self.infos
    }

    /// Evaluate the per-range invariants, in ascending range id order.
    pub fn finish(mut self) -> Findings<RaftAnomaly> {
        for (&range_id, info) in &self.infos {
            evaluate(range_id, info, &mut self.findings);
        }
        self.findings
    }
}

fn evaluate(range_id: RangeId, info: &ReplicaCheckInfo, findings: &mut Findings<RaftAnomaly>) {
    if info.has_log {
        if info.truncated_index.checked_add(1) != Some(info.first_index) {
            findings.push(RaftAnomaly::TruncatedIndexMismatch {
                range_id,
                truncated: info.truncated_index,
                first: info.first_index,
            });
        }
        if info.first_index > info.last_index {
            findings.push(RaftAnomaly::InvertedLogSpan {
                range_id,
                first: info.first_index,
                last: info.last_index,
            });
        }
        if info.applied_index < info.first_index || info.applied_index > info.last_index {
            findings.push(RaftAnomaly::AppliedIndexOutOfBounds {
                range_id,
                applied: info.applied_index,
                first: info.first_index,
                last: info.last_index,
            });
        }
    }
    if info.applied_index > info.committed_index {
        findings.push(RaftAnomaly::CommittedTrailsApplied {
            range_id,
            committed: info.committed_index,
            applied: info.applied_index,
        });
    }
    if info.has_log && info.committed_index > info.last_index {
        findings.push(RaftAnomaly::CommittedAheadOfLast {
            range_id,
            committed: info.committed_index,
            last: info.last_index,
        });
    }
}

/// Scan the range-id keyspace and collect every Raft state anomaly.
///
/// Read and decode errors abort the scan; anomalies do not.
pub fn check_raft_state<R: Reader + ?Sized>(reader: &R) -> anyhow::Result<Findings<RaftAnomaly>> {
    let mut check = RaftStateCheck::new();
    reader.iterate(LOCAL_RANGE_ID_PREFIX, &local_range_id_end(), &mut |kv| {
        let KeyKind::RangeId(key) = classify(&kv.key.key)? else {
            return Ok(true);
        };
        let range_id = key.range_id;
        if key.kind()? == RangeIdSuffix::RaftLog {
            check.observe_log_index(range_id, key.log_index()?);
            return Ok(true);
        }
        let record = match Interpreter::RangeIdKey.interpret(&kv) {
            Outcome::Decoded(record) => record,
            Outcome::Invalid(err) => {
                return Err(err).with_context(|| format!("range {range_id}"));
            }
            Outcome::Unrecognized => return Ok(true),
        };
        if let Record::RangeIdValue { suffix, value, .. } = record {
            match value {
                RangeIdValue::HardState(hs) => check.observe_hard_state(range_id, hs.commit),
                RangeIdValue::TruncatedState(ts) => check.observe_truncated_state(range_id, ts.index),
                RangeIdValue::AppliedState(state) => {
                    check.observe_applied_index(range_id, state.raft_applied_index)
                }
                RangeIdValue::Int(index) if suffix == RangeIdSuffix::RaftAppliedIndexLegacy => {
                    let index = u64::try_from(index)
                        .with_context(|| format!("range {range_id}: negative applied index"))?;
                    check.observe_applied_index(range_id, index);
                }
                _ => {}
            }
        }
        Ok(true)
    })?;
    debug!(ranges = check.infos().len(), "scanned raft state");
    Ok(check.finish())
}

/// Print every anomaly and fail if there was any.
pub fn run_raft_check<R: Reader + ?Sized>(reader: &R, out: &mut dyn Write) -> anyhow::Result<()> {
    info!("checking raft state");
    let findings = check_raft_state(reader)?;
    findings.write_to(out)?;
    if !findings.is_empty() {
        bail!("anomalies detected in Raft state");
    }
    Ok(())
}
