//! Typed access to the per-range metadata kept under range-id keys.

use anyhow::{bail, Context};

use crate::engine::{Reader, Writer};
use crate::error::MvccError;
use crate::hlc::Timestamp;
use crate::keys::{range_descriptor_key, range_id_key, raft_log_key, RangeIdSuffix};
use crate::mvcc::{get_inline_struct, iterate_range_descriptors, mvcc_put, put_inline, put_inline_struct};
use crate::records::{HardState, Lease, RaftEntry, RangeAppliedState, RangeDescriptor, RangeId, TruncatedState};
use crate::stats::MvccStats;
use crate::value::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateLoader {
    range_id: RangeId,
}

impl StateLoader {
    pub fn new(range_id: RangeId) -> Self {
        Self { range_id }
    }

    fn key(&self, suffix: RangeIdSuffix) -> Vec<u8> {
        range_id_key(self.range_id, suffix)
    }

    pub fn load_applied_state<R: Reader + ?Sized>(
        &self,
        reader: &R,
    ) -> anyhow::Result<Option<RangeAppliedState>> {
        get_inline_struct(reader, &self.key(RangeIdSuffix::RangeAppliedState), "range applied state")
    }

    pub fn set_applied_state(
        &self,
        writer: &mut dyn Writer,
        state: &RangeAppliedState,
    ) -> anyhow::Result<()> {
        put_inline_struct(writer, &self.key(RangeIdSuffix::RangeAppliedState), state)
    }

    pub fn load_legacy_stats<R: Reader + ?Sized>(&self, reader: &R) -> anyhow::Result<Option<MvccStats>> {
        get_inline_struct(reader, &self.key(RangeIdSuffix::RangeStatsLegacy), "range stats")
    }

    pub fn set_legacy_stats(&self, writer: &mut dyn Writer, stats: &MvccStats) -> anyhow::Result<()> {
        put_inline_struct(writer, &self.key(RangeIdSuffix::RangeStatsLegacy), stats)
    }

    /// Persisted stats: the applied state's copy, else the legacy key, else
    /// empty stats.
    pub fn load_mvcc_stats<R: Reader + ?Sized>(&self, reader: &R) -> anyhow::Result<MvccStats> {
        if let Some(state) = self.load_applied_state(reader)? {
            return Ok(state.range_stats);
        }
        Ok(self.load_legacy_stats(reader)?.unwrap_or_default())
    }

    pub fn set_hard_state(&self, writer: &mut dyn Writer, hs: &HardState) -> anyhow::Result<()> {
        put_inline_struct(writer, &self.key(RangeIdSuffix::RaftHardState), hs)
    }

    pub fn set_truncated_state(
        &self,
        writer: &mut dyn Writer,
        state: &TruncatedState,
    ) -> anyhow::Result<()> {
        put_inline_struct(writer, &self.key(RangeIdSuffix::RaftTruncatedState), state)
    }

    pub fn set_legacy_applied_index(&self, writer: &mut dyn Writer, index: u64) -> anyhow::Result<()> {
        let index = i64::try_from(index).context("applied index out of range")?;
        put_inline(
            writer,
            &self.key(RangeIdSuffix::RaftAppliedIndexLegacy),
            &Value::from_int(index),
        )
    }

    pub fn set_lease(&self, writer: &mut dyn Writer, lease: &Lease) -> anyhow::Result<()> {
        put_inline_struct(writer, &self.key(RangeIdSuffix::RangeLease), lease)
    }

    pub fn append_log_entry(&self, writer: &mut dyn Writer, entry: &RaftEntry) -> anyhow::Result<()> {
        put_inline_struct(writer, &raft_log_key(self.range_id, entry.index), entry)
    }
}

/// Descriptor of `range_id`, found by scanning the range-local keyspace.
pub fn load_range_descriptor<R: Reader + ?Sized>(
    reader: &R,
    range_id: RangeId,
) -> anyhow::Result<RangeDescriptor> {
    let mut found = None;
    iterate_range_descriptors(reader, &mut |desc| {
        if desc.range_id == range_id {
            found = Some(desc);
            return Ok(false);
        }
        Ok(true)
    })?;
    match found {
        Some(desc) => Ok(desc),
        None => bail!("range descriptor with range ID {range_id} not found"),
    }
}

/// Stage a new version of `desc` at its descriptor key.
pub fn put_range_descriptor(
    writer: &mut dyn Writer,
    desc: &RangeDescriptor,
    timestamp: Timestamp,
) -> Result<(), MvccError> {
    let value = Value::from_struct(desc)?;
    mvcc_put(writer, &range_descriptor_key(&desc.start_key), timestamp, None, &value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Batch, MemEngine};

    #[test]
    fn stats_fall_back_to_legacy_key() {
        let engine = MemEngine::new();
        let mut batch = Batch::new(&engine);
        let loader = StateLoader::new(4);
        assert_eq!(loader.load_mvcc_stats(&batch).expect("load"), MvccStats::default());

        let legacy = MvccStats {
            live_count: 3,
            ..MvccStats::default()
        };
        loader.set_legacy_stats(&mut batch, &legacy).expect("set");
        assert_eq!(loader.load_mvcc_stats(&batch).expect("load"), legacy);

        let applied = RangeAppliedState {
            raft_applied_index: 9,
            lease_applied_index: 2,
            range_stats: MvccStats {
                live_count: 5,
                ..MvccStats::default()
            },
        };
        loader.set_applied_state(&mut batch, &applied).expect("set");
        assert_eq!(loader.load_mvcc_stats(&batch).expect("load").live_count, 5);
    }

    #[test]
    fn descriptor_lookup_by_range_id() {
        let engine = MemEngine::new();
        let mut batch = Batch::new(&engine);
        for (id, start, end) in [(1, "", "m"), (2, "m", "\u{7f}")] {
            let desc = RangeDescriptor {
                range_id: id,
                start_key: start.as_bytes().to_vec(),
                end_key: end.as_bytes().to_vec(),
                replicas: Vec::new(),
                next_replica_id: 1,
            };
            put_range_descriptor(&mut batch, &desc, Timestamp::new(1, 0)).expect("put");
        }
        let desc = load_range_descriptor(&batch, 2).expect("load");
        assert_eq!(desc.start_key, b"m");
        let err = load_range_descriptor(&batch, 3).expect_err("missing");
        assert!(err.to_string().contains("not found"), "unexpected: {err}");
    }
}
