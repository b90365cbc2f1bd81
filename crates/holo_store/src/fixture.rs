//! Builders for synthetic stores used by tests across the workspace.

use anyhow::Context;
use uuid::Uuid;

use crate::engine::{Batch, Engine, Writer};
use crate::hlc::Timestamp;
use crate::keys::{range_descriptor_key, range_meta_key, transaction_key};
use crate::mvcc::{mvcc_put, put_inline_struct, write_store_ident};
use crate::records::{
    encode_raft_command, EntryType, HardState, Lease, NodeId, RaftCommand, RaftEntry, RangeAppliedState,
    RangeDescriptor, RangeId, ReplicaDescriptor, StoreId, StoreIdent, TransactionStatus,
    TruncatedState, TxnMeta, TxnRecord,
};
use crate::state::{put_range_descriptor, StateLoader};
use crate::stats::compute_stats_for_range;
use crate::value::Value;

/// Wall time every fixture write is stamped with.
pub const FIXTURE_WALL_NANOS: u64 = 1_700_000_000_000_000_000;

pub fn fixture_timestamp() -> Timestamp {
    Timestamp::new(FIXTURE_WALL_NANOS, 0)
}

pub fn bootstrap_store(engine: &dyn Engine, node_id: NodeId, store_id: StoreId) -> anyhow::Result<StoreIdent> {
    let ident = StoreIdent {
        cluster_id: Uuid::new_v4(),
        node_id,
        store_id,
    };
    let mut batch = Batch::new(engine);
    write_store_ident(&mut batch, &ident)?;
    batch.commit()?;
    Ok(ident)
}

/// Declarative description of one range and its raft state.
#[derive(Clone, Debug)]
pub struct RangeBuilder {
    desc: RangeDescriptor,
    log: Option<(u64, u64)>,
    missing_log_indexes: Vec<u64>,
    truncated: Option<u64>,
    applied: Option<u64>,
    committed: Option<u64>,
    values: Vec<(Vec<u8>, Vec<u8>)>,
    estimates: bool,
    legacy_state: bool,
    stats_skew: i64,
}

impl RangeBuilder {
    pub fn new(range_id: RangeId, start_key: &[u8], end_key: &[u8]) -> Self {
        Self {
            desc: RangeDescriptor {
                range_id,
                start_key: start_key.to_vec(),
                end_key: end_key.to_vec(),
                replicas: Vec::new(),
                next_replica_id: 1,
            },
            log: None,
            missing_log_indexes: Vec::new(),
            truncated: None,
            applied: None,
            committed: None,
            values: Vec::new(),
            estimates: false,
            legacy_state: false,
            stats_skew: 0,
        }
    }

    /// Add a replica on `store_id`, taking the next replica id.
    pub fn replica(mut self, node_id: NodeId, store_id: StoreId) -> Self {
        self.desc.replicas.push(ReplicaDescriptor {
            node_id,
            store_id,
            replica_id: self.desc.next_replica_id,
        });
        self.desc.next_replica_id += 1;
        self
    }

    /// Raft log holding `[first, last]`; truncated, applied and committed
    /// indexes default to a consistent state.
    pub fn raft_log(mut self, first: u64, last: u64) -> Self {
        self.log = Some((first, last));
        self
    }

    /// Leave `index` out of the log.
    pub fn without_log_index(mut self, index: u64) -> Self {
        self.missing_log_indexes.push(index);
        self
    }

    pub fn truncated(mut self, index: u64) -> Self {
        self.truncated = Some(index);
        self
    }

    pub fn applied(mut self, index: u64) -> Self {
        self.applied = Some(index);
        self
    }

    pub fn committed(mut self, index: u64) -> Self {
        self.committed = Some(index);
        self
    }

    pub fn user_value(mut self, key: &[u8], value: &[u8]) -> Self {
        self.values.push((key.to_vec(), value.to_vec()));
        self
    }

    /// Mark the persisted stats as estimates.
    pub fn estimates(mut self, estimates: bool) -> Self {
        self.estimates = estimates;
        self
    }

    /// Persist the applied index and stats under the legacy keys.
    pub fn legacy_state(mut self, legacy: bool) -> Self {
        self.legacy_state = legacy;
        self
    }

    /// Persist live_bytes off by `skew` from the recomputed value.
    pub fn stats_skew(mut self, skew: i64) -> Self {
        self.stats_skew = skew;
        self
    }

    pub fn descriptor(&self) -> &RangeDescriptor {
        &self.desc
    }

    pub fn write(self, engine: &dyn Engine) -> anyhow::Result<RangeDescriptor> {
        let ts = fixture_timestamp();
        let loader = StateLoader::new(self.desc.range_id);
        let mut batch = Batch::new(engine);

        put_range_descriptor(&mut batch, &self.desc, ts)?;
        for (key, value) in &self.values {
            mvcc_put(&mut batch, key, ts, None, &Value::from_bytes(value))?;
        }

        let (first, last) = self.log.unwrap_or((1, 0));
        for index in first..=last {
            if self.missing_log_indexes.contains(&index) {
                continue;
            }
            let command = RaftCommand {
                proposer_lease_sequence: 1,
                max_lease_index: index,
                ..RaftCommand::default()
            };
            loader.append_log_entry(
                &mut batch,
                &RaftEntry {
                    term: 5,
                    index,
                    entry_type: EntryType::Normal,
                    data: encode_raft_command(index, &command)?,
                },
            )?;
        }
        let applied = self.applied.unwrap_or(last);
        loader.set_hard_state(
            &mut batch,
            &HardState {
                term: 5,
                vote: 1,
                commit: self.committed.unwrap_or(last),
            },
        )?;
        loader.set_truncated_state(
            &mut batch,
            &TruncatedState {
                index: self.truncated.unwrap_or(first.saturating_sub(1)),
                term: 5,
            },
        )?;
        if self.legacy_state {
            loader.set_legacy_applied_index(&mut batch, applied)?;
        }
        if let Some(holder) = self.desc.replicas.first() {
            loader.set_lease(
                &mut batch,
                &Lease {
                    start: ts,
                    expiration: Timestamp::new(ts.wall_time + 9_000_000_000, 0),
                    replica: *holder,
                    sequence: 1,
                },
            )?;
        }

        let mut stats = compute_stats_for_range(&batch, &self.desc, ts.wall_time as i64)
            .with_context(|| format!("compute stats of r{}", self.desc.range_id))?;
        stats.contains_estimates = self.estimates;
        stats.live_bytes += self.stats_skew;
        if self.legacy_state {
            loader.set_legacy_stats(&mut batch, &stats)?;
        } else {
            loader.set_applied_state(
                &mut batch,
                &RangeAppliedState {
                    raft_applied_index: applied,
                    lease_applied_index: applied,
                    range_stats: stats,
                },
            )?;
        }
        batch.commit()?;
        Ok(self.desc)
    }
}

/// Leave a pending transaction's intent on the descriptor key of `desc`,
/// proposing `proposed`, together with its transaction record.
pub fn write_descriptor_intent(
    engine: &dyn Engine,
    desc: &RangeDescriptor,
    proposed: &RangeDescriptor,
) -> anyhow::Result<TxnMeta> {
    let key = range_descriptor_key(&desc.start_key);
    let base = fixture_timestamp();
    let txn = TxnMeta {
        id: Uuid::new_v4(),
        key: desc.start_key.clone(),
        epoch: 0,
        timestamp: Timestamp::new(base.wall_time + 1_000, 0),
        sequence: 1,
    };
    let mut batch = Batch::new(engine);
    mvcc_put(
        &mut batch,
        &key,
        txn.timestamp,
        Some(&txn),
        &Value::from_struct(proposed)?,
    )?;
    put_inline_struct(
        &mut batch,
        &transaction_key(&txn.key, txn.id),
        &TxnRecord {
            meta: txn.clone(),
            name: "change-replicas".to_string(),
            status: TransactionStatus::Pending,
            last_heartbeat: txn.timestamp,
        },
    )?;
    batch.commit()?;
    Ok(txn)
}

/// Versioned copy of `desc` under its meta2 addressing key.
pub fn write_meta_descriptor(writer: &mut dyn Writer, desc: &RangeDescriptor) -> anyhow::Result<()> {
    let value = Value::from_struct(desc)?;
    mvcc_put(writer, &range_meta_key(&desc.end_key), fixture_timestamp(), None, &value)?;
    Ok(())
}
