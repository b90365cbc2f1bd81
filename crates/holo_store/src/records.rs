//! Persisted records of a store.
//!
//! Structured records travel as serde_json payloads inside [`crate::value::Value`]
//! envelopes; raft command payloads carry a small binary header in front.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::encoding::{quote_bytes, read_u64, read_u8};
use crate::error::DecodeError;
use crate::hlc::Timestamp;
use crate::stats::MvccStats;

pub type RangeId = u64;
pub type NodeId = u64;
pub type StoreId = u64;
pub type ReplicaId = u64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ReplicaDescriptor {
    pub node_id: NodeId,
    pub store_id: StoreId,
    pub replica_id: ReplicaId,
}

impl fmt::Display for ReplicaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(n{},s{}):{}", self.node_id, self.store_id, self.replica_id)
    }
}

/// Membership and key span of a range.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RangeDescriptor {
    pub range_id: RangeId,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub replicas: Vec<ReplicaDescriptor>,
    pub next_replica_id: ReplicaId,
}

impl RangeDescriptor {
    pub fn replica_for_store(&self, store_id: StoreId) -> Option<&ReplicaDescriptor> {
        self.replicas.iter().find(|r| r.store_id == store_id)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.start_key.as_slice() <= key && key < self.end_key.as_slice()
    }
}

impl fmt::Display for RangeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "r{}:\"{}\"-\"{}\" [",
            self.range_id,
            quote_bytes(&self.start_key),
            quote_bytes(&self.end_key)
        )?;
        for replica in &self.replicas {
            write!(f, "{replica}, ")?;
        }
        write!(f, "next={}]", self.next_replica_id)
    }
}

/// Identity of the store the on-disk state belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreIdent {
    pub cluster_id: Uuid,
    pub node_id: NodeId,
    pub store_id: StoreId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxnMeta {
    pub id: Uuid,
    pub key: Vec<u8>,
    pub epoch: u32,
    pub timestamp: Timestamp,
    pub sequence: u32,
}

impl TxnMeta {
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }
}

impl fmt::Display for TxnMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "id={} key=\"{}\" epoch={} ts={} seq={}",
            self.short_id(),
            quote_bytes(&self.key),
            self.epoch,
            self.timestamp,
            self.sequence
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    Committed,
    Aborted,
}

/// Transaction record stored inline at its anchor's transaction key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxnRecord {
    pub meta: TxnMeta,
    pub name: String,
    pub status: TransactionStatus,
    pub last_heartbeat: Timestamp,
}

/// Provisional write of a transaction, and the status to resolve it with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Intent {
    pub key: Vec<u8>,
    pub txn: TxnMeta,
    pub status: TransactionStatus,
}

/// Metadata entry stored at the unversioned key of an MVCC key.
///
/// Inline values carry their raw envelope in `raw_bytes` and have no
/// versions. Otherwise the entry describes an intent on the newest version.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MvccMetadata {
    #[serde(default)]
    pub txn: Option<TxnMeta>,
    #[serde(default)]
    pub timestamp: Timestamp,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub key_bytes: u64,
    #[serde(default)]
    pub val_bytes: u64,
    #[serde(default)]
    pub raw_bytes: Option<Vec<u8>>,
}

impl MvccMetadata {
    pub fn inline(raw: Vec<u8>) -> Self {
        Self {
            raw_bytes: Some(raw),
            ..Self::default()
        }
    }

    pub fn is_inline(&self) -> bool {
        self.raw_bytes.is_some()
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.is_empty() {
            return Err(DecodeError::Empty);
        }
        serde_json::from_slice(data).map_err(|source| DecodeError::Malformed {
            what: "mvcc metadata",
            source,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HardState {
    pub term: u64,
    pub vote: u64,
    pub commit: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TruncatedState {
    pub index: u64,
    pub term: u64,
}

/// Applied indexes and stats of a range, written atomically with each
/// applied command.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RangeAppliedState {
    pub raft_applied_index: u64,
    pub lease_applied_index: u64,
    pub range_stats: MvccStats,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lease {
    pub start: Timestamp,
    pub expiration: Timestamp,
    pub replica: ReplicaDescriptor,
    pub sequence: u64,
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "repl={} seq={} start={} exp={}",
            self.replica, self.sequence, self.start, self.expiration
        )
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RaftTombstone {
    pub next_replica_id: ReplicaId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AbortSpanEntry {
    pub key: Vec<u8>,
    pub timestamp: Timestamp,
    pub priority: i32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EntryType {
    Normal,
    ConfChange,
    ConfChangeV2,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RaftEntry {
    pub term: u64,
    pub index: u64,
    pub entry_type: EntryType,
    #[serde(default)]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReplicaChangeType {
    AddReplica,
    RemoveReplica,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeReplicas {
    pub change_type: ReplicaChangeType,
    pub replica: ReplicaDescriptor,
    pub updated_replicas: Vec<ReplicaDescriptor>,
    pub next_replica_id: ReplicaId,
}

/// Side effects of a command below raft.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicatedEvalResult {
    #[serde(default)]
    pub timestamp: Timestamp,
    #[serde(default)]
    pub is_lease_request: bool,
    #[serde(default)]
    pub change_replicas: Option<ChangeReplicas>,
    #[serde(default)]
    pub delta: Option<MvccStats>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RaftCommand {
    pub proposer_lease_sequence: u64,
    #[serde(default)]
    pub deprecated_proposer_lease: Option<Lease>,
    pub max_lease_index: u64,
    #[serde(default)]
    pub replicated_eval_result: ReplicatedEvalResult,
    #[serde(default)]
    pub write_batch: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfChange {
    pub change_type: ReplicaChangeType,
    pub node_id: ReplicaId,
    pub context: Vec<u8>,
}

/// Context attached to a configuration change entry: the encoded command
/// that proposed it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfChangeContext {
    pub command_id: u64,
    pub payload: Vec<u8>,
    pub replica: ReplicaDescriptor,
}

const RAFT_COMMAND_ENCODING_VERSION: u8 = 0;
const RAFT_COMMAND_HEADER_LEN: usize = 1 + 8;

/// Encode the data of a normal raft entry: version byte, command id, command.
pub fn encode_raft_command(command_id: u64, command: &RaftCommand) -> anyhow::Result<Vec<u8>> {
    let payload = serde_json::to_vec(command)?;
    let mut out = Vec::with_capacity(RAFT_COMMAND_HEADER_LEN + payload.len());
    out.push(RAFT_COMMAND_ENCODING_VERSION);
    out.extend_from_slice(&command_id.to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

pub fn decode_raft_command(data: &[u8]) -> Result<(u64, RaftCommand), DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::Empty);
    }
    let mut offset = 0usize;
    let truncated = |_| DecodeError::Truncated { len: data.len() };
    let version = read_u8(data, &mut offset).map_err(truncated)?;
    if version != RAFT_COMMAND_ENCODING_VERSION {
        return Err(DecodeError::CommandVersion(version));
    }
    let command_id = read_u64(data, &mut offset).map_err(truncated)?;
    let command = serde_json::from_slice(&data[offset..]).map_err(|source| {
        DecodeError::Malformed {
            what: "raft command",
            source,
        }
    })?;
    Ok((command_id, command))
}
