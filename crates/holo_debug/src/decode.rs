//! Semantic decoding of raw store entries.
//!
//! A key is first classified by its structural shape; the shape selects the
//! single interpreter allowed to decode it. Interpreters are also exposed
//! individually, in a fixed priority order, for callers that want to try them
//! one after another. Each interpreter rejects entries outside its shape, so
//! at most one of them accepts any given entry.

use std::fmt;

use holo_store::encoding::quote_bytes;
use holo_store::keys::{classify, pretty_key, KeyKind, RangeIdKey, RangeIdSuffix};
use holo_store::records::{
    decode_raft_command, AbortSpanEntry, ConfChange, ConfChangeContext, EntryType, HardState,
    Lease, MvccMetadata, RaftCommand, RaftEntry, RaftTombstone, RangeAppliedState,
    RangeDescriptor, RangeId, ReplicatedEvalResult, TruncatedState, TxnRecord,
};
use holo_store::stats::MvccStats;
use holo_store::{DecodeError, MvccKeyValue, Timestamp, Value};
use tracing::debug;

/// Lease identity a proposal was made under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseIdentity {
    Full(Lease),
    Sequence(u64),
}

impl fmt::Display for LeaseIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseIdentity::Full(lease) => write!(f, "lease {lease}"),
            LeaseIdentity::Sequence(seq) => write!(f, "lease #{seq}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub command_id: u64,
    pub lease: LeaseIdentity,
    pub command: RaftCommand,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaftEntryView {
    /// A normal entry; `None` for an empty entry.
    Normal {
        term: u64,
        index: u64,
        proposal: Option<Proposal>,
    },
    ConfChange {
        term: u64,
        index: u64,
        change: ConfChange,
        result: ReplicatedEvalResult,
    },
}

impl RaftEntryView {
    pub fn index(&self) -> u64 {
        match self {
            RaftEntryView::Normal { index, .. } | RaftEntryView::ConfChange { index, .. } => *index,
        }
    }
}

/// Decoded value of a range-id key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeIdValue {
    Int(i64),
    Bool(bool),
    Timestamp(Timestamp),
    AbortSpan(AbortSpanEntry),
    Tombstone(RaftTombstone),
    TruncatedState(TruncatedState),
    Lease(Lease),
    AppliedState(RangeAppliedState),
    Stats(MvccStats),
    HardState(HardState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    RaftLogEntry {
        range_id: RangeId,
        entry: RaftEntryView,
    },
    RangeDescriptor(RangeDescriptor),
    MetaDescriptor {
        level: u8,
        desc: RangeDescriptor,
    },
    Transaction(TxnRecord),
    RangeIdValue {
        range_id: RangeId,
        suffix: RangeIdSuffix,
        value: RangeIdValue,
    },
    Intent {
        key: Vec<u8>,
        meta: MvccMetadata,
    },
}

#[derive(Debug)]
pub enum Outcome {
    Decoded(Record),
    /// The entry does not have the shape of any known record.
    Unrecognized,
    /// The entry has a known shape but its payload is invalid.
    Invalid(DecodeError),
}

impl Outcome {
    pub fn is_decoded(&self) -> bool {
        matches!(self, Outcome::Decoded(_))
    }
}

impl From<Result<Record, DecodeError>> for Outcome {
    fn from(res: Result<Record, DecodeError>) -> Self {
        match res {
            Ok(record) => Outcome::Decoded(record),
            Err(err) => Outcome::Invalid(err),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interpreter {
    RaftLogEntry,
    RangeDescriptor,
    Meta,
    Transaction,
    RangeIdKey,
    Intent,
}

impl Interpreter {
    pub const PRIORITY: [Interpreter; 6] = [
        Interpreter::RaftLogEntry,
        Interpreter::RangeDescriptor,
        Interpreter::Meta,
        Interpreter::Transaction,
        Interpreter::RangeIdKey,
        Interpreter::Intent,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Interpreter::RaftLogEntry => "raft log entry",
            Interpreter::RangeDescriptor => "range descriptor",
            Interpreter::Meta => "meta",
            Interpreter::Transaction => "transaction",
            Interpreter::RangeIdKey => "range-id key",
            Interpreter::Intent => "intent",
        }
    }

    /// The interpreter responsible for entries of this shape.
    ///
    /// Unversioned entries outside the range-id keyspace are metadata and
    /// belong to the intent interpreter, except transaction records.
    pub fn for_key(kind: &KeyKind, versioned: bool) -> Option<Interpreter> {
        match kind {
            KeyKind::RangeId(k) if k.suffix == *RangeIdSuffix::RaftLog.as_bytes() => {
                Some(Interpreter::RaftLogEntry)
            }
            KeyKind::RangeId(_) => Some(Interpreter::RangeIdKey),
            KeyKind::RangeLocal(k) if k.is_transaction() && !versioned => {
                Some(Interpreter::Transaction)
            }
            KeyKind::RangeLocal(k) if k.is_descriptor() && versioned => {
                Some(Interpreter::RangeDescriptor)
            }
            KeyKind::Meta { .. } if versioned => Some(Interpreter::Meta),
            KeyKind::RangeLocal(_) | KeyKind::Meta { .. } | KeyKind::Global if !versioned => {
                Some(Interpreter::Intent)
            }
            _ => None,
        }
    }

    pub fn interpret(self, kv: &MvccKeyValue) -> Outcome {
        let kind = match classify(&kv.key.key) {
            Ok(kind) => kind,
            Err(_) => return Outcome::Unrecognized,
        };
        if Interpreter::for_key(&kind, kv.key.is_value()) != Some(self) {
            return Outcome::Unrecognized;
        }
        match (self, kind) {
            (Interpreter::RaftLogEntry, KeyKind::RangeId(k)) => decode_raft_log_entry(&k, kv).into(),
            (Interpreter::RangeIdKey, KeyKind::RangeId(k)) => decode_range_id_value(&k, kv).into(),
            (Interpreter::RangeDescriptor, _) => Value::from_raw(kv.value.clone())
                .get_struct("range descriptor")
                .map(Record::RangeDescriptor)
                .into(),
            (Interpreter::Meta, KeyKind::Meta { level, .. }) => Value::from_raw(kv.value.clone())
                .get_struct("meta range descriptor")
                .map(|desc| Record::MetaDescriptor { level, desc })
                .into(),
            (Interpreter::Transaction, _) => decode_inline(kv)
                .and_then(|value| value.get_struct("transaction record"))
                .map(Record::Transaction)
                .into(),
            (Interpreter::Intent, _) => match MvccMetadata::decode(&kv.value) {
                Ok(meta) if meta.txn.is_some() => Outcome::Decoded(Record::Intent {
                    key: kv.key.key.clone(),
                    meta,
                }),
                Ok(_) => Outcome::Unrecognized,
                Err(err) => Outcome::Invalid(err),
            },
            _ => Outcome::Unrecognized,
        }
    }
}

/// Classify the entry by key shape and run the matching interpreter.
pub fn decode(kv: &MvccKeyValue) -> Outcome {
    let kind = match classify(&kv.key.key) {
        Ok(kind) => kind,
        Err(err) => return Outcome::Invalid(err),
    };
    let Some(interpreter) = Interpreter::for_key(&kind, kv.key.is_value()) else {
        return Outcome::Unrecognized;
    };
    debug!(key = %pretty_key(&kv.key.key), interpreter = interpreter.name(), "decoding entry");
    interpreter.interpret(kv)
}

/// Try every interpreter in priority order and keep the first success.
pub fn decode_first(kv: &MvccKeyValue) -> Outcome {
    let mut invalid = None;
    for interpreter in Interpreter::PRIORITY {
        match interpreter.interpret(kv) {
            Outcome::Decoded(record) => return Outcome::Decoded(record),
            Outcome::Invalid(err) => {
                invalid.get_or_insert(err);
            }
            Outcome::Unrecognized => {}
        }
    }
    invalid.map_or(Outcome::Unrecognized, Outcome::Invalid)
}

fn decode_inline(kv: &MvccKeyValue) -> Result<Value, DecodeError> {
    let meta = MvccMetadata::decode(&kv.value)?;
    meta.raw_bytes
        .map(Value::from_raw)
        .ok_or_else(|| DecodeError::NotInline(pretty_key(&kv.key.key)))
}

fn decode_raft_log_entry(key: &RangeIdKey, kv: &MvccKeyValue) -> Result<Record, DecodeError> {
    if kv.key.is_value() {
        return Err(DecodeError::TimestampedRangeIdKey(pretty_key(&kv.key.key)));
    }
    let entry: RaftEntry = decode_inline(kv)?.get_struct("raft entry")?;
    let view = match entry.entry_type {
        EntryType::Normal if entry.data.is_empty() => RaftEntryView::Normal {
            term: entry.term,
            index: entry.index,
            proposal: None,
        },
        EntryType::Normal => {
            let (command_id, command) = decode_raft_command(&entry.data)?;
            let lease = match &command.deprecated_proposer_lease {
                Some(lease) => LeaseIdentity::Full(lease.clone()),
                None => LeaseIdentity::Sequence(command.proposer_lease_sequence),
            };
            RaftEntryView::Normal {
                term: entry.term,
                index: entry.index,
                proposal: Some(Proposal {
                    command_id,
                    lease,
                    command,
                }),
            }
        }
        EntryType::ConfChange => {
            let change: ConfChange = serde_json::from_slice(&entry.data)
                .map_err(|source| DecodeError::Malformed {
                    what: "conf change",
                    source,
                })?;
            let context: ConfChangeContext = serde_json::from_slice(&change.context)
                .map_err(|source| DecodeError::Malformed {
                    what: "conf change context",
                    source,
                })?;
            let command: RaftCommand = serde_json::from_slice(&context.payload)
                .map_err(|source| DecodeError::Malformed {
                    what: "raft command",
                    source,
                })?;
            RaftEntryView::ConfChange {
                term: entry.term,
                index: entry.index,
                change,
                result: command.replicated_eval_result,
            }
        }
        other => return Err(DecodeError::UnsupportedEntryType(format!("{other:?}"))),
    };
    Ok(Record::RaftLogEntry {
        range_id: key.range_id,
        entry: view,
    })
}

fn decode_range_id_value(key: &RangeIdKey, kv: &MvccKeyValue) -> Result<Record, DecodeError> {
    if kv.key.is_value() {
        return Err(DecodeError::TimestampedRangeIdKey(pretty_key(&kv.key.key)));
    }
    let suffix = key.kind()?;
    let value = decode_inline(kv)?;
    let decoded = match suffix {
        RangeIdSuffix::LeaseAppliedIndexLegacy
        | RangeIdSuffix::RaftAppliedIndexLegacy
        | RangeIdSuffix::RaftLastIndex => RangeIdValue::Int(value.get_int()?),
        RangeIdSuffix::RangeFrozenStatus => RangeIdValue::Bool(value.get_bool()?),
        RangeIdSuffix::AbortSpan => RangeIdValue::AbortSpan(value.get_struct("abort span entry")?),
        RangeIdSuffix::RangeLastGc
        | RangeIdSuffix::RangeLastVerificationTimestampDeprecated
        | RangeIdSuffix::RangeLastReplicaGcTimestamp => {
            RangeIdValue::Timestamp(value.get_struct("timestamp")?)
        }
        RangeIdSuffix::RaftTombstone => RangeIdValue::Tombstone(value.get_struct("raft tombstone")?),
        RangeIdSuffix::RaftTruncatedState => {
            RangeIdValue::TruncatedState(value.get_struct("raft truncated state")?)
        }
        RangeIdSuffix::RangeLease => RangeIdValue::Lease(value.get_struct("range lease")?),
        RangeIdSuffix::RangeAppliedState => {
            RangeIdValue::AppliedState(value.get_struct("range applied state")?)
        }
        RangeIdSuffix::RangeStatsLegacy => RangeIdValue::Stats(value.get_struct("range stats")?),
        RangeIdSuffix::RaftHardState => RangeIdValue::HardState(value.get_struct("raft hard state")?),
        RangeIdSuffix::RaftLog => {
            return Err(DecodeError::Key {
                key: pretty_key(&kv.key.key),
                reason: "raft log entries are not range-id values".to_string(),
            });
        }
    };
    Ok(Record::RangeIdValue {
        range_id: key.range_id,
        suffix,
        value: decoded,
    })
}

impl fmt::Display for RangeIdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeIdValue::Int(v) => write!(f, "{v}"),
            RangeIdValue::Bool(v) => write!(f, "{v}"),
            RangeIdValue::Timestamp(ts) => write!(f, "{ts}"),
            RangeIdValue::AbortSpan(entry) => write!(
                f,
                "key=\"{}\" ts={} priority={}",
                quote_bytes(&entry.key),
                entry.timestamp,
                entry.priority
            ),
            RangeIdValue::Tombstone(t) => write!(f, "next_replica_id:{}", t.next_replica_id),
            RangeIdValue::TruncatedState(t) => write!(f, "index:{} term:{}", t.index, t.term),
            RangeIdValue::Lease(lease) => write!(f, "{lease}"),
            RangeIdValue::AppliedState(s) => write!(
                f,
                "raft_applied_index:{} lease_applied_index:{} range_stats:{:?}",
                s.raft_applied_index, s.lease_applied_index, s.range_stats
            ),
            RangeIdValue::Stats(ms) => write!(f, "{ms:?}"),
            RangeIdValue::HardState(hs) => {
                write!(f, "term:{} vote:{} commit:{}", hs.term, hs.vote, hs.commit)
            }
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Record::RaftLogEntry { entry, .. } => match entry {
                RaftEntryView::Normal {
                    term,
                    index,
                    proposal: None,
                } => write!(f, "Term:{term} Index:{index} : EMPTY"),
                RaftEntryView::Normal {
                    term,
                    index,
                    proposal: Some(p),
                } => write!(
                    f,
                    "Term:{term} Index:{index} command {:016x} by {}\n{:?}",
                    p.command_id, p.lease, p.command
                ),
                RaftEntryView::ConfChange {
                    term,
                    index,
                    change,
                    result,
                } => write!(
                    f,
                    "Term:{term} Index:{index} {:?} node {}\n{:?}",
                    change.change_type, change.node_id, result
                ),
            },
            Record::RangeDescriptor(desc) => write!(f, "{desc}"),
            Record::MetaDescriptor { desc, .. } => write!(f, "{desc}"),
            Record::Transaction(txn) => write!(
                f,
                "\"{}\" meta={{{}}} status={:?} heartbeat={}",
                txn.name, txn.meta, txn.status, txn.last_heartbeat
            ),
            Record::RangeIdValue { value, .. } => write!(f, "{value}"),
            Record::Intent { meta, .. } => match &meta.txn {
                Some(txn) => write!(f, "intent ts={} txn={{{txn}}}", meta.timestamp),
                None => write!(f, "metadata ts={}", meta.timestamp),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use holo_store::engine::MvccKey;
    use holo_store::keys::{
        range_descriptor_key, range_id_key, range_meta_key, raft_log_key, transaction_key,
    };
    use holo_store::records::{
        encode_raft_command, ReplicaChangeType, ReplicaDescriptor, TransactionStatus, TxnMeta,
    };
    use uuid::Uuid;

    use super::*;

    fn inline(key: Vec<u8>, value: &Value) -> MvccKeyValue {
        MvccKeyValue {
            key: MvccKey::meta(key),
            value: MvccMetadata::inline(value.raw_bytes().to_vec())
                .encode()
                .expect("encode"),
        }
    }

    fn versioned(key: Vec<u8>, value: &Value) -> MvccKeyValue {
        MvccKeyValue {
            key: MvccKey::versioned(key, Timestamp::new(10, 0)),
            value: value.raw_bytes().to_vec(),
        }
    }

    fn desc() -> RangeDescriptor {
        RangeDescriptor {
            range_id: 3,
            start_key: b"a".to_vec(),
            end_key: b"c".to_vec(),
            replicas: vec![ReplicaDescriptor {
                node_id: 1,
                store_id: 1,
                replica_id: 1,
            }],
            next_replica_id: 2,
        }
    }

    fn txn_meta() -> TxnMeta {
        TxnMeta {
            id: Uuid::new_v4(),
            key: b"a".to_vec(),
            epoch: 0,
            timestamp: Timestamp::new(5, 0),
            sequence: 0,
        }
    }

    fn entry(entry_type: EntryType, data: Vec<u8>) -> Value {
        Value::from_struct(&RaftEntry {
            term: 2,
            index: 7,
            entry_type,
            data,
        })
        .expect("encode")
    }

    fn samples() -> Vec<(Interpreter, MvccKeyValue)> {
        let command = RaftCommand {
            proposer_lease_sequence: 4,
            max_lease_index: 1,
            ..RaftCommand::default()
        };
        let normal = entry(
            EntryType::Normal,
            encode_raft_command(1, &command).expect("command"),
        );
        let record = TxnRecord {
            meta: txn_meta(),
            name: "t".to_string(),
            status: TransactionStatus::Pending,
            last_heartbeat: Timestamp::new(5, 0),
        };
        let intent = MvccMetadata {
            txn: Some(txn_meta()),
            timestamp: Timestamp::new(5, 0),
            ..MvccMetadata::default()
        };
        vec![
            (Interpreter::RaftLogEntry, inline(raft_log_key(3, 7), &normal)),
            (
                Interpreter::RangeDescriptor,
                versioned(range_descriptor_key(b"a"), &Value::from_struct(&desc()).expect("desc")),
            ),
            (
                Interpreter::Meta,
                versioned(range_meta_key(b"c"), &Value::from_struct(&desc()).expect("desc")),
            ),
            (
                Interpreter::Transaction,
                inline(
                    transaction_key(b"a", record.meta.id),
                    &Value::from_struct(&record).expect("txn"),
                ),
            ),
            (
                Interpreter::RangeIdKey,
                inline(
                    range_id_key(3, RangeIdSuffix::RaftHardState),
                    &Value::from_struct(&HardState {
                        term: 1,
                        vote: 1,
                        commit: 4,
                    })
                    .expect("hs"),
                ),
            ),
            (
                Interpreter::Intent,
                MvccKeyValue {
                    key: MvccKey::meta(range_descriptor_key(b"a")),
                    value: intent.encode().expect("meta"),
                },
            ),
        ]
    }

    #[test]
    fn each_record_is_accepted_by_exactly_one_interpreter() {
        for (owner, kv) in samples() {
            for interpreter in Interpreter::PRIORITY {
                let outcome = interpreter.interpret(&kv);
                if interpreter == owner {
                    assert!(
                        outcome.is_decoded(),
                        "{} rejected its own record: {outcome:?}",
                        interpreter.name()
                    );
                } else {
                    assert!(
                        !outcome.is_decoded(),
                        "{} accepted a {} record",
                        interpreter.name(),
                        owner.name()
                    );
                }
            }
            assert!(decode(&kv).is_decoded());
            assert!(decode_first(&kv).is_decoded());
        }
    }

    #[test]
    fn empty_normal_entry_has_no_proposal() {
        let kv = inline(raft_log_key(3, 7), &entry(EntryType::Normal, Vec::new()));
        match decode(&kv) {
            Outcome::Decoded(record) => {
                assert_eq!(record.to_string(), "Term:2 Index:7 : EMPTY");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn proposal_reports_full_lease_when_carried() {
        let lease = Lease {
            start: Timestamp::new(1, 0),
            expiration: Timestamp::new(9, 0),
            replica: desc().replicas[0],
            sequence: 3,
        };
        let command = RaftCommand {
            proposer_lease_sequence: 3,
            deprecated_proposer_lease: Some(lease.clone()),
            ..RaftCommand::default()
        };
        let kv = inline(
            raft_log_key(3, 7),
            &entry(EntryType::Normal, encode_raft_command(9, &command).expect("command")),
        );
        let Outcome::Decoded(Record::RaftLogEntry {
            entry: RaftEntryView::Normal {
                proposal: Some(proposal),
                ..
            },
            ..
        }) = decode(&kv)
        else {
            panic!("expected a proposal");
        };
        assert_eq!(proposal.command_id, 9);
        assert_eq!(proposal.lease, LeaseIdentity::Full(lease));
    }

    #[test]
    fn conf_change_decodes_embedded_result() {
        let command = RaftCommand {
            replicated_eval_result: ReplicatedEvalResult {
                is_lease_request: true,
                ..ReplicatedEvalResult::default()
            },
            ..RaftCommand::default()
        };
        let context = ConfChangeContext {
            command_id: 1,
            payload: serde_json::to_vec(&command).expect("command"),
            replica: desc().replicas[0],
        };
        let change = ConfChange {
            change_type: ReplicaChangeType::AddReplica,
            node_id: 2,
            context: serde_json::to_vec(&context).expect("context"),
        };
        let kv = inline(
            raft_log_key(3, 7),
            &entry(EntryType::ConfChange, serde_json::to_vec(&change).expect("change")),
        );
        match decode(&kv) {
            Outcome::Decoded(Record::RaftLogEntry {
                entry: RaftEntryView::ConfChange { result, .. },
                ..
            }) => assert!(result.is_lease_request),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn unsupported_entry_and_unknown_suffix_are_invalid() {
        let kv = inline(raft_log_key(3, 7), &entry(EntryType::ConfChangeV2, Vec::new()));
        assert!(matches!(
            decode(&kv),
            Outcome::Invalid(DecodeError::UnsupportedEntryType(_))
        ));

        let mut key = range_id_key(3, RangeIdSuffix::RangeLease);
        let len = key.len();
        key[len - 4..].copy_from_slice(b"qqqq");
        let kv = inline(key, &Value::from_int(1));
        assert!(matches!(
            decode(&kv),
            Outcome::Invalid(DecodeError::UnknownSuffix { .. })
        ));
    }

    #[test]
    fn timestamped_range_id_key_is_invalid() {
        let kv = versioned(range_id_key(3, RangeIdSuffix::RaftLastIndex), &Value::from_int(4));
        assert!(matches!(
            decode(&kv),
            Outcome::Invalid(DecodeError::TimestampedRangeIdKey(_))
        ));
    }

    #[test]
    fn plain_user_values_are_unrecognized() {
        let kv = versioned(b"user".to_vec(), &Value::from_bytes(b"v"));
        assert!(matches!(decode(&kv), Outcome::Unrecognized));
        assert!(matches!(decode_first(&kv), Outcome::Unrecognized));
    }
}
