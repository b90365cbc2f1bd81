//! Typed errors for callers that must branch on the failure kind.
//!
//! Everything else in the crate propagates `anyhow::Error`.

use crate::hlc::Timestamp;
use crate::records::Intent;
use crate::value::ValueTag;

/// A persisted record could not be interpreted.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("value is empty")]
    Empty,
    #[error("value too short: {len} bytes")]
    Truncated { len: usize },
    #[error("invalid checksum: stored {stored:#010x}, computed {computed:#010x}")]
    Checksum { stored: u32, computed: u32 },
    #[error("value type is not {expected:?}: found tag {found}")]
    WrongTag { expected: ValueTag, found: u8 },
    #[error("malformed {what}: {source}")]
    Malformed {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed key {key}: {reason}")]
    Key { key: String, reason: String },
    #[error("unknown raft id key suffix {suffix}")]
    UnknownSuffix { suffix: String },
    #[error("unknown command encoding version {0}")]
    CommandVersion(u8),
    #[error("unknown log entry type: {0}")]
    UnsupportedEntryType(String),
    #[error("range ID keys shouldn't have timestamps: {0}")]
    TimestampedRangeIdKey(String),
    #[error("expected inline value at {0}")]
    NotInline(String),
}

/// Failure of an MVCC write.
#[derive(Debug, thiserror::Error)]
pub enum MvccError {
    /// The key carries an intent belonging to a different transaction.
    #[error("conflicting intents on {}", describe_intents(.intents))]
    WriteIntent { intents: Vec<Intent> },
    /// A committed version at or above the write timestamp already exists.
    #[error("write to {key} at {timestamp} is too old: a version exists at {existing}")]
    WriteTooOld {
        key: String,
        timestamp: Timestamp,
        existing: Timestamp,
    },
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn describe_intents(intents: &[Intent]) -> String {
    intents
        .iter()
        .map(|i| format!("{} (txn {})", crate::keys::pretty_key(&i.key), i.txn.id))
        .collect::<Vec<_>>()
        .join(", ")
}
