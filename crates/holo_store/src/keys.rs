//! Raw key layout of a store.
//!
//! ```text
//! \x01s<suffix>                                   store-local
//! \x01i<range id u64><r|u><suffix(4)><detail>       range-id local
//! \x01k<escaped key><suffix(4)><detail>             range local
//! \x02<key> / \x03<key>                             meta1 / meta2 addressing
//! everything else                                  global user data
//! ```

use std::fmt::Write as _;

use uuid::Uuid;

use crate::encoding::{
    decode_bytes_ascending, decode_u64_ascending, encode_bytes_ascending, encode_u64_ascending,
    prefix_end, quote_bytes,
};
use crate::error::DecodeError;
use crate::records::{RangeDescriptor, RangeId};

pub const KEY_MIN: &[u8] = b"";
pub const KEY_MAX: &[u8] = b"\xff\xff";

pub const LOCAL_PREFIX: &[u8] = b"\x01";
pub const LOCAL_MAX: &[u8] = b"\x02";
pub const LOCAL_STORE_PREFIX: &[u8] = b"\x01s";
pub const LOCAL_RANGE_ID_PREFIX: &[u8] = b"\x01i";
pub const LOCAL_RANGE_PREFIX: &[u8] = b"\x01k";
pub const LOCAL_RANGE_MAX: &[u8] = b"\x01l";

pub const META1_PREFIX: &[u8] = b"\x02";
pub const META2_PREFIX: &[u8] = b"\x03";
pub const META_MAX: &[u8] = b"\x04";

const STORE_IDENT_SUFFIX: &[u8] = b"iden";
const REPLICATED_INFIX: u8 = b'r';
const UNREPLICATED_INFIX: u8 = b'u';

pub const RANGE_DESCRIPTOR_SUFFIX: [u8; 4] = *b"rdsc";
pub const TRANSACTION_SUFFIX: [u8; 4] = *b"txn-";

/// Per-range metadata kinds stored under a range-id key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RangeIdSuffix {
    AbortSpan,
    RangeFrozenStatus,
    LeaseAppliedIndexLegacy,
    RaftAppliedIndexLegacy,
    RaftTruncatedState,
    RangeLease,
    RangeLastGc,
    RangeAppliedState,
    RangeStatsLegacy,
    RangeLastVerificationTimestampDeprecated,
    RaftTombstone,
    RaftHardState,
    RaftLastIndex,
    RaftLog,
    RangeLastReplicaGcTimestamp,
}

impl RangeIdSuffix {
    pub const ALL: [RangeIdSuffix; 15] = [
        Self::AbortSpan,
        Self::RangeFrozenStatus,
        Self::LeaseAppliedIndexLegacy,
        Self::RaftAppliedIndexLegacy,
        Self::RaftTruncatedState,
        Self::RangeLease,
        Self::RangeLastGc,
        Self::RangeAppliedState,
        Self::RangeStatsLegacy,
        Self::RangeLastVerificationTimestampDeprecated,
        Self::RaftTombstone,
        Self::RaftHardState,
        Self::RaftLastIndex,
        Self::RaftLog,
        Self::RangeLastReplicaGcTimestamp,
    ];

    pub const fn as_bytes(self) -> &'static [u8; 4] {
        match self {
            Self::AbortSpan => b"abc-",
            Self::RangeFrozenStatus => b"fzn-",
            Self::LeaseAppliedIndexLegacy => b"rlla",
            Self::RaftAppliedIndexLegacy => b"rfta",
            Self::RaftTruncatedState => b"rftt",
            Self::RangeLease => b"rll-",
            Self::RangeLastGc => b"rlgc",
            Self::RangeAppliedState => b"rask",
            Self::RangeStatsLegacy => b"stat",
            Self::RangeLastVerificationTimestampDeprecated => b"rlvt",
            Self::RaftTombstone => b"rftb",
            Self::RaftHardState => b"rfth",
            Self::RaftLastIndex => b"rfti",
            Self::RaftLog => b"rftl",
            Self::RangeLastReplicaGcTimestamp => b"rlrt",
        }
    }

    pub fn from_bytes(suffix: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_bytes() == suffix)
    }

    /// Whether the entry is part of the replicated state machine.
    pub const fn is_replicated(self) -> bool {
        !matches!(
            self,
            Self::RaftTombstone
                | Self::RaftHardState
                | Self::RaftLastIndex
                | Self::RaftLog
                | Self::RangeLastReplicaGcTimestamp
        )
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::AbortSpan => "AbortSpan",
            Self::RangeFrozenStatus => "RangeFrozenStatus",
            Self::LeaseAppliedIndexLegacy => "LeaseAppliedIndex",
            Self::RaftAppliedIndexLegacy => "RaftAppliedIndex",
            Self::RaftTruncatedState => "RaftTruncatedState",
            Self::RangeLease => "RangeLease",
            Self::RangeLastGc => "RangeLastGC",
            Self::RangeAppliedState => "RangeAppliedState",
            Self::RangeStatsLegacy => "RangeStats",
            Self::RangeLastVerificationTimestampDeprecated => "RangeLastVerificationTimestamp",
            Self::RaftTombstone => "RaftTombstone",
            Self::RaftHardState => "RaftHardState",
            Self::RaftLastIndex => "RaftLastIndex",
            Self::RaftLog => "RaftLog",
            Self::RangeLastReplicaGcTimestamp => "RangeLastReplicaGCTimestamp",
        }
    }
}

/// Prefix shared by every range-id key of `range_id`.
pub fn range_id_prefix(range_id: RangeId) -> Vec<u8> {
    let mut out = Vec::with_capacity(LOCAL_RANGE_ID_PREFIX.len() + 8);
    out.extend_from_slice(LOCAL_RANGE_ID_PREFIX);
    encode_u64_ascending(&mut out, range_id);
    out
}

pub fn range_id_replicated_prefix(range_id: RangeId) -> Vec<u8> {
    let mut out = range_id_prefix(range_id);
    out.push(REPLICATED_INFIX);
    out
}

pub fn range_id_unreplicated_prefix(range_id: RangeId) -> Vec<u8> {
    let mut out = range_id_prefix(range_id);
    out.push(UNREPLICATED_INFIX);
    out
}

pub fn range_id_key(range_id: RangeId, suffix: RangeIdSuffix) -> Vec<u8> {
    let mut out = if suffix.is_replicated() {
        range_id_replicated_prefix(range_id)
    } else {
        range_id_unreplicated_prefix(range_id)
    };
    out.extend_from_slice(suffix.as_bytes());
    out
}

pub fn raft_log_prefix(range_id: RangeId) -> Vec<u8> {
    range_id_key(range_id, RangeIdSuffix::RaftLog)
}

pub fn raft_log_key(range_id: RangeId, index: u64) -> Vec<u8> {
    let mut out = raft_log_prefix(range_id);
    encode_u64_ascending(&mut out, index);
    out
}

pub fn abort_span_key(range_id: RangeId, txn_id: Uuid) -> Vec<u8> {
    let mut out = range_id_key(range_id, RangeIdSuffix::AbortSpan);
    out.extend_from_slice(txn_id.as_bytes());
    out
}

/// Prefix of every range-local key anchored at `key`.
pub fn range_key_prefix(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LOCAL_RANGE_PREFIX.len() + key.len() + 2);
    out.extend_from_slice(LOCAL_RANGE_PREFIX);
    encode_bytes_ascending(&mut out, key);
    out
}

pub fn range_descriptor_key(start_key: &[u8]) -> Vec<u8> {
    let mut out = range_key_prefix(start_key);
    out.extend_from_slice(&RANGE_DESCRIPTOR_SUFFIX);
    out
}

pub fn transaction_key(anchor: &[u8], txn_id: Uuid) -> Vec<u8> {
    let mut out = range_key_prefix(anchor);
    out.extend_from_slice(&TRANSACTION_SUFFIX);
    out.extend_from_slice(txn_id.as_bytes());
    out
}

pub fn store_ident_key() -> Vec<u8> {
    let mut out = LOCAL_STORE_PREFIX.to_vec();
    out.extend_from_slice(STORE_IDENT_SUFFIX);
    out
}

/// Addressing key for the descriptor of the range containing `key`.
///
/// User keys are addressed through meta2, meta2 keys through meta1.
pub fn range_meta_key(key: &[u8]) -> Vec<u8> {
    if key.is_empty() {
        return KEY_MIN.to_vec();
    }
    let (prefix, rest) = if key.starts_with(META2_PREFIX) {
        (META1_PREFIX, &key[META2_PREFIX.len()..])
    } else if key.starts_with(META1_PREFIX) {
        return KEY_MIN.to_vec();
    } else {
        (META2_PREFIX, key)
    };
    let mut out = prefix.to_vec();
    out.extend_from_slice(rest);
    out
}

/// A range-id key split into its components.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeIdKey {
    pub range_id: RangeId,
    pub replicated: bool,
    pub suffix: [u8; 4],
    pub detail: Vec<u8>,
}

impl RangeIdKey {
    pub fn kind(&self) -> Result<RangeIdSuffix, DecodeError> {
        RangeIdSuffix::from_bytes(&self.suffix).ok_or_else(|| DecodeError::UnknownSuffix {
            suffix: quote_bytes(&self.suffix),
        })
    }

    /// Log index of a raft log key.
    pub fn log_index(&self) -> Result<u64, DecodeError> {
        decode_u64_ascending(&self.detail)
            .map(|(index, _)| index)
            .map_err(|err| DecodeError::Key {
                key: quote_bytes(&self.detail),
                reason: err.to_string(),
            })
    }
}

/// A range-local key split into its components.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeLocalKey {
    pub key: Vec<u8>,
    pub suffix: [u8; 4],
    pub detail: Vec<u8>,
}

impl RangeLocalKey {
    pub fn is_descriptor(&self) -> bool {
        self.suffix == RANGE_DESCRIPTOR_SUFFIX
    }

    pub fn is_transaction(&self) -> bool {
        self.suffix == TRANSACTION_SUFFIX
    }
}

/// Structural shape of a raw key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyKind {
    StoreLocal { suffix: Vec<u8> },
    RangeId(RangeIdKey),
    RangeLocal(RangeLocalKey),
    Meta { level: u8, key: Vec<u8> },
    Global,
}

pub fn decode_range_id_key(key: &[u8]) -> Result<RangeIdKey, DecodeError> {
    let malformed = |reason: &str| DecodeError::Key {
        key: pretty_raw(key),
        reason: reason.to_string(),
    };
    let rest = key
        .strip_prefix(LOCAL_RANGE_ID_PREFIX)
        .ok_or_else(|| malformed("missing range-id prefix"))?;
    let (range_id, rest) = decode_u64_ascending(rest).map_err(|_| malformed("short range id"))?;
    let (infix, rest) = rest.split_first().ok_or_else(|| malformed("missing infix"))?;
    let replicated = match *infix {
        REPLICATED_INFIX => true,
        UNREPLICATED_INFIX => false,
        _ => return Err(malformed("unknown infix")),
    };
    if rest.len() < 4 {
        return Err(malformed("short suffix"));
    }
    let mut suffix = [0u8; 4];
    suffix.copy_from_slice(&rest[..4]);
    Ok(RangeIdKey {
        range_id,
        replicated,
        suffix,
        detail: rest[4..].to_vec(),
    })
}

pub fn decode_range_key(key: &[u8]) -> Result<RangeLocalKey, DecodeError> {
    let malformed = |reason: String| DecodeError::Key {
        key: pretty_raw(key),
        reason,
    };
    let rest = key
        .strip_prefix(LOCAL_RANGE_PREFIX)
        .ok_or_else(|| malformed("missing range-local prefix".to_string()))?;
    let (anchor, rest) = decode_bytes_ascending(rest).map_err(|err| malformed(err.to_string()))?;
    if rest.len() < 4 {
        return Err(malformed("short suffix".to_string()));
    }
    let mut suffix = [0u8; 4];
    suffix.copy_from_slice(&rest[..4]);
    Ok(RangeLocalKey {
        key: anchor,
        suffix,
        detail: rest[4..].to_vec(),
    })
}

pub fn classify(key: &[u8]) -> Result<KeyKind, DecodeError> {
    if key.starts_with(LOCAL_RANGE_ID_PREFIX) {
        return decode_range_id_key(key).map(KeyKind::RangeId);
    }
    if key.starts_with(LOCAL_RANGE_PREFIX) {
        return decode_range_key(key).map(KeyKind::RangeLocal);
    }
    if let Some(suffix) = key.strip_prefix(LOCAL_STORE_PREFIX) {
        return Ok(KeyKind::StoreLocal {
            suffix: suffix.to_vec(),
        });
    }
    if key.starts_with(LOCAL_PREFIX) {
        return Err(DecodeError::Key {
            key: pretty_raw(key),
            reason: "unknown local key prefix".to_string(),
        });
    }
    if let Some(rest) = key.strip_prefix(META1_PREFIX) {
        return Ok(KeyKind::Meta {
            level: 1,
            key: rest.to_vec(),
        });
    }
    if let Some(rest) = key.strip_prefix(META2_PREFIX) {
        return Ok(KeyKind::Meta {
            level: 2,
            key: rest.to_vec(),
        });
    }
    Ok(KeyKind::Global)
}

fn pretty_raw(key: &[u8]) -> String {
    format!("\"{}\"", quote_bytes(key))
}

/// Human-readable rendering of a raw key.
pub fn pretty_key(key: &[u8]) -> String {
    if key.is_empty() {
        return "/Min".to_string();
    }
    if key == KEY_MAX {
        return "/Max".to_string();
    }
    match classify(key) {
        Ok(KeyKind::StoreLocal { suffix }) => {
            if suffix == STORE_IDENT_SUFFIX {
                "/Local/Store/storeIdent".to_string()
            } else {
                format!("/Local/Store/{}", pretty_raw(&suffix))
            }
        }
        Ok(KeyKind::RangeId(k)) => {
            let mut out = format!(
                "/Local/RangeID/{}/{}/",
                k.range_id,
                if k.replicated { 'r' } else { 'u' }
            );
            match k.kind() {
                Ok(RangeIdSuffix::RaftLog) => match k.log_index() {
                    Ok(index) => {
                        let _ = write!(out, "RaftLog/logIndex:{index}");
                    }
                    Err(_) => {
                        let _ = write!(out, "RaftLog/{}", pretty_raw(&k.detail));
                    }
                },
                Ok(RangeIdSuffix::AbortSpan) => match Uuid::from_slice(&k.detail) {
                    Ok(id) => {
                        let _ = write!(out, "AbortSpan/{id}");
                    }
                    Err(_) => {
                        let _ = write!(out, "AbortSpan/{}", pretty_raw(&k.detail));
                    }
                },
                Ok(suffix) => out.push_str(suffix.name()),
                Err(_) => out.push_str(&pretty_raw(&k.suffix)),
            }
            out
        }
        Ok(KeyKind::RangeLocal(k)) => {
            let anchor = pretty_raw(&k.key);
            if k.is_descriptor() {
                format!("/Local/Range/{anchor}/RangeDescriptor")
            } else if k.is_transaction() {
                match Uuid::from_slice(&k.detail) {
                    Ok(id) => format!("/Local/Range/{anchor}/Transaction/{id}"),
                    Err(_) => format!("/Local/Range/{anchor}/Transaction/{}", pretty_raw(&k.detail)),
                }
            } else {
                format!("/Local/Range/{anchor}/{}", pretty_raw(&k.suffix))
            }
        }
        Ok(KeyKind::Meta { level, key }) => format!("/Meta{level}/{}", pretty_raw(&key)),
        Ok(KeyKind::Global) => pretty_raw(key),
        Err(_) => pretty_raw(key),
    }
}

/// End of the range-id keyspace.
pub fn local_range_id_end() -> Vec<u8> {
    prefix_end(LOCAL_RANGE_ID_PREFIX)
}

/// Half-open span of raw keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeySpan {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

/// Key spans holding the data of one replica: range-id replicated state,
/// optionally range-id unreplicated state, range-local keys and user data.
pub fn replica_data_spans(desc: &RangeDescriptor, replicated_only: bool) -> Vec<KeySpan> {
    let replicated = range_id_replicated_prefix(desc.range_id);
    let mut spans = vec![KeySpan {
        end: prefix_end(&replicated),
        start: replicated,
    }];
    if !replicated_only {
        let unreplicated = range_id_unreplicated_prefix(desc.range_id);
        spans.push(KeySpan {
            end: prefix_end(&unreplicated),
            start: unreplicated,
        });
    }
    spans.push(KeySpan {
        start: range_key_prefix(&desc.start_key),
        end: range_key_prefix(&desc.end_key),
    });
    let user_start = if desc.start_key.as_slice() < LOCAL_MAX {
        LOCAL_MAX.to_vec()
    } else {
        desc.start_key.clone()
    };
    spans.push(KeySpan {
        start: user_start,
        end: desc.end_key.clone(),
    });
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_id_keys_round_trip_components() {
        let key = raft_log_key(7, 42);
        let decoded = decode_range_id_key(&key).expect("decode");
        assert_eq!(decoded.range_id, 7);
        assert!(!decoded.replicated);
        assert_eq!(decoded.kind().expect("kind"), RangeIdSuffix::RaftLog);
        assert_eq!(decoded.log_index().expect("index"), 42);
        assert_eq!(pretty_key(&key), "/Local/RangeID/7/u/RaftLog/logIndex:42");
    }

    #[test]
    fn raft_log_keys_sort_by_range_then_index() {
        let mut keys = vec![
            raft_log_key(2, 1),
            raft_log_key(1, 300),
            raft_log_key(1, 2),
            range_id_key(1, RangeIdSuffix::RaftTruncatedState),
        ];
        keys.sort();
        assert_eq!(keys[0], range_id_key(1, RangeIdSuffix::RaftTruncatedState));
        assert_eq!(keys[1], raft_log_key(1, 2));
        assert_eq!(keys[2], raft_log_key(1, 300));
        assert_eq!(keys[3], raft_log_key(2, 1));
    }

    #[test]
    fn unknown_suffix_is_reported() {
        let mut key = range_id_replicated_prefix(3);
        key.extend_from_slice(b"zzzz");
        let decoded = decode_range_id_key(&key).expect("structure is valid");
        let err = decoded.kind().expect_err("unknown suffix");
        assert!(err.to_string().contains("zzzz"), "unexpected: {err}");
    }

    #[test]
    fn classify_distinguishes_key_shapes() {
        let desc = range_descriptor_key(b"a\x00b");
        match classify(&desc).expect("classify") {
            KeyKind::RangeLocal(k) => {
                assert!(k.is_descriptor());
                assert_eq!(k.key, b"a\x00b");
            }
            other => panic!("unexpected kind {other:?}"),
        }
        let txn = transaction_key(b"a", Uuid::nil());
        assert!(matches!(classify(&txn), Ok(KeyKind::RangeLocal(k)) if k.is_transaction()));
        assert!(matches!(classify(&store_ident_key()), Ok(KeyKind::StoreLocal { .. })));
        assert!(matches!(
            classify(&range_meta_key(b"user")),
            Ok(KeyKind::Meta { level: 2, .. })
        ));
        assert!(matches!(classify(b"user"), Ok(KeyKind::Global)));
        assert!(classify(b"\x01zz").is_err());
    }

    #[test]
    fn replica_spans_skip_local_keys_for_first_range() {
        let desc = RangeDescriptor {
            range_id: 1,
            start_key: KEY_MIN.to_vec(),
            end_key: b"m".to_vec(),
            replicas: Vec::new(),
            next_replica_id: 1,
        };
        let full = replica_data_spans(&desc, false);
        assert_eq!(full.len(), 4);
        let replicated = replica_data_spans(&desc, true);
        assert_eq!(replicated.len(), 3);
        let user = &replicated[2];
        assert_eq!(user.start, LOCAL_MAX.to_vec());
        assert_eq!(user.end, b"m".to_vec());

        let log = raft_log_key(1, 3);
        assert!(!replicated.iter().any(|s| s.start <= log && log < s.end));
        assert!(full.iter().any(|s| s.start <= log && log < s.end));
    }

    #[test]
    fn suffix_replication_matches_infix() {
        for suffix in RangeIdSuffix::ALL {
            let key = decode_range_id_key(&range_id_key(1, suffix)).expect("decode");
            assert_eq!(key.replicated, suffix.is_replicated(), "{}", suffix.name());
            assert_eq!(key.kind().expect("kind"), suffix);
        }
    }
}
