//! Aggregate MVCC statistics of a range and their recomputation from raw
//! data.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::engine::{Reader, MVCC_VERSION_TIMESTAMP_SIZE};
use crate::keys::{range_id_key, replica_data_spans, RangeIdSuffix, LOCAL_MAX};
use crate::records::{MvccMetadata, RangeDescriptor};

const NANOS_PER_SEC: i64 = 1_000_000_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MvccStats {
    /// Recomputation is expected to disagree with these values.
    #[serde(default)]
    pub contains_estimates: bool,
    pub last_update_nanos: i64,
    pub intent_age: i64,
    pub gc_bytes_age: i64,
    pub live_bytes: i64,
    pub live_count: i64,
    pub key_bytes: i64,
    pub key_count: i64,
    pub val_bytes: i64,
    pub val_count: i64,
    pub intent_bytes: i64,
    pub intent_count: i64,
    pub sys_bytes: i64,
    pub sys_count: i64,
}

/// One field on which two stats disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDiff {
    pub field: &'static str,
    pub actual: i64,
    pub claimed: i64,
}

impl fmt::Display for FieldDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} != {}", self.field, self.actual, self.claimed)
    }
}

impl MvccStats {
    /// Numeric fields in declaration order.
    pub fn fields(&self) -> [(&'static str, i64); 13] {
        [
            ("last_update_nanos", self.last_update_nanos),
            ("intent_age", self.intent_age),
            ("gc_bytes_age", self.gc_bytes_age),
            ("live_bytes", self.live_bytes),
            ("live_count", self.live_count),
            ("key_bytes", self.key_bytes),
            ("key_count", self.key_count),
            ("val_bytes", self.val_bytes),
            ("val_count", self.val_count),
            ("intent_bytes", self.intent_bytes),
            ("intent_count", self.intent_count),
            ("sys_bytes", self.sys_bytes),
            ("sys_count", self.sys_count),
        ]
    }

    /// Fields where `self` (recomputed) differs from `claimed` (persisted).
    ///
    /// The estimates flag is not compared.
    pub fn diff(&self, claimed: &MvccStats) -> Vec<FieldDiff> {
        self.fields()
            .into_iter()
            .zip(claimed.fields())
            .filter(|((_, actual), (_, claimed))| actual != claimed)
            .map(|((field, actual), (_, claimed))| FieldDiff {
                field,
                actual,
                claimed,
            })
            .collect()
    }

    pub fn add(&mut self, other: &MvccStats) {
        self.contains_estimates |= other.contains_estimates;
        self.last_update_nanos = self.last_update_nanos.max(other.last_update_nanos);
        self.intent_age += other.intent_age;
        self.gc_bytes_age += other.gc_bytes_age;
        self.live_bytes += other.live_bytes;
        self.live_count += other.live_count;
        self.key_bytes += other.key_bytes;
        self.key_count += other.key_count;
        self.val_bytes += other.val_bytes;
        self.val_count += other.val_count;
        self.intent_bytes += other.intent_bytes;
        self.intent_count += other.intent_count;
        self.sys_bytes += other.sys_bytes;
        self.sys_count += other.sys_count;
    }
}

fn age_secs(now_nanos: i64, since_wall: u64) -> i64 {
    let since = i64::try_from(since_wall / NANOS_PER_SEC as u64).unwrap_or(i64::MAX);
    (now_nanos / NANOS_PER_SEC - since).max(0)
}

/// Per-key accumulation state while walking the versions of one key.
struct KeyState {
    key: Vec<u8>,
    meta_val_bytes: i64,
    seen_version: bool,
    /// Wall time of the newer version that shadows the next one seen.
    shadowed_at: u64,
}

impl KeyState {
    fn new(key: &[u8]) -> Self {
        Self {
            key: key.to_vec(),
            meta_val_bytes: 0,
            seen_version: false,
            shadowed_at: 0,
        }
    }
}

/// Recompute stats for the MVCC data with user keys in `[start, end)` as of
/// `now_nanos`, leaving out keys matched by `skip`.
fn compute_stats_filtered<R: Reader + ?Sized>(
    reader: &R,
    start: &[u8],
    end: &[u8],
    now_nanos: i64,
    skip: &dyn Fn(&[u8]) -> bool,
) -> anyhow::Result<MvccStats> {
    let mut ms = MvccStats {
        last_update_nanos: now_nanos,
        ..MvccStats::default()
    };
    let mut state: Option<KeyState> = None;
    reader.iterate(start, end, &mut |kv| {
        let key = &kv.key.key;
        if skip(key.as_slice()) {
            return Ok(true);
        }
        let val_len = kv.value.len() as i64;
        let new_key = state.as_ref().map_or(true, |s| &s.key != key);

        if key.as_slice() < LOCAL_MAX {
            if new_key {
                ms.sys_count += 1;
                state = Some(KeyState::new(key));
            }
            ms.sys_bytes += kv.key.encoded_size() as i64 + val_len;
            return Ok(true);
        }

        if new_key {
            ms.key_count += 1;
            ms.key_bytes += key.len() as i64;
            state = Some(KeyState::new(key));
        }
        let Some(st) = state.as_mut() else {
            return Ok(true);
        };

        if !kv.key.is_value() {
            let meta = MvccMetadata::decode(&kv.value)?;
            ms.val_bytes += val_len;
            st.meta_val_bytes = val_len;
            if meta.is_inline() {
                ms.val_count += 1;
                ms.live_count += 1;
                ms.live_bytes += key.len() as i64 + val_len;
            } else if meta.txn.is_some() {
                ms.intent_count += 1;
                ms.intent_bytes += (meta.key_bytes + meta.val_bytes) as i64;
                ms.intent_age += age_secs(now_nanos, meta.timestamp.wall_time);
            }
            return Ok(true);
        }

        let version_bytes = MVCC_VERSION_TIMESTAMP_SIZE as i64 + val_len;
        ms.key_bytes += MVCC_VERSION_TIMESTAMP_SIZE as i64;
        ms.val_bytes += val_len;
        ms.val_count += 1;
        let wall = kv.key.timestamp.wall_time;
        if !st.seen_version {
            st.seen_version = true;
            if kv.value.is_empty() {
                // Deletion tombstone: the key and the tombstone are garbage
                // from the deletion on.
                let garbage = key.len() as i64 + st.meta_val_bytes + version_bytes;
                ms.gc_bytes_age += garbage * age_secs(now_nanos, wall);
            } else {
                ms.live_count += 1;
                ms.live_bytes += key.len() as i64 + st.meta_val_bytes + version_bytes;
            }
        } else {
            ms.gc_bytes_age += version_bytes * age_secs(now_nanos, st.shadowed_at);
        }
        st.shadowed_at = wall;
        Ok(true)
    })?;
    Ok(ms)
}

/// Recompute the stats of the replicated data of a range.
///
/// The keys persisting the stats themselves are excluded.
pub fn compute_stats_for_range<R: Reader + ?Sized>(
    reader: &R,
    desc: &RangeDescriptor,
    now_nanos: i64,
) -> anyhow::Result<MvccStats> {
    let applied_state = range_id_key(desc.range_id, RangeIdSuffix::RangeAppliedState);
    let legacy_stats = range_id_key(desc.range_id, RangeIdSuffix::RangeStatsLegacy);
    let skip = |key: &[u8]| key == applied_state.as_slice() || key == legacy_stats.as_slice();
    let mut ms = MvccStats {
        last_update_nanos: now_nanos,
        ..MvccStats::default()
    };
    for span in replica_data_spans(desc, true) {
        let part = compute_stats_filtered(reader, &span.start, &span.end, now_nanos, &skip)?;
        ms.add(&part);
    }
    Ok(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Batch, MemEngine};
    use crate::hlc::Timestamp;
    use crate::mvcc::{mvcc_put, put_inline};
    use crate::value::Value;

    const SEC: u64 = 1_000_000_000;

    #[test]
    fn diff_lists_only_disagreeing_fields() {
        let claimed = MvccStats {
            live_bytes: 10,
            key_count: 1,
            contains_estimates: true,
            ..MvccStats::default()
        };
        let mut actual = claimed.clone();
        actual.contains_estimates = false;
        assert!(actual.diff(&claimed).is_empty());

        actual.live_bytes = 12;
        let diff = actual.diff(&claimed);
        assert_eq!(
            diff,
            vec![FieldDiff {
                field: "live_bytes",
                actual: 12,
                claimed: 10
            }]
        );
        assert_eq!(diff[0].to_string(), "live_bytes: 12 != 10");
    }

    #[test]
    fn shadowed_versions_accumulate_gc_age() {
        let engine = MemEngine::new();
        let mut batch = Batch::new(&engine);
        mvcc_put(&mut batch, b"k", Timestamp::new(10 * SEC, 0), None, &Value::from_bytes(b"a"))
            .expect("put");
        mvcc_put(&mut batch, b"k", Timestamp::new(20 * SEC, 0), None, &Value::from_bytes(b"bb"))
            .expect("put");
        put_inline(&mut batch, b"\x01sfoo", &Value::from_int(1)).expect("sys");

        let now = (30 * SEC) as i64;
        let ms = compute_stats_filtered(&batch, b"", b"\xff", now, &|_| false).expect("compute");
        let old_len = Value::from_bytes(b"a").raw_bytes().len() as i64;
        let new_len = Value::from_bytes(b"bb").raw_bytes().len() as i64;

        assert_eq!(ms.key_count, 1);
        assert_eq!(ms.val_count, 2);
        assert_eq!(ms.live_count, 1);
        assert_eq!(ms.live_bytes, 1 + 12 + new_len);
        assert_eq!(ms.gc_bytes_age, (12 + old_len) * 10);
        assert_eq!(ms.sys_count, 1);
        assert!(ms.sys_bytes > 0);
        assert_eq!(ms.last_update_nanos, now);
    }
}
