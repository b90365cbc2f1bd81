//! Storage capability used by every offline tool, plus the in-memory engine
//! and the write batch layered over any engine.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use anyhow::{anyhow, ensure};

use crate::encoding::{decode_bytes_ascending, encode_bytes_ascending, read_u32, read_u64};
use crate::hlc::Timestamp;
use crate::keys::KEY_MAX;

/// Encoded size of a version timestamp appended to a key.
pub const MVCC_VERSION_TIMESTAMP_SIZE: u64 = 12;

/// A user key plus an optional version timestamp.
///
/// The zero timestamp addresses the metadata entry of the key. Encoded keys
/// sort by user key, then metadata first, then versions newest first.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MvccKey {
    pub key: Vec<u8>,
    pub timestamp: Timestamp,
}

impl MvccKey {
    pub fn meta(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            timestamp: Timestamp::ZERO,
        }
    }

    pub fn versioned(key: impl Into<Vec<u8>>, timestamp: Timestamp) -> Self {
        Self {
            key: key.into(),
            timestamp,
        }
    }

    pub fn is_value(&self) -> bool {
        !self.timestamp.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.key.len() + 2 + MVCC_VERSION_TIMESTAMP_SIZE as usize);
        encode_bytes_ascending(&mut out, &self.key);
        if self.is_value() {
            out.extend_from_slice(&(!self.timestamp.wall_time).to_be_bytes());
            out.extend_from_slice(&(!self.timestamp.logical).to_be_bytes());
        }
        out
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        let (key, rest) = decode_bytes_ascending(data)?;
        if rest.is_empty() {
            return Ok(Self::meta(key));
        }
        ensure!(
            rest.len() as u64 == MVCC_VERSION_TIMESTAMP_SIZE,
            "invalid mvcc key timestamp length {}",
            rest.len()
        );
        let mut offset = 0usize;
        let wall = !read_u64(rest, &mut offset)?;
        let logical = !read_u32(rest, &mut offset)?;
        Ok(Self::versioned(key, Timestamp::new(wall, logical)))
    }

    /// Bytes the key accounts for in MVCC stats.
    pub fn encoded_size(&self) -> u64 {
        let mut size = self.key.len() as u64;
        if self.is_value() {
            size += MVCC_VERSION_TIMESTAMP_SIZE;
        }
        size
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MvccKeyValue {
    pub key: MvccKey,
    pub value: Vec<u8>,
}

/// Callback over raw engine entries; return `false` to stop.
pub type RawVisitor<'v> = dyn FnMut(&[u8], &[u8]) -> anyhow::Result<bool> + 'v;

/// Bounded forward reads over encoded engine entries.
pub trait Reader {
    /// Visit entries with encoded keys in `[start, end)` in ascending order.
    fn scan_raw(&self, start: &[u8], end: &[u8], visit: &mut RawVisitor<'_>) -> anyhow::Result<()>;

    fn get_raw(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;

    /// Visit every MVCC entry whose user key lies in `[start, end)`, metadata
    /// and all versions included.
    fn iterate(
        &self,
        start: &[u8],
        end: &[u8],
        visit: &mut dyn FnMut(MvccKeyValue) -> anyhow::Result<bool>,
    ) -> anyhow::Result<()> {
        let start = MvccKey::meta(start).encode();
        let end = MvccKey::meta(end).encode();
        self.scan_raw(&start, &end, &mut |key, value| {
            let key = MvccKey::decode(key)?;
            visit(MvccKeyValue {
                key,
                value: value.to_vec(),
            })
        })
    }

    fn get(&self, key: &MvccKey) -> anyhow::Result<Option<Vec<u8>>> {
        self.get_raw(&key.encode())
    }
}

pub trait Writer: Reader {
    fn put(&mut self, key: &MvccKey, value: Vec<u8>) -> anyhow::Result<()>;
    fn clear(&mut self, key: &MvccKey) -> anyhow::Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// An engine that can atomically apply a set of writes.
pub trait Engine: Reader {
    fn apply_batch(&self, ops: Vec<BatchOp>) -> anyhow::Result<()>;
}

/// Every entry of the engine, in key order.
pub fn snapshot(reader: &dyn Reader) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut end = MvccKey::meta(KEY_MAX).encode();
    end.push(0xff);
    let mut out = Vec::new();
    reader.scan_raw(&[], &end, &mut |key, value| {
        out.push((key.to_vec(), value.to_vec()));
        Ok(true)
    })?;
    Ok(out)
}

/// Staged writes over an engine with read-your-writes semantics.
///
/// Nothing reaches the engine until [`Batch::commit`]; dropping the batch
/// discards the staged writes.
pub struct Batch<'a> {
    engine: &'a dyn Engine,
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'a> Batch<'a> {
    pub fn new(engine: &'a dyn Engine) -> Self {
        Self {
            engine,
            writes: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn commit(self) -> anyhow::Result<()> {
        if self.writes.is_empty() {
            return Ok(());
        }
        let ops = self
            .writes
            .into_iter()
            .map(|(key, value)| match value {
                Some(value) => BatchOp::Put { key, value },
                None => BatchOp::Delete { key },
            })
            .collect();
        self.engine.apply_batch(ops)
    }
}

impl Reader for Batch<'_> {
    fn scan_raw(&self, start: &[u8], end: &[u8], visit: &mut RawVisitor<'_>) -> anyhow::Result<()> {
        if start >= end {
            return Ok(());
        }
        let mut staged = self
            .writes
            .range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)))
            .peekable();
        let mut stopped = false;
        self.engine.scan_raw(start, end, &mut |key, value| {
            while let Some((staged_key, staged_value)) = staged.next_if(|(k, _)| k.as_slice() <= key) {
                if staged_key.as_slice() == key {
                    // Staged write shadows the engine entry.
                    if let Some(v) = staged_value {
                        if !visit(staged_key.as_slice(), v.as_slice())? {
                            stopped = true;
                            return Ok(false);
                        }
                    }
                    return Ok(true);
                }
                if let Some(v) = staged_value {
                    if !visit(staged_key.as_slice(), v.as_slice())? {
                        stopped = true;
                        return Ok(false);
                    }
                }
            }
            if !visit(key, value)? {
                stopped = true;
                return Ok(false);
            }
            Ok(true)
        })?;
        if stopped {
            return Ok(());
        }
        for (key, value) in staged {
            if let Some(value) = value {
                if !visit(key.as_slice(), value.as_slice())? {
                    break;
                }
            }
        }
        Ok(())
    }

    fn get_raw(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        match self.writes.get(key) {
            Some(staged) => Ok(staged.clone()),
            None => self.engine.get_raw(key),
        }
    }
}

impl Writer for Batch<'_> {
    fn put(&mut self, key: &MvccKey, value: Vec<u8>) -> anyhow::Result<()> {
        self.writes.insert(key.encode(), Some(value));
        Ok(())
    }

    fn clear(&mut self, key: &MvccKey) -> anyhow::Result<()> {
        self.writes.insert(key.encode(), None);
        Ok(())
    }
}

/// In-memory engine for tests and fixtures.
#[derive(Default)]
pub struct MemEngine {
    inner: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|guard| guard.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Reader for MemEngine {
    fn scan_raw(&self, start: &[u8], end: &[u8], visit: &mut RawVisitor<'_>) -> anyhow::Result<()> {
        if start >= end {
            return Ok(());
        }
        // Copy the span out so the visitor may read the engine again.
        let entries: Vec<(Vec<u8>, Vec<u8>)> = {
            let guard = self
                .inner
                .read()
                .map_err(|_| anyhow!("mem engine lock poisoned"))?;
            guard
                .range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        for (key, value) in entries {
            if !visit(&key, &value)? {
                break;
            }
        }
        Ok(())
    }

    fn get_raw(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let guard = self
            .inner
            .read()
            .map_err(|_| anyhow!("mem engine lock poisoned"))?;
        Ok(guard.get(key).cloned())
    }
}

impl Engine for MemEngine {
    fn apply_batch(&self, ops: Vec<BatchOp>) -> anyhow::Result<()> {
        let mut guard = self
            .inner
            .write()
            .map_err(|_| anyhow!("mem engine lock poisoned"))?;
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    guard.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    guard.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mvcc_keys_sort_meta_first_then_newest() {
        let meta = MvccKey::meta("k").encode();
        let newer = MvccKey::versioned("k", Timestamp::new(20, 0)).encode();
        let older = MvccKey::versioned("k", Timestamp::new(10, 5)).encode();
        let next = MvccKey::meta("k\x00").encode();
        assert!(meta < newer);
        assert!(newer < older);
        assert!(older < next);

        let decoded = MvccKey::decode(&older).expect("decode");
        assert_eq!(decoded, MvccKey::versioned("k", Timestamp::new(10, 5)));
        assert_eq!(decoded.encoded_size(), 1 + MVCC_VERSION_TIMESTAMP_SIZE);
    }

    #[test]
    fn batch_reads_its_own_writes_and_discards_on_drop() {
        let engine = MemEngine::new();
        let mut seed = Batch::new(&engine);
        seed.put(&MvccKey::meta("a"), b"1".to_vec()).expect("put");
        seed.put(&MvccKey::meta("c"), b"3".to_vec()).expect("put");
        seed.commit().expect("commit");

        {
            let mut batch = Batch::new(&engine);
            batch.put(&MvccKey::meta("b"), b"2".to_vec()).expect("put");
            batch.clear(&MvccKey::meta("c")).expect("clear");
            batch.put(&MvccKey::meta("a"), b"1'".to_vec()).expect("put");

            let mut seen = Vec::new();
            batch
                .iterate(b"", b"z", &mut |kv| {
                    seen.push((kv.key.key, kv.value));
                    Ok(true)
                })
                .expect("iterate");
            assert_eq!(
                seen,
                vec![(b"a".to_vec(), b"1'".to_vec()), (b"b".to_vec(), b"2".to_vec())]
            );
        }

        let after = snapshot(&engine).expect("snapshot");
        assert_eq!(after.len(), 2);
        assert_eq!(
            engine.get(&MvccKey::meta("a")).expect("get"),
            Some(b"1".to_vec())
        );
    }

    #[test]
    fn batch_scan_stops_early() {
        let engine = MemEngine::new();
        let mut batch = Batch::new(&engine);
        for key in ["a", "b", "c"] {
            batch.put(&MvccKey::meta(key), Vec::new()).expect("put");
        }
        let mut count = 0;
        batch
            .iterate(b"", b"z", &mut |_| {
                count += 1;
                Ok(count < 2)
            })
            .expect("iterate");
        assert_eq!(count, 2);
    }
}
