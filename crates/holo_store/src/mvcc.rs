//! MVCC read and write primitives over the engine capability.
//!
//! Every key has an optional metadata entry (zero timestamp) followed by its
//! versions, newest first. Inline keys keep their value inside the metadata
//! and have no versions; an intent is metadata naming the transaction that
//! wrote the newest, still provisional, version.

use anyhow::{anyhow, Context};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::engine::{MvccKey, Reader, Writer, MVCC_VERSION_TIMESTAMP_SIZE};
use crate::error::{DecodeError, MvccError};
use crate::hlc::Timestamp;
use crate::keys::{
    decode_range_key, pretty_key, store_ident_key, LOCAL_RANGE_MAX, LOCAL_RANGE_PREFIX,
};
use crate::records::{Intent, MvccMetadata, RangeDescriptor, StoreIdent, TransactionStatus, TxnMeta};
use crate::value::Value;

pub fn read_meta<R: Reader + ?Sized>(reader: &R, key: &[u8]) -> anyhow::Result<Option<MvccMetadata>> {
    match reader.get(&MvccKey::meta(key))? {
        Some(raw) => Ok(Some(MvccMetadata::decode(&raw)?)),
        None => Ok(None),
    }
}

pub fn put_inline(writer: &mut dyn Writer, key: &[u8], value: &Value) -> anyhow::Result<()> {
    let meta = MvccMetadata::inline(value.raw_bytes().to_vec());
    writer.put(&MvccKey::meta(key), meta.encode()?)
}

pub fn put_inline_struct<T: Serialize>(
    writer: &mut dyn Writer,
    key: &[u8],
    value: &T,
) -> anyhow::Result<()> {
    put_inline(writer, key, &Value::from_struct(value)?)
}

pub fn get_inline<R: Reader + ?Sized>(reader: &R, key: &[u8]) -> anyhow::Result<Option<Value>> {
    let Some(meta) = read_meta(reader, key)? else {
        return Ok(None);
    };
    match meta.raw_bytes {
        Some(raw) => Ok(Some(Value::from_raw(raw))),
        None => Err(DecodeError::NotInline(pretty_key(key)).into()),
    }
}

pub fn get_inline_struct<T: DeserializeOwned, R: Reader + ?Sized>(
    reader: &R,
    key: &[u8],
    what: &'static str,
) -> anyhow::Result<Option<T>> {
    match get_inline(reader, key)? {
        Some(value) => Ok(Some(value.get_struct(what)?)),
        None => Ok(None),
    }
}

pub fn delete_inline(writer: &mut dyn Writer, key: &[u8]) -> anyhow::Result<()> {
    writer.clear(&MvccKey::meta(key))
}

/// Write a new version of `key` at `timestamp`.
///
/// With `txn` the version is provisional and an intent is laid down. Fails
/// with [`MvccError::WriteIntent`] when another transaction holds an intent on
/// the key, and with [`MvccError::WriteTooOld`] when a committed version at or
/// above `timestamp` exists.
pub fn mvcc_put(
    writer: &mut dyn Writer,
    key: &[u8],
    timestamp: Timestamp,
    txn: Option<&TxnMeta>,
    value: &Value,
) -> Result<(), MvccError> {
    if timestamp.is_empty() {
        return Err(anyhow!("versioned write to {} needs a timestamp", pretty_key(key)).into());
    }
    let existing = read_meta(&*writer, key)?;
    if let Some(meta) = &existing {
        if meta.is_inline() {
            return Err(anyhow!("{} holds an inline value", pretty_key(key)).into());
        }
        if let Some(holder) = &meta.txn {
            if txn.map(|t| t.id) != Some(holder.id) {
                return Err(MvccError::WriteIntent {
                    intents: vec![Intent {
                        key: key.to_vec(),
                        txn: holder.clone(),
                        status: TransactionStatus::Pending,
                    }],
                });
            }
        }
    }
    let own_provisional = existing.as_ref().filter(|m| m.txn.is_some()).map(|m| m.timestamp);
    if let Some(newest) = newest_committed_version(&*writer, key, own_provisional)? {
        if newest >= timestamp {
            return Err(MvccError::WriteTooOld {
                key: pretty_key(key),
                timestamp,
                existing: newest,
            });
        }
    }
    if let Some(provisional) = own_provisional.filter(|ts| *ts != timestamp) {
        writer.clear(&MvccKey::versioned(key, provisional))?;
    }

    writer.put(&MvccKey::versioned(key, timestamp), value.raw_bytes().to_vec())?;
    match txn {
        Some(txn) => {
            let meta = MvccMetadata {
                txn: Some(txn.clone()),
                timestamp,
                deleted: value.is_tombstone(),
                key_bytes: MVCC_VERSION_TIMESTAMP_SIZE,
                val_bytes: value.raw_bytes().len() as u64,
                raw_bytes: None,
            };
            writer.put(&MvccKey::meta(key), meta.encode()?)?;
        }
        None if existing.is_some() => writer.clear(&MvccKey::meta(key))?,
        None => {}
    }
    Ok(())
}

/// Timestamp of the newest version of `key`, ignoring the provisional
/// version at `skip`.
fn newest_committed_version<R: Reader + ?Sized>(
    reader: &R,
    key: &[u8],
    skip: Option<Timestamp>,
) -> anyhow::Result<Option<Timestamp>> {
    let mut end = key.to_vec();
    end.push(0);
    let mut newest = None;
    reader.iterate(key, &end, &mut |kv| {
        if kv.key.key != key || !kv.key.is_value() || Some(kv.key.timestamp) == skip {
            return Ok(true);
        }
        newest = Some(kv.key.timestamp);
        Ok(false)
    })?;
    Ok(newest)
}

/// Resolve the intent on `intent.key` if it belongs to `intent.txn`.
///
/// Returns whether an intent was found and resolved.
pub fn mvcc_resolve_write_intent(writer: &mut dyn Writer, intent: &Intent) -> anyhow::Result<bool> {
    let Some(meta) = read_meta(&*writer, &intent.key)? else {
        return Ok(false);
    };
    let Some(holder) = meta.txn.as_ref() else {
        return Ok(false);
    };
    if holder.id != intent.txn.id {
        return Ok(false);
    }
    let provisional = MvccKey::versioned(intent.key.clone(), meta.timestamp);
    match intent.status {
        TransactionStatus::Aborted => {
            writer.clear(&MvccKey::meta(intent.key.clone()))?;
            writer.clear(&provisional)?;
        }
        TransactionStatus::Committed => {
            writer.clear(&MvccKey::meta(intent.key.clone()))?;
            move_version(writer, &provisional, intent.txn.timestamp)?;
        }
        TransactionStatus::Pending => {
            if intent.txn.timestamp <= meta.timestamp {
                return Ok(true);
            }
            move_version(writer, &provisional, intent.txn.timestamp)?;
            let pushed = MvccMetadata {
                txn: Some(intent.txn.clone()),
                timestamp: intent.txn.timestamp,
                ..meta.clone()
            };
            writer.put(&MvccKey::meta(intent.key.clone()), pushed.encode()?)?;
        }
    }
    debug!(
        key = %pretty_key(&intent.key),
        txn = %intent.txn.short_id(),
        status = ?intent.status,
        "resolved intent"
    );
    Ok(true)
}

fn move_version(writer: &mut dyn Writer, from: &MvccKey, to: Timestamp) -> anyhow::Result<()> {
    if from.timestamp == to {
        return Ok(());
    }
    let value = writer
        .get(from)?
        .with_context(|| format!("provisional value of {} is missing", pretty_key(&from.key)))?;
    writer.clear(from)?;
    writer.put(&MvccKey::versioned(from.key.clone(), to), value)
}

/// Visit the newest readable value of every key in `[start, end)`.
///
/// Inline values are reported with the zero timestamp. Provisional versions
/// under an intent and deletion tombstones are skipped.
pub fn mvcc_scan_latest<R: Reader + ?Sized>(
    reader: &R,
    start: &[u8],
    end: &[u8],
    visit: &mut dyn FnMut(&[u8], Timestamp, Value) -> anyhow::Result<bool>,
) -> anyhow::Result<()> {
    let mut current: Option<Vec<u8>> = None;
    let mut done = false;
    let mut intent_ts: Option<Timestamp> = None;
    reader.iterate(start, end, &mut |kv| {
        if current.as_deref() != Some(kv.key.key.as_slice()) {
            current = Some(kv.key.key.clone());
            done = false;
            intent_ts = None;
        }
        if done {
            return Ok(true);
        }
        if !kv.key.is_value() {
            let meta = MvccMetadata::decode(&kv.value)
                .with_context(|| format!("metadata of {}", pretty_key(&kv.key.key)))?;
            if let Some(raw) = meta.raw_bytes {
                done = true;
                return visit(kv.key.key.as_slice(), Timestamp::ZERO, Value::from_raw(raw));
            }
            if meta.txn.is_some() {
                intent_ts = Some(meta.timestamp);
            }
            return Ok(true);
        }
        if intent_ts == Some(kv.key.timestamp) {
            return Ok(true);
        }
        done = true;
        let value = Value::from_raw(kv.value);
        if value.is_tombstone() {
            return Ok(true);
        }
        visit(kv.key.key.as_slice(), kv.key.timestamp, value)
    })
}

/// Visit every range descriptor of the store in start-key order.
pub fn iterate_range_descriptors<R: Reader + ?Sized>(
    reader: &R,
    visit: &mut dyn FnMut(RangeDescriptor) -> anyhow::Result<bool>,
) -> anyhow::Result<()> {
    mvcc_scan_latest(reader, LOCAL_RANGE_PREFIX, LOCAL_RANGE_MAX, &mut |key, _, value| {
        let local = decode_range_key(key)?;
        if !local.is_descriptor() {
            return Ok(true);
        }
        let desc: RangeDescriptor = value
            .get_struct("range descriptor")
            .with_context(|| format!("decode {}", pretty_key(key)))?;
        visit(desc)
    })
}

pub fn read_store_ident<R: Reader + ?Sized>(reader: &R) -> anyhow::Result<StoreIdent> {
    get_inline_struct(reader, &store_ident_key(), "store ident")?
        .context("store identity record not found")
}

pub fn write_store_ident(writer: &mut dyn Writer, ident: &StoreIdent) -> anyhow::Result<()> {
    put_inline_struct(writer, &store_ident_key(), ident)
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::engine::{snapshot, Batch, MemEngine};
    use crate::keys::range_descriptor_key;

    fn txn(wall: u64) -> TxnMeta {
        TxnMeta {
            id: Uuid::new_v4(),
            key: b"a".to_vec(),
            epoch: 0,
            timestamp: Timestamp::new(wall, 0),
            sequence: 1,
        }
    }

    fn mvcc_get_latest<R: Reader + ?Sized>(
        reader: &R,
        key: &[u8],
    ) -> anyhow::Result<Option<(Timestamp, Value)>> {
        let mut end = key.to_vec();
        end.push(0);
        let mut found = None;
        mvcc_scan_latest(reader, key, &end, &mut |_, ts, value| {
            found = Some((ts, value));
            Ok(false)
        })?;
        Ok(found)
    }

    fn latest(reader: &dyn Reader, key: &[u8]) -> Option<Vec<u8>> {
        mvcc_get_latest(reader, key)
            .expect("read")
            .map(|(_, v)| v.get_bytes().expect("bytes").to_vec())
    }

    #[test]
    fn inline_values_round_trip() {
        let engine = MemEngine::new();
        let mut batch = Batch::new(&engine);
        put_inline(&mut batch, b"k", &Value::from_int(7)).expect("put");
        let value = get_inline(&batch, b"k").expect("get").expect("present");
        assert_eq!(value.get_int().expect("int"), 7);
        delete_inline(&mut batch, b"k").expect("delete");
        assert!(get_inline(&batch, b"k").expect("get").is_none());
    }

    #[test]
    fn foreign_intent_blocks_put() {
        let engine = MemEngine::new();
        let mut batch = Batch::new(&engine);
        let owner = txn(10);
        mvcc_put(&mut batch, b"k", owner.timestamp, Some(&owner), &Value::from_bytes(b"v1"))
            .expect("txn put");

        let err = mvcc_put(&mut batch, b"k", Timestamp::new(20, 0), None, &Value::from_bytes(b"v2"))
            .expect_err("conflict");
        match err {
            MvccError::WriteIntent { intents } => {
                assert_eq!(intents.len(), 1);
                assert_eq!(intents[0].txn.id, owner.id);
            }
            other => panic!("unexpected error {other}"),
        }

        // Provisional values are not visible to the latest-value read.
        assert_eq!(latest(&batch, b"k"), None);
    }

    #[test]
    fn put_at_or_below_newest_version_is_too_old() {
        let engine = MemEngine::new();
        let mut batch = Batch::new(&engine);
        mvcc_put(&mut batch, b"k", Timestamp::new(50, 0), None, &Value::from_bytes(b"v1"))
            .expect("put");

        for ts in [Timestamp::new(50, 0), Timestamp::new(10, 3)] {
            let err = mvcc_put(&mut batch, b"k", ts, None, &Value::from_bytes(b"v2"))
                .expect_err("too old");
            match err {
                MvccError::WriteTooOld { timestamp, existing, .. } => {
                    assert_eq!(timestamp, ts);
                    assert_eq!(existing, Timestamp::new(50, 0));
                }
                other => panic!("unexpected error {other}"),
            }
        }
        assert_eq!(latest(&batch, b"k"), Some(b"v1".to_vec()));

        mvcc_put(&mut batch, b"k", Timestamp::new(50, 1), None, &Value::from_bytes(b"v3"))
            .expect("newer put");
        assert_eq!(latest(&batch, b"k"), Some(b"v3".to_vec()));
    }

    #[test]
    fn own_intent_can_be_rewritten_at_same_timestamp() {
        let engine = MemEngine::new();
        let mut batch = Batch::new(&engine);
        let owner = txn(10);
        mvcc_put(&mut batch, b"k", owner.timestamp, Some(&owner), &Value::from_bytes(b"v1"))
            .expect("txn put");
        mvcc_put(&mut batch, b"k", owner.timestamp, Some(&owner), &Value::from_bytes(b"v2"))
            .expect("rewrite");
        let provisional = batch
            .get(&MvccKey::versioned(b"k".to_vec(), owner.timestamp))
            .expect("get")
            .expect("present");
        assert_eq!(Value::from_raw(provisional).get_bytes().expect("bytes"), b"v2");
    }

    #[test]
    fn aborting_an_intent_removes_provisional_value() {
        let engine = MemEngine::new();
        let mut seed = Batch::new(&engine);
        mvcc_put(&mut seed, b"k", Timestamp::new(5, 0), None, &Value::from_bytes(b"old"))
            .expect("put");
        seed.commit().expect("commit");
        let before = snapshot(&engine).expect("snapshot");

        let mut batch = Batch::new(&engine);
        let owner = txn(10);
        mvcc_put(&mut batch, b"k", owner.timestamp, Some(&owner), &Value::from_bytes(b"new"))
            .expect("txn put");
        let resolved = mvcc_resolve_write_intent(
            &mut batch,
            &Intent {
                key: b"k".to_vec(),
                txn: owner,
                status: TransactionStatus::Aborted,
            },
        )
        .expect("resolve");
        assert!(resolved);
        batch.commit().expect("commit");
        assert_eq!(snapshot(&engine).expect("snapshot"), before);
        assert_eq!(latest(&engine, b"k"), Some(b"old".to_vec()));
    }

    #[test]
    fn committing_an_intent_moves_value_to_commit_timestamp() {
        let engine = MemEngine::new();
        let mut batch = Batch::new(&engine);
        let mut owner = txn(10);
        mvcc_put(&mut batch, b"k", owner.timestamp, Some(&owner), &Value::from_bytes(b"v"))
            .expect("txn put");
        owner.timestamp = Timestamp::new(15, 0);
        mvcc_resolve_write_intent(
            &mut batch,
            &Intent {
                key: b"k".to_vec(),
                txn: owner,
                status: TransactionStatus::Committed,
            },
        )
        .expect("resolve");
        let (ts, value) = mvcc_get_latest(&batch, b"k").expect("read").expect("present");
        assert_eq!(ts, Timestamp::new(15, 0));
        assert_eq!(value.get_bytes().expect("bytes"), b"v");
        assert!(read_meta(&batch, b"k").expect("meta").is_none());
    }

    #[test]
    fn descriptor_iteration_skips_other_range_local_keys() {
        let engine = MemEngine::new();
        let mut batch = Batch::new(&engine);
        let desc = RangeDescriptor {
            range_id: 1,
            start_key: b"a".to_vec(),
            end_key: b"z".to_vec(),
            replicas: Vec::new(),
            next_replica_id: 1,
        };
        mvcc_put(
            &mut batch,
            &range_descriptor_key(&desc.start_key),
            Timestamp::new(1, 0),
            None,
            &Value::from_struct(&desc).expect("encode"),
        )
        .expect("put");
        put_inline(
            &mut batch,
            &crate::keys::transaction_key(b"a", Uuid::nil()),
            &Value::from_int(1),
        )
        .expect("txn record");

        let mut seen = Vec::new();
        iterate_range_descriptors(&batch, &mut |d| {
            seen.push(d);
            Ok(true)
        })
        .expect("iterate");
        assert_eq!(seen, vec![desc]);
    }
}
