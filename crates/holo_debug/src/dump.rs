//! Human-readable dumps of store contents.

use std::io::Write;

use anyhow::{bail, Context};
use holo_store::encoding::{prefix_end, quote_bytes};
use holo_store::keys::{
    pretty_key, raft_log_prefix, replica_data_spans, KEY_MAX, KEY_MIN, LOCAL_RANGE_MAX,
    LOCAL_RANGE_PREFIX,
};
use holo_store::records::{RangeDescriptor, RangeId};
use holo_store::{MvccKeyValue, Reader};

use crate::decode::{decode, Interpreter, Outcome};

#[derive(Debug, Clone, Default)]
pub struct KeysConfig {
    /// Decode and print values.
    pub values: bool,
    /// Print encoded key and value sizes.
    pub sizes: bool,
    pub start: Option<Vec<u8>>,
    pub end: Option<Vec<u8>>,
}

/// Parse a range id argument; ids start at 1.
pub fn parse_range_id(arg: &str) -> anyhow::Result<RangeId> {
    let id: i64 = arg
        .trim()
        .parse()
        .with_context(|| format!("invalid range ID {arg:?}"))?;
    if id < 1 {
        bail!("illegal RangeID: {id}");
    }
    Ok(id as RangeId)
}

/// Key bound argument, as UTF-8 text or, with `hex`, hex bytes without a
/// `0x` prefix.
pub fn parse_key(input: &str, hex: bool) -> anyhow::Result<Vec<u8>> {
    if !hex {
        return Ok(input.as_bytes().to_vec());
    }
    if input.len() % 2 != 0 {
        bail!("hex string must have even length");
    }
    input
        .as_bytes()
        .chunks(2)
        .map(|pair| Ok((hex_value(pair[0])? << 4) | hex_value(pair[1])?))
        .collect()
}

fn hex_value(byte: u8) -> anyhow::Result<u8> {
    match byte {
        b'0'..=b'9' => Ok(byte - b'0'),
        b'a'..=b'f' => Ok(byte - b'a' + 10),
        b'A'..=b'F' => Ok(byte - b'A' + 10),
        _ => bail!("invalid hex character {:?}", char::from(byte)),
    }
}

fn write_key(kv: &MvccKeyValue, out: &mut dyn Write) -> std::io::Result<()> {
    if kv.key.is_value() {
        write!(out, "{} {}", pretty_key(&kv.key.key), kv.key.timestamp)
    } else {
        write!(out, "{}", pretty_key(&kv.key.key))
    }
}

fn write_entry(kv: &MvccKeyValue, cfg: &KeysConfig, out: &mut dyn Write) -> anyhow::Result<()> {
    if cfg.sizes {
        write!(out, "{} {}: ", kv.key.encoded_size(), kv.value.len())?;
    }
    write_key(kv, out)?;
    if cfg.values {
        match decode(kv) {
            Outcome::Decoded(record) => write!(out, ": {record}")?,
            Outcome::Unrecognized => write!(out, ": {}", quote_bytes(&kv.value))?,
            Outcome::Invalid(err) => write!(out, ": <invalid: {err}>")?,
        }
    }
    writeln!(out)?;
    Ok(())
}

/// Every entry in the configured key bounds, metadata and versions alike.
pub fn keys<R: Reader + ?Sized>(reader: &R, cfg: &KeysConfig, out: &mut dyn Write) -> anyhow::Result<()> {
    let start = cfg.start.as_deref().unwrap_or(KEY_MIN);
    let end = cfg.end.as_deref().unwrap_or(KEY_MAX);
    reader.iterate(start, end, &mut |kv| {
        write_entry(&kv, cfg, out)?;
        Ok(true)
    })
}

/// Every version of every range descriptor.
pub fn range_descriptors<R: Reader + ?Sized>(reader: &R, out: &mut dyn Write) -> anyhow::Result<()> {
    reader.iterate(LOCAL_RANGE_PREFIX, LOCAL_RANGE_MAX, &mut |kv| {
        match Interpreter::RangeDescriptor.interpret(&kv) {
            Outcome::Decoded(record) => {
                write_key(&kv, out)?;
                writeln!(out, "\n{record}\n")?;
            }
            Outcome::Invalid(err) => {
                return Err(err).with_context(|| format!("decode {}", pretty_key(&kv.key.key)));
            }
            Outcome::Unrecognized => {}
        }
        Ok(true)
    })
}

/// The raft log of one range, in index order.
pub fn raft_log<R: Reader + ?Sized>(reader: &R, range_id: RangeId, out: &mut dyn Write) -> anyhow::Result<()> {
    let prefix = raft_log_prefix(range_id);
    reader.iterate(&prefix, &prefix_end(&prefix), &mut |kv| {
        match Interpreter::RaftLogEntry.interpret(&kv) {
            Outcome::Decoded(record) => {
                write_key(&kv, out)?;
                writeln!(out, "\n{record}\n")?;
                Ok(true)
            }
            Outcome::Invalid(err) => {
                Err(err).with_context(|| format!("decode {}", pretty_key(&kv.key.key)))
            }
            Outcome::Unrecognized => bail!("unexpected key {} in raft log", pretty_key(&kv.key.key)),
        }
    })
}

/// All data of one replica, with decoded values.
pub fn range_data<R: Reader + ?Sized>(
    reader: &R,
    desc: &RangeDescriptor,
    replicated_only: bool,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let cfg = KeysConfig {
        values: true,
        ..KeysConfig::default()
    };
    for span in replica_data_spans(desc, replicated_only) {
        reader.iterate(&span.start, &span.end, &mut |kv| {
            write_entry(&kv, &cfg, out)?;
            Ok(true)
        })?;
    }
    Ok(())
}
