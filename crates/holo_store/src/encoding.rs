//! Order-preserving byte encodings shared by the key layout and the engine.
//!
//! Byte strings are escaped so that the encoded form sorts exactly like the
//! raw form and can be followed by further components: every `0x00` becomes
//! `0x00 0xff` and the string is terminated by `0x00 0x01`.

use anyhow::{bail, ensure};

const ESCAPE: u8 = 0x00;
const ESCAPED_00: u8 = 0xff;
const ESCAPED_TERM: u8 = 0x01;

/// Append the escaped, terminated form of `data` to `out`.
pub fn encode_bytes_ascending(out: &mut Vec<u8>, data: &[u8]) {
    out.reserve(data.len() + 2);
    for &b in data {
        out.push(b);
        if b == ESCAPE {
            out.push(ESCAPED_00);
        }
    }
    out.push(ESCAPE);
    out.push(ESCAPED_TERM);
}

/// Decode one escaped byte string, returning it and the remaining input.
pub fn decode_bytes_ascending(data: &[u8]) -> anyhow::Result<(Vec<u8>, &[u8])> {
    let mut out = Vec::with_capacity(data.len());
    let mut offset = 0usize;
    loop {
        let Some(pos) = data[offset..].iter().position(|b| *b == ESCAPE) else {
            bail!("did not find terminator {ESCAPE:#x} {ESCAPED_TERM:#x} in buffer");
        };
        let pos = offset + pos;
        ensure!(pos + 1 < data.len(), "malformed escape at offset {pos}");
        out.extend_from_slice(&data[offset..pos]);
        match data[pos + 1] {
            ESCAPED_TERM => return Ok((out, &data[pos + 2..])),
            ESCAPED_00 => {
                out.push(0);
                offset = pos + 2;
            }
            other => bail!("unknown escape sequence {ESCAPE:#x} {other:#x}"),
        }
    }
}

pub fn encode_u64_ascending(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub fn decode_u64_ascending(data: &[u8]) -> anyhow::Result<(u64, &[u8])> {
    let mut offset = 0usize;
    let value = read_u64(data, &mut offset)?;
    Ok((value, &data[offset..]))
}

/// Smallest key greater than every key prefixed by `key`.
///
/// Returns `key` unchanged when it consists only of `0xff` bytes.
pub fn prefix_end(key: &[u8]) -> Vec<u8> {
    let mut end = key.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xff {
            *last += 1;
            return end;
        }
        end.pop();
    }
    key.to_vec()
}

/// Render bytes for humans: printable ASCII as-is, everything else escaped.
pub fn quote_bytes(data: &[u8]) -> String {
    data.iter()
        .flat_map(|b| std::ascii::escape_default(*b))
        .map(char::from)
        .collect()
}

pub(crate) fn read_u8(data: &[u8], offset: &mut usize) -> anyhow::Result<u8> {
    ensure!(*offset < data.len(), "short u8");
    let out = data[*offset];
    *offset += 1;
    Ok(out)
}

pub(crate) fn read_u32(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    ensure!(*offset + 4 <= data.len(), "short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

pub(crate) fn read_u64(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    ensure!(*offset + 8 <= data.len(), "short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        encode_bytes_ascending(&mut out, data);
        out
    }

    #[test]
    fn escaped_bytes_preserve_order() {
        let mut raw: Vec<&[u8]> = vec![b"", b"\x00", b"\x00\x00", b"\x00\x01", b"a", b"a\x00", b"ab", b"\xff"];
        raw.sort();
        let enc = raw.iter().map(|r| encoded(r)).collect::<Vec<_>>();
        let mut sorted = enc.clone();
        sorted.sort();
        assert_eq!(enc, sorted);
    }

    #[test]
    fn escaped_bytes_decode_with_trailer() {
        let mut buf = encoded(b"k\x00y");
        buf.extend_from_slice(b"rest");
        let (key, rest) = decode_bytes_ascending(&buf).expect("decode");
        assert_eq!(key, b"k\x00y");
        assert_eq!(rest, b"rest");
    }

    #[test]
    fn unterminated_bytes_are_rejected() {
        let err = decode_bytes_ascending(b"abc").expect_err("missing terminator");
        assert!(err.to_string().contains("terminator"), "unexpected error: {err}");
        assert!(decode_bytes_ascending(b"ab\x00\x07").is_err());
    }

    #[test]
    fn prefix_end_increments_last_non_ff_byte() {
        assert_eq!(prefix_end(b"\x01i"), b"\x01j".to_vec());
        assert_eq!(prefix_end(b"a\xff\xff"), b"b".to_vec());
        assert_eq!(prefix_end(b"\xff\xff"), b"\xff\xff".to_vec());
    }
}
