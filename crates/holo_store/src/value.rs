//! Checksummed value envelope stored at versioned keys and inside inline
//! metadata.
//!
//! Layout: `[crc32 BE (4)][tag (1)][payload]`. The checksum covers the tag and
//! the payload. An empty envelope is an MVCC deletion tombstone.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::DecodeError;

const CHECKSUM_LEN: usize = 4;
const HEADER_LEN: usize = CHECKSUM_LEN + 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueTag {
    Int = 1,
    Bytes = 3,
    Struct = 5,
}

impl ValueTag {
    fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Int),
            3 => Some(Self::Bytes),
            5 => Some(Self::Struct),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Value {
    raw: Vec<u8>,
}

impl Value {
    pub fn from_raw(raw: Vec<u8>) -> Self {
        Self { raw }
    }

    pub fn tombstone() -> Self {
        Self::default()
    }

    pub fn from_int(value: i64) -> Self {
        Self::with_payload(ValueTag::Int, &value.to_be_bytes())
    }

    pub fn from_bool(value: bool) -> Self {
        Self::from_int(i64::from(value))
    }

    pub fn from_bytes(value: &[u8]) -> Self {
        Self::with_payload(ValueTag::Bytes, value)
    }

    pub fn from_struct<T: Serialize>(value: &T) -> anyhow::Result<Self> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::with_payload(ValueTag::Struct, &payload))
    }

    fn with_payload(tag: ValueTag, payload: &[u8]) -> Self {
        let mut raw = Vec::with_capacity(HEADER_LEN + payload.len());
        raw.extend_from_slice(&[0u8; CHECKSUM_LEN]);
        raw.push(tag as u8);
        raw.extend_from_slice(payload);
        let checksum = crc32fast::hash(&raw[CHECKSUM_LEN..]);
        raw[..CHECKSUM_LEN].copy_from_slice(&checksum.to_be_bytes());
        Self { raw }
    }

    pub fn raw_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.raw
    }

    pub fn is_tombstone(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn verify(&self) -> Result<(), DecodeError> {
        if self.raw.is_empty() {
            return Err(DecodeError::Empty);
        }
        if self.raw.len() < HEADER_LEN {
            return Err(DecodeError::Truncated {
                len: self.raw.len(),
            });
        }
        let mut stored = [0u8; CHECKSUM_LEN];
        stored.copy_from_slice(&self.raw[..CHECKSUM_LEN]);
        let stored = u32::from_be_bytes(stored);
        let computed = crc32fast::hash(&self.raw[CHECKSUM_LEN..]);
        if stored != computed {
            return Err(DecodeError::Checksum { stored, computed });
        }
        Ok(())
    }

    pub fn tag(&self) -> Result<ValueTag, DecodeError> {
        self.verify()?;
        let found = self.raw[CHECKSUM_LEN];
        ValueTag::from_u8(found).ok_or(DecodeError::WrongTag {
            expected: ValueTag::Struct,
            found,
        })
    }

    fn payload(&self, expected: ValueTag) -> Result<&[u8], DecodeError> {
        self.verify()?;
        let found = self.raw[CHECKSUM_LEN];
        if found != expected as u8 {
            return Err(DecodeError::WrongTag { expected, found });
        }
        Ok(&self.raw[HEADER_LEN..])
    }

    pub fn get_int(&self) -> Result<i64, DecodeError> {
        let payload = self.payload(ValueTag::Int)?;
        let bytes: [u8; 8] = payload.try_into().map_err(|_| DecodeError::Truncated {
            len: payload.len(),
        })?;
        Ok(i64::from_be_bytes(bytes))
    }

    pub fn get_bool(&self) -> Result<bool, DecodeError> {
        Ok(self.get_int()? != 0)
    }

    pub fn get_bytes(&self) -> Result<&[u8], DecodeError> {
        self.payload(ValueTag::Bytes)
    }

    pub fn get_struct<T: DeserializeOwned>(&self, what: &'static str) -> Result<T, DecodeError> {
        let payload = self.payload(ValueTag::Struct)?;
        serde_json::from_slice(payload).map_err(|source| DecodeError::Malformed { what, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::HardState;

    #[test]
    fn struct_values_check_tag_and_checksum() {
        let hs = HardState {
            term: 4,
            vote: 2,
            commit: 17,
        };
        let value = Value::from_struct(&hs).expect("encode");
        assert_eq!(value.tag().expect("tag"), ValueTag::Struct);
        let back: HardState = value.get_struct("hard state").expect("decode");
        assert_eq!(back, hs);

        let err = value.get_int().expect_err("struct is not an int");
        assert!(matches!(err, DecodeError::WrongTag { .. }), "unexpected: {err}");
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let mut raw = Value::from_int(42).into_raw();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let err = Value::from_raw(raw).get_int().expect_err("corruption");
        assert!(matches!(err, DecodeError::Checksum { .. }), "unexpected: {err}");
    }

    #[test]
    fn short_and_empty_envelopes_are_errors() {
        assert!(matches!(Value::tombstone().verify(), Err(DecodeError::Empty)));
        assert!(matches!(
            Value::from_raw(vec![0, 0, 1]).verify(),
            Err(DecodeError::Truncated { len: 3 })
        ));
        assert!(Value::from_bool(true).get_bool().expect("bool"));
    }
}
