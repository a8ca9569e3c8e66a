//! The global string table.
//!
//! Tag keys and values in feature records are 16-bit codes into this table.
//! On disk: a `u16` string count followed by length-prefixed UTF-8 strings.
//! Lengths below 128 use one byte; longer strings use two (low seven bits
//! first, high bit of the first byte set).

use rustc_hash::FxHashMap;

use crate::error::{Result, StoreError};

const MAX_STRING_LEN: usize = (1 << 14) - 1;

#[derive(Debug, Default)]
pub struct StringTable {
    strings: Vec<String>,
    codes: FxHashMap<String, u16>,
}

impl StringTable {
    pub fn decode(bytes: &[u8], base_ofs: u64) -> Result<StringTable> {
        let err = |msg| StoreError::decode(base_ofs, msg);
        if bytes.len() < 2 {
            return Err(err("string table truncated"));
        }
        let count = u16::from_le_bytes(bytes[..2].try_into().expect("2 bytes")) as usize;
        let mut strings = Vec::with_capacity(count);
        let mut codes = FxHashMap::default();
        let mut pos = 2usize;
        for code in 0..count {
            let (len, header_len) = decode_len(bytes, pos).ok_or(err("string table truncated"))?;
            pos += header_len;
            let data = bytes
                .get(pos..pos + len)
                .ok_or(err("string table truncated"))?;
            let value = std::str::from_utf8(data)
                .map_err(|_| err("string table entry is not UTF-8"))?
                .to_owned();
            codes.entry(value.clone()).or_insert(code as u16);
            strings.push(value);
            pos += len;
        }
        Ok(StringTable { strings, codes })
    }

    /// Byte length of the encoded table starting at `bytes` (for checksums
    /// and section sizing).
    pub fn encoded_len(&self) -> usize {
        2 + self
            .strings
            .iter()
            .map(|s| len_header_size(s.len()) + s.len())
            .sum::<usize>()
    }

    pub fn encode(strings: &[String]) -> Result<Vec<u8>> {
        if strings.len() > u16::MAX as usize {
            return Err(StoreError::InvalidArgument(
                "string table exceeds 65535 entries".into(),
            ));
        }
        let mut out = Vec::new();
        out.extend_from_slice(&(strings.len() as u16).to_le_bytes());
        for s in strings {
            if s.len() > MAX_STRING_LEN {
                return Err(StoreError::InvalidArgument(format!(
                    "string longer than {MAX_STRING_LEN} bytes"
                )));
            }
            if s.len() < 128 {
                out.push(s.len() as u8);
            } else {
                out.push((s.len() & 0x7f) as u8 | 0x80);
                out.push((s.len() >> 7) as u8);
            }
            out.extend_from_slice(s.as_bytes());
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn get(&self, code: u16) -> Option<&str> {
        self.strings.get(code as usize).map(String::as_str)
    }

    pub fn code_of(&self, value: &str) -> Option<u16> {
        self.codes.get(value).copied()
    }
}

fn len_header_size(len: usize) -> usize {
    if len < 128 {
        1
    } else {
        2
    }
}

fn decode_len(bytes: &[u8], pos: usize) -> Option<(usize, usize)> {
    let first = *bytes.get(pos)? as usize;
    if first < 128 {
        Some((first, 1))
    } else {
        let second = *bytes.get(pos + 1)? as usize;
        Some(((first & 0x7f) | (second << 7), 2))
    }
}
