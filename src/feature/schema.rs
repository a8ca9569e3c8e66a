//! The indexed-key schema.
//!
//! Tile builders assign frequently queried tag keys to small categories;
//! every trunk of an in-tile spatial index carries a bitmap of the categories
//! present below it, letting a matcher prune whole subtrees. The schema maps
//! global key codes to categories (1-based; 0 means uncategorized).
//!
//! On disk: `u32` entry count followed by `(u16 key_code, u16 category)`
//! pairs.

use rustc_hash::FxHashMap;

use crate::error::{Result, StoreError};

#[derive(Debug, Default)]
pub struct IndexSchema {
    categories: FxHashMap<u16, u16>,
}

impl IndexSchema {
    pub fn decode(bytes: &[u8], base_ofs: u64) -> Result<IndexSchema> {
        let err = |msg| StoreError::decode(base_ofs, msg);
        if bytes.len() < 4 {
            return Err(err("indexed-key schema truncated"));
        }
        let count = u32::from_le_bytes(bytes[..4].try_into().expect("4 bytes")) as usize;
        let entries = bytes
            .get(4..4 + count * 4)
            .ok_or(err("indexed-key schema truncated"))?;
        let mut categories = FxHashMap::default();
        for entry in entries.chunks_exact(4) {
            let key_code = u16::from_le_bytes(entry[..2].try_into().expect("2 bytes"));
            let category = u16::from_le_bytes(entry[2..].try_into().expect("2 bytes"));
            categories.insert(key_code, category);
        }
        Ok(IndexSchema { categories })
    }

    pub fn encode(entries: &[(u16, u16)]) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + entries.len() * 4);
        out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for &(key_code, category) in entries {
            out.extend_from_slice(&key_code.to_le_bytes());
            out.extend_from_slice(&category.to_le_bytes());
        }
        out
    }

    pub fn encoded_len(&self) -> usize {
        4 + self.categories.len() * 4
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    /// The category of a key, or 0 if the key is not indexed.
    pub fn category_of(&self, key_code: u16) -> u16 {
        self.categories.get(&key_code).copied().unwrap_or(0)
    }

    pub fn keys(&self) -> impl Iterator<Item = u16> + '_ {
        self.categories.keys().copied()
    }
}

/// The key-bitmap bit for a category; category 0 has no bit (uncategorized
/// keys may appear under any trunk).
pub fn index_bits_from_category(category: u16) -> u32 {
    if category == 0 {
        0
    } else {
        1 << (category - 1)
    }
}
