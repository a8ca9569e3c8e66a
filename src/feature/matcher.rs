//! Tag matchers: refcounted predicates over feature records.
//!
//! A matcher bundles the feature types it accepts, per-index key masks used
//! to prune whole index trunks, and a tag predicate evaluated per feature.
//! Matchers are shared across query worker threads via `Arc`.

use std::sync::Arc;

use regex::Regex;

use crate::error::Result;
use crate::feature::feature::{FeatureHandle, FeatureTypes};
use crate::feature::schema::index_bits_from_category;
use crate::feature::FeatureStore;

/// Trunk-pruning mask for one in-tile index: a trunk with key bitmap `keys`
/// is searched iff `(keys & key_mask) >= key_min`.
#[derive(Copy, Clone, Debug)]
pub struct IndexMask {
    pub key_mask: u32,
    pub key_min: u32,
}

impl IndexMask {
    const ACCEPT_ALL: IndexMask = IndexMask {
        key_mask: 0xffff_ffff,
        key_min: 0,
    };

    fn for_category(category: u16) -> IndexMask {
        let bits = index_bits_from_category(category);
        if bits == 0 {
            // Uncategorized key: it may occur under any trunk.
            IndexMask::ACCEPT_ALL
        } else {
            IndexMask {
                key_mask: bits,
                key_min: bits,
            }
        }
    }
}

enum TagPredicate {
    All,
    Never,
    HasKey(u16),
    KeyEquals(u16, u16),
    KeyMatches(u16, Regex),
    And(Arc<Matcher>, Arc<Matcher>),
}

pub struct Matcher {
    types: FeatureTypes,
    index_masks: [IndexMask; 4],
    predicate: TagPredicate,
}

impl Matcher {
    /// Accepts every feature of the given types.
    pub fn match_all(types: FeatureTypes) -> Arc<Matcher> {
        Arc::new(Matcher {
            types,
            index_masks: [IndexMask::ACCEPT_ALL; 4],
            predicate: TagPredicate::All,
        })
    }

    /// Accepts nothing (e.g. a key that no feature in the store carries).
    pub fn match_none(types: FeatureTypes) -> Arc<Matcher> {
        Arc::new(Matcher {
            types,
            index_masks: [IndexMask::ACCEPT_ALL; 4],
            predicate: TagPredicate::Never,
        })
    }

    pub fn match_key(types: FeatureTypes, key_code: u16, category: u16) -> Arc<Matcher> {
        Arc::new(Matcher {
            types,
            index_masks: [IndexMask::for_category(category); 4],
            predicate: TagPredicate::HasKey(key_code),
        })
    }

    pub fn match_key_value(
        types: FeatureTypes,
        key_code: u16,
        category: u16,
        value_code: u16,
    ) -> Arc<Matcher> {
        Arc::new(Matcher {
            types,
            index_masks: [IndexMask::for_category(category); 4],
            predicate: TagPredicate::KeyEquals(key_code, value_code),
        })
    }

    /// Matches features whose value string for `key_code` matches `pattern`.
    pub fn match_key_regex(
        types: FeatureTypes,
        key_code: u16,
        category: u16,
        pattern: &str,
    ) -> Result<Arc<Matcher>> {
        let regex = Regex::new(pattern).map_err(|err| {
            crate::error::StoreError::InvalidArgument(format!("invalid pattern: {err}"))
        })?;
        Ok(Arc::new(Matcher {
            types,
            index_masks: [IndexMask::for_category(category); 4],
            predicate: TagPredicate::KeyMatches(key_code, regex),
        }))
    }

    /// A matcher that accepts what both `a` and `b` accept (short-circuit
    /// conjunction).
    pub fn combine(a: Arc<Matcher>, b: Arc<Matcher>) -> Arc<Matcher> {
        let types = FeatureTypes(a.types.0 & b.types.0);
        Arc::new(Matcher {
            types,
            index_masks: [IndexMask::ACCEPT_ALL; 4],
            predicate: TagPredicate::And(a, b),
        })
    }

    pub fn accepted_types(&self) -> FeatureTypes {
        self.types
    }

    /// Whether a trunk with the given key bitmap can contain matches, for
    /// the index of the given kind (0 nodes, 1 ways, 2 areas, 3 relations).
    pub fn accept_index(&self, kind: usize, keys: u32) -> bool {
        match &self.predicate {
            TagPredicate::And(a, b) => a.accept_index(kind, keys) && b.accept_index(kind, keys),
            _ => {
                let mask = &self.index_masks[kind & 3];
                (keys & mask.key_mask) >= mask.key_min
            }
        }
    }

    /// Evaluates the tag predicate against a feature.
    pub fn accept(&self, store: &FeatureStore, feature: FeatureHandle) -> Result<bool> {
        match &self.predicate {
            TagPredicate::All => Ok(true),
            TagPredicate::Never => Ok(false),
            TagPredicate::HasKey(key) => Ok(store.feature_tag(feature, *key)?.is_some()),
            TagPredicate::KeyEquals(key, value) => {
                Ok(store.feature_tag(feature, *key)? == Some(*value))
            }
            TagPredicate::KeyMatches(key, regex) => {
                let Some(value_code) = store.feature_tag(feature, *key)? else {
                    return Ok(false);
                };
                Ok(store
                    .strings()
                    .get(value_code)
                    .is_some_and(|value| regex.is_match(value)))
            }
            TagPredicate::And(a, b) => {
                Ok(a.accept(store, feature)? && b.accept(store, feature)?)
            }
        }
    }
}
