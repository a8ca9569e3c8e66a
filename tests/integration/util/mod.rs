//! Shared helpers for integration tests: tile-index skeletons and hand-built
//! tile blobs in the on-disk format the searcher expects.
#![allow(dead_code)]

use std::sync::Once;

use mosaic::feature::feature::{feature_header, flags, FeatureKind};
use mosaic::StoreMetadata;

/// Installs a tracing subscriber honoring `RUST_LOG` (once per process).
pub fn init_logging() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// A feature to place into a hand-built tile.
#[derive(Clone)]
pub struct TestFeature {
    pub kind: FeatureKind,
    pub id: u64,
    pub flag_bits: u32,
    pub x: i32,
    pub y: i32,
    pub bounds: (i32, i32, i32, i32),
    pub tags: Vec<(u16, u16)>,
    pub key_bits: u32,
}

pub fn node(id: u64, x: i32, y: i32) -> TestFeature {
    TestFeature {
        kind: FeatureKind::Node,
        id,
        flag_bits: 0,
        x,
        y,
        bounds: (x, y, x, y),
        tags: Vec::new(),
        key_bits: 0,
    }
}

pub fn way(id: u64, bounds: (i32, i32, i32, i32)) -> TestFeature {
    TestFeature {
        kind: FeatureKind::Way,
        id,
        flag_bits: 0,
        x: 0,
        y: 0,
        bounds,
        tags: Vec::new(),
        key_bits: 0,
    }
}

pub fn area(id: u64, bounds: (i32, i32, i32, i32)) -> TestFeature {
    TestFeature {
        flag_bits: flags::AREA,
        ..way(id, bounds)
    }
}

pub fn relation(id: u64, bounds: (i32, i32, i32, i32)) -> TestFeature {
    TestFeature {
        kind: FeatureKind::Relation,
        ..way(id, bounds)
    }
}

impl TestFeature {
    pub fn with_tags(mut self, tags: &[(u16, u16)]) -> TestFeature {
        self.tags = tags.to_vec();
        self
    }

    pub fn with_key_bits(mut self, bits: u32) -> TestFeature {
        self.key_bits = bits;
        self
    }

    pub fn with_flags(mut self, extra: u32) -> TestFeature {
        self.flag_bits |= extra;
        self
    }

    fn category(&self) -> usize {
        match self.kind {
            FeatureKind::Node => 0,
            FeatureKind::Way if self.flag_bits & flags::AREA != 0 => 2,
            FeatureKind::Way => 1,
            FeatureKind::Relation if self.flag_bits & flags::AREA != 0 => 2,
            FeatureKind::Relation => 3,
        }
    }
}

fn put_i32(buf: &mut [u8], ofs: usize, value: i32) {
    buf[ofs..ofs + 4].copy_from_slice(&value.to_le_bytes());
}

/// Builds a tile payload: exports pointer, four index root pointers, then
/// for each populated category a single trunk entry, a single branch entry
/// covering all its features, and one leaf. Tag tables go at the end.
pub fn build_tile(features: &[TestFeature]) -> Vec<u8> {
    let mut categories: [Vec<&TestFeature>; 4] = Default::default();
    for feature in features {
        categories[feature.category()].push(feature);
    }

    let mut buf = vec![0u8; 20];
    let mut tag_fixups: Vec<(usize, Vec<(u16, u16)>)> = Vec::new();

    for (kind, members) in categories.iter().enumerate() {
        if members.is_empty() {
            continue;
        }
        let trunk_pos = buf.len();
        let pp_root = 4 + kind * 4;
        put_i32(&mut buf, pp_root, (trunk_pos - pp_root) as i32);

        // Trunk: one entry, last, branch immediately after.
        let key_bits = members.iter().fold(0u32, |acc, f| acc | f.key_bits);
        buf.extend_from_slice(&(8i32 | 1).to_le_bytes());
        buf.extend_from_slice(&key_bits.to_le_bytes());

        // Branch: one leaf entry, last, leaf immediately after; bbox is the
        // union of the members.
        let union = members.iter().fold(
            (i32::MAX, i32::MAX, i32::MIN, i32::MIN),
            |(min_x, min_y, max_x, max_y), f| {
                (
                    min_x.min(f.bounds.0),
                    min_y.min(f.bounds.1),
                    max_x.max(f.bounds.2),
                    max_y.max(f.bounds.3),
                )
            },
        );
        buf.extend_from_slice(&(20i32 | 2 | 1).to_le_bytes());
        buf.extend_from_slice(&union.0.to_le_bytes());
        buf.extend_from_slice(&union.1.to_le_bytes());
        buf.extend_from_slice(&union.2.to_le_bytes());
        buf.extend_from_slice(&union.3.to_le_bytes());
        debug_assert_eq!(buf.len(), trunk_pos + 28);

        for (i, feature) in members.iter().enumerate() {
            let mut flag_bits = feature.flag_bits;
            if i == members.len() - 1 {
                flag_bits |= flags::LAST_SPATIAL_ITEM;
            }
            if kind == 0 {
                buf.extend_from_slice(&feature.x.to_le_bytes());
                buf.extend_from_slice(&feature.y.to_le_bytes());
            } else {
                buf.extend_from_slice(&feature.bounds.0.to_le_bytes());
                buf.extend_from_slice(&feature.bounds.1.to_le_bytes());
                buf.extend_from_slice(&feature.bounds.2.to_le_bytes());
                buf.extend_from_slice(&feature.bounds.3.to_le_bytes());
            }
            let header = feature_header(feature.kind, feature.id, flag_bits);
            buf.extend_from_slice(&header.to_le_bytes());
            let tags_ptr_pos = buf.len();
            buf.extend_from_slice(&0i32.to_le_bytes());
            if !feature.tags.is_empty() {
                tag_fixups.push((tags_ptr_pos, feature.tags.clone()));
            }
            if kind == 0 {
                if flag_bits & flags::RELATION_MEMBER != 0 {
                    buf.extend_from_slice(&0i32.to_le_bytes());
                }
            } else {
                buf.extend_from_slice(&0i32.to_le_bytes());
            }
        }
    }

    for (ptr_pos, tags) in tag_fixups {
        let table_pos = buf.len();
        buf.extend_from_slice(&(tags.len() as u16).to_le_bytes());
        for (key, value) in &tags {
            buf.extend_from_slice(&key.to_le_bytes());
            buf.extend_from_slice(&value.to_le_bytes());
        }
        put_i32(&mut buf, ptr_pos, (table_pos - ptr_pos) as i32);
    }
    buf
}

/// Tile-index slots for a two-level pyramid (zoom 0 and 2): the root at
/// TIP 1 plus the given zoom-2 children. Returns the slots and each child's
/// TIP in `children` order.
pub fn two_level_slots(children: &[(i32, i32)]) -> (Vec<u32>, Vec<u32>) {
    let mut mask = 0u64;
    for &(col, row) in children {
        assert!((0..4).contains(&col) && (0..4).contains(&row));
        mask |= 1 << ((row << 2) + col);
    }
    let mut slots = vec![0u32; 3];
    slots[2] = mask as u32;
    let mut ordered: Vec<(i32, usize)> = children
        .iter()
        .enumerate()
        .map(|(i, &(col, row))| ((row << 2) + col, i))
        .collect();
    ordered.sort();
    let mut tips = vec![0u32; children.len()];
    for (slot_index, &(_, child)) in ordered.iter().enumerate() {
        tips[child] = (3 + slot_index) as u32;
        slots.push(0);
    }
    (slots, tips)
}

/// Zoom levels 0 and 2 (the shape `two_level_slots` builds).
pub const TWO_LEVEL_ZOOMS: u32 = 0b101;

pub fn metadata_with_index(tile_index: Vec<u32>, zoom_levels: u32) -> StoreMetadata {
    StoreMetadata {
        zoom_levels,
        tile_index,
        indexed_keys: vec![(1, 1)],
        strings: vec![
            String::new(),
            "highway".to_owned(),
            "residential".to_owned(),
            "primary".to_owned(),
            "name".to_owned(),
        ],
        properties: vec![("generator".to_owned(), "mosaic-tests".to_owned())],
        revision: 1,
        revision_timestamp: 1_700_000_000,
    }
}
