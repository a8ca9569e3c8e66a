//! The per-tile searcher: runs one tile of a query on a worker thread.
//!
//! A tile payload holds four R-tree-like indices, one per feature category.
//! Each index is a chain of trunk entries `(pointer, key bitmap)`; a trunk is
//! searched only when the matcher's index keys intersect the bitmap. Branch
//! entries carry a bounding box and a child pointer whose low bits tag the
//! last entry (bit 0) and leaf children (bit 1). Node leaves store `(x, y)`
//! per feature; the other leaves store a full bounding box.

use crate::error::{Result, StoreError};
use crate::feature::feature::{flags, FeatureHandle, FeatureTypes};
use crate::feature::filter::FastFilterHint;
use crate::feature::FeatureStore;
use crate::geom::Bounds;
use crate::query::results::{QueryResults, ResultAccumulator, REQUIRES_DEDUP};
use crate::query::QueryParams;

/// Byte offsets of the index root pointers within a tile payload.
const NODE_INDEX_OFS: usize = 4;

pub(crate) const INDEX_NODES: usize = 0;
pub(crate) const INDEX_WAYS: usize = 1;
pub(crate) const INDEX_AREAS: usize = 2;
pub(crate) const INDEX_RELATIONS: usize = 3;

/// Searches one tile and returns the result batches, or `None` when the tile
/// is missing from the store.
pub(crate) fn search_tile(
    store: &FeatureStore,
    params: &QueryParams,
    tip: u32,
    multi_tile_flags: u32,
    hint: FastFilterHint,
) -> Result<Option<Vec<QueryResults>>> {
    let Some(tile) = store.fetch_tile(tip)? else {
        return Ok(None);
    };
    let bytes = store.store().mapped_slice(tile.payload_ofs, tile.len as usize)?;
    let mut search = TileSearch {
        store,
        params,
        tile_ofs: tile.payload_ofs,
        bytes: &bytes,
        multi_tile_flags,
        hint,
        results: ResultAccumulator::default(),
    };

    let types = params.types;
    if types.contains(FeatureTypes::NODES) {
        search.search_index(INDEX_NODES)?;
    }
    if types.contains(FeatureTypes::NONAREA_WAYS) {
        search.search_index(INDEX_WAYS)?;
    }
    if types.contains(FeatureTypes::AREAS) {
        search.search_index(INDEX_AREAS)?;
    }
    if types.contains(FeatureTypes::NONAREA_RELATIONS) {
        search.search_index(INDEX_RELATIONS)?;
    }
    Ok(Some(search.results.into_batches()))
}

struct TileSearch<'a> {
    store: &'a FeatureStore,
    params: &'a QueryParams,
    tile_ofs: u64,
    bytes: &'a [u8],
    multi_tile_flags: u32,
    hint: FastFilterHint,
    results: ResultAccumulator,
}

impl TileSearch<'_> {
    fn i32_at(&self, ofs: usize) -> Result<i32> {
        self.bytes
            .get(ofs..ofs + 4)
            .map(|b| i32::from_le_bytes(b.try_into().expect("4 bytes")))
            .ok_or_else(|| {
                StoreError::decode(self.tile_ofs + ofs as u64, "truncated tile index structure")
            })
    }

    fn u32_at(&self, ofs: usize) -> Result<u32> {
        Ok(self.i32_at(ofs)? as u32)
    }

    /// Resolves a self-relative pointer into a payload offset.
    fn offset(&self, base: usize, rel: i32) -> Result<usize> {
        let target = base as i64 + rel as i64;
        if target < 0 || target as usize >= self.bytes.len() {
            return Err(StoreError::decode(
                self.tile_ofs + base as u64,
                "tile pointer out of range",
            ));
        }
        Ok(target as usize)
    }

    fn search_index(&mut self, kind: usize) -> Result<()> {
        let pp_root = NODE_INDEX_OFS + kind * 4;
        let root = self.i32_at(pp_root)?;
        if root == 0 {
            return Ok(());
        }
        let mut p = self.offset(pp_root, root)?;
        loop {
            let ptr = self.i32_at(p)?;
            let last = ptr & 1;
            let keys = self.u32_at(p + 4)?;
            if self.params.matcher.accept_index(kind, keys) {
                let branch = self.offset(p, ptr ^ last)?;
                if kind == INDEX_NODES {
                    self.search_node_branch(branch)?;
                } else {
                    self.search_branch(branch)?;
                }
            }
            if last != 0 {
                return Ok(());
            }
            p += 8;
        }
    }

    fn branch_bounds(&self, p: usize) -> Result<Bounds> {
        Ok(Bounds::new(
            self.i32_at(p)?,
            self.i32_at(p + 4)?,
            self.i32_at(p + 8)?,
            self.i32_at(p + 12)?,
        ))
    }

    fn search_node_branch(&mut self, mut p: usize) -> Result<()> {
        loop {
            let ptr = self.i32_at(p)?;
            let last = ptr & 1;
            if self.params.bounds.intersects(&self.branch_bounds(p + 4)?) {
                let child = self.offset(p, ptr & !3)?;
                if ptr & 2 != 0 {
                    self.search_node_leaf(child)?;
                } else {
                    self.search_node_branch(child)?;
                }
            }
            if last != 0 {
                return Ok(());
            }
            p += 20;
        }
    }

    fn search_node_leaf(&mut self, mut p: usize) -> Result<()> {
        loop {
            let flag_word = self.u32_at(p + 8)?;
            let x = self.i32_at(p)?;
            let y = self.i32_at(p + 4)?;
            if self.params.bounds.contains_point(x, y) {
                self.consider(p + 8, flag_word, false)?;
            }
            if flag_word & flags::LAST_SPATIAL_ITEM != 0 {
                return Ok(());
            }
            // Relation members carry an extra table pointer.
            p += 20 + (flag_word & flags::RELATION_MEMBER) as usize;
        }
    }

    fn search_branch(&mut self, mut p: usize) -> Result<()> {
        loop {
            let ptr = self.i32_at(p)?;
            let last = ptr & 1;
            if self.params.bounds.intersects(&self.branch_bounds(p + 4)?) {
                let child = self.offset(p, ptr & !3)?;
                if ptr & 2 != 0 {
                    self.search_leaf(child)?;
                } else {
                    self.search_branch(child)?;
                }
            }
            if last != 0 {
                return Ok(());
            }
            p += 20;
        }
    }

    fn search_leaf(&mut self, mut p: usize) -> Result<()> {
        loop {
            let flag_word = self.u32_at(p + 16)?;
            // A feature whose northern/western copy falls inside this query
            // is reported from that tile instead.
            if flag_word & self.multi_tile_flags == 0 {
                let bounds = self.branch_bounds(p)?;
                if self.params.bounds.intersects(&bounds) {
                    let multi_tile =
                        flag_word & (flags::MULTITILE_NORTH | flags::MULTITILE_WEST) != 0;
                    self.consider(p + 16, flag_word, multi_tile)?;
                }
            }
            if flag_word & flags::LAST_SPATIAL_ITEM != 0 {
                return Ok(());
            }
            p += 32;
        }
    }

    fn consider(&mut self, offset: usize, flag_word: u32, needs_dedup: bool) -> Result<()> {
        if !self.params.types.accept_flags(flag_word) {
            return Ok(());
        }
        let handle = FeatureHandle {
            tile_ofs: self.tile_ofs,
            offset: offset as u32,
        };
        if !self.params.matcher.accept(self.store, handle)? {
            return Ok(());
        }
        if let Some(filter) = &self.params.filter {
            if !filter.accept(self.store, handle, self.hint) {
                return Ok(());
            }
        }
        let item = offset as u32 | if needs_dedup { REQUIRES_DEDUP } else { 0 };
        self.results.push(self.tile_ofs, item);
        Ok(())
    }
}
