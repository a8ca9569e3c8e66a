//! The tile-index walker: depth-first enumeration of every tile whose bounds
//! intersect a query bbox.
//!
//! The walker keeps one stack level per zoom level of the pyramid. Within a
//! level it advances column-major over the child grid clipped to the bbox;
//! a set bit in the level's child mask means a child tile exists, and its
//! entry position is found by counting the mask bits below it. Tiles a
//! spatial filter rejects are skipped along with their entire subtree.
//!
//! The walker always starts positioned on the root tile (TIP 1), which is
//! never rejected; `next()` is called after each tile has been processed.

use std::sync::Arc;

use rustc_hash::FxHashSet;

use crate::error::{Result, StoreError};
use crate::feature::feature::flags::{MULTITILE_NORTH, MULTITILE_WEST};
use crate::feature::filter::{filter_flags, SpatialFilter};
use crate::feature::tile_index::{follow_child_ptr, Tip, TileIndex, ENTRY_CHILD_PTR, ROOT_TIP};
use crate::geom::{Bounds, Tile, ZoomLevels};

const MAX_LEVELS: usize = 13;

#[derive(Clone, Copy)]
struct Level {
    child_mask: u64,
    /// TIP of the first child entry slot.
    child_entries: Tip,
    top_left_child: Tile,
    step: u32,
    start_col: i32,
    end_col: i32,
    end_row: i32,
    current_col: i32,
    current_row: i32,
}

impl Default for Level {
    fn default() -> Self {
        Level {
            child_mask: 0,
            child_entries: 0,
            top_left_child: Tile::new(0, 0, 0),
            step: 1,
            start_col: 0,
            end_col: -1,
            end_row: -1,
            current_col: 0,
            current_row: 0,
        }
    }
}

pub struct TileIndexWalker {
    bounds: Bounds,
    filter: Option<Arc<dyn SpatialFilter>>,
    index: Arc<TileIndex>,
    current_level: usize,
    current_tile: Tile,
    current_tip: Tip,
    northwest_flags: u32,
    turbo_flags: u32,
    tile_based_acceleration: bool,
    track_accepted_tiles: bool,
    accepted_tiles: FxHashSet<Tile>,
    levels: [Level; MAX_LEVELS],
}

impl TileIndexWalker {
    pub fn new(
        index: Arc<TileIndex>,
        zoom_levels: ZoomLevels,
        bounds: Bounds,
        filter: Option<Arc<dyn SpatialFilter>>,
    ) -> Result<TileIndexWalker> {
        let mut levels = [Level::default(); MAX_LEVELS];
        let mut zoom = 0u32;
        let mut bits = zoom_levels.bits() >> 1;
        let mut i = 0;
        while bits != 0 {
            let step = bits.trailing_zeros() + 1;
            zoom += step;
            levels[i].top_left_child = Tile::new(0, 0, zoom);
            levels[i].step = step;
            bits >>= step;
            i += 1;
        }

        let (tile_based_acceleration, track_accepted_tiles) = match &filter {
            Some(filter) if filter.flags() & filter_flags::FAST_TILE_FILTER != 0 => {
                (true, filter.flags() & filter_flags::STRICT_BBOX == 0)
            }
            _ => (false, false),
        };

        let mut walker = TileIndexWalker {
            bounds,
            filter,
            index,
            current_level: 0,
            current_tile: Tile::new(0, 0, 0),
            current_tip: ROOT_TIP,
            northwest_flags: 0,
            turbo_flags: 0,
            tile_based_acceleration,
            track_accepted_tiles,
            accepted_tiles: FxHashSet::default(),
            levels,
        };
        walker.start_level(0, ROOT_TIP)?;
        Ok(walker)
    }

    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    pub fn current_tip(&self) -> Tip {
        self.current_tip
    }

    pub fn current_tile(&self) -> Tile {
        self.current_tile
    }

    /// Multi-tile flags of the current tile: set bits mean the matching
    /// northern/western neighbor is also part of this traversal, so features
    /// extending that way will be (or were) reported there.
    pub fn northwest_flags(&self) -> u32 {
        self.northwest_flags
    }

    pub fn turbo_flags(&self) -> u32 {
        self.turbo_flags
    }

    /// Advances to the next accepted tile, depth-first. Returns `false` when
    /// the traversal is exhausted.
    pub fn next(&mut self) -> Result<bool> {
        loop {
            let child_number = {
                let level = &mut self.levels[self.current_level];
                level.current_col += 1;
                if level.current_col > level.end_col {
                    level.current_row += 1;
                    if level.current_row > level.end_row {
                        if self.current_level == 0 {
                            return Ok(false);
                        }
                        self.current_level -= 1;
                        continue;
                    }
                    level.current_col = level.start_col;
                }
                ((level.current_row << level.step) + level.current_col) as u32
            };
            let level = self.levels[self.current_level];
            if level.child_mask & (1u64 << child_number) == 0 {
                continue;
            }

            // Entries are stored only for existing children; the bits below
            // child_number count how many precede it.
            let child_entry = (level.child_mask << (63 - child_number)).count_ones() - 1;
            self.current_tile = level
                .top_left_child
                .neighbor(level.current_col, level.current_row);

            if self.tile_based_acceleration {
                let filter = self.filter.as_ref().expect("acceleration implies filter");
                let turbo = filter.accept_tile(self.current_tile);
                if turbo < 0 {
                    continue;
                }
                self.turbo_flags = turbo as u32;
                if self.track_accepted_tiles {
                    let north = self.current_tile.neighbor(0, -1);
                    let west = self.current_tile.neighbor(-1, 0);
                    self.northwest_flags = (if self.accepted_tiles.contains(&north) {
                        MULTITILE_NORTH
                    } else {
                        0
                    }) | (if self.accepted_tiles.contains(&west) {
                        MULTITILE_WEST
                    } else {
                        0
                    });
                    self.accepted_tiles.insert(self.current_tile);
                } else {
                    // With a strict-bbox filter a feature reaching into a
                    // N/W tile forces the bbox there too, so pretending the
                    // neighbors were visited is safe.
                    self.northwest_flags = MULTITILE_NORTH | MULTITILE_WEST;
                }
            } else {
                // Dense traversal: the flags follow from the bbox geometry.
                self.northwest_flags = (if self.bounds.max_y > self.current_tile.top_y() {
                    MULTITILE_NORTH
                } else {
                    0
                }) | (if self.bounds.min_x < self.current_tile.left_x() {
                    MULTITILE_WEST
                } else {
                    0
                });
                self.turbo_flags = 0;
            }

            let mut tip = level.child_entries + child_entry;
            let entry = self.index.slot(tip).ok_or_else(|| {
                StoreError::Corruption(format!("tile index entry {tip} out of range"))
            })?;
            if entry & 3 == ENTRY_CHILD_PTR {
                // The tile has children: descend.
                self.current_level += 1;
                tip = follow_child_ptr(tip, entry);
                self.start_level(self.current_level, tip)?;
            }
            self.current_tip = tip;
            return Ok(true);
        }
    }

    /// Ensures subsequent `next()` calls do not visit the current tile's
    /// children. Only meaningful right after a descent.
    pub fn skip_children(&mut self) {
        let level = &self.levels[self.current_level];
        if level.current_col < level.start_col && self.current_level > 0 {
            self.current_level -= 1;
        }
    }

    fn start_level(&mut self, level_index: usize, tip: Tip) -> Result<()> {
        if level_index >= MAX_LEVELS {
            return Err(StoreError::Corruption(
                "tile index deeper than the zoom pyramid".into(),
            ));
        }
        let parent = self.current_tile;
        let level = &mut self.levels[level_index];
        let zoom = level.top_left_child.zoom();
        let step = level.step;
        let extent = 1i32 << step;
        let tile_top = parent.row() << step;
        let tile_left = parent.column() << step;
        level.top_left_child = Tile::new(tile_left, tile_top, zoom);

        let left = Tile::column_from_x(self.bounds.min_x, zoom);
        let right = Tile::column_from_x(self.bounds.max_x, zoom);
        let top = Tile::row_from_y(self.bounds.max_y, zoom);
        let bottom = Tile::row_from_y(self.bounds.min_y, zoom);
        level.start_col = (left - tile_left).max(0);
        let start_row = (top - tile_top).max(0);
        level.end_col = (right - tile_left).min(extent - 1);
        level.end_row = (bottom - tile_top).min(extent - 1);
        level.current_col = level.start_col - 1;
        level.current_row = start_row;

        let mask_low = self.index.slot(tip + 1).unwrap_or(0) as u64;
        level.child_mask = if step == 3 {
            mask_low | (self.index.slot(tip + 2).unwrap_or(0) as u64) << 32
        } else {
            mask_low
        };
        level.child_entries = tip + if step == 3 { 3 } else { 2 };
        Ok(())
    }
}
