//! Spatial filters: pluggable per-tile and per-feature spatial predicates.
//!
//! A filter can short-circuit whole tiles through `accept_tile`, returning
//! turbo flags that record what is already known about the tile (for
//! example, that it lies entirely inside the filter geometry) so the
//! per-feature test can skip work.

use crate::feature::feature::FeatureHandle;
use crate::feature::FeatureStore;
use crate::geom::Tile;

pub mod filter_flags {
    /// The filter implements a meaningful `accept_tile`.
    pub const FAST_TILE_FILTER: u32 = 1;
    /// The filter constrains results to the query bbox strictly; the walker
    /// may derive multi-tile flags from the bbox instead of tracking
    /// accepted tiles.
    pub const STRICT_BBOX: u32 = 2;
}

/// Tile-level knowledge passed from the walker to per-feature filtering.
#[derive(Copy, Clone, Debug)]
pub struct FastFilterHint {
    pub turbo_flags: u32,
    pub tile: Tile,
}

impl Default for FastFilterHint {
    fn default() -> Self {
        Self {
            turbo_flags: 0,
            tile: Tile::new(0, 0, 0),
        }
    }
}

pub trait SpatialFilter: Send + Sync {
    fn flags(&self) -> u32 {
        0
    }

    /// Tile-level test: negative rejects the tile and its descendants;
    /// non-negative accepts and supplies turbo flags.
    fn accept_tile(&self, _tile: Tile) -> i32 {
        0
    }

    /// Feature-level test.
    fn accept(
        &self,
        store: &FeatureStore,
        feature: FeatureHandle,
        hint: FastFilterHint,
    ) -> bool;
}
