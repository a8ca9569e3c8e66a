//! Result batches handed from per-tile searchers to the consuming query.

/// Item bit marking a feature that may also be found in a neighboring tile;
/// the consumer checks it against the dedup set.
pub const REQUIRES_DEDUP: u32 = 0x8000_0000;

pub const BATCH_CAPACITY: usize = 256;

/// One batch of per-tile results: feature offsets relative to the tile
/// payload, plus the payload's absolute offset.
#[derive(Debug)]
pub struct QueryResults {
    pub tile_ofs: u64,
    pub items: Vec<u32>,
}

impl QueryResults {
    pub fn new(tile_ofs: u64) -> QueryResults {
        QueryResults {
            tile_ofs,
            items: Vec::with_capacity(BATCH_CAPACITY),
        }
    }

    pub fn is_full(&self) -> bool {
        self.items.len() == BATCH_CAPACITY
    }
}

/// Accumulates results for one tile, cutting a new batch every
/// `BATCH_CAPACITY` items.
#[derive(Debug, Default)]
pub struct ResultAccumulator {
    batches: Vec<QueryResults>,
}

impl ResultAccumulator {
    pub fn push(&mut self, tile_ofs: u64, item: u32) {
        match self.batches.last_mut() {
            Some(batch) if !batch.is_full() && batch.tile_ofs == tile_ofs => {
                batch.items.push(item);
            }
            _ => {
                let mut batch = QueryResults::new(tile_ofs);
                batch.items.push(item);
                self.batches.push(batch);
            }
        }
    }

    pub fn into_batches(self) -> Vec<QueryResults> {
        self.batches
    }
}
