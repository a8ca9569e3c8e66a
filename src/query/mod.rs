//! The query dispatcher: a streaming iterator over all features matching a
//! bounding box, type set, tag matcher and optional spatial filter.
//!
//! The walker enumerates intersecting tiles; each tile becomes a task on the
//! store's worker pool (run inline when the pool is saturated, so progress
//! never depends on queue space). Workers hand finished batches back through
//! a mutex-protected queue and a condition variable; the consumer drains
//! batches one feature at a time, deduplicating features that straddle tile
//! boundaries by their identity bits.

pub(crate) mod executor;
pub mod results;
mod tile_task;
pub mod walker;

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::feature::feature::{FeatureHandle, FeatureTypes};
use crate::feature::filter::{FastFilterHint, SpatialFilter};
use crate::feature::matcher::Matcher;
use crate::feature::FeatureStore;
use crate::geom::Bounds;
use crate::query::executor::Task;
use crate::query::results::{QueryResults, REQUIRES_DEDUP};
use crate::query::walker::TileIndexWalker;

/// The immutable query descriptor shared with worker tasks.
pub(crate) struct QueryParams {
    pub bounds: Bounds,
    pub types: FeatureTypes,
    pub matcher: Arc<Matcher>,
    pub filter: Option<Arc<dyn SpatialFilter>>,
}

#[derive(Default)]
struct SharedState {
    batches: VecDeque<QueryResults>,
    completed_tiles: u32,
    errors: Vec<StoreError>,
    missing_tiles: bool,
}

pub(crate) struct QueryShared {
    store: Arc<FeatureStore>,
    params: QueryParams,
    state: Mutex<SharedState>,
    ready: Condvar,
}

impl QueryShared {
    /// Called by workers with the outcome of one tile.
    fn offer(&self, outcome: Result<Option<Vec<QueryResults>>>) {
        let mut state = self.state.lock();
        match outcome {
            Ok(Some(batches)) => state.batches.extend(batches),
            Ok(None) => state.missing_tiles = true,
            Err(err) => state.errors.push(err),
        }
        state.completed_tiles += 1;
        self.ready.notify_one();
    }
}

fn run_tile_task(shared: &QueryShared, tip: u32, multi_tile_flags: u32, hint: FastFilterHint) {
    let outcome = tile_task::search_tile(
        &shared.store,
        &shared.params,
        tip,
        multi_tile_flags,
        hint,
    );
    shared.offer(outcome);
}

pub struct Query {
    shared: Arc<QueryShared>,
    walker: TileIndexWalker,
    pending_tiles: u32,
    all_tiles_requested: bool,
    current: VecDeque<QueryResults>,
    pos: usize,
    dedup: FxHashSet<u64>,
    missing_tiles: bool,
    cancelled: bool,
}

impl Query {
    pub(crate) fn new(
        store: Arc<FeatureStore>,
        bounds: Bounds,
        types: FeatureTypes,
        matcher: Arc<Matcher>,
        filter: Option<Arc<dyn SpatialFilter>>,
    ) -> Result<Query> {
        let walker = TileIndexWalker::new(
            store.tile_index(),
            store.zoom_levels(),
            bounds,
            filter.clone(),
        )?;
        let shared = Arc::new(QueryShared {
            store,
            params: QueryParams {
                bounds,
                types,
                matcher,
                filter,
            },
            state: Mutex::new(SharedState::default()),
            ready: Condvar::new(),
        });
        let mut query = Query {
            shared,
            walker,
            pending_tiles: 0,
            all_tiles_requested: false,
            current: VecDeque::new(),
            pos: 0,
            dedup: FxHashSet::default(),
            missing_tiles: false,
            cancelled: false,
        };
        query.request_tiles()?;
        Ok(query)
    }

    /// Posts tile tasks until the pool queue is full or the walker is
    /// exhausted. At least one tile always makes progress: if nothing could
    /// be posted, the task runs inline on the caller thread (otherwise the
    /// consumer would wait for a tile that will never arrive).
    fn request_tiles(&mut self) -> Result<()> {
        if self.all_tiles_requested {
            return Ok(());
        }
        let mut posted_any = false;
        loop {
            let tip = self.walker.current_tip();
            let multi_tile_flags = self.walker.northwest_flags();
            let hint = FastFilterHint {
                turbo_flags: self.walker.turbo_flags(),
                tile: self.walker.current_tile(),
            };
            let shared = Arc::clone(&self.shared);
            let task: Task =
                Box::new(move || run_tile_task(&shared, tip, multi_tile_flags, hint));
            match self.shared.store.executor().try_post(task) {
                Ok(()) => {
                    self.pending_tiles += 1;
                }
                Err(task) => {
                    if posted_any {
                        // The current tile stays pending in the walker and is
                        // re-offered after the next take().
                        break;
                    }
                    self.pending_tiles += 1;
                    task();
                }
            }
            posted_any = true;
            if !self.walker.next()? {
                self.all_tiles_requested = true;
                debug!("all tiles requested");
                break;
            }
        }
        Ok(())
    }

    /// Blocks until at least one tile has completed, then drains the shared
    /// queue.
    fn take(&mut self) -> (VecDeque<QueryResults>, Option<StoreError>) {
        let mut state = self.shared.state.lock();
        while state.completed_tiles == 0 {
            self.shared.ready.wait(&mut state);
        }
        let batches = std::mem::take(&mut state.batches);
        self.pending_tiles -= state.completed_tiles;
        state.completed_tiles = 0;
        if state.missing_tiles {
            self.missing_tiles = true;
        }
        let error = if state.errors.is_empty() {
            None
        } else {
            Some(state.errors.remove(0))
        };
        (batches, error)
    }

    /// The next matching feature, or `None` when the query is exhausted or
    /// cancelled. Worker errors surface here.
    pub fn next(&mut self) -> Result<Option<FeatureHandle>> {
        loop {
            if self.cancelled {
                return Ok(None);
            }
            if let Some(front) = self.current.front() {
                if self.pos < front.items.len() {
                    let item = front.items[self.pos];
                    self.pos += 1;
                    let handle = FeatureHandle {
                        tile_ofs: front.tile_ofs,
                        offset: item & !REQUIRES_DEDUP,
                    };
                    if item & REQUIRES_DEDUP != 0 {
                        let header = self.shared.store.feature_header(handle)?;
                        if !self.dedup.insert(FeatureHandle::identity_bits(header)) {
                            continue;
                        }
                    }
                    return Ok(Some(handle));
                }
                self.current.pop_front();
                self.pos = 0;
                continue;
            }
            if self.pending_tiles == 0 {
                return Ok(None);
            }
            let (batches, error) = self.take();
            if !self.all_tiles_requested {
                self.request_tiles()?;
            }
            if let Some(err) = error {
                return Err(err);
            }
            self.current = batches;
            self.pos = 0;
        }
    }

    /// Cooperative cancellation: tiles already in flight run to completion
    /// and are discarded.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    /// Whether any tile the walker selected was missing from the store.
    pub fn missing_tiles(&self) -> bool {
        self.missing_tiles
    }

    pub fn store(&self) -> &Arc<FeatureStore> {
        &self.shared.store
    }
}

impl Drop for Query {
    fn drop(&mut self) {
        // Drain in-flight tiles so workers never touch freed query state.
        while self.pending_tiles > 0 {
            let _ = self.take();
        }
    }
}

impl FeatureStore {
    /// Starts a streaming query. Results arrive in no particular order
    /// across tiles; each matching feature is returned exactly once.
    pub fn query(
        self: &Arc<Self>,
        bounds: Bounds,
        types: FeatureTypes,
        matcher: Arc<Matcher>,
        filter: Option<Arc<dyn SpatialFilter>>,
    ) -> Result<Query> {
        Query::new(Arc::clone(self), bounds, types, matcher, filter)
    }
}
