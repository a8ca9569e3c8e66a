//! End-to-end query scenarios: bbox filtering, type sets, tag matchers,
//! multi-tile deduplication, missing tiles and cancellation.

mod util;

use std::sync::Arc;

use mosaic::feature::feature::flags;
use mosaic::{Bounds, FeatureStore, FeatureTypes, LockLevel, OpenOptions, Query};
use tempfile::tempdir;
use util::{area, build_tile, node, two_level_slots, way};

/// Builds a store with a two-level pyramid (zoom 0 and 2) and three child
/// tiles around the origin:
///
/// - (1,1): x < 0, y >= 0: node 4, plus the primary copy of way 77
/// - (2,1): x >= 0, y >= 0: nodes 1..3, ways 10..12, area 20, and the
///   eastern copy of way 77 (flagged MULTITILE_WEST)
/// - (2,2): x >= 0, y < 0: node 5
fn build_query_store(path: &std::path::Path) -> Arc<FeatureStore> {
    util::init_logging();
    let (slots, tips) = two_level_slots(&[(1, 1), (2, 1), (2, 2)]);
    let metadata = util::metadata_with_index(slots, util::TWO_LEVEL_ZOOMS);
    let store = FeatureStore::create(path, OpenOptions::default(), &metadata).unwrap();

    let west = build_tile(&[
        node(4, -50, 5),
        way(77, (-100, 10, 100, 40)),
    ]);
    let east = build_tile(&[
        node(1, 0, 0),
        node(2, 10, 10),
        node(3, 100, 100),
        way(10, (0, 0, 30, 30)).with_tags(&[(1, 2)]).with_key_bits(1),
        way(11, (5, 5, 40, 40)).with_tags(&[(1, 3)]).with_key_bits(1),
        way(12, (2, 2, 20, 20)),
        way(77, (-100, 10, 100, 40)).with_flags(flags::MULTITILE_WEST),
        area(20, (0, 0, 25, 25)),
    ]);
    let south = build_tile(&[node(5, 5, -2000)]);

    let mut tx = store.begin_transaction(LockLevel::Append).unwrap();
    tx.put_tile(1, &build_tile(&[])).unwrap();
    tx.put_tile(tips[0], &west).unwrap();
    tx.put_tile(tips[1], &east).unwrap();
    tx.put_tile(tips[2], &south).unwrap();
    tx.commit(true).unwrap();
    tx.end().unwrap();
    Arc::new(store)
}

fn collect_ids(store: &Arc<FeatureStore>, query: &mut Query) -> Vec<u64> {
    let mut ids = Vec::new();
    while let Some(feature) = query.next().unwrap() {
        ids.push(store.feature_id(feature).unwrap());
    }
    ids.sort_unstable();
    ids
}

#[test]
fn bbox_query_returns_each_matching_node_once() {
    let dir = tempdir().unwrap();
    let store = build_query_store(&dir.path().join("bbox.mosaic"));

    let matcher = store.matcher_all(FeatureTypes::NODES);
    let mut query = store
        .query(
            Bounds::new(-5, -5, 50, 50),
            FeatureTypes::NODES,
            matcher,
            None,
        )
        .unwrap();
    let ids = collect_ids(&store, &mut query);
    assert_eq!(ids, vec![1, 2]);
    assert!(!query.missing_tiles());
}

#[test]
fn type_sets_partition_results() {
    let dir = tempdir().unwrap();
    let store = build_query_store(&dir.path().join("types.mosaic"));
    let world = Bounds::new(-200, -5000, 200, 5000);

    let matcher = store.matcher_all(FeatureTypes::ALL);
    let mut query = store
        .query(world, FeatureTypes::NONAREA_WAYS, matcher.clone(), None)
        .unwrap();
    assert_eq!(collect_ids(&store, &mut query), vec![10, 11, 12, 77]);

    let mut query = store
        .query(world, FeatureTypes::AREAS, matcher.clone(), None)
        .unwrap();
    assert_eq!(collect_ids(&store, &mut query), vec![20]);

    let mut query = store.query(world, FeatureTypes::ALL, matcher, None).unwrap();
    assert_eq!(
        collect_ids(&store, &mut query),
        vec![1, 2, 3, 4, 5, 10, 11, 12, 20, 77]
    );
}

#[test]
fn key_matchers_filter_by_tags() {
    let dir = tempdir().unwrap();
    let store = build_query_store(&dir.path().join("matchers.mosaic"));
    let world = Bounds::new(-200, -5000, 200, 5000);

    let matcher = store.matcher_key(FeatureTypes::NONAREA_WAYS, "highway");
    let mut query = store
        .query(world, FeatureTypes::NONAREA_WAYS, matcher, None)
        .unwrap();
    assert_eq!(collect_ids(&store, &mut query), vec![10, 11]);

    let matcher = store.matcher_key_value(FeatureTypes::NONAREA_WAYS, "highway", "residential");
    let mut query = store
        .query(world, FeatureTypes::NONAREA_WAYS, matcher, None)
        .unwrap();
    assert_eq!(collect_ids(&store, &mut query), vec![10]);

    let matcher = store
        .matcher_key_regex(FeatureTypes::NONAREA_WAYS, "highway", "^res")
        .unwrap();
    let mut query = store
        .query(world, FeatureTypes::NONAREA_WAYS, matcher, None)
        .unwrap();
    assert_eq!(collect_ids(&store, &mut query), vec![10]);

    // "name" is a known string but no feature carries it.
    let matcher = store.matcher_key(FeatureTypes::NONAREA_WAYS, "name");
    let mut query = store
        .query(world, FeatureTypes::NONAREA_WAYS, matcher, None)
        .unwrap();
    assert_eq!(collect_ids(&store, &mut query), Vec::<u64>::new());

    // Unknown key strings can match nothing.
    let matcher = store.matcher_key(FeatureTypes::NONAREA_WAYS, "bogus");
    let mut query = store
        .query(world, FeatureTypes::NONAREA_WAYS, matcher, None)
        .unwrap();
    assert_eq!(collect_ids(&store, &mut query), Vec::<u64>::new());
}

#[test]
fn indexed_key_bitmaps_prune_trunks() {
    let dir = tempdir().unwrap();
    let store = build_query_store(&dir.path().join("prune.mosaic"));
    let world = Bounds::new(-200, -5000, 200, 5000);

    // The area trunk was written with an empty key bitmap, so a category-1
    // matcher prunes it without looking at the area itself.
    let matcher = store.matcher_key(FeatureTypes::AREAS, "highway");
    let mut query = store
        .query(world, FeatureTypes::AREAS, matcher, None)
        .unwrap();
    assert_eq!(collect_ids(&store, &mut query), Vec::<u64>::new());
}

#[test]
fn multi_tile_way_is_returned_exactly_once() {
    let dir = tempdir().unwrap();
    let store = build_query_store(&dir.path().join("multitile.mosaic"));
    let matcher = store.matcher_all(FeatureTypes::NONAREA_WAYS);

    // Both tiles in the query: only the primary (western) copy reports.
    let mut query = store
        .query(
            Bounds::new(-150, 0, 150, 50),
            FeatureTypes::NONAREA_WAYS,
            matcher.clone(),
            None,
        )
        .unwrap();
    let ids: Vec<u64> = collect_ids(&store, &mut query)
        .into_iter()
        .filter(|&id| id == 77)
        .collect();
    assert_eq!(ids, vec![77]);

    // Only the eastern tile in the query: the eastern copy reports (its
    // western neighbor is outside the traversal), still exactly once.
    let mut query = store
        .query(
            Bounds::new(5, 12, 60, 38),
            FeatureTypes::NONAREA_WAYS,
            matcher.clone(),
            None,
        )
        .unwrap();
    let ids: Vec<u64> = collect_ids(&store, &mut query)
        .into_iter()
        .filter(|&id| id == 77)
        .collect();
    assert_eq!(ids, vec![77]);

    // Eastern tile only, bbox clear of the way.
    let mut query = store
        .query(
            Bounds::new(5, 50, 60, 90),
            FeatureTypes::NONAREA_WAYS,
            matcher,
            None,
        )
        .unwrap();
    assert!(!collect_ids(&store, &mut query).contains(&77));
}

#[test]
fn missing_tiles_are_flagged_not_fatal() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("missing.mosaic");
    let (slots, tips) = two_level_slots(&[(1, 1), (2, 1)]);
    let metadata = util::metadata_with_index(slots, util::TWO_LEVEL_ZOOMS);
    let store = Arc::new(FeatureStore::create(&path, OpenOptions::default(), &metadata).unwrap());

    let mut tx = store.begin_transaction(LockLevel::Append).unwrap();
    tx.put_tile(1, &build_tile(&[])).unwrap();
    tx.put_tile(tips[1], &build_tile(&[node(8, 10, 10)])).unwrap();
    // tips[0] is never written.
    tx.commit(true).unwrap();
    tx.end().unwrap();

    let matcher = store.matcher_all(FeatureTypes::NODES);
    let mut query = store
        .query(
            Bounds::new(-100, -100, 100, 100),
            FeatureTypes::NODES,
            matcher,
            None,
        )
        .unwrap();
    assert_eq!(collect_ids(&store, &mut query), vec![8]);
    assert!(query.missing_tiles());
}

#[test]
fn corrupt_tile_surfaces_as_query_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("corrupt-tile.mosaic");
    let (slots, tips) = two_level_slots(&[(2, 1)]);
    let metadata = util::metadata_with_index(slots, util::TWO_LEVEL_ZOOMS);
    let store = Arc::new(FeatureStore::create(&path, OpenOptions::default(), &metadata).unwrap());

    // A tile whose node-index pointer leads outside the payload.
    let mut bad_tile = vec![0u8; 20];
    bad_tile[4..8].copy_from_slice(&10_000i32.to_le_bytes());

    let mut tx = store.begin_transaction(LockLevel::Append).unwrap();
    tx.put_tile(1, &build_tile(&[])).unwrap();
    tx.put_tile(tips[0], &bad_tile).unwrap();
    tx.commit(true).unwrap();
    tx.end().unwrap();

    let matcher = store.matcher_all(FeatureTypes::NODES);
    let mut query = store
        .query(
            Bounds::new(-100, -100, 100, 100),
            FeatureTypes::NODES,
            matcher,
            None,
        )
        .unwrap();
    let mut saw_error = false;
    loop {
        match query.next() {
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(err) => {
                saw_error = true;
                assert!(matches!(err, mosaic::StoreError::Decode { .. }));
                break;
            }
        }
    }
    assert!(saw_error, "decoder error must surface through next()");
}

/// Accepts only tiles at column >= 2 of their zoom level (the root is never
/// consulted). `strict` toggles the STRICT_BBOX walker path.
struct EastOnly {
    strict: bool,
}

impl mosaic::SpatialFilter for EastOnly {
    fn flags(&self) -> u32 {
        use mosaic::feature::filter::filter_flags;
        filter_flags::FAST_TILE_FILTER
            | if self.strict {
                filter_flags::STRICT_BBOX
            } else {
                0
            }
    }

    fn accept_tile(&self, tile: mosaic::Tile) -> i32 {
        if tile.column() >= 2 {
            0
        } else {
            -1
        }
    }

    fn accept(
        &self,
        _store: &FeatureStore,
        _feature: mosaic::FeatureHandle,
        _hint: mosaic::FastFilterHint,
    ) -> bool {
        true
    }
}

#[test]
fn tile_filter_skips_rejected_tiles() {
    let dir = tempdir().unwrap();
    let store = build_query_store(&dir.path().join("filter-strict.mosaic"));
    let world = Bounds::new(-200, -5000, 200, 5000);

    // Strict-bbox path: the walker pretends N/W neighbors were visited, so
    // the eastern copy of way 77 defers to its (rejected) western tile.
    let matcher = store.matcher_all(FeatureTypes::ALL);
    let mut query = store
        .query(
            world,
            FeatureTypes::ALL,
            matcher,
            Some(Arc::new(EastOnly { strict: true })),
        )
        .unwrap();
    assert_eq!(
        collect_ids(&store, &mut query),
        vec![1, 2, 3, 5, 10, 11, 12, 20]
    );
}

#[test]
fn tile_filter_tracks_accepted_tiles_for_multitile_features() {
    let dir = tempdir().unwrap();
    let store = build_query_store(&dir.path().join("filter-tracked.mosaic"));
    let world = Bounds::new(-200, -5000, 200, 5000);

    // Tracked path: the western tile was rejected, so the eastern copy of
    // way 77 knows its neighbor is absent and reports the way itself.
    let matcher = store.matcher_all(FeatureTypes::NONAREA_WAYS);
    let mut query = store
        .query(
            world,
            FeatureTypes::NONAREA_WAYS,
            matcher,
            Some(Arc::new(EastOnly { strict: false })),
        )
        .unwrap();
    assert_eq!(collect_ids(&store, &mut query), vec![10, 11, 12, 77]);
}

#[test]
fn tile_exports_default_to_empty() {
    let dir = tempdir().unwrap();
    let store = build_query_store(&dir.path().join("exports.mosaic"));
    let tile = store.fetch_tile(1).unwrap().expect("root tile");
    assert!(store.tile_exports(tile).unwrap().is_empty());
}

#[test]
fn cancellation_stops_the_stream() {
    let dir = tempdir().unwrap();
    let store = build_query_store(&dir.path().join("cancel.mosaic"));
    let matcher = store.matcher_all(FeatureTypes::ALL);
    let mut query = store
        .query(
            Bounds::new(-200, -5000, 200, 5000),
            FeatureTypes::ALL,
            matcher,
            None,
        )
        .unwrap();
    query.cancel();
    assert!(query.next().unwrap().is_none());
}

#[test]
fn node_accessors_read_position_and_tags() {
    let dir = tempdir().unwrap();
    let store = build_query_store(&dir.path().join("accessors.mosaic"));
    let matcher = store.matcher_key_value(FeatureTypes::NONAREA_WAYS, "highway", "residential");
    let mut query = store
        .query(
            Bounds::new(-200, -5000, 200, 5000),
            FeatureTypes::NONAREA_WAYS,
            matcher,
            None,
        )
        .unwrap();
    let feature = query.next().unwrap().expect("way 10 matches");
    assert_eq!(store.feature_id(feature).unwrap(), 10);
    assert_eq!(
        store.feature_kind(feature).unwrap(),
        mosaic::FeatureKind::Way
    );
    let bounds = store.feature_bounds(feature).unwrap();
    assert_eq!((bounds.min_x, bounds.max_x), (0, 30));
    assert_eq!(store.feature_tag(feature, 1).unwrap(), Some(2));
    assert_eq!(store.feature_tag(feature, 4).unwrap(), None);
    assert_eq!(
        store.feature_tags(feature).unwrap(),
        vec![("highway", "residential")]
    );
    assert!(query.next().unwrap().is_none());
}
