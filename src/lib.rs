//! # Mosaic - Embedded Tile Store and Spatial Query Runtime
//!
//! Mosaic stores geospatial features (nodes, ways, relations with tag
//! key/value pairs) in a single-file database organized as a quadtree of
//! tiles, and runs indexed spatial queries against it.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::path::Path;
//! use mosaic::{Bounds, FeatureStore, FeatureTypes};
//!
//! // Open an existing store (shared with other readers in this process).
//! let store = FeatureStore::open_single(Path::new("planet.mosaic"))?;
//!
//! // Stream every node in a bounding box.
//! let matcher = store.matcher_all(FeatureTypes::NODES);
//! let mut query = store.query(
//!     Bounds::new(-1000, -1000, 1000, 1000),
//!     FeatureTypes::NODES,
//!     matcher,
//!     None,
//! )?;
//! while let Some(feature) = query.next()? {
//!     println!("node/{}", store.feature_id(feature)?);
//! }
//! # Ok::<(), mosaic::StoreError>(())
//! ```
//!
//! ## Architecture
//!
//! - **Page store**: variable-size blob allocation over fixed-size pages,
//!   with free-range coalescing and crash-safe commits through a hot journal.
//! - **Feature store**: the tile index (TIP -> tile blob), global string
//!   table, indexed-key schema and per-snapshot checksums.
//! - **Query engine**: quadtree descent over the tile index, per-tile R-tree
//!   traversal, and a worker pool streaming deduplicated results.
//!
//! Concurrency model: many reader processes, one writer; within a process,
//! queries fan out over a fixed worker pool while transactions stay
//! single-threaded.

pub mod admin;
pub mod error;
pub mod feature;
pub mod geom;
pub mod primitives;
pub mod query;
pub mod store;

pub use crate::admin::{verify_store, IntegrityReport};
pub use crate::error::{Result, StoreError};
pub use crate::feature::feature::{FeatureHandle, FeatureKind, FeatureTypes};
pub use crate::feature::filter::{FastFilterHint, SpatialFilter};
pub use crate::feature::matcher::Matcher;
pub use crate::feature::tile_index::Tip;
pub use crate::feature::{FeatureStore, FeatureTransaction, StoreMetadata, TileRef};
pub use crate::geom::{Bounds, Tile, ZoomLevels};
pub use crate::query::Query;
pub use crate::store::{LockLevel, OpenOptions, Store, Transaction};
