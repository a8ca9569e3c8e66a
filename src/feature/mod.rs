//! The feature store: tiles, metadata and the read-side surface the query
//! engine runs against.
//!
//! A feature store layers onto the paged blob store: each of the two header
//! snapshots points at a tile-index blob, and the metadata section after the
//! header block carries the indexed-key schema, the global string table and
//! the properties table. Tiles are opaque prebuilt blobs addressed by TIP.

pub mod feature;
pub mod filter;
pub mod matcher;
pub mod schema;
pub mod strings;
pub mod tile_index;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::feature::feature::FeatureHandle;
use crate::feature::schema::IndexSchema;
use crate::feature::strings::StringTable;
use crate::feature::tile_index::{Tip, TileIndex};
use crate::geom::ZoomLevels;
use crate::primitives::checksum::crc32c_of;
use crate::query::executor::Executor;
use crate::store::header::{Header, Snapshot, BLOCK_SIZE};
use crate::store::{LockLevel, OpenOptions, Store, Transaction};

/// Everything a new store is seeded with: the tile-index skeleton (child
/// masks and pointer structure with empty page slots), the indexed-key
/// schema, the global string table and the properties table.
#[derive(Clone, Debug, Default)]
pub struct StoreMetadata {
    pub zoom_levels: u32,
    /// Tile-index slots; slot 0 is reserved, the root tile is slot 1.
    pub tile_index: Vec<u32>,
    pub indexed_keys: Vec<(u16, u16)>,
    pub strings: Vec<String>,
    pub properties: Vec<(String, String)>,
    pub revision: u32,
    pub revision_timestamp: u64,
}

/// A resolved tile: absolute offset and length of its payload bytes.
#[derive(Copy, Clone, Debug)]
pub struct TileRef {
    pub payload_ofs: u64,
    pub len: u32,
}

pub struct FeatureStore {
    store: Store,
    strings: StringTable,
    schema: IndexSchema,
    zoom_levels: ZoomLevels,
    tile_index: RwLock<Arc<TileIndex>>,
    executor: Executor,
}

fn open_stores() -> &'static Mutex<HashMap<PathBuf, Weak<FeatureStore>>> {
    static STORES: OnceLock<Mutex<HashMap<PathBuf, Weak<FeatureStore>>>> = OnceLock::new();
    STORES.get_or_init(Default::default)
}

impl FeatureStore {
    /// Opens a store for shared reading, reusing an already-open instance
    /// for the same canonical path.
    pub fn open_single(path: &Path) -> Result<Arc<FeatureStore>> {
        let canonical = path
            .canonicalize()
            .map_err(|_| StoreError::Format(format!("{}: not found", path.display())))?;
        let mut registry = open_stores().lock();
        if let Some(existing) = registry.get(&canonical).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        let store = Arc::new(Self::open(&canonical, OpenOptions::default())?);
        registry.insert(canonical, Arc::downgrade(&store));
        Ok(store)
    }

    pub fn open(path: &Path, options: OpenOptions) -> Result<FeatureStore> {
        let store = Store::open(path, options)?;
        if store.is_created() {
            return Err(StoreError::Format(
                "store has no content; use create()".into(),
            ));
        }
        Self::from_store(store)
    }

    /// Creates a new store seeded with `metadata` and returns it writable.
    pub fn create(
        path: &Path,
        mut options: OpenOptions,
        metadata: &StoreMetadata,
    ) -> Result<FeatureStore> {
        options.write = true;
        options.create = true;
        let store = Store::open(path, options)?;
        if !store.is_created() {
            return Err(StoreError::InvalidArgument(format!(
                "{}: store already exists",
                path.display()
            )));
        }

        {
            let mut tx = store.begin_transaction(LockLevel::Append)?;

            let schema_bytes = IndexSchema::encode(&metadata.indexed_keys);
            let string_bytes = StringTable::encode(&metadata.strings)?;
            let props_bytes = encode_properties(&metadata.properties)?;

            let indexed_keys_ptr = BLOCK_SIZE;
            let string_table_ptr = indexed_keys_ptr + schema_bytes.len();
            let mut properties_ptr = string_table_ptr + string_bytes.len();
            properties_ptr += properties_ptr & 1;
            let meta_size = properties_ptr + props_bytes.len() - BLOCK_SIZE;

            let mut meta_buf = vec![0u8; meta_size];
            meta_buf[..schema_bytes.len()].copy_from_slice(&schema_bytes);
            let strings_at = string_table_ptr - BLOCK_SIZE;
            meta_buf[strings_at..strings_at + string_bytes.len()].copy_from_slice(&string_bytes);
            let props_at = properties_ptr - BLOCK_SIZE;
            meta_buf[props_at..props_at + props_bytes.len()].copy_from_slice(&props_bytes);
            let metadata_checksum = crc32c_of(&meta_buf);
            tx.write_raw(BLOCK_SIZE as u64, &meta_buf)?;

            {
                let page_size = 1u64 << (12 + tx.header().page_size_shift as u32);
                let header = tx.header_mut();
                header.total_pages =
                    (((BLOCK_SIZE + meta_size) as u64 + page_size - 1) / page_size) as u32;
                header.meta_section_size = meta_size as u32;
                header.tip_count = metadata.tile_index.len() as u32;
                header.zoom_levels = metadata.zoom_levels;
                header.indexed_keys_ptr = indexed_keys_ptr as u32;
                header.string_table_ptr = string_table_ptr as u32;
                header.properties_ptr = properties_ptr as u32;
            }

            let tile_index = TileIndex::from_slots(metadata.tile_index.clone());
            commit_tile_index(
                &mut tx,
                &tile_index,
                0,
                metadata.revision,
                metadata.revision_timestamp,
                metadata_checksum,
                true,
            )?;
            tx.end()?;
        }
        debug!(path = %path.display(), "feature store created");
        Self::from_store(store)
    }

    fn from_store(store: Store) -> Result<FeatureStore> {
        let header = store.header()?;

        let meta_ofs = BLOCK_SIZE as u64;
        let meta = store.mapped_slice(meta_ofs, header.meta_section_size as usize)?;
        let snapshot = header.active();
        if crc32c_of(&meta) != snapshot.metadata_checksum {
            return Err(StoreError::Corruption(
                "metadata section checksum mismatch".into(),
            ));
        }

        let section = |ptr: u32| -> Result<&[u8]> {
            let start = (ptr as u64)
                .checked_sub(meta_ofs)
                .ok_or_else(|| StoreError::decode(ptr as u64, "metadata pointer before section"))?
                as usize;
            meta.get(start..)
                .ok_or_else(|| StoreError::decode(ptr as u64, "metadata pointer out of range"))
        };
        let schema = IndexSchema::decode(section(header.indexed_keys_ptr)?, header.indexed_keys_ptr as u64)?;
        let strings = StringTable::decode(section(header.string_table_ptr)?, header.string_table_ptr as u64)?;

        let tile_index = if snapshot.tile_index_page != 0 {
            let payload = store.blob_payload(snapshot.tile_index_page)?;
            let index = TileIndex::from_payload(&payload)?;
            if index.checksum() != snapshot.tile_index_checksum {
                return Err(StoreError::Corruption("tile index checksum mismatch".into()));
            }
            index
        } else {
            TileIndex::default()
        };

        let zoom_levels = ZoomLevels::from_bits(header.zoom_levels);
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Ok(FeatureStore {
            store,
            strings,
            schema,
            zoom_levels,
            tile_index: RwLock::new(Arc::new(tile_index)),
            executor: Executor::new(workers, workers * 2),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn strings(&self) -> &StringTable {
        &self.strings
    }

    pub fn schema(&self) -> &IndexSchema {
        &self.schema
    }

    pub fn zoom_levels(&self) -> ZoomLevels {
        self.zoom_levels
    }

    pub(crate) fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn revision(&self) -> Result<u32> {
        Ok(self.store.header()?.active().revision)
    }

    /// Snapshot of the in-memory tile index.
    pub(crate) fn tile_index(&self) -> Arc<TileIndex> {
        self.tile_index.read().clone()
    }

    /// Resolves a TIP to its tile, or `None` when the tile is missing
    /// (queries surface this as a missing-tiles flag, not an error).
    pub fn fetch_tile(&self, tip: Tip) -> Result<Option<TileRef>> {
        let index = self.tile_index();
        let Some(page) = index.page_of(tip) else {
            return Ok(None);
        };
        let ofs = self.store.offset_of_page(page);
        let blob_header = self.store.mapped_slice(ofs, crate::store::BLOB_HEADER_SIZE)?;
        let len = u32::from_le_bytes(blob_header[..4].try_into().expect("4 bytes"));
        Ok(Some(TileRef {
            payload_ofs: ofs + crate::store::BLOB_HEADER_SIZE as u64,
            len,
        }))
    }

    /// The tile's exports table: payload offsets of features referenced
    /// from other tiles. Empty when the tile exports nothing.
    pub fn tile_exports(&self, tile: TileRef) -> Result<Vec<u32>> {
        let bytes = self.store.mapped_slice(tile.payload_ofs, tile.len as usize)?;
        if bytes.len() < 4 {
            return Err(StoreError::decode(tile.payload_ofs, "tile payload truncated"));
        }
        let rel = i32::from_le_bytes(bytes[..4].try_into().expect("4 bytes"));
        if rel == 0 {
            return Ok(Vec::new());
        }
        let table = rel as i64;
        if table < 0 || table as usize + 2 > bytes.len() {
            return Err(StoreError::decode(tile.payload_ofs, "exports pointer out of range"));
        }
        let table = table as usize;
        let count =
            u16::from_le_bytes(bytes[table..table + 2].try_into().expect("2 bytes")) as usize;
        let entries = bytes
            .get(table + 2..table + 2 + count * 4)
            .ok_or_else(|| StoreError::decode(tile.payload_ofs, "exports table truncated"))?;
        Ok(entries
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes(chunk.try_into().expect("4 bytes")))
            .collect())
    }

    /// The key strings of the indexed-key schema, resolved through the
    /// string table.
    pub fn indexed_key_strings(&self) -> Vec<&str> {
        self.schema
            .keys()
            .filter_map(|code| self.strings.get(code))
            .collect()
    }

    /// The decoded properties table.
    pub fn properties(&self) -> Result<Vec<(String, String)>> {
        let header = self.store.header()?;
        if header.properties_ptr == 0 {
            return Ok(Vec::new());
        }
        let end = BLOCK_SIZE as u64 + header.meta_section_size as u64;
        let len = end.saturating_sub(header.properties_ptr as u64) as usize;
        let bytes = self.store.mapped_slice(header.properties_ptr as u64, len)?;
        decode_properties(&bytes, header.properties_ptr as u64)
    }

    // --- Matcher construction -------------------------------------------

    pub fn matcher_all(&self, types: feature::FeatureTypes) -> Arc<matcher::Matcher> {
        matcher::Matcher::match_all(types)
    }

    /// A matcher for features carrying `key`. Keys absent from the string
    /// table match nothing.
    pub fn matcher_key(
        &self,
        types: feature::FeatureTypes,
        key: &str,
    ) -> Arc<matcher::Matcher> {
        match self.strings.code_of(key) {
            Some(code) => {
                matcher::Matcher::match_key(types, code, self.schema.category_of(code))
            }
            None => matcher::Matcher::match_none(types),
        }
    }

    pub fn matcher_key_value(
        &self,
        types: feature::FeatureTypes,
        key: &str,
        value: &str,
    ) -> Arc<matcher::Matcher> {
        match (self.strings.code_of(key), self.strings.code_of(value)) {
            (Some(key_code), Some(value_code)) => matcher::Matcher::match_key_value(
                types,
                key_code,
                self.schema.category_of(key_code),
                value_code,
            ),
            _ => matcher::Matcher::match_none(types),
        }
    }

    pub fn matcher_key_regex(
        &self,
        types: feature::FeatureTypes,
        key: &str,
        pattern: &str,
    ) -> Result<Arc<matcher::Matcher>> {
        match self.strings.code_of(key) {
            Some(code) => matcher::Matcher::match_key_regex(
                types,
                code,
                self.schema.category_of(code),
                pattern,
            ),
            None => Ok(matcher::Matcher::match_none(types)),
        }
    }

    // --- Feature record access ------------------------------------------

    fn read_exact(&self, ofs: u64, len: usize) -> Result<crate::primitives::mapping::MappedSlice> {
        self.store.mapped_slice(ofs, len)
    }

    /// The feature's 64-bit header word.
    pub fn feature_header(&self, handle: FeatureHandle) -> Result<u64> {
        let bytes = self.read_exact(handle.tile_ofs + handle.offset as u64, 8)?;
        Ok(u64::from_le_bytes(bytes[..8].try_into().expect("8 bytes")))
    }

    pub fn feature_id(&self, handle: FeatureHandle) -> Result<u64> {
        Ok(self.feature_header(handle)? >> 16)
    }

    pub fn feature_kind(&self, handle: FeatureHandle) -> Result<feature::FeatureKind> {
        let word = self.feature_header(handle)? as u32;
        feature::FeatureKind::from_flags(word).ok_or_else(|| {
            StoreError::decode(handle.tile_ofs + handle.offset as u64, "invalid feature type")
        })
    }

    /// A node's stored position (the eight bytes preceding its record).
    pub fn node_position(&self, handle: FeatureHandle) -> Result<(i32, i32)> {
        let ofs = handle.tile_ofs + handle.offset as u64 - 8;
        let bytes = self.read_exact(ofs, 8)?;
        Ok((
            i32::from_le_bytes(bytes[..4].try_into().expect("4 bytes")),
            i32::from_le_bytes(bytes[4..8].try_into().expect("4 bytes")),
        ))
    }

    /// A way/area/relation's stored bounding box (the sixteen bytes
    /// preceding its record).
    pub fn feature_bounds(&self, handle: FeatureHandle) -> Result<crate::geom::Bounds> {
        let ofs = handle.tile_ofs + handle.offset as u64 - 16;
        let bytes = self.read_exact(ofs, 16)?;
        let word = |i: usize| i32::from_le_bytes(bytes[i..i + 4].try_into().expect("4 bytes"));
        Ok(crate::geom::Bounds::new(word(0), word(4), word(8), word(12)))
    }

    fn feature_tag_table(&self, handle: FeatureHandle) -> Result<Vec<(u16, u16)>> {
        let ptr_ofs = handle.tile_ofs + handle.offset as u64 + 8;
        let ptr_bytes = self.read_exact(ptr_ofs, 4)?;
        let rel = i32::from_le_bytes(ptr_bytes[..4].try_into().expect("4 bytes"));
        if rel == 0 {
            return Ok(Vec::new());
        }
        let table_ofs = (ptr_ofs as i64 + rel as i64) as u64;
        let count_bytes = self.read_exact(table_ofs, 2)?;
        let count = u16::from_le_bytes(count_bytes[..2].try_into().expect("2 bytes")) as usize;
        let entries = self.read_exact(table_ofs + 2, count * 4)?;
        Ok(entries
            .chunks_exact(4)
            .map(|entry| {
                (
                    u16::from_le_bytes(entry[..2].try_into().expect("2 bytes")),
                    u16::from_le_bytes(entry[2..].try_into().expect("2 bytes")),
                )
            })
            .collect())
    }

    /// Looks up a tag value code on a feature, following its tag-table
    /// pointer.
    pub fn feature_tag(&self, handle: FeatureHandle, key_code: u16) -> Result<Option<u16>> {
        Ok(self
            .feature_tag_table(handle)?
            .into_iter()
            .find(|&(key, _)| key == key_code)
            .map(|(_, value)| value))
    }

    /// All of a feature's tags as `(key, value)` string pairs resolved
    /// through the global string table. Codes missing from the table decode
    /// to empty strings.
    pub fn feature_tags(&self, handle: FeatureHandle) -> Result<Vec<(&str, &str)>> {
        let codes = self.feature_tag_table(handle)?;
        Ok(codes
            .into_iter()
            .map(|(key, value)| {
                (
                    self.strings.get(key).unwrap_or(""),
                    self.strings.get(value).unwrap_or(""),
                )
            })
            .collect())
    }

    // --- Transactions ----------------------------------------------------

    pub fn begin_transaction(&self, lock_level: LockLevel) -> Result<FeatureTransaction<'_>> {
        let tx = self.store.begin_transaction(lock_level)?;
        let snapshot = tx.header().active().clone();
        let tile_index = (**self.tile_index.read()).clone();
        Ok(FeatureTransaction {
            store: self,
            tx,
            tile_index,
            tile_count: snapshot.tile_count,
            revision: snapshot.revision,
            revision_timestamp: snapshot.revision_timestamp,
        })
    }

    fn refresh_tile_index(&self, index: &TileIndex) {
        *self.tile_index.write() = Arc::new(index.clone());
    }
}

impl Drop for FeatureStore {
    fn drop(&mut self) {
        let mut registry = open_stores().lock();
        if let Some(weak) = registry.get(self.store.path()) {
            if weak.strong_count() == 0 {
                registry.remove(self.store.path());
            }
        }
    }
}

/// A write transaction over a feature store. Tile writes update a heap copy
/// of the tile index; commit serializes it into a fresh blob, fills the
/// inactive snapshot and flips visibility.
pub struct FeatureTransaction<'s> {
    store: &'s FeatureStore,
    tx: Transaction<'s>,
    tile_index: TileIndex,
    tile_count: u32,
    revision: u32,
    revision_timestamp: u64,
}

impl<'s> FeatureTransaction<'s> {
    /// Writes a tile blob and points the TIP slot at it. A replaced tile's
    /// blob is staged free.
    pub fn put_tile(&mut self, tip: Tip, data: &[u8]) -> Result<()> {
        if let Some(old_page) = self.tile_index.page_of(tip) {
            let old_len = self.tx.blob_payload_len(old_page)?;
            let pages = self.tx.header().pages_for_payload(old_len as u64);
            self.tx.free_pages(old_page, pages)?;
        } else {
            // Verify the slot exists before allocating anything.
            match self.tile_index.slot(tip) {
                Some(slot) if slot & tile_index::ENTRY_CHILD_PTR == 0 => {
                    self.tile_count += 1;
                }
                Some(_) => {
                    return Err(StoreError::InvalidArgument(format!(
                        "TIP {tip} addresses a child-pointer slot"
                    )))
                }
                None => {
                    return Err(StoreError::InvalidArgument(format!(
                        "TIP {tip} out of range"
                    )))
                }
            }
        }
        let page = self.tx.add_blob(data)?;
        self.tile_index.set_page(tip, page)?;
        Ok(())
    }

    pub fn set_revision(&mut self, revision: u32, timestamp: u64) {
        self.revision = revision;
        self.revision_timestamp = timestamp;
    }

    pub fn alloc_pages(&mut self, pages: u32) -> Result<u32> {
        self.tx.alloc_pages(pages)
    }

    pub fn free_pages(&mut self, first_page: u32, pages: u32) -> Result<()> {
        self.tx.free_pages(first_page, pages)
    }

    pub fn commit(&mut self, is_final: bool) -> Result<()> {
        let metadata_checksum = self.tx.header().active().metadata_checksum;
        commit_tile_index(
            &mut self.tx,
            &self.tile_index,
            self.tile_count,
            self.revision,
            self.revision_timestamp,
            metadata_checksum,
            is_final,
        )?;
        self.store.refresh_tile_index(&self.tile_index);
        Ok(())
    }

    pub fn end(self) -> Result<()> {
        self.tx.end()
    }
}

/// Serializes the tile index into a fresh blob, frees the one the inactive
/// snapshot referenced, fills the snapshot and flips visibility, then runs
/// the base commit.
fn commit_tile_index(
    tx: &mut Transaction<'_>,
    tile_index: &TileIndex,
    tile_count: u32,
    revision: u32,
    revision_timestamp: u64,
    metadata_checksum: u32,
    is_final: bool,
) -> Result<()> {
    let payload = tile_index.to_payload();
    let tile_index_checksum = crc32c_of(&payload);

    let inactive = tx.header().inactive_index();
    let old_page = tx.header().snapshots[inactive].tile_index_page;
    if old_page != 0 {
        let old_len = tx.blob_payload_len(old_page)?;
        let pages = tx.header().pages_for_payload(old_len as u64);
        tx.free_pages(old_page, pages)?;
    }
    let page = tx.add_blob(&payload)?;

    let header: &mut Header = tx.header_mut();
    header.snapshots[inactive] = Snapshot {
        tile_index_page: page,
        tile_count,
        tile_index_checksum,
        metadata_checksum,
        revision,
        revision_timestamp,
    };
    header.active_snapshot = inactive as u8;
    tx.commit(is_final)
}

fn encode_properties(properties: &[(String, String)]) -> Result<Vec<u8>> {
    let mut flat = Vec::with_capacity(properties.len() * 2);
    for (name, value) in properties {
        flat.push(name.clone());
        flat.push(value.clone());
    }
    let mut bytes = StringTable::encode(&flat)?;
    // The leading u16 holds the pair count, not the string count.
    bytes[..2].copy_from_slice(&(properties.len() as u16).to_le_bytes());
    Ok(bytes)
}

fn decode_properties(bytes: &[u8], base_ofs: u64) -> Result<Vec<(String, String)>> {
    if bytes.len() < 2 {
        return Err(StoreError::decode(base_ofs, "properties table truncated"));
    }
    let pairs = u16::from_le_bytes(bytes[..2].try_into().expect("2 bytes")) as usize;
    let mut doubled = bytes.to_vec();
    doubled[..2].copy_from_slice(&((pairs * 2) as u16).to_le_bytes());
    let table = StringTable::decode(&doubled, base_ofs)?;
    let mut out = Vec::with_capacity(pairs);
    for i in 0..pairs {
        let name = table
            .get((i * 2) as u16)
            .ok_or_else(|| StoreError::decode(base_ofs, "properties table truncated"))?;
        let value = table
            .get((i * 2 + 1) as u16)
            .ok_or_else(|| StoreError::decode(base_ofs, "properties table truncated"))?;
        out.push((name.to_owned(), value.to_owned()));
    }
    Ok(out)
}
