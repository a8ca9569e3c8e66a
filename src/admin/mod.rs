//! Offline integrity verification for feature stores.
//!
//! Walks everything a committed store promises: header checksum, metadata
//! checksum, tile-index checksum, free-range consistency, and that every
//! live blob (tile-index blob, FRI blob, tile blobs) lies within the file's
//! high-water mark without overlapping free space.

use tracing::debug;

use crate::error::{Result, StoreError};
use crate::feature::FeatureStore;
use crate::store::header;
use crate::store::BLOB_HEADER_SIZE;

/// Findings of a verification pass. `issues` is empty for a healthy store.
#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub total_pages: u32,
    pub tile_count: u32,
    pub free_ranges: u32,
    pub free_pages: u64,
    pub live_blobs: u32,
    pub issues: Vec<String>,
}

impl IntegrityReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Verifies a store's on-disk invariants. Read-only; safe on a store other
/// processes are reading.
pub fn verify_store(store: &FeatureStore) -> Result<IntegrityReport> {
    let mut report = IntegrityReport::default();
    let base = store.store();

    let block = base.read_header_block()?;
    if !header::verify_block(&block) {
        report
            .issues
            .push("header checksum mismatch".to_owned());
        return Ok(report);
    }
    let hdr = header::Header::decode(&block)?;
    report.total_pages = hdr.total_pages;
    let snapshot = hdr.active().clone();
    report.tile_count = snapshot.tile_count;
    report.free_ranges = hdr.free_ranges;

    // Metadata checksum.
    let meta = base.mapped_slice(header::BLOCK_SIZE as u64, hdr.meta_section_size as usize)?;
    if crate::primitives::checksum::crc32c_of(&meta) != snapshot.metadata_checksum {
        report
            .issues
            .push("metadata section checksum mismatch".to_owned());
    }

    // Every live blob, as (first_page, pages).
    let mut blobs: Vec<(u32, u32, &'static str)> = Vec::new();
    let blob_of = |page: u32| -> Result<(u32, u32)> {
        let ofs = hdr.offset_of_page(page);
        let blob_header = base.mapped_slice(ofs, BLOB_HEADER_SIZE)?;
        let len = u32::from_le_bytes(blob_header[..4].try_into().expect("4 bytes"));
        Ok((page, hdr.pages_for_payload(len as u64)))
    };

    if snapshot.tile_index_page != 0 {
        let (page, pages) = blob_of(snapshot.tile_index_page)?;
        blobs.push((page, pages, "tile index"));
        let payload = base.blob_payload(page)?;
        let index = crate::feature::tile_index::TileIndex::from_payload(&payload)?;
        if index.checksum() != snapshot.tile_index_checksum {
            report
                .issues
                .push("tile index checksum mismatch".to_owned());
        }
        let mut tiles_found = 0u32;
        for tip in 0..index.slot_count() {
            if let Some(tile_page) = index.page_of(tip) {
                tiles_found += 1;
                let (page, pages) = blob_of(tile_page)?;
                blobs.push((page, pages, "tile"));
            }
        }
        if tiles_found != snapshot.tile_count {
            report.issues.push(format!(
                "tile count disagrees: header {} vs index {}",
                snapshot.tile_count, tiles_found
            ));
        }
    }
    if hdr.free_range_index != 0 && hdr.free_range_index != header::INVALID_FREE_RANGE_INDEX {
        let (page, pages) = blob_of(hdr.free_range_index)?;
        blobs.push((page, pages, "free-range index"));
    }
    report.live_blobs = blobs.len() as u32;

    // Free ranges from the FRI, decoded without mutating anything.
    let mut free: Vec<(u32, u32)> = Vec::new();
    if hdr.free_ranges > 0
        && hdr.free_range_index != 0
        && hdr.free_range_index != header::INVALID_FREE_RANGE_INDEX
    {
        let payload = base.blob_payload(hdr.free_range_index)?;
        let wanted = hdr.free_ranges as usize * 8;
        let entries = payload.get(..wanted).ok_or_else(|| {
            StoreError::decode(
                hdr.offset_of_page(hdr.free_range_index),
                "free-range index blob too small",
            )
        })?;
        for chunk in entries.chunks_exact(8) {
            let entry = u64::from_le_bytes(chunk.try_into().expect("8 bytes"));
            free.push(((entry >> 32) as u32, (entry as u32) >> 1));
        }
    }
    report.free_pages = free.iter().map(|&(_, pages)| pages as u64).sum();

    // Extents must stay inside the file and must not collide.
    let mut extents: Vec<(u32, u32, &'static str)> = Vec::new();
    extents.extend(blobs.iter().copied());
    extents.extend(free.iter().map(|&(page, pages)| (page, pages, "free range")));
    extents.sort_unstable();
    let mut prev_end = 1u32; // page 0 is the header block
    let mut prev_kind = "header";
    for &(page, pages, kind) in &extents {
        if page < prev_end {
            report.issues.push(format!(
                "{kind} at page {page} overlaps {prev_kind} ending at {prev_end}"
            ));
        }
        let end = page as u64 + pages as u64;
        if end > hdr.total_pages as u64 {
            report
                .issues
                .push(format!("{kind} at page {page} extends past total_pages"));
        }
        prev_end = end.min(u32::MAX as u64) as u32;
        prev_kind = kind;
    }

    debug!(
        total_pages = report.total_pages,
        live_blobs = report.live_blobs,
        issues = report.issues.len(),
        "store verification finished"
    );
    Ok(report)
}
