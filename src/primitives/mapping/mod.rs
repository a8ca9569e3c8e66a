//! Segmented read-side memory mapping.
//!
//! The store file is mapped one 1 GiB segment at a time so that stores larger
//! than the address space (or its contiguous holes) remain readable. Blobs
//! never straddle a segment boundary, so any blob read resolves within a
//! single segment map.
//!
//! Maps are read-only; the writer modifies the file through positioned writes
//! and readers pick up committed data after `remap`. Segment maps are
//! replaced, never shrunk: outstanding [`MappedSlice`]s keep their old map
//! alive through an `Arc`.

use std::fs::File;
use std::ops::Deref;
use std::sync::Arc;

use memmap2::{Mmap, MmapOptions};
use parking_lot::RwLock;

use crate::error::{Result, StoreError};

pub const SEGMENT_LENGTH: u64 = 1 << 30;

pub struct Mapping {
    file: Arc<File>,
    segments: RwLock<Vec<Arc<Mmap>>>,
}

/// A borrowed view into one segment map. Keeps the map alive; dereferences
/// to the requested byte range.
pub struct MappedSlice {
    segment: Arc<Mmap>,
    start: usize,
    len: usize,
}

impl Deref for MappedSlice {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.segment[self.start..self.start + self.len]
    }
}

impl Mapping {
    pub fn new(file: Arc<File>) -> Result<Self> {
        let mapping = Self {
            file,
            segments: RwLock::new(Vec::new()),
        };
        mapping.remap()?;
        Ok(mapping)
    }

    /// Extends the segment maps to cover the current file length.
    pub fn remap(&self) -> Result<()> {
        let file_len = self.file.metadata()?.len();
        let mut segments = self.segments.write();
        let mut segment_start = 0u64;
        let mut index = 0usize;
        while segment_start < file_len {
            let want = (file_len - segment_start).min(SEGMENT_LENGTH) as usize;
            let have = segments.get(index).map_or(0, |m| m.len());
            if want > have {
                let map = unsafe {
                    MmapOptions::new()
                        .offset(segment_start)
                        .len(want)
                        .map(&*self.file)?
                };
                let map = Arc::new(map);
                if index < segments.len() {
                    segments[index] = map;
                } else {
                    segments.push(map);
                }
            }
            segment_start += SEGMENT_LENGTH;
            index += 1;
        }
        Ok(())
    }

    pub fn mapped_len(&self) -> u64 {
        let segments = self.segments.read();
        match segments.last() {
            Some(last) => (segments.len() as u64 - 1) * SEGMENT_LENGTH + last.len() as u64,
            None => 0,
        }
    }

    /// Returns a view of `len` bytes at absolute offset `ofs`. The range must
    /// not cross a segment boundary.
    pub fn slice(&self, ofs: u64, len: usize) -> Result<MappedSlice> {
        let segment_index = (ofs / SEGMENT_LENGTH) as usize;
        let start = (ofs % SEGMENT_LENGTH) as usize;
        let end = start
            .checked_add(len)
            .ok_or_else(|| StoreError::decode(ofs, "mapped range overflows"))?;
        if end > SEGMENT_LENGTH as usize {
            return Err(StoreError::Corruption(format!(
                "mapped range at {ofs} crosses a segment boundary"
            )));
        }

        let segment = {
            let segments = self.segments.read();
            segments
                .get(segment_index)
                .filter(|segment| end <= segment.len())
                .cloned()
        };
        let segment = match segment {
            Some(segment) => segment,
            None => {
                // The range may have been written after the last remap.
                self.remap()?;
                let segments = self.segments.read();
                segments
                    .get(segment_index)
                    .filter(|segment| end <= segment.len())
                    .cloned()
                    .ok_or_else(|| StoreError::decode(ofs, "read past end of store"))?
            }
        };
        Ok(MappedSlice {
            segment,
            start,
            len,
        })
    }
}
