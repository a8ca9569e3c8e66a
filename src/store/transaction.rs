//! Single-writer transactions over the paged blob store.
//!
//! A transaction buffers header changes and dirty 4 KiB blocks in memory,
//! journals the pre-image of every block it will overwrite below the
//! pre-commit high-water mark, and stages frees so that freed space is never
//! reused within the transaction that freed it. Blob payloads are written
//! directly: they land only in virgin space or in ranges freed by earlier
//! commits, whose bytes are dead, so a rollback that restores the journaled
//! blocks restores the visible state completely.
//!
//! Commit order (each step durable before the next):
//! seal journal -> write dirty blocks -> sync -> write header -> sync ->
//! neutralize journal.

use std::collections::BTreeMap;

use smallvec::SmallVec;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::primitives::io::{deallocate, read_exact_at, write_all_at};
use crate::primitives::lock::{lock_region, unlock_region};
use crate::store::free_ranges::FreeRangeTable;
use crate::store::header::{Header, BLOCK_SIZE, INVALID_FREE_RANGE_INDEX};
use crate::store::journal::{Journal, JournalMode};
use crate::store::{Store, BLOB_HEADER_SIZE, LOCK_OFS};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockLevel {
    Read,
    Append,
    Exclusive,
}

pub struct Transaction<'s> {
    store: &'s Store,
    lock_level: LockLevel,
    header: Header,
    header_preimage: Box<[u8; BLOCK_SIZE]>,
    free: FreeRangeTable,
    staged_free: SmallVec<[(u32, u32); 16]>,
    dirty: BTreeMap<u64, Box<[u8; BLOCK_SIZE]>>,
    journal: Option<Journal>,
    pre_commit_size: u64,
    /// Byte of the lock region held exclusively for the duration of the
    /// transaction (the inactive snapshot's reader byte), if any.
    snapshot_lock: Option<u64>,
    /// Set while a commit is in flight; a poisoned transaction leaves its
    /// journal on disk for recovery.
    poisoned: bool,
    ended: bool,
}

impl<'s> Transaction<'s> {
    pub(super) fn begin(store: &'s Store, lock_level: LockLevel) -> Result<Transaction<'s>> {
        if lock_level > LockLevel::Read && !store.writable() {
            return Err(StoreError::InvalidArgument(
                "write transaction on a read-only store".into(),
            ));
        }

        let mut tx = Transaction {
            store,
            lock_level,
            header: Header::default(),
            header_preimage: Box::new([0u8; BLOCK_SIZE]),
            free: FreeRangeTable::default(),
            staged_free: SmallVec::new(),
            dirty: BTreeMap::new(),
            journal: None,
            pre_commit_size: 0,
            snapshot_lock: None,
            poisoned: false,
            ended: false,
        };

        if store.is_created() {
            tx.header.commit_id = rand::random();
            tx.header.page_size_shift = store.create_page_size_shift();
            tx.header.total_pages = 1;
            return Ok(tx);
        }

        let block = store.read_header_block()?;
        tx.header = Header::decode(&block)?;
        *tx.header_preimage = block;
        tx.pre_commit_size = tx.header.offset_of_page(tx.header.total_pages);

        if lock_level > LockLevel::Read {
            if !store.locked_exclusively() {
                // Block until no reader still sees the snapshot we will
                // rewrite. (An exclusive session already owns the whole lock
                // region; re-locking a byte of it would split that lock.)
                let byte = LOCK_OFS + 2 * tx.header.inactive_index() as u64;
                lock_region(store.file(), byte, 1, true, true)?;
                tx.snapshot_lock = Some(byte);
            }

            tx.read_free_range_index()?;
            let mode = if store.locked_exclusively() {
                JournalMode::ModifiedAll
            } else {
                JournalMode::ModifiedInactive
            };
            tx.journal = Some(Journal::create(store.journal_path(), mode, &block)?);
        }
        Ok(tx)
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    fn require_writable(&self) -> Result<()> {
        if self.lock_level == LockLevel::Read {
            return Err(StoreError::InvalidArgument(
                "operation requires a write transaction".into(),
            ));
        }
        Ok(())
    }

    /// Reads the FRI blob into the in-memory free sets, stages its pages
    /// free, and marks the on-disk index stale. The staged free keeps the old
    /// FRI blob from being reallocated before the commit that stops
    /// referencing it.
    fn read_free_range_index(&mut self) -> Result<()> {
        let count = self.header.free_ranges;
        let index = self.header.free_range_index;
        if count == 0 || index == 0 || index == INVALID_FREE_RANGE_INDEX {
            // Nothing to load. A non-zero count with no usable index means a
            // crash interrupted a bulk transaction after a non-final commit;
            // those ranges are unreachable, so start from an empty table.
            self.header.free_ranges = 0;
            self.header.free_range_index = INVALID_FREE_RANGE_INDEX;
            return Ok(());
        }

        let ofs = self.header.offset_of_page(index);
        let mut blob_header = [0u8; BLOB_HEADER_SIZE];
        read_exact_at(self.store.file(), ofs, &mut blob_header)?;
        let payload_len = u32::from_le_bytes(blob_header[..4].try_into().expect("4 bytes"));
        if (payload_len as u64) < count as u64 * 8 {
            return Err(StoreError::decode(ofs, "free-range index blob too small"));
        }

        let mut entries = vec![0u8; count as usize * 8];
        read_exact_at(self.store.file(), ofs + BLOB_HEADER_SIZE as u64, &mut entries)?;
        let mut prev_start = 0u32;
        for chunk in entries.chunks_exact(8) {
            let entry = u64::from_le_bytes(chunk.try_into().expect("8 bytes"));
            let start = (entry >> 32) as u32;
            if start <= prev_start && prev_start != 0 {
                return Err(StoreError::decode(ofs, "free-range index out of order"));
            }
            prev_start = start;
            self.free.insert_raw(entry);
        }
        if self.free.len() != count as usize {
            return Err(StoreError::decode(ofs, "free-range index has duplicates"));
        }

        let pages = self.header.pages_for_payload(payload_len as u64);
        self.staged_free.push((index, pages));
        self.header.free_range_index = INVALID_FREE_RANGE_INDEX;
        Ok(())
    }

    /// Allocates and records a new FRI blob for the current free sets.
    fn write_free_range_index(&mut self) -> Result<()> {
        if self.header.free_ranges == 0 {
            self.header.free_range_index = 0;
            return Ok(());
        }

        // The allocation below can change the range count by one in either
        // direction (exact fit consumes a range; a skipped segment tail adds
        // one), so size the blob for one extra entry.
        let slot_count = self.header.free_ranges as u64 + 2;
        let payload_len = slot_count * 8;
        let pages = self.header.pages_for_payload(payload_len);
        let index_page = self.free.alloc(&mut self.header, pages)?;

        let mut buf = vec![0u8; BLOB_HEADER_SIZE + payload_len as usize];
        buf[..4].copy_from_slice(&(payload_len as u32).to_le_bytes());
        let mut pos = BLOB_HEADER_SIZE;
        for entry in self.free.iter_by_start() {
            buf[pos..pos + 8].copy_from_slice(&entry.to_le_bytes());
            pos += 8;
        }
        debug_assert_eq!(
            (pos - BLOB_HEADER_SIZE) / 8,
            self.header.free_ranges as usize
        );

        write_all_at(
            self.store.file(),
            self.header.offset_of_page(index_page),
            &buf,
        )?;
        self.header.free_range_index = index_page;
        Ok(())
    }

    /// Returns a mutable 4 KiB block buffer, lazily snapshotting (and
    /// journaling) the original content. `ofs` must be block-aligned.
    pub fn get_block(&mut self, ofs: u64) -> Result<&mut [u8]> {
        self.require_writable()?;
        if ofs % BLOCK_SIZE as u64 != 0 {
            return Err(StoreError::InvalidArgument(format!(
                "block offset {ofs} is not 4 KiB aligned"
            )));
        }
        if !self.dirty.contains_key(&ofs) {
            let mut block = Box::new([0u8; BLOCK_SIZE]);
            self.store.read_block_at(ofs, &mut block[..])?;
            if ofs < self.pre_commit_size {
                if let Some(journal) = self.journal.as_mut() {
                    journal.add_block(ofs, &block[..])?;
                }
            }
            self.dirty.insert(ofs, block);
        }
        Ok(&mut self.dirty.get_mut(&ofs).expect("just inserted")[..])
    }

    pub fn alloc_pages(&mut self, requested: u32) -> Result<u32> {
        self.require_writable()?;
        self.free.alloc(&mut self.header, requested)
    }

    /// Stages a range for freeing; the space becomes reusable after the next
    /// commit.
    pub fn free_pages(&mut self, first_page: u32, pages: u32) -> Result<()> {
        self.require_writable()?;
        self.staged_free.push((first_page, pages));
        Ok(())
    }

    /// Allocates a blob and writes its header and payload. Returns the first
    /// page.
    pub fn add_blob(&mut self, data: &[u8]) -> Result<u32> {
        self.require_writable()?;
        let pages = self.header.pages_for_payload(data.len() as u64);
        let first_page = self.alloc_pages(pages)?;
        let ofs = self.header.offset_of_page(first_page);
        let mut blob_header = [0u8; BLOB_HEADER_SIZE];
        blob_header[..4].copy_from_slice(&(data.len() as u32).to_le_bytes());
        write_all_at(self.store.file(), ofs, &blob_header)?;
        write_all_at(self.store.file(), ofs + BLOB_HEADER_SIZE as u64, data)?;
        Ok(first_page)
    }

    /// Writes raw bytes at an absolute offset, bypassing the dirty-block
    /// map. Only valid for virgin space (store creation lays out the
    /// metadata section this way).
    pub(crate) fn write_raw(&mut self, ofs: u64, data: &[u8]) -> Result<()> {
        self.require_writable()?;
        write_all_at(self.store.file(), ofs, data)
            .map_err(StoreError::from)
    }

    /// Reads a blob's payload length, as recorded by [`add_blob`].
    pub fn blob_payload_len(&self, page: u32) -> Result<u32> {
        let ofs = self.header.offset_of_page(page);
        let mut blob_header = [0u8; BLOB_HEADER_SIZE];
        read_exact_at(self.store.file(), ofs, &mut blob_header)?;
        Ok(u32::from_le_bytes(blob_header[..4].try_into().expect("4 bytes")))
    }

    /// Commits buffered state. With `is_final` the free-range index is
    /// serialized as well; bulk loaders pass `false` for intermediate
    /// checkpoints and `true` on the last one.
    pub fn commit(&mut self, is_final: bool) -> Result<()> {
        self.require_writable()?;
        self.poisoned = true;

        let freed = std::mem::take(&mut self.staged_free);
        for &(first_page, pages) in &freed {
            self.free.perform_free(&mut self.header, first_page, pages)?;
        }

        if is_final {
            self.write_free_range_index()?;
        }

        self.header.commit_id = self.header.commit_id.wrapping_add(1);
        let new_block = self.header.encode();

        if let Some(journal) = self.journal.as_mut() {
            journal.seal()?;
        }
        for (&ofs, block) in &self.dirty {
            write_all_at(self.store.file(), ofs, &block[..])?;
        }
        self.store.file().sync_data()?;
        write_all_at(self.store.file(), 0, &new_block)?;
        self.store.file().sync_data()?;

        // Neutralize the journal: rewrite the prologue with the new header
        // pre-image and no trailer. An unsealed journal is invalid and will
        // be ignored (and deleted) by recovery.
        if let Some(journal) = self.journal.as_mut() {
            let mode = if self.store.locked_exclusively() {
                JournalMode::ModifiedAll
            } else {
                JournalMode::ModifiedInactive
            };
            journal.restart(mode, &new_block)?;
        }

        // Only after the header no longer references the freed ranges may
        // their backing storage be released.
        for &(first_page, pages) in &freed {
            deallocate(
                self.store.file(),
                self.header.offset_of_page(first_page),
                (pages as u64) << (12 + self.header.page_size_shift as u32),
            )?;
        }

        debug!(
            commit_id = self.header.commit_id,
            total_pages = self.header.total_pages,
            free_ranges = self.header.free_ranges,
            is_final,
            "transaction committed"
        );

        self.dirty.clear();
        *self.header_preimage = new_block;
        self.pre_commit_size = self.header.offset_of_page(self.header.total_pages);
        self.store.note_committed(self.header.page_size_shift);

        // If the commit flipped the active snapshot, move the transaction's
        // snapshot lock to the new inactive byte before any further work can
        // reuse space that snapshot's remaining readers still see.
        if let Some(held) = self.snapshot_lock {
            let needed = LOCK_OFS + 2 * self.header.inactive_index() as u64;
            if needed != held {
                lock_region(self.store.file(), needed, 1, true, true)?;
                unlock_region(self.store.file(), held, 1)?;
                self.snapshot_lock = Some(needed);
            }
        }

        self.poisoned = false;
        Ok(())
    }

    /// Closes the transaction: removes the journal and releases the snapshot
    /// lock. Uncommitted changes are discarded.
    pub fn end(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        self.ended = true;
        if let Some(journal) = self.journal.take() {
            if self.poisoned {
                // Leave the journal for recovery on the next open.
                self.store.poison();
                drop(journal);
            } else {
                journal.remove()?;
            }
        }
        if let Some(byte) = self.snapshot_lock.take() {
            unlock_region(self.store.file(), byte, 1)?;
        }
        self.store.transaction_finished();
        Ok(())
    }

    /// Structural verification of the in-memory allocator state.
    pub fn verify_free_ranges(&self) -> Result<()> {
        self.free.verify(&self.header)
    }

    pub fn free_range_stats(&self) -> crate::store::free_ranges::FreeRangeStats {
        self.free.stats()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}
