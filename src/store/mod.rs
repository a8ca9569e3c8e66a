//! The transactional paged blob store.
//!
//! A store is a single file: a 4 KiB header block, a metadata section, and
//! blobs allocated on fixed-size pages. Many processes may read concurrently;
//! one writer at a time commits through the hot-journal protocol. Readers and
//! the writer coordinate through advisory byte-range locks on a dedicated
//! region of the file.

pub mod free_ranges;
pub mod header;
pub mod journal;
mod transaction;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use crate::error::{Result, StoreError};
use crate::primitives::io::{read_exact_at, write_all_at};
use crate::primitives::lock::{lock_region, unlock_region};
use crate::primitives::mapping::{MappedSlice, Mapping};
use crate::store::header::{Header, BLOCK_SIZE};
use crate::store::journal::JournalMode;

pub use header::{Snapshot, INVALID_FREE_RANGE_INDEX};
pub use transaction::{LockLevel, Transaction};

/// Every blob starts with this header: payload length (u32) + reserved (u32).
pub const BLOB_HEADER_SIZE: usize = 8;

/// Start of the lock region: `[reader byte snapshot 0, writer byte,
/// reader byte snapshot 1]`. The region lies in the unused tail of the
/// header block; no data is ever stored there.
pub const LOCK_OFS: u64 = 3072;

#[derive(Clone, Copy, Debug, Default)]
pub struct OpenOptions {
    pub write: bool,
    pub create: bool,
    /// Demand exclusive access to the whole store (required for
    /// `JournalMode::ModifiedAll` commits).
    pub exclusive: bool,
    /// Page size shift used when creating a new store: page size =
    /// `1 << (12 + shift)`, shift in 0..=4.
    pub page_size_shift: u8,
}

pub struct Store {
    file: Arc<File>,
    path: PathBuf,
    journal_path: PathBuf,
    mapping: Mapping,
    writable: bool,
    locked_exclusively: bool,
    created: AtomicBool,
    create_shift: u8,
    page_size_shift: AtomicU8,
    lock_start: u64,
    lock_len: u64,
    tx_active: AtomicBool,
    poisoned: AtomicBool,
}

enum Integrity {
    Clean,
    /// The store changed (journal applied) or locks may have been dropped;
    /// the caller must release its locks and start over.
    Reacquire,
    /// Another process is processing the journal; retry shortly.
    Retry,
    /// Zeroed header: an empty or never-committed store file.
    Blank,
}

impl Store {
    pub fn open(path: &Path, options: OpenOptions) -> Result<Store> {
        if options.page_size_shift > 4 {
            return Err(StoreError::InvalidArgument(
                "page size shift must be in 0..=4".into(),
            ));
        }
        let writable = options.write || options.create;
        // Readers also prefer a read-write handle: exclusive byte-range
        // locks and journal recovery need one. Read-only media still works,
        // minus the ability to recover someone else's interrupted commit.
        let rw_attempt = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(options.create)
            .truncate(false)
            .open(path);
        let (file, file_writable) = match rw_attempt {
            Ok(file) => (file, true),
            Err(err) if !writable => {
                let _ = err;
                let file = std::fs::OpenOptions::new().read(true).open(path)?;
                (file, false)
            }
            Err(err) => return Err(StoreError::Io(err)),
        };
        let file = Arc::new(file);
        let journal_path = journal::journal_path(path);

        let mut created = false;
        let (lock_start, lock_len) = loop {
            let (lock_start, lock_len) = Self::acquire_session_lock(&file, &options)?;

            let size = file.metadata()?.len();
            if size == 0 {
                if options.create {
                    created = true;
                    break (lock_start, lock_len);
                }
                unlock_region(&file, lock_start, lock_len)?;
                return Err(StoreError::Format("store file is empty".into()));
            }
            if size < BLOCK_SIZE as u64 {
                unlock_region(&file, lock_start, lock_len)?;
                return Err(StoreError::Format("store file shorter than header".into()));
            }

            match Self::ensure_integrity(&file, &journal_path, writable, file_writable)? {
                Integrity::Clean => break (lock_start, lock_len),
                Integrity::Blank => {
                    if options.create {
                        created = true;
                        break (lock_start, lock_len);
                    }
                    unlock_region(&file, lock_start, lock_len)?;
                    return Err(StoreError::Format("store was never committed".into()));
                }
                Integrity::Reacquire => {
                    unlock_region(&file, lock_start, lock_len)?;
                    continue;
                }
                Integrity::Retry => {
                    unlock_region(&file, lock_start, lock_len)?;
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                }
            }
        };

        let mapping = Mapping::new(file.clone())?;
        let page_size_shift = if created {
            options.page_size_shift
        } else {
            let mut block = [0u8; BLOCK_SIZE];
            read_exact_at(&file, 0, &mut block)?;
            Header::decode(&block)?.page_size_shift
        };

        Ok(Store {
            file,
            path: path.to_path_buf(),
            journal_path,
            mapping,
            writable,
            locked_exclusively: options.exclusive,
            created: AtomicBool::new(created),
            create_shift: options.page_size_shift,
            page_size_shift: AtomicU8::new(page_size_shift),
            lock_start,
            lock_len,
            tx_active: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
        })
    }

    fn acquire_session_lock(file: &File, options: &OpenOptions) -> Result<(u64, u64)> {
        if options.exclusive {
            if !lock_region(file, LOCK_OFS, 3, true, false)? {
                return Err(StoreError::Locked);
            }
            return Ok((LOCK_OFS, 3));
        }
        if options.write || options.create {
            if !lock_region(file, LOCK_OFS + 1, 1, true, false)? {
                return Err(StoreError::Locked);
            }
            return Ok((LOCK_OFS + 1, 1));
        }
        // Readers lock the byte of the currently active snapshot; the commit
        // counter is re-read under the lock to detect a concurrent flip.
        loop {
            let block = Self::read_header_block_of(file)?;
            let active = header::stored_active_snapshot(&block) & 1;
            let commit_id = header::stored_commit_id(&block);
            let byte = LOCK_OFS + 2 * active as u64;
            if !lock_region(file, byte, 1, false, false)? {
                return Err(StoreError::Locked);
            }
            let recheck = Self::read_header_block_of(file)?;
            if header::stored_commit_id(&recheck) == commit_id
                && (header::stored_active_snapshot(&recheck) & 1) == active
            {
                return Ok((byte, 1));
            }
            unlock_region(file, byte, 1)?;
        }
    }

    /// Verifies the header and processes a leftover journal, applying or
    /// rejecting it per the recovery rules.
    fn ensure_integrity(
        file: &Arc<File>,
        journal_path: &Path,
        is_writer: bool,
        file_writable: bool,
    ) -> Result<Integrity> {
        let block = Self::read_header_block_of(file)?;
        let header_valid = header::verify_block(&block);

        let journal_bytes = match journal::read_file(journal_path)? {
            None => {
                if header_valid {
                    return Ok(Integrity::Clean);
                }
                let magic = header::stored_magic(&block);
                if magic == 0 {
                    return Ok(Integrity::Blank);
                }
                if magic != header::MAGIC {
                    return Err(StoreError::Format(format!(
                        "unrecognized file format (magic {magic:#010x})"
                    )));
                }
                return Err(StoreError::Format(
                    "header checksum mismatch and no journal to recover from".into(),
                ));
            }
            Some(bytes) => bytes,
        };

        let journal_mode = journal_bytes
            .get(..8)
            .map(|b| u64::from_le_bytes(b.try_into().expect("8 bytes")))
            .and_then(JournalMode::from_raw);

        if !file_writable {
            // Read-only media: nothing can be applied or deleted here. Safe
            // to proceed only when the active snapshot is known intact.
            if header_valid && journal_mode == Some(JournalMode::ModifiedInactive) {
                return Ok(Integrity::Clean);
            }
            return Err(StoreError::Format(
                "store needs journal recovery but is not writable".into(),
            ));
        }

        // Journal processing needs the writer byte; a reader that cannot get
        // it may skip only when the active snapshot is known to be intact.
        let mut locked_here = false;
        if !is_writer {
            if !lock_region(file, LOCK_OFS + 1, 1, true, false)? {
                if header_valid && journal_mode == Some(JournalMode::ModifiedInactive) {
                    // A writer is active and will clean up its own journal.
                    return Ok(Integrity::Clean);
                }
                return Ok(Integrity::Retry);
            }
            locked_here = true;
        }

        let result = (|| -> Result<()> {
            if let Some(contents) = journal::verify(&journal_bytes) {
                let journal_commit = header::stored_commit_id(contents.header_preimage);
                let store_commit = header::stored_commit_id(&block);
                if !header_valid || journal_commit == store_commit {
                    warn!(
                        journal_commit,
                        header_valid, "rolling back interrupted transaction from journal"
                    );
                    Self::apply_journal(file, &contents)?;
                } else {
                    warn!(
                        journal_commit,
                        store_commit, "stale journal ignored (transaction had completed)"
                    );
                }
            } else {
                warn!("invalid journal discarded");
            }
            match std::fs::remove_file(journal_path) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(StoreError::Io(err)),
            }
        })();

        if locked_here {
            unlock_region(file, LOCK_OFS + 1, 1)?;
        }
        result?;

        // Header state may have changed (including the active snapshot), so
        // the caller re-acquires its session lock and re-verifies.
        Ok(Integrity::Reacquire)
    }

    /// Restores the journaled pre-images, then bumps the commit counter and
    /// rewrites the header in a separate sync so the journal cannot be
    /// re-applied if it fails to be deleted.
    fn apply_journal(file: &File, contents: &journal::JournalContents<'_>) -> Result<()> {
        for (ofs, pre_image) in contents.entries() {
            write_all_at(file, ofs, pre_image)?;
        }
        file.sync_data()?;

        let mut block = [0u8; BLOCK_SIZE];
        block.copy_from_slice(contents.header_preimage);
        let commit_id = header::stored_commit_id(&block).wrapping_add(1);
        block[16..24].copy_from_slice(&commit_id.to_le_bytes());
        header::seal_block(&mut block);
        write_all_at(file, 0, &block)?;
        file.sync_data()?;
        Ok(())
    }

    fn read_header_block_of(file: &File) -> Result<[u8; BLOCK_SIZE]> {
        let mut block = [0u8; BLOCK_SIZE];
        let len = file.metadata()?.len().min(BLOCK_SIZE as u64) as usize;
        if len > 0 {
            read_exact_at(file, 0, &mut block[..len])?;
        }
        Ok(block)
    }

    pub(crate) fn read_header_block(&self) -> Result<[u8; BLOCK_SIZE]> {
        Self::read_header_block_of(&self.file)
    }

    /// Reads up to one block at `ofs`, zero-filling past the end of the file.
    pub(crate) fn read_block_at(&self, ofs: u64, block: &mut [u8]) -> Result<()> {
        let file_len = self.file.metadata()?.len();
        block.fill(0);
        if ofs < file_len {
            let len = (file_len - ofs).min(block.len() as u64) as usize;
            read_exact_at(&self.file, ofs, &mut block[..len])?;
        }
        Ok(())
    }

    pub fn header(&self) -> Result<Header> {
        let block = self.read_header_block()?;
        if !header::verify_block(&block) {
            error!("header checksum mismatch");
            return Err(StoreError::Corruption("header checksum mismatch".into()));
        }
        Header::decode(&block)
    }

    /// Begins a transaction. Only one transaction may exist per process at a
    /// time; transactions are single-threaded.
    pub fn begin_transaction(&self, lock_level: LockLevel) -> Result<Transaction<'_>> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(StoreError::Corruption(
                "a previous commit failed; reopen the store to recover".into(),
            ));
        }
        if self
            .tx_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StoreError::InvalidArgument(
                "a transaction is already active".into(),
            ));
        }
        Transaction::begin(self, lock_level).inspect_err(|_| {
            self.tx_active.store(false, Ordering::Release);
        })
    }

    pub(crate) fn transaction_finished(&self) {
        self.tx_active.store(false, Ordering::Release);
    }

    pub(crate) fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    pub(crate) fn note_committed(&self, page_size_shift: u8) {
        self.page_size_shift.store(page_size_shift, Ordering::Release);
        self.created.store(false, Ordering::Release);
        let _ = self.mapping.remap();
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    pub(crate) fn file(&self) -> &File {
        &self.file
    }

    pub(crate) fn writable(&self) -> bool {
        self.writable
    }

    pub(crate) fn locked_exclusively(&self) -> bool {
        self.locked_exclusively
    }

    pub(crate) fn is_created(&self) -> bool {
        self.created.load(Ordering::Acquire)
    }

    pub(crate) fn create_page_size_shift(&self) -> u8 {
        self.create_shift
    }

    pub fn page_size_shift(&self) -> u8 {
        self.page_size_shift.load(Ordering::Acquire)
    }

    pub fn offset_of_page(&self, page: u32) -> u64 {
        (page as u64) << (12 + self.page_size_shift() as u32)
    }

    /// Maps a blob by its first page and returns its payload bytes.
    pub fn blob_payload(&self, page: u32) -> Result<MappedSlice> {
        let ofs = self.offset_of_page(page);
        let blob_header = self.mapping.slice(ofs, BLOB_HEADER_SIZE)?;
        let payload_len =
            u32::from_le_bytes(blob_header[..4].try_into().expect("4 bytes")) as usize;
        self.mapping.slice(ofs + BLOB_HEADER_SIZE as u64, payload_len)
    }

    /// Maps an arbitrary byte range of the store (used for the metadata
    /// section, which is not a blob).
    pub fn mapped_slice(&self, ofs: u64, len: usize) -> Result<MappedSlice> {
        self.mapping.slice(ofs, len)
    }

    /// Closes the store, trimming a writable store's file back to its
    /// committed high-water mark.
    pub fn close(self) -> Result<()> {
        if self.writable && !self.is_created() {
            let header = self.header()?;
            let true_size = header.offset_of_page(header.total_pages);
            let file_len = self.file.metadata()?.len();
            if file_len > true_size {
                self.file.set_len(true_size)?;
            }
        }
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let _ = unlock_region(&self.file, self.lock_start, self.lock_len);
    }
}
