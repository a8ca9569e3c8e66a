//! The hot journal: crash protection for in-place block updates.
//!
//! Before a transaction overwrites any 4 KiB block that existed at the last
//! commit, the block's original content is appended to `<store>.journal`.
//! A sealed journal carries everything needed to restore the pre-transaction
//! state: the header pre-image, the block pre-images, and a CRC32C trailer.
//!
//! File layout:
//! `u64 journal_mode | [4096-byte header pre-image] | (u64 ofs, 4096 bytes)*
//!  | u64 end_marker | u32 crc32c`
//!
//! The end marker has bit 63 set; the CRC covers everything before the end
//! marker. Bytes after the CRC are ignored, so a journal may be overwritten
//! in place without truncation.

use std::convert::TryInto;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, StoreError};
use crate::primitives::checksum::Crc32c;
use crate::store::header::BLOCK_SIZE;

pub const JOURNAL_END_MARKER_FLAG: u64 = 1 << 63;

const ENTRY_SIZE: usize = 8 + BLOCK_SIZE;
const MIN_JOURNAL_SIZE: usize = 8 + BLOCK_SIZE + 8 + 4;

/// What the journal's existence implies for other processes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JournalMode {
    /// Only the inactive snapshot has been modified; readers on the active
    /// snapshot may proceed without applying.
    ModifiedInactive = 1,
    /// Both snapshots may have been modified; any opener must apply.
    ModifiedAll = 2,
}

impl JournalMode {
    pub fn from_raw(raw: u64) -> Option<JournalMode> {
        match raw {
            1 => Some(JournalMode::ModifiedInactive),
            2 => Some(JournalMode::ModifiedAll),
            _ => None,
        }
    }
}

/// Writer-side journal handle. Created at transaction begin, sealed during
/// commit, reset for the next commit cycle, removed at transaction end.
pub struct Journal {
    file: File,
    path: PathBuf,
    crc: Crc32c,
}

impl Journal {
    /// Creates (or overwrites) the journal file with the mode word and the
    /// header pre-image.
    pub fn create(path: &Path, mode: JournalMode, header_block: &[u8]) -> Result<Journal> {
        debug_assert_eq!(header_block.len(), BLOCK_SIZE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut journal = Journal {
            file,
            path: path.to_path_buf(),
            crc: Crc32c::new(),
        };
        journal.write_prologue(mode, header_block)?;
        Ok(journal)
    }

    fn write_prologue(&mut self, mode: JournalMode, header_block: &[u8]) -> Result<()> {
        let mode_word = (mode as u64).to_le_bytes();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&mode_word)?;
        self.file.write_all(header_block)?;
        self.crc.update(&mode_word);
        self.crc.update(header_block);
        Ok(())
    }

    /// Appends one block pre-image.
    pub fn add_block(&mut self, ofs: u64, content: &[u8]) -> Result<()> {
        debug_assert_eq!(content.len(), BLOCK_SIZE);
        debug_assert_eq!(ofs & (BLOCK_SIZE as u64 - 1), 0);
        let ofs_word = ofs.to_le_bytes();
        self.file.write_all(&ofs_word)?;
        self.file.write_all(content)?;
        self.crc.update(&ofs_word);
        self.crc.update(content);
        Ok(())
    }

    /// Makes the journal durable: sync, end marker, trailer CRC, sync.
    pub fn seal(&mut self) -> Result<()> {
        self.file.sync_data()?;
        self.file
            .write_all(&JOURNAL_END_MARKER_FLAG.to_le_bytes())?;
        self.file.write_all(&self.crc.finalize().to_le_bytes())?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Rearms the journal for the next commit cycle with a fresh header
    /// pre-image and no entries.
    pub fn restart(&mut self, mode: JournalMode, header_block: &[u8]) -> Result<()> {
        self.file.set_len(0)?;
        self.crc = Crc32c::new();
        self.write_prologue(mode, header_block)?;
        Ok(())
    }

    /// Invalidates and deletes the journal file.
    pub fn remove(self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.sync_data()?;
        drop(self.file);
        std::fs::remove_file(&self.path)?;
        debug!(path = %self.path.display(), "journal removed");
        Ok(())
    }
}

/// A decoded view of a sealed journal.
pub struct JournalContents<'a> {
    pub mode: JournalMode,
    pub header_preimage: &'a [u8],
    bytes: &'a [u8],
}

impl<'a> JournalContents<'a> {
    /// Iterates the `(offset, block)` pre-image entries.
    pub fn entries(&self) -> impl Iterator<Item = (u64, &'a [u8])> {
        let mut pos = 8 + BLOCK_SIZE;
        let bytes = self.bytes;
        std::iter::from_fn(move || {
            let ofs = u64::from_le_bytes(bytes[pos..pos + 8].try_into().ok()?);
            if ofs & JOURNAL_END_MARKER_FLAG != 0 {
                return None;
            }
            let block = &bytes[pos + 8..pos + ENTRY_SIZE];
            pos += ENTRY_SIZE;
            Some((ofs, block))
        })
    }
}

/// Validates a journal image: minimum size, recognized mode, well-formed
/// entry chain, and trailer CRC. Returns the decoded view on success.
pub fn verify(journal: &[u8]) -> Option<JournalContents<'_>> {
    if journal.len() < MIN_JOURNAL_SIZE {
        return None;
    }
    let mode_raw = u64::from_le_bytes(journal[..8].try_into().ok()?);
    let mode = JournalMode::from_raw(mode_raw)?;

    let mut crc = Crc32c::new();
    crc.update(&journal[..8 + BLOCK_SIZE]);
    let mut pos = 8 + BLOCK_SIZE;
    loop {
        if pos + 8 > journal.len() {
            return None;
        }
        let ofs = u64::from_le_bytes(journal[pos..pos + 8].try_into().ok()?);
        if ofs & JOURNAL_END_MARKER_FLAG != 0 {
            pos += 8;
            break;
        }
        if pos + ENTRY_SIZE > journal.len() || ofs % BLOCK_SIZE as u64 != 0 {
            return None;
        }
        crc.update(&journal[pos..pos + ENTRY_SIZE]);
        pos += ENTRY_SIZE;
    }
    if pos + 4 > journal.len() {
        return None;
    }
    let stored = u32::from_le_bytes(journal[pos..pos + 4].try_into().ok()?);
    if stored != crc.finalize() {
        return None;
    }
    Some(JournalContents {
        mode,
        header_preimage: &journal[8..8 + BLOCK_SIZE],
        bytes: journal,
    })
}

/// Reads the whole journal file, or `Ok(None)` if it does not exist.
pub fn read_file(path: &Path) -> Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::Io(err)),
    }
}

pub fn journal_path(store_path: &Path) -> PathBuf {
    let mut os_string = store_path.as_os_str().to_owned();
    os_string.push(".journal");
    PathBuf::from(os_string)
}
