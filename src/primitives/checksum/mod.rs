//! CRC32C (Castagnoli) checksums.
//!
//! The on-disk format uses CRC32C everywhere a checksum appears: the store
//! header, the journal trailer, the tile-index and metadata checksums.

/// Streaming CRC32C hasher.
#[derive(Default)]
pub struct Crc32c {
    state: u32,
}

impl Crc32c {
    pub fn new() -> Self {
        Self { state: 0 }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.state = crc32c::crc32c_append(self.state, bytes);
    }

    pub fn finalize(&self) -> u32 {
        self.state
    }
}

/// One-shot CRC32C of a byte slice.
pub fn crc32c_of(bytes: &[u8]) -> u32 {
    crc32c::crc32c(bytes)
}
