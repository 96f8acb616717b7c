//! Checksum utilities for auxcol files
//!
//! Every basket, page and footer record carries a CRC32C for inline
//! verification; column payloads additionally get an xxHash64 content hash
//! recorded in the file directory.

use serde::{Deserialize, Serialize};

/// Checksum values computed for a block of data
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    /// CRC32C checksum (fast, for inline verification)
    pub crc32c: u32,
    /// xxHash64 (fast, for comparison)
    pub xxhash64: u64,
}

impl Checksum {
    /// Compute checksum from data
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self {
            crc32c: crc32c::crc32c(data),
            xxhash64: xxhash_rust::xxh64::xxh64(data, 0),
        }
    }

    /// Verify data against this checksum (fast check using CRC32C)
    #[must_use]
    pub fn verify_fast(&self, data: &[u8]) -> bool {
        crc32c::crc32c(data) == self.crc32c
    }

    /// Verify data against this checksum (both algorithms)
    #[must_use]
    pub fn verify_full(&self, data: &[u8]) -> bool {
        self.verify_fast(data) && xxhash_rust::xxh64::xxh64(data, 0) == self.xxhash64
    }
}

/// Running CRC32C over data appended in pieces
#[derive(Clone, Copy, Debug, Default)]
pub struct Crc32cState(u32);

impl Crc32cState {
    /// Start a new checksum
    #[must_use]
    pub const fn new() -> Self {
        Self(0)
    }

    /// Feed more data
    pub fn update(&mut self, data: &[u8]) {
        self.0 = crc32c::crc32c_append(self.0, data);
    }

    /// Current value
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }
}
