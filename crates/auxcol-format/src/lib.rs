//! auxcol Format - Physical column files
//!
//! This crate implements the two physical column layouts the attribute
//! backends read and write:
//! - Legacy tree files: one branch per column, entries grouped in baskets
//! - Native ntuple files: one field per column, rows grouped in clusters
//!   with one page per field and cluster
//! - Value codec with packed bit-width encoding and schema evolution
//!
//! Both layouts share the CRC-framed record format of [`frame`].

pub mod codec;
pub mod frame;
pub mod legacy;
pub mod native;

use auxcol_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

// Re-exports
pub use codec::{DecodeOptions, decode, encode};
pub use legacy::{BranchDesc, TreeReader, TreeWriter};
pub use native::{FieldDesc, NTupleReader, NTupleWriter};

/// Magic of legacy tree files
pub const TREE_MAGIC: &[u8; 8] = b"AUXTREE\x01";

/// Magic of native ntuple files
pub const NTUPLE_MAGIC: &[u8; 8] = b"AUXNTPL\x01";

/// Index of a column (branch or field) within one file
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColumnHandle(u32);

impl ColumnHandle {
    /// Create from a raw index
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw index
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Get the raw index as a vector position
    #[must_use]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Backend-independent description of one column
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnDesc {
    pub name: String,
    /// On-disk type name
    pub type_name: String,
    /// Bit width of packed columns
    pub nbits: Option<u8>,
    /// First row with a stored entry; earlier rows read as absent
    pub first_entry: u64,
    /// Rows covered by the column
    pub entries: u64,
}

/// Physical layout of a column file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Legacy,
    Native,
}

impl FileKind {
    /// Sniff the layout from the file magic
    pub fn detect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut magic = [0u8; 8];
        File::open(path)?.read_exact(&mut magic)?;
        match &magic {
            m if m == TREE_MAGIC => Ok(Self::Legacy),
            m if m == NTUPLE_MAGIC => Ok(Self::Native),
            _ => Err(Error::format(format!(
                "{} is not an auxcol column file",
                path.display()
            ))),
        }
    }

    /// Magic written at the start of files of this kind
    #[must_use]
    pub const fn magic(&self) -> &'static [u8; 8] {
        match self {
            Self::Legacy => TREE_MAGIC,
            Self::Native => NTUPLE_MAGIC,
        }
    }
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Legacy => f.write_str("legacy"),
            Self::Native => f.write_str("native"),
        }
    }
}

/// Read statistics of one physical reader
#[derive(Debug, Default)]
pub struct IoStats {
    /// Number of entry reads requested
    pub read_calls: AtomicU64,
    /// Entry reads served from a cached basket or page
    pub cache_hits: AtomicU64,
    /// Baskets or pages loaded from the file
    pub records_loaded: AtomicU64,
    /// Bytes read from the file for entry data
    pub bytes_read: AtomicU64,
}

impl IoStats {
    pub(crate) fn record_hit(&self) {
        self.read_calls.fetch_add(1, Ordering::Relaxed);
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_load(&self, bytes: u64) {
        self.read_calls.fetch_add(1, Ordering::Relaxed);
        self.records_loaded.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Number of entry reads requested
    pub fn read_calls(&self) -> u64 {
        self.read_calls.load(Ordering::Relaxed)
    }

    /// Baskets or pages loaded from the file
    pub fn records_loaded(&self) -> u64 {
        self.records_loaded.load(Ordering::Relaxed)
    }

    /// Bytes read from the file for entry data
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Calculate hit ratio (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let calls = self.read_calls();
        if calls == 0 {
            return 0.0;
        }
        self.cache_hits.load(Ordering::Relaxed) as f64 / calls as f64
    }

    /// Reset all statistics
    pub fn reset(&self) {
        self.read_calls.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.records_loaded.store(0, Ordering::Relaxed);
        self.bytes_read.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_detect_kinds() {
        let dir = tempdir().unwrap();
        let tree = dir.path().join("events.tree");
        let ntuple = dir.path().join("events.ntuple");

        TreeWriter::create(&tree, "CollectionTree").unwrap().close().unwrap();
        NTupleWriter::create(&ntuple, "EventData", 10).unwrap().close().unwrap();

        assert_eq!(FileKind::detect(&tree).unwrap(), FileKind::Legacy);
        assert_eq!(FileKind::detect(&ntuple).unwrap(), FileKind::Native);
    }

    #[test]
    fn test_detect_rejects_foreign_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"just some text").unwrap();
        assert!(matches!(FileKind::detect(&path), Err(Error::Format(_))));

        let short = dir.path().join("short");
        std::fs::write(&short, b"AUX").unwrap();
        assert!(FileKind::detect(&short).is_err());
    }

    #[test]
    fn test_io_stats() {
        let stats = IoStats::default();
        stats.record_load(100);
        stats.record_hit();
        stats.record_hit();
        assert_eq!(stats.read_calls(), 3);
        assert_eq!(stats.bytes_read(), 100);
        assert!((stats.hit_ratio() - 2.0 / 3.0).abs() < 1e-9);
        stats.reset();
        assert_eq!(stats.read_calls(), 0);
    }
}
