//! Configuration types for auxcol
//!
//! This module defines the reader and writer settings shared by both
//! physical backends. All structures deserialize with defaults for missing
//! fields so partial TOML files are accepted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Root configuration for auxcol
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Read side configuration
    pub reader: ReaderConfig,
    /// Write side configuration
    pub writer: WriterConfig,
}

/// Read side configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Load the whole cluster page when one row of a native column is read
    pub prefetch_clusters: bool,
    /// Guard physical reads of all stores of a file with one shared lock
    pub shared_io_lock: bool,
    /// Input renames, `"<key>.<attr on file>" -> "<key>.<attr in memory>"`
    pub input_renames: BTreeMap<String, String>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            prefetch_clusters: true,
            shared_io_lock: true,
            input_renames: BTreeMap::new(),
        }
    }
}

/// When staged attribute values reach the physical columns
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitMode {
    /// Each column is filled as soon as its value for the row is set
    Immediate,
    /// All columns of a row are filled together by `commit`
    #[default]
    Batched,
}

impl std::fmt::Display for CommitMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Immediate => f.write_str("immediate"),
            Self::Batched => f.write_str("batched"),
        }
    }
}

impl std::str::FromStr for CommitMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "immediate" | "branch" | "per-column" => Ok(Self::Immediate),
            "batched" | "tree" | "" => Ok(Self::Batched),
            _ => Err(format!("unknown commit mode: {s}")),
        }
    }
}

/// Write side configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Commit policy of legacy outputs (native outputs always batch)
    pub commit_mode: CommitMode,
    /// Entries per basket of base columns in legacy files
    pub basket_entries: usize,
    /// Entries per cluster in native files
    pub cluster_entries: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            commit_mode: CommitMode::Batched,
            basket_entries: 256,
            cluster_entries: 1000,
        }
    }
}

impl WriterConfig {
    /// Entries per basket of attribute columns.
    ///
    /// Attributes hold less data than base columns, so their baskets are a
    /// quarter of the size.
    #[must_use]
    pub fn attribute_basket_entries(&self) -> usize {
        (self.basket_entries / 4).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.reader.prefetch_clusters);
        assert_eq!(config.writer.commit_mode, CommitMode::Batched);
        assert_eq!(config.writer.attribute_basket_entries(), 64);
    }

    #[test]
    fn test_attribute_basket_floor() {
        let config = WriterConfig {
            basket_entries: 2,
            ..Default::default()
        };
        assert_eq!(config.attribute_basket_entries(), 1);
    }

    #[test]
    fn test_commit_mode_parse() {
        assert_eq!("immediate".parse::<CommitMode>().unwrap(), CommitMode::Immediate);
        assert_eq!("TREE".parse::<CommitMode>().unwrap(), CommitMode::Batched);
        assert!("sometimes".parse::<CommitMode>().is_err());
    }
}
