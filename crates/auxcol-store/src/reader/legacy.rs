//! Attribute columns in legacy tree files

use super::ReaderCore;
use crate::registry::AttributeRegistry;
use crate::store::IoLock;
use auxcol_common::{Error, ReaderConfig, Result};
use auxcol_format::{ColumnDesc, ColumnHandle, TreeReader};
use bytes::Bytes;
use std::sync::Arc;

/// Reader of the attribute branches of one base branch
pub struct LegacyColumnReader {
    tree: Arc<TreeReader>,
    base: ColumnHandle,
    pub(super) core: ReaderCore,
}

impl LegacyColumnReader {
    /// Locate the base branch and check that its records hold attributes
    pub fn new(
        tree: Arc<TreeReader>,
        base_name: &str,
        registry: Arc<AttributeRegistry>,
        config: &ReaderConfig,
        io_lock: Option<IoLock>,
    ) -> Result<Self> {
        let base = tree.find_branch(base_name).ok_or_else(|| Error::ColumnNotFound {
            column: base_name.to_string(),
        })?;
        let record_type = tree
            .branch(base)
            .map(|b| b.type_name.clone())
            .unwrap_or_default();
        let core = ReaderCore::new(base_name, &record_type, registry, config, io_lock)?;
        Ok(Self { tree, base, core })
    }

    /// The underlying tree
    #[must_use]
    pub const fn tree(&self) -> &Arc<TreeReader> {
        &self.tree
    }

    /// Handle of the base branch
    #[must_use]
    pub const fn base(&self) -> ColumnHandle {
        self.base
    }

    pub(super) fn entries(&self) -> u64 {
        self.tree.branch(self.base).map_or(0, |b| b.entries)
    }

    #[allow(clippy::cast_possible_truncation)]
    pub(super) fn columns(&self) -> Vec<(ColumnHandle, ColumnDesc)> {
        self.tree
            .branches()
            .iter()
            .enumerate()
            .map(|(idx, branch)| (ColumnHandle::new(idx as u32), branch.column_desc()))
            .collect()
    }

    /// Every row of a branch holds an entry
    pub(super) fn read_raw(&self, handle: ColumnHandle, row: u64) -> Result<Option<Bytes>> {
        self.tree.read_entry(handle, row).map(Some)
    }
}
