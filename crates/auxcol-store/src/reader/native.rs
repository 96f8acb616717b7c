//! Attribute columns in native ntuple files

use super::ReaderCore;
use crate::registry::AttributeRegistry;
use crate::store::IoLock;
use auxcol_common::{Error, ReaderConfig, Result};
use auxcol_format::{ColumnDesc, ColumnHandle, NTupleReader};
use bytes::Bytes;
use std::sync::Arc;

/// Reader of the attribute fields of one base field.
///
/// Pages are cached per cluster by the ntuple reader when it was opened with
/// prefetch, so consecutive rows of one cluster cost one physical read.
pub struct NativeColumnReader {
    ntuple: Arc<NTupleReader>,
    base: ColumnHandle,
    pub(super) core: ReaderCore,
}

impl NativeColumnReader {
    /// Locate the base field and check that its records hold attributes
    pub fn new(
        ntuple: Arc<NTupleReader>,
        base_name: &str,
        registry: Arc<AttributeRegistry>,
        config: &ReaderConfig,
        io_lock: Option<IoLock>,
    ) -> Result<Self> {
        let base = ntuple.find_field(base_name).ok_or_else(|| Error::ColumnNotFound {
            column: base_name.to_string(),
        })?;
        let record_type = ntuple
            .field(base)
            .map(|f| f.type_name.clone())
            .unwrap_or_default();
        let core = ReaderCore::new(base_name, &record_type, registry, config, io_lock)?;
        Ok(Self { ntuple, base, core })
    }

    /// The underlying ntuple
    #[must_use]
    pub const fn ntuple(&self) -> &Arc<NTupleReader> {
        &self.ntuple
    }

    /// Handle of the base field
    #[must_use]
    pub const fn base(&self) -> ColumnHandle {
        self.base
    }

    /// Every field spans all rows of the ntuple
    pub(super) fn entries(&self) -> u64 {
        self.ntuple.entries()
    }

    #[allow(clippy::cast_possible_truncation)]
    pub(super) fn columns(&self) -> Vec<(ColumnHandle, ColumnDesc)> {
        self.ntuple
            .columns()
            .into_iter()
            .enumerate()
            .map(|(idx, desc)| (ColumnHandle::new(idx as u32), desc))
            .collect()
    }

    /// Rows before the first entry of a deferred field read as `None`
    pub(super) fn read_raw(&self, handle: ColumnHandle, row: u64) -> Result<Option<Bytes>> {
        self.ntuple.read_entry(handle, row)
    }
}
