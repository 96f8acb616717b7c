//! Writer of legacy tree outputs

use super::{ColumnSink, NewColumn, PhysicalWriter, SharedOutput, WriterCore};
use crate::record::AuxStoreIo;
use crate::registry::AttributeRegistry;
use auxcol_common::{CommitMode, Error, Result, WriterConfig};
use auxcol_format::{ColumnHandle, TreeWriter};
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

/// Branch operations on a tree, filling each branch at once in immediate mode
struct TreeSink<'a> {
    tree: &'a mut TreeWriter,
    immediate: bool,
}

impl ColumnSink for TreeSink<'_> {
    fn entries(&self) -> u64 {
        self.tree.entries()
    }

    fn create_column(&mut self, column: &NewColumn<'_>, rows_written: u64) -> Result<ColumnHandle> {
        let handle = self
            .tree
            .create_branch(column.name, column.type_name, column.nbits, column.basket_entries)?;
        for _ in 0..rows_written {
            self.tree.append_entry(handle, column.default.clone())?;
        }
        if rows_written > 0 {
            debug!("Backfilled {} rows of branch {}", rows_written, column.name);
        }
        Ok(handle)
    }

    fn put(&mut self, handle: ColumnHandle, data: Bytes) -> Result<usize> {
        let len = data.len();
        self.tree.set_entry(handle, data)?;
        if self.immediate {
            self.tree.fill_branch(handle)
        } else {
            Ok(len)
        }
    }
}

/// Writes the attributes of containers as branches of a tree
pub struct LegacyColumnWriter {
    pub(super) core: WriterCore,
}

impl LegacyColumnWriter {
    pub(super) fn new(output: Arc<SharedOutput>, registry: Arc<AttributeRegistry>, config: WriterConfig) -> Self {
        Self {
            core: WriterCore::new(output, registry, config),
        }
    }

    /// Commit mode from the writer configuration
    #[must_use]
    pub const fn commit_mode(&self) -> CommitMode {
        self.core.config.commit_mode
    }

    fn with_sink<R>(&mut self, f: impl FnOnce(&mut WriterCore, &mut TreeSink<'_>) -> Result<R>) -> Result<R> {
        let immediate = self.commit_mode() == CommitMode::Immediate;
        let output = Arc::clone(&self.core.output);
        let mut writer = output.writer();
        let PhysicalWriter::Tree(tree) = &mut *writer else {
            return Err(Error::invalid_argument(format!(
                "output {} is not a tree",
                output.name()
            )));
        };
        let mut sink = TreeSink { tree, immediate };
        f(&mut self.core, &mut sink)
    }

    pub(super) fn declare_container(&mut self, base_name: &str, record_type: &str) -> Result<()> {
        self.with_sink(|core, sink| core.declare_container(sink, base_name, record_type))
    }

    pub(super) fn write_attributes(
        &mut self,
        base_name: &str,
        source: &dyn AuxStoreIo,
        rows_written: u64,
    ) -> Result<usize> {
        self.with_sink(|core, sink| {
            let batched = !sink.immediate;
            core.write_row(sink, base_name, source, rows_written, batched)
        })
    }
}
