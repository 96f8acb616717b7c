//! Writer of native ntuple outputs

use super::{ColumnSink, NewColumn, PhysicalWriter, SharedOutput, WriterCore};
use crate::record::AuxStoreIo;
use crate::registry::AttributeRegistry;
use auxcol_common::{CommitMode, Error, Result, WriterConfig};
use auxcol_format::{ColumnHandle, NTupleWriter};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info};

struct NTupleSink<'a> {
    ntuple: &'a mut NTupleWriter,
}

impl ColumnSink for NTupleSink<'_> {
    fn entries(&self) -> u64 {
        self.ntuple.entries()
    }

    /// Fields added after the first row are deferred: earlier rows read
    /// back as the default without being stored.
    fn create_column(&mut self, column: &NewColumn<'_>, rows_written: u64) -> Result<ColumnHandle> {
        let handle = self.ntuple.add_field(column.name, column.type_name, column.nbits)?;
        if rows_written != self.ntuple.entries() {
            debug!(
                "Field {} starts at entry {} of the ntuple, container has {} rows",
                column.name,
                self.ntuple.entries(),
                rows_written
            );
        }
        Ok(handle)
    }

    fn put(&mut self, handle: ColumnHandle, data: Bytes) -> Result<usize> {
        let len = data.len();
        self.ntuple.stage(handle, data)?;
        Ok(len)
    }
}

/// Writes the attributes of containers as fields of an ntuple
pub struct NativeColumnWriter {
    pub(super) core: WriterCore,
}

impl NativeColumnWriter {
    pub(super) fn new(output: Arc<SharedOutput>, registry: Arc<AttributeRegistry>, config: WriterConfig) -> Self {
        if config.commit_mode == CommitMode::Immediate {
            info!("Output {} is a native ntuple, rows are committed in batches", output.name());
        }
        Self {
            core: WriterCore::new(output, registry, config),
        }
    }

    fn with_sink<R>(&mut self, f: impl FnOnce(&mut WriterCore, &mut NTupleSink<'_>) -> Result<R>) -> Result<R> {
        let output = Arc::clone(&self.core.output);
        let mut writer = output.writer();
        let PhysicalWriter::NTuple(ntuple) = &mut *writer else {
            return Err(Error::invalid_argument(format!(
                "output {} is not an ntuple",
                output.name()
            )));
        };
        let mut sink = NTupleSink { ntuple };
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
        self.with_sink(|core, sink| core.write_row(sink, base_name, source, rows_written, true))
    }
}
