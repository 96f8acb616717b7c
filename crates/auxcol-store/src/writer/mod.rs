//! Write backends
//!
//! A write backend turns the attributes of one row of a container into
//! values of per-attribute columns named `<base>Dyn.<attr>`. Columns are
//! created the first time an attribute is selected. Rows written before
//! that read back as the default value, so every column of a container has
//! as many rows as the container. Existing columns that are not selected
//! in a row receive the default value too.
//!
//! [`WriteBackend::Legacy`] writes tree files and supports both commit
//! modes. [`WriteBackend::Native`] writes ntuple files and always fills one
//! whole row at commit.

mod group;
mod legacy;
mod native;

pub use group::{Arrival, CommitGroup, OutputRegistry, PhysicalWriter, SharedOutput};
pub use legacy::LegacyColumnWriter;
pub use native::NativeColumnWriter;

use crate::record::AuxStoreIo;
use crate::registry::AttributeRegistry;
use auxcol_common::naming::column_name;
use auxcol_common::{AttributeId, CommitMode, Error, LogicalType, Result, Value, WriterConfig};
use auxcol_format::{ColumnHandle, FileKind, encode};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Physical column of one attribute of one container
#[derive(Debug, Clone)]
pub struct WriterColumnEntry {
    /// Column in the physical writer
    pub handle: ColumnHandle,
    /// Full column name
    pub column_name: String,
    /// Canonical on-disk type name
    pub type_name: String,
    /// Column type
    pub column_type: LogicalType,
    /// Bit width of packed columns
    pub nbits: Option<u8>,
    /// Rows the column holds, backfilled rows included
    pub rows_written: u64,
    written_this_row: bool,
    default: Bytes,
}

/// Columns of one base column
#[derive(Debug)]
struct ContainerColumns {
    base: ColumnHandle,
    columns: BTreeMap<AttributeId, WriterColumnEntry>,
    /// Attributes whose column could not be created
    failed: HashSet<AttributeId>,
}

/// Parameters of a column to create
pub(crate) struct NewColumn<'a> {
    pub name: &'a str,
    pub type_name: &'a str,
    pub nbits: Option<u8>,
    pub default: &'a Bytes,
    pub basket_entries: usize,
}

/// Column operations the row algorithm needs from a physical writer
pub(crate) trait ColumnSink {
    /// Rows already written to the output
    fn entries(&self) -> u64;

    /// Create a column whose first `rows_written` rows hold the default
    fn create_column(&mut self, column: &NewColumn<'_>, rows_written: u64) -> Result<ColumnHandle>;

    /// Set the value of the current row. Returns the bytes staged or written.
    fn put(&mut self, handle: ColumnHandle, data: Bytes) -> Result<usize>;
}

/// State shared by both write backends
pub(crate) struct WriterCore {
    pub output: Arc<SharedOutput>,
    registry: Arc<AttributeRegistry>,
    pub config: WriterConfig,
    containers: HashMap<String, ContainerColumns>,
    staged: bool,
    staged_bytes: usize,
    /// Rows filled when this producer's last committed row was left waiting
    awaiting_fill: Option<u64>,
}

impl WriterCore {
    pub fn new(output: Arc<SharedOutput>, registry: Arc<AttributeRegistry>, config: WriterConfig) -> Self {
        let clients = output.group().increase_client_count();
        debug!("Writer attached to output {} as client {}", output.name(), clients);
        Self {
            output,
            registry,
            config,
            containers: HashMap::new(),
            staged: false,
            staged_bytes: 0,
            awaiting_fill: None,
        }
    }

    /// Create the base column of a container. Declaring twice is a no-op.
    pub fn declare_container<S: ColumnSink>(
        &mut self,
        sink: &mut S,
        base_name: &str,
        record_type: &str,
    ) -> Result<()> {
        if self.containers.contains_key(base_name) {
            return Ok(());
        }

        let default = Bytes::new();
        let rows = sink.entries();
        let column = NewColumn {
            name: base_name,
            type_name: record_type,
            nbits: None,
            default: &default,
            basket_entries: self.config.basket_entries,
        };
        let base = sink.create_column(&column, rows)?;
        info!("Declared container {} ({})", base_name, record_type);
        self.containers.insert(
            base_name.to_string(),
            ContainerColumns {
                base,
                columns: BTreeMap::new(),
                failed: HashSet::new(),
            },
        );
        Ok(())
    }

    /// Write the attributes of one row.
    ///
    /// Every column of the container receives a value, so a partly failed
    /// row is still complete. The first per-attribute error is returned
    /// after the row has been written. On a grouped output a producer
    /// cannot stage a new row while its previous one waits for the other
    /// producers.
    pub fn write_row<S: ColumnSink>(
        &mut self,
        sink: &mut S,
        base_name: &str,
        source: &dyn AuxStoreIo,
        rows_written: u64,
        batched: bool,
    ) -> Result<usize> {
        self.check_previous_row_filled()?;

        let Self {
            ref registry,
            ref config,
            ref mut containers,
            ..
        } = *self;
        let container = containers
            .get_mut(base_name)
            .ok_or_else(|| Error::invalid_argument(format!("container {base_name} was not declared")))?;

        let row = RowContext {
            registry,
            config,
            base_name,
            rows_written,
        };
        let written = row.write(container, sink, source);
        for entry in container.columns.values_mut() {
            entry.written_this_row = false;
        }
        let (bytes, first_error) = written?;
        for entry in container.columns.values_mut() {
            entry.rows_written += 1;
        }

        if batched {
            self.staged = true;
            self.staged_bytes += bytes;
        }
        debug!("Wrote row {} of {} ({} bytes)", rows_written, base_name, bytes);
        first_error.map_or(Ok(bytes), Err)
    }

    fn check_previous_row_filled(&mut self) -> Result<()> {
        let Some(filled) = self.awaiting_fill else {
            return Ok(());
        };
        let group = self.output.group();
        if group.filled_rows() == filled {
            return Err(Error::invalid_argument(format!(
                "previous row of output {} still waits for {} producers to commit",
                self.output.name(),
                group.client_count().saturating_sub(group.pending_arrivals())
            )));
        }
        self.awaiting_fill = None;
        Ok(())
    }

    pub const fn needs_commit(&self) -> bool {
        self.staged
    }

    /// Commit the staged row. The last producer of a grouped output fills it.
    pub fn commit(&mut self) -> Result<usize> {
        if !self.staged {
            debug!("Nothing staged for output {}, skipping commit", self.output.name());
            return Ok(0);
        }

        self.staged = false;
        let bytes = std::mem::take(&mut self.staged_bytes);
        match self.output.group().arrive() {
            Arrival::Last => {
                self.output.fill()?;
            }
            Arrival::Waiting { filled } => {
                self.awaiting_fill = Some(filled);
                debug!(
                    "Row of output {} waits for {} more producers",
                    self.output.name(),
                    self.output.group().client_count().saturating_sub(self.output.group().pending_arrivals())
                );
            }
        }
        Ok(bytes)
    }

    fn column(&self, base_name: &str, id: AttributeId) -> Option<&WriterColumnEntry> {
        self.containers.get(base_name)?.columns.get(&id)
    }
}

fn attribute_name(registry: &AttributeRegistry, id: AttributeId) -> String {
    registry.name_of(id).unwrap_or_else(|| id.to_string())
}

/// One row of one container being written
struct RowContext<'a> {
    registry: &'a AttributeRegistry,
    config: &'a WriterConfig,
    base_name: &'a str,
    rows_written: u64,
}

impl RowContext<'_> {
    /// Put a value into every column of the container. Returns the bytes
    /// put and the first per-attribute error.
    fn write<S: ColumnSink>(
        &self,
        container: &mut ContainerColumns,
        sink: &mut S,
        source: &dyn AuxStoreIo,
    ) -> Result<(usize, Option<Error>)> {
        let Self {
            registry,
            config,
            base_name,
            rows_written,
        } = *self;
        let standalone = source.is_standalone();
        let mut bytes = sink.put(container.base, Bytes::new())?;
        let mut first_error = None;

        for id in source.selected_ids() {
            if container.failed.contains(&id) {
                warn!(
                    "Dropping attribute {} of {} from row {}: it has no column",
                    attribute_name(registry, id),
                    base_name,
                    rows_written
                );
                continue;
            }

            if !container.columns.contains_key(&id) {
                match new_column(registry, config, sink, base_name, id, standalone, rows_written) {
                    Ok(entry) => {
                        container.columns.insert(id, entry);
                    }
                    Err(e @ Error::Configuration(_)) => {
                        error!("Cannot write attribute {} of {}: {}", attribute_name(registry, id), base_name, e);
                        container.failed.insert(id);
                        first_error.get_or_insert(e);
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            let Some(entry) = container.columns.get_mut(&id) else {
                continue;
            };
            if entry.written_this_row {
                continue;
            }

            let data = match source.io_data(id) {
                Some(value) => match encode_value(entry, value, &attribute_name(registry, id)) {
                    Ok(data) => data,
                    Err(e) => {
                        warn!("Writing default for row {} of {}: {}", rows_written, entry.column_name, e);
                        first_error.get_or_insert(e);
                        entry.default.clone()
                    }
                },
                None => entry.default.clone(),
            };
            bytes += sink.put(entry.handle, data)?;
            entry.written_this_row = true;
        }

        for entry in container.columns.values_mut() {
            if !entry.written_this_row {
                bytes += sink.put(entry.handle, entry.default.clone())?;
                entry.written_this_row = true;
            }
        }
        Ok((bytes, first_error))
    }
}

/// Column type of an attribute: the attribute type for standalone objects,
/// a vector of it (packed if requested) for collections
fn column_type(registry: &AttributeRegistry, id: AttributeId, name: &str, standalone: bool) -> Result<(LogicalType, Option<u8>)> {
    let ty = registry
        .type_of(id)
        .ok_or_else(|| Error::configuration(format!("attribute {id} is not registered")))?;
    if ty.contains_unknown() {
        return Err(Error::configuration(format!("attribute {name} of type {ty} cannot be written")));
    }
    if standalone {
        return Ok((ty, None));
    }

    match registry.packing_of(id) {
        Some(hint) if hint.is_valid_for(&ty) => Ok((LogicalType::Packed(Box::new(ty)), Some(hint.nbits))),
        Some(hint) => Err(Error::configuration(format!(
            "attribute {name} of type {ty} cannot be packed with {} bits",
            hint.nbits
        ))),
        None => Ok((LogicalType::Vector(Box::new(ty)), None)),
    }
}

fn new_column<S: ColumnSink>(
    registry: &AttributeRegistry,
    config: &WriterConfig,
    sink: &mut S,
    base_name: &str,
    id: AttributeId,
    standalone: bool,
    rows_written: u64,
) -> Result<WriterColumnEntry> {
    let name = attribute_name(registry, id);
    let (column_type, nbits) = column_type(registry, id, &name, standalone)?;
    let default_value = column_type
        .default_value()
        .ok_or_else(|| Error::configuration(format!("attribute {name} has no default value")))?;
    let default = encode(&default_value, &column_type, nbits)?;
    let column_name = column_name(&name, base_name);
    let type_name = column_type.type_name();

    let column = NewColumn {
        name: &column_name,
        type_name: &type_name,
        nbits,
        default: &default,
        basket_entries: config.attribute_basket_entries(),
    };
    let handle = sink.create_column(&column, rows_written)?;
    info!("Created column {} ({}) for attribute {}", column_name, type_name, name);

    Ok(WriterColumnEntry {
        handle,
        column_name,
        type_name,
        column_type,
        nbits,
        rows_written,
        written_this_row: false,
        default,
    })
}

fn encode_value(entry: &WriterColumnEntry, value: &Value, name: &str) -> Result<Bytes> {
    if value.conforms_to(&entry.column_type) {
        return encode(value, &entry.column_type, entry.nbits);
    }
    let coerced = value.coerce_to(&entry.column_type).ok_or_else(|| Error::TypeMismatch {
        attribute: name.to_string(),
        on_disk: entry.type_name.clone(),
        registered: describe(value),
    })?;
    encode(&coerced, &entry.column_type, entry.nbits)
}

/// Type name of the shape of a value, for error messages
fn describe(value: &Value) -> String {
    fn shape(value: &Value) -> LogicalType {
        match value {
            Value::Bool(_) => LogicalType::Bool,
            Value::I8(_) => LogicalType::I8,
            Value::U8(_) => LogicalType::U8,
            Value::I16(_) => LogicalType::I16,
            Value::U16(_) => LogicalType::U16,
            Value::I32(_) => LogicalType::I32,
            Value::U32(_) => LogicalType::U32,
            Value::I64(_) => LogicalType::I64,
            Value::U64(_) => LogicalType::U64,
            Value::F32(_) => LogicalType::F32,
            Value::F64(_) => LogicalType::F64,
            Value::String(_) => LogicalType::String,
            Value::List(items) => LogicalType::Vector(Box::new(
                items.first().map_or_else(|| LogicalType::Unknown("?".into()), shape),
            )),
        }
    }
    shape(value).type_name()
}

/// Write backend of one output
pub enum WriteBackend {
    Legacy(LegacyColumnWriter),
    Native(NativeColumnWriter),
}

impl WriteBackend {
    /// Create the backend matching the layout of `output` and register it
    /// as a client of the output
    #[must_use]
    pub fn new(output: Arc<SharedOutput>, registry: Arc<AttributeRegistry>, config: WriterConfig) -> Self {
        match output.kind() {
            FileKind::Legacy => Self::Legacy(LegacyColumnWriter::new(output, registry, config)),
            FileKind::Native => Self::Native(NativeColumnWriter::new(output, registry, config)),
        }
    }

    const fn core(&self) -> &WriterCore {
        match self {
            Self::Legacy(w) => &w.core,
            Self::Native(w) => &w.core,
        }
    }

    /// Physical layout written
    #[must_use]
    pub const fn kind(&self) -> FileKind {
        match self {
            Self::Legacy(_) => FileKind::Legacy,
            Self::Native(_) => FileKind::Native,
        }
    }

    /// Output written to
    #[must_use]
    pub const fn output(&self) -> &Arc<SharedOutput> {
        &self.core().output
    }

    /// Effective commit mode
    #[must_use]
    pub const fn commit_mode(&self) -> CommitMode {
        match self {
            Self::Legacy(w) => w.commit_mode(),
            Self::Native(_) => CommitMode::Batched,
        }
    }

    /// Create the base column of a container holding `record_type` records
    pub fn declare_container(&mut self, base_name: &str, record_type: &str) -> Result<()> {
        match self {
            Self::Legacy(w) => w.declare_container(base_name, record_type),
            Self::Native(w) => w.declare_container(base_name, record_type),
        }
    }

    /// Write the selected attributes of one row of `base_name`.
    ///
    /// `rows_written` is the number of rows of the container written
    /// before this one. Returns the bytes staged or written.
    pub fn write_attributes(
        &mut self,
        base_name: &str,
        source: &dyn AuxStoreIo,
        rows_written: u64,
    ) -> Result<usize> {
        match self {
            Self::Legacy(w) => w.write_attributes(base_name, source, rows_written),
            Self::Native(w) => w.write_attributes(base_name, source, rows_written),
        }
    }

    /// True if a written row waits for [`WriteBackend::commit`]
    #[must_use]
    pub const fn needs_commit(&self) -> bool {
        self.core().needs_commit()
    }

    /// Commit the staged row. Returns 0 when nothing was staged.
    pub fn commit(&mut self) -> Result<usize> {
        match self {
            Self::Legacy(w) => w.core.commit(),
            Self::Native(w) => w.core.commit(),
        }
    }

    /// True if other producers share the output
    #[must_use]
    pub fn is_grouped(&self) -> bool {
        self.core().output.group().is_grouped()
    }

    /// Register one more producer of the output
    pub fn increase_client_count(&self) -> usize {
        self.core().output.group().increase_client_count()
    }

    /// Column of an attribute of a container, once created
    #[must_use]
    pub fn column(&self, base_name: &str, id: AttributeId) -> Option<&WriterColumnEntry> {
        self.core().column(base_name, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::ReadBackend;
    use crate::record::{AuxRecord, AuxRow};
    use auxcol_common::ReaderConfig;
    use auxcol_format::{NTupleReader, TreeReader};
    use rand::Rng;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    const RECORD_TYPE: &str = "xAOD::AuxInfoBase";

    fn holder_registry() -> Arc<AttributeRegistry> {
        let registry = Arc::new(AttributeRegistry::new());
        registry.declare_holder_type(RECORD_TYPE);
        registry
    }

    fn open_output(outputs: &OutputRegistry, dir: &TempDir, kind: FileKind) -> (Arc<SharedOutput>, PathBuf) {
        let path = dir.path().join(format!("out.{kind}"));
        let output = match kind {
            FileKind::Legacy => outputs.open_tree("out", &path, "CollectionTree").unwrap(),
            FileKind::Native => outputs.open_ntuple("out", &path, "EventData", 3).unwrap(),
        };
        (output, path)
    }

    fn read(path: &Path, base: &str, registry: Arc<AttributeRegistry>, standalone: bool) -> Arc<ReadBackend> {
        let reader = Arc::new(ReadBackend::open(path, base, registry, &ReaderConfig::default()).unwrap());
        reader.discover(standalone);
        reader
    }

    fn value_at(reader: &ReadBackend, name: &str, row: u64) -> Value {
        let id = reader.registry().find_id(name).unwrap();
        reader.materialize(id, row).unwrap().unwrap().0
    }

    fn scalar_samples<R: Rng>(rng: &mut R) -> Vec<(&'static str, LogicalType, Value)> {
        vec![
            ("flag", LogicalType::Bool, Value::Bool(rng.r#gen())),
            ("i8", LogicalType::I8, Value::I8(rng.r#gen())),
            ("u8", LogicalType::U8, Value::U8(rng.r#gen())),
            ("i16", LogicalType::I16, Value::I16(rng.r#gen())),
            ("u16", LogicalType::U16, Value::U16(rng.r#gen())),
            ("i32", LogicalType::I32, Value::I32(rng.r#gen())),
            ("u32", LogicalType::U32, Value::U32(rng.r#gen())),
            ("i64", LogicalType::I64, Value::I64(rng.r#gen())),
            ("u64", LogicalType::U64, Value::U64(rng.r#gen())),
            ("f32", LogicalType::F32, Value::F32(rng.r#gen())),
            ("f64", LogicalType::F64, Value::F64(rng.r#gen())),
            ("label", LogicalType::String, Value::String(format!("run{}", rng.r#gen::<u16>()))),
        ]
    }

    #[test]
    fn test_round_trip_standalone_scalars() {
        for kind in [FileKind::Legacy, FileKind::Native] {
            let dir = TempDir::new().unwrap();
            let mut rng = rand::thread_rng();
            let rows: Vec<_> = (0..5).map(|_| scalar_samples(&mut rng)).collect();

            let registry = holder_registry();
            let outputs = OutputRegistry::new();
            let (output, path) = open_output(&outputs, &dir, kind);
            let mut writer = WriteBackend::new(output, Arc::clone(&registry), WriterConfig::default());
            writer.declare_container("EventInfoAux.", RECORD_TYPE).unwrap();
            for (row, samples) in rows.iter().enumerate() {
                let mut values = AuxRow::standalone();
                for (name, ty, value) in samples {
                    let id = registry.register(name, ty.clone()).unwrap();
                    values.set(id, value.clone());
                }
                writer.write_attributes("EventInfoAux.", &values, row as u64).unwrap();
                writer.commit().unwrap();
            }
            outputs.close_all().unwrap();

            let reader = read(&path, "EventInfoAux.", holder_registry(), true);
            for (row, samples) in rows.iter().enumerate() {
                for (name, _, value) in samples {
                    assert_eq!(&value_at(&reader, name, row as u64), value, "{kind} {name} row {row}");
                }
            }
        }
    }

    #[test]
    fn test_round_trip_collection_vectors() {
        for kind in [FileKind::Legacy, FileKind::Native] {
            let dir = TempDir::new().unwrap();
            let mut rng = rand::thread_rng();
            let rows: Vec<Vec<_>> = (0..4)
                .map(|_| {
                    let members = rng.gen_range(0..6);
                    (0..members).map(|_| scalar_samples(&mut rng)).collect()
                })
                .collect();

            let registry = holder_registry();
            let outputs = OutputRegistry::new();
            let (output, path) = open_output(&outputs, &dir, kind);
            let mut writer = WriteBackend::new(output, Arc::clone(&registry), WriterConfig::default());
            writer.declare_container("JetsAux.", RECORD_TYPE).unwrap();

            let names: Vec<_> = scalar_samples(&mut rng).into_iter().map(|(n, ty, _)| (n, ty)).collect();
            for (row, members) in rows.iter().enumerate() {
                let mut values = AuxRow::collection();
                for (idx, (name, ty)) in names.iter().enumerate() {
                    let id = registry.register(name, ty.clone()).unwrap();
                    let list = members.iter().map(|m| m[idx].2.clone()).collect();
                    values.set(id, Value::List(list));
                }
                writer.write_attributes("JetsAux.", &values, row as u64).unwrap();
                writer.commit().unwrap();
            }
            outputs.close_all().unwrap();

            let reader = read(&path, "JetsAux.", holder_registry(), false);
            for (row, members) in rows.iter().enumerate() {
                for (idx, (name, _)) in names.iter().enumerate() {
                    let expected = Value::List(members.iter().map(|m| m[idx].2.clone()).collect());
                    assert_eq!(value_at(&reader, name, row as u64), expected, "{kind} {name} row {row}");
                }
            }
        }
    }

    #[test]
    fn test_default_backfill() {
        for kind in [FileKind::Legacy, FileKind::Native] {
            let dir = TempDir::new().unwrap();
            let registry = holder_registry();
            let n = registry.register("n", LogicalType::I32).unwrap();
            let late = registry.register("late", LogicalType::F64).unwrap();

            let outputs = OutputRegistry::new();
            let (output, path) = open_output(&outputs, &dir, kind);
            let mut writer = WriteBackend::new(output, Arc::clone(&registry), WriterConfig::default());
            writer.declare_container("EventInfoAux.", RECORD_TYPE).unwrap();
            for row in 0..10u64 {
                let small = u32::try_from(row).unwrap();
                let mut values = AuxRow::standalone();
                values.set(n, Value::I32(i32::try_from(small).unwrap()));
                if row >= 5 {
                    values.set(late, Value::F64(f64::from(small) * 1.5));
                }
                writer.write_attributes("EventInfoAux.", &values, row).unwrap();
                writer.commit().unwrap();
            }
            assert_eq!(writer.column("EventInfoAux.", late).unwrap().rows_written, 10);
            outputs.close_all().unwrap();

            match kind {
                FileKind::Legacy => {
                    let tree = TreeReader::open(&path).unwrap();
                    let handle = tree.find_branch("EventInfoAuxDyn.late").unwrap();
                    assert_eq!(tree.branch(handle).unwrap().entries, 10);
                }
                FileKind::Native => {
                    let ntuple = NTupleReader::open(&path).unwrap();
                    let handle = ntuple.find_field("EventInfoAuxDyn.late").unwrap();
                    assert_eq!(ntuple.field(handle).unwrap().first_entry, 5);
                    assert_eq!(ntuple.entries(), 10);
                }
            }

            let reader = read(&path, "EventInfoAux.", holder_registry(), true);
            assert_eq!(reader.entries(), 10);
            for row in 0..10u64 {
                let expected = if row < 5 { 0.0 } else { f64::from(u32::try_from(row).unwrap()) * 1.5 };
                assert_eq!(value_at(&reader, "late", row), Value::F64(expected), "{kind} row {row}");
            }
        }
    }

    #[test]
    fn test_unselected_column_gets_default() {
        for kind in [FileKind::Legacy, FileKind::Native] {
            let dir = TempDir::new().unwrap();
            let registry = holder_registry();
            let x = registry.register("x", LogicalType::F32).unwrap();
            let y = registry.register("y", LogicalType::I32).unwrap();

            let outputs = OutputRegistry::new();
            let (output, path) = open_output(&outputs, &dir, kind);
            let mut writer = WriteBackend::new(output, Arc::clone(&registry), WriterConfig::default());
            writer.declare_container("EventInfoAux.", RECORD_TYPE).unwrap();
            let rows = [
                AuxRow::standalone().with(x, Value::F32(1.0)),
                AuxRow::standalone().with(x, Value::F32(2.0)).with(y, Value::I32(7)),
                AuxRow::standalone().with(x, Value::F32(3.0)),
            ];
            for (row, values) in rows.iter().enumerate() {
                writer.write_attributes("EventInfoAux.", values, row as u64).unwrap();
                writer.commit().unwrap();
            }
            outputs.close_all().unwrap();

            let reader = read(&path, "EventInfoAux.", holder_registry(), true);
            let xs: Vec<_> = (0..3).map(|row| value_at(&reader, "x", row)).collect();
            let ys: Vec<_> = (0..3).map(|row| value_at(&reader, "y", row)).collect();
            assert_eq!(xs, vec![Value::F32(1.0), Value::F32(2.0), Value::F32(3.0)]);
            assert_eq!(ys, vec![Value::I32(0), Value::I32(7), Value::I32(0)]);

            // Row 0 of y through an attached store
            let mut record = AuxRecord::standalone();
            let store = reader.attach(&mut record, 0).unwrap();
            let y_id = reader.registry().find_id("y").unwrap();
            assert_eq!(*store.get_data(y_id).unwrap().unwrap(), Value::I32(0));
        }
    }

    #[test]
    fn test_selected_without_value_writes_default() {
        let dir = TempDir::new().unwrap();
        let registry = holder_registry();
        let pt = registry.register("pt", LogicalType::F32).unwrap();

        let outputs = OutputRegistry::new();
        let (output, path) = open_output(&outputs, &dir, FileKind::Legacy);
        let mut writer = WriteBackend::new(output, Arc::clone(&registry), WriterConfig::default());
        writer.declare_container("MuonsAux.", RECORD_TYPE).unwrap();
        let mut values = AuxRow::collection();
        values.select(pt);
        writer.write_attributes("MuonsAux.", &values, 0).unwrap();
        writer.commit().unwrap();
        outputs.close_all().unwrap();

        let reader = read(&path, "MuonsAux.", holder_registry(), false);
        assert_eq!(value_at(&reader, "pt", 0), Value::List(Vec::new()));
    }

    #[test]
    fn test_unknown_type_is_configuration_error_once() {
        let dir = TempDir::new().unwrap();
        let registry = holder_registry();
        let link = registry.register("link", LogicalType::Unknown("ElementLink<X>".into())).unwrap();
        let pt = registry.register("pt", LogicalType::F32).unwrap();

        let outputs = OutputRegistry::new();
        let (output, path) = open_output(&outputs, &dir, FileKind::Native);
        let mut writer = WriteBackend::new(output, Arc::clone(&registry), WriterConfig::default());
        writer.declare_container("JetsAux.", RECORD_TYPE).unwrap();

        let values = AuxRow::collection()
            .with(link, Value::List(Vec::new()))
            .with(pt, Value::List(vec![Value::F32(4.0)]));
        let err = writer.write_attributes("JetsAux.", &values, 0).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(writer.needs_commit());
        writer.commit().unwrap();

        // Later rows drop the attribute silently
        writer.write_attributes("JetsAux.", &values, 1).unwrap();
        writer.commit().unwrap();
        assert!(writer.column("JetsAux.", link).is_none());
        outputs.close_all().unwrap();

        let reader = read(&path, "JetsAux.", holder_registry(), false);
        assert_eq!(reader.entries(), 2);
        assert_eq!(value_at(&reader, "pt", 1), Value::List(vec![Value::F32(4.0)]));
    }

    #[test]
    fn test_type_mismatch_writes_default() {
        let dir = TempDir::new().unwrap();
        let registry = holder_registry();
        let pt = registry.register("pt", LogicalType::F32).unwrap();
        let n = registry.register("n", LogicalType::I64).unwrap();

        let outputs = OutputRegistry::new();
        let (output, path) = open_output(&outputs, &dir, FileKind::Legacy);
        let mut writer = WriteBackend::new(output, Arc::clone(&registry), WriterConfig::default());
        writer.declare_container("EventInfoAux.", RECORD_TYPE).unwrap();

        let values = AuxRow::standalone()
            .with(pt, Value::String("fast".into()))
            .with(n, Value::I32(12));
        let err = writer.write_attributes("EventInfoAux.", &values, 0).unwrap_err();
        match err {
            Error::TypeMismatch { attribute, on_disk, registered } => {
                assert_eq!(attribute, "pt");
                assert_eq!(on_disk, "float");
                assert_eq!(registered, "std::string");
            }
            other => panic!("unexpected error {other}"),
        }
        writer.commit().unwrap();
        outputs.close_all().unwrap();

        let reader = read(&path, "EventInfoAux.", holder_registry(), true);
        assert_eq!(value_at(&reader, "pt", 0), Value::F32(0.0));
        // Numeric values are coerced to the column type
        assert_eq!(value_at(&reader, "n", 0), Value::I64(12));
    }

    #[test]
    fn test_packed_round_trip() {
        for kind in [FileKind::Legacy, FileKind::Native] {
            let dir = TempDir::new().unwrap();
            let registry = holder_registry();
            let eta = registry.register_packed("eta", LogicalType::F32, 16).unwrap();
            let hits = registry.register_packed("hits", LogicalType::U16, 5).unwrap();

            let outputs = OutputRegistry::new();
            let (output, path) = open_output(&outputs, &dir, kind);
            let mut writer = WriteBackend::new(output, Arc::clone(&registry), WriterConfig::default());
            writer.declare_container("TracksAux.", RECORD_TYPE).unwrap();
            let values = AuxRow::collection()
                .with(eta, Value::List(vec![Value::F32(1.5), Value::F32(-0.25)]))
                .with(hits, Value::List(vec![Value::U16(3), Value::U16(31)]));
            writer.write_attributes("TracksAux.", &values, 0).unwrap();
            writer.commit().unwrap();
            let entry = writer.column("TracksAux.", eta).unwrap();
            assert_eq!(entry.type_name, "SG::PackedContainer<float>");
            assert_eq!(entry.nbits, Some(16));
            outputs.close_all().unwrap();

            let reader = read(&path, "TracksAux.", holder_registry(), false);
            let meta = reader.resolve(reader.registry().find_id("eta").unwrap()).unwrap();
            assert!(meta.is_packed_container);
            assert!(!meta.needs_schema_evolution);
            assert_eq!(
                value_at(&reader, "eta", 0),
                Value::List(vec![Value::F32(1.5), Value::F32(-0.25)])
            );
            assert_eq!(
                value_at(&reader, "hits", 0),
                Value::List(vec![Value::U16(3), Value::U16(31)])
            );
        }
    }

    #[test]
    fn test_immediate_mode_fills_each_column() {
        let dir = TempDir::new().unwrap();
        let registry = holder_registry();
        let x = registry.register("x", LogicalType::F32).unwrap();

        let outputs = OutputRegistry::new();
        let (output, path) = open_output(&outputs, &dir, FileKind::Legacy);
        let config = WriterConfig {
            commit_mode: CommitMode::Immediate,
            ..WriterConfig::default()
        };
        let mut writer = WriteBackend::new(Arc::clone(&output), Arc::clone(&registry), config);
        assert_eq!(writer.commit_mode(), CommitMode::Immediate);
        writer.declare_container("EventInfoAux.", RECORD_TYPE).unwrap();
        for row in 0..3u64 {
            #[allow(clippy::cast_precision_loss)]
            let values = AuxRow::standalone().with(x, Value::F32(row as f32));
            writer.write_attributes("EventInfoAux.", &values, row).unwrap();
            assert!(!writer.needs_commit());
            assert_eq!(writer.commit().unwrap(), 0);
        }
        assert_eq!(output.entries(), 3);
        assert_eq!(output.fill_count(), 0);
        outputs.close_all().unwrap();

        let reader = read(&path, "EventInfoAux.", holder_registry(), true);
        assert_eq!(value_at(&reader, "x", 2), Value::F32(2.0));
    }

    #[test]
    fn test_native_ignores_immediate_mode() {
        let dir = TempDir::new().unwrap();
        let outputs = OutputRegistry::new();
        let (output, _) = open_output(&outputs, &dir, FileKind::Native);
        let config = WriterConfig {
            commit_mode: CommitMode::Immediate,
            ..WriterConfig::default()
        };
        let writer = WriteBackend::new(output, holder_registry(), config);
        assert_eq!(writer.commit_mode(), CommitMode::Batched);
    }

    #[test]
    fn test_grouped_commit() {
        for kind in [FileKind::Legacy, FileKind::Native] {
            let dir = TempDir::new().unwrap();
            let registry = holder_registry();
            let pt = registry.register("pt", LogicalType::F32).unwrap();
            let run = registry.register("run", LogicalType::U32).unwrap();

            let outputs = OutputRegistry::new();
            let (output, path) = open_output(&outputs, &dir, kind);
            let mut jets = WriteBackend::new(Arc::clone(&output), Arc::clone(&registry), WriterConfig::default());
            let mut info = WriteBackend::new(Arc::clone(&output), Arc::clone(&registry), WriterConfig::default());
            assert!(jets.is_grouped());
            assert!(info.is_grouped());
            jets.declare_container("JetsAux.", RECORD_TYPE).unwrap();
            info.declare_container("EventInfoAux.", RECORD_TYPE).unwrap();

            for row in 0..4u64 {
                #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
                let (x, r) = (row as f32, row as u32);
                let values = AuxRow::collection().with(pt, Value::List(vec![Value::F32(x)]));
                jets.write_attributes("JetsAux.", &values, row).unwrap();
                let values = AuxRow::standalone().with(run, Value::U32(r));
                info.write_attributes("EventInfoAux.", &values, row).unwrap();

                assert!(jets.commit().unwrap() > 0);
                assert_eq!(output.fill_count(), row);
                // A second commit without writes does nothing
                assert!(!jets.needs_commit());
                assert_eq!(jets.commit().unwrap(), 0);
                assert_eq!(output.fill_count(), row);

                info.commit().unwrap();
                assert_eq!(output.fill_count(), row + 1);
                assert!(!info.needs_commit());
            }
            outputs.close_all().unwrap();

            let jets_reader = read(&path, "JetsAux.", holder_registry(), false);
            assert_eq!(value_at(&jets_reader, "pt", 3), Value::List(vec![Value::F32(3.0)]));
            let info_reader = read(&path, "EventInfoAux.", jets_reader.registry().clone(), true);
            assert_eq!(value_at(&info_reader, "run", 2), Value::U32(2));
        }
    }

    #[test]
    fn test_undeclared_container() {
        let dir = TempDir::new().unwrap();
        let outputs = OutputRegistry::new();
        let (output, _) = open_output(&outputs, &dir, FileKind::Legacy);
        let mut writer = WriteBackend::new(output, holder_registry(), WriterConfig::default());
        let err = writer
            .write_attributes("MissingAux.", &AuxRow::standalone(), 0)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(!writer.needs_commit());
    }

    #[test]
    fn test_grouped_row_waits_for_every_producer() {
        for kind in [FileKind::Legacy, FileKind::Native] {
            let dir = TempDir::new().unwrap();
            let registry = holder_registry();
            let pt = registry.register("pt", LogicalType::F32).unwrap();
            let run = registry.register("run", LogicalType::U32).unwrap();

            let outputs = OutputRegistry::new();
            let (output, path) = open_output(&outputs, &dir, kind);
            let mut jets = WriteBackend::new(Arc::clone(&output), Arc::clone(&registry), WriterConfig::default());
            let mut info = WriteBackend::new(Arc::clone(&output), Arc::clone(&registry), WriterConfig::default());
            jets.declare_container("JetsAux.", RECORD_TYPE).unwrap();
            info.declare_container("EventInfoAux.", RECORD_TYPE).unwrap();
            let jet_row = |x: f32| AuxRow::collection().with(pt, Value::List(vec![Value::F32(x)]));
            let info_row = |r: u32| AuxRow::standalone().with(run, Value::U32(r));

            jets.write_attributes("JetsAux.", &jet_row(0.0), 0).unwrap();
            info.write_attributes("EventInfoAux.", &info_row(0), 0).unwrap();
            jets.commit().unwrap();
            info.commit().unwrap();
            assert_eq!(output.fill_count(), 1);

            // Row 1 of info is late: its commit without a write does not count
            jets.write_attributes("JetsAux.", &jet_row(1.0), 1).unwrap();
            jets.commit().unwrap();
            assert_eq!(info.commit().unwrap(), 0);
            assert_eq!(output.fill_count(), 1);
            assert_eq!(output.group().pending_arrivals(), 1);

            let result = jets.write_attributes("JetsAux.", &jet_row(2.0), 2);
            assert!(matches!(result, Err(Error::InvalidArgument(_))), "{kind}");
            assert!(!jets.needs_commit());

            info.write_attributes("EventInfoAux.", &info_row(1), 1).unwrap();
            info.commit().unwrap();
            assert_eq!(output.fill_count(), 2);

            jets.write_attributes("JetsAux.", &jet_row(2.0), 2).unwrap();
            info.write_attributes("EventInfoAux.", &info_row(2), 2).unwrap();
            info.commit().unwrap();
            jets.commit().unwrap();
            assert_eq!(output.fill_count(), 3);
            outputs.close_all().unwrap();

            let jets_reader = read(&path, "JetsAux.", holder_registry(), false);
            assert_eq!(jets_reader.entries(), 3);
            for row in 0..3u16 {
                let expected = Value::List(vec![Value::F32(f32::from(row))]);
                assert_eq!(value_at(&jets_reader, "pt", row.into()), expected, "{kind} row {row}");
            }
            let info_reader = read(&path, "EventInfoAux.", jets_reader.registry().clone(), true);
            assert_eq!(value_at(&info_reader, "run", 1), Value::U32(1));
            assert_eq!(value_at(&info_reader, "run", 2), Value::U32(2));
        }
    }

    /// Records the columns put to, failing one chosen put
    #[derive(Default)]
    struct RecordingSink {
        columns: u32,
        puts: Vec<ColumnHandle>,
        fail_at: Option<usize>,
    }

    impl ColumnSink for RecordingSink {
        fn entries(&self) -> u64 {
            0
        }

        fn create_column(&mut self, _column: &NewColumn<'_>, _rows_written: u64) -> Result<ColumnHandle> {
            let handle = ColumnHandle::new(self.columns);
            self.columns += 1;
            Ok(handle)
        }

        fn put(&mut self, handle: ColumnHandle, data: Bytes) -> Result<usize> {
            if self.fail_at == Some(self.puts.len()) {
                self.fail_at = None;
                return Err(Error::Io(std::io::Error::other("disk full")));
            }
            self.puts.push(handle);
            Ok(data.len())
        }
    }

    #[test]
    fn test_failed_put_leaves_row_state_clean() {
        let dir = TempDir::new().unwrap();
        let registry = holder_registry();
        let x = registry.register("x", LogicalType::F32).unwrap();
        let y = registry.register("y", LogicalType::I32).unwrap();

        let outputs = OutputRegistry::new();
        let (output, _) = open_output(&outputs, &dir, FileKind::Legacy);
        let mut core = WriterCore::new(output, Arc::clone(&registry), WriterConfig::default());
        let mut sink = RecordingSink::default();
        core.declare_container(&mut sink, "EventInfoAux.", RECORD_TYPE).unwrap();

        let both = AuxRow::standalone().with(x, Value::F32(1.0)).with(y, Value::I32(2));
        core.write_row(&mut sink, "EventInfoAux.", &both, 0, true).unwrap();
        let x_handle = core.column("EventInfoAux.", x).unwrap().handle;
        let y_handle = core.column("EventInfoAux.", y).unwrap().handle;

        // Base and x succeed, y fails
        sink.puts.clear();
        sink.fail_at = Some(2);
        let result = core.write_row(&mut sink, "EventInfoAux.", &both, 1, true);
        assert!(matches!(result, Err(Error::Io(_))));
        let columns = &core.containers["EventInfoAux."].columns;
        assert!(columns.values().all(|entry| !entry.written_this_row));
        assert!(columns.values().all(|entry| entry.rows_written == 1));

        // The retried row still gives x its default
        sink.puts.clear();
        let only_y = AuxRow::standalone().with(y, Value::I32(3));
        core.write_row(&mut sink, "EventInfoAux.", &only_y, 1, true).unwrap();
        assert!(sink.puts.contains(&x_handle));
        assert!(sink.puts.contains(&y_handle));
        assert_eq!(sink.puts.len(), 3);
        assert_eq!(core.column("EventInfoAux.", x).unwrap().rows_written, 2);
    }
}
