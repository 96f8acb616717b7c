//! Read backends
//!
//! A read backend serves the attribute columns of one base column. It
//! discovers the attribute columns next to the base column once, resolves
//! each attribute against its registered type on first use, and decodes
//! single rows on request. Only [`ReadBackend::materialize`] performs I/O.
//!
//! # Backends
//!
//! - `legacy`: tree files, one branch per attribute
//! - `native`: ntuple files, one field per attribute, cluster prefetch

pub mod legacy;
pub mod native;

pub use legacy::LegacyColumnReader;
pub use native::NativeColumnReader;

use crate::record::AuxHolder;
use crate::registry::AttributeRegistry;
use crate::store::{AttributeStore, IoLock, new_io_lock};
use auxcol_common::{AttributeId, AttributeSet, Error, LogicalType, ReaderConfig, Result, Value, naming};
use auxcol_format::{ColumnDesc, ColumnHandle, DecodeOptions, FileKind, NTupleReader, TreeReader, codec};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// Resolution state of one attribute on one reader
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ColumnStatus {
    #[default]
    NotInitialized,
    /// Column found and decodable into the registered type
    Initialized,
    /// No usable column in this file
    NotFound,
    /// Column found but not decodable into the registered type
    TypeError,
}

impl std::fmt::Display for ColumnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotInitialized => f.write_str("not initialized"),
            Self::Initialized => f.write_str("initialized"),
            Self::NotFound => f.write_str("not found"),
            Self::TypeError => f.write_str("type error"),
        }
    }
}

/// Decoding metadata of one attribute, fixed once resolved
#[derive(Clone, Debug)]
pub struct ColumnMetadata {
    pub id: AttributeId,
    /// Registered attribute name
    pub name: String,
    /// Physical column, if one was found
    pub column: Option<ColumnHandle>,
    pub column_name: Option<String>,
    /// Type of the physical column
    pub on_disk: Option<LogicalType>,
    /// Shape of the decoded value: the registered type for standalone
    /// records, a vector of it for collections
    pub memory_type: Option<LogicalType>,
    pub needs_schema_evolution: bool,
    pub is_packed_container: bool,
    pub decode: DecodeOptions,
    pub status: ColumnStatus,
    /// Why the attribute is not available
    pub reason: Option<String>,
}

impl ColumnMetadata {
    fn new(id: AttributeId, name: String) -> Self {
        Self {
            id,
            name,
            column: None,
            column_name: None,
            on_disk: None,
            memory_type: None,
            needs_schema_evolution: false,
            is_packed_container: false,
            decode: DecodeOptions::plain(),
            status: ColumnStatus::NotInitialized,
            reason: None,
        }
    }

    fn not_found(mut self, reason: impl Into<String>) -> Self {
        self.status = ColumnStatus::NotFound;
        self.reason = Some(reason.into());
        self
    }

    fn type_error(mut self, reason: impl Into<String>) -> Self {
        self.status = ColumnStatus::TypeError;
        self.reason = Some(reason.into());
        self
    }

    /// True if the attribute can be materialized
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.status == ColumnStatus::Initialized
    }
}

/// In-memory shape of attribute `id` for records of the given mode
pub(crate) fn memory_type(
    registry: &AttributeRegistry,
    id: AttributeId,
    standalone: bool,
) -> Option<LogicalType> {
    let ty = registry.type_of(id)?;
    Some(if standalone {
        ty
    } else {
        LogicalType::Vector(Box::new(ty))
    })
}

/// One attribute column found next to the base column
#[derive(Debug)]
struct DiscoveredColumn {
    handle: ColumnHandle,
    column_name: String,
    on_disk: LogicalType,
    nbits: Option<u8>,
}

#[derive(Debug)]
struct Discovery {
    standalone: bool,
    columns: HashMap<AttributeId, DiscoveredColumn>,
    ids: AttributeSet,
}

/// Discovery and resolution shared by both backends
pub(crate) struct ReaderCore {
    base_name: String,
    /// Container key for input renames
    key: String,
    registry: Arc<AttributeRegistry>,
    discovery: OnceLock<Discovery>,
    metadata: RwLock<HashMap<AttributeId, Arc<ColumnMetadata>>>,
    bytes_read: AtomicU64,
    io_lock: Option<IoLock>,
}

impl ReaderCore {
    fn new(
        base_name: &str,
        record_type: &str,
        registry: Arc<AttributeRegistry>,
        config: &ReaderConfig,
        io_lock: Option<IoLock>,
    ) -> Result<Self> {
        if !registry.is_holder_type(record_type) {
            return Err(Error::configuration(format!(
                "records of type {record_type} in {base_name} cannot hold dynamic attributes"
            )));
        }
        if !config.input_renames.is_empty() {
            registry.set_input_rename_map(&config.input_renames);
        }

        Ok(Self {
            base_name: base_name.to_string(),
            key: naming::container_key(base_name).to_string(),
            registry,
            discovery: OnceLock::new(),
            metadata: RwLock::new(HashMap::new()),
            bytes_read: AtomicU64::new(0),
            io_lock,
        })
    }

    fn discover(&self, standalone: bool, columns: impl FnOnce() -> Vec<(ColumnHandle, ColumnDesc)>) {
        let discovery = self.discovery.get_or_init(|| {
            let mut found = Discovery {
                standalone,
                columns: HashMap::new(),
                ids: AttributeSet::new(),
            };

            for (handle, desc) in columns() {
                let Some(attr) = naming::attribute_from_column(&desc.name, &self.base_name) else {
                    continue;
                };
                let name = self.registry.input_rename(&self.key, attr);
                let on_disk = LogicalType::parse(&desc.type_name);
                let Some(id) = self.registry.id_for(&name, &on_disk, standalone) else {
                    warn!(
                        "Skipping column {}: no attribute type for {}",
                        desc.name, desc.type_name
                    );
                    continue;
                };
                if name != attr {
                    debug!("Column {} read as attribute {}", desc.name, name);
                }
                found.ids.insert(id);
                found.columns.insert(
                    id,
                    DiscoveredColumn {
                        handle,
                        column_name: desc.name,
                        on_disk,
                        nbits: desc.nbits,
                    },
                );
            }

            info!(
                "Discovered {} attribute columns for {}",
                found.columns.len(),
                self.base_name
            );
            found
        });

        if discovery.standalone != standalone {
            warn!(
                "Columns of {} were discovered for {} records, ignoring later request for {} records",
                self.base_name,
                mode_name(discovery.standalone),
                mode_name(standalone)
            );
        }
    }

    fn resolve(&self, id: AttributeId) -> Result<Arc<ColumnMetadata>> {
        if let Some(meta) = self.metadata.read().get(&id) {
            return Ok(meta.clone());
        }

        let discovery = self.discovery.get().ok_or_else(|| {
            Error::invalid_argument(format!(
                "attribute columns of {} have not been discovered",
                self.base_name
            ))
        })?;
        let meta = Arc::new(self.build_metadata(id, discovery));
        match meta.status {
            ColumnStatus::Initialized => debug!(
                "Resolved attribute {} of {} (evolution: {}, packed: {})",
                meta.name, self.base_name, meta.needs_schema_evolution, meta.is_packed_container
            ),
            status => debug!(
                "Attribute {} of {} is unavailable ({}): {}",
                meta.name,
                self.base_name,
                status,
                meta.reason.as_deref().unwrap_or_default()
            ),
        }

        Ok(self.metadata.write().entry(id).or_insert(meta).clone())
    }

    fn build_metadata(&self, id: AttributeId, discovery: &Discovery) -> ColumnMetadata {
        let Some(name) = self.registry.name_of(id) else {
            return ColumnMetadata::new(id, format!("#{id}")).not_found("unregistered attribute id");
        };
        let meta = ColumnMetadata::new(id, name);

        // A renamed attribute never resolves under its old name
        let renamed = self.registry.input_rename(&self.key, &meta.name);
        if renamed != meta.name {
            return meta.not_found(format!("read from file as {renamed}"));
        }

        let Some(column) = discovery.columns.get(&id) else {
            return meta.not_found("no column in this file");
        };
        let mut meta = ColumnMetadata {
            column: Some(column.handle),
            column_name: Some(column.column_name.clone()),
            on_disk: Some(column.on_disk.clone()),
            ..meta
        };

        if column.on_disk.contains_unknown() {
            return meta.type_error(format!("column type {} has no runtime mapping", column.on_disk));
        }
        let Some(expected) = memory_type(&self.registry, id, discovery.standalone)
            .filter(|ty| !ty.contains_unknown())
        else {
            return meta.type_error("registered type has no runtime mapping");
        };
        meta.memory_type = Some(expected.clone());

        if column.on_disk.is_packed() {
            let Some(nbits) = column.nbits else {
                return meta.type_error("packed column has no bit width");
            };
            meta.is_packed_container = true;
            meta.decode.packed_nbits = Some(nbits);
        }

        if column.on_disk.unpacked() != expected {
            if !column.on_disk.can_evolve_to(&expected) {
                let reason = format!("no conversion from {} to {}", column.on_disk, expected);
                return meta.type_error(reason);
            }
            debug!(
                "{}, reading with schema evolution",
                Error::TypeMismatch {
                    attribute: meta.name.clone(),
                    on_disk: column.on_disk.type_name(),
                    registered: expected.type_name(),
                }
            );
            meta.needs_schema_evolution = true;
            meta.decode.evolve_to = Some(expected);
        }

        meta.status = ColumnStatus::Initialized;
        meta
    }

    fn decode(&self, meta: &ColumnMetadata, raw: Option<Bytes>) -> Result<Option<(Value, usize)>> {
        let Some(raw) = raw else {
            // Row precedes the first entry of a deferred column
            return Ok(meta
                .memory_type
                .as_ref()
                .and_then(LogicalType::default_value)
                .map(|value| (value, 0)));
        };
        let on_disk = meta
            .on_disk
            .as_ref()
            .ok_or_else(|| Error::format(format!("attribute {} has no column type", meta.name)))?;

        let value = codec::decode(&raw, on_disk, &meta.decode).map_err(|e| match e {
            Error::TypeError { reason, .. } => Error::type_error(meta.name.clone(), reason),
            other => other,
        })?;
        self.bytes_read.fetch_add(raw.len() as u64, Ordering::Relaxed);
        Ok(Some((value, raw.len())))
    }

    fn attribute_ids(&self) -> AttributeSet {
        self.discovery
            .get()
            .map(|d| d.ids.clone())
            .unwrap_or_default()
    }
}

const fn mode_name(standalone: bool) -> &'static str {
    if standalone { "standalone" } else { "collection" }
}

/// Read backend of one base column
pub enum ReadBackend {
    Legacy(LegacyColumnReader),
    Native(NativeColumnReader),
}

impl ReadBackend {
    /// Serve the attributes of `base_name` in a legacy tree.
    ///
    /// Backends reading the same tree should be given the same `io_lock`.
    pub fn legacy(
        tree: Arc<TreeReader>,
        base_name: &str,
        registry: Arc<AttributeRegistry>,
        config: &ReaderConfig,
        io_lock: Option<IoLock>,
    ) -> Result<Self> {
        LegacyColumnReader::new(tree, base_name, registry, config, io_lock).map(Self::Legacy)
    }

    /// Serve the attributes of `base_name` in a native ntuple.
    ///
    /// Backends reading the same ntuple should be given the same `io_lock`.
    pub fn native(
        ntuple: Arc<NTupleReader>,
        base_name: &str,
        registry: Arc<AttributeRegistry>,
        config: &ReaderConfig,
        io_lock: Option<IoLock>,
    ) -> Result<Self> {
        NativeColumnReader::new(ntuple, base_name, registry, config, io_lock).map(Self::Native)
    }

    /// Open a column file of either layout and serve `base_name` from it
    pub fn open(
        path: impl AsRef<Path>,
        base_name: &str,
        registry: Arc<AttributeRegistry>,
        config: &ReaderConfig,
    ) -> Result<Self> {
        let path = path.as_ref();
        let io_lock = config.shared_io_lock.then(new_io_lock);
        match FileKind::detect(path)? {
            FileKind::Legacy => {
                let tree = Arc::new(TreeReader::open(path)?);
                Self::legacy(tree, base_name, registry, config, io_lock)
            }
            FileKind::Native => {
                let ntuple = Arc::new(NTupleReader::open_with_prefetch(
                    path,
                    config.prefetch_clusters,
                )?);
                Self::native(ntuple, base_name, registry, config, io_lock)
            }
        }
    }

    /// Share one I/O lock with other backends reading the same file
    #[must_use]
    pub fn with_io_lock(mut self, lock: Option<IoLock>) -> Self {
        match &mut self {
            Self::Legacy(r) => r.core.io_lock = lock,
            Self::Native(r) => r.core.io_lock = lock,
        }
        self
    }

    const fn core(&self) -> &ReaderCore {
        match self {
            Self::Legacy(r) => &r.core,
            Self::Native(r) => &r.core,
        }
    }

    /// Physical layout served
    #[must_use]
    pub const fn kind(&self) -> FileKind {
        match self {
            Self::Legacy(_) => FileKind::Legacy,
            Self::Native(_) => FileKind::Native,
        }
    }

    /// Base column name
    #[must_use]
    pub fn base_name(&self) -> &str {
        &self.core().base_name
    }

    /// Registry the backend resolves against
    #[must_use]
    pub fn registry(&self) -> &Arc<AttributeRegistry> {
        &self.core().registry
    }

    /// I/O lock handed to attached stores
    #[must_use]
    pub fn io_lock(&self) -> Option<IoLock> {
        self.core().io_lock.clone()
    }

    /// Rows in the base column
    #[must_use]
    pub fn entries(&self) -> u64 {
        match self {
            Self::Legacy(r) => r.entries(),
            Self::Native(r) => r.entries(),
        }
    }

    /// Find the attribute columns of the base column.
    ///
    /// Runs once; the record mode of the first call is kept.
    pub fn discover(&self, standalone: bool) {
        match self {
            Self::Legacy(r) => r.core.discover(standalone, || r.columns()),
            Self::Native(r) => r.core.discover(standalone, || r.columns()),
        }
    }

    /// True once discovery ran
    #[must_use]
    pub fn is_discovered(&self) -> bool {
        self.core().discovery.get().is_some()
    }

    /// Attach a store for `row` to a freshly decoded record
    pub fn attach(self: &Arc<Self>, record: &mut dyn AuxHolder, row: u64) -> Result<Arc<AttributeStore>> {
        let standalone = record.is_standalone();
        if row >= self.entries() {
            return Err(Error::invalid_argument(format!(
                "row {} out of range for {} ({} rows)",
                row,
                self.base_name(),
                self.entries()
            )));
        }

        self.discover(standalone);
        let store = Arc::new(AttributeStore::new(
            Arc::clone(self),
            row,
            standalone,
            self.io_lock(),
        ));
        record.attach_store(Arc::clone(&store));
        Ok(store)
    }

    /// Decoding metadata of an attribute, resolved on first use
    pub fn resolve(&self, id: AttributeId) -> Result<Arc<ColumnMetadata>> {
        self.core().resolve(id)
    }

    /// True if the attribute has a physical column in this file
    pub fn has_column(&self, id: AttributeId) -> Result<bool> {
        Ok(self.resolve(id)?.column.is_some())
    }

    /// Read and decode one row of an attribute.
    ///
    /// Returns the value and the number of bytes decoded, or `None` if the
    /// attribute has no usable column.
    pub fn materialize(&self, id: AttributeId, row: u64) -> Result<Option<(Value, usize)>> {
        let meta = self.resolve(id)?;
        match meta.status {
            ColumnStatus::Initialized => {}
            ColumnStatus::TypeError => {
                return Err(Error::type_error(
                    meta.name.clone(),
                    meta.reason.clone().unwrap_or_default(),
                ));
            }
            ColumnStatus::NotFound | ColumnStatus::NotInitialized => return Ok(None),
        }

        let handle = meta
            .column
            .ok_or_else(|| Error::format(format!("attribute {} has no column", meta.name)))?;
        let raw = match self {
            Self::Legacy(r) => r.read_raw(handle, row)?,
            Self::Native(r) => r.read_raw(handle, row)?,
        };
        self.core().decode(&meta, raw)
    }

    /// Attributes with a column next to the base column
    #[must_use]
    pub fn attribute_ids(&self) -> AttributeSet {
        self.core().attribute_ids()
    }

    /// Bytes decoded by this backend
    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.core().bytes_read.load(Ordering::Relaxed)
    }

    /// Reset the decoded byte counter
    pub fn reset_bytes_read(&self) {
        self.core().bytes_read.store(0, Ordering::Relaxed);
    }
}
