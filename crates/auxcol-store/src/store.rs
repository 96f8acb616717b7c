//! Attribute store
//!
//! One store serves the dynamic attributes of one row of one container.
//! Values are decoded on first request and cached for the life of the
//! store; failed lookups are cached too. Cache hits take no lock beyond the
//! cache's own read lock. Misses take the shared I/O lock (if any) and a
//! per-store fill lock, so each attribute is resolved and materialized at
//! most once per store.
//!
//! Attributes that have no column in the file may be declared as
//! decorations and set in memory. Mutating any other attribute fails with
//! [`Error::StoreLocked`].

use crate::reader::{ReadBackend, memory_type};
use auxcol_common::{AttributeId, AttributeSet, Error, LogicalType, Result, Value};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Lock shared by all stores reading one file.
///
/// Re-entrant: resolution may touch structures guarded by the same lock.
pub type IoLock = Arc<ReentrantMutex<()>>;

/// Create a new shared I/O lock
#[must_use]
pub fn new_io_lock() -> IoLock {
    Arc::new(ReentrantMutex::new(()))
}

#[derive(Debug, Default)]
struct Decorations {
    ids: AttributeSet,
    values: HashMap<AttributeId, Arc<Value>>,
}

/// Lazily materialized attributes of one container row
pub struct AttributeStore {
    backend: Arc<ReadBackend>,
    row: u64,
    standalone: bool,
    io_lock: Option<IoLock>,
    fill_lock: Mutex<()>,
    cache: RwLock<HashMap<AttributeId, Option<Arc<Value>>>>,
    decorations: RwLock<Decorations>,
    size: Mutex<Option<usize>>,
}

impl AttributeStore {
    pub(crate) fn new(
        backend: Arc<ReadBackend>,
        row: u64,
        standalone: bool,
        io_lock: Option<IoLock>,
    ) -> Self {
        Self {
            backend,
            row,
            standalone,
            io_lock,
            fill_lock: Mutex::new(()),
            cache: RwLock::new(HashMap::new()),
            decorations: RwLock::new(Decorations::default()),
            size: Mutex::new(None),
        }
    }

    /// Row served by this store
    #[must_use]
    pub const fn row(&self) -> u64 {
        self.row
    }

    /// True for a standalone object, false for a collection
    #[must_use]
    pub const fn is_standalone(&self) -> bool {
        self.standalone
    }

    /// The backend values are read from
    #[must_use]
    pub const fn backend(&self) -> &Arc<ReadBackend> {
        &self.backend
    }

    /// Value of an attribute, or `None` if this row has none
    pub fn get_data(&self, id: AttributeId) -> Result<Option<Arc<Value>>> {
        if let Some(value) = self.decorations.read().values.get(&id) {
            return Ok(Some(Arc::clone(value)));
        }
        if let Some(cached) = self.cache.read().get(&id) {
            return Ok(cached.clone());
        }

        let _io = self.io_lock.as_ref().map(|lock| lock.lock());
        let _fill = self.fill_lock.lock();
        if let Some(cached) = self.cache.read().get(&id) {
            return Ok(cached.clone());
        }

        let value = self
            .backend
            .materialize(id, self.row)?
            .map(|(value, bytes)| {
                debug!("Materialized attribute {} of row {} ({} bytes)", id, self.row, bytes);
                Arc::new(value)
            });
        self.cache.write().insert(id, value.clone());
        Ok(value)
    }

    /// True if the attribute was already looked up
    #[must_use]
    pub fn is_cached(&self, id: AttributeId) -> bool {
        self.cache.read().contains_key(&id)
    }

    fn attribute_name(&self, id: AttributeId) -> String {
        self.backend
            .registry()
            .name_of(id)
            .unwrap_or_else(|| format!("#{id}"))
    }

    fn memory_type(&self, id: AttributeId) -> Result<LogicalType> {
        memory_type(self.backend.registry(), id, self.standalone)
            .ok_or_else(|| Error::type_error(format!("#{id}"), "attribute is not registered"))
    }

    /// Declare an attribute that is added in memory rather than read.
    ///
    /// Fails with [`Error::StoreLocked`] if the file has a column for it.
    pub fn declare_decoration(&self, id: AttributeId) -> Result<()> {
        if self.backend.has_column(id)? {
            return Err(Error::StoreLocked {
                attribute: self.attribute_name(id),
            });
        }
        if self.decorations.write().ids.insert(id) {
            debug!("Declared decoration {} on row {}", self.attribute_name(id), self.row);
        }
        Ok(())
    }

    /// True if the attribute was declared as a decoration
    #[must_use]
    pub fn is_decoration(&self, id: AttributeId) -> bool {
        self.decorations.read().ids.contains(id)
    }

    fn check_decoration(&self, id: AttributeId) -> Result<()> {
        if self.is_decoration(id) {
            Ok(())
        } else {
            Err(Error::StoreLocked {
                attribute: self.attribute_name(id),
            })
        }
    }

    /// Set the value of a decoration
    pub fn set_decoration(&self, id: AttributeId, value: Value) -> Result<()> {
        self.check_decoration(id)?;
        let expected = self.memory_type(id)?;
        let value = if value.conforms_to(&expected) {
            value
        } else {
            value.coerce_to(&expected).ok_or_else(|| {
                Error::type_error(self.attribute_name(id), format!("value {value} is not a {expected}"))
            })?
        };
        self.decorations.write().values.insert(id, Arc::new(value));
        Ok(())
    }

    /// Mutate a decoration in place, starting from its default value
    pub fn get_writable<R>(&self, id: AttributeId, f: impl FnOnce(&mut Value) -> R) -> Result<R> {
        self.check_decoration(id)?;
        let expected = self.memory_type(id)?;
        let default = expected
            .default_value()
            .ok_or_else(|| Error::type_error(self.attribute_name(id), "type has no default value"))?;

        let mut decorations = self.decorations.write();
        let slot = decorations
            .values
            .entry(id)
            .or_insert_with(|| Arc::new(default));
        Ok(f(Arc::make_mut(slot)))
    }

    /// Number of elements of the container row.
    ///
    /// Found by decoding any one attribute: 1 for a standalone object, the
    /// list length for a collection, 0 if nothing decodes.
    pub fn size(&self) -> Result<usize> {
        if let Some(size) = *self.size.lock() {
            return Ok(size);
        }

        let mut size = 0;
        for id in self.backend.attribute_ids().iter() {
            match self.get_data(id) {
                Ok(Some(value)) => {
                    size = if self.standalone { 1 } else { value.len() };
                    break;
                }
                Ok(None) | Err(Error::TypeError { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        *self.size.lock() = Some(size);
        Ok(size)
    }

    /// Attributes read from the file plus declared decorations
    #[must_use]
    pub fn attribute_ids(&self) -> AttributeSet {
        let mut ids = self.backend.attribute_ids();
        ids.extend(&self.decorations.read().ids);
        ids
    }
}
