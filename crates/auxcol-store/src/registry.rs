//! Attribute registry
//!
//! Maps attribute names to stable [`AttributeId`]s and their runtime
//! [`LogicalType`]. Constructed once per run and shared by every reader,
//! writer and store through an `Arc`.
//!
//! For attributes of collection members the registered type is the type of
//! one element; the column holds a vector of it. Standalone attributes
//! register the type of the whole value.

use auxcol_common::{AttributeId, Error, LogicalType, PackingHint, Result};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct AttributeEntry {
    name: String,
    ty: LogicalType,
    packing: Option<PackingHint>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    entries: Vec<AttributeEntry>,
    by_name: HashMap<String, AttributeId>,
    /// `"<key>.<name on file>"` -> name in memory
    renames: HashMap<String, String>,
    holder_types: HashSet<String>,
}

/// Registry of dynamic attributes
#[derive(Debug, Default)]
pub struct AttributeRegistry {
    inner: RwLock<RegistryInner>,
}

/// Check that `name` is an identifier: `[A-Za-z_][A-Za-z0-9_]*`
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl AttributeRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an attribute, or return its id if it is already registered
    /// with the same type.
    pub fn register(&self, name: &str, ty: LogicalType) -> Result<AttributeId> {
        if !is_valid_name(name) {
            return Err(Error::invalid_argument(format!("invalid attribute name: {name:?}")));
        }
        self.register_unchecked(name, ty)
    }

    /// Register a vector attribute whose values are written with the packed
    /// encoding at `nbits` bits per element.
    pub fn register_packed(&self, name: &str, element: LogicalType, nbits: u8) -> Result<AttributeId> {
        let hint = PackingHint::new(nbits);
        if !hint.is_valid_for(&element) {
            return Err(Error::invalid_argument(format!(
                "bit width {nbits} is not valid for packed {element}"
            )));
        }

        let id = self.register(name, element)?;
        let mut inner = self.inner.write();
        let entry = &mut inner.entries[id.index()];
        match entry.packing {
            Some(existing) if existing != hint => Err(Error::invalid_argument(format!(
                "attribute {name} is already packed with {} bits",
                existing.nbits
            ))),
            _ => {
                entry.packing = Some(hint);
                Ok(id)
            }
        }
    }

    /// Register without name validation, for names taken from file columns
    fn register_unchecked(&self, name: &str, ty: LogicalType) -> Result<AttributeId> {
        let mut inner = self.inner.write();
        if let Some(&id) = inner.by_name.get(name) {
            let existing = &inner.entries[id.index()].ty;
            if *existing != ty {
                return Err(Error::TypeMismatch {
                    attribute: name.to_string(),
                    on_disk: ty.type_name(),
                    registered: existing.type_name(),
                });
            }
            return Ok(id);
        }

        let raw = u32::try_from(inner.entries.len())
            .map_err(|_| Error::invalid_argument("attribute registry is full"))?;
        let id = AttributeId::new(raw);
        debug!("Registered attribute {} as {} ({})", id, name, ty);
        inner.entries.push(AttributeEntry {
            name: name.to_string(),
            ty,
            packing: None,
        });
        inner.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    /// Look up an attribute by name
    #[must_use]
    pub fn find_id(&self, name: &str) -> Option<AttributeId> {
        self.inner.read().by_name.get(name).copied()
    }

    /// Id for an attribute found in a file column.
    ///
    /// Returns the existing id if `name` is registered; type differences are
    /// detected later, when the column is resolved. Otherwise the runtime
    /// type is derived from the column type and registered: standalone
    /// attributes take the column type, collection attributes the element
    /// type of a vector column. Returns `None` when no runtime type can be
    /// derived.
    pub fn id_for(&self, name: &str, on_disk: &LogicalType, standalone: bool) -> Option<AttributeId> {
        if let Some(id) = self.find_id(name) {
            return Some(id);
        }

        let ty = if standalone {
            on_disk.unpacked()
        } else {
            on_disk.element()?.clone()
        };
        if ty.contains_unknown() {
            return None;
        }

        match self.register_unchecked(name, ty) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Failed to register attribute {} from file: {}", name, e);
                None
            }
        }
    }

    /// Name of an attribute
    #[must_use]
    pub fn name_of(&self, id: AttributeId) -> Option<String> {
        self.inner.read().entries.get(id.index()).map(|e| e.name.clone())
    }

    /// Runtime type of an attribute
    #[must_use]
    pub fn type_of(&self, id: AttributeId) -> Option<LogicalType> {
        self.inner.read().entries.get(id.index()).map(|e| e.ty.clone())
    }

    /// Packing requested for an attribute
    #[must_use]
    pub fn packing_of(&self, id: AttributeId) -> Option<PackingHint> {
        self.inner.read().entries.get(id.index()).and_then(|e| e.packing)
    }

    /// Number of registered attributes
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// True if nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the input rename table.
    ///
    /// Keys and values have the form `"<key>.<attribute>"`. Entries without a
    /// `.` or with nothing after it are ignored.
    pub fn set_input_rename_map<I, K, V>(&self, map: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut renames = HashMap::new();
        for (from, to) in map {
            let (from, to) = (from.as_ref(), to.as_ref());
            let target = to.split_once('.').map(|(_, attr)| attr);
            match target {
                Some(attr) if !attr.is_empty() && from.contains('.') && !from.ends_with('.') => {
                    renames.insert(from.to_string(), attr.to_string());
                }
                _ => warn!("Ignoring malformed input rename {} -> {}", from, to),
            }
        }
        debug!("Loaded {} input renames", renames.len());
        self.inner.write().renames = renames;
    }

    /// Name attribute `name` of container `key` is known by in memory
    #[must_use]
    pub fn input_rename(&self, key: &str, name: &str) -> String {
        let inner = self.inner.read();
        if inner.renames.is_empty() {
            return name.to_string();
        }
        inner
            .renames
            .get(&format!("{key}.{name}"))
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    /// Declare that records of `type_name` can hold dynamic attributes
    pub fn declare_holder_type(&self, type_name: &str) {
        self.inner.write().holder_types.insert(type_name.to_string());
    }

    /// Check whether records of `type_name` can hold dynamic attributes
    #[must_use]
    pub fn is_holder_type(&self, type_name: &str) -> bool {
        self.inner.read().holder_types.contains(type_name)
    }
}
