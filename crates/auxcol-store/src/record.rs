//! Record contracts
//!
//! The read side attaches an [`AttributeStore`] to every decoded record that
//! holds dynamic attributes ([`AuxHolder`]). The write side pulls the values
//! of one row from an [`AuxStoreIo`] source.

use crate::store::AttributeStore;
use auxcol_common::{AttributeId, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A decoded record that can carry dynamic attributes
pub trait AuxHolder {
    /// Attach the store serving this record's attributes
    fn attach_store(&mut self, store: Arc<AttributeStore>);

    /// True for a standalone object, false for a member of a collection.
    ///
    /// Decides whether a vector column holds one value per record or one
    /// element per collection member.
    fn is_standalone(&self) -> bool;
}

/// Source of the attribute values of one row on the write side
pub trait AuxStoreIo {
    /// Attributes selected for writing, in write order
    fn selected_ids(&self) -> Vec<AttributeId>;

    /// Value of a selected attribute for this row, if one was set
    fn io_data(&self, id: AttributeId) -> Option<&Value>;

    /// True for a standalone object, false for a collection
    fn is_standalone(&self) -> bool;
}

/// Minimal attribute holder
#[derive(Default)]
pub struct AuxRecord {
    standalone: bool,
    store: Option<Arc<AttributeStore>>,
}

impl AuxRecord {
    /// A standalone object
    #[must_use]
    pub const fn standalone() -> Self {
        Self {
            standalone: true,
            store: None,
        }
    }

    /// A collection of records sharing one store
    #[must_use]
    pub const fn collection() -> Self {
        Self {
            standalone: false,
            store: None,
        }
    }

    /// The attached store
    #[must_use]
    pub const fn store(&self) -> Option<&Arc<AttributeStore>> {
        self.store.as_ref()
    }
}

impl AuxHolder for AuxRecord {
    fn attach_store(&mut self, store: Arc<AttributeStore>) {
        self.store = Some(store);
    }

    fn is_standalone(&self) -> bool {
        self.standalone
    }
}

/// Attribute values of one row to be written.
///
/// Attributes may be selected without a value; the writer then stores the
/// default for this row.
#[derive(Clone, Debug, Default)]
pub struct AuxRow {
    standalone: bool,
    selected: Vec<AttributeId>,
    values: BTreeMap<AttributeId, Value>,
}

impl AuxRow {
    /// Row of a standalone object
    #[must_use]
    pub fn standalone() -> Self {
        Self {
            standalone: true,
            ..Self::default()
        }
    }

    /// Row of a collection; list values hold one element per member
    #[must_use]
    pub fn collection() -> Self {
        Self::default()
    }

    /// Select an attribute and set its value
    pub fn set(&mut self, id: AttributeId, value: Value) -> &mut Self {
        self.select(id);
        self.values.insert(id, value);
        self
    }

    /// Builder form of [`AuxRow::set`]
    #[must_use]
    pub fn with(mut self, id: AttributeId, value: Value) -> Self {
        self.set(id, value);
        self
    }

    /// Select an attribute without a value
    pub fn select(&mut self, id: AttributeId) -> &mut Self {
        if !self.selected.contains(&id) {
            self.selected.push(id);
        }
        self
    }

    /// Drop all values and selections
    pub fn clear(&mut self) {
        self.selected.clear();
        self.values.clear();
    }
}

impl AuxStoreIo for AuxRow {
    fn selected_ids(&self) -> Vec<AttributeId> {
        self.selected.clone()
    }

    fn io_data(&self, id: AttributeId) -> Option<&Value> {
        self.values.get(&id)
    }

    fn is_standalone(&self) -> bool {
        self.standalone
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aux_row_selection() {
        let a = AttributeId::new(0);
        let b = AttributeId::new(1);
        let mut row = AuxRow::collection();
        row.set(b, Value::List(vec![Value::F32(1.0)]));
        row.select(a);
        row.set(b, Value::List(vec![Value::F32(2.0)]));

        assert_eq!(row.selected_ids(), vec![b, a]);
        assert_eq!(row.io_data(a), None);
        assert_eq!(row.io_data(b), Some(&Value::List(vec![Value::F32(2.0)])));
        assert!(!row.is_standalone());

        row.clear();
        assert!(row.selected_ids().is_empty());
    }

    #[test]
    fn test_record_modes() {
        assert!(AuxRecord::standalone().is_standalone());
        assert!(!AuxRecord::collection().is_standalone());
        assert!(AuxRecord::collection().store().is_none());
    }
}
