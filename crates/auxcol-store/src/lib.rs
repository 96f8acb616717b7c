//! auxcol Store - Dynamic attribute access
//!
//! This crate serves the dynamic attributes of records stored in auxcol
//! column files:
//! - [`AttributeRegistry`]: attribute names, ids and runtime types
//! - [`ReadBackend`]: discovers and resolves the attribute columns of one
//!   base column and decodes single rows
//! - [`AttributeStore`]: per-row lazy cache with decorations
//! - [`WriteBackend`]: writes selected attributes row by row, creating
//!   columns on first use and backfilling defaults

pub mod reader;
pub mod record;
pub mod registry;
pub mod store;
pub mod writer;

pub use reader::{ColumnMetadata, ColumnStatus, ReadBackend};
pub use record::{AuxHolder, AuxRecord, AuxRow, AuxStoreIo};
pub use registry::AttributeRegistry;
pub use store::{AttributeStore, IoLock, new_io_lock};
pub use writer::{Arrival, CommitGroup, OutputRegistry, SharedOutput, WriteBackend, WriterColumnEntry};
