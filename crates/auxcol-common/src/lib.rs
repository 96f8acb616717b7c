//! auxcol Common - Shared types and utilities
//!
//! This crate provides the logical type model, column naming convention,
//! error definitions, configuration and checksum helpers used by all
//! auxcol components.

pub mod checksum;
pub mod config;
pub mod error;
pub mod naming;
pub mod types;

pub use checksum::Checksum;
pub use config::{CommitMode, Config, ReaderConfig, WriterConfig};
pub use error::{Error, Result};
pub use types::*;
