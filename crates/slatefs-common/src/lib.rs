//! SlateFS Common - Shared types and utilities
//!
//! This crate provides the identities, error definitions and checksum
//! helpers used by the object storage adapters and the chunk store.

pub mod checksum;
pub mod error;
pub mod types;

pub use checksum::{BlockChecksum, ChecksumCalculator};
pub use error::{Error, Result};
pub use types::*;
