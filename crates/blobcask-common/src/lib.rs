//! Blobcask Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, configuration and small
//! utilities used across all blobcask components.

pub mod config;
pub mod error;
pub mod handle;
pub mod types;

pub use config::StoreConfig;
pub use error::{Error, Result};
pub use handle::HandleGen;
pub use types::*;
