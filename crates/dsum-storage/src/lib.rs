//! Filesystem side of the detection summary pipeline.
//!
//! This crate provides:
//! - Run directory layout (platform paths and their local counterparts)
//! - File copy and atomic mirroring
//! - Selection trace output
//! - `summary.json` bundle documents
//! - Persistent store of published bundles with async waits

pub mod bundle_doc;
pub mod bundle_store;
pub mod error;
pub mod fs_utils;
pub mod layout;
pub mod trace;

pub use bundle_doc::{write_bundle_json, BundleDocument};
pub use bundle_store::{BundleQuery, BundleStore, StoreConfig};
pub use error::{StorageError, StorageResult};
pub use fs_utils::{copy_file, mirror_file, wait_for_file, write_atomic};
pub use layout::StorageLayout;
pub use trace::{write_trace, TraceConfig, TraceReport};
