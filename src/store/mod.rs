//! The durable store contract and a blob-backed implementation.

pub mod blob;
pub mod contract;
pub mod error;

pub use blob::{BlobStore, BlobStoreConfig};
pub use contract::{ListResult, RecoveryReport, ResultStream, SearchFilters, Store};
pub use error::StoreError;
