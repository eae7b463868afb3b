//! Capability interfaces to the external stores the engine depends on.

mod data;
pub mod storage;

pub use data::DataProvider;
pub use storage::{FilesystemStorage, StorageFactory, StorageProvider};
