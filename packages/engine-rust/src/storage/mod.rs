//! Reference adapters for the storage and manifest ports.

pub mod json_file;
pub mod manifest;
pub mod memory;

pub use json_file::JsonFileStorage;
pub use manifest::MemoryManifest;
pub use memory::MemoryStorage;
