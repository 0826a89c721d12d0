//! Endpoint implementations of [`SchemaAdapter`](crate::core::SchemaAdapter).

pub mod csv_file;
pub mod memory;
pub mod synthetic;

pub use csv_file::CsvFileAdapter;
pub use memory::{MemoryStore, StoreTable};
pub use synthetic::SyntheticEndpoint;
