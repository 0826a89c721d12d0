//! Core abstractions shared by every endpoint.
//!
//! - [`schema`]: relation, column and direction metadata
//! - [`value`]: cell values, rows and batches
//! - [`traits`]: the [`SchemaAdapter`] endpoint contract

pub mod schema;
pub mod traits;
pub mod value;

pub use schema::{
    filter_columns, filter_relations, find_column, ColumnDescriptor, Relation, TransferDirection,
};
pub use traits::{ConnectionHandle, Credentials, SchemaAdapter, StreamRequest};
pub use value::{Batch, Row, Value};
