//! # ch-ingest
//!
//! Guided bulk transfers between a columnar analytical store and flat files.
//!
//! The library is built from four parts:
//!
//! - **SchemaAdapter** ([`core::SchemaAdapter`]): the capability contract every
//!   endpoint implements (connect, discover, preview, stream, accept)
//! - **Column mapping** ([`mapping`]): reconciles a file's columns with an
//!   existing table's columns
//! - **IngestionEngine** ([`ingest`]): runs one batched, cancellable,
//!   progress-reporting job at a time
//! - **WorkflowOrchestrator** ([`workflow`]): the phase state machine that
//!   drives the others in the right order for either direction
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ch_ingest::{Config, CsvFileAdapter, MemoryStore, TransferDirection, WorkflowOrchestrator};
//! use ch_ingest::config::FileConfig;
//!
//! #[tokio::main]
//! async fn main() -> ch_ingest::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let mut workflow = WorkflowOrchestrator::new(
//!         Arc::new(MemoryStore::sample()),
//!         Arc::new(CsvFileAdapter::new()),
//!         config.ingest.clone(),
//!     );
//!     workflow.select_direction(TransferDirection::StoreToFile).await?;
//!     workflow.connect_source(&config.store.credentials()).await?;
//!     workflow.select_relation("uk_price_paid").await?;
//!     workflow.select_columns(&["price".into(), "town".into()]).await?;
//!     workflow.connect_target(&FileConfig::new("prices.csv").credentials()).await?;
//!     workflow.start_ingestion().await?;
//!     let done = workflow.wait_for_completion().await?;
//!     println!("{}", done.summary());
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod config;
pub mod core;
pub mod error;
pub mod ingest;
pub mod mapping;
pub mod workflow;

// Re-exports for convenient access
pub use adapters::{CsvFileAdapter, MemoryStore, StoreTable, SyntheticEndpoint};
pub use config::{Config, FileConfig, IngestConfig, StoreConfig};
pub use crate::core::{
    Batch, ColumnDescriptor, ConnectionHandle, Credentials, Relation, Row, SchemaAdapter,
    StreamRequest, TransferDirection, Value,
};
pub use error::{ErrorKind, IngestError, Result};
pub use ingest::{
    batch_size_for, format_duration, IngestionEngine, JobHandle, JobPhase, JobSpec,
    ProgressSnapshot,
};
pub use mapping::{ColumnMapping, MappingEntry, ResolvedMapping};
pub use workflow::{JobOutcome, Phase, StepStatus, StepView, WorkflowEvent, WorkflowOrchestrator};
