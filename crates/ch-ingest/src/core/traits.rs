//! Endpoint capability contract.
//!
//! Every endpoint the workflow can talk to (the analytical store, a delimited
//! file, the synthetic producer used by tests) implements [`SchemaAdapter`].
//! The workflow and the ingestion engine only ever see this trait.

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{IngestError, Result};

use super::schema::{ColumnDescriptor, Relation};
use super::value::{Batch, Row};

/// Connection parameters for an endpoint.
#[derive(Clone)]
pub enum Credentials {
    /// Analytical store connection.
    Store {
        host: String,
        port: u16,
        database: String,
        username: String,
        token: String,
    },
    /// Delimited flat file.
    File {
        path: std::path::PathBuf,
        delimiter: u8,
        has_headers: bool,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Store {
                host,
                port,
                database,
                username,
                ..
            } => f
                .debug_struct("Store")
                .field("host", host)
                .field("port", port)
                .field("database", database)
                .field("username", username)
                .field("token", &"[REDACTED]")
                .finish(),
            Credentials::File {
                path,
                delimiter,
                has_headers,
            } => f
                .debug_struct("File")
                .field("path", path)
                .field("delimiter", &(*delimiter as char))
                .field("has_headers", has_headers)
                .finish(),
        }
    }
}

/// Opaque session token returned by [`SchemaAdapter::connect`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    /// Session id, unique per connect call.
    pub id: Uuid,
    /// Human-readable endpoint label (host:port/db or file path).
    pub endpoint: String,
}

impl ConnectionHandle {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint: endpoint.into(),
        }
    }
}

/// Parameters for streaming rows out of a relation.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    /// Relation to read.
    pub relation: String,
    /// Columns to read, in output order.
    pub columns: Vec<String>,
    /// Number of rows per batch.
    pub batch_size: usize,
    /// Rows to skip before the first batch (requires [`SchemaAdapter::supports_offset`]).
    pub offset: u64,
    /// Batches the producer may read ahead of the consumer.
    pub buffer: usize,
}

impl StreamRequest {
    pub fn new(relation: impl Into<String>, columns: Vec<String>, batch_size: usize) -> Self {
        Self {
            relation: relation.into(),
            columns,
            batch_size,
            offset: 0,
            buffer: 4,
        }
    }
}

/// Uniform capability interface for a data endpoint.
///
/// # Streaming
///
/// [`stream_rows`](SchemaAdapter::stream_rows) returns a bounded channel fed by
/// a producer task. The producer stops at the first error it sends, or as soon
/// as the receiver is dropped, which is how the engine cancels a read.
#[async_trait]
pub trait SchemaAdapter: Send + Sync {
    /// Open a session. Fails with a Connection error on bad credentials.
    async fn connect(&self, credentials: &Credentials) -> Result<ConnectionHandle>;

    /// Enumerate relations visible to the session.
    async fn list_relations(&self, conn: &ConnectionHandle) -> Result<Vec<Relation>>;

    /// Enumerate the columns of a relation, in declaration order.
    async fn list_columns(
        &self,
        conn: &ConnectionHandle,
        relation: &str,
    ) -> Result<Vec<ColumnDescriptor>>;

    /// Read up to `limit` rows of the given columns for display.
    async fn fetch_preview(
        &self,
        conn: &ConnectionHandle,
        relation: &str,
        columns: &[String],
        limit: usize,
    ) -> Result<Vec<Row>>;

    /// Start streaming rows in batches of `request.batch_size`.
    fn stream_rows(
        &self,
        conn: &ConnectionHandle,
        request: StreamRequest,
    ) -> mpsc::Receiver<Result<Batch>>;

    /// Write one batch. Returns the number of rows written.
    async fn accept_rows(
        &self,
        conn: &ConnectionHandle,
        relation: &str,
        columns: &[String],
        batch: Batch,
    ) -> Result<u64>;

    /// Get the target ready to accept rows for the given columns.
    ///
    /// The default only checks that every column exists on the relation.
    async fn prepare_target(
        &self,
        conn: &ConnectionHandle,
        relation: &str,
        columns: &[String],
    ) -> Result<()> {
        let existing = self.list_columns(conn, relation).await?;
        for name in columns {
            if !existing.iter().any(|c| c.matches_name(name)) {
                return Err(IngestError::Schema(format!(
                    "column '{}' does not exist on {}",
                    name, relation
                )));
            }
        }
        Ok(())
    }

    /// Close the session. Unknown handles are ignored.
    async fn disconnect(&self, conn: &ConnectionHandle);

    /// Whether [`StreamRequest::offset`] is honoured.
    fn supports_offset(&self) -> bool {
        false
    }

    /// Endpoint type identifier (e.g. "store", "file").
    fn endpoint_kind(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_credentials_debug_redacts_token() {
        let creds = Credentials::Store {
            host: "localhost".into(),
            port: 8443,
            database: "default".into(),
            username: "default".into(),
            token: "super_secret".into(),
        };
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("super_secret"));
        assert!(debug.contains("[REDACTED]"));
        assert!(debug.contains("localhost"));
    }

    #[test]
    fn test_connection_handles_are_unique() {
        let a = ConnectionHandle::new("file.csv");
        let b = ConnectionHandle::new("file.csv");
        assert_ne!(a, b);
    }
}
