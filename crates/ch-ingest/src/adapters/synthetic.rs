//! Synthetic endpoint producing generated rows.
//!
//! Useful for exercising the engine without real I/O: it can pace batches,
//! fail part-way through reading or writing, and counts what it accepts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::{
    Batch, ColumnDescriptor, ConnectionHandle, Credentials, Relation, Row, SchemaAdapter,
    StreamRequest, Value,
};
use crate::error::{IngestError, Result};

/// Message used for simulated transport failures.
pub const CONNECTION_LOST: &str =
    "Connection lost during data transfer. Please check your network connection and try again.";

/// Generated-row source and counting sink.
#[derive(Debug, Clone)]
pub struct SyntheticEndpoint {
    relation: String,
    total_rows: u64,
    batch_delay: Option<Duration>,
    write_delay: Option<Duration>,
    fail_read_after: Option<u64>,
    fail_write_after: Option<u64>,
    accepted: Arc<AtomicU64>,
    batches_accepted: Arc<AtomicU64>,
}

impl SyntheticEndpoint {
    pub fn new(relation: impl Into<String>, total_rows: u64) -> Self {
        Self {
            relation: relation.into(),
            total_rows,
            batch_delay: None,
            write_delay: None,
            fail_read_after: None,
            fail_write_after: None,
            accepted: Arc::new(AtomicU64::new(0)),
            batches_accepted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Sleep before producing each batch.
    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = Some(delay);
        self
    }

    /// Sleep inside every `accept_rows` call.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    /// Fail the read once more than `rows` rows have been emitted.
    pub fn fail_read_after(mut self, rows: u64) -> Self {
        self.fail_read_after = Some(rows);
        self
    }

    /// Fail writes once `rows` rows have been accepted.
    pub fn fail_write_after(mut self, rows: u64) -> Self {
        self.fail_write_after = Some(rows);
        self
    }

    /// Rows accepted so far.
    pub fn accepted_rows(&self) -> u64 {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Batches accepted so far.
    pub fn accepted_batches(&self) -> u64 {
        self.batches_accepted.load(Ordering::SeqCst)
    }

    pub fn columns() -> Vec<ColumnDescriptor> {
        vec![
            ColumnDescriptor::new("id", "UInt64"),
            ColumnDescriptor::new("name", "String"),
            ColumnDescriptor::new("amount", "Decimal(10,2)"),
        ]
    }

    fn check_relation(&self, relation: &str) -> Result<()> {
        if relation == self.relation {
            Ok(())
        } else {
            Err(IngestError::Schema(format!(
                "relation '{}' does not exist",
                relation
            )))
        }
    }
}

fn generate_row(i: u64, columns: &[String]) -> Row {
    columns
        .iter()
        .map(|c| match c.as_str() {
            "id" => Value::UInt(i + 1),
            "name" => Value::Text(format!("Sample-name-{}", i + 1)),
            "amount" => Value::Decimal(rust_decimal::Decimal::new((i as i64 * 137) % 100_000, 2)),
            _ => Value::Null,
        })
        .collect()
}

#[async_trait]
impl SchemaAdapter for SyntheticEndpoint {
    async fn connect(&self, _credentials: &Credentials) -> Result<ConnectionHandle> {
        Ok(ConnectionHandle::new(format!("synthetic:{}", self.relation)))
    }

    async fn list_relations(&self, _conn: &ConnectionHandle) -> Result<Vec<Relation>> {
        Ok(vec![Relation::new(&self.relation)
            .with_row_count(self.total_rows)
            .with_engine("synthetic")])
    }

    async fn list_columns(
        &self,
        _conn: &ConnectionHandle,
        relation: &str,
    ) -> Result<Vec<ColumnDescriptor>> {
        self.check_relation(relation)?;
        Ok(Self::columns())
    }

    async fn fetch_preview(
        &self,
        _conn: &ConnectionHandle,
        relation: &str,
        columns: &[String],
        limit: usize,
    ) -> Result<Vec<Row>> {
        self.check_relation(relation)?;
        Ok((0..self.total_rows.min(limit as u64))
            .map(|i| generate_row(i, columns))
            .collect())
    }

    fn stream_rows(
        &self,
        _conn: &ConnectionHandle,
        request: StreamRequest,
    ) -> mpsc::Receiver<Result<Batch>> {
        let (tx, rx) = mpsc::channel(request.buffer.max(1));
        let this = self.clone();

        tokio::spawn(async move {
            if let Err(e) = this.check_relation(&request.relation) {
                let _ = tx.send(Err(e)).await;
                return;
            }
            let batch_size = request.batch_size.max(1) as u64;
            let mut emitted = request.offset;

            while emitted < this.total_rows {
                if let Some(delay) = this.batch_delay {
                    tokio::time::sleep(delay).await;
                }
                if let Some(threshold) = this.fail_read_after {
                    if emitted > threshold {
                        let _ = tx
                            .send(Err(IngestError::transfer(&this.relation, CONNECTION_LOST)))
                            .await;
                        return;
                    }
                }
                let end = (emitted + batch_size).min(this.total_rows);
                let rows = (emitted..end)
                    .map(|i| generate_row(i, &request.columns))
                    .collect();
                if tx.send(Ok(Batch::new(rows))).await.is_err() {
                    debug!("Synthetic reader dropped at {} rows", emitted);
                    return;
                }
                emitted = end;
            }
        });

        rx
    }

    async fn accept_rows(
        &self,
        _conn: &ConnectionHandle,
        relation: &str,
        _columns: &[String],
        batch: Batch,
    ) -> Result<u64> {
        self.check_relation(relation)?;
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(threshold) = self.fail_write_after {
            if self.accepted_rows() >= threshold {
                return Err(IngestError::transfer(relation, CONNECTION_LOST));
            }
        }
        let count = batch.len() as u64;
        self.accepted.fetch_add(count, Ordering::SeqCst);
        self.batches_accepted.fetch_add(1, Ordering::SeqCst);
        Ok(count)
    }

    async fn disconnect(&self, _conn: &ConnectionHandle) {}

    fn supports_offset(&self) -> bool {
        true
    }

    fn endpoint_kind(&self) -> &str {
        "synthetic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials::File {
            path: "synthetic".into(),
            delimiter: b',',
            has_headers: true,
        }
    }

    fn all_columns() -> Vec<String> {
        SyntheticEndpoint::columns().into_iter().map(|c| c.name).collect()
    }

    #[tokio::test]
    async fn test_stream_emits_all_rows() {
        let endpoint = SyntheticEndpoint::new("events", 1050);
        let conn = endpoint.connect(&creds()).await.unwrap();
        let mut rx = endpoint.stream_rows(&conn, StreamRequest::new("events", all_columns(), 100));
        let mut sizes = Vec::new();
        while let Some(batch) = rx.recv().await {
            sizes.push(batch.unwrap().len());
        }
        assert_eq!(sizes.len(), 11);
        assert_eq!(sizes.last(), Some(&50));
    }

    #[tokio::test]
    async fn test_read_failure_after_threshold() {
        let endpoint = SyntheticEndpoint::new("events", 1000).fail_read_after(500);
        let conn = endpoint.connect(&creds()).await.unwrap();
        let mut rx = endpoint.stream_rows(&conn, StreamRequest::new("events", all_columns(), 100));
        let mut ok_rows = 0;
        let mut failed = false;
        while let Some(batch) = rx.recv().await {
            match batch {
                Ok(b) => ok_rows += b.len(),
                Err(e) => {
                    assert!(e.to_string().contains("Connection lost"));
                    failed = true;
                }
            }
        }
        assert!(failed);
        assert_eq!(ok_rows, 600);
    }

    #[tokio::test]
    async fn test_accept_counts_and_write_failure() {
        let endpoint = SyntheticEndpoint::new("sink", 0).fail_write_after(2);
        let conn = endpoint.connect(&creds()).await.unwrap();
        let batch = Batch::new(vec![vec![Value::UInt(1)], vec![Value::UInt(2)]]);
        assert_eq!(
            endpoint.accept_rows(&conn, "sink", &[], batch.clone()).await.unwrap(),
            2
        );
        assert!(endpoint.accept_rows(&conn, "sink", &[], batch).await.is_err());
        assert_eq!(endpoint.accepted_rows(), 2);
        assert_eq!(endpoint.accepted_batches(), 1);
    }
}
