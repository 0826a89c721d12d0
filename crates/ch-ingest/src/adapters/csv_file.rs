//! Delimited flat-file endpoint.
//!
//! A file exposes exactly one relation, named after the file stem. Columns
//! come from the header record (or `column_N` when the file has no header)
//! and are all typed `String`.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::{
    Batch, ColumnDescriptor, ConnectionHandle, Credentials, Relation, Row, SchemaAdapter,
    StreamRequest, Value,
};
use crate::error::{IngestError, Result};

const FILE_COLUMN_TYPE: &str = "String";

#[derive(Debug, Clone)]
struct FileSession {
    path: PathBuf,
    delimiter: u8,
    has_headers: bool,
}

impl FileSession {
    fn relation_name(&self) -> String {
        relation_name_for(&self.path)
    }

    fn check_relation(&self, relation: &str) -> Result<()> {
        if relation == self.relation_name() {
            Ok(())
        } else {
            Err(IngestError::Schema(format!(
                "relation '{}' not found in {}",
                relation,
                self.path.display()
            )))
        }
    }

    fn reader(&self) -> Result<csv::Reader<std::fs::File>> {
        if !self.path.exists() {
            return Err(IngestError::connection(
                "file",
                format!("file not found: {}", self.path.display()),
            ));
        }
        Ok(ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(self.has_headers)
            .flexible(true)
            .from_path(&self.path)?)
    }

    fn header_names(&self) -> Result<Vec<String>> {
        let mut rdr = self.reader()?;
        if self.has_headers {
            Ok(rdr.headers()?.iter().map(|h| h.trim().to_string()).collect())
        } else {
            let width = match rdr.records().next() {
                Some(record) => record?.len(),
                None => 0,
            };
            Ok((1..=width).map(|i| format!("column_{}", i)).collect())
        }
    }

    /// Positions of the requested columns within a record.
    fn column_indices(&self, columns: &[String]) -> Result<Vec<usize>> {
        let headers = self.header_names()?;
        columns
            .iter()
            .map(|name| {
                headers
                    .iter()
                    .position(|h| h == name)
                    .or_else(|| headers.iter().position(|h| h.eq_ignore_ascii_case(name)))
                    .ok_or_else(|| {
                        IngestError::Schema(format!(
                            "column '{}' not found in {}",
                            name,
                            self.path.display()
                        ))
                    })
            })
            .collect()
    }
}

fn relation_name_for(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn project_record(record: &StringRecord, indices: &[usize]) -> Row {
    indices
        .iter()
        .map(|&i| Value::from_cell(record.get(i).unwrap_or("")))
        .collect()
}

/// Reads and writes delimited text files.
#[derive(Debug, Default, Clone)]
pub struct CsvFileAdapter {
    sessions: Arc<Mutex<HashMap<Uuid, FileSession>>>,
}

impl CsvFileAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    async fn session(&self, conn: &ConnectionHandle) -> Result<FileSession> {
        self.sessions
            .lock()
            .await
            .get(&conn.id)
            .cloned()
            .ok_or_else(|| IngestError::connection("file", "session is not connected"))
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| IngestError::Io(std::io::Error::other(e.to_string())))?
}

#[async_trait]
impl SchemaAdapter for CsvFileAdapter {
    async fn connect(&self, credentials: &Credentials) -> Result<ConnectionHandle> {
        let Credentials::File {
            path,
            delimiter,
            has_headers,
        } = credentials
        else {
            return Err(IngestError::connection(
                "file",
                "file adapter requires file credentials",
            ));
        };

        // A missing file is fine as long as it could be created as a target.
        if !path.exists() {
            let parent_ok = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.is_dir(),
                _ => true,
            };
            if !parent_ok {
                return Err(IngestError::connection(
                    "file",
                    format!("directory does not exist for {}", path.display()),
                ));
            }
        } else if path.is_dir() {
            return Err(IngestError::connection(
                "file",
                format!("{} is a directory", path.display()),
            ));
        }

        let handle = ConnectionHandle::new(path.display().to_string());
        self.sessions.lock().await.insert(
            handle.id,
            FileSession {
                path: path.clone(),
                delimiter: *delimiter,
                has_headers: *has_headers,
            },
        );
        info!("Opened file session for {}", path.display());
        Ok(handle)
    }

    async fn list_relations(&self, conn: &ConnectionHandle) -> Result<Vec<Relation>> {
        let session = self.session(conn).await?;
        let name = session.relation_name();
        if !session.path.exists() {
            return Ok(vec![Relation::new(name).with_engine("csv")]);
        }
        let rows = blocking(move || {
            let mut rdr = session.reader()?;
            let mut count = 0u64;
            let mut record = StringRecord::new();
            while rdr.read_record(&mut record)? {
                count += 1;
            }
            Ok(count)
        })
        .await?;
        Ok(vec![Relation::new(name).with_row_count(rows).with_engine("csv")])
    }

    async fn list_columns(
        &self,
        conn: &ConnectionHandle,
        relation: &str,
    ) -> Result<Vec<ColumnDescriptor>> {
        let session = self.session(conn).await?;
        session.check_relation(relation)?;
        let headers = blocking(move || session.header_names()).await?;
        Ok(headers
            .into_iter()
            .map(|h| ColumnDescriptor::new(h, FILE_COLUMN_TYPE))
            .collect())
    }

    async fn fetch_preview(
        &self,
        conn: &ConnectionHandle,
        relation: &str,
        columns: &[String],
        limit: usize,
    ) -> Result<Vec<Row>> {
        let session = self.session(conn).await?;
        session.check_relation(relation)?;
        let columns = columns.to_vec();
        blocking(move || {
            let indices = session.column_indices(&columns)?;
            let mut rdr = session.reader()?;
            let mut rows = Vec::with_capacity(limit);
            for record in rdr.records().take(limit) {
                rows.push(project_record(&record?, &indices));
            }
            Ok(rows)
        })
        .await
    }

    fn stream_rows(
        &self,
        conn: &ConnectionHandle,
        request: StreamRequest,
    ) -> mpsc::Receiver<Result<Batch>> {
        let (tx, rx) = mpsc::channel(request.buffer.max(1));
        let sessions = self.sessions.clone();
        let conn = conn.clone();

        tokio::spawn(async move {
            let session = match sessions.lock().await.get(&conn.id).cloned() {
                Some(s) => s,
                None => {
                    let _ = tx
                        .send(Err(IngestError::connection("file", "session is not connected")))
                        .await;
                    return;
                }
            };
            if let Err(e) = session.check_relation(&request.relation) {
                let _ = tx.send(Err(e)).await;
                return;
            }

            let error_tx = tx.clone();
            let result = tokio::task::spawn_blocking(move || {
                if let Err(e) = read_batches(&session, &request, &tx) {
                    let _ = tx.blocking_send(Err(e));
                }
            })
            .await;
            if let Err(e) = result {
                let _ = error_tx
                    .send(Err(IngestError::transfer("file", e.to_string())))
                    .await;
            }
        });

        rx
    }

    async fn accept_rows(
        &self,
        conn: &ConnectionHandle,
        relation: &str,
        _columns: &[String],
        batch: Batch,
    ) -> Result<u64> {
        let session = self.session(conn).await?;
        session.check_relation(relation)?;
        blocking(move || {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&session.path)?;
            let mut wtr = WriterBuilder::new()
                .delimiter(session.delimiter)
                .has_headers(false)
                .from_writer(file);
            let count = batch.len() as u64;
            for row in &batch.rows {
                wtr.write_record(row.iter().map(Value::render))?;
            }
            wtr.flush()?;
            debug!("Appended {} rows to {}", count, session.path.display());
            Ok(count)
        })
        .await
    }

    async fn prepare_target(
        &self,
        conn: &ConnectionHandle,
        relation: &str,
        columns: &[String],
    ) -> Result<()> {
        let session = self.session(conn).await?;
        session.check_relation(relation)?;
        let columns = columns.to_vec();
        blocking(move || {
            let file = std::fs::File::create(&session.path)?;
            let mut wtr = WriterBuilder::new()
                .delimiter(session.delimiter)
                .from_writer(file);
            if session.has_headers {
                wtr.write_record(&columns)?;
            }
            wtr.flush()?;
            info!("Prepared {} for {} columns", session.path.display(), columns.len());
            Ok(())
        })
        .await
    }

    async fn disconnect(&self, conn: &ConnectionHandle) {
        if self.sessions.lock().await.remove(&conn.id).is_some() {
            debug!("Closed file session {}", conn.endpoint);
        }
    }

    fn supports_offset(&self) -> bool {
        true
    }

    fn endpoint_kind(&self) -> &str {
        "file"
    }
}

/// Blocking producer loop. Stops early once the receiver is gone.
fn read_batches(
    session: &FileSession,
    request: &StreamRequest,
    tx: &mpsc::Sender<Result<Batch>>,
) -> Result<()> {
    let indices = session.column_indices(&request.columns)?;
    let mut rdr = session.reader()?;
    let batch_size = request.batch_size.max(1);
    let mut rows = Vec::with_capacity(batch_size);
    let mut record = StringRecord::new();
    let mut skipped = 0u64;

    while rdr.read_record(&mut record)? {
        if skipped < request.offset {
            skipped += 1;
            continue;
        }
        rows.push(project_record(&record, &indices));
        if rows.len() >= batch_size {
            let batch = Batch::new(std::mem::replace(&mut rows, Vec::with_capacity(batch_size)));
            if tx.blocking_send(Ok(batch)).is_err() {
                debug!("Reader for {} dropped, stopping", session.path.display());
                return Ok(());
            }
        }
    }

    if !rows.is_empty() {
        let _ = tx.blocking_send(Ok(Batch::new(rows)));
    }
    Ok(())
}
