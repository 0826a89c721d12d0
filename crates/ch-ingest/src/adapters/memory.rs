//! In-process analytical store.
//!
//! Holds typed tables in memory and can be snapshotted to and from JSON so
//! separate command-line runs see the same data. Incoming text cells are
//! coerced to the declared column type on write.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::{
    Batch, ColumnDescriptor, ConnectionHandle, Credentials, Relation, Row, SchemaAdapter,
    StreamRequest, Value,
};
use crate::error::{IngestError, Result};

/// A table held by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreTable {
    pub name: String,
    #[serde(default = "default_engine")]
    pub engine: String,
    pub columns: Vec<ColumnDescriptor>,
    #[serde(default)]
    pub rows: Vec<Row>,
}

fn default_engine() -> String {
    "MergeTree".to_string()
}

impl StoreTable {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDescriptor>) -> Self {
        Self {
            name: name.into(),
            engine: default_engine(),
            columns,
            rows: Vec::new(),
        }
    }

    fn relation(&self) -> Relation {
        Relation::new(&self.name)
            .with_row_count(self.rows.len() as u64)
            .with_engine(&self.engine)
    }

    fn column_indices(&self, columns: &[String]) -> Result<Vec<usize>> {
        columns
            .iter()
            .map(|name| {
                self.columns
                    .iter()
                    .position(|c| c.matches_name(name))
                    .ok_or_else(|| {
                        IngestError::Schema(format!(
                            "column '{}' does not exist on {}",
                            name, self.name
                        ))
                    })
            })
            .collect()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    database: String,
    tables: Vec<StoreTable>,
}

/// In-memory columnar store endpoint.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    database: String,
    token: Option<String>,
    tables: Arc<RwLock<BTreeMap<String, StoreTable>>>,
    sessions: Arc<Mutex<HashMap<Uuid, String>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("default")
    }
}

impl MemoryStore {
    /// Empty store for the given database name.
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            token: None,
            tables: Arc::new(RwLock::new(BTreeMap::new())),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Require this token on connect.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Add (or replace) a table.
    pub fn with_table(self, table: StoreTable) -> Self {
        match self.tables.try_write() {
            Ok(mut tables) => {
                tables.insert(table.name.clone(), table);
            }
            Err(_) => warn!("Store is busy; table {} not added", table.name),
        }
        self
    }

    /// Add or replace a table on a live store.
    pub async fn put_table(&self, table: StoreTable) {
        debug!("Table {} replaced ({} columns)", table.name, table.columns.len());
        self.tables.write().await.insert(table.name.clone(), table);
    }

    /// Store pre-populated with the sample catalog.
    pub fn sample() -> Self {
        sample_tables()
            .into_iter()
            .fold(Self::default(), |store, table| store.with_table(table))
    }

    /// Load a JSON snapshot.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let snapshot: Snapshot = serde_json::from_str(&content)?;
        info!(
            "Loaded store snapshot {} ({} tables)",
            path.as_ref().display(),
            snapshot.tables.len()
        );
        Ok(snapshot
            .tables
            .into_iter()
            .fold(Self::new(snapshot.database), |store, table| {
                store.with_table(table)
            }))
    }

    /// Write a JSON snapshot atomically (temp file then rename).
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let snapshot = Snapshot {
            database: self.database.clone(),
            tables: self.tables.read().await.values().cloned().collect(),
        };
        let content = serde_json::to_string(&snapshot)?;
        let path = path.as_ref();
        let temp = path.with_extension("json.tmp");
        tokio::fs::write(&temp, content).await?;
        tokio::fs::rename(&temp, path).await?;
        info!("Saved store snapshot {}", path.display());
        Ok(())
    }

    /// Copy of a table's rows, for inspection.
    pub async fn table_rows(&self, name: &str) -> Option<Vec<Row>> {
        self.tables.read().await.get(name).map(|t| t.rows.clone())
    }

    async fn check_session(&self, conn: &ConnectionHandle) -> Result<()> {
        if self.sessions.lock().await.contains_key(&conn.id) {
            Ok(())
        } else {
            Err(IngestError::connection("store", "session is not connected"))
        }
    }
}

fn missing_table(name: &str) -> IngestError {
    IngestError::Schema(format!("table '{}' does not exist", name))
}

#[async_trait]
impl SchemaAdapter for MemoryStore {
    async fn connect(&self, credentials: &Credentials) -> Result<ConnectionHandle> {
        let Credentials::Store {
            host,
            port,
            database,
            username,
            token,
        } = credentials
        else {
            return Err(IngestError::connection(
                "store",
                "store adapter requires store credentials",
            ));
        };

        if let Some(expected) = &self.token {
            if expected != token {
                return Err(IngestError::connection(
                    "store",
                    format!("authentication failed for user '{}'", username),
                ));
            }
        }
        if database != &self.database {
            return Err(IngestError::connection(
                "store",
                format!("database '{}' does not exist", database),
            ));
        }

        let handle = ConnectionHandle::new(format!("{}:{}/{}", host, port, database));
        self.sessions
            .lock()
            .await
            .insert(handle.id, username.clone());
        info!("Connected to store {} as {}", handle.endpoint, username);
        Ok(handle)
    }

    async fn list_relations(&self, conn: &ConnectionHandle) -> Result<Vec<Relation>> {
        self.check_session(conn).await?;
        Ok(self
            .tables
            .read()
            .await
            .values()
            .map(StoreTable::relation)
            .collect())
    }

    async fn list_columns(
        &self,
        conn: &ConnectionHandle,
        relation: &str,
    ) -> Result<Vec<ColumnDescriptor>> {
        self.check_session(conn).await?;
        self.tables
            .read()
            .await
            .get(relation)
            .map(|t| t.columns.clone())
            .ok_or_else(|| missing_table(relation))
    }

    async fn fetch_preview(
        &self,
        conn: &ConnectionHandle,
        relation: &str,
        columns: &[String],
        limit: usize,
    ) -> Result<Vec<Row>> {
        self.check_session(conn).await?;
        let tables = self.tables.read().await;
        let table = tables.get(relation).ok_or_else(|| missing_table(relation))?;
        let indices = table.column_indices(columns)?;
        Ok(table
            .rows
            .iter()
            .take(limit)
            .map(|row| select_cells(row, &indices))
            .collect())
    }

    fn stream_rows(
        &self,
        conn: &ConnectionHandle,
        request: StreamRequest,
    ) -> mpsc::Receiver<Result<Batch>> {
        let (tx, rx) = mpsc::channel(request.buffer.max(1));
        let store = self.clone();
        let conn = conn.clone();

        tokio::spawn(async move {
            if let Err(e) = stream_internal(store, conn, request, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });

        rx
    }

    async fn accept_rows(
        &self,
        conn: &ConnectionHandle,
        relation: &str,
        columns: &[String],
        batch: Batch,
    ) -> Result<u64> {
        self.check_session(conn).await?;
        let mut tables = self.tables.write().await;
        let table = tables
            .get_mut(relation)
            .ok_or_else(|| missing_table(relation))?;
        let indices = table.column_indices(columns)?;
        let width = table.columns.len();

        // Coerce the whole batch before touching the table so a bad cell
        // leaves no partial batch behind.
        let mut converted = Vec::with_capacity(batch.len());
        for (row_no, row) in batch.rows.into_iter().enumerate() {
            let mut full = vec![Value::Null; width];
            for (value, &idx) in row.into_iter().zip(indices.iter()) {
                let column = &table.columns[idx];
                full[idx] = coerce(value, &column.data_type).map_err(|msg| {
                    IngestError::transfer(
                        relation,
                        format!("row {} column '{}': {}", row_no + 1, column.name, msg),
                    )
                })?;
            }
            converted.push(full);
        }

        let count = converted.len() as u64;
        table.rows.extend(converted);
        debug!("Inserted {} rows into {}", count, relation);
        Ok(count)
    }

    async fn disconnect(&self, conn: &ConnectionHandle) {
        if self.sessions.lock().await.remove(&conn.id).is_some() {
            debug!("Disconnected store session {}", conn.endpoint);
        }
    }

    fn supports_offset(&self) -> bool {
        true
    }

    fn endpoint_kind(&self) -> &str {
        "store"
    }
}

async fn stream_internal(
    store: MemoryStore,
    conn: ConnectionHandle,
    request: StreamRequest,
    tx: &mpsc::Sender<Result<Batch>>,
) -> Result<()> {
    store.check_session(&conn).await?;
    let batch_size = request.batch_size.max(1);
    let mut position = request.offset as usize;

    loop {
        // Only hold the lock while copying one batch out.
        let batch = {
            let tables = store.tables.read().await;
            let table = tables
                .get(&request.relation)
                .ok_or_else(|| missing_table(&request.relation))?;
            let indices = table.column_indices(&request.columns)?;
            let end = (position + batch_size).min(table.rows.len());
            if position >= end {
                return Ok(());
            }
            let rows = table.rows[position..end]
                .iter()
                .map(|row| select_cells(row, &indices))
                .collect();
            position = end;
            Batch::new(rows)
        };

        if tx.send(Ok(batch)).await.is_err() {
            debug!("Reader for {} dropped, stopping", request.relation);
            return Ok(());
        }
    }
}

fn select_cells(row: &Row, indices: &[usize]) -> Row {
    indices
        .iter()
        .map(|&i| row.get(i).cloned().unwrap_or(Value::Null))
        .collect()
}

/// Convert a cell to the declared column type.
fn coerce(value: Value, data_type: &str) -> std::result::Result<Value, String> {
    let base = data_type
        .strip_prefix("Nullable(")
        .and_then(|t| t.strip_suffix(')'))
        .unwrap_or(data_type);

    let text = match value {
        Value::Text(s) => s,
        other => return Ok(other),
    };
    let bad = |e: String| format!("cannot parse '{}' as {}: {}", text, base, e);

    if base.starts_with("UInt") {
        text.trim().parse::<u64>().map(Value::UInt).map_err(|e| bad(e.to_string()))
    } else if base.starts_with("Int") {
        text.trim().parse::<i64>().map(Value::Int).map_err(|e| bad(e.to_string()))
    } else if base.starts_with("Float") {
        text.trim().parse::<f64>().map(Value::Float).map_err(|e| bad(e.to_string()))
    } else if base.starts_with("Decimal") {
        Decimal::from_str(text.trim())
            .map(Value::Decimal)
            .map_err(|e| bad(e.to_string()))
    } else if base.starts_with("DateTime") {
        NaiveDateTime::parse_from_str(text.trim(), "%Y-%m-%d %H:%M:%S")
            .map(Value::DateTime)
            .map_err(|e| bad(e.to_string()))
    } else if base.starts_with("Date") {
        NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
            .map(Value::Date)
            .map_err(|e| bad(e.to_string()))
    } else if base == "Bool" {
        text.trim().parse::<bool>().map(Value::Bool).map_err(|e| bad(e.to_string()))
    } else {
        Ok(Value::Text(text))
    }
}

// ===== Sample catalog =====

fn cols(spec: &[(&str, &str)]) -> Vec<ColumnDescriptor> {
    spec.iter()
        .map(|(name, ty)| ColumnDescriptor::new(*name, *ty))
        .collect()
}

/// Deterministic cell for row `i` of a column.
fn sample_cell(column: &ColumnDescriptor, col_idx: usize, i: usize) -> Value {
    let seed = (i * 7919 + col_idx * 104_729) as u64;
    let base_date = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap_or_default();
    match column.data_type.as_str() {
        "String" => Value::Text(format!("Sample-{}-{}", column.name, i + 1)),
        t if t.starts_with("UInt") => Value::UInt(seed % 100),
        t if t.starts_with("Int") => Value::Int((seed % 200) as i64 - 100),
        "Date" => Value::Date(base_date + Duration::days((seed % 365) as i64)),
        "DateTime" => Value::DateTime(
            base_date.and_hms_opt(0, 0, 0).unwrap_or_default()
                + Duration::seconds((seed % 31_536_000) as i64),
        ),
        t if t.starts_with("Decimal") => Value::Decimal(Decimal::new((seed % 100_000_000) as i64, 2)),
        t if t.starts_with("Float") => Value::Float((seed % 10_000) as f64 / 100.0),
        _ => Value::Text(format!("Value-{}", i + 1)),
    }
}

fn generated(name: &str, columns: Vec<ColumnDescriptor>, rows: usize) -> StoreTable {
    let data = (0..rows)
        .map(|i| {
            columns
                .iter()
                .enumerate()
                .map(|(c, col)| sample_cell(col, c, i))
                .collect()
        })
        .collect();
    StoreTable {
        rows: data,
        ..StoreTable::new(name, columns)
    }
}

fn sample_tables() -> Vec<StoreTable> {
    vec![
        generated(
            "uk_price_paid",
            cols(&[
                ("transaction_id", "String"),
                ("price", "Decimal(10,2)"),
                ("date_of_transfer", "Date"),
                ("postcode", "String"),
                ("property_type", "String"),
                ("old_new", "String"),
                ("duration", "String"),
                ("town", "String"),
                ("district", "String"),
                ("county", "String"),
                ("country", "String"),
            ]),
            5000,
        ),
        generated(
            "ontime",
            cols(&[
                ("year", "UInt16"),
                ("quarter", "UInt8"),
                ("month", "UInt8"),
                ("day_of_month", "UInt8"),
                ("day_of_week", "UInt8"),
                ("flight_date", "Date"),
                ("carrier", "String"),
                ("tail_number", "String"),
                ("flight_number", "String"),
                ("origin", "String"),
                ("destination", "String"),
                ("departure_delay", "Int16"),
                ("arrival_delay", "Int16"),
                ("cancelled", "UInt8"),
                ("distance", "UInt16"),
            ]),
            2000,
        ),
        generated(
            "products",
            cols(&[
                ("product_id", "UInt32"),
                ("name", "String"),
                ("category", "String"),
                ("price", "Decimal(10,2)"),
                ("created_at", "Date"),
            ]),
            500,
        ),
        generated(
            "user_actions",
            cols(&[
                ("user_id", "UInt64"),
                ("action", "String"),
                ("happened_at", "DateTime"),
                ("duration_ms", "UInt32"),
            ]),
            1200,
        ),
    ]
}
