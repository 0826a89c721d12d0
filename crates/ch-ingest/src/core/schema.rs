//! Schema metadata types for relations and columns.
//!
//! These types give both endpoints (the columnar store and flat files) a
//! shared vocabulary for discovery, mapping and transfer.

use serde::{Deserialize, Serialize};

/// Direction of a transfer. Fixed for the lifetime of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    /// Export a store table to a flat file.
    StoreToFile,
    /// Load a flat file into an existing store table.
    FileToStore,
}

impl TransferDirection {
    /// Whether the store is the reading side.
    pub fn source_is_store(&self) -> bool {
        matches!(self, TransferDirection::StoreToFile)
    }

    /// Whether two independently discovered schemas must be reconciled.
    pub fn requires_mapping(&self) -> bool {
        matches!(self, TransferDirection::FileToStore)
    }

    /// Short label used in logs and job descriptions.
    pub fn label(&self) -> &'static str {
        match self {
            TransferDirection::StoreToFile => "store-to-file",
            TransferDirection::FileToStore => "file-to-store",
        }
    }

    /// Parse a CLI-style direction label.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "store-to-file" | "store_to_file" | "export" => Some(TransferDirection::StoreToFile),
            "file-to-store" | "file_to_store" | "import" => Some(TransferDirection::FileToStore),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A named, enumerable unit of data within an endpoint (a table, or a whole file).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    /// Relation name, unique within an endpoint.
    pub name: String,

    /// Approximate row count, if the endpoint can tell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,

    /// Storage engine tag (e.g. "MergeTree", "csv").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
}

impl Relation {
    /// Create a relation with no estimate or engine tag.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            row_count: None,
            engine: None,
        }
    }

    pub fn with_row_count(mut self, rows: u64) -> Self {
        self.row_count = Some(rows);
        self
    }

    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = Some(engine.into());
        self
    }
}

/// Column metadata as reported by an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    /// Column name.
    pub name: String,

    /// Endpoint-native type name (e.g. "String", "Decimal(10,2)").
    pub data_type: String,

    /// Name of the column this one was renamed or derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Case-insensitive name comparison used for matching.
    pub fn matches_name(&self, other: &str) -> bool {
        self.name.eq_ignore_ascii_case(other)
    }
}

/// Find a column by case-insensitive name, first match in list order.
pub fn find_column<'a>(columns: &'a [ColumnDescriptor], name: &str) -> Option<&'a ColumnDescriptor> {
    columns.iter().find(|c| c.matches_name(name))
}

/// Filter relations by case-insensitive substring, for discovery listings.
pub fn filter_relations<'a>(relations: &'a [Relation], term: &str) -> Vec<&'a Relation> {
    let term = term.to_lowercase();
    relations
        .iter()
        .filter(|r| r.name.to_lowercase().contains(&term))
        .collect()
}

/// Filter columns by case-insensitive substring, for discovery listings.
pub fn filter_columns<'a>(columns: &'a [ColumnDescriptor], term: &str) -> Vec<&'a ColumnDescriptor> {
    let term = term.to_lowercase();
    columns
        .iter()
        .filter(|c| c.name.to_lowercase().contains(&term))
        .collect()
}
