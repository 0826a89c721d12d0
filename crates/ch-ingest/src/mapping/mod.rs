//! Column mapping between a source schema and a target schema.
//!
//! A [`ColumnMapping`] is the editable draft: one entry per selected source
//! column, each with at most one target. [`finalize`] turns a draft into a
//! [`ResolvedMapping`], which only keeps entries that actually transfer data
//! and can build a [`Projector`] for reshaping batches.

use serde::{Deserialize, Serialize};

use crate::core::{find_column, Batch, ColumnDescriptor};
use crate::error::{IngestError, Result};

/// One source column and the target column it feeds, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub source: ColumnDescriptor,
    pub target: Option<ColumnDescriptor>,
}

/// Draft mapping, one entry per selected source column in source order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    entries: Vec<MappingEntry>,
}

impl ColumnMapping {
    /// Mapping where every column maps onto itself.
    pub fn identity(columns: &[ColumnDescriptor]) -> Self {
        Self {
            entries: columns
                .iter()
                .map(|c| MappingEntry {
                    source: c.clone(),
                    target: Some(c.clone()),
                })
                .collect(),
        }
    }

    pub fn entries(&self) -> &[MappingEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Target name currently assigned to a source column.
    pub fn target_of(&self, source: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.source.name == source)
            .and_then(|e| e.target.as_ref())
            .map(|t| t.name.as_str())
    }

    /// Number of entries that have a target.
    pub fn mapped_count(&self) -> usize {
        self.entries.iter().filter(|e| e.target.is_some()).count()
    }

    /// Rebind every assigned target to its current descriptor in
    /// `target_columns`. Fails if a target no longer exists.
    pub fn revalidate(&self, target_columns: &[ColumnDescriptor]) -> Result<ColumnMapping> {
        let entries = self
            .entries
            .iter()
            .map(|entry| {
                let target = match &entry.target {
                    Some(target) => Some(
                        find_column(target_columns, &target.name)
                            .cloned()
                            .ok_or_else(|| {
                                IngestError::Schema(format!(
                                    "target column '{}' (mapped from '{}') no longer exists",
                                    target.name, entry.source.name
                                ))
                            })?,
                    ),
                    None => None,
                };
                Ok(MappingEntry {
                    source: entry.source.clone(),
                    target,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ColumnMapping { entries })
    }

    /// Source column already holding `target`, other than `except`.
    fn holder_of(&self, target: &str, except: Option<usize>) -> Option<&MappingEntry> {
        self.entries.iter().enumerate().find_map(|(i, e)| {
            let held = e.target.as_ref().is_some_and(|t| t.name == target);
            (held && Some(i) != except).then_some(e)
        })
    }
}

/// Propose a default mapping.
///
/// Each source column gets the first target column whose name is equal under
/// case-insensitive comparison, or no target. A target claimed by an earlier
/// source column is skipped.
pub fn propose(source: &[ColumnDescriptor], target: &[ColumnDescriptor]) -> ColumnMapping {
    let mut claimed = vec![false; target.len()];
    let entries = source
        .iter()
        .map(|s| {
            let hit = (0..target.len()).find(|&i| !claimed[i] && target[i].matches_name(&s.name));
            if let Some(i) = hit {
                claimed[i] = true;
            }
            MappingEntry {
                source: s.clone(),
                target: hit.map(|i| target[i].clone()),
            }
        })
        .collect();
    ColumnMapping { entries }
}

/// Override the target of one entry. `None` excludes the column.
///
/// A target already held by another source column is rejected.
pub fn set_target(
    mapping: &ColumnMapping,
    source_name: &str,
    target_name: Option<&str>,
    target_columns: &[ColumnDescriptor],
) -> Result<ColumnMapping> {
    let position = mapping
        .entries
        .iter()
        .position(|e| e.source.name == source_name)
        .ok_or_else(|| IngestError::UnknownSource(source_name.to_string()))?;

    let target = match target_name {
        Some(name) => Some(
            find_column(target_columns, name)
                .cloned()
                .ok_or_else(|| IngestError::UnknownTarget(name.to_string()))?,
        ),
        None => None,
    };

    if let Some(t) = &target {
        if let Some(holder) = mapping.holder_of(&t.name, Some(position)) {
            return Err(IngestError::DuplicateTarget {
                target: t.name.clone(),
                source_column: holder.source.name.clone(),
            });
        }
    }

    let mut updated = mapping.clone();
    updated.entries[position].target = target;
    Ok(updated)
}

/// Resolve a draft into the entries that carry data.
pub fn finalize(mapping: &ColumnMapping) -> Result<ResolvedMapping> {
    let pairs: Vec<ResolvedEntry> = mapping
        .entries
        .iter()
        .filter_map(|e| {
            e.target.as_ref().map(|t| ResolvedEntry {
                source: e.source.clone(),
                target: t.clone(),
            })
        })
        .collect();

    if pairs.is_empty() {
        return Err(IngestError::EmptyMapping);
    }
    for (i, pair) in pairs.iter().enumerate() {
        if let Some(first) = pairs[..i].iter().find(|p| p.target.name == pair.target.name) {
            return Err(IngestError::DuplicateTarget {
                target: pair.target.name.clone(),
                source_column: first.source.name.clone(),
            });
        }
    }
    Ok(ResolvedMapping { entries: pairs })
}

/// A source column paired with its target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedEntry {
    pub source: ColumnDescriptor,
    pub target: ColumnDescriptor,
}

/// Finalized mapping: non-empty, every entry has a target, source order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedMapping {
    entries: Vec<ResolvedEntry>,
}

impl ResolvedMapping {
    pub fn entries(&self) -> &[ResolvedEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Source column names to read, in output order.
    pub fn source_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.source.name.clone()).collect()
    }

    /// Target column names to write, in output order.
    pub fn target_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.target.name.clone()).collect()
    }

    /// Columns as they land on the target. A column fed from a differently
    /// named source column carries that name as its origin.
    pub fn output_columns(&self) -> Vec<ColumnDescriptor> {
        self.entries
            .iter()
            .map(|e| {
                if e.target.name == e.source.name {
                    e.target.clone()
                } else {
                    e.target.clone().with_origin(e.source.name.clone())
                }
            })
            .collect()
    }

    /// Build a projector for batches whose rows are laid out as `stream_columns`.
    pub fn projector(&self, stream_columns: &[String]) -> Result<Projector> {
        let indices = self
            .entries
            .iter()
            .map(|e| {
                stream_columns
                    .iter()
                    .position(|c| c == &e.source.name)
                    .ok_or_else(|| {
                        IngestError::Schema(format!(
                            "source column '{}' is not part of the stream",
                            e.source.name
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let identity = indices.len() == stream_columns.len()
            && indices.iter().enumerate().all(|(i, &idx)| i == idx);

        Ok(Projector { indices, identity })
    }
}

/// Reorders and drops cells so rows match the resolved target layout.
#[derive(Debug, Clone)]
pub struct Projector {
    indices: Vec<usize>,
    identity: bool,
}

impl Projector {
    /// Project every row of a batch.
    pub fn project(&self, batch: Batch) -> Batch {
        if self.identity {
            return batch;
        }
        let rows = batch
            .rows
            .into_iter()
            .map(|row| {
                self.indices
                    .iter()
                    .map(|&i| row.get(i).cloned().unwrap_or(crate::core::Value::Null))
                    .collect()
            })
            .collect();
        Batch::new(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;

    fn source_cols() -> Vec<ColumnDescriptor> {
        vec![
            ColumnDescriptor::new("id", "String"),
            ColumnDescriptor::new("price", "Decimal(10,2)"),
            ColumnDescriptor::new("date", "Date"),
        ]
    }

    fn target_cols() -> Vec<ColumnDescriptor> {
        vec![
            ColumnDescriptor::new("ID", "String"),
            ColumnDescriptor::new("Price", "Decimal(10,2)"),
        ]
    }

    #[test]
    fn test_propose_case_insensitive() {
        let mapping = propose(&source_cols(), &target_cols());
        assert_eq!(mapping.target_of("id"), Some("ID"));
        assert_eq!(mapping.target_of("price"), Some("Price"));
        assert_eq!(mapping.target_of("date"), None);
        assert_eq!(mapping.mapped_count(), 2);
    }

    #[test]
    fn test_propose_is_deterministic() {
        let a = propose(&source_cols(), &target_cols());
        let b = propose(&source_cols(), &target_cols());
        assert_eq!(a, b);
    }

    #[test]
    fn test_propose_takes_first_match_and_never_substring() {
        let source = vec![ColumnDescriptor::new("code", "String")];
        let target = vec![
            ColumnDescriptor::new("postcode", "String"),
            ColumnDescriptor::new("CODE", "String"),
            ColumnDescriptor::new("code", "String"),
        ];
        let mapping = propose(&source, &target);
        assert_eq!(mapping.target_of("code"), Some("CODE"));
    }

    #[test]
    fn test_set_target_override_and_clear() {
        let targets = target_cols();
        let mapping = propose(&source_cols(), &targets);
        let mapping = set_target(&mapping, "price", None, &targets).unwrap();
        let mapping = set_target(&mapping, "date", Some("price"), &targets).unwrap();
        assert_eq!(mapping.target_of("date"), Some("Price"));
        let mapping = set_target(&mapping, "id", None, &targets).unwrap();
        assert_eq!(mapping.target_of("id"), None);
        // Re-assigning an entry its own target is not a conflict.
        let mapping = set_target(&mapping, "date", Some("PRICE"), &targets).unwrap();
        assert_eq!(mapping.target_of("date"), Some("Price"));
    }

    #[test]
    fn test_set_target_rejects_taken_target() {
        let targets = target_cols();
        let mapping = propose(&source_cols(), &targets);
        match set_target(&mapping, "date", Some("ID"), &targets) {
            Err(IngestError::DuplicateTarget {
                target,
                source_column,
            }) => {
                assert_eq!(target, "ID");
                assert_eq!(source_column, "id");
            }
            other => panic!("expected DuplicateTarget, got {:?}", other),
        }
        assert_eq!(mapping.target_of("date"), None);
    }

    #[test]
    fn test_propose_gives_each_target_once() {
        let source = vec![
            ColumnDescriptor::new("code", "String"),
            ColumnDescriptor::new("CODE", "String"),
            ColumnDescriptor::new("Code", "String"),
        ];
        let target = vec![
            ColumnDescriptor::new("Code", "String"),
            ColumnDescriptor::new("code", "String"),
        ];
        let mapping = propose(&source, &target);
        assert_eq!(mapping.target_of("code"), Some("Code"));
        assert_eq!(mapping.target_of("CODE"), Some("code"));
        assert_eq!(mapping.target_of("Code"), None);
        assert!(finalize(&mapping).is_ok());
    }

    #[test]
    fn test_set_target_unknown_names() {
        let targets = target_cols();
        let mapping = propose(&source_cols(), &targets);
        assert!(matches!(
            set_target(&mapping, "nope", None, &targets),
            Err(IngestError::UnknownSource(_))
        ));
        assert!(matches!(
            set_target(&mapping, "id", Some("nope"), &targets),
            Err(IngestError::UnknownTarget(_))
        ));
    }

    #[test]
    fn test_finalize_drops_unmapped() {
        let mapping = propose(&source_cols(), &target_cols());
        let resolved = finalize(&mapping).unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved.source_names(), vec!["id", "price"]);
        assert_eq!(resolved.target_names(), vec!["ID", "Price"]);
    }

    #[test]
    fn test_finalize_empty() {
        assert!(matches!(
            finalize(&ColumnMapping::default()),
            Err(IngestError::EmptyMapping)
        ));
        let none_mapped = propose(&source_cols(), &[]);
        assert!(matches!(finalize(&none_mapped), Err(IngestError::EmptyMapping)));
    }

    #[test]
    fn test_finalize_rejects_duplicate_targets() {
        let id = ColumnDescriptor::new("ID", "String");
        let mapping = ColumnMapping {
            entries: vec![
                MappingEntry {
                    source: ColumnDescriptor::new("id", "String"),
                    target: Some(id.clone()),
                },
                MappingEntry {
                    source: ColumnDescriptor::new("date", "Date"),
                    target: Some(id),
                },
            ],
        };
        assert!(matches!(
            finalize(&mapping),
            Err(IngestError::DuplicateTarget { .. })
        ));
    }

    #[test]
    fn test_revalidate_rebinds_changed_types() {
        let mapping = propose(&source_cols(), &target_cols());
        let changed = vec![
            ColumnDescriptor::new("ID", "UInt64"),
            ColumnDescriptor::new("Price", "Float64"),
            ColumnDescriptor::new("Note", "String"),
        ];
        let rebound = mapping.revalidate(&changed).unwrap();
        let resolved = finalize(&rebound).unwrap();
        let types: Vec<&str> = resolved
            .entries()
            .iter()
            .map(|e| e.target.data_type.as_str())
            .collect();
        assert_eq!(types, vec!["UInt64", "Float64"]);
        assert_eq!(rebound.target_of("date"), None);
    }

    #[test]
    fn test_revalidate_detects_missing_target() {
        let mapping = propose(&source_cols(), &target_cols());
        assert!(mapping.revalidate(&target_cols()).is_ok());
        let shrunk = vec![ColumnDescriptor::new("ID", "String")];
        assert!(matches!(
            mapping.revalidate(&shrunk),
            Err(IngestError::Schema(_))
        ));
    }

    #[test]
    fn test_projector_reorders_and_drops() {
        let targets = target_cols();
        let mapping = propose(&source_cols(), &targets);
        let mapping = set_target(&mapping, "id", None, &targets).unwrap();
        let mapping = set_target(&mapping, "date", Some("ID"), &targets).unwrap();
        let resolved = finalize(&mapping).unwrap();

        let stream: Vec<String> = vec!["id".into(), "price".into(), "date".into()];
        let projector = resolved.projector(&stream).unwrap();
        let batch = Batch::new(vec![vec![
            Value::from("a"),
            Value::from("1.50"),
            Value::from("2024-01-01"),
        ]]);
        let out = projector.project(batch);
        assert_eq!(
            out.rows[0],
            vec![Value::from("1.50"), Value::from("2024-01-01")]
        );
    }

    #[test]
    fn test_output_columns_record_renames() {
        let targets = vec![
            ColumnDescriptor::new("ID", "String"),
            ColumnDescriptor::new("price", "Decimal(10,2)"),
        ];
        let resolved = finalize(&propose(&source_cols(), &targets)).unwrap();
        let out = resolved.output_columns();
        assert_eq!(out[0].name, "ID");
        assert_eq!(out[0].origin.as_deref(), Some("id"));
        assert_eq!(out[1].origin, None);
    }

    #[test]
    fn test_projector_rejects_missing_stream_column() {
        let resolved = finalize(&ColumnMapping::identity(&source_cols())).unwrap();
        assert!(resolved.projector(&["id".to_string()]).is_err());
    }
}
