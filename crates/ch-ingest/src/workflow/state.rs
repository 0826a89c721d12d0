//! Workflow state owned by the orchestrator.

use crate::core::{ColumnDescriptor, ConnectionHandle, Relation, Row, TransferDirection};
use crate::ingest::{JobHandle, ProgressSnapshot};
use crate::mapping::{ColumnMapping, ResolvedMapping};

use super::phase::{index_of, sequence, Phase};

/// Everything captured while walking through the workflow.
///
/// Each field is produced by exactly one phase (which one depends on the
/// direction), so going back can drop precisely what later phases captured.
#[derive(Debug, Clone)]
pub struct WorkflowState {
    pub phase: Phase,
    pub direction: Option<TransferDirection>,

    pub source_conn: Option<ConnectionHandle>,
    pub target_conn: Option<ConnectionHandle>,

    /// Relations listed by the store.
    pub relations: Vec<Relation>,

    pub source_relation: Option<Relation>,
    pub target_relation: Option<Relation>,

    /// Every column of the source relation.
    pub source_columns: Vec<ColumnDescriptor>,
    /// Source columns chosen for transfer, in source order.
    pub selected_columns: Vec<ColumnDescriptor>,
    /// Every column of the target relation.
    pub target_columns: Vec<ColumnDescriptor>,

    pub mapping: Option<ColumnMapping>,
    pub resolved: Option<ResolvedMapping>,

    /// Column names of the preview rows.
    pub preview_columns: Vec<String>,
    pub preview: Vec<Row>,

    pub job: Option<JobHandle>,
    /// Final snapshot of the last finished job.
    pub last_snapshot: Option<ProgressSnapshot>,
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self {
            phase: Phase::SelectDirection,
            direction: None,
            source_conn: None,
            target_conn: None,
            relations: Vec::new(),
            source_relation: None,
            target_relation: None,
            source_columns: Vec::new(),
            selected_columns: Vec::new(),
            target_columns: Vec::new(),
            mapping: None,
            resolved: None,
            preview_columns: Vec::new(),
            preview: Vec::new(),
            job: None,
            last_snapshot: None,
        }
    }
}

/// Sessions dropped from the state that the caller must disconnect.
#[derive(Debug, Default)]
pub struct Discarded {
    pub source_conn: Option<ConnectionHandle>,
    pub target_conn: Option<ConnectionHandle>,
}

impl WorkflowState {
    /// Drop everything owned by `phase` and every later phase.
    pub fn discard_from(&mut self, phase: Phase) -> Discarded {
        let mut discarded = Discarded::default();
        let Some(direction) = self.direction else {
            return discarded;
        };
        let Some(start) = index_of(phase, direction) else {
            return discarded;
        };
        for p in &sequence(direction)[start..] {
            self.clear_owned(*p, direction, &mut discarded);
        }
        discarded
    }

    fn clear_owned(&mut self, phase: Phase, direction: TransferDirection, out: &mut Discarded) {
        use TransferDirection::*;
        match (phase, direction) {
            (Phase::SelectDirection, _) => {
                self.direction = None;
            }
            (Phase::ConnectSource, StoreToFile) => {
                out.source_conn = self.source_conn.take();
                self.relations.clear();
            }
            (Phase::ConnectSource, FileToStore) => {
                out.source_conn = self.source_conn.take();
                self.source_relation = None;
                self.source_columns.clear();
            }
            (Phase::SelectRelation, StoreToFile) => {
                self.source_relation = None;
                self.source_columns.clear();
            }
            (Phase::SelectRelation, FileToStore) => {
                self.target_relation = None;
                self.target_columns.clear();
            }
            (Phase::SelectColumns, _) => {
                self.selected_columns.clear();
            }
            (Phase::ConnectTarget, StoreToFile) => {
                out.target_conn = self.target_conn.take();
                self.target_relation = None;
                self.target_columns.clear();
                self.mapping = None;
                self.resolved = None;
            }
            (Phase::ConnectTarget, FileToStore) => {
                out.target_conn = self.target_conn.take();
                self.relations.clear();
            }
            (Phase::MapColumns, _) => {
                self.mapping = None;
                self.resolved = None;
            }
            (Phase::PreviewData, _) => {
                self.preview_columns.clear();
                self.preview.clear();
            }
            (Phase::Ingesting, _) | (Phase::Finished(_), _) => {
                self.job = None;
                self.last_snapshot = None;
            }
        }
    }

    /// Source relation name, if known.
    pub fn source_relation_name(&self) -> Option<&str> {
        self.source_relation.as_ref().map(|r| r.name.as_str())
    }

    /// Target relation name, if known.
    pub fn target_relation_name(&self) -> Option<&str> {
        self.target_relation.as_ref().map(|r| r.name.as_str())
    }
}
