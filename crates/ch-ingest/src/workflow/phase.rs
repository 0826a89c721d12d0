//! Workflow phases, events and the per-direction transition table.

use serde::{Deserialize, Serialize};

use crate::core::TransferDirection;
use crate::error::{IngestError, Result};
use crate::ingest::JobPhase;

/// How an ingestion job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    Failed,
    Cancelled,
}

impl JobOutcome {
    /// Outcome for a terminal job phase.
    pub fn from_job_phase(phase: JobPhase) -> Option<Self> {
        match phase {
            JobPhase::Completed => Some(JobOutcome::Completed),
            JobPhase::Failed => Some(JobOutcome::Failed),
            JobPhase::Cancelled => Some(JobOutcome::Cancelled),
            JobPhase::Preparing | JobPhase::Running => None,
        }
    }
}

/// A step of the transfer workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    SelectDirection,
    ConnectSource,
    SelectRelation,
    SelectColumns,
    ConnectTarget,
    MapColumns,
    PreviewData,
    Ingesting,
    Finished(JobOutcome),
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::SelectDirection => f.write_str("select_direction"),
            Phase::ConnectSource => f.write_str("connect_source"),
            Phase::SelectRelation => f.write_str("select_relation"),
            Phase::SelectColumns => f.write_str("select_columns"),
            Phase::ConnectTarget => f.write_str("connect_target"),
            Phase::MapColumns => f.write_str("map_columns"),
            Phase::PreviewData => f.write_str("preview_data"),
            Phase::Ingesting => f.write_str("ingesting"),
            Phase::Finished(outcome) => write!(f, "finished({:?})", outcome),
        }
    }
}

/// Something that completes the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowEvent {
    DirectionChosen(TransferDirection),
    SourceConnected,
    RelationSelected,
    ColumnsSelected,
    TargetConnected,
    MappingConfirmed,
    IngestionStarted,
    IngestionFinished(JobOutcome),
}

impl std::fmt::Display for WorkflowEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowEvent::DirectionChosen(d) => write!(f, "direction_chosen({})", d),
            WorkflowEvent::SourceConnected => f.write_str("source_connected"),
            WorkflowEvent::RelationSelected => f.write_str("relation_selected"),
            WorkflowEvent::ColumnsSelected => f.write_str("columns_selected"),
            WorkflowEvent::TargetConnected => f.write_str("target_connected"),
            WorkflowEvent::MappingConfirmed => f.write_str("mapping_confirmed"),
            WorkflowEvent::IngestionStarted => f.write_str("ingestion_started"),
            WorkflowEvent::IngestionFinished(o) => write!(f, "ingestion_finished({:?})", o),
        }
    }
}

impl WorkflowEvent {
    /// The phase this event completes.
    fn completes(&self) -> Phase {
        match self {
            WorkflowEvent::DirectionChosen(_) => Phase::SelectDirection,
            WorkflowEvent::SourceConnected => Phase::ConnectSource,
            WorkflowEvent::RelationSelected => Phase::SelectRelation,
            WorkflowEvent::ColumnsSelected => Phase::SelectColumns,
            WorkflowEvent::TargetConnected => Phase::ConnectTarget,
            WorkflowEvent::MappingConfirmed => Phase::MapColumns,
            WorkflowEvent::IngestionStarted => Phase::PreviewData,
            WorkflowEvent::IngestionFinished(_) => Phase::Ingesting,
        }
    }
}

const STORE_TO_FILE: [Phase; 8] = [
    Phase::SelectDirection,
    Phase::ConnectSource,
    Phase::SelectRelation,
    Phase::SelectColumns,
    Phase::ConnectTarget,
    Phase::PreviewData,
    Phase::Ingesting,
    Phase::Finished(JobOutcome::Completed),
];

const FILE_TO_STORE: [Phase; 9] = [
    Phase::SelectDirection,
    Phase::ConnectSource,
    Phase::SelectColumns,
    Phase::ConnectTarget,
    Phase::SelectRelation,
    Phase::MapColumns,
    Phase::PreviewData,
    Phase::Ingesting,
    Phase::Finished(JobOutcome::Completed),
];

/// Phase order for a direction. `Finished` stands for every outcome.
pub fn sequence(direction: TransferDirection) -> &'static [Phase] {
    match direction {
        TransferDirection::StoreToFile => &STORE_TO_FILE,
        TransferDirection::FileToStore => &FILE_TO_STORE,
    }
}

/// Same step, ignoring the outcome carried by `Finished`.
fn same_step(a: Phase, b: Phase) -> bool {
    matches!((a, b), (Phase::Finished(_), Phase::Finished(_))) || a == b
}

/// Position of a phase in the direction's sequence.
pub fn index_of(phase: Phase, direction: TransferDirection) -> Option<usize> {
    sequence(direction).iter().position(|p| same_step(*p, phase))
}

/// Apply an event to the current phase.
///
/// Fails with `InvalidTransition` if the event does not complete `current`
/// under `direction`.
pub fn advance(
    current: Phase,
    direction: Option<TransferDirection>,
    event: WorkflowEvent,
) -> Result<Phase> {
    if !same_step(event.completes(), current) {
        return Err(IngestError::invalid_transition(current, event));
    }

    let direction = match (event, direction) {
        (WorkflowEvent::DirectionChosen(d), _) => d,
        (_, Some(d)) => d,
        (_, None) => return Err(IngestError::invalid_transition(current, event)),
    };

    if let WorkflowEvent::IngestionFinished(outcome) = event {
        return Ok(Phase::Finished(outcome));
    }

    let idx = index_of(current, direction)
        .ok_or_else(|| IngestError::invalid_transition(current, event))?;
    sequence(direction)
        .get(idx + 1)
        .copied()
        .ok_or_else(|| IngestError::invalid_transition(current, event))
}

/// Phase before `current` in the direction's sequence.
pub fn previous(current: Phase, direction: TransferDirection) -> Option<Phase> {
    let idx = index_of(current, direction)?;
    idx.checked_sub(1).map(|i| sequence(direction)[i])
}

/// Stepper status of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Current,
    Upcoming,
}

/// One entry of the stepper projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepView {
    pub phase: Phase,
    pub label: &'static str,
    pub status: StepStatus,
}

impl StepView {
    /// Completed or current steps can be navigated to.
    pub fn is_reachable(&self) -> bool {
        matches!(self.status, StepStatus::Completed | StepStatus::Current)
    }
}

/// Display label for a phase.
pub fn label(phase: Phase, direction: Option<TransferDirection>) -> &'static str {
    use TransferDirection::*;
    match (phase, direction) {
        (Phase::SelectDirection, _) => "Select direction",
        (Phase::ConnectSource, Some(FileToStore)) => "Upload file",
        (Phase::ConnectSource, _) => "Connect to store",
        (Phase::SelectRelation, _) => "Select table",
        (Phase::SelectColumns, _) => "Select columns",
        (Phase::ConnectTarget, Some(StoreToFile)) => "Configure file",
        (Phase::ConnectTarget, _) => "Connect to store",
        (Phase::MapColumns, _) => "Map columns",
        (Phase::PreviewData, _) => "Preview",
        (Phase::Ingesting, _) => "Ingest",
        (Phase::Finished(JobOutcome::Completed), _) => "Completed",
        (Phase::Finished(JobOutcome::Failed), _) => "Failed",
        (Phase::Finished(JobOutcome::Cancelled), _) => "Cancelled",
    }
}

/// Stepper view of the workflow. Before a direction is chosen only the
/// direction step is known.
pub fn steps(current: Phase, direction: Option<TransferDirection>) -> Vec<StepView> {
    let Some(dir) = direction else {
        return vec![StepView {
            phase: Phase::SelectDirection,
            label: label(Phase::SelectDirection, None),
            status: StepStatus::Current,
        }];
    };

    let current_idx = index_of(current, dir).unwrap_or(0);
    sequence(dir)
        .iter()
        .enumerate()
        .map(|(i, p)| {
            // Show the real outcome rather than the placeholder.
            let phase = if same_step(*p, current) { current } else { *p };
            let status = if i < current_idx {
                StepStatus::Completed
            } else if i == current_idx {
                StepStatus::Current
            } else {
                StepStatus::Upcoming
            };
            StepView {
                phase,
                label: label(phase, Some(dir)),
                status,
            }
        })
        .collect()
}
