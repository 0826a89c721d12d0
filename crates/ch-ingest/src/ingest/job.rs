//! Job description, handle and progress snapshot types.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::{ConnectionHandle, SchemaAdapter, TransferDirection};
use crate::error::{ErrorKind, IngestError};
use crate::mapping::ResolvedMapping;

/// Lifecycle phase of an ingestion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Preparing,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobPhase {
    /// Preparing or Running.
    pub fn is_active(&self) -> bool {
        matches!(self, JobPhase::Preparing | JobPhase::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobPhase::Preparing => "preparing",
            JobPhase::Running => "running",
            JobPhase::Completed => "completed",
            JobPhase::Failed => "failed",
            JobPhase::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Error recorded on a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&IngestError> for JobError {
    fn from(e: &IngestError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Point-in-time view of a job, published after every committed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_id: Uuid,
    pub phase: JobPhase,
    pub rows_processed: u64,
    pub total_row_estimate: Option<u64>,
    pub batch_size: usize,
    pub batches_committed: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<JobError>,
}

impl ProgressSnapshot {
    /// Initial snapshot for a freshly started job.
    pub fn preparing(job_id: Uuid, total_row_estimate: Option<u64>, batch_size: usize) -> Self {
        Self {
            job_id,
            phase: JobPhase::Preparing,
            rows_processed: 0,
            total_row_estimate,
            batch_size,
            batches_committed: 0,
            started_at: Utc::now(),
            ended_at: None,
            last_error: None,
        }
    }

    /// Percent of the estimate moved so far, for display only.
    ///
    /// `None` when the estimate is unknown or zero. Capped at 100 since the
    /// estimate is advisory and may be exceeded.
    pub fn percent_complete(&self) -> Option<f64> {
        if self.phase == JobPhase::Completed {
            return Some(100.0);
        }
        match self.total_row_estimate {
            Some(total) if total > 0 => {
                Some((self.rows_processed as f64 / total as f64 * 100.0).min(100.0))
            }
            _ => None,
        }
    }

    /// Wall time since start, up to the end for terminal jobs.
    pub fn elapsed(&self) -> Duration {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).to_std().unwrap_or_default()
    }

    pub fn rows_per_second(&self) -> Option<f64> {
        let secs = self.elapsed().as_secs_f64();
        if secs <= 0.0 || self.rows_processed == 0 {
            None
        } else {
            Some(self.rows_processed as f64 / secs)
        }
    }

    /// Projected time left based on throughput so far.
    pub fn estimated_remaining(&self) -> Option<Duration> {
        if !self.phase.is_active() {
            return None;
        }
        let total = self.total_row_estimate.filter(|t| *t > 0)?;
        let rate = self.rows_per_second()?;
        let remaining = total.saturating_sub(self.rows_processed);
        Some(Duration::from_secs_f64(remaining as f64 / rate))
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        let mut out = format!("{} - {} rows", self.phase, self.rows_processed);
        if let Some(total) = self.total_row_estimate {
            out.push_str(&format!(" of ~{}", total));
        }
        if let Some(pct) = self.percent_complete() {
            out.push_str(&format!(" ({:.1}%)", pct));
        }
        out.push_str(&format!(", elapsed {}", format_duration(self.elapsed())));
        if let Some(eta) = self.estimated_remaining() {
            out.push_str(&format!(", ~{} remaining", format_duration(eta)));
        }
        if let Some(err) = &self.last_error {
            out.push_str(&format!(": {}", err.message));
        }
        out
    }
}

/// Format a duration as "42 sec" or "3 min 5 sec".
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{} sec", secs)
    } else {
        format!("{} min {} sec", secs / 60, secs % 60)
    }
}

/// Everything needed to run one transfer.
#[derive(Clone)]
pub struct JobSpec {
    pub direction: TransferDirection,
    pub source: Arc<dyn SchemaAdapter>,
    pub source_conn: ConnectionHandle,
    pub target: Arc<dyn SchemaAdapter>,
    pub target_conn: ConnectionHandle,
    pub source_relation: String,
    pub target_relation: String,
    /// Columns to stream from the source, in stream order.
    pub source_columns: Vec<String>,
    pub mapping: ResolvedMapping,
    pub total_row_estimate: Option<u64>,
    /// Skip this many source rows (adapter must support offsets).
    pub resume_from: Option<u64>,
}

impl JobSpec {
    /// Human description, e.g. `uk_price_paid → export`.
    pub fn describe(&self) -> String {
        format!(
            "{} ({}) → {} ({})",
            self.source_relation,
            self.source.endpoint_kind(),
            self.target_relation,
            self.target.endpoint_kind()
        )
    }
}

impl std::fmt::Debug for JobSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSpec")
            .field("direction", &self.direction)
            .field("source_relation", &self.source_relation)
            .field("target_relation", &self.target_relation)
            .field("source_columns", &self.source_columns)
            .field("mapping", &self.mapping)
            .field("total_row_estimate", &self.total_row_estimate)
            .field("resume_from", &self.resume_from)
            .finish()
    }
}

/// Caller-side handle to a started job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub job_id: Uuid,
    pub(crate) progress: watch::Receiver<ProgressSnapshot>,
    pub(crate) cancel: CancellationToken,
}

impl JobHandle {
    /// Last published snapshot. Never blocks behind adapter I/O.
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.progress.borrow().clone()
    }

    /// Receiver for awaiting changes directly.
    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress.clone()
    }
}
