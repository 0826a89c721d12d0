//! Ingestion engine: runs one batched, cancellable transfer job at a time.
//!
//! A job streams batches out of the source adapter, projects them through the
//! resolved mapping and hands them to the target adapter one at a time, in
//! source order. After every committed batch a [`ProgressSnapshot`] is
//! published to a `watch` channel (for polling) and, if registered, to a push
//! channel.

mod job;

pub use job::{format_duration, JobError, JobHandle, JobPhase, JobSpec, ProgressSnapshot};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::IngestConfig;
use crate::core::StreamRequest;
use crate::error::{IngestError, Result};

/// Batch size for a job.
///
/// `max(ceil(estimate / progress_updates), min_batch_size)`, optionally capped
/// by `max_batch_size`. An unknown or zero estimate uses `min_batch_size`.
pub fn batch_size_for(estimate: Option<u64>, config: &IngestConfig) -> usize {
    let min = config.min_batch_size.max(1);
    let size = match estimate {
        Some(total) if total > 0 => {
            let updates = config.progress_updates.max(1);
            let per_update = total.div_ceil(updates);
            usize::try_from(per_update).unwrap_or(usize::MAX).max(min)
        }
        _ => min,
    };
    match config.max_batch_size {
        Some(max) => size.min(max.max(min)),
        None => size,
    }
}

/// Publishes snapshots to the watch channel and the optional push channel.
#[derive(Clone)]
struct Publisher {
    watch: Arc<watch::Sender<ProgressSnapshot>>,
    push: Option<mpsc::UnboundedSender<ProgressSnapshot>>,
}

impl Publisher {
    /// Publish unless the job already reached a terminal phase.
    fn publish(&self, snapshot: &ProgressSnapshot) {
        let sent = self.watch.send_if_modified(|current| {
            if current.phase.is_terminal() {
                return false;
            }
            *current = snapshot.clone();
            true
        });
        if sent {
            if let Some(tx) = &self.push {
                let _ = tx.send(snapshot.clone());
            }
        }
    }

    fn current(&self) -> ProgressSnapshot {
        self.watch.borrow().clone()
    }
}

struct ActiveJob {
    job_id: Uuid,
    publisher: Publisher,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Executes transfer jobs, one at a time.
pub struct IngestionEngine {
    config: IngestConfig,
    progress_tx: Option<mpsc::UnboundedSender<ProgressSnapshot>>,
    active: Mutex<Option<ActiveJob>>,
}

impl IngestionEngine {
    pub fn new(config: IngestConfig) -> Self {
        Self {
            config,
            progress_tx: None,
            active: Mutex::new(None),
        }
    }

    /// Also push every published snapshot to `tx`, in publication order.
    pub fn with_progress(mut self, tx: mpsc::UnboundedSender<ProgressSnapshot>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Start a job. Fails if another job is still preparing or running.
    pub async fn start(&self, spec: JobSpec) -> Result<JobHandle> {
        let mut active = self.active.lock().await;
        if let Some(job) = active.as_ref() {
            if job.publisher.current().phase.is_active() {
                return Err(IngestError::JobAlreadyRunning(job.job_id.to_string()));
            }
        }

        if spec.resume_from.is_some() && !spec.source.supports_offset() {
            return Err(IngestError::Validation(format!(
                "{} source cannot resume from an offset",
                spec.source.endpoint_kind()
            )));
        }

        let job_id = Uuid::new_v4();
        let batch_size = batch_size_for(spec.total_row_estimate, &self.config);
        let initial = ProgressSnapshot::preparing(job_id, spec.total_row_estimate, batch_size);
        let (watch_tx, watch_rx) = watch::channel(initial.clone());
        let publisher = Publisher {
            watch: Arc::new(watch_tx),
            push: self.progress_tx.clone(),
        };
        publisher.publish(&initial);

        info!(
            "Starting job {}: {} [{}], batch size {}, estimate {:?}",
            job_id,
            spec.describe(),
            spec.direction,
            batch_size,
            spec.total_row_estimate
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_job(
            spec,
            initial,
            self.config.stream_buffer,
            publisher.clone(),
            cancel.clone(),
        ));

        *active = Some(ActiveJob {
            job_id,
            publisher,
            cancel: cancel.clone(),
            task,
        });

        Ok(JobHandle {
            job_id,
            progress: watch_rx,
            cancel,
        })
    }

    /// Last published snapshot for the job.
    pub fn status(&self, handle: &JobHandle) -> ProgressSnapshot {
        handle.snapshot()
    }

    /// Snapshot of the most recent job, if any.
    pub async fn current(&self) -> Option<ProgressSnapshot> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|job| job.publisher.current())
    }

    /// Whether a job is preparing or running.
    pub async fn is_busy(&self) -> bool {
        self.current()
            .await
            .map(|s| s.phase.is_active())
            .unwrap_or(false)
    }

    /// Request cooperative cancellation. A no-op for finished jobs.
    pub fn cancel(&self, handle: &JobHandle) {
        if handle.snapshot().phase.is_active() {
            info!("Cancellation requested for job {}", handle.job_id);
            handle.cancel.cancel();
        }
    }

    /// Cancel the most recent job, whatever handle started it.
    pub async fn cancel_current(&self) -> Result<()> {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(job) if job.publisher.current().phase.is_active() => {
                info!("Cancellation requested for job {}", job.job_id);
                job.cancel.cancel();
                Ok(())
            }
            _ => Err(IngestError::NoActiveJob),
        }
    }

    /// Wait until the job reaches a terminal phase.
    pub async fn wait(&self, handle: &JobHandle) -> ProgressSnapshot {
        wait_terminal(handle.subscribe()).await
    }

    /// Cancel the active job and wait up to `grace` for it to stop.
    ///
    /// If the job does not stop in time its task is aborted and it is
    /// force-marked Cancelled. Returns the final snapshot, or `None` when
    /// there was never a job.
    pub async fn cancel_and_wait(&self, grace: Duration) -> Option<ProgressSnapshot> {
        let mut active = self.active.lock().await;
        let job = active.as_mut()?;

        let current = job.publisher.current();
        if current.phase.is_terminal() {
            return Some(current);
        }

        job.cancel.cancel();
        let rx = job.publisher.watch.subscribe();
        match tokio::time::timeout(grace, wait_terminal(rx)).await {
            Ok(snapshot) => Some(snapshot),
            Err(_) => {
                warn!(
                    "Job {} did not stop within {:?}; aborting",
                    job.job_id, grace
                );
                job.task.abort();
                // Abort lands at the task's next await; a batch already
                // inside the target finishes and publishes first.
                let _ = (&mut job.task).await;
                let mut forced = job.publisher.current();
                if forced.phase.is_active() {
                    forced.phase = JobPhase::Cancelled;
                    forced.ended_at = Some(Utc::now());
                    job.publisher.publish(&forced);
                }
                Some(forced)
            }
        }
    }
}

async fn wait_terminal(mut rx: watch::Receiver<ProgressSnapshot>) -> ProgressSnapshot {
    loop {
        let snapshot = rx.borrow_and_update().clone();
        if snapshot.phase.is_terminal() {
            return snapshot;
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone();
        }
    }
}

enum Outcome {
    Completed,
    Failed(IngestError),
    Cancelled,
}

async fn run_job(
    spec: JobSpec,
    mut snapshot: ProgressSnapshot,
    stream_buffer: usize,
    publisher: Publisher,
    cancel: CancellationToken,
) {
    let outcome = transfer(&spec, &mut snapshot, stream_buffer, &publisher, &cancel).await;

    snapshot.ended_at = Some(Utc::now());
    match outcome {
        Outcome::Completed => {
            snapshot.phase = JobPhase::Completed;
            info!(
                "Job {} completed: {} rows in {} batches ({})",
                snapshot.job_id,
                snapshot.rows_processed,
                snapshot.batches_committed,
                format_duration(snapshot.elapsed())
            );
        }
        Outcome::Cancelled => {
            snapshot.phase = JobPhase::Cancelled;
            info!(
                "Job {} cancelled after {} rows",
                snapshot.job_id, snapshot.rows_processed
            );
        }
        Outcome::Failed(e) => {
            snapshot.phase = JobPhase::Failed;
            error!(
                "Job {} failed after {} rows: {}",
                snapshot.job_id, snapshot.rows_processed, e
            );
            snapshot.last_error = Some(JobError::from(&e));
        }
    }
    publisher.publish(&snapshot);
}

async fn transfer(
    spec: &JobSpec,
    snapshot: &mut ProgressSnapshot,
    stream_buffer: usize,
    publisher: &Publisher,
    cancel: &CancellationToken,
) -> Outcome {
    let target_columns = spec.mapping.target_names();

    let prepared = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Outcome::Cancelled,
        r = spec.target.prepare_target(&spec.target_conn, &spec.target_relation, &target_columns) => r,
    };
    if let Err(e) = prepared {
        return Outcome::Failed(e);
    }

    let projector = match spec.mapping.projector(&spec.source_columns) {
        Ok(p) => p,
        Err(e) => return Outcome::Failed(e),
    };

    snapshot.phase = JobPhase::Running;
    publisher.publish(snapshot);

    let mut request = StreamRequest::new(
        spec.source_relation.clone(),
        spec.source_columns.clone(),
        snapshot.batch_size,
    );
    request.offset = spec.resume_from.unwrap_or(0);
    request.buffer = stream_buffer.max(1);
    // Dropping the receiver on return stops the producer.
    let mut rx = spec.source.stream_rows(&spec.source_conn, request);

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Outcome::Cancelled,
            next = rx.recv() => next,
        };

        let batch = match next {
            None => return Outcome::Completed,
            Some(Err(e)) => return Outcome::Failed(e),
            Some(Ok(batch)) if batch.is_empty() => continue,
            Some(Ok(batch)) => projector.project(batch),
        };

        let rows = batch.len() as u64;
        if let Err(e) = spec
            .target
            .accept_rows(&spec.target_conn, &spec.target_relation, &target_columns, batch)
            .await
        {
            return Outcome::Failed(e);
        }

        snapshot.rows_processed += rows;
        snapshot.batches_committed += 1;
        debug!(
            "Job {}: batch {} committed, {} rows total",
            snapshot.job_id, snapshot.batches_committed, snapshot.rows_processed
        );
        publisher.publish(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> IngestConfig {
        IngestConfig::default()
    }

    #[test]
    fn test_batch_size_from_estimate() {
        assert_eq!(batch_size_for(Some(5000), &config()), 250);
        assert_eq!(batch_size_for(Some(5001), &config()), 251);
    }

    #[test]
    fn test_batch_size_respects_minimum() {
        assert_eq!(batch_size_for(Some(500), &config()), 100);
        assert_eq!(batch_size_for(None, &config()), 100);
        assert_eq!(batch_size_for(Some(0), &config()), 100);
    }

    #[test]
    fn test_batch_size_cap() {
        let mut cfg = config();
        cfg.max_batch_size = Some(1000);
        assert_eq!(batch_size_for(Some(26_987_992), &cfg), 1000);
        cfg.max_batch_size = None;
        assert_eq!(batch_size_for(Some(26_987_992), &cfg), 1_349_400);
    }

    #[test]
    fn test_publisher_keeps_terminal_snapshot() {
        let initial = ProgressSnapshot::preparing(Uuid::new_v4(), Some(1000), 100);
        let (watch_tx, watch_rx) = watch::channel(initial.clone());
        let (push_tx, mut push_rx) = mpsc::unbounded_channel();
        let publisher = Publisher {
            watch: Arc::new(watch_tx),
            push: Some(push_tx),
        };

        let mut cancelled = initial.clone();
        cancelled.phase = JobPhase::Cancelled;
        publisher.publish(&cancelled);

        let mut late = initial;
        late.phase = JobPhase::Running;
        late.rows_processed = 100;
        publisher.publish(&late);

        assert_eq!(watch_rx.borrow().phase, JobPhase::Cancelled);
        assert_eq!(watch_rx.borrow().rows_processed, 0);
        assert_eq!(push_rx.try_recv().unwrap().phase, JobPhase::Cancelled);
        assert!(push_rx.try_recv().is_err());
    }
}
