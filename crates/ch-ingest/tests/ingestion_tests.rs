//! Ingestion engine scenarios driven by the synthetic endpoint.

use std::sync::Arc;
use std::time::Duration;

use ch_ingest::mapping::{finalize, ColumnMapping};
use ch_ingest::{
    Batch, ColumnDescriptor, ConnectionHandle, Credentials, ErrorKind, IngestConfig, IngestError,
    IngestionEngine, JobHandle, JobPhase, JobSpec, ProgressSnapshot, Relation, Row,
    SchemaAdapter, StreamRequest, SyntheticEndpoint, TransferDirection,
};
use tokio::sync::mpsc;

/// Sink whose writes hold the worker thread instead of yielding.
#[derive(Clone)]
struct BlockingSink {
    inner: SyntheticEndpoint,
    hold: Duration,
}

#[async_trait::async_trait]
impl SchemaAdapter for BlockingSink {
    async fn connect(&self, credentials: &Credentials) -> ch_ingest::Result<ConnectionHandle> {
        self.inner.connect(credentials).await
    }

    async fn list_relations(&self, conn: &ConnectionHandle) -> ch_ingest::Result<Vec<Relation>> {
        self.inner.list_relations(conn).await
    }

    async fn list_columns(
        &self,
        conn: &ConnectionHandle,
        relation: &str,
    ) -> ch_ingest::Result<Vec<ColumnDescriptor>> {
        self.inner.list_columns(conn, relation).await
    }

    async fn fetch_preview(
        &self,
        conn: &ConnectionHandle,
        relation: &str,
        columns: &[String],
        limit: usize,
    ) -> ch_ingest::Result<Vec<Row>> {
        self.inner.fetch_preview(conn, relation, columns, limit).await
    }

    fn stream_rows(
        &self,
        conn: &ConnectionHandle,
        request: StreamRequest,
    ) -> mpsc::Receiver<ch_ingest::Result<Batch>> {
        self.inner.stream_rows(conn, request)
    }

    async fn accept_rows(
        &self,
        conn: &ConnectionHandle,
        relation: &str,
        columns: &[String],
        batch: Batch,
    ) -> ch_ingest::Result<u64> {
        std::thread::sleep(self.hold);
        self.inner.accept_rows(conn, relation, columns, batch).await
    }

    async fn disconnect(&self, conn: &ConnectionHandle) {
        self.inner.disconnect(conn).await
    }

    fn endpoint_kind(&self) -> &str {
        self.inner.endpoint_kind()
    }
}

fn creds() -> Credentials {
    Credentials::File {
        path: "synthetic".into(),
        delimiter: b',',
        has_headers: true,
    }
}

async fn job_spec(
    source: &SyntheticEndpoint,
    sink: &SyntheticEndpoint,
    estimate: Option<u64>,
) -> JobSpec {
    let source_conn = source.connect(&creds()).await.unwrap();
    let target_conn = sink.connect(&creds()).await.unwrap();
    let mapping = finalize(&ColumnMapping::identity(&SyntheticEndpoint::columns())).unwrap();
    JobSpec {
        direction: TransferDirection::StoreToFile,
        source: Arc::new(source.clone()),
        source_conn,
        target: Arc::new(sink.clone()),
        target_conn,
        source_relation: "events".into(),
        target_relation: "sink".into(),
        source_columns: mapping.source_names(),
        mapping,
        total_row_estimate: estimate,
        resume_from: None,
    }
}

async fn wait_for_rows(handle: &JobHandle, rows: u64) {
    let mut rx = handle.subscribe();
    loop {
        if rx.borrow_and_update().rows_processed >= rows {
            return;
        }
        rx.changed().await.unwrap();
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ProgressSnapshot>) -> Vec<ProgressSnapshot> {
    let mut out = Vec::new();
    while let Ok(s) = rx.try_recv() {
        out.push(s);
    }
    out
}

// =============================================================================
// Batching and progress
// =============================================================================

#[tokio::test]
async fn test_estimate_5000_runs_in_20_batches() {
    let source = SyntheticEndpoint::new("events", 5000);
    let sink = SyntheticEndpoint::new("sink", 0);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let engine = IngestionEngine::new(IngestConfig::default()).with_progress(tx);

    let handle = engine
        .start(job_spec(&source, &sink, Some(5000)).await)
        .await
        .unwrap();
    let done = engine.wait(&handle).await;

    assert_eq!(done.phase, JobPhase::Completed);
    assert_eq!(done.batch_size, 250);
    assert_eq!(done.rows_processed, 5000);
    assert_eq!(done.batches_committed, 20);
    assert!(done.ended_at.is_some());
    assert_eq!(sink.accepted_rows(), 5000);

    let pushed = drain(&mut rx);
    let batch_updates: Vec<u64> = pushed
        .iter()
        .filter(|s| s.phase == JobPhase::Running && s.batches_committed > 0)
        .map(|s| s.rows_processed)
        .collect();
    assert_eq!(batch_updates.len(), 20);
    assert!(batch_updates.iter().enumerate().all(|(i, r)| *r == (i as u64 + 1) * 250));
    assert!(pushed.windows(2).all(|w| w[0].rows_processed <= w[1].rows_processed));
    assert_eq!(pushed.last().map(|s| s.phase), Some(JobPhase::Completed));
}

#[tokio::test]
async fn test_estimate_is_advisory() {
    let source = SyntheticEndpoint::new("events", 1500);
    let sink = SyntheticEndpoint::new("sink", 0);
    let engine = IngestionEngine::new(IngestConfig::default());

    let handle = engine
        .start(job_spec(&source, &sink, Some(1000)).await)
        .await
        .unwrap();
    let done = engine.wait(&handle).await;

    assert_eq!(done.phase, JobPhase::Completed);
    assert_eq!(done.batch_size, 100);
    assert_eq!(done.rows_processed, 1500);
    assert_eq!(done.percent_complete(), Some(100.0));
}

#[tokio::test]
async fn test_unknown_estimate_uses_min_batch() {
    let source = SyntheticEndpoint::new("events", 350);
    let sink = SyntheticEndpoint::new("sink", 0);
    let engine = IngestionEngine::new(IngestConfig::default());

    let handle = engine.start(job_spec(&source, &sink, None).await).await.unwrap();
    let done = engine.wait(&handle).await;

    assert_eq!(done.batch_size, 100);
    assert_eq!(done.batches_committed, 4);
    assert_eq!(done.rows_processed, 350);
    assert_eq!(done.percent_complete(), Some(100.0));
}

#[tokio::test]
async fn test_status_is_idempotent() {
    let source = SyntheticEndpoint::new("events", 500);
    let sink = SyntheticEndpoint::new("sink", 0);
    let engine = IngestionEngine::new(IngestConfig::default());

    let handle = engine.start(job_spec(&source, &sink, Some(500)).await).await.unwrap();
    engine.wait(&handle).await;

    let a = engine.status(&handle);
    let b = engine.status(&handle);
    assert_eq!(a, b);
    assert_eq!(engine.current().await, Some(a));
}

#[tokio::test]
async fn test_resume_from_offset() {
    let source = SyntheticEndpoint::new("events", 5000);
    let sink = SyntheticEndpoint::new("sink", 0);
    let engine = IngestionEngine::new(IngestConfig::default());

    let mut spec = job_spec(&source, &sink, Some(5000)).await;
    spec.resume_from = Some(4000);
    let handle = engine.start(spec).await.unwrap();
    let done = engine.wait(&handle).await;

    assert_eq!(done.phase, JobPhase::Completed);
    assert_eq!(done.rows_processed, 1000);
}

// =============================================================================
// Failure
// =============================================================================

#[tokio::test]
async fn test_read_failure_past_half_freezes_progress() {
    let source = SyntheticEndpoint::new("events", 5000).fail_read_after(2500);
    let sink = SyntheticEndpoint::new("sink", 0);
    let engine = IngestionEngine::new(IngestConfig::default());

    let handle = engine
        .start(job_spec(&source, &sink, Some(5000)).await)
        .await
        .unwrap();
    let done = engine.wait(&handle).await;

    assert_eq!(done.phase, JobPhase::Failed);
    assert_eq!(done.rows_processed, 2750);
    assert_eq!(done.rows_processed % done.batch_size as u64, 0);
    let err = done.last_error.clone().unwrap();
    assert_eq!(err.kind, ErrorKind::Transfer);
    assert!(err.message.contains("Connection lost during data transfer"));
    assert_eq!(sink.accepted_rows(), 2750);

    // Nothing moves after the failure.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.status(&handle), done);
}

#[tokio::test]
async fn test_write_failure_fails_job() {
    let source = SyntheticEndpoint::new("events", 1000);
    let sink = SyntheticEndpoint::new("sink", 0).fail_write_after(300);
    let engine = IngestionEngine::new(IngestConfig::default());

    let handle = engine
        .start(job_spec(&source, &sink, Some(1000)).await)
        .await
        .unwrap();
    let done = engine.wait(&handle).await;

    assert_eq!(done.phase, JobPhase::Failed);
    assert_eq!(done.rows_processed, 300);
    assert_eq!(done.batches_committed, 3);
}

// =============================================================================
// Concurrency and cancellation
// =============================================================================

#[tokio::test]
async fn test_second_start_while_running_is_rejected() {
    let source = SyntheticEndpoint::new("events", 5000).with_batch_delay(Duration::from_millis(20));
    let sink = SyntheticEndpoint::new("sink", 0);
    let engine = IngestionEngine::new(IngestConfig::default());

    let handle = engine
        .start(job_spec(&source, &sink, Some(5000)).await)
        .await
        .unwrap();
    let second = engine.start(job_spec(&source, &sink, Some(5000)).await).await;
    assert!(matches!(second, Err(IngestError::JobAlreadyRunning(_))));

    engine.cancel(&handle);
    let done = engine.wait(&handle).await;
    assert_eq!(done.phase, JobPhase::Cancelled);

    // A finished job frees the slot.
    let again = engine.start(job_spec(&source, &sink, Some(100)).await).await;
    assert!(again.is_ok());
}

#[tokio::test]
async fn test_cancel_stops_at_batch_boundary() {
    let source = SyntheticEndpoint::new("events", 5000).with_batch_delay(Duration::from_millis(10));
    let sink = SyntheticEndpoint::new("sink", 0);
    let engine = IngestionEngine::new(IngestConfig::default());

    let handle = engine
        .start(job_spec(&source, &sink, Some(5000)).await)
        .await
        .unwrap();
    wait_for_rows(&handle, 500).await;
    engine.cancel(&handle);
    let done = engine.wait(&handle).await;

    assert_eq!(done.phase, JobPhase::Cancelled);
    assert!(done.rows_processed >= 500);
    assert!(done.rows_processed < 5000);
    assert_eq!(sink.accepted_rows(), done.rows_processed);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sink.accepted_rows(), done.rows_processed);
}

#[tokio::test]
async fn test_cancel_current_without_job() {
    let engine = IngestionEngine::new(IngestConfig::default());
    assert!(matches!(
        engine.cancel_current().await,
        Err(IngestError::NoActiveJob)
    ));
    assert!(engine.cancel_and_wait(Duration::from_millis(10)).await.is_none());
}

#[tokio::test]
async fn test_cancel_and_wait_forces_stuck_job() {
    let source = SyntheticEndpoint::new("events", 5000);
    let sink = SyntheticEndpoint::new("sink", 0).with_write_delay(Duration::from_secs(30));
    let engine = IngestionEngine::new(IngestConfig::default());

    let handle = engine
        .start(job_spec(&source, &sink, Some(5000)).await)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let forced = engine
        .cancel_and_wait(Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(forced.phase, JobPhase::Cancelled);
    assert!(forced.ended_at.is_some());
    assert_eq!(engine.status(&handle).phase, JobPhase::Cancelled);
    assert!(!engine.is_busy().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forced_cancel_is_final_when_write_blocks_thread() {
    let source = SyntheticEndpoint::new("events", 5000);
    let inner = SyntheticEndpoint::new("sink", 0);
    let sink = BlockingSink {
        inner: inner.clone(),
        hold: Duration::from_millis(400),
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    let engine = IngestionEngine::new(IngestConfig::default()).with_progress(tx);

    let mut spec = job_spec(&source, &inner, Some(5000)).await;
    spec.target = Arc::new(sink);
    let handle = engine.start(spec).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let forced = engine
        .cancel_and_wait(Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(forced.phase, JobPhase::Cancelled);
    assert_eq!(forced.rows_processed, inner.accepted_rows());
    assert!(!engine.is_busy().await);

    let pushed = drain(&mut rx);
    let terminal = pushed
        .iter()
        .position(|s| s.phase.is_terminal())
        .unwrap();
    assert_eq!(terminal, pushed.len() - 1);
    assert_eq!(pushed[terminal].rows_processed, forced.rows_processed);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let later = engine.status(&handle);
    assert_eq!(later.phase, JobPhase::Cancelled);
    assert_eq!(later.rows_processed, forced.rows_processed);
    assert!(drain(&mut rx).is_empty());
    assert_eq!(inner.accepted_rows(), forced.rows_processed);
}
