//! Workflow orchestrator: the state machine driving a transfer end to end.
//!
//! Every operation first checks the transition table via [`advance`], then
//! does its I/O, and only commits the new phase and state once everything
//! succeeded. A failed operation leaves the workflow where it was.

pub mod phase;
pub mod state;

pub use phase::{
    advance, previous, sequence, JobOutcome, Phase, StepStatus, StepView, WorkflowEvent,
};
pub use state::WorkflowState;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::IngestConfig;
use crate::core::{
    filter_relations, find_column, ColumnDescriptor, ConnectionHandle, Credentials, Relation,
    Row, SchemaAdapter, TransferDirection,
};
use crate::error::{IngestError, Result};
use crate::ingest::{IngestionEngine, JobHandle, JobSpec, ProgressSnapshot};
use crate::mapping::{self, ColumnMapping, ResolvedMapping};

/// Drives one transfer workflow between the store and a flat file.
pub struct WorkflowOrchestrator {
    store: Arc<dyn SchemaAdapter>,
    file: Arc<dyn SchemaAdapter>,
    engine: IngestionEngine,
    config: IngestConfig,
    state: WorkflowState,
}

impl WorkflowOrchestrator {
    pub fn new(
        store: Arc<dyn SchemaAdapter>,
        file: Arc<dyn SchemaAdapter>,
        config: IngestConfig,
    ) -> Self {
        Self {
            store,
            file,
            engine: IngestionEngine::new(config.clone()),
            config,
            state: WorkflowState::default(),
        }
    }

    /// Push every job snapshot to `tx`.
    pub fn with_progress(mut self, tx: mpsc::UnboundedSender<ProgressSnapshot>) -> Self {
        self.engine = IngestionEngine::new(self.config.clone()).with_progress(tx);
        self
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    /// Read-only view of the workflow state.
    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn engine(&self) -> &IngestionEngine {
        &self.engine
    }

    /// Stepper projection of the current direction's sequence.
    pub fn steps(&self) -> Vec<StepView> {
        phase::steps(self.state.phase, self.state.direction)
    }

    /// Whether the stepper may navigate to `phase`.
    pub fn is_reachable(&self, phase: Phase) -> bool {
        self.steps()
            .iter()
            .any(|s| s.phase == phase && s.is_reachable())
    }

    /// Store relations whose name contains `term`, ignoring case.
    pub fn filtered_relations(&self, term: &str) -> Vec<&Relation> {
        filter_relations(&self.state.relations, term)
    }

    fn adapters(&self, direction: TransferDirection) -> (Arc<dyn SchemaAdapter>, Arc<dyn SchemaAdapter>) {
        if direction.source_is_store() {
            (self.store.clone(), self.file.clone())
        } else {
            (self.file.clone(), self.store.clone())
        }
    }

    fn direction(&self) -> Result<TransferDirection> {
        self.state
            .direction
            .ok_or_else(|| IngestError::invalid_transition(self.state.phase, "operation without a direction"))
    }

    fn require<'a, T>(value: Option<&'a T>, what: &str) -> Result<&'a T> {
        value.ok_or_else(|| IngestError::Validation(format!("{} is not set", what)))
    }

    // ===== Forward operations =====

    pub async fn select_direction(&mut self, direction: TransferDirection) -> Result<Phase> {
        let next = advance(
            self.state.phase,
            self.state.direction,
            WorkflowEvent::DirectionChosen(direction),
        )?;
        self.state.direction = Some(direction);
        self.enter(next);
        Ok(next)
    }

    pub async fn connect_source(&mut self, credentials: &Credentials) -> Result<Phase> {
        let next = advance(
            self.state.phase,
            self.state.direction,
            WorkflowEvent::SourceConnected,
        )?;
        let direction = self.direction()?;
        let (source, _) = self.adapters(direction);
        let conn = source.connect(credentials).await?;

        let discovered = match direction {
            TransferDirection::StoreToFile => source
                .list_relations(&conn)
                .await
                .map(|relations| (relations, None, Vec::new())),
            TransferDirection::FileToStore => discover_file(source.as_ref(), &conn)
                .await
                .map(|(relation, columns)| (Vec::new(), Some(relation), columns)),
        };
        let (relations, source_relation, source_columns) = match discovered {
            Ok(d) => d,
            Err(e) => {
                source.disconnect(&conn).await;
                return Err(e);
            }
        };

        info!("Source connected: {}", conn.endpoint);
        self.state.source_conn = Some(conn);
        self.state.relations = relations;
        if source_relation.is_some() {
            self.state.source_relation = source_relation;
            self.state.source_columns = source_columns;
        }
        self.enter(next);
        Ok(next)
    }

    pub async fn select_relation(&mut self, name: &str) -> Result<Phase> {
        let next = advance(
            self.state.phase,
            self.state.direction,
            WorkflowEvent::RelationSelected,
        )?;
        let relation = lookup_relation(&self.state.relations, name)?;

        match self.direction()? {
            TransferDirection::StoreToFile => {
                let conn = Self::require(self.state.source_conn.as_ref(), "source connection")?;
                let columns = self.store.list_columns(conn, &relation.name).await?;
                self.state.source_relation = Some(relation);
                self.state.source_columns = columns;
            }
            TransferDirection::FileToStore => {
                let conn = Self::require(self.state.target_conn.as_ref(), "target connection")?;
                let columns = self.store.list_columns(conn, &relation.name).await?;
                self.state.mapping = Some(mapping::propose(&self.state.selected_columns, &columns));
                self.state.target_relation = Some(relation);
                self.state.target_columns = columns;
            }
        }
        self.enter(next);
        Ok(next)
    }

    pub async fn select_columns(&mut self, names: &[String]) -> Result<Phase> {
        let next = advance(
            self.state.phase,
            self.state.direction,
            WorkflowEvent::ColumnsSelected,
        )?;
        if names.is_empty() {
            return Err(IngestError::Validation("select at least one column".into()));
        }
        for name in names {
            if find_column(&self.state.source_columns, name).is_none() {
                return Err(IngestError::Schema(format!(
                    "column '{}' does not exist on {}",
                    name,
                    self.state.source_relation_name().unwrap_or("the source")
                )));
            }
        }
        let selected: Vec<ColumnDescriptor> = self
            .state
            .source_columns
            .iter()
            .filter(|c| names.iter().any(|n| c.matches_name(n)))
            .cloned()
            .collect();

        debug!("Selected {} of {} columns", selected.len(), self.state.source_columns.len());
        self.state.selected_columns = selected;
        self.enter(next);
        Ok(next)
    }

    pub async fn connect_target(&mut self, credentials: &Credentials) -> Result<Phase> {
        let next = advance(
            self.state.phase,
            self.state.direction,
            WorkflowEvent::TargetConnected,
        )?;
        let direction = self.direction()?;
        let (_, target) = self.adapters(direction);
        let conn = target.connect(credentials).await?;

        let result = match direction {
            TransferDirection::StoreToFile => self.prepare_file_target(target.as_ref(), &conn).await,
            TransferDirection::FileToStore => target.list_relations(&conn).await.map(|relations| {
                self.state.relations = relations;
            }),
        };
        if let Err(e) = result {
            target.disconnect(&conn).await;
            return Err(e);
        }

        info!("Target connected: {}", conn.endpoint);
        self.state.target_conn = Some(conn);
        self.enter(next);
        Ok(next)
    }

    /// Identity mapping onto the file plus the preview the next phase shows.
    async fn prepare_file_target(
        &mut self,
        target: &dyn SchemaAdapter,
        conn: &ConnectionHandle,
    ) -> Result<()> {
        let relation = target
            .list_relations(conn)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| IngestError::Schema("file exposes no relation".into()))?;
        let draft = ColumnMapping::identity(&self.state.selected_columns);
        let resolved = mapping::finalize(&draft)?;
        let (preview_columns, preview) = self.load_preview(&resolved).await?;

        self.state.target_relation = Some(relation);
        self.state.target_columns = self.state.selected_columns.clone();
        self.state.mapping = Some(draft);
        self.state.resolved = Some(resolved);
        self.state.preview_columns = preview_columns;
        self.state.preview = preview;
        Ok(())
    }

    /// Override one mapping entry. Only valid while mapping columns.
    pub fn set_mapping_target(&mut self, source: &str, target: Option<&str>) -> Result<()> {
        if self.state.phase != Phase::MapColumns {
            return Err(IngestError::invalid_transition(self.state.phase, "set_mapping_target"));
        }
        let draft = Self::require(self.state.mapping.as_ref(), "mapping")?;
        let updated = mapping::set_target(draft, source, target, &self.state.target_columns)?;
        debug!("Mapping {} -> {:?}", source, target);
        self.state.mapping = Some(updated);
        Ok(())
    }

    pub async fn confirm_mapping(&mut self) -> Result<Phase> {
        let next = advance(
            self.state.phase,
            self.state.direction,
            WorkflowEvent::MappingConfirmed,
        )?;
        let draft = Self::require(self.state.mapping.as_ref(), "mapping")?;
        let conn = Self::require(self.state.target_conn.as_ref(), "target connection")?;
        let relation = Self::require(self.state.target_relation.as_ref(), "target relation")?;

        // The target schema may have changed since the proposal.
        let current = self.store.list_columns(conn, &relation.name).await?;
        let rebound = draft.revalidate(&current)?;
        let resolved = mapping::finalize(&rebound)?;
        let (preview_columns, preview) = self.load_preview(&resolved).await?;

        info!("Mapping confirmed: {} columns", resolved.len());
        for column in resolved.output_columns() {
            if let Some(origin) = &column.origin {
                debug!("Column {} <- {}", column.name, origin);
            }
        }
        self.state.target_columns = current;
        self.state.mapping = Some(rebound);
        self.state.resolved = Some(resolved);
        self.state.preview_columns = preview_columns;
        self.state.preview = preview;
        self.enter(next);
        Ok(next)
    }

    /// Preview rows read from the source and laid out as they will land.
    async fn load_preview(&self, resolved: &ResolvedMapping) -> Result<(Vec<String>, Vec<Row>)> {
        let direction = self.direction()?;
        let (source, _) = self.adapters(direction);
        let conn = Self::require(self.state.source_conn.as_ref(), "source connection")?;
        let relation = Self::require(self.state.source_relation.as_ref(), "source relation")?;

        let read = resolved.source_names();
        let rows = source
            .fetch_preview(conn, &relation.name, &read, self.config.preview_limit)
            .await?;
        let projector = resolved.projector(&read)?;
        let preview = projector.project(crate::core::Batch::new(rows));
        Ok((resolved.target_names(), preview.rows))
    }

    pub async fn start_ingestion(&mut self) -> Result<JobHandle> {
        self.start_job(None).await
    }

    /// Start a job that skips rows a previous attempt already moved.
    pub async fn resume_ingestion(&mut self, offset: u64) -> Result<JobHandle> {
        self.start_job(Some(offset)).await
    }

    async fn start_job(&mut self, resume_from: Option<u64>) -> Result<JobHandle> {
        let next = advance(
            self.state.phase,
            self.state.direction,
            WorkflowEvent::IngestionStarted,
        )?;
        let direction = self.direction()?;
        let (source, target) = self.adapters(direction);
        let resolved = Self::require(self.state.resolved.as_ref(), "resolved mapping")?;
        let source_relation = Self::require(self.state.source_relation.as_ref(), "source relation")?;
        let target_relation = Self::require(self.state.target_relation.as_ref(), "target relation")?;

        let spec = JobSpec {
            direction,
            source,
            source_conn: Self::require(self.state.source_conn.as_ref(), "source connection")?.clone(),
            target,
            target_conn: Self::require(self.state.target_conn.as_ref(), "target connection")?.clone(),
            source_relation: source_relation.name.clone(),
            target_relation: target_relation.name.clone(),
            source_columns: resolved.source_names(),
            mapping: resolved.clone(),
            total_row_estimate: source_relation.row_count,
            resume_from,
        };

        let handle = self.engine.start(spec).await?;
        self.state.job = Some(handle.clone());
        self.state.last_snapshot = None;
        self.enter(next);
        Ok(handle)
    }

    // ===== Job control =====

    /// Latest snapshot of the current or last job.
    pub fn status(&self) -> Option<ProgressSnapshot> {
        match &self.state.job {
            Some(job) => Some(self.engine.status(job)),
            None => self.state.last_snapshot.clone(),
        }
    }

    pub fn cancel_ingestion(&self) -> Result<()> {
        if self.state.phase != Phase::Ingesting {
            return Err(IngestError::invalid_transition(self.state.phase, "cancel_ingestion"));
        }
        let job = self.state.job.as_ref().ok_or(IngestError::NoActiveJob)?;
        self.engine.cancel(job);
        Ok(())
    }

    /// Fold a finished job into the `Finished` phase.
    pub fn refresh(&mut self) -> Result<Phase> {
        if self.state.phase != Phase::Ingesting {
            return Ok(self.state.phase);
        }
        let Some(job) = &self.state.job else {
            return Ok(self.state.phase);
        };
        let snapshot = self.engine.status(job);
        if let Some(outcome) = phase::JobOutcome::from_job_phase(snapshot.phase) {
            let next = advance(
                self.state.phase,
                self.state.direction,
                WorkflowEvent::IngestionFinished(outcome),
            )?;
            self.state.last_snapshot = Some(snapshot);
            self.enter(next);
        }
        Ok(self.state.phase)
    }

    /// Wait for the job to finish, then enter `Finished`.
    pub async fn wait_for_completion(&mut self) -> Result<ProgressSnapshot> {
        if let Phase::Finished(_) = self.state.phase {
            return self.state.last_snapshot.clone().ok_or(IngestError::NoActiveJob);
        }
        let job = self.state.job.as_ref().ok_or(IngestError::NoActiveJob)?;
        let snapshot = self.engine.wait(job).await;
        self.refresh()?;
        Ok(snapshot)
    }

    // ===== Navigation =====

    /// Step back one phase.
    pub async fn go_back(&mut self) -> Result<Phase> {
        let direction = self.direction()?;
        let target = previous(self.state.phase, direction)
            .ok_or_else(|| IngestError::invalid_transition(self.state.phase, "go_back"))?;
        self.go_back_to(target).await
    }

    /// Return to an earlier phase, discarding what later phases captured.
    pub async fn go_back_to(&mut self, target: Phase) -> Result<Phase> {
        if self.engine.is_busy().await {
            return Err(IngestError::invalid_transition(self.state.phase, "go_back while a job is active"));
        }
        let direction = self.direction()?;
        let current_idx = phase::index_of(self.state.phase, direction);
        let target_idx = phase::index_of(target, direction);
        match (current_idx, target_idx) {
            (Some(c), Some(t)) if t < c => {}
            _ => {
                return Err(IngestError::invalid_transition(
                    self.state.phase,
                    format!("go_back_to({})", target),
                ))
            }
        }

        // Reload before touching state so a failed read leaves the phase as is.
        let reloaded = match target {
            Phase::PreviewData => {
                let resolved = Self::require(self.state.resolved.as_ref(), "resolved mapping")?;
                Some(self.load_preview(resolved).await?)
            }
            _ => None,
        };

        let (source, destination) = self.adapters(direction);
        let discarded = self.state.discard_from(target);
        if let Some(conn) = discarded.source_conn {
            source.disconnect(&conn).await;
        }
        if let Some(conn) = discarded.target_conn {
            destination.disconnect(&conn).await;
        }
        self.enter(target);

        if target == Phase::MapColumns {
            self.state.mapping = Some(mapping::propose(
                &self.state.selected_columns,
                &self.state.target_columns,
            ));
        }
        if let Some((columns, rows)) = reloaded {
            self.state.preview_columns = columns;
            self.state.preview = rows;
        }
        Ok(target)
    }

    /// Back to the start. Cancels an active job first, then disconnects.
    pub async fn reset(&mut self) -> Result<()> {
        if self.engine.is_busy().await {
            let grace = self.config.reset_grace_period();
            if let Some(snapshot) = self.engine.cancel_and_wait(grace).await {
                info!("Job {} stopped before reset ({})", snapshot.job_id, snapshot.phase);
            }
        }

        if let Some(direction) = self.state.direction {
            let (source, target) = self.adapters(direction);
            if let Some(conn) = self.state.source_conn.take() {
                source.disconnect(&conn).await;
            }
            if let Some(conn) = self.state.target_conn.take() {
                target.disconnect(&conn).await;
            }
        } else if self.state.source_conn.is_some() || self.state.target_conn.is_some() {
            warn!("Sessions open without a direction; dropping them");
        }

        self.state = WorkflowState::default();
        info!("Workflow reset");
        Ok(())
    }

    fn enter(&mut self, next: Phase) {
        if next != self.state.phase {
            info!("Workflow phase {} -> {}", self.state.phase, next);
        }
        self.state.phase = next;
    }
}

async fn discover_file(
    adapter: &dyn SchemaAdapter,
    conn: &ConnectionHandle,
) -> Result<(Relation, Vec<ColumnDescriptor>)> {
    let relation = adapter
        .list_relations(conn)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| IngestError::Schema("file exposes no relation".into()))?;
    let columns = adapter.list_columns(conn, &relation.name).await?;
    if columns.is_empty() {
        return Err(IngestError::Schema(format!("{} has no columns", relation.name)));
    }
    Ok((relation, columns))
}

fn lookup_relation(relations: &[Relation], name: &str) -> Result<Relation> {
    relations
        .iter()
        .find(|r| r.name == name)
        .or_else(|| relations.iter().find(|r| r.name.eq_ignore_ascii_case(name)))
        .cloned()
        .ok_or_else(|| IngestError::Schema(format!("table '{}' does not exist", name)))
}
