//! ch-ingest CLI - guided transfers between the analytical store and flat files.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use ch_ingest::config::FileConfig;
use ch_ingest::core::{filter_columns, filter_relations};
use ch_ingest::error::{EXIT_JOB_FAILED, EXIT_SUCCESS};
use ch_ingest::{
    Config, CsvFileAdapter, IngestError, JobPhase, MemoryStore, ProgressSnapshot,
    SchemaAdapter, TransferDirection, WorkflowOrchestrator,
};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// How often a running `start` looks for a cancel marker.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "ch-ingest")]
#[command(about = "Guided bulk transfers between an analytical store and flat files")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to the job state file (written by start, read by status and cancel)
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Print progress updates as JSON lines to stderr
    #[arg(long)]
    progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a transfer job to completion
    Start {
        /// Transfer direction: store-to-file or file-to-store
        #[arg(long, value_parser = parse_direction)]
        direction: TransferDirection,

        /// Store table to export from or ingest into
        #[arg(long)]
        table: String,

        /// Comma-separated source columns (default: all)
        #[arg(long, value_delimiter = ',')]
        columns: Vec<String>,

        /// Mapping override as source=target; an empty target excludes the column
        #[arg(long = "map", value_name = "SOURCE=TARGET")]
        mappings: Vec<String>,

        /// Override the file path from the config
        #[arg(long)]
        file: Option<PathBuf>,

        /// Override the file delimiter from the config
        #[arg(long)]
        delimiter: Option<String>,

        /// Skip this many source rows already moved by an earlier attempt
        #[arg(long)]
        resume_from: Option<u64>,
    },

    /// Show the last recorded job snapshot
    Status,

    /// Ask a running start to cancel its job
    Cancel,

    /// List store tables, or the columns of one table
    Discover {
        /// Only tables (or columns, with --table) whose name contains this text
        #[arg(long)]
        filter: Option<String>,

        /// Show the columns of this table
        #[arg(long)]
        table: Option<String>,
    },
}

fn parse_direction(s: &str) -> Result<TransferDirection, String> {
    TransferDirection::parse(s)
        .ok_or_else(|| format!("unknown direction '{}' (use store-to-file or file-to-store)", s))
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<u8, IngestError> {
    let cli = Cli::parse();

    // Status and cancel only touch the state file.
    match &cli.command {
        Commands::Status => return show_status(&cli),
        Commands::Cancel => return request_cancel(&cli),
        _ => {}
    }

    setup_logging(&cli.verbosity, &cli.log_format).map_err(IngestError::Config)?;

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match &cli.command {
        Commands::Start {
            direction,
            table,
            columns,
            mappings,
            file,
            delimiter,
            resume_from,
        } => {
            if let Some(path) = file {
                let current = config.file.take();
                config.file = Some(match current {
                    Some(mut fc) => {
                        fc.path = path.clone();
                        fc
                    }
                    None => FileConfig::new(path),
                });
            }
            if let Some(d) = delimiter {
                let fc = config.file.as_mut().ok_or_else(|| {
                    IngestError::Config("--delimiter needs a file (--file or file.path)".into())
                })?;
                fc.delimiter = d.clone();
            }
            config.validate()?;

            let request = StartRequest {
                direction: *direction,
                table,
                columns,
                mappings,
                resume_from: *resume_from,
            };
            run_start(&cli, &config, request).await
        }
        Commands::Discover { filter, table } => {
            discover(&cli, &config, filter.as_deref(), table.as_deref()).await?;
            Ok(EXIT_SUCCESS)
        }
        Commands::Status | Commands::Cancel => Ok(EXIT_SUCCESS),
    }
}

struct StartRequest<'a> {
    direction: TransferDirection,
    table: &'a str,
    columns: &'a [String],
    mappings: &'a [String],
    resume_from: Option<u64>,
}

fn open_store(config: &Config) -> Result<MemoryStore, IngestError> {
    match &config.store.snapshot {
        Some(path) if path.exists() => MemoryStore::load(path),
        Some(path) => {
            info!("Snapshot {} not found; starting from the sample catalog", path.display());
            Ok(MemoryStore::sample())
        }
        None => Ok(MemoryStore::sample()),
    }
}

async fn run_start(
    cli: &Cli,
    config: &Config,
    request: StartRequest<'_>,
) -> Result<u8, IngestError> {
    let file = config
        .file
        .as_ref()
        .ok_or_else(|| IngestError::Config("a file is required (--file or file.path)".into()))?;
    if !request.mappings.is_empty() && !request.direction.requires_mapping() {
        return Err(IngestError::Validation(format!(
            "--map only applies to file-to-store transfers, not {}",
            request.direction
        )));
    }
    let store = open_store(config)?;

    let mut workflow = WorkflowOrchestrator::new(
        Arc::new(store.clone()),
        Arc::new(CsvFileAdapter::new()),
        config.ingest.clone(),
    );
    let printer = if cli.progress {
        let (tx, rx) = mpsc::unbounded_channel();
        workflow = workflow.with_progress(tx);
        Some(tokio::spawn(print_progress(rx)))
    } else {
        None
    };

    workflow.select_direction(request.direction).await?;
    match request.direction {
        TransferDirection::StoreToFile => {
            workflow.connect_source(&config.store.credentials()).await?;
            workflow.select_relation(request.table).await?;
            let columns = chosen_columns(&workflow, request.columns);
            workflow.select_columns(&columns).await?;
            workflow.connect_target(&file.credentials()).await?;
        }
        TransferDirection::FileToStore => {
            workflow.connect_source(&file.credentials()).await?;
            let columns = chosen_columns(&workflow, request.columns);
            workflow.select_columns(&columns).await?;
            workflow.connect_target(&config.store.credentials()).await?;
            workflow.select_relation(request.table).await?;
            for entry in request.mappings {
                let (source, target) = parse_mapping(entry)?;
                workflow.set_mapping_target(source, target)?;
            }
            workflow.confirm_mapping().await?;
        }
    }
    debug!("Workflow ready at {}", workflow.phase());

    let handle = match request.resume_from {
        Some(offset) => workflow.resume_ingestion(offset).await?,
        None => workflow.start_ingestion().await?,
    };
    info!("Started job {}", handle.job_id);

    let interrupt = setup_signal_handler();
    let marker = cli.state_file.as_deref().map(cancel_marker);
    if let Some(m) = &marker {
        // A stale marker from an earlier run must not cancel this one.
        let _ = std::fs::remove_file(m);
    }

    let mut rx = handle.subscribe();
    let mut poll = tokio::time::interval(CANCEL_POLL_INTERVAL);
    let mut cancel_sent = false;
    let snapshot = loop {
        let snapshot = rx.borrow_and_update().clone();
        if let Some(path) = &cli.state_file {
            write_state(path, &snapshot)?;
        }
        if snapshot.phase.is_terminal() {
            break snapshot;
        }

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break workflow.engine().status(&handle);
                }
            }
            _ = interrupt.cancelled(), if !cancel_sent => {
                workflow.cancel_ingestion()?;
                cancel_sent = true;
            }
            _ = poll.tick(), if marker.is_some() && !cancel_sent => {
                if let Some(m) = marker.as_deref().filter(|m| m.exists()) {
                    info!("Cancel marker {} found", m.display());
                    let _ = std::fs::remove_file(m);
                    workflow.cancel_ingestion()?;
                    cancel_sent = true;
                }
            }
        }
    };
    if let Some(path) = &cli.state_file {
        write_state(path, &snapshot)?;
    }
    workflow.refresh()?;
    debug!("Workflow finished at {}", workflow.phase());

    if request.direction == TransferDirection::FileToStore && snapshot.rows_processed > 0 {
        if let Some(path) = &config.store.snapshot {
            store.save(path).await?;
        }
    }

    drop(workflow);
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    report(cli, &snapshot)?;
    match snapshot.phase {
        JobPhase::Completed => Ok(EXIT_SUCCESS),
        JobPhase::Cancelled => Err(IngestError::Cancelled),
        _ => Ok(EXIT_JOB_FAILED),
    }
}

/// Explicit selection, or every column the source exposes.
fn chosen_columns(workflow: &WorkflowOrchestrator, requested: &[String]) -> Vec<String> {
    if requested.is_empty() {
        workflow
            .state()
            .source_columns
            .iter()
            .map(|c| c.name.clone())
            .collect()
    } else {
        requested.to_vec()
    }
}

fn parse_mapping(entry: &str) -> Result<(&str, Option<&str>), IngestError> {
    let (source, target) = entry.split_once('=').ok_or_else(|| {
        IngestError::Validation(format!("mapping '{}' must look like source=target", entry))
    })?;
    let target = target.trim();
    Ok((source.trim(), (!target.is_empty()).then_some(target)))
}

fn report(cli: &Cli, snapshot: &ProgressSnapshot) -> Result<(), IngestError> {
    if cli.output_json {
        println!("{}", serde_json::to_string_pretty(snapshot)?);
        return Ok(());
    }
    let status_msg = match snapshot.phase {
        JobPhase::Completed => "Transfer completed!",
        JobPhase::Cancelled => "Transfer cancelled.",
        _ => "Transfer failed.",
    };
    println!("\n{}", status_msg);
    println!("  Job ID: {}", snapshot.job_id);
    println!("  Rows: {}", snapshot.rows_processed);
    println!("  Batches: {} x {}", snapshot.batches_committed, snapshot.batch_size);
    println!(
        "  Duration: {}",
        ch_ingest::format_duration(snapshot.elapsed())
    );
    if let Some(rate) = snapshot.rows_per_second() {
        println!("  Throughput: {:.0} rows/sec", rate);
    }
    if let Some(err) = &snapshot.last_error {
        println!("  Error: {}", err.message);
    }
    Ok(())
}

async fn print_progress(mut rx: mpsc::UnboundedReceiver<ProgressSnapshot>) {
    while let Some(snapshot) = rx.recv().await {
        match serde_json::to_string(&snapshot) {
            Ok(line) => eprintln!("{}", line),
            Err(e) => warn!("Could not encode progress: {}", e),
        }
    }
}

async fn discover(
    cli: &Cli,
    config: &Config,
    filter: Option<&str>,
    table: Option<&str>,
) -> Result<(), IngestError> {
    let store = open_store(config)?;
    let conn = store.connect(&config.store.credentials()).await?;

    if let Some(name) = table {
        let columns = store.list_columns(&conn, name).await?;
        let shown = filter_columns(&columns, filter.unwrap_or(""));
        if cli.output_json {
            println!("{}", serde_json::to_string_pretty(&shown)?);
        } else {
            println!("Columns of {}:", name);
            for c in shown {
                println!("  {} {}", c.name, c.data_type);
            }
        }
    } else {
        let relations = store.list_relations(&conn).await?;
        let shown = filter_relations(&relations, filter.unwrap_or(""));
        if cli.output_json {
            println!("{}", serde_json::to_string_pretty(&shown)?);
        } else {
            println!("Tables:");
            for r in shown {
                println!(
                    "  {} ({}, {} rows)",
                    r.name,
                    r.engine.as_deref().unwrap_or("unknown engine"),
                    r.row_count.map_or_else(|| "?".to_string(), |n| n.to_string())
                );
            }
        }
    }

    store.disconnect(&conn).await;
    Ok(())
}

// ===== State file =====

fn require_state_file(cli: &Cli) -> Result<&Path, IngestError> {
    cli.state_file
        .as_deref()
        .ok_or_else(|| IngestError::Config("--state-file is required".into()))
}

fn cancel_marker(state_file: &Path) -> PathBuf {
    let mut name: OsString = state_file.as_os_str().to_owned();
    name.push(".cancel");
    PathBuf::from(name)
}

fn write_state(path: &Path, snapshot: &ProgressSnapshot) -> Result<(), IngestError> {
    let content = serde_json::to_string_pretty(snapshot)?;
    let temp = path.with_extension("tmp");
    std::fs::write(&temp, content)?;
    std::fs::rename(&temp, path)?;
    Ok(())
}

fn read_state(path: &Path) -> Result<ProgressSnapshot, IngestError> {
    if !path.exists() {
        return Err(IngestError::Config(format!(
            "State file not found: {:?}",
            path
        )));
    }
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn show_status(cli: &Cli) -> Result<u8, IngestError> {
    let snapshot = read_state(require_state_file(cli)?)?;
    if cli.output_json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        println!("Job {}", snapshot.job_id);
        println!("  {}", snapshot.summary());
    }
    Ok(EXIT_SUCCESS)
}

fn request_cancel(cli: &Cli) -> Result<u8, IngestError> {
    let path = require_state_file(cli)?;
    let snapshot = read_state(path)?;
    if snapshot.phase.is_terminal() {
        return Err(IngestError::NoActiveJob);
    }
    let marker = cancel_marker(path);
    std::fs::write(&marker, snapshot.job_id.to_string())?;
    println!("Cancellation requested for job {}", snapshot.job_id);
    Ok(EXIT_SUCCESS)
}

// ===== Process setup =====

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => return Err(format!("unknown verbosity '{}'", other)),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("unknown log format '{}'", other)),
    }

    Ok(())
}

/// Token cancelled on SIGINT or SIGTERM.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for kind in [SignalKind::interrupt(), SignalKind::terminate()] {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            let mut stream = match signal(kind) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Could not install signal handler: {}", e);
                    return;
                }
            };
            stream.recv().await;
            eprintln!("\nReceived signal. Cancelling the job at the next batch boundary...");
            token.cancel();
        });
    }

    cancel_token
}

/// Token cancelled on Ctrl-C.
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Could not install Ctrl-C handler: {}", e);
            return;
        }
        eprintln!("\nReceived Ctrl-C. Cancelling the job at the next batch boundary...");
        token.cancel();
    });

    cancel_token
}
