use anyhow::Result;
use clap::Parser;
use file_kind::cli::{Cli, Commands, OutputFormat, rewrite_args_for_implicit_classify};
use file_kind::config::{clear_db, resolve_config, resolve_db_path};
use file_kind::scan::scan_files;
use file_kind::service::{ClassifySource, FileTypeService};
use file_kind::store::LmdbAttributeStore;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    init_tracing();
    let cli = parse_cli();

    match cli.command.clone() {
        Commands::Clear => {
            let db_path = resolve_db_path(&cli)?;
            clear_db(&db_path)?;
        }
        Commands::Stats => {
            let db_path = resolve_db_path(&cli)?;
            let store = LmdbAttributeStore::open(db_path)?;
            let stats = store.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Invalidate => {
            let service = open_service(&cli)?;
            let generation = service.invalidate_all();
            service.shutdown()?;
            println!("{}", serde_json::to_string_pretty(&InvalidateResult { generation })?);
        }
        Commands::Classify {
            paths,
            recursive,
            format,
        } => {
            let service = open_service(&cli)?;
            let result = classify_paths(&service, &paths, recursive)?;
            service.shutdown()?;
            write_classify_output(&result, format)?;
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_cli() -> Cli {
    let args: Vec<String> = std::env::args().collect();
    Cli::parse_from(rewrite_args_for_implicit_classify(args))
}

fn open_service(cli: &Cli) -> Result<FileTypeService> {
    let config = resolve_config(cli)?;
    let store = Arc::new(LmdbAttributeStore::open(resolve_db_path(cli)?)?);
    FileTypeService::builder()
        .store(store)
        .config(config)
        .buffered(true)
        .background_redetect(false)
        .build()
}

#[derive(Debug, Serialize)]
struct InvalidateResult {
    generation: u64,
}

#[derive(Debug, Serialize)]
struct ClassifyEntry {
    path: String,
    classification: String,
    description: String,
    binary: bool,
    source: ClassifySource,
}

#[derive(Debug, Serialize)]
struct ClassifyResult {
    files: usize,
    from_content: usize,
    duration_ms: u64,
    entries: Vec<ClassifyEntry>,
}

fn classify_paths(service: &FileTypeService, paths: &[PathBuf], recursive: bool) -> Result<ClassifyResult> {
    let start = Instant::now();
    let masks = service.registry().ignored().masks();

    let mut targets = Vec::new();
    for path in paths {
        let path = &absolute_target(path)?;
        if path.is_dir() {
            let depth = if recursive { None } else { Some(1) };
            targets.extend(scan_files(path, &masks, depth)?);
        } else {
            targets.push(path.clone());
        }
    }

    let files: Vec<_> = targets.iter().map(|p| service.file_ref(p)).collect();
    let outcomes = service.classify_many(&files);

    let entries: Vec<ClassifyEntry> = files
        .iter()
        .zip(outcomes)
        .map(|(file, outcome)| ClassifyEntry {
            path: file.path().to_string_lossy().to_string(),
            classification: outcome.classification.name().to_string(),
            description: outcome.classification.description().to_string(),
            binary: outcome.classification.is_binary(),
            source: outcome.source,
        })
        .collect();

    Ok(ClassifyResult {
        files: entries.len(),
        from_content: entries.iter().filter(|e| e.source == ClassifySource::Content).count(),
        duration_ms: start.elapsed().as_millis() as u64,
        entries,
    })
}

/// Persisted results are keyed by path, so every target is made absolute
/// before it is interned.
fn absolute_target(path: &Path) -> Result<PathBuf> {
    match std::fs::canonicalize(path) {
        Ok(canonical) => Ok(canonical),
        Err(_) => Ok(std::path::absolute(path)?),
    }
}

fn write_classify_output(result: &ClassifyResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(result)?),
        OutputFormat::Text => {
            for e in &result.entries {
                println!("{}: {} ({:?})", e.path, e.classification, e.source);
            }
        }
    }
    Ok(())
}
