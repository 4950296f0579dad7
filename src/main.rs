mod database;
mod discovery;
mod download;
mod error;
mod filter;
mod ingest;
mod media;
mod ml;
mod pipeline;
mod storage;
mod utils;
#[cfg(test)]
mod testing;

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use anyhow::{Result, Context, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn, error};
use tracing_subscriber::EnvFilter;

use crate::database::repo::{ProvenanceStore, SearchId};
use crate::discovery::LinkDiscovery;
use crate::discovery::search_page::SearchPageDiscovery;
use crate::discovery::seeds::SeedFileDiscovery;
use crate::download::fetch::{Fetcher, HttpFetcher};
use crate::ingest::dedupe;
use crate::ml::engine::OnnxScorer;
use crate::ml::scorer::{HeuristicScorer, Scorer};
use crate::pipeline::candidate::PipelineContext;
use crate::pipeline::orchestrator::AcquisitionOrchestrator;
use crate::utils::config::{Config, DEFAULT_ENV_FILE};

#[derive(Parser, Debug)]
#[command(author, version, about = "Collects relevant, de-duplicated images for a search query", long_about = None)]
struct Cli {
    /// `.env`-style settings file with HARVEST_* keys
    #[arg(long, global = true, default_value = DEFAULT_ENV_FILE)]
    config: PathBuf,

    /// Provenance database (overrides HARVEST_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Machine-readable output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search, download, filter and store images for a query
    Run {
        query: String,
        max_images: Option<usize>,
        max_workers: Option<usize>,

        /// Read candidate pages from a file instead of the search engine
        #[arg(long)]
        seeds: Option<PathBuf>,

        /// Root directory for per-query image folders
        #[arg(long)]
        out: Option<PathBuf>,

        #[arg(long)]
        threshold: Option<f32>,

        /// Warnings only, no progress bar
        #[arg(short, long)]
        quiet: bool,
    },
    /// Per-search statistics
    Stats { search_id: Option<SearchId> },
    /// Delete a search with its sources and image records
    Forget {
        search_id: SearchId,

        #[arg(long)]
        delete_files: bool,
    },
    /// Remove byte-identical images under a directory
    Dedupe {
        dir: PathBuf,

        #[arg(long)]
        dry_run: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let quiet = matches!(cli.command, Command::Run { quiet: true, .. });
    let default_level = if quiet { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(&cli.config)?;
    if let Some(db) = &cli.db {
        config.db_path = db.clone();
    }

    match cli.command {
        Command::Run { query, max_images, max_workers, seeds, out, threshold, quiet } => {
            if let Some(n) = max_images {
                config.max_images = n;
            }
            if let Some(n) = max_workers {
                config.max_workers = n;
            }
            if let Some(dir) = out {
                config.download_dir = dir;
            }
            if let Some(t) = threshold {
                config.gate.threshold = t;
            }
            config.sanitize();
            run(&query, config, &cli.config, seeds.as_deref(), cli.json, quiet)
        }
        Command::Stats { search_id } => stats(&config, search_id, cli.json),
        Command::Forget { search_id, delete_files } => forget(&config, search_id, delete_files),
        Command::Dedupe { dir, dry_run } => {
            let report = dedupe::sweep_duplicates(&dir, dry_run)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let verb = if dry_run { "would remove" } else { "removed" };
                println!(
                    "Scanned {} images: {} duplicate groups, {} {} files, {} unreadable",
                    report.scanned, report.duplicate_groups, verb, report.removed.len(), report.unreadable
                );
                for path in &report.removed {
                    println!("  {}", path.display());
                }
            }
            Ok(())
        }
    }
}

fn run(query: &str, mut config: Config, env_path: &Path, seeds: Option<&Path>, json: bool, quiet: bool) -> Result<()> {
    info!("Image harvester starting");
    info!("Query: \"{}\"", query);
    info!("DB: {:?}", config.db_path);

    let store = Arc::new(
        ProvenanceStore::open(&config.db_path)
            .with_context(|| format!("Provenance store {:?} is unreachable", config.db_path))?,
    );
    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(config.fetch_timeout(), config.max_image_bytes)?);
    let scorer = select_scorer(&mut config, env_path);

    let discovery: Box<dyn LinkDiscovery> = match seeds {
        Some(path) => Box::new(SeedFileDiscovery::from_file(path, config.seed_batch_size)?),
        None => Box::new(SearchPageDiscovery::new(
            &config.search_url_template,
            Arc::clone(&fetcher),
            config.retry_policy(),
        )?),
    };

    let ctx = PipelineContext::open(query, &config, store, fetcher, scorer)?;
    let mut orchestrator = AcquisitionOrchestrator::new(ctx, discovery, &config);
    if !json && !quiet {
        orchestrator = orchestrator.with_progress();
    }

    let abort = orchestrator.abort_handle();
    ctrlc::set_handler(move || {
        warn!("Interrupted, letting in-flight downloads finish");
        abort.store(true, Ordering::SeqCst);
    })
    .context("Failed to install Ctrl-C handler")?;

    let summary = orchestrator.run()?;
    if let Some(reason) = summary.stop_reason.filter(|r| !r.is_graceful()) {
        warn!("Run cut short: {}", reason);
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", summary);
    }
    Ok(())
}

/// The ONNX relevance model when one can be found and loaded, otherwise the
/// built-in heuristic.
fn select_scorer(config: &mut Config, env_path: &Path) -> Arc<dyn Scorer> {
    let Some(model) = config.resolve_model_path(env_path) else {
        warn!("No relevance model found, falling back to heuristic scoring");
        return Arc::new(HeuristicScorer);
    };
    match OnnxScorer::new(&model) {
        Ok(scorer) => {
            info!("Relevance model: {:?}", model);
            Arc::new(scorer)
        }
        Err(e) => {
            error!("Failed to initialize relevance model {:?}: {:#}", model, e);
            Arc::new(HeuristicScorer)
        }
    }
}

fn stats(config: &Config, search_id: Option<SearchId>, json: bool) -> Result<()> {
    let store = ProvenanceStore::open(&config.db_path)?;
    let rows = match search_id {
        Some(id) => match store.search_stats(id)? {
            Some(row) => vec![row],
            None => bail!("No search with id {}", id),
        },
        None => store.list_searches()?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    println!("{:>5}  {:<30} {:>7} {:>7} {:>6} {:>8} {:>6}", "id", "query", "sources", "visited", "errors", "accepted", "score");
    for row in rows {
        let score = row.mean_score.map(|s| format!("{:.2}", s)).unwrap_or_else(|| "-".into());
        println!(
            "{:>5}  {:<30} {:>7} {:>7} {:>6} {:>8} {:>6}",
            row.search_id, row.query, row.discovered_urls, row.visited_urls, row.failed_urls, row.accepted_images, score
        );
    }
    Ok(())
}

fn forget(config: &Config, search_id: SearchId, delete_files: bool) -> Result<()> {
    let store = ProvenanceStore::open(&config.db_path)?;
    if store.search_stats(search_id)?.is_none() {
        bail!("No search with id {}", search_id);
    }

    let paths = store.delete_search(search_id)?;
    info!("Deleted search #{} ({} image records)", search_id, paths.len());

    if delete_files {
        let mut removed = 0;
        for path in &paths {
            match fs::remove_file(path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to delete {:?}: {}", path, e),
            }
        }
        println!("Forgot search #{}, deleted {} of {} files", search_id, removed, paths.len());
    } else {
        println!("Forgot search #{} ({} image records; files kept)", search_id, paths.len());
    }
    Ok(())
}
