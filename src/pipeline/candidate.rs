use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use anyhow::{Result, bail};
use tracing::{debug, info, warn};

use crate::database::index::ContentHashIndex;
use crate::database::repo::{NewAcceptedImage, ProvenanceStore, SearchId, SourceUrlRecord};
use crate::download::fetch::{self, Fetcher};
use crate::download::page::ImageLinkExtractor;
use crate::download::retry::RetryPolicy;
use crate::error::{CandidateError, FetchError};
use crate::filter::gate::{FilterReason, RelevanceGate};
use crate::filter::patterns::DenyPatterns;
use crate::ingest::hasher::ContentHash;
use crate::media::normalize;
use crate::ml::scorer::{ContentLabel, Scorer};
use crate::storage::layout::{CommitOutcome, StorageLayout};
use crate::storage::naming::normalize_query;
use crate::utils::config::Config;

/// Everything a worker needs to take one candidate from URL to record.
/// Shared by reference across all workers of a run.
pub struct PipelineContext {
    pub query: String,
    pub search_id: SearchId,
    pub fetcher: Arc<dyn Fetcher>,
    pub retry: RetryPolicy,
    pub gate: RelevanceGate,
    pub layout: StorageLayout,
    pub index: ContentHashIndex,
    pub store: Arc<ProvenanceStore>,
    pub extractor: ImageLinkExtractor,
    pub max_images_per_page: usize,
}

impl PipelineContext {
    /// Starts a new search for `query` and prepares its output directory.
    pub fn open(
        query: &str,
        config: &Config,
        store: Arc<ProvenanceStore>,
        fetcher: Arc<dyn Fetcher>,
        scorer: Arc<dyn Scorer>,
    ) -> Result<Self> {
        let query = normalize_query(query);
        if query.is_empty() {
            bail!("query is empty");
        }
        let layout = StorageLayout::open(&config.download_dir, &query)?;
        let deny = DenyPatterns::with_extra(&config.extra_deny_patterns)?;
        let gate = RelevanceGate::new(config.gate.clone(), deny, scorer);
        let index = ContentHashIndex::new(Arc::clone(&store));
        layout.reconcile(&index, config.orphan_grace())?;
        let search_id = store.create_search(&query)?;
        info!("Search #{} for \"{}\" into {:?}", search_id, query, layout.dir());

        Ok(Self {
            query,
            search_id,
            fetcher,
            retry: config.retry_policy(),
            gate,
            layout,
            index,
            store,
            extractor: ImageLinkExtractor::new()?,
            max_images_per_page: config.max_images_per_page,
        })
    }
}

/// One image URL found on (or hinted for) a source page.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub source: SourceUrlRecord,
    pub image_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateState {
    Pending,
    Fetching,
    Decoded,
    Gated,
    Stored,
    Recorded,
    Rejected,
    Failed,
}

impl fmt::Display for CandidateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CandidateState::Pending => "pending",
            CandidateState::Fetching => "fetching",
            CandidateState::Decoded => "decoded",
            CandidateState::Gated => "gated",
            CandidateState::Stored => "stored",
            CandidateState::Recorded => "recorded",
            CandidateState::Rejected => "rejected",
            CandidateState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Terminal result for a candidate. `Filtered` and `Duplicate` are both the
/// `Rejected` state; only `Failed` is an error.
#[derive(Debug)]
pub enum Outcome {
    Recorded { path: PathBuf, score: f32, label: ContentLabel },
    Filtered(FilterReason),
    Duplicate(ContentHash),
    Failed(CandidateError),
}

impl Outcome {
    pub fn state(&self) -> CandidateState {
        match self {
            Outcome::Recorded { .. } => CandidateState::Recorded,
            Outcome::Filtered(_) | Outcome::Duplicate(_) => CandidateState::Rejected,
            Outcome::Failed(_) => CandidateState::Failed,
        }
    }
}

fn transition(url: &str, from: CandidateState, to: CandidateState) {
    debug!("{}: {} -> {}", url, from, to);
}

/// Runs one candidate through fetch, decode, gate, store and record. Every
/// failure stays with this candidate; nothing here aborts the pool.
pub fn process_candidate(ctx: &PipelineContext, candidate: &Candidate) -> Outcome {
    let url = candidate.image_url.as_str();
    let source = &candidate.source;

    if let Some(reason) = ctx.gate.screen_url(url) {
        transition(url, CandidateState::Pending, CandidateState::Rejected);
        return Outcome::Filtered(reason);
    }

    transition(url, CandidateState::Pending, CandidateState::Fetching);
    let fetched = match ctx.retry.run(|_| ctx.fetcher.fetch(url)) {
        Ok(fetched) => fetched,
        Err(e) => return fail(ctx, candidate, CandidateState::Fetching, e.into()),
    };
    if !fetch::is_image_content_type(fetched.content_type.as_deref()) {
        let err = FetchError::Permanent(format!(
            "unsupported content type {}",
            fetched.content_type.as_deref().unwrap_or("")
        ));
        return fail(ctx, candidate, CandidateState::Fetching, err.into());
    }
    if let Some(reason) = ctx.gate.screen_payload(fetched.bytes.len() as u64) {
        transition(url, CandidateState::Fetching, CandidateState::Rejected);
        return Outcome::Filtered(reason);
    }

    let decoded = match normalize::decode(&fetched.bytes) {
        Ok(decoded) => decoded,
        Err(e) => return fail(ctx, candidate, CandidateState::Fetching, e),
    };
    transition(url, CandidateState::Fetching, CandidateState::Decoded);

    let verdict = ctx.gate.evaluate(&decoded, url, &ctx.query, &source.domain);
    transition(url, CandidateState::Decoded, CandidateState::Gated);
    if !verdict.accept {
        let reason = verdict.rejection.unwrap_or(FilterReason::LowScore {
            score: verdict.score,
            threshold: ctx.gate.policy().threshold,
        });
        let stage = if reason.is_prefilter() { "pre-filter" } else { "scoring" };
        debug!("{}: filtered at {} ({})", url, stage, reason);
        transition(url, CandidateState::Gated, CandidateState::Rejected);
        return Outcome::Filtered(reason);
    }

    let normalized = match normalize::normalize(&decoded) {
        Ok(normalized) => normalized,
        Err(e) => return fail(ctx, candidate, CandidateState::Gated, CandidateError::Decode(format!("{:#}", e))),
    };

    let stored = match ctx.layout.commit(&normalized.bytes, normalized.extension, &source.domain, &ctx.index) {
        Ok(CommitOutcome::Stored(stored)) => stored,
        Ok(CommitOutcome::Duplicate(hash)) => {
            debug!("{}: duplicate of {}", url, hash.short());
            transition(url, CandidateState::Gated, CandidateState::Rejected);
            return Outcome::Duplicate(hash);
        }
        Err(e) => return fail(ctx, candidate, CandidateState::Gated, CandidateError::Io(format!("{:#}", e))),
    };
    transition(url, CandidateState::Gated, CandidateState::Stored);

    let record = NewAcceptedImage {
        source_url_id: source.id,
        image_url: url.to_string(),
        content_hash: stored.hash,
        file_path: stored.path.clone(),
        byte_size: stored.byte_size,
        width: decoded.width(),
        height: decoded.height(),
        relevance_score: verdict.score,
        content_label: verdict.label,
    };
    if let Err(e) = ctx.store.insert_accepted_image(&record) {
        if let Err(undo) = ctx.layout.retract(&stored, &ctx.index) {
            warn!("Failed to retract {:?}: {:#}", stored.path, undo);
        }
        return fail(ctx, candidate, CandidateState::Stored, e.into());
    }
    transition(url, CandidateState::Stored, CandidateState::Recorded);

    info!(
        "Accepted {} ({}x{}, {}, score {:.2}) -> {:?}",
        url,
        decoded.width(),
        decoded.height(),
        verdict.label,
        verdict.score,
        stored.path
    );
    Outcome::Recorded { path: stored.path, score: verdict.score, label: verdict.label }
}

fn fail(ctx: &PipelineContext, candidate: &Candidate, from: CandidateState, err: CandidateError) -> Outcome {
    transition(&candidate.image_url, from, CandidateState::Failed);
    warn!("{}: {} failed: {}", candidate.image_url, err.kind(), err);
    let note = format!("{}: {}", candidate.image_url, err);
    if let Err(e) = ctx.store.record_source_error(candidate.source.id, &note) {
        warn!("Failed to record error for source {}: {:#}", candidate.source.id, e);
    }
    Outcome::Failed(err)
}

/// Image URLs for a source page: its hints when discovery supplied them,
/// otherwise whatever the page itself links. Marks the source visited,
/// with the page error if it could not be read.
pub fn expand_source(ctx: &PipelineContext, source: &SourceUrlRecord, hints: &[String]) -> Vec<String> {
    let (images, error) = if !hints.is_empty() {
        (hints.iter().take(ctx.max_images_per_page).cloned().collect(), None)
    } else {
        match ctx.retry.run(|_| ctx.fetcher.fetch(&source.url)) {
            Ok(page) => {
                let html = String::from_utf8_lossy(&page.bytes);
                let images = ctx.extractor.extract(&html, &page.final_url, ctx.max_images_per_page);
                debug!("{}: {} image links", source.url, images.len());
                (images, None)
            }
            Err(e) => {
                warn!("Failed to visit {}: {}", source.url, e);
                (Vec::new(), Some(e.to_string()))
            }
        }
    };

    if let Err(e) = ctx.store.mark_visited(source.id, error.as_deref()) {
        warn!("Failed to mark {} visited: {:#}", source.url, e);
    }
    images
}
