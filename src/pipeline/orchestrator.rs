use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;
use anyhow::{Result, Context, anyhow};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, error, info, warn};

use crate::database::repo::SourceUrlRecord;
use crate::discovery::{DiscoveredSource, DiscoveryRound, LinkDiscovery};
use crate::error::DiscoveryError;
use crate::pipeline::candidate::{Candidate, Outcome, PipelineContext};
use crate::pipeline::pool::{DownloadWorkerPool, RunControl};
use crate::pipeline::summary::{RunSummary, StopReason};
use crate::utils::config::Config;

/// Drives discovery rounds through the worker pool until the target is
/// reached or there is nothing left worth asking for.
pub struct AcquisitionOrchestrator {
    ctx: PipelineContext,
    pool: DownloadWorkerPool,
    discovery: Box<dyn LinkDiscovery>,
    control: RunControl,
    max_rounds: u32,
    max_idle_rounds: u32,
    progress: ProgressBar,
    seen_images: HashSet<String>,
}

impl AcquisitionOrchestrator {
    pub fn new(ctx: PipelineContext, discovery: Box<dyn LinkDiscovery>, config: &Config) -> Self {
        let deadline = config.run_deadline().map(|d| Instant::now() + d);
        Self {
            ctx,
            pool: DownloadWorkerPool::new(config.max_workers),
            discovery,
            control: RunControl::new(config.max_images, deadline),
            max_rounds: config.max_rounds.max(1),
            max_idle_rounds: config.max_idle_rounds.max(1),
            progress: ProgressBar::hidden(),
            seen_images: HashSet::new(),
        }
    }

    /// Shows a live bar of accepted images against the target.
    pub fn with_progress(mut self) -> Self {
        let bar = ProgressBar::new(self.control.target() as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} accepted {msg}")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        self.progress = bar;
        self
    }

    /// Setting this flag stops new candidates from being handed out;
    /// in-flight ones finish.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.control.abort_handle()
    }

    #[cfg(test)]
    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    pub fn run(&mut self) -> Result<RunSummary> {
        let started = Instant::now();
        let mut summary = RunSummary::new(self.ctx.search_id, &self.ctx.query, self.control.target());
        info!(
            "Acquiring up to {} images for \"{}\" with {} workers via {}",
            self.control.target(),
            self.ctx.query,
            self.pool.workers(),
            self.discovery.name()
        );

        let mut idle_rounds = 0;
        let stop = loop {
            if let Some(reason) = self.stop_condition() {
                break reason;
            }
            if summary.rounds >= self.max_rounds {
                break StopReason::MaxRounds;
            }

            let round = summary.rounds;
            summary.rounds += 1;
            self.progress.set_message(format!("round {}", round + 1));

            let batch = match self.discovery.next_round(&self.ctx.query, round) {
                Ok(DiscoveryRound::Batch(batch)) => batch,
                Ok(DiscoveryRound::Exhausted) => {
                    info!("Discovery exhausted after {} rounds", round);
                    break StopReason::DiscoveryExhausted;
                }
                Err(e @ DiscoveryError::Unavailable(_)) => {
                    error!("Link discovery unusable: {}", e);
                    self.progress.abandon();
                    return Err(anyhow!(e)).context("Link discovery unusable");
                }
                Err(e) => {
                    warn!("Discovery round {} failed: {}", round, e);
                    idle_rounds += 1;
                    if idle_rounds >= self.max_idle_rounds {
                        break StopReason::IdleRounds;
                    }
                    continue;
                }
            };

            let before = summary.accepted;
            self.run_round(batch, &mut summary)?;
            let gained = summary.accepted - before;
            info!("Round {}: {} new images, {}/{} accepted", round + 1, gained, summary.accepted, self.control.target());

            if gained == 0 {
                idle_rounds += 1;
                if idle_rounds >= self.max_idle_rounds {
                    if let Some(reason) = self.stop_condition() {
                        break reason;
                    }
                    break StopReason::IdleRounds;
                }
            } else {
                idle_rounds = 0;
            }
        };

        self.progress.finish_with_message(stop.to_string());
        summary.finish(stop, started.elapsed().as_secs_f64());
        info!(
            "Run finished ({}): {} accepted, {} filtered, {} duplicate, {} failed",
            stop, summary.accepted, summary.filtered, summary.duplicate, summary.failed
        );
        Ok(summary)
    }

    fn stop_condition(&self) -> Option<StopReason> {
        if self.control.target_reached() {
            Some(StopReason::TargetReached)
        } else if self.control.is_aborted() {
            Some(StopReason::Aborted)
        } else if self.control.deadline_passed() {
            Some(StopReason::Deadline)
        } else {
            None
        }
    }

    fn run_round(&mut self, batch: Vec<DiscoveredSource>, summary: &mut RunSummary) -> Result<()> {
        let urls: Vec<String> = batch.iter().map(|s| s.url.clone()).collect();
        let added = self.ctx.store
            .add_source_urls(self.ctx.search_id, &urls)
            .context("Failed to record discovered sources")?;
        if added.len() < batch.len() {
            debug!("{} of {} sources were already known", batch.len() - added.len(), batch.len());
        }

        let mut added: HashMap<String, SourceUrlRecord> =
            added.into_iter().map(|record| (record.url.clone(), record)).collect();
        let mut sources = Vec::new();
        let mut known_hints = Vec::new();
        for source in batch {
            if let Some(record) = added.remove(&source.url) {
                sources.push((record, source.image_hints));
                continue;
            }
            // Known pages are not visited again, but they can still bring new direct images.
            let unseen: Vec<String> = source.image_hints
                .into_iter()
                .filter(|image| !self.seen_images.contains(image))
                .collect();
            if unseen.is_empty() {
                continue;
            }
            let Some(record) = self.ctx.store
                .source_url_by_url(self.ctx.search_id, &source.url)
                .context("Failed to look up known source")?
            else {
                warn!("{}: known source has no record", source.url);
                continue;
            };
            debug!("{}: already known, {} new image hints", source.url, unseen.len());
            known_hints.extend(unseen.into_iter().map(|image_url| Candidate { source: record.clone(), image_url }));
        }

        let mut candidates = self.pool.visit_sources(&self.ctx, sources, &self.control);
        candidates.extend(known_hints);
        let fresh: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| self.seen_images.insert(c.image_url.clone()))
            .collect();
        debug!("{} new candidates this round", fresh.len());

        let progress = &self.progress;
        let control = &self.control;
        self.pool.process(&self.ctx, fresh, control, |_, outcome| {
            summary.record(outcome);
            if matches!(outcome, Outcome::Recorded { .. }) {
                progress.set_position(control.accepted() as u64);
            }
        });
        Ok(())
    }
}
