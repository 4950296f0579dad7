use std::fs;
use std::path::Path;
use std::collections::VecDeque;
use anyhow::{Result, Context};
use tracing::{info, warn};
use url::Url;

use crate::discovery::{DiscoveredSource, DiscoveryRound, LinkDiscovery};
use crate::error::DiscoveryError;

/// Reads candidates from a text file, one source per line:
///
/// ```text
/// # comment
/// https://example.com/gallery https://example.com/img/1.jpg https://example.com/img/2.jpg
/// https://example.org/profile
/// ```
///
/// The first URL on a line is the source page; any further URLs are direct
/// image hints for it. Lines are handed out `batch_size` at a time.
pub struct SeedFileDiscovery {
    pending: VecDeque<DiscoveredSource>,
    batch_size: usize,
}

impl SeedFileDiscovery {
    pub fn from_file(path: &Path, batch_size: usize) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read seed file {:?}", path))?;
        let discovery = Self::from_text(&text, batch_size);
        info!("Loaded {} seed sources from {:?}", discovery.pending.len(), path);
        Ok(discovery)
    }

    pub fn from_text(text: &str, batch_size: usize) -> Self {
        let mut pending = VecDeque::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut tokens = line.split_whitespace().filter(|t| {
                let ok = Url::parse(t).map(|u| matches!(u.scheme(), "http" | "https")).unwrap_or(false);
                if !ok {
                    warn!("Seed line {}: skipping invalid url {:?}", lineno + 1, t);
                }
                ok
            });
            let Some(source) = tokens.next() else { continue };
            pending.push_back(DiscoveredSource::with_hints(source, tokens.map(str::to_string).collect()));
        }
        Self { pending, batch_size: batch_size.max(1) }
    }

    #[cfg(test)]
    pub fn from_sources(sources: Vec<DiscoveredSource>, batch_size: usize) -> Self {
        Self { pending: sources.into(), batch_size: batch_size.max(1) }
    }
}

impl LinkDiscovery for SeedFileDiscovery {
    fn next_round(&mut self, _query: &str, _round: u32) -> Result<DiscoveryRound, DiscoveryError> {
        if self.pending.is_empty() {
            return Ok(DiscoveryRound::Exhausted);
        }
        let take = self.batch_size.min(self.pending.len());
        Ok(DiscoveryRound::Batch(self.pending.drain(..take).collect()))
    }

    fn name(&self) -> &'static str {
        "seed-file"
    }
}
