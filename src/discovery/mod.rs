pub mod search_page;
pub mod seeds;

use crate::error::DiscoveryError;

/// A page that may contain images for the query, optionally with direct
/// image URLs already known for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredSource {
    pub url: String,
    pub image_hints: Vec<String>,
}

impl DiscoveredSource {
    pub fn page(url: impl Into<String>) -> Self {
        Self { url: url.into(), image_hints: Vec::new() }
    }

    pub fn with_hints(url: impl Into<String>, hints: Vec<String>) -> Self {
        Self { url: url.into(), image_hints: hints }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryRound {
    Batch(Vec<DiscoveredSource>),
    /// No more candidates will come from this source.
    Exhausted,
}

/// Source of candidate pages for a query, pulled one round at a time from a
/// single thread. Failures are per round.
pub trait LinkDiscovery: Send {
    fn next_round(&mut self, query: &str, round: u32) -> Result<DiscoveryRound, DiscoveryError>;

    fn name(&self) -> &'static str;
}
