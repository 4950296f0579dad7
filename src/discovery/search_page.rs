use std::collections::HashSet;
use std::sync::Arc;
use anyhow::{Result, Context};
use regex::Regex;
use tracing::{debug, info};
use url::form_urlencoded;

use crate::discovery::{DiscoveredSource, DiscoveryRound, LinkDiscovery};
use crate::download::fetch::Fetcher;
use crate::download::retry::RetryPolicy;
use crate::error::{DiscoveryError, FetchError};

pub const DEFAULT_TEMPLATE: &str = "https://www.bing.com/images/async?q={query}&first={offset}&count=35&adlt=moderate";
pub const PAGE_SIZE: u32 = 35;

/// Scrapes an image-search results page. The template carries `{query}` and
/// `{offset}` placeholders; each round asks for the next page of results.
pub struct SearchPageDiscovery {
    template: String,
    fetcher: Arc<dyn Fetcher>,
    retry: RetryPolicy,
    metadata: Regex,
    imgres: Regex,
    seen_images: HashSet<String>,
}

impl SearchPageDiscovery {
    pub fn new(template: &str, fetcher: Arc<dyn Fetcher>, retry: RetryPolicy) -> Result<Self> {
        if !template.contains("{query}") {
            anyhow::bail!("search url template {:?} has no {{query}} placeholder", template);
        }
        Ok(Self {
            template: template.to_string(),
            fetcher,
            retry,
            // result tiles carry {"purl": page, "murl": media} in an HTML-escaped attribute
            metadata: Regex::new(r#""purl":"([^"]+)".*?"murl":"([^"]+)""#)
                .context("Invalid metadata pattern")?,
            imgres: Regex::new(r#"imgres\?([^"'\s<>]+)"#).context("Invalid imgres pattern")?,
            seen_images: HashSet::new(),
        })
    }

    pub fn page_url(&self, query: &str, round: u32) -> String {
        let encoded: String = form_urlencoded::byte_serialize(query.as_bytes()).collect();
        self.template
            .replace("{query}", &encoded)
            .replace("{offset}", &(round * PAGE_SIZE + 1).to_string())
    }

    /// (source page, image) pairs in page order.
    pub fn extract_pairs(&self, html: &str) -> Vec<(String, String)> {
        let html = html.replace("&quot;", "\"").replace("&amp;", "&");
        let mut pairs = Vec::new();

        for caps in self.metadata.captures_iter(&html) {
            pairs.push((unescape_json(&caps[1]), unescape_json(&caps[2])));
        }
        for caps in self.imgres.captures_iter(&html) {
            let mut image = None;
            let mut page = None;
            for (key, value) in form_urlencoded::parse(caps[1].as_bytes()) {
                match key.as_ref() {
                    "imgurl" => image = Some(value.into_owned()),
                    "imgrefurl" => page = Some(value.into_owned()),
                    _ => {}
                }
            }
            if let (Some(page), Some(image)) = (page, image) {
                pairs.push((page, image));
            }
        }

        pairs.retain(|(page, image)| is_http(page) && is_http(image));
        pairs
    }
}

impl LinkDiscovery for SearchPageDiscovery {
    fn next_round(&mut self, query: &str, round: u32) -> Result<DiscoveryRound, DiscoveryError> {
        let url = self.page_url(query, round);
        debug!("Discovery round {}: {}", round, url);

        let fetched = self
            .retry
            .run(|_| self.fetcher.fetch(&url))
            .map_err(|e| {
                let detail = format!("{}: {}", url, e);
                // A first page that is refused outright means the search endpoint
                // itself is unusable; anything else is one bad round.
                match e {
                    FetchError::Permanent(_) if round == 0 => DiscoveryError::Unavailable(detail),
                    _ => DiscoveryError::RoundFailed(detail),
                }
            })?;
        let html = String::from_utf8_lossy(&fetched.bytes);

        let mut sources: Vec<DiscoveredSource> = Vec::new();
        for (page, image) in self.extract_pairs(&html) {
            if !self.seen_images.insert(image.clone()) {
                continue;
            }
            match sources.iter_mut().find(|s| s.url == page) {
                Some(source) => source.image_hints.push(image),
                None => sources.push(DiscoveredSource::with_hints(page, vec![image])),
            }
        }

        if sources.is_empty() {
            info!("Search page for round {} had no new results", round);
            return Ok(DiscoveryRound::Exhausted);
        }
        Ok(DiscoveryRound::Batch(sources))
    }

    fn name(&self) -> &'static str {
        "search-page"
    }
}

fn unescape_json(s: &str) -> String {
    s.replace("\\/", "/").replace("\\u0026", "&")
}

fn is_http(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}
