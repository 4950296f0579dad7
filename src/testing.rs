//! In-process stand-ins for the network, the model and link discovery.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use anyhow::{Result, anyhow};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use tempfile::TempDir;

use crate::database::repo::ProvenanceStore;
use crate::discovery::{DiscoveryRound, LinkDiscovery};
use crate::download::fetch::{Fetched, Fetcher};
use crate::error::{DiscoveryError, FetchError};
use crate::media::mimetype;
use crate::ml::scorer::{ContentLabel, Scorer, ScorerOutput};
use crate::pipeline::candidate::PipelineContext;
use crate::utils::config::Config;

/// Deterministic per-pixel noise; it does not compress, so payloads stay large.
pub fn noise_image(width: u32, height: u32, seed: u32) -> RgbImage {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    RgbImage::from_fn(width, height, |_, _| {
        let mut next = || {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 24) as u8
        };
        Rgb([next(), next(), next()])
    })
}

pub fn jpeg_payload(width: u32, height: u32, seed: u32) -> Vec<u8> {
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(noise_image(width, height, seed))
        .write_with_encoder(JpegEncoder::new_with_quality(&mut out, 90))
        .expect("encode jpeg");
    out
}

/// Single-colour PNG; a few hundred bytes whatever the size.
pub fn flat_png_payload(width: u32, height: u32) -> Vec<u8> {
    let mut out = std::io::Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([200, 30, 30])))
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}

#[derive(Clone)]
enum Response {
    Body { bytes: Vec<u8>, content_type: String },
    Error(FetchError),
}

/// URL-keyed canned responses. Unknown URLs answer 404. Clones share hit counts.
#[derive(Clone, Default)]
pub struct FakeFetcher {
    responses: HashMap<String, Response>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn image(mut self, url: &str, bytes: Vec<u8>) -> Self {
        let content_type = mimetype::detect_mimetype(&bytes);
        self.responses.insert(url.to_string(), Response::Body { bytes, content_type });
        self
    }

    pub fn page(mut self, url: &str, html: &str) -> Self {
        self.responses.insert(
            url.to_string(),
            Response::Body { bytes: html.as_bytes().to_vec(), content_type: "text/html; charset=utf-8".into() },
        );
        self
    }

    pub fn error(mut self, url: &str, err: FetchError) -> Self {
        self.responses.insert(url.to_string(), Response::Error(err));
        self
    }

    pub fn hits(&self, url: &str) -> usize {
        self.hits.lock().expect("hits lock").get(url).copied().unwrap_or(0)
    }
}

impl Fetcher for FakeFetcher {
    fn fetch(&self, url: &str) -> Result<Fetched, FetchError> {
        *self.hits.lock().expect("hits lock").entry(url.to_string()).or_default() += 1;
        match self.responses.get(url) {
            Some(Response::Body { bytes, content_type }) => Ok(Fetched {
                bytes: bytes.clone(),
                content_type: Some(content_type.clone()),
                final_url: url.to_string(),
            }),
            Some(Response::Error(err)) => Err(err.clone()),
            None => Err(FetchError::Permanent("HTTP 404".into())),
        }
    }
}

/// Returns a fixed output and counts how often it was asked.
#[derive(Clone)]
pub struct FakeScorer {
    output: Option<ScorerOutput>,
    calls: Arc<AtomicUsize>,
}

impl FakeScorer {
    pub fn constant(raw_score: f32, label: ContentLabel) -> Self {
        Self { output: Some(ScorerOutput { raw_score, label }), calls: Arc::new(AtomicUsize::new(0)) }
    }

    pub fn failing() -> Self {
        Self { output: None, calls: Arc::new(AtomicUsize::new(0)) }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Scorer for FakeScorer {
    fn score(&self, _image: &DynamicImage, _query: &str, _source_domain: &str) -> Result<ScorerOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.output.ok_or_else(|| anyhow!("model exploded"))
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// Plays back a fixed list of rounds, then reports exhaustion.
pub struct ScriptedDiscovery {
    rounds: VecDeque<Result<DiscoveryRound, DiscoveryError>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedDiscovery {
    pub fn new(rounds: Vec<Result<DiscoveryRound, DiscoveryError>>) -> Self {
        Self { rounds: rounds.into(), calls: Arc::new(AtomicUsize::new(0)) }
    }

    pub fn calls_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl LinkDiscovery for ScriptedDiscovery {
    fn next_round(&mut self, _query: &str, _round: u32) -> Result<DiscoveryRound, DiscoveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.rounds.pop_front().unwrap_or(Ok(DiscoveryRound::Exhausted))
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// A context for query "abc" over an in-memory store and a scratch directory.
pub fn test_context(fetcher: FakeFetcher, scorer: FakeScorer) -> Result<(PipelineContext, TempDir)> {
    let dir = tempfile::tempdir()?;
    let mut config = Config::default();
    config.download_dir = dir.path().join("downloads");
    config.retry_backoff_ms = 0;

    let store = Arc::new(ProvenanceStore::open_in_memory()?);
    let ctx = PipelineContext::open("abc", &config, store, Arc::new(fetcher), Arc::new(scorer))?;
    Ok((ctx, dir))
}
