use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use walkdir::WalkDir;
use anyhow::{Result, Context, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::discovery::search_page::DEFAULT_TEMPLATE;
use crate::download::retry::RetryPolicy;
use crate::filter::gate::GatePolicy;
use crate::pipeline::pool::{DEFAULT_WORKERS, MAX_WORKERS};

pub const DEFAULT_ENV_FILE: &str = ".env";
pub const MODEL_FILE_NAME: &str = "relevance.onnx";
const MODEL_KEY: &str = "HARVEST_MODEL_PATH";
const MODEL_SEARCH_DEPTH: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub db_path: PathBuf,
    pub download_dir: PathBuf,
    pub max_images: usize,
    pub max_workers: usize,
    pub max_image_bytes: u64,
    pub fetch_timeout_secs: u64,
    pub max_fetch_attempts: u32,
    pub retry_backoff_ms: u64,
    pub max_rounds: u32,
    pub max_idle_rounds: u32,
    pub max_images_per_page: usize,
    pub seed_batch_size: usize,
    pub run_deadline_secs: Option<u64>,
    pub orphan_grace_secs: u64,
    pub model_path: Option<PathBuf>,
    pub search_url_template: String,
    pub extra_deny_patterns: Vec<String>,
    pub gate: GatePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("image_sources.db"),
            download_dir: PathBuf::from("downloads"),
            max_images: 10,
            max_workers: DEFAULT_WORKERS,
            max_image_bytes: 20 * 1024 * 1024,
            fetch_timeout_secs: 15,
            max_fetch_attempts: 3,
            retry_backoff_ms: 300,
            max_rounds: 6,
            max_idle_rounds: 2,
            max_images_per_page: 40,
            seed_batch_size: 20,
            run_deadline_secs: None,
            orphan_grace_secs: 600,
            model_path: None,
            search_url_template: DEFAULT_TEMPLATE.to_string(),
            extra_deny_patterns: Vec::new(),
            gate: GatePolicy::default(),
        }
    }
}

impl Config {
    /// Defaults overlaid with `HARVEST_*` keys from a `.env`-style file.
    /// A missing file just means defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Config::default();
        if path.exists() {
            for (key, value) in read_env_file(path)? {
                config.apply(&key, &value)
                    .with_context(|| format!("Invalid value for {} in {:?}", key, path))?;
            }
            info!("Loaded configuration from {:?}", path);
        }
        config.sanitize();
        Ok(config)
    }

    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let Some(name) = key.strip_prefix("HARVEST_") else { return Ok(()) };
        match name {
            "DB_PATH" => self.db_path = PathBuf::from(value),
            "DOWNLOAD_DIR" => self.download_dir = PathBuf::from(value),
            "MAX_IMAGES" => self.max_images = parse(value)?,
            "MAX_WORKERS" => self.max_workers = parse(value)?,
            "MAX_IMAGE_BYTES" => self.max_image_bytes = parse(value)?,
            "FETCH_TIMEOUT_SECS" => self.fetch_timeout_secs = parse(value)?,
            "MAX_FETCH_ATTEMPTS" => self.max_fetch_attempts = parse(value)?,
            "RETRY_BACKOFF_MS" => self.retry_backoff_ms = parse(value)?,
            "MAX_ROUNDS" => self.max_rounds = parse(value)?,
            "MAX_IDLE_ROUNDS" => self.max_idle_rounds = parse(value)?,
            "MAX_IMAGES_PER_PAGE" => self.max_images_per_page = parse(value)?,
            "SEED_BATCH_SIZE" => self.seed_batch_size = parse(value)?,
            "RUN_DEADLINE_SECS" => self.run_deadline_secs = Some(parse(value)?),
            "ORPHAN_GRACE_SECS" => self.orphan_grace_secs = parse(value)?,
            "MODEL_PATH" => self.model_path = Some(PathBuf::from(value)),
            "SEARCH_URL_TEMPLATE" => self.search_url_template = value.to_string(),
            "DENY_PATTERNS" => {
                self.extra_deny_patterns = value
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "THRESHOLD" => self.gate.threshold = parse(value)?,
            "MIN_WIDTH" => self.gate.min_width = parse(value)?,
            "MIN_HEIGHT" => self.gate.min_height = parse(value)?,
            "MIN_BYTES" => self.gate.min_bytes = parse(value)?,
            "PORTRAIT_BONUS" => self.gate.portrait_bonus = parse(value)?,
            "LARGE_BONUS" => self.gate.large_bonus = parse(value)?,
            "ADJUST_PORTRAIT_PHOTO" => self.gate.portrait_photo_adjust = parse(value)?,
            "ADJUST_GROUP_PHOTO" => self.gate.group_photo_adjust = parse(value)?,
            "ADJUST_SUBJECT_PHOTO" => self.gate.subject_photo_adjust = parse(value)?,
            "ADJUST_ARTWORK" => self.gate.artwork_adjust = parse(value)?,
            "ADJUST_UI_ELEMENT" => self.gate.ui_element_adjust = parse(value)?,
            _ => warn!("Ignoring unknown setting {}", key),
        }
        Ok(())
    }

    /// Pulls knobs back into their usable ranges.
    pub fn sanitize(&mut self) {
        self.max_workers = self.max_workers.clamp(1, MAX_WORKERS);
        self.max_fetch_attempts = self.max_fetch_attempts.max(1);
        self.max_idle_rounds = self.max_idle_rounds.max(1);
        self.max_rounds = self.max_rounds.max(1);
        self.seed_batch_size = self.seed_batch_size.max(1);
        self.gate.threshold = self.gate.threshold.clamp(0.0, 1.0);
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_fetch_attempts, Duration::from_millis(self.retry_backoff_ms))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        self.run_deadline_secs.map(Duration::from_secs)
    }

    /// How old an unrecorded hash registration must be before a new run
    /// treats it as left behind by a crash.
    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }

    /// Relevance model location: the configured path if it exists, else a
    /// search of nearby directories. A found model is remembered in the env file.
    pub fn resolve_model_path(&mut self, env_path: &Path) -> Option<PathBuf> {
        if let Some(path) = &self.model_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("Configured model {:?} does not exist, searching", path);
        }

        let found = find_file(MODEL_FILE_NAME, MODEL_SEARCH_DEPTH).ok()?;
        info!("Found relevance model: {:?}", found);
        match save_to_env(env_path, MODEL_KEY, &found.display().to_string()) {
            Ok(()) => info!("Saved model path to {:?}", env_path),
            Err(e) => warn!("Failed to save model path to {:?}: {:#}", env_path, e),
        }
        self.model_path = Some(found.clone());
        Some(found)
    }
}

fn parse<T>(value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(value.trim().parse::<T>()?)
}

fn read_env_file(path: &Path) -> Result<Vec<(String, String)>> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let reader = BufReader::new(file);

    let mut pairs = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches('"');
            pairs.push((key.trim().to_string(), value.to_string()));
        }
    }
    Ok(pairs)
}

/// Sets `key` in a `.env` file, replacing an existing assignment and
/// leaving every other line as it was.
pub fn save_to_env(path: &Path, key: &str, value: &str) -> Result<()> {
    let existing = if path.exists() {
        fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?
    } else {
        String::new()
    };

    let mut lines: Vec<String> = Vec::new();
    let mut replaced = false;
    for line in existing.lines() {
        let is_key = line.split_once('=').is_some_and(|(k, _)| k.trim() == key);
        if is_key {
            if !replaced {
                lines.push(format!("{}={}", key, value));
                replaced = true;
            }
        } else {
            lines.push(line.to_string());
        }
    }
    if !replaced {
        lines.push(format!("{}={}", key, value));
    }

    let mut text = lines.join("\n");
    text.push('\n');
    fs::write(path, text).context("Failed to write .env file")
}

/// Looks for `filename` below the current directory, then below its parent.
pub fn find_file(filename: &str, max_depth: usize) -> Result<PathBuf> {
    let root = std::env::current_dir()?;
    let mut roots = vec![root.clone()];
    if let Some(parent) = root.parent() {
        roots.push(parent.to_path_buf());
    }
    for dir in &roots {
        let hit = WalkDir::new(dir)
            .max_depth(max_depth)
            .into_iter()
            .filter_map(|e| e.ok())
            .find(|e| e.file_type().is_file() && e.file_name() == filename);
        if let Some(entry) = hit {
            return Ok(entry.into_path());
        }
    }
    Err(anyhow!("Could not find file '{}' in nearby directories.", filename))
}
