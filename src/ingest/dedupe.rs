use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use anyhow::Result;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::ingest::hasher::{self, ContentHash};
use crate::ingest::scanner;

#[derive(Debug, Default, Serialize)]
pub struct DedupeReport {
    pub scanned: usize,
    pub duplicate_groups: usize,
    pub removed: Vec<PathBuf>,
    pub unreadable: usize,
}

/// Removes byte-identical copies under `root`, keeping the first file name of
/// each group. With `dry_run` the report lists what would be removed.
pub fn sweep_duplicates(root: &Path, dry_run: bool) -> Result<DedupeReport> {
    let files = scanner::scan_images(root, usize::MAX)?;
    info!("Hashing {} images under {:?}", files.len(), root);

    let hashed: Vec<(PathBuf, Result<ContentHash>)> = files
        .into_par_iter()
        .map(|path| {
            let hash = hasher::calculate_hash(&path);
            (path, hash)
        })
        .collect();

    let mut report = DedupeReport { scanned: hashed.len(), ..Default::default() };
    let mut groups: BTreeMap<ContentHash, Vec<PathBuf>> = BTreeMap::new();
    for (path, hash) in hashed {
        match hash {
            Ok(hash) => groups.entry(hash).or_default().push(path),
            Err(e) => {
                warn!("Failed to hash {:?}: {}", path, e);
                report.unreadable += 1;
            }
        }
    }

    for (hash, mut paths) in groups {
        if paths.len() < 2 {
            continue;
        }
        report.duplicate_groups += 1;
        paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()).then_with(|| a.cmp(b)));

        let keep = &paths[0];
        info!("Duplicate set {} keeps {:?}", hash.short(), keep);
        for duplicate in &paths[1..] {
            if !dry_run {
                if let Err(e) = fs::remove_file(duplicate) {
                    warn!("Failed to remove {:?}: {}", duplicate, e);
                    continue;
                }
            }
            report.removed.push(duplicate.clone());
        }
    }

    Ok(report)
}
