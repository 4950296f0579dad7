use walkdir::{WalkDir, DirEntry};
use std::path::{Path, PathBuf};
use anyhow::Result;

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];

/// Lists image files under `root`, skipping hidden entries (which includes
/// our own in-flight `.incoming-*` temp files). Results are sorted by path.
pub fn scan_images(root: &Path, max_depth: usize) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    if !root.exists() {
        return Ok(found);
    }

    let walker = WalkDir::new(root).max_depth(max_depth).into_iter();
    for entry in walker.filter_entry(|e| e.depth() == 0 || !is_hidden(e)) {
        let entry = entry?;
        if entry.file_type().is_file() && is_image(entry.path()) {
            found.push(entry.path().to_path_buf());
        }
    }

    found.sort();
    Ok(found)
}

pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name()
         .to_str()
         .map(|s| s.starts_with('.'))
         .unwrap_or(false)
}
