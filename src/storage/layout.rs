use std::collections::HashSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use anyhow::{Result, Context, anyhow};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::database::index::ContentHashIndex;
use crate::database::repo::Registration;
use crate::ingest::hasher::{self, ContentHash};
use crate::ingest::scanner;
use crate::storage::naming::{domain_token, query_dir_name};

const TEMP_PREFIX: &str = ".incoming-";
const TEMP_SUFFIX: &str = ".part";
const MAX_NAME_ATTEMPTS: usize = 64;

/// Per-query output directory with sequential, collision-free file names.
pub struct StorageLayout {
    dir: PathBuf,
    next_seq: AtomicU64,
}

/// Bytes durably written to a hidden temp file in the query directory,
/// not yet visible under a final name. Dropping it deletes the temp file.
pub struct StagedFile {
    temp: NamedTempFile,
    pub hash: ContentHash,
    pub byte_size: u64,
    pub extension: &'static str,
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub path: PathBuf,
    pub hash: ContentHash,
    pub byte_size: u64,
}

#[derive(Debug)]
pub enum CommitOutcome {
    Stored(StoredFile),
    Duplicate(ContentHash),
}

/// What `reconcile` cleaned up after an interrupted run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reconciled {
    pub released: usize,
    pub removed: Vec<PathBuf>,
}

pub fn file_name(seq: u64, domain: &str, extension: &str) -> String {
    format!("{:03}_{}.{}", seq, domain_token(domain), extension)
}

impl StorageLayout {
    pub fn open(root: &Path, query: &str) -> Result<Self> {
        let dir = root.join(query_dir_name(query));
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create output directory {:?}", dir))?;

        sweep_stale_temp_files(&dir)?;
        let next = next_sequence(&dir)?;
        info!("Output directory {:?}, next sequence {:03}", dir, next);

        Ok(Self { dir, next_seq: AtomicU64::new(next) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reserves the next sequence number. Each call returns a distinct name.
    pub fn assign_name(&self, domain: &str, extension: &str) -> PathBuf {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.dir.join(file_name(seq, domain, extension))
    }

    pub fn stage(&self, bytes: &[u8], extension: &'static str) -> Result<StagedFile> {
        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&self.dir)
            .context("Failed to create staging file")?;
        temp.write_all(bytes).context("Failed to write staging file")?;
        temp.flush()?;
        temp.as_file().sync_all().context("Failed to sync staging file")?;

        // Hash what actually landed on disk, not the buffer we meant to write.
        let hash = hasher::calculate_hash(temp.path())?;
        Ok(StagedFile { temp, hash, byte_size: bytes.len() as u64, extension })
    }

    /// Registers the staged hash and, only if this caller won the
    /// registration, moves the file to its final name. A duplicate's temp
    /// file is removed and nothing appears at any final path.
    pub fn promote(&self, staged: StagedFile, domain: &str, index: &ContentHashIndex) -> Result<CommitOutcome> {
        let StagedFile { temp, hash, byte_size, extension } = staged;

        match index.register(&hash)? {
            Registration::AlreadyPresent => {
                temp.close().context("Failed to remove duplicate staging file")?;
                return Ok(CommitOutcome::Duplicate(hash));
            }
            Registration::Inserted => {}
        }

        let mut temp = temp;
        for _ in 0..MAX_NAME_ATTEMPTS {
            let path = self.assign_name(domain, extension);
            match temp.persist_noclobber(&path) {
                Ok(_) => {
                    debug!("Promoted {} to {:?}", hash.short(), path);
                    return Ok(CommitOutcome::Stored(StoredFile { path, hash, byte_size }));
                }
                Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                    // Someone else's file (another process, or a manual copy) owns the name.
                    warn!("{:?} already exists, taking the next sequence number", path);
                    temp = e.file;
                }
                Err(e) => {
                    release_quietly(index, &hash);
                    return Err(anyhow!(e.error)).context(format!("Failed to promote {:?}", path));
                }
            }
        }

        release_quietly(index, &hash);
        Err(anyhow!("No free file name after {} attempts in {:?}", MAX_NAME_ATTEMPTS, self.dir))
    }

    pub fn commit(&self, bytes: &[u8], extension: &'static str, domain: &str, index: &ContentHashIndex) -> Result<CommitOutcome> {
        let staged = self.stage(bytes, extension)?;
        self.promote(staged, domain, index)
    }

    /// Compensates a promotion whose provenance record could not be written.
    pub fn retract(&self, stored: &StoredFile, index: &ContentHashIndex) -> Result<()> {
        if let Err(e) = fs::remove_file(&stored.path) {
            if e.kind() != ErrorKind::NotFound {
                return Err(e).with_context(|| format!("Failed to remove {:?}", stored.path));
            }
        }
        index.release(&stored.hash)?;
        Ok(())
    }

    /// Undoes commits that were promoted but never recorded: a process that
    /// died between `promote` and the provenance insert leaves a registered
    /// hash with no image row and a final file nobody points at. Such files
    /// in this directory are removed and every orphaned hash is released, so
    /// the content can be accepted again. Registrations younger than `grace`
    /// may belong to a live run and are left alone.
    pub fn reconcile(&self, index: &ContentHashIndex, grace: Duration) -> Result<Reconciled> {
        let orphans: HashSet<ContentHash> = index.orphans(grace)?.into_iter().collect();
        let mut report = Reconciled::default();
        if orphans.is_empty() {
            return Ok(report);
        }

        for path in scanner::scan_images(&self.dir, 1)? {
            let hash = match hasher::calculate_hash(&path) {
                Ok(hash) => hash,
                Err(e) => {
                    warn!("Skipping unreadable {:?}: {:#}", path, e);
                    continue;
                }
            };
            if orphans.contains(&hash) {
                warn!("Removing unrecorded {:?} left by an interrupted run", path);
                fs::remove_file(&path).with_context(|| format!("Failed to remove {:?}", path))?;
                report.removed.push(path);
            }
        }

        for hash in &orphans {
            if index.release(hash)? {
                report.released += 1;
            }
        }
        info!("Released {} orphaned registrations, removed {} files", report.released, report.removed.len());
        Ok(report)
    }
}

fn release_quietly(index: &ContentHashIndex, hash: &ContentHash) {
    if let Err(e) = index.release(hash) {
        warn!("Failed to release hash {}: {}", hash.short(), e);
    }
}

fn sweep_stale_temp_files(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX) {
            warn!("Removing stale staging file {:?}", entry.path());
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

fn next_sequence(dir: &Path) -> Result<u64> {
    let highest = scanner::scan_images(dir, 1)?
        .iter()
        .filter_map(|path| path.file_stem()?.to_str()?.split('_').next()?.parse::<u64>().ok())
        .max();
    Ok(highest.map_or(0, |n| n + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use crate::database::repo::{NewAcceptedImage, ProvenanceStore};
    use crate::ml::scorer::ContentLabel;

    fn index() -> Result<ContentHashIndex> {
        Ok(ContentHashIndex::new(Arc::new(ProvenanceStore::open_in_memory()?)))
    }

    fn visible_files(dir: &Path) -> Result<Vec<String>> {
        let mut names: Vec<String> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }

    #[test]
    fn names_are_sequential_and_domain_tagged() -> Result<()> {
        let root = tempfile::tempdir()?;
        let layout = StorageLayout::open(root.path(), "abc")?;
        let index = index()?;

        for (i, bytes) in [b"one".as_slice(), b"two".as_slice()].into_iter().enumerate() {
            match layout.commit(bytes, "jpg", "www.example.com", &index)? {
                CommitOutcome::Stored(stored) => {
                    assert_eq!(stored.path, root.path().join("abc").join(format!("{:03}_example_com.jpg", i)));
                    assert_eq!(stored.hash, ContentHash::of_bytes(bytes));
                }
                other => panic!("expected stored, got {:?}", other),
            }
        }
        Ok(())
    }

    #[test]
    fn reopening_continues_after_existing_files() -> Result<()> {
        let root = tempfile::tempdir()?;
        let dir = root.path().join("abc");
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("007_example_com.jpg"), b"old")?;
        fs::write(dir.join(".incoming-crash.part"), b"half written")?;

        let layout = StorageLayout::open(root.path(), "abc")?;
        assert_eq!(layout.assign_name("a.org", "png"), dir.join("008_a_org.png"));
        assert_eq!(visible_files(&dir)?, vec!["007_example_com.jpg"]);
        Ok(())
    }

    #[test]
    fn duplicate_commit_leaves_no_file_behind() -> Result<()> {
        let root = tempfile::tempdir()?;
        let layout = StorageLayout::open(root.path(), "abc")?;
        let index = index()?;

        assert!(matches!(layout.commit(b"same", "jpg", "a.com", &index)?, CommitOutcome::Stored(_)));
        assert!(matches!(layout.commit(b"same", "jpg", "b.com", &index)?, CommitOutcome::Duplicate(_)));
        assert_eq!(visible_files(layout.dir())?, vec!["000_a_com.jpg"]);
        Ok(())
    }

    #[test]
    fn crash_between_write_and_registration_leaves_no_final_file() -> Result<()> {
        let root = tempfile::tempdir()?;
        let layout = StorageLayout::open(root.path(), "abc")?;
        let index = index()?;

        let staged = layout.stage(b"bytes that never get registered", "jpg")?;
        let hash = staged.hash;
        // The staged file is hidden while it waits.
        assert!(scanner::scan_images(layout.dir(), 1)?.is_empty());
        drop(staged);

        assert!(visible_files(layout.dir())?.is_empty());
        assert!(!index.contains(&hash)?);
        Ok(())
    }

    #[test]
    fn concurrent_commits_of_same_bytes_store_once() -> Result<()> {
        let root = tempfile::tempdir()?;
        let layout = Arc::new(StorageLayout::open(root.path(), "abc")?);
        let index = index()?;

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let layout = Arc::clone(&layout);
                let index = index.clone();
                thread::spawn(move || layout.commit(b"racing payload", "png", &format!("site{}.com", i), &index))
            })
            .collect();

        let mut stored = 0;
        let mut duplicates = 0;
        for handle in handles {
            match handle.join().expect("thread")? {
                CommitOutcome::Stored(_) => stored += 1,
                CommitOutcome::Duplicate(_) => duplicates += 1,
            }
        }
        assert_eq!((stored, duplicates), (1, 7));
        assert_eq!(visible_files(layout.dir())?.len(), 1);
        Ok(())
    }

    #[test]
    fn commit_interrupted_before_record_is_reclaimed_on_reopen() -> Result<()> {
        let root = tempfile::tempdir()?;
        let db = root.path().join("provenance.db");
        {
            let index = ContentHashIndex::new(Arc::new(ProvenanceStore::open(&db)?));
            let layout = StorageLayout::open(root.path(), "abc")?;
            let CommitOutcome::Stored(stored) = layout.commit(b"payload-x", "jpg", "a.com", &index)? else {
                panic!("expected stored");
            };
            assert!(stored.path.exists());
            // The process dies here, before any accepted_images row exists.
        }

        let index = ContentHashIndex::new(Arc::new(ProvenanceStore::open(&db)?));
        let layout = StorageLayout::open(root.path(), "abc")?;
        let reconciled = layout.reconcile(&index, Duration::ZERO)?;
        assert_eq!(reconciled.released, 1);
        assert_eq!(reconciled.removed, vec![layout.dir().join("000_a_com.jpg")]);

        assert!(matches!(layout.commit(b"payload-x", "jpg", "a.com", &index)?, CommitOutcome::Stored(_)));
        assert_eq!(visible_files(layout.dir())?, vec!["001_a_com.jpg"]);
        Ok(())
    }

    #[test]
    fn reconcile_keeps_recorded_and_recent_commits() -> Result<()> {
        let root = tempfile::tempdir()?;
        let store = Arc::new(ProvenanceStore::open_in_memory()?);
        let index = ContentHashIndex::new(Arc::clone(&store));
        let layout = StorageLayout::open(root.path(), "abc")?;
        let search = store.create_search("abc")?;
        let source = store.add_source_urls(search, &["https://a.com/".to_string()])?.remove(0);

        let CommitOutcome::Stored(kept) = layout.commit(b"recorded", "jpg", "a.com", &index)? else {
            panic!("expected stored");
        };
        store.insert_accepted_image(&NewAcceptedImage {
            source_url_id: source.id,
            image_url: "https://a.com/kept.jpg".into(),
            content_hash: kept.hash,
            file_path: kept.path.clone(),
            byte_size: kept.byte_size,
            width: 300,
            height: 300,
            relevance_score: 0.7,
            content_label: ContentLabel::SubjectPhoto,
        })?;
        let CommitOutcome::Stored(pending) = layout.commit(b"in flight", "jpg", "a.com", &index)? else {
            panic!("expected stored");
        };

        assert_eq!(layout.reconcile(&index, Duration::from_secs(3600))?, Reconciled::default());
        assert!(pending.path.exists());

        let reconciled = layout.reconcile(&index, Duration::ZERO)?;
        assert_eq!(reconciled.removed, vec![pending.path.clone()]);
        assert!(kept.path.exists());
        assert!(index.contains(&kept.hash)?);
        assert!(!index.contains(&pending.hash)?);
        Ok(())
    }

    #[test]
    fn retract_removes_file_and_registration() -> Result<()> {
        let root = tempfile::tempdir()?;
        let layout = StorageLayout::open(root.path(), "abc")?;
        let index = index()?;

        let CommitOutcome::Stored(stored) = layout.commit(b"orphan", "jpg", "a.com", &index)? else {
            panic!("expected stored");
        };
        layout.retract(&stored, &index)?;
        assert!(!stored.path.exists());
        assert!(!index.contains(&stored.hash)?);
        Ok(())
    }
}
