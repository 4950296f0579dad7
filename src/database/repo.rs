use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use anyhow::{Result, Context};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::debug;

use crate::database::schema::SCHEMA;
use crate::error::StoreError;
use crate::ingest::hasher::ContentHash;
use crate::ml::scorer::ContentLabel;
use crate::storage::naming::domain_of;

pub type SearchId = i64;
pub type SourceUrlId = i64;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Fixed-width UTC timestamps so registration times compare as text.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUrlRecord {
    pub id: SourceUrlId,
    pub search_id: SearchId,
    pub url: String,
    pub domain: String,
}

#[derive(Debug, Clone)]
pub struct NewAcceptedImage {
    pub source_url_id: SourceUrlId,
    pub image_url: String,
    pub content_hash: ContentHash,
    pub file_path: PathBuf,
    pub byte_size: u64,
    pub width: u32,
    pub height: u32,
    pub relevance_score: f32,
    pub content_label: ContentLabel,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchStats {
    pub search_id: SearchId,
    pub query: String,
    pub created_at: String,
    pub discovered_urls: i64,
    pub visited_urls: i64,
    pub failed_urls: i64,
    pub accepted_images: i64,
    pub mean_score: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Inserted,
    AlreadyPresent,
}

/// Durable record of searches, their source pages and accepted images.
///
/// All access goes through one connection behind a mutex, so writers in this
/// process are serialized. Separate processes sharing the file are arbitrated
/// by sqlite's own locking (WAL + busy timeout) and the schema's unique keys.
pub struct ProvenanceStore {
    conn: Mutex<Connection>,
}

impl ProvenanceStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {:?}", parent))?;
        }
        let conn = Connection::open(path).context("Failed to open database")?;
        let journal: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .context("Failed to enable WAL journal")?;
        debug!("Provenance store journal mode: {}", journal);
        Self::configure(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::configure(conn)
    }

    fn configure(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", true)
            .context("Failed to enable foreign keys")?;
        conn.execute_batch(SCHEMA).context("Failed to initialize schema")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn create_search(&self, query: &str) -> Result<SearchId> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO searches (query, created_at) VALUES (?1, ?2)",
            params![query, Utc::now().to_rfc3339()],
        ).context("Failed to create search")?;
        Ok(conn.last_insert_rowid())
    }

    /// Inserts the URLs not yet known for this search and returns only the new rows.
    pub fn add_source_urls(&self, search_id: SearchId, urls: &[String]) -> Result<Vec<SourceUrlRecord>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin transaction")?;

        let mut added = Vec::new();
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO source_urls (search_id, url, domain) VALUES (?1, ?2, ?3)"
            )?;
            for url in urls {
                let domain = domain_of(url);
                if stmt.execute(params![search_id, url, domain])? == 1 {
                    added.push(SourceUrlRecord {
                        id: tx.last_insert_rowid(),
                        search_id,
                        url: url.clone(),
                        domain,
                    });
                }
            }
            tx.execute(
                "UPDATE searches
                 SET discovered_urls = (SELECT COUNT(*) FROM source_urls WHERE search_id = ?1)
                 WHERE id = ?1",
                params![search_id],
            )?;
        }

        tx.commit().context("Failed to commit source urls")?;
        Ok(added)
    }

    pub fn source_url_by_url(&self, search_id: SearchId, url: &str) -> Result<Option<SourceUrlRecord>> {
        let record = self.conn()?.query_row(
            "SELECT id, domain FROM source_urls WHERE search_id = ?1 AND url = ?2",
            params![search_id, url],
            |row| Ok(SourceUrlRecord {
                id: row.get(0)?,
                search_id,
                url: url.to_string(),
                domain: row.get(1)?,
            }),
        ).optional()?;
        Ok(record)
    }

    pub fn mark_visited(&self, source_url_id: SourceUrlId, error: Option<&str>) -> Result<()> {
        self.conn()?.execute(
            "UPDATE source_urls SET visited = 1, last_error = COALESCE(?2, last_error) WHERE id = ?1",
            params![source_url_id, error],
        )?;
        Ok(())
    }

    pub fn record_source_error(&self, source_url_id: SourceUrlId, error: &str) -> Result<()> {
        self.conn()?.execute(
            "UPDATE source_urls SET last_error = ?2 WHERE id = ?1",
            params![source_url_id, error],
        )?;
        Ok(())
    }

    /// Single-statement insert; the primary key decides races, in this
    /// process or any other sharing the file.
    pub fn register_hash(&self, hash: &ContentHash) -> Result<Registration, StoreError> {
        let changed = self.conn()?.execute(
            "INSERT OR IGNORE INTO content_hashes (hash, registered_at) VALUES (?1, ?2)",
            params![hash.as_bytes(), timestamp(Utc::now())],
        ).map_err(StoreError::classify)?;

        Ok(if changed == 1 { Registration::Inserted } else { Registration::AlreadyPresent })
    }

    /// Drops a registration that never got an image row. Returns false when
    /// an image still references the hash (the registration stays).
    pub fn release_hash(&self, hash: &ContentHash) -> Result<bool, StoreError> {
        let changed = self.conn()?.execute(
            "DELETE FROM content_hashes
             WHERE hash = ?1 AND NOT EXISTS (SELECT 1 FROM accepted_images WHERE content_hash = ?1)",
            params![hash.as_bytes()],
        ).map_err(StoreError::classify)?;
        Ok(changed == 1)
    }

    /// Registrations older than `grace` that no image row references. A run
    /// that died between promoting a file and recording it leaves these.
    pub fn orphaned_hashes(&self, grace: Duration) -> Result<Vec<ContentHash>> {
        let grace = chrono::Duration::from_std(grace).context("Grace window out of range")?;
        let cutoff = timestamp(Utc::now() - grace);

        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT ch.hash FROM content_hashes ch
             WHERE ch.registered_at <= ?1
               AND NOT EXISTS (SELECT 1 FROM accepted_images ai WHERE ai.content_hash = ch.hash)",
        )?;
        let rows = stmt.query_map(params![cutoff], |row| row.get::<_, Vec<u8>>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(ContentHash::from_slice(&row?)?);
        }
        Ok(out)
    }

    #[cfg(test)]
    pub fn hash_registered(&self, hash: &ContentHash) -> Result<bool> {
        let found: Option<i64> = self.conn()?.query_row(
            "SELECT 1 FROM content_hashes WHERE hash = ?1",
            params![hash.as_bytes()],
            |row| row.get(0),
        ).optional()?;
        Ok(found.is_some())
    }

    #[cfg(test)]
    pub fn registered_hash_count(&self) -> Result<usize> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM content_hashes", [], |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Records an accepted image and bumps its source's counter in one transaction.
    pub fn insert_accepted_image(&self, image: &NewAcceptedImage) -> Result<i64, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT INTO accepted_images
             (source_url_id, image_url, content_hash, file_path, byte_size, width, height,
              relevance_score, content_label, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                image.source_url_id,
                image.image_url,
                image.content_hash.as_bytes(),
                image.file_path.to_string_lossy().into_owned(),
                image.byte_size as i64,
                image.width,
                image.height,
                image.relevance_score,
                image.content_label.as_str(),
                Utc::now().to_rfc3339(),
            ],
        ).map_err(StoreError::classify)?;
        let image_id = tx.last_insert_rowid();

        let bumped = tx.execute(
            "UPDATE source_urls SET images_found = images_found + 1 WHERE id = ?1",
            params![image.source_url_id],
        ).map_err(StoreError::classify)?;
        if bumped != 1 {
            return Err(StoreError::Constraint(format!(
                "source url {} does not exist", image.source_url_id
            )));
        }

        tx.commit().map_err(StoreError::classify)?;
        Ok(image_id)
    }

    #[cfg(test)]
    pub fn accepted_count(&self, search_id: SearchId) -> Result<usize> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM accepted_images ai
             JOIN source_urls su ON ai.source_url_id = su.id
             WHERE su.search_id = ?1",
            params![search_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    #[cfg(test)]
    pub fn source_url(&self, source_url_id: SourceUrlId) -> Result<Option<(bool, i64, Option<String>)>> {
        let row = self.conn()?.query_row(
            "SELECT visited, images_found, last_error FROM source_urls WHERE id = ?1",
            params![source_url_id],
            |row| Ok((row.get::<_, bool>(0)?, row.get(1)?, row.get(2)?)),
        ).optional()?;
        Ok(row)
    }

    pub fn search_stats(&self, search_id: SearchId) -> Result<Option<SearchStats>> {
        let conn = self.conn()?;
        let stats = conn.query_row(
            &format!("{} WHERE s.id = ?1", STATS_QUERY),
            params![search_id],
            stats_from_row,
        ).optional()?;
        Ok(stats)
    }

    pub fn list_searches(&self) -> Result<Vec<SearchStats>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY s.id", STATS_QUERY))?;
        let rows = stmt.query_map([], stats_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Deletes a search with its source urls and images, releases the image
    /// hashes, and returns the file paths the deleted rows pointed at.
    pub fn delete_search(&self, search_id: SearchId) -> Result<Vec<PathBuf>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut doomed: Vec<(PathBuf, Vec<u8>)> = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT ai.file_path, ai.content_hash FROM accepted_images ai
                 JOIN source_urls su ON ai.source_url_id = su.id
                 WHERE su.search_id = ?1",
            )?;
            let rows = stmt.query_map(params![search_id], |row| {
                Ok((PathBuf::from(row.get::<_, String>(0)?), row.get::<_, Vec<u8>>(1)?))
            })?;
            for row in rows {
                doomed.push(row?);
            }
        }

        tx.execute("DELETE FROM searches WHERE id = ?1", params![search_id])?;
        {
            let mut release = tx.prepare("DELETE FROM content_hashes WHERE hash = ?1")?;
            for (_, hash) in &doomed {
                release.execute(params![hash])?;
            }
        }

        tx.commit().context("Failed to commit search deletion")?;
        Ok(doomed.into_iter().map(|(path, _)| path).collect())
    }

    #[cfg(test)]
    pub fn count_rows(&self, table: &str) -> Result<i64> {
        let count = self.conn()?.query_row(
            &format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0),
        )?;
        Ok(count)
    }
}

const STATS_QUERY: &str = "
    SELECT s.id, s.query, s.created_at, s.discovered_urls,
        (SELECT COUNT(*) FROM source_urls su WHERE su.search_id = s.id AND su.visited = 1),
        (SELECT COUNT(*) FROM source_urls su WHERE su.search_id = s.id AND su.last_error IS NOT NULL),
        (SELECT COUNT(*) FROM accepted_images ai JOIN source_urls su ON ai.source_url_id = su.id
            WHERE su.search_id = s.id),
        (SELECT AVG(ai.relevance_score) FROM accepted_images ai JOIN source_urls su ON ai.source_url_id = su.id
            WHERE su.search_id = s.id)
    FROM searches s";

fn stats_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SearchStats> {
    Ok(SearchStats {
        search_id: row.get(0)?,
        query: row.get(1)?,
        created_at: row.get(2)?,
        discovered_urls: row.get(3)?,
        visited_urls: row.get(4)?,
        failed_urls: row.get(5)?,
        accepted_images: row.get(6)?,
        mean_score: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn image_for(source: &SourceUrlRecord, hash: ContentHash, name: &str) -> NewAcceptedImage {
        NewAcceptedImage {
            source_url_id: source.id,
            image_url: format!("https://img.example.com/{}", name),
            content_hash: hash,
            file_path: PathBuf::from(format!("downloads/abc/{}", name)),
            byte_size: 20_000,
            width: 300,
            height: 300,
            relevance_score: 0.7,
            content_label: ContentLabel::PortraitPhoto,
        }
    }

    #[test]
    fn source_urls_are_unique_within_a_search() -> Result<()> {
        let store = ProvenanceStore::open_in_memory()?;
        let first = store.create_search("abc")?;
        let second = store.create_search("abc")?;

        let urls = vec!["https://www.example.com/a".to_string(), "https://example.org/b".to_string()];
        let added = store.add_source_urls(first, &urls)?;
        assert_eq!(added.len(), 2);
        assert_eq!(added[0].domain, "www.example.com");

        let again = store.add_source_urls(first, &urls)?;
        assert!(again.is_empty());
        assert_eq!(store.add_source_urls(second, &urls)?.len(), 2);

        let stats = store.search_stats(first)?.expect("search exists");
        assert_eq!(stats.discovered_urls, 2);
        Ok(())
    }

    #[test]
    fn known_source_can_be_looked_up_by_url() -> Result<()> {
        let store = ProvenanceStore::open_in_memory()?;
        let search = store.create_search("abc")?;
        let other = store.create_search("xyz")?;
        let added = store.add_source_urls(search, &["https://www.example.com/p".to_string()])?.remove(0);

        assert_eq!(store.source_url_by_url(search, "https://www.example.com/p")?, Some(added));
        assert_eq!(store.source_url_by_url(other, "https://www.example.com/p")?, None);
        assert_eq!(store.source_url_by_url(search, "https://www.example.com/q")?, None);
        Ok(())
    }

    #[test]
    fn only_unrecorded_registrations_past_grace_are_orphans() -> Result<()> {
        let store = ProvenanceStore::open_in_memory()?;
        let search = store.create_search("abc")?;
        let source = store.add_source_urls(search, &["https://a.com/".to_string()])?.remove(0);

        let recorded = ContentHash::of_bytes(b"recorded");
        store.register_hash(&recorded)?;
        store.insert_accepted_image(&image_for(&source, recorded, "000_a_com.jpg"))?;
        let abandoned = ContentHash::of_bytes(b"abandoned");
        store.register_hash(&abandoned)?;

        assert!(store.orphaned_hashes(Duration::from_secs(3600))?.is_empty());
        assert_eq!(store.orphaned_hashes(Duration::ZERO)?, vec![abandoned]);
        Ok(())
    }

    #[test]
    fn register_hash_reports_first_insert_only() -> Result<()> {
        let store = ProvenanceStore::open_in_memory()?;
        let hash = ContentHash::of_bytes(b"pixels");
        assert_eq!(store.register_hash(&hash)?, Registration::Inserted);
        assert_eq!(store.register_hash(&hash)?, Registration::AlreadyPresent);
        assert!(store.hash_registered(&hash)?);
        assert!(store.release_hash(&hash)?);
        assert!(!store.hash_registered(&hash)?);
        Ok(())
    }

    #[test]
    fn accepted_image_bumps_source_counter() -> Result<()> {
        let store = ProvenanceStore::open_in_memory()?;
        let search = store.create_search("abc")?;
        let source = store.add_source_urls(search, &["https://example.com/p".to_string()])?.remove(0);

        let hash = ContentHash::of_bytes(b"one");
        store.register_hash(&hash)?;
        store.insert_accepted_image(&image_for(&source, hash, "000_example_com.jpg"))?;
        store.mark_visited(source.id, None)?;

        let (visited, found, error) = store.source_url(source.id)?.expect("row");
        assert!(visited);
        assert_eq!(found, 1);
        assert!(error.is_none());
        assert_eq!(store.accepted_count(search)?, 1);
        Ok(())
    }

    #[test]
    fn content_hash_is_unique_across_searches() -> Result<()> {
        let store = ProvenanceStore::open_in_memory()?;
        let s1 = store.create_search("abc")?;
        let s2 = store.create_search("xyz")?;
        let a = store.add_source_urls(s1, &["https://a.com/".to_string()])?.remove(0);
        let b = store.add_source_urls(s2, &["https://b.com/".to_string()])?.remove(0);

        let hash = ContentHash::of_bytes(b"shared");
        store.register_hash(&hash)?;
        store.insert_accepted_image(&image_for(&a, hash, "000_a_com.jpg"))?;
        let err = store.insert_accepted_image(&image_for(&b, hash, "000_b_com.jpg")).unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));

        // The failed insert must not have bumped b's counter.
        assert_eq!(store.source_url(b.id)?.expect("row").1, 0);
        Ok(())
    }

    #[test]
    fn image_without_registered_hash_is_rejected() -> Result<()> {
        let store = ProvenanceStore::open_in_memory()?;
        let search = store.create_search("abc")?;
        let source = store.add_source_urls(search, &["https://a.com/".to_string()])?.remove(0);
        let err = store
            .insert_accepted_image(&image_for(&source, ContentHash::of_bytes(b"x"), "x.jpg"))
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
        Ok(())
    }

    #[test]
    fn deleting_a_search_cascades_and_releases_hashes() -> Result<()> {
        let store = ProvenanceStore::open_in_memory()?;
        let doomed = store.create_search("abc")?;
        let kept = store.create_search("def")?;
        let source = store.add_source_urls(doomed, &["https://a.com/".to_string()])?.remove(0);
        let other = store.add_source_urls(kept, &["https://b.com/".to_string()])?.remove(0);

        for (i, src) in [&source, &source, &other].into_iter().enumerate() {
            let hash = ContentHash::of_bytes(format!("img-{}", i).as_bytes());
            store.register_hash(&hash)?;
            store.insert_accepted_image(&image_for(src, hash, &format!("{:03}.jpg", i)))?;
        }

        let paths = store.delete_search(doomed)?;
        assert_eq!(paths.len(), 2);
        assert_eq!(store.count_rows("searches")?, 1);
        assert_eq!(store.count_rows("source_urls")?, 1);
        assert_eq!(store.count_rows("accepted_images")?, 1);
        assert_eq!(store.registered_hash_count()?, 1);

        // No orphans: every remaining image points at a live source and search.
        let orphans = store.conn()?.query_row(
            "SELECT COUNT(*) FROM accepted_images ai
             LEFT JOIN source_urls su ON ai.source_url_id = su.id
             LEFT JOIN searches s ON su.search_id = s.id
             WHERE s.id IS NULL",
            [],
            |row| row.get::<_, i64>(0),
        )?;
        assert_eq!(orphans, 0);
        Ok(())
    }

    #[test]
    fn separate_handles_on_one_file_agree_on_registration() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("shared.db");
        let stores: Vec<Arc<ProvenanceStore>> = (0..4)
            .map(|_| ProvenanceStore::open(&path).map(Arc::new))
            .collect::<Result<_>>()?;

        let hash = ContentHash::of_bytes(b"contended");
        let handles: Vec<_> = stores
            .iter()
            .cloned()
            .map(|store| thread::spawn(move || store.register_hash(&hash)))
            .collect();

        let mut inserted = 0;
        for handle in handles {
            if handle.join().expect("thread")? == Registration::Inserted {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        Ok(())
    }
}
