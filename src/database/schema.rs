pub const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS searches (
        id INTEGER PRIMARY KEY,
        query TEXT NOT NULL,
        created_at TEXT NOT NULL,
        discovered_urls INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS source_urls (
        id INTEGER PRIMARY KEY,
        search_id INTEGER NOT NULL,
        url TEXT NOT NULL,
        domain TEXT NOT NULL,
        visited INTEGER NOT NULL DEFAULT 0,
        images_found INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        FOREIGN KEY(search_id) REFERENCES searches(id) ON DELETE CASCADE,
        UNIQUE(search_id, url)
    );

    -- Durable arbiter for content deduplication. Outlives any single search.
    CREATE TABLE IF NOT EXISTS content_hashes (
        hash BLOB PRIMARY KEY,
        registered_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS accepted_images (
        id INTEGER PRIMARY KEY,
        source_url_id INTEGER NOT NULL,
        image_url TEXT NOT NULL,
        content_hash BLOB UNIQUE NOT NULL,
        file_path TEXT NOT NULL,
        byte_size INTEGER NOT NULL,
        width INTEGER NOT NULL,
        height INTEGER NOT NULL,
        relevance_score REAL NOT NULL,
        content_label TEXT NOT NULL,
        created_at TEXT NOT NULL,
        FOREIGN KEY(source_url_id) REFERENCES source_urls(id) ON DELETE CASCADE,
        FOREIGN KEY(content_hash) REFERENCES content_hashes(hash)
    );

    CREATE INDEX IF NOT EXISTS idx_source_urls_search_id ON source_urls (search_id);
    CREATE INDEX IF NOT EXISTS idx_source_urls_domain ON source_urls (domain);
    CREATE INDEX IF NOT EXISTS idx_accepted_images_source_url_id ON accepted_images (source_url_id);
";
