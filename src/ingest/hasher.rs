use std::fmt;
use std::fs::File;
use std::io::{Read, BufReader};
use std::path::Path;
use sha2::{Sha256, Digest};
use memmap2::MmapOptions;
use anyhow::{Result, Context, anyhow};

const MMAP_THRESHOLD: u64 = 64 * 1024 * 1024; // 64 MB

/// SHA-256 digest of the bytes of a saved file. This is the deduplication key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let digest: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow!("content hash must be 32 bytes, got {}", bytes.len()))?;
        Ok(Self(digest))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

pub fn calculate_hash(path: &Path) -> Result<ContentHash> {
    let file = File::open(path).with_context(|| format!("Failed to open file: {:?}", path))?;
    let metadata = file.metadata()?;
    let len = metadata.len();

    let mut hasher = Sha256::new();

    if len > MMAP_THRESHOLD {
        // The files we map are either our own staged writes or a directory the
        // user asked us to sweep; nothing truncates them while we read.
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        hasher.update(&mmap);
    } else {
        let mut reader = BufReader::new(file);
        let mut buffer = [0; 8192];
        loop {
            let count = reader.read(&mut buffer)?;
            if count == 0 {
                break;
            }
            hasher.update(&buffer[..count]);
        }
    }

    Ok(ContentHash(hasher.finalize().into()))
}
