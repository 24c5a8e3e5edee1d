// Embedding Cache
// Content-addressed vector store: one entry per (model, normalized text)

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Get/put contract over a key-value vector store.
///
/// `namespace` identifies the embedding model; switching models never reads stale vectors.
pub trait EmbeddingCache: Send + Sync {
    fn get(&self, namespace: &str, digest: &str) -> Result<Option<Vec<f32>>, CacheError>;

    fn put(&self, namespace: &str, digest: &str, vector: &[f32]) -> Result<(), CacheError>;
}

/// Stable hash of whitespace-normalized text
pub fn text_digest(text: &str) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

fn sanitize_namespace(namespace: &str) -> String {
    let cleaned: String = namespace
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}

#[derive(Serialize, Deserialize)]
struct CachedVector {
    model: String,
    vector: Vec<f32>,
}

/// `root/<model>/<sha256>.json`, entries never expire.
pub struct DiskEmbeddingCache {
    root: PathBuf,
}

impl DiskEmbeddingCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, namespace: &str, digest: &str) -> PathBuf {
        self.root
            .join(sanitize_namespace(namespace))
            .join(format!("{}.json", digest))
    }
}

impl EmbeddingCache for DiskEmbeddingCache {
    fn get(&self, namespace: &str, digest: &str) -> Result<Option<Vec<f32>>, CacheError> {
        let path = self.entry_path(namespace, digest);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let entry: CachedVector = serde_json::from_str(&raw)?;
        if entry.model != namespace {
            // Sanitized names collided.
            return Ok(None);
        }
        Ok(Some(entry.vector))
    }

    fn put(&self, namespace: &str, digest: &str, vector: &[f32]) -> Result<(), CacheError> {
        let path = self.entry_path(namespace, digest);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let entry = CachedVector {
            model: namespace.to_string(),
            vector: vector.to_vec(),
        };
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(&entry)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Process-local cache, used by tests and one-shot runs without a cache dir.
#[derive(Default)]
pub struct MemoryEmbeddingCache {
    entries: Mutex<HashMap<(String, String), Vec<f32>>>,
}

impl MemoryEmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EmbeddingCache for MemoryEmbeddingCache {
    fn get(&self, namespace: &str, digest: &str) -> Result<Option<Vec<f32>>, CacheError> {
        match self.entries.lock() {
            Ok(entries) => Ok(entries.get(&(namespace.to_string(), digest.to_string())).cloned()),
            Err(_) => {
                warn!("[CACHE] memory cache lock poisoned, treating as miss");
                Ok(None)
            }
        }
    }

    fn put(&self, namespace: &str, digest: &str, vector: &[f32]) -> Result<(), CacheError> {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert((namespace.to_string(), digest.to_string()), vector.to_vec());
        }
        Ok(())
    }
}
