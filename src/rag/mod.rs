//! RAG index over files the agent has read or written.
//!
//! Each indexed chunk stores `(path, chunk_id, hash-of-full-file, vector)`.
//! The index is reconciled with disk before every user turn (FullSync):
//! missing files are dropped, hash mismatches reindexed. That catches both
//! `run_command` side effects and edits made outside the server.
//!
//! Embeddings are optional: without an API key the store still tracks file
//! hashes (so sync semantics hold) but vector search is disabled.

pub mod embeddings;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub use embeddings::EmbeddingsClient;

/// Chunking parameters (characters).
const CHUNK_SIZE: usize = 1000;
const CHUNK_OVERLAP: usize = 200;

/// Hash of a file's full content, stored with every chunk of that file.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Split text into overlapping chunks.
fn chunk_text(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + CHUNK_SIZE).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start = end.saturating_sub(CHUNK_OVERLAP);
    }
    chunks
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunkRecord {
    chunk_id: usize,
    text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    vector: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileRecord {
    hash: String,
    mtime: i64,
    size: u64,
    chunks: Vec<ChunkRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct IndexDoc {
    files: BTreeMap<String, FileRecord>,
}

/// Stats returned by [`RagStore::full_sync`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub checked: usize,
    pub reindexed: usize,
    pub removed: usize,
    pub skipped: usize,
}

/// A search hit.
#[derive(Debug, Clone, Serialize)]
pub struct RagHit {
    pub path: String,
    pub chunk: String,
    pub score: f32,
}

/// Project-scoped RAG store; writes are serialized by an internal lock.
pub struct RagStore {
    index_path: PathBuf,
    project_root: PathBuf,
    embeddings: Option<EmbeddingsClient>,
    write_lock: Mutex<()>,
}

impl RagStore {
    pub fn new(rag_dir: &Path, project_root: &Path, embeddings: Option<EmbeddingsClient>) -> Self {
        Self {
            index_path: rag_dir.join("index.json"),
            project_root: project_root.to_path_buf(),
            embeddings,
            write_lock: Mutex::new(()),
        }
    }

    /// Whether vector search is usable (embeddings configured).
    pub fn is_available(&self) -> bool {
        self.embeddings.is_some()
    }

    fn load(&self) -> IndexDoc {
        std::fs::read_to_string(&self.index_path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default()
    }

    fn save(&self, doc: &IndexDoc) -> Result<()> {
        if let Some(parent) = self.index_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.index_path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string(doc)?)?;
        std::fs::rename(&tmp, &self.index_path)?;
        Ok(())
    }

    fn rel_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.project_root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    /// Index (or re-index) one file's content.
    pub async fn index_file(&self, path: &Path, content: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.index_file_locked(path, content).await
    }

    async fn index_file_locked(&self, path: &Path, content: &str) -> Result<()> {
        let rel = self.rel_path(path);
        let texts = chunk_text(content);
        let vectors = match &self.embeddings {
            Some(client) if !texts.is_empty() => match client.embed(&texts).await {
                Ok(vectors) => vectors,
                Err(e) => {
                    warn!(file = %rel, error = %e, "Embedding failed; indexing hashes only");
                    Vec::new()
                }
            },
            _ => Vec::new(),
        };

        let abs = self.project_root.join(&rel);
        let (mtime, size) = std::fs::metadata(&abs)
            .map(|m| {
                let mtime = m
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                (mtime, m.len())
            })
            .unwrap_or((0, content.len() as u64));

        let chunks = texts
            .into_iter()
            .enumerate()
            .map(|(chunk_id, text)| ChunkRecord {
                chunk_id,
                vector: vectors.get(chunk_id).cloned().unwrap_or_default(),
                text,
            })
            .collect();

        let mut doc = self.load();
        doc.files.insert(
            rel.clone(),
            FileRecord {
                hash: content_hash(content),
                mtime,
                size,
                chunks,
            },
        );
        self.save(&doc)?;
        debug!(file = %rel, "Indexed file");
        Ok(())
    }

    /// Remove every chunk of a file (tool deletion or sync of a vanished
    /// path).
    pub async fn remove_file(&self, path: &Path) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let rel = self.rel_path(path);
        let mut doc = self.load();
        if doc.files.remove(&rel).is_some() {
            self.save(&doc)?;
            debug!(file = %rel, "Removed file from index");
        }
        Ok(())
    }

    /// Stored full-file hash for a path, if indexed.
    pub fn stored_hash(&self, path: &Path) -> Option<String> {
        let rel = self.rel_path(path);
        self.load().files.get(&rel).map(|f| f.hash.clone())
    }

    /// Distinct indexed paths.
    pub fn indexed_paths(&self) -> Vec<String> {
        self.load().files.into_keys().collect()
    }

    /// Reconcile the whole index with disk: drop missing files, reindex on
    /// hash mismatch. A quick mtime+size check skips unchanged files without
    /// reading them.
    pub async fn full_sync(&self) -> Result<SyncStats> {
        let mut stats = SyncStats::default();
        let files: Vec<(String, FileRecord)> = self.load().files.into_iter().collect();

        for (rel, record) in files {
            stats.checked += 1;
            let abs = self.project_root.join(&rel);

            let meta = match std::fs::metadata(&abs) {
                Ok(meta) => meta,
                Err(_) => {
                    self.remove_file(&abs).await?;
                    stats.removed += 1;
                    continue;
                }
            };

            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            if mtime == record.mtime && meta.len() == record.size {
                stats.skipped += 1;
                continue;
            }

            let content = match std::fs::read_to_string(&abs) {
                Ok(content) => content,
                Err(_) => {
                    stats.skipped += 1;
                    continue;
                }
            };
            if content_hash(&content) == record.hash {
                stats.skipped += 1;
                continue;
            }
            self.index_file(&abs, &content).await?;
            stats.reindexed += 1;
        }

        if stats.reindexed > 0 || stats.removed > 0 {
            debug!(
                checked = stats.checked,
                reindexed = stats.reindexed,
                removed = stats.removed,
                "RAG sync completed"
            );
        }
        Ok(stats)
    }

    /// Cosine-similarity search over indexed chunks.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<RagHit>> {
        let Some(client) = &self.embeddings else {
            return Ok(Vec::new());
        };
        let query_vec = client
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();
        if query_vec.is_empty() {
            return Ok(Vec::new());
        }

        let doc = self.load();
        let mut hits: Vec<RagHit> = Vec::new();
        for (path, record) in &doc.files {
            for chunk in &record.chunks {
                if chunk.vector.is_empty() {
                    continue;
                }
                let score = cosine(&query_vec, &chunk.vector);
                hits.push(RagHit {
                    path: path.clone(),
                    chunk: chunk.text.clone(),
                    score,
                });
            }
        }
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_store(dir: &TempDir) -> RagStore {
        RagStore::new(&dir.path().join("rag"), dir.path(), None)
    }

    #[tokio::test]
    async fn index_tracks_content_hash() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "hello world").unwrap();

        store.index_file(&path, "hello world").await.unwrap();
        assert_eq!(
            store.stored_hash(&path).as_deref(),
            Some(content_hash("hello world").as_str())
        );
    }

    #[tokio::test]
    async fn full_sync_removes_missing_files() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        let path = dir.path().join("gone.txt");
        std::fs::write(&path, "temp").unwrap();
        store.index_file(&path, "temp").await.unwrap();
        std::fs::remove_file(&path).unwrap();

        let stats = store.full_sync().await.unwrap();
        assert_eq!(stats.removed, 1);
        assert!(store.indexed_paths().is_empty());
    }

    #[tokio::test]
    async fn full_sync_reindexes_on_mismatch() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "v1").unwrap();
        store.index_file(&path, "v1").await.unwrap();

        // External edit the store never saw.
        std::fs::write(&path, "v2 with different length").unwrap();
        let stats = store.full_sync().await.unwrap();
        assert_eq!(stats.reindexed, 1);
        assert_eq!(
            store.stored_hash(&path).as_deref(),
            Some(content_hash("v2 with different length").as_str())
        );
    }

    #[tokio::test]
    async fn full_sync_skips_unchanged() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        let path = dir.path().join("same.txt");
        std::fs::write(&path, "steady").unwrap();
        store.index_file(&path, "steady").await.unwrap();

        let stats = store.full_sync().await.unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.reindexed, 0);
    }

    #[test]
    fn chunking_overlaps() {
        let text = "x".repeat(2500);
        let chunks = chunk_text(&text);
        assert!(chunks.len() >= 3);
        assert_eq!(chunks[0].len(), CHUNK_SIZE);
        // Consecutive chunks share the overlap region.
        let tail: String = chunks[0].chars().skip(CHUNK_SIZE - CHUNK_OVERLAP).collect();
        let head: String = chunks[1].chars().take(CHUNK_OVERLAP).collect();
        assert_eq!(tail, head);
    }

    #[test]
    fn cosine_identity() {
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }
}
