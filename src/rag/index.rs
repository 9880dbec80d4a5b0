//! Embedding-based nearest-neighbour index.
//!
//! Brute-force cosine over an in-process dense store, sufficient for a
//! single practice's notes and knowledge base (thousands of items, not
//! millions). The index is a derived cache of the journal: it persists to
//! `rag_data/` via scratch-file-and-rename, and the coordinator rebuilds it
//! whenever loading fails or its counts fall behind the journal.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("index persistence failed: {0}")]
    Persist(#[from] std::io::Error),
    #[error("index encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("index failed structural validation: {0}")]
    Corrupt(String),
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("index lock poisoned")]
    LockPoisoned,
}

/// Item kind tag; retrieval filters on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Consultation,
    Knowledge,
}

/// Source metadata carried with every indexed item.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ItemMeta {
    /// Creation instant of the source record; newest-first tie-break key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Path or URI of a knowledge document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section_title: Option<String>,
    /// Note digest for consultation items.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexedItem {
    id: String,
    kind: IndexKind,
    content: String,
    embedding: Vec<f32>,
    #[serde(default)]
    meta: ItemMeta,
}

/// One query hit. `score` is raw cosine in [-1, 1]; callers map to a
/// UI-friendly [0, 1] with `rescale_score`.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub kind: IndexKind,
    pub content: String,
    pub score: f32,
    pub meta: ItemMeta,
}

/// Clip to [-1, 1] and rescale linearly onto [0, 1].
pub fn rescale_score(score: f32) -> f32 {
    (score.clamp(-1.0, 1.0) + 1.0) / 2.0
}

#[derive(Default, Serialize, Deserialize)]
struct PersistedIndex {
    dimension: usize,
    items: Vec<IndexedItem>,
}

struct IndexState {
    dimension: usize,
    items: HashMap<String, IndexedItem>,
}

/// Dense vector index. Single write-lock for upsert/clear/swap; queries
/// take the read side and run concurrently.
pub struct VectorIndex {
    path: PathBuf,
    state: RwLock<IndexState>,
}

impl VectorIndex {
    /// An empty index that will persist to `path`.
    pub fn empty(path: &Path, dimension: usize) -> Self {
        Self {
            path: path.to_path_buf(),
            state: RwLock::new(IndexState {
                dimension,
                items: HashMap::new(),
            }),
        }
    }

    /// Load from disk, validating structure. `Corrupt` means the caller
    /// should fall back to `empty` and schedule a rebuild.
    pub fn load(path: &Path, expected_dimension: usize) -> Result<Self, IndexError> {
        let content = std::fs::read_to_string(path)?;
        let persisted: PersistedIndex = serde_json::from_str(&content)
            .map_err(|e| IndexError::Corrupt(format!("unreadable index file: {e}")))?;

        if persisted.dimension != expected_dimension {
            return Err(IndexError::Corrupt(format!(
                "index dimension {} does not match embedder dimension {expected_dimension}",
                persisted.dimension
            )));
        }

        let mut items = HashMap::with_capacity(persisted.items.len());
        for item in persisted.items {
            if item.embedding.len() != persisted.dimension {
                return Err(IndexError::Corrupt(format!(
                    "item {} has embedding length {}",
                    item.id,
                    item.embedding.len()
                )));
            }
            items.insert(item.id.clone(), item);
        }

        Ok(Self {
            path: path.to_path_buf(),
            state: RwLock::new(IndexState {
                dimension: persisted.dimension,
                items,
            }),
        })
    }

    /// Insert or replace one item, then persist. Returns `true` when the id
    /// was newly inserted rather than replaced.
    pub fn upsert(
        &self,
        id: &str,
        kind: IndexKind,
        content: &str,
        embedding: Vec<f32>,
        meta: ItemMeta,
    ) -> Result<bool, IndexError> {
        let inserted = {
            let mut state = self.state.write().map_err(|_| IndexError::LockPoisoned)?;
            if embedding.len() != state.dimension {
                return Err(IndexError::DimensionMismatch {
                    expected: state.dimension,
                    got: embedding.len(),
                });
            }
            state
                .items
                .insert(
                    id.to_string(),
                    IndexedItem {
                        id: id.to_string(),
                        kind,
                        content: content.to_string(),
                        embedding,
                        meta,
                    },
                )
                .is_none()
        };
        self.persist()?;
        Ok(inserted)
    }

    /// Nearest neighbours by cosine, optionally filtered by kind.
    /// Ties break by newer `created_at` first, then lexicographic id.
    pub fn query(
        &self,
        embedding: &[f32],
        k: usize,
        kind_filter: Option<IndexKind>,
    ) -> Result<Vec<SearchHit>, IndexError> {
        let state = self.state.read().map_err(|_| IndexError::LockPoisoned)?;

        let mut hits: Vec<SearchHit> = state
            .items
            .values()
            .filter(|item| kind_filter.map_or(true, |kind| item.kind == kind))
            .map(|item| SearchHit {
                id: item.id.clone(),
                kind: item.kind,
                content: item.content.clone(),
                score: cosine_similarity(embedding, &item.embedding),
                meta: item.meta.clone(),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.meta.created_at.cmp(&a.meta.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Clone out every item of one kind. The rebuild protocol uses this to
    /// carry knowledge items into the fresh index while consultations are
    /// re-derived from the journal.
    pub fn items_of_kind(
        &self,
        kind: IndexKind,
    ) -> Vec<(String, IndexKind, String, Vec<f32>, ItemMeta)> {
        self.state
            .read()
            .map(|state| {
                state
                    .items
                    .values()
                    .filter(|item| item.kind == kind)
                    .map(|item| {
                        (
                            item.id.clone(),
                            item.kind,
                            item.content.clone(),
                            item.embedding.clone(),
                            item.meta.clone(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn count(&self, kind: IndexKind) -> usize {
        self.state
            .read()
            .map(|state| state.items.values().filter(|i| i.kind == kind).count())
            .unwrap_or(0)
    }

    pub fn clear(&self) -> Result<(), IndexError> {
        {
            let mut state = self.state.write().map_err(|_| IndexError::LockPoisoned)?;
            state.items.clear();
        }
        self.persist()
    }

    /// Atomically replace the whole content with a rebuilt item set.
    /// Readers never observe a half-built state: the swap happens under the
    /// write lock and the file lands via rename.
    pub fn replace_all(
        &self,
        items: Vec<(String, IndexKind, String, Vec<f32>, ItemMeta)>,
    ) -> Result<(), IndexError> {
        {
            let mut state = self.state.write().map_err(|_| IndexError::LockPoisoned)?;
            let mut fresh = HashMap::with_capacity(items.len());
            for (id, kind, content, embedding, meta) in items {
                if embedding.len() != state.dimension {
                    return Err(IndexError::DimensionMismatch {
                        expected: state.dimension,
                        got: embedding.len(),
                    });
                }
                fresh.insert(
                    id.clone(),
                    IndexedItem {
                        id,
                        kind,
                        content,
                        embedding,
                        meta,
                    },
                );
            }
            state.items = fresh;
        }
        self.persist()
    }

    /// Write the index to a scratch file in the same directory, then rename
    /// into place.
    fn persist(&self) -> Result<(), IndexError> {
        let state = self.state.read().map_err(|_| IndexError::LockPoisoned)?;
        let persisted = PersistedIndex {
            dimension: state.dimension,
            items: state.items.values().cloned().collect(),
        };
        let encoded = serde_json::to_vec(&persisted)?;
        drop(state);

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut scratch = tempfile::NamedTempFile::new_in(dir)?;
        scratch.write_all(&encoded)?;
        scratch.flush()?;
        scratch
            .persist(&self.path)
            .map_err(|e| IndexError::Persist(e.error))?;
        Ok(())
    }
}

/// Cosine similarity between two vectors.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axis(i: usize, dim: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; dim];
        v[i] = 1.0;
        v
    }

    fn index() -> (tempfile::TempDir, VectorIndex) {
        let dir = tempfile::tempdir().unwrap();
        let idx = VectorIndex::empty(&dir.path().join("index.json"), 4);
        (dir, idx)
    }

    #[test]
    fn upsert_and_query_ranks_by_similarity() {
        let (_dir, idx) = index();
        idx.upsert(
            "a",
            IndexKind::Consultation,
            "molar pain",
            axis(0, 4),
            ItemMeta::default(),
        )
        .unwrap();
        idx.upsert(
            "b",
            IndexKind::Consultation,
            "scaling",
            axis(1, 4),
            ItemMeta::default(),
        )
        .unwrap();

        let hits = idx.query(&axis(0, 4), 2, None).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn kind_filter_excludes_other_kinds() {
        let (_dir, idx) = index();
        idx.upsert(
            "note",
            IndexKind::Consultation,
            "note",
            axis(0, 4),
            ItemMeta::default(),
        )
        .unwrap();
        idx.upsert(
            "doc",
            IndexKind::Knowledge,
            "doc",
            axis(0, 4),
            ItemMeta::default(),
        )
        .unwrap();

        let hits = idx
            .query(&axis(0, 4), 10, Some(IndexKind::Knowledge))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "doc");
    }

    #[test]
    fn upsert_replaces_existing_id() {
        let (_dir, idx) = index();
        idx.upsert(
            "a",
            IndexKind::Consultation,
            "old",
            axis(0, 4),
            ItemMeta::default(),
        )
        .unwrap();
        idx.upsert(
            "a",
            IndexKind::Consultation,
            "new",
            axis(1, 4),
            ItemMeta::default(),
        )
        .unwrap();

        assert_eq!(idx.count(IndexKind::Consultation), 1);
        let hits = idx.query(&axis(1, 4), 1, None).unwrap();
        assert_eq!(hits[0].content, "new");
    }

    #[test]
    fn score_ties_break_newest_then_id() {
        let (_dir, idx) = index();
        let older = ItemMeta {
            created_at: Some("2026-01-01T10:00:00Z".parse().unwrap()),
            ..Default::default()
        };
        let newer = ItemMeta {
            created_at: Some("2026-06-01T10:00:00Z".parse().unwrap()),
            ..Default::default()
        };
        idx.upsert("z-old", IndexKind::Consultation, "x", axis(0, 4), older.clone())
            .unwrap();
        idx.upsert("a-new", IndexKind::Consultation, "x", axis(0, 4), newer)
            .unwrap();
        idx.upsert("b-old", IndexKind::Consultation, "x", axis(0, 4), older)
            .unwrap();

        let hits = idx.query(&axis(0, 4), 3, None).unwrap();
        assert_eq!(hits[0].id, "a-new");
        // Equal instants fall back to lexicographic id.
        assert_eq!(hits[1].id, "b-old");
        assert_eq!(hits[2].id, "z-old");
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let (_dir, idx) = index();
        let result = idx.upsert(
            "a",
            IndexKind::Consultation,
            "x",
            vec![1.0; 7],
            ItemMeta::default(),
        );
        assert!(matches!(
            result,
            Err(IndexError::DimensionMismatch { expected: 4, got: 7 })
        ));
    }

    #[test]
    fn persist_and_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        {
            let idx = VectorIndex::empty(&path, 4);
            idx.upsert(
                "a",
                IndexKind::Knowledge,
                "local anaesthesia dosage",
                axis(2, 4),
                ItemMeta {
                    section_title: Some("Anaesthesia".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        }

        let idx = VectorIndex::load(&path, 4).unwrap();
        assert_eq!(idx.count(IndexKind::Knowledge), 1);
        let hits = idx.query(&axis(2, 4), 1, None).unwrap();
        assert_eq!(hits[0].meta.section_title.as_deref(), Some("Anaesthesia"));
    }

    #[test]
    fn load_rejects_wrong_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        {
            let idx = VectorIndex::empty(&path, 4);
            idx.upsert("a", IndexKind::Knowledge, "x", axis(0, 4), ItemMeta::default())
                .unwrap();
        }
        let result = VectorIndex::load(&path, 384);
        assert!(matches!(result, Err(IndexError::Corrupt(_))));
    }

    #[test]
    fn load_rejects_garbage_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        std::fs::write(&path, "definitely not json {").unwrap();
        let result = VectorIndex::load(&path, 4);
        assert!(matches!(result, Err(IndexError::Corrupt(_))));
    }

    #[test]
    fn replace_all_swaps_content() {
        let (_dir, idx) = index();
        idx.upsert("old", IndexKind::Consultation, "x", axis(0, 4), ItemMeta::default())
            .unwrap();

        idx.replace_all(vec![
            (
                "new-1".into(),
                IndexKind::Consultation,
                "y".into(),
                axis(1, 4),
                ItemMeta::default(),
            ),
            (
                "new-2".into(),
                IndexKind::Consultation,
                "z".into(),
                axis(2, 4),
                ItemMeta::default(),
            ),
        ])
        .unwrap();

        assert_eq!(idx.count(IndexKind::Consultation), 2);
        let hits = idx.query(&axis(0, 4), 10, None).unwrap();
        assert!(hits.iter().all(|h| h.id != "old"));
    }

    #[test]
    fn clear_empties_the_index() {
        let (_dir, idx) = index();
        idx.upsert("a", IndexKind::Knowledge, "x", axis(0, 4), ItemMeta::default())
            .unwrap();
        idx.clear().unwrap();
        assert_eq!(idx.count(IndexKind::Knowledge), 0);
    }

    #[test]
    fn rescale_maps_cosine_onto_unit_interval() {
        assert_eq!(rescale_score(1.0), 1.0);
        assert_eq!(rescale_score(-1.0), 0.0);
        assert_eq!(rescale_score(0.0), 0.5);
        // Out-of-range values clip first.
        assert_eq!(rescale_score(3.0), 1.0);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert!(cosine_similarity(&axis(0, 4), &axis(1, 4)).abs() < 1e-6);
        let v = axis(0, 4);
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }
}
