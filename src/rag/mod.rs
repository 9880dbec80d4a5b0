//! Retrieval-augmented storage: journal + vector index + embedder.
//!
//! The journal is the authoritative record; the index is a derived cache
//! that the coordinator rebuilds from the journal whenever it is missing,
//! fails validation, or falls behind.

pub mod chunker;
pub mod coordinator;
pub mod index;

pub use coordinator::{ConsultationHit, Passage, RagStatus, RagStore};
pub use index::{IndexKind, ItemMeta, VectorIndex};

#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error(transparent)]
    Journal(#[from] crate::journal::JournalError),
    #[error(transparent)]
    Index(#[from] index::IndexError),
    #[error("embedding failed: {0}")]
    Embedding(String),
}
