//! Sentence embedders.
//!
//! The real model is all-MiniLM-L6-v2 through ONNX Runtime, behind the
//! `onnx-embeddings` feature. When the feature is off or the weights are
//! absent, a deterministic token-hash embedder keeps search functional:
//! coarse, but stable across restarts, which the rebuild protocol relies on.

use super::{EmbeddingModel, ModelError};

/// Standard embedding dimension for all-MiniLM-L6-v2.
pub const EMBEDDING_DIM: usize = 384;

// ═══════════════════════════════════════════════════════════
// ONNX embedder, behind `onnx-embeddings`
// ═══════════════════════════════════════════════════════════

#[cfg(feature = "onnx-embeddings")]
mod onnx {
    use std::path::Path;
    use std::sync::Mutex;

    use ort::session::Session;

    use super::{EmbeddingModel, ModelError, EMBEDDING_DIM};

    /// all-MiniLM-L6-v2 inference through ONNX Runtime.
    ///
    /// Requires `model.onnx` and `tokenizer.json` in the model directory.
    /// Interior mutability because `Session::run` needs `&mut self` while
    /// the port exposes `&self`.
    pub struct OnnxEmbedder {
        session: Mutex<Session>,
        tokenizer: tokenizers::Tokenizer,
    }

    impl OnnxEmbedder {
        pub fn load(model_dir: &Path) -> Result<Self, ModelError> {
            let model_path = model_dir.join("model.onnx");
            let tokenizer_path = model_dir.join("tokenizer.json");

            if !model_path.exists() {
                return Err(ModelError::NotReady(format!(
                    "missing {}",
                    model_path.display()
                )));
            }
            if !tokenizer_path.exists() {
                return Err(ModelError::DependencyMissing(format!(
                    "missing {}",
                    tokenizer_path.display()
                )));
            }

            let session = Session::builder()
                .map_err(|e: ort::Error| ModelError::Runtime(e.to_string()))?
                .with_intra_threads(2)
                .map_err(|e: ort::Error| ModelError::Runtime(e.to_string()))?
                .commit_from_file(&model_path)
                .map_err(|e: ort::Error| ModelError::Runtime(format!("ONNX load: {e}")))?;

            let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
                .map_err(|e| ModelError::DependencyMissing(format!("tokenizer load: {e}")))?;

            tracing::info!(dir = %model_dir.display(), "ONNX embedder loaded");

            Ok(Self {
                session: Mutex::new(session),
                tokenizer,
            })
        }

        /// Tokenize, run inference, mean-pool with the attention mask,
        /// L2-normalise.
        fn infer(&self, text: &str) -> Result<Vec<f32>, ModelError> {
            use ort::value::TensorRef;

            let encoding = self
                .tokenizer
                .encode(text, true)
                .map_err(|e| ModelError::Runtime(format!("tokenization: {e}")))?;

            let input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
            let attention_mask: Vec<i64> = encoding
                .get_attention_mask()
                .iter()
                .map(|&m| m as i64)
                .collect();
            let token_type_ids: Vec<i64> =
                encoding.get_type_ids().iter().map(|&t| t as i64).collect();

            let seq_len = input_ids.len();
            let shape_err = |e: ndarray::ShapeError| ModelError::Runtime(e.to_string());

            let ids_array =
                ndarray::Array2::from_shape_vec((1, seq_len), input_ids).map_err(shape_err)?;
            let mask_array = ndarray::Array2::from_shape_vec((1, seq_len), attention_mask.clone())
                .map_err(shape_err)?;
            let type_array =
                ndarray::Array2::from_shape_vec((1, seq_len), token_type_ids).map_err(shape_err)?;

            let tensor_err = |e: ort::Error| ModelError::Runtime(e.to_string());
            let ids_tensor = TensorRef::from_array_view(&ids_array).map_err(tensor_err)?;
            let mask_tensor = TensorRef::from_array_view(&mask_array).map_err(tensor_err)?;
            let type_tensor = TensorRef::from_array_view(&type_array).map_err(tensor_err)?;

            let mut session = self
                .session
                .lock()
                .map_err(|_| ModelError::Runtime("session lock poisoned".to_string()))?;

            let outputs = session
                .run(ort::inputs![ids_tensor, mask_tensor, type_tensor])
                .map_err(|e| ModelError::Runtime(format!("ONNX inference: {e}")))?;

            let (shape, output_data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| ModelError::Runtime(format!("output extraction: {e}")))?;

            if shape.len() != 3 || shape[2] as usize != EMBEDDING_DIM {
                return Err(ModelError::Runtime(format!(
                    "unexpected output shape {shape:?}, expected [1, {seq_len}, {EMBEDDING_DIM}]"
                )));
            }

            let mut pooled = vec![0.0f32; EMBEDDING_DIM];
            let mut mask_sum = 0.0f32;

            for (token_idx, &mask_val_i64) in attention_mask.iter().enumerate().take(seq_len) {
                let mask_val = mask_val_i64 as f32;
                mask_sum += mask_val;
                let offset = token_idx * EMBEDDING_DIM;
                for (dim_idx, p) in pooled.iter_mut().enumerate() {
                    *p += output_data[offset + dim_idx] * mask_val;
                }
            }

            if mask_sum > 0.0 {
                for val in &mut pooled {
                    *val /= mask_sum;
                }
            }

            super::l2_normalize(&mut pooled);
            Ok(pooled)
        }
    }

    impl EmbeddingModel for OnnxEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError> {
            self.infer(text)
        }

        fn dimension(&self) -> usize {
            EMBEDDING_DIM
        }
    }
}

#[cfg(feature = "onnx-embeddings")]
pub use onnx::OnnxEmbedder;

// ═══════════════════════════════════════════════════════════
// Deterministic fallback
// ═══════════════════════════════════════════════════════════

/// Token-hash bag-of-words embedder.
///
/// Each lowercased token is hashed into a bucket; the accumulated vector is
/// L2-normalised. Texts sharing vocabulary land close in cosine space,
/// which is enough for recall over a single practice's notes. Deterministic
/// under a fixed dimension, so index rebuilds reproduce identical vectors.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self {
            dimension: EMBEDDING_DIM,
        }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingModel for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError> {
        let mut vec = vec![0.0f32; self.dimension];

        for token in text.split(|c: char| !c.is_alphanumeric()) {
            if token.is_empty() {
                continue;
            }
            let token = token.to_lowercase();
            let h = fnv1a(token.as_bytes());
            let bucket = (h % self.dimension as u64) as usize;
            // A second hash decides the sign so common tokens don't all
            // pile onto the positive axis.
            let sign = if (h >> 32) & 1 == 0 { 1.0 } else { -1.0 };
            vec[bucket] += sign;
        }

        l2_normalize(&mut vec);
        Ok(vec)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn parallel_safe(&self) -> bool {
        true
    }
}

/// FNV-1a over a byte slice.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// L2-normalise in place; zero vectors stay zero.
pub(crate) fn l2_normalize(vec: &mut [f32]) {
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for val in vec {
            *val /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embed_returns_correct_dimension() {
        let embedder = HashEmbedder::new();
        let vec = embedder.embed("Douleur molaire 36 depuis 3 jours").unwrap();
        assert_eq!(vec.len(), EMBEDDING_DIM);
    }

    #[test]
    fn embed_is_deterministic() {
        let embedder = HashEmbedder::new();
        let v1 = embedder.embed("same text").unwrap();
        let v2 = embedder.embed("same text").unwrap();
        assert_eq!(v1, v2);
    }

    #[test]
    fn embed_is_l2_normalized() {
        let embedder = HashEmbedder::new();
        let vec = embedder.embed("test normalization").unwrap();
        let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.01, "expected unit norm, got {norm}");
    }

    #[test]
    fn shared_vocabulary_scores_higher_than_disjoint() {
        let embedder = HashEmbedder::new();
        let base = embedder
            .embed("extraction of impacted wisdom tooth 48")
            .unwrap();
        let related = embedder
            .embed("wisdom tooth 48 extraction follow-up")
            .unwrap();
        let unrelated = embedder.embed("invoice paid by card yesterday").unwrap();

        let dot = |a: &[f32], b: &[f32]| -> f32 { a.iter().zip(b).map(|(x, y)| x * y).sum() };
        assert!(dot(&base, &related) > dot(&base, &unrelated));
    }

    #[test]
    fn empty_text_embeds_to_zero_vector() {
        let embedder = HashEmbedder::new();
        let vec = embedder.embed("").unwrap();
        assert!(vec.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn embed_batch_matches_individual_embeds() {
        let embedder = HashEmbedder::new();
        let texts = vec!["caries on 26", "scaling and polishing"];
        let batch = embedder.embed_batch(&texts).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], embedder.embed("caries on 26").unwrap());
    }

    #[test]
    fn fallback_embedder_is_parallel_safe() {
        assert!(HashEmbedder::new().parallel_safe());
    }
}
