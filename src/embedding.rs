//! Local embedding pipeline.
//!
//! Defines the [`Embedder`] trait and the CodeBERT implementation used for
//! dense retrieval. The model runs fully offline through tract-onnx after an
//! explicit `qpg init` downloads the assets into the local model cache; no
//! network calls happen on the query path.
//!
//! Also provides the vector utilities shared with the vector index:
//! - [`cosine_similarity`] — similarity between two embedding vectors
//! - [`to_json_vector`] / [`decode_json_vector`] — the stored JSON encoding
//! - [`source_text_hash`] — staleness hash over the dense source text

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tract_onnx::prelude::*;

use crate::error::{Error, Result};
use crate::paths::Paths;

pub const MODEL_REPO: &str = "microsoft/codebert-base";
pub const MODEL_DIRNAME: &str = "microsoft__codebert-base";
pub const MODEL_ID: &str = "codebert-base-v1";
pub const EMBEDDING_DIMS: usize = 768;
const MAX_TOKENS: usize = 256;
const MODEL_FILES: &[&str] = &["model.onnx", "tokenizer.json"];

/// Text-to-vector provider.
///
/// The production implementation is [`CodebertEmbedder`]; tests substitute a
/// deterministic stub through this seam.
pub trait Embedder: Send + Sync {
    /// Model identifier recorded next to each stored vector.
    fn model_id(&self) -> &str;
    /// Embedding dimensionality.
    fn dims(&self) -> usize;
    /// Embed one text. Empty input yields the zero vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

type Plan = TypedRunnableModel<TypedModel>;

struct LoadedModel {
    tokenizer: tokenizers::Tokenizer,
    plan: Plan,
}

/// CodeBERT embedder backed by tract-onnx.
///
/// Model assets are loaded lazily on first use and held for the process
/// lifetime; the first query pays the load cost.
pub struct CodebertEmbedder {
    model_dir: PathBuf,
    loaded: Mutex<Option<Arc<LoadedModel>>>,
}

impl CodebertEmbedder {
    /// Create an embedder over an initialized model cache.
    ///
    /// Fails with `ModelNotInitialized` if `qpg init` has not been run.
    pub fn new(paths: &Paths) -> Result<Self> {
        let model_dir = require_model(paths)?;
        Ok(CodebertEmbedder {
            model_dir,
            loaded: Mutex::new(None),
        })
    }

    fn ensure_loaded(&self) -> Result<Arc<LoadedModel>> {
        let mut guard = self
            .loaded
            .lock()
            .map_err(|_| Error::Embedding("embedder lock poisoned".into()))?;
        if let Some(loaded) = guard.as_ref() {
            return Ok(Arc::clone(loaded));
        }

        let tokenizer_path = self.model_dir.join("tokenizer.json");
        let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| Error::Embedding(format!("load tokenizer: {e}")))?;

        let plan = tract_onnx::onnx()
            .model_for_path(self.model_dir.join("model.onnx"))
            .map_err(|e| Error::Embedding(format!("load onnx model: {e}")))?
            .into_optimized()
            .map_err(|e| Error::Embedding(format!("optimize model: {e}")))?
            .into_runnable()
            .map_err(|e| Error::Embedding(format!("build runnable model: {e}")))?;

        let loaded = Arc::new(LoadedModel { tokenizer, plan });
        *guard = Some(Arc::clone(&loaded));
        Ok(loaded)
    }
}

impl Embedder for CodebertEmbedder {
    fn model_id(&self) -> &str {
        MODEL_ID
    }

    fn dims(&self) -> usize {
        EMBEDDING_DIMS
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Ok(vec![0.0; EMBEDDING_DIMS]);
        }
        let loaded = self.ensure_loaded()?;

        let encoding = loaded
            .tokenizer
            .encode(text, true)
            .map_err(|e| Error::Embedding(format!("tokenize: {e}")))?;
        let ids = encoding.get_ids();
        let len = ids.len().clamp(1, MAX_TOKENS);

        let mut input_ids = vec![0i64; len];
        let mut attention_mask = vec![0i64; len];
        for (j, &id) in ids.iter().take(len).enumerate() {
            input_ids[j] = id as i64;
            attention_mask[j] = 1;
        }

        let input_ids_tensor = ndarray::Array2::from_shape_vec((1, len), input_ids)
            .map_err(|e| Error::Embedding(format!("input ids shape: {e}")))?;
        let attention_mask_tensor = ndarray::Array2::from_shape_vec((1, len), attention_mask)
            .map_err(|e| Error::Embedding(format!("attention mask shape: {e}")))?;

        let input_ids_t: Tensor = input_ids_tensor.into();
        let attention_mask_t: Tensor = attention_mask_tensor.into();
        let outputs = loaded
            .plan
            .run(tvec!(input_ids_t.into(), attention_mask_t.into()))
            .map_err(|e| Error::Embedding(format!("inference: {e}")))?;

        let output = outputs
            .into_iter()
            .next()
            .ok_or_else(|| Error::Embedding("no output tensor".into()))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| Error::Embedding(format!("output tensor: {e}")))?;

        // last_hidden_state [1, seq, dims]: masked mean-pool, then L2 norm.
        let shape = view.shape();
        if shape.len() != 3 || shape[2] < EMBEDDING_DIMS {
            return Err(Error::Embedding(format!(
                "unexpected output shape: {shape:?}"
            )));
        }
        let seq_len = shape[1].min(len);
        let mut pooled = vec![0f32; EMBEDDING_DIMS];
        for j in 0..seq_len {
            for (k, &value) in view
                .slice(ndarray::s![0, j, ..])
                .iter()
                .enumerate()
            {
                if k < EMBEDDING_DIMS {
                    pooled[k] += value;
                }
            }
        }
        for value in &mut pooled {
            *value /= seq_len as f32;
        }
        Ok(normalize_l2(pooled))
    }
}

fn normalize_l2(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-9 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

// ============ Model asset cache ============

/// Directory holding the downloaded model assets.
pub fn model_dir(paths: &Paths) -> PathBuf {
    paths.models_dir.join(MODEL_DIRNAME)
}

fn model_is_cached(dir: &Path) -> bool {
    MODEL_FILES.iter().all(|file| {
        dir.join(file)
            .metadata()
            .map(|m| m.len() > 0)
            .unwrap_or(false)
    })
}

/// Download the model assets into the local cache. Explicit `qpg init` step;
/// already-cached assets are not re-fetched. Must run off the async runtime.
pub fn init_model(paths: &Paths) -> Result<PathBuf> {
    let dir = model_dir(paths);
    if model_is_cached(&dir) {
        return Ok(dir);
    }
    std::fs::create_dir_all(&dir)?;

    for file in MODEL_FILES {
        let target = dir.join(file);
        if target.metadata().map(|m| m.len() > 0).unwrap_or(false) {
            continue;
        }
        let url = format!("https://huggingface.co/{MODEL_REPO}/resolve/main/{file}");
        let response = reqwest::blocking::get(&url)?.error_for_status()?;
        let bytes = response.bytes()?;
        std::fs::write(&target, &bytes)?;
    }
    Ok(dir)
}

/// Return the cached model path, or fail if `qpg init` has not been run.
pub fn require_model(paths: &Paths) -> Result<PathBuf> {
    let dir = model_dir(paths);
    if model_is_cached(&dir) {
        Ok(dir)
    } else {
        Err(Error::ModelNotInitialized)
    }
}

// ============ Vector utilities ============

/// Encode a vector as compact JSON with values rounded to 8 decimals.
/// This is the stored representation and the `vec_f32()` input format.
pub fn to_json_vector(vector: &[f32]) -> String {
    let rounded: Vec<f64> = vector
        .iter()
        .map(|&v| (v as f64 * 1e8).round() / 1e8)
        .collect();
    serde_json::to_string(&rounded).unwrap_or_else(|_| "[]".to_string())
}

/// Decode a stored JSON vector; `None` for anything malformed.
pub fn decode_json_vector(blob: &[u8]) -> Option<Vec<f32>> {
    let text = std::str::from_utf8(blob).ok()?;
    let raw: Vec<f64> = serde_json::from_str(text).ok()?;
    Some(raw.into_iter().map(|v| v as f32).collect())
}

/// Cosine similarity in `[-1, 1]`; `0.0` for mismatched or empty vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

/// Staleness hash over the dense source text. Vectors are only recomputed
/// when this changes.
pub fn source_text_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_vector_round_trips() {
        let vector = vec![1.0f32, -0.5, 0.125, 0.0];
        let json = to_json_vector(&vector);
        let decoded = decode_json_vector(json.as_bytes()).unwrap();
        assert_eq!(vector, decoded);
    }

    #[test]
    fn json_vector_is_compact_and_rounded() {
        let json = to_json_vector(&[0.123456789f32]);
        assert!(!json.contains(' '));
        assert!(json.starts_with('['));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_json_vector(b"not json").is_none());
        assert!(decode_json_vector(&[0xff, 0xfe]).is_none());
        assert!(decode_json_vector(b"{\"a\":1}").is_none());
    }

    #[test]
    fn cosine_identical_and_orthogonal() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn cosine_handles_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn source_text_hash_is_stable() {
        assert_eq!(source_text_hash("orders"), source_text_hash("orders"));
        assert_ne!(source_text_hash("orders"), source_text_hash("orders2"));
        assert_eq!(source_text_hash("x").len(), 64);
    }

    #[test]
    fn l2_norm_produces_unit_vectors() {
        let v = normalize_l2(vec![3.0, 4.0]);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }
}
