//! ONNX text encoder (ort + tokenizers)
//!
//! Wraps an all-MiniLM-L6-v2 ONNX export: WordPiece tokenization truncated to
//! 256 tokens, padded right, masked mean-pooling over the hidden states, and
//! L2 normalisation to a 384-dim unit vector.
//!
//! There is exactly one tokenize-pad-run path for any batch size >= 1;
//! singletons go through it as a batch of one, so batch and single calls can
//! never produce differently shaped tensors.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ndarray::Array2;
use ort::ep::ExecutionProvider as OrtExecutionProvider;
use ort::session::Session;
use thiserror::Error;

use crate::math::l2_normalize;
use crate::{EMBEDDING_DIM, MODEL_NAME};

const MODEL_FILE: &str = "onnx/model.onnx";
const TOKENIZER_FILE: &str = "tokenizer.json";

/// Token budget per text; longer inputs are truncated.
const MAX_TOKENS: usize = 256;

// blake3 checksums for model verification (empty = skip validation)
const MODEL_BLAKE3: &str = "";
const TOKENIZER_BLAKE3: &str = "";

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("Model not found: {0}")]
    ModelNotFound(String),
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("HuggingFace Hub error: {0}")]
    HfHub(String),
}

impl From<ort::Error> for EncoderError {
    fn from(e: ort::Error) -> Self {
        EncoderError::Inference(e.to_string())
    }
}

/// Hardware execution provider for inference
#[derive(Debug, Clone, Copy)]
pub enum ExecutionProvider {
    /// NVIDIA CUDA (requires CUDA toolkit)
    CUDA { device_id: i32 },
    /// NVIDIA TensorRT (faster than CUDA, requires TensorRT)
    TensorRT { device_id: i32 },
    /// CPU fallback (always available)
    CPU,
}

impl std::fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionProvider::CUDA { device_id } => write!(f, "CUDA (device {})", device_id),
            ExecutionProvider::TensorRT { device_id } => {
                write!(f, "TensorRT (device {})", device_id)
            }
            ExecutionProvider::CPU => write!(f, "CPU"),
        }
    }
}

/// Loaded encoder session + tokenizer.
///
/// Construction is the expensive part (session init ~500ms plus a possible
/// model download); the embedder does it on a background warm-up thread.
/// The session is shared behind a mutex - ort's `run()` needs `&mut`.
pub struct OnnxEncoder {
    session: Mutex<Session>,
    tokenizer: tokenizers::Tokenizer,
    provider: ExecutionProvider,
    max_length: usize,
    batch_size: usize,
}

impl OnnxEncoder {
    /// Load the encoder from `model_dir`, or fetch from HuggingFace Hub when
    /// no directory is configured.
    pub fn load(model_dir: Option<&Path>) -> Result<Self, EncoderError> {
        let (model_path, tokenizer_path) = match model_dir {
            Some(dir) => resolve_local_model(dir)?,
            None => ensure_model()?,
        };

        let provider = select_provider();
        let batch_size = match provider {
            ExecutionProvider::CPU => 8,
            _ => 32,
        };

        let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| EncoderError::Tokenizer(e.to_string()))?;
        let session = create_session(&model_path, provider)?;

        tracing::info!(provider = %provider, model = MODEL_NAME, "Encoder loaded");

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            provider,
            max_length: MAX_TOKENS,
            batch_size,
        })
    }

    /// Get the execution provider being used
    pub fn provider(&self) -> ExecutionProvider {
        self.provider
    }

    /// Encode a batch of texts to unit vectors, preserving input order.
    ///
    /// Oversize batches are chunked internally to `batch_size`.
    pub fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EncoderError> {
        let _span = tracing::info_span!("encode_batch", count = texts.len()).entered();

        let mut results = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size.max(1)) {
            results.extend(self.run_chunk(chunk)?);
        }
        Ok(results)
    }

    fn run_chunk(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EncoderError> {
        use ort::value::Tensor;

        if texts.is_empty() {
            return Ok(vec![]);
        }

        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| EncoderError::Tokenizer(e.to_string()))?;

        // INT64 inputs for the ONNX graph
        let input_ids: Vec<Vec<i64>> = encodings
            .iter()
            .map(|e| e.get_ids().iter().map(|&id| id as i64).collect())
            .collect();
        let attention_mask: Vec<Vec<i64>> = encodings
            .iter()
            .map(|e| e.get_attention_mask().iter().map(|&m| m as i64).collect())
            .collect();

        // Pad to the longest sequence in the batch, capped at max_length
        let max_len = input_ids
            .iter()
            .map(|v| v.len())
            .max()
            .unwrap_or(0)
            .min(self.max_length)
            .max(1);

        let input_ids_arr = pad_2d_i64(&input_ids, max_len, 0);
        let attention_mask_arr = pad_2d_i64(&attention_mask, max_len, 0);
        // token_type_ids: all zeros, same shape as input_ids
        let token_type_ids_arr = Array2::<i64>::zeros((texts.len(), max_len));

        let input_ids_tensor = Tensor::from_array(input_ids_arr)?;
        let attention_mask_tensor = Tensor::from_array(attention_mask_arr)?;
        let token_type_ids_tensor = Tensor::from_array(token_type_ids_arr)?;

        // Guard stays alive until the outputs are extracted below
        let mut session = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let outputs = session.run(ort::inputs![
            "input_ids" => input_ids_tensor,
            "attention_mask" => attention_mask_tensor,
            "token_type_ids" => token_type_ids_tensor,
        ])?;

        // last_hidden_state: [batch, seq_len, 384]
        let (_shape, data) = outputs["last_hidden_state"].try_extract_tensor::<f32>()?;

        let batch_size = texts.len();
        let seq_len = max_len;
        let mut results = Vec::with_capacity(batch_size);

        for (i, mask_vec) in attention_mask.iter().enumerate().take(batch_size) {
            let mut sum = vec![0.0f32; EMBEDDING_DIM];
            let mut count = 0.0f32;

            for j in 0..seq_len {
                let mask = mask_vec.get(j).copied().unwrap_or(0) as f32;
                if mask > 0.0 {
                    count += mask;
                    let offset = i * seq_len * EMBEDDING_DIM + j * EMBEDDING_DIM;
                    for (k, sum_val) in sum.iter_mut().enumerate() {
                        *sum_val += data[offset + k] * mask;
                    }
                }
            }

            if count > 0.0 {
                for sum_val in &mut sum {
                    *sum_val /= count;
                }
            }

            if !l2_normalize(&mut sum) {
                return Err(EncoderError::Inference(
                    "encoder produced a zero vector".into(),
                ));
            }
            results.push(sum);
        }

        Ok(results)
    }
}

fn resolve_local_model(dir: &Path) -> Result<(PathBuf, PathBuf), EncoderError> {
    let model_path = dir.join(MODEL_FILE);
    let model_path = if model_path.exists() {
        model_path
    } else {
        // Also accept a flat layout with model.onnx next to tokenizer.json
        dir.join("model.onnx")
    };
    let tokenizer_path = dir.join(TOKENIZER_FILE);

    if !model_path.exists() {
        return Err(EncoderError::ModelNotFound(format!(
            "no model.onnx under {}",
            dir.display()
        )));
    }
    if !tokenizer_path.exists() {
        return Err(EncoderError::ModelNotFound(format!(
            "no tokenizer.json under {}",
            dir.display()
        )));
    }
    Ok((model_path, tokenizer_path))
}

/// Download model and tokenizer from HuggingFace Hub
fn ensure_model() -> Result<(PathBuf, PathBuf), EncoderError> {
    use hf_hub::api::sync::Api;

    let api = Api::new().map_err(|e| EncoderError::HfHub(e.to_string()))?;
    let repo = api.model(MODEL_NAME.to_string());

    let model_path = repo
        .get(MODEL_FILE)
        .map_err(|e| EncoderError::HfHub(e.to_string()))?;
    let tokenizer_path = repo
        .get(TOKENIZER_FILE)
        .map_err(|e| EncoderError::HfHub(e.to_string()))?;

    // Verify checksums (skip if not configured)
    if !MODEL_BLAKE3.is_empty() {
        verify_checksum(&model_path, MODEL_BLAKE3)?;
    }
    if !TOKENIZER_BLAKE3.is_empty() {
        verify_checksum(&tokenizer_path, TOKENIZER_BLAKE3)?;
    }

    Ok((model_path, tokenizer_path))
}

/// Verify file checksum using blake3
fn verify_checksum(path: &Path, expected: &str) -> Result<(), EncoderError> {
    let mut file =
        std::fs::File::open(path).map_err(|e| EncoderError::ModelNotFound(e.to_string()))?;
    let mut hasher = blake3::Hasher::new();
    std::io::copy(&mut file, &mut hasher)
        .map_err(|e| EncoderError::ModelNotFound(e.to_string()))?;
    let actual = hasher.finalize().to_hex().to_string();

    if actual != expected {
        return Err(EncoderError::ChecksumMismatch {
            path: path.display().to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Select the best available execution provider
fn select_provider() -> ExecutionProvider {
    use ort::ep::{TensorRT, CUDA};

    let cuda = CUDA::default();
    if cuda.is_available().unwrap_or(false) {
        return ExecutionProvider::CUDA { device_id: 0 };
    }

    let tensorrt = TensorRT::default();
    if tensorrt.is_available().unwrap_or(false) {
        return ExecutionProvider::TensorRT { device_id: 0 };
    }

    ExecutionProvider::CPU
}

/// Create an ort session with the specified provider
fn create_session(
    model_path: &Path,
    provider: ExecutionProvider,
) -> Result<Session, EncoderError> {
    use ort::ep::{TensorRT, CUDA};

    let mut builder = Session::builder()?;

    let session = match provider {
        ExecutionProvider::CUDA { device_id } => builder
            .with_execution_providers([CUDA::default().with_device_id(device_id).build()])
            .map_err(|e| EncoderError::Inference(e.to_string()))?
            .commit_from_file(model_path)?,
        ExecutionProvider::TensorRT { device_id } => {
            builder
                .with_execution_providers([
                    TensorRT::default().with_device_id(device_id).build(),
                    // Fallback to CUDA for unsupported ops
                    CUDA::default().with_device_id(device_id).build(),
                ])
                .map_err(|e| EncoderError::Inference(e.to_string()))?
                .commit_from_file(model_path)?
        }
        ExecutionProvider::CPU => builder.commit_from_file(model_path)?,
    };

    Ok(session)
}

/// Pad 2D sequences to a fixed length
fn pad_2d_i64(inputs: &[Vec<i64>], max_len: usize, pad_value: i64) -> Array2<i64> {
    let batch_size = inputs.len();
    let mut arr = Array2::from_elem((batch_size, max_len), pad_value);
    for (i, seq) in inputs.iter().enumerate() {
        for (j, &val) in seq.iter().take(max_len).enumerate() {
            arr[[i, j]] = val;
        }
    }
    arr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_2d_shapes() {
        let inputs = vec![vec![1i64, 2, 3], vec![4i64]];
        let arr = pad_2d_i64(&inputs, 3, 0);
        assert_eq!(arr.shape(), &[2, 3]);
        assert_eq!(arr[[0, 2]], 3);
        assert_eq!(arr[[1, 0]], 4);
        assert_eq!(arr[[1, 1]], 0);
    }

    #[test]
    fn test_pad_2d_truncates() {
        let inputs = vec![vec![1i64; 10]];
        let arr = pad_2d_i64(&inputs, 4, 0);
        assert_eq!(arr.shape(), &[1, 4]);
    }

    #[test]
    fn test_resolve_local_model_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(matches!(
            resolve_local_model(dir.path()),
            Err(EncoderError::ModelNotFound(_))
        ));
    }

    // End-to-end encoder tests live in tests/encoder_test.rs behind the
    // `model-tests` feature; they need the ONNX export on disk.
}
