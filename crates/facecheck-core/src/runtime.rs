//! Embedding runtime: ArcFace via ONNX Runtime, loaded once and shared.
//!
//! Produces 512-dimensional unit-norm embeddings from the preprocessed RGB
//! buffer, using the w600k_r50 ArcFace model. The runtime is handed around
//! as an `Arc` so sessions and tests can inject their own backend.

use crate::types::{Embedding, EMBEDDING_DIM};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::OnceCell;

// --- Named constants ---
const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // not 128.0: ArcFace normalizes symmetrically
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("model file not found: {0} (download w600k_r50.onnx from insightface)")]
    ModelNotFound(String),
    #[error("embedding model not loaded")]
    ModelNotLoaded,
    #[error("model load failed: {0}")]
    LoadFailed(String),
    #[error("invalid input size: expected {expected} values, got {actual}")]
    InvalidInputSize { expected: usize, actual: usize },
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("embedding norm is zero or non-finite")]
    UnstableEmbedding,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Square input geometry and normalization expected by the network.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputSpec {
    pub side: usize,
    pub mean: f32,
    pub std: f32,
}

impl InputSpec {
    pub const ARCFACE: Self = Self {
        side: ARCFACE_INPUT_SIZE,
        mean: ARCFACE_MEAN,
        std: ARCFACE_STD,
    };

    pub const fn buffer_len(&self) -> usize {
        self.side * self.side * 3
    }
}

/// A loaded network. `run` takes an NCHW tensor and returns the raw output vector.
pub trait EmbeddingBackend: Send + Sync {
    fn run(&self, input: Array4<f32>) -> Result<Vec<f32>, RuntimeError>;
}

/// Produces a backend; called at most once per successful load.
pub trait BackendLoader: Send + Sync {
    fn load(&self) -> Result<Box<dyn EmbeddingBackend>, RuntimeError>;
}

/// Loads the ArcFace ONNX model from disk.
pub struct OnnxLoader {
    model_path: PathBuf,
    intra_threads: usize,
}

impl OnnxLoader {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            intra_threads: 2,
        }
    }

    pub fn with_intra_threads(mut self, threads: usize) -> Self {
        self.intra_threads = threads.max(1);
        self
    }
}

impl BackendLoader for OnnxLoader {
    fn load(&self) -> Result<Box<dyn EmbeddingBackend>, RuntimeError> {
        let path = self.model_path.as_path();
        if !path.exists() {
            return Err(RuntimeError::ModelNotFound(path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(self.intra_threads)?
            .commit_from_file(path)?;

        tracing::info!(
            path = %path.display(),
            version = ARCFACE_MODEL_VERSION,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Box::new(OnnxBackend {
            session: Mutex::new(session),
        }))
    }
}

/// ONNX session; `Session::run` needs `&mut`, so concurrent callers serialize here.
struct OnnxBackend {
    session: Mutex<Session>,
}

impl EmbeddingBackend for OnnxBackend {
    fn run(&self, input: Array4<f32>) -> Result<Vec<f32>, RuntimeError> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| RuntimeError::Inference("session lock poisoned".into()))?;

        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RuntimeError::Inference(format!("embedding extraction: {e}")))?;

        Ok(raw_data.to_vec())
    }
}

/// L2-normalize a raw network output.
///
/// Zero or non-finite norms yield [`RuntimeError::UnstableEmbedding`] instead
/// of a vector callers could mistake for a usable one.
pub fn l2_normalize(raw: Vec<f32>) -> Result<Embedding, RuntimeError> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if !norm.is_finite() || norm <= 0.0 {
        return Err(RuntimeError::UnstableEmbedding);
    }
    Ok(Embedding::from_normalized(
        raw.into_iter().map(|x| x / norm).collect(),
    ))
}

/// Row-major RGB (HWC) buffer → NCHW tensor.
fn to_nchw(buffer: &[f32], side: usize) -> Array4<f32> {
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for y in 0..side {
        for x in 0..side {
            let base = (y * side + x) * 3;
            tensor[[0, 0, y, x]] = buffer[base];
            tensor[[0, 1, y, x]] = buffer[base + 1];
            tensor[[0, 2, y, x]] = buffer[base + 2];
        }
    }
    tensor
}

/// Shared handle passed to every session.
pub type SharedRuntime = Arc<EmbeddingRuntime>;

/// Lazily loaded embedding network.
pub struct EmbeddingRuntime {
    loader: Arc<dyn BackendLoader>,
    backend: OnceCell<Arc<dyn EmbeddingBackend>>,
    spec: InputSpec,
    load_calls: AtomicUsize,
}

impl EmbeddingRuntime {
    pub fn new(loader: impl BackendLoader + 'static, spec: InputSpec) -> Self {
        Self {
            loader: Arc::new(loader),
            backend: OnceCell::new(),
            spec,
            load_calls: AtomicUsize::new(0),
        }
    }

    /// ArcFace ONNX runtime for the model at `model_path`. Nothing is loaded yet.
    pub fn arcface(model_path: &Path) -> SharedRuntime {
        Arc::new(Self::new(OnnxLoader::new(model_path), InputSpec::ARCFACE))
    }

    pub fn spec(&self) -> &InputSpec {
        &self.spec
    }

    pub fn is_loaded(&self) -> bool {
        self.backend.initialized()
    }

    /// Number of times the loader has actually been invoked.
    pub fn load_count(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    /// Load the backend if needed.
    ///
    /// Concurrent callers during a load wait for that same load. A failed
    /// load leaves the runtime empty so a later call can try again.
    pub async fn ensure_loaded(&self) -> Result<(), RuntimeError> {
        self.backend
            .get_or_try_init(|| async {
                self.load_calls.fetch_add(1, Ordering::SeqCst);
                let loader = Arc::clone(&self.loader);
                let backend = tokio::task::spawn_blocking(move || loader.load())
                    .await
                    .map_err(|e| RuntimeError::LoadFailed(e.to_string()))??;
                Ok::<_, RuntimeError>(Arc::from(backend))
            })
            .await?;
        Ok(())
    }

    /// Run the network on a preprocessed buffer and return a unit-norm embedding.
    pub fn infer(&self, buffer: &[f32]) -> Result<Embedding, RuntimeError> {
        let backend = self.backend.get().ok_or(RuntimeError::ModelNotLoaded)?;

        let expected = self.spec.buffer_len();
        if buffer.len() != expected {
            return Err(RuntimeError::InvalidInputSize {
                expected,
                actual: buffer.len(),
            });
        }

        let raw = backend.run(to_nchw(buffer, self.spec.side))?;
        if raw.len() != EMBEDDING_DIM {
            return Err(RuntimeError::Inference(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        l2_normalize(raw)
    }
}
