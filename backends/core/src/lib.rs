use std::fmt;
use thiserror::Error;

/// A fixed-length embedding vector
pub type Embedding = Vec<f32>;

/// Computes embeddings for a batch of texts.
///
/// The returned vector must have the same length and order as `texts`.
pub trait Embedder: Send + Sync {
    fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>, BackendError>;

    /// Opaque model identifier, used to tag persisted vectors
    fn model_name(&self) -> &str {
        "custom"
    }
}

/// Partitions vectors into `k` groups.
///
/// Returns one label in `[0, k)` per input vector, in input order. The same
/// vectors, `k` and `seed` must give the same labels.
pub trait Clusterer: Send + Sync {
    fn cluster(&self, vectors: &[Embedding], k: usize, seed: u64)
        -> Result<Vec<usize>, BackendError>;

    fn name(&self) -> &str {
        "custom"
    }
}

impl<F> Embedder for F
where
    F: Fn(&[String]) -> Result<Vec<Embedding>, BackendError> + Send + Sync,
{
    fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>, BackendError> {
        self(texts)
    }
}

impl<F> Clusterer for F
where
    F: Fn(&[Embedding], usize, u64) -> Result<Vec<usize>, BackendError> + Send + Sync,
{
    fn cluster(
        &self,
        vectors: &[Embedding],
        k: usize,
        seed: u64,
    ) -> Result<Vec<usize>, BackendError> {
        self(vectors, k, seed)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum BackendKind {
    Hashing,
    Custom,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BackendKind::Hashing => write!(f, "hashing"),
            BackendKind::Custom => write!(f, "custom"),
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum BackendError {
    #[error("No backend found")]
    NoBackend,
    #[error("Could not start backend: {0}")]
    Start(String),
    #[error("{0}")]
    Inference(String),
    #[error("Clustering failed: {0}")]
    Clustering(String),
}
