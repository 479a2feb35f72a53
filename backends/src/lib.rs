mod hashing;
mod kmeans;

use std::sync::Arc;

pub use crate::hashing::HashingEmbedder;
pub use crate::kmeans::KMeansClusterer;
pub use diversity_backend_core::{BackendError, BackendKind, Clusterer, Embedder, Embedding};

static DEFAULT_HASHING_DIM: usize = 384;

/// Embedder and clusterer pair the scheduler runs against
#[derive(Clone)]
pub struct Backends {
    pub embedder: Arc<dyn Embedder>,
    pub clusterer: Arc<dyn Clusterer>,
    pub kind: BackendKind,
}

impl Backends {
    /// Wrap caller supplied collaborators
    pub fn custom(embedder: Arc<dyn Embedder>, clusterer: Arc<dyn Clusterer>) -> Self {
        Self {
            embedder,
            clusterer,
            kind: BackendKind::Custom,
        }
    }
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends")
            .field("kind", &self.kind)
            .field("model_name", &self.embedder.model_name())
            .field("clusterer", &self.clusterer.name())
            .finish()
    }
}

/// Probe for a built-in backend able to serve `model_name`.
///
/// Returns `BackendError::NoBackend` when nothing matches, in which case the
/// caller is expected to run with diversification disabled.
pub fn init_backends(model_name: &str) -> Result<Backends, BackendError> {
    let dim = match parse_hashing_model(model_name)? {
        Some(dim) => dim,
        None => {
            tracing::warn!("No built-in embedding backend for model `{model_name}`");
            return Err(BackendError::NoBackend);
        }
    };

    tracing::info!("Starting hashing embedder with {dim} dimensions");
    Ok(Backends {
        embedder: Arc::new(HashingEmbedder::new(dim)?),
        clusterer: Arc::new(KMeansClusterer::default()),
        kind: BackendKind::Hashing,
    })
}

fn parse_hashing_model(model_name: &str) -> Result<Option<usize>, BackendError> {
    let model_name = model_name.trim().to_lowercase();
    if model_name == "hashing" {
        return Ok(Some(DEFAULT_HASHING_DIM));
    }
    match model_name.strip_prefix("hashing-") {
        Some(dim) => dim.parse::<usize>().map(Some).map_err(|_| {
            BackendError::Start(format!("invalid hashing dimension `{dim}`"))
        }),
        None => Ok(None),
    }
}
