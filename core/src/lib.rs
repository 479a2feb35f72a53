pub mod cluster;
pub mod config;
pub mod ordering;
pub mod persist;
pub mod sampling;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use crate::config::DiversityConfig;
pub use crate::scheduler::{DiversityScheduler, PrefetchSink, SchedulerStats, UserStats};
pub use crate::worker::{EmbedRequest, PendingEmbedding};
pub use diversity_backend::{BackendError, Backends, Clusterer, Embedder, Embedding};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiversityError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cache serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Cache format error: {0}")]
    Format(String),
}
