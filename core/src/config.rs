use crate::DiversityError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Diversity ordering configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiversityConfig {
    /// Turn diversified ordering on. When off every ordering is the identity
    pub enabled: bool,
    /// Opaque model identifier handed to the embedding backend
    pub model_name: String,
    /// Fixed cluster count, used when `auto_clusters` is off
    pub num_clusters: usize,
    /// Target cluster size when `auto_clusters` is on
    pub items_per_cluster: usize,
    /// Derive the cluster count from the number of embedded items
    pub auto_clusters: bool,
    /// Number of texts per embedder call
    pub batch_size: usize,
    /// Directory holding the vector and cluster label files.
    /// No persistence when unset
    pub cache_dir: Option<PathBuf>,
    /// Fraction of live clusters a user must have drawn from before a recluster
    pub recluster_threshold: f64,
    /// Keep skipped items in place alongside visited ones
    pub preserve_visited: bool,
    /// Signal the prefetch sink after each reordering
    pub trigger_ai_prefetch: bool,
    /// Background embedding worker threads
    pub embedding_workers: usize,
    /// Seed handed to the clustering routine
    pub cluster_seed: u64,
    /// Upper bound on how long `shutdown` waits for in-flight jobs
    pub shutdown_timeout_ms: u64,
}

impl Default for DiversityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model_name: "hashing".to_string(),
            num_clusters: 10,
            items_per_cluster: 20,
            auto_clusters: true,
            batch_size: 32,
            cache_dir: None,
            recluster_threshold: 1.0,
            preserve_visited: true,
            trigger_ai_prefetch: false,
            embedding_workers: 2,
            cluster_seed: 42,
            shutdown_timeout_ms: 5000,
        }
    }
}

impl DiversityConfig {
    /// Read a JSON configuration file. Missing keys take their default value
    pub fn from_file(path: &Path) -> Result<Self, DiversityError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DiversityError> {
        if !(0.0..=1.0).contains(&self.recluster_threshold) {
            return Err(DiversityError::Config(format!(
                "`recluster_threshold` must be in [0, 1], got {}",
                self.recluster_threshold
            )));
        }
        if self.batch_size == 0 {
            return Err(DiversityError::Config(
                "`batch_size` must be positive".to_string(),
            ));
        }
        if self.auto_clusters && self.items_per_cluster == 0 {
            return Err(DiversityError::Config(
                "`items_per_cluster` must be positive".to_string(),
            ));
        }
        if !self.auto_clusters && self.num_clusters == 0 {
            return Err(DiversityError::Config(
                "`num_clusters` must be positive".to_string(),
            ));
        }
        if self.embedding_workers == 0 {
            return Err(DiversityError::Config(
                "`embedding_workers` must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Live cluster count for `n_items` embedded items
    pub fn cluster_count(&self, n_items: usize) -> usize {
        if n_items == 0 {
            return 0;
        }
        let k = if self.auto_clusters {
            let by_size = n_items / self.items_per_cluster.max(1);
            by_size.min(n_items / 2).max(2)
        } else {
            self.num_clusters
        };
        k.min(n_items)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
