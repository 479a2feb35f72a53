use crate::cluster::ClusterIndex;
use crate::store::EmbeddingStore;
use crate::DiversityError;
use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::instrument;

pub const VECTORS_FILE: &str = "embeddings.safetensors";
pub const LABELS_FILE: &str = "cluster_labels.json";

const FORMAT_VERSION: u32 = 1;
const TENSOR_NAME: &str = "embeddings";

/// Human readable cluster label file
#[derive(Debug, Serialize, Deserialize)]
struct LabelFile {
    format_version: u32,
    num_clusters: usize,
    labels: BTreeMap<String, usize>,
}

/// The two cache artifacts under one directory
#[derive(Debug, Clone)]
pub struct CacheFiles {
    dir: PathBuf,
}

impl CacheFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn vectors_path(&self) -> PathBuf {
        self.dir.join(VECTORS_FILE)
    }

    pub fn labels_path(&self) -> PathBuf {
        self.dir.join(LABELS_FILE)
    }

    #[instrument(skip_all)]
    pub fn save(
        &self,
        store: &EmbeddingStore,
        index: &ClusterIndex,
        model_name: &str,
    ) -> Result<(), DiversityError> {
        std::fs::create_dir_all(&self.dir)?;

        let entries = store.sorted();
        let ids: Vec<&String> = entries.iter().map(|(id, _)| *id).collect();
        let dim = store.dim().unwrap_or(0);
        let data: Vec<u8> = entries
            .iter()
            .flat_map(|(_, vector)| vector.iter().flat_map(|v| v.to_le_bytes()))
            .collect();

        let metadata = Some(HashMap::from([
            ("format_version".to_string(), FORMAT_VERSION.to_string()),
            ("model_name".to_string(), model_name.to_string()),
            ("ids".to_string(), serde_json::to_string(&ids)?),
        ]));

        let mut tensors = Vec::new();
        if !ids.is_empty() {
            let view = TensorView::new(Dtype::F32, vec![ids.len(), dim], &data)
                .map_err(|err| DiversityError::Format(err.to_string()))?;
            tensors.push((TENSOR_NAME, view));
        }
        let bytes = safetensors::serialize(
            tensors.iter().map(|(name, view)| (*name, view)),
            &metadata,
        )
        .map_err(|err| DiversityError::Format(err.to_string()))?;
        write_atomic(&self.vectors_path(), &bytes)?;

        let labels = LabelFile {
            format_version: FORMAT_VERSION,
            num_clusters: index.live_cluster_count(),
            labels: index
                .labels()
                .iter()
                .map(|(id, cluster)| (id.clone(), *cluster))
                .collect(),
        };
        write_atomic(
            &self.labels_path(),
            serde_json::to_string_pretty(&labels)?.as_bytes(),
        )?;

        tracing::debug!("Saved {} embeddings to {:?}", ids.len(), self.dir);
        Ok(())
    }

    /// Load both artifacts. Missing or unreadable files give empty state
    #[instrument(skip_all)]
    pub fn load(&self, model_name: &str) -> (EmbeddingStore, ClusterIndex) {
        let store = match self.load_vectors(model_name) {
            Ok(Some(store)) => store,
            Ok(None) => return (EmbeddingStore::new(), ClusterIndex::new()),
            Err(err) => {
                tracing::warn!("Ignoring embedding cache {:?}: {err}", self.vectors_path());
                return (EmbeddingStore::new(), ClusterIndex::new());
            }
        };

        let index = match self.load_labels() {
            Ok(Some(file)) => {
                let labels = file.labels.into_iter().collect();
                ClusterIndex::from_labels(labels, file.num_clusters, &store)
            }
            Ok(None) => ClusterIndex::new(),
            Err(err) => {
                tracing::warn!("Ignoring cluster labels {:?}: {err}", self.labels_path());
                ClusterIndex::new()
            }
        };

        tracing::info!(
            "Loaded {} embeddings and {} cluster labels from {:?}",
            store.len(),
            index.len(),
            self.dir
        );
        (store, index)
    }

    fn load_vectors(&self, model_name: &str) -> Result<Option<EmbeddingStore>, DiversityError> {
        let path = self.vectors_path();
        if !path.exists() {
            return Ok(None);
        }
        let buffer = std::fs::read(&path)?;

        let (_, header) = SafeTensors::read_metadata(&buffer)
            .map_err(|err| DiversityError::Format(err.to_string()))?;
        let metadata = header
            .metadata()
            .as_ref()
            .ok_or_else(|| DiversityError::Format("missing header metadata".to_string()))?;

        let version = metadata.get("format_version").map(String::as_str);
        if version != Some(FORMAT_VERSION.to_string().as_str()) {
            return Err(DiversityError::Format(format!(
                "unsupported format version {version:?}"
            )));
        }
        let stored_model = metadata.get("model_name").map(String::as_str);
        if stored_model != Some(model_name) {
            tracing::warn!(
                "Embedding cache was built with {stored_model:?}, expected `{model_name}`. Starting empty"
            );
            return Ok(None);
        }
        let ids: Vec<String> = serde_json::from_str(
            metadata
                .get("ids")
                .ok_or_else(|| DiversityError::Format("missing `ids` metadata".to_string()))?,
        )?;

        let mut store = EmbeddingStore::new();
        if ids.is_empty() {
            return Ok(Some(store));
        }

        let tensors = SafeTensors::deserialize(&buffer)
            .map_err(|err| DiversityError::Format(err.to_string()))?;
        let tensor = tensors
            .tensor(TENSOR_NAME)
            .map_err(|err| DiversityError::Format(err.to_string()))?;
        let shape = tensor.shape();
        if tensor.dtype() != Dtype::F32 || shape.len() != 2 || shape[0] != ids.len() || shape[1] == 0 {
            return Err(DiversityError::Format(format!(
                "unexpected tensor {:?} {shape:?} for {} ids",
                tensor.dtype(),
                ids.len()
            )));
        }

        let values: Vec<f32> = tensor
            .data()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        for (id, vector) in ids.into_iter().zip(values.chunks(shape[1])) {
            store.insert(id, vector.to_vec());
        }
        Ok(Some(store))
    }

    fn load_labels(&self) -> Result<Option<LabelFile>, DiversityError> {
        let path = self.labels_path();
        if !path.exists() {
            return Ok(None);
        }
        let file: LabelFile = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        if file.format_version != FORMAT_VERSION {
            return Err(DiversityError::Format(format!(
                "unsupported format version {}",
                file.format_version
            )));
        }
        Ok(Some(file))
    }

    /// Delete both artifacts, ignoring files that do not exist
    pub fn remove(&self) -> Result<(), DiversityError> {
        for path in [self.vectors_path(), self.labels_path()] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), DiversityError> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
