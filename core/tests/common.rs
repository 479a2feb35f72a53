#![allow(dead_code)]

use diversity_core::{
    BackendError, Backends, Clusterer, DiversityConfig, DiversityScheduler, Embedder, Embedding,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Embeds `"<n>"` or `"<n>:<anything>"` as `[n, 1.0]`. Texts starting with
/// `fail` make the whole batch fail
#[derive(Default)]
pub struct TableEmbedder {
    pub batches: Mutex<Vec<usize>>,
    pub gate_closed: AtomicBool,
    pub calls: AtomicUsize,
}

impl TableEmbedder {
    pub fn gated() -> Self {
        Self {
            gate_closed: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub fn open_gate(&self) {
        self.gate_closed.store(false, Ordering::SeqCst);
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().clone()
    }
}

impl Embedder for TableEmbedder {
    fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        while self.gate_closed.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
        self.batches.lock().unwrap().push(texts.len());
        if texts.iter().any(|t| t.starts_with("fail")) {
            return Err(BackendError::Inference("refusing to embed".to_string()));
        }
        Ok(texts
            .iter()
            .map(|t| {
                let head = t.split(':').next().unwrap_or_default();
                vec![head.parse::<f32>().unwrap_or(t.len() as f32), 1.0]
            })
            .collect())
    }

    fn model_name(&self) -> &str {
        "table"
    }
}

/// Labels each vector with its first component modulo `k`. Fails on demand
#[derive(Default)]
pub struct LabelClusterer {
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
}

impl Clusterer for LabelClusterer {
    fn cluster(
        &self,
        vectors: &[Embedding],
        k: usize,
        _seed: u64,
    ) -> Result<Vec<usize>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(BackendError::Clustering("induced failure".to_string()));
        }
        Ok(vectors.iter().map(|v| v[0] as usize % k).collect())
    }
}

pub struct Harness {
    pub scheduler: DiversityScheduler,
    pub embedder: Arc<TableEmbedder>,
    pub clusterer: Arc<LabelClusterer>,
}

pub fn config(num_clusters: usize) -> DiversityConfig {
    DiversityConfig {
        enabled: true,
        model_name: "table".to_string(),
        auto_clusters: false,
        num_clusters,
        batch_size: 2,
        ..Default::default()
    }
}

pub fn harness(config: DiversityConfig) -> Harness {
    harness_with(config, TableEmbedder::default())
}

pub fn harness_with(config: DiversityConfig, embedder: TableEmbedder) -> Harness {
    let embedder = Arc::new(embedder);
    let clusterer = Arc::new(LabelClusterer::default());
    let backends = Backends::custom(embedder.clone(), clusterer.clone());
    let scheduler = DiversityScheduler::new(config, Some(backends)).unwrap();
    Harness {
        scheduler,
        embedder,
        clusterer,
    }
}

pub fn cache_config(num_clusters: usize, dir: PathBuf) -> DiversityConfig {
    DiversityConfig {
        cache_dir: Some(dir),
        ..config(num_clusters)
    }
}

pub fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

pub fn items(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(id, text)| (id.to_string(), text.to_string()))
        .collect()
}

/// a,b -> 0, c,d -> 1, e,f -> 2
pub fn six_items() -> HashMap<String, String> {
    items(&[
        ("a", "0:first"),
        ("b", "0:second"),
        ("c", "1:first"),
        ("d", "1:second"),
        ("e", "2:first"),
        ("f", "2:second"),
    ])
}

pub fn sorted(mut values: Vec<String>) -> Vec<String> {
    values.sort();
    values
}
