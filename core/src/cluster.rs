use crate::config::DiversityConfig;
use crate::store::EmbeddingStore;
use diversity_backend::Clusterer;
use nohash_hasher::IntMap;
use std::collections::HashMap;
use std::time::Instant;

/// Partition of the embedded items into clusters.
///
/// `labels` (item -> cluster) and `members` (cluster -> items) are always
/// replaced together, so every labelled item appears in exactly one members
/// list and that list matches its label.
#[derive(Debug, Default, Clone)]
pub struct ClusterIndex {
    labels: HashMap<String, usize>,
    members: IntMap<usize, Vec<String>>,
    num_clusters: usize,
}

impl ClusterIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild an index from persisted labels.
    ///
    /// Labels for items without a vector, or outside `[0, num_clusters)`, are
    /// dropped.
    pub fn from_labels(
        labels: HashMap<String, usize>,
        num_clusters: usize,
        store: &EmbeddingStore,
    ) -> Self {
        let total = labels.len();
        let mut ids: Vec<(String, usize)> = labels
            .into_iter()
            .filter(|(id, cluster)| *cluster < num_clusters && store.contains(id))
            .collect();
        ids.sort_unstable();

        if ids.len() < total {
            tracing::warn!(
                "Dropped {} stale cluster labels on load",
                total - ids.len()
            );
        }
        if ids.is_empty() {
            return Self::default();
        }

        let mut index = Self {
            num_clusters,
            ..Default::default()
        };
        index.install(ids);
        index
    }

    /// Whether an assignment exists
    pub fn is_built(&self) -> bool {
        !self.labels.is_empty()
    }

    /// Partition every embedded item with `clusterer`.
    ///
    /// A no-op returning `false` when an assignment exists and `force` is
    /// unset, or when nothing is embedded. Clusterer failures keep the previous
    /// assignment and return `false`.
    pub fn rebuild(
        &mut self,
        store: &EmbeddingStore,
        config: &DiversityConfig,
        clusterer: &dyn Clusterer,
        force: bool,
    ) -> bool {
        if self.is_built() && !force {
            return false;
        }
        if store.is_empty() {
            tracing::debug!("No embedded items to cluster");
            return false;
        }

        let start = Instant::now();
        let (ids, vectors): (Vec<&String>, Vec<_>) = store
            .sorted()
            .into_iter()
            .map(|(id, vector)| (id, vector.clone()))
            .unzip();
        let k = config.cluster_count(ids.len());

        let labels = match clusterer.cluster(&vectors, k, config.cluster_seed) {
            Ok(labels) => labels,
            Err(err) => {
                let counter = metrics::counter!("di_cluster_failure");
                counter.increment(1);
                tracing::error!("Clustering failed, keeping previous assignment: {err}");
                return false;
            }
        };
        if labels.len() != ids.len() {
            let counter = metrics::counter!("di_cluster_failure");
            counter.increment(1);
            tracing::error!(
                "Clusterer returned {} labels for {} items, keeping previous assignment",
                labels.len(),
                ids.len()
            );
            return false;
        }
        if let Some(label) = labels.iter().find(|label| **label >= k) {
            let counter = metrics::counter!("di_cluster_failure");
            counter.increment(1);
            tracing::error!("Clusterer returned label {label} outside [0, {k}), keeping previous assignment");
            return false;
        }

        self.num_clusters = k;
        self.install(ids.into_iter().cloned().zip(labels).collect());

        let histogram = metrics::histogram!("di_cluster_duration");
        histogram.record(start.elapsed().as_secs_f64());
        let gauge = metrics::gauge!("di_live_clusters");
        gauge.set(k as f64);
        tracing::info!(
            "Clustered {} items into {k} clusters in {:?}",
            self.labels.len(),
            start.elapsed()
        );
        true
    }

    // `assignments` must already be sorted by id
    fn install(&mut self, assignments: Vec<(String, usize)>) {
        let mut labels = HashMap::with_capacity(assignments.len());
        let mut members: IntMap<usize, Vec<String>> = IntMap::default();
        for (id, cluster) in assignments {
            members.entry(cluster).or_default().push(id.clone());
            labels.insert(id, cluster);
        }
        self.labels = labels;
        self.members = members;
    }

    pub fn cluster_of(&self, id: &str) -> Option<usize> {
        self.labels.get(id).copied()
    }

    /// Items of `cluster`, in lexical order
    pub fn members_of(&self, cluster: usize) -> &[String] {
        self.members
            .get(&cluster)
            .map(|members| members.as_slice())
            .unwrap_or(&[])
    }

    pub fn live_cluster_count(&self) -> usize {
        if self.is_built() {
            self.num_clusters
        } else {
            0
        }
    }

    pub fn labels(&self) -> &HashMap<String, usize> {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn clear(&mut self) {
        self.labels.clear();
        self.members.clear();
        self.num_clusters = 0;
    }
}
