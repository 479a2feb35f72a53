use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Instant;

/// Round-robin progress of one user over the live clusters
#[derive(Debug, Default, Clone)]
pub struct UserSamplingState {
    /// Clusters drawn from since the last reset
    pub sampled_clusters: BTreeSet<usize>,
    pub cluster_draw_counts: BTreeMap<usize, u64>,
    /// Position in the sorted list of available clusters
    pub cursor: usize,
    pub visited: HashSet<String>,
    pub skipped: HashSet<String>,
    pub last_recluster_time: Option<Instant>,
}

impl UserSamplingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the next cluster in round-robin order.
    ///
    /// Clusters are visited in ascending id order starting at the cursor, so
    /// with an unchanged `available` set every cluster is drawn once before
    /// any is drawn again.
    pub fn next_cluster(&mut self, available: &BTreeSet<usize>) -> Option<usize> {
        if available.is_empty() {
            return None;
        }
        let sequence: Vec<usize> = available.iter().copied().collect();
        let len = sequence.len();
        let start = self.cursor % len;

        // Every candidate is available today; the scan keeps the contract if
        // candidates are ever filtered here
        let chosen = (0..len)
            .map(|offset| sequence[(start + offset) % len])
            .find(|cluster| available.contains(cluster))?;

        self.cursor = (self.cursor + 1) % len;
        self.sampled_clusters.insert(chosen);
        *self.cluster_draw_counts.entry(chosen).or_insert(0) += 1;
        Some(chosen)
    }

    /// Forget clusters that no longer exist after a re-partition
    pub fn prune(&mut self, live_clusters: usize) {
        self.sampled_clusters.retain(|cluster| *cluster < live_clusters);
        self.cluster_draw_counts
            .retain(|cluster, _| *cluster < live_clusters);
    }

    /// Fraction of the live clusters drawn from since the last reset
    pub fn coverage(&self, live_clusters: usize) -> f64 {
        if live_clusters == 0 {
            return 0.0;
        }
        self.sampled_clusters.len() as f64 / live_clusters as f64
    }

    pub fn reset_coverage(&mut self) {
        self.sampled_clusters.clear();
        self.cluster_draw_counts.clear();
        self.cursor = 0;
        self.last_recluster_time = Some(Instant::now());
    }

    pub fn mark_visited(&mut self, id: &str) {
        self.visited.insert(id.to_string());
    }

    pub fn mark_skipped(&mut self, id: &str) {
        self.skipped.insert(id.to_string());
    }
}
