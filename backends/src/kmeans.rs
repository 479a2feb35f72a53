use diversity_backend_core::{BackendError, Clusterer, Embedding};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Lloyd's k-means with k-means++ seeding over squared euclidean distance
#[derive(Debug, Clone)]
pub struct KMeansClusterer {
    pub max_iters: usize,
}

impl Default for KMeansClusterer {
    fn default() -> Self {
        Self { max_iters: 100 }
    }
}

impl Clusterer for KMeansClusterer {
    fn cluster(
        &self,
        vectors: &[Embedding],
        k: usize,
        seed: u64,
    ) -> Result<Vec<usize>, BackendError> {
        if vectors.is_empty() {
            return Err(BackendError::Clustering("no vectors to cluster".to_string()));
        }
        if k == 0 || k > vectors.len() {
            return Err(BackendError::Clustering(format!(
                "cannot build {k} clusters over {} vectors",
                vectors.len()
            )));
        }
        let dim = vectors[0].len();
        if vectors.iter().any(|v| v.len() != dim) {
            return Err(BackendError::Clustering(
                "vectors have mixed dimensions".to_string(),
            ));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut centroids = init_kmeans_pp(vectors, k, &mut rng);
        let mut labels = vec![usize::MAX; vectors.len()];

        for _ in 0..self.max_iters.max(1) {
            let mut changed = false;
            for (label, vector) in labels.iter_mut().zip(vectors) {
                let nearest = nearest_centroid(&centroids, vector);
                if *label != nearest {
                    *label = nearest;
                    changed = true;
                }
            }
            if !changed {
                break;
            }

            let mut sums = vec![vec![0.0f32; dim]; centroids.len()];
            let mut counts = vec![0usize; centroids.len()];
            for (label, vector) in labels.iter().zip(vectors) {
                counts[*label] += 1;
                for (dst, src) in sums[*label].iter_mut().zip(vector) {
                    *dst += *src;
                }
            }
            for (idx, (sum, count)) in sums.into_iter().zip(counts).enumerate() {
                // Empty clusters keep their previous centroid
                if count == 0 {
                    continue;
                }
                let inv = 1.0 / count as f32;
                centroids[idx] = sum.into_iter().map(|v| v * inv).collect();
            }
        }

        Ok(labels)
    }

    fn name(&self) -> &str {
        "kmeans"
    }
}

fn init_kmeans_pp(vectors: &[Embedding], k: usize, rng: &mut StdRng) -> Vec<Embedding> {
    let mut centroids = Vec::with_capacity(k);
    centroids.push(vectors[rng.gen_range(0..vectors.len())].clone());

    while centroids.len() < k {
        let weights: Vec<f32> = vectors
            .iter()
            .map(|v| {
                centroids
                    .iter()
                    .map(|c| squared_distance(c, v))
                    .fold(f32::MAX, f32::min)
            })
            .collect();
        let total: f32 = weights.iter().sum();
        // All remaining points coincide with a centroid
        if total <= f32::EPSILON {
            break;
        }

        let mut target = rng.gen::<f32>() * total;
        let mut chosen = vectors.len() - 1;
        for (idx, weight) in weights.iter().enumerate() {
            target -= *weight;
            if target <= 0.0 && *weight > 0.0 {
                chosen = idx;
                break;
            }
        }
        centroids.push(vectors[chosen].clone());
    }
    centroids
}

fn nearest_centroid(centroids: &[Embedding], vector: &[f32]) -> usize {
    let mut best_idx = 0;
    let mut best = f32::MAX;
    for (idx, centroid) in centroids.iter().enumerate() {
        let distance = squared_distance(centroid, vector);
        if distance < best {
            best = distance;
            best_idx = idx;
        }
    }
    best_idx
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}
