use diversity_backend_core::{BackendError, Embedder, Embedding};

/// Feature-hashing bag-of-words embedder.
///
/// Every lowercased alphanumeric token is hashed with FNV-1a into one of `dim`
/// buckets with a hash-derived sign, and the result is L2-normalized. The
/// output is stable across processes, so persisted vectors stay valid.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
    model_name: String,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Result<Self, BackendError> {
        if dim == 0 {
            return Err(BackendError::Start(
                "hashing dimension must be positive".to_string(),
            ));
        }
        Ok(Self {
            dim,
            model_name: format!("hashing-{dim}"),
        })
    }

    fn embed_one(&self, text: &str) -> Embedding {
        let mut vector = vec![0.0f32; self.dim];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let hash = fnv1a64(token.to_lowercase().as_bytes());
            let bucket = (hash % self.dim as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }
        vector
    }
}

impl Embedder for HashingEmbedder {
    fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>, BackendError> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
