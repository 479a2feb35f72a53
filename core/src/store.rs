use diversity_backend::Embedding;
use std::collections::HashMap;

/// In-memory map from item id to its embedding vector.
///
/// All vectors share one dimension, fixed by the first vector stored.
#[derive(Debug, Default, Clone)]
pub struct EmbeddingStore {
    vectors: HashMap<String, Embedding>,
    dim: Option<usize>,
}

impl EmbeddingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Embedding> {
        self.vectors.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.vectors.contains_key(id)
    }

    /// Store `vector` for `id`, replacing any previous vector.
    ///
    /// Returns `false` and leaves the store untouched when the dimension does
    /// not match the vectors already stored.
    pub fn insert(&mut self, id: String, vector: Embedding) -> bool {
        match self.dim {
            Some(dim) if dim != vector.len() => {
                tracing::warn!(
                    "Rejecting embedding for `{id}`: dimension {} does not match {dim}",
                    vector.len()
                );
                return false;
            }
            None if vector.is_empty() => {
                tracing::warn!("Rejecting empty embedding for `{id}`");
                return false;
            }
            _ => {}
        }
        self.dim = Some(vector.len());
        self.vectors.insert(id, vector);
        true
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn dim(&self) -> Option<usize> {
        self.dim
    }

    /// Ids in lexical order, paired with their vectors
    pub fn sorted(&self) -> Vec<(&String, &Embedding)> {
        let mut entries: Vec<_> = self.vectors.iter().collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
        entries
    }

    pub fn clear(&mut self) {
        self.vectors.clear();
        self.dim = None;
    }
}
