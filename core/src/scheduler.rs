use crate::cluster::ClusterIndex;
use crate::config::DiversityConfig;
use crate::ordering;
use crate::persist::CacheFiles;
use crate::sampling::UserSamplingState;
use crate::store::EmbeddingStore;
use crate::worker::{BackgroundEmbedder, EmbedRequest};
use crate::DiversityError;
use diversity_backend::{init_backends, BackendError, Backends, Embedder, Embedding};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::instrument;

/// Receives the new order of a user's items after each reordering
pub trait PrefetchSink: Send + Sync {
    fn prefetch(&self, user_id: &str, ordered_ids: &[String]);
}

/// Everything guarded by the scheduler lock
#[derive(Debug, Default)]
pub(crate) struct State {
    pub(crate) store: EmbeddingStore,
    pub(crate) index: ClusterIndex,
    pub(crate) users: HashMap<String, UserSamplingState>,
    /// Item ids with a queued or running embedding job
    pub(crate) in_flight: HashSet<String>,
}

impl State {
    /// Run `f` on the user's sampling state, created on first access and
    /// pruned of clusters removed by the last re-partition
    fn with_user<R>(
        &mut self,
        user_id: &str,
        f: impl FnOnce(&ClusterIndex, &mut UserSamplingState) -> R,
    ) -> R {
        let State { index, users, .. } = &mut *self;
        let user = users.entry(user_id.to_string()).or_default();
        user.prune(index.live_cluster_count());
        f(index, user)
    }
}

pub(crate) struct Shared {
    pub(crate) config: DiversityConfig,
    pub(crate) backends: Option<Backends>,
    cache: Option<CacheFiles>,
    state: Mutex<State>,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        // Every critical section leaves the maps consistent, so a panic in
        // another holder does not invalidate the state
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write the cache files, logging failures
    pub(crate) fn persist(&self, state: &State) {
        if let Some(cache) = &self.cache {
            if let Err(err) = cache.save(&state.store, &state.index, &self.config.model_name) {
                let counter = metrics::counter!("di_persist_failure");
                counter.increment(1);
                tracing::error!("Could not persist diversity cache: {err}");
            }
        }
    }

    fn rebuild(&self, state: &mut State, force: bool) -> bool {
        let Some(backends) = &self.backends else {
            return false;
        };
        let State { store, index, .. } = &mut *state;
        let rebuilt = index.rebuild(store, &self.config, backends.clusterer.as_ref(), force);
        if rebuilt {
            self.persist(state);
        }
        rebuilt
    }
}

/// Scheduler statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub enabled: bool,
    pub model_name: String,
    pub backend: Option<String>,
    pub embedded_items: usize,
    pub clustered_items: usize,
    pub live_clusters: usize,
    pub in_flight_jobs: usize,
    pub tracked_users: usize,
}

/// Coverage statistics of one user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserStats {
    pub sampled_clusters: usize,
    pub live_clusters: usize,
    pub coverage: f64,
    pub cursor: usize,
    pub cluster_draw_counts: BTreeMap<usize, u64>,
    pub visited: usize,
    pub skipped: usize,
    pub seconds_since_recluster: Option<f64>,
}

/// Diversity-aware item scheduler.
///
/// One instance is shared by every request handler. All embeddings, cluster
/// labels and per-user sampling states sit behind a single lock; embedding
/// computations run outside of it.
pub struct DiversityScheduler {
    shared: Arc<Shared>,
    workers: Option<BackgroundEmbedder>,
    prefetch: Option<Arc<dyn PrefetchSink>>,
}

impl DiversityScheduler {
    /// Build a scheduler against the built-in backend matching
    /// `config.model_name`. Without one the scheduler runs disabled.
    ///
    /// A recognized model that fails to start is an error.
    pub fn from_config(config: DiversityConfig) -> Result<Self, DiversityError> {
        let backends = if config.enabled {
            match init_backends(&config.model_name) {
                Ok(backends) => Some(backends),
                Err(BackendError::NoBackend) => {
                    tracing::warn!(
                        "Diversity ordering disabled: no backend for `{}`",
                        config.model_name
                    );
                    None
                }
                Err(err) => return Err(err.into()),
            }
        } else {
            None
        };
        Self::new(config, backends)
    }

    /// Build a scheduler and load the cache directory, if any.
    ///
    /// With `backends` unset, or `config.enabled` off, every operation is an
    /// identity or a no-op.
    pub fn new(config: DiversityConfig, backends: Option<Backends>) -> Result<Self, DiversityError> {
        config.validate()?;

        let backends = if config.enabled { backends } else { None };
        let cache = config.cache_dir.as_ref().map(CacheFiles::new);

        let mut state = State::default();
        if let (Some(cache), Some(_)) = (&cache, &backends) {
            let (store, index) = cache.load(&config.model_name);
            state.store = store;
            state.index = index;
        }

        let worker_count = config.embedding_workers;
        let enabled = backends.is_some();
        let shared = Arc::new(Shared {
            config,
            backends,
            cache,
            state: Mutex::new(state),
        });
        let workers = enabled.then(|| BackgroundEmbedder::new(worker_count, shared.clone()));

        tracing::info!(
            "Diversity ordering {}",
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(Self {
            shared,
            workers,
            prefetch: None,
        })
    }

    /// Signal `sink` after every reordering when `trigger_ai_prefetch` is set
    pub fn with_prefetch_sink(mut self, sink: Arc<dyn PrefetchSink>) -> Self {
        self.prefetch = Some(sink);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.backends.is_some()
    }

    pub fn config(&self) -> &DiversityConfig {
        &self.shared.config
    }

    pub fn get(&self, id: &str) -> Option<Embedding> {
        self.shared.lock().store.get(id).cloned()
    }

    /// Embed every item not embedded yet with the configured backend.
    /// Returns the number of vectors computed
    pub fn put_batch(&self, items: &HashMap<String, String>) -> usize {
        let Some(backends) = &self.shared.backends else {
            return 0;
        };
        self.put_batch_with(
            items,
            backends.embedder.as_ref(),
            self.shared.config.batch_size,
        )
    }

    /// Embed every item not embedded yet with `embedder`, `batch_size` texts
    /// per call. Failed batches are logged and skipped
    #[instrument(skip_all, fields(items = items.len()))]
    pub fn put_batch_with(
        &self,
        items: &HashMap<String, String>,
        embedder: &dyn Embedder,
        batch_size: usize,
    ) -> usize {
        if !self.is_enabled() {
            return 0;
        }
        let mut pending: Vec<(&String, &String)> = {
            let state = self.shared.lock();
            items
                .iter()
                .filter(|(id, _)| !state.store.contains(id))
                .collect()
        };
        pending.sort_unstable();

        let mut computed = 0;
        for batch in pending.chunks(batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|(_, text)| (*text).clone()).collect();
            let histogram = metrics::histogram!("di_embed_batch_size");
            histogram.record(batch.len() as f64);
            let vectors = match embedder.embed(&texts) {
                Ok(vectors) if vectors.len() == batch.len() => vectors,
                Ok(vectors) => {
                    let counter = metrics::counter!("di_embed_failure", "err" => "batch");
                    counter.increment(1);
                    tracing::error!(
                        "Embedder returned {} vectors for a batch of {}",
                        vectors.len(),
                        batch.len()
                    );
                    continue;
                }
                Err(err) => {
                    let counter = metrics::counter!("di_embed_failure", "err" => "batch");
                    counter.increment(1);
                    tracing::error!("Embedding batch failed: {err}");
                    continue;
                }
            };

            let mut state = self.shared.lock();
            for ((id, _), vector) in batch.iter().zip(vectors) {
                // a background job may have stored it meanwhile
                if !state.store.contains(id) && state.store.insert((*id).clone(), vector) {
                    computed += 1;
                }
            }
        }

        if computed > 0 {
            let counter = metrics::counter!("di_embed_success");
            counter.increment(computed as u64);
            let state = self.shared.lock();
            self.shared.persist(&state);
        }
        tracing::debug!("Computed {computed} new embeddings");
        computed
    }

    /// Queue an embedding job for `id` with the configured backend
    pub fn start_async(&self, id: &str, text: &str) -> EmbedRequest {
        match &self.shared.backends {
            Some(backends) => self.start_async_with(id, text, backends.embedder.clone()),
            None => EmbedRequest::Rejected,
        }
    }

    /// Queue an embedding job for `id` unless it already has a vector or a job
    pub fn start_async_with(&self, id: &str, text: &str, embedder: Arc<dyn Embedder>) -> EmbedRequest {
        let Some(workers) = &self.workers else {
            return EmbedRequest::Rejected;
        };
        {
            let mut state = self.shared.lock();
            if state.store.contains(id) {
                return EmbedRequest::AlreadyPresent;
            }
            if !state.in_flight.insert(id.to_string()) {
                return EmbedRequest::InFlight;
            }
            let gauge = metrics::gauge!("di_embed_inflight");
            gauge.set(state.in_flight.len() as f64);
        }

        match workers.submit(id, text, embedder) {
            Some(pending) => EmbedRequest::Scheduled(pending),
            None => {
                self.shared.lock().in_flight.remove(id);
                EmbedRequest::Rejected
            }
        }
    }

    /// Replace the in-memory state with the cache files. Missing or corrupt
    /// files give an empty state
    pub fn load(&self) {
        let Some(cache) = &self.shared.cache else {
            return;
        };
        if !self.is_enabled() {
            return;
        }
        let (store, index) = cache.load(&self.shared.config.model_name);
        let mut state = self.shared.lock();
        state.store = store;
        state.index = index;
    }

    pub fn save(&self) -> Result<(), DiversityError> {
        match &self.shared.cache {
            Some(cache) => {
                let state = self.shared.lock();
                cache.save(&state.store, &state.index, &self.shared.config.model_name)
            }
            None => Ok(()),
        }
    }

    /// Drop every vector, cluster label and user coverage, and delete the
    /// cache files
    pub fn clear_cache(&self) -> Result<(), DiversityError> {
        let mut state = self.shared.lock();
        state.store.clear();
        state.index.clear();
        for user in state.users.values_mut() {
            user.sampled_clusters.clear();
            user.cluster_draw_counts.clear();
            user.cursor = 0;
        }
        match &self.shared.cache {
            Some(cache) => cache.remove(),
            None => Ok(()),
        }
    }

    /// Cluster the embedded items. A no-op when clusters exist and `force`
    /// is unset
    #[instrument(skip(self))]
    pub fn rebuild_clusters(&self, force: bool) -> bool {
        let mut state = self.shared.lock();
        self.shared.rebuild(&mut state, force)
    }

    pub fn cluster_of(&self, id: &str) -> Option<usize> {
        self.shared.lock().index.cluster_of(id)
    }

    pub fn members_of(&self, cluster: usize) -> Vec<String> {
        self.shared.lock().index.members_of(cluster).to_vec()
    }

    pub fn live_cluster_count(&self) -> usize {
        self.shared.lock().index.live_cluster_count()
    }

    /// Round-robin pick among `available` clusters for `user_id`
    pub fn next_cluster(&self, user_id: &str, available: &BTreeSet<usize>) -> Option<usize> {
        let mut state = self.shared.lock();
        state.with_user(user_id, |_, user| user.next_cluster(available))
    }

    /// Diversified order of `available` for `user_id`, keeping `preserve`,
    /// visited and (with `preserve_visited`) skipped items in place
    #[instrument(skip_all, fields(user = user_id))]
    pub fn generate(
        &self,
        user_id: &str,
        available: &[String],
        preserve: &HashSet<String>,
    ) -> Vec<String> {
        if !self.is_enabled() {
            return available.to_vec();
        }
        let preserve_skipped = self.shared.config.preserve_visited;
        let mut state = self.shared.lock();
        state.with_user(user_id, |index, user| {
            ordering::generate(index, user, available, preserve, preserve_skipped)
        })
    }

    pub fn should_recluster(&self, user_id: &str) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let mut state = self.shared.lock();
        self.saturated(&mut state, user_id)
    }

    /// Reset `user_id`'s coverage and re-partition every embedded item
    #[instrument(skip(self))]
    pub fn trigger_recluster(&self, user_id: &str) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let mut state = self.shared.lock();
        self.recluster(&mut state, user_id)
    }

    /// Re-partition when `user_id` has saturated the live clusters.
    ///
    /// The check and the re-partition happen under one lock, so concurrent
    /// callers trigger at most one recluster per saturation.
    pub fn maybe_recluster(&self, user_id: &str) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let mut state = self.shared.lock();
        self.saturated(&mut state, user_id) && self.recluster(&mut state, user_id)
    }

    fn saturated(&self, state: &mut State, user_id: &str) -> bool {
        let threshold = self.shared.config.recluster_threshold;
        state.with_user(user_id, |index, user| {
            let live_clusters = index.live_cluster_count();
            let histogram = metrics::histogram!("di_user_coverage");
            histogram.record(user.coverage(live_clusters));
            ordering::should_recluster(user, live_clusters, threshold)
        })
    }

    fn recluster(&self, state: &mut State, user_id: &str) -> bool {
        state.with_user(user_id, |_, user| user.reset_coverage());
        let rebuilt = self.shared.rebuild(state, true);
        if rebuilt {
            let counter = metrics::counter!("di_recluster_count");
            counter.increment(1);
        }
        tracing::info!("Recluster triggered by user `{user_id}`");
        rebuilt
    }

    /// Record a finished annotation: mark the item visited and embed it in
    /// the background if needed
    pub fn on_item_finalized(&self, user_id: &str, id: &str, text: &str) -> EmbedRequest {
        if !self.is_enabled() {
            return EmbedRequest::Rejected;
        }
        {
            let mut state = self.shared.lock();
            state.with_user(user_id, |_, user| user.mark_visited(id));
        }
        self.start_async(id, text)
    }

    pub fn on_item_skipped(&self, user_id: &str, id: &str) {
        if !self.is_enabled() {
            return;
        }
        let mut state = self.shared.lock();
        state.with_user(user_id, |_, user| user.mark_skipped(id));
    }

    /// Host entry point: the order in which `user_id` should see `available`.
    ///
    /// Never fails. When disabled, or on any internal inconsistency, the
    /// input order is returned.
    #[instrument(skip_all, fields(user = user_id))]
    pub fn apply_ordering(
        &self,
        user_id: &str,
        available: &[String],
        annotated: &HashSet<String>,
    ) -> Vec<String> {
        if !self.is_enabled() {
            return available.to_vec();
        }
        // Cluster whatever is embedded on first use
        self.rebuild_clusters(false);

        let ordered = self.generate(user_id, available, annotated);
        if ordered.len() != available.len() {
            tracing::error!(
                "Ordering produced {} items for {} inputs, keeping input order",
                ordered.len(),
                available.len()
            );
            return available.to_vec();
        }
        let counter = metrics::counter!("di_ordering_count");
        counter.increment(1);

        self.maybe_recluster(user_id);

        if self.shared.config.trigger_ai_prefetch {
            if let Some(sink) = &self.prefetch {
                sink.prefetch(user_id, &ordered);
            }
        }
        ordered
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.shared.lock();
        SchedulerStats {
            enabled: self.is_enabled(),
            model_name: self.shared.config.model_name.clone(),
            backend: self
                .shared
                .backends
                .as_ref()
                .map(|backends| backends.kind.to_string()),
            embedded_items: state.store.len(),
            clustered_items: state.index.len(),
            live_clusters: state.index.live_cluster_count(),
            in_flight_jobs: state.in_flight.len(),
            tracked_users: state.users.len(),
        }
    }

    pub fn user_stats(&self, user_id: &str) -> Option<UserStats> {
        let mut state = self.shared.lock();
        if !state.users.contains_key(user_id) {
            return None;
        }
        Some(state.with_user(user_id, |index, user| {
            let live_clusters = index.live_cluster_count();
            UserStats {
                sampled_clusters: user.sampled_clusters.len(),
                live_clusters,
                coverage: user.coverage(live_clusters),
                cursor: user.cursor,
                cluster_draw_counts: user.cluster_draw_counts.clone(),
                visited: user.visited.len(),
                skipped: user.skipped.len(),
                seconds_since_recluster: user
                    .last_recluster_time
                    .map(|time| time.elapsed().as_secs_f64()),
            }
        }))
    }

    /// Forget `user_id`'s sampling state
    pub fn clear_user(&self, user_id: &str) -> bool {
        self.shared.lock().users.remove(user_id).is_some()
    }

    /// Stop the embedding workers, waiting at most `shutdown_timeout_ms`
    pub fn shutdown(&self) {
        if let Some(workers) = &self.workers {
            workers.shutdown(self.shared.config.shutdown_timeout());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diversity_backend::Clusterer;

    fn config() -> DiversityConfig {
        DiversityConfig {
            enabled: true,
            auto_clusters: false,
            num_clusters: 2,
            ..Default::default()
        }
    }

    fn backends() -> Backends {
        let embedder = |texts: &[String]| -> Result<Vec<Embedding>, BackendError> {
            Ok(texts.iter().map(|t| vec![t.len() as f32]).collect())
        };
        let clusterer =
            |vectors: &[Embedding], k: usize, _: u64| -> Result<Vec<usize>, BackendError> {
                Ok(vectors.iter().map(|v| v[0] as usize % k).collect())
            };
        let embedder: Arc<dyn Embedder> = Arc::new(embedder);
        let clusterer: Arc<dyn Clusterer> = Arc::new(clusterer);
        Backends::custom(embedder, clusterer)
    }

    #[test]
    fn test_disabled_without_backends() {
        let scheduler = DiversityScheduler::new(config(), None).unwrap();
        assert!(!scheduler.is_enabled());
        let items = HashMap::from([("a".to_string(), "x".to_string())]);
        assert_eq!(scheduler.put_batch(&items), 0);
        assert!(matches!(
            scheduler.start_async("a", "x"),
            EmbedRequest::Rejected
        ));
        let available = vec!["b".to_string(), "a".to_string()];
        assert_eq!(
            scheduler.apply_ordering("u1", &available, &HashSet::new()),
            available
        );
        assert!(!scheduler.stats().enabled);
    }

    #[test]
    fn test_disabled_by_config() {
        let config = DiversityConfig {
            enabled: false,
            ..config()
        };
        let scheduler = DiversityScheduler::new(config, Some(backends())).unwrap();
        assert!(!scheduler.is_enabled());
        assert!(!scheduler.rebuild_clusters(true));
    }

    #[test]
    fn test_unknown_model_disables() {
        let config = DiversityConfig {
            model_name: "not-a-model".to_string(),
            ..config()
        };
        let scheduler = DiversityScheduler::from_config(config).unwrap();
        assert!(!scheduler.is_enabled());
    }

    #[test]
    fn test_broken_builtin_model_is_an_error() {
        let config = DiversityConfig {
            model_name: "hashing-abc".to_string(),
            ..config()
        };
        let result = DiversityScheduler::from_config(config);
        assert!(matches!(
            result,
            Err(DiversityError::Backend(BackendError::Start(_)))
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = DiversityConfig {
            recluster_threshold: 3.0,
            ..config()
        };
        assert!(DiversityScheduler::new(config, Some(backends())).is_err());
    }

    #[test]
    fn test_user_state_is_pruned_after_repartition() {
        let scheduler = DiversityScheduler::new(config(), Some(backends())).unwrap();
        {
            let mut state = scheduler.shared.lock();
            let user = state.users.entry("u1".to_string()).or_default();
            user.sampled_clusters.insert(5);
            user.cluster_draw_counts.insert(5, 1);
        }
        let stats = scheduler.user_stats("u1").unwrap();
        assert_eq!(stats.sampled_clusters, 0);
        assert!(stats.cluster_draw_counts.is_empty());
        assert!(scheduler.user_stats("nobody").is_none());
        assert!(scheduler.clear_user("u1"));
        assert!(!scheduler.clear_user("u1"));
    }
}
