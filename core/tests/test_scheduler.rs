mod common;

use crate::common::{
    cache_config, config, harness, harness_with, ids, items, six_items, sorted, TableEmbedder,
};
use anyhow::Result;
use diversity_backend::init_backends;
use diversity_core::{
    BackendError, Backends, Clusterer, DiversityConfig, DiversityScheduler, EmbedRequest, Embedder,
    Embedding, PrefetchSink,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

#[test]
fn test_put_batch_is_idempotent() {
    let h = harness(config(3));
    let items = six_items();
    assert_eq!(h.scheduler.put_batch(&items), 6);
    assert_eq!(h.scheduler.put_batch(&items), 0);
    assert_eq!(h.embedder.calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.scheduler.get("c"), Some(vec![1.0, 1.0]));
    assert_eq!(h.scheduler.get("z"), None);
}

#[test]
fn test_put_batch_keeps_batch_boundaries() {
    let h = harness(config(3));
    let items = items(&[("a", "0"), ("b", "1"), ("c", "2"), ("d", "0"), ("e", "1")]);
    assert_eq!(h.scheduler.put_batch(&items), 5);
    assert_eq!(h.embedder.batch_sizes(), vec![2, 2, 1]);
}

#[test]
fn test_put_batch_skips_failed_batches() {
    let h = harness(config(3));
    // sorted ids: a b | c d | e -> the middle batch fails
    let batch = items(&[("a", "0"), ("b", "1"), ("c", "fail"), ("d", "0"), ("e", "1")]);
    assert_eq!(h.scheduler.put_batch(&batch), 3);
    assert_eq!(h.scheduler.get("c"), None);
    assert_eq!(h.scheduler.get("d"), None);
    assert!(h.scheduler.get("e").is_some());

    // failed items are retried on the next call
    let retry = items(&[("c", "2"), ("d", "0")]);
    assert_eq!(h.scheduler.put_batch(&retry), 2);
}

#[test]
fn test_start_async_is_single_flight() {
    let h = harness_with(config(3), TableEmbedder::gated());

    let pending = match h.scheduler.start_async("a", "0") {
        EmbedRequest::Scheduled(pending) => pending,
        other => panic!("expected a scheduled job, got {other:?}"),
    };
    assert_eq!(pending.id(), "a");
    assert!(matches!(
        h.scheduler.start_async("a", "0"),
        EmbedRequest::InFlight
    ));
    assert_eq!(h.scheduler.stats().in_flight_jobs, 1);

    h.embedder.open_gate();
    assert!(pending.wait());
    assert_eq!(h.scheduler.get("a"), Some(vec![0.0, 1.0]));
    assert!(matches!(
        h.scheduler.start_async("a", "0"),
        EmbedRequest::AlreadyPresent
    ));
    assert_eq!(h.scheduler.stats().in_flight_jobs, 0);
    assert_eq!(h.embedder.calls.load(Ordering::SeqCst), 1);
    h.scheduler.shutdown();
}

#[test]
fn test_failed_async_job_is_retryable() {
    let h = harness(config(3));
    let EmbedRequest::Scheduled(pending) = h.scheduler.start_async("a", "fail") else {
        panic!("expected a scheduled job");
    };
    assert!(!pending.wait());
    assert_eq!(h.scheduler.get("a"), None);

    let EmbedRequest::Scheduled(pending) = h.scheduler.start_async("a", "1") else {
        panic!("expected a scheduled job");
    };
    assert!(pending.wait());
    assert_eq!(h.scheduler.get("a"), Some(vec![1.0, 1.0]));
    h.scheduler.shutdown();
}

#[test]
fn test_panicking_embedder_releases_the_item() {
    let embedder = |texts: &[String]| -> Result<Vec<Embedding>, BackendError> {
        if texts.iter().any(|t| t == "boom") {
            panic!("embedder crashed");
        }
        Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
    };
    let clusterer =
        |vectors: &[Embedding], _k: usize, _seed: u64| -> Result<Vec<usize>, BackendError> {
            Ok(vec![0; vectors.len()])
        };
    let embedder: Arc<dyn Embedder> = Arc::new(embedder);
    let clusterer: Arc<dyn Clusterer> = Arc::new(clusterer);
    let config = DiversityConfig {
        embedding_workers: 1,
        ..config(1)
    };
    let scheduler =
        DiversityScheduler::new(config, Some(Backends::custom(embedder, clusterer))).unwrap();

    let EmbedRequest::Scheduled(pending) = scheduler.start_async("a", "boom") else {
        panic!("expected a scheduled job");
    };
    assert!(!pending.wait());
    assert_eq!(scheduler.stats().in_flight_jobs, 0);

    // the single worker survived and the item can be retried
    let retry = scheduler.start_async("a", "fine");
    assert!(retry.is_scheduled());
    let EmbedRequest::Scheduled(pending) = retry else {
        unreachable!();
    };
    assert!(pending.wait());
    assert_eq!(scheduler.get("a"), Some(vec![1.0, 0.0]));
    scheduler.shutdown();
}

#[test]
fn test_shutdown_is_bounded() {
    let config = DiversityConfig {
        shutdown_timeout_ms: 50,
        ..config(3)
    };
    let h = harness_with(config, TableEmbedder::gated());
    let EmbedRequest::Scheduled(_pending) = h.scheduler.start_async("a", "0") else {
        panic!("expected a scheduled job");
    };
    while h.embedder.calls.load(Ordering::SeqCst) == 0 {
        std::thread::sleep(Duration::from_millis(1));
    }

    let start = Instant::now();
    h.scheduler.shutdown();
    assert!(start.elapsed() < Duration::from_secs(2));

    // the queue is closed; the stuck job still holds its slot
    assert!(matches!(
        h.scheduler.start_async("b", "1"),
        EmbedRequest::Rejected
    ));
    assert_eq!(h.scheduler.stats().in_flight_jobs, 1);
    h.embedder.open_gate();
}

#[test]
fn test_full_queue_rejects_and_releases_slot() {
    let config = DiversityConfig {
        embedding_workers: 1,
        ..config(3)
    };
    let h = harness_with(config, TableEmbedder::gated());

    let mut pending = Vec::new();
    let EmbedRequest::Scheduled(first) = h.scheduler.start_async("job-000", "0") else {
        panic!("expected a scheduled job");
    };
    pending.push(first);
    // wait for the worker to take the first job off the queue
    while h.embedder.calls.load(Ordering::SeqCst) == 0 {
        std::thread::sleep(Duration::from_millis(1));
    }

    // one worker gives a queue of 64 jobs
    for i in 1..=64 {
        match h.scheduler.start_async(&format!("job-{i:03}"), "1") {
            EmbedRequest::Scheduled(job) => pending.push(job),
            other => panic!("job {i} was not queued: {other:?}"),
        }
    }
    assert_eq!(h.scheduler.stats().in_flight_jobs, 65);

    assert!(matches!(
        h.scheduler.start_async("overflow", "2"),
        EmbedRequest::Rejected
    ));
    assert_eq!(h.scheduler.stats().in_flight_jobs, 65);

    h.embedder.open_gate();
    assert!(pending.into_iter().all(|job| job.wait()));
    assert_eq!(h.scheduler.stats().in_flight_jobs, 0);

    // the rejected item was released and can be queued now
    let EmbedRequest::Scheduled(job) = h.scheduler.start_async("overflow", "2") else {
        panic!("expected a scheduled job");
    };
    assert!(job.wait());
    h.scheduler.shutdown();
}

#[test]
fn test_concurrent_maybe_recluster_fires_once() {
    let h = harness(config(3));
    h.scheduler.put_batch(&six_items());
    assert!(h.scheduler.rebuild_clusters(false));
    assert!(!h.scheduler.maybe_recluster("u1"));

    let available = BTreeSet::from([0, 1, 2]);
    for _ in 0..3 {
        h.scheduler.next_cluster("u1", &available);
    }

    let scheduler = Arc::new(h.scheduler);
    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let scheduler = scheduler.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                scheduler.maybe_recluster("u1")
            })
        })
        .collect();
    let fired = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .filter(|fired| *fired)
        .count();

    assert_eq!(fired, 1);
    assert_eq!(h.clusterer.calls.load(Ordering::SeqCst), 2);
    assert!(!scheduler.should_recluster("u1"));
}

#[test]
fn test_round_robin_fairness() {
    let h = harness(config(3));
    let available = BTreeSet::from([0, 1, 2]);
    let draws: Vec<usize> = (0..6)
        .map(|_| h.scheduler.next_cluster("u1", &available).unwrap())
        .collect();

    let first_round: BTreeSet<usize> = draws[..3].iter().copied().collect();
    assert_eq!(first_round, available);
    for cluster in 0..3 {
        assert_eq!(draws.iter().filter(|c| **c == cluster).count(), 2);
    }
    assert_eq!(h.scheduler.next_cluster("u1", &BTreeSet::new()), None);
}

#[test]
fn test_recluster_threshold_boundary() {
    let h = harness(config(3));
    h.scheduler.put_batch(&six_items());
    assert!(h.scheduler.rebuild_clusters(false));
    assert_eq!(h.scheduler.live_cluster_count(), 3);

    let available = BTreeSet::from([0, 1, 2]);
    h.scheduler.next_cluster("u1", &available);
    h.scheduler.next_cluster("u1", &available);
    assert!(!h.scheduler.should_recluster("u1"));
    h.scheduler.next_cluster("u1", &available);
    assert!(h.scheduler.should_recluster("u1"));

    assert!(h.scheduler.trigger_recluster("u1"));
    assert!(!h.scheduler.should_recluster("u1"));
    let stats = h.scheduler.user_stats("u1").unwrap();
    assert_eq!(stats.sampled_clusters, 0);
    assert_eq!(stats.cursor, 0);
    assert!(stats.seconds_since_recluster.is_some());
    assert_eq!(h.clusterer.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_scenario_diverse_heads() {
    let h = harness(config(3));
    h.scheduler.put_batch(&six_items());
    h.scheduler.rebuild_clusters(false);

    let mut available = ids(&["a", "b", "c", "d", "e", "f"]);
    let first = h.scheduler.generate("u1", &available, &HashSet::new());
    let heads: BTreeSet<usize> = first
        .iter()
        .take(3)
        .filter_map(|id| h.scheduler.cluster_of(id))
        .collect();
    assert_eq!(heads.len(), 3);

    let mut order = first;
    while !available.is_empty() {
        assert_eq!(sorted(order.clone()), sorted(available.clone()));
        let head = order[0].clone();
        available.retain(|id| *id != head);
        order = h.scheduler.generate("u1", &available, &HashSet::new());
    }
}

#[test]
fn test_generate_preserves_length_and_positions() {
    let h = harness(config(3));
    h.scheduler.put_batch(&six_items());
    h.scheduler.rebuild_clusters(false);

    let universe = ids(&["a", "b", "c", "d", "e", "f", "x", "y"]);
    for rotation in 0..universe.len() {
        let mut available = universe.clone();
        available.rotate_left(rotation);
        for mask in 0u32..16 {
            let preserve: HashSet<String> = available
                .iter()
                .enumerate()
                .filter(|(idx, _)| mask & (1 << (idx % 4)) != 0 && idx % 3 == 0)
                .map(|(_, id)| id.clone())
                .collect();
            let out = h
                .scheduler
                .generate(&format!("user-{rotation}"), &available, &preserve);
            assert_eq!(sorted(out.clone()), sorted(available.clone()));
            for (idx, id) in available.iter().enumerate() {
                if preserve.contains(id) {
                    assert_eq!(out[idx], *id);
                }
            }
        }
    }
}

#[test]
fn test_finalized_items_stay_in_place() {
    let h = harness(config(3));
    h.scheduler.put_batch(&six_items());
    h.scheduler.rebuild_clusters(false);

    assert!(matches!(
        h.scheduler.on_item_finalized("u1", "b", "0:second"),
        EmbedRequest::AlreadyPresent
    ));
    h.scheduler.on_item_skipped("u1", "e");

    let available = ids(&["a", "b", "c", "d", "e", "f"]);
    let out = h.scheduler.generate("u1", &available, &HashSet::new());
    assert_eq!(out[1], "b");
    assert_eq!(out[4], "e");

    let stats = h.scheduler.user_stats("u1").unwrap();
    assert_eq!(stats.visited, 1);
    assert_eq!(stats.skipped, 1);
}

#[test]
fn test_finalized_new_item_is_embedded() {
    let h = harness(config(3));
    let EmbedRequest::Scheduled(pending) = h.scheduler.on_item_finalized("u1", "new", "2:text")
    else {
        panic!("expected a scheduled job");
    };
    assert!(pending.wait());
    assert_eq!(h.scheduler.get("new"), Some(vec![2.0, 1.0]));
    h.scheduler.shutdown();
}

#[test]
fn test_clustering_failure_keeps_previous_assignment() {
    let h = harness(config(3));
    h.scheduler.put_batch(&six_items());
    assert!(h.scheduler.rebuild_clusters(false));
    let before: Vec<Option<usize>> = ["a", "c", "e"]
        .iter()
        .map(|id| h.scheduler.cluster_of(id))
        .collect();

    h.clusterer.fail.store(true, Ordering::SeqCst);
    assert!(!h.scheduler.rebuild_clusters(true));
    let after: Vec<Option<usize>> = ["a", "c", "e"]
        .iter()
        .map(|id| h.scheduler.cluster_of(id))
        .collect();
    assert_eq!(before, after);
    assert_eq!(h.scheduler.members_of(1), ids(&["c", "d"]));
}

#[test]
fn test_rebuild_without_embeddings() {
    let h = harness(config(3));
    assert!(!h.scheduler.rebuild_clusters(true));
    let available = ids(&["b", "a"]);
    assert_eq!(
        h.scheduler.apply_ordering("u1", &available, &HashSet::new()),
        available
    );
}

#[test]
fn test_builtin_rebuilds_are_deterministic() {
    let texts: HashMap<String, String> = (0..40)
        .map(|i| {
            let topic = ["rust compiler borrow", "pasta tomato basil", "football goal match"][i % 3];
            (format!("item-{i:02}"), format!("{topic} {i}"))
        })
        .collect();

    let assignments: Vec<Vec<Option<usize>>> = (0..2)
        .map(|_| {
            let config = DiversityConfig {
                enabled: true,
                model_name: "hashing-64".to_string(),
                auto_clusters: true,
                items_per_cluster: 10,
                ..Default::default()
            };
            let backends = init_backends(&config.model_name).unwrap();
            let scheduler = DiversityScheduler::new(config, Some(backends)).unwrap();
            assert_eq!(scheduler.put_batch(&texts), 40);
            assert!(scheduler.rebuild_clusters(false));
            assert_eq!(scheduler.live_cluster_count(), 4);
            let mut ids: Vec<&String> = texts.keys().collect();
            ids.sort();
            ids.into_iter().map(|id| scheduler.cluster_of(id)).collect()
        })
        .collect();

    assert_eq!(assignments[0], assignments[1]);
    assert!(assignments[0].iter().all(|c| c.is_some()));
}

#[test]
fn test_state_survives_restart() -> Result<()> {
    let temp_dir = TempDir::new()?;
    {
        let h = harness(cache_config(3, temp_dir.path().to_path_buf()));
        h.scheduler.put_batch(&six_items());
        assert!(h.scheduler.rebuild_clusters(false));
        h.scheduler.shutdown();
    }

    let h = harness(cache_config(3, temp_dir.path().to_path_buf()));
    let stats = h.scheduler.stats();
    assert_eq!(stats.embedded_items, 6);
    assert_eq!(stats.clustered_items, 6);
    assert_eq!(stats.live_clusters, 3);
    assert_eq!(h.scheduler.cluster_of("d"), Some(1));
    // already embedded items are not recomputed
    assert_eq!(h.scheduler.put_batch(&six_items()), 0);
    assert!(!h.scheduler.rebuild_clusters(false));
    assert_eq!(h.clusterer.calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn test_async_embedding_is_persisted() -> Result<()> {
    let temp_dir = TempDir::new()?;
    {
        let h = harness(cache_config(3, temp_dir.path().to_path_buf()));
        let EmbedRequest::Scheduled(pending) = h.scheduler.start_async("a", "2") else {
            panic!("expected a scheduled job");
        };
        assert!(pending.wait());
        h.scheduler.shutdown();
    }

    let h = harness(cache_config(3, temp_dir.path().to_path_buf()));
    assert_eq!(h.scheduler.get("a"), Some(vec![2.0, 1.0]));
    Ok(())
}

#[test]
fn test_clear_cache() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let h = harness(cache_config(3, temp_dir.path().to_path_buf()));
    h.scheduler.put_batch(&six_items());
    h.scheduler.rebuild_clusters(false);
    h.scheduler.save()?;
    assert!(temp_dir.path().join("embeddings.safetensors").exists());

    h.scheduler.clear_cache()?;
    assert_eq!(h.scheduler.stats().embedded_items, 0);
    assert_eq!(h.scheduler.live_cluster_count(), 0);
    assert!(!temp_dir.path().join("embeddings.safetensors").exists());

    h.scheduler.load();
    assert_eq!(h.scheduler.stats().embedded_items, 0);
    Ok(())
}

#[derive(Default)]
struct RecordingSink {
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl PrefetchSink for RecordingSink {
    fn prefetch(&self, user_id: &str, ordered_ids: &[String]) {
        self.calls
            .lock()
            .unwrap()
            .push((user_id.to_string(), ordered_ids.to_vec()));
    }
}

#[test]
fn test_apply_ordering_reclusters_and_prefetches() {
    let config = DiversityConfig {
        trigger_ai_prefetch: true,
        ..config(3)
    };
    let sink = Arc::new(RecordingSink::default());
    let h = harness(config);
    let scheduler = h.scheduler.with_prefetch_sink(sink.clone());
    scheduler.put_batch(&six_items());

    let available = ids(&["a", "b", "c", "d", "e", "f"]);
    let annotated = HashSet::from(["a".to_string()]);
    let out = scheduler.apply_ordering("u1", &available, &annotated);
    assert_eq!(out[0], "a");
    assert_eq!(sorted(out.clone()), available);

    // the first ordering drew from every cluster, which saturates coverage
    assert_eq!(h.clusterer.calls.load(Ordering::SeqCst), 2);
    let stats = scheduler.user_stats("u1").unwrap();
    assert_eq!(stats.sampled_clusters, 0);

    let calls = sink.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "u1");
    assert_eq!(calls[0].1, out);
}

#[test]
fn test_concurrent_orderings() {
    let h = harness(config(3));
    h.scheduler.put_batch(&six_items());
    let scheduler = Arc::new(h.scheduler);

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let scheduler = scheduler.clone();
            std::thread::spawn(move || {
                let available = ids(&["f", "e", "d", "c", "b", "a", "unknown"]);
                for round in 0..25 {
                    let user = format!("user-{}", (worker + round) % 3);
                    let out = scheduler.apply_ordering(&user, &available, &HashSet::new());
                    assert_eq!(sorted(out), sorted(available.clone()));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(scheduler.stats().tracked_users, 3);
}
