/// Diversity Scheduler command line driver
mod logging;
mod prometheus;

pub use logging::init_logging;

use anyhow::{Context, Result};
use diversity_core::{
    DiversityConfig, DiversityScheduler, EmbedRequest, PrefetchSink, SchedulerStats, UserStats,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// One line of the items file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub text: String,
}

/// What to do with the loaded items
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub user_id: String,
    /// Ids annotated by someone else, kept in place
    pub annotated: Vec<String>,
    /// Number of simulated annotations. Each one finalizes the first
    /// unannotated item of the current ordering
    pub rounds: usize,
    pub clear_cache: bool,
    pub force_rebuild: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderingRecord {
    pub round: usize,
    pub user_id: String,
    pub order: Vec<String>,
    /// Item annotated after this ordering was served
    pub finalized: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub orderings: Vec<OrderingRecord>,
    pub stats: SchedulerStats,
    pub user: Option<UserStats>,
}

/// Read a JSON lines file of `{"id": ..., "text": ...}` objects.
///
/// Blank lines are ignored. Repeated ids keep their first occurrence.
pub fn read_items(path: &Path) -> Result<Vec<Item>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Could not read items file {path:?}"))?;

    let mut seen = HashSet::new();
    let mut items = Vec::new();
    for (line_number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let item: Item = serde_json::from_str(line)
            .with_context(|| format!("Invalid item on line {} of {path:?}", line_number + 1))?;
        if !seen.insert(item.id.clone()) {
            tracing::warn!("Ignoring repeated item `{}` on line {}", item.id, line_number + 1);
            continue;
        }
        items.push(item);
    }
    Ok(items)
}

/// Install the global Prometheus recorder
pub fn install_metrics(max_batch_size: usize) -> Result<PrometheusHandle> {
    let handle = prometheus::prometheus_builder(max_batch_size)
        .context("Could not build the Prometheus recorder")?
        .install_recorder()
        .context("Could not install the Prometheus recorder")?;
    Ok(handle)
}

/// Logs the head of every new ordering
struct LogPrefetchSink;

impl PrefetchSink for LogPrefetchSink {
    fn prefetch(&self, user_id: &str, ordered_ids: &[String]) {
        let head: Vec<&String> = ordered_ids.iter().take(5).collect();
        tracing::info!("Prefetch for `{user_id}`: {head:?}");
    }
}

/// Embed and cluster the items of `items_path`, then serve orderings to
/// `options.user_id`
pub fn run(config: DiversityConfig, items_path: &Path, options: RunOptions) -> Result<RunReport> {
    let items = read_items(items_path)?;
    tracing::info!("Loaded {} items from {items_path:?}", items.len());

    let scheduler =
        DiversityScheduler::from_config(config)?.with_prefetch_sink(Arc::new(LogPrefetchSink));
    if options.clear_cache {
        scheduler.clear_cache()?;
    }

    let texts: HashMap<String, String> = items
        .iter()
        .map(|item| (item.id.clone(), item.text.clone()))
        .collect();
    let computed = scheduler.put_batch(&texts);
    tracing::info!("Embedded {computed} new items");
    scheduler.rebuild_clusters(options.force_rebuild);

    let mut available: Vec<String> = items.into_iter().map(|item| item.id).collect();
    let annotated: HashSet<String> = options.annotated.iter().cloned().collect();
    let mut orderings = Vec::with_capacity(options.rounds + 1);

    for round in 0..=options.rounds {
        let order = scheduler.apply_ordering(&options.user_id, &available, &annotated);
        let finalized = if round < options.rounds {
            order.iter().find(|id| !annotated.contains(*id)).cloned()
        } else {
            None
        };

        if let Some(id) = &finalized {
            let text = texts.get(id).map(String::as_str).unwrap_or_default();
            if let EmbedRequest::Scheduled(pending) =
                scheduler.on_item_finalized(&options.user_id, id, text)
            {
                pending.wait();
            }
            available.retain(|other| other != id);
        }

        let done = round < options.rounds && finalized.is_none();
        orderings.push(OrderingRecord {
            round,
            user_id: options.user_id.clone(),
            order,
            finalized,
        });
        if done {
            tracing::info!("Nothing left to annotate after {round} rounds");
            break;
        }
    }

    let report = RunReport {
        orderings,
        stats: scheduler.stats(),
        user: scheduler.user_stats(&options.user_id),
    };
    scheduler.shutdown();
    Ok(report)
}
