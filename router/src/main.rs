use anyhow::Result;
use clap::Parser;
use diversity_core::DiversityConfig;
use diversity_router::RunOptions;
use std::path::PathBuf;

/// App Configuration
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// JSON lines file with one `{"id": ..., "text": ...}` object per line
    #[clap(long, env)]
    items: PathBuf,

    /// Optional JSON file with the scheduler configuration.
    ///
    /// Values given on the command line override the file.
    #[clap(long, env)]
    config: Option<PathBuf>,

    /// The annotator the orderings are computed for
    #[clap(default_value = "default", long, env)]
    user_id: String,

    /// Comma separated ids already annotated by others. They keep their position
    #[clap(long, env, value_delimiter = ',')]
    annotated: Vec<String>,

    /// Number of simulated annotations after the first ordering
    #[clap(default_value = "0", long, env)]
    rounds: usize,

    /// Delete the embedding cache before embedding
    #[clap(long, env)]
    clear_cache: bool,

    /// Re-cluster even when a cached assignment exists
    #[clap(long, env)]
    force_rebuild: bool,

    /// Enable diversified ordering. Enabled unless the configuration file
    /// says otherwise
    #[clap(long, env)]
    enabled: Option<bool>,

    /// Embedding model. `hashing` or `hashing-<dim>`
    #[clap(long, env)]
    model_name: Option<String>,

    /// Number of clusters when `auto_clusters` is off
    #[clap(long, env)]
    num_clusters: Option<usize>,

    /// Target cluster size when `auto_clusters` is on
    #[clap(long, env)]
    items_per_cluster: Option<usize>,

    #[clap(long, env)]
    auto_clusters: Option<bool>,

    /// Number of texts per embedder call
    #[clap(long, env)]
    batch_size: Option<usize>,

    /// Directory holding the embedding and cluster label cache
    #[clap(long, env)]
    cache_dir: Option<PathBuf>,

    /// Fraction of the clusters a user must draw from before re-clustering
    #[clap(long, env)]
    recluster_threshold: Option<f64>,

    /// Keep skipped items in place as well as annotated ones
    #[clap(long, env)]
    preserve_visited: Option<bool>,

    /// Log the head of each new ordering for prefetching
    #[clap(long, env)]
    trigger_ai_prefetch: Option<bool>,

    /// Number of background embedding threads
    #[clap(long, env)]
    embedding_workers: Option<usize>,

    /// Seed of the clustering
    #[clap(long, env)]
    cluster_seed: Option<u64>,

    /// Outputs the logs in JSON format (useful for telemetry)
    #[clap(long, env)]
    json_output: bool,

    // Whether or not to include the log trace through spans
    #[clap(long, env)]
    disable_spans: bool,

    /// Print the Prometheus metrics to stderr before exiting
    #[clap(long, env)]
    metrics: bool,
}

impl Args {
    /// The configuration file, or the enabled defaults, with every command
    /// line override applied
    pub fn diversity_config(&self) -> Result<DiversityConfig> {
        let mut config = match &self.config {
            Some(path) => DiversityConfig::from_file(path)?,
            None => DiversityConfig {
                enabled: true,
                ..Default::default()
            },
        };

        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        if let Some(model_name) = &self.model_name {
            config.model_name = model_name.clone();
        }
        if let Some(num_clusters) = self.num_clusters {
            config.num_clusters = num_clusters;
        }
        if let Some(items_per_cluster) = self.items_per_cluster {
            config.items_per_cluster = items_per_cluster;
        }
        if let Some(auto_clusters) = self.auto_clusters {
            config.auto_clusters = auto_clusters;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(cache_dir) = &self.cache_dir {
            config.cache_dir = Some(cache_dir.clone());
        }
        if let Some(recluster_threshold) = self.recluster_threshold {
            config.recluster_threshold = recluster_threshold;
        }
        if let Some(preserve_visited) = self.preserve_visited {
            config.preserve_visited = preserve_visited;
        }
        if let Some(trigger_ai_prefetch) = self.trigger_ai_prefetch {
            config.trigger_ai_prefetch = trigger_ai_prefetch;
        }
        if let Some(embedding_workers) = self.embedding_workers {
            config.embedding_workers = embedding_workers;
        }
        if let Some(cluster_seed) = self.cluster_seed {
            config.cluster_seed = cluster_seed;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            user_id: self.user_id.clone(),
            annotated: self.annotated.clone(),
            rounds: self.rounds,
            clear_cache: self.clear_cache,
            force_rebuild: self.force_rebuild,
        }
    }
}


fn main() -> Result<()> {
    // Pattern match configuration
    let args: Args = Args::parse();

    diversity_router::init_logging(args.json_output, args.disable_spans);

    tracing::info!("{args:?}");

    let config = args.diversity_config()?;
    let metrics = match args.metrics {
        true => Some(diversity_router::install_metrics(config.batch_size)?),
        false => None,
    };

    let report = diversity_router::run(config, &args.items, args.run_options())?;

    for ordering in &report.orderings {
        println!("{}", serde_json::to_string(ordering)?);
    }
    println!("{}", serde_json::to_string(&report.stats)?);
    if let Some(user) = &report.user {
        println!("{}", serde_json::to_string(user)?);
    }

    if let Some(handle) = metrics {
        eprintln!("{}", handle.render());
    }
    Ok(())
}
