use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};

pub(crate) fn prometheus_builder(max_batch_size: usize) -> Result<PrometheusBuilder, BuildError> {
    // Duration buckets
    let duration_matcher = Matcher::Suffix(String::from("duration"));
    let n_duration_buckets = 35;
    let mut duration_buckets = Vec::with_capacity(n_duration_buckets);
    // Minimum duration in seconds
    let mut value = 0.00001;
    for _ in 0..n_duration_buckets {
        // geometric sequence
        value *= 1.5;
        duration_buckets.push(value);
    }

    // Batch size buckets
    let batch_size_matcher = Matcher::Full(String::from("di_embed_batch_size"));
    let batch_size_buckets: Vec<f64> = (0..13)
        .map(|x| 2.0_f64.powi(x))
        .filter(|x| (*x as usize) <= max_batch_size.max(1))
        .collect();

    // Coverage buckets (for values between 0 and 1)
    let coverage_matcher = Matcher::Full(String::from("di_user_coverage"));
    let coverage_buckets: Vec<f64> = vec![0.0, 0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0];

    PrometheusBuilder::new()
        .set_buckets_for_metric(duration_matcher, &duration_buckets)?
        .set_buckets_for_metric(batch_size_matcher, &batch_size_buckets)?
        .set_buckets_for_metric(coverage_matcher, &coverage_buckets)
}
