//! Diversified ordering of the items available to one user.
//!
//! Items the user has already seen keep their position. The rest are drawn
//! one at a time, round-robin across their clusters, so that consecutive
//! items come from different clusters whenever possible.

use crate::cluster::ClusterIndex;
use crate::sampling::UserSamplingState;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

/// Order `available` for `user`.
///
/// Ids in `preserve`, in the user's visited set and, with `preserve_skipped`,
/// in the user's skipped set stay at their original index. The output always
/// has the same length and the same ids as `available`. Without a cluster
/// assignment the input order is returned unchanged.
pub fn generate(
    index: &ClusterIndex,
    user: &mut UserSamplingState,
    available: &[String],
    preserve: &HashSet<String>,
    preserve_skipped: bool,
) -> Vec<String> {
    if !index.is_built() {
        return available.to_vec();
    }

    let mut preserved = Vec::new();
    let mut queues: BTreeMap<usize, VecDeque<&String>> = BTreeMap::new();
    let mut unclustered = Vec::new();

    for (position, id) in available.iter().enumerate() {
        let keep = preserve.contains(id)
            || user.visited.contains(id)
            || (preserve_skipped && user.skipped.contains(id));
        if keep {
            preserved.push((position, id));
            continue;
        }
        match index.cluster_of(id) {
            Some(cluster) => queues.entry(cluster).or_default().push_back(id),
            None => unclustered.push(id),
        }
    }

    let mut ordered = Vec::with_capacity(available.len());
    loop {
        let clusters: BTreeSet<usize> = queues.keys().copied().collect();
        let Some(cluster) = user.next_cluster(&clusters) else {
            break;
        };
        if let Some(queue) = queues.get_mut(&cluster) {
            if let Some(id) = queue.pop_front() {
                ordered.push(id.clone());
            }
            if queue.is_empty() {
                queues.remove(&cluster);
            }
        }
    }

    // Items without a cluster go last, in a fixed order
    unclustered.sort();
    ordered.extend(unclustered.into_iter().cloned());

    // `preserved` is in ascending position order
    for (position, id) in preserved {
        let position = position.min(ordered.len());
        ordered.insert(position, id.clone());
    }

    debug_assert_eq!(ordered.len(), available.len());
    ordered
}

/// Whether `user` has drawn from enough of the live clusters to re-partition
pub fn should_recluster(user: &UserSamplingState, live_clusters: usize, threshold: f64) -> bool {
    live_clusters > 0 && user.coverage(live_clusters) >= threshold
}
