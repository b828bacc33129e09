//! Layer distribution planning.
//!
//! Pure functions: given the model's layer count and the RAM declared by the
//! master and its workers, decide how many layers run remotely and how the
//! remote pool splits among workers. Fails closed (clamped/defaulted) rather
//! than erroring, since the result feeds a best-effort UI.

use crate::registry::WorkerDescriptor;

/// Substituted when the model's layer count is unknown. Degraded, not an
/// error: the server binary clamps overshoot on its side.
pub const DEFAULT_TOTAL_LAYERS: u32 = 40;

pub const MIN_REMOTE_PROPORTION: f64 = 0.01;
pub const MAX_REMOTE_PROPORTION: f64 = 0.99;

/// Output of planning for one master-mode launch.
#[derive(Debug, Clone, PartialEq)]
pub struct DistributionPlan {
    pub total_layers: u32,
    pub model_size_mb: u64,
    /// Layers offloaded to the worker pool, always in [1, total-1].
    pub remote_layers: u32,
    /// Per-worker share of the remote pool, in worker order. Only present
    /// with >= 2 workers; a single worker takes the whole pool.
    pub tensor_split: Option<Vec<f64>>,
}

impl DistributionPlan {
    pub fn master_layers(&self) -> u32 {
        self.total_layers - self.remote_layers
    }

    /// The `-ts` argument value: two-decimal fractions, comma-separated.
    pub fn tensor_split_string(&self) -> Option<String> {
        self.tensor_split.as_ref().map(|fractions| {
            fractions
                .iter()
                .map(|f| format!("{f:.2}"))
                .collect::<Vec<_>>()
                .join(",")
        })
    }

    /// Whole layer counts per worker, remainder going to the last worker.
    pub fn per_worker_layers(&self) -> Vec<u32> {
        match &self.tensor_split {
            None => vec![self.remote_layers],
            Some(fractions) => {
                let mut counts: Vec<u32> = fractions
                    .iter()
                    .map(|f| (self.remote_layers as f64 * f) as u32)
                    .collect();
                let assigned: u32 = counts.iter().sum();
                if let Some(last) = counts.last_mut() {
                    *last += self.remote_layers - assigned;
                }
                counts
            }
        }
    }
}

/// Compute the layer distribution for the given participants.
///
/// Returns `None` when no workers participate (all layers stay local) or the
/// model has fewer than 2 layers (nothing to split).
///
/// When any participant carries an explicit proportion, the declared
/// proportions are summed and undeclared workers' RAM is ignored for the
/// master/worker split. The inter-worker split always uses RAM. This mixed
/// behavior is intentional and load-bearing for argument compatibility.
pub fn plan_distribution(
    total_layers: Option<u32>,
    model_size_mb: u64,
    master_ram_mb: u64,
    workers: &[WorkerDescriptor],
) -> Option<DistributionPlan> {
    if workers.is_empty() {
        return None;
    }
    let total = total_layers.unwrap_or(DEFAULT_TOTAL_LAYERS);
    if total < 2 {
        return None;
    }

    let worker_ram: u64 = workers.iter().map(|w| w.available_ram_mb).sum();
    let declared: f64 = workers
        .iter()
        .filter_map(|w| w.proportion)
        .map(f64::from)
        .sum();

    let remote_fraction = if declared > 0.0 {
        declared.clamp(MIN_REMOTE_PROPORTION, MAX_REMOTE_PROPORTION)
    } else if master_ram_mb + worker_ram == 0 {
        0.0
    } else {
        worker_ram as f64 / (master_ram_mb + worker_ram) as f64
    };

    // Truncation toward zero, then clamp: the master always keeps at least
    // one layer and the pool always receives at least one.
    let remote_layers = ((total as f64 * remote_fraction) as u32).clamp(1, total - 1);

    let tensor_split = if workers.len() >= 2 {
        Some(if worker_ram == 0 {
            vec![1.0 / workers.len() as f64; workers.len()]
        } else {
            workers
                .iter()
                .map(|w| w.available_ram_mb as f64 / worker_ram as f64)
                .collect()
        })
    } else {
        None
    };

    Some(DistributionPlan {
        total_layers: total,
        model_size_mb,
        remote_layers,
        tensor_split,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(ram: u64) -> WorkerDescriptor {
        WorkerDescriptor::new("10.0.0.1", 50052, "w", ram)
    }

    fn workers(rams: &[u64]) -> Vec<WorkerDescriptor> {
        rams.iter()
            .enumerate()
            .map(|(i, r)| WorkerDescriptor::new(format!("10.0.0.{i}"), 50052, "w", *r))
            .collect()
    }

    #[test]
    fn test_no_workers_means_no_distribution() {
        assert_eq!(plan_distribution(Some(32), 4000, 4096, &[]), None);
    }

    #[test]
    fn test_equal_ram_splits_in_half() {
        // T=32, master 4096 MB, one worker 4096 MB
        let plan = plan_distribution(Some(32), 4000, 4096, &[worker(4096)]).unwrap();
        assert_eq!(plan.remote_layers, 16);
        assert_eq!(plan.master_layers(), 16);
        assert_eq!(plan.tensor_split, None);
    }

    #[test]
    fn test_explicit_proportion_overrides_ram() {
        let w = worker(123).with_proportion(Some(0.75));
        for ram in [64, 4096, 1_000_000] {
            let plan = plan_distribution(Some(32), 4000, ram, &[w.clone()]).unwrap();
            assert_eq!(plan.remote_layers, 24);
            assert_eq!(plan.master_layers(), 8);
        }
    }

    #[test]
    fn test_two_worker_ram_split_string() {
        let plan = plan_distribution(Some(32), 4000, 4096, &workers(&[1000, 3000])).unwrap();
        assert_eq!(plan.tensor_split_string().as_deref(), Some("0.25,0.75"));
    }

    #[test]
    fn test_split_fractions_sum_to_one() {
        for rams in [&[1000, 3000][..], &[512, 512, 1024][..], &[7, 11, 13, 17][..]] {
            let plan = plan_distribution(Some(40), 4000, 4096, &workers(rams)).unwrap();
            let sum: f64 = plan.tensor_split.as_ref().unwrap().iter().sum();
            assert!((sum - 1.0).abs() < 0.01, "sum={sum} for {rams:?}");
        }
    }

    #[test]
    fn test_remote_layers_always_within_bounds() {
        for total in 2..=80 {
            for (master_ram, worker_rams) in [
                (64_u64, &[1_000_000_u64][..]),
                (1_000_000, &[1][..]),
                (4096, &[4096, 8192][..]),
            ] {
                let plan =
                    plan_distribution(Some(total), 4000, master_ram, &workers(worker_rams))
                        .unwrap();
                assert!(plan.remote_layers >= 1);
                assert!(plan.remote_layers <= total - 1);
                assert_eq!(plan.master_layers() + plan.remote_layers, plan.total_layers);
            }
        }
    }

    #[test]
    fn test_more_ram_means_larger_share() {
        let base = plan_distribution(Some(32), 4000, 4096, &workers(&[1000, 1000])).unwrap();
        let doubled = plan_distribution(Some(32), 4000, 4096, &workers(&[2000, 1000])).unwrap();
        let share = |p: &DistributionPlan| p.tensor_split.as_ref().unwrap()[0];
        assert!(share(&doubled) > share(&base));
    }

    #[test]
    fn test_extreme_proportion_is_clamped() {
        let w = worker(4096).with_proportion(Some(1.0));
        let plan = plan_distribution(Some(32), 4000, 4096, &[w]).unwrap();
        // clamp(1.0) -> 0.99, trunc(32 * 0.99) = 31 = total - 1
        assert_eq!(plan.remote_layers, 31);
        assert_eq!(plan.master_layers(), 1);
    }

    #[test]
    fn test_mixed_proportions_sum_only_declared() {
        // One declared 0.25, one auto: the auto worker's RAM does not move
        // the master/worker split, only the inter-worker split.
        let declared = worker(1000).with_proportion(Some(0.25));
        let auto = WorkerDescriptor::new("10.0.0.2", 50052, "w", 100_000);
        let plan = plan_distribution(Some(32), 4000, 4096, &[declared, auto]).unwrap();
        assert_eq!(plan.remote_layers, 8); // trunc(32 * 0.25)
        let split = plan.tensor_split.unwrap();
        assert!(split[1] > split[0]); // RAM still drives the -ts split
    }

    #[test]
    fn test_unknown_layer_count_uses_default() {
        let plan = plan_distribution(None, 4000, 4096, &[worker(4096)]).unwrap();
        assert_eq!(plan.total_layers, DEFAULT_TOTAL_LAYERS);
        assert_eq!(plan.remote_layers, 20);
    }

    #[test]
    fn test_zero_ram_pool_still_gets_one_layer() {
        let plan = plan_distribution(Some(32), 4000, 4096, &workers(&[0, 0])).unwrap();
        assert_eq!(plan.remote_layers, 1);
        let split = plan.tensor_split.unwrap();
        assert_eq!(split, vec![0.5, 0.5]);
    }

    #[test]
    fn test_single_layer_model_cannot_distribute() {
        assert_eq!(plan_distribution(Some(1), 4000, 4096, &[worker(4096)]), None);
    }

    #[test]
    fn test_per_worker_layers_cover_remote_pool() {
        let plan = plan_distribution(Some(32), 4000, 4096, &workers(&[1000, 3000])).unwrap();
        let counts = plan.per_worker_layers();
        assert_eq!(counts.iter().sum::<u32>(), plan.remote_layers);
        assert_eq!(counts.len(), 2);
    }
}
