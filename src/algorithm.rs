use crate::adjust::{adjust_centers, ProbeCursor};
use crate::aggregate::calc_centers_and_sizes;
use crate::config::BalancedParams;
use crate::context::{ensure_accepts, ExecutionContext};
use crate::distance::{compute_centroid_shift, row_normalize};
use crate::error::{BalancedKMeansError, Result};
use crate::mapping::{Element, Label};
use crate::predict::{ensure_metric, predict};
use crate::residency::classify_inputs;
use log::{log, log_enabled, Level};
use ndarray::{ArrayView1, ArrayView2, ArrayViewMut2};
use std::time::Instant;

/// Rebalancing pullback of a flat clustering run.
pub const BUILD_CLUSTERS_PULLBACK: u32 = 2;

/// Starvation threshold of a flat clustering run.
pub const BUILD_CLUSTERS_THRESHOLD: f32 = 0.25;

/// Outcome of one EM run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EmReport {
    /// Iterations actually executed, including rebalancing extensions
    pub iterations: u32,
    /// Iterations in which at least one centre was rebalanced
    pub adjustments: u32,
}

/// Log level of per-iteration progress.
pub(crate) fn progress_level(params: &BalancedParams) -> Level {
    if params.verbose {
        Level::Info
    } else {
        Level::Debug
    }
}

/// Run the balancing EM loop
///
/// Every iteration except the first starts by rebalancing starved clusters.
/// Each rebalance after the first `pullback` ones extends the iteration
/// budget by one, up to [`BalancedParams::iteration_ceiling`]. Centres are
/// then projected on the unit sphere for similarity metrics, rows are
/// reassigned and centres and sizes recomputed from the new labels.
///
/// `centers`, `labels` and `sizes` must hold a consistent state on entry,
/// typically from a reset aggregation.
#[allow(clippy::too_many_arguments)]
pub fn balancing_em_iters<T: Element, L: Label>(
    ctx: &dyn ExecutionContext,
    params: &BalancedParams,
    n_iters: u32,
    dataset: &ArrayView2<T>,
    dataset_norms: Option<&ArrayView1<f32>>,
    centers: &mut ArrayViewMut2<f32>,
    labels: &mut [L],
    sizes: &mut [u32],
    pullback: u32,
    threshold: f32,
) -> Result<EmReport> {
    if n_iters == 0 {
        return Err(BalancedKMeansError::UnsupportedConfig(
            "the EM loop needs at least one iteration".to_string(),
        ));
    }
    ensure_metric(params.metric)?;
    ensure_accepts(
        ctx,
        classify_inputs(&[dataset, &centers, &labels, &sizes])?,
    )?;

    let level = progress_level(params);
    let ceiling = params.iteration_ceiling(n_iters);
    let mut budget = n_iters;
    let mut balancing_counter = pullback;
    let mut cursor = ProbeCursor::default();
    let mut report = EmReport::default();

    while report.iterations < budget {
        let iter_start = Instant::now();
        let previous = log_enabled!(level).then(|| centers.to_owned());

        if report.iterations > 0
            && adjust_centers(centers, sizes, dataset, labels, threshold, &mut cursor)?
        {
            report.adjustments += 1;
            if balancing_counter >= pullback {
                balancing_counter -= pullback;
                if budget < ceiling {
                    budget += 1;
                }
            }
            balancing_counter += 1;
        }

        if params.metric.is_similarity() {
            row_normalize(centers);
        }

        predict(ctx, params, &centers.view(), dataset, dataset_norms, labels)?;
        calc_centers_and_sizes(centers, sizes, dataset, labels, true)?;
        report.iterations += 1;

        if let Some(previous) = previous {
            let shift = compute_centroid_shift(&previous.view(), &centers.view());
            log!(
                level,
                "  Iteration {}/{}: shift = {:.6}, time = {:.4}s",
                report.iterations,
                budget,
                shift,
                iter_start.elapsed().as_secs_f64()
            );
        }
    }

    if report.iterations > n_iters {
        log!(
            level,
            "  Rebalancing extended the run from {} to {} iterations",
            n_iters,
            report.iterations
        );
    }
    Ok(report)
}

/// Cluster a dataset into `centers.nrows()` clusters
///
/// Labels start out round-robin (`i % k`), centres are the means of those
/// groups, and [`balancing_em_iters`] refines them for `params.n_iters`
/// iterations.
///
/// # Arguments
///
/// * `ctx` - Execution context of the distance primitives
/// * `params` - Run parameters
/// * `dataset` - Rows to cluster `(n_rows, dim)`
/// * `centers` - Output centres `(k, dim)`
/// * `labels` - Output labels, one per row
/// * `sizes` - Output cluster sizes, one per centre
/// * `dataset_norms` - Optional squared norms of the mapped rows
#[allow(clippy::too_many_arguments)]
pub fn build_clusters<T: Element, L: Label>(
    ctx: &dyn ExecutionContext,
    params: &BalancedParams,
    dataset: &ArrayView2<T>,
    centers: &mut ArrayViewMut2<f32>,
    labels: &mut [L],
    sizes: &mut [u32],
    dataset_norms: Option<&ArrayView1<f32>>,
) -> Result<EmReport> {
    let n_clusters = centers.nrows();
    if n_clusters == 0 {
        return Err(BalancedKMeansError::InvalidK(
            "k must be greater than 0".to_string(),
        ));
    }
    if labels.len() != dataset.nrows() {
        return Err(BalancedKMeansError::InvalidDimensions(format!(
            "{} labels for {} rows",
            labels.len(),
            dataset.nrows()
        )));
    }
    ensure_metric(params.metric)?;
    ensure_accepts(
        ctx,
        classify_inputs(&[dataset, &centers, &labels, &sizes])?,
    )?;

    for (i, label) in labels.iter_mut().enumerate() {
        *label = L::from_index(i % n_clusters);
    }
    calc_centers_and_sizes(centers, sizes, dataset, labels, true)?;

    balancing_em_iters(
        ctx,
        params,
        params.n_iters,
        dataset,
        dataset_norms,
        centers,
        labels,
        sizes,
        BUILD_CLUSTERS_PULLBACK,
        BUILD_CLUSTERS_THRESHOLD,
    )
}
