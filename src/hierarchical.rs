//! Two-level balanced k-means.
//!
//! Large cluster counts are built coarse to fine: the dataset is first split
//! into about `sqrt(k)` meso-clusters, every meso-cluster is clustered on its
//! own into a share of the `k` fine clusters proportional to its size, and a
//! short EM pass over the whole dataset polishes the result. Each meso-level
//! run only touches the rows of one meso-cluster, which bounds the working
//! set.

use crate::algorithm::{balancing_em_iters, build_clusters, progress_level};
use crate::config::BalancedParams;
use crate::context::{ensure_accepts, ExecutionContext};
use crate::error::{BalancedKMeansError, Result};
use crate::mapping::{check_addressable, Element, Label};
use crate::predict::{calc_minibatch_size, compute_norm, ensure_metric};
use crate::residency::classify_inputs;
use log::{debug, log, trace, warn};
use ndarray::parallel::prelude::*;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut2, Axis};

/// Rebalancing pullback of the final fine-tuning pass.
pub const FINE_TUNE_PULLBACK: u32 = 5;

/// Starvation threshold of the final fine-tuning pass.
pub const FINE_TUNE_THRESHOLD: f32 = 0.2;

/// Allocation of fine clusters to meso-clusters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FineClusterArrangement {
    /// Largest meso-cluster size
    pub mesocluster_size_max: u32,
    /// Largest number of fine clusters given to one meso-cluster
    pub fine_clusters_nums_max: usize,
    /// Fine clusters per meso-cluster
    pub fine_clusters_nums: Vec<usize>,
    /// Prefix sums of `fine_clusters_nums`; meso-cluster `i` owns fine
    /// clusters `csum[i]..csum[i + 1]`
    pub fine_clusters_csum: Vec<usize>,
}

/// Number of meso-clusters used to build `n_clusters` fine clusters.
pub fn mesocluster_count(n_clusters: usize) -> usize {
    let rounded = ((n_clusters as f64).sqrt() + 0.5) as usize;
    rounded.clamp(1, n_clusters.max(1))
}

/// Share `n_clusters` fine clusters between meso-clusters proportionally to
/// their sizes.
///
/// Every non-empty meso-cluster gets at least one fine cluster and empty ones
/// get none. Shares are rounded as they go, so the last non-empty
/// meso-cluster receives whatever is left.
pub fn arrange_fine_clusters(
    n_clusters: usize,
    mesocluster_sizes: &[u32],
    n_rows: usize,
) -> Result<FineClusterArrangement> {
    let size_sum: usize = mesocluster_sizes.iter().map(|&s| s as usize).sum();
    if size_sum != n_rows {
        return Err(BalancedKMeansError::InvariantViolation(format!(
            "mesocluster sizes sum to {} instead of {}",
            size_sum, n_rows
        )));
    }
    let n_nonempty = mesocluster_sizes.iter().filter(|&&s| s > 0).count();
    if n_nonempty > n_clusters {
        return Err(BalancedKMeansError::InvariantViolation(format!(
            "{} non-empty mesoclusters cannot share {} clusters",
            n_nonempty, n_clusters
        )));
    }
    let last_nonempty = mesocluster_sizes.iter().rposition(|&s| s > 0);

    let mut n_lists_rem = n_clusters;
    let mut n_nonempty_rem = n_nonempty;
    let mut n_rows_rem = n_rows;
    let mut nums = Vec::with_capacity(mesocluster_sizes.len());
    let mut csum = Vec::with_capacity(mesocluster_sizes.len() + 1);
    csum.push(0);

    for (i, &size) in mesocluster_sizes.iter().enumerate() {
        let num = if size == 0 {
            0
        } else if Some(i) == last_nonempty {
            n_lists_rem
        } else {
            n_nonempty_rem -= 1;
            let share = (n_lists_rem as f64 * size as f64 / n_rows_rem as f64 + 0.5) as usize;
            share.min(n_lists_rem - n_nonempty_rem).max(1)
        };
        n_lists_rem -= num;
        n_rows_rem -= size as usize;
        nums.push(num);
        csum.push(csum[i] + num);
    }

    let total = csum.last().copied().unwrap_or(0);
    if total != n_clusters {
        return Err(BalancedKMeansError::InvariantViolation(format!(
            "arranged {} fine clusters instead of {}",
            total, n_clusters
        )));
    }

    Ok(FineClusterArrangement {
        mesocluster_size_max: mesocluster_sizes.iter().copied().max().unwrap_or(0),
        fine_clusters_nums_max: nums.iter().copied().max().unwrap_or(0),
        fine_clusters_nums: nums,
        fine_clusters_csum: csum,
    })
}

/// Cluster every meso-cluster into its share of fine clusters.
///
/// At most `arrangement.mesocluster_size_max` rows of each meso-cluster are
/// used, taken in dataset order. The fine centres of meso-cluster `i` are
/// written to `centers[csum[i]..csum[i + 1]]`. Returns the number of fine
/// clusters built.
#[allow(clippy::too_many_arguments)]
pub fn build_fine_clusters<T: Element, L: Label>(
    ctx: &dyn ExecutionContext,
    params: &BalancedParams,
    dataset: &ArrayView2<T>,
    dataset_norms: Option<&ArrayView1<f32>>,
    mesocluster_labels: &[L],
    mesocluster_sizes: &[u32],
    arrangement: &FineClusterArrangement,
    centers: &mut ArrayViewMut2<f32>,
) -> Result<usize> {
    let (n_rows, dim) = dataset.dim();
    let n_meso = mesocluster_sizes.len();
    let cap = arrangement.mesocluster_size_max as usize;
    if mesocluster_labels.len() != n_rows
        || arrangement.fine_clusters_nums.len() != n_meso
        || centers.ncols() != dim
    {
        return Err(BalancedKMeansError::InvalidDimensions(format!(
            "fine clusters: dataset {:?}, {} mesocluster labels, {} mesoclusters, centers {:?}",
            dataset.dim(),
            mesocluster_labels.len(),
            n_meso,
            centers.dim()
        )));
    }

    // Row ids grouped by meso-cluster, in dataset order
    let mut offsets = vec![0usize; n_meso + 1];
    for l in mesocluster_labels {
        let m = l.index();
        if m >= n_meso {
            return Err(BalancedKMeansError::InvariantViolation(format!(
                "mesocluster label {} out of range for {} mesoclusters",
                m, n_meso
            )));
        }
        offsets[m + 1] += 1;
    }
    for i in 0..n_meso {
        offsets[i + 1] += offsets[i];
    }
    let mut cursor = offsets.clone();
    let mut ids = vec![0usize; n_rows];
    for (row, l) in mesocluster_labels.iter().enumerate() {
        let m = l.index();
        ids[cursor[m]] = row;
        cursor[m] += 1;
    }

    // Scratch shared by all meso-clusters
    let fine_max = arrangement.fine_clusters_nums_max;
    let mut trainset = Array2::<f32>::zeros((cap, dim));
    let mut trainset_norms = Array1::<f32>::zeros(if dataset_norms.is_some() { cap } else { 0 });
    let mut trainset_labels = vec![0u32; cap];
    let mut fine_centers = Array2::<f32>::zeros((fine_max, dim));
    let mut fine_sizes = vec![0u32; fine_max];

    let mut n_clusters_done = 0;
    for i in 0..n_meso {
        let members = &ids[offsets[i]..offsets[i + 1]];
        let k = members.len().min(cap);
        let expected = (mesocluster_sizes[i] as usize).min(cap);
        if k != expected {
            warn!(
                "Incorrect mesocluster size at {}: gathered {} rows, expected {}",
                i, k, expected
            );
        } else if k < members.len() {
            debug!(
                "Mesocluster {} trains on {} of its {} rows",
                i,
                k,
                members.len()
            );
        }

        let n_fine = arrangement.fine_clusters_nums[i];
        if k == 0 {
            debug!("Empty mesocluster {}", i);
            if n_fine != 0 {
                return Err(BalancedKMeansError::InvariantViolation(format!(
                    "empty mesocluster {} was given {} fine clusters",
                    i, n_fine
                )));
            }
            continue;
        }
        if n_fine == 0 {
            return Err(BalancedKMeansError::InvariantViolation(format!(
                "mesocluster {} has {} rows but no fine clusters",
                i, k
            )));
        }

        trainset
            .slice_mut(s![..k, ..])
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(members[..k].par_iter())
            .for_each(|(mut dst, &row)| {
                dst.iter_mut()
                    .zip(dataset.row(row).iter())
                    .for_each(|(d, &v)| *d = v.to_math());
            });
        if let Some(norms) = dataset_norms {
            trainset_norms
                .slice_mut(s![..k])
                .iter_mut()
                .zip(&members[..k])
                .for_each(|(n, &row)| *n = norms[row]);
        }

        let report = build_clusters(
            ctx,
            params,
            &trainset.slice(s![..k, ..]),
            &mut fine_centers.slice_mut(s![..n_fine, ..]),
            &mut trainset_labels[..k],
            &mut fine_sizes[..n_fine],
            dataset_norms.map(|_| trainset_norms.slice(s![..k])).as_ref(),
        )?;
        trace!(
            "Mesocluster {}: {} rows into {} fine clusters in {} iterations",
            i,
            k,
            n_fine,
            report.iterations
        );

        let start = arrangement.fine_clusters_csum[i];
        let end = arrangement.fine_clusters_csum[i + 1];
        if end > centers.nrows() {
            return Err(BalancedKMeansError::InvariantViolation(format!(
                "fine clusters {}..{} exceed {} centers",
                start,
                end,
                centers.nrows()
            )));
        }
        centers
            .slice_mut(s![start..end, ..])
            .assign(&fine_centers.slice(s![..n_fine, ..]));
        n_clusters_done += n_fine;
    }
    Ok(n_clusters_done)
}

/// Build `centers.nrows()` balanced clusters hierarchically
///
/// # Arguments
///
/// * `ctx` - Execution context of the distance primitives
/// * `params` - Run parameters
/// * `dataset` - Rows to cluster `(n_rows, dim)`
/// * `centers` - Output centres `(k, dim)`
/// * `dataset_norms` - Optional squared norms of the mapped rows; computed
///   here for L2 metrics when absent
///
/// Returns the final cluster sizes.
pub fn build_hierarchical<T: Element>(
    ctx: &dyn ExecutionContext,
    params: &BalancedParams,
    dataset: &ArrayView2<T>,
    centers: &mut ArrayViewMut2<f32>,
    dataset_norms: Option<&ArrayView1<f32>>,
) -> Result<Vec<u32>> {
    let (n_rows, dim) = dataset.dim();
    let n_clusters = centers.nrows();
    if n_clusters == 0 {
        return Err(BalancedKMeansError::InvalidK(
            "k must be greater than 0".to_string(),
        ));
    }
    if n_rows == 0 {
        return Err(BalancedKMeansError::InsufficientData(
            "cannot cluster an empty dataset".to_string(),
        ));
    }
    if centers.ncols() != dim {
        return Err(BalancedKMeansError::InvalidDimensions(format!(
            "Expected {} features, got {}",
            centers.ncols(),
            dim
        )));
    }
    ensure_metric(params.metric)?;
    check_addressable::<u32>(n_rows, dim, n_clusters)?;
    ensure_accepts(ctx, classify_inputs(&[dataset, &centers])?)?;

    let level = progress_level(params);
    let n_meso = mesocluster_count(n_clusters);
    log!(
        level,
        "Hierarchical balanced k-means on {}: {} rows, {} dims, {} clusters via {} mesoclusters",
        ctx.name(),
        n_rows,
        dim,
        n_clusters,
        n_meso
    );

    // Row norms are reused by every stage
    let computed_norms = match dataset_norms {
        None if params.metric.is_l2_family() => {
            let (minibatch, _) = calc_minibatch_size(
                n_clusters,
                n_rows,
                dim,
                params.metric,
                T::NEEDS_CONVERSION,
                params.minibatch_budget_bytes,
            );
            let mut norms = Array1::zeros(n_rows);
            compute_norm(ctx, dataset, minibatch, norms.view_mut())?;
            Some(norms)
        }
        _ => None,
    };
    let norms_view: Option<ArrayView1<f32>> = dataset_norms
        .map(|n| n.view())
        .or_else(|| computed_norms.as_ref().map(|n| n.view()));
    let norms = norms_view.as_ref();

    let mut meso_centers = Array2::<f32>::zeros((n_meso, dim));
    let mut meso_labels = vec![0u32; n_rows];
    let mut meso_sizes = vec![0u32; n_meso];
    build_clusters(
        ctx,
        params,
        dataset,
        &mut meso_centers.view_mut(),
        &mut meso_labels,
        &mut meso_sizes,
        norms,
    )?;

    let mut arrangement = arrange_fine_clusters(n_clusters, &meso_sizes, n_rows)?;
    trace!("Mesocluster sizes: {:?}", meso_sizes);
    trace!("Fine clusters per mesocluster: {:?}", arrangement.fine_clusters_nums);

    let balanced_max = (2 * n_rows).div_ceil(n_meso) as u32;
    if arrangement.mesocluster_size_max > balanced_max {
        warn!(
            "build_hierarchical: built unbalanced mesoclusters (max_mesocluster_size == {} > {}). \
             At most {} points will be used for training within each mesocluster. \
             Consider increasing the number of training iterations `n_iters`.",
            arrangement.mesocluster_size_max, balanced_max, balanced_max
        );
        arrangement.mesocluster_size_max = balanced_max;
    }

    let n_clusters_done = build_fine_clusters(
        ctx,
        params,
        dataset,
        norms,
        &meso_labels,
        &meso_sizes,
        &arrangement,
        centers,
    )?;
    if n_clusters_done != n_clusters {
        return Err(BalancedKMeansError::InvariantViolation(format!(
            "built {} fine clusters instead of {}",
            n_clusters_done, n_clusters
        )));
    }

    // Fine-tune over the whole dataset, starting from the assembled centres
    let mut labels = meso_labels;
    let mut sizes = vec![0u32; n_clusters];
    let fine_tune_iters = (params.n_iters / 10).max(2);
    let report = balancing_em_iters(
        ctx,
        params,
        fine_tune_iters,
        dataset,
        norms,
        centers,
        &mut labels,
        &mut sizes,
        FINE_TUNE_PULLBACK,
        FINE_TUNE_THRESHOLD,
    )?;
    log!(
        level,
        "Fine-tuning finished after {} iterations ({} rebalancing steps)",
        report.iterations,
        report.adjustments
    );

    Ok(sizes)
}
