//! Cluster statistics from labels.

use crate::context::{ensure_accepts, HostContext};
use crate::distance::{count_labels, rows_div_vec_checkzero, rows_mul_vec};
use crate::error::{BalancedKMeansError, Result};
use crate::mapping::{Element, Label};
use crate::residency::classify_inputs;
use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, ArrayView2, ArrayViewMut2, Axis};

/// Recompute cluster centres and sizes from labels.
///
/// With `reset` the new centres are the means of the rows labelled with each
/// cluster and `sizes` is overwritten. Without it the existing centres are
/// treated as means over `sizes` rows and the new rows are folded in, so
/// aggregating two disjoint shards one after the other gives the same result
/// as aggregating their union.
///
/// Clusters left without rows get a zero centre. Sums are accumulated in
/// `f64` in row order, so identical inputs give identical centres.
pub fn calc_centers_and_sizes<T: Element, L: Label>(
    centers: &mut ArrayViewMut2<f32>,
    sizes: &mut [u32],
    dataset: &ArrayView2<T>,
    labels: &[L],
    reset: bool,
) -> Result<()> {
    let (n_clusters, dim) = centers.dim();
    let n_rows = dataset.nrows();
    if sizes.len() != n_clusters || dataset.ncols() != dim || labels.len() != n_rows {
        return Err(BalancedKMeansError::InvalidDimensions(format!(
            "aggregate: centers {:?}, {} sizes, dataset {:?}, {} labels",
            centers.dim(),
            sizes.len(),
            dataset.dim(),
            labels.len()
        )));
    }
    ensure_accepts(
        &HostContext,
        classify_inputs(&[&centers, &sizes, dataset, &labels])?,
    )?;
    if let Some(bad) = labels.par_iter().find_any(|l| l.index() >= n_clusters) {
        return Err(BalancedKMeansError::InvariantViolation(format!(
            "label {:?} out of range for {} clusters",
            bad, n_clusters
        )));
    }

    let counts = count_labels(labels, n_clusters);

    // Counting sort of row ids by label, stable in row order
    let mut offsets = vec![0usize; n_clusters + 1];
    for (c, &n) in counts.iter().enumerate() {
        offsets[c + 1] = offsets[c] + n as usize;
    }
    let mut cursor = offsets.clone();
    let mut order = vec![0usize; n_rows];
    for (row, l) in labels.iter().enumerate() {
        let c = l.index();
        order[cursor[c]] = row;
        cursor[c] += 1;
    }

    let mut sums = Array2::<f32>::zeros((n_clusters, dim));
    sums.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(c, mut out)| {
            let mut acc = vec![0.0f64; dim];
            for &row in &order[offsets[c]..offsets[c + 1]] {
                for (a, &v) in acc.iter_mut().zip(dataset.row(row).iter()) {
                    *a += v.to_math() as f64;
                }
            }
            out.iter_mut().zip(&acc).for_each(|(o, &a)| *o = a as f32);
        });

    if reset {
        centers.assign(&sums);
        sizes.copy_from_slice(&counts);
    } else {
        let old: Array1<f32> = sizes.iter().map(|&s| s as f32).collect();
        rows_mul_vec(centers, &old.view());
        *centers += &sums;
        sizes.iter_mut().zip(&counts).for_each(|(s, &n)| *s += n);
    }

    let divisors: Array1<f32> = sizes.iter().map(|&s| s as f32).collect();
    rows_div_vec_checkzero(centers, &divisors.view());
    Ok(())
}
