//! Cluster assignment.
//!
//! Labels are computed one minibatch at a time. The minibatch is sized so the
//! scratch it needs (reduction state or a distance block, plus a converted
//! copy of the rows for quantised datasets) stays within
//! [`BalancedParams::minibatch_budget_bytes`].

use crate::config::{BalancedParams, DistanceType};
use crate::context::{ensure_accepts, ExecutionContext, HostContext};
use crate::distance::{compute_squared_norms, row_argmin};
use crate::error::{BalancedKMeansError, Result};
use crate::mapping::{check_addressable, map_matrix_into, Element, Label};
use crate::residency::classify_inputs;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1};
use rayon::prelude::*;
use std::mem::size_of;

/// Minibatch row counts are multiples of this.
const MINIBATCH_ALIGN: usize = 64;

/// Number of rows per predict minibatch and the scratch bytes of one row.
///
/// L2 metrics reduce on the fly and only keep a lock word and an
/// `(index, distance)` pair per row; other metrics materialise a full row of
/// `n_clusters` distances. Quantised datasets add a converted `f32` row.
pub fn calc_minibatch_size(
    n_clusters: usize,
    n_rows: usize,
    dim: usize,
    metric: DistanceType,
    needs_conversion: bool,
    budget_bytes: usize,
) -> (usize, usize) {
    let n_clusters = n_clusters.max(1);
    let mut mem_per_row = if metric.is_l2_family() {
        size_of::<i32>() + size_of::<(usize, f32)>()
    } else {
        size_of::<f32>() * n_clusters
    };
    if needs_conversion {
        mem_per_row += size_of::<f32>() * dim;
    }

    let rows = (budget_bytes / mem_per_row).max(1);
    let rows = rows.div_ceil(MINIBATCH_ALIGN) * MINIBATCH_ALIGN;
    (rows.min(n_rows), mem_per_row)
}

/// Reject metrics that cannot drive cluster assignment.
pub(crate) fn ensure_metric(metric: DistanceType) -> Result<()> {
    if metric.is_supported() {
        Ok(())
    } else {
        Err(BalancedKMeansError::UnsupportedMetric(metric))
    }
}

/// Nearest centre of each row of one converted minibatch.
///
/// `batch_norms` and `center_norms` must be present for L2 metrics;
/// `distances` must be a `(rows, n_clusters)` block for inner product.
#[allow(clippy::too_many_arguments)]
pub(crate) fn predict_core(
    ctx: &dyn ExecutionContext,
    metric: DistanceType,
    centers: &ArrayView2<f32>,
    center_norms: Option<&ArrayView1<f32>>,
    batch: &ArrayView2<f32>,
    batch_norms: Option<&ArrayView1<f32>>,
    distances: Option<&mut Array2<f32>>,
    out: &mut [(usize, f32)],
) -> Result<()> {
    match metric {
        DistanceType::L2Expanded | DistanceType::L2SqrtExpanded => {
            let (Some(cn), Some(bn)) = (center_norms, batch_norms) else {
                return Err(BalancedKMeansError::InvalidDimensions(
                    "L2 assignment needs centre and row norms".to_string(),
                ));
            };
            ctx.fused_nearest_reduce(
                batch,
                centers,
                bn,
                cn,
                metric == DistanceType::L2SqrtExpanded,
                true,
                out,
            )
        }
        DistanceType::InnerProduct => {
            let Some(distances) = distances else {
                return Err(BalancedKMeansError::InvalidDimensions(
                    "inner product assignment needs a distance block".to_string(),
                ));
            };
            let mut block = distances.slice_mut(s![..batch.nrows(), ..]);
            ctx.gemm_nt(-1.0, batch, centers, &mut block)?;
            row_argmin(&block.view(), out);
            Ok(())
        }
        other => Err(BalancedKMeansError::UnsupportedMetric(other)),
    }
}

/// Assign every row of `dataset` to its nearest centre.
///
/// # Arguments
///
/// * `ctx` - Execution context providing the distance primitives
/// * `params` - Run parameters; `metric` and `minibatch_budget_bytes` are used
/// * `centers` - Cluster centres `(k, dim)`
/// * `dataset` - Rows to assign `(n_rows, dim)`
/// * `dataset_norms` - Optional squared norms of the mapped rows (L2 only)
/// * `labels` - Output, one label per row
///
/// # Errors
///
/// Fails on unsupported metrics, shape mismatches, label types too narrow for
/// `k`, and residency mismatches.
pub fn predict<T: Element, L: Label>(
    ctx: &dyn ExecutionContext,
    params: &BalancedParams,
    centers: &ArrayView2<f32>,
    dataset: &ArrayView2<T>,
    dataset_norms: Option<&ArrayView1<f32>>,
    labels: &mut [L],
) -> Result<()> {
    let metric = params.metric;
    ensure_metric(metric)?;

    let (n_rows, dim) = dataset.dim();
    let n_clusters = centers.nrows();
    if n_clusters == 0 {
        return Err(BalancedKMeansError::InvalidK(
            "predict needs at least one centre".to_string(),
        ));
    }
    if centers.ncols() != dim {
        return Err(BalancedKMeansError::InvalidDimensions(format!(
            "Expected {} features, got {}",
            centers.ncols(),
            dim
        )));
    }
    if labels.len() != n_rows {
        return Err(BalancedKMeansError::InvalidDimensions(format!(
            "{} labels for {} rows",
            labels.len(),
            n_rows
        )));
    }
    if let Some(norms) = dataset_norms {
        if norms.len() != n_rows {
            return Err(BalancedKMeansError::InvalidDimensions(format!(
                "{} row norms for {} rows",
                norms.len(),
                n_rows
            )));
        }
    }
    check_addressable::<L>(n_rows, dim, n_clusters)?;
    ensure_accepts(ctx, classify_inputs(&[centers, dataset, &labels])?)?;
    if n_rows == 0 {
        return Ok(());
    }

    let (minibatch, _) = calc_minibatch_size(
        n_clusters,
        n_rows,
        dim,
        metric,
        T::NEEDS_CONVERSION,
        params.minibatch_budget_bytes,
    );

    let center_norms = if metric.is_l2_family() {
        let mut norms = Array1::zeros(n_clusters);
        ctx.row_norms(centers, norms.view_mut())?;
        Some(norms)
    } else {
        None
    };

    // Scratch reused by every minibatch
    let mut converted = if T::NEEDS_CONVERSION {
        Array2::<f32>::zeros((minibatch, dim))
    } else {
        Array2::<f32>::zeros((0, dim))
    };
    let mut batch_norm_buf = if metric.is_l2_family() && dataset_norms.is_none() {
        Array1::<f32>::zeros(minibatch)
    } else {
        Array1::<f32>::zeros(0)
    };
    let mut distances = if metric.is_l2_family() {
        None
    } else {
        Some(Array2::<f32>::zeros((minibatch, n_clusters)))
    };
    let mut nearest = vec![(0usize, 0.0f32); minibatch];

    let mut offset = 0;
    while offset < n_rows {
        let end = (offset + minibatch).min(n_rows);
        let rows = end - offset;
        let stored = dataset.slice(s![offset..end, ..]);

        let batch = match T::as_math(&stored) {
            Some(view) => view,
            None => {
                let mut dst = converted.slice_mut(s![..rows, ..]);
                map_matrix_into(&stored, &mut dst);
                converted.slice(s![..rows, ..])
            }
        };

        let batch_norms = match (metric.is_l2_family(), dataset_norms) {
            (false, _) => None,
            (true, Some(norms)) => Some(norms.slice(s![offset..end])),
            (true, None) => {
                ctx.row_norms(&batch, batch_norm_buf.slice_mut(s![..rows]))?;
                Some(batch_norm_buf.slice(s![..rows]))
            }
        };

        predict_core(
            ctx,
            metric,
            centers,
            center_norms.as_ref().map(|n| n.view()).as_ref(),
            &batch,
            batch_norms.as_ref(),
            distances.as_mut(),
            &mut nearest[..rows],
        )?;

        labels[offset..end]
            .par_iter_mut()
            .zip(nearest[..rows].par_iter())
            .for_each(|(l, &(idx, _))| *l = L::from_index(idx));

        offset = end;
    }

    Ok(())
}

/// Squared L2 norms of the mapped rows of `dataset`, computed one minibatch
/// at a time.
pub fn compute_norm<T: Element>(
    ctx: &dyn ExecutionContext,
    dataset: &ArrayView2<T>,
    minibatch: usize,
    mut out: ArrayViewMut1<f32>,
) -> Result<()> {
    let (n_rows, dim) = dataset.dim();
    if out.len() != n_rows {
        return Err(BalancedKMeansError::InvalidDimensions(format!(
            "{} norm slots for {} rows",
            out.len(),
            n_rows
        )));
    }
    let minibatch = minibatch.clamp(1, n_rows.max(1));
    let mut converted = if T::NEEDS_CONVERSION {
        Array2::<f32>::zeros((minibatch, dim))
    } else {
        Array2::<f32>::zeros((0, dim))
    };

    let mut offset = 0;
    while offset < n_rows {
        let end = (offset + minibatch).min(n_rows);
        let stored = dataset.slice(s![offset..end, ..]);
        let target = out.slice_mut(s![offset..end]);
        match T::as_math(&stored) {
            Some(view) => ctx.row_norms(&view, target)?,
            None => {
                let mut dst = converted.slice_mut(s![..end - offset, ..]);
                map_matrix_into(&stored, &mut dst);
                ctx.row_norms(&converted.slice(s![..end - offset, ..]), target)?;
            }
        }
        offset = end;
    }
    Ok(())
}

/// Index of the euclidean-nearest row of `y` for every row of `x`.
pub fn fused_l2_nn_argmin(x: &ArrayView2<f32>, y: &ArrayView2<f32>, sqrt: bool) -> Result<Array1<usize>> {
    let ctx = HostContext;
    if x.ncols() != y.ncols() {
        return Err(BalancedKMeansError::InvalidDimensions(format!(
            "Expected {} features, got {}",
            y.ncols(),
            x.ncols()
        )));
    }
    let xn = compute_squared_norms(x);
    let yn = compute_squared_norms(y);

    let mut nearest = vec![(0usize, 0.0f32); x.nrows()];
    ctx.fused_nearest_reduce(x, y, &xn.view(), &yn.view(), sqrt, true, &mut nearest)?;
    Ok(nearest.into_iter().map(|(idx, _)| idx).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn brute_force(data: &ArrayView2<f32>, centers: &ArrayView2<f32>, metric: DistanceType) -> Vec<usize> {
        data.rows()
            .into_iter()
            .map(|row| {
                let mut best = (0, f32::INFINITY);
                for (j, c) in centers.rows().into_iter().enumerate() {
                    let d = match metric {
                        DistanceType::InnerProduct => -row.dot(&c),
                        _ => row.iter().zip(c.iter()).map(|(a, b)| (a - b) * (a - b)).sum(),
                    };
                    if d < best.1 {
                        best = (j, d);
                    }
                }
                best.0
            })
            .collect()
    }

    #[test]
    fn test_minibatch_size_is_aligned_and_capped() {
        let (rows, per_row) = calc_minibatch_size(100, 1_000_000, 32, DistanceType::L2Expanded, false, 1 << 20);
        assert_eq!(per_row, 4 + size_of::<(usize, f32)>());
        assert_eq!(rows % 64, 0);
        assert!(rows >= (1 << 20) / per_row);

        let (rows, per_row) = calc_minibatch_size(100, 1_000_000, 32, DistanceType::InnerProduct, true, 1 << 20);
        assert_eq!(per_row, 4 * 100 + 4 * 32);
        assert_eq!(rows, ((1 << 20) / per_row).div_ceil(64) * 64);

        let (rows, _) = calc_minibatch_size(8, 10, 4, DistanceType::L2Expanded, false, 1 << 30);
        assert_eq!(rows, 10);

        // A budget smaller than one row still makes progress
        let (rows, _) = calc_minibatch_size(1 << 20, 1000, 4, DistanceType::InnerProduct, false, 16);
        assert_eq!(rows, 64);
    }

    #[test]
    fn test_predict_matches_brute_force() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let data = Array2::random_using((500, 12), Uniform::new(-1.0f32, 1.0), &mut rng);
        let centers = Array2::random_using((17, 12), Uniform::new(-1.0f32, 1.0), &mut rng);

        for metric in [
            DistanceType::L2Expanded,
            DistanceType::L2SqrtExpanded,
            DistanceType::InnerProduct,
        ] {
            // A tiny budget forces many minibatches
            let params = BalancedParams::default()
                .with_metric(metric)
                .with_minibatch_budget_bytes(4096);
            let mut labels = vec![0u32; 500];
            predict(&HostContext, &params, &centers.view(), &data.view(), None, &mut labels).unwrap();

            let expected = brute_force(&data.view(), &centers.view(), metric);
            let mismatches = labels
                .iter()
                .zip(&expected)
                .filter(|(a, b)| **a as usize != **b)
                .count();
            // The expanded L2 form may flip near-ties
            assert!(mismatches <= 2, "{:?}: {} mismatches", metric, mismatches);
        }
    }

    #[test]
    fn test_predict_ties_pick_lowest_index() {
        let centers = array![[1.0f32, 0.0], [-1.0, 0.0], [1.0, 0.0]];
        let data = array![[0.0f32, 3.0], [2.0, 0.0]];
        let mut labels = vec![9u8; 2];
        predict(
            &HostContext,
            &BalancedParams::default(),
            &centers.view(),
            &data.view(),
            None,
            &mut labels,
        )
        .unwrap();
        assert_eq!(labels, vec![0, 0]);
    }

    #[test]
    fn test_predict_quantized_uses_mapped_values() {
        // 64/128 = 0.5 is closer to centre 1
        let data = array![[64i8, 64], [-128, -128]];
        let centers = array![[0.0f32, 0.0], [0.5, 0.5], [-1.0, -1.0]];
        let mut labels = vec![0i32; 2];
        predict(
            &HostContext,
            &BalancedParams::default(),
            &centers.view(),
            &data.view(),
            None,
            &mut labels,
        )
        .unwrap();
        assert_eq!(labels, vec![1, 2]);
    }

    #[test]
    fn test_predict_rejects_unsupported_metric() {
        let centers = array![[0.0f32, 0.0]];
        let data = array![[1.0f32, 1.0]];
        let mut labels = vec![0u32; 1];
        for metric in [DistanceType::CosineExpanded, DistanceType::L1, DistanceType::L2Unexpanded] {
            let params = BalancedParams::default().with_metric(metric);
            let r = predict(&HostContext, &params, &centers.view(), &data.view(), None, &mut labels);
            assert!(matches!(r, Err(BalancedKMeansError::UnsupportedMetric(m)) if m == metric));
        }
    }

    #[test]
    fn test_predict_uses_supplied_norms() {
        let data = array![[0.0f32, 1.0], [5.0, 5.0]];
        let centers = array![[0.0f32, 0.0], [5.0, 5.0]];
        let mut norms = Array1::zeros(2);
        compute_norm(&HostContext, &data.view(), 1, norms.view_mut()).unwrap();
        let mut labels = vec![0u32; 2];
        predict(
            &HostContext,
            &BalancedParams::default(),
            &centers.view(),
            &data.view(),
            Some(&norms.view()),
            &mut labels,
        )
        .unwrap();
        assert_eq!(labels, vec![0, 1]);
    }

    #[test]
    fn test_compute_norm_quantized() {
        let data = array![[128u8, 0], [64, 64]];
        let mut norms = Array1::zeros(2);
        compute_norm(&HostContext, &data.view(), 64, norms.view_mut()).unwrap();
        approx::assert_relative_eq!(norms[0], 0.25);
        approx::assert_relative_eq!(norms[1], 0.125);
    }

    #[test]
    fn test_fused_l2_nn_argmin() {
        let x = array![[0.1f32, 0.1], [0.9, 0.8], [0.4, 0.6]];
        let y = array![[0.0f32, 0.0], [1.0, 1.0], [0.5, 0.5]];
        let idx = fused_l2_nn_argmin(&x.view(), &y.view(), true).unwrap();
        assert_eq!(idx.to_vec(), vec![0, 1, 2]);
    }
}
