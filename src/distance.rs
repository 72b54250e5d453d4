use crate::mapping::Label;
use ndarray::parallel::prelude::*;
use ndarray::{s, Array1, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis, Zip};
use rayon::prelude::*;

/// Rows handled by one rayon task in the row-wise kernels.
pub(crate) const ROW_TILE: usize = 64;

/// Centres compared against one row tile at a time in the fused reduction.
pub(crate) const CENTER_CHUNK: usize = 1024;

/// Norms below this are treated as zero when normalising rows.
const NORM_EPS: f32 = 1e-12;

/// Compute squared L2 norms for each row of a 2D array
/// Returns a 1D array where each element is the squared norm of the corresponding row
#[inline]
pub fn compute_squared_norms(data: &ArrayView2<f32>) -> Array1<f32> {
    let mut norms = Array1::zeros(data.nrows());
    squared_norms_into(data, norms.view_mut());
    norms
}

/// Write the squared L2 norm of every row of `data` into `out`.
pub fn squared_norms_into(data: &ArrayView2<f32>, mut out: ArrayViewMut1<f32>) {
    Zip::from(&mut out)
        .and(data.rows())
        .par_for_each(|norm, row| *norm = row.dot(&row));
}

/// Index of the smallest value of a row; the lowest index wins ties and NaN
/// never wins. Returns `(0, f32::INFINITY)` for an all-NaN or empty row.
#[inline]
pub fn argmin_row(row: ArrayView1<f32>) -> (usize, f32) {
    let mut best = (0, f32::INFINITY);
    for (j, &d) in row.iter().enumerate() {
        if d < best.1 {
            best = (j, d);
        }
    }
    best
}

/// Row-wise minimum reduction of a distance matrix.
pub fn row_argmin(distances: &ArrayView2<f32>, out: &mut [(usize, f32)]) {
    debug_assert_eq!(distances.nrows(), out.len());
    out.par_iter_mut()
        .zip(distances.axis_iter(Axis(0)).into_par_iter())
        .for_each(|(o, row)| *o = argmin_row(row));
}

/// Scale every row of `matrix` to unit L2 length. Rows with zero norm are left
/// untouched.
pub fn row_normalize(matrix: &mut ArrayViewMut2<f32>) {
    matrix.axis_iter_mut(Axis(0)).into_par_iter().for_each(|mut row| {
        let norm = row.dot(&row).sqrt();
        if norm > NORM_EPS {
            row.mapv_inplace(|v| v / norm);
        }
    });
}

/// Multiply row `i` of `matrix` by `factors[i]`.
pub fn rows_mul_vec(matrix: &mut ArrayViewMut2<f32>, factors: &ArrayView1<f32>) {
    Zip::from(matrix.rows_mut())
        .and(factors)
        .par_for_each(|mut row, &f| row.mapv_inplace(|v| v * f));
}

/// Divide row `i` of `matrix` by `divisors[i]`; rows with a zero divisor
/// become zero.
pub fn rows_div_vec_checkzero(matrix: &mut ArrayViewMut2<f32>, divisors: &ArrayView1<f32>) {
    Zip::from(matrix.rows_mut()).and(divisors).par_for_each(|mut row, &d| {
        if d == 0.0 {
            row.fill(0.0);
        } else {
            row.mapv_inplace(|v| v / d);
        }
    });
}

/// Number of labels equal to each cluster index.
pub fn count_labels<L: Label>(labels: &[L], n_clusters: usize) -> Vec<u32> {
    labels
        .par_chunks(ROW_TILE * 64)
        .map(|chunk| {
            let mut counts = vec![0u32; n_clusters];
            for &l in chunk {
                counts[l.index()] += 1;
            }
            counts
        })
        .reduce(
            || vec![0u32; n_clusters],
            |mut a, b| {
                a.iter_mut().zip(b).for_each(|(x, y)| *x += y);
                a
            },
        )
}

/// Find the nearest centroid of each row with the expanded L2 form
///
/// Uses the identity: ||x - c||^2 = ||x||^2 + ||c||^2 - 2*x.c
///
/// Rows are processed in tiles of [`ROW_TILE`] in parallel and centroids in
/// chunks of [`CENTER_CHUNK`], so the dot-product scratch per task stays
/// small. When `initialize` is false the reduction continues from the values
/// already in `out`, which lets callers stream centroids in several calls.
///
/// # Arguments
/// * `data` - Data points (n_data, n_features)
/// * `centroids` - Centroids (k, n_features)
/// * `data_norms` - Squared norms of data points (n_data,)
/// * `centroid_norms` - Squared norms of centroids (k,)
/// * `index_offset` - Global index of the first centroid
/// * `sqrt` - Report euclidean rather than squared euclidean distances
/// * `initialize` - Start from an empty reduction instead of `out`
/// * `out` - `(index, distance)` per data point
#[allow(clippy::too_many_arguments)]
pub fn fused_l2_nearest(
    data: &ArrayView2<f32>,
    centroids: &ArrayView2<f32>,
    data_norms: &ArrayView1<f32>,
    centroid_norms: &ArrayView1<f32>,
    index_offset: usize,
    sqrt: bool,
    initialize: bool,
    out: &mut [(usize, f32)],
) {
    let k = centroids.nrows();

    out.par_chunks_mut(ROW_TILE)
        .enumerate()
        .for_each(|(tile, best)| {
            let start = tile * ROW_TILE;
            let rows = data.slice(s![start..start + best.len(), ..]);
            if initialize {
                best.fill((0, f32::INFINITY));
            } else if sqrt {
                // Compare in squared space, the stored distances are roots
                best.iter_mut().for_each(|b| b.1 *= b.1);
            }

            let mut c_start = 0;
            while c_start < k {
                let c_end = (c_start + CENTER_CHUNK).min(k);
                let dots = rows.dot(&centroids.slice(s![c_start..c_end, ..]).t());

                for (i, b) in best.iter_mut().enumerate() {
                    let x_norm = data_norms[start + i];
                    for (j, &dot) in dots.row(i).iter().enumerate() {
                        let dist = x_norm + centroid_norms[c_start + j] - 2.0 * dot;
                        if dist < b.1 {
                            *b = (index_offset + c_start + j, dist);
                        }
                    }
                }
                c_start = c_end;
            }

            // Rounding can push the expanded form slightly below zero
            for b in best.iter_mut() {
                b.1 = b.1.max(0.0);
                if sqrt {
                    b.1 = b.1.sqrt();
                }
            }
        });
}

/// Compute centroid shift (sum of L2 norms of centroid movements)
pub fn compute_centroid_shift(
    old_centroids: &ArrayView2<f32>,
    new_centroids: &ArrayView2<f32>,
) -> f64 {
    let k = old_centroids.nrows();

    let shifts: f64 = (0..k)
        .into_par_iter()
        .map(|i| {
            let old_c = old_centroids.row(i);
            let new_c = new_centroids.row(i);

            let mut diff_sq = 0.0f64;
            for j in 0..old_c.len() {
                let d = (new_c[j] - old_c[j]) as f64;
                diff_sq += d * d;
            }
            diff_sq.sqrt()
        })
        .sum();

    shifts
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{array, Array2};

    #[test]
    fn test_compute_squared_norms() {
        let data = array![[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let norms = compute_squared_norms(&data.view());

        assert_relative_eq!(norms[0], 1.0 + 4.0 + 9.0, epsilon = 1e-6);
        assert_relative_eq!(norms[1], 16.0 + 25.0 + 36.0, epsilon = 1e-6);
    }

    #[test]
    fn test_argmin_ties_pick_lowest_index() {
        let (idx, d) = argmin_row(array![3.0f32, 1.0, 1.0, 2.0].view());
        assert_eq!(idx, 1);
        assert_relative_eq!(d, 1.0);

        let (idx, _) = argmin_row(array![f32::NAN, 5.0, 5.0].view());
        assert_eq!(idx, 1);
    }

    #[test]
    fn test_row_argmin() {
        let dists = array![[1.0f32, 0.5, 0.5], [0.0, 0.0, -1.0]];
        let mut out = vec![(0, 0.0); 2];
        row_argmin(&dists.view(), &mut out);
        assert_eq!(out[0].0, 1);
        assert_eq!(out[1].0, 2);
    }

    #[test]
    fn test_find_nearest_centroids() {
        // Simple 2D case
        let data = array![[0.0f32, 0.0], [10.0, 10.0], [5.0, 5.0]];
        let centroids = array![[0.0f32, 0.0], [10.0, 10.0]];

        let data_norms = compute_squared_norms(&data.view());
        let centroid_norms = compute_squared_norms(&centroids.view());

        let mut out = vec![(0, 0.0); 3];
        fused_l2_nearest(
            &data.view(),
            &centroids.view(),
            &data_norms.view(),
            &centroid_norms.view(),
            0,
            false,
            true,
            &mut out,
        );

        assert_eq!(out[0].0, 0); // (0,0) closest to centroid 0
        assert_eq!(out[1].0, 1); // (10,10) closest to centroid 1
        assert_eq!(out[2].0, 0); // (5,5) is equidistant, the lower index wins
        assert_relative_eq!(out[2].1, 50.0, epsilon = 1e-4);
    }

    #[test]
    fn test_fused_streamed_centroids_match_single_pass() {
        let data = array![[1.0f32, 1.0], [-3.0, 0.5], [4.0, -4.0]];
        let centroids = array![[0.0f32, 0.0], [-3.0, 0.0], [5.0, -5.0], [1.0, 1.5]];
        let dn = compute_squared_norms(&data.view());
        let cn = compute_squared_norms(&centroids.view());

        let mut single = vec![(0, 0.0); 3];
        fused_l2_nearest(
            &data.view(),
            &centroids.view(),
            &dn.view(),
            &cn.view(),
            0,
            true,
            true,
            &mut single,
        );

        let mut streamed = vec![(0, 0.0); 3];
        for offset in [0usize, 2] {
            fused_l2_nearest(
                &data.view(),
                &centroids.slice(s![offset..offset + 2, ..]),
                &dn.view(),
                &cn.slice(s![offset..offset + 2]),
                offset,
                true,
                offset == 0,
                &mut streamed,
            );
        }
        for (a, b) in single.iter().zip(&streamed) {
            assert_eq!(a.0, b.0);
            assert_relative_eq!(a.1, b.1, epsilon = 1e-4);
        }
        assert_eq!(single[0].0, 3);
        assert_eq!(single[1].0, 1);
        assert_eq!(single[2].0, 2);
    }

    #[test]
    fn test_row_normalize_and_masked_ops() {
        let mut m: Array2<f32> = array![[3.0, 4.0], [0.0, 0.0], [1.0, 1.0]];
        row_normalize(&mut m.view_mut());
        assert_relative_eq!(m[[0, 0]], 0.6, epsilon = 1e-6);
        assert_relative_eq!(m[[1, 1]], 0.0);

        let mut c: Array2<f32> = array![[2.0, 4.0], [1.0, 1.0]];
        rows_mul_vec(&mut c.view_mut(), &array![0.5f32, 3.0].view());
        assert_eq!(c, array![[1.0, 2.0], [3.0, 3.0]]);
        rows_div_vec_checkzero(&mut c.view_mut(), &array![2.0f32, 0.0].view());
        assert_eq!(c, array![[0.5, 1.0], [0.0, 0.0]]);
    }

    #[test]
    fn test_count_labels() {
        let labels = vec![0u32, 2, 2, 1, 2];
        assert_eq!(count_labels(&labels, 4), vec![1, 1, 3, 0]);
    }

    #[test]
    fn test_centroid_shift() {
        let old = array![[0.0f32, 0.0], [1.0, 1.0]];
        let new = array![[1.0f32, 0.0], [1.0, 1.0]];

        let shift = compute_centroid_shift(&old.view(), &new.view());
        assert_relative_eq!(shift, 1.0, epsilon = 1e-6);
    }
}
