//! Rebalancing of starved clusters.
//!
//! A cluster is starved when it holds at most `threshold` times the average
//! cluster size. Each starved centre is pulled a step towards a row taken from
//! a cluster of at least average size. Donor rows are found by walking the
//! dataset with a prime stride, which spreads consecutive picks across the
//! whole dataset without any random number generator.

use crate::context::{ensure_accepts, HostContext};
use crate::error::{BalancedKMeansError, Result};
use crate::mapping::{Element, Label};
use crate::residency::classify_inputs;
use log::trace;
use ndarray::{ArrayView2, ArrayViewMut2};

/// Probe strides, tried in order until one does not divide the row count.
const PRIMES: [usize; 40] = [
    29, 71, 113, 173, 229, 281, 349, 409, 463, 541, 601, 659, 733, 809, 863, 941, 1013, 1069,
    1151, 1223, 1291, 1373, 1451, 1511, 1583, 1657, 1733, 1811, 1889, 1987, 2053, 2129, 2213,
    2287, 2357, 2423, 2531, 2617, 2687, 2741,
];

/// Cap on the weight of the old centre when it is moved towards a donor.
pub const ADJUST_CENTERS_WEIGHT: f32 = 7.0;

/// Position of the donor probe sequence.
///
/// The cursor persists across the adjust calls of one EM run so successive
/// iterations keep walking the dataset instead of restarting at row 0.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProbeCursor {
    /// Last probed row
    pub row: usize,
    /// Index into the prime table of the last stride
    pub prime: usize,
}

impl ProbeCursor {
    /// Advance to the next prime that does not divide `n_rows` and return it.
    ///
    /// Falls back to a stride of 1 when every prime in the table divides `n_rows`.
    fn next_stride(&mut self, n_rows: usize) -> usize {
        for _ in 0..PRIMES.len() {
            self.prime = (self.prime + 1) % PRIMES.len();
            let p = PRIMES[self.prime];
            if n_rows % p != 0 {
                return p;
            }
        }
        1
    }

    /// Walk the probe sequence until a row of a large enough cluster is found.
    fn next_donor<L: Label>(
        &mut self,
        stride: usize,
        labels: &[L],
        sizes: &[u32],
        average: u32,
    ) -> Option<usize> {
        let n_rows = labels.len();
        for _ in 0..n_rows {
            self.row = (self.row + stride) % n_rows;
            if sizes[labels[self.row].index()] >= average {
                return Some(self.row);
            }
        }
        None
    }
}

/// Move every starved centre towards a donor row.
///
/// # Arguments
///
/// * `centers` - Cluster centres `(k, dim)`, updated in place
/// * `sizes` - Cluster sizes from the last aggregation
/// * `dataset` - Rows `(n_rows, dim)`, mapped to `f32` on read
/// * `labels` - Labels from the last assignment
/// * `threshold` - Fraction of the average size below which a cluster is starved, in `[0, 1)`
/// * `cursor` - Probe position, carried between calls of one run
///
/// Returns whether any centre was changed.
pub fn adjust_centers<T: Element, L: Label>(
    centers: &mut ArrayViewMut2<f32>,
    sizes: &[u32],
    dataset: &ArrayView2<T>,
    labels: &[L],
    threshold: f32,
    cursor: &mut ProbeCursor,
) -> Result<bool> {
    if !(0.0..1.0).contains(&threshold) {
        return Err(BalancedKMeansError::UnsupportedConfig(format!(
            "rebalancing threshold must be in [0, 1), got {}",
            threshold
        )));
    }
    let (n_clusters, dim) = centers.dim();
    let n_rows = dataset.nrows();
    if sizes.len() != n_clusters || dataset.ncols() != dim || labels.len() != n_rows {
        return Err(BalancedKMeansError::InvalidDimensions(format!(
            "adjust: centers {:?}, {} sizes, dataset {:?}, {} labels",
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
    if n_rows == 0 || n_clusters == 0 {
        return Ok(false);
    }

    let average = (n_rows / n_clusters) as u32;
    let starved_limit = average as f32 * threshold;
    let stride = cursor.next_stride(n_rows);

    let mut adjusted = false;
    for (l, mut center) in centers.rows_mut().into_iter().enumerate() {
        let size = sizes[l];
        if size as f32 > starved_limit {
            continue;
        }
        let Some(donor) = cursor.next_donor(stride, labels, sizes, average) else {
            // No cluster reaches the average, nothing can be donated
            return Ok(adjusted);
        };
        trace!("adjust: cluster {} (size {}) takes row {}", l, size, donor);

        let wc = (size as f32).min(ADJUST_CENTERS_WEIGHT);
        for (c, &v) in center.iter_mut().zip(dataset.row(donor).iter()) {
            *c = (wc * *c + v.to_math()) / (wc + 1.0);
        }
        adjusted = true;
    }
    Ok(adjusted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    #[test]
    fn test_stride_skips_divisors() {
        let mut cursor = ProbeCursor::default();
        // 71 divides 71 * 113, 113 too, so the third prime is picked
        assert_eq!(cursor.next_stride(71 * 113), 173);
        assert_eq!(cursor.prime, 3);

        let mut cursor = ProbeCursor {
            row: 0,
            prime: PRIMES.len() - 1,
        };
        assert_eq!(cursor.next_stride(1000), 29);
        assert_eq!(cursor.prime, 0);
    }

    #[test]
    fn test_no_starved_cluster_is_untouched() {
        let data = array![[0.0f32], [1.0], [2.0], [3.0]];
        let labels = vec![0u32, 0, 1, 1];
        let mut centers = array![[0.5f32], [2.5]];
        let before = centers.clone();
        let mut cursor = ProbeCursor::default();
        let changed =
            adjust_centers(&mut centers.view_mut(), &[2, 2], &data.view(), &labels, 0.25, &mut cursor).unwrap();
        assert!(!changed);
        assert_eq!(centers, before);
    }

    #[test]
    fn test_empty_cluster_jumps_to_donor() {
        let data = Array2::from_shape_fn((100, 2), |(i, j)| (i * 2 + j) as f32);
        let labels = vec![0u32; 100];
        let mut centers = array![[1.0f32, 1.0], [-50.0, -50.0]];
        let mut cursor = ProbeCursor::default();
        let changed =
            adjust_centers(&mut centers.view_mut(), &[100, 0], &data.view(), &labels, 0.25, &mut cursor).unwrap();

        assert!(changed);
        // Weight of an empty cluster is zero, it lands on the donor row
        assert_eq!(cursor.row, 71);
        assert_eq!(centers.row(1), data.row(71));
        assert_eq!(centers.row(0), array![1.0f32, 1.0]);
    }

    #[test]
    fn test_weighted_step() {
        // 30 rows, 3 clusters: average 10, starved at <= 2.5
        let data = Array2::from_shape_fn((30, 1), |(i, _)| i as f32);
        let mut labels = vec![0u32; 30];
        for l in labels.iter_mut().skip(14) {
            *l = 1;
        }
        labels[29] = 2;
        labels[28] = 2;
        let sizes = [14u32, 14, 2];
        let mut centers = array![[6.5f32], [20.5], [28.5]];
        let mut cursor = ProbeCursor::default();
        adjust_centers(&mut centers.view_mut(), &sizes, &data.view(), &labels, 0.25, &mut cursor).unwrap();

        // 30 % 71 != 0, stride 71 lands on row 71 % 30 = 11
        let donor = 11.0;
        assert_abs_diff_eq!(centers[[2, 0]], (2.0 * 28.5 + donor) / 3.0, epsilon = 1e-5);
    }

    #[test]
    fn test_donor_never_from_small_cluster() {
        let n = 997;
        let data = Array2::from_shape_fn((n, 1), |(i, _)| i as f32);
        // Cluster 0 holds the even rows, cluster 1 the odd ones except a few,
        // clusters 2 and 3 are tiny
        let labels: Vec<u32> = (0..n)
            .map(|i| match i {
                5 => 2,
                7 | 9 => 3,
                _ if i % 2 == 0 => 0,
                _ => 1,
            })
            .collect();
        let mut sizes = [0u32; 4];
        labels.iter().for_each(|&l| sizes[l as usize] += 1);
        let average = (n / 4) as u32;

        let mut cursor = ProbeCursor::default();
        for _ in 0..50 {
            let mut centers = Array2::<f32>::from_elem((4, 1), -1.0);
            adjust_centers(&mut centers.view_mut(), &sizes, &data.view(), &labels, 0.25, &mut cursor).unwrap();
            // Cluster 2 has size 1, its centre moves half way from -1
            let donor = (2.0 * centers[[2, 0]] + 1.0).round() as usize;
            assert!(sizes[labels[donor] as usize] >= average);
            assert!(sizes[labels[cursor.row] as usize] >= average);
        }
    }

    #[test]
    fn test_threshold_range() {
        let data = array![[0.0f32]];
        let mut centers = array![[0.0f32]];
        let mut cursor = ProbeCursor::default();
        for t in [1.0f32, -0.1, f32::NAN] {
            let r = adjust_centers(&mut centers.view_mut(), &[1], &data.view(), &[0u32], t, &mut cursor);
            assert!(matches!(r, Err(BalancedKMeansError::UnsupportedConfig(_))));
        }
    }
}
