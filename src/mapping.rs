//! Element and label types.
//!
//! Datasets may be stored as `f32` or as 8-bit quantised integers. Clustering
//! always happens on `f32` values: a quantised element maps to
//! `raw / DIVISOR`, so `i8` covers `[-1, 1)` and `u8` covers `[0, 1)`.

use crate::error::{BalancedKMeansError, Result};
use ndarray::{ArrayView2, ArrayViewMut2, Zip};

/// Storage type of a dataset element.
pub trait Element: Copy + Send + Sync + 'static {
    /// Linear scale between the stored value and its working value.
    const DIVISOR: f32;

    /// Whether rows must be converted before distance computations.
    const NEEDS_CONVERSION: bool;

    /// Working (`f32`) value of a stored element.
    fn to_math(self) -> f32;

    /// Borrow a stored matrix as working values when no conversion is needed.
    fn as_math<'a>(_view: &ArrayView2<'a, Self>) -> Option<ArrayView2<'a, f32>> {
        None
    }
}

impl Element for f32 {
    const DIVISOR: f32 = 1.0;
    const NEEDS_CONVERSION: bool = false;

    #[inline]
    fn to_math(self) -> f32 {
        self
    }

    fn as_math<'a>(view: &ArrayView2<'a, Self>) -> Option<ArrayView2<'a, f32>> {
        Some(view.clone())
    }
}

impl Element for i8 {
    const DIVISOR: f32 = 128.0;
    const NEEDS_CONVERSION: bool = true;

    #[inline]
    fn to_math(self) -> f32 {
        self as f32 / Self::DIVISOR
    }
}

impl Element for u8 {
    const DIVISOR: f32 = 256.0;
    const NEEDS_CONVERSION: bool = true;

    #[inline]
    fn to_math(self) -> f32 {
        self as f32 / Self::DIVISOR
    }
}

/// Convert a block of stored rows into working values.
pub fn map_matrix_into<T: Element>(src: &ArrayView2<T>, dst: &mut ArrayViewMut2<f32>) {
    Zip::from(dst).and(src).par_for_each(|d, &s| *d = s.to_math());
}

/// Integer type used to store cluster labels.
pub trait Label: Copy + Send + Sync + PartialEq + std::fmt::Debug + 'static {
    /// Largest cluster index the type can hold.
    const MAX_INDEX: usize;

    fn from_index(index: usize) -> Self;

    fn index(self) -> usize;
}

macro_rules! impl_label {
    ($($t:ty),*) => {
        $(
            impl Label for $t {
                const MAX_INDEX: usize = if (<$t>::MAX as u128) < (usize::MAX as u128) {
                    <$t>::MAX as usize
                } else {
                    usize::MAX
                };

                #[inline]
                fn from_index(index: usize) -> Self {
                    index as $t
                }

                #[inline]
                fn index(self) -> usize {
                    self as usize
                }
            }
        )*
    };
}

impl_label!(u8, u16, u32, i32, i64, u64, usize);

/// Check that labels of type `L` can address `n_clusters` clusters and that
/// `n_rows * dim` elements are addressable.
pub fn check_addressable<L: Label>(n_rows: usize, dim: usize, n_clusters: usize) -> Result<()> {
    if n_clusters > 0 && n_clusters - 1 > L::MAX_INDEX {
        return Err(BalancedKMeansError::UnsupportedConfig(format!(
            "label type {} cannot represent {} clusters",
            std::any::type_name::<L>(),
            n_clusters
        )));
    }
    n_rows.checked_mul(dim).ok_or_else(|| {
        BalancedKMeansError::UnsupportedConfig(format!(
            "the index type cannot represent all {} x {} elements of the dataset",
            n_rows, dim
        ))
    })?;
    Ok(())
}
