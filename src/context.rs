//! Execution contexts.
//!
//! The clustering core never touches a distance kernel directly. It asks an
//! [`ExecutionContext`] for the handful of dense primitives it needs, so the
//! same EM loop runs on the rayon host kernels or, with the `cuda` feature,
//! on cuBLAS and NVRTC kernels.

use crate::distance::{fused_l2_nearest, squared_norms_into, ROW_TILE};
use crate::error::{BalancedKMeansError, Result};
use crate::residency::Residency;
use ndarray::linalg::general_mat_mul;
use ndarray::parallel::prelude::*;
use ndarray::{ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis};

/// Dense primitives consumed by predict.
///
/// All matrices are row-major `f32` views in host memory. A device context
/// stages them itself; see [`ExecutionContext::accepts`].
pub trait ExecutionContext: Sync {
    /// Short name used in log messages.
    fn name(&self) -> &'static str;

    /// Memory space the context executes in.
    fn residency(&self) -> Residency;

    /// Whether inputs of the given residency can be handed to this context.
    fn accepts(&self, inputs: Residency) -> bool {
        inputs.host_accessible()
    }

    /// `out = alpha * a * b^T`, with `a: (m, k)`, `b: (n, k)`, `out: (m, n)`.
    fn gemm_nt(
        &self,
        alpha: f32,
        a: &ArrayView2<f32>,
        b: &ArrayView2<f32>,
        out: &mut ArrayViewMut2<f32>,
    ) -> Result<()>;

    /// Nearest centre of every data row under (squared) euclidean distance,
    /// as `(index, distance)`; the lowest index wins ties.
    #[allow(clippy::too_many_arguments)]
    fn fused_nearest_reduce(
        &self,
        data: &ArrayView2<f32>,
        centers: &ArrayView2<f32>,
        data_norms: &ArrayView1<f32>,
        center_norms: &ArrayView1<f32>,
        sqrt: bool,
        initialize: bool,
        out: &mut [(usize, f32)],
    ) -> Result<()>;

    /// Squared L2 norm of every row.
    fn row_norms(&self, matrix: &ArrayView2<f32>, out: ArrayViewMut1<f32>) -> Result<()>;
}

/// Check that a context can run on inputs of the given residency.
pub(crate) fn ensure_accepts(ctx: &dyn ExecutionContext, inputs: Residency) -> Result<()> {
    if ctx.accepts(inputs) {
        Ok(())
    } else {
        Err(BalancedKMeansError::ResidencyMismatch {
            found: inputs,
            other: ctx.residency(),
        })
    }
}

/// Data-parallel host kernels built on rayon and ndarray.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostContext;

impl HostContext {
    pub fn new() -> Self {
        Self
    }
}

impl ExecutionContext for HostContext {
    fn name(&self) -> &'static str {
        "host"
    }

    fn residency(&self) -> Residency {
        Residency::Host
    }

    fn gemm_nt(
        &self,
        alpha: f32,
        a: &ArrayView2<f32>,
        b: &ArrayView2<f32>,
        out: &mut ArrayViewMut2<f32>,
    ) -> Result<()> {
        if a.ncols() != b.ncols() || out.dim() != (a.nrows(), b.nrows()) {
            return Err(BalancedKMeansError::InvalidDimensions(format!(
                "gemm: a {:?}, b {:?}, out {:?}",
                a.dim(),
                b.dim(),
                out.dim()
            )));
        }
        let bt = b.t();
        out.axis_chunks_iter_mut(Axis(0), ROW_TILE)
            .into_par_iter()
            .zip(a.axis_chunks_iter(Axis(0), ROW_TILE).into_par_iter())
            .for_each(|(mut c, a_tile)| general_mat_mul(alpha, &a_tile, &bt, 0.0, &mut c));
        Ok(())
    }

    fn fused_nearest_reduce(
        &self,
        data: &ArrayView2<f32>,
        centers: &ArrayView2<f32>,
        data_norms: &ArrayView1<f32>,
        center_norms: &ArrayView1<f32>,
        sqrt: bool,
        initialize: bool,
        out: &mut [(usize, f32)],
    ) -> Result<()> {
        if data.ncols() != centers.ncols()
            || data_norms.len() != data.nrows()
            || center_norms.len() != centers.nrows()
            || out.len() != data.nrows()
        {
            return Err(BalancedKMeansError::InvalidDimensions(format!(
                "fused nearest: data {:?}, centers {:?}, {} data norms, {} center norms, {} outputs",
                data.dim(),
                centers.dim(),
                data_norms.len(),
                center_norms.len(),
                out.len()
            )));
        }
        fused_l2_nearest(
            data,
            centers,
            data_norms,
            center_norms,
            0,
            sqrt,
            initialize,
            out,
        );
        Ok(())
    }

    fn row_norms(&self, matrix: &ArrayView2<f32>, out: ArrayViewMut1<f32>) -> Result<()> {
        if out.len() != matrix.nrows() {
            return Err(BalancedKMeansError::InvalidDimensions(format!(
                "row norms: {} rows, {} outputs",
                matrix.nrows(),
                out.len()
            )));
        }
        squared_norms_into(matrix, out);
        Ok(())
    }
}
