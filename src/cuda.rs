//! CUDA execution context
//!
//! Runs the distance primitives of the clustering core on an NVIDIA GPU:
//! dot products through cuBLAS GEMM, row norms and the nearest-centre
//! reduction through NVRTC-compiled kernels. Inputs are host matrices that are
//! staged to the device one call at a time, so device memory only ever holds a
//! single minibatch and one chunk of centres.
//!
//! Enable the `cuda` feature to use this functionality.
//!
//! # Example
//!
//! ```ignore
//! use balanced_kmeans::cuda::CudaContext;
//! use balanced_kmeans::BalancedKMeans;
//! use ndarray::Array2;
//! use ndarray_rand::RandomExt;
//! use ndarray_rand::rand_distr::Uniform;
//!
//! let data = Array2::random((10000, 128), Uniform::new(-1.0f32, 1.0));
//!
//! let mut kmeans = BalancedKMeans::new(128, 50).with_context(CudaContext::new(0).unwrap());
//! kmeans.train(&data.view()).unwrap();
//!
//! let labels = kmeans.predict(&data.view()).unwrap();
//! ```

use crate::context::ExecutionContext;
use crate::distance::CENTER_CHUNK;
use crate::error::{BalancedKMeansError, Result};
use crate::residency::Residency;
use cudarc::cublas::sys::cublasOperation_t;
use cudarc::cublas::{CudaBlas, Gemm, GemmConfig};
use cudarc::driver::{CudaDevice, CudaFunction, CudaSlice, LaunchAsync, LaunchConfig};
use cudarc::nvrtc::compile_ptx;
use log::debug;
use ndarray::{s, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2};
use std::sync::Arc;

/// CUDA kernels for the distance primitives
const CUDA_KERNELS: &str = r#"
extern "C" __global__ void compute_squared_norms(
    const float* data,
    float* norms,
    int n_samples,
    int n_features
) {
    int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx < n_samples) {
        float sum = 0.0f;
        const float* row = data + (long long)idx * n_features;
        for (int j = 0; j < n_features; j++) {
            float val = row[j];
            sum += val * val;
        }
        norms[idx] = sum;
    }
}

extern "C" __global__ void init_nearest(
    long long* labels,
    float* best_dists,
    int n_samples
) {
    int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx < n_samples) {
        labels[idx] = 0;
        best_dists[idx] = 3.4028235e+38f;  // FLT_MAX
    }
}

extern "C" __global__ void find_nearest_centroids(
    const float* data_norms,
    const float* centroid_norms,
    const float* dot_products,
    long long* labels,
    float* best_dists,
    int n_data,
    int n_centroids,
    int centroid_offset
) {
    int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx < n_data) {
        float x_norm = data_norms[idx];
        float best_dist = best_dists[idx];
        long long best_label = labels[idx];

        for (int j = 0; j < n_centroids; j++) {
            float c_norm = centroid_norms[j];
            float dot = dot_products[(long long)idx * n_centroids + j];
            float dist = x_norm + c_norm - 2.0f * dot;

            if (dist < best_dist) {
                best_dist = dist;
                best_label = centroid_offset + j;
            }
        }

        best_dists[idx] = best_dist;
        labels[idx] = best_label;
    }
}

extern "C" __global__ void finalize_dists(
    float* best_dists,
    int n_samples,
    int take_sqrt
) {
    int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx < n_samples) {
        float d = fmaxf(best_dists[idx], 0.0f);
        best_dists[idx] = take_sqrt ? sqrtf(d) : d;
    }
}
"#;

const MODULE_NAME: &str = "balanced_kmeans_kernels";

const KERNEL_NAMES: [&str; 4] = [
    "compute_squared_norms",
    "init_nearest",
    "find_nearest_centroids",
    "finalize_dists",
];

const BLOCK_SIZE: usize = 256;

fn launch_config(n: usize) -> LaunchConfig {
    LaunchConfig {
        block_dim: (BLOCK_SIZE as u32, 1, 1),
        grid_dim: (n.div_ceil(BLOCK_SIZE) as u32, 1, 1),
        shared_mem_bytes: 0,
    }
}

fn device_error<E: std::fmt::Display>(what: &'static str) -> impl FnOnce(E) -> BalancedKMeansError {
    move |e| BalancedKMeansError::Device(format!("{}: {}", what, e))
}

/// Execution context backed by one CUDA device
pub struct CudaContext {
    /// CUDA device
    device: Arc<CudaDevice>,

    /// cuBLAS handle
    blas: CudaBlas,

    /// Centres compared per GEMM in the nearest-centre reduction
    center_chunk: usize,
}

impl CudaContext {
    /// Open CUDA device `device_id` and compile the kernels.
    ///
    /// # Errors
    ///
    /// Returns [`BalancedKMeansError::Device`] if CUDA initialization fails.
    pub fn new(device_id: usize) -> Result<Self> {
        let device = CudaDevice::new(device_id).map_err(|e| {
            BalancedKMeansError::Device(format!(
                "Failed to initialize CUDA device {}: {}",
                device_id, e
            ))
        })?;

        let ptx = compile_ptx(CUDA_KERNELS).map_err(device_error("Failed to compile CUDA kernels"))?;
        device
            .load_ptx(ptx, MODULE_NAME, &KERNEL_NAMES)
            .map_err(device_error("Failed to load CUDA module"))?;

        let blas = CudaBlas::new(device.clone()).map_err(device_error("Failed to create cuBLAS handle"))?;
        debug!("CUDA context ready on device {}", device_id);

        Ok(Self {
            device,
            blas,
            center_chunk: CENTER_CHUNK,
        })
    }

    /// Set how many centres are compared per GEMM in the nearest-centre
    /// reduction.
    pub fn with_center_chunk(mut self, center_chunk: usize) -> Self {
        self.center_chunk = center_chunk.max(1);
        self
    }

    fn get_func(&self, name: &str) -> Result<CudaFunction> {
        self.device
            .get_func(MODULE_NAME, name)
            .ok_or_else(|| BalancedKMeansError::Device(format!("Failed to get CUDA function: {}", name)))
    }

    fn upload_matrix(&self, matrix: &ArrayView2<f32>) -> Result<CudaSlice<f32>> {
        let standard = matrix.as_standard_layout();
        match standard.as_slice() {
            Some(flat) => self
                .device
                .htod_sync_copy(flat)
                .map_err(device_error("Failed to copy matrix to GPU")),
            None => Err(BalancedKMeansError::Device(
                "standard layout matrix is not contiguous".to_string(),
            )),
        }
    }

    fn upload_vector(&self, vector: &ArrayView1<f32>) -> Result<CudaSlice<f32>> {
        self.device
            .htod_sync_copy(&vector.to_vec())
            .map_err(device_error("Failed to copy vector to GPU"))
    }

    /// Row-major `out = alpha * a * b^T` on device buffers.
    ///
    /// cuBLAS is column-major: the row-major `(m, n)` output is the
    /// column-major `(n, m)` matrix `b * a^T`.
    #[allow(clippy::too_many_arguments)]
    fn gemm_nt_device(
        &self,
        alpha: f32,
        d_a: &CudaSlice<f32>,
        d_b: &CudaSlice<f32>,
        d_out: &mut CudaSlice<f32>,
        m: usize,
        n: usize,
        k: usize,
    ) -> Result<()> {
        let gemm_cfg = GemmConfig {
            transa: cublasOperation_t::CUBLAS_OP_T,
            transb: cublasOperation_t::CUBLAS_OP_N,
            m: n as i32,
            n: m as i32,
            k: k as i32,
            alpha,
            lda: k as i32,
            ldb: k as i32,
            beta: 0.0f32,
            ldc: n as i32,
        };
        unsafe { self.blas.gemm(gemm_cfg, d_b, d_a, d_out) }.map_err(device_error("cuBLAS GEMM failed"))
    }
}

impl ExecutionContext for CudaContext {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn residency(&self) -> Residency {
        Residency::Device
    }

    fn gemm_nt(
        &self,
        alpha: f32,
        a: &ArrayView2<f32>,
        b: &ArrayView2<f32>,
        out: &mut ArrayViewMut2<f32>,
    ) -> Result<()> {
        let (m, k) = a.dim();
        let n = b.nrows();
        if b.ncols() != k || out.dim() != (m, n) {
            return Err(BalancedKMeansError::InvalidDimensions(format!(
                "gemm: a {:?}, b {:?}, out {:?}",
                a.dim(),
                b.dim(),
                out.dim()
            )));
        }
        if m == 0 || n == 0 {
            return Ok(());
        }
        if k == 0 {
            out.fill(0.0);
            return Ok(());
        }

        let d_a = self.upload_matrix(a)?;
        let d_b = self.upload_matrix(b)?;
        let mut d_out: CudaSlice<f32> = self
            .device
            .alloc_zeros(m * n)
            .map_err(device_error("Failed to allocate GEMM output"))?;
        self.gemm_nt_device(alpha, &d_a, &d_b, &mut d_out, m, n, k)?;

        let host = self
            .device
            .dtoh_sync_copy(&d_out)
            .map_err(device_error("Failed to copy GEMM output"))?;
        let result = ArrayView2::from_shape((m, n), &host[..])
            .map_err(|e| BalancedKMeansError::InvalidDimensions(e.to_string()))?;
        out.assign(&result);
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
        let (n_samples, n_features) = data.dim();
        let k = centers.nrows();
        if centers.ncols() != n_features
            || data_norms.len() != n_samples
            || center_norms.len() != k
            || out.len() != n_samples
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
        if n_samples == 0 {
            return Ok(());
        }

        let d_data = self.upload_matrix(data)?;
        let d_data_norms = self.upload_vector(data_norms)?;

        let (mut d_labels, mut d_best_dists) = if initialize {
            let mut d_labels: CudaSlice<i64> = self
                .device
                .alloc_zeros(n_samples)
                .map_err(device_error("Failed to allocate labels"))?;
            let mut d_best_dists: CudaSlice<f32> = self
                .device
                .alloc_zeros(n_samples)
                .map_err(device_error("Failed to allocate best_dists"))?;
            let func = self.get_func("init_nearest")?;
            unsafe {
                func.launch(
                    launch_config(n_samples),
                    (&mut d_labels, &mut d_best_dists, n_samples as i32),
                )
            }
            .map_err(device_error("Failed to launch kernel"))?;
            (d_labels, d_best_dists)
        } else {
            // Continue from the caller's reduction, compared in squared space
            let labels: Vec<i64> = out.iter().map(|&(l, _)| l as i64).collect();
            let dists: Vec<f32> = out
                .iter()
                .map(|&(_, d)| if sqrt { d * d } else { d })
                .collect();
            let d_labels = self
                .device
                .htod_sync_copy(&labels)
                .map_err(device_error("Failed to copy labels to GPU"))?;
            let d_best_dists = self
                .device
                .htod_sync_copy(&dists)
                .map_err(device_error("Failed to copy best_dists to GPU"))?;
            (d_labels, d_best_dists)
        };

        let chunk_size = self.center_chunk.min(k.max(1));
        let mut c_start = 0;
        while c_start < k {
            let c_end = (c_start + chunk_size).min(k);
            let n_centroids_chunk = c_end - c_start;

            let d_centroids_chunk = self.upload_matrix(&centers.slice(s![c_start..c_end, ..]))?;
            let d_centroid_norms_chunk = self.upload_vector(&center_norms.slice(s![c_start..c_end]))?;

            let mut d_dot_products: CudaSlice<f32> = self
                .device
                .alloc_zeros(n_samples * n_centroids_chunk)
                .map_err(device_error("Failed to allocate dot products"))?;
            self.gemm_nt_device(
                1.0,
                &d_data,
                &d_centroids_chunk,
                &mut d_dot_products,
                n_samples,
                n_centroids_chunk,
                n_features,
            )?;

            let func = self.get_func("find_nearest_centroids")?;
            unsafe {
                func.launch(
                    launch_config(n_samples),
                    (
                        &d_data_norms,
                        &d_centroid_norms_chunk,
                        &d_dot_products,
                        &mut d_labels,
                        &mut d_best_dists,
                        n_samples as i32,
                        n_centroids_chunk as i32,
                        c_start as i32,
                    ),
                )
            }
            .map_err(device_error("Failed to launch kernel"))?;

            c_start = c_end;
        }

        let func = self.get_func("finalize_dists")?;
        unsafe {
            func.launch(
                launch_config(n_samples),
                (&mut d_best_dists, n_samples as i32, sqrt as i32),
            )
        }
        .map_err(device_error("Failed to launch kernel"))?;

        let labels = self
            .device
            .dtoh_sync_copy(&d_labels)
            .map_err(device_error("Failed to copy labels"))?;
        let dists = self
            .device
            .dtoh_sync_copy(&d_best_dists)
            .map_err(device_error("Failed to copy best_dists"))?;
        for ((o, &l), &d) in out.iter_mut().zip(&labels).zip(&dists) {
            *o = (l as usize, d);
        }
        Ok(())
    }

    fn row_norms(&self, matrix: &ArrayView2<f32>, mut out: ArrayViewMut1<f32>) -> Result<()> {
        let (n_samples, n_features) = matrix.dim();
        if out.len() != n_samples {
            return Err(BalancedKMeansError::InvalidDimensions(format!(
                "row norms: {} rows, {} outputs",
                n_samples,
                out.len()
            )));
        }
        if n_samples == 0 {
            return Ok(());
        }

        let d_data = self.upload_matrix(matrix)?;
        let mut d_norms: CudaSlice<f32> = self
            .device
            .alloc_zeros(n_samples)
            .map_err(device_error("Failed to allocate norms"))?;
        let func = self.get_func("compute_squared_norms")?;
        unsafe {
            func.launch(
                launch_config(n_samples),
                (&d_data, &mut d_norms, n_samples as i32, n_features as i32),
            )
        }
        .map_err(device_error("Failed to launch kernel"))?;

        let norms = self
            .device
            .dtoh_sync_copy(&d_norms)
            .map_err(device_error("Failed to copy norms"))?;
        out.iter_mut().zip(&norms).for_each(|(o, &n)| *o = n);
        Ok(())
    }
}
