//! # balanced-kmeans
//!
//! Hierarchical balanced k-means for building the coarse quantiser of
//! inverted-file (IVF) approximate nearest neighbour indexes.
//!
//! ## Features
//!
//! - **Balanced clusters**: starved clusters are pulled towards rows of large
//!   clusters during EM, so sizes stay close to `n / k`
//! - **Hierarchical build**: a mesocluster level splits large `k` into many
//!   small balanced problems that are then fine-tuned on the full dataset
//! - **Quantised inputs**: `f32`, `i8` and `u8` rows are clustered directly,
//!   integers are mapped to `f32` one minibatch at a time
//! - **Bounded memory**: assignment runs in minibatches sized from a byte budget
//! - **Parallel computation**: uses rayon for multi-threaded processing
//! - **Optional GPU backend**: enable the `cuda` feature for a cuBLAS/NVRTC
//!   execution context
//! - **Optional BLAS acceleration**: enable `accelerate` (macOS) or `openblas`
//!   features for faster matrix operations
//!
//! ## Example
//!
//! ```rust
//! use balanced_kmeans::BalancedKMeans;
//! use ndarray::Array2;
//! use ndarray_rand::RandomExt;
//! use ndarray_rand::rand_distr::Uniform;
//!
//! // Generate random data
//! let data = Array2::random((2000, 32), Uniform::new(-1.0f32, 1.0));
//!
//! // Create and train the model
//! let mut kmeans = BalancedKMeans::new(32, 16);
//! kmeans.train(&data.view()).unwrap();
//!
//! // Get cluster assignments
//! let labels = kmeans.predict(&data.view()).unwrap();
//! assert_eq!(labels.len(), 2000);
//! ```
//!
//! ## Free functions
//!
//! The model is a thin wrapper; the building blocks can be called directly
//! with caller-owned buffers and any [`Label`] type.
//!
//! ```rust
//! use balanced_kmeans::{fit, predict, BalancedParams, DistanceType, HostContext};
//! use ndarray::Array2;
//! use ndarray_rand::RandomExt;
//! use ndarray_rand::rand_distr::Uniform;
//!
//! let data = Array2::random((3000, 8), Uniform::new(0u8, 255));
//! let params = BalancedParams::new(10).with_metric(DistanceType::L2Expanded);
//!
//! let mut centers = Array2::zeros((24, 8));
//! let sizes = fit(&HostContext, &params, &data.view(), &mut centers.view_mut()).unwrap();
//! assert_eq!(sizes.iter().sum::<u32>(), 3000);
//!
//! let mut labels = vec![0u16; 3000];
//! predict(&HostContext, &params, &centers.view(), &data.view(), None, &mut labels).unwrap();
//! ```
//!
//! ## BLAS Acceleration
//!
//! For improved performance on large datasets, enable a BLAS backend:
//!
//! ```toml
//! # macOS (recommended - uses Apple Accelerate)
//! balanced-kmeans = { version = "0.1", features = ["accelerate"] }
//!
//! # Linux/Windows (requires OpenBLAS installed)
//! balanced-kmeans = { version = "0.1", features = ["openblas"] }
//! ```

// Link BLAS libraries when features are enabled
#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "openblas")]
extern crate openblas_src;

mod adjust;
mod aggregate;
mod algorithm;
mod config;
mod context;
#[cfg(feature = "cuda")]
pub mod cuda;
mod distance;
mod error;
mod hierarchical;
mod kmeans;
mod mapping;
mod predict;
mod residency;

pub use adjust::{adjust_centers, ProbeCursor, ADJUST_CENTERS_WEIGHT};
pub use aggregate::calc_centers_and_sizes;
pub use algorithm::{
    balancing_em_iters, build_clusters, EmReport, BUILD_CLUSTERS_PULLBACK,
    BUILD_CLUSTERS_THRESHOLD,
};
pub use config::{BalancedParams, DistanceType, DEFAULT_MINIBATCH_BUDGET_BYTES};
pub use context::{ExecutionContext, HostContext};
pub use error::{BalancedKMeansError, Result};
pub use hierarchical::{
    arrange_fine_clusters, build_fine_clusters, build_hierarchical, mesocluster_count,
    FineClusterArrangement, FINE_TUNE_PULLBACK, FINE_TUNE_THRESHOLD,
};
pub use kmeans::{fit, fit_predict, BalancedKMeans};
pub use mapping::{Element, Label};
pub use predict::{calc_minibatch_size, compute_norm, fused_l2_nn_argmin, predict};
pub use residency::{classify, classify_inputs, Residency, Resident};
