//! Benchmark comparing the host and CUDA execution contexts
//!
//! Run with: cargo run --example cuda_benchmark --features cuda --release

use balanced_kmeans::cuda::CudaContext;
use balanced_kmeans::{BalancedKMeans, BalancedParams};
use ndarray::Array2;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use std::time::Instant;

fn main() {
    // Test configurations: (n_samples, n_features, k)
    let configs = [(10_000, 128, 100), (50_000, 128, 256), (100_000, 128, 1024)];

    println!("=== balanced-kmeans host vs CUDA benchmark ===\n");

    for (n_samples, n_features, k) in configs {
        println!(
            "Configuration: {} samples, {} features, {} clusters",
            n_samples, n_features, k
        );

        let data = Array2::random((n_samples, n_features), Uniform::new(-1.0f32, 1.0));

        let mut cpu_kmeans = BalancedKMeans::with_config(k, BalancedParams::new(20));
        let cpu_start = Instant::now();
        cpu_kmeans.train(&data.view()).unwrap();
        let cpu_time = cpu_start.elapsed();
        println!("  Host time: {:>8.3}s", cpu_time.as_secs_f64());

        match CudaContext::new(0) {
            Ok(ctx) => {
                let mut cuda_kmeans =
                    BalancedKMeans::with_config(k, BalancedParams::new(20)).with_context(ctx);
                let cuda_start = Instant::now();
                cuda_kmeans.train(&data.view()).unwrap();
                let cuda_time = cuda_start.elapsed();
                println!("  CUDA time: {:>8.3}s", cuda_time.as_secs_f64());

                let speedup = cpu_time.as_secs_f64() / cuda_time.as_secs_f64();
                println!("  Speedup:   {:>8.2}x", speedup);

                let sizes = cuda_kmeans.cluster_sizes().unwrap();
                println!(
                    "  CUDA cluster sizes in [{}, {}]",
                    sizes.iter().min().unwrap(),
                    sizes.iter().max().unwrap()
                );
            }
            Err(e) => {
                println!("  CUDA not available: {}", e);
            }
        }

        println!();
    }
}
