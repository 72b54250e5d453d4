//! Basic example demonstrating balanced-kmeans usage
//!
//! Run with: cargo run --example basic --release

use balanced_kmeans::{BalancedKMeans, BalancedParams};
use ndarray::Array2;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;

fn main() {
    println!("=== balanced-kmeans example ===\n");

    // Three blobs of very different sizes in 2D
    let blob_sizes = [600usize, 300, 100];
    let blob_centers = [[-5.0f32, -5.0], [0.0, 5.0], [5.0, -5.0]];
    let n_samples: usize = blob_sizes.iter().sum();
    let n_clusters = 10;

    println!("Generating {} samples in {} blobs...", n_samples, blob_sizes.len());

    let noise = Array2::random((n_samples, 2), Uniform::new(-1.0f32, 1.0));
    let mut data = Array2::<f32>::zeros((n_samples, 2));
    let mut row = 0;
    for (center, &size) in blob_centers.iter().zip(&blob_sizes) {
        for _ in 0..size {
            data[[row, 0]] = center[0] + noise[[row, 0]];
            data[[row, 1]] = center[1] + noise[[row, 1]];
            row += 1;
        }
    }

    // Balanced clustering spreads the clusters proportionally over the blobs
    let params = BalancedParams::new(20).with_verbose(true);
    println!("Running balanced k-means with k={}...\n", n_clusters);

    let mut kmeans = BalancedKMeans::with_config(n_clusters, params);
    let labels = kmeans.fit_predict(&data.view()).expect("Training failed");

    println!("Learned centroids:");
    let centroids = kmeans.centroids().expect("model is fitted");
    for (i, c) in centroids.rows().into_iter().enumerate() {
        println!("  Centroid {}: ({:.4}, {:.4})", i, c[0], c[1]);
    }
    println!();

    let mut cluster_counts = vec![0usize; n_clusters];
    for &label in labels.iter() {
        cluster_counts[label as usize] += 1;
    }

    println!("Cluster distribution:");
    for (i, count) in cluster_counts.iter().enumerate() {
        println!(
            "  Cluster {}: {} samples ({:.1}%)",
            i,
            count,
            (*count as f64 / n_samples as f64) * 100.0
        );
    }

    println!("\n=== Done! ===");
}
