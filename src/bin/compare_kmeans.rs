//! Binary for inspecting balanced-kmeans output from other tools
//!
//! This binary reads input data from a .npy file, runs hierarchical balanced
//! k-means, and saves the resulting centroids and labels to .npy files.
//!
//! Usage: `compare-kmeans <input.npy> <centroids.npy> <labels.npy> <k> <n_iters> [metric]`
//!
//! `metric` is `l2` (default), `l2sqrt` or `ip`.

use balanced_kmeans::{BalancedKMeans, BalancedParams, DistanceType};
use ndarray::Array2;
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use std::env;
use std::fs::File;
use std::io::BufReader;

fn parse_metric(name: &str) -> Result<DistanceType, String> {
    match name {
        "l2" => Ok(DistanceType::L2Expanded),
        "l2sqrt" => Ok(DistanceType::L2SqrtExpanded),
        "ip" => Ok(DistanceType::InnerProduct),
        other => Err(format!("unknown metric '{}', expected l2, l2sqrt or ip", other)),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    if args.len() != 6 && args.len() != 7 {
        eprintln!(
            "Usage: {} <input.npy> <centroids.npy> <labels.npy> <k> <n_iters> [metric]",
            args[0]
        );
        std::process::exit(1);
    }

    let input_path = &args[1];
    let centroids_path = &args[2];
    let labels_path = &args[3];
    let k: usize = args[4].parse()?;
    let n_iters: u32 = args[5].parse()?;
    let metric = match args.get(6) {
        Some(name) => parse_metric(name)?,
        None => DistanceType::L2Expanded,
    };

    // Read input data
    let reader = BufReader::new(File::open(input_path)?);
    let data: Array2<f32> = Array2::read_npy(reader)?;

    eprintln!(
        "Loaded data: {} samples x {} features",
        data.nrows(),
        data.ncols()
    );
    eprintln!(
        "Running balanced k-means with k={}, n_iters={}, metric={:?}",
        k, n_iters, metric
    );

    let params = BalancedParams::new(n_iters).with_metric(metric);
    let mut kmeans = BalancedKMeans::with_config(k, params);
    let labels = kmeans.fit_predict(&data.view())?;

    let centroids = kmeans.centroids().ok_or("No centroids after training")?;
    let sizes = kmeans.cluster_sizes().ok_or("No cluster sizes after training")?;
    let smallest = sizes.iter().copied().min().unwrap_or(0);
    let largest = sizes.iter().copied().max().unwrap_or(0);
    eprintln!(
        "Centroids shape: {:?}, cluster sizes in [{}, {}]",
        centroids.shape(),
        smallest,
        largest
    );

    centroids.write_npy(File::create(centroids_path)?)?;
    labels.write_npy(File::create(labels_path)?)?;

    eprintln!("Saved centroids to {} and labels to {}", centroids_path, labels_path);

    Ok(())
}
