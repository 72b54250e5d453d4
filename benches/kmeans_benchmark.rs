use balanced_kmeans::{
    build_clusters, fit, predict, BalancedParams, DistanceType, HostContext,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ndarray::Array2;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use std::time::Duration;

fn benchmark_hierarchical_varying_samples(c: &mut Criterion) {
    let mut group = c.benchmark_group("hierarchical_samples");
    group.sample_size(10);
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_secs(2));

    let n_features = 128;
    let k = 64;
    let sample_sizes = [1_000, 5_000, 10_000];
    let params = BalancedParams::new(5);

    for n_samples in sample_sizes.iter() {
        group.throughput(Throughput::Elements(*n_samples as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(n_samples),
            n_samples,
            |b, &n_samples| {
                let data = Array2::random((n_samples, n_features), Uniform::new(-1.0f32, 1.0));

                b.iter(|| {
                    let mut centers = Array2::zeros((k, n_features));
                    fit(&HostContext, &params, black_box(&data.view()), &mut centers.view_mut()).unwrap();
                    centers
                });
            },
        );
    }
    group.finish();
}

fn benchmark_flat_varying_clusters(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_clusters");
    group.sample_size(10);
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_secs(2));

    let n_samples = 5_000;
    let n_features = 128;
    let cluster_counts = [10, 50, 100];
    let params = BalancedParams::new(5);

    for k in cluster_counts.iter() {
        group.throughput(Throughput::Elements(*k as u64));
        group.bench_with_input(BenchmarkId::from_parameter(k), k, |b, &k| {
            let data = Array2::random((n_samples, n_features), Uniform::new(-1.0f32, 1.0));

            b.iter(|| {
                let mut centers = Array2::zeros((k, n_features));
                let mut labels = vec![0u32; n_samples];
                let mut sizes = vec![0u32; k];
                build_clusters(
                    &HostContext,
                    &params,
                    black_box(&data.view()),
                    &mut centers.view_mut(),
                    &mut labels,
                    &mut sizes,
                    None,
                )
                .unwrap();
                centers
            });
        });
    }
    group.finish();
}

fn benchmark_predict_metrics(c: &mut Criterion) {
    let mut group = c.benchmark_group("predict");
    group.sample_size(10);
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_secs(2));

    let n_samples = 20_000;
    let n_features = 128;
    let k = 256;
    let data = Array2::random((n_samples, n_features), Uniform::new(-1.0f32, 1.0));
    let centers = Array2::random((k, n_features), Uniform::new(-1.0f32, 1.0));

    for metric in [DistanceType::L2Expanded, DistanceType::InnerProduct] {
        let params = BalancedParams::default().with_metric(metric);
        group.throughput(Throughput::Elements(n_samples as u64));
        group.bench_function(format!("{:?}", metric), |b| {
            let mut labels = vec![0u32; n_samples];
            b.iter(|| {
                predict(
                    &HostContext,
                    &params,
                    &centers.view(),
                    black_box(&data.view()),
                    None,
                    &mut labels,
                )
                .unwrap()
            });
        });
    }

    // Quantised rows pay for the conversion buffer
    let quantized = data.mapv(|v| (v * 127.0) as i8);
    let params = BalancedParams::default();
    group.bench_function("L2Expanded_i8", |b| {
        let mut labels = vec![0u32; n_samples];
        b.iter(|| {
            predict(
                &HostContext,
                &params,
                &centers.view(),
                black_box(&quantized.view()),
                None,
                &mut labels,
            )
            .unwrap()
        });
    });
    group.finish();
}

fn benchmark_ivf_like(c: &mut Criterion) {
    let mut group = c.benchmark_group("hierarchical_ivf");
    group.sample_size(10);
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_secs(3));

    // Inverted-file sized configuration (smaller for faster benchmarks)
    let n_samples = 100_000;
    let n_features = 64;
    let k = 1024;
    let params = BalancedParams::new(10);

    group.bench_function("100k_samples_1k_clusters", |b| {
        let data = Array2::random((n_samples, n_features), Uniform::new(-1.0f32, 1.0));

        b.iter(|| {
            let mut centers = Array2::zeros((k, n_features));
            fit(&HostContext, &params, black_box(&data.view()), &mut centers.view_mut()).unwrap();
            centers
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    benchmark_hierarchical_varying_samples,
    benchmark_flat_varying_clusters,
    benchmark_predict_metrics,
    benchmark_ivf_like,
);

criterion_main!(benches);
