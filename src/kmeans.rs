use crate::config::BalancedParams;
use crate::context::{ExecutionContext, HostContext};
use crate::error::{BalancedKMeansError, Result};
use crate::hierarchical::build_hierarchical;
use crate::mapping::{Element, Label};
use crate::predict::predict;
use ndarray::{Array1, Array2, ArrayView2, ArrayViewMut2};

fn validate_fit(n_rows: usize, dim: usize, centers: &ArrayViewMut2<f32>) -> Result<()> {
    let k = centers.nrows();
    if k == 0 {
        return Err(BalancedKMeansError::InvalidK(
            "k must be greater than 0".to_string(),
        ));
    }
    if n_rows < k {
        return Err(BalancedKMeansError::InsufficientData(format!(
            "Number of samples ({}) is less than k ({})",
            n_rows, k
        )));
    }
    if centers.ncols() != dim {
        return Err(BalancedKMeansError::InvalidDimensions(format!(
            "Expected {} features, got {}",
            centers.ncols(),
            dim
        )));
    }
    Ok(())
}

/// Train `centers.nrows()` balanced clusters on `dataset`.
///
/// Runs the hierarchical build and returns the final cluster sizes.
pub fn fit<T: Element>(
    ctx: &dyn ExecutionContext,
    params: &BalancedParams,
    dataset: &ArrayView2<T>,
    centers: &mut ArrayViewMut2<f32>,
) -> Result<Vec<u32>> {
    validate_fit(dataset.nrows(), dataset.ncols(), centers)?;
    build_hierarchical(ctx, params, dataset, centers, None)
}

/// Train balanced clusters and label every row of `dataset` with them.
pub fn fit_predict<T: Element, L: Label>(
    ctx: &dyn ExecutionContext,
    params: &BalancedParams,
    dataset: &ArrayView2<T>,
    centers: &mut ArrayViewMut2<f32>,
    labels: &mut [L],
) -> Result<Vec<u32>> {
    if labels.len() != dataset.nrows() {
        return Err(BalancedKMeansError::InvalidDimensions(format!(
            "{} labels for {} rows",
            labels.len(),
            dataset.nrows()
        )));
    }
    let sizes = fit(ctx, params, dataset, centers)?;
    predict(ctx, params, &centers.view(), dataset, None, labels)?;
    Ok(sizes)
}

/// Balanced k-means model with an API similar to FAISS and scikit-learn.
///
/// Training runs the hierarchical balanced build, so cluster sizes stay close
/// to `n / k` and no cluster ends up empty on well-spread data.
///
/// # Example
///
/// ```
/// use balanced_kmeans::BalancedKMeans;
/// use ndarray::Array2;
/// use ndarray_rand::RandomExt;
/// use ndarray_rand::rand_distr::Uniform;
///
/// // Generate random data
/// let data = Array2::random((1000, 16), Uniform::new(-1.0f32, 1.0));
///
/// // Create and train the model
/// let mut kmeans = BalancedKMeans::new(16, 10);
/// kmeans.train(&data.view()).unwrap();
///
/// // Get cluster assignments
/// let labels = kmeans.predict(&data.view()).unwrap();
/// assert_eq!(labels.len(), 1000);
/// ```
pub struct BalancedKMeans {
    /// Run parameters
    params: BalancedParams,

    /// Number of clusters
    k: usize,

    /// Number of features (dimensions)
    d: usize,

    /// Trained centroids (None if not yet fitted)
    centroids: Option<Array2<f32>>,

    /// Cluster sizes of the last training run
    sizes: Option<Vec<u32>>,

    /// Backend running the distance primitives
    context: Box<dyn ExecutionContext + Send>,
}

impl BalancedKMeans {
    /// Create a new model with default parameters on the host backend.
    ///
    /// # Arguments
    ///
    /// * `d` - Number of features (dimensions) in the data
    /// * `k` - Number of clusters
    ///
    /// # Panics
    ///
    /// Panics if `k` is 0.
    pub fn new(d: usize, k: usize) -> Self {
        assert!(k > 0, "k must be greater than 0");

        Self {
            params: BalancedParams::default(),
            k,
            d,
            centroids: None,
            sizes: None,
            context: Box::new(HostContext),
        }
    }

    /// Create a new model with custom parameters.
    ///
    /// The dimension is taken from the first training call.
    ///
    /// # Panics
    ///
    /// Panics if `k` is 0.
    pub fn with_config(k: usize, params: BalancedParams) -> Self {
        assert!(k > 0, "k must be greater than 0");

        Self {
            params,
            k,
            d: 0, // Will be set on first train call
            centroids: None,
            sizes: None,
            context: Box::new(HostContext),
        }
    }

    /// Run the model on another execution backend.
    pub fn with_context<C: ExecutionContext + Send + 'static>(mut self, context: C) -> Self {
        self.context = Box::new(context);
        self
    }

    /// Train the model on the given data.
    ///
    /// This method mimics the FAISS `train()` API.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Number of samples is less than k
    /// - Data dimensions don't match (for subsequent calls)
    /// - The configured metric cannot be used for clustering
    pub fn train<T: Element>(&mut self, data: &ArrayView2<T>) -> Result<()> {
        let n_features = data.ncols();

        // Set dimensions on first call, validate on subsequent calls
        if self.d == 0 {
            self.d = n_features;
        } else if n_features != self.d {
            return Err(BalancedKMeansError::InvalidDimensions(format!(
                "Expected {} features, got {}",
                self.d, n_features
            )));
        }

        let mut centroids = Array2::zeros((self.k, n_features));
        let sizes = fit(
            &*self.context,
            &self.params,
            data,
            &mut centroids.view_mut(),
        )?;

        self.centroids = Some(centroids);
        self.sizes = Some(sizes);
        Ok(())
    }

    /// Fit the model to the data.
    ///
    /// Equivalent to `train()`, returns `&mut Self` for method chaining.
    pub fn fit<T: Element>(&mut self, data: &ArrayView2<T>) -> Result<&mut Self> {
        self.train(data)?;
        Ok(self)
    }

    /// Predict cluster assignments for new data.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The model has not been fitted yet
    /// - Data dimensions don't match the training data
    pub fn predict<T: Element>(&self, data: &ArrayView2<T>) -> Result<Array1<u32>> {
        let centroids = self.centroids.as_ref().ok_or(BalancedKMeansError::NotFitted)?;

        let n_features = data.ncols();
        if n_features != self.d {
            return Err(BalancedKMeansError::InvalidDimensions(format!(
                "Expected {} features, got {}",
                self.d, n_features
            )));
        }

        let mut labels = vec![0u32; data.nrows()];
        predict(
            &*self.context,
            &self.params,
            &centroids.view(),
            data,
            None,
            &mut labels,
        )?;
        Ok(Array1::from(labels))
    }

    /// Fit the model and predict cluster assignments in one call.
    pub fn fit_predict<T: Element>(&mut self, data: &ArrayView2<T>) -> Result<Array1<u32>> {
        self.train(data)?;
        self.predict(data)
    }

    /// Get the centroids of the fitted model.
    pub fn centroids(&self) -> Option<&Array2<f32>> {
        self.centroids.as_ref()
    }

    /// Cluster sizes on the training data of the last fit.
    pub fn cluster_sizes(&self) -> Option<&[u32]> {
        self.sizes.as_deref()
    }

    /// Get the number of clusters.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Get the number of features (dimensions).
    pub fn d(&self) -> usize {
        self.d
    }

    /// Get the run parameters.
    pub fn params(&self) -> &BalancedParams {
        &self.params
    }

    /// Name of the execution backend.
    pub fn backend(&self) -> &'static str {
        self.context.name()
    }
}
