/// Distance metrics understood by the clustering routines.
///
/// Only the L2-expanded family and inner product can be used for cluster
/// assignment; the remaining variants exist so that callers sharing a metric
/// enum with the surrounding index get a clear error instead of a silent
/// fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DistanceType {
    /// Squared euclidean distance via `|x|^2 + |c|^2 - 2<x, c>`
    #[default]
    L2Expanded,
    /// Euclidean distance via the expanded form, with a final square root
    L2SqrtExpanded,
    /// Euclidean distance computed element by element
    L2Unexpanded,
    /// Negated inner product
    InnerProduct,
    /// Cosine distance
    CosineExpanded,
    /// Pearson correlation distance
    CorrelationExpanded,
    /// Manhattan distance
    L1,
}

impl DistanceType {
    /// Whether assignment uses the fused L2 nearest-centre primitive.
    pub fn is_l2_family(self) -> bool {
        matches!(self, DistanceType::L2Expanded | DistanceType::L2SqrtExpanded)
    }

    /// Metrics for which the EM loop keeps centres on the unit sphere.
    pub fn is_similarity(self) -> bool {
        matches!(
            self,
            DistanceType::InnerProduct
                | DistanceType::CosineExpanded
                | DistanceType::CorrelationExpanded
        )
    }

    /// Whether `predict` can assign labels under this metric.
    pub fn is_supported(self) -> bool {
        self.is_l2_family() || self == DistanceType::InnerProduct
    }
}

/// Scratch budget of one predict minibatch.
pub const DEFAULT_MINIBATCH_BUDGET_BYTES: usize = 1 << 30;

/// Configuration for balanced k-means
#[derive(Debug, Clone)]
pub struct BalancedParams {
    /// Number of EM iterations of every flat clustering run
    pub n_iters: u32,

    /// Distance metric, fixed for a whole run
    pub metric: DistanceType,

    /// Upper bound on the scratch memory of one predict minibatch, in bytes
    pub minibatch_budget_bytes: usize,

    /// How many iterations rebalancing may add on top of the budget.
    /// `None` allows as many extra iterations as the budget itself.
    pub max_extra_iters: Option<u32>,

    /// Report per-iteration progress at info level instead of debug
    pub verbose: bool,
}

impl Default for BalancedParams {
    fn default() -> Self {
        Self {
            n_iters: 20,
            metric: DistanceType::L2Expanded,
            minibatch_budget_bytes: DEFAULT_MINIBATCH_BUDGET_BYTES,
            max_extra_iters: None,
            verbose: false,
        }
    }
}

impl BalancedParams {
    /// Create a new configuration with the specified number of EM iterations
    pub fn new(n_iters: u32) -> Self {
        Self {
            n_iters,
            ..Default::default()
        }
    }

    /// Set the number of EM iterations
    pub fn with_n_iters(mut self, n_iters: u32) -> Self {
        self.n_iters = n_iters;
        self
    }

    /// Set the distance metric
    pub fn with_metric(mut self, metric: DistanceType) -> Self {
        self.metric = metric;
        self
    }

    /// Set the scratch budget of a predict minibatch
    pub fn with_minibatch_budget_bytes(mut self, bytes: usize) -> Self {
        self.minibatch_budget_bytes = bytes;
        self
    }

    /// Set the ceiling on rebalancing-driven extra iterations
    pub fn with_max_extra_iters(mut self, max_extra_iters: Option<u32>) -> Self {
        self.max_extra_iters = max_extra_iters;
        self
    }

    /// Set verbose mode
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Hard ceiling on the iteration count of one EM run of `n_iters` iterations.
    pub(crate) fn iteration_ceiling(&self, n_iters: u32) -> u32 {
        let extra = self.max_extra_iters.unwrap_or(n_iters);
        n_iters.saturating_add(extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let params = BalancedParams::default();
        assert_eq!(params.n_iters, 20);
        assert_eq!(params.metric, DistanceType::L2Expanded);
        assert_eq!(params.minibatch_budget_bytes, 1 << 30);
        assert_eq!(params.iteration_ceiling(20), 40);
    }

    #[test]
    fn test_builder() {
        let params = BalancedParams::new(7)
            .with_metric(DistanceType::InnerProduct)
            .with_max_extra_iters(Some(0))
            .with_verbose(true);
        assert_eq!(params.n_iters, 7);
        assert_eq!(params.iteration_ceiling(7), 7);
        assert!(params.verbose);
    }

    #[test]
    fn test_metric_classes() {
        assert!(DistanceType::L2SqrtExpanded.is_l2_family());
        assert!(DistanceType::InnerProduct.is_supported());
        assert!(!DistanceType::CosineExpanded.is_supported());
        assert!(DistanceType::CosineExpanded.is_similarity());
        assert!(!DistanceType::L1.is_supported());
    }
}
