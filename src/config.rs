use std::collections::HashSet;
use std::time::Duration;

/// Sampling parameters for one generative call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampling {
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Knobs of a clustering pass. `Default` reproduces the production constants.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Categories that never produce clusters (administrative metadata).
    pub skip_categories: HashSet<String>,
    /// Categories summarized as a whole instead of clustered.
    pub summary_only_categories: HashSet<String>,
    /// A category needs at least this many qualifying responses.
    pub min_category_size: usize,
    pub min_clusters: usize,
    pub max_clusters: usize,
    /// k-means restarts; the run with the lowest inertia wins.
    pub n_init: usize,
    pub seed: u64,
    /// Number of grounding passages handed to the plan prompt.
    pub top_k: usize,
    pub summary_sampling: Sampling,
    pub plan_sampling: Sampling,
    /// Pause after each clustered cohort so the generative service is not hammered.
    pub cohort_delay: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            skip_categories: HashSet::from(["Class Metadata".to_string()]),
            summary_only_categories: HashSet::from([
                "Engagement".to_string(),
                "Assessment".to_string(),
                "Resources".to_string(),
            ]),
            min_category_size: 3,
            min_clusters: 2,
            max_clusters: 6,
            n_init: 15,
            seed: 42,
            top_k: 10,
            summary_sampling: Sampling {
                temperature: 0.2,
                max_tokens: 250,
            },
            plan_sampling: Sampling {
                temperature: 0.3,
                max_tokens: 3000,
            },
            cohort_delay: Duration::from_millis(150),
        }
    }
}

impl PipelineConfig {
    pub fn is_skipped(&self, category: &str) -> bool {
        self.skip_categories.contains(category)
    }

    pub fn is_summary_only(&self, category: &str) -> bool {
        self.summary_only_categories.contains(category)
    }

    /// `clamp(round(sqrt(n)), min_clusters, max_clusters)`.
    pub fn cluster_count(&self, n: usize) -> usize {
        let k = (n as f64).sqrt().round() as usize;
        k.clamp(self.min_clusters, self.max_clusters)
    }
}
