mod lloyd;

use std::collections::HashSet;

use ndarray::prelude::*;
use ndarray_rand::RandomExt;
use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand::{Rng, SeedableRng};
use ndarray_rand::rand_distr::Uniform;
use tracing::{trace, warn};

use crate::{AppError, AppResult};

static DEFAULT_K: usize = 8;
static DEFAULT_N_INIT: usize = 10;
static DEFAULT_MAX_ITER: usize = 300;
static DEFAULT_TOLERANCE: f64 = 1e-4;

/// Greedy k-means++ seeding. Every draw comes from `rng`, so a fixed seed gives fixed centers.
fn kmeans_plus_plus(
    x: &Array2<f64>, // x = (n_samples, n_features)
    n_clusters: usize,
    rng: &mut StdRng,
) -> AppResult<Array2<f64>> {
    let n_samples = x.nrows();
    let n_local_trials = 2 + (n_clusters as f64).ln().floor() as usize;
    let uniform =
        Uniform::new(0.0, 1.0).map_err(|e| AppError::Other(format!("uniform sampler: {e}")))?;

    let mut centers = Array2::<f64>::zeros((n_clusters, x.ncols())); // (n_clusters, n_features)
    let first = rng.random_range(0..n_samples);
    centers.row_mut(0).assign(&x.row(first));

    // closest_dist_sq = (n_samples,)
    let mut closest_dist_sq: Array1<f64> =
        lloyd::squared_distances(&x.select(Axis(0), &[first]), x).row(0).to_owned();
    let mut current_pot: f64 = closest_dist_sq.sum();

    for c in 1..n_clusters {
        let rand_vals = Array1::<f64>::random_using(n_local_trials, uniform, rng) * current_pot;

        let mut cumsum = Vec::with_capacity(n_samples);
        let mut acc = 0.0;
        for d in closest_dist_sq.iter() {
            acc += d;
            cumsum.push(acc);
        }
        let candidate_ids: Vec<usize> = rand_vals
            .iter()
            .map(|v| cumsum.partition_point(|c| c < v).min(n_samples - 1))
            .collect();

        // distance_to_candidates = (n_local_trials, n_samples)
        let mut distance_to_candidates =
            lloyd::squared_distances(&x.select(Axis(0), &candidate_ids), x);
        for mut row in distance_to_candidates.axis_iter_mut(Axis(0)) {
            row.zip_mut_with(&closest_dist_sq, |d, &closest| {
                if closest < *d {
                    *d = closest;
                }
            });
        }
        let candidates_pot = distance_to_candidates.sum_axis(Axis(1)); // (n_local_trials,)

        let mut best = 0;
        for (i, pot) in candidates_pot.iter().enumerate() {
            if *pot < candidates_pot[best] {
                best = i;
            }
        }
        current_pot = candidates_pot[best];
        closest_dist_sq = distance_to_candidates.row(best).to_owned();
        centers.row_mut(c).assign(&x.row(candidate_ids[best]));
    }
    Ok(centers)
}

/// Seeded k-means with k-means++ initialization and several restarts.
pub struct KMeans {
    pub k: usize,
    pub n_init: usize,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub seed: u64,
    cluster_centers: Option<Array2<f64>>,
    labels: Option<Array1<usize>>,
    inertia: Option<f64>,
    n_iter: Option<usize>,
}

impl Default for KMeans {
    fn default() -> Self {
        KMeans {
            k: DEFAULT_K,
            n_init: DEFAULT_N_INIT,
            max_iterations: DEFAULT_MAX_ITER,
            tolerance: DEFAULT_TOLERANCE,
            seed: 0,
            cluster_centers: None,
            labels: None,
            inertia: None,
            n_iter: None,
        }
    }
}

impl KMeans {
    pub fn new(k: usize) -> Self {
        KMeans {
            k,
            ..Default::default()
        }
    }

    pub fn set_n_init(&mut self, n_init: usize) -> &mut Self {
        self.n_init = n_init;
        self
    }

    pub fn set_seed(&mut self, seed: u64) -> &mut Self {
        self.seed = seed;
        self
    }

    pub fn inertia(&self) -> Option<f64> {
        self.inertia
    }

    pub fn n_iter(&self) -> Option<usize> {
        self.n_iter
    }

    /// Tolerance relative to the data: mean per-feature variance times `tolerance`.
    fn scaled_tolerance(&self, x: &Array2<f64>) -> f64 {
        x.var_axis(Axis(0), 0.0).mean().unwrap_or(0.0) * self.tolerance
    }

    #[tracing::instrument(name = "Fitting k-means", level = "debug", skip(self, x), fields(k = self.k))]
    pub fn fit(&mut self, x: &Array2<f64>) -> AppResult<&mut Self> {
        if self.k == 0 {
            return Err(AppError::Other("k-means needs at least one cluster".to_string()));
        }
        if x.nrows() < self.k {
            return Err(AppError::Other(format!(
                "k-means needs at least {} samples, got {}",
                self.k,
                x.nrows()
            )));
        }

        let mut x = x.clone(); // x = (n_samples, n_features)
        let x_mean: Array1<f64> = x
            .mean_axis(Axis(0))
            .unwrap_or(Array1::<f64>::zeros(x.ncols())); // x_mean = (n_features,)
        x -= &x_mean;
        let tol = self.scaled_tolerance(&x);
        let mut rng = StdRng::seed_from_u64(self.seed);

        let mut best: Option<lloyd::LloydRun> = None;
        for _ in 0..self.n_init.max(1) {
            let centers_init = kmeans_plus_plus(&x, self.k, &mut rng)?; // (k, n_features)
            let run = lloyd::kmeans_single_lloyd(&x, &centers_init, self.max_iterations, tol);
            trace!("k-means restart: inertia={} n_iter={}", run.inertia, run.n_iter);
            if best.as_ref().is_none_or(|b| run.inertia < b.inertia) {
                best = Some(run);
            }
        }
        let Some(mut best) = best else {
            return Err(AppError::Other("k-means produced no run".to_string()));
        };
        best.centers += &x_mean;

        let distinct_clusters = best.labels.iter().collect::<HashSet<_>>().len();
        if distinct_clusters < self.k {
            warn!(
                "Number of distinct clusters ({}) found smaller than n_clusters ({}). Possibly due to duplicate points in X.",
                distinct_clusters, self.k
            );
        }

        self.cluster_centers = Some(best.centers);
        self.labels = Some(best.labels);
        self.inertia = Some(best.inertia);
        self.n_iter = Some(best.n_iter);
        Ok(self)
    }

    /// Fit and hand back the labels.
    pub fn fit_predict(&mut self, x: &Array2<f64>) -> AppResult<Array1<usize>> {
        self.fit(x)?;
        self.labels
            .clone()
            .ok_or_else(|| AppError::Other("k-means fit left no labels".to_string()))
    }
}
