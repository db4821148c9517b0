use ndarray::prelude::*;

use crate::cohort::linalg::row_norms;

/// Outcome of one Lloyd run from a single initialization.
#[derive(Debug, Clone)]
pub struct LloydRun {
    pub labels: Array1<usize>,
    pub centers: Array2<f64>,
    pub inertia: f64,
    pub n_iter: usize,
}

/// Pairwise squared euclidean distances, clamped at zero.
pub fn squared_distances(
    a: &Array2<f64>, // a = (n_a, n_features)
    b: &Array2<f64>, // b = (n_b, n_features)
) -> Array2<f64> {
    let aa = row_norms(a, true).insert_axis(Axis(1)); // (n_a, 1)
    let bb = row_norms(b, true).insert_axis(Axis(0)); // (1, n_b)
    let mut distances: Array2<f64> = -2.0 * a.dot(&b.t()); // (n_a, n_b)
    distances += &aa;
    distances += &bb;
    distances.mapv_inplace(|d| if d > 0.0 { d } else { 0.0 });
    distances
}

/// Nearest center per sample. Ties go to the lowest cluster index.
fn assign_labels(
    x: &Array2<f64>,       // x = (n_samples, n_features)
    centers: &Array2<f64>, // centers = (n_clusters, n_features)
) -> (Array1<usize>, Array1<f64>) {
    let distances = squared_distances(x, centers); // (n_samples, n_clusters)
    let mut labels = Array1::<usize>::zeros(x.nrows());
    let mut closest = Array1::<f64>::zeros(x.nrows());
    for (i, row) in distances.axis_iter(Axis(0)).enumerate() {
        let mut best = 0;
        for (c, &d) in row.iter().enumerate() {
            if d < row[best] {
                best = c;
            }
        }
        labels[i] = best;
        closest[i] = row[best];
    }
    (labels, closest)
}

/// Hand every empty cluster the sample that sits farthest from its own center, taking it only
/// from clusters that can spare a member.
fn relocate_empty_clusters(labels: &mut Array1<usize>, closest: &Array1<f64>, n_clusters: usize) {
    let mut counts = vec![0usize; n_clusters];
    for &label in labels.iter() {
        counts[label] += 1;
    }
    if counts.iter().all(|&c| c > 0) {
        return;
    }

    let mut far_first: Vec<usize> = (0..labels.len()).collect();
    far_first.sort_by(|&a, &b| closest[b].total_cmp(&closest[a]).then(a.cmp(&b)));
    let mut candidates = far_first.into_iter();

    for empty in 0..n_clusters {
        if counts[empty] > 0 {
            continue;
        }
        for idx in candidates.by_ref() {
            let donor = labels[idx];
            if counts[donor] > 1 {
                counts[donor] -= 1;
                counts[empty] += 1;
                labels[idx] = empty;
                break;
            }
        }
    }
}

/// Mean of each cluster's members; clusters that stay empty keep their previous center.
fn update_centers(
    x: &Array2<f64>,           // x = (n_samples, n_features)
    labels: &Array1<usize>,    // labels = (n_samples,)
    centers_old: &Array2<f64>, // centers_old = (n_clusters, n_features)
) -> Array2<f64> {
    let n_clusters = centers_old.nrows();
    let mut sums = Array2::<f64>::zeros(centers_old.raw_dim());
    let mut counts = vec![0usize; n_clusters];
    for (row, &label) in x.axis_iter(Axis(0)).zip(labels.iter()) {
        let mut target = sums.row_mut(label);
        target += &row;
        counts[label] += 1;
    }
    for (cluster, count) in counts.into_iter().enumerate() {
        if count > 0 {
            sums.row_mut(cluster).mapv_inplace(|v| v / count as f64);
        } else {
            sums.row_mut(cluster).assign(&centers_old.row(cluster));
        }
    }
    sums
}

fn inertia(x: &Array2<f64>, centers: &Array2<f64>, labels: &Array1<usize>) -> f64 {
    x.axis_iter(Axis(0))
        .zip(labels.iter())
        .map(|(row, &label)| {
            let diff = &row - &centers.row(label);
            diff.mapv(|v| v * v).sum()
        })
        .sum()
}

/// Run a single k-means using Lloyd's algorithm.
pub fn kmeans_single_lloyd(
    x: &Array2<f64>,            // x = (n_samples, n_features)
    centers_init: &Array2<f64>, // centers_init = (n_clusters, n_features)
    max_iter: usize,
    tol: f64,
) -> LloydRun {
    let n_samples = x.nrows();
    let n_clusters = centers_init.nrows();

    let mut centers = centers_init.clone();
    let mut labels = Array1::<usize>::zeros(n_samples);
    let mut labels_old = Array1::<usize>::from_elem(n_samples, usize::MAX);
    let mut strict_convergence = false;
    let mut iterations = 0;

    for i in 0..max_iter {
        let (mut new_labels, closest) = assign_labels(x, &centers);
        relocate_empty_clusters(&mut new_labels, &closest, n_clusters);

        if new_labels == labels_old {
            // `centers` are already the means of these labels.
            labels = new_labels;
            strict_convergence = true;
            break;
        }

        let centers_new = update_centers(x, &new_labels, &centers);
        let center_shift_tot = (&centers_new - &centers).mapv(|v| v * v).sum();

        centers = centers_new;
        labels = new_labels.clone();
        labels_old = new_labels;
        iterations = i + 1;

        if center_shift_tot <= tol {
            break;
        }
    }

    if !strict_convergence {
        // Ensure labels reflect final centers
        labels = assign_labels(x, &centers).0;
    }

    LloydRun {
        inertia: inertia(x, &centers, &labels),
        labels,
        centers,
        n_iter: iterations,
    }
}
