//! Cohort Builder: turns per-category response embeddings into the groups that get summarized.

pub mod kmeans;
pub mod linalg;

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::AppResult;
use crate::cohort::kmeans::KMeans;
use crate::cohort::linalg::{embeddings_to_ndarray, mean_vector, normalize_rows};
use crate::config::PipelineConfig;
use crate::model::{Cohort, CohortKind, Embedding, ResponseId, ResponseVector};

/// One response's embedding within a single category.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub id: ResponseId,
    pub embedding: Embedding,
}

/// Regroup response vectors by category, dropping skipped categories.
///
/// Members keep the order of `responses`; categories come out in name order.
pub fn group_by_category(
    responses: Vec<ResponseVector>,
    config: &PipelineConfig,
) -> BTreeMap<String, Vec<Member>> {
    let mut grouped: BTreeMap<String, Vec<Member>> = BTreeMap::new();
    for response in responses {
        for (category, embedding) in response.embeddings {
            if config.is_skipped(&category) {
                continue;
            }
            grouped.entry(category).or_default().push(Member {
                id: response.id,
                embedding,
            });
        }
    }
    grouped
}

/// Members whose vectors can take part in clustering: non-empty and of the category's dimension,
/// which is taken from the first non-empty vector.
fn qualifying_members(category: &str, members: Vec<Member>) -> Vec<Member> {
    let Some(dim) = members
        .iter()
        .map(|m| m.embedding.len())
        .find(|len| *len > 0)
    else {
        return Vec::new();
    };
    members
        .into_iter()
        .filter(|m| {
            let ok = m.embedding.len() == dim;
            if !ok {
                warn!(
                    "Response {} has a {}-dimensional {category} vector, expected {dim}; skipping",
                    m.id,
                    m.embedding.len()
                );
            }
            ok
        })
        .collect()
}

/// Apply the category policy and, where it calls for it, cluster.
#[tracing::instrument(name = "Building cohorts", level = "debug", skip(members, config))]
pub fn build_cohorts(
    category: &str,
    members: Vec<Member>,
    config: &PipelineConfig,
) -> AppResult<Vec<Cohort>> {
    if config.is_skipped(category) {
        return Ok(Vec::new());
    }
    let members = qualifying_members(category, members);
    if members.len() < config.min_category_size {
        info!(
            "Skipping {category}: {} qualifying responses, need {}",
            members.len(),
            config.min_category_size
        );
        return Ok(Vec::new());
    }

    if config.is_summary_only(category) {
        debug!("{category} is summary-only; one cohort of {}", members.len());
        return Ok(vec![Cohort {
            category: category.to_string(),
            members: members.iter().map(|m| m.id).collect(),
            kind: CohortKind::WholeCategory,
        }]);
    }

    cluster_members(category, &members, config)
}

/// Partition `members` with k-means over unit-normalized vectors.
///
/// Cohorts come back in label order; each centroid is the mean of the members' raw vectors.
pub fn cluster_members(
    category: &str,
    members: &[Member],
    config: &PipelineConfig,
) -> AppResult<Vec<Cohort>> {
    let rows: Vec<&[f32]> = members.iter().map(|m| m.embedding.as_slice()).collect();
    let raw = embeddings_to_ndarray(&rows)?; // raw = (n_members, dim)
    let normalized = normalize_rows(raw.clone());

    let k = config.cluster_count(members.len());
    let mut kmeans = KMeans::new(k);
    kmeans.set_n_init(config.n_init).set_seed(config.seed);
    let labels = kmeans.fit_predict(&normalized)?;
    info!("Clustered {} {category} responses into k={k}", members.len());
    debug!(
        "{category}: inertia={:?} after {:?} iterations",
        kmeans.inertia(),
        kmeans.n_iter()
    );

    let mut by_label: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (row, label) in labels.iter().enumerate() {
        by_label.entry(*label).or_default().push(row);
    }

    Ok(by_label
        .into_iter()
        .map(|(label, rows)| {
            let member_rows = raw.select(ndarray::Axis(0), &rows);
            Cohort {
                category: category.to_string(),
                members: rows.iter().map(|&r| members[r].id).collect(),
                kind: CohortKind::Cluster {
                    label,
                    centroid: mean_vector(&member_rows),
                },
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn member(id: ResponseId, embedding: Vec<f32>) -> Member {
        Member { id, embedding }
    }

    /// Three tight groups along different axes, three members each.
    fn three_groups() -> Vec<Member> {
        let mut out = Vec::new();
        let mut id = 1;
        for axis in 0..3 {
            for jitter in [0.0_f32, 0.05, 0.1] {
                let mut v = vec![jitter; 3];
                v[axis] = 2.0 + jitter;
                out.push(member(id, v));
                id += 1;
            }
        }
        out
    }

    fn partition(cohorts: &[Cohort]) -> HashSet<Vec<ResponseId>> {
        cohorts
            .iter()
            .map(|c| {
                let mut m = c.members.clone();
                m.sort();
                m
            })
            .collect()
    }

    #[test]
    fn nine_members_make_three_clusters() {
        let cohorts = build_cohorts("Pedagogy", three_groups(), &PipelineConfig::default()).unwrap();
        assert_eq!(cohorts.len(), 3);
        assert_eq!(cohorts.iter().map(|c| c.members.len()).sum::<usize>(), 9);
        assert_eq!(
            partition(&cohorts),
            HashSet::from([vec![1, 2, 3], vec![4, 5, 6], vec![7, 8, 9]])
        );
        for cohort in &cohorts {
            assert!(cohort.centroid().is_some());
        }
    }

    #[test]
    fn cohorts_follow_label_order() {
        let cohorts = build_cohorts("Pedagogy", three_groups(), &PipelineConfig::default()).unwrap();
        let labels: Vec<usize> = cohorts
            .iter()
            .map(|c| match c.kind {
                CohortKind::Cluster { label, .. } => label,
                CohortKind::WholeCategory => usize::MAX,
            })
            .collect();
        assert_eq!(labels, vec![0, 1, 2]);
    }

    #[test]
    fn clustering_is_deterministic() {
        let members: Vec<Member> = (0..14)
            .map(|i| {
                let t = i as f32;
                member(i, vec![(t * 0.7).sin(), (t * 1.3).cos(), (t * 0.4).sin() + 0.2])
            })
            .collect();
        let config = PipelineConfig::default();
        let a = build_cohorts("Pedagogy", members.clone(), &config).unwrap();
        let b = build_cohorts("Pedagogy", members, &config).unwrap();
        assert_eq!(partition(&a), partition(&b));
        assert_eq!(a.len(), config.cluster_count(14));
    }

    #[test]
    fn centroid_is_mean_of_raw_vectors() {
        let mut members = three_groups();
        members[0].embedding[1] = f32::NAN;
        let cohorts = cluster_members("Pedagogy", &members, &PipelineConfig::default()).unwrap();
        for cohort in cohorts {
            let centroid = cohort.centroid().unwrap();
            assert!(centroid.iter().all(|v| v.is_finite()));
            for dim in 0..3 {
                let expected: f32 = cohort
                    .members
                    .iter()
                    .map(|id| {
                        let v = members[(*id - 1) as usize].embedding[dim];
                        if v.is_finite() { v } else { 0.0 }
                    })
                    .sum::<f32>()
                    / cohort.members.len() as f32;
                assert!((centroid[dim] - expected).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn summary_only_category_is_one_cohort() {
        let members: Vec<Member> = (1..=5).map(|i| member(i, vec![i as f32, 1.0])).collect();
        let cohorts = build_cohorts("Engagement", members, &PipelineConfig::default()).unwrap();
        assert_eq!(cohorts.len(), 1);
        assert_eq!(cohorts[0].members, vec![1, 2, 3, 4, 5]);
        assert_eq!(cohorts[0].kind, CohortKind::WholeCategory);
        assert!(cohorts[0].centroid().is_none());
    }

    #[test]
    fn small_and_skipped_categories_yield_nothing() {
        let config = PipelineConfig::default();
        let two = vec![member(1, vec![1.0]), member(2, vec![2.0])];
        assert!(build_cohorts("Assessment", two.clone(), &config).unwrap().is_empty());
        assert!(build_cohorts("Pedagogy", two, &config).unwrap().is_empty());
        assert!(
            build_cohorts("Class Metadata", three_groups(), &config)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn mismatched_dimensions_do_not_qualify() {
        let members = vec![
            member(1, vec![1.0, 0.0]),
            member(2, vec![0.0, 1.0]),
            member(3, vec![1.0, 1.0, 1.0]),
            member(4, vec![]),
        ];
        // Two of four qualify, so the category falls under the threshold.
        assert!(
            build_cohorts("Pedagogy", members, &PipelineConfig::default())
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn grouping_drops_skipped_categories() {
        let responses = vec![
            ResponseVector {
                id: 1,
                embeddings: BTreeMap::from([
                    ("Pedagogy".to_string(), vec![1.0]),
                    ("Class Metadata".to_string(), vec![2.0]),
                ]),
            },
            ResponseVector {
                id: 2,
                embeddings: BTreeMap::from([("Pedagogy".to_string(), vec![3.0])]),
            },
        ];
        let grouped = group_by_category(responses, &PipelineConfig::default());
        assert_eq!(grouped.len(), 1);
        let ids: Vec<ResponseId> = grouped["Pedagogy"].iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn cluster_count_stays_in_range() {
        let config = PipelineConfig::default();
        for n in 3..60 {
            let members: Vec<Member> = (0..n)
                .map(|i| {
                    let t = i as f32;
                    member(i, vec![t.sin(), t.cos(), (t * 0.3).sin()])
                })
                .collect();
            let cohorts = build_cohorts("Pedagogy", members, &config).unwrap();
            let k = config.cluster_count(n as usize);
            assert!((2..=6).contains(&k));
            assert!(cohorts.len() <= k);
            assert_eq!(cohorts.iter().map(|c| c.members.len()).sum::<usize>(), n as usize);
        }
    }
}
