//! A full clustering pass: read, build cohorts, synthesize, replace the stored clusters.

use tracing::{Instrument, debug, info, info_span, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;
use tracing_indicatif::style::ProgressStyle;

use crate::AppResult;
use crate::ai::synthesis::{self, ClusterSynopsis, NameHint};
use crate::ai::{Embedder, TextGenerator};
use crate::cohort::{build_cohorts, group_by_category};
use crate::config::PipelineConfig;
use crate::model::{
    ClusterRecord, ClusterRunReport, Cohort, CohortKind, Embedding, QuestionCategories, Status,
};
use crate::retrieve::{InMemoryPassageIndex, PassageIndex, grounding_context};
use crate::store::FeedbackStore;

/// External collaborators of a run, built once at startup.
pub struct Services<'s> {
    pub store: &'s dyn FeedbackStore,
    pub generator: &'s dyn TextGenerator,
    pub embedder: &'s dyn Embedder,
}

/// Truncate the cluster table, rebuild every cohort and insert the survivors in one batch.
///
/// Only store failures abort the run. A cohort whose summary fails is dropped; a cohort whose
/// plan fails is kept without one.
#[tracing::instrument(name = "Running clustering pass", level = "info", skip(services, config))]
pub async fn run_clustering(
    services: &Services<'_>,
    config: &PipelineConfig,
) -> AppResult<ClusterRunReport> {
    let store = services.store;
    store.clear_clusters().await?;

    let questions = store.question_categories().await?;
    let responses = store.response_vectors().await?;
    let index = InMemoryPassageIndex::new(store.reference_chunks().await?);
    info!(
        "Loaded {} questions, {} embedded responses, {} material chunks",
        questions.len(),
        responses.len(),
        index.len()
    );
    if questions.is_empty() {
        warn!("No survey questions found; no answers can be attributed to a category");
    }
    if index.is_empty() {
        warn!("No reference material ingested; training plans will be ungrounded");
    }

    let mut cohorts: Vec<Cohort> = Vec::new();
    for (category, members) in group_by_category(responses, config) {
        match build_cohorts(&category, members, config) {
            Ok(built) => cohorts.extend(built),
            Err(e) => warn!("Could not build cohorts for {category}: {e}"),
        }
    }

    let header_span = info_span!("Synthesizing cohorts...");
    header_span.pb_set_message("Synthesizing...");
    header_span.pb_set_finish_message("Synthesis complete");
    header_span.pb_set_length(cohorts.len() as u64);
    if let Ok(style) =
        ProgressStyle::default_bar().template("{msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
    {
        header_span.pb_set_style(&style);
    }

    let mut records = Vec::new();
    for cohort in cohorts {
        let record = synthesize_cohort(services, config, &questions, &index, cohort)
            .instrument(header_span.clone())
            .await?;
        header_span.pb_inc(1);
        let Some(record) = record else {
            continue;
        };
        let clustered = record.cluster_vector.is_some();
        records.push(record);
        if clustered && !config.cohort_delay.is_zero() {
            tokio::time::sleep(config.cohort_delay).await;
        }
    }
    drop(header_span);

    if !records.is_empty() {
        store.insert_clusters(&records).await?;
    }
    info!("Clustering pass produced {} clusters", records.len());

    Ok(ClusterRunReport {
        status: Status::Success,
        clusters: records,
    })
}

/// Both generative calls for one cohort. `Ok(None)` means the cohort was dropped.
async fn synthesize_cohort(
    services: &Services<'_>,
    config: &PipelineConfig,
    questions: &QuestionCategories,
    index: &dyn PassageIndex,
    cohort: Cohort,
) -> AppResult<Option<ClusterRecord>> {
    let category = cohort.category.as_str();
    let answers: Vec<String> = services
        .store
        .response_answers(&cohort.members)
        .await?
        .iter()
        .flat_map(|answers| answers.answers_for(category, questions).collect::<Vec<_>>())
        .collect();
    if answers.is_empty() {
        warn!(
            "No {category} answers among {} responses; dropping cohort",
            cohort.members.len()
        );
        return Ok(None);
    }

    let hint = match cohort.kind {
        CohortKind::WholeCategory => NameHint::CategoryIssues,
        CohortKind::Cluster { .. } => NameHint::Descriptive,
    };
    let synopsis = match synthesis::summarize(
        services.generator,
        category,
        hint,
        &answers,
        config.summary_sampling,
    )
    .await
    {
        Ok(synopsis) => synopsis,
        Err(e) => {
            warn!("Failed summary for category {category}: {e}");
            return Ok(None);
        }
    };

    let query = match cohort.centroid() {
        Some(centroid) => Some(centroid.clone()),
        None => summary_query(services.embedder, &synopsis).await,
    };
    let proposed_plan = match query {
        Some(query) => {
            let materials = grounding_context(index, &query, config.top_k);
            match synthesis::propose_plan(
                services.generator,
                &synopsis,
                &materials,
                config.top_k,
                config.plan_sampling,
            )
            .await
            {
                Ok(plan) => plan,
                Err(e) => {
                    warn!(
                        "Failed generating proposed plan for {}: {e}",
                        synopsis.cluster_name
                    );
                    None
                }
            }
        }
        None => None,
    };
    debug!(
        "Proposed plan for '{}' in '{category}':\n{}",
        synopsis.cluster_name,
        proposed_plan.as_deref().unwrap_or("<none>")
    );

    let cluster_vector = cohort.centroid().cloned();
    Ok(Some(ClusterRecord {
        cluster_name: synopsis.cluster_name,
        cluster_summary: synopsis.cluster_summary,
        teacher_ids: cohort.members,
        category: cohort.category,
        cluster_vector,
        proposed_plan,
    }))
}

/// Retrieval query for a cohort without a centroid: the embedded summary text.
async fn summary_query(embedder: &dyn Embedder, synopsis: &ClusterSynopsis) -> Option<Embedding> {
    let texts = [synopsis.cluster_summary.clone()];
    match embedder.embed(&texts).await {
        Ok(mut embeddings) if embeddings.len() == 1 => embeddings.pop(),
        Ok(embeddings) => {
            warn!(
                "Expected one summary embedding for {}, got {}",
                synopsis.cluster_name,
                embeddings.len()
            );
            None
        }
        Err(e) => {
            warn!("Could not embed summary of {}: {e}", synopsis.cluster_name);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use crate::AppError;
    use crate::model::{ReferenceChunk, ResponseAnswers, ResponseId, ResponseVector};
    use crate::testing::{FakeGenerator, HashEmbedder, MemoryStore};

    const SUMMARY_REPLY: &str =
        "Sure! {\"cluster_name\": \"Needs more practice\", \"cluster_summary\": \"Teachers want practice.\"}";

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            cohort_delay: Duration::ZERO,
            ..PipelineConfig::default()
        }
    }

    /// Questions `q-<category>` map to their category; each response answers every category
    /// it has a vector for.
    fn seeded_store(categories: &[(&str, Vec<(ResponseId, Vec<f32>)>)]) -> MemoryStore {
        let store = MemoryStore::default();
        let mut vectors: BTreeMap<ResponseId, ResponseVector> = BTreeMap::new();
        let mut answers: BTreeMap<ResponseId, ResponseAnswers> = BTreeMap::new();
        for (category, members) in categories {
            store.add_question(&format!("q-{category}"), category);
            for (id, embedding) in members {
                vectors
                    .entry(*id)
                    .or_insert_with(|| ResponseVector {
                        id: *id,
                        embeddings: BTreeMap::new(),
                    })
                    .embeddings
                    .insert(category.to_string(), embedding.clone());
                let entry = answers.entry(*id).or_default();
                entry.0.insert(
                    format!("q-{category}"),
                    crate::model::AnswerValue::Text(format!("answer {id} about {category}")),
                );
            }
        }
        for (id, vector) in vectors {
            store.add_response(vector, answers.remove(&id).unwrap_or_default());
        }
        store.add_chunk(ReferenceChunk {
            id: 1,
            source_file: "guide.pdf".into(),
            text: "Use think-pair-share.".into(),
            embedding: vec![1.0, 0.0, 0.0],
        });
        store
    }

    fn pedagogy_members() -> Vec<(ResponseId, Vec<f32>)> {
        let mut out = Vec::new();
        for (group, axis) in [(0, 0), (1, 1), (2, 2)] {
            for j in 0..3 {
                let mut v = vec![0.05 * j as f32; 3];
                v[axis] = 3.0;
                out.push((10 * (group + 1) + j, v));
            }
        }
        out
    }

    fn engagement_members(n: i64) -> Vec<(ResponseId, Vec<f32>)> {
        (1..=n).map(|i| (100 + i, vec![i as f32, 1.0, 0.5])).collect()
    }

    fn always(reply: &str) -> FakeGenerator {
        let reply = reply.to_string();
        FakeGenerator::responding(move |messages| {
            if messages.len() == 1 {
                Ok(reply.clone())
            } else {
                Ok("Module 1: Practice".to_string())
            }
        })
    }

    #[tokio::test]
    async fn nine_pedagogy_responses_make_three_clusters() {
        let store = seeded_store(&[("Pedagogy", pedagogy_members())]);
        let generator = always(SUMMARY_REPLY);
        let embedder = HashEmbedder::new(3);
        let services = Services {
            store: &store,
            generator: &generator,
            embedder: &embedder,
        };
        let report = run_clustering(&services, &fast_config()).await.unwrap();

        assert_eq!(report.status, Status::Success);
        assert_eq!(report.clusters.len(), 3);
        let total: usize = report.clusters.iter().map(|c| c.teacher_ids.len()).sum();
        assert_eq!(total, 9);
        for cluster in &report.clusters {
            assert!(!cluster.teacher_ids.is_empty());
            assert_eq!(cluster.category, "Pedagogy");
            assert!(cluster.cluster_vector.is_some());
            assert_eq!(cluster.proposed_plan.as_deref(), Some("Module 1: Practice"));
        }
        assert_eq!(store.clusters(), report.clusters);
        assert_eq!(store.clear_count(), 1);
    }

    #[tokio::test]
    async fn summary_only_category_is_one_record_without_vector() {
        let store = seeded_store(&[("Engagement", engagement_members(5))]);
        let generator = always(
            "{\"cluster_name\": \"Engagement – Common Issues\", \"cluster_summary\": \"Low energy.\"}",
        );
        let embedder = HashEmbedder::new(3);
        let services = Services {
            store: &store,
            generator: &generator,
            embedder: &embedder,
        };
        let report = run_clustering(&services, &fast_config()).await.unwrap();

        assert_eq!(report.clusters.len(), 1);
        let cluster = &report.clusters[0];
        assert!(cluster.cluster_vector.is_none());
        assert_eq!(cluster.cluster_name, "Engagement – Common Issues");
        assert_eq!(cluster.teacher_ids, vec![101, 102, 103, 104, 105]);
        assert!(cluster.proposed_plan.is_some());
        // The summary text was embedded as the retrieval query.
        assert_eq!(embedder.calls(), vec![vec!["Low energy.".to_string()]]);
    }

    #[tokio::test]
    async fn small_and_skipped_categories_produce_nothing() {
        let store = seeded_store(&[
            ("Assessment", engagement_members(2)),
            ("Class Metadata", pedagogy_members()),
        ]);
        let generator = always(SUMMARY_REPLY);
        let embedder = HashEmbedder::new(3);
        let services = Services {
            store: &store,
            generator: &generator,
            embedder: &embedder,
        };
        let report = run_clustering(&services, &fast_config()).await.unwrap();

        assert!(report.clusters.is_empty());
        assert!(generator.calls().is_empty());
        assert!(store.clusters().is_empty());
        assert_eq!(store.insert_batches(), 0);
    }

    #[tokio::test]
    async fn unparseable_summary_drops_only_that_cohort() {
        let store = seeded_store(&[
            ("Engagement", engagement_members(4)),
            ("Pedagogy", pedagogy_members()),
        ]);
        let generator = FakeGenerator::responding(|messages| {
            let prompt = &messages[0].content;
            if messages.len() == 2 {
                Ok("plan".to_string())
            } else if prompt.contains("\"Engagement\"") {
                Ok("I'd rather not answer in JSON.".to_string())
            } else {
                Ok(SUMMARY_REPLY.to_string())
            }
        });
        let embedder = HashEmbedder::new(3);
        let services = Services {
            store: &store,
            generator: &generator,
            embedder: &embedder,
        };
        let report = run_clustering(&services, &fast_config()).await.unwrap();

        assert_eq!(report.clusters.len(), 3);
        assert!(report.clusters.iter().all(|c| c.category == "Pedagogy"));
    }

    #[tokio::test]
    async fn failed_plan_keeps_the_cohort() {
        let store = seeded_store(&[("Pedagogy", pedagogy_members())]);
        let generator = FakeGenerator::responding(|messages| {
            if messages.len() == 2 {
                Err(AppError::Other("service unavailable".into()))
            } else {
                Ok(SUMMARY_REPLY.to_string())
            }
        });
        let embedder = HashEmbedder::new(3);
        let services = Services {
            store: &store,
            generator: &generator,
            embedder: &embedder,
        };
        let report = run_clustering(&services, &fast_config()).await.unwrap();

        assert_eq!(report.clusters.len(), 3);
        assert!(report.clusters.iter().all(|c| c.proposed_plan.is_none()));
        assert_eq!(store.clusters().len(), 3);
    }

    #[tokio::test]
    async fn failed_summary_embedding_means_no_plan() {
        let store = seeded_store(&[("Resources", engagement_members(3))]);
        let generator = always(SUMMARY_REPLY);
        let embedder = HashEmbedder::failing();
        let services = Services {
            store: &store,
            generator: &generator,
            embedder: &embedder,
        };
        let report = run_clustering(&services, &fast_config()).await.unwrap();

        assert_eq!(report.clusters.len(), 1);
        assert!(report.clusters[0].proposed_plan.is_none());
        // Only the summary call went out.
        assert_eq!(generator.calls().len(), 1);
    }

    #[tokio::test]
    async fn cohorts_without_answer_text_are_dropped() {
        let store = seeded_store(&[("Pedagogy", pedagogy_members())]);
        store.clear_answers();
        let generator = always(SUMMARY_REPLY);
        let embedder = HashEmbedder::new(3);
        let services = Services {
            store: &store,
            generator: &generator,
            embedder: &embedder,
        };
        let report = run_clustering(&services, &fast_config()).await.unwrap();
        assert!(report.clusters.is_empty());
        assert!(generator.calls().is_empty());
    }

    #[tokio::test]
    async fn store_failure_aborts_the_run() {
        let store = seeded_store(&[("Pedagogy", pedagogy_members())]).fail_inserts();
        let generator = always(SUMMARY_REPLY);
        let embedder = HashEmbedder::new(3);
        let services = Services {
            store: &store,
            generator: &generator,
            embedder: &embedder,
        };
        assert!(run_clustering(&services, &fast_config()).await.is_err());
        assert!(store.clusters().is_empty());
    }

    #[tokio::test]
    async fn grounding_passages_reach_the_plan_prompt() {
        let store = seeded_store(&[("Pedagogy", pedagogy_members())]);
        let generator = always(SUMMARY_REPLY);
        let embedder = HashEmbedder::new(3);
        let services = Services {
            store: &store,
            generator: &generator,
            embedder: &embedder,
        };
        run_clustering(&services, &fast_config()).await.unwrap();

        let plan_prompts: Vec<String> = generator
            .calls()
            .into_iter()
            .filter(|(messages, _)| messages.len() == 2)
            .map(|(messages, _)| messages[1].content.clone())
            .collect();
        assert_eq!(plan_prompts.len(), 3);
        assert!(plan_prompts.iter().all(|p| p.contains("Use think-pair-share.")));
    }

    #[tokio::test(start_paused = true)]
    async fn delay_follows_each_clustered_cohort_only() {
        let delay = Duration::from_millis(150);
        let config = PipelineConfig {
            cohort_delay: delay,
            ..PipelineConfig::default()
        };
        let embedder = HashEmbedder::new(3);

        let store = seeded_store(&[("Pedagogy", pedagogy_members())]);
        let generator = always(SUMMARY_REPLY);
        let services = Services {
            store: &store,
            generator: &generator,
            embedder: &embedder,
        };
        let start = tokio::time::Instant::now();
        let report = run_clustering(&services, &config).await.unwrap();
        assert_eq!(report.clusters.len(), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= delay * 3, "elapsed {elapsed:?}");
        assert!(elapsed < delay * 4, "elapsed {elapsed:?}");

        let store = seeded_store(&[("Engagement", engagement_members(5))]);
        let generator = always(SUMMARY_REPLY);
        let services = Services {
            store: &store,
            generator: &generator,
            embedder: &embedder,
        };
        let start = tokio::time::Instant::now();
        let report = run_clustering(&services, &config).await.unwrap();
        assert_eq!(report.clusters.len(), 1);
        assert!(start.elapsed() < delay, "elapsed {:?}", start.elapsed());
    }
}
