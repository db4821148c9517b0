use std::collections::BTreeMap;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, info, trace, warn};

use super::FeedbackStore;
use crate::AppResult;
use crate::model::{
    ClusterRecord, Embedding, NewChunk, QuestionCategories, ReferenceChunk, ResponseAnswers,
    ResponseId, ResponseVector,
};
use crate::submit::Submission;

/// Postgres caps bind parameters at 65535 per statement; stay well below it.
const ROWS_PER_STATEMENT: usize = 1000;

/// `FeedbackStore` backed by the Supabase Postgres database.
#[derive(Clone)]
pub struct PgFeedbackStore {
    pool: PgPool,
}

impl PgFeedbackStore {
    #[tracing::instrument(name = "Connecting to Postgres", level = "debug", skip(url))]
    pub async fn connect(url: &str, max_connections: u32) -> AppResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(url)
            .await?;
        trace!("Connected to Postgres");
        Ok(Self { pool })
    }

    /// Apply the bundled migrations.
    #[tracing::instrument(name = "Running database migrations", level = "info", skip(self))]
    pub async fn migrate(&self) -> AppResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

/// Parse the `category_embeddings` jsonb column. Entries that are not numeric arrays are
/// dropped; a column that is not an object yields `None`.
pub(crate) fn parse_category_embeddings(
    response_id: ResponseId,
    value: Value,
) -> Option<BTreeMap<String, Embedding>> {
    let Value::Object(map) = value else {
        warn!("Response {response_id} has non-object category embeddings; skipping");
        return None;
    };
    let mut out = BTreeMap::new();
    for (category, raw) in map {
        match serde_json::from_value::<Embedding>(raw) {
            Ok(embedding) if !embedding.is_empty() => {
                out.insert(category, embedding);
            }
            Ok(_) => warn!("Response {response_id} has an empty embedding for {category}"),
            Err(e) => warn!("Response {response_id} has a malformed embedding for {category}: {e}"),
        }
    }
    Some(out)
}

/// Parse the `responses` jsonb column; anything unusable becomes an empty answer set.
pub(crate) fn parse_answers(value: Value) -> ResponseAnswers {
    match serde_json::from_value::<ResponseAnswers>(value) {
        Ok(answers) => answers,
        Err(e) => {
            warn!("Ignoring malformed response payload: {e}");
            ResponseAnswers::default()
        }
    }
}

impl FeedbackStore for PgFeedbackStore {
    fn clear_clusters(&self) -> BoxFuture<'_, AppResult<()>> {
        async move {
            sqlx::query("TRUNCATE TABLE public.problem_clusters RESTART IDENTITY CASCADE")
                .execute(&self.pool)
                .await?;
            info!("Cleared old clusters");
            Ok(())
        }
        .boxed()
    }

    fn question_categories(&self) -> BoxFuture<'_, AppResult<QuestionCategories>> {
        async move {
            let rows: Vec<(String, String)> =
                sqlx::query_as("SELECT question_id::text, category FROM public.questions")
                    .fetch_all(&self.pool)
                    .await?;
            debug!("Fetched {} questions", rows.len());
            Ok(rows.into_iter().collect())
        }
        .boxed()
    }

    fn response_vectors(&self) -> BoxFuture<'_, AppResult<Vec<ResponseVector>>> {
        async move {
            let rows: Vec<(i64, Value)> = sqlx::query_as(
                "SELECT response_id::bigint, category_embeddings \
                 FROM public.teacher_responses \
                 WHERE category_embeddings IS NOT NULL \
                 ORDER BY response_id",
            )
            .fetch_all(&self.pool)
            .await?;
            debug!("Fetched {} embedded responses", rows.len());
            Ok(rows
                .into_iter()
                .filter_map(|(id, value)| {
                    parse_category_embeddings(id, value).map(|embeddings| ResponseVector {
                        id,
                        embeddings,
                    })
                })
                .collect())
        }
        .boxed()
    }

    fn response_answers<'a>(
        &'a self,
        ids: &'a [ResponseId],
    ) -> BoxFuture<'a, AppResult<Vec<ResponseAnswers>>> {
        async move {
            let rows: Vec<(Value,)> = sqlx::query_as(
                "SELECT responses FROM public.teacher_responses WHERE response_id = ANY($1)",
            )
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows.into_iter().map(|(value,)| parse_answers(value)).collect())
        }
        .boxed()
    }

    fn reference_chunks(&self) -> BoxFuture<'_, AppResult<Vec<ReferenceChunk>>> {
        async move {
            // `::text` accepts both jsonb and the legacy text-encoded vectors.
            let rows: Vec<(i64, String, String, String)> = sqlx::query_as(
                "SELECT chunk_id::bigint, source_file, chunk_text, embedding_vector::text \
                 FROM public.generic_material_chunks \
                 WHERE embedding_vector IS NOT NULL \
                 ORDER BY chunk_id",
            )
            .fetch_all(&self.pool)
            .await?;
            let mut chunks = Vec::with_capacity(rows.len());
            for (id, source_file, text, raw) in rows {
                match serde_json::from_str::<Embedding>(&raw) {
                    Ok(embedding) => chunks.push(ReferenceChunk {
                        id,
                        source_file,
                        text,
                        embedding,
                    }),
                    Err(e) => warn!("Chunk {id} has a malformed embedding: {e}"),
                }
            }
            debug!("Loaded {} material chunks", chunks.len());
            Ok(chunks)
        }
        .boxed()
    }

    fn insert_clusters<'a>(
        &'a self,
        records: &'a [ClusterRecord],
    ) -> BoxFuture<'a, AppResult<u64>> {
        async move {
            let mut tx = self.pool.begin().await?;
            let mut written = 0;
            for batch in records.chunks(ROWS_PER_STATEMENT) {
                let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                    "INSERT INTO public.problem_clusters \
                     (cluster_name, cluster_summary, teacher_ids, category, cluster_vector, proposed_plan) ",
                );
                builder.push_values(batch, |mut row, record| {
                    row.push_bind(&record.cluster_name)
                        .push_bind(&record.cluster_summary)
                        .push_bind(Json(&record.teacher_ids))
                        .push_bind(&record.category)
                        .push_bind(record.cluster_vector.as_ref().map(Json))
                        .push_bind(&record.proposed_plan);
                });
                written += builder.build().execute(&mut *tx).await?.rows_affected();
            }
            tx.commit().await?;
            info!("Inserted {written} clusters");
            Ok(written)
        }
        .boxed()
    }

    fn insert_chunks<'a>(&'a self, chunks: &'a [NewChunk]) -> BoxFuture<'a, AppResult<u64>> {
        async move {
            let mut tx = self.pool.begin().await?;
            let mut written = 0;
            for batch in chunks.chunks(ROWS_PER_STATEMENT) {
                let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                    "INSERT INTO public.generic_material_chunks \
                     (source_file, chunk_text, embedding_vector) ",
                );
                builder.push_values(batch, |mut row, chunk| {
                    row.push_bind(&chunk.source_file)
                        .push_bind(&chunk.text)
                        .push_bind(Json(&chunk.embedding));
                });
                written += builder.build().execute(&mut *tx).await?.rows_affected();
            }
            tx.commit().await?;
            debug!("Inserted {written} material chunks");
            Ok(written)
        }
        .boxed()
    }

    fn insert_response<'a>(&'a self, submission: &'a Submission) -> BoxFuture<'a, AppResult<()>> {
        async move {
            let mut tx = self.pool.begin().await?;
            let inserted = sqlx::query(
                "INSERT INTO public.teacher_responses \
                 (teacher_id, responses, category_embeddings) VALUES ($1, $2, $3)",
            )
            .bind(submission.teacher_id)
            .bind(Json(&submission.responses))
            .bind(submission.category_embeddings.as_ref().map(Json))
            .execute(&mut *tx)
            .await;
            match inserted {
                Ok(_) => {
                    tx.commit().await?;
                    Ok(())
                }
                Err(e) => {
                    tx.rollback().await?;
                    Err(e.into())
                }
            }
        }
        .boxed()
    }
}
