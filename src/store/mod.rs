pub mod postgres;

use futures::future::BoxFuture;

use crate::AppResult;
use crate::model::{
    ClusterRecord, NewChunk, QuestionCategories, ReferenceChunk, ResponseAnswers, ResponseId,
    ResponseVector,
};
use crate::submit::Submission;

/// Everything the pipeline, ingestion and submission paths need from persistent storage.
///
/// Failures here are run-fatal: callers propagate them rather than degrade.
pub trait FeedbackStore: Send + Sync {
    /// Drop every previously computed cluster (and dependent rows).
    fn clear_clusters(&self) -> BoxFuture<'_, AppResult<()>>;

    fn question_categories(&self) -> BoxFuture<'_, AppResult<QuestionCategories>>;

    /// Responses that carry precomputed category embeddings.
    fn response_vectors(&self) -> BoxFuture<'_, AppResult<Vec<ResponseVector>>>;

    /// Raw answers of the given responses. Order is unspecified.
    fn response_answers<'a>(
        &'a self,
        ids: &'a [ResponseId],
    ) -> BoxFuture<'a, AppResult<Vec<ResponseAnswers>>>;

    fn reference_chunks(&self) -> BoxFuture<'_, AppResult<Vec<ReferenceChunk>>>;

    /// Insert the whole batch in a single transaction. Returns the number of rows written.
    fn insert_clusters<'a>(&'a self, records: &'a [ClusterRecord])
    -> BoxFuture<'a, AppResult<u64>>;

    fn insert_chunks<'a>(&'a self, chunks: &'a [NewChunk]) -> BoxFuture<'a, AppResult<u64>>;

    fn insert_response<'a>(&'a self, submission: &'a Submission) -> BoxFuture<'a, AppResult<()>>;
}
