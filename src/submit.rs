//! Teacher-response submission.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{AppError, AppResult};
use crate::model::{Embedding, ResponseAnswers};
use crate::store::FeedbackStore;

pub const SAVED_MESSAGE: &str = "Response saved successfully.";

/// An incoming survey response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub teacher_id: i64,
    pub responses: ResponseAnswers,
    /// Precomputed per-category vectors; an empty map is stored as no embeddings.
    #[serde(default)]
    pub category_embeddings: Option<BTreeMap<String, Embedding>>,
}

impl Submission {
    /// Parse a JSON payload, naming the offending path on failure.
    pub fn from_json(payload: &str) -> AppResult<Self> {
        let jd = &mut serde_json::Deserializer::from_str(payload);
        let mut submission: Submission = serde_path_to_error::deserialize(jd)
            .map_err(|e| AppError::Validation(format!("{} at {}", e.inner(), e.path())))?;
        if submission
            .category_embeddings
            .as_ref()
            .is_some_and(BTreeMap::is_empty)
        {
            submission.category_embeddings = None;
        }
        submission.validate()?;
        Ok(submission)
    }

    pub fn validate(&self) -> AppResult<()> {
        for (category, embedding) in self.category_embeddings.iter().flatten() {
            if embedding.is_empty() {
                return Err(AppError::Validation(format!(
                    "embedding for {category} is empty"
                )));
            }
            if embedding.iter().any(|v| !v.is_finite()) {
                return Err(AppError::Validation(format!(
                    "embedding for {category} has non-finite values"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SubmitReport {
    Success { teacher_id: i64, message: String },
    Error { message: String },
}

/// Validate and store a response payload. Failures come back as an error report.
#[tracing::instrument(name = "Submitting response", level = "info", skip(store, payload))]
pub async fn submit_response(store: &dyn FeedbackStore, payload: &str) -> SubmitReport {
    let submission = match Submission::from_json(payload) {
        Ok(submission) => submission,
        Err(e) => {
            warn!("Rejected submission: {e}");
            return SubmitReport::Error {
                message: e.to_string(),
            };
        }
    };
    match store.insert_response(&submission).await {
        Ok(()) => {
            info!("Saved response for teacher {}", submission.teacher_id);
            SubmitReport::Success {
                teacher_id: submission.teacher_id,
                message: SAVED_MESSAGE.to_string(),
            }
        }
        Err(e) => {
            warn!("Insert for teacher {} failed: {e}", submission.teacher_id);
            SubmitReport::Error {
                message: e.to_string(),
            }
        }
    }
}
