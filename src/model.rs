use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Primary key of a row in `teacher_responses`.
pub type ResponseId = i64;

/// A dense embedding as stored in the database.
pub type Embedding = Vec<f32>;

/// A single answer inside a response payload.
///
/// Anything that is not one of these shapes (objects, `null`) is rejected when the payload is
/// deserialized, so the pipeline never has to second-guess answer types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerValue {
    Text(String),
    Number(serde_json::Number),
    Flag(bool),
    Choices(Vec<String>),
}

impl Display for AnswerValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AnswerValue::Text(text) => write!(f, "{text}"),
            AnswerValue::Number(num) => write!(f, "{num}"),
            AnswerValue::Flag(flag) => write!(f, "{flag}"),
            AnswerValue::Choices(choices) => write!(f, "{}", choices.join(", ")),
        }
    }
}

/// Answers of one teacher response, keyed by question id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseAnswers(pub BTreeMap<String, AnswerValue>);

impl ResponseAnswers {
    /// Rendered answers whose question belongs to `category`, in question-id order.
    pub fn answers_for<'a>(
        &'a self,
        category: &'a str,
        questions: &'a QuestionCategories,
    ) -> impl Iterator<Item = String> + 'a {
        self.0
            .iter()
            .filter(move |(qid, _)| questions.category_of(qid) == Some(category))
            .map(|(_, answer)| answer.to_string())
    }
}

/// Question id -> feedback category lookup.
#[derive(Debug, Clone, Default)]
pub struct QuestionCategories(HashMap<String, String>);

impl QuestionCategories {
    pub fn category_of(&self, question_id: &str) -> Option<&str> {
        self.0.get(question_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for QuestionCategories {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Per-category embeddings of a single teacher response.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseVector {
    pub id: ResponseId,
    pub embeddings: BTreeMap<String, Embedding>,
}

/// A chunk of uploaded training material.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceChunk {
    pub id: i64,
    pub source_file: String,
    pub text: String,
    pub embedding: Embedding,
}

/// A chunk that has been embedded but not stored yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChunk {
    pub source_file: String,
    pub text: String,
    pub embedding: Embedding,
}

/// How a cohort came to be.
#[derive(Debug, Clone, PartialEq)]
pub enum CohortKind {
    /// Summary-only category: every qualifying response, no centroid.
    WholeCategory,
    /// One k-means cluster and the mean of its members' raw vectors.
    Cluster { label: usize, centroid: Embedding },
}

/// A group of responses within one category that gets a single summary and plan.
#[derive(Debug, Clone, PartialEq)]
pub struct Cohort {
    pub category: String,
    pub members: Vec<ResponseId>,
    pub kind: CohortKind,
}

impl Cohort {
    pub fn centroid(&self) -> Option<&Embedding> {
        match &self.kind {
            CohortKind::WholeCategory => None,
            CohortKind::Cluster { centroid, .. } => Some(centroid),
        }
    }
}

/// A persisted row of `problem_clusters`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub cluster_name: String,
    pub cluster_summary: String,
    pub teacher_ids: Vec<ResponseId>,
    pub category: String,
    /// Stored, but not part of the JSON handed back to callers.
    #[serde(skip)]
    pub cluster_vector: Option<Embedding>,
    pub proposed_plan: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// Result of a full clustering pass.
#[derive(Debug, Serialize)]
pub struct ClusterRunReport {
    pub status: Status,
    pub clusters: Vec<ClusterRecord>,
}
