//! Narrative Synthesizer: the summary call and the curriculum call for one cohort.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use cohort_ai_include_zstd::include_zstd;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::query::{Query, decode_prompt};
use super::{ChatMessage, TextGenerator};
use crate::ai::prompt::PromptTemplate;
use crate::config::Sampling;
use crate::{AppError, AppResult, impl_query};

static CLUSTER_SUMMARY_PROMPT: &[u8] = include_zstd!("src/ai/prompts/cluster_summary.md");
static PROPOSED_PLAN_PROMPT: &[u8] = include_zstd!("src/ai/prompts/proposed_plan.md");

/// System message of the curriculum call.
pub const PLAN_SYSTEM_MESSAGE: &str = "You summarize and design teacher training curriculums.";

/// # cluster_summary
/// Name and factual synopsis of a group of teacher feedback responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ClusterSynopsis {
    /// Short title for the group
    pub cluster_name: String,
    /// Five to six factual sentences
    pub cluster_summary: String,
}

impl Display for ClusterSynopsis {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.cluster_name, self.cluster_summary)
    }
}

impl_query!(ClusterSynopsis, CLUSTER_SUMMARY_PROMPT);

/// What the summary prompt suggests as a cluster name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameHint {
    /// `"<category> – Common Issues"`, for categories summarized as a whole.
    CategoryIssues,
    /// A free descriptive title, for k-means clusters.
    Descriptive,
}

impl NameHint {
    pub fn render(&self, category: &str) -> String {
        match self {
            NameHint::CategoryIssues => format!("{category} – Common Issues"),
            NameHint::Descriptive => "short descriptive title".to_string(),
        }
    }
}

/// The raw prompt templates, for display.
pub fn prompt_templates() -> AppResult<Vec<(&'static str, String)>> {
    Ok(vec![
        (
            "cluster_summary",
            ClusterSynopsis::template()?.as_str().to_string(),
        ),
        ("proposed_plan", decode_prompt(PROPOSED_PLAN_PROMPT)?),
    ])
}

/// Call 1: a strict-JSON name and synopsis for the cohort's answers.
///
/// Any failure (transport, missing JSON span, schema mismatch, blank name) is returned as an
/// error; the caller drops the cohort.
#[tracing::instrument(
    name = "Summarizing cohort",
    level = "debug",
    skip(generator, answers, sampling),
    fields(answers = answers.len())
)]
pub async fn summarize(
    generator: &dyn TextGenerator,
    category: &str,
    hint: NameHint,
    answers: &[String],
    sampling: Sampling,
) -> AppResult<ClusterSynopsis> {
    let name_hint = hint.render(category);
    let responses = answers.join("\n");
    let vars = HashMap::from([
        ("category", category),
        ("name_hint", name_hint.as_str()),
        ("responses", responses.as_str()),
    ]);
    let messages = [ChatMessage::user(ClusterSynopsis::prompt(&vars)?)];

    let raw = generator.generate(&messages, sampling).await?;
    let synopsis = ClusterSynopsis::from_str(&raw)?;
    if synopsis.cluster_name.trim().is_empty() {
        return Err(AppError::Contract("cluster_name is blank".to_string()));
    }
    trace!("Synopsis: {synopsis}");
    Ok(synopsis)
}

/// Call 2: a free-text curriculum grounded in `materials`.
///
/// The text is trimmed; an empty reply counts as no plan.
#[tracing::instrument(
    name = "Proposing training plan",
    level = "debug",
    skip(generator, synopsis, materials, sampling),
    fields(cluster = %synopsis.cluster_name)
)]
pub async fn propose_plan(
    generator: &dyn TextGenerator,
    synopsis: &ClusterSynopsis,
    materials: &str,
    top_k: usize,
    sampling: Sampling,
) -> AppResult<Option<String>> {
    let top_k = top_k.to_string();
    let vars = HashMap::from([
        ("cluster_name", synopsis.cluster_name.as_str()),
        ("cluster_summary", synopsis.cluster_summary.as_str()),
        ("top_k", top_k.as_str()),
        ("materials", materials),
    ]);
    let prompt = PromptTemplate::new(decode_prompt(PROPOSED_PLAN_PROMPT)?).render(&vars);
    let messages = [
        ChatMessage::system(PLAN_SYSTEM_MESSAGE),
        ChatMessage::user(prompt),
    ];

    let plan = generator.generate(&messages, sampling).await?;
    let plan = plan.trim();
    if plan.is_empty() {
        debug!("Empty plan for {}", synopsis.cluster_name);
        return Ok(None);
    }
    Ok(Some(plan.to_string()))
}
