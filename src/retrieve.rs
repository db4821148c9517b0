//! Relevant-Passage Retriever.

use std::cmp::Ordering;

use tracing::{debug, trace};

use crate::model::ReferenceChunk;

/// Separator between passages in the grounding context.
pub const PASSAGE_SEPARATOR: &str = "\n\n";

/// A reference chunk together with its similarity to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPassage<'a> {
    pub chunk: &'a ReferenceChunk,
    pub score: f32,
}

/// Nearest-neighbour lookup over the reference material.
pub trait PassageIndex {
    /// At most `k` passages, most similar first.
    fn nearest(&self, query: &[f32], k: usize) -> Vec<ScoredPassage<'_>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Brute-force cosine search over chunks loaded into memory once per run.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPassageIndex {
    chunks: Vec<ReferenceChunk>,
    norms: Vec<f32>,
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter()
        .map(|x| if x.is_finite() { x * x } else { 0.0 })
        .sum::<f32>()
        .sqrt()
}

fn cosine(a: &[f32], a_norm: f32, b: &[f32], b_norm: f32) -> f32 {
    let denom = a_norm * b_norm;
    if denom <= f32::EPSILON {
        return 0.0;
    }
    let dot: f32 = a
        .iter()
        .zip(b)
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .map(|(x, y)| x * y)
        .sum();
    dot / denom
}

impl InMemoryPassageIndex {
    pub fn new(chunks: Vec<ReferenceChunk>) -> Self {
        let norms = chunks.iter().map(|c| l2_norm(&c.embedding)).collect();
        Self { chunks, norms }
    }
}

impl PassageIndex for InMemoryPassageIndex {
    #[tracing::instrument(name = "Retrieving passages", level = "trace", skip(self, query))]
    fn nearest(&self, query: &[f32], k: usize) -> Vec<ScoredPassage<'_>> {
        let query_norm = l2_norm(query);
        let mut scored: Vec<ScoredPassage<'_>> = self
            .chunks
            .iter()
            .zip(&self.norms)
            .filter(|(chunk, _)| {
                let ok = chunk.embedding.len() == query.len();
                if !ok {
                    trace!(
                        "Chunk {} has dimension {}, query has {}",
                        chunk.id,
                        chunk.embedding.len(),
                        query.len()
                    );
                }
                ok
            })
            .map(|(chunk, norm)| ScoredPassage {
                chunk,
                score: cosine(query, query_norm, &chunk.embedding, *norm),
            })
            .collect();
        // Stable: equal scores keep corpus order.
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        scored.truncate(k);
        debug!("Retrieved {} of {} passages", scored.len(), self.chunks.len());
        scored
    }

    fn len(&self) -> usize {
        self.chunks.len()
    }
}

/// Top-`k` chunk texts for `query`, joined in ranked order.
pub fn grounding_context(index: &dyn PassageIndex, query: &[f32], k: usize) -> String {
    index
        .nearest(query, k)
        .iter()
        .map(|p| p.chunk.text.as_str())
        .collect::<Vec<_>>()
        .join(PASSAGE_SEPARATOR)
}
