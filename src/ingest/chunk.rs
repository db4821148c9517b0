use std::sync::LazyLock;

use regex::Regex;
use tracing::{trace, warn};

static WHITESPACE_RUN: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"\s+"));

pub const CHUNK_SIZE: usize = 1200;
pub const CHUNK_OVERLAP: usize = 150;
pub const SEPARATORS: [&str; 8] = ["\n\n", "\n", ".", "?", "!", ";", ":", " "];

/// A chunk must be longer than this many characters...
pub const MIN_CHUNK_CHARS: usize = 80;
/// ...and contain more than this many spaces.
pub const MIN_CHUNK_SPACES: usize = 25;

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Split `text` on `separator`, keeping each separator at the start of the piece that follows it.
/// Empty pieces are dropped.
fn split_keep_start<'t>(text: &'t str, separator: &str) -> Vec<&'t str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    for (idx, _) in text.match_indices(separator) {
        if idx > start {
            pieces.push(&text[start..idx]);
        }
        start = idx;
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

/// Recursive character splitter: split on the first separator present, merge small pieces up to
/// `chunk_size` with `chunk_overlap` carried between chunks, and recurse into oversized pieces
/// with the remaining separators. Lengths are counted in characters.
#[derive(Debug, Clone)]
pub struct RecursiveSplitter<'s> {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub separators: &'s [&'s str],
}

impl Default for RecursiveSplitter<'static> {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            chunk_overlap: CHUNK_OVERLAP,
            separators: &SEPARATORS,
        }
    }
}

impl RecursiveSplitter<'_> {
    pub fn split(&self, text: &str) -> Vec<String> {
        self.split_with(text, self.separators)
    }

    fn split_with(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let (separator, remaining) = separators
            .iter()
            .position(|sep| text.contains(sep))
            .map(|i| (separators[i], &separators[i + 1..]))
            .unwrap_or((separators.last().copied().unwrap_or(" "), &[]));

        let mut chunks = Vec::new();
        let mut small: Vec<&str> = Vec::new();
        for piece in split_keep_start(text, separator) {
            if char_len(piece) < self.chunk_size {
                small.push(piece);
                continue;
            }
            if !small.is_empty() {
                chunks.extend(self.merge(&small));
                small.clear();
            }
            if remaining.is_empty() {
                chunks.push(piece.to_string());
            } else {
                chunks.extend(self.split_with(piece, remaining));
            }
        }
        if !small.is_empty() {
            chunks.extend(self.merge(&small));
        }
        chunks
    }

    /// Pack pieces into chunks of at most `chunk_size`, keeping up to `chunk_overlap` characters
    /// of trailing pieces at the head of the next chunk.
    fn merge(&self, pieces: &[&str]) -> Vec<String> {
        let mut docs = Vec::new();
        let mut current: Vec<(&str, usize)> = Vec::new();
        let mut total = 0;
        for &piece in pieces {
            let len = char_len(piece);
            if total + len > self.chunk_size {
                if total > self.chunk_size {
                    warn!(
                        "Created a chunk of size {total}, which is longer than the specified {}",
                        self.chunk_size
                    );
                }
                if !current.is_empty() {
                    push_joined(&mut docs, &current);
                    while total > self.chunk_overlap
                        || (total + len > self.chunk_size && total > 0)
                    {
                        let (_, head_len) = current.remove(0);
                        total -= head_len;
                    }
                }
            }
            current.push((piece, len));
            total += len;
        }
        push_joined(&mut docs, &current);
        docs
    }
}

fn push_joined(docs: &mut Vec<String>, current: &[(&str, usize)]) {
    let joined: String = current.iter().map(|(p, _)| *p).collect();
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        docs.push(trimmed.to_string());
    }
}

/// Strip NUL characters and collapse every whitespace run to a single space.
pub fn normalize_text(text: &str) -> String {
    let text = text.replace('\0', "");
    match WHITESPACE_RUN.as_ref() {
        Ok(re) => re.replace_all(&text, " ").into_owned(),
        Err(_) => text.split_whitespace().collect::<Vec<_>>().join(" "),
    }
}

/// Whether a chunk carries enough prose to be worth embedding.
pub fn is_substantive(chunk: &str) -> bool {
    char_len(chunk.trim()) > MIN_CHUNK_CHARS && chunk.matches(' ').count() > MIN_CHUNK_SPACES
}

/// Normalize, split and filter extracted document text.
#[tracing::instrument(name = "Chunking document text", level = "debug", skip(text))]
pub fn chunk_text(text: &str) -> Vec<String> {
    let normalized = normalize_text(text);
    let chunks: Vec<String> = RecursiveSplitter::default()
        .split(&normalized)
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| is_substantive(c))
        .collect();
    trace!("Kept {} chunks", chunks.len());
    chunks
}
