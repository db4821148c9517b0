//! In-memory stand-ins for the external collaborators.

use std::collections::{HashMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Mutex;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::{AppError, AppResult};
use crate::ai::{ChatMessage, Embedder, TextGenerator};
use crate::config::Sampling;
use crate::ingest::{ObjectStore, TextExtractor};
use crate::model::{
    ClusterRecord, Embedding, NewChunk, QuestionCategories, ReferenceChunk, ResponseAnswers,
    ResponseId, ResponseVector,
};
use crate::store::FeedbackStore;
use crate::submit::Submission;

#[derive(Default)]
struct StoreState {
    questions: Vec<(String, String)>,
    vectors: Vec<ResponseVector>,
    answers: HashMap<ResponseId, ResponseAnswers>,
    chunks: Vec<ReferenceChunk>,
    new_chunks: Vec<NewChunk>,
    clusters: Vec<ClusterRecord>,
    submissions: Vec<Submission>,
    clear_count: usize,
    insert_batches: usize,
}

/// `FeedbackStore` over plain vectors.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    fail_inserts: bool,
}

impl MemoryStore {
    /// Every insert fails from now on.
    pub fn fail_inserts(mut self) -> Self {
        self.fail_inserts = true;
        self
    }

    pub fn add_question(&self, question_id: &str, category: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .questions
            .push((question_id.to_string(), category.to_string()));
    }

    pub fn add_response(&self, vector: ResponseVector, answers: ResponseAnswers) {
        let mut state = self.state.lock().unwrap();
        state.answers.insert(vector.id, answers);
        state.vectors.push(vector);
    }

    pub fn add_chunk(&self, chunk: ReferenceChunk) {
        self.state.lock().unwrap().chunks.push(chunk);
    }

    pub fn clear_answers(&self) {
        self.state.lock().unwrap().answers.clear();
    }

    pub fn clusters(&self) -> Vec<ClusterRecord> {
        self.state.lock().unwrap().clusters.clone()
    }

    pub fn chunks(&self) -> Vec<NewChunk> {
        self.state.lock().unwrap().new_chunks.clone()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn clear_count(&self) -> usize {
        self.state.lock().unwrap().clear_count
    }

    pub fn insert_batches(&self) -> usize {
        self.state.lock().unwrap().insert_batches
    }

    fn check_insert(&self) -> AppResult<()> {
        if self.fail_inserts {
            Err(AppError::Other("insert rejected".to_string()))
        } else {
            Ok(())
        }
    }
}

impl FeedbackStore for MemoryStore {
    fn clear_clusters(&self) -> BoxFuture<'_, AppResult<()>> {
        async move {
            let mut state = self.state.lock().unwrap();
            state.clusters.clear();
            state.clear_count += 1;
            Ok(())
        }
        .boxed()
    }

    fn question_categories(&self) -> BoxFuture<'_, AppResult<QuestionCategories>> {
        async move { Ok(self.state.lock().unwrap().questions.iter().cloned().collect()) }.boxed()
    }

    fn response_vectors(&self) -> BoxFuture<'_, AppResult<Vec<ResponseVector>>> {
        async move { Ok(self.state.lock().unwrap().vectors.clone()) }.boxed()
    }

    fn response_answers<'a>(
        &'a self,
        ids: &'a [ResponseId],
    ) -> BoxFuture<'a, AppResult<Vec<ResponseAnswers>>> {
        async move {
            let state = self.state.lock().unwrap();
            Ok(ids
                .iter()
                .filter_map(|id| state.answers.get(id).cloned())
                .collect())
        }
        .boxed()
    }

    fn reference_chunks(&self) -> BoxFuture<'_, AppResult<Vec<ReferenceChunk>>> {
        async move { Ok(self.state.lock().unwrap().chunks.clone()) }.boxed()
    }

    fn insert_clusters<'a>(
        &'a self,
        records: &'a [ClusterRecord],
    ) -> BoxFuture<'a, AppResult<u64>> {
        async move {
            self.check_insert()?;
            let mut state = self.state.lock().unwrap();
            state.clusters.extend_from_slice(records);
            state.insert_batches += 1;
            Ok(records.len() as u64)
        }
        .boxed()
    }

    fn insert_chunks<'a>(&'a self, chunks: &'a [NewChunk]) -> BoxFuture<'a, AppResult<u64>> {
        async move {
            self.check_insert()?;
            self.state
                .lock()
                .unwrap()
                .new_chunks
                .extend_from_slice(chunks);
            Ok(chunks.len() as u64)
        }
        .boxed()
    }

    fn insert_response<'a>(&'a self, submission: &'a Submission) -> BoxFuture<'a, AppResult<()>> {
        async move {
            self.check_insert()?;
            self.state
                .lock()
                .unwrap()
                .submissions
                .push(submission.clone());
            Ok(())
        }
        .boxed()
    }
}

type Responder = Box<dyn Fn(&[ChatMessage]) -> AppResult<String> + Send + Sync>;

enum Script {
    Queue(Mutex<VecDeque<AppResult<String>>>),
    Fn(Responder),
}

/// A `TextGenerator` that replays canned replies and records what it was sent.
pub struct FakeGenerator {
    script: Script,
    calls: Mutex<Vec<(Vec<ChatMessage>, Sampling)>>,
}

impl FakeGenerator {
    /// Replies in order; once they run out every call fails.
    pub fn new(replies: impl IntoIterator<Item = AppResult<String>>) -> Self {
        Self {
            script: Script::Queue(Mutex::new(replies.into_iter().collect())),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Replies computed from the messages.
    pub fn responding(
        responder: impl Fn(&[ChatMessage]) -> AppResult<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Script::Fn(Box::new(responder)),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(Vec<ChatMessage>, Sampling)> {
        self.calls.lock().unwrap().clone()
    }
}

impl TextGenerator for FakeGenerator {
    fn generate<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        sampling: Sampling,
    ) -> BoxFuture<'a, AppResult<String>> {
        async move {
            self.calls
                .lock()
                .unwrap()
                .push((messages.to_vec(), sampling));
            match &self.script {
                Script::Queue(queue) => queue
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| Err(AppError::Other("no scripted reply left".into()))),
                Script::Fn(responder) => responder(messages),
            }
        }
        .boxed()
    }
}

/// Deterministic bag-of-words embedder: every word is hashed into one of `dim` buckets.
pub struct HashEmbedder {
    dim: usize,
    fail: bool,
    calls: Mutex<Vec<Vec<String>>>,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            fail: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(1)
        }
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn vector(&self, text: &str) -> Embedding {
        let mut v = vec![0.0; self.dim];
        for word in text.split_whitespace() {
            let mut hasher = DefaultHasher::new();
            word.to_lowercase().hash(&mut hasher);
            v[(hasher.finish() % self.dim as u64) as usize] += 1.0;
        }
        v
    }
}

impl Embedder for HashEmbedder {
    fn embed<'e>(&'e self, texts: &'e [String]) -> BoxFuture<'e, AppResult<Vec<Embedding>>> {
        async move {
            self.calls.lock().unwrap().push(texts.to_vec());
            if self.fail {
                return Err(AppError::Other("embedding service down".into()));
            }
            Ok(texts.iter().map(|t| self.vector(t)).collect())
        }
        .boxed()
    }
}

/// Hands back fixed pages whatever the bytes.
pub struct FakeExtractor {
    pages: Vec<String>,
}

impl FakeExtractor {
    pub fn new(pages: Vec<String>) -> Self {
        Self { pages }
    }
}

impl TextExtractor for FakeExtractor {
    fn extract_pages<'a>(&'a self, _bytes: &'a [u8]) -> BoxFuture<'a, AppResult<Vec<String>>> {
        async move { Ok(self.pages.clone()) }.boxed()
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    uploaded: Mutex<Vec<String>>,
    failure: Option<String>,
}

impl MemoryObjectStore {
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn uploaded(&self) -> Vec<String> {
        self.uploaded.lock().unwrap().clone()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn upload<'a>(
        &'a self,
        path: &'a str,
        _bytes: &'a [u8],
        _content_type: &'a str,
    ) -> BoxFuture<'a, AppResult<()>> {
        async move {
            if let Some(message) = &self.failure {
                return Err(AppError::Storage(message.clone()));
            }
            self.uploaded.lock().unwrap().push(path.to_string());
            Ok(())
        }
        .boxed()
    }
}
