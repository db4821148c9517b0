use async_openai::Client;
use async_openai::config::Config;
use async_openai::types::embeddings::CreateEmbeddingRequestArgs;
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::debug;

use crate::{AppError, AppResult};
use crate::model::Embedding;

/// Maps text to vectors in the space shared by responses and reference chunks.
pub trait Embedder: Send + Sync {
    /// One embedding per input, in input order.
    fn embed<'e>(&'e self, texts: &'e [String]) -> BoxFuture<'e, AppResult<Vec<Embedding>>>;
}

/// Embedding implementation that uses an OpenAI-compatible `/embeddings` endpoint.
pub struct OAIEmbedder {
    client: Client<Box<dyn Config>>,
    model: String,
}

impl OAIEmbedder {
    pub fn new(client: Client<Box<dyn Config>>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

impl Embedder for OAIEmbedder {
    fn embed<'e>(&'e self, texts: &'e [String]) -> BoxFuture<'e, AppResult<Vec<Embedding>>> {
        async move {
            if texts.is_empty() {
                return Ok(Vec::new());
            }
            let request = CreateEmbeddingRequestArgs::default()
                .model(&self.model)
                .input(texts.to_vec())
                .build()?;

            let response = self.client.embeddings().create(request).await?;
            let mut data = response.data;
            if data.len() != texts.len() {
                return Err(AppError::Contract(format!(
                    "asked for {} embeddings, got {}",
                    texts.len(),
                    data.len()
                )));
            }
            data.sort_by_key(|d| d.index);
            debug!("Embedded {} texts with {}", texts.len(), self.model);
            Ok(data.into_iter().map(|d| d.embedding).collect())
        }
        .boxed()
    }
}
