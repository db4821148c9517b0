pub mod embed;
pub mod prompt;
pub mod query;
pub mod synthesis;

use async_openai::Client;
use async_openai::config::{Config, OpenAIConfig};
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, trace};

pub use self::embed::{Embedder, OAIEmbedder};
pub use self::query::SchemaInfo;
use crate::{AppError, AppResult};
use crate::config::Sampling;

/// Build an async-openai client for any OpenAI-compatible server.
#[tracing::instrument(name = "Configuring AI client", level = "debug", skip(api_key))]
pub fn get_client(base_url: &str, api_key: Option<&str>) -> Client<Box<dyn Config>> {
    let mut config = OpenAIConfig::default().with_api_base(base_url);
    if let Some(key) = api_key {
        config = config.with_api_key(key);
    }
    Client::with_config(Box::new(config) as Box<dyn Config>)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
}

/// One role-tagged message sent to the generative service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

impl TryFrom<&ChatMessage> for ChatCompletionRequestMessage {
    type Error = AppError;

    fn try_from(message: &ChatMessage) -> AppResult<Self> {
        let content = message.content.as_str();
        Ok(match message.role {
            ChatRole::System => ChatCompletionRequestSystemMessageArgs::default()
                .content(content)
                .build()?
                .into(),
            ChatRole::User => ChatCompletionRequestUserMessageArgs::default()
                .content(content)
                .build()?
                .into(),
        })
    }
}

/// A free-text generative service. Output is untrusted: callers validate it.
pub trait TextGenerator: Send + Sync {
    fn generate<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        sampling: Sampling,
    ) -> BoxFuture<'a, AppResult<String>>;
}

/// Chat completions against an OpenAI-compatible endpoint (Groq by default).
pub struct OpenAiGenerator {
    client: Client<Box<dyn Config>>,
    model: String,
}

impl OpenAiGenerator {
    pub fn new(client: Client<Box<dyn Config>>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

impl TextGenerator for OpenAiGenerator {
    fn generate<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        sampling: Sampling,
    ) -> BoxFuture<'a, AppResult<String>> {
        async move {
            let messages = messages
                .iter()
                .map(ChatCompletionRequestMessage::try_from)
                .collect::<AppResult<Vec<_>>>()?;
            let request = CreateChatCompletionRequestArgs::default()
                .model(&self.model)
                .messages(messages)
                .temperature(sampling.temperature)
                .max_completion_tokens(sampling.max_tokens)
                .build()?;

            let response = self.client.chat().create(request).await?;
            debug!("AI usage: {:?}", response.usage);
            let content = response
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.message.content)
                .ok_or_else(|| AppError::Contract("completion has no content".to_string()))?;
            trace!("AI response: {content}");
            Ok(content.trim().to_string())
        }
        .boxed()
    }
}
