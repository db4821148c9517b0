use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::Url;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use tracing::{debug, info};

use crate::{AppError, AppResult};

/// Where uploaded source documents are kept.
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` at `path`, replacing whatever is there.
    fn upload<'a>(
        &'a self,
        path: &'a str,
        bytes: &'a [u8],
        content_type: &'a str,
    ) -> BoxFuture<'a, AppResult<()>>;
}

/// Supabase Storage over its REST API.
#[derive(Debug, Clone)]
pub struct SupabaseStorage {
    http: reqwest::Client,
    base_url: String,
    service_key: String,
    bucket: String,
}

impl SupabaseStorage {
    pub fn new(
        base_url: impl Into<String>,
        service_key: impl Into<String>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            service_key: service_key.into(),
            bucket: bucket.into(),
        }
    }

    /// `<base>/storage/v1/object/<bucket>/<path>`, with every segment percent-encoded.
    pub fn object_url(&self, path: &str) -> AppResult<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| AppError::Storage(format!("invalid storage url {}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| AppError::Storage(format!("{} cannot be a base url", self.base_url)))?
            .pop_if_empty()
            .extend(["storage", "v1", "object", self.bucket.as_str()])
            .extend(path.split('/').filter(|s| !s.is_empty()));
        Ok(url)
    }
}

impl ObjectStore for SupabaseStorage {
    fn upload<'a>(
        &'a self,
        path: &'a str,
        bytes: &'a [u8],
        content_type: &'a str,
    ) -> BoxFuture<'a, AppResult<()>> {
        async move {
            let url = self.object_url(path)?;
            debug!("Uploading {} bytes to {url}", bytes.len());
            let response = self
                .http
                .post(url)
                .header(AUTHORIZATION, format!("Bearer {}", self.service_key))
                .header("apikey", &self.service_key)
                .header("x-upsert", "true")
                .header(CONTENT_TYPE, content_type)
                .body(bytes.to_vec())
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(AppError::Storage(format!("{status}: {body}")));
            }
            info!("Uploaded {path} to bucket {}", self.bucket);
            Ok(())
        }
        .boxed()
    }
}
