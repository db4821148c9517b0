use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::debug;

use crate::{AppError, AppResult};

/// Pulls plain text out of a document, one string per page.
pub trait TextExtractor: Send + Sync {
    fn extract_pages<'a>(&'a self, bytes: &'a [u8]) -> BoxFuture<'a, AppResult<Vec<String>>>;
}

/// `pdf-extract` on the blocking pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfTextExtractor;

impl TextExtractor for PdfTextExtractor {
    fn extract_pages<'a>(&'a self, bytes: &'a [u8]) -> BoxFuture<'a, AppResult<Vec<String>>> {
        let owned = bytes.to_vec();
        async move {
            let pages = tokio::task::spawn_blocking(move || {
                pdf_extract::extract_text_from_mem_by_pages(&owned)
            })
            .await?
            .map_err(|e| AppError::Extraction(e.to_string()))?;
            debug!("Extracted {} pages", pages.len());
            Ok(pages)
        }
        .boxed()
    }
}

/// Concatenate pages, each followed by a newline.
pub fn join_pages(pages: &[String]) -> String {
    let mut text = String::with_capacity(pages.iter().map(|p| p.len() + 1).sum());
    for page in pages {
        text.push_str(page);
        text.push('\n');
    }
    text
}
