//! Training-material ingestion: upload, extract, chunk, embed, store.

pub mod chunk;
pub mod pdf;
pub mod storage;

use serde::Serialize;
use tracing::{info, warn};

use crate::AppResult;
use crate::ai::Embedder;
use crate::model::NewChunk;
use crate::store::FeedbackStore;

pub use self::chunk::chunk_text;
pub use self::pdf::{PdfTextExtractor, TextExtractor, join_pages};
pub use self::storage::{ObjectStore, SupabaseStorage};

/// Texts per embedding request.
const EMBED_BATCH: usize = 64;

pub const PDF_ONLY_MESSAGE: &str = "Only PDF files are allowed.";

/// What an ingestion reports back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum IngestReport {
    Success {
        file_name: String,
        num_chunks: usize,
        inserted_chunks: u64,
    },
    Error {
        message: String,
    },
}

/// The collaborators an ingestion needs.
pub struct IngestServices<'s> {
    pub objects: &'s dyn ObjectStore,
    pub extractor: &'s dyn TextExtractor,
    pub embedder: &'s dyn Embedder,
    pub store: &'s dyn FeedbackStore,
}

/// Ingest one PDF.
///
/// A non-PDF name or a failed upload is reported in the returned [`IngestReport`]; extraction,
/// embedding and database failures propagate.
#[tracing::instrument(name = "Ingesting document", level = "info", skip(services, bytes))]
pub async fn ingest_pdf(
    services: &IngestServices<'_>,
    file_name: &str,
    bytes: &[u8],
) -> AppResult<IngestReport> {
    if !file_name.ends_with(".pdf") {
        return Ok(IngestReport::Error {
            message: PDF_ONLY_MESSAGE.to_string(),
        });
    }

    if let Err(e) = services
        .objects
        .upload(file_name, bytes, "application/pdf")
        .await
    {
        warn!("Upload of {file_name} failed: {e}");
        return Ok(IngestReport::Error {
            message: e.to_string(),
        });
    }

    let pages = services.extractor.extract_pages(bytes).await?;
    let chunks = chunk_text(&join_pages(&pages));
    info!("{file_name}: {} pages, {} chunks", pages.len(), chunks.len());

    let mut rows = Vec::with_capacity(chunks.len());
    for batch in chunks.chunks(EMBED_BATCH) {
        let embeddings = services.embedder.embed(batch).await?;
        rows.extend(
            batch
                .iter()
                .zip(embeddings)
                .map(|(text, embedding)| NewChunk {
                    source_file: file_name.to_string(),
                    text: text.clone(),
                    embedding,
                }),
        );
    }

    let inserted_chunks = if rows.is_empty() {
        0
    } else {
        services.store.insert_chunks(&rows).await?
    };

    Ok(IngestReport::Success {
        file_name: file_name.to_string(),
        num_chunks: chunks.len(),
        inserted_chunks,
    })
}
