use thiserror::Error;

/// Unified application error type to simplify bubbling errors through async flows.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Errored while handling a file. {0}")]
    Io(#[from] std::io::Error),
    #[error("Error from the Postgres driver. {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Error applying database migrations. {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("Error serializing json. {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("Error communicating with the AI. {0}")]
    AIClient(#[from] async_openai::error::OpenAIError),
    #[error("Error accessing the object store. {0}")]
    Http(#[from] reqwest::Error),
    #[error("Runtime error. {0}")]
    TokioJoin(#[from] tokio::task::JoinError),
    #[error("Error parsing the duration string. {0}")]
    DurationParse(#[from] humantime::DurationError),
    #[error("Model response broke the expected contract. {0}")]
    Contract(String),
    #[error("Invalid payload. {0}")]
    Validation(String),
    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    Dimension { expected: usize, actual: usize },
    #[error("Object store rejected the upload. {0}")]
    Storage(String),
    #[error("Unable to extract text from the document. {0}")]
    Extraction(String),
    #[error("{0}")]
    Other(String),
}

/// Convenience alias for results that bubble `AppError`.
pub type AppResult<T> = Result<T, AppError>;
