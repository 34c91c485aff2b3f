use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Thread error: {0}")]
    Thread(String),

    #[error("Reporter is shut down: {0}")]
    Shutdown(String),
}

pub type Result<T> = std::result::Result<T, Error>;
