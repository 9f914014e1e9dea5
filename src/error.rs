use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error in {path}: {message}")]
    Config { path: PathBuf, message: String },

    #[error("connection closed before a complete frame arrived")]
    TruncatedFrame,

    #[error("frame exceeds {0} bytes")]
    OversizedFrame(usize),

    #[error("server replied with an error: {0}")]
    Server(String),

    #[error("redirect limit exhausted after {0} attempts")]
    TooManyRedirects(usize),

    #[error("no model with id {0}")]
    UnknownModel(Uuid),

    #[error("invalid training data: {0}")]
    Training(String),
}
