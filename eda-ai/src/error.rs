use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AiError>;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("http error: status={status} body={body}")]
    Http { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),

    #[error("no result from api")]
    EmptyResult,

    #[error("transcription failed: {0}")]
    Transcription(String),
}

impl AiError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<reqwest::Error> for AiError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => Self::Http {
                status: status.as_u16(),
                body: e.to_string(),
            },
            None => Self::Transport(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for AiError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}
