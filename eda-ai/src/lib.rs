//! HTTP client for the Earth Defenders AI API.
//!
//! Pure HTTP: message handling, transcription, document upload and TTS.

mod client;
mod error;
mod types;

pub use client::{AiClient, DEFAULT_REQUEST_TIMEOUT};
pub use error::{AiError, Result};
pub use types::{
    DEFAULT_TTS_ENCODING, DocumentUpload, HandleResponse, ImageAttachment, MessageRequest,
    SessionMessageRequest, TranscriptionRequest, TtsRequest,
};
