use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub const DEFAULT_TTS_ENCODING: &str = "OGG_OPUS";

#[derive(Debug, Clone)]
pub struct ImageAttachment {
    pub bytes: Bytes,
    pub mime_type: String,
    pub file_name: String,
}

/// A bot turn for `/api/message_handler/handle`. Sent as JSON, or multipart when
/// images are attached.
#[derive(Debug, Clone)]
pub struct MessageRequest {
    pub message: String,
    pub user_platform_id: String,
    pub platform: String,
    pub images: Vec<ImageAttachment>,
}

#[derive(Debug, Serialize)]
pub(crate) struct MessagePayload<'a> {
    pub message: &'a str,
    pub user_platform_id: &'a str,
    pub platform: &'a str,
}

/// A gateway turn. Always multipart.
#[derive(Debug, Clone, Default)]
pub struct SessionMessageRequest {
    pub message: String,
    pub session_id: String,
    pub platform: Option<String>,
    pub message_history: Option<serde_json::Value>,
    /// OGG audio bytes.
    pub audio: Option<Bytes>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandleResponse {
    #[serde(default)]
    pub result: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    pub audio: Bytes,
    pub file_name: String,
    pub language: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct TranscriptionResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub transcription: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DocumentUpload {
    pub bytes: Bytes,
    pub mime_type: String,
    pub file_name: String,
    pub ttl_days: u32,
    pub user_platform_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TtsRequest {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_name: Option<String>,
    pub audio_encoding: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pitch: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaking_rate: Option<f32>,
}

impl TtsRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            language_code: None,
            voice_name: None,
            audio_encoding: DEFAULT_TTS_ENCODING.to_string(),
            pitch: None,
            speaking_rate: None,
        }
    }

    pub fn with_voice(mut self, language_code: Option<String>, voice_name: Option<String>) -> Self {
        self.language_code = language_code;
        self.voice_name = voice_name;
        self
    }
}
