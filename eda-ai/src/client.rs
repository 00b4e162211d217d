use crate::error::{AiError, Result};
use crate::types::{
    DocumentUpload, HandleResponse, MessagePayload, MessageRequest, SessionMessageRequest,
    TranscriptionRequest, TranscriptionResponse, TtsRequest,
};
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use std::future::Future;
use std::time::Duration;

const HANDLE_PATH: &str = "/api/message_handler/handle";
const TRANSCRIBE_PATH: &str = "/api/transcription/transcribe";
const DOCUMENT_UPLOAD_PATH: &str = "/api/documents/upload";
const TTS_PATH: &str = "/api/tts/generate-and-download";

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Client for the external AI API.
#[derive(Clone)]
pub struct AiClient {
    http: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl AiClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = normalize_base_url(base_url)?;
        let http = reqwest::Client::builder()
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Ok(Self {
            http,
            base_url,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Runs one whole request (send and body read) under the request timeout.
    async fn with_deadline<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(|_| AiError::Timeout(self.request_timeout))?
    }

    #[tracing::instrument(level = "info", skip_all, fields(user_platform_id = %req.user_platform_id, images = req.images.len()))]
    pub async fn handle_message(&self, req: &MessageRequest) -> Result<String> {
        if req.message.trim().is_empty() {
            return Err(AiError::InvalidInput("message is required".to_string()));
        }

        let builder = self.http.post(self.url(HANDLE_PATH));
        let builder = if req.images.is_empty() {
            builder.json(&MessagePayload {
                message: &req.message,
                user_platform_id: &req.user_platform_id,
                platform: &req.platform,
            })
        } else {
            let mut form = Form::new()
                .text("message", req.message.clone())
                .text("user_platform_id", req.user_platform_id.clone())
                .text("platform", req.platform.clone());
            for image in &req.images {
                let part = Part::bytes(image.bytes.to_vec())
                    .file_name(image.file_name.clone())
                    .mime_str(&image.mime_type)
                    .map_err(|e| AiError::InvalidInput(format!("image mime type: {e}")))?;
                form = form.part("images", part);
            }
            builder.multipart(form)
        };

        let response = self
            .with_deadline(async {
                let response = send_checked(builder).await?;
                Ok(response.json::<HandleResponse>().await?)
            })
            .await?;
        non_empty_result(response)
    }

    /// Gateway variant: carries a session id, prior history and optional audio.
    #[tracing::instrument(level = "info", skip_all, fields(session_id = %req.session_id))]
    pub async fn handle_session_message(&self, req: SessionMessageRequest) -> Result<HandleResponse> {
        let mut form = Form::new()
            .text("message", req.message)
            .text("session_id", req.session_id);
        if let Some(platform) = req.platform {
            form = form.text("platform", platform);
        }
        if let Some(history) = req.message_history {
            form = form.text("message_history", serde_json::to_string(&history)?);
        }
        if let Some(audio) = req.audio {
            let part = Part::bytes(audio.to_vec())
                .file_name("audio.ogg")
                .mime_str("audio/ogg")
                .map_err(|e| AiError::InvalidInput(e.to_string()))?;
            form = form.part("audio", part);
        }

        let builder = self
            .http
            .post(self.url(HANDLE_PATH))
            .header(reqwest::header::ACCEPT, "application/json")
            .multipart(form);
        let response = self
            .with_deadline(async {
                let response = send_checked(builder).await?;
                Ok(response.json::<HandleResponse>().await?)
            })
            .await?;
        if response.result.as_deref().is_none_or(|r| r.trim().is_empty()) {
            return Err(AiError::EmptyResult);
        }
        Ok(response)
    }

    #[tracing::instrument(level = "info", skip_all, fields(audio_bytes = req.audio.len(), language = %req.language))]
    pub async fn transcribe(&self, req: TranscriptionRequest) -> Result<String> {
        let part = Part::bytes(req.audio.to_vec())
            .file_name(req.file_name)
            .mime_str("audio/ogg")
            .map_err(|e| AiError::InvalidInput(e.to_string()))?;
        let form = Form::new().part("file", part).text("language", req.language);

        let builder = self.http.post(self.url(TRANSCRIBE_PATH)).multipart(form);
        let data = self
            .with_deadline(async {
                let response = send_checked(builder).await?;
                Ok(response.json::<TranscriptionResponse>().await?)
            })
            .await?;

        match data.transcription.filter(|t| !t.trim().is_empty()) {
            Some(transcription) if data.success => Ok(transcription),
            _ => Err(AiError::Transcription(
                data.error.unwrap_or_else(|| "desconhecido".to_string()),
            )),
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(file_name = %upload.file_name, mime_type = %upload.mime_type))]
    pub async fn upload_document(&self, upload: DocumentUpload) -> Result<serde_json::Value> {
        let part = Part::bytes(upload.bytes.to_vec())
            .file_name(upload.file_name)
            .mime_str(&upload.mime_type)
            .map_err(|e| AiError::InvalidInput(e.to_string()))?;
        let form = Form::new()
            .part("file", part)
            .text("ttl_days", upload.ttl_days.to_string())
            .text("user_platform_id", upload.user_platform_id);

        let builder = self.http.post(self.url(DOCUMENT_UPLOAD_PATH)).multipart(form);
        self.with_deadline(async {
            let response = send_checked(builder).await?;
            let body = response.text().await?;
            if body.trim().is_empty() {
                return Ok(serde_json::Value::Null);
            }
            Ok(serde_json::from_str(&body)?)
        })
        .await
    }

    #[tracing::instrument(level = "info", skip_all, fields(text_len = req.text.len()))]
    pub async fn generate_tts(&self, req: &TtsRequest) -> Result<Bytes> {
        let builder = self.http.post(self.url(TTS_PATH)).json(req);
        let audio = self
            .with_deadline(async {
                let response = send_checked(builder).await?;
                Ok(response.bytes().await?)
            })
            .await?;
        if audio.is_empty() {
            return Err(AiError::EmptyResult);
        }
        Ok(audio)
    }

    /// Reachability check: any HTTP response counts, only connection failures error.
    pub async fn probe(&self) -> Result<u16> {
        let builder = self.http.get(self.url("/"));
        self.with_deadline(async {
            let response = builder.send().await?;
            Ok(response.status().as_u16())
        })
        .await
    }
}

async fn send_checked(builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
    let response = builder.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AiError::Http {
        status: status.as_u16(),
        body,
    })
}

fn non_empty_result(response: HandleResponse) -> Result<String> {
    response
        .result
        .filter(|result| !result.trim().is_empty())
        .ok_or(AiError::EmptyResult)
}

fn normalize_base_url(raw: &str) -> Result<String> {
    let normalized = raw.trim().trim_end_matches('/').to_string();
    let parsed = reqwest::Url::parse(&normalized)
        .map_err(|e| AiError::InvalidInput(format!("invalid ai api base url {raw:?}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(normalized),
        other => Err(AiError::InvalidInput(format!(
            "invalid ai api base url scheme: {other} (expected http or https)"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ImageAttachment;
    use serde_json::json;
    use wiremock::matchers::{body_json, body_string_contains, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn message_request(images: Vec<ImageAttachment>) -> MessageRequest {
        MessageRequest {
            message: "qual o status do projeto?".to_string(),
            user_platform_id: "whatsapp_5511999999999".to_string(),
            platform: "whatsapp".to_string(),
            images,
        }
    }

    #[test]
    fn base_url_must_be_http() {
        assert!(AiClient::new("ftp://localhost").is_err());
        assert!(AiClient::new("not a url").is_err());
        let client = AiClient::new("http://localhost:8083/").expect("client");
        assert_eq!(client.base_url(), "http://localhost:8083");
    }

    #[tokio::test]
    async fn handle_message_sends_json_without_images() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(HANDLE_PATH))
            .and(body_json(json!({
                "message": "qual o status do projeto?",
                "user_platform_id": "whatsapp_5511999999999",
                "platform": "whatsapp"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "tudo certo"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = AiClient::new(&server.uri()).expect("client");
        let result = client
            .handle_message(&message_request(Vec::new()))
            .await
            .expect("handle succeeds");
        assert_eq!(result, "tudo certo");
    }

    #[tokio::test]
    async fn handle_message_uses_multipart_with_images() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(HANDLE_PATH))
            .and(header_exists("content-type"))
            .and(body_string_contains("name=\"images\""))
            .and(body_string_contains("whatsapp_5511999999999"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "vi a foto"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = AiClient::new(&server.uri()).expect("client");
        let image = ImageAttachment {
            bytes: Bytes::from_static(b"\xff\xd8\xff"),
            mime_type: "image/jpeg".to_string(),
            file_name: "image.jpeg".to_string(),
        };
        let result = client
            .handle_message(&message_request(vec![image]))
            .await
            .expect("handle succeeds");
        assert_eq!(result, "vi a foto");
    }

    #[tokio::test]
    async fn handle_message_maps_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(HANDLE_PATH))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;
        let client = AiClient::new(&server.uri()).expect("client");
        let err = client
            .handle_message(&message_request(Vec::new()))
            .await
            .expect_err("http failure");
        assert!(matches!(err, AiError::Http { status: 502, .. }), "got {err:?}");

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(HANDLE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": ""})))
            .mount(&server)
            .await;
        let client = AiClient::new(&server.uri()).expect("client");
        let err = client
            .handle_message(&message_request(Vec::new()))
            .await
            .expect_err("empty result");
        assert!(matches!(err, AiError::EmptyResult), "got {err:?}");
    }

    #[tokio::test]
    async fn handle_message_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(HANDLE_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"result": "tarde demais"}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let client = AiClient::new(&server.uri())
            .expect("client")
            .with_request_timeout(Duration::from_millis(50));
        let err = client
            .handle_message(&message_request(Vec::new()))
            .await
            .expect_err("times out");
        assert!(err.is_timeout(), "got {err:?}");
    }

    #[tokio::test]
    async fn transcribe_reads_transcription_or_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TRANSCRIBE_PATH))
            .and(body_string_contains("name=\"language\""))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"success": true, "transcription": "olá mundo"})),
            )
            .mount(&server)
            .await;
        let client = AiClient::new(&server.uri()).expect("client");
        let text = client
            .transcribe(TranscriptionRequest {
                audio: Bytes::from_static(b"OggS"),
                file_name: "audio.ogg".to_string(),
                language: "pt".to_string(),
            })
            .await
            .expect("transcribes");
        assert_eq!(text, "olá mundo");

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TRANSCRIBE_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"success": false, "error": "formato inválido"})),
            )
            .mount(&server)
            .await;
        let client = AiClient::new(&server.uri()).expect("client");
        let err = client
            .transcribe(TranscriptionRequest {
                audio: Bytes::from_static(b"OggS"),
                file_name: "audio.ogg".to_string(),
                language: "pt".to_string(),
            })
            .await
            .expect_err("transcription fails");
        assert!(
            matches!(&err, AiError::Transcription(msg) if msg == "formato inválido"),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn upload_document_sends_ttl_and_user() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(DOCUMENT_UPLOAD_PATH))
            .and(body_string_contains("name=\"ttl_days\""))
            .and(body_string_contains("whatsapp_5511999999999"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"document_id": "d1"})))
            .expect(1)
            .mount(&server)
            .await;
        let client = AiClient::new(&server.uri()).expect("client");
        let metadata = client
            .upload_document(DocumentUpload {
                bytes: Bytes::from_static(b"%PDF-1.4"),
                mime_type: "application/pdf".to_string(),
                file_name: "relatorio.pdf".to_string(),
                ttl_days: 30,
                user_platform_id: "whatsapp_5511999999999".to_string(),
            })
            .await
            .expect("upload succeeds");
        assert_eq!(metadata["document_id"], "d1");
    }

    #[tokio::test]
    async fn generate_tts_defaults_to_ogg_opus() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TTS_PATH))
            .and(body_json(json!({"text": "bom dia", "audio_encoding": "OGG_OPUS"})))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"OggS-audio".to_vec()))
            .mount(&server)
            .await;
        let client = AiClient::new(&server.uri()).expect("client");
        let audio = client
            .generate_tts(&TtsRequest::new("bom dia"))
            .await
            .expect("tts succeeds");
        assert_eq!(&audio[..], b"OggS-audio");
    }

    #[tokio::test]
    async fn session_message_is_multipart_with_history() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(HANDLE_PATH))
            .and(body_string_contains("name=\"session_id\""))
            .and(body_string_contains("name=\"message_history\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "ok"})))
            .expect(1)
            .mount(&server)
            .await;
        let client = AiClient::new(&server.uri()).expect("client");
        let response = client
            .handle_session_message(SessionMessageRequest {
                message: "oi".to_string(),
                session_id: "user-1".to_string(),
                platform: Some("simulator".to_string()),
                message_history: Some(json!([{"human": "a", "ai": "b"}])),
                audio: None,
            })
            .await
            .expect("session message succeeds");
        assert_eq!(response.result.as_deref(), Some("ok"));
    }
}
