//! Generic (non-command) message handling: placeholder, attachment paths,
//! one AI call, edit-in-place, closing reaction.

use crate::config::MessagesConfig;
use crate::dispatcher::BotContext;
use crate::reactions::ReactionState;
use eda_ai::{AiError, DocumentUpload, ImageAttachment, MessageRequest, TranscriptionRequest, TtsRequest};
use eda_channels::{DocumentRef, InboundEvent, MessageContent, MessageKey, OutboundContent};
use thiserror::Error;

const SUPPORTED_DOCUMENT_TYPES: &[&str] = &["application/pdf", "text/csv", "application/csv"];
const VOICE_NOTE_MIME: &str = "audio/ogg; codecs=opus";

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("no valid input provided")]
    NoInput,

    #[error("audio download failed: {0}")]
    AudioDownload(String),

    #[error("audio transcription failed: {0}")]
    AudioTranscription(AiError),

    #[error("image download failed: {0}")]
    ImageDownload(String),

    #[error(transparent)]
    Ai(#[from] AiError),
}

impl HandlerError {
    /// The text the placeholder is edited to.
    pub fn template(&self, messages: &MessagesConfig) -> String {
        match self {
            Self::NoInput => messages.no_input.clone(),
            Self::AudioDownload(_) => messages.audio_download_failed.clone(),
            Self::AudioTranscription(AiError::Transcription(reason)) => messages
                .audio_transcription_error
                .replace("{error}", reason),
            Self::AudioTranscription(_) => messages.audio_transcription_failed.clone(),
            Self::ImageDownload(_) => messages.unknown.clone(),
            Self::Ai(AiError::Timeout(_)) => messages.timeout.clone(),
            Self::Ai(AiError::Http { .. }) => messages.http_error.clone(),
            Self::Ai(AiError::EmptyResult) => messages.no_response.clone(),
            Self::Ai(_) => messages.unknown.clone(),
        }
    }
}

#[tracing::instrument(level = "info", skip_all, fields(user_platform_id = tracing::field::Empty))]
pub async fn handle_message(ctx: &BotContext, event: &InboundEvent) {
    let user_platform_id = event.user_platform_id(&ctx.cfg.ai_api.platform);
    tracing::Span::current().record("user_platform_id", user_platform_id.as_str());

    ctx.react(&event.key, ReactionState::Working).await;

    let placeholder = match ctx
        .send(
            event.chat_id(),
            OutboundContent::Text(ctx.cfg.messages.waiting.clone()),
            Some(&event.key),
        )
        .await
    {
        Ok(Some(key)) => key,
        Ok(None) => {
            tracing::error!("transport returned no key for the placeholder");
            ctx.react(&event.key, ReactionState::Error).await;
            return;
        }
        Err(e) => {
            tracing::error!(%e, "failed to send placeholder");
            ctx.react(&event.key, ReactionState::Error).await;
            return;
        }
    };

    if let MessageContent::Document(document) = &event.content {
        if is_supported_document(document) {
            handle_document(ctx, event, document, &placeholder, user_platform_id).await;
            return;
        }
    }

    let result = match build_request(ctx, event, user_platform_id).await {
        Ok(request) => ctx.ai.handle_message(&request).await.map_err(HandlerError::from),
        Err(e) => Err(e),
    };

    match result {
        Ok(answer) => {
            let edited = edit(ctx, event, &placeholder, answer.clone()).await;
            if ctx.cfg.tts.should_speak(&answer) {
                send_voice_note(ctx, event, &answer).await;
            }
            let state = if edited {
                ReactionState::Done
            } else {
                ReactionState::Error
            };
            ctx.react(&event.key, state).await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "message handling failed");
            edit(ctx, event, &placeholder, e.template(&ctx.cfg.messages)).await;
            ctx.react(&event.key, ReactionState::Error).await;
        }
    }
}

async fn build_request(
    ctx: &BotContext,
    event: &InboundEvent,
    user_platform_id: String,
) -> Result<MessageRequest, HandlerError> {
    let mut text = event.body().to_string();
    let mut images = Vec::new();

    match &event.content {
        MessageContent::Audio(audio) => {
            let transport = ctx
                .session
                .require()
                .map_err(|e| HandlerError::AudioDownload(e.to_string()))?;
            let bytes = transport
                .download_media(event)
                .await
                .map_err(|e| HandlerError::AudioDownload(e.to_string()))?;
            tracing::info!(
                audio_bytes = bytes.len(),
                mime_type = audio.mime_type.as_deref().unwrap_or("unknown"),
                quoted = audio.quoted,
                "transcribing audio"
            );
            text = ctx
                .ai
                .transcribe(TranscriptionRequest {
                    audio: bytes,
                    file_name: ctx.cfg.ai_api.audio_filename.clone(),
                    language: ctx.cfg.ai_api.transcription_language.clone(),
                })
                .await
                .map_err(HandlerError::AudioTranscription)?;
        }
        MessageContent::Image(media) => {
            let transport = ctx
                .session
                .require()
                .map_err(|e| HandlerError::ImageDownload(e.to_string()))?;
            let bytes = transport
                .download_media(event)
                .await
                .map_err(|e| HandlerError::ImageDownload(e.to_string()))?;
            let mime_type = media
                .mime_type
                .clone()
                .unwrap_or_else(|| "image/jpeg".to_string());
            images.push(ImageAttachment {
                file_name: format!("image.{}", mime_extension(&mime_type)),
                bytes,
                mime_type,
            });
            text = event
                .caption()
                .map(ToOwned::to_owned)
                .unwrap_or_else(|| ctx.cfg.messages.image_received.clone());
        }
        _ => {
            if text.is_empty() {
                text = event.caption().unwrap_or_default().to_string();
            }
        }
    }

    if text.trim().is_empty() {
        return Err(HandlerError::NoInput);
    }
    Ok(MessageRequest {
        message: text,
        user_platform_id,
        platform: ctx.cfg.ai_api.platform.clone(),
        images,
    })
}

async fn handle_document(
    ctx: &BotContext,
    event: &InboundEvent,
    document: &DocumentRef,
    placeholder: &MessageKey,
    user_platform_id: String,
) {
    let messages = &ctx.cfg.messages;
    let mime_type = document.mime_type.clone().unwrap_or_default();
    let file_type = if mime_type.contains("csv") { "CSV" } else { "PDF" };

    let downloaded = match ctx.session.require() {
        Ok(transport) => transport.download_media(event).await,
        Err(e) => Err(e),
    };
    let bytes = match downloaded {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(%e, "document download failed");
            edit(ctx, event, placeholder, messages.document_download_failed.clone()).await;
            ctx.react(&event.key, ReactionState::Error).await;
            return;
        }
    };

    let file_name = document.file_name.clone().unwrap_or_else(|| {
        if file_type == "CSV" {
            "document.csv".to_string()
        } else {
            "document.pdf".to_string()
        }
    });
    let upload = DocumentUpload {
        bytes,
        mime_type,
        file_name,
        ttl_days: ctx.cfg.ai_api.document_ttl_days,
        user_platform_id,
    };
    match ctx.ai.upload_document(upload).await {
        Ok(_) => {
            let text = messages.document_processed.replace("{file_type}", file_type);
            let state = if edit(ctx, event, placeholder, text).await {
                ReactionState::Done
            } else {
                ReactionState::Error
            };
            ctx.react(&event.key, state).await;
        }
        Err(e) => {
            tracing::warn!(%e, "document upload failed");
            edit(ctx, event, placeholder, messages.document_upload_failed.clone()).await;
            ctx.react(&event.key, ReactionState::Error).await;
        }
    }
}

async fn send_voice_note(ctx: &BotContext, event: &InboundEvent, text: &str) {
    let request = TtsRequest::new(text)
        .with_voice(ctx.cfg.tts.language_code.clone(), ctx.cfg.tts.voice_name.clone());
    let audio = match ctx.ai.generate_tts(&request).await {
        Ok(audio) => audio,
        Err(e) => {
            tracing::warn!(%e, "tts generation failed; text reply only");
            return;
        }
    };
    let content = OutboundContent::Audio {
        bytes: audio,
        mime_type: VOICE_NOTE_MIME.to_string(),
        voice_note: true,
    };
    if let Err(e) = ctx.send(event.chat_id(), content, Some(&event.key)).await {
        tracing::warn!(%e, "failed to send voice note");
    }
}

async fn edit(ctx: &BotContext, event: &InboundEvent, placeholder: &MessageKey, text: String) -> bool {
    let content = OutboundContent::Edit {
        key: placeholder.clone(),
        text,
    };
    match ctx.send(event.chat_id(), content, Some(&event.key)).await {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(%e, "failed to edit placeholder");
            false
        }
    }
}

fn is_supported_document(document: &DocumentRef) -> bool {
    document
        .mime_type
        .as_deref()
        .is_some_and(|mime| SUPPORTED_DOCUMENT_TYPES.contains(&mime))
}

fn mime_extension(mime_type: &str) -> &str {
    mime_type
        .split('/')
        .nth(1)
        .and_then(|sub| sub.split(';').next())
        .map(str::trim)
        .filter(|ext| !ext.is_empty())
        .unwrap_or("jpeg")
}
