use crate::traits::{Transport, TransportConnector};
use crate::types::{
    AudioRef, ChatId, ChatUpdate, ConnectionState, ConnectionUpdate, ContextInfo,
    DisconnectReason, DocumentRef, GroupMetadata, InboundEvent, MediaRef, MessageContent,
    MessageId, MessageKey, OutboundContent, SenderId, TransportEvent, UpsertKind,
};
use anyhow::{Result, anyhow};
use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use futures_util::{SinkExt, Stream, StreamExt};
use reqwest::Url;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

/// Close codes at or above this value carry a WhatsApp disconnect status (`4000 + status`).
const STATUS_CLOSE_CODE_BASE: u16 = 4000;

/// Connects to a WhatsApp Web bridge sidecar: REST for commands, a WebSocket for events.
#[derive(Clone)]
pub struct WhatsAppBridgeConnector {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    sequence: Arc<AtomicU64>,
}

impl WhatsAppBridgeConnector {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = normalize_bridge_url(base_url)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            base_url,
            auth_token: None,
            sequence: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn with_auth_token(mut self, auth_token: Option<String>) -> Self {
        self.auth_token = auth_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(ToOwned::to_owned);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn events_url(&self) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{ws_base}/events")
    }

    fn transport(&self, own_id: Option<String>) -> WhatsAppBridgeTransport {
        WhatsAppBridgeTransport {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            auth_token: self.auth_token.clone(),
            own_id,
            closed: CancellationToken::new(),
        }
    }

    /// Opens a REST-only session, without subscribing to events.
    pub async fn connect_rest_only(&self) -> Result<Arc<dyn Transport>> {
        let transport = self.transport(None);
        let session = transport.fetch_session().await?;
        Ok(Arc::new(self.transport(session.id)))
    }
}

#[async_trait::async_trait]
impl TransportConnector for WhatsAppBridgeConnector {
    #[tracing::instrument(level = "info", skip_all, fields(base_url = %self.base_url))]
    async fn connect(&self, events: mpsc::Sender<TransportEvent>) -> Result<Arc<dyn Transport>> {
        let session = self.transport(None).fetch_session().await?;

        let mut request = self.events_url().into_client_request()?;
        if let Some(token) = self.auth_token.as_deref() {
            request
                .headers_mut()
                .insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}"))?);
        }
        let (ws, _) = tokio_tungstenite::connect_async(request).await?;
        let (mut write, read) = ws.split();

        let transport = self.transport(session.id);
        let closed = transport.closed.clone();
        let sequence = self.sequence.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = closed.cancelled() => {
                    tracing::info!("whatsapp bridge session closed; dropping its event stream");
                }
                _ = run_event_stream(read, events, sequence) => {}
            }
            if let Err(error) = write.close().await {
                tracing::debug!(%error, "whatsapp bridge socket already closed");
            }
        });

        tracing::info!(own_id = ?transport.own_id, "whatsapp bridge session connected");
        Ok(Arc::new(transport))
    }
}

#[derive(Clone)]
pub struct WhatsAppBridgeTransport {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    own_id: Option<String>,
    /// Stops the event reader spawned for this session.
    closed: CancellationToken,
}

impl WhatsAppBridgeTransport {
    fn api_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| anyhow!("invalid whatsapp bridge url {}: {e}", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("whatsapp bridge url cannot be a base: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth_token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn fetch_session(&self) -> Result<BridgeSession> {
        let url = self.api_url(&["session"])?;
        let response = self.authorized_request(self.http.get(url)).send().await?;
        let response = ensure_success(response, "session").await?;
        Ok(response.json().await?)
    }
}

#[async_trait::async_trait]
impl Transport for WhatsAppBridgeTransport {
    fn own_id(&self) -> Option<String> {
        self.own_id.clone()
    }

    async fn send_message(
        &self,
        chat_id: &ChatId,
        content: OutboundContent,
        quoted: Option<&MessageKey>,
    ) -> Result<Option<MessageKey>> {
        if chat_id.trim().is_empty() {
            return Err(anyhow!("chat id is required"));
        }
        let url = self.api_url(&["messages", "send"])?;
        let payload = serde_json::json!({
            "chatId": chat_id,
            "content": outbound_content_json(&content),
            "quoted": quoted,
        });
        let response = self
            .authorized_request(self.http.post(url))
            .json(&payload)
            .send()
            .await?;
        let response = ensure_success(response, "send").await?;
        let body: SendResponse = response.json().await.unwrap_or_default();
        Ok(body.key)
    }

    async fn group_metadata(&self, chat_id: &ChatId) -> Result<GroupMetadata> {
        let url = self.api_url(&["groups", chat_id.as_str()])?;
        let response = self.authorized_request(self.http.get(url)).send().await?;
        let response = ensure_success(response, "group metadata").await?;
        Ok(response.json().await?)
    }

    async fn read_messages(&self, keys: &[MessageKey]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let url = self.api_url(&["messages", "read"])?;
        let response = self
            .authorized_request(self.http.post(url))
            .json(&serde_json::json!({ "keys": keys }))
            .send()
            .await?;
        ensure_success(response, "read").await?;
        Ok(())
    }

    async fn download_media(&self, event: &InboundEvent) -> Result<Bytes> {
        let url = self.api_url(&["media", "download"])?;
        let response = self
            .authorized_request(self.http.post(url))
            .json(&serde_json::json!({ "message": event.raw }))
            .send()
            .await?;
        let response = ensure_success(response, "media download").await?;
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(anyhow!("whatsapp bridge returned empty media"));
        }
        Ok(bytes)
    }

    fn close(&self) {
        self.closed.cancel();
    }

    async fn save_credentials(&self) -> Result<()> {
        let url = self.api_url(&["session", "creds"])?;
        let response = self.authorized_request(self.http.post(url)).send().await?;
        ensure_success(response, "save credentials").await?;
        Ok(())
    }
}

async fn ensure_success(response: reqwest::Response, action: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(anyhow!(
        "whatsapp bridge {action} failed: status={status} body={body}"
    ))
}

fn outbound_content_json(content: &OutboundContent) -> serde_json::Value {
    match content {
        OutboundContent::Text(text) => serde_json::json!({ "text": text }),
        OutboundContent::Edit { key, text } => serde_json::json!({ "text": text, "edit": key }),
        OutboundContent::React { key, emoji } => {
            serde_json::json!({ "react": { "text": emoji, "key": key } })
        }
        OutboundContent::Audio {
            bytes,
            mime_type,
            voice_note,
        } => serde_json::json!({
            "audio": base64::engine::general_purpose::STANDARD.encode(bytes),
            "mimetype": mime_type,
            "ptt": voice_note,
        }),
    }
}

fn normalize_bridge_url(raw: &str) -> Result<String> {
    let normalized = raw.trim().trim_end_matches('/').to_string();
    if normalized.is_empty() {
        return Err(anyhow!("whatsapp bridge_url is required"));
    }
    let parsed =
        Url::parse(&normalized).map_err(|e| anyhow!("invalid whatsapp bridge_url: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(normalized),
        other => Err(anyhow!(
            "invalid whatsapp bridge_url scheme: {other} (expected http or https)"
        )),
    }
}

async fn run_event_stream<S>(
    mut read: S,
    events: mpsc::Sender<TransportEvent>,
    sequence: Arc<AtomicU64>,
) where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let mut close_reason = DisconnectReason::ConnectionLost;
    let mut close_reported = false;

    while let Some(frame) = read.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(error) => {
                tracing::warn!(%error, "whatsapp bridge event stream errored");
                break;
            }
        };
        match frame {
            Message::Text(text) => match parse_frame(text.as_str(), &sequence) {
                Ok(Some(event)) => {
                    if let TransportEvent::ConnectionUpdate(update) = &event {
                        close_reported |= update.state == ConnectionState::Close;
                    }
                    if events.send(event).await.is_err() {
                        tracing::info!("transport event receiver dropped; stopping bridge stream");
                        return;
                    }
                }
                Ok(None) => {}
                Err(error) => tracing::warn!(%error, "ignoring malformed whatsapp bridge frame"),
            },
            Message::Close(frame) => {
                if let Some(frame) = frame {
                    let code = u16::from(frame.code);
                    if code >= STATUS_CLOSE_CODE_BASE {
                        close_reason = DisconnectReason::from_status_code(code - STATUS_CLOSE_CODE_BASE);
                    }
                }
                break;
            }
            _ => {}
        }
    }

    if !close_reported {
        let _ = events
            .send(TransportEvent::ConnectionUpdate(ConnectionUpdate::closed(
                close_reason,
            )))
            .await;
    }
}

fn parse_frame(text: &str, sequence: &AtomicU64) -> Result<Option<TransportEvent>> {
    let frame: BridgeFrame = serde_json::from_str(text)?;
    let event = match frame.event.as_str() {
        "connection.update" => {
            let update: WaConnectionUpdate = serde_json::from_value(frame.data)?;
            convert_connection_update(&update).map(TransportEvent::ConnectionUpdate)
        }
        "chats.update" => {
            let chats: Vec<WaChatUpdate> = serde_json::from_value(frame.data)?;
            let updates: Vec<ChatUpdate> = chats
                .into_iter()
                .filter_map(|chat| {
                    let id = chat.id.filter(|id| !id.trim().is_empty())?;
                    Some(ChatUpdate {
                        id: ChatId::new(id),
                        unread_count: chat.unread_count.and_then(|n| u32::try_from(n).ok()),
                    })
                })
                .collect();
            Some(TransportEvent::ChatsUpdate(updates))
        }
        "messages.upsert" => {
            let upsert: WaUpsert = serde_json::from_value(frame.data)?;
            let kind = match upsert.kind.as_deref() {
                Some("notify") => UpsertKind::Notify,
                _ => UpsertKind::Append,
            };
            let messages = upsert
                .messages
                .into_iter()
                .filter_map(|raw| {
                    let seq = sequence.fetch_add(1, Ordering::SeqCst) + 1;
                    convert_web_message(raw, seq)
                })
                .collect();
            Some(TransportEvent::MessagesUpsert { kind, messages })
        }
        "creds.update" => Some(TransportEvent::CredsUpdate),
        _ => None,
    };
    Ok(event)
}

fn convert_connection_update(update: &WaConnectionUpdate) -> Option<ConnectionUpdate> {
    let state = match update.connection.as_deref()? {
        "open" => ConnectionState::Open,
        "connecting" => ConnectionState::Connecting,
        "close" => ConnectionState::Close,
        _ => return None,
    };
    let reason = (state == ConnectionState::Close).then(|| {
        update
            .last_disconnect
            .as_ref()
            .and_then(WaLastDisconnect::status_code)
            .map(DisconnectReason::from_status_code)
            .unwrap_or(DisconnectReason::ConnectionLost)
    });
    Some(ConnectionUpdate { state, reason })
}

/// Converts a Baileys `WebMessageInfo` JSON payload. Returns `None` for
/// payloads without a chat or message id (protocol and stub messages).
pub fn convert_web_message(raw: serde_json::Value, sequence: u64) -> Option<InboundEvent> {
    let info: WaWebMessage = serde_json::from_value(raw.clone()).ok()?;
    let key = info.key?;
    let chat_id = key.remote_jid.filter(|jid| !jid.trim().is_empty())?;
    let message_id = key.id.filter(|id| !id.trim().is_empty())?;
    let participant = key.participant.filter(|p| !p.trim().is_empty());
    let sender = participant.clone().unwrap_or_else(|| chat_id.clone());
    let message = info.message.unwrap_or_default();

    let extended = message.extended_text_message.as_ref();
    let content = classify_message(&message);
    let context = message_context(&message)
        .map(|ctx| ContextInfo {
            mentioned_ids: ctx.mentioned_jid.clone(),
            quoted_participant: ctx.participant.clone(),
        })
        .unwrap_or_default();

    Some(InboundEvent {
        key: MessageKey {
            chat_id: ChatId::new(chat_id),
            id: MessageId::new(message_id),
            from_me: key.from_me.unwrap_or(false),
            participant: participant.map(SenderId::new),
        },
        sender_id: SenderId::new(sender),
        push_name: info.push_name,
        conversation: message.conversation.clone(),
        extended_text: extended.and_then(|ext| ext.text.clone()),
        content,
        context,
        sequence,
        received_at: Utc::now(),
        raw,
    })
}

fn classify_message(message: &WaMessage) -> MessageContent {
    if let Some(audio) = &message.audio_message {
        return MessageContent::Audio(AudioRef {
            mime_type: audio.mimetype.clone(),
            voice_note: audio.ptt.unwrap_or(false),
            quoted: false,
        });
    }
    if let Some(document) = &message.document_message {
        return MessageContent::Document(DocumentRef {
            mime_type: document.mimetype.clone(),
            file_name: document.file_name.clone(),
        });
    }
    if let Some(image) = &message.image_message {
        return MessageContent::Image(MediaRef {
            mime_type: image.mimetype.clone(),
            caption: image.caption.clone(),
        });
    }
    if let Some(video) = &message.video_message {
        return MessageContent::Video(MediaRef {
            mime_type: video.mimetype.clone(),
            caption: video.caption.clone(),
        });
    }
    let quoted_audio = message
        .extended_text_message
        .as_ref()
        .and_then(|ext| ext.context_info.as_ref())
        .and_then(|ctx| ctx.quoted_message.as_ref())
        .and_then(|quoted| quoted.audio_message.as_ref());
    if let Some(audio) = quoted_audio {
        return MessageContent::Audio(AudioRef {
            mime_type: audio.mimetype.clone(),
            voice_note: audio.ptt.unwrap_or(false),
            quoted: true,
        });
    }
    let has_text = [
        message.conversation.as_deref(),
        message
            .extended_text_message
            .as_ref()
            .and_then(|ext| ext.text.as_deref()),
    ]
    .into_iter()
    .flatten()
    .any(|text| !text.is_empty());
    if has_text {
        MessageContent::Text
    } else {
        MessageContent::None
    }
}

fn message_context(message: &WaMessage) -> Option<&WaContextInfo> {
    message
        .extended_text_message
        .as_ref()
        .and_then(|m| m.context_info.as_ref())
        .or_else(|| message.image_message.as_ref().and_then(|m| m.context_info.as_ref()))
        .or_else(|| message.video_message.as_ref().and_then(|m| m.context_info.as_ref()))
        .or_else(|| message.audio_message.as_ref().and_then(|m| m.context_info.as_ref()))
        .or_else(|| {
            message
                .document_message
                .as_ref()
                .and_then(|m| m.context_info.as_ref())
        })
}

#[derive(Debug, Deserialize)]
struct BridgeFrame {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BridgeSession {
    id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SendResponse {
    key: Option<MessageKey>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WaConnectionUpdate {
    connection: Option<String>,
    last_disconnect: Option<WaLastDisconnect>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WaLastDisconnect {
    status_code: Option<u16>,
    error: Option<WaDisconnectError>,
}

impl WaLastDisconnect {
    fn status_code(&self) -> Option<u16> {
        self.status_code.or_else(|| {
            self.error
                .as_ref()
                .and_then(|error| error.output.as_ref())
                .and_then(|output| output.status_code)
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WaDisconnectError {
    output: Option<WaDisconnectOutput>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WaDisconnectOutput {
    status_code: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WaChatUpdate {
    id: Option<String>,
    unread_count: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WaUpsert {
    #[serde(rename = "type")]
    kind: Option<String>,
    messages: Vec<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WaWebMessage {
    key: Option<WaKey>,
    push_name: Option<String>,
    message: Option<WaMessage>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WaKey {
    remote_jid: Option<String>,
    from_me: Option<bool>,
    id: Option<String>,
    participant: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WaMessage {
    conversation: Option<String>,
    extended_text_message: Option<WaExtendedText>,
    image_message: Option<WaMedia>,
    video_message: Option<WaMedia>,
    audio_message: Option<WaAudio>,
    document_message: Option<WaDocument>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WaExtendedText {
    text: Option<String>,
    context_info: Option<WaContextInfo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WaMedia {
    caption: Option<String>,
    mimetype: Option<String>,
    context_info: Option<WaContextInfo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WaAudio {
    mimetype: Option<String>,
    ptt: Option<bool>,
    context_info: Option<WaContextInfo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WaDocument {
    mimetype: Option<String>,
    file_name: Option<String>,
    context_info: Option<WaContextInfo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WaContextInfo {
    mentioned_jid: Vec<String>,
    participant: Option<String>,
    quoted_message: Option<Box<WaMessage>>,
}
