//! Recording fakes shared by the unit tests.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use eda_channels::{
    ChatId, ContextInfo, GroupMetadata, GroupParticipant, InboundEvent, MediaRef, MessageContent,
    MessageId, MessageKey, OutboundContent, SenderId, Transport, TransportConnector,
    TransportEvent,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub const BOT_JID: &str = "5511000000000:7@s.whatsapp.net";

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub chat_id: ChatId,
    pub content: OutboundContent,
    pub quoted: Option<MessageKey>,
}

pub struct FakeTransport {
    own_id: Option<String>,
    groups: Mutex<HashMap<String, GroupMetadata>>,
    sent: Mutex<Vec<SentMessage>>,
    reads: Mutex<Vec<MessageKey>>,
    media: Mutex<Option<Bytes>>,
    fail_text_sends: AtomicBool,
    fail_all_sends: AtomicBool,
    group_metadata_calls: AtomicUsize,
    credential_saves: AtomicUsize,
    closes: AtomicUsize,
    next_id: AtomicU64,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            own_id: Some(BOT_JID.to_string()),
            groups: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            reads: Mutex::new(Vec::new()),
            media: Mutex::new(None),
            fail_text_sends: AtomicBool::new(false),
            fail_all_sends: AtomicBool::new(false),
            group_metadata_calls: AtomicUsize::new(0),
            credential_saves: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn with_group(self, chat_id: &str, subject: &str, members: &[(&str, Option<&str>)]) -> Self {
        let metadata = GroupMetadata {
            id: ChatId::new(chat_id),
            subject: subject.to_string(),
            participants: members
                .iter()
                .map(|(phone, admin)| GroupParticipant {
                    id: format!("{phone}@s.whatsapp.net"),
                    admin: admin.map(ToOwned::to_owned),
                })
                .collect(),
        };
        self.groups
            .lock()
            .expect("groups lock")
            .insert(chat_id.to_string(), metadata);
        self
    }

    pub fn with_media(self, bytes: &'static [u8]) -> Self {
        *self.media.lock().expect("media lock") = Some(Bytes::from_static(bytes));
        self
    }

    pub fn fail_text_sends(&self) {
        self.fail_text_sends.store(true, Ordering::SeqCst);
    }

    pub fn fail_all_sends(&self) {
        self.fail_all_sends.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub fn reads(&self) -> Vec<MessageKey> {
        self.reads.lock().expect("reads lock").clone()
    }

    pub fn group_metadata_calls(&self) -> usize {
        self.group_metadata_calls.load(Ordering::SeqCst)
    }

    pub fn credential_saves(&self) -> usize {
        self.credential_saves.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn reactions(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m.content {
                OutboundContent::React { emoji, .. } => Some(emoji),
                _ => None,
            })
            .collect()
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m.content {
                OutboundContent::Text(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn edits(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m.content {
                OutboundContent::Edit { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn audio_count(&self) -> usize {
        self.sent()
            .iter()
            .filter(|m| matches!(m.content, OutboundContent::Audio { .. }))
            .count()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn own_id(&self) -> Option<String> {
        self.own_id.clone()
    }

    async fn send_message(
        &self,
        chat_id: &ChatId,
        content: OutboundContent,
        quoted: Option<&MessageKey>,
    ) -> Result<Option<MessageKey>> {
        if self.fail_all_sends.load(Ordering::SeqCst)
            || (self.fail_text_sends.load(Ordering::SeqCst)
                && matches!(content, OutboundContent::Text(_)))
        {
            return Err(anyhow!("fake send failure"));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let key = MessageKey {
            chat_id: chat_id.clone(),
            id: MessageId::new(format!("sent-{n}")),
            from_me: true,
            participant: None,
        };
        self.sent.lock().expect("sent lock").push(SentMessage {
            chat_id: chat_id.clone(),
            content,
            quoted: quoted.cloned(),
        });
        Ok(Some(key))
    }

    async fn group_metadata(&self, chat_id: &ChatId) -> Result<GroupMetadata> {
        self.group_metadata_calls.fetch_add(1, Ordering::SeqCst);
        self.groups
            .lock()
            .expect("groups lock")
            .get(chat_id.as_str())
            .cloned()
            .ok_or_else(|| anyhow!("unknown group {chat_id}"))
    }

    async fn read_messages(&self, keys: &[MessageKey]) -> Result<()> {
        self.reads.lock().expect("reads lock").extend_from_slice(keys);
        Ok(())
    }

    async fn download_media(&self, _event: &InboundEvent) -> Result<Bytes> {
        self.media
            .lock()
            .expect("media lock")
            .clone()
            .ok_or_else(|| anyhow!("no media"))
    }

    async fn save_credentials(&self) -> Result<()> {
        self.credential_saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Fails the first `failures` connects, then hands out `transport`.
pub struct FakeConnector {
    transport: Arc<FakeTransport>,
    failures: AtomicUsize,
    attempts: AtomicUsize,
    senders: Mutex<Vec<mpsc::Sender<TransportEvent>>>,
}

impl FakeConnector {
    pub fn new(transport: Arc<FakeTransport>, failures: usize) -> Self {
        Self {
            transport,
            failures: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
            senders: Mutex::new(Vec::new()),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn senders(&self) -> Vec<mpsc::Sender<TransportEvent>> {
        self.senders.lock().expect("senders lock").clone()
    }
}

#[async_trait]
impl TransportConnector for FakeConnector {
    async fn connect(&self, events: mpsc::Sender<TransportEvent>) -> Result<Arc<dyn Transport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!("fake connect failure"));
        }
        self.senders.lock().expect("senders lock").push(events);
        Ok(self.transport.clone())
    }
}

fn event(
    chat_id: &str,
    sender: &str,
    participant: Option<&str>,
    conversation: Option<&str>,
    content: MessageContent,
    sequence: u64,
) -> InboundEvent {
    InboundEvent {
        key: MessageKey {
            chat_id: ChatId::new(chat_id),
            id: MessageId::new(format!("in-{sequence}")),
            from_me: false,
            participant: participant.map(SenderId::new),
        },
        sender_id: SenderId::new(sender),
        push_name: Some("Tester".to_string()),
        conversation: conversation.map(ToOwned::to_owned),
        extended_text: None,
        content,
        context: ContextInfo::default(),
        sequence,
        received_at: Utc::now(),
        raw: serde_json::Value::Null,
    }
}

pub fn direct_text_event(phone: &str, body: &str, sequence: u64) -> InboundEvent {
    let jid = format!("{phone}@s.whatsapp.net");
    event(&jid, &jid, None, Some(body), MessageContent::Text, sequence)
}

pub fn group_text_event(group: &str, phone: &str, body: &str, sequence: u64) -> InboundEvent {
    let sender = format!("{phone}@s.whatsapp.net");
    event(
        group,
        &sender,
        Some(&sender),
        Some(body),
        MessageContent::Text,
        sequence,
    )
}

pub fn image_event(phone: &str, caption: Option<&str>, sequence: u64) -> InboundEvent {
    let jid = format!("{phone}@s.whatsapp.net");
    event(
        &jid,
        &jid,
        None,
        None,
        MessageContent::Image(MediaRef {
            mime_type: Some("image/jpeg".to_string()),
            caption: caption.map(ToOwned::to_owned),
        }),
        sequence,
    )
}

pub fn content_event(phone: &str, content: MessageContent, sequence: u64) -> InboundEvent {
    let jid = format!("{phone}@s.whatsapp.net");
    event(&jid, &jid, None, None, content, sequence)
}

pub fn temp_dir(prefix: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("{prefix}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}
