use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

const GROUP_SERVER_SUFFIX: &str = "@g.us";

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }

            /// Phone part of the id: everything before `@`, without a `:device` suffix.
            pub fn phone(&self) -> &str {
                normalize_phone(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(ChatId);
id_newtype!(SenderId);
id_newtype!(MessageId);

impl ChatId {
    pub fn is_group(&self) -> bool {
        self.0.ends_with(GROUP_SERVER_SUFFIX)
    }
}

/// Strips the server (`@s.whatsapp.net`, `@g.us`) and device (`:12`) parts of a jid.
pub fn normalize_phone(jid: &str) -> &str {
    let user = jid.split('@').next().unwrap_or_default();
    user.split(':').next().unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    #[serde(rename = "remoteJid")]
    pub chat_id: ChatId,
    pub id: MessageId,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<SenderId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioRef {
    pub mime_type: Option<String>,
    pub voice_note: bool,
    /// The audio lives in the quoted message, not in the event itself.
    pub quoted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub mime_type: Option<String>,
    pub caption: Option<String>,
}

/// Attachment classification, computed once when an event is read off the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text,
    Audio(AudioRef),
    Document(DocumentRef),
    Image(MediaRef),
    Video(MediaRef),
    None,
}

impl MessageContent {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Audio(_) => "audio",
            Self::Document(_) => "document",
            Self::Image(_) => "image",
            Self::Video(_) => "video",
            Self::None => "none",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextInfo {
    #[serde(default)]
    pub mentioned_ids: Vec<String>,
    #[serde(default)]
    pub quoted_participant: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub key: MessageKey,
    pub sender_id: SenderId,
    #[serde(default)]
    pub push_name: Option<String>,
    #[serde(default)]
    pub conversation: Option<String>,
    #[serde(default)]
    pub extended_text: Option<String>,
    pub content: MessageContent,
    #[serde(default)]
    pub context: ContextInfo,
    pub sequence: u64,
    pub received_at: DateTime<Utc>,
    /// Wire payload as delivered, handed back to the transport for media downloads.
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl InboundEvent {
    pub fn chat_id(&self) -> &ChatId {
        &self.key.chat_id
    }

    pub fn is_group(&self) -> bool {
        self.key.chat_id.is_group()
    }

    /// Plain text if present, otherwise the extended (quoting) text.
    pub fn body(&self) -> &str {
        [self.conversation.as_deref(), self.extended_text.as_deref()]
            .into_iter()
            .flatten()
            .find(|text| !text.is_empty())
            .unwrap_or_default()
    }

    pub fn caption(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Image(media) | MessageContent::Video(media) => media
                .caption
                .as_deref()
                .filter(|caption| !caption.trim().is_empty()),
            _ => None,
        }
    }

    pub fn sender_phone(&self) -> &str {
        self.sender_id.phone()
    }

    pub fn user_platform_id(&self, platform: &str) -> String {
        format!("{platform}_{}", self.sender_phone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupParticipant {
    pub id: String,
    #[serde(default)]
    pub admin: Option<String>,
}

impl GroupParticipant {
    pub fn is_admin(&self) -> bool {
        matches!(self.admin.as_deref(), Some("admin" | "superadmin"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub id: ChatId,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub participants: Vec<GroupParticipant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    LoggedOut,
    ConnectionLost,
    ConnectionClosed,
    ConnectionReplaced,
    BadSession,
    RestartRequired,
    Other(u16),
}

impl DisconnectReason {
    pub fn from_status_code(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            408 => Self::ConnectionLost,
            428 => Self::ConnectionClosed,
            440 => Self::ConnectionReplaced,
            500 => Self::BadSession,
            515 => Self::RestartRequired,
            other => Self::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionUpdate {
    pub state: ConnectionState,
    #[serde(default)]
    pub reason: Option<DisconnectReason>,
}

impl ConnectionUpdate {
    pub fn closed(reason: DisconnectReason) -> Self {
        Self {
            state: ConnectionState::Close,
            reason: Some(reason),
        }
    }

    pub fn is_logout(&self) -> bool {
        self.state == ConnectionState::Close && self.reason == Some(DisconnectReason::LoggedOut)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatUpdate {
    pub id: ChatId,
    #[serde(default)]
    pub unread_count: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertKind {
    Notify,
    Append,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    ConnectionUpdate(ConnectionUpdate),
    ChatsUpdate(Vec<ChatUpdate>),
    MessagesUpsert {
        kind: UpsertKind,
        messages: Vec<InboundEvent>,
    },
    CredsUpdate,
}

impl TransportEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionUpdate(_) => "connection.update",
            Self::ChatsUpdate(_) => "chats.update",
            Self::MessagesUpsert { .. } => "messages.upsert",
            Self::CredsUpdate => "creds.update",
        }
    }
}

#[derive(Debug, Clone)]
pub enum OutboundContent {
    Text(String),
    /// Overwrites a message previously sent by the bot.
    Edit {
        key: MessageKey,
        text: String,
    },
    React {
        key: MessageKey,
        emoji: String,
    },
    Audio {
        bytes: Bytes,
        mime_type: String,
        voice_note: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_phone_strips_server_and_device() {
        assert_eq!(normalize_phone("5511999999999@s.whatsapp.net"), "5511999999999");
        assert_eq!(normalize_phone("5511999999999:17@s.whatsapp.net"), "5511999999999");
        assert_eq!(normalize_phone("120363025@g.us"), "120363025");
        assert_eq!(normalize_phone("plain"), "plain");
        assert_eq!(normalize_phone(""), "");
    }

    #[test]
    fn group_chat_ids_end_with_group_server() {
        assert!(ChatId::new("120363025@g.us").is_group());
        assert!(!ChatId::new("5511999999999@s.whatsapp.net").is_group());
    }

    #[test]
    fn disconnect_reason_maps_known_status_codes() {
        assert_eq!(
            DisconnectReason::from_status_code(401),
            DisconnectReason::LoggedOut
        );
        assert_eq!(
            DisconnectReason::from_status_code(515),
            DisconnectReason::RestartRequired
        );
        assert_eq!(
            DisconnectReason::from_status_code(499),
            DisconnectReason::Other(499)
        );
        assert!(ConnectionUpdate::closed(DisconnectReason::LoggedOut).is_logout());
        assert!(!ConnectionUpdate::closed(DisconnectReason::ConnectionLost).is_logout());
    }

    #[test]
    fn participant_admin_roles() {
        let admin = GroupParticipant {
            id: "1@s.whatsapp.net".to_string(),
            admin: Some("superadmin".to_string()),
        };
        let member = GroupParticipant {
            id: "2@s.whatsapp.net".to_string(),
            admin: None,
        };
        assert!(admin.is_admin());
        assert!(!member.is_admin());
    }
}
