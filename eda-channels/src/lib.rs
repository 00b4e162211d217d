//! WhatsApp transport for the Eda bot.
//!
//! The transport is pure I/O: it turns bridge frames into `TransportEvent`s and
//! `OutboundContent` into bridge calls. Admission, queueing and replies live in `eda-app`.

mod traits;
mod types;
mod whatsapp;

pub use traits::{Transport, TransportConnector};
pub use types::{
    AudioRef, ChatId, ChatUpdate, ConnectionState, ConnectionUpdate, ContextInfo,
    DisconnectReason, DocumentRef, GroupMetadata, GroupParticipant, InboundEvent, MediaRef,
    MessageContent, MessageId, MessageKey, OutboundContent, SenderId, TransportEvent, UpsertKind,
    normalize_phone,
};
pub use whatsapp::{WhatsAppBridgeConnector, WhatsAppBridgeTransport, convert_web_message};
