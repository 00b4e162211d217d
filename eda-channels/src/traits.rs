use crate::types::{ChatId, GroupMetadata, InboundEvent, MessageKey, OutboundContent, TransportEvent};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One live WhatsApp session.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The bot's own jid, once the session knows it.
    fn own_id(&self) -> Option<String>;

    /// Send content to a chat. Returns the key of the created message when the
    /// transport reports one (edits and reactions may not).
    async fn send_message(
        &self,
        chat_id: &ChatId,
        content: OutboundContent,
        quoted: Option<&MessageKey>,
    ) -> Result<Option<MessageKey>>;

    async fn group_metadata(&self, chat_id: &ChatId) -> Result<GroupMetadata>;

    async fn read_messages(&self, keys: &[MessageKey]) -> Result<()>;

    async fn download_media(&self, event: &InboundEvent) -> Result<Bytes>;

    async fn save_credentials(&self) -> Result<()> {
        Ok(())
    }

    /// Detaches the session from its event sender. No events arrive from it afterwards.
    fn close(&self) {}
}

/// Establishes sessions. Every session pushes its events into the sender it was
/// connected with, so reconnecting with the same sender keeps the pipeline attached.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, events: mpsc::Sender<TransportEvent>) -> Result<Arc<dyn Transport>>;
}
