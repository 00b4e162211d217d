//! Decides whether an inbound event is processed at all.
//!
//! Access rules (allow/block lists, group membership) run first, then the
//! group addressing check, then the unread throttle. Nothing is reacted to or
//! queued until an event is accepted.

use crate::config::EdaConfig;
use dashmap::DashMap;
use eda_channels::{ChatId, ChatUpdate, GroupMetadata, InboundEvent, OutboundContent, Transport, normalize_phone};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    BlockedSender,
    NotAllowedSender,
    NoAllowedMemberInGroup,
    TooManyUnread,
    NotMentionedAndNotQuoting,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BlockedSender => "blocked_sender",
            Self::NotAllowedSender => "not_allowed_sender",
            Self::NoAllowedMemberInGroup => "no_allowed_member_in_group",
            Self::TooManyUnread => "too_many_unread",
            Self::NotMentionedAndNotQuoting => "not_mentioned_and_not_quoting",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Accept,
    Reject(RejectReason),
}

/// Last unread count reported per chat.
#[derive(Debug, Default)]
pub struct UnreadCounters {
    counts: DashMap<ChatId, u32>,
}

impl UnreadCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates without a count leave the previous value in place.
    pub fn apply(&self, updates: &[ChatUpdate]) {
        for update in updates {
            if let Some(count) = update.unread_count {
                self.counts.insert(update.id.clone(), count);
            }
        }
    }

    pub fn get(&self, chat_id: &ChatId) -> u32 {
        self.counts.get(chat_id).map(|c| *c).unwrap_or(0)
    }
}

#[tracing::instrument(
    level = "debug",
    skip_all,
    fields(chat_id = %event.chat_id(), message_id = %event.key.id, unread_count = unread_count)
)]
pub async fn evaluate(
    transport: &dyn Transport,
    cfg: &EdaConfig,
    event: &InboundEvent,
    unread_count: u32,
) -> AdmissionDecision {
    let mut group: Option<GroupMetadata> = None;

    if let Err(reason) = check_access(transport, cfg, event, &mut group).await {
        tracing::warn!(
            reason = reason.as_str(),
            sender = %event.sender_phone(),
            push_name = ?event.push_name,
            "ignoring message"
        );
        return AdmissionDecision::Reject(reason);
    }

    if event.is_group() && !is_addressed_to_bot(transport, cfg, event) {
        tracing::debug!("group message does not mention or quote the bot; ignoring");
        return AdmissionDecision::Reject(RejectReason::NotMentionedAndNotQuoting);
    }

    if unread_count > cfg.bot.unread_threshold {
        skip_unread_backlog(transport, cfg, event, unread_count, group.as_ref()).await;
        return AdmissionDecision::Reject(RejectReason::TooManyUnread);
    }

    AdmissionDecision::Accept
}

async fn check_access(
    transport: &dyn Transport,
    cfg: &EdaConfig,
    event: &InboundEvent,
    group: &mut Option<GroupMetadata>,
) -> Result<(), RejectReason> {
    let access = &cfg.access;
    if access.is_open() {
        return Ok(());
    }

    let sender = event.sender_phone();
    if access.is_blocked(sender) {
        return Err(RejectReason::BlockedSender);
    }

    if !event.is_group() {
        if access.is_allowed(sender) {
            return Ok(());
        }
        return Err(RejectReason::NotAllowedSender);
    }

    let metadata = match transport.group_metadata(event.chat_id()).await {
        Ok(metadata) => metadata,
        Err(e) => {
            tracing::warn!(%e, "group metadata lookup failed; rejecting");
            return Err(RejectReason::NoAllowedMemberInGroup);
        }
    };
    let allowed_member = metadata
        .participants
        .iter()
        .any(|p| access.is_allowed(normalize_phone(&p.id)));
    *group = Some(metadata);
    if allowed_member {
        Ok(())
    } else {
        Err(RejectReason::NoAllowedMemberInGroup)
    }
}

fn is_addressed_to_bot(transport: &dyn Transport, cfg: &EdaConfig, event: &InboundEvent) -> bool {
    if event.body().starts_with(cfg.bot.cmd_prefix.as_str()) {
        return true;
    }
    let Some(own_id) = transport.own_id() else {
        return false;
    };
    let own_phone = normalize_phone(&own_id);
    if own_phone.is_empty() {
        return false;
    }

    let mentioned = event
        .context
        .mentioned_ids
        .iter()
        .any(|id| id == &own_id || normalize_phone(id) == own_phone);
    let quoting_bot = event
        .context
        .quoted_participant
        .as_deref()
        .is_some_and(|p| normalize_phone(p) == own_phone);
    mentioned || quoting_bot
}

async fn skip_unread_backlog(
    transport: &dyn Transport,
    cfg: &EdaConfig,
    event: &InboundEvent,
    unread_count: u32,
    group: Option<&GroupMetadata>,
) {
    if let Err(e) = transport.read_messages(std::slice::from_ref(&event.key)).await {
        tracing::warn!(%e, "failed to mark backlog message read");
    }

    let template = if event.is_group() {
        let group_name = match group {
            Some(metadata) => group_display_name(metadata),
            None => match transport.group_metadata(event.chat_id()).await {
                Ok(metadata) => group_display_name(&metadata),
                Err(e) => {
                    tracing::debug!(%e, "group name lookup failed");
                    event.chat_id().to_string()
                }
            },
        };
        tracing::warn!(unread_count, group = %group_name, "too many unread messages in group chat; ignoring");
        cfg.messages
            .unread_group_warning
            .replace("{group}", &group_name)
    } else {
        tracing::warn!(unread_count, user = %event.sender_phone(), "too many unread messages in direct chat; ignoring");
        cfg.messages.unread_direct_warning.clone()
    };

    if !cfg.bot.ignore_messages_warning {
        return;
    }
    let text = format!(
        "{}{}",
        cfg.bot.reply_prefix(),
        template.replace("{count}", &unread_count.to_string())
    );
    if let Err(e) = transport
        .send_message(event.chat_id(), OutboundContent::Text(text), None)
        .await
    {
        tracing::warn!(%e, "failed to send unread warning");
    }
}

fn group_display_name(metadata: &GroupMetadata) -> String {
    if metadata.subject.trim().is_empty() {
        metadata.id.to_string()
    } else {
        metadata.subject.clone()
    }
}
