use crate::config::BotConfig;
use eda_channels::{MessageKey, OutboundContent, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionState {
    Queued,
    Working,
    Done,
    Error,
}

impl ReactionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Working => "working",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    pub fn emoji(self, cfg: &BotConfig) -> &str {
        match self {
            Self::Queued => &cfg.reactions.queued,
            Self::Working => &cfg.reactions.working,
            Self::Done => &cfg.reactions.done,
            Self::Error => &cfg.reactions.error,
        }
    }
}

/// Best-effort: failures are logged, never returned.
pub async fn react(
    transport: &dyn Transport,
    cfg: &BotConfig,
    key: &MessageKey,
    state: ReactionState,
) {
    if !cfg.enable_reactions {
        return;
    }
    let content = OutboundContent::React {
        key: key.clone(),
        emoji: state.emoji(cfg).to_string(),
    };
    if let Err(e) = transport.send_message(&key.chat_id, content, None).await {
        tracing::warn!(
            %e,
            chat_id = %key.chat_id,
            message_id = %key.id,
            reaction = state.as_str(),
            "failed to send reaction"
        );
    }
}
