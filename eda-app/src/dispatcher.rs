use crate::admission::UnreadCounters;
use crate::commands;
use crate::config::EdaConfig;
use crate::message_handler;
use crate::queue::EventHandler;
use crate::reactions::{self, ReactionState};
use crate::supervisor::SessionHandle;
use anyhow::Result;
use async_trait::async_trait;
use eda_ai::AiClient;
use eda_channels::{ChatId, InboundEvent, MessageKey, OutboundContent};
use std::sync::Arc;

/// Shared state for everything downstream of the transport.
pub struct BotContext {
    pub cfg: EdaConfig,
    pub session: SessionHandle,
    pub ai: AiClient,
    pub unread: UnreadCounters,
}

impl BotContext {
    pub fn new(cfg: EdaConfig, session: SessionHandle, ai: AiClient) -> Self {
        Self {
            cfg,
            session,
            ai,
            unread: UnreadCounters::new(),
        }
    }

    pub async fn send(
        &self,
        chat_id: &ChatId,
        content: OutboundContent,
        quoted: Option<&MessageKey>,
    ) -> Result<Option<MessageKey>> {
        let transport = self.session.require()?;
        transport.send_message(chat_id, content, quoted).await
    }

    pub async fn react(&self, key: &MessageKey, state: ReactionState) {
        match self.session.current() {
            Some(transport) => reactions::react(transport.as_ref(), &self.cfg.bot, key, state).await,
            None => tracing::warn!(
                reaction = state.as_str(),
                "no whatsapp session; dropping reaction"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub name: String,
    /// Remaining tokens joined by single spaces, lowercased.
    pub args: String,
}

pub fn parse_command(body: &str, prefix: &str) -> Option<ParsedCommand> {
    let rest = body.strip_prefix(prefix)?;
    let mut tokens = rest.split_whitespace();
    let name = tokens.next().unwrap_or_default().to_string();
    let args = tokens.collect::<Vec<_>>().join(" ").to_lowercase();
    Some(ParsedCommand { name, args })
}

pub struct Dispatcher {
    ctx: Arc<BotContext>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<BotContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl EventHandler for Dispatcher {
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(chat_id = %event.chat_id(), message_id = %event.key.id, sequence = event.sequence)
    )]
    async fn handle(&self, event: InboundEvent) {
        match parse_command(event.body(), &self.ctx.cfg.bot.cmd_prefix) {
            Some(command) => {
                tracing::info!(command = %command.name, "dispatching command");
                commands::handle_command(&self.ctx, &event, &command).await;
            }
            None => {
                tracing::info!(content = event.content.label(), "dispatching message");
                message_handler::handle_message(&self.ctx, &event).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeTransport, direct_text_event};

    #[test]
    fn parse_command_splits_name_and_lowercased_args() {
        assert_eq!(
            parse_command("!help   PING  Now", "!"),
            Some(ParsedCommand {
                name: "help".to_string(),
                args: "ping now".to_string(),
            })
        );
        assert_eq!(
            parse_command("!ping", "!"),
            Some(ParsedCommand {
                name: "ping".to_string(),
                args: String::new(),
            })
        );
        assert_eq!(parse_command("ping", "!"), None);
        assert_eq!(
            parse_command("!", "!"),
            Some(ParsedCommand {
                name: String::new(),
                args: String::new(),
            })
        );
    }

    #[tokio::test]
    async fn commands_and_messages_take_different_paths() {
        let transport = Arc::new(FakeTransport::new());
        let session = SessionHandle::new();
        session.install(transport.clone());
        let ai = AiClient::new("http://127.0.0.1:9").expect("ai client");
        let dispatcher = Dispatcher::new(Arc::new(BotContext::new(
            EdaConfig::default(),
            session,
            ai,
        )));

        dispatcher
            .handle(direct_text_event("5511999999999", "!ping", 1))
            .await;

        assert_eq!(transport.texts(), vec!["*_pong!_*".to_string()]);
        assert!(transport.edits().is_empty());
    }
}
