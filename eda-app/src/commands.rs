//! Chat commands (`!ping`, `!help`) and the admin gate.

use crate::config::BotConfig;
use crate::dispatcher::{BotContext, ParsedCommand};
use crate::reactions::ReactionState;
use anyhow::Result;
use eda_channels::{InboundEvent, OutboundContent};

const ADMIN_COMMANDS: &[&str] = &["jailbreak", "reset", "change"];

pub fn is_admin_command(name: &str) -> bool {
    ADMIN_COMMANDS.contains(&name)
}

#[tracing::instrument(level = "info", skip_all, fields(command = %command.name))]
pub async fn handle_command(ctx: &BotContext, event: &InboundEvent, command: &ParsedCommand) {
    ctx.react(&event.key, ReactionState::Working).await;

    let bot = &ctx.cfg.bot;
    if is_admin_command(&command.name) {
        match sender_is_admin(ctx, event).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(sender = %event.sender_phone(), "non-admin tried an admin command");
                let state = reply(ctx, event, unauthorized_message(bot, &command.name)).await;
                ctx.react(&event.key, state).await;
                return;
            }
            Err(e) => {
                tracing::warn!(%e, "admin lookup failed");
                ctx.react(&event.key, ReactionState::Error).await;
                return;
            }
        }
    }

    let text = match command.name.as_str() {
        "ping" => format!("{}*_pong!_*", bot.reply_prefix()),
        "help" => help_reply(bot, &command.args),
        other => unknown_command_message(bot, other),
    };
    let state = reply(ctx, event, text).await;
    ctx.react(&event.key, state).await;
}

async fn reply(ctx: &BotContext, event: &InboundEvent, text: String) -> ReactionState {
    match ctx
        .send(event.chat_id(), OutboundContent::Text(text), Some(&event.key))
        .await
    {
        Ok(_) => ReactionState::Done,
        Err(e) => {
            tracing::warn!(%e, "failed to send command reply");
            ReactionState::Error
        }
    }
}

/// Direct chats have no admins; every sender passes.
async fn sender_is_admin(ctx: &BotContext, event: &InboundEvent) -> Result<bool> {
    if !event.is_group() {
        return Ok(true);
    }
    let transport = ctx.session.require()?;
    let metadata = transport.group_metadata(event.chat_id()).await?;
    let sender = event.sender_phone();
    Ok(metadata
        .participants
        .iter()
        .any(|p| eda_channels::normalize_phone(&p.id) == sender && p.is_admin()))
}

fn help_statement(bot: &BotConfig) -> String {
    format!(
        "Digite *_{}help_* para ver os comandos disponíveis.",
        bot.cmd_prefix
    )
}

pub fn help_reply(bot: &BotConfig, args: &str) -> String {
    let p = &bot.cmd_prefix;
    match args {
        "" => format!(
            "{}Available commands:\n\n\
             🆘 *{p}help _<command>_*\n\
             Displays the available commands, their functionalities and how to use them.\n\
             - Run *{p}help _<command>_* for more information about a specific command.\n\n\
             🏓 *{p}ping*\n\
             Checks if the bot is alive by responding with '*_pong!_*'.",
            bot.reply_prefix()
        ),
        "help" => "I see what you did there.\n\n\
                   That's pretty meta, but I'm not gonna help you with that.\n\n\
                   Smart ass."
            .to_string(),
        "ping" => format!(
            "🏓 *{p}ping*\nChecks if the bot is alive by responding with '*_pong!_*'."
        ),
        other => invalid_argument_message(bot, other),
    }
}

fn invalid_argument_message(bot: &BotConfig, args: &str) -> String {
    format!(
        "{}Argumento inválido: _\"{args}\"_\n\n{}",
        bot.reply_prefix(),
        help_statement(bot)
    )
}

pub fn unknown_command_message(bot: &BotConfig, name: &str) -> String {
    format!(
        "{}Comando desconhecido: _\"{}{name}\"_\n\n{}",
        bot.reply_prefix(),
        bot.cmd_prefix,
        help_statement(bot)
    )
}

pub fn unauthorized_message(bot: &BotConfig, name: &str) -> String {
    format!(
        "{}Acesso negado: Você não é admin neste grupo.\n\nApenas admins podem usar o comando *{name}*\n\n{}",
        bot.reply_prefix(),
        help_statement(bot)
    )
}
