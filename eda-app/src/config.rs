//! Bot and gateway configuration loader.
//!
//! Every section has defaults, so an empty file is a valid config.

use serde::Deserialize;
use std::ffi::OsString;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EdaConfig {
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub access: AccessConfig,
    #[serde(default)]
    pub ai_api: AiApiConfig,
    #[serde(default)]
    pub tts: TtsConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub messaging: MessagingConfig,
    #[serde(default)]
    pub messages: MessagesConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_cmd_prefix")]
    pub cmd_prefix: String,
    /// Prepended (followed by a space) to command replies and warnings.
    #[serde(default)]
    pub bot_prefix: String,
    #[serde(default = "default_bot_name")]
    pub bot_name: String,
    #[serde(default = "default_true")]
    pub enable_reactions: bool,
    #[serde(default)]
    pub ignore_messages_warning: bool,
    /// Chats with more unread messages than this are skipped.
    #[serde(default = "default_unread_threshold")]
    pub unread_threshold: u32,
    #[serde(default)]
    pub reactions: ReactionEmojis,
}

impl BotConfig {
    pub fn reply_prefix(&self) -> String {
        let prefix = self.bot_prefix.trim();
        if prefix.is_empty() {
            String::new()
        } else {
            format!("{prefix} ")
        }
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            cmd_prefix: default_cmd_prefix(),
            bot_prefix: String::new(),
            bot_name: default_bot_name(),
            enable_reactions: true,
            ignore_messages_warning: false,
            unread_threshold: default_unread_threshold(),
            reactions: ReactionEmojis::default(),
        }
    }
}

fn default_cmd_prefix() -> String {
    "!".to_string()
}

fn default_bot_name() -> String {
    "Earth Defenders Assistant".to_string()
}

fn default_true() -> bool {
    true
}

fn default_unread_threshold() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReactionEmojis {
    #[serde(default = "default_queued_emoji")]
    pub queued: String,
    #[serde(default = "default_working_emoji")]
    pub working: String,
    #[serde(default = "default_done_emoji")]
    pub done: String,
    #[serde(default = "default_error_emoji")]
    pub error: String,
}

impl Default for ReactionEmojis {
    fn default() -> Self {
        Self {
            queued: default_queued_emoji(),
            working: default_working_emoji(),
            done: default_done_emoji(),
            error: default_error_emoji(),
        }
    }
}

fn default_queued_emoji() -> String {
    "🔁".to_string()
}

fn default_working_emoji() -> String {
    "⚙️".to_string()
}

fn default_done_emoji() -> String {
    "✅".to_string()
}

fn default_error_emoji() -> String {
    "⚠️".to_string()
}

/// Phone numbers (digits only, no `@server`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccessConfig {
    #[serde(default)]
    pub allowed_users: Vec<String>,
    #[serde(default)]
    pub blocked_users: Vec<String>,
}

impl AccessConfig {
    pub fn is_open(&self) -> bool {
        self.allowed_users.is_empty() && self.blocked_users.is_empty()
    }

    pub fn is_allowed(&self, phone: &str) -> bool {
        self.allowed_users.iter().any(|u| u == phone)
    }

    pub fn is_blocked(&self, phone: &str) -> bool {
        self.blocked_users.iter().any(|u| u == phone)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AiApiConfig {
    #[serde(default = "default_ai_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_transcription_language")]
    pub transcription_language: String,
    #[serde(default = "default_audio_filename")]
    pub audio_filename: String,
    #[serde(default = "default_document_ttl_days")]
    pub document_ttl_days: u32,
    #[serde(default = "default_platform")]
    pub platform: String,
}

impl Default for AiApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_ai_base_url(),
            request_timeout_seconds: default_request_timeout_seconds(),
            transcription_language: default_transcription_language(),
            audio_filename: default_audio_filename(),
            document_ttl_days: default_document_ttl_days(),
            platform: default_platform(),
        }
    }
}

fn default_ai_base_url() -> String {
    "http://localhost:8083".to_string()
}

fn default_request_timeout_seconds() -> u64 {
    600
}

fn default_transcription_language() -> String {
    "pt".to_string()
}

fn default_audio_filename() -> String {
    "audio.ogg".to_string()
}

fn default_document_ttl_days() -> u32 {
    30
}

fn default_platform() -> String {
    "whatsapp".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TtsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_tts_min_length")]
    pub min_length: usize,
    #[serde(default = "default_tts_max_length")]
    pub max_length: usize,
    #[serde(default)]
    pub language_code: Option<String>,
    #[serde(default)]
    pub voice_name: Option<String>,
}

impl TtsConfig {
    pub fn should_speak(&self, text: &str) -> bool {
        let len = text.chars().count();
        self.enabled && len >= self.min_length && len <= self.max_length
    }
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_length: default_tts_min_length(),
            max_length: default_tts_max_length(),
            language_code: None,
            voice_name: None,
        }
    }
}

fn default_tts_min_length() -> usize {
    1
}

fn default_tts_max_length() -> usize {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_reconnect_delay_seconds")]
    pub reconnect_delay_seconds: u64,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bridge_url: default_bridge_url(),
            auth_token: None,
            reconnect_delay_seconds: default_reconnect_delay_seconds(),
            event_buffer: default_event_buffer(),
        }
    }
}

fn default_bridge_url() -> String {
    "http://127.0.0.1:3001".to_string()
}

fn default_reconnect_delay_seconds() -> u64 {
    5
}

fn default_event_buffer() -> usize {
    256
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// Each chat drains independently.
    #[default]
    PerChat,
    /// One process-wide drain flag. A chat enqueued while another chat drains
    /// waits for its next enqueue.
    SharedFlag,
}

impl QueueMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "per_chat" => Some(Self::PerChat),
            "shared_flag" => Some(Self::SharedFlag),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub mode: QueueMode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
    /// SQLite file. Relative paths and `~` are resolved against the home directory.
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: default_bind_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
            database_path: default_database_path(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:3002".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    660
}

fn default_http_max_in_flight() -> usize {
    64
}

fn default_database_path() -> String {
    "~/.eda/data/messages.db".to_string()
}

impl MessagingConfig {
    /// Relative and `~/` paths resolve against `$HOME`.
    pub fn database_file(&self) -> anyhow::Result<PathBuf> {
        let raw = self.database_path.trim();
        if let Some(rest) = raw.strip_prefix("~/") {
            return Ok(home_dir()?.join(rest));
        }
        let path = PathBuf::from(raw);
        if path.is_absolute() {
            Ok(path)
        } else {
            Ok(home_dir()?.join(path))
        }
    }
}

/// User-facing texts. `{count}`, `{group}`, `{error}` and `{file_type}` are substituted.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagesConfig {
    pub waiting: String,
    pub no_response: String,
    pub http_error: String,
    pub timeout: String,
    pub unknown: String,
    pub no_input: String,
    pub image_received: String,
    pub audio_download_failed: String,
    pub audio_transcription_failed: String,
    pub audio_transcription_error: String,
    pub document_download_failed: String,
    pub document_upload_failed: String,
    pub document_processed: String,
    pub unread_group_warning: String,
    pub unread_direct_warning: String,
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            waiting: "Estou analisando sua mensagem... Como preciso pensar com cuidado, pode demorar alguns minutos.".to_string(),
            no_response: "Desculpe, não consegui gerar uma resposta. Tente novamente.".to_string(),
            http_error: "Ops, tive um problema técnico. Pode tentar novamente?".to_string(),
            timeout: "Desculpe, demorei muito para responder. Pode tentar novamente?".to_string(),
            unknown: "Ocorreu um erro inesperado. Pode tentar novamente?".to_string(),
            no_input: "Não encontrei texto, áudio ou imagem para processar. Pode enviar novamente?".to_string(),
            image_received: "Imagem recebida".to_string(),
            audio_download_failed: "Não consegui baixar o áudio.".to_string(),
            audio_transcription_failed: "Erro ao transcrever o áudio.".to_string(),
            audio_transcription_error: "Erro ao transcrever o áudio: {error}".to_string(),
            document_download_failed: "Não foi possível baixar o arquivo.".to_string(),
            document_upload_failed: "Erro ao processar o arquivo. Por favor, tente novamente.".to_string(),
            document_processed: "✅ {file_type} processado com sucesso!\n\nAgora você pode fazer perguntas sobre o conteúdo deste arquivo diretamente por mensagem.".to_string(),
            unread_group_warning: "Too many unread messages ({count}) since I've last seen this chat. I'm ignoring them. If you need me to respond, please @mention me or quote my last completion in this chat.".to_string(),
            unread_direct_warning: "Too many unread messages ({count}) since I've last seen this chat. I'm ignoring them. If you need me to respond, please message me again.".to_string(),
        }
    }
}

impl EdaConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path,
            None => default_config_path()?,
        };
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg: EdaConfig = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let flag = |key: &str| -> anyhow::Result<Option<bool>> {
            match var(key) {
                Some(raw) => parse_bool(&raw)
                    .map(Some)
                    .ok_or_else(|| anyhow::anyhow!("{key} must be a boolean (true/false), got {raw:?}")),
                None => Ok(None),
            }
        };

        if let Some(v) = var("CMD_PREFIX") {
            self.bot.cmd_prefix = v.trim().to_string();
        }
        if let Some(v) = var("BOT_PREFIX") {
            self.bot.bot_prefix = v.trim().to_string();
        }
        if let Some(v) = var("BOT_NAME") {
            self.bot.bot_name = v.trim().to_string();
        }
        if let Some(v) = flag("ENABLE_REACTIONS")? {
            self.bot.enable_reactions = v;
        }
        if let Some(v) = flag("IGNORE_MESSAGES_WARNING")? {
            self.bot.ignore_messages_warning = v;
        }
        if let Some(v) = var("ALLOWED_USERS") {
            self.access.allowed_users = split_list(&v);
        }
        if let Some(v) = var("BLOCKED_USERS") {
            self.access.blocked_users = split_list(&v);
        }
        if let Some(v) = var("AI_API_BASE_URL") {
            self.ai_api.base_url = v;
        }
        if let Some(v) = var("WA_BRIDGE_URL") {
            self.transport.bridge_url = v;
        }
        if let Some(v) = var("WA_BRIDGE_TOKEN") {
            self.transport.auth_token = Some(v);
        }
        if let Some(v) = flag("ENABLE_TTS")? {
            self.tts.enabled = v;
        }
        if let Some(v) = var("MESSAGING_BIND_ADDR") {
            self.messaging.bind_addr = v;
            self.messaging.enabled = true;
        }
        if let Some(mode) = var("EDA_QUEUE_MODE") {
            match QueueMode::parse(&mode) {
                Some(mode) => self.queue.mode = mode,
                None => tracing::warn!(value = %mode, "ignoring unknown EDA_QUEUE_MODE"),
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bot.cmd_prefix.trim().is_empty() {
            return Err(anyhow::anyhow!("bot.cmd_prefix must not be empty"));
        }
        if self.ai_api.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("ai_api.request_timeout_seconds must be > 0"));
        }
        validate_http_url("ai_api.base_url", &self.ai_api.base_url)?;
        validate_http_url("transport.bridge_url", &self.transport.bridge_url)?;
        if self.transport.event_buffer == 0 {
            return Err(anyhow::anyhow!("transport.event_buffer must be > 0"));
        }
        if self.tts.enabled && self.tts.min_length > self.tts.max_length {
            return Err(anyhow::anyhow!(
                "tts.min_length ({}) must be <= tts.max_length ({})",
                self.tts.min_length,
                self.tts.max_length
            ));
        }
        if self.messaging.enabled {
            if self.messaging.http_max_in_flight == 0 {
                return Err(anyhow::anyhow!("messaging.http_max_in_flight must be > 0"));
            }
            if self.messaging.http_timeout_seconds == 0 {
                return Err(anyhow::anyhow!("messaging.http_timeout_seconds must be > 0"));
            }
        }
        Ok(())
    }
}

fn validate_http_url(field: &str, raw: &str) -> anyhow::Result<()> {
    let parsed = reqwest::Url::parse(raw.trim())
        .map_err(|e| anyhow::anyhow!("{field} is not a valid url ({raw:?}): {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(anyhow::anyhow!(
            "{field} must use http or https, got {other}"
        )),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub(crate) fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

pub fn default_config_path() -> anyhow::Result<PathBuf> {
    Ok(home_dir()?.join(".eda").join("whatsapp.toml"))
}

fn home_dir() -> anyhow::Result<PathBuf> {
    resolve_home(std::env::var_os("HOME"))
}

fn resolve_home(home: Option<OsString>) -> anyhow::Result<PathBuf> {
    home.filter(|home| !home.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| {
            anyhow::anyhow!("HOME is not set; pass --config and use an absolute messaging.database_path")
        })
}
