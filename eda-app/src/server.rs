//! Process wiring: the WhatsApp bot, the optional messaging API, and the
//! one-shot `doctor`/`send` commands.

use crate::config::EdaConfig;
use crate::dispatcher::{BotContext, Dispatcher};
use crate::gateway::BotGateway;
use crate::queue::ChatQueues;
use crate::routes;
use crate::store::MessageStore;
use crate::supervisor::{ReconnectSupervisor, SessionHandle};
use anyhow::{Context, Result};
use axum::Extension;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use eda_ai::AiClient;
use eda_channels::{ChatId, OutboundContent, WhatsAppBridgeConnector};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct ApiState {
    pub ai: AiClient,
    pub store: MessageStore,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = EdaConfig::load(config_path).await?;
    tracing::info!(
        ai_api = %cfg.ai_api.base_url,
        bridge_url = %cfg.transport.bridge_url,
        queue_mode = ?cfg.queue.mode,
        messaging_enabled = cfg.messaging.enabled,
        "config ok"
    );

    let mut failures = Vec::new();

    let ai = build_ai_client(&cfg)?;
    match ai.probe().await {
        Ok(status) => tracing::info!(status, "ai api reachable"),
        Err(e) => {
            tracing::error!(%e, "ai api unreachable");
            failures.push(format!("ai api: {e}"));
        }
    }

    match build_connector(&cfg)?.connect_rest_only().await {
        Ok(transport) => tracing::info!(own_id = ?transport.own_id(), "whatsapp bridge reachable"),
        Err(e) => {
            tracing::error!(%e, "whatsapp bridge unreachable");
            failures.push(format!("whatsapp bridge: {e}"));
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("doctor found problems: {}", failures.join("; ")))
    }
}

pub async fn send_one_shot(config_path: Option<PathBuf>, chat: &str, message: &str) -> Result<()> {
    let cfg = EdaConfig::load(config_path).await?;
    let transport = build_connector(&cfg)?.connect_rest_only().await?;
    let chat_id = chat_jid(chat);
    let key = transport
        .send_message(&chat_id, OutboundContent::Text(message.to_string()), None)
        .await?;
    tracing::info!(chat_id = %chat_id, message_id = ?key.map(|k| k.id), "message sent");
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = EdaConfig::load(config_path).await?;
    tracing::info!(
        bot_name = %cfg.bot.bot_name,
        cmd_prefix = %cfg.bot.cmd_prefix,
        enable_reactions = cfg.bot.enable_reactions,
        unread_threshold = cfg.bot.unread_threshold,
        allowed_users = cfg.access.allowed_users.len(),
        blocked_users = cfg.access.blocked_users.len(),
        ai_api = %cfg.ai_api.base_url,
        ai_request_timeout_seconds = cfg.ai_api.request_timeout_seconds,
        tts_enabled = cfg.tts.enabled,
        bridge_url = %cfg.transport.bridge_url,
        bridge_auth_configured = cfg.transport.auth_token.is_some(),
        queue_mode = ?cfg.queue.mode,
        messaging_enabled = cfg.messaging.enabled,
        "server configuration loaded"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let ai = build_ai_client(&cfg)?;
    let store = if cfg.messaging.enabled {
        let path = cfg.messaging.database_file()?;
        let store = MessageStore::open(&path).await?;
        tracing::info!(database = %path.display(), "message store opened");
        Some(store)
    } else {
        None
    };

    let http_handle = match &store {
        Some(store) => {
            let addr: SocketAddr = cfg
                .messaging
                .bind_addr
                .parse()
                .with_context(|| format!("invalid messaging.bind_addr {}", cfg.messaging.bind_addr))?;
            let listener = preflight_bind_listener(addr).await?;
            let state = Arc::new(ApiState {
                ai: ai.clone(),
                store: store.clone(),
            });
            let app = messaging_app(&cfg, state);
            let shutdown = shutdown.clone();
            tracing::info!(%addr, "messaging api serving");
            Some(tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await
            }))
        }
        None => None,
    };

    let (events_tx, events_rx) = mpsc::channel(cfg.transport.event_buffer);
    let session = SessionHandle::new();
    let supervisor = ReconnectSupervisor::new(
        Arc::new(build_connector(&cfg)?),
        session.clone(),
        events_tx,
        Duration::from_secs(cfg.transport.reconnect_delay_seconds),
        shutdown.clone(),
    );
    let ctx = Arc::new(BotContext::new(cfg.clone(), session, ai));
    let queues = ChatQueues::new(cfg.queue.mode, Arc::new(Dispatcher::new(ctx.clone())));
    let gateway = BotGateway::new(ctx, queues, supervisor, store);

    let outcome = match gateway.supervisor().connect_until_ready().await {
        Ok(()) => {
            tracing::info!("eda bot running");
            gateway.run(events_rx, shutdown.clone()).await;
            if shutdown.is_cancelled() {
                Ok(())
            } else {
                Err(anyhow::anyhow!(
                    "whatsapp session ended; pair the bridge again and restart"
                ))
            }
        }
        Err(e) => {
            tracing::info!(%e, "startup interrupted");
            Ok(())
        }
    };

    shutdown.cancel();
    if let Some(handle) = http_handle {
        match handle.await {
            Ok(Ok(())) => tracing::info!("http server shutdown completed"),
            Ok(Err(e)) => tracing::error!(error = %e, "http server failed"),
            Err(e) => tracing::error!(error = %e, "http server task join failed during shutdown"),
        }
    }
    outcome
}

fn build_ai_client(cfg: &EdaConfig) -> Result<AiClient> {
    Ok(AiClient::new(&cfg.ai_api.base_url)?
        .with_request_timeout(Duration::from_secs(cfg.ai_api.request_timeout_seconds)))
}

fn build_connector(cfg: &EdaConfig) -> Result<WhatsAppBridgeConnector> {
    Ok(WhatsAppBridgeConnector::new(&cfg.transport.bridge_url)?
        .with_auth_token(cfg.transport.auth_token.clone()))
}

/// Bare phone numbers address a direct chat.
fn chat_jid(raw: &str) -> ChatId {
    let raw = raw.trim();
    if raw.contains('@') {
        ChatId::new(raw)
    } else {
        ChatId::new(format!("{}@s.whatsapp.net", raw.trim_start_matches('+')))
    }
}

pub fn messaging_app(cfg: &EdaConfig, state: Arc<ApiState>) -> axum::Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    routes::router()
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(cfg.messaging.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.messaging.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
            _ = shutdown.cancelled() => return,
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::warn!("received ctrl-c; beginning graceful shutdown"),
                Err(e) => tracing::error!(error = %e, "failed to await ctrl-c signal"),
            },
            _ = shutdown.cancelled() => return,
        }
    }
    shutdown.cancel();
}
