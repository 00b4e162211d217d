//! Bot event loop: every transport event arrives on one channel and is routed
//! to the supervisor, the unread counters, admission, or the chat queues.

use crate::admission::{self, AdmissionDecision};
use crate::dispatcher::BotContext;
use crate::queue::ChatQueues;
use crate::reactions::ReactionState;
use crate::store::{MessageStore, ReceivedMessage};
use crate::supervisor::{ReconnectSupervisor, SupervisorAction};
use eda_channels::{InboundEvent, TransportEvent, UpsertKind};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct BotGateway {
    ctx: Arc<BotContext>,
    queues: ChatQueues,
    supervisor: ReconnectSupervisor,
    store: Option<MessageStore>,
}

impl BotGateway {
    pub fn new(
        ctx: Arc<BotContext>,
        queues: ChatQueues,
        supervisor: ReconnectSupervisor,
        store: Option<MessageStore>,
    ) -> Self {
        Self {
            ctx,
            queues,
            supervisor,
            store,
        }
    }

    pub fn supervisor(&self) -> &ReconnectSupervisor {
        &self.supervisor
    }

    /// Runs until shutdown, logout, or every event sender is gone.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run(&self, mut events: mpsc::Receiver<TransportEvent>, shutdown: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("gateway shutting down");
                    return;
                }
                event = events.recv() => event,
            };
            let Some(event) = event else {
                tracing::warn!("transport event channel closed");
                return;
            };
            if self.handle_event(event).await == SupervisorAction::Stop {
                return;
            }
        }
    }

    async fn handle_event(&self, event: TransportEvent) -> SupervisorAction {
        tracing::debug!(kind = event.kind(), "transport event");
        match event {
            TransportEvent::ConnectionUpdate(update) => {
                return self.supervisor.on_connection_update(&update).await;
            }
            TransportEvent::ChatsUpdate(updates) => self.ctx.unread.apply(&updates),
            TransportEvent::MessagesUpsert {
                kind: UpsertKind::Notify,
                messages,
            } => self.admit_batch(messages).await,
            TransportEvent::MessagesUpsert {
                kind: UpsertKind::Append,
                messages,
            } => {
                tracing::debug!(count = messages.len(), "ignoring appended history");
            }
            TransportEvent::CredsUpdate => match self.ctx.session.current() {
                Some(transport) => {
                    if let Err(e) = transport.save_credentials().await {
                        tracing::warn!(%e, "failed to persist credentials");
                    }
                }
                None => tracing::warn!("credentials updated with no live session"),
            },
        }
        SupervisorAction::Continue
    }

    async fn admit_batch(&self, messages: Vec<InboundEvent>) {
        for event in messages {
            let Some(transport) = self.ctx.session.current() else {
                tracing::warn!(message_id = %event.key.id, "no whatsapp session; dropping message");
                continue;
            };
            let unread = self.ctx.unread.get(event.chat_id());
            match admission::evaluate(transport.as_ref(), &self.ctx.cfg, &event, unread).await {
                AdmissionDecision::Accept => {}
                AdmissionDecision::Reject(reason) => {
                    tracing::debug!(
                        message_id = %event.key.id,
                        reason = reason.as_str(),
                        "message not admitted"
                    );
                    continue;
                }
            }

            self.record(&event).await;
            self.ctx.react(&event.key, ReactionState::Queued).await;
            let chat_id = event.chat_id().clone();
            self.queues.enqueue(chat_id, event);
        }
    }

    async fn record(&self, event: &InboundEvent) {
        let Some(store) = &self.store else {
            return;
        };
        let message = ReceivedMessage {
            id: event.key.id.to_string(),
            user_id: event.sender_phone().to_string(),
            platform: self.ctx.cfg.ai_api.platform.clone(),
            chat_id: event.chat_id().to_string(),
            message: received_text(event),
            received_at: event.received_at,
        };
        if let Err(e) = store.record_received(message).await {
            tracing::warn!(%e, "failed to record received message");
        }
    }
}

fn received_text(event: &InboundEvent) -> String {
    let body = event.body();
    if !body.is_empty() {
        return body.to_string();
    }
    event
        .caption()
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| format!("[{}]", event.content.label()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EdaConfig, QueueMode};
    use crate::dispatcher::Dispatcher;
    use crate::store::ReceivedQuery;
    use crate::supervisor::SessionHandle;
    use crate::test_support::{FakeConnector, FakeTransport, direct_text_event, group_text_event};
    use eda_ai::AiClient;
    use eda_channels::{ChatId, ChatUpdate, ConnectionUpdate, DisconnectReason};
    use std::time::Duration;

    const GROUP: &str = "120363025@g.us";
    const PHONE: &str = "5511999999999";

    struct Harness {
        gateway: Arc<BotGateway>,
        transport: Arc<FakeTransport>,
        connector: Arc<FakeConnector>,
        events_tx: mpsc::Sender<TransportEvent>,
        events_rx: mpsc::Receiver<TransportEvent>,
        shutdown: CancellationToken,
    }

    fn harness(cfg: EdaConfig, store: Option<MessageStore>) -> Harness {
        let transport = Arc::new(FakeTransport::new());
        let connector = Arc::new(FakeConnector::new(transport.clone(), 0));
        let session = SessionHandle::new();
        session.install(transport.clone());
        let (events_tx, events_rx) = mpsc::channel(16);
        // Reconnects get their own sender so dropping `events_tx` ends `run`.
        let (reconnect_tx, _) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let supervisor = ReconnectSupervisor::new(
            connector.clone(),
            session.clone(),
            reconnect_tx,
            Duration::from_millis(1),
            shutdown.clone(),
        );
        let ai = AiClient::new("http://127.0.0.1:9").expect("ai client");
        let ctx = Arc::new(BotContext::new(cfg, session, ai));
        let queues = ChatQueues::new(QueueMode::PerChat, Arc::new(Dispatcher::new(ctx.clone())));
        Harness {
            gateway: Arc::new(BotGateway::new(ctx, queues, supervisor, store)),
            transport,
            connector,
            events_tx,
            events_rx,
            shutdown,
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn rejected_event_does_not_stop_the_batch() {
        let h = harness(EdaConfig::default(), None);
        let done = EdaConfig::default().bot.reactions.done;

        h.events_tx
            .send(TransportEvent::MessagesUpsert {
                kind: UpsertKind::Notify,
                messages: vec![
                    group_text_event(GROUP, PHONE, "bom dia pessoal", 1),
                    direct_text_event(PHONE, "!ping", 2),
                ],
            })
            .await
            .expect("send");
        drop(h.events_tx);

        h.gateway.run(h.events_rx, h.shutdown.clone()).await;

        let transport = h.transport.clone();
        wait_for(move || transport.reactions().contains(&done)).await;
        assert_eq!(h.transport.texts(), vec!["*_pong!_*".to_string()]);
        let reactions = h.transport.reactions();
        assert_eq!(reactions.first(), Some(&EdaConfig::default().bot.reactions.queued));
    }

    #[tokio::test]
    async fn logout_ends_the_loop_without_reconnecting() {
        let h = harness(EdaConfig::default(), None);

        h.events_tx
            .send(TransportEvent::ConnectionUpdate(ConnectionUpdate::closed(
                DisconnectReason::LoggedOut,
            )))
            .await
            .expect("send");

        h.gateway.run(h.events_rx, h.shutdown.clone()).await;

        assert!(h.gateway.supervisor().session().current().is_none());
        assert_eq!(h.connector.attempts(), 0);
    }

    #[tokio::test]
    async fn append_is_ignored_and_creds_are_saved() {
        let h = harness(EdaConfig::default(), None);

        h.events_tx
            .send(TransportEvent::MessagesUpsert {
                kind: UpsertKind::Append,
                messages: vec![direct_text_event(PHONE, "!ping", 1)],
            })
            .await
            .expect("send");
        h.events_tx.send(TransportEvent::CredsUpdate).await.expect("send");
        drop(h.events_tx);

        h.gateway.run(h.events_rx, h.shutdown.clone()).await;

        assert!(h.transport.sent().is_empty());
        assert_eq!(h.transport.credential_saves(), 1);
    }

    #[tokio::test]
    async fn unread_counts_gate_admission() {
        let mut cfg = EdaConfig::default();
        cfg.bot.unread_threshold = 1;
        let h = harness(cfg, None);
        let chat = ChatId::new(format!("{PHONE}@s.whatsapp.net"));

        h.events_tx
            .send(TransportEvent::ChatsUpdate(vec![ChatUpdate {
                id: chat.clone(),
                unread_count: Some(4),
            }]))
            .await
            .expect("send");
        h.events_tx
            .send(TransportEvent::MessagesUpsert {
                kind: UpsertKind::Notify,
                messages: vec![direct_text_event(PHONE, "oi", 1)],
            })
            .await
            .expect("send");
        drop(h.events_tx);

        h.gateway.run(h.events_rx, h.shutdown.clone()).await;

        assert_eq!(h.transport.reads().len(), 1);
        assert!(h.transport.reactions().is_empty());
    }

    #[tokio::test]
    async fn accepted_messages_are_recorded() {
        let store = MessageStore::open_in_memory().expect("store");
        let h = harness(EdaConfig::default(), Some(store.clone()));

        h.events_tx
            .send(TransportEvent::MessagesUpsert {
                kind: UpsertKind::Notify,
                messages: vec![direct_text_event(PHONE, "!ping", 7)],
            })
            .await
            .expect("send");
        drop(h.events_tx);

        h.gateway.run(h.events_rx, h.shutdown.clone()).await;

        let received = store
            .list_received(ReceivedQuery::default())
            .await
            .expect("list");
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id, "in-7");
        assert_eq!(received[0].user_id, PHONE);
        assert_eq!(received[0].message, "!ping");
    }

    #[tokio::test]
    async fn transient_close_reconnects_and_keeps_running() {
        let h = harness(EdaConfig::default(), None);
        let gateway = h.gateway.clone();
        let shutdown = h.shutdown.clone();
        let events_rx = h.events_rx;
        let run = tokio::spawn(async move { gateway.run(events_rx, shutdown).await });

        h.events_tx
            .send(TransportEvent::ConnectionUpdate(ConnectionUpdate::closed(
                DisconnectReason::ConnectionLost,
            )))
            .await
            .expect("send");
        let connector = h.connector.clone();
        wait_for(move || connector.attempts() == 1).await;
        assert!(!run.is_finished());

        h.shutdown.cancel();
        run.await.expect("gateway task");
        assert!(h.gateway.supervisor().session().current().is_some());
    }
}
