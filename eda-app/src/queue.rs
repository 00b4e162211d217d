//! Per-chat FIFO queues and their drain tasks.

use crate::config::QueueMode;
use async_trait::async_trait;
use eda_channels::{ChatId, InboundEvent};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Fully handles one event. Failures are the handler's to report.
    async fn handle(&self, event: InboundEvent);
}

#[derive(Default)]
struct QueueState {
    queues: HashMap<ChatId, VecDeque<InboundEvent>>,
    draining: HashSet<ChatId>,
    shared_busy: bool,
}

#[derive(Clone)]
pub struct ChatQueues {
    mode: QueueMode,
    handler: Arc<dyn EventHandler>,
    state: Arc<Mutex<QueueState>>,
}

impl ChatQueues {
    pub fn new(mode: QueueMode, handler: Arc<dyn EventHandler>) -> Self {
        Self {
            mode,
            handler,
            state: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    /// Appends the event and starts a drain when the mode allows one.
    /// Returns the drain task when this call started it.
    pub fn enqueue(&self, chat_id: ChatId, event: InboundEvent) -> Option<JoinHandle<()>> {
        let start = {
            let mut state = lock(&self.state);
            state
                .queues
                .entry(chat_id.clone())
                .or_default()
                .push_back(event);
            match self.mode {
                QueueMode::PerChat => state.draining.insert(chat_id.clone()),
                QueueMode::SharedFlag => !std::mem::replace(&mut state.shared_busy, true),
            }
        };

        if !start {
            tracing::debug!(chat_id = %chat_id, mode = ?self.mode, "queued behind active drain");
            return None;
        }
        let queues = self.clone();
        Some(tokio::spawn(async move {
            queues.drain(chat_id).await;
        }))
    }

    #[tracing::instrument(level = "debug", skip_all, fields(chat_id = %chat_id))]
    async fn drain(&self, chat_id: ChatId) {
        let mut handled: usize = 0;
        while let Some(event) = self.next_or_finish(&chat_id) {
            let handler = self.handler.clone();
            let sequence = event.sequence;
            // A panicking handler must not leave the chat flagged as draining.
            if let Err(e) = tokio::spawn(async move { handler.handle(event).await }).await {
                tracing::error!(%e, sequence, "event handler panicked");
            }
            handled += 1;
        }
        tracing::debug!(handled, "chat queue drained");
    }

    /// Pops the next event. When the queue is empty, removes it and clears the
    /// drain flag under the same lock.
    fn next_or_finish(&self, chat_id: &ChatId) -> Option<InboundEvent> {
        let mut state = lock(&self.state);
        if let Some(event) = state.queues.get_mut(chat_id).and_then(VecDeque::pop_front) {
            return Some(event);
        }
        state.queues.remove(chat_id);
        match self.mode {
            QueueMode::PerChat => {
                state.draining.remove(chat_id);
            }
            QueueMode::SharedFlag => state.shared_busy = false,
        }
        None
    }

    pub fn pending(&self, chat_id: &ChatId) -> usize {
        lock(&self.state)
            .queues
            .get(chat_id)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn is_draining(&self, chat_id: &ChatId) -> bool {
        let state = lock(&self.state);
        match self.mode {
            QueueMode::PerChat => state.draining.contains(chat_id),
            QueueMode::SharedFlag => state.shared_busy && state.queues.contains_key(chat_id),
        }
    }
}

fn lock(state: &Mutex<QueueState>) -> MutexGuard<'_, QueueState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
