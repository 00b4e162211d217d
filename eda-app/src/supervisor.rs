//! Transport session ownership and reconnects.

use anyhow::{Result, anyhow};
use arc_swap::ArcSwapOption;
use eda_channels::{ConnectionState, ConnectionUpdate, Transport, TransportConnector, TransportEvent};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct ActiveSession {
    transport: Arc<dyn Transport>,
    generation: u64,
}

/// The live transport. Read it at each use; a reconnect swaps it underneath.
#[derive(Clone)]
pub struct SessionHandle {
    active: Arc<ArcSwapOption<ActiveSession>>,
    generations: Arc<AtomicU64>,
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHandle {
    pub fn new() -> Self {
        Self {
            active: Arc::new(ArcSwapOption::empty()),
            generations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Installs a session and returns its generation. The replaced session is closed.
    pub fn install(&self, transport: Arc<dyn Transport>) -> u64 {
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self.active.swap(Some(Arc::new(ActiveSession {
            transport,
            generation,
        })));
        close_session(previous);
        generation
    }

    /// Drops and closes the installed session, so its events stop arriving.
    pub fn clear(&self) {
        close_session(self.active.swap(None));
    }

    pub fn current(&self) -> Option<Arc<dyn Transport>> {
        self.active
            .load_full()
            .map(|session| session.transport.clone())
    }

    pub fn require(&self) -> Result<Arc<dyn Transport>> {
        self.current()
            .ok_or_else(|| anyhow!("whatsapp session is not connected"))
    }

    /// Generation of the installed session, 0 when none is installed.
    pub fn generation(&self) -> u64 {
        self.active
            .load_full()
            .map(|session| session.generation)
            .unwrap_or(0)
    }
}

fn close_session(session: Option<Arc<ActiveSession>>) {
    if let Some(session) = session {
        tracing::debug!(generation = session.generation, "closing whatsapp session");
        session.transport.close();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorAction {
    Continue,
    Stop,
}

pub struct ReconnectSupervisor {
    connector: Arc<dyn TransportConnector>,
    session: SessionHandle,
    events_tx: mpsc::Sender<TransportEvent>,
    delay: Duration,
    shutdown: CancellationToken,
}

impl ReconnectSupervisor {
    pub fn new(
        connector: Arc<dyn TransportConnector>,
        session: SessionHandle,
        events_tx: mpsc::Sender<TransportEvent>,
        delay: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            connector,
            session,
            events_tx,
            delay,
            shutdown,
        }
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Retries forever at a fixed delay. Errors only when shutdown cancels it.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn connect_until_ready(&self) -> Result<()> {
        let mut attempt: u64 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                return Err(anyhow!("shutdown requested before transport connected"));
            }
            attempt += 1;
            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Err(anyhow!("shutdown requested before transport connected"));
                }
                result = self.connector.connect(self.events_tx.clone()) => result,
            };
            match connected {
                Ok(transport) => {
                    let generation = self.session.install(transport);
                    tracing::info!(attempt, generation, "whatsapp transport connected");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        %e,
                        attempt,
                        retry_in_seconds = self.delay.as_secs_f64(),
                        "whatsapp transport connect failed; retrying"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            return Err(anyhow!("shutdown requested before transport connected"));
                        }
                        _ = tokio::time::sleep(self.delay) => {}
                    }
                }
            }
        }
    }

    pub async fn on_connection_update(&self, update: &ConnectionUpdate) -> SupervisorAction {
        match update.state {
            ConnectionState::Open => {
                tracing::info!(generation = self.session.generation(), "whatsapp connection open");
                SupervisorAction::Continue
            }
            ConnectionState::Connecting => SupervisorAction::Continue,
            ConnectionState::Close if update.is_logout() => {
                tracing::error!("whatsapp session logged out; not reconnecting");
                self.session.clear();
                SupervisorAction::Stop
            }
            ConnectionState::Close => {
                tracing::warn!(reason = ?update.reason, "whatsapp connection closed; reconnecting");
                self.session.clear();
                match self.connect_until_ready().await {
                    Ok(()) => SupervisorAction::Continue,
                    Err(e) => {
                        tracing::info!(%e, "reconnect abandoned");
                        SupervisorAction::Stop
                    }
                }
            }
        }
    }
}
