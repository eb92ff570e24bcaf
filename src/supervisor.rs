//! Session supervision.
//!
//! One supervisor task owns the read half of the current connection. It runs
//! the dispatch loop alongside the inactivity watchdog and the keep-alive
//! timer, and when any of them ends the connection it tears down the session
//! state, redials with backoff and restores presence and room membership.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::{ClientConfig, KeepAlive};
use crate::dispatcher::{Dispatcher, QueryRegistry};
use crate::error::{Error, Result};
use crate::history::HistoryAggregator;
use crate::negotiator::negotiate;
use crate::xmpp::dns::resolve_endpoints;
use crate::xmpp::{stanza, CloseHandle, ConnReader, ConnWriter, Connection};

/// Connection lifecycle notifications broadcast to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A lost connection was re-established and the session restored.
    Reconnected,
    /// Reconnection gave up; the event streams close after this.
    Disconnected { reason: String },
}

/// Current time as milliseconds since UNIX epoch (for activity tracking).
fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug)]
enum EndReason {
    ReadFailed(Error),
    WriteFailed(Error),
    LivenessTimeout,
    Shutdown,
}

/// Shared session state: the write half, the pending-reply registries and
/// what must be restored after a reconnect.
pub(crate) struct Session {
    pub(crate) config: ClientConfig,
    pub(crate) jid: String,
    writer: tokio::sync::Mutex<Option<ConnWriter>>,
    close: Mutex<Option<CloseHandle>>,
    pub(crate) queries: Arc<QueryRegistry>,
    pub(crate) history: Arc<HistoryAggregator>,
    presence: Mutex<Option<String>>,
    /// Rooms joined through the client, as `(room, nickname)` in join order.
    joined: Mutex<Vec<(String, String)>>,
    events: broadcast::Sender<SessionEvent>,
    shutdown: broadcast::Sender<()>,
    closed: AtomicBool,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Session {
    pub(crate) fn new(config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(16);
        let (shutdown, _) = broadcast::channel(1);
        Self {
            jid: config.jid(),
            config,
            writer: tokio::sync::Mutex::new(None),
            close: Mutex::new(None),
            queries: Arc::new(QueryRegistry::default()),
            history: Arc::new(HistoryAggregator::new()),
            presence: Mutex::new(None),
            joined: Mutex::new(Vec::new()),
            events,
            shutdown,
            closed: AtomicBool::new(false),
        }
    }

    /// Resolve, dial and negotiate a fresh connection, installing its write half.
    pub(crate) async fn establish(&self) -> Result<ConnReader> {
        let started = Instant::now();
        let endpoints = resolve_endpoints(self.config.server.as_deref(), &self.config.host).await;
        let conn = Connection::dial(&endpoints, self.config.connect_timeout, self.config.tls_insecure).await?;
        let conn = negotiate(conn, &self.config).await?;

        let (reader, writer) = conn.into_split();
        *locked(&self.close) = Some(writer.close_handle());
        *self.writer.lock().await = Some(writer);
        info!(
            jid = %self.jid,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Connection established"
        );
        Ok(reader)
    }

    /// Write one stanza. A failed write closes the connection so the
    /// supervisor notices and reconnects.
    pub(crate) async fn send(&self, data: &str) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::NotConnected)?;
        if let Err(e) = writer.send(data).await {
            warn!(error = %e, "Write failed, closing connection");
            writer.close_handle().close();
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn remember_presence(&self, show: &str) {
        *locked(&self.presence) = Some(show.to_string());
    }

    pub(crate) fn remember_join(&self, room: &str, nickname: &str) {
        let mut joined = locked(&self.joined);
        if !joined.iter().any(|(r, n)| r == room && n == nickname) {
            joined.push((room.to_string(), nickname.to_string()));
        }
    }

    pub(crate) fn forget_join(&self, room: &str, nickname: &str) {
        locked(&self.joined).retain(|(r, n)| !(r == room && n == nickname));
    }

    async fn keep_alive(&self) -> Result<()> {
        match &self.config.keep_alive {
            KeepAlive::Whitespace => self.send(stanza::KEEP_ALIVE).await,
            KeepAlive::Ping => self.send(&stanza::ping(&self.jid, &stanza::new_id())).await,
            KeepAlive::RoomRejoin { room, nickname } => {
                let to = format!("{}/{}", room, nickname);
                self.send(&stanza::muc_join(&stanza::new_id(), &to, &self.jid, 1)).await
            }
        }
    }

    /// Tear down the current connection and fail everything waiting on it.
    async fn drop_connection(&self) {
        if let Some(close) = locked(&self.close).take() {
            close.close();
        }
        self.writer.lock().await.take();
        self.queries.abort_all();
        self.history.abort();
    }

    /// Re-send presence and rejoin rooms on a fresh connection.
    async fn restore(&self) -> Result<()> {
        let presence = locked(&self.presence).clone();
        if let Some(show) = presence {
            self.send(&stanza::presence(&self.jid, &show)).await?;
        }
        let joined = locked(&self.joined).clone();
        for (room, nickname) in &joined {
            let to = format!("{}/{}", room, nickname);
            self.send(&stanza::muc_join(&stanza::new_id(), &to, &self.jid, 0)).await?;
        }
        debug!(rooms = joined.len(), "Session restored");
        Ok(())
    }

    /// Close the session for good: end the stream and stop the supervisor.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(jid = %self.jid, "Closing session");
        // Take the writer before waking the supervisor, which would drop it.
        let writer = self.writer.lock().await.take();
        let _ = self.shutdown.send(());
        if let Some(close) = locked(&self.close).take() {
            close.close();
        }
        if let Some(writer) = writer {
            writer.shutdown().await;
        }
        self.queries.abort_all();
        self.history.abort();
    }
}

/// Supervisor task body. Runs until the session is closed or reconnection
/// gives up; dropping the dispatcher on exit closes the event streams.
pub(crate) async fn run(session: Arc<Session>, mut reader: ConnReader, mut dispatcher: Dispatcher) {
    let mut shutdown = session.shutdown.subscribe();
    let mut connection = 1u64;

    loop {
        let started = Instant::now();
        let reason = serve(&session, reader, &mut dispatcher, &mut shutdown).await;
        session.drop_connection().await;

        if session.is_closed() || matches!(reason, EndReason::Shutdown) {
            info!(connection, "Supervisor stopped");
            break;
        }
        warn!(
            connection,
            reason = ?reason,
            duration_ms = started.elapsed().as_millis() as u64,
            "Connection lost"
        );

        match reconnect(&session, &mut shutdown).await {
            Ok(new_reader) => {
                reader = new_reader;
                connection += 1;
                if let Err(e) = session.restore().await {
                    warn!(error = %e, "Session restore failed");
                }
                info!(connection, "Reconnected");
                let _ = session.events.send(SessionEvent::Reconnected);
            }
            Err(e) => {
                if !session.is_closed() {
                    error!(error = %e, "Giving up on reconnection");
                    let _ = session.events.send(SessionEvent::Disconnected {
                        reason: e.to_string(),
                    });
                }
                break;
            }
        }
    }
}

/// Drive one connection until it fails, goes silent or is shut down.
async fn serve(
    session: &Session,
    mut reader: ConnReader,
    dispatcher: &mut Dispatcher,
    shutdown: &mut broadcast::Receiver<()>,
) -> EndReason {
    let last_activity = AtomicU64::new(now_millis());
    // Set while an element is handed to a consumer that may apply backpressure.
    let dispatching = AtomicBool::new(false);
    let config = &session.config;

    let read_loop = async {
        loop {
            match reader.next_element().await {
                Ok(element) => {
                    last_activity.store(now_millis(), Ordering::Relaxed);
                    debug!(name = element.name(), "<<");
                    dispatching.store(true, Ordering::Relaxed);
                    dispatcher.dispatch(&element).await;
                    dispatching.store(false, Ordering::Relaxed);
                    last_activity.store(now_millis(), Ordering::Relaxed);
                }
                Err(e) => return EndReason::ReadFailed(e),
            }
        }
    };

    let watchdog = async {
        loop {
            tokio::time::sleep(config.watchdog_interval).await;
            if dispatching.load(Ordering::Relaxed) {
                continue;
            }
            let last = last_activity.load(Ordering::Relaxed);
            let elapsed_ms = now_millis().saturating_sub(last);
            if elapsed_ms > config.liveness_timeout.as_millis() as u64 {
                warn!(
                    elapsed_secs = elapsed_ms / 1000,
                    timeout_secs = config.liveness_timeout.as_secs(),
                    "Inactivity watchdog triggered, closing connection"
                );
                break;
            }
        }
    };

    let keep_alive = async {
        loop {
            tokio::time::sleep(config.keep_alive_interval).await;
            if let Err(e) = session.keep_alive().await {
                return EndReason::WriteFailed(e);
            }
        }
    };

    tokio::select! {
        reason = read_loop => reason,
        reason = keep_alive => reason,
        _ = watchdog => EndReason::LivenessTimeout,
        _ = shutdown.recv() => EndReason::Shutdown,
    }
}

/// Redial with backoff until a connection is negotiated, the policy gives
/// up, a non-retryable error occurs or the session is closed.
async fn reconnect(session: &Session, shutdown: &mut broadcast::Receiver<()>) -> Result<ConnReader> {
    let policy = &session.config.reconnect;
    let mut attempt = 0u32;
    let mut last_error = String::from("connection lost");

    loop {
        attempt += 1;
        if !policy.allows(attempt) {
            return Err(Error::ReconnectExhausted {
                attempts: attempt - 1,
                last: last_error,
            });
        }

        let delay = policy.delay_for(attempt);
        info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.recv() => return Err(Error::ConnectionClosed),
        }
        if session.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let result = tokio::select! {
            result = session.establish() => result,
            _ = shutdown.recv() => return Err(Error::ConnectionClosed),
        };
        match result {
            Ok(reader) => return Ok(reader),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                warn!(attempt, error = %e, "Reconnect attempt failed");
                last_error = e.to_string();
            }
        }
    }
}
