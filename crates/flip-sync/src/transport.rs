//! Push-channel connection service.
//!
//! One `SyncService` owns at most one WebSocket at a time. `start()` spawns
//! the connection task; the task connects, dispatches inbound frames in
//! receipt order, and reconnects with backoff after any unexpected loss.
//! `stop()` cancels the task wherever it is: mid-connect, mid-read, or
//! sleeping before a retry.

use crate::config::SyncConfig;
use crate::dispatch::EventDispatcher;
use flip_core::SyncEvent;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

/// Why a physical connection ended. Logged, never returned to callers.
#[derive(Debug, Error)]
enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("socket closed by server")]
    ClosedByServer,
    #[error("socket read failed: {0}")]
    Read(String),
    #[error("socket stream ended")]
    StreamEnded,
}

enum ReadOutcome {
    Shutdown,
    Lost(TransportError),
}

struct RunHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Control {
    generation: u64,
    run: Option<RunHandle>,
    /// Task of the last stopped run, possibly still closing its socket.
    retired: Option<JoinHandle<()>>,
}

struct Shared {
    control: Mutex<Control>,
    state: watch::Sender<ConnectionState>,
    retry_count: AtomicU32,
}

impl Shared {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write state only while `generation` is still the active run. Returns
    /// `false` when the run has been superseded by `stop()` or a new `start()`.
    fn set_state(&self, generation: u64, state: ConnectionState) -> bool {
        let control = self.control();
        if control.generation != generation || control.run.is_none() {
            return false;
        }
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        true
    }

    /// Record a failed attempt and move to `Reconnecting`, unless the run
    /// has been superseded.
    fn mark_retry(&self, generation: u64, attempt: u32) -> bool {
        let control = self.control();
        if control.generation != generation || control.run.is_none() {
            return false;
        }
        self.retry_count.store(attempt, Ordering::SeqCst);
        self.state.send_if_modified(|current| {
            if *current == ConnectionState::Reconnecting {
                return false;
            }
            *current = ConnectionState::Reconnecting;
            true
        });
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        let control = self.control();
        control.generation == generation && control.run.is_some()
    }
}

pub struct SyncService {
    config: SyncConfig,
    dispatcher: EventDispatcher,
    shared: Arc<Shared>,
}

impl SyncService {
    pub fn new(config: SyncConfig, dispatcher: EventDispatcher) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            dispatcher,
            shared: Arc::new(Shared {
                control: Mutex::new(Control {
                    generation: 0,
                    run: None,
                    retired: None,
                }),
                state,
                retry_count: AtomicU32::new(0),
            }),
        }
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn retry_count(&self) -> u32 {
        self.shared.retry_count.load(Ordering::SeqCst)
    }

    /// Receiver for a reconnection indicator; sees every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Open the push channel. No-op while a connection task is running.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut control = self.shared.control();
        if let Some(run) = control.run.as_ref() {
            if !run.task.is_finished() {
                debug!(event = "sync_start_ignored", state = self.state().as_str());
                return;
            }
        }

        // A stopped run may still be in its close handshake; never let it
        // overlap the new socket.
        if let Some(retired) = control.retired.take() {
            retired.abort();
        }
        control.generation += 1;
        let generation = control.generation;
        self.shared.retry_count.store(0, Ordering::SeqCst);
        self.shared.state.send_replace(ConnectionState::Connecting);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let ctx = RunContext {
            generation,
            config: self.config.clone(),
            dispatcher: self.dispatcher.clone(),
            shared: self.shared.clone(),
        };
        let task = tokio::spawn(run_connection(ctx, shutdown_rx));
        control.run = Some(RunHandle { shutdown, task });
        info!(event = "sync_started", endpoint = %self.config.endpoint, generation);
    }

    /// Close the push channel and cancel any scheduled reconnection.
    /// Emits `disconnect` when a live connection was torn down. The old task
    /// finishes its close handshake in the background; a following `start()`
    /// aborts it first.
    pub fn stop(&self) {
        let was_connected = {
            let mut control = self.shared.control();
            let Some(run) = control.run.take() else {
                return;
            };
            control.generation += 1;
            run.shutdown.send_replace(true);
            control.retired = Some(run.task);
            self.shared.retry_count.store(0, Ordering::SeqCst);
            let previous = self.shared.state.send_replace(ConnectionState::Disconnected);
            previous == ConnectionState::Connected
        };
        info!(event = "sync_stopped", was_connected);
        if was_connected {
            self.dispatcher.emit(&SyncEvent::Disconnected);
        }
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        let mut control = self.shared.control();
        if let Some(run) = control.run.take() {
            control.generation += 1;
            run.shutdown.send_replace(true);
        }
    }
}

struct RunContext {
    generation: u64,
    config: SyncConfig,
    dispatcher: EventDispatcher,
    shared: Arc<Shared>,
}

impl RunContext {
    fn emit(&self, event: &SyncEvent) {
        if self.shared.is_current(self.generation) {
            self.dispatcher.emit(event);
        }
    }
}

async fn run_connection(ctx: RunContext, mut shutdown: watch::Receiver<bool>) {
    let endpoint = ctx.config.endpoint.to_string();
    let mut attempt: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let connect = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => break,
            result = connect_async(endpoint.as_str()) => result,
        };

        let (lost, was_connected) = match connect {
            Ok((mut ws, _)) => {
                attempt = 0;
                if !ctx.shared.set_state(ctx.generation, ConnectionState::Connected) {
                    let _ = ws.close(None).await;
                    break;
                }
                ctx.shared.retry_count.store(0, Ordering::SeqCst);
                info!(event = "sync_connected", endpoint = %endpoint);
                ctx.emit(&SyncEvent::Connected);

                let outcome = loop {
                    tokio::select! {
                        biased;
                        _ = wait_for_shutdown(&mut shutdown) => break ReadOutcome::Shutdown,
                        next = ws.next() => match next {
                            Some(Ok(Message::Text(text))) => {
                                ctx.dispatcher.dispatch_frame(&text, ctx.config.max_frame_bytes);
                            }
                            Some(Ok(Message::Close(_))) => {
                                break ReadOutcome::Lost(TransportError::ClosedByServer);
                            }
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                break ReadOutcome::Lost(TransportError::Read(err.to_string()));
                            }
                            None => break ReadOutcome::Lost(TransportError::StreamEnded),
                        },
                    }
                };
                let _ = ws.close(None).await;

                match outcome {
                    ReadOutcome::Shutdown => break,
                    ReadOutcome::Lost(err) => (err, true),
                }
            }
            Err(err) => (TransportError::Connect(err.to_string()), false),
        };

        attempt = attempt.saturating_add(1);
        if !ctx.shared.mark_retry(ctx.generation, attempt) {
            break;
        }
        if was_connected {
            ctx.emit(&SyncEvent::Disconnected);
        }
        let delay = ctx.config.backoff.delay_for_attempt(attempt - 1);
        warn!(
            event = "sync_connection_lost",
            error = %lost,
            attempt,
            retry_in_ms = delay.as_millis() as u64
        );

        tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!(event = "sync_task_exit", generation = ctx.generation);
}

/// Resolves once shutdown is requested or the service is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
