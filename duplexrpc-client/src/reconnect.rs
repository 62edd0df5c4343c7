//! Generic reconnection state machine.
//!
//! [`ReconnectingClient`] wraps anything that can establish a connection
//! (a [`Connector`]) and maintains it: failed attempts are retried on a
//! fixed delay until a bounded budget of reconnects is exhausted, and the
//! budget refills after every successful connect.

use duplexrpc_core::Reply;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};

pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Retry budget of a [`ReconnectingClient`].
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Amount of failing reconnects before no further reconnects are
    /// attempted. The connector is invoked at most `max_reconnects + 1`
    /// times per connect cycle; the budget resets once a connection is
    /// established successfully.
    pub max_reconnects: u32,
    /// Delay between successive reconnect attempts.
    pub reconnect_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            max_reconnects: u32::MAX,
            reconnect_timeout: DEFAULT_RECONNECT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Establishes one connection attempt to a remote service.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> impl Future<Output = Reply<()>> + Send;
}

struct State {
    connection: ConnectionState,
    reconnect_counter: u32,
    waiters: Vec<oneshot::Sender<Reply<()>>>,
    exceeded_listeners: Vec<Box<dyn FnMut(&Reply<()>) + Send>>,
}

struct Shared {
    state: Mutex<State>,
    connected_events: broadcast::Sender<()>,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A connection that re-establishes itself.
///
/// Clones share the same underlying connection state.
pub struct ReconnectingClient<C> {
    connector: Arc<C>,
    config: ReconnectConfig,
    shared: Arc<Shared>,
}

impl<C> Clone for ReconnectingClient<C> {
    fn clone(&self) -> Self {
        ReconnectingClient {
            connector: self.connector.clone(),
            config: self.config.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<C: Connector> ReconnectingClient<C> {
    pub fn new(connector: C, config: ReconnectConfig) -> Self {
        let (connected_events, _) = broadcast::channel(16);
        ReconnectingClient {
            connector: Arc::new(connector),
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    connection: ConnectionState::Disconnected,
                    reconnect_counter: 0,
                    waiters: Vec::new(),
                    exceeded_listeners: Vec::new(),
                }),
                connected_events,
            }),
        }
    }

    /// Connects to the remote service, retrying within the configured
    /// budget. Idempotent: while a connect cycle is in progress (or the
    /// connection is already up) no second cycle is started; callers share
    /// the pending outcome.
    pub async fn connect(&self) -> Reply<()> {
        let rx = {
            let mut state = self.shared.lock_state();
            match state.connection {
                ConnectionState::Connected => return Reply::ok_empty(),
                ConnectionState::Connecting => enqueue_waiter(&mut state),
                ConnectionState::Disconnected => {
                    state.connection = ConnectionState::Connecting;
                    let rx = enqueue_waiter(&mut state);
                    self.spawn_connect_loop();
                    rx
                }
            }
        };
        await_waiter(rx).await
    }

    /// Resolves once the connection is up. Unlike [`connect`], this never
    /// starts a connect cycle of its own.
    ///
    /// [`connect`]: ReconnectingClient::connect
    pub async fn resolve_when_connected(&self) -> Reply<()> {
        let rx = {
            let mut state = self.shared.lock_state();
            if state.connection == ConnectionState::Connected {
                return Reply::ok_empty();
            }
            enqueue_waiter(&mut state)
        };
        await_waiter(rx).await
    }

    /// Must be called whenever the underlying connection is lost. Re-enters
    /// the connect cycle (unless one is already in progress).
    pub async fn on_disconnect(&self, reason: &Reply<()>) -> Reply<()> {
        let was_connecting = {
            let mut state = self.shared.lock_state();
            let was_connecting = state.connection == ConnectionState::Connecting;
            if !was_connecting {
                state.connection = ConnectionState::Disconnected;
            }
            was_connecting
        };
        if !was_connecting {
            reason.log();
            tracing::warn!("connection lost, starting to reconnect");
        }
        self.connect().await
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock_state().connection
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Registers a listener invoked once per connect cycle that exhausts
    /// its reconnect budget, with the last connection failure.
    pub fn on_reconnects_exceeded(&self, listener: impl FnMut(&Reply<()>) + Send + 'static) {
        self.shared
            .lock_state()
            .exceeded_listeners
            .push(Box::new(listener));
    }

    /// Fires after every successful connect, including the first.
    pub fn subscribe_connected(&self) -> broadcast::Receiver<()> {
        self.shared.connected_events.subscribe()
    }

    fn spawn_connect_loop(&self) {
        let connector = self.connector.clone();
        let config = self.config.clone();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            run_connect_loop(connector, config, shared).await;
        });
    }
}

fn enqueue_waiter(state: &mut State) -> oneshot::Receiver<Reply<()>> {
    let (tx, rx) = oneshot::channel();
    state.waiters.push(tx);
    rx
}

async fn await_waiter(rx: oneshot::Receiver<Reply<()>>) -> Reply<()> {
    rx.await
        .unwrap_or_else(|_| Reply::err("The connection task was dropped."))
}

async fn run_connect_loop<C: Connector>(
    connector: Arc<C>,
    config: ReconnectConfig,
    shared: Arc<Shared>,
) {
    let mut status = connector.connect().await;
    while status.is_err() {
        let attempts_left = {
            let mut state = shared.lock_state();
            if state.reconnect_counter >= config.max_reconnects {
                state.connection = ConnectionState::Disconnected;
                for listener in &mut state.exceeded_listeners {
                    listener(&status);
                }
                let waiters = std::mem::take(&mut state.waiters);
                drop(state);
                for waiter in waiters {
                    let _ = waiter.send(status.clone());
                }
                return;
            }
            state.reconnect_counter += 1;
            config.max_reconnects - state.reconnect_counter
        };
        status.log();
        tracing::info!(attempts_left, "reconnecting to the remote service");
        tokio::time::sleep(config.reconnect_timeout).await;
        status = connector.connect().await;
    }

    let waiters = {
        let mut state = shared.lock_state();
        state.connection = ConnectionState::Connected;
        state.reconnect_counter = 0;
        std::mem::take(&mut state.waiters)
    };
    tracing::info!("connection to the remote service established");
    for waiter in waiters {
        let _ = waiter.send(Reply::ok_empty());
    }
    let _ = shared.connected_events.send(());
}

// =============================================================================
// Tests
// =============================================================================
