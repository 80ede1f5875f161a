use crate::handle::Handle;
use girder_sync::{Gate, Latch};
use girder_util::{Backoff, RetryError, TimeoutError, retry, within};
use lapin::{Channel, Connection, ConnectionProperties, Error as LapinError};
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc};
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 64;

/// Owns the named transport connections of a bus.
///
/// Connections are created lazily per name, guarded against duplicate opens
/// (a create that finds another create for the same name in flight awaits its
/// one-shot gate instead of racing a second transport open), and recovered
/// automatically when the transport drops — unless the context was detached
/// by an explicit [`close`](ConnectionManager::close) or
/// [`remove`](ConnectionManager::remove).
///
/// Lifecycle transitions are re-emitted as [`ConnectionEvent`]s; in
/// particular, exceeding the reconnect retry budget is reported via
/// [`RecoveryFailed`](ConnectionEvent::RecoveryFailed), since no synchronous
/// caller awaits a recovery.
///
/// Must be created inside a Tokio runtime: recovery runs on a background
/// task.
pub struct ConnectionManager {
    contexts: SyncMutex<HashMap<String, Arc<ConnectionContext>>>,
    policy: ConnectPolicy,
    events: broadcast::Sender<ConnectionEvent>,
    losses: mpsc::UnboundedSender<Arc<str>>,
}

/// The per-name connection state: the exclusively owned transport connection
/// plus the bookkeeping that guards (re)establishment.
pub struct ConnectionContext {
    name: Arc<str>,
    handle: Handle,
    connection: AsyncMutex<Option<Connection>>,
    lock: AtomicBool,
    latch: SyncMutex<Latch>,
    detached: AtomicBool,
    recovery_started: SyncMutex<Option<Instant>>,
}

/// Announces a connection lifecycle transition.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A connection was established for the first time.
    Created {
        /// The connection context name.
        name: Arc<str>,
    },
    /// The transport connection dropped or was explicitly closed.
    Closed {
        /// The connection context name.
        name: Arc<str>,
    },
    /// A dropped connection was re-established.
    Recovered {
        /// The connection context name.
        name: Arc<str>,
    },
    /// Re-establishing a dropped connection exceeded the retry budget; the
    /// context was discarded.
    RecoveryFailed {
        /// The connection context name.
        name: Arc<str>,
    },
    /// The context was removed.
    Removed {
        /// The connection context name.
        name: Arc<str>,
    },
}

/// Represents a failure of a single connection attempt.
#[derive(Error, Debug)]
pub enum EstablishError {
    /// The attempt did not settle within the handle's timeout.
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// The transport refused the attempt.
    #[error(transparent)]
    Transport(#[from] LapinError),
}

/// Represents a failure to produce a live connection context.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The bounded retrying of connection attempts failed.
    #[error(transparent)]
    Retry(#[from] RetryError<EstablishError>),

    /// An in-flight creation by another caller did not settle within the
    /// handle's recovery window.
    #[error("creation of connection '{name}' did not settle within its recovery window")]
    CreationStalled {
        /// The connection context name.
        name: String,
    },
}

/// Represents a failure to open a channel on a connection context.
#[derive(Error, Debug)]
pub enum OpenChannelError {
    /// The context holds no live connection.
    #[error("no live connection on context '{name}'")]
    NoConnection {
        /// The connection context name.
        name: String,
    },

    /// The transport refused to open a channel.
    #[error(transparent)]
    Transport(#[from] LapinError),
}

/// Decides which connection errors are worth retrying.
///
/// The default policy refuses to spend the retry budget on unresolvable-host
/// failures (no amount of retrying fixes a typo in the host name) and retries
/// everything else, timeouts included. Inject a custom predicate through
/// [`ConnectionManager::with_policy`] to change that judgement.
#[derive(Clone)]
pub struct ConnectPolicy {
    retryable: Arc<dyn Fn(&EstablishError) -> bool + Send + Sync>,
}

impl ConnectPolicy {
    /// Creates a policy from the given predicate.
    pub fn new(retryable: impl Fn(&EstablishError) -> bool + Send + Sync + 'static) -> Self {
        Self {
            retryable: Arc::new(retryable),
        }
    }

    /// Judges whether the given establishment error is worth retrying.
    pub fn retryable(&self, error: &EstablishError) -> bool {
        (self.retryable)(error)
    }
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self::new(|error| match error {
            EstablishError::Timeout(_) => true,
            EstablishError::Transport(transport) => !is_unresolvable_host(transport),
        })
    }
}

/// Recognizes the I/O error raised when the broker host name cannot be
/// resolved.
fn is_unresolvable_host(error: &LapinError) -> bool {
    match error {
        LapinError::IOError(io) => io.to_string().contains("failed to lookup address"),
        _ => false,
    }
}

impl ConnectionContext {
    pub(crate) fn new(name: &str, handle: Handle) -> Self {
        // The creator starts out holding the lock
        Self {
            name: Arc::from(name),
            handle,
            connection: AsyncMutex::new(None),
            lock: AtomicBool::new(true),
            latch: SyncMutex::new(Latch::new()),
            detached: AtomicBool::new(false),
            recovery_started: SyncMutex::new(None),
        }
    }

    /// Reports the context name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Exposes the handle this context connects with.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Reports whether a (re)establishment is currently in flight.
    pub fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Acquire)
    }

    /// Reports whether the context currently holds a live connection.
    pub async fn is_open(&self) -> bool {
        self.connection
            .lock()
            .await
            .as_ref()
            .is_some_and(|connection| connection.status().connected())
    }

    /// Opens a fresh channel on the live connection of this context.
    pub(crate) async fn open_channel(&self) -> Result<Channel, OpenChannelError> {
        let guard = self.connection.lock().await;

        match guard.as_ref() {
            Some(connection) if connection.status().connected() => {
                Ok(connection.create_channel().await?)
            }
            _ => Err(OpenChannelError::NoConnection {
                name: self.name.to_string(),
            }),
        }
    }

    fn name_arc(&self) -> Arc<str> {
        self.name.clone()
    }

    /// Tries to become the (re)establisher of this context. On success, arms
    /// a fresh latch for the waiters that arrive during the establishment.
    fn try_acquire_lock(&self) -> bool {
        let acquired = self
            .lock
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if acquired {
            *self.latch.lock() = Latch::new();
        }

        acquired
    }

    /// Releases the establishment lock and wakes all waiters.
    fn release_lock(&self) {
        self.lock.store(false, Ordering::Release);
        self.latch.lock().open();
    }

    /// Derives a gate onto the currently armed latch.
    fn gate(&self) -> Gate {
        self.latch.lock().gate()
    }

    fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    fn reattach(&self) {
        self.detached.store(false, Ordering::Release);
    }

    fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }
}

/// The role a `create` call assumes after inspecting the context map.
enum CreateRole {
    /// The context is brand new; this caller establishes the connection.
    Establisher(Arc<ConnectionContext>),
    /// Another caller is establishing; await its gate and re-check.
    Waiter(Arc<ConnectionContext>),
    /// A context exists and nobody holds the lock; inspect its connection.
    Inspector(Arc<ConnectionContext>),
}

impl ConnectionManager {
    /// Creates a manager with the default [`ConnectPolicy`].
    pub fn new() -> Arc<Self> {
        Self::with_policy(ConnectPolicy::default())
    }

    /// Creates a manager with the given [`ConnectPolicy`].
    pub fn with_policy(policy: ConnectPolicy) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (losses, loss_feed) = mpsc::unbounded_channel();

        let manager = Arc::new(Self {
            contexts: SyncMutex::new(HashMap::new()),
            policy,
            events,
            losses,
        });

        tokio::spawn(Self::watch_losses(Arc::downgrade(&manager), loss_feed));

        manager
    }

    /// Returns a receiver of [`ConnectionEvent`]s.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Produces the connection context for the given name, establishing the
    /// transport connection if necessary.
    ///
    /// Idempotent: an existing open context is returned as-is, and while
    /// another create for the same name is in flight, this call waits for its
    /// outcome (bounded by the handle's recovery window) rather than racing a
    /// duplicate open.
    pub async fn create(
        &self,
        name: &str,
        handle: &Handle,
    ) -> Result<Arc<ConnectionContext>, ConnectionError> {
        loop {
            let role = {
                let mut contexts = self.contexts.lock();

                match contexts.get(name) {
                    Some(context) if context.is_locked() => CreateRole::Waiter(context.clone()),
                    Some(context) => CreateRole::Inspector(context.clone()),
                    None => {
                        let context = Arc::new(ConnectionContext::new(name, handle.clone()));
                        contexts.insert(name.to_string(), context.clone());

                        CreateRole::Establisher(context)
                    }
                }
            };

            match role {
                CreateRole::Establisher(context) => {
                    self.establish(&context, ConnectionEvent::Created {
                        name: context.name_arc(),
                    })
                    .await?;

                    return Ok(context);
                }

                CreateRole::Waiter(context) => {
                    let gate = context.gate();
                    let window = context.handle().recovery_window();

                    if within(window, gate.passed()).await.is_err() {
                        return Err(ConnectionError::CreationStalled {
                            name: name.to_string(),
                        });
                    }

                    // The in-flight creation settled one way or the other;
                    // re-inspect from scratch.
                }

                CreateRole::Inspector(context) => {
                    if context.is_open().await {
                        return Ok(context);
                    }

                    // The context exists but holds no live connection (e.g.,
                    // explicitly closed earlier). Take over establishment,
                    // unless somebody else just did.
                    if context.try_acquire_lock() {
                        context.reattach();
                        self.establish(&context, ConnectionEvent::Recovered {
                            name: context.name_arc(),
                        })
                        .await?;

                        return Ok(context);
                    }
                }
            }
        }
    }

    /// Detaches and closes the live connection of the given context, which
    /// prevents an immediate auto-recreate. The context itself is retained;
    /// a later `create` for the same name re-opens the transport. No-op if
    /// the name is unknown.
    pub async fn close(&self, name: &str) {
        let Some(context) = self.get(name) else {
            return;
        };

        context.detach();

        let connection = context.connection.lock().await.take();
        if let Some(connection) = connection {
            Self::close_connection(&context.name, connection).await;
        }

        let _ = self.events.send(ConnectionEvent::Closed {
            name: context.name_arc(),
        });
    }

    /// Closes and deletes the given context, emitting
    /// [`Removed`](ConnectionEvent::Removed). No-op if the name is unknown.
    pub async fn remove(&self, name: &str) {
        let Some(context) = self.contexts.lock().remove(name) else {
            return;
        };

        context.detach();

        let connection = context.connection.lock().await.take();
        if let Some(connection) = connection {
            Self::close_connection(&context.name, connection).await;
        }

        let _ = self.events.send(ConnectionEvent::Removed {
            name: context.name_arc(),
        });
    }

    /// Retrieves the context under the given name, if present.
    pub fn get(&self, name: &str) -> Option<Arc<ConnectionContext>> {
        self.contexts.lock().get(name).cloned()
    }

    /// Reports whether a context exists under the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.contexts.lock().contains_key(name)
    }

    /// Lists the names of all current contexts.
    pub fn names(&self) -> Vec<String> {
        self.contexts.lock().keys().cloned().collect()
    }

    /// Reports whether every context is either open or still inside its
    /// configured recovery window. Returns `false` once any context's window
    /// elapsed without a connection.
    pub async fn healthy(&self) -> bool {
        let contexts: Vec<_> = self.contexts.lock().values().cloned().collect();

        for context in contexts {
            if context.is_open().await {
                continue;
            }

            // A deliberately closed context is not waiting for a connection
            if context.is_detached() {
                continue;
            }

            if context.is_locked() {
                let within_window = match *context.recovery_started.lock() {
                    // Initial creation: bounded by its own retry budget
                    None => true,
                    Some(started) => started.elapsed() <= context.handle().recovery_window(),
                };

                if within_window {
                    continue;
                }
            }

            return false;
        }

        true
    }
}

impl ConnectionManager {
    /// Runs the bounded retrying of connection attempts for a context whose
    /// lock this caller holds, and adopts the result. On failure, the context
    /// is discarded so a later `create` starts clean.
    async fn establish(
        &self,
        context: &Arc<ConnectionContext>,
        event: ConnectionEvent,
    ) -> Result<(), ConnectionError> {
        match self.establish_transport(context.handle()).await {
            Ok(connection) => {
                self.adopt(context, connection, event).await;

                Ok(())
            }
            Err(error) => {
                warn!(
                    name = context.name(),
                    identifier = context.handle().identifier(),
                    ?error,
                    error_message = %error,
                    "Failed to establish a broker connection",
                );

                self.contexts.lock().remove(context.name());
                context.release_lock();

                Err(ConnectionError::Retry(error))
            }
        }
    }

    /// Performs the actual bounded, backed-off connection attempts.
    async fn establish_transport(
        &self,
        handle: &Handle,
    ) -> Result<Connection, RetryError<EstablishError>> {
        let backoff = Backoff::new(handle.backoff());
        let policy = self.policy.clone();

        retry(
            handle.retry_count(),
            &backoff,
            move |error| policy.retryable(error),
            || async {
                let connection = within(handle.timeout(), Self::open_transport(handle)).await??;

                Ok::<Connection, EstablishError>(connection)
            },
        )
        .await
    }

    /// Opens a single transport connection on the current Tokio runtime.
    async fn open_transport(handle: &Handle) -> Result<Connection, LapinError> {
        let properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);

        Connection::connect(handle.dsn().unsecure(), properties).await
    }

    /// Wires the transport-loss callback onto the fresh connection, stores it
    /// on the context, wakes the waiters, and emits the given event.
    async fn adopt(
        &self,
        context: &Arc<ConnectionContext>,
        connection: Connection,
        event: ConnectionEvent,
    ) {
        let losses = self.losses.clone();
        let name = context.name_arc();

        connection.on_error(move |error| {
            warn!(
                name = name.as_ref(),
                ?error,
                error_message = %error,
                "Lost a broker connection",
            );

            let _ = losses.send(name.clone());
        });

        *context.connection.lock().await = Some(connection);
        *context.recovery_started.lock() = None;
        context.release_lock();

        info!(
            name = context.name(),
            identifier = context.handle().identifier(),
            "Established a broker connection",
        );

        let _ = self.events.send(event);
    }

    /// Receives transport-loss reports for as long as the manager lives, and
    /// spins off a recovery per report.
    async fn watch_losses(
        manager: Weak<ConnectionManager>,
        mut loss_feed: mpsc::UnboundedReceiver<Arc<str>>,
    ) {
        while let Some(name) = loss_feed.recv().await {
            let Some(manager) = manager.upgrade() else {
                break;
            };

            tokio::spawn(async move { manager.recover(name).await });
        }
    }

    /// Attempts to re-establish a lost connection, unless the context was
    /// detached (deliberate close/removal) in the meantime. Exceeding the
    /// retry budget discards the context and emits
    /// [`RecoveryFailed`](ConnectionEvent::RecoveryFailed).
    async fn recover(&self, name: Arc<str>) {
        let Some(context) = self.get(&name) else {
            return;
        };

        if context.is_detached() {
            debug!(
                name = name.as_ref(),
                "Skipping recovery of a deliberately closed connection",
            );

            return;
        }

        let _ = self.events.send(ConnectionEvent::Closed {
            name: context.name_arc(),
        });

        if !context.try_acquire_lock() {
            // Another task is already re-establishing this context
            return;
        }

        *context.recovery_started.lock() = Some(Instant::now());
        context.connection.lock().await.take();

        match self.establish_transport(context.handle()).await {
            Ok(connection) => {
                self.adopt(&context, connection, ConnectionEvent::Recovered {
                    name: context.name_arc(),
                })
                .await;
            }
            Err(error) => {
                error!(
                    alert = true,
                    name = context.name(),
                    identifier = context.handle().identifier(),
                    ?error,
                    error_message = %error,
                    "Gave up recovering a broker connection",
                );

                self.contexts.lock().remove(context.name());
                context.release_lock();

                let _ = self.events.send(ConnectionEvent::RecoveryFailed {
                    name: context.name_arc(),
                });
            }
        }
    }

    /// Works on closing the given connection, logging the outcome.
    async fn close_connection(name: &str, connection: Connection) {
        let result = connection.close(200, "Closed connection").await;

        match result {
            Ok(_) => info!(name, "Closed a broker connection"),
            Err(LapinError::InvalidConnectionState(_)) => {
                info!(name, "Discarded a previously lost broker connection")
            }
            Err(error) => warn!(
                name,
                ?error,
                error_message = %error,
                "Failed to cleanly close a broker connection",
            ),
        }
    }
}
