use crate::config::{BusConfig, ExchangeKind, PublishOptions, SubscribeOptions};
use crate::events::BusEvent;
use crate::handler::{Delivered, HandlerTable, MessageHandler};
use crate::manager::channel::{ChannelError, ChannelManager, ChannelOptions};
use crate::manager::connection::{
    ConnectionContext, ConnectionError, ConnectionManager, OpenChannelError,
};
use crate::subscription::SubscriptionManager;
use crate::transport::inbound::envelope::Envelope;
use crate::transport::inbound::pipeline::{
    InboundPipeline, commit_delivery, error_queue_of, poison_queue_of,
};
use crate::transport::outbound::publisher::{
    PublishError, assemble, assemble_raw, publish_confirmed,
};
use futures::StreamExt;
use girder_util::Backoff;
use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicGetOptions, BasicRecoverOptions,
    ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions,
    QueueDeleteOptions, QueuePurgeOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Consumer, Error as LapinError};
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Weak};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// The process-wide registry of named [`Bus`] instances.
static REGISTRY: LazyLock<SyncMutex<HashMap<String, Arc<Bus>>>> =
    LazyLock::new(|| SyncMutex::new(HashMap::new()));

const OPS_CHANNEL: &str = "ops";
const PUBLISH_CHANNEL: &str = "publish";

/// The message-bus facade: publish/subscribe/get plus thin administrative
/// forwards, orchestrating the connection/channel managers, the subscription
/// state, and the delivery pipeline.
///
/// Common paths (publish, subscribe, get) auto-build missing connection and
/// channel contexts transparently; resource-layer errors propagate to the
/// triggering call, while per-message failures are contained in the delivery
/// pipeline and surface only as [`BusEvent`]s.
///
/// Busses are either free-standing ([`Bus::new`]) or registered under a name
/// in a process-wide registry ([`Bus::instance`]), so independent instances
/// remain possible while callers that want a shared default get one. Must be
/// created inside a Tokio runtime.
pub struct Bus {
    name: Arc<str>,
    config: BusConfig,
    connections: Arc<ConnectionManager>,
    channels: Arc<ChannelManager>,
    subscriptions: Arc<SubscriptionManager>,
    events: broadcast::Sender<BusEvent>,
    declared_queues: SyncMutex<HashSet<String>>,
    exchange_declared: AtomicBool,
    stopping: AtomicBool,
    // Self-reference for handing out to spawned consumer loops
    weak: Weak<Bus>,
}

/// Represents a failure to set up a subscription.
#[derive(Error, Debug)]
pub enum SubscribeError {
    /// A subscription record already exists for the queue.
    #[error("already subscribed to queue '{queue}'")]
    AlreadySubscribed {
        /// The queue in question.
        queue: String,
    },

    /// The queue is administratively blocked.
    #[error("queue '{queue}' is blocked")]
    Blocked {
        /// The queue in question.
        queue: String,
    },

    /// No subscription record exists for the queue.
    #[error("no subscription record for queue '{queue}'")]
    NotSubscribed {
        /// The queue in question.
        queue: String,
    },

    /// The handler table is empty.
    #[error("a subscription requires at least one handler")]
    NoHandlers,

    /// The subscription's channel context holds no live channel.
    #[error("no live channel available for queue '{queue}'")]
    NoChannel {
        /// The queue in question.
        queue: String,
    },

    /// Establishing the connection context failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Establishing the channel context failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// A broker declaration or the consumer registration failed.
    #[error(transparent)]
    Transport(#[from] LapinError),
}

/// Represents a failure of a `get` or an administrative operation.
#[derive(Error, Debug)]
pub enum OpsError {
    /// Establishing the connection context failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Establishing the channel context failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The channel context holds no live channel.
    #[error("no live channel available")]
    NoChannel,

    /// The broker refused the operation.
    #[error(transparent)]
    Transport(#[from] LapinError),
}

impl From<OpsError> for PublishError {
    fn from(value: OpsError) -> Self {
        match value {
            OpsError::Connection(error) => Self::Connection(error),
            OpsError::Channel(error) => Self::ChannelSetup(error),
            OpsError::NoChannel => Self::NoChannel,
            OpsError::Transport(error) => Self::Transport(error),
        }
    }
}

impl From<OpsError> for SubscribeError {
    fn from(value: OpsError) -> Self {
        match value {
            OpsError::Connection(error) => Self::Connection(error),
            OpsError::Channel(error) => Self::Channel(error),
            OpsError::NoChannel => Self::NoChannel {
                queue: String::new(),
            },
            OpsError::Transport(error) => Self::Transport(error),
        }
    }
}

impl Bus {
    /// Creates a free-standing, unregistered bus with the given
    /// configuration.
    pub fn new(config: BusConfig) -> Arc<Self> {
        Self::assemble_instance("anonymous", config)
    }

    /// Returns the registered bus of the given name, creating it with a
    /// default [`BusConfig`] if absent.
    pub fn instance(name: &str) -> Arc<Self> {
        Self::install(name, BusConfig::default())
    }

    /// Returns the process-wide default bus.
    pub fn default_instance() -> Arc<Self> {
        Self::instance("default")
    }

    /// Returns the registered bus of the given name, creating it with the
    /// given configuration if absent. An already-registered bus keeps its
    /// original configuration.
    pub fn install(name: &str, config: BusConfig) -> Arc<Self> {
        let mut registry = REGISTRY.lock();

        match registry.get(name) {
            Some(bus) => bus.clone(),
            None => {
                let bus = Self::assemble_instance(name, config);
                registry.insert(name.to_string(), bus.clone());

                bus
            }
        }
    }

    fn assemble_instance(name: &str, config: BusConfig) -> Arc<Self> {
        let connections = ConnectionManager::new();
        let channels = ChannelManager::new(&connections);
        let subscriptions = Arc::new(SubscriptionManager::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Arc::new_cyclic(|weak| Self {
            name: Arc::from(name),
            config,
            connections,
            channels,
            subscriptions,
            events,
            declared_queues: SyncMutex::new(HashSet::new()),
            exchange_declared: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            weak: weak.clone(),
        })
    }
}

impl Bus {
    /// Reports the name of this bus.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Exposes the configuration of this bus.
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Exposes the connection manager of this bus.
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Exposes the channel manager of this bus.
    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }

    /// Exposes the subscription manager of this bus.
    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    /// Returns a receiver of [`BusEvent`]s.
    pub fn events(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    /// Reports whether the transport layer of this bus is healthy: every
    /// connection context is open or still within its recovery window.
    pub async fn healthy(&self) -> bool {
        self.connections.healthy().await
    }
}

impl Bus {
    /// Publishes a message to the bus exchange, routed by the explicit
    /// routing key or the message's `event` field. Returns only after the
    /// broker confirmed the enqueue.
    pub async fn publish<T>(&self, message: &T, options: PublishOptions) -> Result<(), PublishError>
    where
        T: Serialize,
    {
        let publication = assemble(message, &options, None)?;

        let channel = self
            .ensure_channel(PUBLISH_CHANNEL, ChannelOptions::default())
            .await
            .map_err(PublishError::from)?;

        self.ensure_exchange(&channel).await?;

        publish_confirmed(
            &channel,
            self.config.exchange().name(),
            &publication.routing_key,
            &publication.bytes,
            publication.headers.properties(options.persistent()),
        )
        .await
    }

    /// Sends a message straight to the given queue through the default
    /// exchange, bypassing routing. Returns only after the broker confirmed
    /// the enqueue.
    pub async fn send<T>(
        &self,
        message: &T,
        queue: &str,
        options: PublishOptions,
    ) -> Result<(), PublishError>
    where
        T: Serialize,
    {
        let publication = assemble(message, &options, Some(queue))?;

        let channel = self
            .ensure_channel(PUBLISH_CHANNEL, ChannelOptions::default())
            .await
            .map_err(PublishError::from)?;

        self.ensure_queue(&channel, queue).await?;

        publish_confirmed(
            &channel,
            "",
            queue,
            &publication.bytes,
            publication.headers.properties(options.persistent()),
        )
        .await
    }

    /// Sends raw bytes (the `isBuffer` flavor) straight to the given queue.
    pub async fn send_raw(
        &self,
        bytes: Vec<u8>,
        queue: &str,
        options: PublishOptions,
    ) -> Result<(), PublishError> {
        let publication = assemble_raw(bytes, &options, queue);

        let channel = self
            .ensure_channel(PUBLISH_CHANNEL, ChannelOptions::default())
            .await
            .map_err(PublishError::from)?;

        self.ensure_queue(&channel, queue).await?;

        publish_confirmed(
            &channel,
            "",
            queue,
            &publication.bytes,
            publication.headers.properties(options.persistent()),
        )
        .await
    }
}

impl Bus {
    /// Subscribes the given handlers to the given queue: creates the
    /// subscription record, builds the transport resources (retried with
    /// backoff), issues the declarations, and starts consuming.
    ///
    /// Fails synchronously when the queue already has a record or is
    /// blocked, so a double registration never reaches the broker.
    pub async fn subscribe(
        &self,
        queue: &str,
        handlers: HandlerTable,
        options: SubscribeOptions,
    ) -> Result<(), SubscribeError> {
        if handlers.is_empty() {
            return Err(SubscribeError::NoHandlers);
        }

        if self.subscriptions.is_blocked(queue) {
            return Err(SubscribeError::Blocked {
                queue: queue.to_string(),
            });
        }

        if !self.subscriptions.create(queue, handlers, options) {
            return Err(SubscribeError::AlreadySubscribed {
                queue: queue.to_string(),
            });
        }

        match self.start_consuming(queue).await {
            Ok(()) => Ok(()),
            Err(error) => {
                // Undo the record so a later subscribe can start clean
                self.subscriptions.remove(queue);

                Err(error)
            }
        }
    }

    /// Stops consuming the given queue while keeping the subscription record
    /// (and its handlers) for a later [`resubscribe`](Bus::resubscribe).
    /// With `nack_messages`, outstanding unacknowledged deliveries are
    /// returned to the queue immediately.
    pub async fn unsubscribe(&self, queue: &str, nack_messages: bool) -> Result<(), SubscribeError> {
        if !self.subscriptions.contains(queue, false) {
            return Err(SubscribeError::NotSubscribed {
                queue: queue.to_string(),
            });
        }

        self.stop_consumer(queue, nack_messages).await
    }

    /// Starts consuming again on a previously cleared subscription record.
    pub async fn resubscribe(&self, queue: &str) -> Result<(), SubscribeError> {
        if self.subscriptions.is_blocked(queue) {
            return Err(SubscribeError::Blocked {
                queue: queue.to_string(),
            });
        }

        let Some(subscription) = self.subscriptions.get(queue) else {
            return Err(SubscribeError::NotSubscribed {
                queue: queue.to_string(),
            });
        };

        if subscription.is_consuming() {
            return Ok(());
        }

        self.start_consuming(queue).await
    }

    /// Administratively blocks the given queue name: the broker consumer (if
    /// any) is stopped, the subscription record is kept, and subsequent
    /// subscribes fail until [`unblock`](Bus::unblock). Returns `false` if
    /// the queue is already blocked.
    pub async fn block(&self, queue: &str) -> bool {
        if !self.subscriptions.block(queue) {
            return false;
        }

        if self.subscriptions.contains(queue, true) {
            if let Err(error) = self.stop_consumer(queue, false).await {
                warn!(
                    queue,
                    ?error,
                    error_message = %error,
                    "Failed to stop the consumer of a blocked queue",
                );
            }
        }

        let _ = self.events.send(BusEvent::Blocked {
            queue: Arc::from(queue),
        });

        true
    }

    /// Lifts the administrative block and, if a subscription record exists,
    /// resumes consumption. Returns `false` if the queue is not blocked.
    pub async fn unblock(&self, queue: &str) -> bool {
        if !self.subscriptions.unblock(queue) {
            return false;
        }

        let _ = self.events.send(BusEvent::Unblocked {
            queue: Arc::from(queue),
        });

        if self.subscriptions.contains(queue, false) {
            if let Err(error) = self.start_consuming(queue).await {
                warn!(
                    queue,
                    ?error,
                    error_message = %error,
                    "Failed to resume consumption of an unblocked queue",
                );
            }
        }

        true
    }
}

impl Bus {
    /// Fetches a single message from the given queue, if one is ready. The
    /// returned [`Envelope`] must be finalized by the caller; an undecodable
    /// body is handed out raw rather than routed to the poison queue.
    pub async fn get(&self, queue: &str) -> Result<Option<Envelope>, OpsError> {
        let channel = self
            .ensure_channel(OPS_CHANNEL, ChannelOptions::default())
            .await?;

        let message = channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await?;

        let Some(message) = message else {
            return Ok(None);
        };

        let queue: Arc<str> = Arc::from(queue);
        let envelope = match Envelope::try_from(queue.clone(), message.delivery) {
            Ok(envelope) => envelope,
            Err(failure) => Envelope::from_failure(queue, failure),
        };

        Ok(Some(envelope))
    }

    /// Drains the given queue through the given handler: fetches messages
    /// one by one until the queue reports empty, committing each verdict the
    /// same way the subscription pipeline would. Returns how many messages
    /// were processed.
    pub async fn get_all(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
    ) -> Result<usize, OpsError> {
        let channel = self
            .ensure_channel(OPS_CHANNEL, ChannelOptions::default())
            .await?;

        let queue_arc: Arc<str> = Arc::from(queue);
        let mut processed = 0;

        while let Some(envelope) = self.get(queue).await? {
            let delivered = Delivered::new(
                queue_arc.clone(),
                envelope.body().clone(),
                envelope.headers().clone(),
            );

            let verdict = handler.handle(delivered).await;

            commit_delivery(
                &channel,
                &self.events,
                &queue_arc,
                envelope,
                verdict,
                options.max_retry_count(),
            )
            .await;

            processed += 1;
        }

        Ok(processed)
    }
}

impl Bus {
    /// Declares a durable queue of the given name.
    pub async fn create_queue(&self, queue: &str) -> Result<(), OpsError> {
        let channel = self
            .ensure_channel(OPS_CHANNEL, ChannelOptions::default())
            .await?;

        Self::declare_queue(&channel, queue).await?;

        Ok(())
    }

    /// Deletes the given queue.
    pub async fn delete_queue(&self, queue: &str) -> Result<(), OpsError> {
        let channel = self
            .ensure_channel(OPS_CHANNEL, ChannelOptions::default())
            .await?;

        channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await?;
        self.declared_queues.lock().remove(queue);

        Ok(())
    }

    /// Purges the given queue.
    pub async fn purge_queue(&self, queue: &str) -> Result<(), OpsError> {
        let channel = self
            .ensure_channel(OPS_CHANNEL, ChannelOptions::default())
            .await?;

        channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await?;

        Ok(())
    }

    /// Declares an exchange of the given name and kind.
    pub async fn create_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), OpsError> {
        let channel = self
            .ensure_channel(OPS_CHANNEL, ChannelOptions::default())
            .await?;

        channel
            .exchange_declare(
                exchange,
                kind.lapin_value(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    /// Deletes the given exchange.
    pub async fn delete_exchange(&self, exchange: &str) -> Result<(), OpsError> {
        let channel = self
            .ensure_channel(OPS_CHANNEL, ChannelOptions::default())
            .await?;

        channel
            .exchange_delete(exchange, ExchangeDeleteOptions::default())
            .await?;

        if exchange == self.config.exchange().name() {
            self.exchange_declared.store(false, Ordering::Release);
        }

        Ok(())
    }

    /// Reports whether the given queue exists on the broker, via a passive
    /// declaration on a throwaway channel (a failed passive declaration
    /// closes its channel).
    pub async fn check_queue(&self, queue: &str) -> Result<bool, OpsError> {
        let connection = self.connection().await?;
        let channel = Self::throwaway_channel(&connection).await?;

        let found = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    durable: false,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .is_ok();

        if found {
            let _ = channel.close(200, "Closed check channel").await;
        }

        Ok(found)
    }

    /// Reports whether the given exchange exists on the broker, via a
    /// passive declaration on a throwaway channel.
    pub async fn check_exchange(&self, exchange: &str) -> Result<bool, OpsError> {
        let connection = self.connection().await?;
        let channel = Self::throwaway_channel(&connection).await?;

        let found = channel
            .exchange_declare(
                exchange,
                self.config.exchange().kind().lapin_value(),
                ExchangeDeclareOptions {
                    passive: true,
                    durable: false,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .is_ok();

        if found {
            let _ = channel.close(200, "Closed check channel").await;
        }

        Ok(found)
    }

    /// Tears down the whole bus: stops every consumer, removes every
    /// subscription record, every channel, and every connection, and drops
    /// this bus from the registry.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::Release);

        info!(bus = self.name.as_ref(), "Stopping the bus");

        for queue in self.subscriptions.queues() {
            if self.subscriptions.contains(&queue, true) {
                if let Err(error) = self.stop_consumer(&queue, false).await {
                    warn!(
                        queue = queue.as_str(),
                        ?error,
                        error_message = %error,
                        "Failed to cleanly stop a consumer during bus shutdown",
                    );
                }
            }

            self.subscriptions.remove(&queue);
        }

        for name in self.channels.names() {
            self.channels.remove(&name).await;
        }

        for name in self.connections.names() {
            self.connections.remove(&name).await;
        }

        REGISTRY
            .lock()
            .retain(|_, bus| !std::ptr::eq(Arc::as_ptr(bus), self));
    }
}

impl Bus {
    /// Produces the bus's connection context, creating it if necessary.
    async fn connection(&self) -> Result<Arc<ConnectionContext>, ConnectionError> {
        let handle = self.config.handle();

        self.connections.create(handle.name(), handle).await
    }

    /// Produces a live channel under the given context name, auto-building
    /// the connection and channel contexts as needed.
    async fn ensure_channel(
        &self,
        name: &str,
        options: ChannelOptions,
    ) -> Result<Channel, OpsError> {
        let connection = self.connection().await?;
        let context = self.channels.create(name, &connection, Some(options)).await?;

        context.channel().await.ok_or(OpsError::NoChannel)
    }

    /// Declares the bus exchange once per bus lifetime.
    async fn ensure_exchange(&self, channel: &Channel) -> Result<(), LapinError> {
        if self.exchange_declared.load(Ordering::Acquire) {
            return Ok(());
        }

        let settings = self.config.exchange();

        channel
            .exchange_declare(
                settings.name(),
                settings.kind().lapin_value(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: settings.durable(),
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;

        self.exchange_declared.store(true, Ordering::Release);

        Ok(())
    }

    /// Declares the given queue once per bus lifetime.
    async fn ensure_queue(&self, channel: &Channel, queue: &str) -> Result<(), LapinError> {
        if self.declared_queues.lock().contains(queue) {
            return Ok(());
        }

        Self::declare_queue(channel, queue).await?;
        self.declared_queues.lock().insert(queue.to_string());

        Ok(())
    }

    /// Declares one durable queue.
    async fn declare_queue(channel: &Channel, queue: &str) -> Result<(), LapinError> {
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: false,
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    /// Builds the transport resources for the given queue's subscription,
    /// issues the declarations, registers the broker consumer, and spawns
    /// the consumer loop.
    // Returns a boxed `dyn Future + Send` rather than being a plain `async fn`.
    // `start_consuming` spawns `consume_loop`, which awaits `maybe_revive`,
    // which awaits `start_consuming` — a mutually recursive async cycle whose
    // auto-trait (`Send`) resolution rustc cannot settle for opaque `async fn`
    // return types, so it falls back to `!Send` and breaks `tokio::spawn`.
    // Naming a concrete `Send` return type here gives the solver a fixed point
    // to stop at, cutting the cycle without any behavioral change.
    fn start_consuming<'a>(
        &'a self,
        queue: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), SubscribeError>> + Send + 'a>> {
        Box::pin(async move {
        let Some(subscription) = self.subscriptions.get(queue) else {
            return Err(SubscribeError::NotSubscribed {
                queue: queue.to_string(),
            });
        };

        let options = subscription.options();

        let channel_options = match options.prefetch() {
            Some(prefetch) => ChannelOptions::default().with_prefetch(prefetch),
            None => ChannelOptions::default(),
        };

        let connection = self.connection().await?;
        let channel_name = Self::subscription_channel_name(queue);
        let context = self
            .channels
            .create(&channel_name, &connection, Some(channel_options))
            .await?;
        let channel = context
            .channel()
            .await
            .ok_or_else(|| SubscribeError::NoChannel {
                queue: queue.to_string(),
            })?;

        self.declare_for_subscription(&channel, queue, &subscription.handlers().patterns().collect::<Vec<_>>(), options.disable_exchange_create(), options.disable_queue_create(), options.disable_queue_bind())
            .await?;

        let tag = self.compose_consumer_tag(queue);
        let consumer = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;

        self.subscriptions.tag(queue, &tag);

        let dispatcher = options
            .dispatch_type()
            .build(options.serial_dispatch_partition_key_selectors());

        let queue_arc: Arc<str> = Arc::from(queue);
        let pipeline = InboundPipeline::new(
            queue_arc.clone(),
            subscription.clone(),
            dispatcher,
            channel.clone(),
            self.events.clone(),
        );

        info!(
            bus = self.name.as_ref(),
            queue,
            consumer_tag = tag.as_str(),
            "Started consuming",
        );

        let _ = self.events.send(BusEvent::Subscribed {
            queue: queue_arc.clone(),
        });

        tokio::spawn(Self::consume_loop(
            self.weak.clone(),
            queue_arc,
            consumer,
            pipeline,
        ));

        Ok(())
    }

    /// Issues the declarations a subscription needs before consuming:
    /// the bus exchange, the queue with its error/poison companions, and one
    /// binding per registered route pattern.
    async fn declare_for_subscription(
        &self,
        channel: &Channel,
        queue: &str,
        patterns: &[&str],
        disable_exchange_create: bool,
        disable_queue_create: bool,
        disable_queue_bind: bool,
    ) -> Result<(), LapinError> {
        if !disable_exchange_create {
            self.ensure_exchange(channel).await?;
        }

        if !disable_queue_create {
            Self::declare_queue(channel, queue).await?;
            Self::declare_queue(channel, &error_queue_of(queue)).await?;
            Self::declare_queue(channel, &poison_queue_of(queue)).await?;
        }

        if !disable_queue_bind {
            for pattern in patterns {
                channel
                    .queue_bind(
                        queue,
                        self.config.exchange().name(),
                        pattern,
                        QueueBindOptions { nowait: false },
                        FieldTable::default(),
                    )
                    .await?;
            }
        }

        Ok(())
    }

    /// Runs one broker consumer to exhaustion, feeding every delivery into
    /// the pipeline. When the stream ends — deliberate cancel or transport
    /// loss — the bus decides whether to revive the consumer.
    async fn consume_loop(
        bus: Weak<Bus>,
        queue: Arc<str>,
        mut consumer: Consumer,
        pipeline: InboundPipeline,
    ) {
        while let Some(result) = consumer.next().await {
            match result {
                Ok(delivery) => pipeline.process(delivery).await,
                Err(error) => {
                    warn!(
                        queue = queue.as_ref(),
                        ?error,
                        error_message = %error,
                        "Received an error from a broker consumer",
                    );
                }
            }
        }

        debug!(queue = queue.as_ref(), "A broker consumer ran out");

        if let Some(bus) = bus.upgrade() {
            bus.maybe_revive(&queue).await;
        }
    }

    /// Decides whether a dried-out consumer was lost (revive) or stopped on
    /// purpose (leave it be), and in the former case re-subscribes with a
    /// backoff until the transport comes back.
    async fn maybe_revive(&self, queue: &str) {
        if self.stopping.load(Ordering::Acquire) {
            return;
        }

        let Some(subscription) = self.subscriptions.get(queue) else {
            return;
        };

        // A deliberate stop clears the tag before cancelling
        if !subscription.is_consuming() {
            return;
        }

        if self.subscriptions.is_blocked(queue) {
            return;
        }

        info!(queue, "Reviving a consumer lost to the transport");

        self.subscriptions.clear(queue);
        let _ = self.events.send(BusEvent::Unsubscribed {
            queue: Arc::from(queue),
        });

        let backoff = Backoff::new(self.config.handle().backoff());

        loop {
            if self.stopping.load(Ordering::Acquire)
                || self.subscriptions.is_blocked(queue)
                || !self.subscriptions.contains(queue, false)
            {
                return;
            }

            match self.start_consuming(queue).await {
                Ok(()) => return,
                Err(error) => {
                    warn!(
                        alert = true,
                        queue,
                        ?error,
                        error_message = %error,
                        "Failed to revive a consumer; will keep trying",
                    );

                    backoff.sleep_next().await;
                }
            }
        }
    }

    /// Stops the broker consumer of the given queue, clearing the tag first
    /// so the consumer loop does not mistake the cancel for a transport
    /// loss.
    async fn stop_consumer(&self, queue: &str, nack_messages: bool) -> Result<(), SubscribeError> {
        let Some(subscription) = self.subscriptions.get(queue) else {
            return Ok(());
        };

        let Some(tag) = subscription.consumer_tag() else {
            return Ok(());
        };

        self.subscriptions.clear(queue);

        let channel_name = Self::subscription_channel_name(queue);
        if let Some(channel) = self.channels.channel(&channel_name).await {
            channel
                .basic_cancel(&tag, BasicCancelOptions::default())
                .await?;

            if nack_messages {
                channel
                    .basic_recover(BasicRecoverOptions { requeue: true })
                    .await?;
            }
        }

        let _ = self.events.send(BusEvent::Unsubscribed {
            queue: Arc::from(queue),
        });

        Ok(())
    }

    /// Opens a channel outside the channel manager, for operations that may
    /// get their channel closed by the broker (passive declarations).
    async fn throwaway_channel(
        connection: &Arc<ConnectionContext>,
    ) -> Result<Channel, OpsError> {
        match connection.open_channel().await {
            Ok(channel) => Ok(channel),
            Err(OpenChannelError::NoConnection { .. }) => Err(OpsError::NoChannel),
            Err(OpenChannelError::Transport(error)) => Err(OpsError::Transport(error)),
        }
    }

    /// Names the channel context of a queue subscription.
    fn subscription_channel_name(queue: &str) -> String {
        format!("sub:{}", queue)
    }

    /// Composes a process-unique broker consumer tag.
    fn compose_consumer_tag(&self, queue: &str) -> String {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        format!(
            "{}:{}:{}",
            self.name,
            queue,
            COUNTER.fetch_add(1, Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Finalization, handler_fn};
    use pretty_assertions::assert_eq;

    fn ack_handlers() -> HandlerTable {
        HandlerTable::new().on("order.#", handler_fn(|_| async { Finalization::Ack }))
    }

    #[tokio::test]
    async fn subscribe_requires_handlers() {
        // Given
        let bus = Bus::new(BusConfig::default());

        // When
        let outcome = bus
            .subscribe("billing", HandlerTable::new(), SubscribeOptions::default())
            .await;

        // Then
        assert!(matches!(outcome.unwrap_err(), SubscribeError::NoHandlers));
    }

    #[tokio::test]
    async fn subscribe_refuses_a_blocked_queue() {
        // Given
        let bus = Bus::new(BusConfig::default());
        assert!(bus.block("billing").await);

        // When
        let outcome = bus
            .subscribe("billing", ack_handlers(), SubscribeOptions::default())
            .await;

        // Then
        assert!(matches!(
            outcome.unwrap_err(),
            SubscribeError::Blocked { queue } if queue == "billing",
        ));
    }

    #[tokio::test]
    async fn subscribe_refuses_a_double_registration() {
        // Given: a record already exists
        let bus = Bus::new(BusConfig::default());
        bus.subscriptions()
            .create("billing", ack_handlers(), SubscribeOptions::default());

        // When
        let outcome = bus
            .subscribe("billing", ack_handlers(), SubscribeOptions::default())
            .await;

        // Then
        assert!(matches!(
            outcome.unwrap_err(),
            SubscribeError::AlreadySubscribed { queue } if queue == "billing",
        ));
    }

    #[tokio::test]
    async fn resubscribe_requires_a_record() {
        // Given
        let bus = Bus::new(BusConfig::default());

        // When
        let outcome = bus.resubscribe("billing").await;

        // Then
        assert!(matches!(
            outcome.unwrap_err(),
            SubscribeError::NotSubscribed { queue } if queue == "billing",
        ));
    }

    #[tokio::test]
    async fn unsubscribe_requires_a_record() {
        // Given
        let bus = Bus::new(BusConfig::default());

        // When
        let outcome = bus.unsubscribe("billing", false).await;

        // Then
        assert!(matches!(
            outcome.unwrap_err(),
            SubscribeError::NotSubscribed { queue } if queue == "billing",
        ));
    }

    #[tokio::test]
    async fn block_and_unblock_report_state_transitions() {
        // Given
        let bus = Bus::new(BusConfig::default());

        // Then
        assert!(bus.block("billing").await);
        assert!(!bus.block("billing").await);
        assert!(bus.unblock("billing").await);
        assert!(!bus.unblock("billing").await);
    }

    #[tokio::test]
    async fn publish_without_a_route_is_a_configuration_error() {
        // Given
        let bus = Bus::new(BusConfig::default());

        // When: no routing key, no event field — fails before any transport
        let outcome = bus
            .publish(&serde_json::json!({"n": 1}), PublishOptions::default())
            .await;

        // Then
        assert!(matches!(
            outcome.unwrap_err(),
            PublishError::MissingRoutingKey,
        ));
    }

    #[tokio::test]
    async fn registry_returns_the_same_instance() {
        // Given
        let first = Bus::instance("registry-test");
        let second = Bus::instance("registry-test");

        // Then
        assert!(Arc::ptr_eq(&first, &second));

        // When
        first.stop().await;
        let third = Bus::instance("registry-test");

        // Then: stop dropped the registration
        assert!(!Arc::ptr_eq(&first, &third));
        third.stop().await;
    }

    #[tokio::test]
    async fn independent_instances_remain_possible() {
        // Given
        let registered = Bus::instance("independent-test");
        let free_standing = Bus::new(BusConfig::default());

        // Then
        assert!(!Arc::ptr_eq(&registered, &free_standing));
        assert_eq!(free_standing.name(), "anonymous");
        registered.stop().await;
    }
}
