#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

/// Exposes the application configuration surface.
mod config;
pub use self::config::{
    BusConfig, ExchangeKind, ExchangeSettings, PublishOptions, SubscribeOptions,
};

/// Exposes a handle for defining a set of connection credentials.
mod handle;
pub use self::handle::{DsnChunks, Handle};

/// Exposes the wire-level bus headers.
mod headers;
pub use self::headers::{
    BUS_SIGNATURE, BusHeaders, HEADER_CREATED_AT, HEADER_ERRORED_AT, HEADER_IS_BUFFER,
    HEADER_PRODUCER_VERSION, HEADER_REASON, HEADER_REQUEUED_AT, HEADER_RETRY_COUNT,
    HEADER_ROUTE_KEY, HEADER_SOURCE, HEADER_TRANSACTION_ID,
};

/// Exposes the compiled wildcard route matching.
mod routing;
pub use self::routing::{RoutePattern, RouteTable};

/// Exposes the message-handler contract.
mod handler;
pub use self::handler::{Body, Delivered, Finalization, HandlerTable, MessageHandler, handler_fn};

/// Exposes machinery for maintaining named transport resources.
mod manager {
    pub mod channel;
    pub mod connection;
}
pub use self::manager::channel::{
    AcquireError, ChannelContext, ChannelError, ChannelEvent, ChannelManager, ChannelOptions,
};
pub use self::manager::connection::{
    ConnectPolicy, ConnectionContext, ConnectionError, ConnectionEvent, ConnectionManager,
    EstablishError, OpenChannelError,
};

/// Exposes the dispatch-scheduling subsystem.
mod dispatch {
    pub mod concurrent;
    pub mod partition;
    pub mod policy;
    pub mod serial;
}
pub use self::dispatch::concurrent::ConcurrentDispatcher;
pub use self::dispatch::partition::{DEFAULT_PARTITION, PartitionSerialDispatcher};
pub use self::dispatch::policy::{DispatchJob, DispatchType, Dispatcher};
pub use self::dispatch::serial::SerialDispatcher;

/// Exposes the per-queue consumption state machine.
mod subscription;
pub use self::subscription::{Subscription, SubscriptionEvent, SubscriptionManager};

/// Exposes machinery for transporting incoming and outgoing messages.
mod transport {
    pub mod inbound {
        pub mod decoder;
        pub mod envelope;
        pub(crate) mod pipeline;
    }
    pub mod outbound {
        pub mod publisher;
    }
}
pub use self::transport::inbound::decoder::{BodyDecoder, Decoder};
pub use self::transport::inbound::envelope::Envelope;
pub use self::transport::outbound::publisher::PublishError;

/// Exposes the bus-level event stream.
mod events;
pub use self::events::BusEvent;

/// Exposes the bus facade and its instance registry.
mod bus;
pub use self::bus::{Bus, OpsError, SubscribeError};

/// Internal helpers.
mod util {
    pub(crate) mod de;
    pub mod table;
}
