use crate::handler::Body;
use crate::headers::BusHeaders;
use std::sync::Arc;

/// Announces bus-level activity: subscription transitions and the terminal
/// outcome of every processed message.
///
/// Events are delivered over a broadcast channel; receivers that fall behind
/// lose the oldest events, never block the bus.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A broker consumer started consuming a queue.
    Subscribed {
        /// The consumed queue.
        queue: Arc<str>,
    },

    /// The broker consumer of a queue was stopped (explicitly, by blocking,
    /// or by transport loss); the subscription record survives.
    Unsubscribed {
        /// The formerly consumed queue.
        queue: Arc<str>,
    },

    /// A queue was administratively blocked.
    Blocked {
        /// The blocked queue.
        queue: Arc<str>,
    },

    /// A queue was administratively unblocked.
    Unblocked {
        /// The unblocked queue.
        queue: Arc<str>,
    },

    /// A message was acknowledged after successful handling.
    MessageAcked {
        /// The queue the message was consumed from.
        queue: Arc<str>,
        /// The headers of the message.
        headers: BusHeaders,
        /// The decoded body of the message.
        body: Body,
    },

    /// A message was rejected to an error queue.
    MessageRejected {
        /// The queue the message was consumed from.
        queue: Arc<str>,
        /// The headers as republished, reject stamps included.
        headers: BusHeaders,
        /// The decoded body of the message.
        body: Body,
    },

    /// A message was requeued for another delivery attempt.
    MessageRequeued {
        /// The queue the message was consumed from.
        queue: Arc<str>,
        /// The headers as republished, requeue stamps included.
        headers: BusHeaders,
        /// The decoded body of the message.
        body: Body,
    },

    /// An undecodable message was sent to the poison queue without handler
    /// invocation.
    MessagePoisoned {
        /// The queue the message was consumed from.
        queue: Arc<str>,
        /// The headers as republished, reject stamps included.
        headers: BusHeaders,
    },

    /// A message matched no registered handler.
    MessageUnrouted {
        /// The queue the message was consumed from.
        queue: Arc<str>,
        /// The headers of the message.
        headers: BusHeaders,
        /// The route that failed to match.
        route: String,
    },
}
