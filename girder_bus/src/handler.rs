use crate::headers::BusHeaders;
use crate::routing::RouteTable;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// The decoded body of an incoming message.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// A JSON body, which is the normal shape of bus traffic.
    Json(Value),
    /// A raw-bytes body, delivered when the message was published with the
    /// `isBuffer` flag (or when a poison message is passed through to the
    /// handler).
    Bytes(Vec<u8>),
}

impl Body {
    /// Exposes the JSON value of this body, if it is one.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Bytes(_) => None,
        }
    }

    /// Exposes the raw bytes of this body, if it is one.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Json(_) => None,
            Self::Bytes(bytes) => Some(bytes),
        }
    }
}

/// A single message as presented to a [`MessageHandler`]: the decoded body
/// plus the bus [headers](BusHeaders), scoped to the queue it arrived on.
#[derive(Debug, Clone)]
pub struct Delivered {
    queue: Arc<str>,
    body: Body,
    headers: BusHeaders,
}

impl Delivered {
    pub(crate) fn new(queue: Arc<str>, body: Body, headers: BusHeaders) -> Self {
        Self {
            queue,
            body,
            headers,
        }
    }

    /// Reports the queue this message was consumed from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Exposes the decoded body.
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Exposes the bus headers.
    pub fn headers(&self) -> &BusHeaders {
        &self.headers
    }

    /// Splits this message into its body and headers.
    pub fn into_parts(self) -> (Body, BusHeaders) {
        (self.body, self.headers)
    }
}

/// The verdict a [`MessageHandler`] returns for a message. The delivery
/// pipeline commits the verdict to the broker; handlers never touch
/// acknowledgements directly.
#[derive(Debug, Clone, PartialEq)]
pub enum Finalization {
    /// Permanently remove the message from the queue.
    Ack,
    /// Send the message to the error queue, stamping the reject instant and
    /// the reason.
    Reject {
        /// The human-readable reason recorded on the rejected message.
        reason: String,
        /// Overrides the default `<queue>.error` target.
        error_queue: Option<String>,
    },
    /// Redeliver the message, incrementing its retry counter. Once the
    /// counter would exceed the subscription's retry budget, the pipeline
    /// converts the requeue into a reject.
    Requeue,
}

impl Finalization {
    /// Shorthand for a [`Reject`](Finalization::Reject) to the default error
    /// queue.
    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject {
            reason: reason.into(),
            error_queue: None,
        }
    }

    /// Shorthand for a [`Reject`](Finalization::Reject) to a specific queue.
    pub fn reject_to(reason: impl Into<String>, error_queue: impl Into<String>) -> Self {
        Self::Reject {
            reason: reason.into(),
            error_queue: Some(error_queue.into()),
        }
    }
}

/// Processes messages consumed from a queue.
///
/// A handler receives the [`Delivered`] message and responds with a
/// [`Finalization`]. Returning normally is the only way to finalize; the
/// pipeline treats a panicking handler as a swallowed failure (the message
/// stays unacknowledged and is redelivered by the broker).
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles one message.
    async fn handle(&self, delivery: Delivered) -> Finalization;
}

/// The registration-ordered map from route patterns to handlers that a
/// subscription carries.
pub type HandlerTable = RouteTable<Arc<dyn MessageHandler>>;

/// Wraps an asynchronous closure into a [`MessageHandler`].
///
/// ```
/// use girder_bus::{Finalization, handler_fn};
///
/// let handler = handler_fn(|delivery| async move {
///     let _ = delivery.headers().transaction_id();
///     Finalization::Ack
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Delivered) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Finalization> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Delivered) -> Fut + Send + Sync,
    Fut: Future<Output = Finalization> + Send,
{
    async fn handle(&self, delivery: Delivered) -> Finalization {
        (self.0)(delivery).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn closure_handlers_run() {
        // Given
        let handler = handler_fn(|delivery| async move {
            Finalization::reject(format!("no use for {}", delivery.queue()))
        });
        let delivery = Delivered::new(
            Arc::from("billing"),
            Body::Json(serde_json::json!({"event": "order.created"})),
            BusHeaders::stamp("order.created", None, None, false),
        );

        // When
        let verdict = handler.handle(delivery).await;

        // Then
        assert_eq!(verdict, Finalization::reject("no use for billing"));
    }

    #[test]
    fn body_accessors() {
        // Given
        let json = Body::Json(serde_json::json!({"n": 1}));
        let bytes = Body::Bytes(vec![1, 2, 3]);

        // Then
        assert!(json.as_json().is_some());
        assert!(json.as_bytes().is_none());
        assert_eq!(bytes.as_bytes(), Some([1u8, 2, 3].as_slice()));
    }
}
