use crate::handler::Body;
use crate::headers::BusHeaders;
use crate::transport::inbound::decoder::{BodyDecoder, Decoder};
use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicRejectOptions};
use parking_lot::Mutex as SyncMutex;
use tracing::{error, warn};
use std::sync::Arc;

/// Represents an incoming bus message: the original bytes, the decoded
/// [`Body`], the materialized [`BusHeaders`], and the broker acknowledgement
/// handle.
///
/// An envelope must be finalized exactly once — by the delivery pipeline, or
/// (for envelopes handed out by [`Bus::get`](crate::Bus::get)) by the caller
/// via [`complete`](Envelope::complete), [`backwash`](Envelope::backwash) or
/// [`abandon`](Envelope::abandon). Dropping an unfinalized envelope is logged
/// as an error.
#[derive(Debug)]
pub struct Envelope {
    queue: Arc<str>,
    routing_key: String,
    is_redelivered: bool,
    headers: BusHeaders,
    bytes: Vec<u8>,
    body: Body,
    acker: SyncMutex<Option<Acker>>,
}

/// Represents a failed attempt to decode a [`Delivery`] into an [`Envelope`].
/// Carries everything needed to finalize the poison message.
pub(crate) struct DecodeFailure {
    pub(crate) routing_key: String,
    pub(crate) headers: BusHeaders,
    pub(crate) bytes: Vec<u8>,
    pub(crate) acker: Option<Acker>,
    pub(crate) error: String,
}

impl Envelope {
    /// Attempts to create an envelope from the given [`Delivery`] using the
    /// standard [`BodyDecoder`].
    pub(crate) fn try_from(
        queue: Arc<str>,
        delivery: Delivery,
    ) -> Result<Envelope, DecodeFailure> {
        let Delivery {
            routing_key,
            redelivered: is_redelivered,
            properties,
            data: bytes,
            acker,
            ..
        } = delivery;

        let headers = BusHeaders::from_properties(&properties);

        match BodyDecoder.decode(&bytes, &headers) {
            Ok(body) => Ok(Self {
                queue,
                routing_key: routing_key.as_str().to_string(),
                is_redelivered,
                headers,
                bytes,
                body,
                acker: SyncMutex::new(Some(acker)),
            }),

            Err(error) => Err(DecodeFailure {
                routing_key: routing_key.as_str().to_string(),
                headers,
                bytes,
                acker: Some(acker),
                error: error.to_string(),
            }),
        }
    }

    /// Builds an envelope around an undecoded raw body. This is the shape a
    /// poison message takes when the subscription opted out of poison
    /// rejection.
    pub(crate) fn from_failure(queue: Arc<str>, failure: DecodeFailure) -> Self {
        let DecodeFailure {
            routing_key,
            headers,
            bytes,
            acker,
            ..
        } = failure;

        Self {
            queue,
            routing_key,
            is_redelivered: false,
            headers,
            body: Body::Bytes(bytes.clone()),
            bytes,
            acker: SyncMutex::new(acker),
        }
    }
}

impl Envelope {
    /// Reports the queue this message was consumed from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Reports the transport-level routing key of the delivery.
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Reports the broker redelivery flag.
    pub fn is_redelivered(&self) -> bool {
        self.is_redelivered
    }

    /// Exposes the bus headers.
    pub fn headers(&self) -> &BusHeaders {
        &self.headers
    }

    /// Exposes the original bytes of the message.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Exposes the decoded body.
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// The effective route of this message: the `routeKey` header when
    /// present, else the transport routing key.
    pub fn route(&self) -> &str {
        if self.headers.route_key().is_empty() {
            &self.routing_key
        } else {
            self.headers.route_key()
        }
    }

    /// Takes the acknowledgement handle out of this envelope, leaving the
    /// finalization to the caller.
    pub(crate) fn take_acker(&self) -> Option<Acker> {
        self.acker.lock().take()
    }
}

impl Envelope {
    /// Positively acknowledges the message, removing it from the queue.
    /// No-op if the envelope has already been finalized.
    pub async fn complete(self) {
        if let Some(acker) = self.take_acker() {
            complete_delivery(&self.queue, &acker, &self.bytes).await;
        }
    }

    /// Negatively acknowledges the message, asking the broker to requeue it
    /// as-is. No-op if the envelope has already been finalized.
    pub async fn backwash(self) {
        if let Some(acker) = self.take_acker() {
            backwash_delivery(&self.queue, &acker, &self.bytes).await;
        }
    }

    /// Negatively acknowledges the message without requeueing; the broker's
    /// dead-letter policy (if any) applies. No-op if the envelope has already
    /// been finalized.
    pub async fn abandon(self) {
        if let Some(acker) = self.take_acker() {
            abandon_delivery(&self.queue, &acker, &self.bytes).await;
        }
    }
}

impl Drop for Envelope {
    fn drop(&mut self) {
        if self.acker.lock().is_some() {
            error!(
                alert = true,
                queue = self.queue.as_ref(),
                transaction_id = self.headers.transaction_id(),
                "Dropped an envelope without finalizing it",
            );
        }
    }
}

/// Positively acknowledges a delivery. Failing to do so is potentially a
/// problem with the application's logic, so it is logged at the error level.
pub(crate) async fn complete_delivery(queue: &str, acker: &Acker, bytes: &[u8]) {
    if let Err(error) = acker.ack(BasicAckOptions { multiple: false }).await {
        error!(
            alert = true,
            queue,
            ?error,
            error_message = %error,
            byte_preview = String::from_utf8_lossy(bytes).as_ref(),
            "Failed to acknowledge an incoming message",
        );
    }
}

/// Negatively acknowledges a delivery with requeueing, so the broker
/// redelivers it unchanged.
pub(crate) async fn backwash_delivery(queue: &str, acker: &Acker, bytes: &[u8]) {
    if let Err(error) = acker.reject(BasicRejectOptions { requeue: true }).await {
        warn!(
            alert = true,
            queue,
            ?error,
            error_message = %error,
            byte_preview = String::from_utf8_lossy(bytes).as_ref(),
            "Failed to reject (with requeueing) an incoming message",
        );
    }
}

/// Negatively acknowledges a delivery without requeueing.
pub(crate) async fn abandon_delivery(queue: &str, acker: &Acker, bytes: &[u8]) {
    if let Err(error) = acker.reject(BasicRejectOptions { requeue: false }).await {
        error!(
            alert = true,
            queue,
            ?error,
            error_message = %error,
            byte_preview = String::from_utf8_lossy(bytes).as_ref(),
            "Failed to reject an incoming message",
        );
    }
}
