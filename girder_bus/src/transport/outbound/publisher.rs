use crate::config::PublishOptions;
use crate::headers::BusHeaders;
use crate::manager::channel::ChannelError;
use crate::manager::connection::ConnectionError;
use lapin::options::BasicPublishOptions;
use lapin::protocol::basic::AMQPProperties;
use lapin::publisher_confirm::Confirmation;
use lapin::{Channel, Error as LapinError};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::error;

/// Represents a failure to publish a message.
#[derive(Error, Debug)]
pub enum PublishError {
    /// The message body could not be serialized to JSON.
    #[error("failed to serialize the message body: {0}")]
    Encode(#[from] serde_json::Error),

    /// Neither the publish options nor the message's `event` field provide a
    /// routing key.
    #[error("no routing key: neither options nor the message's 'event' field provide one")]
    MissingRoutingKey,

    /// Establishing the connection context failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Establishing the channel context failed.
    #[error(transparent)]
    ChannelSetup(#[from] ChannelError),

    /// The channel context holds no live channel.
    #[error("no live channel available for publishing")]
    NoChannel,

    /// The transport refused the publish.
    #[error(transparent)]
    Transport(#[from] LapinError),

    /// The broker accepted but returned the message as undeliverable.
    #[error("the broker returned the message undeliverable: reply code {reply_code} '{reply_text}'")]
    Returned {
        /// The AMQP reply code of the return.
        reply_code: u16,
        /// The AMQP reply text of the return.
        reply_text: String,
    },

    /// The broker negatively acknowledged the message (internal broker
    /// error).
    #[error("the broker negatively acknowledged the message")]
    Nacked,
}

/// An outgoing message assembled for the wire: encoded bytes, stamped
/// headers, and the resolved routing key.
pub(crate) struct Publication {
    pub(crate) bytes: Vec<u8>,
    pub(crate) headers: BusHeaders,
    pub(crate) routing_key: String,
}

/// Assembles a JSON publication from the given message and options.
///
/// The routing key resolves, in order: the explicit option, the message's
/// own `event` field, the given fallback. With all three absent the
/// publication is refused — a configuration error, never retried.
pub(crate) fn assemble<T>(
    message: &T,
    options: &PublishOptions,
    fallback_routing_key: Option<&str>,
) -> Result<Publication, PublishError>
where
    T: Serialize,
{
    let value = serde_json::to_value(message)?;

    let routing_key = options
        .routing_key()
        .map(str::to_string)
        .or_else(|| {
            value
                .get("event")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .or_else(|| fallback_routing_key.map(str::to_string))
        .ok_or(PublishError::MissingRoutingKey)?;

    let headers = BusHeaders::stamp(
        &routing_key,
        options.transaction_id().map(str::to_string),
        options.source().map(str::to_string),
        false,
    );

    let bytes = serde_json::to_vec(&value)?;

    Ok(Publication {
        bytes,
        headers,
        routing_key,
    })
}

/// Assembles a raw-bytes publication (the `isBuffer` flavor) from the given
/// bytes and options.
pub(crate) fn assemble_raw(
    bytes: Vec<u8>,
    options: &PublishOptions,
    fallback_routing_key: &str,
) -> Publication {
    let routing_key = options
        .routing_key()
        .unwrap_or(fallback_routing_key)
        .to_string();

    let headers = BusHeaders::stamp(
        &routing_key,
        options.transaction_id().map(str::to_string),
        options.source().map(str::to_string),
        true,
    );

    Publication {
        bytes,
        headers,
        routing_key,
    }
}

/// Publishes the given payload and awaits the broker's publisher confirm,
/// turning every non-confirmed outcome into an error. This is the
/// durable-enqueue guarantee: a successful return means the broker owns the
/// message.
pub(crate) async fn publish_confirmed(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    bytes: &[u8],
    properties: AMQPProperties,
) -> Result<(), PublishError> {
    let confirm = channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions::default(),
            bytes,
            properties,
        )
        .await?;

    match confirm.await? {
        Confirmation::NotRequested | Confirmation::Ack(None) => Ok(()),

        Confirmation::Ack(Some(returned)) => {
            let reply_code = returned.reply_code;
            let reply_text = returned.reply_text.to_string();

            error!(
                alert = true,
                exchange,
                routing_key,
                reply_code,
                reply_text = reply_text.as_str(),
                "The broker returned a published message as undeliverable",
            );

            Err(PublishError::Returned {
                reply_code,
                reply_text,
            })
        }

        Confirmation::Nack(_) => {
            error!(
                alert = true,
                exchange,
                routing_key,
                "The broker negatively acknowledged a published message",
            );

            Err(PublishError::Nacked)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn explicit_routing_key_wins() {
        // Given
        let message = json!({"event": "order.created", "n": 1});
        let options = PublishOptions::default().with_routing_key("order.override");

        // When
        let publication = assemble(&message, &options, None).unwrap();

        // Then
        assert_eq!(publication.routing_key, "order.override");
        assert_eq!(publication.headers.route_key(), "order.override");
    }

    #[test]
    fn event_field_is_the_fallback_route() {
        // Given
        let message = json!({"event": "order.created", "n": 1});

        // When
        let publication = assemble(&message, &PublishOptions::default(), None).unwrap();

        // Then
        assert_eq!(publication.routing_key, "order.created");
    }

    #[test]
    fn missing_routing_key_is_a_configuration_error() {
        // Given: no explicit key, no event field, no fallback
        let message = json!({"n": 1});

        // When
        let outcome = assemble(&message, &PublishOptions::default(), None);

        // Then
        assert!(matches!(
            outcome.unwrap_err(),
            PublishError::MissingRoutingKey,
        ));
    }

    #[test]
    fn the_fallback_saves_direct_sends() {
        // Given
        let message = json!({"n": 1});

        // When
        let publication = assemble(&message, &PublishOptions::default(), Some("billing")).unwrap();

        // Then
        assert_eq!(publication.routing_key, "billing");
    }

    #[test]
    fn options_stamp_the_headers() {
        // Given
        let message = json!({"event": "order.created"});
        let options = PublishOptions::default()
            .with_transaction_id("tx-42")
            .with_source("billing");

        // When
        let publication = assemble(&message, &options, None).unwrap();

        // Then
        assert_eq!(publication.headers.transaction_id(), "tx-42");
        assert_eq!(publication.headers.source(), Some("billing"));
        assert!(!publication.headers.is_buffer());
    }

    #[test]
    fn raw_publications_are_buffers() {
        // When
        let publication = assemble_raw(vec![1, 2, 3], &PublishOptions::default(), "billing");

        // Then
        assert!(publication.headers.is_buffer());
        assert_eq!(publication.routing_key, "billing");
        assert_eq!(publication.bytes, vec![1, 2, 3]);
    }
}
