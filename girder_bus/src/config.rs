use crate::dispatch::policy::DispatchType;
use crate::handle::Handle;
use serde::Deserialize;
use serde_json::Value;

/// The application-level configuration of a [`Bus`](crate::Bus): the broker
/// [`Handle`] plus the exchange the bus publishes through.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    handle: Handle,
    exchange: ExchangeSettings,
}

impl BusConfig {
    /// Returns the broker handle of this configuration.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Returns the exchange settings of this configuration.
    pub fn exchange(&self) -> &ExchangeSettings {
        &self.exchange
    }

    /// Re-creates this config with the given [`Handle`].
    pub fn with_handle(self, handle: Handle) -> Self {
        Self { handle, ..self }
    }

    /// Re-creates this config with the given [`ExchangeSettings`].
    pub fn with_exchange(self, exchange: ExchangeSettings) -> Self {
        Self { exchange, ..self }
    }
}

impl AsRef<BusConfig> for BusConfig {
    fn as_ref(&self) -> &BusConfig {
        self
    }
}

/// Describes the exchange that carries published bus traffic.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    name: String,
    kind: ExchangeKind,
    durable: bool,
}

impl ExchangeSettings {
    /// Creates settings for a durable exchange of the given name and kind.
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
        }
    }

    /// Reports the exchange name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reports the exchange kind.
    pub fn kind(&self) -> ExchangeKind {
        self.kind
    }

    /// Reports the exchange durability flag.
    pub fn durable(&self) -> bool {
        self.durable
    }
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            name: "girder".to_string(),
            kind: ExchangeKind::Topic,
            durable: true,
        }
    }
}

/// The supported exchange kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Routes on an exact routing-key match.
    Direct,
    /// Routes to every bound queue.
    Fanout,
    /// Routes on wildcard routing-key patterns.
    #[default]
    Topic,
    /// Routes on header matching.
    Headers,
}

impl ExchangeKind {
    /// Returns the equivalent `lapin` exchange kind.
    pub(crate) fn lapin_value(self) -> lapin::ExchangeKind {
        match self {
            Self::Direct => lapin::ExchangeKind::Direct,
            Self::Fanout => lapin::ExchangeKind::Fanout,
            Self::Topic => lapin::ExchangeKind::Topic,
            Self::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

/// The per-subscription knobs recognized by
/// [`Bus::subscribe`](crate::Bus::subscribe).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SubscribeOptions {
    meta: Option<Value>,
    #[serde(alias = "maxRetryCount")]
    max_retry_count: u32,
    #[serde(alias = "validatePublisher")]
    validate_publisher: bool,
    #[serde(alias = "validateVersion")]
    validate_version: bool,
    #[serde(alias = "disableQueueBind")]
    disable_queue_bind: bool,
    #[serde(alias = "disableQueueCreate")]
    disable_queue_create: bool,
    #[serde(alias = "disableExchangeCreate")]
    disable_exchange_create: bool,
    #[serde(alias = "rejectUnroutedMessages")]
    reject_unrouted_messages: bool,
    #[serde(alias = "rejectPoisonMessages")]
    reject_poison_messages: bool,
    prefetch: Option<u16>,
    #[serde(alias = "dispatchType")]
    dispatch_type: DispatchType,
    #[serde(alias = "serialDispatchPartitionKeySelectors")]
    serial_dispatch_partition_key_selectors: Vec<String>,
}

impl SubscribeOptions {
    /// Exposes the opaque caller metadata attached to the subscription.
    pub fn meta(&self) -> Option<&Value> {
        self.meta.as_ref()
    }

    /// Reports how many requeues a message is allowed before the pipeline
    /// converts the next requeue into a reject.
    pub fn max_retry_count(&self) -> u32 {
        self.max_retry_count
    }

    /// Reports whether messages without a bus producer signature are
    /// rejected without handler invocation.
    pub fn validate_publisher(&self) -> bool {
        self.validate_publisher
    }

    /// Reports whether messages with a mismatched producer version are
    /// rejected without handler invocation.
    pub fn validate_version(&self) -> bool {
        self.validate_version
    }

    /// Reports whether queue binding is skipped during subscribe.
    pub fn disable_queue_bind(&self) -> bool {
        self.disable_queue_bind
    }

    /// Reports whether queue declaration is skipped during subscribe.
    pub fn disable_queue_create(&self) -> bool {
        self.disable_queue_create
    }

    /// Reports whether exchange declaration is skipped during subscribe.
    pub fn disable_exchange_create(&self) -> bool {
        self.disable_exchange_create
    }

    /// Reports whether unrouted messages are rejected to the error queue.
    pub fn reject_unrouted_messages(&self) -> bool {
        self.reject_unrouted_messages
    }

    /// Reports whether undecodable messages are auto-rejected to the poison
    /// queue without handler invocation.
    pub fn reject_poison_messages(&self) -> bool {
        self.reject_poison_messages
    }

    /// Reports the prefetch limit applied to the subscription's channel.
    pub fn prefetch(&self) -> Option<u16> {
        self.prefetch
    }

    /// Reports the dispatch-scheduling policy of the subscription.
    pub fn dispatch_type(&self) -> DispatchType {
        self.dispatch_type
    }

    /// Reports the partition key selectors of the partitioned-serial policy.
    pub fn serial_dispatch_partition_key_selectors(&self) -> &[String] {
        &self.serial_dispatch_partition_key_selectors
    }
}

impl SubscribeOptions {
    /// Re-creates these options with the given caller metadata.
    pub fn with_meta(self, meta: Value) -> Self {
        Self {
            meta: Some(meta),
            ..self
        }
    }

    /// Re-creates these options with the given retry budget.
    pub fn with_max_retry_count(self, max_retry_count: u32) -> Self {
        Self {
            max_retry_count,
            ..self
        }
    }

    /// Re-creates these options with publisher validation switched on or off.
    pub fn with_validate_publisher(self, validate_publisher: bool) -> Self {
        Self {
            validate_publisher,
            ..self
        }
    }

    /// Re-creates these options with version validation switched on or off.
    pub fn with_validate_version(self, validate_version: bool) -> Self {
        Self {
            validate_version,
            ..self
        }
    }

    /// Re-creates these options with queue binding switched off or on.
    pub fn with_disable_queue_bind(self, disable_queue_bind: bool) -> Self {
        Self {
            disable_queue_bind,
            ..self
        }
    }

    /// Re-creates these options with queue declaration switched off or on.
    pub fn with_disable_queue_create(self, disable_queue_create: bool) -> Self {
        Self {
            disable_queue_create,
            ..self
        }
    }

    /// Re-creates these options with exchange declaration switched off or on.
    pub fn with_disable_exchange_create(self, disable_exchange_create: bool) -> Self {
        Self {
            disable_exchange_create,
            ..self
        }
    }

    /// Re-creates these options with unrouted-message rejection switched on
    /// or off.
    pub fn with_reject_unrouted_messages(self, reject_unrouted_messages: bool) -> Self {
        Self {
            reject_unrouted_messages,
            ..self
        }
    }

    /// Re-creates these options with poison-message rejection switched on or
    /// off.
    pub fn with_reject_poison_messages(self, reject_poison_messages: bool) -> Self {
        Self {
            reject_poison_messages,
            ..self
        }
    }

    /// Re-creates these options with the given prefetch limit.
    pub fn with_prefetch(self, prefetch: u16) -> Self {
        Self {
            prefetch: Some(prefetch),
            ..self
        }
    }

    /// Re-creates these options with the given dispatch policy.
    pub fn with_dispatch_type(self, dispatch_type: DispatchType) -> Self {
        Self {
            dispatch_type,
            ..self
        }
    }

    /// Re-creates these options with the given partition key selectors.
    pub fn with_serial_dispatch_partition_key_selectors(
        self,
        selectors: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            serial_dispatch_partition_key_selectors: selectors
                .into_iter()
                .map(Into::into)
                .collect(),
            ..self
        }
    }
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            meta: None,
            max_retry_count: 3,
            validate_publisher: false,
            validate_version: false,
            disable_queue_bind: false,
            disable_queue_create: false,
            disable_exchange_create: false,
            reject_unrouted_messages: false,
            reject_poison_messages: true,
            prefetch: None,
            dispatch_type: DispatchType::Concurrent,
            serial_dispatch_partition_key_selectors: Vec::new(),
        }
    }
}

/// The per-message knobs recognized by [`Bus::publish`](crate::Bus::publish)
/// and [`Bus::send`](crate::Bus::send).
#[derive(Debug, Clone, PartialEq)]
pub struct PublishOptions {
    routing_key: Option<String>,
    transaction_id: Option<String>,
    source: Option<String>,
    persistent: bool,
}

impl PublishOptions {
    /// Reports the explicit routing key, overriding the message's `event`
    /// field.
    pub fn routing_key(&self) -> Option<&str> {
        self.routing_key.as_deref()
    }

    /// Reports the caller-fixed transaction identifier.
    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    /// Reports the declared origin of the message.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Reports whether the message is published as persistent.
    pub fn persistent(&self) -> bool {
        self.persistent
    }

    /// Re-creates these options with the given routing key.
    pub fn with_routing_key(self, routing_key: impl Into<String>) -> Self {
        Self {
            routing_key: Some(routing_key.into()),
            ..self
        }
    }

    /// Re-creates these options with the given transaction identifier.
    pub fn with_transaction_id(self, transaction_id: impl Into<String>) -> Self {
        Self {
            transaction_id: Some(transaction_id.into()),
            ..self
        }
    }

    /// Re-creates these options with the given origin.
    pub fn with_source(self, source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            ..self
        }
    }

    /// Re-creates these options with the persistence flag switched on or off.
    pub fn with_persistent(self, persistent: bool) -> Self {
        Self { persistent, ..self }
    }
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            routing_key: None,
            transaction_id: None,
            source: None,
            persistent: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn subscribe_options_deserialize_from_empty() {
        // Given
        let input = "{}";
        let expected_output = SubscribeOptions::default();

        // When
        let actual_output = serde_yml::from_str::<SubscribeOptions>(input).unwrap();

        // Then
        assert_eq!(expected_output, actual_output);
    }

    #[test]
    fn subscribe_options_accept_the_documented_aliases() {
        // Given
        let input = r#"
maxRetryCount: 5
validatePublisher: true
rejectUnroutedMessages: true
rejectPoisonMessages: false
prefetch: 1
dispatchType: partitionSerial
serialDispatchPartitionKeySelectors:
  - order.customerId
"#;

        // When
        let options = serde_yml::from_str::<SubscribeOptions>(input).unwrap();

        // Then
        assert_eq!(options.max_retry_count(), 5);
        assert!(options.validate_publisher());
        assert!(options.reject_unrouted_messages());
        assert!(!options.reject_poison_messages());
        assert_eq!(options.prefetch(), Some(1));
        assert_eq!(options.dispatch_type(), DispatchType::PartitionSerial);
        assert_eq!(
            options.serial_dispatch_partition_key_selectors(),
            &["order.customerId".to_string()],
        );
    }

    #[test]
    fn bus_config_deserializes_from_empty() {
        // Given
        let input = "{}";
        let expected_output = BusConfig::default();

        // When
        let actual_output = serde_yml::from_str::<BusConfig>(input).unwrap();

        // Then
        assert_eq!(expected_output, actual_output);
    }

    #[test]
    fn bus_config_deserializes_from_full() {
        // Given
        let input = r#"
handle:
  host: broker.internal
  port: 5671
exchange:
  name: orders
  kind: direct
  durable: false
"#;

        // When
        let config = serde_yml::from_str::<BusConfig>(input).unwrap();

        // Then
        assert_eq!(config.handle().identifier(), "guest@broker.internal:5671/%2F");
        assert_eq!(config.exchange().name(), "orders");
        assert_eq!(config.exchange().kind(), ExchangeKind::Direct);
        assert!(!config.exchange().durable());
    }
}
