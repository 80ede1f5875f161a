use crate::util::table::{Push, Retrieve};
use lapin::protocol::basic::AMQPProperties;
use lapin::types::{FieldTable, ShortString};
use std::time::SystemTime;
use uuid::Uuid;

/// Header carrying the transaction identifier, fixed at first publish.
pub const HEADER_TRANSACTION_ID: &str = "transactionId";
/// Header carrying the topic route of the message.
pub const HEADER_ROUTE_KEY: &str = "routeKey";
/// Header carrying the RFC-3339 instant of the first publish.
pub const HEADER_CREATED_AT: &str = "createdAt";
/// Header flagging a raw-bytes (non-JSON) body.
pub const HEADER_IS_BUFFER: &str = "isBuffer";
/// Header carrying the producing bus signature and version.
pub const HEADER_PRODUCER_VERSION: &str = "producerVersion";
/// Header counting how many times the message has been requeued.
pub const HEADER_RETRY_COUNT: &str = "retryCount";
/// Header carrying the RFC-3339 instant of the latest requeue.
pub const HEADER_REQUEUED_AT: &str = "requeuedAt";
/// Header carrying the RFC-3339 instant of the reject.
pub const HEADER_ERRORED_AT: &str = "erroredAt";
/// Header carrying the human-readable reject reason.
pub const HEADER_REASON: &str = "reason";
/// Header carrying the optional, caller-provided origin of the message.
pub const HEADER_SOURCE: &str = "source";

/// The signature half of the [`producerVersion`](HEADER_PRODUCER_VERSION)
/// header stamped on every outgoing message.
pub const BUS_SIGNATURE: &str = "girder-bus";

/// The bus-level metadata carried alongside every message body in the AMQP
/// headers table. Wire-level and body-encoding independent: a consumer can
/// interpret these headers without touching the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct BusHeaders {
    transaction_id: String,
    route_key: String,
    created_at: String,
    is_buffer: bool,
    producer_version: Option<String>,
    retry_count: u32,
    requeued_at: Option<String>,
    errored_at: Option<String>,
    reason: Option<String>,
    source: Option<String>,
}

impl BusHeaders {
    /// Stamps a fresh set of headers for a first publish: the transaction
    /// identifier (generated when not supplied), the creation instant, and
    /// this bus's producer signature are all fixed here and survive any
    /// number of requeues and rejects downstream.
    pub fn stamp(
        route_key: impl Into<String>,
        transaction_id: Option<String>,
        source: Option<String>,
        is_buffer: bool,
    ) -> Self {
        Self {
            transaction_id: transaction_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            route_key: route_key.into(),
            created_at: Self::now(),
            is_buffer,
            producer_version: Some(Self::signature()),
            retry_count: 0,
            requeued_at: None,
            errored_at: None,
            reason: None,
            source,
        }
    }

    /// Materializes headers from the properties of an incoming delivery.
    ///
    /// Messages published by foreign producers carry none of the bus headers;
    /// such messages still get a complete header set (fresh transaction
    /// identifier, empty route key, current instant), so the rest of the
    /// pipeline never deals with absent metadata.
    pub fn from_properties(properties: &AMQPProperties) -> Self {
        let table = properties.headers().clone().unwrap_or_default();

        Self {
            transaction_id: table
                .retrieve_str(HEADER_TRANSACTION_ID)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            route_key: table.retrieve_str(HEADER_ROUTE_KEY).unwrap_or_default(),
            created_at: table
                .retrieve_str(HEADER_CREATED_AT)
                .unwrap_or_else(Self::now),
            is_buffer: table.retrieve_bool(HEADER_IS_BUFFER).unwrap_or(false),
            producer_version: table.retrieve_str(HEADER_PRODUCER_VERSION),
            retry_count: table.retrieve_u32(HEADER_RETRY_COUNT).unwrap_or(0),
            requeued_at: table.retrieve_str(HEADER_REQUEUED_AT),
            errored_at: table.retrieve_str(HEADER_ERRORED_AT),
            reason: table.retrieve_str(HEADER_REASON),
            source: table.retrieve_str(HEADER_SOURCE),
        }
    }

    /// Pushes these headers into the given [`FieldTable`].
    pub fn apply(&self, table: &mut FieldTable) {
        table.push_str(HEADER_TRANSACTION_ID, &self.transaction_id);
        table.push_str(HEADER_ROUTE_KEY, &self.route_key);
        table.push_str(HEADER_CREATED_AT, &self.created_at);
        table.push_bool(HEADER_IS_BUFFER, self.is_buffer);
        table.push_u32(HEADER_RETRY_COUNT, self.retry_count);

        if let Some(ref producer_version) = self.producer_version {
            table.push_str(HEADER_PRODUCER_VERSION, producer_version);
        }
        if let Some(ref requeued_at) = self.requeued_at {
            table.push_str(HEADER_REQUEUED_AT, requeued_at);
        }
        if let Some(ref errored_at) = self.errored_at {
            table.push_str(HEADER_ERRORED_AT, errored_at);
        }
        if let Some(ref reason) = self.reason {
            table.push_str(HEADER_REASON, reason);
        }
        if let Some(ref source) = self.source {
            table.push_str(HEADER_SOURCE, source);
        }
    }

    /// Builds outgoing [`AMQPProperties`] carrying these headers, along with
    /// the delivery mode and the content type implied by
    /// [`is_buffer`](BusHeaders::is_buffer).
    pub fn properties(&self, persistent: bool) -> AMQPProperties {
        let mut table = FieldTable::default();
        self.apply(&mut table);

        let content_type = if self.is_buffer {
            "application/octet-stream"
        } else {
            "application/json"
        };

        AMQPProperties::default()
            .with_headers(table)
            .with_delivery_mode(if persistent { 2 } else { 1 })
            .with_content_type(ShortString::from(content_type))
            .with_message_id(ShortString::from(self.transaction_id.as_str()))
    }

    /// The full producer signature of this bus build.
    pub fn signature() -> String {
        format!("{}@{}", BUS_SIGNATURE, env!("CARGO_PKG_VERSION"))
    }

    fn now() -> String {
        humantime::format_rfc3339_millis(SystemTime::now()).to_string()
    }
}

impl BusHeaders {
    /// Reports the transaction identifier, fixed at first publish.
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    /// Reports the topic route of the message.
    pub fn route_key(&self) -> &str {
        &self.route_key
    }

    /// Reports the RFC-3339 instant of the first publish.
    pub fn created_at(&self) -> &str {
        &self.created_at
    }

    /// Reports whether the body is raw bytes rather than JSON.
    pub fn is_buffer(&self) -> bool {
        self.is_buffer
    }

    /// Reports the producer signature header, if present.
    pub fn producer_version(&self) -> Option<&str> {
        self.producer_version.as_deref()
    }

    /// Reports how many times the message has been requeued.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Reports the instant of the latest requeue, if any.
    pub fn requeued_at(&self) -> Option<&str> {
        self.requeued_at.as_deref()
    }

    /// Reports the instant of the reject, if any.
    pub fn errored_at(&self) -> Option<&str> {
        self.errored_at.as_deref()
    }

    /// Reports the reject reason, if any.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Reports the caller-provided origin of the message, if any.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }
}

impl BusHeaders {
    /// Reports whether the message carries any bus producer signature,
    /// regardless of version.
    pub fn has_signature(&self) -> bool {
        self.producer_version
            .as_deref()
            .is_some_and(|version| version.starts_with(BUS_SIGNATURE))
    }

    /// Reports whether the producer signature matches this bus build exactly.
    pub fn version_matches(&self) -> bool {
        self.producer_version.as_deref() == Some(Self::signature().as_str())
    }

    /// Stamps a requeue: increments the retry counter and records the requeue
    /// instant. The transaction identifier and creation instant are
    /// untouched.
    pub fn stamp_requeued(&mut self) {
        self.retry_count += 1;
        self.requeued_at = Some(Self::now());
    }

    /// Stamps a reject: records the reject instant and the reason. The retry
    /// counter, the transaction identifier, and the creation instant are
    /// untouched.
    pub fn stamp_rejected(&mut self, reason: impl Into<String>) {
        self.errored_at = Some(Self::now());
        self.reason = Some(reason.into());
    }
}
