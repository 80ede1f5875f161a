use crate::dispatch::policy::Dispatcher;
use crate::events::BusEvent;
use crate::handler::{Body, Delivered, Finalization};
use crate::headers::BusHeaders;
use crate::subscription::Subscription;
use crate::transport::inbound::envelope::{
    DecodeFailure, Envelope, abandon_delivery, backwash_delivery, complete_delivery,
};
use crate::transport::outbound::publisher::publish_confirmed;
use lapin::Channel;
use lapin::acker::Acker;
use lapin::message::Delivery;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

/// Names the error queue of a queue.
pub(crate) fn error_queue_of(queue: &str) -> String {
    format!("{}.error", queue)
}

/// Names the poison queue of a queue.
pub(crate) fn poison_queue_of(queue: &str) -> String {
    format!("{}.poison", queue)
}

/// Processes the inbound deliveries of one subscription: materializes the
/// envelope, enforces the origin/poison/routing policy, runs the matched
/// handler through the configured dispatcher, and commits the handler's
/// verdict back to the channel.
///
/// Message-level failures are never raised to the consumer loop — every
/// delivery resolves to a terminal outcome plus a bus-level event, so one bad
/// message cannot affect unrelated deliveries.
pub(crate) struct InboundPipeline {
    queue: Arc<str>,
    subscription: Arc<Subscription>,
    dispatcher: Arc<dyn Dispatcher>,
    channel: Channel,
    events: broadcast::Sender<BusEvent>,
}

impl InboundPipeline {
    pub(crate) fn new(
        queue: Arc<str>,
        subscription: Arc<Subscription>,
        dispatcher: Arc<dyn Dispatcher>,
        channel: Channel,
        events: broadcast::Sender<BusEvent>,
    ) -> Self {
        Self {
            queue,
            subscription,
            dispatcher,
            channel,
            events,
        }
    }

    /// Runs one delivery through the pipeline.
    pub(crate) async fn process(&self, delivery: Delivery) {
        let options = self.subscription.options();

        // Validate the message origin on the headers alone, before spending
        // any effort on decoding
        let headers = BusHeaders::from_properties(&delivery.properties);

        if options.validate_publisher() && !headers.has_signature() {
            warn!(
                queue = self.queue.as_ref(),
                transaction_id = headers.transaction_id(),
                "Rejecting a message not of bus origin",
            );

            return self
                .reject_undispatched(delivery, headers, "message not of bus origin".to_string())
                .await;
        }

        if options.validate_version() && !headers.version_matches() {
            let reason = format!(
                "producer version mismatch: expected '{}', got '{}'",
                BusHeaders::signature(),
                headers.producer_version().unwrap_or("<none>"),
            );

            warn!(
                queue = self.queue.as_ref(),
                transaction_id = headers.transaction_id(),
                reason = reason.as_str(),
                "Rejecting a message with a mismatched producer version",
            );

            return self.reject_undispatched(delivery, headers, reason).await;
        }

        // Materialize the envelope; an undecodable body is a poison message
        let envelope = match Envelope::try_from(self.queue.clone(), delivery) {
            Ok(envelope) => envelope,
            Err(failure) => {
                if options.reject_poison_messages() {
                    return self.poison(failure).await;
                }

                // Poison rejection is off: the handler gets the raw bytes
                Envelope::from_failure(self.queue.clone(), failure)
            }
        };

        // Resolve the route to at most one handler
        let route = envelope.route().to_string();
        let Some((_, handler)) = self.subscription.handlers().resolve(&route) else {
            return self.unrouted(route, envelope).await;
        };
        let handler = handler.clone();

        // Hand the delivery over to the dispatch policy; the payload feeds
        // the partition key selectors
        let payload = envelope.body().as_json().cloned();
        let delivered = Delivered::new(
            self.queue.clone(),
            envelope.body().clone(),
            envelope.headers().clone(),
        );

        let queue = self.queue.clone();
        let channel = self.channel.clone();
        let events = self.events.clone();
        let max_retry_count = options.max_retry_count();

        let job = async move {
            let verdict = handler.handle(delivered).await;

            commit_delivery(&channel, &events, &queue, envelope, verdict, max_retry_count).await;
        };

        self.dispatcher
            .push(self.queue.as_ref(), payload.as_ref(), Box::pin(job));
    }

    /// Commits a pipeline-decided verdict without handler involvement.
    async fn commit(&self, envelope: Envelope, verdict: Finalization) {
        commit_delivery(
            &self.channel,
            &self.events,
            &self.queue,
            envelope,
            verdict,
            self.subscription.options().max_retry_count(),
        )
        .await;
    }

    /// Rejects a message that failed the origin/version validation, without
    /// handler invocation.
    async fn reject_undispatched(&self, delivery: Delivery, headers: BusHeaders, reason: String) {
        let Delivery {
            data: bytes, acker, ..
        } = delivery;

        let mut stamped = headers;
        stamped.stamp_rejected(reason);

        let target = error_queue_of(&self.queue);
        let body = Body::Bytes(bytes.clone());

        if self.divert(bytes, Some(acker), &target, &stamped).await {
            let _ = self.events.send(BusEvent::MessageRejected {
                queue: self.queue.clone(),
                headers: stamped,
                body,
            });
        }
    }

    /// Sends an undecodable message to the poison queue, without handler
    /// invocation.
    async fn poison(&self, failure: DecodeFailure) {
        let DecodeFailure {
            headers: mut stamped,
            bytes,
            acker,
            error,
            ..
        } = failure;

        warn!(
            alert = true,
            queue = self.queue.as_ref(),
            transaction_id = stamped.transaction_id(),
            error = error.as_str(),
            byte_preview = String::from_utf8_lossy(&bytes).as_ref(),
            "Sending an undecodable message to the poison queue",
        );

        stamped.stamp_rejected(format!("poison message: {}", error));

        let target = poison_queue_of(&self.queue);

        if self.divert(bytes, acker, &target, &stamped).await {
            let _ = self.events.send(BusEvent::MessagePoisoned {
                queue: self.queue.clone(),
                headers: stamped,
            });
        }
    }

    /// Republishes the given bytes to a companion queue and finalizes the
    /// original delivery: acknowledged on success, requeued unchanged on
    /// failure (so the message is not lost). Reports whether the republish
    /// went through.
    async fn divert(
        &self,
        bytes: Vec<u8>,
        acker: Option<Acker>,
        target: &str,
        stamped: &BusHeaders,
    ) -> bool {
        let published = publish_confirmed(
            &self.channel,
            "",
            target,
            &bytes,
            stamped.properties(true),
        )
        .await;

        match published {
            Ok(()) => {
                if let Some(acker) = acker {
                    complete_delivery(&self.queue, &acker, &bytes).await;
                }

                true
            }
            Err(error) => {
                warn!(
                    queue = self.queue.as_ref(),
                    target_queue = target,
                    ?error,
                    error_message = %error,
                    "Failed to republish; requeueing the original delivery",
                );

                if let Some(acker) = acker {
                    backwash_delivery(&self.queue, &acker, &bytes).await;
                }

                false
            }
        }
    }

    /// Resolves a message whose route matched no registered handler.
    async fn unrouted(&self, route: String, envelope: Envelope) {
        warn!(
            queue = self.queue.as_ref(),
            route = route.as_str(),
            transaction_id = envelope.headers().transaction_id(),
            "No handler matched the message route",
        );

        let _ = self.events.send(BusEvent::MessageUnrouted {
            queue: self.queue.clone(),
            headers: envelope.headers().clone(),
            route: route.clone(),
        });

        if self.subscription.options().reject_unrouted_messages() {
            let reason = format!("no handler registered for route '{}'", route);

            return self.commit(envelope, Finalization::reject(reason)).await;
        }

        // Without the rejection policy, leave the message to the broker's
        // dead-letter arrangement
        if let Some(acker) = envelope.take_acker() {
            abandon_delivery(&self.queue, &acker, envelope.bytes()).await;
        }
    }
}

/// The side effect a finalization verdict resolves to.
#[derive(Debug, PartialEq)]
pub(crate) enum OutcomePlan {
    /// Acknowledge the original message; nothing is republished.
    Ack,
    /// Republish the (re-stamped) message to a target queue, then
    /// acknowledge the original.
    Republish {
        target_queue: String,
        headers: BusHeaders,
        outcome: RepublishOutcome,
    },
}

/// Distinguishes the two republishing flavors for event reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RepublishOutcome {
    Rejected,
    Requeued,
}

/// Decides, purely, what a verdict means for a message with the given
/// headers: which queue (if any) receives a republish, and with which header
/// stamps. A requeue that would push the retry counter past
/// `max_retry_count` converts into a reject that preserves the counter and
/// the original transaction identity.
pub(crate) fn plan_outcome(
    queue: &str,
    mut headers: BusHeaders,
    verdict: Finalization,
    max_retry_count: u32,
) -> OutcomePlan {
    match verdict {
        Finalization::Ack => OutcomePlan::Ack,

        Finalization::Reject {
            reason,
            error_queue,
        } => {
            headers.stamp_rejected(reason);

            OutcomePlan::Republish {
                target_queue: error_queue.unwrap_or_else(|| error_queue_of(queue)),
                headers,
                outcome: RepublishOutcome::Rejected,
            }
        }

        Finalization::Requeue => {
            if headers.retry_count() >= max_retry_count {
                headers.stamp_rejected(format!(
                    "exceeded maximum retry count of {}",
                    max_retry_count,
                ));

                OutcomePlan::Republish {
                    target_queue: error_queue_of(queue),
                    headers,
                    outcome: RepublishOutcome::Rejected,
                }
            } else {
                headers.stamp_requeued();

                OutcomePlan::Republish {
                    target_queue: queue.to_string(),
                    headers,
                    outcome: RepublishOutcome::Requeued,
                }
            }
        }
    }
}

/// Applies a verdict to the channel: plans the outcome, performs the
/// republish (if any) as a confirmed publish, finalizes the original
/// delivery, and emits the terminal bus event.
///
/// A failed republish requeues the original delivery unchanged, so the
/// message is not lost.
pub(crate) async fn commit_delivery(
    channel: &Channel,
    events: &broadcast::Sender<BusEvent>,
    queue: &Arc<str>,
    envelope: Envelope,
    verdict: Finalization,
    max_retry_count: u32,
) {
    let plan = plan_outcome(queue, envelope.headers().clone(), verdict, max_retry_count);

    match plan {
        OutcomePlan::Ack => {
            if let Some(acker) = envelope.take_acker() {
                complete_delivery(queue, &acker, envelope.bytes()).await;
            }

            let _ = events.send(BusEvent::MessageAcked {
                queue: queue.clone(),
                headers: envelope.headers().clone(),
                body: envelope.body().clone(),
            });
        }

        OutcomePlan::Republish {
            target_queue,
            headers,
            outcome,
        } => {
            let published = publish_confirmed(
                channel,
                "",
                &target_queue,
                envelope.bytes(),
                headers.properties(true),
            )
            .await;

            match published {
                Ok(()) => {
                    if let Some(acker) = envelope.take_acker() {
                        complete_delivery(queue, &acker, envelope.bytes()).await;
                    }

                    let event = match outcome {
                        RepublishOutcome::Rejected => BusEvent::MessageRejected {
                            queue: queue.clone(),
                            headers,
                            body: envelope.body().clone(),
                        },
                        RepublishOutcome::Requeued => BusEvent::MessageRequeued {
                            queue: queue.clone(),
                            headers,
                            body: envelope.body().clone(),
                        },
                    };
                    let _ = events.send(event);
                }

                Err(error) => {
                    warn!(
                        queue = queue.as_ref(),
                        target_queue = target_queue.as_str(),
                        ?error,
                        error_message = %error,
                        "Failed to republish; requeueing the original delivery",
                    );

                    if let Some(acker) = envelope.take_acker() {
                        backwash_delivery(queue, &acker, envelope.bytes()).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn headers_with_retries(retries: u32) -> BusHeaders {
        let mut headers = BusHeaders::stamp("order.created", Some("tx-1".into()), None, false);
        for _ in 0..retries {
            headers.stamp_requeued();
        }
        headers
    }

    #[test]
    fn ack_plans_an_ack() {
        // When
        let plan = plan_outcome("billing", headers_with_retries(0), Finalization::Ack, 3);

        // Then
        assert_eq!(plan, OutcomePlan::Ack);
    }

    #[test]
    fn reject_targets_the_error_queue_and_stamps_the_reason() {
        // When
        let plan = plan_outcome(
            "billing",
            headers_with_retries(1),
            Finalization::reject("handler gave up"),
            3,
        );

        // Then
        let OutcomePlan::Republish {
            target_queue,
            headers,
            outcome,
        } = plan
        else {
            panic!("expected a republish plan");
        };
        assert_eq!(target_queue, "billing.error");
        assert_eq!(outcome, RepublishOutcome::Rejected);
        assert_eq!(headers.reason(), Some("handler gave up"));
        assert!(headers.errored_at().is_some());

        // Then: the original identity survives the reject
        assert_eq!(headers.transaction_id(), "tx-1");
        assert_eq!(headers.retry_count(), 1);
    }

    #[test]
    fn reject_honors_a_caller_specified_error_queue() {
        // When
        let plan = plan_outcome(
            "billing",
            headers_with_retries(0),
            Finalization::reject_to("handler gave up", "billing.dead"),
            3,
        );

        // Then
        let OutcomePlan::Republish { target_queue, .. } = plan else {
            panic!("expected a republish plan");
        };
        assert_eq!(target_queue, "billing.dead");
    }

    #[test]
    fn requeue_increments_and_targets_the_source_queue() {
        // When
        let plan = plan_outcome("billing", headers_with_retries(1), Finalization::Requeue, 3);

        // Then
        let OutcomePlan::Republish {
            target_queue,
            headers,
            outcome,
        } = plan
        else {
            panic!("expected a republish plan");
        };
        assert_eq!(target_queue, "billing");
        assert_eq!(outcome, RepublishOutcome::Requeued);
        assert_eq!(headers.retry_count(), 2);
        assert!(headers.requeued_at().is_some());
    }

    #[test]
    fn requeue_past_the_budget_converts_to_reject() {
        // Given: the message has already been requeued three times
        let headers = headers_with_retries(3);

        // When: a fourth requeue is requested against a budget of three
        let plan = plan_outcome("billing", headers, Finalization::Requeue, 3);

        // Then: it becomes a reject that preserves the count and identity
        let OutcomePlan::Republish {
            target_queue,
            headers,
            outcome,
        } = plan
        else {
            panic!("expected a republish plan");
        };
        assert_eq!(target_queue, "billing.error");
        assert_eq!(outcome, RepublishOutcome::Rejected);
        assert_eq!(headers.retry_count(), 3);
        assert_eq!(headers.transaction_id(), "tx-1");
        assert_eq!(
            headers.reason(),
            Some("exceeded maximum retry count of 3"),
        );
    }

    #[test]
    fn requeues_up_to_the_budget_stay_requeues() {
        // When: retry counts 0, 1, 2 against a budget of 3
        for retries in 0..3 {
            let plan = plan_outcome(
                "billing",
                headers_with_retries(retries),
                Finalization::Requeue,
                3,
            );

            // Then
            assert!(matches!(
                plan,
                OutcomePlan::Republish {
                    outcome: RepublishOutcome::Requeued,
                    ..
                },
            ));
        }
    }

    #[test]
    fn queue_name_derivations() {
        // Then
        assert_eq!(error_queue_of("billing"), "billing.error");
        assert_eq!(poison_queue_of("billing"), "billing.poison");
    }
}
