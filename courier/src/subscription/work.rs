//! Erased per-binding adapters turning raw deliveries into work items.
//!
//! Each registration produces a typed adapter that knows how to decode the
//! payload, invoke the handler, and translate the outcome into the wire
//! protocol of its mode. The dispatcher only ever sees uniform closures.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use async_nats::jetstream::AckKind;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::handler::{Handler, Inbound};
use crate::metrics::{HandlerStatus, Metrics};
use crate::payload::{preview, Payload};
use crate::queue::WorkItem;

/// A raw delivery, before decoding. The work item built from it is the
/// unique owner of the underlying message until acknowledgement.
pub(crate) enum Delivery {
    Jet(async_nats::jetstream::Message),
    Core {
        message: async_nats::Message,
        client: async_nats::Client,
    },
}

impl Delivery {
    fn subject(&self) -> &str {
        match self {
            Delivery::Jet(msg) => msg.subject.as_str(),
            Delivery::Core { message, .. } => message.subject.as_str(),
        }
    }

    fn payload(&self) -> &Bytes {
        match self {
            Delivery::Jet(msg) => &msg.payload,
            Delivery::Core { message, .. } => &message.payload,
        }
    }

    fn reply(&self) -> Option<String> {
        match self {
            Delivery::Jet(msg) => msg.reply.as_ref().map(|s| s.to_string()),
            Delivery::Core { message, .. } => message.reply.as_ref().map(|s| s.to_string()),
        }
    }

    fn headers(&self) -> Option<async_nats::HeaderMap> {
        match self {
            Delivery::Jet(msg) => msg.headers.clone(),
            Delivery::Core { message, .. } => message.headers.clone(),
        }
    }
}

/// Object-safe factory for work items, one per binding.
pub(crate) trait HandlerAdapter: Send + Sync {
    fn make(&self, delivery: Delivery) -> WorkItem;
}

pub(crate) struct TypedAdapter<T, H> {
    handler: Arc<H>,
    metrics: Metrics,
    _payload: PhantomData<fn() -> T>,
}

impl<T, H> TypedAdapter<T, H>
where
    T: Payload,
    H: Handler<T>,
{
    pub(crate) fn new(handler: H, metrics: Metrics) -> Self {
        Self {
            handler: Arc::new(handler),
            metrics,
            _payload: PhantomData,
        }
    }
}

impl<T, H> HandlerAdapter for TypedAdapter<T, H>
where
    T: Payload,
    H: Handler<T>,
{
    fn make(&self, delivery: Delivery) -> WorkItem {
        let handler = Arc::clone(&self.handler);
        let metrics = self.metrics.clone();
        let subject = delivery.subject().to_string();
        WorkItem::new(subject, move |ct| {
            execute::<T, H>(handler, metrics, delivery, ct)
        })
    }
}

/// Runs one work item to completion: decode, invoke, acknowledge.
async fn execute<T, H>(handler: Arc<H>, metrics: Metrics, delivery: Delivery, ct: CancellationToken)
where
    T: Payload,
    H: Handler<T>,
{
    let subject = delivery.subject().to_string();

    let payload = match T::decode(delivery.payload()) {
        Ok(payload) => payload,
        Err(err) => {
            // JetStream: no ack, the broker redelivers until its policy
            // terminates the message. Core: dropped.
            warn!(
                subject = %subject,
                error = %err,
                payload_preview = %preview(delivery.payload()),
                "failed to decode payload; skipping message"
            );
            metrics.record_error("decode", &subject);
            return;
        }
    };

    let inbound = Inbound {
        subject: subject.clone(),
        payload,
        reply: delivery.reply(),
        headers: delivery.headers(),
    };

    let started = Instant::now();
    let result = handler.handle(inbound, ct).await;
    let elapsed = started.elapsed();

    match (result, delivery) {
        (Ok(outcome), Delivery::Jet(msg)) => {
            metrics.record_handled(handler.name(), &subject, HandlerStatus::Ok, false, elapsed);
            let kind = if outcome.acknowledged {
                AckKind::Ack
            } else if outcome.should_retry {
                AckKind::Nak(outcome.ack.and_then(|a| a.nak_delay))
            } else {
                AckKind::Term
            };
            if let Err(err) = msg.ack_with(kind).await {
                error!(subject = %subject, error = %err, "failed to acknowledge message");
            }
        }
        (Ok(outcome), Delivery::Core { message, client }) => {
            metrics.record_handled(handler.name(), &subject, HandlerStatus::Ok, false, elapsed);
            if let (Some(reply), Some(to)) = (outcome.reply, message.reply) {
                if let Err(err) = client.publish(to, reply).await {
                    warn!(subject = %subject, error = %err, "failed to send reply");
                }
            }
        }
        (Err(err), Delivery::Jet(_)) => {
            // Left unacked on purpose; JetStream redelivers.
            error!(
                subject = %subject,
                handler = %handler.name(),
                error = ?err,
                "handler failed; message left for redelivery"
            );
            metrics.record_handled(handler.name(), &subject, HandlerStatus::Fail, true, elapsed);
        }
        (Err(err), Delivery::Core { .. }) => {
            error!(
                subject = %subject,
                handler = %handler.name(),
                error = ?err,
                "handler failed; dropping core message"
            );
            metrics.record_handled(handler.name(), &subject, HandlerStatus::Fail, false, elapsed);
        }
    }
}
