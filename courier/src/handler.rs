//! The handler contract: typed inbound messages and acknowledgement outcomes.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::payload::Payload;

/// Typed view of one delivered message.
#[derive(Debug, Clone)]
pub struct Inbound<T> {
    /// Concrete subject the message arrived on.
    pub subject: String,
    pub payload: T,
    /// Reply subject, when the publisher expects a response (core mode).
    pub reply: Option<String>,
    pub headers: Option<async_nats::HeaderMap>,
}

/// Extra acknowledgement parameters.
#[derive(Debug, Clone, Default)]
pub struct AckOptions {
    /// Redelivery delay hint attached to a NAK.
    pub nak_delay: Option<Duration>,
}

/// What the dispatcher should tell the broker after a handler ran.
///
/// `acknowledged` wins over `should_retry`: an acknowledged outcome is acked
/// regardless of the retry flag.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub acknowledged: bool,
    pub should_retry: bool,
    pub reply: Option<Bytes>,
    pub ack: Option<AckOptions>,
}

impl Outcome {
    /// Message handled; remove it.
    pub fn ack() -> Self {
        Self {
            acknowledged: true,
            should_retry: false,
            reply: None,
            ack: None,
        }
    }

    /// Message rejected for good; do not redeliver.
    pub fn term() -> Self {
        Self {
            acknowledged: false,
            should_retry: false,
            reply: None,
            ack: None,
        }
    }

    /// Message failed transiently; redeliver per consumer policy.
    pub fn nak() -> Self {
        Self {
            acknowledged: false,
            should_retry: true,
            reply: None,
            ack: None,
        }
    }

    pub fn with_reply(mut self, reply: impl Into<Bytes>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    pub fn with_nak_delay(mut self, delay: Duration) -> Self {
        self.ack.get_or_insert_with(AckOptions::default).nak_delay = Some(delay);
        self
    }
}

/// A user message handler bound to a payload type.
///
/// Returning `Err` counts as a handler fault: JetStream deliveries are left
/// unacked for redelivery, core deliveries are dropped.
#[async_trait]
pub trait Handler<T: Payload>: Send + Sync + 'static {
    async fn handle(&self, msg: Inbound<T>, ct: CancellationToken) -> anyhow::Result<Outcome>;

    /// Identifier used in logs and metrics.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}
