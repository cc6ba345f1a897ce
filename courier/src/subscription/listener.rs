//! Listener half of a subscription processor: pulls raw messages off NATS
//! and enqueues work items.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use async_nats::jetstream::{self, consumer::PullConsumer};
use futures_util::{StreamExt, TryStreamExt};
use subjects::SubjectMatcher;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::work::{Delivery, HandlerAdapter};
use super::Binding;
use crate::placeholders;
use crate::queue::{QueueError, WorkQueue};

/// Durable mode: attach to the pre-existing consumer and feed the queue.
pub(crate) async fn run_jetstream(
    js: jetstream::Context,
    consumer_id: String,
    bindings: Vec<Binding>,
    matcher: Arc<SubjectMatcher>,
    queue: Arc<WorkQueue>,
    token: CancellationToken,
) -> Result<()> {
    let subjects: Vec<&str> = bindings.iter().map(|b| b.subject.as_str()).collect();
    let stream_name = resolve_stream(&js, &subjects).await?;
    let stream = js
        .get_stream(&stream_name)
        .await
        .map_err(|err| anyhow::anyhow!("failed to open stream '{stream_name}': {err}"))?;

    // Consumers are provisioned out of band; attaching to a missing one is a
    // deployment error.
    let consumer: PullConsumer = stream.get_consumer(&consumer_id).await.map_err(|err| {
        anyhow::anyhow!(
            "durable consumer '{consumer_id}' not found on stream '{stream_name}': {err}"
        )
    })?;

    info!(
        consumer = %consumer_id,
        stream = %stream_name,
        subjects = ?subjects,
        "attached to durable consumer"
    );

    let adapters: HashMap<&str, &Arc<dyn HandlerAdapter>> = bindings
        .iter()
        .map(|b| (b.subject.as_str(), &b.adapter))
        .collect();

    let mut messages = consumer
        .messages()
        .await
        .map_err(|err| anyhow::anyhow!("failed to open message stream: {err}"))?;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!(consumer = %consumer_id, "listener shutting down");
                return Ok(());
            }
            next = messages.next() => match next {
                Some(Ok(msg)) => {
                    let subject = msg.subject.to_string();
                    let Some(pattern) = matcher.resolve(&subject) else {
                        warn!(subject = %subject, "no binding matches subject; skipping");
                        continue;
                    };
                    let Some(adapter) = adapters.get(pattern) else {
                        warn!(subject = %subject, pattern = %pattern, "matched pattern has no adapter; skipping");
                        continue;
                    };
                    let item = adapter.make(Delivery::Jet(msg));
                    match queue.push(item, &token).await {
                        Ok(()) => {}
                        Err(QueueError::Cancelled) => return Ok(()),
                        Err(QueueError::Closed) => bail!("work queue closed while listener running"),
                    }
                }
                Some(Err(err)) => {
                    warn!(consumer = %consumer_id, error = %err, "transient error on message stream");
                }
                None => bail!("message stream for consumer '{consumer_id}' ended unexpectedly"),
            }
        }
    }
}

/// Core mode: plain (queue-group) subscription on the single bound subject.
pub(crate) async fn run_core(
    nats: async_nats::Client,
    binding: Binding,
    queue: Arc<WorkQueue>,
    token: CancellationToken,
) -> Result<()> {
    let queue_group = binding.queue_group.as_deref().map(placeholders::resolve);

    let mut subscription = match queue_group {
        Some(group) if !group.is_empty() => {
            info!(subject = %binding.subject, queue_group = %group, "subscribing with queue group");
            nats.queue_subscribe(binding.subject.clone(), group)
                .await
                .with_context(|| format!("failed to subscribe to '{}'", binding.subject))?
        }
        _ => {
            info!(subject = %binding.subject, "subscribing without queue group");
            nats.subscribe(binding.subject.clone())
                .await
                .with_context(|| format!("failed to subscribe to '{}'", binding.subject))?
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                let _ = subscription.unsubscribe().await;
                info!(subject = %binding.subject, "listener shutting down");
                return Ok(());
            }
            next = subscription.next() => match next {
                Some(message) => {
                    let item = binding.adapter.make(Delivery::Core {
                        message,
                        client: nats.clone(),
                    });
                    match queue.push(item, &token).await {
                        Ok(()) => {}
                        Err(QueueError::Cancelled) => return Ok(()),
                        Err(QueueError::Closed) => bail!("work queue closed while listener running"),
                    }
                }
                None => bail!("core subscription to '{}' ended unexpectedly", binding.subject),
            }
        }
    }
}

/// Finds the one stream whose subject set captures every bound subject.
/// Zero streams, several streams, or bindings spanning different streams are
/// deployment errors.
async fn resolve_stream(js: &jetstream::Context, bound: &[&str]) -> Result<String> {
    let mut streams = js.streams();
    let mut stream_subjects: Vec<(String, Vec<String>)> = Vec::new();
    while let Some(info) = streams
        .try_next()
        .await
        .map_err(|err| anyhow::anyhow!("failed to list streams: {err}"))?
    {
        stream_subjects.push((info.config.name.clone(), info.config.subjects.clone()));
    }

    let mut capturing: BTreeSet<String> = BTreeSet::new();
    for subject in bound {
        let matching: Vec<&str> = stream_subjects
            .iter()
            .filter(|(_, patterns)| patterns.iter().any(|p| subjects::covers(p, subject)))
            .map(|(name, _)| name.as_str())
            .collect();
        match matching.len() {
            0 => bail!("no stream captures subject '{subject}'"),
            1 => {
                capturing.insert(matching[0].to_string());
            }
            _ => bail!("multiple streams capture subject '{subject}': {matching:?}"),
        }
    }

    if capturing.len() != 1 {
        bail!("bindings span multiple streams: {capturing:?}");
    }
    Ok(capturing.into_iter().next().expect("one capturing stream"))
}
