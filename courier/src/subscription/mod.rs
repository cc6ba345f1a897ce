//! Subscription processors: one logical consumer identity bridging a single
//! NATS subscription to its handlers through the bounded work queue.

mod dispatcher;
mod listener;
pub(crate) mod work;

use std::sync::Arc;

use anyhow::{ensure, Context as _, Result};
use subjects::SubjectMatcher;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::client::Client;
use crate::config::CoreConfig;
use crate::queue::WorkQueue;
use work::HandlerAdapter;

/// One subject-to-handler binding, built by the registry.
#[derive(Clone)]
pub(crate) struct Binding {
    pub subject: String,
    pub queue_group: Option<String>,
    pub durable: bool,
    pub consumer_id: String,
    pub adapter: Arc<dyn HandlerAdapter>,
}

/// Owns one consumer identity: a listener feeding the bounded queue and a
/// dispatcher draining it under the degree-of-parallelism limit.
pub struct SubscriptionProcessor {
    consumer_id: String,
    durable: bool,
    bindings: Vec<Binding>,
    matcher: Arc<SubjectMatcher>,
    config: CoreConfig,
}

impl SubscriptionProcessor {
    pub(crate) fn new(
        consumer_id: String,
        durable: bool,
        bindings: Vec<Binding>,
        config: CoreConfig,
    ) -> Result<Self> {
        ensure!(
            !bindings.is_empty(),
            "consumer '{consumer_id}' has no bindings"
        );
        ensure!(
            bindings.iter().all(|b| !b.subject.is_empty()),
            "consumer '{consumer_id}' has a binding with an empty subject"
        );
        if !durable {
            ensure!(
                bindings.len() == 1,
                "core-mode consumer '{consumer_id}' must bind exactly one subject, got {}",
                bindings.len()
            );
        }
        let matcher = Arc::new(SubjectMatcher::new(bindings.iter().map(|b| &b.subject)));
        Ok(Self {
            consumer_id,
            durable,
            bindings,
            matcher,
            config,
        })
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn subjects(&self) -> Vec<&str> {
        self.bindings.iter().map(|b| b.subject.as_str()).collect()
    }

    /// Runs listener and dispatcher until cancellation or a fatal fault.
    /// A fault in either task cancels the peer before the error surfaces.
    pub async fn run(&self, client: &Client, ct: CancellationToken) -> Result<()> {
        let token = ct.child_token();
        let queue = Arc::new(WorkQueue::new(self.config.queue_capacity));

        info!(
            consumer = %self.consumer_id,
            durable = self.durable,
            subjects = ?self.subjects(),
            max_dop = self.config.max_dop,
            queue_capacity = self.config.queue_capacity,
            "starting subscription processor"
        );

        let mut listener = {
            let queue = Arc::clone(&queue);
            let token = token.clone();
            if self.durable {
                let js = client.jetstream().clone();
                let consumer_id = self.consumer_id.clone();
                let bindings = self.bindings.clone();
                let matcher = Arc::clone(&self.matcher);
                tokio::spawn(async move {
                    listener::run_jetstream(js, consumer_id, bindings, matcher, queue, token).await
                })
            } else {
                let nats = client.nats().clone();
                let binding = self.bindings[0].clone();
                tokio::spawn(
                    async move { listener::run_core(nats, binding, queue, token).await },
                )
            }
        };

        let mut dispatcher = {
            let queue = Arc::clone(&queue);
            let token = token.clone();
            tokio::spawn(dispatcher::run(
                queue,
                self.config.max_dop,
                self.config.batching,
                self.config.batch_idle,
                token,
            ))
        };

        let (first_name, first) = tokio::select! {
            joined = &mut listener => ("listener", joined),
            joined = &mut dispatcher => ("dispatcher", joined),
        };
        token.cancel();
        let (second_name, second) = if first_name == "listener" {
            ("dispatcher", dispatcher.await)
        } else {
            ("listener", listener.await)
        };

        for (name, joined) in [(first_name, first), (second_name, second)] {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    return Err(err).with_context(|| {
                        format!("{name} of consumer '{}' failed", self.consumer_id)
                    });
                }
                Err(join_err) => anyhow::bail!(
                    "{name} of consumer '{}' panicked: {join_err}",
                    self.consumer_id
                ),
            }
        }

        info!(consumer = %self.consumer_id, "subscription processor stopped");
        Ok(())
    }
}
