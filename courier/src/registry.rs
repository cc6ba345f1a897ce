//! Startup-time registration of handlers and grouping into processors.
//!
//! Handlers register explicitly with a typed signature; the compiler does
//! the shape checking a reflective framework would defer to startup. The
//! registry groups bindings by consumer identity and turns each group into
//! one [`SubscriptionProcessor`].

use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::warn;

use crate::config::CoreConfig;
use crate::handler::Handler;
use crate::metrics::Metrics;
use crate::payload::Payload;
use crate::subscription::work::TypedAdapter;
use crate::subscription::{Binding, SubscriptionProcessor};

/// What to do when two registrations name the same subject pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Reject the second registration (deployment error).
    FailFast,
    /// Keep the first registration and skip the duplicate with a warning.
    Skip,
}

/// Per-registration options.
///
/// A present `consumer_id` makes the binding durable (JetStream); without
/// one the id is synthesized as `{subject}-{queue_group}` and the binding
/// consumes in core mode.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub subject: String,
    pub consumer_id: Option<String>,
    pub queue_group: Option<String>,
}

impl ConsumerOptions {
    pub fn subject(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            consumer_id: None,
            queue_group: None,
        }
    }

    pub fn durable(mut self, consumer_id: impl Into<String>) -> Self {
        self.consumer_id = Some(consumer_id.into());
        self
    }

    pub fn queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = Some(group.into());
        self
    }

    pub fn is_durable(&self) -> bool {
        self.consumer_id.is_some()
    }

    pub fn effective_consumer_id(&self) -> String {
        match &self.consumer_id {
            Some(id) => id.clone(),
            None => format!(
                "{}-{}",
                self.subject,
                self.queue_group.as_deref().unwrap_or_default()
            ),
        }
    }
}

/// Collects handler bindings at bootstrap; call-once.
pub struct ConsumerRegistry {
    policy: DuplicatePolicy,
    bindings: Vec<Binding>,
    metrics: Metrics,
}

impl std::fmt::Debug for ConsumerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerRegistry")
            .field("policy", &self.policy)
            .field("bindings_len", &self.bindings.len())
            .field("metrics", &self.metrics)
            .finish()
    }
}

impl ConsumerRegistry {
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            policy,
            bindings: Vec::new(),
            metrics: Metrics,
        }
    }

    /// Registers one handler for one subject pattern.
    pub fn register<T, H>(&mut self, options: ConsumerOptions, handler: H) -> Result<&mut Self>
    where
        T: Payload,
        H: Handler<T>,
    {
        if options.subject.is_empty() {
            bail!("cannot register a handler for an empty subject");
        }
        if self.bindings.iter().any(|b| b.subject == options.subject) {
            match self.policy {
                DuplicatePolicy::FailFast => {
                    bail!("duplicate binding for subject '{}'", options.subject)
                }
                DuplicatePolicy::Skip => {
                    warn!(subject = %options.subject, "duplicate binding skipped");
                    return Ok(self);
                }
            }
        }

        self.bindings.push(Binding {
            subject: options.subject.clone(),
            queue_group: options.queue_group.clone(),
            durable: options.is_durable(),
            consumer_id: options.effective_consumer_id(),
            adapter: Arc::new(TypedAdapter::new(handler, self.metrics.clone())),
        });
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Groups bindings by consumer identity, one processor per group.
    /// Registration order is preserved within and across groups.
    pub fn into_processors(self, config: &CoreConfig) -> Result<Vec<SubscriptionProcessor>> {
        let mut groups: Vec<(String, Vec<Binding>)> = Vec::new();
        for binding in self.bindings {
            match groups.iter_mut().find(|(id, _)| *id == binding.consumer_id) {
                Some((_, members)) => members.push(binding),
                None => groups.push((binding.consumer_id.clone(), vec![binding])),
            }
        }

        let mut processors = Vec::with_capacity(groups.len());
        for (consumer_id, members) in groups {
            let durable = members[0].durable;
            if members.iter().any(|b| b.durable != durable) {
                bail!("consumer '{consumer_id}' mixes durable and non-durable bindings");
            }
            processors.push(SubscriptionProcessor::new(
                consumer_id,
                durable,
                members,
                config.clone(),
            )?);
        }
        Ok(processors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Inbound, Outcome};
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct NoopHandler;

    #[async_trait]
    impl Handler<String> for NoopHandler {
        async fn handle(
            &self,
            _msg: Inbound<String>,
            _ct: CancellationToken,
        ) -> anyhow::Result<Outcome> {
            Ok(Outcome::ack())
        }
    }

    #[test]
    fn synthesized_consumer_id_includes_queue_group() {
        let options = ConsumerOptions::subject("a.b").queue_group("g");
        assert!(!options.is_durable());
        assert_eq!(options.effective_consumer_id(), "a.b-g");

        let options = ConsumerOptions::subject("a.b");
        assert_eq!(options.effective_consumer_id(), "a.b-");
    }

    #[test]
    fn explicit_consumer_id_implies_durable() {
        let options = ConsumerOptions::subject("evt.>").durable("C1");
        assert!(options.is_durable());
        assert_eq!(options.effective_consumer_id(), "C1");
    }

    #[test]
    fn duplicate_subject_fails_fast() {
        let mut registry = ConsumerRegistry::new(DuplicatePolicy::FailFast);
        registry
            .register::<String, _>(ConsumerOptions::subject("a.b"), NoopHandler)
            .unwrap();
        let result = registry.register::<String, _>(ConsumerOptions::subject("a.b"), NoopHandler);
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_subject_can_be_skipped() {
        let mut registry = ConsumerRegistry::new(DuplicatePolicy::Skip);
        registry
            .register::<String, _>(ConsumerOptions::subject("a.b"), NoopHandler)
            .unwrap();
        registry
            .register::<String, _>(ConsumerOptions::subject("a.b"), NoopHandler)
            .unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn empty_subject_is_rejected() {
        let mut registry = ConsumerRegistry::new(DuplicatePolicy::FailFast);
        let result = registry.register::<String, _>(ConsumerOptions::subject(""), NoopHandler);
        assert!(result.is_err());
    }

    #[test]
    fn bindings_group_by_consumer_identity() {
        let mut registry = ConsumerRegistry::new(DuplicatePolicy::FailFast);
        registry
            .register::<String, _>(ConsumerOptions::subject("evt.a").durable("C1"), NoopHandler)
            .unwrap();
        registry
            .register::<String, _>(
                ConsumerOptions::subject("evt.b.>").durable("C1"),
                NoopHandler,
            )
            .unwrap();
        registry
            .register::<String, _>(ConsumerOptions::subject("core.x").queue_group("g"), NoopHandler)
            .unwrap();

        let processors = registry.into_processors(&CoreConfig::default()).unwrap();
        assert_eq!(processors.len(), 2);

        let durable = &processors[0];
        assert_eq!(durable.consumer_id(), "C1");
        assert!(durable.is_durable());
        assert_eq!(durable.subjects(), vec!["evt.a", "evt.b.>"]);

        let core = &processors[1];
        assert_eq!(core.consumer_id(), "core.x-g");
        assert!(!core.is_durable());
        assert_eq!(core.subjects(), vec!["core.x"]);
    }
}
