//! Thin client facade over the NATS connection, plus the framework entry
//! points: consumer mapping, KV store setup, and distributed locking.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_nats::jetstream::{self, kv};
use bytes::Bytes;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::CoreConfig;
use crate::lock::{DistributedLock, LockHandle, LOCKS_BUCKET};
use crate::registry::ConsumerRegistry;

/// Framework entry point wrapping one NATS connection.
#[derive(Clone)]
pub struct Client {
    nats: async_nats::Client,
    jetstream: jetstream::Context,
    config: CoreConfig,
    locks: Arc<tokio::sync::OnceCell<DistributedLock>>,
}

impl Client {
    /// Connects with default configuration. A credentials file named by
    /// `NATS_CREDS_PATH` is honored when present.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, CoreConfig::default()).await
    }

    pub async fn connect_with_config(url: &str, config: CoreConfig) -> Result<Self> {
        let nats = if let Ok(creds_path) = std::env::var("NATS_CREDS_PATH") {
            info!(creds_path = %creds_path, "connecting to NATS with credentials file");
            async_nats::ConnectOptions::new()
                .credentials_file(&creds_path)
                .await
                .context("failed to load NATS credentials")?
                .connect(url)
                .await
                .context("failed to connect to NATS with credentials")?
        } else {
            warn!("no NATS credentials provided, connecting without auth");
            async_nats::connect(url)
                .await
                .context("failed to connect to NATS")?
        };

        let jetstream = jetstream::new(nats.clone());
        info!(url = %url, "connected to NATS");
        Ok(Self {
            nats,
            jetstream,
            config,
            locks: Arc::new(tokio::sync::OnceCell::new()),
        })
    }

    /// The underlying core connection.
    pub fn nats(&self) -> &async_nats::Client {
        &self.nats
    }

    /// The JetStream context for this connection.
    pub fn jetstream(&self) -> &jetstream::Context {
        &self.jetstream
    }

    pub async fn publish(&self, subject: impl Into<String>, payload: Bytes) -> Result<()> {
        self.nats
            .publish(subject.into(), payload)
            .await
            .context("publish failed")
    }

    pub async fn publish_with_headers(
        &self,
        subject: impl Into<String>,
        headers: async_nats::HeaderMap,
        payload: Bytes,
    ) -> Result<()> {
        self.nats
            .publish_with_headers(subject.into(), headers, payload)
            .await
            .context("publish failed")
    }

    pub async fn request(
        &self,
        subject: impl Into<String>,
        payload: Bytes,
    ) -> Result<async_nats::Message> {
        self.nats
            .request(subject.into(), payload)
            .await
            .context("request failed")
    }

    pub async fn subscribe(&self, subject: impl Into<String>) -> Result<async_nats::Subscriber> {
        self.nats
            .subscribe(subject.into())
            .await
            .context("subscribe failed")
    }

    pub async fn queue_subscribe(
        &self,
        subject: impl Into<String>,
        queue_group: impl Into<String>,
    ) -> Result<async_nats::Subscriber> {
        self.nats
            .queue_subscribe(subject.into(), queue_group.into())
            .await
            .context("queue subscribe failed")
    }

    pub async fn flush(&self) -> Result<()> {
        self.nats.flush().await.context("flush failed")
    }

    /// Opens an existing KV bucket.
    pub async fn key_value(&self, bucket: &str) -> Result<kv::Store> {
        self.jetstream
            .get_key_value(bucket)
            .await
            .with_context(|| format!("failed to open KV bucket '{bucket}'"))
    }

    /// Builds and launches one processor per registered consumer identity,
    /// then supervises them until cancellation.
    ///
    /// A fatal processor fault is a deployment error: it is logged and the
    /// process is terminated fail-fast.
    pub async fn map_consumers(
        &self,
        registry: ConsumerRegistry,
        ct: CancellationToken,
    ) -> Result<()> {
        let processors = registry.into_processors(&self.config)?;
        anyhow::ensure!(!processors.is_empty(), "no consumers registered");

        info!(processors = processors.len(), "mapping consumers");
        let mut running = JoinSet::new();
        for processor in processors {
            let client = self.clone();
            let token = ct.child_token();
            running.spawn(async move { processor.run(&client, token).await });
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(error = ?err, "subscription processor failed fatally; aborting process");
                    std::process::abort();
                }
                Err(join_err) => {
                    error!(error = %join_err, "subscription processor panicked; aborting process");
                    std::process::abort();
                }
            }
        }
        info!("all subscription processors stopped");
        Ok(())
    }

    /// Attaches to the `locks` bucket, creating it when missing, and primes
    /// the distributed lock. Idempotent.
    pub async fn setup_kv_stores(&self) -> Result<()> {
        self.lock_store().await.map(|_| ())
    }

    /// Acquires a distributed lock, setting up the KV store lazily when
    /// [`Client::setup_kv_stores`] was not called first.
    pub async fn acquire_distributed_lock(
        &self,
        key: &str,
        owner: &str,
        timeout: Duration,
    ) -> Result<Option<LockHandle>> {
        let lock = self.lock_store().await?;
        lock.try_acquire(key, owner, timeout)
            .await
            .with_context(|| format!("failed to acquire lock '{key}'"))
    }

    async fn lock_store(&self) -> Result<&DistributedLock> {
        self.locks
            .get_or_try_init(|| async {
                let store = match self.jetstream.get_key_value(LOCKS_BUCKET).await {
                    Ok(store) => store,
                    Err(_) => {
                        info!(bucket = %LOCKS_BUCKET, "creating KV bucket");
                        self.jetstream
                            .create_key_value(kv::Config {
                                bucket: LOCKS_BUCKET.to_string(),
                                description: "distributed lock documents".to_string(),
                                history: 1,
                                ..Default::default()
                            })
                            .await
                            .with_context(|| {
                                format!("failed to create KV bucket '{LOCKS_BUCKET}'")
                            })?
                    }
                };
                Ok(DistributedLock::new(store))
            })
            .await
    }
}
