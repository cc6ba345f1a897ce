//! Distributed lock over a revisioned JetStream KV bucket.
//!
//! Every transition is CAS-guarded by the bucket's own revision: acquire is
//! create-if-absent or a revision-keyed steal of an expired lease, renew is
//! a revision-keyed update, release is a revision-guarded delete. A crashed
//! holder's lease expires and the key becomes stealable; the lock stays
//! advisory and holders should keep `renew_interval` well under `lease`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_nats::jetstream::kv::{self, Store};
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bucket the framework stores lock documents in.
pub const LOCKS_BUCKET: &str = "locks";

const RELEASE_DEADLINE: Duration = Duration::from_secs(2);

/// The value stored under a lock key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockDocument {
    pub owner: String,
    #[serde(rename = "expiresAtUnixMs")]
    pub expires_at_unix_ms: i64,
}

impl LockDocument {
    fn new(owner: &str, lease: Duration) -> Self {
        Self {
            owner: owner.to_string(),
            expires_at_unix_ms: Utc::now().timestamp_millis() + lease.as_millis() as i64,
        }
    }

    fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_unix_ms
    }

    fn to_bytes(&self) -> Result<bytes::Bytes, LockError> {
        Ok(serde_json::to_vec(self)?.into())
    }
}

#[derive(Debug, Clone)]
pub struct LockOptions {
    /// How long an unrenewed lease stays valid.
    pub lease: Duration,
    /// Cadence of the handle's background renewal.
    pub renew_interval: Duration,
    /// Lower bound of the jittered retry delay while the lock is held.
    pub base_delay: Duration,
    /// Upper bound of the jittered retry delay while the lock is held.
    pub max_delay: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(20),
            renew_interval: Duration::from_secs(10),
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock owner must be non-empty")]
    EmptyOwner,
    #[error("lock document rejected: {0}")]
    Document(#[from] serde_json::Error),
    #[error(transparent)]
    Entry(#[from] async_nats::error::Error<kv::EntryErrorKind>),
    #[error(transparent)]
    Create(#[from] async_nats::error::Error<kv::CreateErrorKind>),
}

/// Lock operations over one KV bucket.
#[derive(Clone)]
pub struct DistributedLock {
    store: Store,
    options: LockOptions,
}

impl DistributedLock {
    pub fn new(store: Store) -> Self {
        Self::with_options(store, LockOptions::default())
    }

    pub fn with_options(store: Store, options: LockOptions) -> Self {
        Self { store, options }
    }

    /// Tries to become the owner of `key` within `timeout`.
    ///
    /// Returns `Ok(None)` on timeout. A returned handle renews itself in the
    /// background until released, dropped, or the lock is lost.
    pub async fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        timeout: Duration,
    ) -> Result<Option<LockHandle>, LockError> {
        if owner.is_empty() {
            return Err(LockError::EmptyOwner);
        }
        let started = Instant::now();
        loop {
            if started.elapsed() >= timeout {
                debug!(key = %key, owner = %owner, "lock acquisition timed out");
                return Ok(None);
            }

            let entry = self.store.entry(key).await?;
            let live = entry.filter(|e| e.operation == kv::Operation::Put);
            match live {
                None => {
                    let document = LockDocument::new(owner, self.options.lease);
                    match self.store.create(key, document.to_bytes()?).await {
                        Ok(revision) => {
                            debug!(key = %key, owner = %owner, revision, "lock acquired");
                            return Ok(Some(self.handle(key, owner, revision)));
                        }
                        Err(err) if err.kind() == kv::CreateErrorKind::AlreadyExists => {
                            // Lost the create race; re-read.
                            continue;
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                Some(entry) => {
                    let now_ms = Utc::now().timestamp_millis();
                    let expired = match serde_json::from_slice::<LockDocument>(&entry.value) {
                        Ok(document) => document.is_expired_at(now_ms),
                        Err(err) => {
                            // An unreadable document can never be renewed or
                            // released by its writer; treat it as stealable.
                            warn!(key = %key, error = %err, "unreadable lock document; stealing");
                            true
                        }
                    };
                    if expired {
                        let document = LockDocument::new(owner, self.options.lease);
                        match self
                            .store
                            .update(key, document.to_bytes()?, entry.revision)
                            .await
                        {
                            Ok(revision) => {
                                debug!(key = %key, owner = %owner, revision, "expired lock stolen");
                                return Ok(Some(self.handle(key, owner, revision)));
                            }
                            Err(_) => continue, // lost the steal race; re-read
                        }
                    } else {
                        let delay = {
                            let mut rng = rand::thread_rng();
                            rng.gen_range(self.options.base_delay..=self.options.max_delay)
                        };
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    /// Extends the lease iff the revision and owner still match.
    /// Returns the new revision on success, `None` when ownership is gone.
    pub async fn renew(
        &self,
        key: &str,
        expected_revision: u64,
        owner: &str,
    ) -> Result<Option<u64>, LockError> {
        let Some(entry) = self.store.entry(key).await? else {
            return Ok(None);
        };
        if entry.operation != kv::Operation::Put || entry.revision != expected_revision {
            return Ok(None);
        }
        let document: LockDocument = match serde_json::from_slice(&entry.value) {
            Ok(document) => document,
            Err(_) => return Ok(None),
        };
        if document.owner != owner {
            return Ok(None);
        }

        let renewed = LockDocument::new(owner, self.options.lease);
        match self
            .store
            .update(key, renewed.to_bytes()?, expected_revision)
            .await
        {
            Ok(revision) => Ok(Some(revision)),
            Err(_) => Ok(None),
        }
    }

    /// Best-effort release: a vanished entry, a moved revision, a foreign
    /// owner, and a CAS mismatch on delete all count as released.
    pub async fn release(
        &self,
        key: &str,
        expected_revision: u64,
        owner: &str,
    ) -> Result<(), LockError> {
        let Some(entry) = self.store.entry(key).await? else {
            return Ok(());
        };
        if entry.operation != kv::Operation::Put || entry.revision != expected_revision {
            return Ok(());
        }
        match serde_json::from_slice::<LockDocument>(&entry.value) {
            Ok(document) if document.owner == owner => {}
            _ => return Ok(()),
        }

        if let Err(err) = self
            .store
            .delete_expect_revision(key, Some(expected_revision))
            .await
        {
            debug!(key = %key, error = %err, "revision-guarded delete failed; treating as released");
        }
        Ok(())
    }

    fn handle(&self, key: &str, owner: &str, revision: u64) -> LockHandle {
        let revision = Arc::new(AtomicU64::new(revision));
        let lost = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let renew_task = {
            let lock = self.clone();
            let key = key.to_string();
            let owner = owner.to_string();
            let revision = Arc::clone(&revision);
            let lost = Arc::clone(&lost);
            let cancel = cancel.clone();
            let interval = self.options.renew_interval;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    match lock.renew(&key, revision.load(Ordering::SeqCst), &owner).await {
                        Ok(Some(next)) => revision.store(next, Ordering::SeqCst),
                        Ok(None) => {
                            debug!(key = %key, owner = %owner, "lock lost; renewal loop exiting");
                            lost.store(true, Ordering::SeqCst);
                            break;
                        }
                        Err(err) => {
                            debug!(key = %key, owner = %owner, error = %err, "renewal failed; treating lock as lost");
                            lost.store(true, Ordering::SeqCst);
                            break;
                        }
                    }
                }
            })
        };

        LockHandle {
            key: key.to_string(),
            owner: owner.to_string(),
            revision,
            lost,
            cancel,
            released: false,
            lock: self.clone(),
            _renew_task: renew_task,
        }
    }
}

/// Ownership of one acquired lock.
///
/// Dropping the handle cancels the renewal loop and issues a best-effort
/// release in the background; call [`LockHandle::release`] to wait for it.
pub struct LockHandle {
    key: String,
    owner: String,
    revision: Arc<AtomicU64>,
    lost: Arc<AtomicBool>,
    cancel: CancellationToken,
    released: bool,
    lock: DistributedLock,
    _renew_task: tokio::task::JoinHandle<()>,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// False once a renewal has observed the lock as gone.
    pub fn is_held(&self) -> bool {
        !self.lost.load(Ordering::SeqCst)
    }

    /// Stops renewing and releases the lock, bounded by a short deadline.
    pub async fn release(mut self) {
        self.cancel.cancel();
        self.released = true;
        let _ = tokio::time::timeout(
            RELEASE_DEADLINE,
            self.lock
                .release(&self.key, self.revision.load(Ordering::SeqCst), &self.owner),
        )
        .await;
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if self.released {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let lock = self.lock.clone();
            let key = std::mem::take(&mut self.key);
            let owner = std::mem::take(&mut self.owner);
            let revision = self.revision.load(Ordering::SeqCst);
            runtime.spawn(async move {
                let _ = tokio::time::timeout(
                    RELEASE_DEADLINE,
                    lock.release(&key, revision, &owner),
                )
                .await;
            });
        }
    }
}
