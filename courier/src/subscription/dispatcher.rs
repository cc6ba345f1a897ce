//! Dispatcher half of a subscription processor: drains the work queue under
//! a degree-of-parallelism limiter.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::queue::{QueueError, WorkQueue};

const TRANSIENT_BACKOFF: Duration = Duration::from_secs(1);

pub(crate) async fn run(
    queue: Arc<WorkQueue>,
    max_dop: usize,
    batching: bool,
    batch_idle: Duration,
    token: CancellationToken,
) -> Result<()> {
    let max_dop = max_dop.max(1);
    let semaphore = Arc::new(Semaphore::new(max_dop));
    let batch_size = if batching { max_dop } else { 1 };
    let mut running: JoinSet<()> = JoinSet::new();

    'intake: loop {
        // Prune completed tasks so the set doesn't grow unbounded.
        while let Some(joined) = running.try_join_next() {
            if let Err(err) = joined {
                if err.is_panic() {
                    warn!(error = %err, "work item panicked");
                }
            }
        }

        match queue.read_batch(batch_size, batch_idle, &token).await {
            Ok(items) => {
                // Items start in arrival order but run concurrently; no
                // cross-message ordering beyond the start is promised.
                for item in items {
                    let permit = tokio::select! {
                        biased;
                        _ = token.cancelled() => break 'intake,
                        acquired = semaphore.clone().acquire_owned() => match acquired {
                            Ok(permit) => permit,
                            Err(_) => anyhow::bail!("dispatcher semaphore closed"),
                        },
                    };
                    let work = item.into_future(token.child_token());
                    running.spawn(async move {
                        let _permit = permit;
                        work.await;
                    });
                }
            }
            Err(QueueError::Cancelled) => break,
            Err(err) => {
                error!(error = %err, "dispatcher read failed; backing off");
                tokio::time::sleep(TRANSIENT_BACKOFF).await;
            }
        }
    }

    info!(in_flight = running.len(), "dispatcher draining in-flight work");
    while let Some(joined) = running.join_next().await {
        if let Err(err) = joined {
            if err.is_panic() {
                warn!(error = %err, "work item panicked during drain");
            }
        }
    }
    Ok(())
}
