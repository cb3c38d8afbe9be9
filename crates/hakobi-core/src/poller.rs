//! Per-worker poll loop: select eligible units, claim, dispatch.
//!
//! Bounded concurrency, periodic polling with jitter, explicit shutdown.
//! Spawning is pluggable so tests can run units inline and deterministic.

use std::sync::Arc;

use futures::{FutureExt as _, StreamExt as _};

use crate::clock::Clock;
use crate::config::WorkerConfig;
use crate::executor::Executor;
use crate::lease::LeaseManager;
use crate::store::{ExportSource, Store};
use crate::utils::Ticker;

/// How unit futures are executed (inline, Tokio, etc.).
pub trait JobSpawner {
    type JobHandle<Fut>: Future<Output = ()> + Send + 'static
    where
        Fut: Future<Output = ()> + Send + 'static;
    fn spawn<Fut>(fut: Fut) -> Self::JobHandle<Fut>
    where
        Fut: Future<Output = ()> + Send + 'static;
}

/// Minimal spawner that runs units inline (deterministic tests, no runtime).
pub struct InlineSpawner;

impl JobSpawner for InlineSpawner {
    type JobHandle<Fut>
        = Fut
    where
        Fut: Future<Output = ()> + Send + 'static;
    fn spawn<Fut>(fut: Fut) -> Self::JobHandle<Fut>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        fut
    }
}

/// Spawner that puts each unit on the Tokio runtime, so exports run on all
/// cores instead of interleaving on the poller task.
#[cfg(feature = "rt-tokio")]
pub struct TokioSpawner;

/// A panicking export must not take the poller down with it; the outcome is
/// logged and the slot freed. An aborted handle is ordinary shutdown noise.
#[cfg(feature = "rt-tokio")]
fn log_unit_outcome(result: Result<(), tokio::task::JoinError>) {
    if let Err(error) = result {
        if error.is_panic() {
            tracing::error!(error = %error, "unit task panicked");
        } else {
            tracing::debug!(error = %error, "unit task cancelled");
        }
    }
}

#[cfg(feature = "rt-tokio")]
impl JobSpawner for TokioSpawner {
    type JobHandle<Fut>
        = futures::future::Map<tokio::task::JoinHandle<()>, fn(Result<(), tokio::task::JoinError>)>
    where
        Fut: Future<Output = ()> + Send + 'static;

    fn spawn<Fut>(fut: Fut) -> Self::JobHandle<Fut>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(fut).map(log_unit_outcome as fn(Result<(), tokio::task::JoinError>))
    }
}

pub struct Poller<S, Src, Sp = InlineSpawner> {
    store: S,
    lease: LeaseManager<S>,
    executor: Arc<Executor<S, Src>>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    poll_interval: std::time::Duration,
    max_in_flight: usize,
    marker: std::marker::PhantomData<fn() -> Sp>,
}

impl<S, Src, Sp> Poller<S, Src, Sp>
where
    S: Store + Clone + Send + Sync + 'static,
    Src: ExportSource + Send + Sync + 'static,
    Sp: JobSpawner,
{
    pub fn new(
        store: S,
        lease: LeaseManager<S>,
        executor: Arc<Executor<S, Src>>,
        config: &WorkerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            lease,
            executor,
            clock,
            batch_size: config.poll_batch_size,
            poll_interval: std::time::Duration::from_millis(config.poll_interval_ms),
            max_in_flight: config.max_in_flight,
            marker: std::marker::PhantomData,
        }
    }

    /// Run until `shutdown` resolves, then drain in-flight units.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send) {
        let Self {
            store,
            lease,
            executor,
            clock,
            batch_size,
            poll_interval,
            max_in_flight,
            marker: _,
        } = self;

        let ticker = Ticker::with_jitter(poll_interval, poll_interval / 10).fuse();
        futures::pin_mut!(ticker);
        let shutdown = shutdown.fuse();
        futures::pin_mut!(shutdown);
        // In-flight units; FuturesUnordered for fair progress across tasks.
        let mut tasks = futures::stream::FuturesUnordered::new();

        loop {
            futures::select! {
                _ = ticker.next() => {
                    // Claim batches until the queue runs dry or capacity fills;
                    // an empty batch means we sleep until the next tick.
                    loop {
                        let free = max_in_flight.saturating_sub(tasks.len());
                        if free == 0 {
                            break;
                        }
                        let now = clock.now();
                        let ids = match store.select_eligible(batch_size.min(free), now).await {
                            Ok(ids) => ids,
                            Err(error) => {
                                // Store unavailable: back off until the next tick.
                                tracing::error!(error = %error, "failed to select eligible units");
                                break;
                            }
                        };
                        if ids.is_empty() {
                            break;
                        }

                        let mut claimed = 0usize;
                        for input_id in ids {
                            if tasks.len() >= max_in_flight {
                                break;
                            }
                            match lease.try_claim(input_id).await {
                                Ok(Some(unit)) => {
                                    claimed += 1;
                                    let executor = executor.clone();
                                    let fut = async move { executor.execute(unit).await };
                                    tasks.push(<Sp as JobSpawner>::spawn(fut));
                                }
                                // Another worker won the race; skip.
                                Ok(None) => {}
                                Err(error) => {
                                    tracing::warn!(error = %error, input_id = %input_id, "claim attempt failed");
                                }
                            }
                        }
                        if claimed == 0 {
                            break;
                        }
                    }
                },
                _ = tasks.next() => {},
                _ = shutdown => {
                    tracing::debug!("received shutdown signal; waiting for {} unit(s) to finish", tasks.len());
                    break;
                }
            }
        }

        // Drain remaining units
        while tasks.next().await.is_some() {}
    }
}
