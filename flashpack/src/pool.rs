//! Worker pool (C7): bounded-parallel task executor with retries,
//! soft timeouts and cooperative cancellation. Grounded in
//! `moss::client::install`'s use of a `tokio::task::JoinSet` bounded by
//! a `Semaphore`, generalized from moss's package-install tasks to an
//! arbitrary `T -> R` task shape so the orchestrator can reuse it for
//! both fetch-and-store and tree-restore batches.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum Error<E> {
    #[error("task failed after retries: {0}")]
    Failed(E),
    #[error("task timed out")]
    TimedOut,
    #[error("cancelled")]
    Cancelled,
    #[error("task panicked")]
    Panicked,
}

/// Retry policy applied around each task. `on_retry` is invoked with
/// `(error, attempt)` between attempts, attempt counting from 1.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            delay: Duration::from_millis(250),
        }
    }
}

/// A bounded executor of at most `concurrency` tasks in flight at once.
/// FIFO admission; no result ordering guarantee within one batch.
pub struct WorkerPool {
    concurrency: usize,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Requests cancellation: in-flight tasks observe it at their next
    /// cooperative checkpoint, pending tasks never start.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Runs `task_fn(item)` for every item in `items`, at most
    /// `concurrency` concurrently, applying `retry` and `timeout` to each,
    /// and invoking `on_retry(item_index, error, attempt)` between retries.
    /// Results are returned in the same order as `items` regardless of
    /// completion order.
    pub async fn run_batch<T, R, E, F, Fut, OnRetry>(
        &self,
        items: Vec<T>,
        retry: RetryPolicy,
        timeout: Duration,
        task_fn: F,
        on_retry: OnRetry,
    ) -> Vec<Result<R, Error<E>>>
    where
        T: Clone + Send + 'static,
        R: Send + 'static,
        E: std::fmt::Debug + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        OnRetry: Fn(usize, &E, u32) + Send + Sync + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let task_fn = Arc::new(task_fn);
        let on_retry = Arc::new(on_retry);
        let total = items.len();
        let mut joinset: JoinSet<(usize, Result<R, Error<E>>)> = JoinSet::new();

        for (index, item) in items.into_iter().enumerate() {
            let permit = Arc::clone(&semaphore);
            let task_fn = Arc::clone(&task_fn);
            let on_retry = Arc::clone(&on_retry);
            let cancel = self.cancel.clone();
            let retry = retry.clone();

            joinset.spawn(async move {
                let _permit = match permit.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return (index, Err(Error::Cancelled)),
                };

                if cancel.is_cancelled() {
                    return (index, Err(Error::Cancelled));
                }

                let result = run_with_retry(index, task_fn.as_ref(), on_retry.as_ref(), &cancel, &retry, timeout, item).await;
                (index, result)
            });
        }

        let mut results: Vec<Option<Result<R, Error<E>>>> = (0..total).map(|_| None).collect();
        while let Some(joined) = joinset.join_next().await {
            match joined {
                Ok((index, result)) => {
                    if index < results.len() {
                        results[index] = Some(result);
                    }
                }
                Err(_) => continue,
            }
        }

        results.into_iter().map(|r| r.unwrap_or(Err(Error::Panicked))).collect()
    }
}

async fn run_with_retry<T, R, E, F, Fut, OnRetry>(
    index: usize,
    task_fn: &F,
    on_retry: &OnRetry,
    cancel: &CancellationToken,
    retry: &RetryPolicy,
    timeout: Duration,
    item: T,
) -> Result<R, Error<E>>
where
    T: Clone,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R, E>>,
    OnRetry: Fn(usize, &E, u32),
{
    let mut attempt = 0;
    loop {
        attempt += 1;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, task_fn(item.clone())) => result,
        };

        match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => {
                if attempt > retry.max_retries {
                    return Err(Error::Failed(err));
                }
                on_retry(index, &err, attempt);
                tokio::time::sleep(retry.delay).await;
            }
            Err(_elapsed) => {
                if attempt > retry.max_retries {
                    return Err(Error::TimedOut);
                }
                tokio::time::sleep(retry.delay).await;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn runs_all_items_respecting_concurrency() {
        let pool = WorkerPool::new(2);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));

        let in_flight_cb = Arc::clone(&in_flight);
        let max_cb = Arc::clone(&max_in_flight);

        let results = pool
            .run_batch(
                (0..6).collect(),
                RetryPolicy::default(),
                Duration::from_secs(5),
                move |n: i32| {
                    let in_flight = Arc::clone(&in_flight_cb);
                    let max_in_flight = Arc::clone(&max_cb);
                    async move {
                        let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_in_flight.fetch_max(current, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok::<i32, String>(n * 2)
                    }
                },
                |_, _: &String, _| {},
            )
            .await;

        assert_eq!(results.len(), 6);
        for (i, r) in results.iter().enumerate() {
            assert_eq!(*r.as_ref().unwrap(), i as i32 * 2);
        }
        assert!(max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn retries_until_success_within_budget() {
        let pool = WorkerPool::new(1);
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_cb = Arc::clone(&attempts);

        let results = pool
            .run_batch(
                vec![()],
                RetryPolicy {
                    max_retries: 2,
                    delay: Duration::from_millis(1),
                },
                Duration::from_secs(5),
                move |_: ()| {
                    let attempts = Arc::clone(&attempts_cb);
                    async move {
                        let n = attempts.fetch_add(1, Ordering::SeqCst);
                        if n < 1 {
                            Err("flaky".to_string())
                        } else {
                            Ok(())
                        }
                    }
                },
                |_, _: &String, _| {},
            )
            .await;

        assert!(results[0].is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
