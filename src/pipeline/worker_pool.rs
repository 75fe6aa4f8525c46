//! Bounded, shared page processing with backpressure.
//!
//! The key concepts here are borrowed from ["Queues Don't Fix
//! Overload"](https://ferd.ca/queues-don-t-fix-overload.html). We limit the
//! number of jobs "in flight" at any one time, and once that limit is reached,
//! trying to submit more jobs will wait until an in-flight job completes.
//!
//! One [`WorkerPool`] is shared by every run of a pipeline, and its
//! concurrency limit is the only global state in the pipeline.

use std::sync::Arc;

use futures::{StreamExt as _, channel::oneshot};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{async_utils::BoxedFuture, prelude::*};

/// An async job function.
pub type JobFn<Input, Output> =
    Arc<dyn Fn(Input) -> BoxedFuture<Output> + Send + Sync + 'static>;

/// A queued job, with a one-shot channel on which to return the result.
struct Job<Input, Output> {
    input: Input,
    tx: oneshot::Sender<Output>,
}

/// A pool that runs up to `concurrency_limit` jobs at once.
///
/// Handles are cheap to clone. The background worker runs until every handle
/// has been dropped and the queue has drained.
pub struct WorkerPool<Input, Output>
where
    Input: 'static,
    Output: 'static,
{
    tx: mpsc::Sender<Job<Input, Output>>,
}

// Override `Clone` so that `Input` and `Output` are not required to be `Clone`.
impl<Input, Output> Clone for WorkerPool<Input, Output> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<Input, Output> WorkerPool<Input, Output>
where
    Input: Send + 'static,
    Output: Send + 'static,
{
    /// Create a new pool with the given concurrency limit. Must be called from
    /// inside a Tokio runtime.
    ///
    /// Note that up to `concurrency_limit` jobs may be waiting at any one time
    /// in addition to those in progress.
    pub fn new(concurrency_limit: usize, job_fn: JobFn<Input, Output>) -> Self {
        let concurrency_limit = concurrency_limit.max(1);
        let (tx, rx) = mpsc::channel::<Job<Input, Output>>(concurrency_limit);
        tokio::spawn(async move {
            ReceiverStream::new(rx).for_each_concurrent(concurrency_limit, |job| {
                let job_fn = job_fn.clone();
                async move {
                    let result = job_fn(job.input).await;
                    if job.tx.send(result).is_err() {
                        debug!("failed to send job result because receiver was dropped");
                    }
                }
            })
            .await;
            trace!("Worker pool shut down");
        });
        Self { tx }
    }

    /// Queue a job, returning a channel that will receive its output.
    ///
    /// This only waits if the queue is full.
    pub async fn submit(&self, input: Input) -> Result<oneshot::Receiver<Output>> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Job { input, tx })
            .await
            .map_err(|_| anyhow!("failed to queue job: worker pool has shut down"))?;
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use futures::{FutureExt as _, future};

    use super::*;

    #[tokio::test]
    async fn results_come_back_on_their_own_channels() -> Result<()> {
        let pool = WorkerPool::<u32, u32>::new(2, Arc::new(|n: u32| async move { n * 10 }.boxed()));
        let receivers = future::try_join_all((0..5).map(|n| pool.submit(n))).await?;
        let results = future::try_join_all(receivers).await?;
        assert_eq!(results, [0, 10, 20, 30, 40]);
        Ok(())
    }

    #[tokio::test]
    async fn concurrency_is_bounded() -> Result<()> {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let job_fn: JobFn<(), ()> = {
            let running = running.clone();
            let peak = peak.clone();
            Arc::new(move |()| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                }
                .boxed()
            })
        };
        let pool = WorkerPool::new(2, job_fn);
        let mut receivers = vec![];
        for _ in 0..8 {
            receivers.push(pool.submit(()).await?);
        }
        future::try_join_all(receivers).await?;
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn submit_waits_when_the_queue_is_full() -> Result<()> {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let job_fn: JobFn<u32, u32> = {
            let gate = gate.clone();
            Arc::new(move |n: u32| {
                let gate = gate.clone();
                async move {
                    let _permit = gate.acquire().await;
                    n
                }
                .boxed()
            })
        };
        let pool = WorkerPool::new(1, job_fn);
        // One job running, one waiting in the queue.
        let first = pool.submit(1).await?;
        let second = pool.submit(2).await?;
        let blocked = tokio::time::timeout(Duration::from_millis(100), pool.submit(3)).await;
        assert!(blocked.is_err(), "submit should wait for a free slot");

        gate.add_permits(3);
        let third = pool.submit(3).await?;
        assert_eq!(future::try_join_all([first, second, third]).await?, [1, 2, 3]);
        Ok(())
    }
}
