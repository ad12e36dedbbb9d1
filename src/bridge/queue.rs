//! Per-(source, target) FIFO delivery queues.
//!
//! Each pair gets a worker task that runs its jobs one at a time in
//! submission order. Unrelated pairs run concurrently. The map of workers is
//! the only shared mutable state; its lock is never held across I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::debug;

use crate::common::ChannelAddress;

/// A delivery job for one target.
pub type Job = BoxFuture<'static, ()>;

/// How long an idle pair worker stays alive.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Identifies one ordered stream of deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairKey {
    pub source_instance: String,
    pub source_address: ChannelAddress,
    pub target_instance: String,
    pub target_address: ChannelAddress,
}

type WorkerMap = HashMap<PairKey, mpsc::UnboundedSender<Job>>;

/// Serializes jobs per [`PairKey`].
#[derive(Debug, Clone)]
pub struct PairQueues {
    workers: Arc<Mutex<WorkerMap>>,
    idle_timeout: Duration,
}

impl Default for PairQueues {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}

impl PairQueues {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            workers: Arc::new(Mutex::new(HashMap::new())),
            idle_timeout,
        }
    }

    /// Queue `job` behind every earlier job for the same pair.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(&self, key: PairKey, job: Job) {
        let mut workers = lock(&self.workers);

        let job = match workers.get(&key) {
            Some(tx) => match tx.send(job) {
                Ok(()) => return,
                // Worker is gone; start a new one with this job
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(job).is_err() {
            return;
        }
        workers.insert(key.clone(), tx);
        tokio::spawn(run_worker(
            Arc::clone(&self.workers),
            key,
            rx,
            self.idle_timeout,
        ));
    }

    /// Number of live pair workers.
    #[cfg(test)]
    pub fn active(&self) -> usize {
        lock(&self.workers).len()
    }
}

fn lock(workers: &Mutex<WorkerMap>) -> MutexGuard<'_, WorkerMap> {
    workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run_worker(
    workers: Arc<Mutex<WorkerMap>>,
    key: PairKey,
    mut rx: mpsc::UnboundedReceiver<Job>,
    idle_timeout: Duration,
) {
    loop {
        let job = match tokio::time::timeout(idle_timeout, rx.recv()).await {
            Ok(Some(job)) => job,
            Ok(None) => break,
            Err(_) => {
                // Senders only push while holding the map lock, so an empty
                // queue observed under it stays empty once the entry is gone.
                let next = {
                    let mut map = lock(&workers);
                    match rx.try_recv() {
                        Ok(job) => Some(job),
                        Err(_) => {
                            map.remove(&key);
                            None
                        }
                    }
                };
                match next {
                    Some(job) => job,
                    None => break,
                }
            }
        };
        job.await;
    }
    debug!(
        source_instance = %key.source_instance,
        target_instance = %key.target_instance,
        "Pair worker idle, exiting"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use tokio::sync::oneshot;

    fn key(source: &str, target: &str) -> PairKey {
        PairKey {
            source_instance: source.to_string(),
            source_address: ChannelAddress::new().with("id", "1"),
            target_instance: target.to_string(),
            target_address: ChannelAddress::new().with("id", "2"),
        }
    }

    #[tokio::test]
    async fn test_jobs_run_in_submission_order() {
        let queues = PairQueues::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel();

        for i in 0..5u64 {
            let log = Arc::clone(&log);
            queues.submit(
                key("a", "b"),
                async move {
                    // Earlier jobs sleep longer; order must still hold
                    tokio::time::sleep(Duration::from_millis(25 - i * 5)).await;
                    log.lock().unwrap().push(i);
                }
                .boxed(),
            );
        }
        queues.submit(
            key("a", "b"),
            async move {
                let _ = done_tx.send(());
            }
            .boxed(),
        );

        done_rx.await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(queues.active(), 1);
    }

    #[tokio::test]
    async fn test_pairs_do_not_block_each_other() {
        let queues = PairQueues::default();
        let (blocked_tx, blocked_rx) = oneshot::channel::<()>();
        let (free_tx, free_rx) = oneshot::channel();

        queues.submit(
            key("a", "slow"),
            async move {
                let _ = blocked_rx.await;
            }
            .boxed(),
        );
        queues.submit(
            key("a", "fast"),
            async move {
                let _ = free_tx.send(());
            }
            .boxed(),
        );

        tokio::time::timeout(Duration::from_secs(1), free_rx)
            .await
            .expect("fast pair stalled behind slow pair")
            .unwrap();
        drop(blocked_tx);
        assert_eq!(queues.active(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_worker_exits_and_restarts() {
        let queues = PairQueues::new(Duration::from_secs(1));
        let (tx, rx) = oneshot::channel();
        queues.submit(key("a", "b"), async move { let _ = tx.send(()); }.boxed());
        rx.await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queues.active(), 0);

        let (tx, rx) = oneshot::channel();
        queues.submit(key("a", "b"), async move { let _ = tx.send(()); }.boxed());
        rx.await.unwrap();
        assert_eq!(queues.active(), 1);
    }
}
