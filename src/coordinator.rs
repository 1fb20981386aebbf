//! Replay Coordinator
//!
//! Owns the shared job queue, admission semaphore and counters; spawns the
//! worker pool, feeds it one job per connection, monitors progress, handles
//! operator interrupts and aggregates the final per-worker stats.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::mpsc::{self, Sender};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::executor::RunContext;
use crate::model::ConnectionLog;
use crate::stats::{display_stats, print_stats, ReplayStats};
use crate::worker::{Job, ReplayWorker};

/// Safety valve, not a real limit: the queue should never get near this.
const QUEUE_CAPACITY: usize = 1_000_000;
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Replayer {
    ctx: Arc<RunContext>,
}

impl Replayer {
    pub fn new(ctx: Arc<RunContext>) -> Self {
        Self { ctx }
    }

    /// Replay the given connections, returning the per-worker stats bundles.
    pub async fn start_replay(
        &self,
        connections: Vec<ConnectionLog>,
        total_queries: u64,
    ) -> Result<Vec<ReplayStats>> {
        let num_workers = worker_count(self.ctx.config.num_workers);
        info!(
            "Replaying {} connections across {num_workers} workers",
            connections.len()
        );

        let (tx, rx) = mpsc::channel::<Job>(QUEUE_CAPACITY);
        let queue = Arc::new(Mutex::new(rx));
        let semaphore = self
            .ctx
            .config
            .limit_concurrent_connections
            .map(|limit| Arc::new(Semaphore::new(limit)));

        let alive = Arc::new(AtomicUsize::new(num_workers));
        let worker_stats: Vec<Arc<parking_lot::Mutex<ReplayStats>>> =
            (0..num_workers).map(|_| Arc::default()).collect();
        let mut handles: Vec<JoinHandle<ReplayStats>> = Vec::with_capacity(num_workers);
        for idx in 0..num_workers {
            let worker = ReplayWorker::new(
                idx,
                self.ctx.clone(),
                queue.clone(),
                semaphore.clone(),
                worker_stats[idx].clone(),
            );
            let alive = alive.clone();
            handles.push(tokio::spawn(async move {
                let stats = worker.run().await;
                alive.fetch_sub(1, Ordering::SeqCst);
                stats
            }));
        }

        let feeder = tokio::spawn(feed_queue(
            tx.clone(),
            connections,
            num_workers,
            alive.clone(),
        ));

        // Interrupt handling is installed only now, after the workers are
        // running; the coordinator alone reacts to it.
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut tick = 0u64;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    error!("Got interrupt, terminating workers");
                    abort_and_join(feeder, handles).await;
                    bail!("replay interrupted by operator");
                }
                _ = interval.tick() => {
                    if alive.load(Ordering::SeqCst) == 0 {
                        break;
                    }
                    tick += 1;
                    if tick % 5 == 0 {
                        let mut aggregate = ReplayStats::default();
                        for slot in &worker_stats {
                            aggregate.collect(&slot.lock());
                        }
                        let peak = self.ctx.peak_connections.load(Ordering::SeqCst);
                        display_stats(&aggregate, total_queries, peak);
                        self.ctx
                            .peak_connections
                            .store(self.ctx.live_connections.load(Ordering::SeqCst), Ordering::SeqCst);
                    }
                    if tick % 60 == 0 {
                        info!("Job queue depth: {}", QUEUE_CAPACITY - tx.capacity());
                    }
                }
            }
        }

        let feed_result = match feeder.await {
            Ok(result) => result,
            Err(err) => Err(anyhow::anyhow!("feeder task failed: {err}")),
        };

        // Anything left on the queue means the run did not complete.
        let mut leftover = 0usize;
        {
            let mut queue = queue.lock().await;
            while queue.try_recv().is_ok() {
                leftover += 1;
            }
        }
        if leftover > 0 {
            error!("Replay ended with {leftover} jobs still queued");
        }

        let mut per_worker = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(stats) => per_worker.push(stats),
                Err(err) => warn!("Worker task failed: {err}"),
            }
        }
        print_stats(&per_worker);
        feed_result?;
        Ok(per_worker)
    }
}

/// Configured worker count, else one per core minus one, floored at four.
pub fn worker_count(configured: Option<usize>) -> usize {
    configured.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1).max(4))
            .unwrap_or(4)
    })
}

async fn feed_queue(
    tx: Sender<Job>,
    connections: Vec<ConnectionLog>,
    num_workers: usize,
    alive: Arc<AtomicUsize>,
) -> Result<()> {
    let count = connections.len();
    for (job_id, connection) in connections.into_iter().enumerate() {
        put_with_retry(&tx, Job::Connection { job_id, connection }, &alive).await?;
    }
    for _ in 0..num_workers {
        put_with_retry(&tx, Job::Terminate, &alive).await?;
    }
    info!("Finished enqueuing {count} connections");
    Ok(())
}

/// Abort the feeder and every worker, then await them all so cancellation
/// has completed by the time the coordinator returns.
async fn abort_and_join(feeder: JoinHandle<Result<()>>, handles: Vec<JoinHandle<ReplayStats>>) {
    feeder.abort();
    for handle in &handles {
        handle.abort();
    }
    if let Err(err) = feeder.await {
        if !err.is_cancelled() {
            warn!("Feeder task failed during shutdown: {err}");
        }
    }
    for handle in handles {
        if let Err(err) = handle.await {
            if !err.is_cancelled() {
                warn!("Worker task failed during shutdown: {err}");
            }
        }
    }
}

/// Blocking enqueue with a timeout; retried while any worker is alive.
async fn put_with_retry(tx: &Sender<Job>, job: Job, alive: &AtomicUsize) -> Result<()> {
    let mut job = job;
    loop {
        match tx.send_timeout(job, ENQUEUE_TIMEOUT).await {
            Ok(()) => return Ok(()),
            Err(SendTimeoutError::Timeout(returned)) => {
                if alive.load(Ordering::SeqCst) == 0 {
                    bail!("could not enqueue work: no workers are alive");
                }
                warn!("Job queue is full, retrying enqueue");
                job = returned;
            }
            Err(SendTimeoutError::Closed(_)) => bail!("job queue closed unexpectedly"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::test_support::run_context_with;
    use crate::config::ReplayConfig;
    use crate::driver::test_support::MockDriver;
    use crate::model::test_support::{connection, query, transaction};

    fn workload(count: usize) -> Vec<ConnectionLog> {
        (0..count)
            .map(|i| {
                let pid = format!("{i}");
                let mut c = connection("dev", "alice", &pid, 0, 10);
                c.transactions = vec![
                    transaction("dev", "alice", &pid, "1", vec![query(0, 1, "select 1")]),
                    transaction("dev", "alice", &pid, "2", vec![query(1, 2, "select 2")]),
                ];
                c
            })
            .collect()
    }

    #[test]
    fn test_worker_count_floors_at_four() {
        assert_eq!(worker_count(Some(2)), 2);
        assert!(worker_count(None) >= 4);
    }

    #[tokio::test]
    async fn test_abort_and_join_reaps_cancelled_tasks() {
        let feeder: JoinHandle<Result<()>> = tokio::spawn(async {
            std::future::pending::<()>().await;
            Ok(())
        });
        let workers: Vec<JoinHandle<ReplayStats>> = (0..2)
            .map(|_| {
                tokio::spawn(async {
                    std::future::pending::<()>().await;
                    ReplayStats::default()
                })
            })
            .collect();
        // must complete even though every task is cancelled mid-flight
        abort_and_join(feeder, workers).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_with_retry_aborts_when_no_workers_alive() {
        let (tx, _rx) = mpsc::channel::<Job>(1);
        tx.send(Job::Terminate).await.unwrap();

        let alive = AtomicUsize::new(0);
        let err = put_with_retry(&tx, Job::Terminate, &alive)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no workers are alive"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_with_retry_keeps_trying_while_workers_alive() {
        let (tx, mut rx) = mpsc::channel::<Job>(1);
        tx.send(Job::Terminate).await.unwrap();

        // Queue stays full past the first enqueue timeout, then drains.
        let drain = tokio::spawn(async move {
            tokio::time::sleep(ENQUEUE_TIMEOUT + Duration::from_secs(5)).await;
            rx.recv().await
        });
        let alive = AtomicUsize::new(1);
        put_with_retry(&tx, Job::Terminate, &alive).await.unwrap();
        assert!(drain.await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_single_worker_end_to_end() {
        let config = ReplayConfig {
            num_workers: Some(1),
            ..ReplayConfig::default()
        };
        let (ctx, executed) = run_context_with(MockDriver::default(), config);

        let per_worker = Replayer::new(ctx)
            .start_replay(workload(1), 2)
            .await
            .unwrap();

        assert_eq!(per_worker.len(), 1);
        let mut total = ReplayStats::default();
        for stats in &per_worker {
            total.collect(stats);
        }
        assert_eq!(total.transaction_success, 2);
        assert_eq!(total.query_success, 2);
        assert_eq!(executed.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_multiple_workers_with_admission_limit() {
        let config = ReplayConfig {
            num_workers: Some(2),
            limit_concurrent_connections: Some(1),
            ..ReplayConfig::default()
        };
        let (ctx, _) = run_context_with(MockDriver::default(), config);
        let peak = ctx.peak_connections.clone();

        let per_worker = Replayer::new(ctx)
            .start_replay(workload(4), 8)
            .await
            .unwrap();

        let mut total = ReplayStats::default();
        for stats in &per_worker {
            total.collect(stats);
        }
        assert_eq!(total.transaction_success, 8);
        assert_eq!(total.query_success, 8);
        assert!(peak.load(Ordering::SeqCst) <= 1);
    }
}
