//! Replay Worker
//!
//! Long-lived loop that dequeues connection jobs, paces their start against
//! the recorded timeline, dispatches connection executor tasks and reaps
//! finished ones, merging their stats into the worker's aggregate.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc::Receiver;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::executor::{ConnectionExecutor, RunContext};
use crate::model::ConnectionLog;
use crate::stats::ReplayStats;

/// How long a dequeue waits before counting as an empty-queue interval.
pub const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(10);

const SCHEDULE_SLACK_MS: f64 = 10.0;

/// One unit of work on the shared job queue.
pub enum Job {
    Connection {
        job_id: usize,
        connection: ConnectionLog,
    },
    /// One sentinel per worker; receiving it stops the loop cleanly.
    Terminate,
}

pub struct ReplayWorker {
    idx: usize,
    ctx: Arc<RunContext>,
    queue: Arc<Mutex<Receiver<Job>>>,
    semaphore: Option<Arc<Semaphore>>,
    /// Shared slot the coordinator reads for live progress display.
    stats: Arc<parking_lot::Mutex<ReplayStats>>,
}

impl ReplayWorker {
    pub fn new(
        idx: usize,
        ctx: Arc<RunContext>,
        queue: Arc<Mutex<Receiver<Job>>>,
        semaphore: Option<Arc<Semaphore>>,
        stats: Arc<parking_lot::Mutex<ReplayStats>>,
    ) -> Self {
        Self {
            idx,
            ctx,
            queue,
            semaphore,
            stats,
        }
    }

    /// Run until the termination sentinel arrives (or the queue stays empty
    /// past the configured ceiling), then drain in-flight tasks and return
    /// the merged stats.
    pub async fn run(self) -> ReplayStats {
        // Stagger startup so workers do not all hit the queue and the
        // credential provider in the same instant.
        let stagger_ms = rand::thread_rng().gen_range(1000..3000);
        tokio::time::sleep(Duration::from_millis(stagger_ms)).await;

        let mut in_flight: Vec<JoinHandle<ReplayStats>> = Vec::new();
        let mut empty_queue_sec = 0.0f64;

        loop {
            // Admission control gates in-flight connections, so acquire
            // before taking a job off the queue.
            let permit = match &self.semaphore {
                Some(semaphore) => match semaphore.clone().acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                },
                None => None,
            };

            let job = {
                let mut queue = self.queue.lock().await;
                tokio::time::timeout(DEQUEUE_TIMEOUT, queue.recv()).await
            };
            let job = match job {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(_) => {
                    drop(permit);
                    empty_queue_sec += DEQUEUE_TIMEOUT.as_secs_f64();
                    if empty_queue_sec > self.ctx.config.empty_queue_timeout_sec {
                        warn!(
                            "Worker {} queue empty for {empty_queue_sec:.0} sec, shutting down",
                            self.idx
                        );
                        break;
                    }
                    continue;
                }
            };

            let (job_id, connection) = match job {
                Job::Terminate => {
                    debug!("Worker {} received termination signal", self.idx);
                    break;
                }
                Job::Connection {
                    job_id,
                    connection,
                } => (job_id, connection),
            };

            // Hold the job until its scheduled start comes due.
            let due_in_ms =
                connection.offset_ms(self.ctx.first_event_time) - self.ctx.elapsed_ms();
            if due_in_ms > SCHEDULE_SLACK_MS {
                tokio::time::sleep(Duration::from_millis(due_in_ms as u64)).await;
            }

            debug!("Worker {} starting job {job_id} ({})", self.idx, connection.connection_key);
            let executor = ConnectionExecutor::new(self.ctx.clone(), connection, permit);
            in_flight.push(tokio::spawn(executor.run()));

            // Reap whatever already finished, without blocking the loop.
            let mut still_running = Vec::with_capacity(in_flight.len());
            for handle in in_flight {
                if handle.is_finished() {
                    merge_task(&self.stats, handle).await;
                } else {
                    still_running.push(handle);
                }
            }
            in_flight = still_running;
        }

        info!(
            "Worker {} draining {} in-flight connections",
            self.idx,
            in_flight.len()
        );
        for handle in in_flight {
            merge_task(&self.stats, handle).await;
        }
        self.stats.lock().clone()
    }
}

async fn merge_task(stats: &parking_lot::Mutex<ReplayStats>, handle: JoinHandle<ReplayStats>) {
    match handle.await {
        Ok(task_stats) => stats.lock().collect(&task_stats),
        Err(err) => warn!("Connection task panicked: {err}"),
    }
}
