use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{bounded, tick, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, error, info, warn};

use super::executor::{TaskExecutor, TaskReport};
use crate::generation::Watchdog;
use crate::queue::TaskQueue;

/// How long blocked threads wait before re-checking the shutdown flag.
const SHUTDOWN_CHECK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub worker_count: usize,
    /// Sleep between polls of an empty queue.
    pub poll_interval: Duration,
    /// Period of the reaper's expiry and watchdog pass.
    pub reaper_interval: Duration,
}

/// Periodic maintenance: re-queues tasks whose claim outlived the unit
/// timeout and fails stalled batches.
pub struct Reaper {
    queue: TaskQueue,
    watchdog: Watchdog,
    unit_timeout: Duration,
    task_retention: Duration,
}

impl Reaper {
    pub fn new(
        queue: TaskQueue,
        watchdog: Watchdog,
        unit_timeout: Duration,
        task_retention: Duration,
    ) -> Self {
        Self {
            queue,
            watchdog,
            unit_timeout,
            task_retention,
        }
    }

    pub fn run_once(&self) {
        if let Err(e) = self.queue.requeue_expired(self.unit_timeout) {
            error!("Failed to re-queue expired tasks: {}", e);
        }
        match self.watchdog.sweep(Utc::now()) {
            Ok(failed) if !failed.is_empty() => {
                warn!("Watchdog failed {} stalled batch(es)", failed.len())
            }
            Ok(_) => {}
            Err(e) => error!("Watchdog sweep failed: {}", e),
        }
        if let Err(e) = self.queue.purge_finished(self.task_retention) {
            error!("Failed to purge finished tasks: {}", e);
        }
    }
}

/// Fixed set of consumer threads draining the task queue, plus one reaper.
pub struct WorkerPool {
    report_receiver: Receiver<TaskReport>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Starts the pool.
    ///
    /// # Panics
    /// Panics if `settings.worker_count` is 0.
    pub fn start(executor: Arc<TaskExecutor>, reaper: Reaper, settings: PoolSettings) -> Self {
        assert!(settings.worker_count > 0, "worker_count must be > 0");
        let (report_sender, report_receiver) = bounded::<TaskReport>(settings.worker_count * 16);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(settings.worker_count + 1);

        for worker_id in 0..settings.worker_count {
            let report_tx = report_sender.clone();
            let shutdown_flag = Arc::clone(&shutdown);
            let worker_executor = Arc::clone(&executor);
            let poll_interval = settings.poll_interval;

            let handle = thread::spawn(move || {
                run_worker(
                    worker_id,
                    worker_executor,
                    report_tx,
                    shutdown_flag,
                    poll_interval,
                );
            });

            workers.push(handle);
        }

        let shutdown_flag = Arc::clone(&shutdown);
        let reaper_interval = settings.reaper_interval;
        workers.push(thread::spawn(move || {
            run_reaper(reaper, shutdown_flag, reaper_interval);
        }));

        info!(
            "Started {} workers on queue '{}'",
            settings.worker_count,
            executor.queue().name()
        );

        Self {
            report_receiver,
            workers,
            shutdown,
        }
    }

    pub fn try_recv_report(&self) -> Option<TaskReport> {
        self.report_receiver.try_recv().ok()
    }

    pub fn recv_report_timeout(&self, timeout: Duration) -> Option<TaskReport> {
        self.report_receiver.recv_timeout(timeout).ok()
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Joins every thread. Call after [`WorkerPool::shutdown`].
    pub fn wait(self) {
        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All workers have stopped");
    }
}

fn run_worker(
    worker_id: usize,
    executor: Arc<TaskExecutor>,
    report_sender: Sender<TaskReport>,
    shutdown: Arc<AtomicBool>,
    poll_interval: Duration,
) {
    debug!("Worker {} started", worker_id);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        match executor.run_next() {
            Ok(Some(report)) => {
                debug!(
                    "Worker {} finished task {} ({})",
                    worker_id,
                    report.task_id,
                    report.kind.as_str()
                );
                match report_sender.try_send(report) {
                    Ok(()) => {}
                    Err(TrySendError::Full(report)) => {
                        debug!("Report channel full, dropping report for task {}", report.task_id)
                    }
                    Err(TrySendError::Disconnected(_)) => {}
                }
            }
            Ok(None) => thread::sleep(poll_interval),
            Err(e) => {
                error!("Worker {} could not claim a task: {}", worker_id, e);
                thread::sleep(poll_interval.max(SHUTDOWN_CHECK));
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}

fn run_reaper(reaper: Reaper, shutdown: Arc<AtomicBool>, interval: Duration) {
    let ticker = tick(interval);
    reaper.run_once();

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        match ticker.recv_timeout(SHUTDOWN_CHECK) {
            Ok(_) => reaper.run_once(),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!("Reaper stopped");
}
