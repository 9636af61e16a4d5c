//! Reminder worker: polls the time index, processes due jobs, retries failures.

use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use payremind_core::Clock;
use payremind_payables::{NotificationSender, PayableAccessor};

use super::config::{ConfigError, ReminderConfig};
use super::gc::{GarbageCollector, GcReport};
use super::processor::{ProcessOutcome, ReminderProcessor};
use super::retry::{RetryOutcome, RetryScheduler};
use super::store::{IndexEntry, ScheduleStore, StoreError};
use super::types::{JobId, ReminderPayload};

/// What became of one popped job.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobFate {
    /// Processed; payload and job-set link removed.
    Completed(ProcessOutcome),
    /// Payload expired or never written.
    MissingPayload,
    /// Payload could not be decoded and was deleted.
    Malformed,
    Retried { attempts: u32, due_at: i64 },
    Dropped { attempts: u32 },
    /// A store failure interrupted handling; the index entry was put back.
    Restored,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub fate: JobFate,
}

/// What one tick found in the index.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tick {
    Idle,
    NotDue { next_due: i64 },
    Processed(Vec<JobReport>),
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TickReport {
    /// Set when this tick ran a GC sweep that succeeded.
    pub gc: Option<GcReport>,
    pub tick: Tick,
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub ticks: u64,
    pub jobs_popped: u64,
    pub sent: u64,
    pub discarded: u64,
    pub missing_payloads: u64,
    pub malformed_payloads: u64,
    pub retried: u64,
    pub dropped: u64,
    pub gc_sweeps: u64,
    pub gc_pruned: u64,
    pub loop_errors: u64,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn record(&mut self, report: &TickReport) {
        self.ticks += 1;
        if let Some(gc) = &report.gc {
            self.gc_sweeps += 1;
            self.gc_pruned += gc.examined as u64;
        }
        if let Tick::Processed(jobs) = &report.tick {
            for job in jobs {
                self.jobs_popped += 1;
                match &job.fate {
                    JobFate::Completed(ProcessOutcome::Sent { .. }) => self.sent += 1,
                    JobFate::Completed(ProcessOutcome::Discarded(_)) => self.discarded += 1,
                    JobFate::MissingPayload => self.missing_payloads += 1,
                    JobFate::Malformed => self.malformed_payloads += 1,
                    JobFate::Retried { .. } => self.retried += 1,
                    JobFate::Dropped { .. } => self.dropped += 1,
                    JobFate::Restored => self.loop_errors += 1,
                }
            }
        }
    }
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct ReminderWorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl ReminderWorkerHandle {
    /// Request graceful shutdown, wait for the loop to exit and return the
    /// final statistics.
    ///
    /// A job being processed when shutdown is requested finishes first.
    pub fn shutdown(mut self) -> WorkerStats {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
        self.stats()
    }

    pub fn stats(&self) -> WorkerStats {
        lock_stats(&self.stats).clone()
    }
}

fn lock_stats(stats: &Mutex<WorkerStats>) -> MutexGuard<'_, WorkerStats> {
    stats.lock().unwrap_or_else(|e| e.into_inner())
}

/// Background reminder worker.
///
/// Any number of workers may share one store; the atomic pop-due is the only
/// coordination between them. Jobs are delivered at least once.
pub struct ReminderWorker<S: ScheduleStore + Clone> {
    store: S,
    processor: ReminderProcessor,
    retries: RetryScheduler<S>,
    gc: GarbageCollector<S>,
    clock: Arc<dyn Clock>,
    config: ReminderConfig,
    last_gc: Option<i64>,
}

impl<S: ScheduleStore + Clone + 'static> ReminderWorker<S> {
    /// Build a worker; fails if `config` does not validate.
    pub fn new(
        store: S,
        accessor: Arc<dyn PayableAccessor>,
        sender: Arc<dyn NotificationSender>,
        clock: Arc<dyn Clock>,
        config: ReminderConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let processor = ReminderProcessor::new(accessor.clone(), sender, clock.clone())
            .with_helper_limit(config.helper_thread_limit);
        let retries = RetryScheduler::new(store.clone(), clock.clone(), config.clone());
        let gc = GarbageCollector::new(store.clone(), clock.clone(), config.clone())
            .with_mirror(accessor);

        Ok(Self {
            store,
            processor,
            retries,
            gc,
            clock,
            config,
            last_gc: None,
        })
    }

    pub fn config(&self) -> &ReminderConfig {
        &self.config
    }

    /// Run one loop iteration: maybe sweep, then pop and handle due jobs.
    pub fn tick(&mut self) -> Result<TickReport, StoreError> {
        let now = self.clock.now_ts();
        let gc = self.maybe_sweep(now);

        let Some(head) = self.store.index_peek_min()? else {
            return Ok(TickReport {
                gc,
                tick: Tick::Idle,
            });
        };
        if head.due_at > now {
            return Ok(TickReport {
                gc,
                tick: Tick::NotDue {
                    next_due: head.due_at,
                },
            });
        }

        let popped = self.store.index_pop_due(now, self.config.batch_size)?;
        debug!(worker = %self.config.name, count = popped.len(), "popped due jobs");

        let mut jobs = Vec::with_capacity(popped.len());
        for entry in popped {
            let fate = match self.handle(&entry) {
                Ok(fate) => fate,
                Err(e) => self.restore(&entry, &e),
            };
            jobs.push(JobReport {
                job_id: entry.job_id,
                fate,
            });
        }

        Ok(TickReport {
            gc,
            tick: Tick::Processed(jobs),
        })
    }

    /// How long the loop waits after a tick. A tick that had to restore a
    /// job backs off like a failed tick, since the restored entry is due
    /// again at once.
    fn pause_after(&self, tick: &Tick) -> Duration {
        match tick {
            Tick::Idle => self.config.idle_sleep,
            Tick::NotDue { next_due } => {
                let wait = next_due.saturating_sub(self.clock.now_ts()).max(0) as u64;
                Duration::from_secs(wait).min(self.config.max_sleep)
            }
            Tick::Processed(jobs) if jobs.iter().any(|j| j.fate == JobFate::Restored) => {
                self.config.error_backoff
            }
            Tick::Processed(_) => Duration::ZERO,
        }
    }

    fn maybe_sweep(&mut self, now: i64) -> Option<GcReport> {
        let interval = i64::try_from(self.config.gc_interval.as_secs()).unwrap_or(i64::MAX);
        if self.last_gc.is_some_and(|last| now.saturating_sub(last) < interval) {
            return None;
        }
        self.last_gc = Some(now);

        match self.gc.sweep() {
            Ok(report) => Some(report),
            Err(e) => {
                error!(worker = %self.config.name, error = %e, "garbage collection failed");
                None
            }
        }
    }

    fn handle(&self, entry: &IndexEntry) -> Result<JobFate, StoreError> {
        let job_id = &entry.job_id;

        let Some(raw) = self.store.payload_get(job_id)? else {
            info!(job_id = %job_id, "payload missing, discarding job");
            if let Some(pid) = job_id.payable_id() {
                self.store.entity_remove(pid, job_id)?;
            }
            return Ok(JobFate::MissingPayload);
        };

        let payload = match ReminderPayload::decode(&raw) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "malformed payload, discarding job");
                self.forget(job_id)?;
                return Ok(JobFate::Malformed);
            }
        };

        match self
            .processor
            .process_with_timeout(&payload, self.config.processing_timeout)
        {
            Ok(outcome) => {
                self.forget(job_id)?;
                Ok(JobFate::Completed(outcome))
            }
            Err(e) => {
                warn!(
                    job_id = %job_id,
                    attempts = payload.attempts,
                    error = %e,
                    "reminder processing failed"
                );
                Ok(match self.retries.schedule_retry(payload)? {
                    RetryOutcome::Requeued { attempts, due_at } => {
                        JobFate::Retried { attempts, due_at }
                    }
                    RetryOutcome::Dropped { attempts } => JobFate::Dropped { attempts },
                })
            }
        }
    }

    /// Delete payload and job-set link of a finished job.
    fn forget(&self, job_id: &JobId) -> Result<(), StoreError> {
        self.store.payload_delete(job_id)?;
        if let Some(pid) = job_id.payable_id() {
            self.store.entity_remove(pid, job_id)?;
        }
        Ok(())
    }

    /// Put a popped entry back after a store failure so it is not lost.
    fn restore(&self, entry: &IndexEntry, cause: &StoreError) -> JobFate {
        error!(job_id = %entry.job_id, error = %cause, "store failure while handling job");
        if let Err(e) = self.store.index_insert(&entry.job_id, entry.due_at, true) {
            error!(job_id = %entry.job_id, error = %e, "failed to restore index entry");
        }
        JobFate::Restored
    }

    /// Spawn the worker on a named background thread.
    pub fn spawn(self) -> std::io::Result<ReminderWorkerHandle>
    where
        S: Send,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(self.config.name.clone())
            .spawn(move || worker_loop(self, shutdown_rx, stats_clone))?;

        Ok(ReminderWorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn worker_loop<S: ScheduleStore + Clone + 'static>(
    mut worker: ReminderWorker<S>,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<WorkerStats>>,
) {
    let name = worker.config.name.clone();
    info!(worker = %name, "reminder worker started");
    let start_time = Instant::now();

    loop {
        let pause = match worker.tick() {
            Ok(report) => {
                lock_stats(&stats).record(&report);
                worker.pause_after(&report.tick)
            }
            Err(e) => {
                error!(worker = %name, error = %e, "reminder loop error");
                lock_stats(&stats).loop_errors += 1;
                worker.config.error_backoff
            }
        };

        lock_stats(&stats).uptime_secs = start_time.elapsed().as_secs();

        match shutdown_rx.recv_timeout(pause) {
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(worker = %name, "reminder worker stopped");
}
