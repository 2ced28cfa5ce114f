use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};

use crate::error::Result;
use crate::scheduler::grab::{GrabItem, GrabQueue, WorkerHandle};
use crate::scheduler::job::Job;
use crate::scheduler::processing::{Lease, ProcessingSet};
use crate::scheduler::queue::ReadyQueue;
use crate::scheduler::stats::{FuncStat, FuncStats};
use crate::storage::StoreDriver;

/// Current unix time in seconds.
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Everything guarded by the job lock.
#[derive(Debug, Default)]
pub struct JobState {
    pub ready: ReadyQueue,
    pub grabs: GrabQueue,
    pub processing: ProcessingSet,
}

/// How a worker settled a leased job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Fail,
    /// Return to ready `delay` seconds from now with the given retry counter.
    SchedLater { delay: i64, counter: i64 },
}

/// Shared scheduler context handed to every connection handler.
///
/// Lock order is always `jobs` before `stats`. Neither lock is held across a
/// socket write: assignments are queued on the worker's outbound channel.
pub struct Scheduler {
    pub(crate) store: Arc<dyn StoreDriver>,
    pub(crate) jobs: Mutex<JobState>,
    pub(crate) stats: Mutex<FuncStats>,
    pub(crate) wake: Notify,
    pub(crate) idle_interval: Duration,
    worker_seq: AtomicU64,
}

impl Scheduler {
    pub fn new(store: Arc<dyn StoreDriver>, idle_interval: Duration) -> Self {
        Self {
            store,
            jobs: Mutex::new(JobState::default()),
            stats: Mutex::new(FuncStats::new()),
            wake: Notify::new(),
            idle_interval,
            worker_seq: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn StoreDriver> {
        &self.store
    }

    /// Ask the dispatch loop to re-scan. Wakes raised before it resumes coalesce.
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    /// Rebuild in-memory state from the store after a restart.
    ///
    /// Jobs with an empty name are purged. Processing jobs whose lease has
    /// already run out (or that never had one) go back to ready; the rest
    /// keep an ownerless lease until they expire.
    pub async fn load_jobs(&self, batch: usize) -> Result<()> {
        let batch = batch.max(1);
        let current = now();
        let total = self.store.count().await?;

        let mut state = self.jobs.lock().await;
        let mut stats = self.stats.lock().await;
        let mut reset = Vec::new();
        let mut purge = Vec::new();

        let mut offset = 0;
        while offset < total {
            let page = self.store.range(offset, batch).await?;
            if page.is_empty() {
                break;
            }
            offset += page.len();

            for job in page {
                if job.name.is_empty() {
                    purge.push(job.id);
                    continue;
                }
                stats.incr_job(&job.func);
                if !job.is_processing() {
                    state.ready.push(&job.func, job.id, job.sched_at);
                    continue;
                }
                match job.lease_deadline() {
                    Some(deadline) if deadline >= current => {
                        state.processing.insert(
                            job.id,
                            Lease {
                                func: job.func.clone(),
                                worker_id: None,
                                deadline: Some(deadline),
                            },
                        );
                        stats.incr_proc(&job.func);
                    }
                    _ => reset.push(job),
                }
            }
        }

        let reset_count = reset.len();
        for mut job in reset {
            job.set_ready();
            self.store.save(&mut job).await?;
            state.ready.push(&job.func, job.id, job.sched_at);
        }
        for id in &purge {
            self.store.delete(*id).await?;
        }

        tracing::info!(
            total,
            ready = state.ready.len(),
            processing = state.processing.len(),
            reset = reset_count,
            purged = purge.len(),
            "Jobs loaded from storage"
        );
        Ok(())
    }

    /// Register a new worker connection whose frames go out through `outbound`.
    pub fn register_worker(&self, outbound: mpsc::Sender<Vec<u8>>) -> Arc<WorkerHandle> {
        let id = self.worker_seq.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(worker_id = id, "Worker registered");
        Arc::new(WorkerHandle::new(id, outbound))
    }

    /// Announce a function. Ignored once the worker is dead: its teardown
    /// reads the function set under the same stats lock.
    pub async fn can_do(&self, worker: &WorkerHandle, func: &str) {
        let mut stats = self.stats.lock().await;
        if !worker.is_alive() {
            tracing::debug!(worker_id = worker.id, func, "Ignoring CANDO from dead worker");
            return;
        }
        if worker.add_func(func) {
            let count = stats.incr_worker(func);
            drop(stats);
            tracing::debug!(worker_id = worker.id, func, workers = count, "CANDO");
            self.notify();
        }
    }

    pub async fn cant_do(&self, worker: &WorkerHandle, func: &str) {
        let mut stats = self.stats.lock().await;
        if !worker.is_alive() {
            return;
        }
        if worker.remove_func(func) {
            let count = stats.decr_worker(func);
            tracing::debug!(worker_id = worker.id, func, workers = count, "CANTDO");
        }
    }

    /// Queue a standing grab request. The reply goes out when a job is assigned.
    pub async fn grab_job(&self, worker: &Arc<WorkerHandle>, msg_id: &[u8]) {
        let mut state = self.jobs.lock().await;
        if !worker.is_alive() {
            tracing::debug!(worker_id = worker.id, "Ignoring GRABJOB from dead worker");
            return;
        }
        state.grabs.push(GrabItem {
            worker: worker.clone(),
            msg_id: msg_id.to_vec(),
        });
        drop(state);
        self.notify();
    }

    /// Upsert a job by `(func, name)` and make it ready.
    ///
    /// A resubmission of a job that is currently leased supersedes the lease;
    /// the old holder's eventual report is then ignored.
    pub async fn submit_job(&self, mut job: Job) -> Result<Job> {
        let mut state = self.jobs.lock().await;

        let existing = match self.store.get_one(&job.func, &job.name).await {
            Ok(old) => Some(old),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        job.id = existing.as_ref().map_or(0, |old| old.id);
        job.run_at = existing.as_ref().map_or(0, |old| old.run_at);
        job.set_ready();
        self.store.save(&mut job).await?;

        {
            let mut stats = self.stats.lock().await;
            if existing.is_none() {
                stats.incr_job(&job.func);
            } else if state.processing.remove(job.id).is_some() {
                stats.decr_proc(&job.func);
            }
        }
        state.ready.push(&job.func, job.id, job.sched_at);
        drop(state);

        tracing::debug!(
            job_id = job.id,
            func = %job.func,
            name = %job.name,
            sched_at = job.sched_at,
            new = existing.is_none(),
            "Job submitted"
        );
        self.notify();
        Ok(job)
    }

    /// Delete a job by `(func, name)`, reversing any lease accounting.
    pub async fn remove_job(&self, func: &str, name: &str) -> Result<Job> {
        let mut state = self.jobs.lock().await;
        let job = self.store.get_one(func, name).await?;
        self.store.delete(job.id).await?;

        state.ready.remove(job.id);
        let lease = state.processing.remove(job.id);
        {
            let mut stats = self.stats.lock().await;
            stats.decr_job(&job.func);
            if lease.is_some() {
                stats.decr_proc(&job.func);
            }
        }
        drop(state);

        tracing::debug!(job_id = job.id, func, name, "Job removed");
        self.notify();
        Ok(job)
    }

    /// Delete every job of a function and forget it. Refused (returns
    /// `false`) while any worker still advertises the function.
    pub async fn drop_func(&self, func: &str) -> Result<bool> {
        let mut state = self.jobs.lock().await;
        let mut stats = self.stats.lock().await;

        match stats.get(func) {
            Some(stat) if stat.worker == 0 => {}
            Some(stat) => {
                tracing::info!(func, workers = stat.worker, "Refusing to drop function with workers");
                return Ok(false);
            }
            None => return Ok(false),
        }

        let ids: Vec<i64> = self.store.iter_func(func).await?.map(|job| job.id).collect();
        for id in &ids {
            self.store.delete(*id).await?;
            state.processing.remove(*id);
        }
        for id in state.processing.jobs_for_func(func) {
            state.processing.remove(id);
        }
        state.ready.remove_func(func);
        stats.remove(func);

        tracing::info!(func, jobs = ids.len(), "Function dropped");
        Ok(true)
    }

    /// Newline-delimited `func,workers,jobs,processing` report.
    pub async fn status(&self) -> String {
        self.stats.lock().await.report()
    }

    /// Counters for one function, read after any in-flight job transition.
    pub async fn stat(&self, func: &str) -> Option<FuncStat> {
        let _jobs = self.jobs.lock().await;
        self.stats.lock().await.get(func)
    }

    pub async fn grab_queue_len(&self) -> usize {
        self.jobs.lock().await.grabs.len()
    }

    pub async fn is_processing(&self, job_id: i64) -> bool {
        self.jobs.lock().await.processing.contains(job_id)
    }

    /// Apply a worker's report on a leased job.
    ///
    /// Reports for jobs that are not leased, or leased to someone else, are
    /// stale and ignored (`Ok(false)`).
    pub async fn report(&self, worker_id: u64, job_id: i64, outcome: Outcome) -> Result<bool> {
        let mut state = self.jobs.lock().await;
        match state.processing.get(job_id) {
            Some(lease) if lease.accepts(worker_id) => {}
            _ => {
                tracing::debug!(worker_id, job_id, ?outcome, "Ignoring stale report");
                return Ok(false);
            }
        }

        match outcome {
            Outcome::Done => self.finish(&mut state, job_id).await?,
            Outcome::Fail => self.requeue(&mut state, job_id, None).await?,
            Outcome::SchedLater { delay, counter } => {
                self.requeue(&mut state, job_id, Some((delay, counter)))
                    .await?
            }
        }
        drop(state);

        tracing::debug!(worker_id, job_id, ?outcome, "Job settled");
        self.notify();
        Ok(true)
    }

    pub async fn done(&self, worker_id: u64, job_id: i64) -> Result<bool> {
        self.report(worker_id, job_id, Outcome::Done).await
    }

    pub async fn fail(&self, worker_id: u64, job_id: i64) -> Result<bool> {
        self.report(worker_id, job_id, Outcome::Fail).await
    }

    pub async fn sched_later(
        &self,
        worker_id: u64,
        job_id: i64,
        delay: i64,
        counter: i64,
    ) -> Result<bool> {
        self.report(worker_id, job_id, Outcome::SchedLater { delay, counter })
            .await
    }

    /// Tear down a worker: drop its grab requests, return its leased jobs to
    /// ready and stop counting it for its functions. Runs once per worker.
    pub async fn retire_worker(&self, worker: &WorkerHandle) {
        if !worker.begin_retire() {
            return;
        }

        let leased = worker.leased();
        {
            let mut state = self.jobs.lock().await;
            state.grabs.remove_worker(worker.id);
            for job_id in &leased {
                let owned = state
                    .processing
                    .get(*job_id)
                    .is_some_and(|lease| lease.accepts(worker.id));
                if owned {
                    if let Err(e) = self.requeue(&mut state, *job_id, None).await {
                        tracing::warn!(worker_id = worker.id, job_id, error = %e, "Failed to return job to ready");
                    }
                }
                worker.release(*job_id);
            }
        }
        {
            let mut stats = self.stats.lock().await;
            for func in worker.funcs() {
                stats.decr_worker(&func);
            }
        }

        tracing::info!(worker_id = worker.id, reclaimed = leased.len(), "Worker retired");
        self.notify();
    }

    /// Successful completion: forget the job entirely.
    async fn finish(&self, state: &mut JobState, job_id: i64) -> Result<()> {
        let Some(lease) = state.processing.get(job_id).cloned() else {
            return Ok(());
        };
        self.store.delete(job_id).await?;
        state.processing.remove(job_id);
        state.ready.remove(job_id);

        let mut stats = self.stats.lock().await;
        stats.decr_job(&lease.func);
        stats.decr_proc(&lease.func);
        Ok(())
    }

    /// Return a leased job to ready, optionally pushing its schedule back.
    /// Job-count is unchanged: the job is offered again.
    pub(crate) async fn requeue(
        &self,
        state: &mut JobState,
        job_id: i64,
        later: Option<(i64, i64)>,
    ) -> Result<()> {
        let Some(lease) = state.processing.get(job_id).cloned() else {
            return Ok(());
        };

        let mut job = match self.store.get(job_id).await {
            Ok(job) => job,
            Err(e) if e.is_not_found() => {
                state.processing.remove(job_id);
                let mut stats = self.stats.lock().await;
                stats.decr_proc(&lease.func);
                stats.decr_job(&lease.func);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        job.set_ready();
        if let Some((delay, counter)) = later {
            job.sched_at = now().saturating_add(delay.max(0));
            job.counter = if counter > 0 {
                counter
            } else {
                job.counter.saturating_add(1)
            };
        }
        self.store.save(&mut job).await?;

        state.processing.remove(job_id);
        state.ready.push(&job.func, job.id, job.sched_at);
        self.stats.lock().await.decr_proc(&job.func);
        Ok(())
    }
}
