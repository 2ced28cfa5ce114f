//! The dispatch loop: matches due jobs with waiting workers.
//!
//! A single task owns the loop. It sleeps until the earliest of three
//! events: a wake from a connection handler, the next due job or lease
//! deadline, or the idle interval. Each round is a sequence of scans under
//! the job lock; socket writes happen on the worker's own writer task.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::protocol::{encode_job_handle, Command, Message};
use crate::scheduler::grab::GrabItem;
use crate::scheduler::processing::Lease;
use crate::scheduler::sched::{now, JobState, Scheduler};

/// Pause after a storage failure before the next round.
const STORE_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    func: String,
    job_id: i64,
    sched_at: i64,
}

enum Assignment {
    Assigned,
    /// The grab entry was unusable; scan again.
    Retry,
    /// Storage is failing; stop this round.
    Backoff,
}

/// Seconds from `now` until `at`, never less than one.
fn secs_until(at: i64, now: i64) -> Duration {
    Duration::from_secs(u64::try_from(at.saturating_sub(now)).unwrap_or(0).max(1))
}

impl Scheduler {
    /// Run the dispatch loop until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(idle_interval = ?self.idle_interval, "Dispatch loop started");
        let mut delay = Duration::ZERO;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Dispatch loop shutting down");
                    break;
                }
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }
            delay = self.dispatch().await;
        }
    }

    /// One dispatch round. Assigns every due job that has a waiting worker
    /// and returns how long to sleep before the next round.
    pub async fn dispatch(self: &Arc<Self>) -> Duration {
        let mut skipped: HashSet<String> = HashSet::new();
        loop {
            let mut state = self.jobs.lock().await;
            let current = now();

            self.reclaim_expired(&mut state, current).await;

            // A lease is reclaimable once its deadline second has passed
            let idle = match state.processing.next_deadline() {
                Some(deadline) => self.idle_interval.min(secs_until(deadline.saturating_add(1), current)),
                None => self.idle_interval,
            };
            if state.grabs.is_empty() {
                return idle;
            }

            let Some(candidate) = self.pick_candidate(&state, &skipped).await else {
                return idle;
            };
            if candidate.sched_at > current {
                return idle.min(secs_until(candidate.sched_at, current));
            }

            // Nobody queued can run this function right now
            let Some(item) = state.grabs.take_for(&candidate.func) else {
                skipped.insert(candidate.func);
                continue;
            };

            match self.assign(&mut state, item, &candidate, current).await {
                Assignment::Assigned | Assignment::Retry => continue,
                Assignment::Backoff => return STORE_RETRY,
            }
        }
    }

    /// Earliest ready job across dispatchable functions, ties broken by name.
    /// Functions whose ready index has run dry get their job-count deflated.
    async fn pick_candidate(
        &self,
        state: &JobState,
        skipped: &HashSet<String>,
    ) -> Option<Candidate> {
        let mut stats = self.stats.lock().await;
        let mut best: Option<Candidate> = None;

        for func in stats.dispatchable() {
            if skipped.contains(&func) {
                continue;
            }
            match state.ready.peek(&func) {
                None => {
                    stats.deflate_job(&func);
                }
                Some((sched_at, job_id)) => {
                    if best.as_ref().map_or(true, |b| sched_at < b.sched_at) {
                        best = Some(Candidate {
                            func,
                            job_id,
                            sched_at,
                        });
                    }
                }
            }
        }
        best
    }

    async fn assign(
        self: &Arc<Self>,
        state: &mut JobState,
        item: GrabItem,
        candidate: &Candidate,
        current: i64,
    ) -> Assignment {
        let mut job = match self.store.get(candidate.job_id).await {
            Ok(job) => job,
            Err(e) if e.is_not_found() => {
                tracing::warn!(job_id = candidate.job_id, "Ready job missing from storage, dropping");
                state.ready.remove(candidate.job_id);
                self.stats.lock().await.decr_job(&candidate.func);
                state.grabs.push_front(item);
                return Assignment::Retry;
            }
            Err(e) => {
                tracing::error!(job_id = candidate.job_id, error = %e, "Failed to load job");
                state.grabs.push_front(item);
                return Assignment::Backoff;
            }
        };

        let worker = item.worker;
        let mut payload = encode_job_handle(job.id).to_vec();
        payload.extend_from_slice(&job.encode());
        let body = Message::new(&item.msg_id, Command::JobAssign, &payload).to_bytes();

        worker.lease(job.id);
        if !worker.deliver(body) {
            worker.release(job.id);
            worker.mark_dead();
            let purged = state.grabs.remove_worker(worker.id);
            tracing::warn!(
                worker_id = worker.id,
                job_id = job.id,
                purged,
                "Failed to deliver assignment, retiring worker"
            );
            let sched = self.clone();
            tokio::spawn(async move {
                sched.retire_worker(&worker).await;
            });
            return Assignment::Retry;
        }

        job.set_processing();
        job.run_at = current;
        if let Err(e) = self.store.save(&mut job).await {
            // The worker already has it; the in-memory lease still governs
            tracing::error!(job_id = job.id, error = %e, "Failed to persist job lease");
        }

        state.ready.remove(job.id);
        state.processing.insert(
            job.id,
            Lease {
                func: job.func.clone(),
                worker_id: Some(worker.id),
                deadline: job.lease_deadline(),
            },
        );
        self.stats.lock().await.incr_proc(&job.func);

        tracing::debug!(
            job_id = job.id,
            func = %job.func,
            name = %job.name,
            worker_id = worker.id,
            "Job assigned"
        );
        Assignment::Assigned
    }

    /// Return every job whose lease ran out to ready.
    async fn reclaim_expired(&self, state: &mut JobState, current: i64) {
        for job_id in state.processing.expired(current) {
            tracing::info!(job_id, "Lease expired, returning job to ready");
            if let Err(e) = self.requeue(state, job_id, None).await {
                tracing::warn!(job_id, error = %e, "Failed to reclaim job");
            }
        }
    }
}
