use std::collections::{BTreeSet, HashMap};

/// Lease bookkeeping for one in-flight job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub func: String,
    /// Holder of the lease; `None` for leases rehydrated at startup.
    pub worker_id: Option<u64>,
    /// Unix second after which the lease may be reclaimed.
    pub deadline: Option<i64>,
}

impl Lease {
    /// Whether a report from `worker_id` may settle this lease.
    pub fn accepts(&self, worker_id: u64) -> bool {
        self.worker_id.map_or(true, |holder| holder == worker_id)
    }
}

/// Jobs currently leased to a worker, with deadline ordering for reclaim.
#[derive(Debug, Default)]
pub struct ProcessingSet {
    leases: HashMap<i64, Lease>,
    deadlines: BTreeSet<(i64, i64)>,
}

impl ProcessingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, job_id: i64, lease: Lease) {
        self.remove(job_id);
        if let Some(deadline) = lease.deadline {
            self.deadlines.insert((deadline, job_id));
        }
        self.leases.insert(job_id, lease);
    }

    pub fn remove(&mut self, job_id: i64) -> Option<Lease> {
        let lease = self.leases.remove(&job_id)?;
        if let Some(deadline) = lease.deadline {
            self.deadlines.remove(&(deadline, job_id));
        }
        Some(lease)
    }

    pub fn get(&self, job_id: i64) -> Option<&Lease> {
        self.leases.get(&job_id)
    }

    pub fn contains(&self, job_id: i64) -> bool {
        self.leases.contains_key(&job_id)
    }

    /// Job ids whose lease deadline has passed, i.e. lies before `now`.
    pub fn expired(&self, now: i64) -> Vec<i64> {
        self.deadlines
            .iter()
            .take_while(|(deadline, _)| *deadline < now)
            .map(|(_, id)| *id)
            .collect()
    }

    /// The soonest lease deadline, if any lease has one.
    pub fn next_deadline(&self) -> Option<i64> {
        self.deadlines.iter().next().map(|(deadline, _)| *deadline)
    }

    /// Leases belonging to a function.
    pub fn jobs_for_func(&self, func: &str) -> Vec<i64> {
        self.leases
            .iter()
            .filter(|(_, lease)| lease.func == func)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}
