use std::collections::{BTreeSet, HashMap};

/// Ready-Job Index: per function, ready jobs ordered by `(sched_at, id)`.
///
/// A reverse map from job id lets a job be moved or removed without knowing
/// its previous schedule.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    by_func: HashMap<String, BTreeSet<(i64, i64)>>,
    entries: HashMap<i64, (String, i64)>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or reschedule a ready job.
    pub fn push(&mut self, func: &str, job_id: i64, sched_at: i64) {
        self.remove(job_id);
        self.by_func
            .entry(func.to_string())
            .or_default()
            .insert((sched_at, job_id));
        self.entries.insert(job_id, (func.to_string(), sched_at));
    }

    /// Drop a job from the index. Returns whether it was present.
    pub fn remove(&mut self, job_id: i64) -> bool {
        let Some((func, sched_at)) = self.entries.remove(&job_id) else {
            return false;
        };
        if let Some(set) = self.by_func.get_mut(&func) {
            set.remove(&(sched_at, job_id));
            if set.is_empty() {
                self.by_func.remove(&func);
            }
        }
        true
    }

    /// Earliest-due ready job for a function as `(sched_at, job_id)`.
    pub fn peek(&self, func: &str) -> Option<(i64, i64)> {
        self.by_func
            .get(func)
            .and_then(|set| set.iter().next().copied())
    }

    /// Remove every entry for a function, returning the dropped job ids.
    pub fn remove_func(&mut self, func: &str) -> Vec<i64> {
        let Some(set) = self.by_func.remove(func) else {
            return Vec::new();
        };
        let ids: Vec<i64> = set.into_iter().map(|(_, id)| id).collect();
        for id in &ids {
            self.entries.remove(id);
        }
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
