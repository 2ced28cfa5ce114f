//! In-process job store. Jobs do not survive a restart.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{PeriodicError, Result};
use crate::scheduler::job::{Job, JobStatus};
use crate::storage::{JobIter, StoreDriver};

#[derive(Debug, Default)]
struct MemInner {
    jobs: BTreeMap<i64, Job>,
    names: HashMap<(String, String), i64>,
    last_id: i64,
}

#[derive(Debug, Default)]
pub struct MemStore {
    inner: RwLock<MemInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn paginate(jobs: impl Iterator<Item = Job>, offset: usize, limit: usize) -> Vec<Job> {
    let jobs = jobs.skip(offset);
    if limit == 0 {
        jobs.collect()
    } else {
        jobs.take(limit).collect()
    }
}

#[async_trait]
impl StoreDriver for MemStore {
    async fn save(&self, job: &mut Job) -> Result<i64> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        let key = (job.func.clone(), job.name.clone());
        let existing = inner.names.get(&key).copied();

        if job.id == 0 {
            job.id = match existing {
                Some(id) => id,
                None => {
                    inner.last_id += 1;
                    inner.last_id
                }
            };
        } else if let Some(other) = existing {
            if other != job.id {
                return Err(PeriodicError::Storage(format!(
                    "job {}/{} already stored with id {}",
                    job.func, job.name, other
                )));
            }
        }

        // A job may have been renamed under the same id
        if let Some(old) = inner.jobs.get(&job.id) {
            let old_key = (old.func.clone(), old.name.clone());
            if old_key != key {
                inner.names.remove(&old_key);
            }
        }
        inner.last_id = inner.last_id.max(job.id);
        inner.names.insert(key, job.id);
        inner.jobs.insert(job.id, job.clone());
        Ok(job.id)
    }

    async fn get(&self, id: i64) -> Result<Job> {
        self.inner
            .read()
            .await
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| PeriodicError::JobNotFound(format!("id {}", id)))
    }

    async fn get_one(&self, func: &str, name: &str) -> Result<Job> {
        let inner = self.inner.read().await;
        inner
            .names
            .get(&(func.to_string(), name.to_string()))
            .and_then(|id| inner.jobs.get(id))
            .cloned()
            .ok_or_else(|| PeriodicError::JobNotFound(format!("{}/{}", func, name)))
    }

    async fn delete(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(job) = inner.jobs.remove(&id) {
            inner.names.remove(&(job.func, job.name));
        }
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.inner.read().await.jobs.len())
    }

    async fn range(&self, offset: usize, limit: usize) -> Result<Vec<Job>> {
        let inner = self.inner.read().await;
        Ok(paginate(inner.jobs.values().cloned(), offset, limit))
    }

    async fn range_scheduled(
        &self,
        func: &str,
        status: JobStatus,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Job>> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| job.func == func && job.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| (job.sched_at, job.id));
        Ok(paginate(jobs.into_iter(), offset, limit))
    }

    async fn iter_func(&self, func: &str) -> Result<JobIter> {
        let inner = self.inner.read().await;
        let jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| job.func == func)
            .cloned()
            .collect();
        Ok(Box::new(jobs.into_iter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_assigns_ids() {
        let store = MemStore::new();
        let mut a = Job::new("f", "a");
        let mut b = Job::new("f", "b");
        assert_eq!(store.save(&mut a).await.unwrap(), 1);
        assert_eq!(store.save(&mut b).await.unwrap(), 2);
        assert_eq!(a.id, 1);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_resave_same_pair_keeps_id() {
        let store = MemStore::new();
        let mut first = Job::new("f", "n").with_args("v1");
        store.save(&mut first).await.unwrap();

        let mut second = Job::new("f", "n").with_args("v2");
        store.save(&mut second).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.get_one("f", "n").await.unwrap().args, "v2");
    }

    #[tokio::test]
    async fn test_not_found_is_distinguished() {
        let store = MemStore::new();
        assert!(store.get(42).await.unwrap_err().is_not_found());
        assert!(store.get_one("f", "n").await.unwrap_err().is_not_found());
        store.delete(42).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_frees_name() {
        let store = MemStore::new();
        let mut job = Job::new("f", "n");
        store.save(&mut job).await.unwrap();
        store.delete(job.id).await.unwrap();
        assert!(store.get_one("f", "n").await.is_err());

        let mut again = Job::new("f", "n");
        store.save(&mut again).await.unwrap();
        assert_ne!(again.id, job.id);
    }

    #[tokio::test]
    async fn test_range_scheduled_orders_by_sched_at() {
        let store = MemStore::new();
        for (name, at) in [("a", 30), ("b", 10), ("c", 20)] {
            store
                .save(&mut Job::new("f", name).with_sched_at(at))
                .await
                .unwrap();
        }
        let mut busy = Job::new("f", "d").with_sched_at(1);
        busy.set_processing();
        store.save(&mut busy).await.unwrap();
        store.save(&mut Job::new("g", "e")).await.unwrap();

        let ready = store
            .range_scheduled("f", JobStatus::Ready, 0, 0)
            .await
            .unwrap();
        let names: Vec<&str> = ready.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c", "a"]);

        let first = store
            .range_scheduled("f", JobStatus::Ready, 0, 1)
            .await
            .unwrap();
        assert_eq!(first[0].name, "b");
    }

    #[tokio::test]
    async fn test_range_and_iter_func() {
        let store = MemStore::new();
        for name in ["a", "b", "c"] {
            store.save(&mut Job::new("f", name)).await.unwrap();
        }
        store.save(&mut Job::new("g", "x")).await.unwrap();

        assert_eq!(store.range(0, 2).await.unwrap().len(), 2);
        assert_eq!(store.range(2, 2).await.unwrap().len(), 2);
        assert_eq!(store.range(0, 0).await.unwrap().len(), 4);
        assert_eq!(store.iter_func("f").await.unwrap().count(), 3);
        assert_eq!(store.iter_func("missing").await.unwrap().count(), 0);
    }
}
