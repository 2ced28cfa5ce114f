//! Job persistence.
//!
//! The scheduler only talks to [`StoreDriver`]; backends decide how jobs are
//! kept. `(func, name)` is unique: saving a job with id 0 whose pair already
//! exists updates that row and reuses its id.

mod memory;
mod sqlite;

pub use memory::MemStore;
pub use sqlite::SqliteStore;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::StorageConfig;
use crate::error::Result;
use crate::scheduler::job::{Job, JobStatus};

/// Snapshot iterator over stored jobs.
pub type JobIter = Box<dyn Iterator<Item = Job> + Send>;

#[async_trait]
pub trait StoreDriver: Send + Sync {
    /// Insert or update a job, assigning `job.id` on first save.
    async fn save(&self, job: &mut Job) -> Result<i64>;

    /// Load a job by id. Missing jobs are `PeriodicError::JobNotFound`.
    async fn get(&self, id: i64) -> Result<Job>;

    /// Load a job by its `(func, name)` pair.
    async fn get_one(&self, func: &str, name: &str) -> Result<Job>;

    /// Delete a job. Deleting a missing id is not an error.
    async fn delete(&self, id: i64) -> Result<()>;

    async fn count(&self) -> Result<usize>;

    /// Jobs in id order. A `limit` of 0 means no limit.
    async fn range(&self, offset: usize, limit: usize) -> Result<Vec<Job>>;

    /// Jobs of one function and status in `(sched_at, id)` order.
    /// A `limit` of 0 means no limit.
    async fn range_scheduled(
        &self,
        func: &str,
        status: JobStatus,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Job>>;

    /// Every job of a function, used for bulk drops.
    async fn iter_func(&self, func: &str) -> Result<JobIter>;
}

/// Open the store selected by configuration.
pub fn open(config: &StorageConfig) -> Result<Arc<dyn StoreDriver>> {
    match config {
        StorageConfig::Memory => Ok(Arc::new(MemStore::new())),
        StorageConfig::Sqlite { path } => Ok(Arc::new(SqliteStore::new(path)?)),
    }
}
