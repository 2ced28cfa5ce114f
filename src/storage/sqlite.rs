//! SQLite-backed job store. Jobs survive restarts.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{PeriodicError, Result};
use crate::scheduler::job::{Job, JobStatus};
use crate::storage::{JobIter, StoreDriver};

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a store at the given path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| PeriodicError::Storage(e.to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                func TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                sched_at INTEGER NOT NULL,
                data TEXT NOT NULL,
                UNIQUE (func, name)
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_sched ON jobs(func, status, sched_at);
            "#,
        )?;
        Ok(())
    }

    /// Run `op` against the connection on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| PeriodicError::Storage(e.to_string()))?;
            op(&mut conn)
        })
        .await
        .map_err(|e| PeriodicError::Internal(format!("storage task failed: {}", e)))?
    }

    fn load_many(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Job>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;
        let mut jobs = Vec::new();
        for data in rows {
            jobs.push(Job::from_json(&data?)?);
        }
        Ok(jobs)
    }
}

fn sql_limit(limit: usize) -> i64 {
    if limit == 0 {
        -1
    } else {
        i64::try_from(limit).unwrap_or(i64::MAX)
    }
}

fn sql_offset(offset: usize) -> i64 {
    i64::try_from(offset).unwrap_or(i64::MAX)
}

#[async_trait]
impl StoreDriver for SqliteStore {
    async fn save(&self, job: &mut Job) -> Result<i64> {
        let mut record = job.clone();
        let id = self
            .blocking(move |conn| {
                let tx = conn.transaction()?;
                if record.id == 0 {
                    let existing: Option<i64> = tx
                        .query_row(
                            "SELECT id FROM jobs WHERE func = ?1 AND name = ?2",
                            params![record.func, record.name],
                            |row| row.get(0),
                        )
                        .optional()?;
                    record.id = match existing {
                        Some(id) => id,
                        None => {
                            tx.execute(
                                "INSERT INTO jobs (func, name, status, sched_at, data) VALUES (?1, ?2, ?3, ?4, '')",
                                params![
                                    record.func,
                                    record.name,
                                    record.status.to_string(),
                                    record.sched_at
                                ],
                            )?;
                            tx.last_insert_rowid()
                        }
                    };
                }

                let data = record.to_json()?;
                tx.execute(
                    r#"
                    INSERT INTO jobs (id, func, name, status, sched_at, data)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    ON CONFLICT(id) DO UPDATE SET
                        func = excluded.func,
                        name = excluded.name,
                        status = excluded.status,
                        sched_at = excluded.sched_at,
                        data = excluded.data
                    "#,
                    params![
                        record.id,
                        record.func,
                        record.name,
                        record.status.to_string(),
                        record.sched_at,
                        data
                    ],
                )?;
                tx.commit()?;
                Ok(record.id)
            })
            .await?;

        job.id = id;
        Ok(id)
    }

    async fn get(&self, id: i64) -> Result<Job> {
        let data: Option<String> = self
            .blocking(move |conn| {
                Ok(conn
                    .query_row("SELECT data FROM jobs WHERE id = ?1", params![id], |row| {
                        row.get(0)
                    })
                    .optional()?)
            })
            .await?;
        match data {
            Some(data) => Job::from_json(&data),
            None => Err(PeriodicError::JobNotFound(format!("id {}", id))),
        }
    }

    async fn get_one(&self, func: &str, name: &str) -> Result<Job> {
        let (f, n) = (func.to_string(), name.to_string());
        let data: Option<String> = self
            .blocking(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT data FROM jobs WHERE func = ?1 AND name = ?2",
                        params![f, n],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        match data {
            Some(data) => Job::from_json(&data),
            None => Err(PeriodicError::JobNotFound(format!("{}/{}", func, name))),
        }
    }

    async fn delete(&self, id: i64) -> Result<()> {
        self.blocking(move |conn| {
            conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    async fn count(&self) -> Result<usize> {
        let count: i64 = self
            .blocking(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?))
            .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn range(&self, offset: usize, limit: usize) -> Result<Vec<Job>> {
        self.blocking(move |conn| {
            Self::load_many(
                conn,
                "SELECT data FROM jobs ORDER BY id LIMIT ?1 OFFSET ?2",
                params![sql_limit(limit), sql_offset(offset)],
            )
        })
        .await
    }

    async fn range_scheduled(
        &self,
        func: &str,
        status: JobStatus,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Job>> {
        let func = func.to_string();
        self.blocking(move |conn| {
            Self::load_many(
                conn,
                "SELECT data FROM jobs WHERE func = ?1 AND status = ?2 ORDER BY sched_at, id LIMIT ?3 OFFSET ?4",
                params![
                    func,
                    status.to_string(),
                    sql_limit(limit),
                    sql_offset(offset)
                ],
            )
        })
        .await
    }

    async fn iter_func(&self, func: &str) -> Result<JobIter> {
        let func = func.to_string();
        let jobs = self
            .blocking(move |conn| {
                Self::load_many(
                    conn,
                    "SELECT data FROM jobs WHERE func = ?1 ORDER BY id",
                    params![func],
                )
            })
            .await?;
        Ok(Box::new(jobs.into_iter()))
    }
}
