use serde::{Deserialize, Serialize};

use crate::error::{PeriodicError, Result};
use crate::protocol::NULL_CHAR;

/// Longest lease a job may ask for, in seconds.
pub const MAX_TIMEOUT: i64 = 365 * 24 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Ready,
    Processing,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Ready => write!(f, "ready"),
            JobStatus::Processing => write!(f, "processing"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = PeriodicError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ready" => Ok(JobStatus::Ready),
            "processing" => Ok(JobStatus::Processing),
            other => Err(PeriodicError::Decode(format!("unknown job status {:?}", other))),
        }
    }
}

/// A unit of scheduled work. `(func, name)` identifies a job logically;
/// `id` is assigned by the store on first save and is 0 until then.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "job_id")]
    pub id: i64,
    pub func: String,
    pub name: String,
    #[serde(rename = "workload")]
    pub args: String,
    /// Lease length in seconds, 0 for no lease expiry.
    pub timeout: i64,
    pub sched_at: i64,
    pub run_at: i64,
    pub counter: i64,
    pub status: JobStatus,
}

impl Job {
    pub fn new(func: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            func: func.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_sched_at(mut self, sched_at: i64) -> Self {
        self.sched_at = sched_at;
        self
    }

    pub fn with_args(mut self, args: impl Into<String>) -> Self {
        self.args = args.into();
        self
    }

    pub fn with_timeout(mut self, timeout: i64) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_ready(&self) -> bool {
        self.status == JobStatus::Ready
    }

    pub fn is_processing(&self) -> bool {
        self.status == JobStatus::Processing
    }

    pub fn set_ready(&mut self) {
        self.status = JobStatus::Ready;
    }

    pub fn set_processing(&mut self) {
        self.status = JobStatus::Processing;
    }

    /// Unix second at which the current lease runs out, if the job has one.
    ///
    /// The lease starts at the later of `run_at` and `sched_at`.
    pub fn lease_deadline(&self) -> Option<i64> {
        if self.timeout <= 0 {
            return None;
        }
        Some(self.run_at.max(self.sched_at).saturating_add(self.timeout))
    }

    /// Decode the wire form `func NUL name [NUL sched_at [NUL counter [NUL args [NUL timeout]]]]`.
    ///
    /// A sixth segment that is not an integer is treated as part of `args`.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let parts: Vec<&[u8]> = payload.splitn(6, |&b| b == NULL_CHAR).collect();
        if parts.len() < 2 {
            return Err(PeriodicError::Decode(format!(
                "job payload needs func and name, got {:?}",
                String::from_utf8_lossy(payload)
            )));
        }

        let mut job = Job::new(utf8(parts[0], "func")?, utf8(parts[1], "name")?);
        if job.func.is_empty() || job.name.is_empty() {
            return Err(PeriodicError::Decode(
                "job func and name must not be empty".to_string(),
            ));
        }
        if let Some(raw) = parts.get(2) {
            job.sched_at = int(raw, "sched_at")?;
        }
        if let Some(raw) = parts.get(3) {
            job.counter = int(raw, "counter")?;
        }
        if let Some(raw) = parts.get(4) {
            job.args = utf8(raw, "args")?;
        }
        if let Some(raw) = parts.get(5) {
            match int(raw, "timeout") {
                Ok(timeout) if !(0..=MAX_TIMEOUT).contains(&timeout) => {
                    return Err(PeriodicError::Decode(format!(
                        "timeout {} outside 0..={}",
                        timeout, MAX_TIMEOUT
                    )));
                }
                Ok(timeout) => job.timeout = timeout,
                Err(_) => {
                    job.args.push(char::from(NULL_CHAR));
                    job.args.push_str(&utf8(raw, "args")?);
                }
            }
        }
        Ok(job)
    }

    /// Encode to the wire form, omitting trailing fields left at their defaults.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(self.func.as_bytes());
        buf.push(NULL_CHAR);
        buf.extend_from_slice(self.name.as_bytes());

        let has_timeout = self.timeout > 0;
        let has_args = !self.args.is_empty() || has_timeout;
        let has_counter = self.counter > 0 || has_args;
        let has_sched_at = self.sched_at > 0 || has_counter;

        if has_sched_at {
            buf.push(NULL_CHAR);
            buf.extend_from_slice(self.sched_at.to_string().as_bytes());
        }
        if has_counter {
            buf.push(NULL_CHAR);
            buf.extend_from_slice(self.counter.to_string().as_bytes());
        }
        if has_args {
            buf.push(NULL_CHAR);
            buf.extend_from_slice(self.args.as_bytes());
        }
        if has_timeout {
            buf.push(NULL_CHAR);
            buf.extend_from_slice(self.timeout.to_string().as_bytes());
        }
        buf
    }

    /// Decode the storage record.
    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    /// Encode the storage record.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn utf8(raw: &[u8], field: &str) -> Result<String> {
    String::from_utf8(raw.to_vec())
        .map_err(|_| PeriodicError::Decode(format!("job {} is not valid UTF-8", field)))
}

fn int(raw: &[u8], field: &str) -> Result<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            PeriodicError::Decode(format!(
                "job {} {:?} is not an integer",
                field,
                String::from_utf8_lossy(raw)
            ))
        })
}
