use crate::error::{PeriodicError, Result};

/// Width of an encoded job handle: one length tag plus a big-endian `i64`.
pub const HANDLE_LEN: usize = 9;

const HANDLE_TAG: u8 = 8;

pub fn encode_job_handle(job_id: i64) -> [u8; HANDLE_LEN] {
    let mut buf = [0u8; HANDLE_LEN];
    buf[0] = HANDLE_TAG;
    buf[1..].copy_from_slice(&job_id.to_be_bytes());
    buf
}

pub fn decode_job_handle(data: &[u8]) -> Result<i64> {
    if data.len() < HANDLE_LEN {
        return Err(PeriodicError::Decode(format!(
            "job handle needs {} bytes, got {}",
            HANDLE_LEN,
            data.len()
        )));
    }
    if data[0] != HANDLE_TAG {
        return Err(PeriodicError::Decode(format!(
            "bad job handle tag {}",
            data[0]
        )));
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&data[1..HANDLE_LEN]);
    Ok(i64::from_be_bytes(id))
}

/// Payload of a SCHEDLATER report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedLater {
    pub job_id: i64,
    pub delay: i64,
    pub counter: i64,
}

const SCHED_LATER_LEN: usize = HANDLE_LEN + 8 + 2;

impl SchedLater {
    /// Layout: handle (9) + delay seconds (u64 BE) + counter (u16 BE).
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < SCHED_LATER_LEN {
            return Err(PeriodicError::Decode(format!(
                "sched later payload needs {} bytes, got {}",
                SCHED_LATER_LEN,
                payload.len()
            )));
        }
        let job_id = decode_job_handle(&payload[..HANDLE_LEN])?;
        let mut delay = [0u8; 8];
        delay.copy_from_slice(&payload[HANDLE_LEN..HANDLE_LEN + 8]);
        let delay = u64::from_be_bytes(delay);
        let delay = i64::try_from(delay)
            .map_err(|_| PeriodicError::Decode(format!("delay {} out of range", delay)))?;
        let counter = u16::from_be_bytes([payload[HANDLE_LEN + 8], payload[HANDLE_LEN + 9]]);
        Ok(Self {
            job_id,
            delay,
            counter: i64::from(counter),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SCHED_LATER_LEN);
        buf.extend_from_slice(&encode_job_handle(self.job_id));
        buf.extend_from_slice(&(self.delay.max(0) as u64).to_be_bytes());
        let counter = self.counter.clamp(0, i64::from(u16::MAX)) as u16;
        buf.extend_from_slice(&counter.to_be_bytes());
        buf
    }
}
