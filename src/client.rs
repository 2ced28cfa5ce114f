//! Async client for the job server, in both roles.
//!
//! [`Client`] submits and manages jobs; [`WorkerConn`] announces functions,
//! grabs jobs and reports their outcome.

use std::collections::VecDeque;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

use crate::config::Listen;
use crate::error::{PeriodicError, Result};
use crate::protocol::{
    decode_job_handle, encode_job_handle, read_frame, write_frame, ClientType, Command, Message,
    SchedLater, HANDLE_LEN, MAGIC_REQUEST, MAGIC_RESPONSE, NULL_CHAR,
};
use crate::scheduler::Job;

const MAX_REPLY_SIZE: usize = 16 * 1024 * 1024;

type BoxReader = Box<dyn AsyncRead + Unpin + Send>;
type BoxWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Framed connection with a running message id.
struct Conn {
    reader: BoxReader,
    writer: BoxWriter,
    next_id: u64,
}

impl Conn {
    async fn connect(listen: &Listen, role: ClientType) -> Result<Self> {
        let (reader, writer): (BoxReader, BoxWriter) = match listen {
            Listen::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                let (r, w) = stream.into_split();
                (Box::new(r) as BoxReader, Box::new(w) as BoxWriter)
            }
            Listen::Unix(path) => {
                let (r, w) = UnixStream::connect(path).await?.into_split();
                (Box::new(r) as BoxReader, Box::new(w) as BoxWriter)
            }
        };
        let mut conn = Self {
            reader,
            writer,
            next_id: 0,
        };
        write_frame(&mut conn.writer, MAGIC_REQUEST, &[role.as_byte()]).await?;
        Ok(conn)
    }

    /// Send a message and return the id it was sent under.
    async fn send(&mut self, command: Command, payload: &[u8]) -> Result<Vec<u8>> {
        self.next_id += 1;
        let msg_id = self.next_id.to_string().into_bytes();
        let body = Message::new(&msg_id, command, payload).to_bytes();
        write_frame(&mut self.writer, MAGIC_REQUEST, &body).await?;
        Ok(msg_id)
    }

    async fn recv(&mut self) -> Result<Vec<u8>> {
        read_frame(&mut self.reader, MAGIC_RESPONSE, MAX_REPLY_SIZE)
            .await?
            .ok_or_else(|| PeriodicError::Protocol("connection closed by server".to_string()))
    }
}

/// Split a reply into its message id and whatever follows the separator.
fn split_reply(body: &[u8]) -> Result<(&[u8], &[u8])> {
    let sep = body
        .iter()
        .position(|&b| b == NULL_CHAR)
        .ok_or_else(|| PeriodicError::Protocol("reply without message id".to_string()))?;
    Ok((&body[..sep], &body[sep + 1..]))
}

fn expect_command(rest: &[u8], expected: Command) -> Result<()> {
    match rest {
        [b] if *b == expected.as_byte() => Ok(()),
        [b] if *b == Command::Unknown.as_byte() => Err(PeriodicError::Protocol(
            "server did not recognize the command".to_string(),
        )),
        text => Err(PeriodicError::Server(
            String::from_utf8_lossy(text).into_owned(),
        )),
    }
}

/// One line of a STATUS report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FuncStatus {
    pub func: String,
    pub workers: u64,
    pub jobs: u64,
    pub processing: u64,
}

impl FuncStatus {
    /// Parse `func,workers,jobs,processing`. The function name may itself
    /// contain commas.
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.rsplitn(4, ',');
        let mut num = |field: &str| -> Result<u64> {
            parts
                .next()
                .and_then(|raw| raw.trim().parse().ok())
                .ok_or_else(|| PeriodicError::Decode(format!("bad {} in status line {:?}", field, line)))
        };
        let processing = num("processing")?;
        let jobs = num("jobs")?;
        let workers = num("workers")?;
        let func = parts
            .next()
            .ok_or_else(|| PeriodicError::Decode(format!("missing func in status line {:?}", line)))?;
        Ok(Self {
            func: func.to_string(),
            workers,
            jobs,
            processing,
        })
    }
}

/// Connection in the client role.
pub struct Client {
    conn: Conn,
}

impl Client {
    pub async fn connect(listen: &Listen) -> Result<Self> {
        Ok(Self {
            conn: Conn::connect(listen, ClientType::Client).await?,
        })
    }

    async fn request(&mut self, command: Command, payload: &[u8]) -> Result<Vec<u8>> {
        let msg_id = self.conn.send(command, payload).await?;
        let body = self.conn.recv().await?;
        let (reply_id, rest) = split_reply(&body)?;
        if reply_id != msg_id.as_slice() {
            return Err(PeriodicError::Protocol(format!(
                "reply for message {:?}, expected {:?}",
                String::from_utf8_lossy(reply_id),
                String::from_utf8_lossy(&msg_id)
            )));
        }
        Ok(rest.to_vec())
    }

    pub async fn ping(&mut self) -> Result<()> {
        let rest = self.request(Command::Ping, &[]).await?;
        expect_command(&rest, Command::Pong)
    }

    /// Submit (or resubmit) a job. An existing `(func, name)` is replaced.
    pub async fn submit_job(&mut self, job: &Job) -> Result<()> {
        let rest = self.request(Command::SubmitJob, &job.encode()).await?;
        expect_command(&rest, Command::Success)
    }

    pub async fn remove_job(&mut self, func: &str, name: &str) -> Result<()> {
        let rest = self
            .request(Command::RemoveJob, &Job::new(func, name).encode())
            .await?;
        expect_command(&rest, Command::Success)
    }

    /// Drop a function and all its jobs. The server ignores the request while
    /// workers still advertise the function.
    pub async fn drop_func(&mut self, func: &str) -> Result<()> {
        let rest = self.request(Command::DropFunc, func.as_bytes()).await?;
        expect_command(&rest, Command::Success)
    }

    pub async fn status(&mut self) -> Result<Vec<FuncStatus>> {
        let rest = self.request(Command::Status, &[]).await?;
        let report = String::from_utf8_lossy(&rest);
        report
            .lines()
            .filter(|line| !line.is_empty())
            .map(FuncStatus::parse)
            .collect()
    }
}

/// A job handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub job_id: i64,
    pub job: Job,
}

impl Assignment {
    fn decode(payload: &[u8]) -> Result<Self> {
        let job_id = decode_job_handle(payload)?;
        let mut job = Job::decode(&payload[HANDLE_LEN..])?;
        job.id = job_id;
        Ok(Self { job_id, job })
    }
}

/// Connection in the worker role.
pub struct WorkerConn {
    conn: Conn,
    pending: VecDeque<Assignment>,
}

impl WorkerConn {
    pub async fn connect(listen: &Listen) -> Result<Self> {
        Ok(Self {
            conn: Conn::connect(listen, ClientType::Worker).await?,
            pending: VecDeque::new(),
        })
    }

    pub async fn can_do(&mut self, func: &str) -> Result<()> {
        self.conn.send(Command::CanDo, func.as_bytes()).await?;
        Ok(())
    }

    pub async fn cant_do(&mut self, func: &str) -> Result<()> {
        self.conn.send(Command::CantDo, func.as_bytes()).await?;
        Ok(())
    }

    /// Ask for one job. The server answers later with a JOBASSIGN, read with
    /// [`WorkerConn::next_assignment`].
    pub async fn grab_job(&mut self) -> Result<()> {
        self.conn.send(Command::GrabJob, &[]).await?;
        Ok(())
    }

    /// Wait for the next assignment. Other replies arriving meanwhile are skipped.
    pub async fn next_assignment(&mut self) -> Result<Assignment> {
        if let Some(assignment) = self.pending.pop_front() {
            return Ok(assignment);
        }
        loop {
            let msg = Message::parse(&self.conn.recv().await?)?;
            match msg.command() {
                Some(Command::JobAssign) => return Assignment::decode(&msg.payload),
                other => tracing::debug!(command = ?other, "Skipping non-assignment reply"),
            }
        }
    }

    pub async fn work_done(&mut self, job_id: i64) -> Result<()> {
        self.conn
            .send(Command::WorkDone, &encode_job_handle(job_id))
            .await?;
        Ok(())
    }

    pub async fn work_fail(&mut self, job_id: i64) -> Result<()> {
        self.conn
            .send(Command::WorkFail, &encode_job_handle(job_id))
            .await?;
        Ok(())
    }

    /// Return the job to the server, due again `delay` seconds from now.
    /// A `counter` of 0 lets the server bump the stored retry counter.
    pub async fn sched_later(&mut self, job_id: i64, delay: i64, counter: i64) -> Result<()> {
        let payload = SchedLater {
            job_id,
            delay,
            counter,
        }
        .encode();
        self.conn.send(Command::SchedLater, &payload).await?;
        Ok(())
    }

    /// Round trip a PING. Assignments that arrive first are kept for
    /// [`WorkerConn::next_assignment`].
    pub async fn ping(&mut self) -> Result<()> {
        let msg_id = self.conn.send(Command::Ping, &[]).await?;
        loop {
            let msg = Message::parse(&self.conn.recv().await?)?;
            match msg.command() {
                Some(Command::JobAssign) => self.pending.push_back(Assignment::decode(&msg.payload)?),
                Some(Command::Pong) if msg.msg_id == msg_id => return Ok(()),
                other => tracing::debug!(command = ?other, "Skipping reply while waiting for PONG"),
            }
        }
    }
}
