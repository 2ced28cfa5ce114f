use std::sync::Arc;

use tokio::io::AsyncRead;

use crate::error::{PeriodicError, Result};
use crate::protocol::{command_reply, decode_job_handle, error_reply, Command, Message, SchedLater};
use crate::scheduler::{Outcome, WorkerHandle};
use crate::server::ConnContext;

/// Serve a worker connection until it closes or the worker is marked dead.
/// Teardown is the caller's job.
///
/// GRABJOB, WORKDONE, WORKFAIL, SCHEDLATER, CANDO and CANTDO are not
/// answered; a grab is answered later by a JOBASSIGN from the dispatcher.
pub(crate) async fn serve<R>(ctx: ConnContext, mut reader: R, worker: Arc<WorkerHandle>) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    loop {
        let frame = tokio::select! {
            _ = worker.closed() => {
                tracing::info!(worker_id = worker.id, "Worker marked dead, closing connection");
                return Ok(());
            }
            frame = ctx.next_frame(&mut reader) => frame?,
        };
        let Some(body) = frame else {
            return Ok(());
        };
        let msg = Message::parse(&body)?;
        let reply = match msg.command() {
            Some(Command::GrabJob) => {
                ctx.sched.grab_job(&worker, &msg.msg_id).await;
                None
            }
            Some(Command::WorkDone) => report(&ctx, &worker, &msg, Outcome::Done).await,
            Some(Command::WorkFail) => report(&ctx, &worker, &msg, Outcome::Fail).await,
            Some(Command::SchedLater) => sched_later(&ctx, &worker, &msg).await,
            Some(Command::Sleep) => Some(command_reply(&msg.msg_id, Command::Noop)),
            Some(Command::Ping) => Some(command_reply(&msg.msg_id, Command::Pong)),
            Some(Command::CanDo) => {
                ctx.sched.can_do(&worker, &func_name(&msg)).await;
                None
            }
            Some(Command::CantDo) => {
                ctx.sched.cant_do(&worker, &func_name(&msg)).await;
                None
            }
            _ => {
                tracing::debug!(worker_id = worker.id, command = msg.command, "Unknown worker command");
                Some(command_reply(&msg.msg_id, Command::Unknown))
            }
        };

        if let Some(reply) = reply {
            if !worker.deliver(reply) {
                return Err(PeriodicError::Internal("worker writer closed".to_string()));
            }
        }
    }
}

fn func_name(msg: &Message) -> String {
    String::from_utf8_lossy(&msg.payload).into_owned()
}

/// WORKDONE / WORKFAIL: the payload is just the job handle.
async fn report(
    ctx: &ConnContext,
    worker: &WorkerHandle,
    msg: &Message,
    outcome: Outcome,
) -> Option<Vec<u8>> {
    match decode_job_handle(&msg.payload) {
        Ok(job_id) => settle(ctx, worker, msg, job_id, outcome).await,
        Err(e) => {
            tracing::warn!(worker_id = worker.id, error = %e, "Bad job handle");
            Some(error_reply(&msg.msg_id, &e))
        }
    }
}

async fn sched_later(ctx: &ConnContext, worker: &WorkerHandle, msg: &Message) -> Option<Vec<u8>> {
    match SchedLater::decode(&msg.payload) {
        Ok(later) => {
            let outcome = Outcome::SchedLater {
                delay: later.delay,
                counter: later.counter,
            };
            settle(ctx, worker, msg, later.job_id, outcome).await
        }
        Err(e) => {
            tracing::warn!(worker_id = worker.id, error = %e, "Bad sched later payload");
            Some(error_reply(&msg.msg_id, &e))
        }
    }
}

async fn settle(
    ctx: &ConnContext,
    worker: &WorkerHandle,
    msg: &Message,
    job_id: i64,
    outcome: Outcome,
) -> Option<Vec<u8>> {
    let result = ctx.sched.report(worker.id, job_id, outcome).await;
    worker.release(job_id);
    match result {
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(worker_id = worker.id, job_id, error = %e, "Failed to settle job");
            Some(error_reply(&msg.msg_id, &e))
        }
    }
}
