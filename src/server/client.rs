use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use crate::error::{PeriodicError, Result};
use crate::protocol::{command_reply, error_reply, Command, Message, NULL_CHAR};
use crate::scheduler::Job;
use crate::server::ConnContext;

/// Serve a client connection: submit, remove, drop, status and ping.
///
/// Every request gets exactly one reply. Decode and storage failures are
/// answered with the error text and leave the connection open.
pub(crate) async fn serve<R>(ctx: ConnContext, mut reader: R, out: mpsc::Sender<Vec<u8>>) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    while let Some(body) = ctx.next_frame(&mut reader).await? {
        let msg = Message::parse(&body)?;
        let reply = match msg.command() {
            Some(Command::SubmitJob) => submit_job(&ctx, &msg).await,
            Some(Command::Status) => status(&ctx, &msg).await,
            Some(Command::Ping) => command_reply(&msg.msg_id, Command::Pong),
            Some(Command::DropFunc) => drop_func(&ctx, &msg).await,
            Some(Command::RemoveJob) => remove_job(&ctx, &msg).await,
            _ => {
                tracing::debug!(command = msg.command, "Unknown client command");
                command_reply(&msg.msg_id, Command::Unknown)
            }
        };
        if out.send(reply).await.is_err() {
            return Err(PeriodicError::Internal("client writer closed".to_string()));
        }
    }
    Ok(())
}

fn reply_result(msg: &Message, result: Result<()>) -> Vec<u8> {
    match result {
        Ok(()) => command_reply(&msg.msg_id, Command::Success),
        Err(e) => {
            tracing::debug!(error = %e, "Client request failed");
            error_reply(&msg.msg_id, &e)
        }
    }
}

async fn submit_job(ctx: &ConnContext, msg: &Message) -> Vec<u8> {
    let result = match Job::decode(&msg.payload) {
        Ok(job) => ctx.sched.submit_job(job).await.map(|_| ()),
        Err(e) => Err(e),
    };
    reply_result(msg, result)
}

async fn remove_job(ctx: &ConnContext, msg: &Message) -> Vec<u8> {
    let result = match Job::decode(&msg.payload) {
        Ok(job) => ctx.sched.remove_job(&job.func, &job.name).await.map(|_| ()),
        Err(e) => Err(e),
    };
    reply_result(msg, result)
}

/// Refusal (workers still connected) is not an error on the wire.
async fn drop_func(ctx: &ConnContext, msg: &Message) -> Vec<u8> {
    let func = String::from_utf8_lossy(&msg.payload).into_owned();
    let result = ctx.sched.drop_func(&func).await.map(|_| ());
    reply_result(msg, result)
}

async fn status(ctx: &ConnContext, msg: &Message) -> Vec<u8> {
    let report = ctx.sched.status().await;
    let mut buf = Vec::with_capacity(msg.msg_id.len() + report.len() + 1);
    buf.extend_from_slice(&msg.msg_id);
    buf.push(NULL_CHAR);
    buf.extend_from_slice(report.as_bytes());
    buf
}
