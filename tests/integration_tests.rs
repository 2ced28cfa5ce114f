//! End-to-end tests over real TCP connections.

mod test_harness;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use periodic_lite::client::WorkerConn;
use periodic_lite::config::Listen;
use periodic_lite::error::PeriodicError;
use periodic_lite::protocol::{
    read_frame, write_frame, ClientType, Command, Message, MAGIC_REQUEST, MAGIC_RESPONSE,
};
use periodic_lite::scheduler::{now, FuncStat, Job, JobStatus};
use periodic_lite::storage::{SqliteStore, StoreDriver};
use test_harness::{assert_eventually, TestServer};

fn stat(worker: u64, job: u64, processing: u64) -> FuncStat {
    FuncStat {
        worker,
        job,
        processing,
    }
}

/// Expect no assignment for a short while.
async fn assert_no_assignment(worker: &mut WorkerConn) {
    let res = tokio::time::timeout(Duration::from_millis(400), worker.next_assignment()).await;
    assert!(res.is_err(), "worker should not have been assigned a job");
}

async fn next_assignment(worker: &mut WorkerConn) -> periodic_lite::client::Assignment {
    tokio::time::timeout(Duration::from_secs(5), worker.next_assignment())
        .await
        .expect("assignment should arrive")
        .expect("assignment should decode")
}

#[tokio::test]
async fn test_ping_and_empty_status() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    client.ping().await.unwrap();
    assert!(client.status().await.unwrap().is_empty());
    server.stop().await;
}

#[tokio::test]
async fn test_submit_is_unique_per_func_and_name() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    client.submit_job(&Job::new("f", "n")).await.unwrap();
    client
        .submit_job(&Job::new("f", "n").with_args("second"))
        .await
        .unwrap();
    client.submit_job(&Job::new("f", "other")).await.unwrap();

    let status = client.status().await.unwrap();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].func, "f");
    assert_eq!(status[0].jobs, 2);

    let stored = server.scheduler.store().get_one("f", "n").await.unwrap();
    assert_eq!(stored.args, "second");
    assert_eq!(server.scheduler.store().count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_submit_decode_error_is_reported() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    let err = client.submit_job(&Job::new("f", "")).await.unwrap_err();
    match err {
        PeriodicError::Server(text) => assert!(text.starts_with("Decode error"), "{}", text),
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(server.scheduler.store().count().await.unwrap(), 0);

    // The connection survives the bad request
    client.ping().await.unwrap();
}

#[tokio::test]
async fn test_job_lifecycle_done() {
    let server = TestServer::start().await;
    let mut client = server.client().await;
    let mut worker = server.worker(&["resize"]).await;

    client
        .submit_job(&Job::new("resize", "img-1").with_args("a.png"))
        .await
        .unwrap();
    worker.grab_job().await.unwrap();
    let assignment = next_assignment(&mut worker).await;
    assert_eq!(assignment.job.func, "resize");
    assert_eq!(assignment.job.name, "img-1");
    assert_eq!(assignment.job.args, "a.png");
    assert_eq!(server.stat("resize").await, stat(1, 1, 1));

    worker.work_done(assignment.job_id).await.unwrap();
    assert_eventually(
        || async { server.stat("resize").await == stat(1, 0, 0) },
        Duration::from_secs(2),
        "job should be gone after WORKDONE",
    )
    .await;
    assert!(server
        .scheduler
        .store()
        .get(assignment.job_id)
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_grab_before_submit_is_served() {
    let server = TestServer::start().await;
    let mut client = server.client().await;
    let mut worker = server.worker(&["f"]).await;

    worker.grab_job().await.unwrap();
    assert_no_assignment(&mut worker).await;

    client.submit_job(&Job::new("f", "late")).await.unwrap();
    let assignment = next_assignment(&mut worker).await;
    assert_eq!(assignment.job.name, "late");
}

#[tokio::test]
async fn test_earliest_due_first() {
    let server = TestServer::start().await;
    let mut client = server.client().await;
    let t = now();
    client
        .submit_job(&Job::new("f", "second").with_sched_at(t - 5))
        .await
        .unwrap();
    client
        .submit_job(&Job::new("f", "first").with_sched_at(t - 50))
        .await
        .unwrap();

    let mut worker = server.worker(&["f"]).await;
    worker.grab_job().await.unwrap();
    assert_eq!(next_assignment(&mut worker).await.job.name, "first");
    worker.grab_job().await.unwrap();
    assert_eq!(next_assignment(&mut worker).await.job.name, "second");
}

#[tokio::test]
async fn test_future_job_waits_until_due() {
    let server = TestServer::start().await;
    let mut client = server.client().await;
    let mut worker = server.worker(&["f"]).await;

    client
        .submit_job(&Job::new("f", "later").with_sched_at(now() + 2))
        .await
        .unwrap();
    worker.grab_job().await.unwrap();
    assert_no_assignment(&mut worker).await;

    let assignment = next_assignment(&mut worker).await;
    assert_eq!(assignment.job.name, "later");
    assert!(now() >= assignment.job.sched_at);
}

#[tokio::test]
async fn test_single_job_single_lease() {
    let server = TestServer::start().await;
    let mut client = server.client().await;
    let mut w1 = server.worker(&["f"]).await;
    let mut w2 = server.worker(&["f"]).await;

    client.submit_job(&Job::new("f", "only")).await.unwrap();
    w1.grab_job().await.unwrap();
    w2.grab_job().await.unwrap();

    let first = tokio::select! {
        a = w1.next_assignment() => a.unwrap(),
        b = w2.next_assignment() => b.unwrap(),
    };
    assert_eq!(first.job.name, "only");
    assert_eq!(server.stat("f").await, stat(2, 1, 1));

    // Neither worker receives a second copy
    assert_no_assignment(&mut w1).await;
    assert_no_assignment(&mut w2).await;
}

#[tokio::test]
async fn test_fail_makes_job_available_again() {
    let server = TestServer::start().await;
    let mut client = server.client().await;
    let mut worker = server.worker(&["f"]).await;

    client.submit_job(&Job::new("f", "flaky")).await.unwrap();
    worker.grab_job().await.unwrap();
    let first = next_assignment(&mut worker).await;

    worker.work_fail(first.job_id).await.unwrap();
    worker.grab_job().await.unwrap();
    let second = next_assignment(&mut worker).await;
    assert_eq!(second.job_id, first.job_id);
    assert_eq!(server.stat("f").await, stat(1, 1, 1));
}

#[tokio::test]
async fn test_sched_later_reschedules() {
    let server = TestServer::start().await;
    let mut client = server.client().await;
    let mut worker = server.worker(&["f"]).await;

    client.submit_job(&Job::new("f", "retry")).await.unwrap();
    worker.grab_job().await.unwrap();
    let assignment = next_assignment(&mut worker).await;

    let before = now();
    worker.sched_later(assignment.job_id, 30, 0).await.unwrap();
    assert_eventually(
        || async { server.stat("f").await == stat(1, 1, 0) },
        Duration::from_secs(2),
        "job should leave processing",
    )
    .await;

    let stored = server.scheduler.store().get(assignment.job_id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Ready);
    assert_eq!(stored.counter, 1);
    assert!(stored.sched_at >= before + 30);

    worker.grab_job().await.unwrap();
    assert_no_assignment(&mut worker).await;
}

#[tokio::test]
async fn test_lease_timeout_reclaims_job() {
    let server = TestServer::start().await;
    let mut client = server.client().await;
    let mut hung = server.worker(&["f"]).await;
    let mut healthy = server.worker(&["f"]).await;

    client
        .submit_job(&Job::new("f", "slow").with_timeout(1))
        .await
        .unwrap();
    hung.grab_job().await.unwrap();
    let first = next_assignment(&mut hung).await;

    healthy.grab_job().await.unwrap();
    let second = next_assignment(&mut healthy).await;
    assert_eq!(second.job_id, first.job_id);

    // The hung worker's late report is ignored
    hung.work_done(first.job_id).await.unwrap();
    hung.ping().await.unwrap();
    assert!(server.scheduler.is_processing(first.job_id).await);

    healthy.work_done(second.job_id).await.unwrap();
    assert_eventually(
        || async { server.stat("f").await == stat(2, 0, 0) },
        Duration::from_secs(2),
        "healthy worker's report should complete the job",
    )
    .await;
}

#[tokio::test]
async fn test_worker_disconnect_returns_jobs() {
    let server = TestServer::start().await;
    let mut client = server.client().await;
    client.submit_job(&Job::new("f", "a")).await.unwrap();
    client.submit_job(&Job::new("f", "b")).await.unwrap();

    let mut doomed = server.worker(&["f"]).await;
    doomed.grab_job().await.unwrap();
    doomed.grab_job().await.unwrap();
    next_assignment(&mut doomed).await;
    next_assignment(&mut doomed).await;
    assert_eq!(server.stat("f").await, stat(1, 2, 2));

    drop(doomed);
    assert_eventually(
        || async { server.stat("f").await == stat(0, 2, 0) },
        Duration::from_secs(2),
        "disconnect should return both jobs to ready",
    )
    .await;

    let mut next = server.worker(&["f"]).await;
    next.grab_job().await.unwrap();
    next.grab_job().await.unwrap();
    let mut names = vec![
        next_assignment(&mut next).await.job.name,
        next_assignment(&mut next).await.job.name,
    ];
    names.sort();
    assert_eq!(names, vec!["a", "b"]);
}

#[tokio::test]
async fn test_cant_do_stops_assignments() {
    let server = TestServer::start().await;
    let mut client = server.client().await;
    let mut worker = server.worker(&["f"]).await;

    worker.cant_do("f").await.unwrap();
    worker.ping().await.unwrap();
    assert_eq!(server.stat("f").await, stat(0, 0, 0));

    client.submit_job(&Job::new("f", "n")).await.unwrap();
    worker.grab_job().await.unwrap();
    assert_no_assignment(&mut worker).await;
}

#[tokio::test]
async fn test_remove_job() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    client.submit_job(&Job::new("f", "n")).await.unwrap();
    client.remove_job("f", "n").await.unwrap();
    assert_eq!(server.stat("f").await, stat(0, 0, 0));

    let err = client.remove_job("f", "n").await.unwrap_err();
    assert!(err.to_string().starts_with("Job not found"), "{}", err);
}

#[tokio::test]
async fn test_drop_func_only_without_workers() {
    let server = TestServer::start().await;
    let mut client = server.client().await;
    client.submit_job(&Job::new("f", "a")).await.unwrap();
    client.submit_job(&Job::new("f", "b")).await.unwrap();

    let worker = server.worker(&["f"]).await;
    client.drop_func("f").await.unwrap();
    assert_eq!(server.scheduler.store().count().await.unwrap(), 2);
    assert_eq!(server.stat("f").await, stat(1, 2, 0));

    drop(worker);
    assert_eventually(
        || async { server.stat("f").await.worker == 0 },
        Duration::from_secs(2),
        "worker should be retired",
    )
    .await;

    client.drop_func("f").await.unwrap();
    assert!(client.status().await.unwrap().is_empty());
    assert_eq!(server.scheduler.store().count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_unknown_command_keeps_connection() {
    let server = TestServer::start().await;
    let addr = match &server.listen {
        Listen::Tcp(addr) => addr.clone(),
        Listen::Unix(_) => unreachable!(),
    };
    let mut stream = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut stream, MAGIC_REQUEST, &[ClientType::Client.as_byte()])
        .await
        .unwrap();

    let mut bogus = b"7".to_vec();
    bogus.extend_from_slice(&[0, 200]);
    write_frame(&mut stream, MAGIC_REQUEST, &bogus).await.unwrap();
    let reply = read_frame(&mut stream, MAGIC_RESPONSE, 1024)
        .await
        .unwrap()
        .unwrap();
    let msg = Message::parse(&reply).unwrap();
    assert_eq!(msg.msg_id, b"7");
    assert_eq!(msg.command(), Some(Command::Unknown));

    let ping = Message::new(b"8", Command::Ping, &[]).to_bytes();
    write_frame(&mut stream, MAGIC_REQUEST, &ping).await.unwrap();
    let reply = read_frame(&mut stream, MAGIC_RESPONSE, 1024)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(Message::parse(&reply).unwrap().command(), Some(Command::Pong));
    stream.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_worker_sleep_is_answered_with_noop() {
    let server = TestServer::start().await;
    let addr = match &server.listen {
        Listen::Tcp(addr) => addr.clone(),
        Listen::Unix(_) => unreachable!(),
    };
    let mut stream = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut stream, MAGIC_REQUEST, &[ClientType::Worker.as_byte()])
        .await
        .unwrap();

    let sleep = Message::new(b"s", Command::Sleep, &[]).to_bytes();
    write_frame(&mut stream, MAGIC_REQUEST, &sleep).await.unwrap();
    let reply = read_frame(&mut stream, MAGIC_RESPONSE, 1024)
        .await
        .unwrap()
        .unwrap();
    let msg = Message::parse(&reply).unwrap();
    assert_eq!(msg.msg_id, b"s");
    assert_eq!(msg.command(), Some(Command::Noop));
}

#[tokio::test]
async fn test_sqlite_restart_rehydrates_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("periodic.db");

    let server = TestServer::start_with_store(Arc::new(SqliteStore::new(&path).unwrap())).await;
    let mut client = server.client().await;
    client.submit_job(&Job::new("f", "a")).await.unwrap();
    client
        .submit_job(&Job::new("f", "b").with_sched_at(now() - 10))
        .await
        .unwrap();

    let mut worker = server.worker(&["f"]).await;
    worker.grab_job().await.unwrap();
    let leased = next_assignment(&mut worker).await;
    drop(worker);
    drop(client);
    server.stop().await;

    // Simulate a crash mid-lease: the record still says processing
    let store: Arc<dyn StoreDriver> = Arc::new(SqliteStore::new(&path).unwrap());
    let mut job = store.get(leased.job_id).await.unwrap();
    job.set_processing();
    job.run_at = now() - 60;
    store.save(&mut job).await.unwrap();
    assert_eq!(store.count().await.unwrap(), 2);

    let server = TestServer::start_with_store(store).await;
    assert_eq!(server.stat("f").await, stat(0, 2, 0));
    assert!(!server.scheduler.is_processing(leased.job_id).await);

    let mut worker = server.worker(&["f"]).await;
    worker.grab_job().await.unwrap();
    worker.grab_job().await.unwrap();
    let mut names = vec![
        next_assignment(&mut worker).await.job.name,
        next_assignment(&mut worker).await.job.name,
    ];
    names.sort();
    assert_eq!(names, vec!["a", "b"]);
}
