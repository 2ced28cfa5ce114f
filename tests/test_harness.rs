//! Test harness for server integration tests.
//!
//! Starts a server on an ephemeral TCP port and hands out client and worker
//! connections to it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use periodic_lite::client::{Client, WorkerConn};
use periodic_lite::config::{Listen, ServerConfig};
use periodic_lite::scheduler::{FuncStat, Scheduler};
use periodic_lite::server::Server;
use periodic_lite::storage::{MemStore, StoreDriver};

/// Server config with a short idle interval for faster tests.
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::new(Listen::Tcp("127.0.0.1:0".to_string()));
    config.idle_interval = Duration::from_secs(1);
    config
}

/// Handle to a running test server
pub struct TestServer {
    pub listen: Listen,
    pub scheduler: Arc<Scheduler>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    /// Start a server backed by an in-memory store.
    pub async fn start() -> Self {
        Self::start_with_store(Arc::new(MemStore::new())).await
    }

    pub async fn start_with_store(store: Arc<dyn StoreDriver>) -> Self {
        let server = Server::bind_with_store(test_config(), store)
            .await
            .expect("server should bind");
        let addr = server.local_addr().expect("tcp listener has an address");
        let scheduler = server.scheduler();
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            server.run(token).await.expect("server run failed");
        });

        Self {
            listen: Listen::Tcp(addr.to_string()),
            scheduler,
            shutdown,
            handle: Some(handle),
        }
    }

    pub async fn client(&self) -> Client {
        Client::connect(&self.listen)
            .await
            .expect("client should connect")
    }

    /// Connect a worker, announce `funcs` and wait until the server counted it.
    pub async fn worker(&self, funcs: &[&str]) -> WorkerConn {
        let mut worker = WorkerConn::connect(&self.listen)
            .await
            .expect("worker should connect");
        for func in funcs {
            worker.can_do(func).await.expect("can_do should send");
        }
        // A ping round trip orders every CANDO before it
        worker.ping().await.expect("worker ping");
        worker
    }

    pub async fn stat(&self, func: &str) -> FuncStat {
        self.scheduler.stat(func).await.unwrap_or_default()
    }

    /// Stop the server and wait for it to finish.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(50)).await;
    assert!(result, "{}", message);
}
