//! Socket front end: accepts connections, negotiates their role and runs
//! one supervised task per connection.

mod client;
mod worker;

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{Listen, ServerConfig};
use crate::error::{PeriodicError, Result};
use crate::protocol::{read_frame, write_frame, ClientType, MAGIC_REQUEST, MAGIC_RESPONSE};
use crate::scheduler::Scheduler;
use crate::storage::{self, StoreDriver};

/// Frames a connection may have queued before it counts as unresponsive.
const OUTBOUND_BUFFER: usize = 256;

/// Pause after a failed accept so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

/// What every connection task needs from the server.
#[derive(Clone)]
pub(crate) struct ConnContext {
    pub sched: Arc<Scheduler>,
    pub socket_timeout: Option<Duration>,
    pub max_frame_size: usize,
    pub shutdown: CancellationToken,
}

impl ConnContext {
    /// Next request frame. `Ok(None)` on clean end of stream or shutdown.
    pub async fn next_frame<R>(&self, reader: &mut R) -> Result<Option<Vec<u8>>>
    where
        R: AsyncRead + Unpin,
    {
        let read = read_frame(reader, MAGIC_REQUEST, self.max_frame_size);
        let read = async {
            match self.socket_timeout {
                Some(limit) => match tokio::time::timeout(limit, read).await {
                    Ok(frame) => frame,
                    Err(_) => Err(PeriodicError::Protocol("read timed out".to_string())),
                },
                None => read.await,
            }
        };
        tokio::select! {
            _ = self.shutdown.cancelled() => Ok(None),
            frame = read => frame,
        }
    }
}

pub struct Server {
    config: ServerConfig,
    scheduler: Arc<Scheduler>,
    listener: Listener,
}

impl Server {
    /// Open the configured store, rebuild scheduler state from it and bind
    /// the listener.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let store = storage::open(&config.storage)?;
        Self::bind_with_store(config, store).await
    }

    pub async fn bind_with_store(config: ServerConfig, store: Arc<dyn StoreDriver>) -> Result<Self> {
        let scheduler = Arc::new(Scheduler::new(store, config.idle_interval));
        scheduler.load_jobs(config.rehydrate_batch).await?;

        let listener = match &config.listen {
            Listen::Tcp(addr) => Listener::Tcp(TcpListener::bind(addr).await?),
            Listen::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                Listener::Unix {
                    listener: UnixListener::bind(path)?,
                    path: path.clone(),
                }
            }
        };

        tracing::info!(
            listen = %config.listen,
            local_addr = ?Self::tcp_addr(&listener),
            storage = ?config.storage,
            "Server bound"
        );

        Ok(Self {
            config,
            scheduler,
            listener,
        })
    }

    fn tcp_addr(listener: &Listener) -> Option<SocketAddr> {
        match listener {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            Listener::Unix { .. } => None,
        }
    }

    /// Bound TCP address, useful when listening on port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        Self::tcp_addr(&self.listener)
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    /// Accept connections and run the dispatch loop until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let dispatcher = tokio::spawn(self.scheduler.clone().run(shutdown.clone()));
        let ctx = ConnContext {
            sched: self.scheduler.clone(),
            socket_timeout: self.config.socket_timeout,
            max_frame_size: self.config.max_frame_size,
            shutdown: shutdown.clone(),
        };

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.accept() => accepted,
            };
            match accepted {
                Ok(Stream::Tcp(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
                    }
                    tokio::spawn(serve_connection(stream, ctx.clone()));
                }
                Ok(Stream::Unix(stream)) => {
                    tokio::spawn(serve_connection(stream, ctx.clone()));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        if let Err(e) = dispatcher.await {
            tracing::error!(error = %e, "Dispatch loop terminated abnormally");
        }
        if let Listener::Unix { path, .. } = &self.listener {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::debug!(path = %path.display(), error = %e, "Failed to remove socket file");
            }
        }
        tracing::info!("Server stopped");
        Ok(())
    }

    async fn accept(&self) -> std::io::Result<Stream> {
        match &self.listener {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                tracing::debug!(peer = %peer, "Accepted connection");
                Ok(Stream::Tcp(stream))
            }
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                tracing::debug!("Accepted unix connection");
                Ok(Stream::Unix(stream))
            }
        }
    }
}

/// Read the role byte, then hand the connection to the matching handler.
async fn serve_connection<S>(stream: S, ctx: ConnContext)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);

    let first = match ctx.next_frame(&mut reader).await {
        Ok(Some(frame)) => frame,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read connection type");
            return;
        }
    };

    let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
    tokio::spawn(write_loop(writer, rx));

    match ClientType::from_frame(&first) {
        Some(ClientType::Client) => {
            supervise("client", client::serve(ctx.clone(), reader, tx)).await;
        }
        Some(ClientType::Worker) => {
            let worker = ctx.sched.register_worker(tx);
            supervise("worker", worker::serve(ctx.clone(), reader, worker.clone())).await;
            ctx.sched.retire_worker(&worker).await;
        }
        None => {
            tracing::warn!(frame = ?first, "Unknown connection type, closing");
        }
    }
}

/// Run a handler on its own task so a panic stays contained to its connection.
async fn supervise<F>(role: &'static str, handler: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    match tokio::spawn(handler).await {
        Ok(Ok(())) => tracing::debug!(role, "Connection closed"),
        Ok(Err(e)) => tracing::warn!(role, error = %e, "Connection closed with error"),
        Err(e) if e.is_panic() => tracing::error!(role, "Connection handler panicked"),
        Err(e) => tracing::debug!(role, error = %e, "Connection handler cancelled"),
    }
}

/// Drain the outbound channel onto the socket. Ends when every sender is
/// gone or the peer stops accepting writes.
async fn write_loop<S>(mut writer: WriteHalf<S>, mut rx: mpsc::Receiver<Vec<u8>>)
where
    S: AsyncWrite,
{
    while let Some(body) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, MAGIC_RESPONSE, &body).await {
            tracing::debug!(error = %e, "Write failed, closing writer");
            break;
        }
    }
}
