//! Font query server
//!
//! [`RpcServer`] owns a multi-threaded tokio runtime whose workers service
//! every connection, plus a fixed number of accept tasks ("listener slots")
//! that keep the endpoint ready for new clients. Each accepted connection
//! runs its own [`Connection`] state machine on the shared pool.

use crate::index::types::FaceDescriptor;
use crate::server::connection::Connection;
use crate::server::protocol::DEFAULT_MAX_MESSAGE_LEN;
use crate::server::transport::Listener;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Upper bound on worker threads when sizing from the CPU count
pub const MAX_WORKER_THREADS: usize = 8;

/// Concurrent pending accepts on the endpoint
pub const DEFAULT_LISTENER_SLOTS: usize = 4;

/// Longest a connection may wait on a single read or write
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause after a failed accept before the slot retries
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Grace period for worker threads once all connections are gone
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolves a query to candidate faces
pub trait RequestHandler: Send + Sync + 'static {
    fn handle_query(&self, query: &str) -> Vec<FaceDescriptor>;
}

/// Consumes one-way feedback about fonts a client just loaded
pub trait FeedbackHandler: Send + Sync + 'static {
    fn handle_feedback(&self, paths: &[String]);
}

/// Feedback sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreFeedback;

impl FeedbackHandler for IgnoreFeedback {
    fn handle_feedback(&self, _paths: &[String]) {}
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to start worker pool: {0}")]
    Runtime(#[source] io::Error),

    #[error("failed to listen on {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Socket path or pipe name
    pub endpoint: PathBuf,
    pub worker_threads: usize,
    pub listener_slots: usize,
    pub max_message_len: u32,
    /// Idle or stalled connections are closed after this long
    pub io_timeout: Duration,
}

impl ServerConfig {
    pub fn new(endpoint: impl Into<PathBuf>) -> Self {
        Self {
            endpoint: endpoint.into(),
            worker_threads: default_worker_threads(),
            listener_slots: DEFAULT_LISTENER_SLOTS,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }
}

/// CPU count capped at [`MAX_WORKER_THREADS`]
pub fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(MAX_WORKER_THREADS)
}

/// State shared by the accept slots
struct Shared {
    requests: Arc<dyn RequestHandler>,
    feedback: Arc<dyn FeedbackHandler>,
    max_message_len: u32,
    io_timeout: Duration,
    /// Child of the shutdown token; cancels in-flight connection I/O
    connections: CancellationToken,
    tracker: TaskTracker,
    open: AtomicUsize,
}

/// The running server
///
/// Dropping it performs the same orderly shutdown as [`RpcServer::shutdown`].
/// Neither may be called from inside another tokio runtime.
pub struct RpcServer {
    runtime: Option<Runtime>,
    listener: Option<Arc<Listener>>,
    endpoint: PathBuf,
    shutdown: CancellationToken,
    shared: Arc<Shared>,
}

impl RpcServer {
    /// Bind the endpoint and start serving
    pub fn start(
        config: ServerConfig,
        requests: Arc<dyn RequestHandler>,
        feedback: Arc<dyn FeedbackHandler>,
    ) -> Result<Self, ServerError> {
        let worker_threads = config.worker_threads.max(1);
        let listener_slots = config.listener_slots.max(1);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .thread_name("fontresolve-worker")
            .enable_all()
            .build()
            .map_err(ServerError::Runtime)?;

        let listener = {
            let _guard = runtime.enter();
            Listener::bind(&config.endpoint).map_err(|source| ServerError::Bind {
                path: config.endpoint.clone(),
                source,
            })?
        };
        let listener = Arc::new(listener);

        let shutdown = CancellationToken::new();
        let shared = Arc::new(Shared {
            requests,
            feedback,
            max_message_len: config.max_message_len,
            io_timeout: config.io_timeout,
            connections: shutdown.child_token(),
            tracker: TaskTracker::new(),
            open: AtomicUsize::new(0),
        });

        for slot in 0..listener_slots {
            shared.tracker.spawn_on(
                accept_loop(
                    slot,
                    Arc::clone(&listener),
                    Arc::clone(&shared),
                    shutdown.clone(),
                ),
                runtime.handle(),
            );
        }

        info!(
            worker_threads,
            listener_slots,
            "listening on {}",
            config.endpoint.display()
        );

        Ok(Self {
            runtime: Some(runtime),
            listener: Some(listener),
            endpoint: config.endpoint,
            shutdown,
            shared,
        })
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    /// Connections accepted and not yet closed
    pub fn open_connections(&self) -> usize {
        self.shared.open.load(Ordering::Relaxed)
    }

    /// Stop accepting, cancel every connection and join the workers
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };

        self.shutdown.cancel();
        self.shared.tracker.close();
        runtime.block_on(self.shared.tracker.wait());

        // Deregister the listener while the reactor is still alive
        {
            let _guard = runtime.enter();
            self.listener.take();
        }
        runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);

        info!("server on {} stopped", self.endpoint.display());
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Decrements the open-connection count however the task ends
struct OpenGuard(Arc<Shared>);

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.open.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn accept_loop(
    slot: usize,
    listener: Arc<Listener>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok(stream) => {
                shared.open.fetch_add(1, Ordering::Relaxed);
                let guard = OpenGuard(Arc::clone(&shared));
                let connection = Connection::new(
                    stream,
                    shared.max_message_len,
                    shared.io_timeout,
                    Arc::clone(&shared.requests),
                    Arc::clone(&shared.feedback),
                    shared.connections.clone(),
                );
                shared.tracker.spawn(async move {
                    let _guard = guard;
                    connection.run().await;
                });
            }
            Err(e) => {
                warn!("accept failed on slot {}: {}", slot, e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }
    debug!("listener slot {} stopped", slot);
}
