//! TCP server: listener, accept loop and shutdown orchestration.
//!
//! [`Server`] collects handlers, hooks and the metrics sink. [`Server::start`]
//! binds the listener, starts the heartbeat checker and worker pool, and
//! spawns the accept loop; the returned [`ServerHandle`] stops everything
//! again.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::error::{RouterError, ServerError};
use crate::heartbeat::{HeartbeatChecker, HeartbeatHandler, HEARTBEAT_CHECKER_KEY};
use crate::metrics::{Metrics, MetricsSink};
use crate::net::{ConnManager, Connection, Property};
use crate::pool::WorkerPool;
use crate::protocol::HEARTBEAT_MSG_ID;
use crate::router::{Handler, Router};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Connection lifecycle callback.
pub(crate) type ConnHook = Arc<dyn Fn(&Connection) + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct Hooks {
    pub on_start: Option<ConnHook>,
    pub on_stop: Option<ConnHook>,
}

/// State every connection of one server refers back to.
pub(crate) struct Shared {
    pub max_package_size: u32,
    pub send_queue_size: usize,
    pub router: Arc<Router>,
    pub conn_manager: Arc<ConnManager>,
    pub heartbeat: Option<Arc<HeartbeatChecker>>,
    pub worker_pool: Option<WorkerPool>,
    pub hooks: Hooks,
    pub metrics: Arc<dyn MetricsSink>,
}

/// Server builder.
pub struct Server {
    config: Config,
    router: Router,
    hooks: Hooks,
    metrics: Arc<dyn MetricsSink>,
    conn_manager: Arc<ConnManager>,
}

impl Server {
    /// Create a server. With the heartbeat enabled, message id 0 is taken by
    /// the heartbeat handler.
    pub fn new(config: Config) -> Self {
        let mut router = Router::new();
        if config.heartbeat.enabled {
            // Fresh router, cannot collide
            let _ = router.add_handler(HEARTBEAT_MSG_ID, HeartbeatHandler);
        }

        let conn_manager = Arc::new(ConnManager::new(config.max_conn));

        Self {
            config,
            router,
            hooks: Hooks::default(),
            metrics: Arc::new(Metrics::new()),
            conn_manager,
        }
    }

    /// Register a handler. Registering an id twice is an error.
    pub fn add_handler<H: Handler>(&mut self, msg_id: u32, handler: H) -> Result<(), RouterError> {
        self.router.add_handler(msg_id, handler)
    }

    /// Called once per connection after its loops start.
    pub fn on_conn_start<F>(&mut self, hook: F)
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.hooks.on_start = Some(Arc::new(hook));
    }

    /// Called once per connection while it shuts down.
    pub fn on_conn_stop<F>(&mut self, hook: F)
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.hooks.on_stop = Some(Arc::new(hook));
    }

    /// Replace the default in-process [`Metrics`] sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registry of live connections; handlers may keep a weak reference.
    pub fn conn_manager(&self) -> Weak<ConnManager> {
        Arc::downgrade(&self.conn_manager)
    }

    /// Bind the listener and start serving in the background.
    pub async fn start(self) -> Result<ServerHandle, ServerError> {
        self.config.validate()?;

        let listen = self.config.listen_addr();
        let addr = tokio::net::lookup_host(&listen)
            .await?
            .next()
            .ok_or_else(|| ServerError::InvalidAddress(listen.clone()))?;
        let listener = TcpListener::from_std(create_listener(addr)?)?;
        let local_addr = listener.local_addr()?;

        let router = Arc::new(self.router);

        let heartbeat = self.config.heartbeat.enabled.then(|| {
            Arc::new(HeartbeatChecker::new(
                self.config.heartbeat.interval,
                self.config.heartbeat.timeout,
            ))
        });
        if let Some(checker) = &heartbeat {
            checker.start();
        }

        let worker_pool = self
            .config
            .worker_pool
            .enabled
            .then(|| WorkerPool::new(self.config.worker_pool.clone(), Arc::clone(&router)));
        if let Some(pool) = &worker_pool {
            pool.start();
        }

        let shared = Arc::new(Shared {
            max_package_size: self.config.max_package_size,
            send_queue_size: self.config.send_queue_size,
            router,
            conn_manager: self.conn_manager,
            heartbeat,
            worker_pool,
            hooks: self.hooks,
            metrics: self.metrics,
        });

        info!(
            name = %self.config.name,
            address = %local_addr,
            max_conn = self.config.max_conn,
            max_package_size = self.config.max_package_size,
            "Server listening"
        );

        let shutdown = CancellationToken::new();
        let accept = tokio::spawn(accept_loop(listener, Arc::clone(&shared), shutdown.clone()));

        Ok(ServerHandle {
            local_addr,
            shared,
            shutdown,
            accept: parking_lot::Mutex::new(Some(accept)),
        })
    }

    /// Start, run until Ctrl-C or SIGTERM, then stop.
    pub async fn serve(self) -> Result<(), ServerError> {
        let handle = self.start().await?;
        shutdown_signal().await;
        handle.stop().await;
        Ok(())
    }
}

/// A running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    accept: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn conn_manager(&self) -> &Arc<ConnManager> {
        &self.shared.conn_manager
    }

    pub fn worker_pool(&self) -> Option<&WorkerPool> {
        self.shared.worker_pool.as_ref()
    }

    pub fn heartbeat(&self) -> Option<&Arc<HeartbeatChecker>> {
        self.shared.heartbeat.as_ref()
    }

    /// Stop accepting, stop the heartbeat checker, close every connection and
    /// finally stop the worker pool. Later calls return immediately.
    pub async fn stop(&self) {
        let Some(accept) = self.accept.lock().take() else {
            return;
        };

        info!(address = %self.local_addr, "Server stopping");

        self.shutdown.cancel();
        let _ = accept.await;

        if let Some(checker) = &self.shared.heartbeat {
            checker.stop().await;
        }

        for conn in self.shared.conn_manager.clear_conn() {
            conn.join().await;
        }

        if let Some(pool) = &self.shared.worker_pool {
            pool.stop().await;
        }

        info!(address = %self.local_addr, "Server stopped");
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, shutdown: CancellationToken) {
    let mut next_id: u32 = 1;

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        if let Err(e) = shared.conn_manager.ensure_capacity() {
            warn!(peer = %peer, error = %e, "Connection rejected");
            drop(stream);
            continue;
        }

        let id = next_conn_id(&mut next_id, &shared.conn_manager);

        if let Some(conn) = register(id, stream, &shared) {
            conn.start();
        }
    }

    info!("Accept loop stopped");
}

/// Hand out the next connection id. Ids start at 1, wrap back to 1 after
/// `u32::MAX` and skip any id still held by a live connection.
fn next_conn_id(next: &mut u32, conn_manager: &ConnManager) -> u32 {
    loop {
        let id = *next;
        *next = next.checked_add(1).unwrap_or(1);
        if !conn_manager.contains(id) {
            return id;
        }
        trace!(conn_id = id, "Connection id still in use, skipped");
    }
}

fn register(id: u32, stream: TcpStream, shared: &Arc<Shared>) -> Option<Arc<Connection>> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(conn_id = id, error = %e, "Failed to set TCP_NODELAY");
    }

    let conn = match Connection::new(id, stream, Arc::clone(shared)) {
        Ok(conn) => conn,
        Err(e) => {
            warn!(conn_id = id, error = %e, "Failed to set up connection");
            return None;
        }
    };

    shared.conn_manager.add(Arc::clone(&conn));
    if let Some(checker) = &shared.heartbeat {
        checker.add_connection(&conn);
        conn.set_property(HEARTBEAT_CHECKER_KEY, Property::shared(Arc::clone(checker)));
    }

    Some(conn)
}

/// Create a listening socket with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> std::io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C signal"),
        () = terminate => info!("Received SIGTERM signal"),
    }
}
