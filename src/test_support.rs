//! Helpers shared by the unit tests: loopback connections and a raw frame
//! client.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use crate::config::{Config, HeartbeatConfig, WorkerPoolConfig};
use crate::message::Message;
use crate::metrics::Metrics;
use crate::net::{ConnManager, Connection};
use crate::protocol;
use crate::router::Router;
use crate::server::{Hooks, Shared};

const TEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Server-side context without a listener, pool or heartbeat checker.
pub(crate) struct Harness {
    pub shared: Arc<Shared>,
    pub metrics: Arc<Metrics>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let metrics = Arc::new(Metrics::new());
        let shared = Arc::new(Shared {
            max_package_size: config.max_package_size,
            send_queue_size: config.send_queue_size,
            router: Arc::new(Router::new()),
            conn_manager: Arc::new(ConnManager::new(config.max_conn)),
            heartbeat: None,
            worker_pool: None,
            hooks: Hooks::default(),
            metrics: metrics.clone(),
        });
        Self { shared, metrics }
    }

    pub fn with_hooks<S, T>(self, on_start: S, on_stop: T) -> Self
    where
        S: Fn(&Connection) + Send + Sync + 'static,
        T: Fn(&Connection) + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            max_package_size: self.shared.max_package_size,
            send_queue_size: self.shared.send_queue_size,
            router: self.shared.router.clone(),
            conn_manager: self.shared.conn_manager.clone(),
            heartbeat: None,
            worker_pool: None,
            hooks: Hooks {
                on_start: Some(Arc::new(on_start)),
                on_stop: Some(Arc::new(on_stop)),
            },
            metrics: self.metrics.clone(),
        });
        Self {
            shared,
            metrics: self.metrics,
        }
    }

    /// A server-side connection plus the client end of the socket.
    pub async fn connect(&self, id: u32) -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (server_side, _) = accepted.unwrap();

        let conn = Connection::new(id, server_side, self.shared.clone()).unwrap();
        (conn, client.unwrap())
    }

    /// Put a connection in the registry the way the accept loop does.
    pub fn register(&self, conn: &Arc<Connection>) {
        self.shared.conn_manager.add(conn.clone());
    }
}

/// Defaults sized for tests: ephemeral port, small pool, no heartbeat.
pub(crate) fn test_config() -> Config {
    Config {
        port: 0,
        worker_pool: WorkerPoolConfig {
            enabled: true,
            core_workers: 2,
            max_workers: 4,
            queue_size: 64,
            idle_timeout: Duration::from_secs(60),
        },
        heartbeat: HeartbeatConfig {
            enabled: false,
            ..HeartbeatConfig::default()
        },
        ..Config::default()
    }
}

pub(crate) async fn send_frame(stream: &mut TcpStream, msg_id: u32, body: &[u8]) {
    let frame = protocol::pack(&Message::new(msg_id, body.to_vec()));
    stream.write_all(&frame).await.unwrap();
}

pub(crate) async fn read_reply(stream: &mut TcpStream) -> Message {
    tokio::time::timeout(TEST_TIMEOUT, protocol::read_frame(stream, 0))
        .await
        .expect("timed out waiting for a reply")
        .unwrap()
}

/// Poll `cond` until it holds, panicking after a couple of seconds.
pub(crate) async fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
