//! Liveness tracking.
//!
//! Clients prove they are alive by sending message id 0. The registered
//! [`HeartbeatHandler`] answers with `pong` and refreshes the sender's
//! last-active time; a periodic sweep stops every connection that has been
//! quiet for longer than the timeout.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::message::Message;
use crate::net::{Connection, Request};
use crate::protocol::HEARTBEAT_MSG_ID;
use crate::router::Handler;

/// Property key under which a connection carries its checker.
pub const HEARTBEAT_CHECKER_KEY: &str = "HeartbeatChecker";

/// Body of a client heartbeat.
pub const HEARTBEAT_PING: &[u8] = b"ping";

/// Body of the server's heartbeat reply.
pub const HEARTBEAT_PONG: &[u8] = b"pong";

/// True for the reserved heartbeat message id.
pub fn is_heartbeat(msg_id: u32) -> bool {
    msg_id == HEARTBEAT_MSG_ID
}

/// The heartbeat a client sends.
pub fn ping() -> Message {
    Message::new(HEARTBEAT_MSG_ID, HEARTBEAT_PING)
}

/// The heartbeat the server sends back.
pub fn pong() -> Message {
    Message::new(HEARTBEAT_MSG_ID, HEARTBEAT_PONG)
}

struct Entry {
    conn: Weak<Connection>,
    last_active: Instant,
}

/// Tracks last-active times and closes idle connections.
pub struct HeartbeatChecker {
    entries: RwLock<HashMap<u32, Entry>>,
    interval: Duration,
    timeout: Duration,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatChecker {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            interval,
            timeout,
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Start tracking a connection, marking it active now.
    pub fn add_connection(&self, conn: &Arc<Connection>) {
        let id = conn.id();
        self.entries.write().insert(
            id,
            Entry {
                conn: Arc::downgrade(conn),
                last_active: Instant::now(),
            },
        );
        debug!(conn_id = id, "Connection added to heartbeat checker");
    }

    pub fn remove_connection(&self, id: u32) {
        if self.entries.write().remove(&id).is_some() {
            debug!(conn_id = id, "Connection removed from heartbeat checker");
        }
    }

    /// Mark a tracked connection active now. Untracked ids are ignored.
    pub fn update_active_time(&self, id: u32) {
        if let Some(entry) = self.entries.write().get_mut(&id) {
            entry.last_active = Instant::now();
        }
    }

    pub fn tracked_count(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_tracked(&self, id: u32) -> bool {
        self.entries.read().contains_key(&id)
    }

    /// Spawn the periodic sweep. Only the first call has any effect.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() || self.shutdown.is_cancelled() {
            return;
        }

        let checker = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = time::interval_at(
                time::Instant::now() + checker.interval,
                checker.interval,
            );
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = checker.shutdown.cancelled() => break,
                    _ = ticker.tick() => checker.check(),
                }
            }
        }));

        info!(
            interval_ms = self.interval.as_millis() as u64,
            timeout_ms = self.timeout.as_millis() as u64,
            "Heartbeat checker started"
        );
    }

    /// Stop the sweep and wait for it to exit. Later calls return
    /// immediately.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
            info!("Heartbeat checker stopped");
        }
    }

    /// Stop every connection idle for longer than the timeout.
    pub fn check(&self) {
        let now = Instant::now();

        let stale: Vec<(u32, Weak<Connection>)> = self
            .entries
            .read()
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_active) > self.timeout)
            .map(|(id, entry)| (*id, entry.conn.clone()))
            .collect();

        for (id, conn) in stale {
            if let Some(conn) = conn.upgrade() {
                warn!(conn_id = id, "Heartbeat timeout, closing connection");
                conn.stop();
            }
            self.remove_connection(id);
        }
    }
}

/// Replies to heartbeats and refreshes the sender's liveness.
pub struct HeartbeatHandler;

#[async_trait]
impl Handler for HeartbeatHandler {
    async fn handle(&self, request: &Request) {
        let conn = request.connection();

        if let Err(e) = conn.send_msg(HEARTBEAT_MSG_ID, HEARTBEAT_PONG) {
            debug!(conn_id = conn.id(), error = %e, "Heartbeat reply not sent");
        }

        let checker = conn
            .get_property(HEARTBEAT_CHECKER_KEY)
            .ok()
            .and_then(|p| p.downcast::<HeartbeatChecker>());
        if let Some(checker) = checker {
            checker.update_active_time(conn.id());
        }
    }
}
