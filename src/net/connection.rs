//! A single client connection.
//!
//! Each connection runs two tasks: a reader that decodes frames and hands
//! them to the router or worker pool, and a writer that drains the outbound
//! queue onto the socket. Both are started by [`Connection::start`] and
//! both end when [`Connection::stop`] fires the exit signal. Either loop
//! failing stops the whole connection.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{ConnectionError, PropertyNotFound};
use crate::message::Message;
use crate::metrics::MetricsSink;
use crate::net::{Property, Request};
use crate::protocol::{self, read_frame};
use crate::server::Shared;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Running = 0,
    /// Shutdown sequence in progress.
    Stopping = 1,
    Stopped = 2,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnState::Running,
            1 => ConnState::Stopping,
            _ => ConnState::Stopped,
        }
    }
}

/// Socket halves and queue receiver, held until the loops take them.
struct ConnIo {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    outbound: mpsc::Receiver<Bytes>,
}

/// A live TCP connection.
pub struct Connection {
    id: u32,
    peer_addr: SocketAddr,
    state: AtomicU8,
    /// `None` once the outbound queue has been closed.
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    io: Mutex<Option<ConnIo>>,
    exit: CancellationToken,
    properties: RwLock<HashMap<String, Property>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl Connection {
    pub(crate) fn new(id: u32, stream: TcpStream, shared: Arc<Shared>) -> io::Result<Arc<Self>> {
        let peer_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel(shared.send_queue_size.max(1));

        Ok(Arc::new(Self {
            id,
            peer_addr,
            state: AtomicU8::new(ConnState::Running as u8),
            outbound: Mutex::new(Some(tx)),
            io: Mutex::new(Some(ConnIo {
                reader,
                writer,
                outbound: rx,
            })),
            exit: CancellationToken::new(),
            properties: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::with_capacity(2)),
            shared,
        }))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True once shutdown has begun.
    pub fn is_closed(&self) -> bool {
        self.state() != ConnState::Running
    }

    /// Fire the on-connect hook, then launch the reader and writer loops.
    ///
    /// Only the first call has any effect.
    pub fn start(self: &Arc<Self>) {
        let Some(ConnIo {
            reader,
            writer,
            outbound,
        }) = self.io.lock().take()
        else {
            return;
        };

        info!(conn_id = self.id, peer = %self.peer_addr, "Connection started");
        self.metrics().connection_opened();

        // Before the loops exist, so a failing loop cannot stop us first
        if let Some(hook) = &self.shared.hooks.on_start {
            hook(self.as_ref());
        }

        let reader_task = tokio::spawn(Arc::clone(self).read_task(reader));
        let writer_task = tokio::spawn(Arc::clone(self).write_task(writer, outbound));
        self.tasks.lock().extend([reader_task, writer_task]);
    }

    /// Shut the connection down.
    ///
    /// Safe to call from any task, any number of times, concurrently: the
    /// shutdown sequence runs exactly once.
    pub fn stop(&self) {
        if self
            .state
            .compare_exchange(
                ConnState::Running as u8,
                ConnState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        info!(conn_id = self.id, peer = %self.peer_addr, "Connection stopping");

        // Closing the queue makes further sends fail fast
        self.outbound.lock().take();

        if let Some(hook) = &self.shared.hooks.on_stop {
            hook(self);
        }

        // Drops the socket outright if the loops never took it
        self.io.lock().take();
        self.exit.cancel();

        self.shared.conn_manager.remove(self.id);
        if let Some(heartbeat) = &self.shared.heartbeat {
            heartbeat.remove_connection(self.id);
        }

        self.metrics().connection_closed();
        self.state.store(ConnState::Stopped as u8, Ordering::Release);
    }

    /// Wait for the reader and writer tasks to finish.
    ///
    /// Must not be awaited from one of this connection's own loops.
    pub async fn join(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Queue a message for the writer.
    ///
    /// Never blocks: fails with [`ConnectionError::Closed`] once the
    /// connection is stopping and with [`ConnectionError::SendQueueFull`]
    /// when the writer has fallen behind. A body longer than `u32::MAX`
    /// bytes is refused before it is framed.
    pub fn send_msg(&self, msg_id: u32, data: impl Into<Bytes>) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed(self.id));
        }

        let msg = Message::try_new(msg_id, data).inspect_err(|e| {
            warn!(conn_id = self.id, msg_id, error = %e, "Message refused");
        })?;
        let frame = protocol::pack(&msg);

        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return Err(ConnectionError::Closed(self.id));
        };

        match tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(conn_id = self.id, msg_id, "Send queue full, message dropped");
                self.metrics().error();
                Err(ConnectionError::SendQueueFull(self.id))
            }
            Err(TrySendError::Closed(_)) => Err(ConnectionError::Closed(self.id)),
        }
    }

    pub fn set_property(&self, key: impl Into<String>, value: impl Into<Property>) {
        self.properties.write().insert(key.into(), value.into());
    }

    pub fn get_property(&self, key: &str) -> Result<Property, PropertyNotFound> {
        self.properties
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| PropertyNotFound(key.to_string()))
    }

    pub fn remove_property(&self, key: &str) -> Option<Property> {
        self.properties.write().remove(key)
    }

    pub(crate) fn metrics(&self) -> &dyn MetricsSink {
        self.shared.metrics.as_ref()
    }

    async fn read_task(self: Arc<Self>, mut reader: OwnedReadHalf) {
        trace!(conn_id = self.id, "Reader started");

        let result = tokio::select! {
            res = self.read_loop(&mut reader) => res,
            _ = self.exit.cancelled() => Ok(()),
        };

        match result {
            Ok(()) => {}
            Err(e) if e.is_disconnect() => {
                debug!(conn_id = self.id, "Peer closed connection");
            }
            Err(e) => {
                warn!(conn_id = self.id, error = %e, "Read failed, closing connection");
                self.metrics().error();
            }
        }

        self.stop();
        debug!(conn_id = self.id, "Reader stopped");
    }

    /// Decode frames until the stream fails. Any error ends the loop; a
    /// framing error is never skipped over.
    async fn read_loop<R>(self: &Arc<Self>, reader: &mut R) -> Result<(), ConnectionError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let msg = read_frame(reader, self.shared.max_package_size).await?;
            self.metrics().message_received();
            trace!(
                conn_id = self.id,
                msg_id = msg.id(),
                len = msg.data_len(),
                "Frame received"
            );
            self.dispatch(Request::new(Arc::clone(self), msg));
        }
    }

    fn dispatch(&self, request: Request) {
        match &self.shared.worker_pool {
            Some(pool) => pool.add_request(request),
            None => {
                let router = Arc::clone(&self.shared.router);
                tokio::spawn(async move {
                    router.do_msg_handler(request).await;
                });
            }
        }
    }

    async fn write_task<W>(self: Arc<Self>, mut writer: W, mut outbound: mpsc::Receiver<Bytes>)
    where
        W: AsyncWrite + Unpin,
    {
        trace!(conn_id = self.id, "Writer started");

        if let Err(e) = write_loop(&mut writer, &mut outbound, &self.exit, self.metrics()).await {
            debug!(conn_id = self.id, error = %e, "Write failed, closing connection");
            self.metrics().error();
        }

        let _ = writer.shutdown().await;
        self.stop();
        debug!(conn_id = self.id, "Writer stopped");
    }
}

/// Write queued frames verbatim until the queue closes or `exit` fires.
pub(crate) async fn write_loop<W>(
    writer: &mut W,
    outbound: &mut mpsc::Receiver<Bytes>,
    exit: &CancellationToken,
    metrics: &dyn MetricsSink,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => return Ok(()),
            },
            _ = exit.cancelled() => return Ok(()),
        };

        tokio::select! {
            res = writer.write_all(&frame) => res?,
            _ = exit.cancelled() => return Ok(()),
        }
        metrics.message_sent();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}
