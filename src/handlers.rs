//! Handlers for the demo server.

use async_trait::async_trait;
use relaywire::{ConnManager, Handler, Request};
use std::sync::Weak;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Delay between acknowledging a close request and closing.
const CLOSE_DELAY: Duration = Duration::from_millis(500);

/// Replies `ECHO: <data>` on id 1.
pub struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn pre_handle(&self, request: &Request) {
        debug!(conn_id = request.connection().id(), "Echo request");
    }

    async fn handle(&self, request: &Request) {
        let data = String::from_utf8_lossy(request.data());
        let reply = format!("ECHO: {data}");
        if let Err(e) = request.connection().send_msg(1, reply) {
            warn!(conn_id = request.connection().id(), error = %e, "Echo reply failed");
        }
    }
}

/// Replies `PROCESSED: <DATA>` on id 2.
pub struct DataTransferHandler;

#[async_trait]
impl Handler for DataTransferHandler {
    async fn handle(&self, request: &Request) {
        let data = String::from_utf8_lossy(request.data()).to_uppercase();
        let reply = format!("PROCESSED: {data}");
        if let Err(e) = request.connection().send_msg(2, reply) {
            warn!(conn_id = request.connection().id(), error = %e, "Processed reply failed");
        }
    }
}

/// Acknowledges on id 3, then closes the connection shortly after so the
/// acknowledgement reaches the client.
pub struct CloseHandler;

#[async_trait]
impl Handler for CloseHandler {
    async fn handle(&self, request: &Request) {
        let conn = request.connection().clone();
        if let Err(e) = conn.send_msg(3, "Connection closing...") {
            warn!(conn_id = conn.id(), error = %e, "Close acknowledgement failed");
        }

        tokio::spawn(async move {
            tokio::time::sleep(CLOSE_DELAY).await;
            conn.stop();
        });
    }
}

/// Reports uptime and live connections on id 4.
pub struct StatusHandler {
    started: Instant,
    connections: Weak<ConnManager>,
}

impl StatusHandler {
    pub fn new(started: Instant, connections: Weak<ConnManager>) -> Self {
        Self {
            started,
            connections,
        }
    }

    fn status(&self) -> String {
        let active = self.connections.upgrade().map_or(0, |m| m.len());
        format!(
            "{{\"server_name\": \"relaywire\", \"version\": \"{}\", \"uptime_secs\": {}, \"active_connections\": {}}}",
            env!("CARGO_PKG_VERSION"),
            self.started.elapsed().as_secs(),
            active
        )
    }
}

#[async_trait]
impl Handler for StatusHandler {
    async fn handle(&self, request: &Request) {
        if let Err(e) = request.connection().send_msg(4, self.status()) {
            warn!(conn_id = request.connection().id(), error = %e, "Status reply failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaywire::protocol::{pack, read_frame};
    use relaywire::{Config, Message, Server};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn start_demo() -> relaywire::ServerHandle {
        let mut config = Config::default();
        config.port = 0;
        config.heartbeat.enabled = false;

        let mut server = Server::new(config);
        server.add_handler(1, EchoHandler).unwrap();
        server.add_handler(2, DataTransferHandler).unwrap();
        server.add_handler(3, CloseHandler).unwrap();
        server
            .add_handler(4, StatusHandler::new(Instant::now(), server.conn_manager()))
            .unwrap();
        server.start().await.unwrap()
    }

    async fn call(stream: &mut TcpStream, msg_id: u32, body: &str) -> Message {
        let frame = pack(&Message::new(msg_id, body.to_string()));
        stream.write_all(&frame).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), read_frame(stream, 0))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_demo_handlers() {
        let handle = start_demo().await;
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();

        let reply = call(&mut client, 1, "hi").await;
        assert_eq!(reply, Message::new(1, "ECHO: hi"));

        let reply = call(&mut client, 2, "shout").await;
        assert_eq!(reply, Message::new(2, "PROCESSED: SHOUT"));

        let reply = call(&mut client, 4, "status").await;
        assert_eq!(reply.id(), 4);
        let status = String::from_utf8_lossy(reply.data()).into_owned();
        assert!(status.contains("\"active_connections\": 1"), "{status}");

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_close_handler_acks_then_closes() {
        let handle = start_demo().await;
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();

        let reply = call(&mut client, 3, "bye").await;
        assert_eq!(reply, Message::new(3, "Connection closing..."));

        let mut buf = [0u8; 8];
        let res = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(res, Ok(0) | Err(_)));

        handle.stop().await;
    }
}
