//! relaywire: a TCP application-server substrate.
//!
//! Clients speak a length-prefixed binary protocol (8-byte little-endian
//! header: body length, then message id). Each message id is routed to a
//! registered [`Handler`]; handlers reply through the connection they were
//! called for. Around that sit an elastic worker pool, a heartbeat checker
//! that closes silent connections, and a connection cap.
//!
//! ```no_run
//! use relaywire::{Config, Handler, Request, Server};
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl Handler for Echo {
//!     async fn handle(&self, request: &Request) {
//!         let _ = request.connection().send_msg(1, request.data().clone());
//!     }
//! }
//!
//! # async fn run() -> Result<(), relaywire::ServerError> {
//! let mut server = Server::new(Config::default());
//! server.add_handler(1, Echo)?;
//! server.serve().await
//! # }
//! ```

pub mod config;
pub mod error;
pub mod heartbeat;
pub mod message;
pub mod metrics;
pub mod net;
pub mod pool;
pub mod protocol;
pub mod router;
pub mod server;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{
    CapacityError, ConnectionError, PropertyNotFound, ProtocolError, RouterError, ServerError,
};
pub use heartbeat::{HeartbeatChecker, HeartbeatHandler};
pub use message::Message;
pub use metrics::{Metrics, MetricsSink, MetricsSnapshot};
pub use net::{ConnManager, ConnState, Connection, Property, Request};
pub use pool::WorkerPool;
pub use router::{Handler, Router};
pub use server::{Server, ServerHandle};
