//! Connection layer: live connections, their registry and request values.

mod conn_manager;
mod connection;
mod property;
mod request;

pub use conn_manager::ConnManager;
pub use connection::{ConnState, Connection};
pub use property::Property;
pub use request::Request;
