//! A decoded message bound to the connection it arrived on.

use bytes::Bytes;
use std::sync::Arc;

use crate::message::Message;
use crate::net::Connection;

/// Unit of work handed to the router.
#[derive(Debug, Clone)]
pub struct Request {
    conn: Arc<Connection>,
    msg: Message,
}

impl Request {
    pub fn new(conn: Arc<Connection>, msg: Message) -> Self {
        Self { conn, msg }
    }

    /// Connection the message arrived on; replies go through its send API.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn msg_id(&self) -> u32 {
        self.msg.id()
    }

    pub fn data(&self) -> &Bytes {
        self.msg.data()
    }

    pub fn message(&self) -> &Message {
        &self.msg
    }
}
