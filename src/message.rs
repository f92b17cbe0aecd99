//! Message value carried by a frame.

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::protocol;

/// A routed message: the routing id plus an opaque body.
///
/// The body length is always the length of `data`, so a decoded message can
/// never disagree with its own header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: u32,
    data: Bytes,
}

impl Message {
    /// Create a message from an id and a body.
    pub fn new(id: u32, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            data: data.into(),
        }
    }

    /// Like [`Message::new`], but refuses a body too long for the frame
    /// header.
    pub fn try_new(id: u32, data: impl Into<Bytes>) -> Result<Self, ProtocolError> {
        let data = data.into();
        protocol::body_len(data.len())?;
        Ok(Self { id, data })
    }

    /// Routing key.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Body length as carried on the wire. Saturates for bodies that
    /// [`Message::try_new`] would have refused.
    pub fn data_len(&self) -> u32 {
        protocol::body_len(self.data.len()).unwrap_or(u32::MAX)
    }

    /// Message body.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Consume the message, returning the body.
    pub fn into_data(self) -> Bytes {
        self.data
    }
}
