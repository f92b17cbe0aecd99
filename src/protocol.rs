//! Wire codec for the length-prefixed binary protocol.
//!
//! Every frame starts with a fixed 8-byte little-endian header:
//!
//! ```text
//! offset 0: u32 data_len   // body length in bytes
//! offset 4: u32 msg_id     // routing key
//! offset 8: [u8; data_len] // opaque body
//! ```
//!
//! Decoding is split in two steps. [`unpack`] validates the header only; the
//! caller reads exactly `data_len` further bytes and builds the [`Message`].
//! [`read_frame`] does both against any async reader.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ConnectionError, ProtocolError};
use crate::message::Message;

/// Size of the frame header.
pub const HEADER_LEN: usize = 8;

/// Message id reserved for heartbeats.
pub const HEARTBEAT_MSG_ID: u32 = 0;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub data_len: u32,
    pub msg_id: u32,
}

/// Body length as written in the header, rejecting bodies a `u32` cannot
/// describe.
pub fn body_len(len: usize) -> Result<u32, ProtocolError> {
    u32::try_from(len).map_err(|_| ProtocolError::BodyTooLong { len })
}

/// Serialize a message into a single frame.
pub fn pack(msg: &Message) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + msg.data().len());
    pack_into(msg, &mut buf);
    buf.freeze()
}

/// Append a frame for `msg` to `buf`.
pub fn pack_into(msg: &Message, buf: &mut BytesMut) {
    buf.reserve(HEADER_LEN + msg.data().len());
    buf.put_u32_le(msg.data_len());
    buf.put_u32_le(msg.id());
    buf.put_slice(msg.data());
}

/// Parse and validate a frame header.
///
/// `max_package_size == 0` disables the size check.
pub fn unpack(header: &[u8], max_package_size: u32) -> Result<FrameHeader, ProtocolError> {
    if header.len() < HEADER_LEN {
        return Err(ProtocolError::ShortHeader { len: header.len() });
    }

    let mut cursor = &header[..HEADER_LEN];
    let data_len = cursor.get_u32_le();
    let msg_id = cursor.get_u32_le();

    if max_package_size > 0 && data_len > max_package_size {
        return Err(ProtocolError::TooLarge {
            len: data_len,
            max: max_package_size,
        });
    }

    Ok(FrameHeader { data_len, msg_id })
}

/// Read one complete frame.
///
/// A short read of either the header or the body surfaces as an I/O error
/// (`UnexpectedEof`); it is never retried. An oversized header is rejected
/// before any body byte is read.
pub async fn read_frame<R>(reader: &mut R, max_package_size: u32) -> Result<Message, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let FrameHeader { data_len, msg_id } = unpack(&header, max_package_size)?;

    if data_len == 0 {
        return Ok(Message::new(msg_id, Bytes::new()));
    }

    let mut body = vec![0u8; data_len as usize];
    reader.read_exact(&mut body).await?;

    Ok(Message::new(msg_id, body))
}
