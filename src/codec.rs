use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::NsqError;
use crate::frame::{
    Command, Frame, MESSAGE_ID_LEN, Message, MessageId, delay_millis, mpub_payload_len,
};

/// Protocol preamble written once, right after the TCP connect.
pub const MAGIC_V2: &[u8; 4] = b"  V2";

/// Default cap on a single inbound frame or outbound payload.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub const FRAME_TYPE_RESPONSE: u32 = 0;
pub const FRAME_TYPE_ERROR: u32 = 1;
pub const FRAME_TYPE_MESSAGE: u32 = 2;

pub(crate) const HEARTBEAT_RESPONSE: &[u8] = b"_heartbeat_";
pub(crate) const OK_RESPONSE: &[u8] = b"OK";

// timestamp (8) + attempts (2) + id (16)
const MESSAGE_HEADER_LEN: usize = 8 + 2 + MESSAGE_ID_LEN;

/// `NsqCodec` implements `tokio_util::codec::{Decoder, Encoder}` for the nsqd
/// TCP protocol (V2).
///
/// Responsibilities:
/// - Decode size-prefixed frames into `Frame::{Heartbeat, Ok, Response,
///   Error, Message}`.
/// - Encode `Command` values into the line / length-prefixed wire format.
///
/// The `"  V2"` magic is not part of the framed stream; the connection
/// writes it before wrapping the socket.
#[derive(Debug, Clone)]
pub struct NsqCodec {
    max_frame_bytes: usize,
}

impl NsqCodec {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }
}

impl Default for NsqCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn decode_message(mut data: Bytes) -> Result<Message, io::Error> {
    if data.len() < MESSAGE_HEADER_LEN {
        return Err(invalid(format!(
            "message frame of {} bytes is shorter than the {} byte header",
            data.len(),
            MESSAGE_HEADER_LEN
        )));
    }
    let timestamp = data.get_i64();
    let attempts = data.get_u16();
    let id = MessageId::from_slice(&data[..MESSAGE_ID_LEN])
        .ok_or_else(|| invalid("truncated message id".into()))?;
    data.advance(MESSAGE_ID_LEN);
    Ok(Message {
        id,
        attempts,
        timestamp,
        body: data,
    })
}

impl Decoder for NsqCodec {
    type Item = Frame;
    type Error = io::Error;

    /// Decode one frame from `src`.
    ///
    /// Returns `Ok(None)` and leaves `src` untouched until the whole
    /// `[size][type][data]` unit is buffered. Sizes below 4 or above
    /// `max_frame_bytes`, unknown frame types and short message frames are
    /// `InvalidData` errors.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let mut peek = &src[..4];
        let size = peek.get_u32() as usize;
        if size < 4 {
            return Err(invalid(format!("frame size {} is too small", size)));
        }
        if size > self.max_frame_bytes {
            return Err(invalid(format!(
                "frame size {} exceeds limit of {}",
                size, self.max_frame_bytes
            )));
        }
        if src.len() < 4 + size {
            src.reserve(4 + size - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame_type = src.get_u32();
        let data = src.split_to(size - 4).freeze();

        let frame = match frame_type {
            FRAME_TYPE_RESPONSE if data.as_ref() == HEARTBEAT_RESPONSE => Frame::Heartbeat,
            FRAME_TYPE_RESPONSE if data.as_ref() == OK_RESPONSE => Frame::Ok,
            FRAME_TYPE_RESPONSE => Frame::Response(data),
            FRAME_TYPE_ERROR => Frame::Error(data),
            FRAME_TYPE_MESSAGE => Frame::Message(decode_message(data)?),
            other => return Err(invalid(format!("unknown frame type {}", other))),
        };
        Ok(Some(frame))
    }
}

fn put_body(dst: &mut BytesMut, body: &[u8]) {
    dst.put_u32(body.len() as u32);
    dst.extend_from_slice(body);
}

impl Encoder<Command> for NsqCodec {
    type Error = NsqError;

    /// Encode `item` into `dst`.
    ///
    /// The command is validated first, so nothing is written for a command
    /// that fails with `NsqError::Encode`.
    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), NsqError> {
        item.validate(self.max_frame_bytes)?;

        match item {
            Command::Pub { topic, body } => {
                dst.extend_from_slice(format!("PUB {}\n", topic).as_bytes());
                put_body(dst, &body);
            }
            Command::Mpub { topic, bodies } => {
                dst.extend_from_slice(format!("MPUB {}\n", topic).as_bytes());
                dst.put_u32(mpub_payload_len(&bodies) as u32);
                dst.put_u32(bodies.len() as u32);
                for body in &bodies {
                    put_body(dst, body);
                }
            }
            Command::Dpub { topic, delay, body } => {
                let ms = delay_millis(delay)?;
                dst.extend_from_slice(format!("DPUB {} {}\n", topic, ms).as_bytes());
                put_body(dst, &body);
            }
            Command::Sub { topic, channel } => {
                dst.extend_from_slice(format!("SUB {} {}\n", topic, channel).as_bytes());
            }
            Command::Rdy(count) => {
                dst.extend_from_slice(format!("RDY {}\n", count).as_bytes());
            }
            Command::Fin(id) => {
                dst.extend_from_slice(b"FIN ");
                dst.extend_from_slice(id.as_bytes());
                dst.put_u8(b'\n');
            }
            Command::Req { id, delay } => {
                let ms = delay_millis(delay)?;
                dst.extend_from_slice(b"REQ ");
                dst.extend_from_slice(id.as_bytes());
                dst.extend_from_slice(format!(" {}\n", ms).as_bytes());
            }
            Command::Touch(id) => {
                dst.extend_from_slice(b"TOUCH ");
                dst.extend_from_slice(id.as_bytes());
                dst.put_u8(b'\n');
            }
            Command::Nop => dst.extend_from_slice(b"NOP\n"),
            Command::Cls => dst.extend_from_slice(b"CLS\n"),
        }

        Ok(())
    }
}
