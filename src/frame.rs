use bytes::Bytes;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::NsqError;

/// Length in bytes of an nsqd message id.
pub const MESSAGE_ID_LEN: usize = 16;

/// Largest `RDY` count nsqd accepts with its default `--max-rdy-count`.
pub const MAX_RDY_COUNT: u32 = 2500;

const MAX_NAME_LEN: usize = 64;
const EPHEMERAL_SUFFIX: &str = "#ephemeral";

/// Opaque 16-byte message identifier assigned by nsqd.
///
/// nsqd ids are printable ASCII (hex), so `Display` renders the raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; MESSAGE_ID_LEN]);

impl MessageId {
    pub fn new(bytes: [u8; MESSAGE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Build an id from a slice; returns `None` unless it is exactly 16 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; MESSAGE_ID_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for MessageId {
    type Err = NsqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_slice(s.as_bytes()).ok_or_else(|| {
            NsqError::Encode(format!(
                "message id must be {} bytes, got {}",
                MESSAGE_ID_LEN,
                s.len()
            ))
        })
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

/// A message delivered by nsqd on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Broker-assigned id, used for FIN / REQ / TOUCH
    pub id: MessageId,
    /// Number of delivery attempts so far (starts at 1)
    pub attempts: u16,
    /// Publish time in nanoseconds since the Unix epoch
    pub timestamp: i64,
    /// Raw body bytes
    pub body: Bytes,
}

/// One decoded unit read from an nsqd connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The `_heartbeat_` response; must be answered with `NOP`.
    Heartbeat,
    /// The `OK` response.
    Ok,
    /// Any other response payload (for example `CLOSE_WAIT`).
    Response(Bytes),
    /// An error frame (`E_INVALID ...`, `E_FIN_FAILED ...`).
    Error(Bytes),
    /// A delivered message.
    Message(Message),
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Heartbeat => write!(f, "heartbeat"),
            Frame::Ok => write!(f, "OK"),
            Frame::Response(data) => write!(f, "response {}", String::from_utf8_lossy(data)),
            Frame::Error(data) => write!(f, "error {}", String::from_utf8_lossy(data)),
            Frame::Message(m) => write!(
                f,
                "message {} (attempt {}, {} bytes)",
                m.id,
                m.attempts,
                m.body.len()
            ),
        }
    }
}

/// A command sent from the client to nsqd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Pub { topic: String, body: Bytes },
    Mpub { topic: String, bodies: Vec<Bytes> },
    Dpub { topic: String, delay: Duration, body: Bytes },
    Sub { topic: String, channel: String },
    Rdy(u32),
    Fin(MessageId),
    Req { id: MessageId, delay: Duration },
    Touch(MessageId),
    Nop,
    Cls,
}

impl Command {
    /// The protocol verb, e.g. `"PUB"`.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Pub { .. } => "PUB",
            Command::Mpub { .. } => "MPUB",
            Command::Dpub { .. } => "DPUB",
            Command::Sub { .. } => "SUB",
            Command::Rdy(_) => "RDY",
            Command::Fin(_) => "FIN",
            Command::Req { .. } => "REQ",
            Command::Touch(_) => "TOUCH",
            Command::Nop => "NOP",
            Command::Cls => "CLS",
        }
    }

    /// Check that the command can be framed.
    ///
    /// Parameters
    /// - `max_frame_bytes`: upper bound for a single body and for the whole
    ///   MPUB payload.
    ///
    /// Returns `NsqError::Encode` describing the first problem found.
    pub fn validate(&self, max_frame_bytes: usize) -> Result<(), NsqError> {
        match self {
            Command::Pub { topic, body } => {
                validate_name("topic", topic)?;
                validate_body(body, max_frame_bytes)
            }
            Command::Mpub { topic, bodies } => {
                validate_name("topic", topic)?;
                if bodies.is_empty() {
                    return Err(NsqError::Encode("MPUB requires at least one body".into()));
                }
                for body in bodies {
                    validate_body(body, max_frame_bytes)?;
                }
                let total = mpub_payload_len(bodies);
                if total > max_frame_bytes {
                    return Err(NsqError::Encode(format!(
                        "MPUB payload of {} bytes exceeds limit of {}",
                        total, max_frame_bytes
                    )));
                }
                Ok(())
            }
            Command::Dpub { topic, delay, body } => {
                validate_name("topic", topic)?;
                delay_millis(*delay)?;
                validate_body(body, max_frame_bytes)
            }
            Command::Sub { topic, channel } => {
                validate_name("topic", topic)?;
                validate_name("channel", channel)
            }
            Command::Rdy(count) if *count > MAX_RDY_COUNT => Err(NsqError::Encode(format!(
                "RDY count {} exceeds maximum {}",
                count, MAX_RDY_COUNT
            ))),
            Command::Req { delay, .. } => delay_millis(*delay).map(|_| ()),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Pub { topic, body } => write!(f, "PUB {} ({} bytes)", topic, body.len()),
            Command::Mpub { topic, bodies } => {
                write!(f, "MPUB {} ({} messages)", topic, bodies.len())
            }
            Command::Dpub { topic, delay, body } => write!(
                f,
                "DPUB {} {} ({} bytes)",
                topic,
                delay.as_millis(),
                body.len()
            ),
            Command::Sub { topic, channel } => write!(f, "SUB {} {}", topic, channel),
            Command::Rdy(count) => write!(f, "RDY {}", count),
            Command::Fin(id) => write!(f, "FIN {}", id),
            Command::Req { id, delay } => write!(f, "REQ {} {}", id, delay.as_millis()),
            Command::Touch(id) => write!(f, "TOUCH {}", id),
            Command::Nop => write!(f, "NOP"),
            Command::Cls => write!(f, "CLS"),
        }
    }
}

/// Size of the MPUB payload after the command line: count word plus one
/// length-prefixed entry per body.
pub(crate) fn mpub_payload_len(bodies: &[Bytes]) -> usize {
    4 + bodies.iter().map(|b| 4 + b.len()).sum::<usize>()
}

/// Convert a delay to the u32 millisecond value nsqd parses.
pub(crate) fn delay_millis(delay: Duration) -> Result<u32, NsqError> {
    u32::try_from(delay.as_millis())
        .map_err(|_| NsqError::Encode(format!("delay of {:?} does not fit in u32 ms", delay)))
}

/// Topic and channel names: 1..=64 chars of `[A-Za-z0-9._-]`, optionally
/// ending in `#ephemeral`.
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    let base = name.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(name);
    !base.is_empty()
        && base
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
}

fn validate_name(kind: &str, name: &str) -> Result<(), NsqError> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(NsqError::Encode(format!("invalid {} name {:?}", kind, name)))
    }
}

fn validate_body(body: &Bytes, max_frame_bytes: usize) -> Result<(), NsqError> {
    if body.is_empty() {
        return Err(NsqError::Encode("message body must not be empty".into()));
    }
    if body.len() > max_frame_bytes {
        return Err(NsqError::Encode(format!(
            "message body of {} bytes exceeds limit of {}",
            body.len(),
            max_frame_bytes
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_accept_ephemeral_suffix() {
        assert!(is_valid_name("events"));
        assert!(is_valid_name("events.v2_raw-1"));
        assert!(is_valid_name("scratch#ephemeral"));
        assert!(!is_valid_name("#ephemeral"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("has space"));
        assert!(!is_valid_name(&"x".repeat(65)));
    }

    #[test]
    fn rdy_over_limit_is_rejected() {
        assert!(Command::Rdy(MAX_RDY_COUNT).validate(1024).is_ok());
        assert!(matches!(
            Command::Rdy(MAX_RDY_COUNT + 1).validate(1024),
            Err(NsqError::Encode(_))
        ));
    }

    #[test]
    fn mpub_total_counts_length_prefixes() {
        let bodies = vec![Bytes::from_static(b"abc"), Bytes::from_static(b"de")];
        assert_eq!(mpub_payload_len(&bodies), 4 + 7 + 6);
        let cmd = Command::Mpub {
            topic: "t".into(),
            bodies,
        };
        assert!(cmd.validate(17).is_ok());
        assert!(cmd.validate(16).is_err());
    }

    #[test]
    fn message_id_display_is_raw_ascii() {
        let id: MessageId = "0a1b2c3d4e5f6789".parse().expect("valid id");
        assert_eq!(id.to_string(), "0a1b2c3d4e5f6789");
        assert!("short".parse::<MessageId>().is_err());
    }
}
