//! Cluster wire protocol
//!
//! Every request is `[TYPE u8][SENDER u64][PAYLOAD]` and every response is
//! `[STATUS u8][NODE u64][PAYLOAD]`. Integers are big-endian; strings are
//! UTF-8 and run to the end of the frame.
//!
//! | type              | request payload          | response payload            |
//! |-------------------|--------------------------|-----------------------------|
//! | HEARTBEAT         | -                        | -                           |
//! | JOIN              | node info                | - (node field = new id)     |
//! | PART              | -                        | -                           |
//! | LOCK              | key                      | handle u32 / owner u64      |
//! | LOCK_RELEASE      | handle u32               | -                           |
//! | AUTH_TOKEN_GET    | uuid (2 x u64)           | token record                |
//! | AUTH_TOKEN_PUT    | uuid + token record      | -                           |
//! | AUTH_TOKEN_SET    | uuid + token record      | -                           |

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use uuid::Uuid;

/// Cluster-wide node identifier
pub type NodeId = u64;

/// Opaque handle returned by a successful LOCK
pub type LockHandle = u32;

/// Type byte + node id
pub const HEADER_LEN: usize = 9;

const UUID_LEN: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),

    #[error("unknown status {0:#04x}")]
    UnknownStatus(u8),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("malformed {kind} payload: {reason}")]
    BadPayload {
        kind: MessageType,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Heartbeat = 1,
    Join = 2,
    Part = 3,
    Lock = 4,
    LockRelease = 5,
    AuthTokenGet = 6,
    AuthTokenPut = 7,
    AuthTokenSet = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Ok(match byte {
            1 => MessageType::Heartbeat,
            2 => MessageType::Join,
            3 => MessageType::Part,
            4 => MessageType::Lock,
            5 => MessageType::LockRelease,
            6 => MessageType::AuthTokenGet,
            7 => MessageType::AuthTokenPut,
            8 => MessageType::AuthTokenSet,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::Join => "JOIN",
            MessageType::Part => "PART",
            MessageType::Lock => "LOCK",
            MessageType::LockRelease => "LOCK_RELEASE",
            MessageType::AuthTokenGet => "AUTH_TOKEN_GET",
            MessageType::AuthTokenPut => "AUTH_TOKEN_PUT",
            MessageType::AuthTokenSet => "AUTH_TOKEN_SET",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Success = 0,
    Fail = 1,
    Unknown = 2,
}

impl TryFrom<u8> for Status {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0 => Ok(Status::Success),
            1 => Ok(Status::Fail),
            2 => Ok(Status::Unknown),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

/// Decoded request body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Heartbeat,
    Join { node_info: String },
    Part,
    Lock { key: String },
    LockRelease { handle: LockHandle },
    AuthTokenGet { id: Uuid },
    AuthTokenPut { id: Uuid, record: String },
    AuthTokenSet { id: Uuid, record: String },
}

impl Message {
    pub fn kind(&self) -> MessageType {
        match self {
            Message::Heartbeat => MessageType::Heartbeat,
            Message::Join { .. } => MessageType::Join,
            Message::Part => MessageType::Part,
            Message::Lock { .. } => MessageType::Lock,
            Message::LockRelease { .. } => MessageType::LockRelease,
            Message::AuthTokenGet { .. } => MessageType::AuthTokenGet,
            Message::AuthTokenPut { .. } => MessageType::AuthTokenPut,
            Message::AuthTokenSet { .. } => MessageType::AuthTokenSet,
        }
    }
}

/// Request envelope: who sent what
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub sender: NodeId,
    pub message: Message,
}

impl Request {
    pub fn new(sender: NodeId, message: Message) -> Self {
        Self { sender, message }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 32);
        buf.put_u8(self.message.kind() as u8);
        buf.put_u64(self.sender);

        match &self.message {
            Message::Heartbeat | Message::Part => {}
            Message::Join { node_info } => buf.put_slice(node_info.as_bytes()),
            Message::Lock { key } => buf.put_slice(key.as_bytes()),
            Message::LockRelease { handle } => buf.put_u32(*handle),
            Message::AuthTokenGet { id } => put_uuid(&mut buf, id),
            Message::AuthTokenPut { id, record } | Message::AuthTokenSet { id, record } => {
                put_uuid(&mut buf, id);
                buf.put_slice(record.as_bytes());
            }
        }

        buf.freeze()
    }

    /// Split a frame into its header and raw payload without interpreting the
    /// payload. The dispatcher uses this to answer unknown types with the
    /// sender's id.
    pub fn decode_header(frame: &[u8]) -> Result<(u8, NodeId, &[u8]), ProtocolError> {
        if frame.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated {
                needed: HEADER_LEN,
                got: frame.len(),
            });
        }
        let mut header = &frame[..HEADER_LEN];
        let kind = header.get_u8();
        let sender = header.get_u64();
        Ok((kind, sender, &frame[HEADER_LEN..]))
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let (kind, sender, payload) = Self::decode_header(frame)?;
        let kind = MessageType::try_from(kind)?;
        let message = Self::decode_payload(kind, payload)?;
        Ok(Self { sender, message })
    }

    pub fn decode_payload(kind: MessageType, mut payload: &[u8]) -> Result<Message, ProtocolError> {
        let message = match kind {
            MessageType::Heartbeat => Message::Heartbeat,
            MessageType::Part => Message::Part,
            MessageType::Join => Message::Join {
                node_info: utf8(payload, "node info")?,
            },
            MessageType::Lock => Message::Lock {
                key: utf8(payload, "lock key")?,
            },
            MessageType::LockRelease => {
                if payload.len() != 4 {
                    return Err(ProtocolError::BadPayload {
                        kind,
                        reason: "expected a 4-byte handle",
                    });
                }
                Message::LockRelease {
                    handle: payload.get_u32(),
                }
            }
            MessageType::AuthTokenGet => {
                if payload.len() != UUID_LEN {
                    return Err(ProtocolError::BadPayload {
                        kind,
                        reason: "expected a 16-byte uuid",
                    });
                }
                Message::AuthTokenGet {
                    id: get_uuid(&mut payload),
                }
            }
            MessageType::AuthTokenPut | MessageType::AuthTokenSet => {
                if payload.len() < UUID_LEN {
                    return Err(ProtocolError::BadPayload {
                        kind,
                        reason: "missing uuid",
                    });
                }
                let id = get_uuid(&mut payload);
                let record = utf8(payload, "token record")?;
                if kind == MessageType::AuthTokenPut {
                    Message::AuthTokenPut { id, record }
                } else {
                    Message::AuthTokenSet { id, record }
                }
            }
        };
        Ok(message)
    }
}

/// Response payload; which variant applies depends on the request type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Empty,
    Handle(LockHandle),
    Owner(NodeId),
    Token(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub node_id: NodeId,
    pub reply: Reply,
}

impl Response {
    pub fn success(node_id: NodeId) -> Self {
        Self {
            status: Status::Success,
            node_id,
            reply: Reply::Empty,
        }
    }

    pub fn fail(node_id: NodeId) -> Self {
        Self {
            status: Status::Fail,
            node_id,
            reply: Reply::Empty,
        }
    }

    pub fn unknown(node_id: NodeId) -> Self {
        Self {
            status: Status::Unknown,
            node_id,
            reply: Reply::Empty,
        }
    }

    pub fn with_reply(mut self, reply: Reply) -> Self {
        self.reply = reply;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 8);
        buf.put_u8(self.status as u8);
        buf.put_u64(self.node_id);
        match &self.reply {
            Reply::Empty => {}
            Reply::Handle(handle) => buf.put_u32(*handle),
            Reply::Owner(owner) => buf.put_u64(*owner),
            Reply::Token(record) => buf.put_slice(record.as_bytes()),
        }
        buf.freeze()
    }

    /// Decode a response to a request of type `kind`.
    pub fn decode(kind: MessageType, frame: &[u8]) -> Result<Self, ProtocolError> {
        if frame.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated {
                needed: HEADER_LEN,
                got: frame.len(),
            });
        }
        let mut buf = frame;
        let status = Status::try_from(buf.get_u8())?;
        let node_id = buf.get_u64();

        let reply = match (kind, status) {
            (MessageType::Lock, Status::Success) => {
                if buf.remaining() != 4 {
                    return Err(ProtocolError::BadPayload {
                        kind,
                        reason: "expected a 4-byte handle",
                    });
                }
                Reply::Handle(buf.get_u32())
            }
            (MessageType::Lock, Status::Fail) if buf.remaining() == 8 => Reply::Owner(buf.get_u64()),
            (MessageType::AuthTokenGet, Status::Success) => Reply::Token(utf8(buf, "token record")?),
            _ => Reply::Empty,
        };

        Ok(Self {
            status,
            node_id,
            reply,
        })
    }
}

// === Stream framing ===
//
// On TCP each message travels as `[LEN u32][MESSAGE]`.

/// Upper bound on a single frame
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Read one frame. `Ok(None)` on a clean end-of-stream.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<Bytes>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(Some(Bytes::from(frame)))
}

pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    writer.write_u32(frame.len() as u32).await?;
    writer.write_all(frame).await?;
    writer.flush().await
}

fn utf8(bytes: &[u8], what: &'static str) -> Result<String, ProtocolError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(what))
}

fn put_uuid(buf: &mut BytesMut, id: &Uuid) {
    let (hi, lo) = id.as_u64_pair();
    buf.put_u64(hi);
    buf.put_u64(lo);
}

fn get_uuid(buf: &mut &[u8]) -> Uuid {
    let hi = buf.get_u64();
    let lo = buf.get_u64();
    Uuid::from_u64_pair(hi, lo)
}
