//! Session packet encoding and decoding.
//!
//! Wire format:
//! ```text
//! +------------------+-------------------+----------------------+-------------------+
//! | Message type     | Version           | Session ID           | Payload           |
//! | 2 bytes (BE16)   | netstring         | netstring            | netstring         |
//! +------------------+-------------------+----------------------+-------------------+
//! ```
//!
//! A netstring is `<decimal length>:<bytes>,`, so every field is
//! self-delimiting. For DATA the payload is raw application bytes; for every
//! control type it is a transaction ID.
//!
//! On byte streams each encoded packet is wrapped in one more netstring so
//! packets can be told apart; see [`read_frame`] and [`write_frame`].

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::constants::{
    MAX_STREAM_FRAME, MSG_ACK, MSG_DATA, MSG_FIN, MSG_PING, MSG_PONG, MSG_RST, MSG_SYN,
    MSG_SYN_ACK, PROTOCOL_VERSION,
};
use crate::core::{NetError, NetResult, PacketError, SessionId, TransactionId};

/// Longest accepted decimal length header.
const MAX_LENGTH_DIGITS: usize = 10;

/// Session message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    /// Open a session.
    Syn = MSG_SYN,
    /// Accept a session.
    SynAck = MSG_SYN_ACK,
    /// Application bytes.
    Data = MSG_DATA,
    /// Half-close.
    Fin = MSG_FIN,
    /// Hard-close.
    Rst = MSG_RST,
    /// Acknowledge a control transaction.
    Ack = MSG_ACK,
    /// Rendezvous ping.
    Ping = MSG_PING,
    /// Rendezvous answer.
    Pong = MSG_PONG,
}

impl MessageType {
    /// All message types, in wire-code order.
    pub const ALL: [MessageType; 8] = [
        MessageType::Syn,
        MessageType::SynAck,
        MessageType::Data,
        MessageType::Fin,
        MessageType::Rst,
        MessageType::Ack,
        MessageType::Ping,
        MessageType::Pong,
    ];

    /// Parse a message type from its wire code.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            MSG_SYN => Some(Self::Syn),
            MSG_SYN_ACK => Some(Self::SynAck),
            MSG_DATA => Some(Self::Data),
            MSG_FIN => Some(Self::Fin),
            MSG_RST => Some(Self::Rst),
            MSG_ACK => Some(Self::Ack),
            MSG_PING => Some(Self::Ping),
            MSG_PONG => Some(Self::Pong),
            _ => None,
        }
    }

    /// Wire code of this message type.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Check if the payload of this type is a transaction ID.
    pub fn is_control(self) -> bool {
        self != MessageType::Data
    }
}

/// One decoded session packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Message type.
    pub kind: MessageType,
    /// Sender's protocol version.
    pub version: String,
    /// Session the packet belongs to.
    pub session_id: SessionId,
    /// Application bytes (DATA) or transaction ID (control types).
    pub payload: Vec<u8>,
}

impl Packet {
    /// Create a packet stamped with the current protocol version.
    pub fn new(kind: MessageType, session_id: SessionId, payload: Vec<u8>) -> Self {
        Self {
            kind,
            version: PROTOCOL_VERSION.to_string(),
            session_id,
            payload,
        }
    }

    /// Create a control packet carrying a transaction ID.
    pub fn control(kind: MessageType, session_id: SessionId, tid: &TransactionId) -> Self {
        Self::new(kind, session_id, tid.as_bytes().to_vec())
    }

    /// Create a DATA packet.
    pub fn data(session_id: SessionId, payload: Vec<u8>) -> Self {
        Self::new(MessageType::Data, session_id, payload)
    }

    /// Transaction ID carried by a control packet.
    pub fn transaction_id(&self) -> Option<TransactionId> {
        if self.kind.is_control() {
            TransactionId::from_payload(&self.payload)
        } else {
            None
        }
    }

    /// Serialize to the wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.version.len() + self.payload.len() + 48);
        out.extend_from_slice(&self.kind.code().to_be_bytes());
        encode_netstring(&mut out, self.version.as_bytes());
        encode_netstring(&mut out, self.session_id.as_str().as_bytes());
        encode_netstring(&mut out, &self.payload);
        out
    }

    /// Parse from the wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < 2 {
            return Err(PacketError::UnexpectedEof);
        }
        let code = u16::from_be_bytes([bytes[0], bytes[1]]);
        let kind = MessageType::from_code(code).ok_or(PacketError::UnknownType(code))?;

        let (version, rest) = decode_netstring(&bytes[2..])?;
        let (session_id, rest) = decode_netstring(rest)?;
        let (payload, rest) = decode_netstring(rest)?;
        if !rest.is_empty() {
            return Err(PacketError::TrailingBytes(rest.len()));
        }

        let version = std::str::from_utf8(version)
            .map_err(|_| PacketError::InvalidUtf8("version"))?
            .to_string();
        let session_id = std::str::from_utf8(session_id)
            .map_err(|_| PacketError::InvalidUtf8("session id"))?;

        Ok(Self {
            kind,
            version,
            session_id: SessionId::from(session_id),
            payload: payload.to_vec(),
        })
    }
}

/// Append `field` to `out` as a netstring.
pub fn encode_netstring(out: &mut Vec<u8>, field: &[u8]) {
    out.extend_from_slice(field.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(field);
    out.push(b',');
}

/// Split one netstring off the front of `input`.
///
/// Returns the field and the remaining bytes.
pub fn decode_netstring(input: &[u8]) -> Result<(&[u8], &[u8]), PacketError> {
    let colon = input
        .iter()
        .take(MAX_LENGTH_DIGITS + 1)
        .position(|&b| b == b':')
        .ok_or(if input.len() <= MAX_LENGTH_DIGITS {
            PacketError::UnexpectedEof
        } else {
            PacketError::InvalidLength
        })?;
    let len = parse_length(&input[..colon])?;

    let body = &input[colon + 1..];
    if body.len() < len + 1 {
        return Err(PacketError::UnexpectedEof);
    }
    if body[len] != b',' {
        return Err(PacketError::MissingTerminator);
    }
    Ok((&body[..len], &body[len + 1..]))
}

fn parse_length(digits: &[u8]) -> Result<usize, PacketError> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(PacketError::InvalidLength);
    }
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(PacketError::InvalidLength)
}

/// Read one netstring-framed packet from a byte stream.
///
/// Returns `Ok(None)` on a clean end of stream between frames.
pub async fn read_frame<R>(reader: &mut R) -> NetResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut digits = Vec::with_capacity(MAX_LENGTH_DIGITS);
    loop {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                if digits.is_empty() {
                    return Ok(None);
                }
                return Err(PacketError::UnexpectedEof.into());
            }
            Err(e) => return Err(NetError::Io(e)),
        };
        if byte == b':' {
            break;
        }
        if digits.len() == MAX_LENGTH_DIGITS {
            return Err(PacketError::InvalidLength.into());
        }
        digits.push(byte);
    }

    let len = parse_length(&digits)?;
    if len > MAX_STREAM_FRAME {
        return Err(PacketError::FrameTooLarge(len).into());
    }

    let mut frame = vec![0u8; len + 1];
    reader.read_exact(&mut frame).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            NetError::Packet(PacketError::UnexpectedEof)
        } else {
            NetError::Io(e)
        }
    })?;
    if frame.pop() != Some(b',') {
        return Err(PacketError::MissingTerminator.into());
    }
    Ok(Some(frame))
}

/// Write one packet to a byte stream, netstring-framed, and flush.
pub async fn write_frame<W>(writer: &mut W, packet: &Packet) -> NetResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = Vec::new();
    encode_netstring(&mut frame, &packet.encode());
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
