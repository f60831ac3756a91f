use crate::handle::Handle;
use crate::net::SocketMessage;
use std::fmt;

/// Correlation id between a request and its reply within one sender's
/// namespace. 0 means "no reply expected".
pub type Session = i32;

/// Messages larger than this are refused at send time; the wire header
/// reserves 24 bits for the payload size.
pub const MAX_MESSAGE_SIZE: usize = 0x00ff_ffff;

/// Send-time modifier: the payload is transferred rather than copied. Owned
/// payloads are always moved in this implementation, so the tag is accepted
/// for source compatibility and implied by the API.
pub const TAG_DONTCOPY: u32 = 0x10000;
/// Send-time modifier: allocate a fresh session from the sending context and
/// return it to the caller.
pub const TAG_ALLOCSESSION: u32 = 0x20000;

pub(crate) const PROTOCOL_MASK: u32 = 0xff;

/// Message protocol id. The low range is reserved for the runtime itself;
/// application protocols start at [`ProtocolId::APP_BASE`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ProtocolId(pub u8);

impl ProtocolId {
    pub const TEXT: ProtocolId = ProtocolId(0);
    pub const RESPONSE: ProtocolId = ProtocolId(1);
    pub const TIMER: ProtocolId = ProtocolId(2);
    pub const CLIENT: ProtocolId = ProtocolId(3);
    pub const SYSTEM: ProtocolId = ProtocolId(4);
    pub const HARBOR: ProtocolId = ProtocolId(5);
    pub const SOCKET: ProtocolId = ProtocolId(6);
    pub const ERROR: ProtocolId = ProtocolId(7);

    /// First id available to application protocols.
    pub const APP_BASE: u8 = 8;

    /// Fold the protocol id into the tagged send `kind` word.
    #[inline]
    pub fn bits(self) -> u32 {
        u32::from(self.0)
    }

    /// Combine with [`TAG_ALLOCSESSION`] in one call.
    #[inline]
    pub fn alloc_session(self) -> u32 {
        self.bits() | TAG_ALLOCSESSION
    }
}

impl From<u32> for ProtocolId {
    #[inline]
    fn from(bits: u32) -> Self {
        ProtocolId((bits & PROTOCOL_MASK) as u8)
    }
}

/// Message payload. Inter-service payloads are owned byte buffers; the socket
/// reactor delivers structured events in-band so services do not re-parse
/// them from bytes.
pub enum Payload {
    Empty,
    Bytes(Box<[u8]>),
    Socket(SocketMessage),
}

impl Payload {
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            Payload::Empty => 0,
            Payload::Bytes(data) => data.len(),
            Payload::Socket(_) => 0,
        }
    }

    /// The byte view of the payload; empty for non-byte payloads.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Bytes(data) => data,
            _ => &[],
        }
    }

    #[inline]
    pub fn text(text: &str) -> Payload {
        Payload::Bytes(text.as_bytes().into())
    }
}

impl From<Vec<u8>> for Payload {
    #[inline]
    fn from(data: Vec<u8>) -> Payload {
        Payload::Bytes(data.into_boxed_slice())
    }
}

impl From<&[u8]> for Payload {
    #[inline]
    fn from(data: &[u8]) -> Payload {
        Payload::Bytes(data.into())
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Payload::Empty => write!(f, "Empty"),
            Payload::Bytes(data) => write!(f, "Bytes({})", data.len()),
            Payload::Socket(msg) => write!(f, "Socket({:?})", msg),
        }
    }
}

/// One queued inter-service message.
#[derive(Debug)]
pub struct Message {
    pub source: Handle,
    pub session: Session,
    pub protocol: ProtocolId,
    pub payload: Payload,
}

impl Message {
    #[inline]
    pub fn new(source: Handle, session: Session, protocol: ProtocolId, payload: Payload) -> Message {
        Message {
            source,
            session,
            protocol,
            payload,
        }
    }

    /// A system message carrying no payload (timer responses, drop errors).
    #[inline]
    pub fn system(source: Handle, session: Session, protocol: ProtocolId) -> Message {
        Message::new(source, session, protocol, Payload::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_bits() {
        assert_eq!(ProtocolId::TEXT.bits(), 0);
        assert_eq!(ProtocolId::ERROR.bits(), 7);
        assert_eq!(
            ProtocolId::RESPONSE.alloc_session(),
            1 | TAG_ALLOCSESSION
        );
        assert_eq!(ProtocolId::from(6 | TAG_DONTCOPY), ProtocolId::SOCKET);
    }

    #[test]
    fn test_payload_len() {
        assert_eq!(Payload::Empty.len(), 0);
        assert_eq!(Payload::from(vec![1u8, 2, 3]).len(), 3);
        assert_eq!(Payload::text("hi").as_bytes(), b"hi");
    }
}
